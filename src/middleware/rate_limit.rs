//! Token-bucket rate limiting with reservations.
//!
//! [`Limiter`] hands out [`Reservation`]s: a claim on one token that is
//! either available now, available after a delay, or impossible (burst of
//! zero). The middleware waits for short delays and answers `429` when the
//! delay exceeds half the nominal inter-arrival spacing (500ms for rates
//! below one event per second), returning the token in that case.

use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderValue, StatusCode};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{text_response, Handler, Request, Response, SharedHandler};
use crate::config::duration;
use crate::config::model::RateLimitConfig;
use crate::error::HandlerError;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
    last_event: Instant,
}

/// Events per second, `f64::INFINITY` meaning unlimited.
#[derive(Debug)]
pub struct Limiter {
    limit: f64,
    burst: i64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    ok: bool,
    tokens: i64,
    time_to_act: Instant,
}

impl Reservation {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.ok
    }

    /// How long the holder must wait before acting.
    #[must_use]
    pub fn delay_from(&self, now: Instant) -> Duration {
        self.time_to_act.saturating_duration_since(now)
    }
}

impl Limiter {
    #[must_use]
    pub fn new(every: Duration, burst: i64) -> Self {
        let limit = if every.is_zero() {
            f64::INFINITY
        } else {
            1.0 / every.as_secs_f64()
        };
        let now = Instant::now();
        #[allow(clippy::cast_precision_loss)]
        let tokens = burst.max(0) as f64;
        Self {
            limit,
            burst,
            bucket: Mutex::new(Bucket {
                tokens,
                last: now,
                last_event: now,
            }),
        }
    }

    #[must_use]
    pub const fn limit(&self) -> f64 {
        self.limit
    }

    fn tokens_from(&self, d: Duration) -> f64 {
        if self.limit <= 0.0 {
            return 0.0;
        }
        d.as_secs_f64() * self.limit
    }

    fn duration_from(&self, tokens: f64) -> Duration {
        if self.limit <= 0.0 || tokens <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(tokens / self.limit)
    }

    /// Tokens available at `now`, capped at the burst size.
    fn advance(&self, bucket: &Bucket, now: Instant) -> (Instant, f64) {
        let last = bucket.last.min(now);
        let elapsed = now.saturating_duration_since(last);
        #[allow(clippy::cast_precision_loss)]
        let tokens = (bucket.tokens + self.tokens_from(elapsed)).min(self.burst as f64);
        (last, tokens)
    }

    pub fn reserve_at(&self, now: Instant) -> Reservation {
        if self.limit.is_infinite() {
            return Reservation {
                ok: true,
                tokens: 1,
                time_to_act: now,
            };
        }

        let mut bucket = self.bucket.lock();
        let (last, tokens) = self.advance(&bucket, now);
        let tokens = tokens - 1.0;
        let wait = if tokens < 0.0 {
            self.duration_from(-tokens)
        } else {
            Duration::ZERO
        };

        if self.burst < 1 {
            bucket.last = last;
            return Reservation {
                ok: false,
                tokens: 0,
                time_to_act: now,
            };
        }

        let time_to_act = now + wait;
        bucket.last = now;
        bucket.tokens = tokens;
        bucket.last_event = time_to_act;
        Reservation {
            ok: true,
            tokens: 1,
            time_to_act,
        }
    }

    /// Give back the token of a reservation that will not be used, as far as
    /// later reservations allow.
    pub fn cancel_at(&self, reservation: &Reservation, now: Instant) {
        if !reservation.ok
            || self.limit.is_infinite()
            || reservation.tokens == 0
            || reservation.time_to_act < now
        {
            return;
        }

        let mut bucket = self.bucket.lock();
        #[allow(clippy::cast_precision_loss)]
        let restore = reservation.tokens as f64
            - self.tokens_from(
                bucket
                    .last_event
                    .saturating_duration_since(reservation.time_to_act),
            );
        if restore <= 0.0 {
            return;
        }

        let (_, tokens) = self.advance(&bucket, now);
        #[allow(clippy::cast_precision_loss)]
        let tokens = (tokens + restore).min(self.burst as f64);
        bucket.last = now;
        bucket.tokens = tokens;

        if reservation.time_to_act == bucket.last_event {
            #[allow(clippy::cast_precision_loss)]
            let span = self.duration_from(reservation.tokens as f64);
            if let Some(prev) = reservation.time_to_act.checked_sub(span) {
                if prev >= now {
                    bucket.last_event = prev;
                }
            }
        }
    }
}

pub struct RateLimit {
    next: SharedHandler,
    limiter: Limiter,
    max_delay: Duration,
}

impl RateLimit {
    #[must_use]
    pub fn new(next: SharedHandler, cfg: &RateLimitConfig) -> Self {
        let limiter = Limiter::new(cfg.every, cfg.burst);
        let max_delay = if limiter.limit() < 1.0 {
            Duration::from_millis(500)
        } else if limiter.limit().is_infinite() {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(0.5 / limiter.limit())
        };
        Self {
            next,
            limiter,
            max_delay,
        }
    }

    fn too_many_requests(delay: Duration) -> Response {
        let mut resp = text_response(
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS
                .canonical_reason()
                .unwrap_or("Too Many Requests"),
        );
        let headers = resp.headers_mut();
        if let Ok(v) = HeaderValue::from_str(&format!("{:.0}", delay.as_secs_f64())) {
            headers.insert(http::header::RETRY_AFTER, v);
        }
        if let Ok(v) = HeaderValue::from_str(&duration::format(delay)) {
            headers.insert("x-retry-in", v);
        }
        resp
    }
}

#[async_trait]
impl Handler for RateLimit {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let now = Instant::now();
        let reservation = self.limiter.reserve_at(now);
        if !reservation.is_ok() {
            return Ok(text_response(
                StatusCode::TOO_MANY_REQUESTS,
                "No bursty traffic allowed",
            ));
        }

        let delay = reservation.delay_from(now);
        if delay > self.max_delay {
            self.limiter.cancel_at(&reservation, now);
            tracing::debug!(delay = ?delay, max_delay = ?self.max_delay, "rate limit exceeded");
            return Ok(Self::too_many_requests(delay));
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.next.handle(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::{echo, request};

    fn rate_limit(every: Duration, burst: i64) -> RateLimit {
        RateLimit::new(echo(), &RateLimitConfig { every, burst })
    }

    #[tokio::test(start_paused = true)]
    async fn second_immediate_request_is_rejected() {
        let limiter = rate_limit(Duration::from_millis(100), 1);
        assert_eq!(limiter.max_delay, Duration::from_millis(50));

        let start = Instant::now();
        let first = limiter.handle(request("/")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(start.elapsed(), Duration::ZERO);

        let second = limiter.handle(request("/")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["retry-after"], "0");
        assert_eq!(second.headers()["x-retry-in"], "100ms");
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reservation_returns_the_token() {
        let limiter = rate_limit(Duration::from_millis(100), 1);
        limiter.handle(request("/")).await.unwrap();
        let rejected = limiter.handle(request("/")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);

        tokio::time::advance(Duration::from_millis(100)).await;
        let resp = limiter.handle(request("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn short_delays_are_waited_out() {
        let limiter = rate_limit(Duration::from_millis(100), 1);
        limiter.handle(request("/")).await.unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        let start = Instant::now();
        let resp = limiter.handle(request("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(39) && waited <= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_burst_is_never_allowed() {
        let limiter = rate_limit(Duration::from_secs(1), 0);
        let resp = limiter.handle(request("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().get("retry-after").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_unlimited() {
        let limiter = rate_limit(Duration::ZERO, 0);
        for _ in 0..100 {
            let resp = limiter.handle(request("/")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_rates_allow_half_a_second() {
        let limiter = rate_limit(Duration::from_secs(2), 2);
        assert_eq!(limiter.max_delay, Duration::from_millis(500));
        for _ in 0..2 {
            assert_eq!(limiter.handle(request("/")).await.unwrap().status(), StatusCode::OK);
        }
        let resp = limiter.handle(request("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["retry-after"], "2");
        assert_eq!(resp.headers()["x-retry-in"], "2s");
    }
}
