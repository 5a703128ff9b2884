//! URI path helpers shared by the rewriting middleware.

use http::uri::{PathAndQuery, Uri};

pub const REPLACED_PATH_HEADER: &str = "x-replaced-path";

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("invalid URL escape \"{0}\"")]
    InvalidEscape(String),

    #[error("invalid request path: {0}")]
    InvalidUri(#[from] http::Error),
}

#[must_use]
pub fn ensure_leading_slash(path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode `%XX` escapes in a path. `+` is left untouched.
pub fn path_unescape(raw: &str) -> Result<String, PathError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).copied().and_then(hex_value);
            let lo = bytes.get(i + 2).copied().and_then(hex_value);
            match (hi, lo) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    let end = (i + 3).min(bytes.len());
                    return Err(PathError::InvalidEscape(
                        String::from_utf8_lossy(&bytes[i..end]).into_owned(),
                    ));
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Replace the path of `uri`, keeping scheme, authority and query.
pub fn with_path(uri: &Uri, path: &str) -> Result<Uri, PathError> {
    let path = if path.is_empty() { "/" } else { path };
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse::<PathAndQuery>()
            .map_err(|e| PathError::InvalidUri(e.into()))?,
    );
    Uri::from_parts(parts).map_err(|e| PathError::InvalidUri(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_slash() {
        assert_eq!(ensure_leading_slash("api/users"), "/api/users");
        assert_eq!(ensure_leading_slash("/api"), "/api");
        assert_eq!(ensure_leading_slash(""), "");
    }

    #[test]
    fn unescape() {
        assert_eq!(path_unescape("/a%20b/c%2Fd").unwrap(), "/a b/c/d");
        assert_eq!(path_unescape("/plain+path").unwrap(), "/plain+path");
        assert!(matches!(
            path_unescape("/bad%zz"),
            Err(PathError::InvalidEscape(s)) if s == "%zz"
        ));
        assert!(path_unescape("/trailing%4").is_err());
    }

    #[test]
    fn replaces_path_and_keeps_query() {
        let uri: Uri = "http://backend:8080/old?x=1".parse().unwrap();
        assert_eq!(
            with_path(&uri, "/new").unwrap().to_string(),
            "http://backend:8080/new?x=1"
        );

        let origin: Uri = "/old".parse().unwrap();
        assert_eq!(with_path(&origin, "").unwrap().to_string(), "/");
    }
}
