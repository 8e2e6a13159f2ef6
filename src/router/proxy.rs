//! Proxy plumbing: safe target-URL construction and header hygiene.

use std::collections::HashSet;

use actix_web::http::header::HeaderMap as ActixHeaderMap;
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::{Result, TunaError};

/// Headers that never cross a proxy hop.
static HOP_BY_HOP: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ])
});

/// Strip scheme, authority, and traversal segments from a client path.
///
/// Whatever arrives — `/v1/chat`, `http://evil/x`, `//evil/x`,
/// `../../etc/passwd` — comes back as a plain relative path that cannot
/// escape the backend base URL.
pub fn sanitize_path(path: &str) -> String {
    // Discard any scheme://host prefix an attacker may inject.
    let without_authority = if let Ok(url) = Url::parse(path) {
        url.path().to_string()
    } else if let Some(rest) = path.strip_prefix("//") {
        // Protocol-relative: //host/path
        match rest.find('/') {
            Some(idx) => rest[idx..].to_string(),
            None => String::new(),
        }
    } else {
        path.to_string()
    };

    without_authority
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// Build the upstream URL for a client request.
///
/// The path is sanitized, the query string re-encoded, and the result is
/// rejected unless it still points at the backend's scheme, host, and port.
pub fn build_proxy_url(base: &str, path: &str, query: Option<&str>) -> Result<Url> {
    let clean_path = sanitize_path(path);
    let base_url = Url::parse(base)
        .map_err(|e| TunaError::Internal(format!("bad backend base URL {base:?}: {e}")))?;

    let joined = format!("{}/{}", base.trim_end_matches('/'), clean_path);
    let mut target = Url::parse(&joined)
        .map_err(|e| TunaError::Internal(format!("bad proxy target {joined:?}: {e}")))?;
    match query {
        Some(q) if !q.is_empty() => target.set_query(Some(q)),
        _ => target.set_query(None),
    }

    if target.scheme() != base_url.scheme()
        || target.host_str() != base_url.host_str()
        || target.port_or_known_default() != base_url.port_or_known_default()
    {
        return Err(TunaError::Internal(format!(
            "URL host mismatch: expected {}",
            base_url.host_str().unwrap_or("")
        )));
    }
    Ok(target)
}

/// Filter client request headers before forwarding upstream.
///
/// Drops hop-by-hop headers, `Host`, and the router's own API-key header.
/// `strip_auth` additionally drops `Authorization` (serverless backends get
/// the router's stored token instead; spot keeps the client's).
pub fn filter_request_headers(
    headers: &ActixHeaderMap,
    api_key_header: &str,
    strip_auth: bool,
) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_lowercase();
        if HOP_BY_HOP.contains(lower.as_str()) || lower == "host" || lower == api_key_header {
            continue;
        }
        if strip_auth && lower == "authorization" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            filtered.append(name, value);
        }
    }
    filtered
}

/// Filter upstream response headers before relaying to the client.
///
/// Drops hop-by-hop headers and `Content-Length` (the streamed body is
/// re-framed by the server).
pub fn filter_response_headers(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.as_str().to_lowercase();
            !HOP_BY_HOP.contains(lower.as_str()) && lower != "content-length"
        })
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

/// Join a backend base with a server-controlled path (no sanitization).
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Constant-time equality for the pre-shared API key.
///
/// Compares fixed-size digests so the comparison cost is independent of
/// where the strings differ.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use sha2::{Digest, Sha256};
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_plain_paths() {
        assert_eq!(sanitize_path("/v1/chat/completions"), "v1/chat/completions");
        assert_eq!(sanitize_path("v1//models"), "v1/models");
        assert_eq!(sanitize_path(""), "");
    }

    #[test]
    fn test_sanitize_strips_scheme_and_host() {
        assert_eq!(sanitize_path("http://evil.com/steal"), "steal");
        assert_eq!(sanitize_path("https://evil.com"), "");
        assert_eq!(sanitize_path("//evil.com/steal"), "steal");
    }

    #[test]
    fn test_sanitize_collapses_traversal() {
        assert_eq!(sanitize_path("/../../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_path("/a/./b/../c"), "a/b/c");
    }

    #[test]
    fn test_build_proxy_url_happy_path() {
        let url = build_proxy_url(
            "http://10.0.0.1:30001",
            "/v1/chat/completions",
            Some("stream=true&n=1"),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "http://10.0.0.1:30001/v1/chat/completions?stream=true&n=1"
        );
    }

    #[test]
    fn test_build_proxy_url_never_leaves_backend_host() {
        for hostile in [
            "http://evil.com/v1/x",
            "//evil.com/v1/x",
            "/../../../v1/x",
            "/v1/../../x",
        ] {
            let url = build_proxy_url("https://backend.example.com", hostile, None).unwrap();
            assert_eq!(url.host_str(), Some("backend.example.com"), "path: {hostile}");
        }
    }

    #[test]
    fn test_request_header_filtering() {
        let mut headers = ActixHeaderMap::new();
        for (name, value) in [
            ("connection", "keep-alive"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "h2c"),
            ("host", "router.internal"),
            ("x-api-key", "router-secret"),
            ("authorization", "Bearer client-token"),
            ("content-type", "application/json"),
            ("x-custom", "kept"),
        ] {
            headers.insert(
                actix_web::http::header::HeaderName::from_static(name),
                actix_web::http::header::HeaderValue::from_static(value),
            );
        }

        let for_serverless = filter_request_headers(&headers, "x-api-key", true);
        assert!(for_serverless.get("authorization").is_none());
        assert!(for_serverless.get("x-api-key").is_none());
        assert!(for_serverless.get("host").is_none());
        assert!(for_serverless.get("connection").is_none());
        assert!(for_serverless.get("transfer-encoding").is_none());
        assert_eq!(for_serverless.get("x-custom").unwrap(), "kept");
        assert_eq!(for_serverless.get("content-type").unwrap(), "application/json");

        let for_spot = filter_request_headers(&headers, "x-api-key", false);
        assert_eq!(for_spot.get("authorization").unwrap(), "Bearer client-token");
        assert!(for_spot.get("x-api-key").is_none());
    }

    #[test]
    fn test_response_header_filtering() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("connection", HeaderValue::from_static("close"));
        let filtered = filter_response_headers(&headers);
        let names: Vec<&str> = filtered.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"content-type"));
        assert!(!names.contains(&"content-length"));
        assert!(!names.contains(&"connection"));
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://x/", "/health"), "http://x/health");
        assert_eq!(join_url("http://x", "health"), "http://x/health");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(!constant_time_eq("", "x"));
    }
}
