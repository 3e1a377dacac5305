//! Public base URL derivation
//!
//! `submission_url`/`monitoring_url` in the log list must point back at this
//! mirror as the client reached it. `X-Forwarded-Host`/`X-Forwarded-Proto`
//! are honored only when the request's source IP falls inside a configured
//! trusted prefix; otherwise the `Host` header and `http` are used.

use std::net::IpAddr;

use axum::http::{header, HeaderMap};
use ipnet::IpNet;

/// Derive `<scheme>://<host>` for this request. No path, no trailing slash.
pub fn public_base_url(
    remote: Option<IpAddr>,
    headers: &HeaderMap,
    trusted: &[IpNet],
) -> String {
    let is_trusted = remote
        .map(|ip| trusted.iter().any(|net| net.contains(&ip)))
        .unwrap_or(false);

    let mut host = String::new();
    let mut scheme = String::new();

    if is_trusted {
        if let Some(v) = header_str(headers, "x-forwarded-host") {
            host = first_non_empty_element(v);
        }
        if let Some(v) = header_str(headers, "x-forwarded-proto") {
            scheme = first_non_empty_element(v);
        }
    }

    if host.is_empty() {
        host = header_str(headers, header::HOST.as_str())
            .unwrap_or("")
            .to_string();
    }
    if scheme.is_empty() {
        scheme = "http".to_string();
    }

    format!("{}://{host}", scheme.to_ascii_lowercase())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// First non-empty element of a comma-separated header value, after
/// trimming ASCII whitespace.
fn first_non_empty_element(value: &str) -> String {
    value
        .split(',')
        .map(|elem| elem.trim_matches(|c: char| c.is_ascii_whitespace()))
        .find(|elem| !elem.is_empty())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use ctarchive_common::config::parse_trusted_sources;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_untrusted_source_uses_host_and_http() {
        let trusted = parse_trusted_sources("127.0.0.1/32").unwrap();
        let h = headers(&[
            ("host", "mirror.example:8080"),
            ("x-forwarded-host", "proxy.example"),
            ("x-forwarded-proto", "https"),
        ]);
        let base = public_base_url(Some("10.9.8.7".parse().unwrap()), &h, &trusted);
        assert_eq!(base, "http://mirror.example:8080");
    }

    #[test]
    fn test_trusted_source_uses_forwarded_headers() {
        let trusted = parse_trusted_sources("127.0.0.1/32").unwrap();
        let h = headers(&[
            ("host", "mirror.example"),
            ("x-forwarded-host", "proxy.example, other.example"),
            ("x-forwarded-proto", "HTTPS, http"),
        ]);
        let base = public_base_url(Some("127.0.0.1".parse().unwrap()), &h, &trusted);
        assert_eq!(base, "https://proxy.example");
    }

    #[test]
    fn test_trusted_source_without_forwarded_headers_falls_back() {
        let trusted = parse_trusted_sources("127.0.0.1/32").unwrap();
        let h = headers(&[("host", "mirror.example")]);
        let base = public_base_url(Some("127.0.0.1".parse().unwrap()), &h, &trusted);
        assert_eq!(base, "http://mirror.example");
    }

    #[test]
    fn test_comma_separated_skips_empty_elements() {
        let trusted = parse_trusted_sources("127.0.0.1/32").unwrap();
        let h = headers(&[
            ("host", "mirror.example"),
            ("x-forwarded-host", " , ,proxy.example"),
        ]);
        let base = public_base_url(Some("127.0.0.1".parse().unwrap()), &h, &trusted);
        assert_eq!(base, "http://proxy.example");
    }

    #[test]
    fn test_unknown_remote_is_untrusted() {
        let trusted = parse_trusted_sources("0.0.0.0/0").unwrap();
        let h = headers(&[
            ("host", "mirror.example"),
            ("x-forwarded-host", "proxy.example"),
        ]);
        assert_eq!(
            public_base_url(None, &h, &trusted),
            "http://mirror.example"
        );
    }

    #[test]
    fn test_cidr_ranges_match() {
        let trusted = parse_trusted_sources("10.0.0.0/8").unwrap();
        let h = headers(&[
            ("host", "mirror.example"),
            ("x-forwarded-host", "proxy.example"),
        ]);
        assert_eq!(
            public_base_url(Some("10.200.3.4".parse().unwrap()), &h, &trusted),
            "http://proxy.example"
        );
    }
}
