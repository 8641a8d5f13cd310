use url::{Host, Url};

use crate::core::hash::sha256_hex;

/// Canonical form used to match classifier verdicts and threat-list matches
/// against stored link records: trimmed, lowercased, no trailing slash.
///
/// Both sides of every match must go through this function.
pub fn normalize_source_url(url: &str) -> String {
    url.trim().to_lowercase().trim_end_matches('/').to_string()
}

/// Host part of a URL, lowercased and IDNA-encoded, without credentials
/// or port. Scheme-less input such as `example.org/path` is read as http.
pub fn host_of(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("http://{}", trimmed))
    }
    .ok()?;
    let host = match parsed.host()? {
        Host::Domain(domain) => domain.trim_end_matches('.').to_lowercase(),
        Host::Ipv4(addr) => addr.to_string(),
        Host::Ipv6(addr) => addr.to_string(),
    };
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Fallback content fingerprint when discovery did not supply one.
pub fn content_fingerprint(source_domain: &str, anchor_text: Option<&str>) -> String {
    let anchor = anchor_text
        .unwrap_or_default()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    sha256_hex(format!("{}|{}", source_domain.to_lowercase(), anchor).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_folds_case_and_trailing_slash() {
        assert_eq!(
            normalize_source_url("HTTPS://Example.com/path/"),
            normalize_source_url("https://example.com/path")
        );
        assert_eq!(normalize_source_url("  https://a.io// "), "https://a.io");
    }

    #[test]
    fn host_of_strips_port_and_credentials() {
        assert_eq!(
            host_of("https://user:pw@Blog.Example.com:8443/x?y=1").as_deref(),
            Some("blog.example.com")
        );
        assert_eq!(host_of("example.org/path").as_deref(), Some("example.org"));
        assert_eq!(host_of("http://[::1]:80/").as_deref(), Some("::1"));
        assert_eq!(host_of("//cdn.example.net/a.js").as_deref(), Some("cdn.example.net"));
        assert_eq!(host_of("http://"), None);
    }

    #[test]
    fn host_of_encodes_internationalized_names() {
        assert_eq!(host_of("https://München.de/x").as_deref(), Some("xn--mnchen-3ya.de"));
        assert_eq!(host_of("https://Example.COM./").as_deref(), Some("example.com"));
    }

    #[test]
    fn fingerprint_ignores_whitespace_and_case() {
        assert_eq!(
            content_fingerprint("spam.net", Some("Best  Casino   Bonus")),
            content_fingerprint("SPAM.net", Some("best casino bonus"))
        );
    }
}
