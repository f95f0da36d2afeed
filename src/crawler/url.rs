//! URL canonicalization and domain matching.
//!
//! All URLs that enter the system (user input, discovered anchors, fetch
//! targets) pass through [`normalize_url`] so that comparisons and candidate
//! merges see one spelling per page.

use url::Url;

/// Canonicalize a raw URL string.
///
/// Accepts bare hostnames (`acme.example`) and full URLs. Returns `None` for
/// anything that is not http/https or has no host. The canonical form:
/// lowercase host, no leading `www.`, no query or fragment, duplicate
/// slashes in the path collapsed, `/` for an empty path.
pub fn normalize_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let parsed = match Url::parse(raw) {
        Ok(url) => url,
        // Bare hostnames parse as relative references; retry as https.
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("https://{raw}")).ok()?
        }
        Err(_) => return None,
    };

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return None;
    }

    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        return None;
    }

    let path = collapse_slashes(parsed.path());
    let port = match parsed.port() {
        Some(p) => format!(":{p}"),
        None => String::new(),
    };

    Some(format!("{scheme}://{host}{port}{path}"))
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len().max(1));
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Canonical registrable-domain form of user input: the normalized host of
/// the URL (or bare hostname) with `www.` stripped.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let url = normalize_url(raw)?;
    host_of(&url)
}

/// Extract the host component of an already-normalized URL.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(|h| h.to_string())
}

/// True iff the URL's normalized host equals `domain` or is a subdomain of
/// it (`host == domain` or `host` ends with `"." + domain`).
pub fn matches_domain(url: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    let Some(normalized) = normalize_url(url) else {
        return false;
    };
    let Some(host) = host_of(&normalized) else {
        return false;
    };
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Resolve a possibly-relative href against a base page URL, then normalize.
pub fn resolve_href(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    let joined = base.join(href.trim()).ok()?;
    normalize_url(joined.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bare_hostname() {
        assert_eq!(
            normalize_url("acme.example"),
            Some("https://acme.example/".to_string())
        );
    }

    #[test]
    fn test_normalize_strips_www_query_fragment() {
        assert_eq!(
            normalize_url("https://WWW.Acme.Example/Pricing?utm=1#plans"),
            Some("https://acme.example/Pricing".to_string())
        );
    }

    #[test]
    fn test_normalize_collapses_duplicate_slashes() {
        assert_eq!(
            normalize_url("https://acme.example//a///b"),
            Some("https://acme.example/a/b".to_string())
        );
    }

    #[test]
    fn test_normalize_rejects_non_http() {
        assert_eq!(normalize_url("ftp://acme.example/x"), None);
        assert_eq!(normalize_url("javascript:void(0)"), None);
        assert_eq!(normalize_url("mailto:sales@acme.example"), None);
        assert_eq!(normalize_url(""), None);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in [
            "acme.example",
            "http://www.acme.example//x/y?q=1",
            "https://sub.acme.example:8443/path",
        ] {
            let once = normalize_url(raw).unwrap();
            assert_eq!(normalize_url(&once), Some(once.clone()));
        }
    }

    #[test]
    fn test_matches_domain_exact_and_subdomain() {
        assert!(matches_domain("https://acme.example/pricing", "acme.example"));
        assert!(matches_domain("https://app.acme.example/", "acme.example"));
        assert!(!matches_domain("https://acme.example.evil.com/", "acme.example"));
        assert!(!matches_domain("https://notacme.example/", "acme.example"));
    }

    #[test]
    fn test_resolve_href_relative() {
        assert_eq!(
            resolve_href("https://acme.example/", "/pricing"),
            Some("https://acme.example/pricing".to_string())
        );
        assert_eq!(
            resolve_href("https://acme.example/about/", "../pricing"),
            Some("https://acme.example/pricing".to_string())
        );
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(
            normalize_domain("https://www.acme.example/pricing"),
            Some("acme.example".to_string())
        );
        assert_eq!(normalize_domain("Acme.Example"), Some("acme.example".to_string()));
    }
}
