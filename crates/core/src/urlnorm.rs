//! Canonical URL form and fingerprinting. Every identity in the pipeline
//! (queues, state store, object keys, index ids) derives from the output of
//! `normalize` + `url_hash`, so two workers seeing equivalent URLs agree.

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::CrawlError;

/// Query parameters stripped during canonicalization.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "gclid",
    "fbclid",
    "msclkid",
    "mc_eid",
    "ref",
];

fn is_tracking_param(name: &str, extra_deny: &[String]) -> bool {
    TRACKING_PARAMS.contains(&name) || extra_deny.iter().any(|d| d == name)
}

/// Produce the canonical form of a URL, or reject it.
///
/// Lowercases scheme and host, strips default ports and fragments, sorts
/// query parameters, drops tracking parameters, collapses duplicate slashes
/// and decodes unreserved percent-escapes in the path.
pub fn normalize(input: &str) -> Result<Url, CrawlError> {
    normalize_with(input, &[])
}

/// `normalize` with an additional configured parameter deny-list.
pub fn normalize_with(input: &str, extra_deny: &[String]) -> Result<Url, CrawlError> {
    let mut url = Url::parse(input.trim())
        .map_err(|e| CrawlError::InvalidUrl(format!("{}: {}", input.trim(), e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CrawlError::InvalidUrl(format!(
                "unsupported scheme {:?} in {}",
                other, input
            )))
        }
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(CrawlError::InvalidUrl(format!("empty host in {}", input)));
    }

    url.set_fragment(None);

    // The url crate already lowercases scheme/host and drops default ports;
    // path cleanup is on us.
    let path = decode_unreserved(&collapse_slashes(url.path()));
    url.set_path(&path);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .filter(|(k, _)| !is_tracking_param(k, extra_deny))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(url)
}

/// Stable fingerprint of a canonical URL: SHA-256 of its string form, hex.
pub fn url_hash(canonical: &Url) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Domain key used for rate limiting, robots lookup and dedup: the URL host
/// with any `www.` prefix removed, keeping a non-default port.
pub fn registrable_domain(url: &Url) -> Result<String, CrawlError> {
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CrawlError::InvalidUrl(format!("empty host in {}", url)))?;
    let host = host.strip_prefix("www.").unwrap_or(host).to_ascii_lowercase();
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Host plus non-default port, the key robots policies are cached under.
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

/// Decode `%XX` escapes whose decoded byte is an unreserved character, so
/// `/%7Euser` and `/~user` hash identically.
fn decode_unreserved(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                let decoded = (hi * 16 + lo) as u8;
                if is_unreserved(decoded) {
                    out.push(decoded);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_default_port() {
        let url = normalize("HTTP://Example.COM:80/About").unwrap();
        assert_eq!(url.as_str(), "http://example.com/About");
    }

    #[test]
    fn removes_fragment_and_sorts_query() {
        let url = normalize("https://example.com/a?b=2&a=1#section").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a?a=1&b=2");
    }

    #[test]
    fn drops_tracking_params() {
        let url = normalize("https://example.com/a?utm_source=x&q=rust&fbclid=y").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a?q=rust");
    }

    #[test]
    fn query_removed_entirely_when_only_tracking() {
        let url = normalize("https://example.com/a?utm_source=x").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a");
    }

    #[test]
    fn collapses_duplicate_slashes() {
        let url = normalize("https://example.com//a///b/").unwrap();
        assert_eq!(url.path(), "/a/b/");
    }

    #[test]
    fn decodes_unreserved_escapes_only() {
        let url = normalize("https://example.com/%7Euser/%2Fkeep").unwrap();
        assert_eq!(url.path(), "/~user/%2Fkeep");
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            normalize("ftp://example.com/file"),
            Err(CrawlError::InvalidUrl(_))
        ));
        assert!(matches!(
            normalize("javascript:alert(1)"),
            Err(CrawlError::InvalidUrl(_))
        ));
    }

    #[test]
    fn equivalent_inputs_hash_equal() {
        let a = normalize("https://Example.com:443/p?b=2&a=1#x").unwrap();
        let b = normalize("https://example.com/p?a=1&b=2").unwrap();
        assert_eq!(url_hash(&a), url_hash(&b));
        assert_eq!(url_hash(&a).len(), 64);
    }

    #[test]
    fn registrable_domain_strips_www() {
        let url = normalize("https://www.Example.com/x").unwrap();
        assert_eq!(registrable_domain(&url).unwrap(), "example.com");
    }

    #[test]
    fn non_default_port_stays_in_domain_key() {
        let url = normalize("http://127.0.0.1:8080/x").unwrap();
        assert_eq!(registrable_domain(&url).unwrap(), "127.0.0.1:8080");
        assert_eq!(host_key(&url).as_deref(), Some("127.0.0.1:8080"));

        let url = normalize("http://example.com:80/x").unwrap();
        assert_eq!(registrable_domain(&url).unwrap(), "example.com");
    }
}
