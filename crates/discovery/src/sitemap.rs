//! Sitemap and sitemap-index parsing. Regex extraction of `<loc>` entries
//! covers both shapes without a full XML parse.

use once_cell::sync::Lazy;
use regex::Regex;

static LOC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<loc>\s*([^<]+)\s*</loc>").unwrap());

pub fn parse_locs(content: &str) -> Vec<String> {
    LOC_RE
        .captures_iter(content)
        .map(|cap| cap[1].trim().to_string())
        .collect()
}

/// A sitemap index lists child sitemaps instead of page URLs.
pub fn is_sitemap_index(content: &str) -> bool {
    content.contains("<sitemapindex")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_locs_from_urlset() {
        let xml = r#"<?xml version="1.0"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://example.test/a</loc></url>
              <url><loc> https://example.test/b </loc></url>
            </urlset>"#;
        assert!(!is_sitemap_index(xml));
        assert_eq!(
            parse_locs(xml),
            vec!["https://example.test/a", "https://example.test/b"]
        );
    }

    #[test]
    fn detects_sitemap_index() {
        let xml = r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <sitemap><loc>https://example.test/sitemap-1.xml</loc></sitemap>
            </sitemapindex>"#;
        assert!(is_sitemap_index(xml));
        assert_eq!(parse_locs(xml), vec!["https://example.test/sitemap-1.xml"]);
    }
}
