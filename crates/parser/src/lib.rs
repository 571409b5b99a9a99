//! HTML extraction for the crawl and index paths: title, visible text,
//! outlinks and declared language, plus content hashing for reindex
//! suppression.

mod html;

use sha2::{Digest, Sha256};
use url::Url;

/// Max bytes to parse (5 MB). Larger bodies are truncated before parsing.
const MAX_PARSE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub title: Option<String>,
    pub body_text: String,
    pub links: Vec<ExtractedLink>,
    /// From the `<html lang>` attribute, when declared.
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractedLink {
    pub url: String,
    pub anchor_text: Option<String>,
    pub is_external: bool,
}

pub fn parse_page(body: &[u8], base_url: &Url) -> ParsedPage {
    let body = if body.len() > MAX_PARSE_SIZE {
        &body[..MAX_PARSE_SIZE]
    } else {
        body
    };
    let body_str = String::from_utf8_lossy(body);
    html::parse_html(&body_str, base_url)
}

/// SHA-256 of the raw bytes, hex. Equal hashes across two fetches of the same
/// URL mean the index copy is already current.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
