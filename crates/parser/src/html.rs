use scraper::{Html, Selector};
use url::Url;

use crate::{ExtractedLink, ParsedPage};

pub(crate) fn parse_html(html_str: &str, base_url: &Url) -> ParsedPage {
    let document = Html::parse_document(html_str);
    let base_domain = base_url.host_str().unwrap_or("");

    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    // All visible text, whitespace-collapsed
    let body_text = selector("body")
        .and_then(|s| document.select(&s).next())
        .map(|el| {
            el.text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    let links = extract_links(&document, base_url, base_domain);

    let language = selector("html")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("lang"))
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());

    ParsedPage {
        title,
        body_text,
        links,
        language,
    }
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

fn extract_links(document: &Html, base_url: &Url, base_domain: &str) -> Vec<ExtractedLink> {
    let Some(sel) = selector("a[href]") else {
        return vec![];
    };

    document
        .select(&sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?;

            // Skip non-crawlable URL schemes
            if href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
                || href.starts_with("data:")
                || href.starts_with('#')
                || href == "/"
            {
                return None;
            }

            let resolved = base_url.join(href).ok()?;
            if resolved.scheme() != "http" && resolved.scheme() != "https" {
                return None;
            }
            let host = resolved.host_str().unwrap_or("");

            Some(ExtractedLink {
                url: resolved.to_string(),
                anchor_text: {
                    let t = el.text().collect::<String>().trim().to_string();
                    if t.is_empty() {
                        None
                    } else {
                        Some(t)
                    }
                },
                is_external: host != base_domain,
            })
        })
        .collect()
}
