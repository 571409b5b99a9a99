use anyhow::Result;
use tracing::warn;

use driftnet_core::{urlnorm, DiscoveryMessage};

use crate::pipeline::Pipeline;

/// Publish seed domains to the discovery queue. Entries may be bare domains,
/// full URLs, or a path to a file with one entry per line.
pub async fn run(pipeline: &Pipeline, entries: Vec<String>) -> Result<()> {
    let mut domains = Vec::new();
    for entry in entries {
        if std::path::Path::new(&entry).exists() {
            let content = std::fs::read_to_string(&entry)?;
            domains.extend(
                content
                    .lines()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty() && !l.starts_with('#')),
            );
        } else {
            domains.extend(entry.split(',').map(|s| s.trim().to_string()));
        }
    }

    let mut published = 0usize;
    for raw in domains {
        let domain = if raw.contains("://") {
            match urlnorm::normalize(&raw).and_then(|u| urlnorm::registrable_domain(&u)) {
                Ok(domain) => domain,
                Err(e) => {
                    warn!(entry = %raw, error = %e, "skipping unusable seed");
                    continue;
                }
            }
        } else {
            let d = raw.to_ascii_lowercase();
            d.strip_prefix("www.").unwrap_or(&d).to_string()
        };
        if domain.is_empty() {
            continue;
        }
        pipeline
            .queues
            .discovery
            .send(&DiscoveryMessage::new(domain.clone(), "seed"), 1.0)
            .await?;
        println!("seeded {}", domain);
        published += 1;
    }
    println!("{} domain(s) published to discovery", published);
    Ok(())
}
