use anyhow::Result;

use driftnet_core::UrlState;
use driftnet_queue::Queue;
use driftnet_state::StateStore;

use crate::pipeline::Pipeline;

pub async fn run(pipeline: &Pipeline) -> Result<()> {
    let counts = pipeline.state.counts_by_state().await?;
    println!("URL records:");
    for state in [
        UrlState::Pending,
        UrlState::InProgress,
        UrlState::Deferred,
        UrlState::Done,
        UrlState::Failed,
    ] {
        println!(
            "  {:<12} {:>10}",
            state,
            counts.get(&state).copied().unwrap_or(0)
        );
    }

    println!("Queues:");
    println!(
        "  {:<16} {:>10}",
        "discovery",
        pipeline.queues.discovery.approx_depth().await?
    );
    println!(
        "  {:<16} {:>10}",
        "crawl",
        pipeline.queues.crawl.approx_depth().await?
    );
    println!(
        "  {:<16} {:>10}",
        "index",
        pipeline.queues.index.approx_depth().await?
    );
    for (name, dlq) in &pipeline.queues.dead_letter {
        println!("  {:<16} {:>10}", name, dlq.approx_depth().await?);
    }
    Ok(())
}
