//! Lease renewal for in-flight crawl slots. The renewer holds only a cancel
//! receiver and a lost-notification sender, never the slot itself; when a
//! renewal comes back `Lost` the slot's select loop aborts its work.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use driftnet_state::{Renewal, StateStore};

pub fn spawn_renewer(
    state: Arc<dyn StateStore>,
    url_hash: String,
    owner_id: String,
    lease: Duration,
    mut cancel_rx: watch::Receiver<bool>,
    lost_tx: watch::Sender<bool>,
) -> JoinHandle<()> {
    // Renew at a third of the lease so two renewals can fail before expiry.
    let interval = lease / 3;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {
                    match state.renew_lease(&url_hash, &owner_id, lease).await {
                        Ok(Renewal::Renewed(_)) => {}
                        Ok(Renewal::Lost) => {
                            warn!(url_hash = %url_hash, "lease lost, signalling slot");
                            let _ = lost_tx.send(true);
                            break;
                        }
                        // Transport hiccup: the lease is still ours until it
                        // expires, try again next tick.
                        Err(e) => warn!(url_hash = %url_hash, error = %e, "lease renewal failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftnet_state::{MemoryStateStore, StateOptions, StateStore};

    #[tokio::test]
    async fn renewer_keeps_lease_alive() {
        let state = Arc::new(MemoryStateStore::new(StateOptions::default()));
        state
            .try_acquire("https://a.test/", "h1", "a.test", "w1", Duration::from_millis(90))
            .await
            .unwrap();

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (lost_tx, lost_rx) = watch::channel(false);
        let handle = spawn_renewer(
            state.clone(),
            "h1".to_string(),
            "w1".to_string(),
            Duration::from_millis(90),
            cancel_rx,
            lost_tx,
        );

        // Well past the original lease; renewals must have kept it ours.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!*lost_rx.borrow());
        let record = state.get("h1").await.unwrap().unwrap();
        assert_eq!(record.owner_id.as_deref(), Some("w1"));
        handle.abort();
    }

    #[tokio::test]
    async fn renewer_signals_lost_after_reclaim() {
        let state = Arc::new(MemoryStateStore::new(StateOptions::default()));
        state
            .try_acquire("https://a.test/", "h1", "a.test", "w1", Duration::from_millis(30))
            .await
            .unwrap();

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (lost_tx, mut lost_rx) = watch::channel(false);
        let _handle = spawn_renewer(
            state.clone(),
            "h1".to_string(),
            "w1".to_string(),
            Duration::from_millis(30),
            cancel_rx,
            lost_tx,
        );

        // Another worker reclaims after expiry; the next renewal sees Lost.
        tokio::time::sleep(Duration::from_millis(40)).await;
        state
            .try_acquire("https://a.test/", "h1", "a.test", "w2", Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_millis(500), lost_rx.changed())
            .await
            .expect("lost signal within timeout")
            .unwrap();
        assert!(*lost_rx.borrow());
    }
}
