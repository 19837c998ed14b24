//! Activity/webhook dispatch worker (spec §9 "Activity subscribers /
//! webhook dispatch"). Grounded in the `features/metrics::collector`
//! `spawn(state) -> JoinHandle` shape, generalized from a polling interval to
//! an `mpsc` queue drained by one best-effort dispatch task.

use std::time::Duration;

use sandbox_types::ActivityEvent;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 1024;
const DISPATCH_TIMEOUT_SECS: u64 = 5;

#[derive(Clone)]
pub struct ActivityBus {
    tx: mpsc::Sender<ActivityEvent>,
}

impl ActivityBus {
    /// Spawns the dispatch worker and returns the handle used to publish
    /// events. `webhook_url = None` makes publishing a no-op sink (still
    /// useful so callers don't need to special-case missing configuration).
    pub fn spawn(webhook_url: Option<String>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(dispatch_loop(rx, webhook_url));
        Self { tx }
    }

    pub fn publish(&self, vm_id: Uuid, kind: impl Into<String>, meta: serde_json::Value) {
        let event = ActivityEvent {
            id: Uuid::new_v4(),
            vm_id,
            kind: kind.into(),
            at: chrono::Utc::now(),
            meta,
        };
        // A full channel means the dispatcher is behind; dropping here is
        // preferable to blocking the orchestrator on a webhook subscriber.
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = ?e, "activity event dropped, dispatch queue full");
        }
    }
}

async fn dispatch_loop(mut rx: mpsc::Receiver<ActivityEvent>, webhook_url: Option<String>) {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(DISPATCH_TIMEOUT_SECS))
        .build()
        .expect("reqwest client builds with static config");

    while let Some(event) = rx.recv().await {
        let Some(url) = webhook_url.as_deref() else {
            continue;
        };
        if let Err(e) = client.post(url).json(&event).send().await {
            warn!(error = ?e, vm_id = %event.vm_id, kind = %event.kind, "activity webhook dispatch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_webhook_url_does_not_panic() {
        let bus = ActivityBus::spawn(None);
        bus.publish(Uuid::new_v4(), "vm.created", serde_json::json!({}));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
