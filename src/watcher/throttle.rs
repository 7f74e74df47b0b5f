//! Per-provider update throttling.
//!
//! Leading edge with trailing coalesce: the first message of a quiet
//! provider goes through at once, anything arriving during the following
//! window overwrites a single slot, and only the newest one is forwarded
//! when the window closes.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Message;

/// Handle to one provider's throttle worker.
pub struct ProviderThrottle {
    slot: watch::Sender<Option<Message>>,
    handle: JoinHandle<()>,
}

impl ProviderThrottle {
    /// Spawn the forwarding task for `provider`.
    pub fn spawn(
        provider: String,
        throttle: Duration,
        out: mpsc::Sender<Message>,
        token: CancellationToken,
    ) -> Self {
        let (slot, rx) = watch::channel(None);
        let handle = tokio::spawn(forward(provider, throttle, rx, out, token));
        Self { slot, handle }
    }

    /// Replace whatever is waiting in the slot. Never blocks.
    pub fn push(&self, message: Message) {
        self.slot.send_replace(Some(message));
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn forward(
    provider: String,
    throttle: Duration,
    mut slot: watch::Receiver<Option<Message>>,
    out: mpsc::Sender<Message>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = slot.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let Some(message) = slot.borrow_and_update().clone() else {
            continue;
        };

        tokio::select! {
            _ = token.cancelled() => break,
            sent = out.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }

        if !throttle.is_zero() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(throttle) => {}
            }
        }
    }

    debug!(provider = %provider, "Throttle worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::{Configuration, HttpConfiguration, Router};

    fn message(rule: &str) -> Message {
        let mut http = HttpConfiguration::default();
        http.routers.insert(
            "r".into(),
            Router {
                rule: rule.into(),
                ..Default::default()
            },
        );
        Message::new(
            "p",
            Configuration {
                http: Some(http),
                ..Default::default()
            },
        )
    }

    fn rule_of(msg: &Message) -> String {
        msg.configuration.as_ref().unwrap().http.as_ref().unwrap().routers["r"]
            .rule
            .clone()
    }

    #[tokio::test]
    async fn first_message_forwarded_immediately() {
        let (tx, mut rx) = mpsc::channel(10);
        let token = CancellationToken::new();
        let throttle =
            ProviderThrottle::spawn("p".into(), Duration::from_secs(60), tx, token.clone());

        throttle.push(message("one"));
        let got = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("leading edge should not wait for the window")
            .unwrap();
        assert_eq!(rule_of(&got), "one");
        token.cancel();
    }

    #[tokio::test]
    async fn burst_coalesces_to_last() {
        let (tx, mut rx) = mpsc::channel(10);
        let token = CancellationToken::new();
        let throttle =
            ProviderThrottle::spawn("p".into(), Duration::from_millis(200), tx, token.clone());

        for i in 0..10 {
            throttle.push(message(&format!("v{}", i)));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut received = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            received.push(rule_of(&msg));
        }

        assert!(!received.is_empty() && received.len() <= 10);
        assert_eq!(received.first().unwrap(), "v0");
        assert_eq!(received.last().unwrap(), "v9");
        token.cancel();
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(10);
        let token = CancellationToken::new();
        let throttle =
            ProviderThrottle::spawn("p".into(), Duration::from_millis(10), tx, token.clone());
        token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(throttle.is_finished());
    }
}
