//! Alert bus
//!
//! Typed fan-out of notifications to subscribed sinks over a broadcast
//! ring. The publisher never waits on consumers: a slow sink lags, the
//! ring keeps the newest 256 messages, and the sink learns how many it
//! missed through its drop counter. Every alert is also logged, so the
//! tracing output is a complete record even with no sinks attached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Ring capacity per sink before the oldest messages are dropped.
pub const SINK_BACKLOG: usize = 256;

/// What a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Event,
    Threat,
    Quarantine,
    Restore,
    ConfigUpdated,
    PendingAction,
}

/// How urgent it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One structured notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Alert {
    pub fn new(kind: AlertType, severity: Severity, data: serde_json::Value) -> Self {
        Self {
            kind,
            severity,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Fan-out publisher.
#[derive(Clone)]
pub struct AlertBus {
    tx: broadcast::Sender<Alert>,
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SINK_BACKLOG);
        Self { tx }
    }

    /// Publish to every sink. Non-blocking; returns the number of sinks
    /// that will see the message.
    pub fn publish(&self, alert: Alert) -> usize {
        match alert.severity {
            Severity::Info => info!(kind = ?alert.kind, data = %alert.data, "alert"),
            Severity::Warning => warn!(kind = ?alert.kind, data = %alert.data, "alert"),
            Severity::Critical => error!(kind = ?alert.kind, data = %alert.data, "alert"),
        }
        // An Err here only means no sink is subscribed
        self.tx.send(alert).unwrap_or(0)
    }

    /// Attach a new sink with its own bounded backlog.
    pub fn subscribe(&self) -> AlertSink {
        AlertSink {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }
}

/// A subscriber's end of the bus.
pub struct AlertSink {
    rx: broadcast::Receiver<Alert>,
    dropped: u64,
}

impl AlertSink {
    /// Wait for the next alert. Returns `None` once the bus shuts down.
    /// Messages lost to backlog overflow are tallied, not surfaced.
    pub async fn recv(&mut self) -> Option<Alert> {
        loop {
            match self.rx.recv().await {
                Ok(alert) => return Some(alert),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(missed = n, "alert sink lagged, oldest messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant for polling consumers.
    pub fn try_recv(&mut self) -> Option<Alert> {
        loop {
            match self.rx.try_recv() {
                Ok(alert) => return Some(alert),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }

    /// Messages this sink has missed to backlog overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Forward critical alerts to the desktop notification daemon.
#[cfg(feature = "desktop-alerts")]
pub fn spawn_desktop_sink(bus: &AlertBus) -> tokio::task::JoinHandle<()> {
    let mut sink = bus.subscribe();
    tokio::spawn(async move {
        while let Some(alert) = sink.recv().await {
            if alert.severity != Severity::Critical {
                continue;
            }
            let body = alert.data.to_string();
            let result = notify_rust::Notification::new()
                .summary("Rampart: critical alert")
                .body(&body)
                .urgency(notify_rust::Urgency::Critical)
                .show();
            if let Err(e) = result {
                warn!("desktop notification failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_sinks() {
        let bus = AlertBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let seen = bus.publish(Alert::new(
            AlertType::Threat,
            Severity::Warning,
            serde_json::json!({"pid": 42}),
        ));
        assert_eq!(seen, 2);

        let got = a.try_recv().unwrap();
        assert_eq!(got.kind, AlertType::Threat);
        assert_eq!(got.data["pid"], 42);
        assert!(b.try_recv().is_some());
    }

    #[test]
    fn test_publish_without_sinks_is_fine() {
        let bus = AlertBus::new();
        assert_eq!(
            bus.publish(Alert::new(
                AlertType::Event,
                Severity::Info,
                serde_json::json!({}),
            )),
            0
        );
    }

    #[test]
    fn test_slow_sink_drops_oldest_and_counts() {
        let bus = AlertBus::new();
        let mut sink = bus.subscribe();

        for i in 0..(SINK_BACKLOG + 50) {
            bus.publish(Alert::new(
                AlertType::Event,
                Severity::Info,
                serde_json::json!({"seq": i}),
            ));
        }

        // First receivable message is the oldest still in the ring
        let first = sink.try_recv().unwrap();
        assert_eq!(first.data["seq"], 50);
        assert_eq!(sink.dropped(), 50);

        // Drain the rest; newest message is the last published
        let mut last = first;
        while let Some(alert) = sink.try_recv() {
            last = alert;
        }
        assert_eq!(last.data["seq"], SINK_BACKLOG + 49);
    }

    #[tokio::test]
    async fn test_async_recv() {
        let bus = AlertBus::new();
        let mut sink = bus.subscribe();
        bus.publish(Alert::new(
            AlertType::Restore,
            Severity::Critical,
            serde_json::json!({"entry": 7}),
        ));
        let alert = sink.recv().await.unwrap();
        assert_eq!(alert.kind, AlertType::Restore);
    }
}
