//! Delivery targets for dangerous-weather alerts.

use notify_rust::Notification;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::types::LocationKey;

/// Fire-and-forget alert delivery.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, key: &LocationKey, title: &str, message: &str);
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, key: &LocationKey, title: &str, message: &str) {
        tracing::warn!(location = %key, "{}: {}", title, message.replace('\n', "; "));
    }
}

/// Desktop notifications through the platform notification service.
#[derive(Debug, Clone)]
pub struct DesktopSink {
    app_name: String,
}

impl DesktopSink {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

impl DesktopSink {
    fn show(app_name: &str, key: &LocationKey, title: &str, message: &str) {
        if let Err(e) = Notification::new()
            .summary(title)
            .body(message)
            .icon("weather-severe-alert")
            .appname(app_name)
            .timeout(notify_rust::Timeout::Milliseconds(10_000))
            .show()
        {
            tracing::warn!("Failed to show notification for {}: {}", key, e);
        }
    }
}

impl NotificationSink for DesktopSink {
    /// `show()` is a blocking D-Bus round trip, so inside a runtime it runs
    /// on the blocking pool and this returns at once.
    fn notify(&self, key: &LocationKey, title: &str, message: &str) {
        let (app_name, key) = (self.app_name.clone(), key.clone());
        let (title, message) = (title.to_string(), message.to_string());
        off_runtime(move || Self::show(&app_name, &key, &title, &message));
    }
}

/// Run `work` on the blocking pool when called from a runtime, else inline.
fn off_runtime(work: impl FnOnce() + Send + 'static) {
    match Handle::try_current() {
        Ok(handle) => drop(handle.spawn_blocking(work)),
        Err(_) => work(),
    }
}

/// A delivered alert, as seen by `ChannelSink` receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub key: LocationKey,
    pub title: String,
    pub message: String,
}

/// Forwards alerts into a channel for embedding hosts and tests.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, key: &LocationKey, title: &str, message: &str) {
        let alert = Alert {
            key: key.clone(),
            title: title.to_string(),
            message: message.to_string(),
        };
        if self.tx.send(alert).is_err() {
            tracing::debug!("Alert receiver dropped, discarding alert for {}", key);
        }
    }
}

/// Delivers to every inner sink in order.
pub struct FanoutSink {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, key: &LocationKey, title: &str, message: &str) {
        for sink in &self.sinks {
            sink.notify(key, title, message);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.notify(&LocationKey::new("Nome"), "Weather alert", "Heavy snow");

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.key, LocationKey::new("nome"));
        assert_eq!(alert.title, "Weather alert");
        assert_eq!(alert.message, "Heavy snow");
    }

    #[test]
    fn test_channel_sink_tolerates_dropped_receiver() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        sink.notify(&LocationKey::new("Nome"), "t", "m");
    }

    #[tokio::test]
    async fn test_blocking_delivery_leaves_runtime_free() {
        let (release, released) = std::sync::mpsc::channel::<()>();
        let (done, finished) = tokio::sync::oneshot::channel();

        off_runtime(move || {
            let ok = released.recv_timeout(std::time::Duration::from_secs(5)).is_ok();
            let _ = done.send(ok);
        });

        // Inline delivery would still be blocked here.
        release.send(()).unwrap();
        assert!(finished.await.unwrap());
    }

    #[test]
    fn test_off_runtime_runs_inline_without_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        off_runtime(move || tx.send(()).unwrap());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let (a, mut rx_a) = ChannelSink::channel();
        let (b, mut rx_b) = ChannelSink::channel();
        let fanout = FanoutSink::new(vec![Box::new(a), Box::new(TracingSink), Box::new(b)]);

        fanout.notify(&LocationKey::new("Nome"), "t", "m");
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }
}
