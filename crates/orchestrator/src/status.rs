//! Periodic status reporting
//!
//! Fire-and-forget push to whatever sinks are attached: the tracing log on
//! every rig, and a channel feeding the LED indicator service.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

/// One status record, pushed on the status tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub images_captured: u64,
    pub errors: u64,
    pub fps_actual: f64,
    pub gps_fix_present: bool,
    pub free_space_gb: f64,
    /// Overexposure or storage-probe trouble; capture keeps running.
    pub degraded: bool,
}

/// Status consumer. Push-only, no acknowledgement.
pub trait StatusSink: Send + Sync {
    fn publish(&self, report: &StatusReport);
}

/// Logs each report as one structured line.
pub struct LogSink;

impl StatusSink for LogSink {
    fn publish(&self, report: &StatusReport) {
        info!(
            images = report.images_captured,
            errors = report.errors,
            fps = report.fps_actual,
            gps_fix = report.gps_fix_present,
            free_gb = report.free_space_gb,
            degraded = report.degraded,
            "status"
        );
    }
}

/// Forwards reports over a bounded channel, dropping when the consumer lags.
pub struct ChannelSink {
    tx: mpsc::Sender<StatusReport>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StatusReport>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelSink {
    fn publish(&self, report: &StatusReport) {
        // Fire-and-forget: a slow LED service must never stall reporting.
        let _ = self.tx.try_send(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> StatusReport {
        StatusReport {
            images_captured: 10,
            errors: 1,
            fps_actual: 1.98,
            gps_fix_present: true,
            free_space_gb: 27.5,
            degraded: false,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.publish(&report());

        let got = rx.recv().await.unwrap();
        assert_eq!(got.images_captured, 10);
        assert!(got.gps_fix_present);
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.publish(&report());
        sink.publish(&report()); // dropped, not blocked

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_report_serializes() {
        let json = serde_json::to_string(&report()).unwrap();
        assert!(json.contains("\"images_captured\":10"));
    }
}
