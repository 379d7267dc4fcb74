// src/status.rs
//
// Periodic console snapshot: one summary line every 5 seconds, plus one line
// per active recording with its elapsed time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Quality, Settings};
use crate::governor::Governor;
use crate::registry::UrlRegistry;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RecordingEntry {
    pub anchor: String,
    pub quality: Quality,
    pub started: Instant,
}

/// Shared counters the reporter reads and the supervisors write.
pub struct StatusBoard {
    started: Instant,
    recordings: std::sync::Mutex<HashMap<String, RecordingEntry>>,
    total_errors: AtomicU64,
}

impl StatusBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            recordings: std::sync::Mutex::new(HashMap::new()),
            total_errors: AtomicU64::new(0),
        })
    }

    pub fn recording_started(&self, url: &str, anchor: &str, quality: Quality) {
        self.recordings.lock().unwrap().insert(
            url.to_string(),
            RecordingEntry {
                anchor: anchor.to_string(),
                quality,
                started: Instant::now(),
            },
        );
    }

    pub fn recording_finished(&self, url: &str) {
        self.recordings.lock().unwrap().remove(url);
    }

    pub fn recording_count(&self) -> usize {
        self.recordings.lock().unwrap().len()
    }

    pub fn recordings(&self) -> Vec<(String, RecordingEntry)> {
        let map = self.recordings.lock().unwrap();
        let mut list: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    pub fn error_recorded(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// `h:mm:ss`.
pub(crate) fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Print the snapshot every 5 seconds until shutdown.
pub fn spawn_reporter(
    board: Arc<StatusBoard>,
    registry: Arc<UrlRegistry>,
    governor: Arc<Governor>,
    settings: Arc<Settings>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + REPORT_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, REPORT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            info!(
                "monitoring {} | limit {}/{} | proxy {} | segment {} | {} {} | errors {} (window {}) | up {}",
                registry.monitored_count(),
                governor.current_limit(),
                governor.preset(),
                if settings.proxy_address.is_some() { "on" } else { "off" },
                if settings.segment_record {
                    format!("{}s", settings.segment_seconds)
                } else {
                    "off".to_string()
                },
                settings.quality,
                settings.container,
                board.total_errors(),
                governor.window_error_total(),
                format_elapsed(board.uptime()),
            );
            for (url, entry) in board.recordings() {
                info!(
                    "  ⏺ {} [{}] {} ({})",
                    entry.anchor,
                    entry.quality,
                    format_elapsed(entry.started.elapsed()),
                    url,
                );
            }
        }
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(61)), "0:01:01");
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "1:02:03");
        assert_eq!(format_elapsed(Duration::from_secs(36_000)), "10:00:00");
    }

    #[test]
    fn board_tracks_recordings() {
        let board = StatusBoard::new();
        assert_eq!(board.recording_count(), 0);
        board.recording_started("https://a/1", "Alice", Quality::Original);
        board.recording_started("https://b/2", "Bob", Quality::Hd);
        assert_eq!(board.recording_count(), 2);
        board.recording_finished("https://a/1");
        assert_eq!(board.recording_count(), 1);
        assert_eq!(board.recordings()[0].1.anchor, "Bob");
    }

    #[test]
    fn board_counts_errors() {
        let board = StatusBoard::new();
        board.error_recorded();
        board.error_recorded();
        assert_eq!(board.total_errors(), 2);
    }
}
