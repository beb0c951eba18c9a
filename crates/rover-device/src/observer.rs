//! Hotplug detection.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

/// Watch for recently connected Smart Devices.
#[async_trait]
pub trait DeviceObserver: Send {
    /// Serial port paths that appeared since the previous call. Blocks until
    /// there is something to report (or one polling interval passes).
    async fn next_ports(&mut self) -> Vec<PathBuf>;
}

/// Detect devices by polling the filesystem.
///
/// Patterns are directory globs with a single trailing `*`
/// (`/dev/ttyACM*`). This observer exists for portability on hosts without
/// hotplug event support.
pub struct PollingObserver {
    patterns: Vec<String>,
    interval: Duration,
    known: HashSet<PathBuf>,
}

impl Default for PollingObserver {
    fn default() -> Self {
        Self::new(&["/dev/ttyACM*".to_owned()], Duration::from_secs(1))
    }
}

impl PollingObserver {
    pub fn new(patterns: &[String], interval: Duration) -> Self {
        Self {
            patterns: patterns.to_vec(),
            interval,
            known: HashSet::new(),
        }
    }

    fn scan(patterns: &[String]) -> HashSet<PathBuf> {
        let mut ports = HashSet::new();
        for pattern in patterns {
            let (dir, prefix) = match pattern.rsplit_once('/') {
                Some((dir, file)) => (dir, file.trim_end_matches('*')),
                None => continue,
            };
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(prefix) {
                    ports.insert(entry.path());
                }
            }
        }
        ports
    }
}

#[async_trait]
impl DeviceObserver for PollingObserver {
    async fn next_ports(&mut self) -> Vec<PathBuf> {
        let patterns = self.patterns.clone();
        let ports = tokio::task::spawn_blocking(move || Self::scan(&patterns))
            .await
            .unwrap_or_default();
        tokio::time::sleep(self.interval).await;
        let fresh: Vec<PathBuf> = ports.difference(&self.known).cloned().collect();
        self.known = ports;
        fresh
    }
}
