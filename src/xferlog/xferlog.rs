use crate::client::ClientSession;
use crate::config::TransferLogSpec;
use crate::error::ServerError;
use chrono::{TimeZone, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// The current transfer log window.  Only exists while logging is
/// configured (a base directory and at least one enabled direction).
///
#[derive(Debug)]
pub struct TransferLog {
    spec: TransferLogSpec,
    /// Window bounds, epoch seconds.
    pub start: u64,
    pub end: u64,
}

impl TransferLog {
    /// Build the window for the configuration, aligned around `now`.
    /// Returns None when transfer logging is off.
    pub fn new(spec: &TransferLogSpec, now: u64) -> Option<TransferLog> {
        if spec.base_dir.is_none() || (!spec.tx && !spec.rx) {
            return None;
        }
        let (start, end) = align(now, spec.interval_hours);
        Some(TransferLog {
            spec: spec.clone(),
            start,
            end,
        })
    }
    /// True when `now` crossed the window's end boundary.
    pub fn due(&self, now: u64) -> bool {
        now >= self.end
    }
    /// Advance to the window containing `now`.  Also used after a
    /// config re-read, which recomputes the window from the current
    /// time.
    pub fn roll(&mut self, now: u64) {
        let (start, end) = align(now, self.spec.interval_hours);
        self.start = start;
        self.end = end;
    }
    /// File the current window's rows land in.
    pub fn file_path(&self) -> PathBuf {
        let dir = self.spec.base_dir.as_ref().expect("logging is configured");
        let prefix = self.spec.prefix.as_deref().unwrap_or("transfer");
        let stamp = Utc
            .timestamp_opt(self.start as i64, 0)
            .single()
            .map(|t| t.format("%Y%m%dT%H").to_string())
            .unwrap_or_else(|| self.start.to_string());
        dir.join(format!("{}-{}.log", prefix, stamp))
    }
    /// Append one usage row for a client.  Directions that are
    /// disabled log as dashes so the row layout stays fixed.
    pub fn write_row(&self, session: &ClientSession) -> Result<(), ServerError> {
        let counters = session.counters.snapshot();
        let tx = if self.spec.tx {
            format!("{} {}", counters.tx_packets, counters.tx_bytes)
        } else {
            String::from("- -")
        };
        let rx = if self.spec.rx {
            format!("{} {}", counters.rx_packets, counters.rx_bytes)
        } else {
            String::from("- -")
        };
        let row = format!(
            "{} {} {} {} {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            session.client_id,
            session.protocol(),
            tx,
            rx
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())
            .map_err(ServerError::TransferLog)?;
        file.write_all(row.as_bytes())
            .map_err(ServerError::TransferLog)?;
        Ok(())
    }
}

fn align(now: u64, interval_hours: u32) -> (u64, u64) {
    let interval = u64::from(interval_hours.max(1)) * 3600;
    let start = now - now % interval;
    (start, start + interval)
}
