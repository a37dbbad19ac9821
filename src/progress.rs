//! Upload progress bookkeeping.

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub bytes_sent: u64,
    pub bytes_total: u64,
    /// Bytes per second measured between the last two callbacks.
    pub instantaneous_rate: f64,
    pub estimated_seconds_remaining: Option<f64>,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_sent as f64 / self.bytes_total as f64 * 100.0).min(100.0)
    }

    pub fn is_finished(&self) -> bool {
        self.bytes_total > 0 && self.bytes_sent >= self.bytes_total
    }
}

/// Turns raw `(bytes_sent, bytes_total)` callbacks into an [`UploadProgress`].
#[derive(Debug, Default)]
pub struct ProgressMeter {
    last: Option<(Instant, u64)>,
    rate: f64,
}

impl ProgressMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first callback only anchors the meter, so an upload resumed part
    /// way through never counts the earlier bytes towards the rate.
    pub fn record(&mut self, now: Instant, bytes_sent: u64, bytes_total: u64) -> UploadProgress {
        if let Some((then, previous)) = self.last {
            let elapsed = now.saturating_duration_since(then).as_secs_f64();
            // Two callbacks in the same instant keep the previous rate.
            if elapsed > 0.0 {
                self.rate = bytes_sent.saturating_sub(previous) as f64 / elapsed;
            }
        }
        self.last = Some((now, bytes_sent));

        let remaining = bytes_total.saturating_sub(bytes_sent);
        let estimated_seconds_remaining = if remaining == 0 {
            Some(0.0)
        } else if self.rate > 0.0 {
            Some(remaining as f64 / self.rate)
        } else {
            None
        };

        UploadProgress {
            bytes_sent,
            bytes_total,
            instantaneous_rate: self.rate,
            estimated_seconds_remaining,
        }
    }
}

/// Human readable byte count, e.g. `1.5 GiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rate_uses_bytes_since_last_callback() {
        let start = Instant::now();
        let mut meter = ProgressMeter::new();
        let first = meter.record(start, 0, 1_000);
        assert_eq!(first.instantaneous_rate, 0.0);
        assert_eq!(first.estimated_seconds_remaining, None);

        let second = meter.record(start + Duration::from_secs(2), 400, 1_000);
        assert_eq!(second.instantaneous_rate, 200.0);
        assert_eq!(second.estimated_seconds_remaining, Some(3.0));

        let third = meter.record(start + Duration::from_millis(2_500), 500, 1_000);
        assert_eq!(third.instantaneous_rate, 200.0);
        assert_eq!(third.estimated_seconds_remaining, Some(2.5));
    }

    #[test]
    fn same_instant_keeps_previous_rate() {
        let start = Instant::now();
        let mut meter = ProgressMeter::new();
        meter.record(start, 0, 100);
        meter.record(start + Duration::from_secs(1), 10, 100);
        let repeated = meter.record(start + Duration::from_secs(1), 20, 100);
        assert_eq!(repeated.instantaneous_rate, 10.0);
    }

    #[test]
    fn resumed_meter_ignores_bytes_sent_before_the_anchor() {
        let start = Instant::now();
        let mut meter = ProgressMeter::new();
        let anchor = meter.record(start, 600, 1_000);
        assert_eq!(anchor.instantaneous_rate, 0.0);
        let progress = meter.record(start + Duration::from_secs(1), 700, 1_000);
        assert_eq!(progress.instantaneous_rate, 100.0);
        assert!((progress.percent() - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn finished_upload_has_no_time_remaining() {
        let start = Instant::now();
        let mut meter = ProgressMeter::new();
        let done = meter.record(start, 50, 50);
        assert!(done.is_finished());
        assert_eq!(done.estimated_seconds_remaining, Some(0.0));
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1_610_612_736), "1.5 GiB");
        assert_eq!(format_bytes(50 * 1024 * 1024), "50.0 MiB");
    }
}
