//! Upload progress and throughput tracking.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Progress of the firmware part being uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DfuProgress {
    /// 1-based part number.
    pub part: usize,
    pub total_parts: usize,
    /// 0..=100
    pub percent: u8,
    /// Throughput since the previous progress report.
    pub current_speed_bytes_per_second: f64,
    /// Throughput since the upload of this part started.
    pub avg_speed_bytes_per_second: f64,
}

/// Turns a running byte count into at most one report per percentage point.
#[derive(Debug)]
pub struct ProgressTracker {
    part: usize,
    total_parts: usize,
    total_bytes: usize,
    last_percent: Option<u8>,
    started: Instant,
    last_time: Instant,
    last_bytes: usize,
}

impl ProgressTracker {
    pub fn new(part: usize, total_parts: usize, total_bytes: usize) -> Self {
        let now = Instant::now();
        Self {
            part,
            total_parts,
            total_bytes,
            last_percent: None,
            started: now,
            last_time: now,
            last_bytes: 0,
        }
    }

    /// Report `bytes_sent`. Returns a progress value only when the
    /// percentage moved past the last reported one.
    pub fn update(&mut self, bytes_sent: usize) -> Option<DfuProgress> {
        let percent = if self.total_bytes == 0 {
            if self.last_percent.is_none() {
                0
            } else {
                100
            }
        } else {
            (bytes_sent.min(self.total_bytes) * 100 / self.total_bytes) as u8
        };

        if self.last_percent.map_or(false, |last| percent <= last) {
            return None;
        }

        let now = Instant::now();
        let since_last = now.duration_since(self.last_time).as_secs_f64();
        let since_start = now.duration_since(self.started).as_secs_f64();
        let delta = bytes_sent.saturating_sub(self.last_bytes) as f64;

        let progress = DfuProgress {
            part: self.part,
            total_parts: self.total_parts,
            percent,
            current_speed_bytes_per_second: if since_last > 0.0 { delta / since_last } else { 0.0 },
            avg_speed_bytes_per_second: if since_start > 0.0 {
                bytes_sent as f64 / since_start
            } else {
                0.0
            },
        };

        self.last_percent = Some(percent);
        self.last_time = now;
        self.last_bytes = bytes_sent;
        Some(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_once_per_percent() {
        let mut tracker = ProgressTracker::new(1, 1, 1000);
        let percents: Vec<u8> = [0, 5, 9, 10, 11, 500, 505, 999, 1000, 1000]
            .into_iter()
            .filter_map(|bytes| tracker.update(bytes))
            .map(|progress| progress.percent)
            .collect();

        assert_eq!(percents, vec![0, 1, 50, 99, 100]);
    }

    #[test]
    fn test_carries_part_numbers() {
        let mut tracker = ProgressTracker::new(2, 2, 20);
        let progress = tracker.update(20).unwrap();
        assert_eq!(progress.part, 2);
        assert_eq!(progress.total_parts, 2);
        assert_eq!(progress.percent, 100);
        assert!(progress.avg_speed_bytes_per_second >= 0.0);
    }

    #[test]
    fn test_empty_image_reports_zero_then_hundred() {
        let mut tracker = ProgressTracker::new(1, 1, 0);
        assert_eq!(tracker.update(0).map(|p| p.percent), Some(0));
        assert_eq!(tracker.update(0).map(|p| p.percent), Some(100));
        assert_eq!(tracker.update(0), None);
    }
}
