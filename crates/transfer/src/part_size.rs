//! Adaptive part sizing from observed throughput.

use std::time::Duration;

use crate::config::FilePartConfig;

/// Smallest elapsed time used for speed estimation.
///
/// Tiny parts can complete in what the clock reports as zero; treating
/// them as this fast yields a huge speed that the delta bounds then clamp.
const MIN_ELAPSED: Duration = Duration::from_micros(1);

/// Computes the next part size so a part takes roughly the target time.
#[derive(Debug, Clone)]
pub struct PartSizeCalculator {
    min_part_size: u64,
    max_part_size: u64,
    target_part_upload_time: Duration,
    max_increase_factor: f64,
    max_decrease_factor: f64,
    concurrent_workers: usize,
}

impl PartSizeCalculator {
    pub fn new(config: &FilePartConfig, concurrent_workers: usize) -> Self {
        Self {
            min_part_size: config.min_part_size,
            max_part_size: config.max_part_size,
            target_part_upload_time: config.target_part_upload_time,
            max_increase_factor: config.max_part_size_increase_factor,
            max_decrease_factor: config.max_part_size_decrease_factor,
            concurrent_workers,
        }
    }

    /// Returns the part size to use after a part of `completed_part_size`
    /// bytes took `elapsed`, given the size currently in use.
    ///
    /// The result is always within `[min_part_size, max_part_size]`.
    pub fn next_part_size(
        &self,
        last_part_size: u64,
        completed_part_size: u64,
        elapsed: Duration,
    ) -> u64 {
        let completed = completed_part_size as f64;
        let seconds = elapsed.max(MIN_ELAPSED).as_secs_f64();

        let estimated_speed = completed / seconds;
        let target_size = estimated_speed * self.target_part_upload_time.as_secs_f64();

        // Workers sample almost simultaneously; damp so they don't all push
        // the shared size the same way at once.
        let penalty = (self.concurrent_workers / 2).max(1) as f64;
        let delta = (target_size - completed) / penalty;

        let min_delta = -(completed * (self.max_decrease_factor - 1.0) / self.max_decrease_factor);
        let max_delta = completed * (self.max_increase_factor - 1.0);
        let delta = delta.max(min_delta).min(max_delta);

        let next = last_part_size as f64 + delta.round();
        let next = next.max(self.min_part_size as f64).min(self.max_part_size as f64);
        next as u64
    }

    pub fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    pub fn max_part_size(&self) -> u64 {
        self.max_part_size
    }
}
