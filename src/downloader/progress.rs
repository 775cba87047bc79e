use serde::{Deserialize, Serialize};
use std::num::NonZeroU64;
use std::time::Duration;

/// Unit in which transfer speed is reported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpeedUnit {
    BytesPerSecond,
    #[default]
    KilobytesPerSecond,
    MegabytesPerSecond,
}

impl SpeedUnit {
    fn divisor(self) -> f64 {
        match self {
            SpeedUnit::BytesPerSecond => 1.0,
            SpeedUnit::KilobytesPerSecond => 1024.0,
            SpeedUnit::MegabytesPerSecond => 1024.0 * 1024.0,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            SpeedUnit::BytesPerSecond => "B/s",
            SpeedUnit::KilobytesPerSecond => "KB/s",
            SpeedUnit::MegabytesPerSecond => "MB/s",
        }
    }

    /// Renders a speed the way progress tables show it, e.g. `12.50 KB/s`.
    pub fn format(self, value: f64) -> String {
        format!("{:.2} {}", value, self.suffix())
    }
}

/// One progress computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub percent: u8,
    pub speed: f64,
    pub eta: Option<Duration>,
}

/// Turns streamed byte counts into percentage and throughput.
///
/// The total is fixed when the download phase begins and can never be zero;
/// zero-size streams are rejected before a sampler is built.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSampler {
    total: NonZeroU64,
    unit: SpeedUnit,
}

impl ProgressSampler {
    pub fn new(total: NonZeroU64, unit: SpeedUnit) -> Self {
        Self { total, unit }
    }

    /// Returns `None` for a zero total.
    pub fn for_total(total: u64, unit: SpeedUnit) -> Option<Self> {
        NonZeroU64::new(total).map(|total| Self::new(total, unit))
    }

    pub fn total(&self) -> u64 {
        self.total.get()
    }

    pub fn unit(&self) -> SpeedUnit {
        self.unit
    }

    /// `floor(downloaded / total * 100)`, clamped to `0..=100`.
    pub fn percent(&self, downloaded: u64) -> u8 {
        let downloaded = downloaded.min(self.total.get()) as u128;
        (downloaded * 100 / self.total.get() as u128) as u8
    }

    /// Average speed since the download phase began, in the sampler's unit.
    pub fn speed(&self, downloaded: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            downloaded as f64 / secs / self.unit.divisor()
        } else {
            0.0
        }
    }

    pub fn eta(&self, downloaded: u64, elapsed: Duration) -> Option<Duration> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || downloaded == 0 {
            return None;
        }
        let remaining = self.total.get().saturating_sub(downloaded) as f64;
        let bytes_per_sec = downloaded as f64 / secs;
        Some(Duration::from_secs_f64(remaining / bytes_per_sec))
    }

    pub fn sample(&self, downloaded: u64, elapsed: Duration) -> ProgressSample {
        ProgressSample {
            percent: self.percent(downloaded),
            speed: self.speed(downloaded, elapsed),
            eta: self.eta(downloaded, elapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(total: u64) -> ProgressSampler {
        ProgressSampler::for_total(total, SpeedUnit::KilobytesPerSecond).unwrap()
    }

    #[test]
    fn zero_total_is_rejected() {
        assert!(ProgressSampler::for_total(0, SpeedUnit::BytesPerSecond).is_none());
    }

    #[test]
    fn percent_is_floored() {
        let s = sampler(1000);
        assert_eq!(s.percent(0), 0);
        assert_eq!(s.percent(299), 29);
        assert_eq!(s.percent(300), 30);
        assert_eq!(s.percent(999), 99);
        assert_eq!(s.percent(1000), 100);
    }

    #[test]
    fn percent_is_clamped_past_total() {
        assert_eq!(sampler(10).percent(25), 100);
    }

    #[test]
    fn percent_is_monotonic_and_bounded() {
        let s = sampler(7919);
        let mut last = 0;
        for downloaded in (0..=7919).step_by(13) {
            let p = s.percent(downloaded);
            assert!(p <= 100);
            assert!(p >= last);
            last = p;
        }
        assert_eq!(s.percent(u64::MAX), 100);
    }

    #[test]
    fn zero_elapsed_speed_is_zero() {
        assert_eq!(sampler(1000).speed(500, Duration::ZERO), 0.0);
        assert_eq!(sampler(1000).eta(500, Duration::ZERO), None);
    }

    #[test]
    fn speed_is_reported_in_kilobytes() {
        let s = sampler(10 * 1024);
        let speed = s.speed(4096, Duration::from_secs(2));
        assert!((speed - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn speed_in_bytes() {
        let s = ProgressSampler::for_total(1000, SpeedUnit::BytesPerSecond).unwrap();
        assert!((s.speed(500, Duration::from_millis(500)) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn eta_extrapolates_average_rate() {
        let s = sampler(1000);
        let eta = s.eta(250, Duration::from_secs(1)).unwrap();
        assert_eq!(eta.as_secs(), 3);
    }

    #[test]
    fn speed_formatting() {
        assert_eq!(SpeedUnit::KilobytesPerSecond.format(12.5), "12.50 KB/s");
        assert_eq!(SpeedUnit::BytesPerSecond.format(3.0), "3.00 B/s");
    }
}
