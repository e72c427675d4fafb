pub mod capture;
pub mod exfil;
pub mod f_engine;
pub mod monitoring;
pub mod orchestrator;
pub mod synth;

use chrono::Utc;

pub const DEFAULT_FFT_SIZE: usize = 512;
pub const DEFAULT_SAMPLE_RATE: u32 = 8000;
/// Number of output bins of the Welch PSD, independent of the frame size
pub const PSD_BINS: usize = 128;
pub const NUM_BANDS: usize = 8;
/// Smallest frame that fits two overlapping Welch segments
pub const MIN_FFT_SIZE: usize = 384;

/// One block of time-domain samples, tagged with its capture time
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub samples: Vec<f32>,
    pub timestamp_ms: u64,
}

impl Frame {
    pub fn new(samples: Vec<f32>, timestamp_ms: u64) -> Self {
        Self {
            samples,
            timestamp_ms,
        }
    }

    /// A silent frame stamped with the current time
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0f32; len], now_ms())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Seconds since the unix epoch
pub fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
