//! The F-engine: turns one frame of time-domain samples into spectra.
//!
//! For each frame we compute
//! * the magnitude spectrum (first F/2 bins of an unwindowed FFT)
//! * a Welch PSD estimate with 256 sample segments at 50% overlap
//! * RMS energy in eight fixed bands
//! * a peak-to-noise-floor SNR estimate
//!
//! The results only depend on the input samples. The engine holds the planned
//! FFTs and scratch space so the cycle loop doesn't replan every frame.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::{Frame, NUM_BANDS, PSD_BINS};

/// Length of each Welch segment
pub const WELCH_SEGMENT: usize = 2 * PSD_BINS;
/// Hop between segments (50% overlap)
pub const WELCH_STRIDE: usize = WELCH_SEGMENT / 2;
/// Band edges in Hz, band `i` spans `[BAND_EDGES_HZ[i], BAND_EDGES_HZ[i + 1]]`
pub const BAND_EDGES_HZ: [f32; NUM_BANDS + 1] =
    [0.0, 200.0, 400.0, 600.0, 800.0, 1200.0, 1600.0, 2400.0, 4000.0];

const EPSILON: f32 = 1e-10;
// Bins on either side of the peak that don't count towards the noise floor
const PEAK_EXCLUSION_BINS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralResult {
    /// |X[i]| for i in [0, F/2)
    pub magnitude: Vec<f32>,
    /// Welch PSD in dB, always `PSD_BINS` long
    pub psd: Vec<f32>,
    pub band_energies: [f32; NUM_BANDS],
    pub snr_db: f32,
}

impl SpectralResult {
    /// The result of analyzing nothing, used before the first frame arrives
    pub fn empty(fft_size: usize) -> Self {
        Self {
            magnitude: vec![0f32; fft_size / 2],
            psd: vec![0f32; PSD_BINS],
            band_energies: [0f32; NUM_BANDS],
            snr_db: 0.0,
        }
    }
}

pub struct SpectralEngine {
    fft_size: usize,
    sample_rate: u32,
    fft: Arc<dyn Fft<f32>>,
    segment_fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    segment_buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectralEngine {
    pub fn new(fft_size: usize, sample_rate: u32) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let segment_fft = planner.plan_fft_forward(WELCH_SEGMENT);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(segment_fft.get_inplace_scratch_len());
        Self {
            fft_size,
            sample_rate,
            fft,
            segment_fft,
            buffer: vec![Complex::default(); fft_size],
            segment_buffer: vec![Complex::default(); WELCH_SEGMENT],
            scratch: vec![Complex::default(); scratch_len],
        }
    }

    /// Run the full analysis on a frame of exactly `fft_size` samples
    pub fn analyze(&mut self, frame: &Frame) -> SpectralResult {
        let magnitude = self.magnitude(&frame.samples);
        let psd = self.welch_psd(&frame.samples);
        let band_energies = band_energies(&magnitude, self.fft_size, self.sample_rate);
        let snr_db = snr_db(&magnitude);
        SpectralResult {
            magnitude,
            psd,
            band_energies,
            snr_db,
        }
    }

    /// Magnitude of the first F/2 bins of the FFT of `samples`
    pub fn magnitude(&mut self, samples: &[f32]) -> Vec<f32> {
        debug_assert_eq!(samples.len(), self.fft_size, "Frame length must match the FFT size");
        let mut output = vec![0f32; self.fft_size / 2];
        magnitude_into(
            self.fft.as_ref(),
            samples,
            &mut self.buffer,
            &mut self.scratch,
            &mut output,
        );
        output
    }

    /// Welch estimate of the power spectral density, in dB
    pub fn welch_psd(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut accumulated = [0f32; PSD_BINS];
        let mut segment_mag = [0f32; PSD_BINS];
        let mut segments = 0usize;
        for segment in samples.windows(WELCH_SEGMENT).step_by(WELCH_STRIDE) {
            magnitude_into(
                self.segment_fft.as_ref(),
                segment,
                &mut self.segment_buffer,
                &mut self.scratch,
                &mut segment_mag,
            );
            accumulated
                .iter_mut()
                .zip(segment_mag.iter())
                .for_each(|(acc, m)| *acc += m * m);
            segments += 1;
        }
        let norm = (WELCH_SEGMENT * WELCH_SEGMENT) as f32;
        accumulated
            .iter()
            .map(|&acc| {
                let power = if segments == 0 {
                    0.0
                } else {
                    acc / segments as f32 / norm
                };
                10.0 * (power + EPSILON).log10()
            })
            .collect()
    }
}

/// Forward FFT of a real input, writing |X[i]| into `output` (which may be shorter than the input)
fn magnitude_into(
    fft: &dyn Fft<f32>,
    input: &[f32],
    buffer: &mut [Complex<f32>],
    scratch: &mut [Complex<f32>],
    output: &mut [f32],
) {
    buffer
        .iter_mut()
        .zip(input)
        .for_each(|(b, &s)| *b = Complex::new(s, 0.0));
    fft.process_with_scratch(buffer, scratch);
    output
        .iter_mut()
        .zip(buffer.iter())
        .for_each(|(o, b)| *o = b.norm());
}

fn freq_to_bin(freq: f32, fft_size: usize, sample_rate: u32) -> usize {
    // Float to int casts saturate, so negative frequencies land on bin 0
    (freq * fft_size as f32 / sample_rate as f32) as usize
}

/// RMS magnitude within each of the fixed bands.
///
/// Band edges are mapped to bins with `floor(freq * F / fs)` and clamped to the
/// last magnitude bin, so bands above Nyquist collapse onto the top bin.
pub fn band_energies(magnitude: &[f32], fft_size: usize, sample_rate: u32) -> [f32; NUM_BANDS] {
    let mut energies = [0f32; NUM_BANDS];
    if magnitude.is_empty() || sample_rate == 0 {
        return energies;
    }
    let top = magnitude.len() - 1;
    for (band, edges) in BAND_EDGES_HZ.windows(2).enumerate() {
        let low = freq_to_bin(edges[0], fft_size, sample_rate).min(top);
        let high = freq_to_bin(edges[1], fft_size, sample_rate).min(top);
        if low > high {
            continue;
        }
        let bins = &magnitude[low..=high];
        let power: f32 = bins.iter().map(|m| m * m).sum();
        energies[band] = (power / bins.len() as f32).sqrt();
    }
    energies
}

/// Ratio of the spectral peak (DC excluded) to the mean of the bins away from it, in dB
pub fn snr_db(magnitude: &[f32]) -> f32 {
    if magnitude.len() < 2 {
        return 0.0;
    }
    let (peak_bin, peak) = magnitude
        .iter()
        .enumerate()
        .skip(1)
        .fold((0usize, 0f32), |best, (i, &m)| if m > best.1 { (i, m) } else { best });
    let (noise_sum, noise_count) = magnitude
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(i, _)| i.abs_diff(peak_bin) > PEAK_EXCLUSION_BINS)
        .fold((0f32, 0usize), |(sum, n), (_, &m)| (sum + m, n + 1));
    let noise = if noise_count > 0 {
        noise_sum / noise_count as f32
    } else {
        EPSILON
    };
    20.0 * (peak / (noise + EPSILON) + EPSILON).log10()
}
