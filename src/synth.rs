//! Built-in test waveforms, used whenever we aren't (or can't be) reading from the network

use std::f32::consts::PI;

use rand::prelude::*;

/// The acquisition modes the control surface can select between.
/// Mode 0 reads from the network, everything else is synthesized.
pub const MODE_NAMES: [&str; 12] = [
    "Network Input",
    "440 Hz Sine",
    "1000 Hz Sine",
    "2000 Hz Sine",
    "Mixed Tones",
    "Frequency Sweep",
    "White Noise",
    "Impulse Train",
    "LFM Chirp",
    "Sinc Function",
    "IQ LFM Chirp",
    "Signal + Noise",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    NetworkInput,
    Sine440,
    Sine1k,
    Sine2k,
    Mixed,
    Sweep,
    Noise,
    Impulse,
    Lfm,
    Sinc,
    IqLfm,
    SignalNoise,
}

impl Mode {
    pub const ALL: [Mode; 12] = [
        Mode::NetworkInput,
        Mode::Sine440,
        Mode::Sine1k,
        Mode::Sine2k,
        Mode::Mixed,
        Mode::Sweep,
        Mode::Noise,
        Mode::Impulse,
        Mode::Lfm,
        Mode::Sinc,
        Mode::IqLfm,
        Mode::SignalNoise,
    ];

    /// Look up a mode by its index in the mode table, `None` if out of range
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        MODE_NAMES[self.index()]
    }
}

/// Plain sine, `len` samples starting at phase zero
pub fn sine(len: usize, sample_rate: u32, freq: f32, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
        .collect()
}

// Chirps run from 500 Hz to 2.5 kHz over two seconds
const LFM_START_HZ: f32 = 500.0;
const LFM_END_HZ: f32 = 2500.0;
const LFM_SWEEP_SECS: f32 = 2.0;
const LFM_CENTRE_HZ: f32 = 1500.0;

const SWEEP_START_HZ: f32 = 100.0;
const SWEEP_END_HZ: f32 = 3000.0;
const SWEEP_STEP_HZ: f32 = 2.0;

/// Phase-continuous generator state for the waveforms that evolve across frames
#[derive(Debug, Clone)]
struct Oscillator {
    phase: f32,
    freq: f32,
}

pub struct Synthesizer {
    sample_rate: u32,
    sweep: Oscillator,
    lfm: Oscillator,
    iq_lfm: Oscillator,
    rng: StdRng,
}

impl Synthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_rng(sample_rate, StdRng::from_entropy())
    }

    /// Seeded generator, so noise modes are reproducible
    pub fn seeded(sample_rate: u32, seed: u64) -> Self {
        Self::with_rng(sample_rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(sample_rate: u32, rng: StdRng) -> Self {
        Self {
            sample_rate,
            sweep: Oscillator {
                phase: 0.0,
                freq: SWEEP_START_HZ,
            },
            lfm: Oscillator {
                phase: 0.0,
                freq: LFM_START_HZ,
            },
            iq_lfm: Oscillator {
                phase: 0.0,
                freq: LFM_START_HZ,
            },
            rng,
        }
    }

    /// Fill `buf` with one frame of the given mode.
    /// `NetworkInput` has nothing to synthesize, so it falls back to the 440 Hz tone.
    pub fn fill(&mut self, mode: Mode, buf: &mut [f32]) {
        let fs = self.sample_rate as f32;
        match mode {
            Mode::NetworkInput | Mode::Sine440 => self.fill_sine(buf, 440.0, 0.8),
            Mode::Sine1k => self.fill_sine(buf, 1000.0, 0.8),
            Mode::Sine2k => self.fill_sine(buf, 2000.0, 0.8),
            Mode::Mixed => {
                for (i, s) in buf.iter_mut().enumerate() {
                    let t = i as f32 / fs;
                    *s = 0.3 * (2.0 * PI * 440.0 * t).sin()
                        + 0.2 * (2.0 * PI * 880.0 * t).sin()
                        + 0.15 * (2.0 * PI * 1320.0 * t).sin();
                }
            }
            Mode::Sweep => {
                let osc = &mut self.sweep;
                for s in buf.iter_mut() {
                    *s = 0.5 * osc.phase.sin();
                    osc.phase = (osc.phase + 2.0 * PI * osc.freq / fs) % (2.0 * PI);
                    osc.freq += SWEEP_STEP_HZ;
                    if osc.freq > SWEEP_END_HZ {
                        osc.freq = SWEEP_START_HZ;
                    }
                }
            }
            Mode::Noise => buf
                .iter_mut()
                .for_each(|s| *s = self.rng.gen_range(-1.0f32..=1.0)),
            Mode::Impulse => {
                buf.fill(0.0);
                let spacing = (self.sample_rate as usize / 100).max(1);
                buf.iter_mut().step_by(spacing).for_each(|s| *s = 1.0);
            }
            Mode::Lfm => {
                let step = lfm_step(fs);
                let osc = &mut self.lfm;
                for s in buf.iter_mut() {
                    *s = 0.8 * osc.phase.sin();
                    advance_chirp(osc, step, fs);
                }
            }
            Mode::Sinc => {
                let centre = buf.len() / 2;
                for (i, s) in buf.iter_mut().enumerate() {
                    let t = (i as f32 - centre as f32) / fs;
                    let x = 2.0 * PI * 1000.0 * t;
                    *s = if x.abs() < 1e-6 { 0.8 } else { 0.8 * x.sin() / x };
                }
            }
            Mode::IqLfm => {
                // Upper chirp plus its mirror about the centre frequency
                let step = lfm_step(fs);
                let osc = &mut self.iq_lfm;
                for (i, s) in buf.iter_mut().enumerate() {
                    let mirror = -osc.phase + 2.0 * PI * LFM_CENTRE_HZ * i as f32 / fs;
                    *s = 0.4 * (osc.phase.sin() + mirror.sin());
                    advance_chirp(osc, step, fs);
                }
            }
            Mode::SignalNoise => {
                for (i, s) in buf.iter_mut().enumerate() {
                    let t = i as f32 / fs;
                    let signal = 0.5 * (2.0 * PI * 1000.0 * t).sin();
                    // Box-Muller
                    let u1: f32 = self.rng.gen();
                    let u2: f32 = self.rng.gen();
                    let noise = 0.3 * (-2.0 * (u1 + 1e-10).ln()).sqrt() * (2.0 * PI * u2).cos();
                    *s = signal + noise;
                }
            }
        }
    }

    fn fill_sine(&self, buf: &mut [f32], freq: f32, amplitude: f32) {
        let fs = self.sample_rate as f32;
        for (i, s) in buf.iter_mut().enumerate() {
            *s = amplitude * (2.0 * PI * freq * i as f32 / fs).sin();
        }
    }
}

fn lfm_step(fs: f32) -> f32 {
    (LFM_END_HZ - LFM_START_HZ) / (LFM_SWEEP_SECS * fs)
}

fn advance_chirp(osc: &mut Oscillator, step: f32, fs: f32) {
    osc.phase += 2.0 * PI * osc.freq / fs;
    osc.freq += step;
    if osc.freq > LFM_END_HZ {
        osc.freq = LFM_START_HZ;
    }
    if osc.phase > 2.0 * PI {
        osc.phase -= 2.0 * PI;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_table() {
        assert_eq!(Mode::ALL.len(), MODE_NAMES.len());
        for (i, mode) in Mode::ALL.iter().enumerate() {
            assert_eq!(mode.index(), i);
        }
        assert_eq!(Mode::from_index(2), Some(Mode::Sine1k));
        assert_eq!(Mode::from_index(2).unwrap().name(), "1000 Hz Sine");
        assert_eq!(Mode::from_index(12), None);
        assert_eq!(Mode::from_index(99), None);
    }

    #[test]
    fn test_every_mode_is_bounded() {
        let mut synth = Synthesizer::seeded(8000, 7);
        let mut buf = vec![0f32; 512];
        for mode in Mode::ALL {
            synth.fill(mode, &mut buf);
            assert!(buf.iter().all(|s| s.is_finite()), "{:?}", mode);
            assert!(buf.iter().any(|s| *s != 0.0), "{:?} is silent", mode);
        }
    }

    #[test]
    fn test_impulse_spacing() {
        let mut synth = Synthesizer::seeded(8000, 0);
        let mut buf = vec![0f32; 512];
        synth.fill(Mode::Impulse, &mut buf);
        let ones: Vec<usize> = buf
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == 1.0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(ones, vec![0, 80, 160, 240, 320, 400, 480]);
    }

    #[test]
    fn test_sweep_is_phase_continuous() {
        let mut synth = Synthesizer::seeded(8000, 0);
        let mut a = vec![0f32; 512];
        let mut b = vec![0f32; 512];
        synth.fill(Mode::Sweep, &mut a);
        synth.fill(Mode::Sweep, &mut b);
        // The second frame carries on from where the first left off
        assert_ne!(a, b);
        assert!((a[511] - b[0]).abs() < 0.5);
    }
}
