//! The acquisition loop that ties everything together.
//!
//! One cooperative loop owns the sample source, the F-engine and the data logger.
//! Each cycle it acquires a frame, analyzes it, publishes a snapshot, drains
//! control commands and finally feeds the logger. Commands only ever change
//! state between frames.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::Receiver;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    capture::SampleSource,
    exfil::{DataLogger, LogFormat, RecordingStatus},
    f_engine::{SpectralEngine, SpectralResult},
    monitoring::{Command, ControlError, Snapshot, SnapshotCell},
    now_ms,
    synth::{Mode, Synthesizer},
    Frame, MIN_FFT_SIZE, NUM_BANDS,
};

/// Upper bound on commands handled between two frames
pub const MAX_COMMANDS_PER_CYCLE: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("FFT size must be a power of two of at least 384, got {0}")]
    FftSize(usize),
    #[error("Sample rate must be nonzero")]
    SampleRate,
    #[error("Cycle period must be nonzero")]
    Period,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub fft_size: usize,
    pub sample_rate: u32,
    pub period: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fft_size: crate::DEFAULT_FFT_SIZE,
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            period: Duration::from_millis(50),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fft_size < MIN_FFT_SIZE || !self.fft_size.is_power_of_two() {
            return Err(ConfigError::FftSize(self.fft_size));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::SampleRate);
        }
        if self.period.is_zero() {
            return Err(ConfigError::Period);
        }
        Ok(())
    }
}

/// Everything the control surface can change, as seen by the loop
#[derive(Debug, Clone)]
pub struct ControlState {
    pub current_mode: Mode,
    /// Requested mode index, applied (if valid) at the start of the next cycle
    pub pending_mode: Option<usize>,
    pub paused: bool,
    pub log_directory: PathBuf,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    source: Option<Box<dyn SampleSource>>,
    synth: Synthesizer,
    engine: SpectralEngine,
    logger: Option<DataLogger>,
    state: ControlState,
    commands: Receiver<Command>,
    snapshot: Arc<SnapshotCell>,
    frame: Frame,
    result: SpectralResult,
    cycle: u64,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        source: Option<Box<dyn SampleSource>>,
        logger: Option<DataLogger>,
        commands: Receiver<Command>,
        snapshot: Arc<SnapshotCell>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let current_mode = if source.is_some() {
            Mode::NetworkInput
        } else {
            Mode::Sine440
        };
        let log_directory = logger
            .as_ref()
            .map_or_else(|| PathBuf::from("."), |l| l.directory().to_path_buf());
        Ok(Self {
            synth: Synthesizer::new(config.sample_rate),
            engine: SpectralEngine::new(config.fft_size, config.sample_rate),
            frame: Frame::zeroed(config.fft_size),
            result: SpectralResult::empty(config.fft_size),
            state: ControlState {
                current_mode,
                pending_mode: None,
                paused: false,
                log_directory,
            },
            config,
            source,
            logger,
            commands,
            snapshot,
            cycle: 0,
        })
    }

    /// Swap in a different waveform generator (e.g. a seeded one)
    pub fn with_synthesizer(mut self, synth: Synthesizer) -> Self {
        self.synth = synth;
        self
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn logger(&self) -> Option<&DataLogger> {
        self.logger.as_ref()
    }

    /// Run one full cycle
    pub fn step(&mut self) {
        self.cycle += 1;
        self.apply_pending_mode();
        // Paused cycles keep the held frame and result for the remaining steps
        if !self.state.paused {
            self.acquire();
            self.result = self.engine.analyze(&self.frame);
        }
        self.publish();
        self.drain_commands();
        self.auto_trigger();
        self.record();
    }

    /// Cycle at the configured period until `running` clears, then close any recording
    pub fn run(&mut self, running: &AtomicBool) {
        info!(
            fft_size = self.config.fft_size,
            sample_rate = self.config.sample_rate,
            period_ms = self.config.period.as_millis() as u64,
            "Starting acquisition loop"
        );
        let mut deadline = Instant::now();
        while running.load(Ordering::Acquire) {
            self.step();
            deadline += self.config.period;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            } else {
                // Overran, don't try to catch up with a burst of cycles
                debug!(cycle = self.cycle, "Cycle overran its period");
                deadline = now;
            }
        }
        if let Some(logger) = self.logger.as_mut() {
            logger.stop();
        }
        info!(cycles = self.cycle, "Acquisition loop stopped");
    }

    fn apply_pending_mode(&mut self) {
        let Some(index) = self.state.pending_mode.take() else {
            return;
        };
        match Mode::from_index(index) {
            Some(mode) => {
                if mode != self.state.current_mode {
                    info!(mode = mode.name(), "Mode changed");
                }
                self.state.current_mode = mode;
            }
            None => debug!(index, "Ignoring out of range mode"),
        }
    }

    fn acquire(&mut self) {
        let mode = self.state.current_mode;
        let samples = &mut self.frame.samples;
        match (mode, self.source.as_mut()) {
            (Mode::NetworkInput, Some(source)) => {
                if let Err(e) = source.read_frame(samples) {
                    warn!(
                        source = %source.describe(),
                        "Network read failed, falling back to {} - {}",
                        Mode::Sine440.name(),
                        e
                    );
                    self.state.current_mode = Mode::Sine440;
                    self.synth.fill(Mode::Sine440, samples);
                }
            }
            _ => self.synth.fill(mode, samples),
        }
        self.frame.timestamp_ms = now_ms();
    }

    fn publish(&self) {
        let (recording, auto_record, container_supported) = match &self.logger {
            Some(l) => (l.status(), l.auto_record(), l.supports_container()),
            None => (RecordingStatus::default(), Default::default(), false),
        };
        self.snapshot.store(Snapshot {
            fft_size: self.config.fft_size,
            sample_rate: self.config.sample_rate,
            num_bands: NUM_BANDS,
            time_domain: self.frame.samples.clone(),
            magnitude: self.result.magnitude.clone(),
            psd: self.result.psd.clone(),
            band_energies: self.result.band_energies,
            snr_db: self.result.snr_db,
            mode: self.state.current_mode.name(),
            mode_index: self.state.current_mode.index(),
            paused: self.state.paused,
            timestamp: self.frame.timestamp_ms,
            cycle: self.cycle,
            recording,
            auto_record,
            log_directory: self.state.log_directory.clone(),
            logging_available: self.logger.is_some(),
            container_supported,
        });
    }

    fn drain_commands(&mut self) {
        let pending: Vec<Command> = self
            .commands
            .try_iter()
            .take(MAX_COMMANDS_PER_CYCLE)
            .collect();
        for command in pending {
            self.handle(command);
        }
    }

    fn handle(&mut self, command: Command) {
        // The requester already gave up and reported a failure
        if command.is_abandoned() {
            debug!(?command, "Dropping abandoned command");
            return;
        }
        // A dropped reply just means the requester gave up waiting
        match command {
            Command::SetMode(index, reply) => {
                self.state.pending_mode = Some(index);
                let result = Mode::from_index(index)
                    .map(|_| ())
                    .ok_or(ControlError::InvalidMode(index));
                let _ = reply.send(result);
            }
            Command::TogglePause(reply) => {
                self.state.paused = !self.state.paused;
                info!(paused = self.state.paused, "Pause toggled");
                let _ = reply.send(Ok(self.state.paused));
            }
            Command::StartLog(format, reply) => {
                let _ = reply.send(self.start_log(format));
            }
            Command::StopLog(reply) => {
                let _ = reply.send(self.logger_mut().map(|l| {
                    l.stop();
                    l.status()
                }));
            }
            Command::ToggleLog(reply) => {
                let result = match self.logger.as_ref().map(DataLogger::is_recording) {
                    Some(true) => self.logger_mut().map(|l| {
                        l.stop();
                        l.status()
                    }),
                    _ => self.start_log(LogFormat::Binary),
                };
                let _ = reply.send(result);
            }
            Command::SetAutoRecord {
                enabled,
                threshold_db,
                reply,
            } => {
                let _ = reply.send(self.logger_mut().map(|l| {
                    l.set_auto_record(enabled, threshold_db);
                    l.auto_record()
                }));
            }
            Command::SetLogDirectory(directory, reply) => {
                let result = self.logger_mut().and_then(|l| {
                    l.set_directory(&directory)
                        .map(|p| p.to_path_buf())
                        .map_err(ControlError::from)
                });
                if let Ok(path) = &result {
                    self.state.log_directory = path.clone();
                }
                let _ = reply.send(result);
            }
        }
    }

    fn logger_mut(&mut self) -> Result<&mut DataLogger, ControlError> {
        self.logger.as_mut().ok_or(ControlError::NoLogger)
    }

    fn start_log(&mut self, format: LogFormat) -> Result<RecordingStatus, ControlError> {
        let logger = self.logger.as_mut().ok_or(ControlError::NoLogger)?;
        logger.start(
            format,
            &self.state.log_directory,
            self.config.fft_size,
            self.config.sample_rate,
            None,
        )?;
        Ok(logger.status())
    }

    fn auto_trigger(&mut self) {
        let Some(logger) = self.logger.as_mut() else {
            return;
        };
        if let Err(e) = logger.check_auto_trigger(
            self.result.snr_db,
            self.config.fft_size,
            self.config.sample_rate,
        ) {
            warn!("Auto-record failed to start - {}", e);
        }
    }

    fn record(&mut self) {
        let Some(logger) = self.logger.as_mut() else {
            return;
        };
        if !logger.is_recording() {
            return;
        }
        if let Err(e) = logger.write(&self.frame, &self.result) {
            warn!("Dropped frame from recording - {}", e);
        }
    }
}
