//! In this module, we implement all the monitoring and control logic.
//!
//! The orchestrator publishes a [`Snapshot`] of the latest analysis once per cycle,
//! which any number of readers can grab without blocking acquisition.
//! Everything that changes state goes the other way as a [`Command`] over a
//! bounded channel, to be drained by the orchestrator between frames.

use std::{path::PathBuf, sync::Arc, time::Duration};

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    exfil::{AutoRecordSettings, LogFormat, LoggerError, RecordingStatus},
    synth::Mode,
    NUM_BANDS,
};

pub mod api;

/// How many commands can be waiting on the orchestrator
pub const COMMAND_CAPACITY: usize = 64;
/// How long a control request waits for the orchestrator to answer
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub fft_size: usize,
    pub sample_rate: u32,
    pub num_bands: usize,
    pub time_domain: Vec<f32>,
    pub magnitude: Vec<f32>,
    pub psd: Vec<f32>,
    pub band_energies: [f32; NUM_BANDS],
    pub snr_db: f32,
    pub mode: &'static str,
    pub mode_index: usize,
    pub paused: bool,
    /// Capture time of the frame these results came from (ms since epoch)
    pub timestamp: u64,
    /// Number of completed orchestrator cycles
    pub cycle: u64,
    pub recording: RecordingStatus,
    pub auto_record: AutoRecordSettings,
    pub log_directory: PathBuf,
    pub logging_available: bool,
    pub container_supported: bool,
}

impl Snapshot {
    /// What readers see before the first cycle completes
    pub fn initial(fft_size: usize, sample_rate: u32) -> Self {
        Self {
            fft_size,
            sample_rate,
            num_bands: NUM_BANDS,
            time_domain: vec![0f32; fft_size],
            magnitude: vec![0f32; fft_size / 2],
            psd: vec![0f32; crate::PSD_BINS],
            band_energies: [0f32; NUM_BANDS],
            snr_db: 0.0,
            mode: Mode::NetworkInput.name(),
            mode_index: 0,
            paused: false,
            timestamp: 0,
            cycle: 0,
            recording: RecordingStatus::default(),
            auto_record: AutoRecordSettings::default(),
            log_directory: PathBuf::from("."),
            logging_available: false,
            container_supported: false,
        }
    }
}

/// Single writer, many readers. Readers get the whole snapshot or nothing.
pub struct SnapshotCell(RwLock<Arc<Snapshot>>);

impl SnapshotCell {
    pub fn new(initial: Snapshot) -> Self {
        Self(RwLock::new(Arc::new(initial)))
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.0.read().clone()
    }

    pub fn store(&self, snapshot: Snapshot) {
        *self.0.write() = Arc::new(snapshot);
    }
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control queue is full, try again")]
    Busy,
    #[error("Acquisition loop is not running")]
    Unavailable,
    #[error("Timed out waiting for the acquisition loop")]
    Timeout,
    #[error("Mode {0} is out of range")]
    InvalidMode(usize),
    #[error("No data logger configured")]
    NoLogger,
    #[error(transparent)]
    Logger(#[from] LoggerError),
}

pub type Reply<T> = oneshot::Sender<Result<T, ControlError>>;

/// Requests for the orchestrator, each with a channel for the answer
#[derive(Debug)]
pub enum Command {
    SetMode(usize, Reply<()>),
    TogglePause(Reply<bool>),
    StartLog(LogFormat, Reply<RecordingStatus>),
    StopLog(Reply<RecordingStatus>),
    /// Stop if recording, otherwise start a binary session
    ToggleLog(Reply<RecordingStatus>),
    SetAutoRecord {
        enabled: bool,
        threshold_db: f32,
        reply: Reply<AutoRecordSettings>,
    },
    SetLogDirectory(String, Reply<PathBuf>),
}

impl Command {
    /// The requester stopped waiting for an answer (timed out or went away)
    pub fn is_abandoned(&self) -> bool {
        match self {
            Command::SetMode(_, reply) => reply.is_closed(),
            Command::TogglePause(reply) => reply.is_closed(),
            Command::StartLog(_, reply) | Command::StopLog(reply) | Command::ToggleLog(reply) => {
                reply.is_closed()
            }
            Command::SetAutoRecord { reply, .. } => reply.is_closed(),
            Command::SetLogDirectory(_, reply) => reply.is_closed(),
        }
    }
}

/// The control surface's view of the orchestrator
#[derive(Clone)]
pub struct ControlHandle {
    commands: Sender<Command>,
    snapshot: Arc<SnapshotCell>,
    timeout: Duration,
}

impl ControlHandle {
    pub fn new(commands: Sender<Command>, snapshot: Arc<SnapshotCell>) -> Self {
        Self {
            commands,
            snapshot,
            timeout: REPLY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.commands.try_send(command(tx)).map_err(|e| match e {
            TrySendError::Full(_) => ControlError::Busy,
            TrySendError::Disconnected(_) => ControlError::Unavailable,
        })?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            // Orchestrator dropped the reply, it's shutting down
            Ok(Err(_)) => Err(ControlError::Unavailable),
            Err(_) => Err(ControlError::Timeout),
        }
    }

    /// Select a mode for the next cycle
    pub async fn set_mode(&self, index: usize) -> Result<Mode, ControlError> {
        let mode = Mode::from_index(index).ok_or(ControlError::InvalidMode(index))?;
        self.request(|r| Command::SetMode(index, r)).await?;
        Ok(mode)
    }

    /// Returns the new paused state
    pub async fn toggle_pause(&self) -> Result<bool, ControlError> {
        self.request(Command::TogglePause).await
    }

    pub async fn start_log(&self, format: LogFormat) -> Result<RecordingStatus, ControlError> {
        self.request(|r| Command::StartLog(format, r)).await
    }

    pub async fn stop_log(&self) -> Result<RecordingStatus, ControlError> {
        self.request(Command::StopLog).await
    }

    pub async fn toggle_log(&self) -> Result<RecordingStatus, ControlError> {
        self.request(Command::ToggleLog).await
    }

    pub async fn set_auto_record(
        &self,
        enabled: bool,
        threshold_db: f32,
    ) -> Result<AutoRecordSettings, ControlError> {
        self.request(|reply| Command::SetAutoRecord {
            enabled,
            threshold_db,
            reply,
        })
        .await
    }

    pub async fn set_log_directory(&self, directory: String) -> Result<PathBuf, ControlError> {
        self.request(|r| Command::SetLogDirectory(directory, r)).await
    }

    fn logging_snapshot(&self) -> Result<Arc<Snapshot>, ControlError> {
        let snapshot = self.snapshot();
        if snapshot.logging_available {
            Ok(snapshot)
        } else {
            Err(ControlError::NoLogger)
        }
    }

    pub fn recording_status(&self) -> Result<RecordingStatus, ControlError> {
        Ok(self.logging_snapshot()?.recording.clone())
    }

    pub fn auto_record(&self) -> Result<AutoRecordSettings, ControlError> {
        Ok(self.logging_snapshot()?.auto_record)
    }

    pub fn log_directory(&self) -> Result<PathBuf, ControlError> {
        Ok(self.logging_snapshot()?.log_directory.clone())
    }
}
