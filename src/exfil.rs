//! This module is responsible for exfilling analyzed frames to disk
//!
//! The [`DataLogger`] owns at most one recording session at a time and the
//! auto-record policy that can start one on its own.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{f_engine::SpectralResult, now_secs, Frame};

pub mod binary;
pub mod container;
pub mod csv;

use self::{binary::BinaryWriter, container::ContainerWriter, csv::CsvWriter};

/// Sessions flush to disk every this many frames
pub const FLUSH_INTERVAL: u64 = 10;
const FILE_PREFIX: &str = "fft_data";

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("A recording is already in progress")]
    AlreadyRecording,
    #[error("No recording in progress")]
    NotRecording,
    #[error("Can't change the log directory while recording")]
    Busy,
    #[error("Failed to create {}: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
    #[error("Failed to write frame: {0}")]
    Write(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Binary,
    Csv,
    Container,
}

impl LogFormat {
    pub fn extension(self) -> &'static str {
        match self {
            LogFormat::Binary => "bin",
            LogFormat::Csv => "csv",
            LogFormat::Container => "zarr",
        }
    }

    /// Lenient parse for user input, anything unrecognized records as binary
    pub fn parse_or_binary(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| {
            warn!(format = s, "Unknown log format, recording as binary");
            LogFormat::Binary
        })
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "bin" => Ok(LogFormat::Binary),
            "csv" => Ok(LogFormat::Csv),
            "container" | "hdf5" | "h5" | "zarr" => Ok(LogFormat::Container),
            _ => Err(format!("Unknown log format `{}`", s)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Binary => write!(f, "binary"),
            LogFormat::Csv => write!(f, "csv"),
            LogFormat::Container => write!(f, "container"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordingStatus {
    pub active: bool,
    pub format: Option<LogFormat>,
    pub filepath: Option<PathBuf>,
    pub frames: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub format: LogFormat,
    pub path: PathBuf,
    pub frames: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AutoRecordSettings {
    pub enabled: bool,
    pub threshold_db: f32,
}

enum Sink {
    Binary(BinaryWriter<io::BufWriter<std::fs::File>>),
    Csv(CsvWriter),
    Container(ContainerWriter),
}

impl Sink {
    fn create(
        format: LogFormat,
        path: &Path,
        fft_size: usize,
        sample_rate: u32,
        start_time: u64,
    ) -> io::Result<Self> {
        Ok(match format {
            LogFormat::Binary => Sink::Binary(BinaryWriter::create(
                path,
                fft_size,
                sample_rate,
                start_time,
            )?),
            LogFormat::Csv => Sink::Csv(CsvWriter::create(path, fft_size, sample_rate, start_time)?),
            LogFormat::Container => Sink::Container(ContainerWriter::create(
                path,
                fft_size,
                sample_rate,
                start_time,
            )?),
        })
    }

    fn write(&mut self, frame: &Frame, result: &SpectralResult) -> io::Result<()> {
        match self {
            Sink::Binary(w) => w.write_frame(frame, result),
            Sink::Csv(w) => w.write_frame(frame, result),
            Sink::Container(w) => w.write_frame(frame, result),
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            Sink::Binary(w) => w.finish(),
            Sink::Csv(w) => w.finish(),
            Sink::Container(w) => w.finish(),
        }
    }
}

struct Session {
    sink: Sink,
    format: LogFormat,
    path: PathBuf,
    frames: u64,
}

pub struct DataLogger {
    directory: PathBuf,
    container_support: bool,
    session: Option<Session>,
    auto: AutoRecordSettings,
    // Armed on enable and by any idle cycle below threshold, cleared by a trigger or a stop
    armed: bool,
}

impl DataLogger {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: normalize_directory(directory.as_ref()),
            container_support: true,
            session: None,
            auto: AutoRecordSettings::default(),
            armed: false,
        }
    }

    pub fn with_container_support(mut self, supported: bool) -> Self {
        self.container_support = supported;
        self
    }

    pub fn supports_container(&self) -> bool {
        self.container_support
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Open a new recording session in `directory`, returning the path being written
    pub fn start(
        &mut self,
        format: LogFormat,
        directory: &Path,
        fft_size: usize,
        sample_rate: u32,
        filename: Option<&str>,
    ) -> Result<&Path, LoggerError> {
        if self.session.is_some() {
            return Err(LoggerError::AlreadyRecording);
        }
        let format = if format == LogFormat::Container && !self.container_support {
            warn!("Container format unavailable, recording as binary");
            LogFormat::Binary
        } else {
            format
        };
        std::fs::create_dir_all(directory).map_err(|source| LoggerError::Create {
            path: directory.to_path_buf(),
            source,
        })?;
        let path = match filename {
            Some(name) => directory.join(name),
            None => unique_path(directory, format),
        };
        let start_time = now_secs();
        let sink = Sink::create(format, &path, fft_size, sample_rate, start_time).map_err(
            |source| LoggerError::Create {
                path: path.clone(),
                source,
            },
        )?;
        info!(%format, path = %path.display(), fft_size, sample_rate, "Recording started");
        let session = self.session.insert(Session {
            sink,
            format,
            path,
            frames: 0,
        });
        Ok(session.path.as_path())
    }

    /// Append one analyzed frame to the open session
    pub fn write(&mut self, frame: &Frame, result: &SpectralResult) -> Result<(), LoggerError> {
        let session = self.session.as_mut().ok_or(LoggerError::NotRecording)?;
        session
            .sink
            .write(frame, result)
            .map_err(LoggerError::Write)?;
        session.frames += 1;
        Ok(())
    }

    /// Close the open session, if any. Also disarms auto-record until the SNR drops again.
    pub fn stop(&mut self) -> Option<SessionSummary> {
        let session = self.session.take()?;
        self.armed = false;
        if let Err(e) = session.sink.finish() {
            warn!(path = %session.path.display(), "Error closing recording - {}", e);
        }
        info!(
            path = %session.path.display(),
            frames = session.frames,
            "Recording stopped"
        );
        Some(SessionSummary {
            format: session.format,
            path: session.path,
            frames: session.frames,
        })
    }

    pub fn set_auto_record(&mut self, enabled: bool, threshold_db: f32) {
        self.auto = AutoRecordSettings {
            enabled,
            threshold_db,
        };
        self.armed = enabled;
        info!(enabled, threshold_db, "Auto-record updated");
    }

    pub fn auto_record(&self) -> AutoRecordSettings {
        self.auto
    }

    /// Start a binary session if the SNR just crossed the auto-record threshold.
    ///
    /// Only considered while idle. Returns whether a session was started.
    pub fn check_auto_trigger(
        &mut self,
        snr_db: f32,
        fft_size: usize,
        sample_rate: u32,
    ) -> Result<bool, LoggerError> {
        if !self.auto.enabled || self.session.is_some() || !snr_db.is_finite() {
            return Ok(false);
        }
        if snr_db < self.auto.threshold_db {
            self.armed = true;
            return Ok(false);
        }
        if !self.armed {
            return Ok(false);
        }
        self.armed = false;
        let directory = self.directory.clone();
        self.start(LogFormat::Binary, &directory, fft_size, sample_rate, None)?;
        info!(snr_db, threshold_db = self.auto.threshold_db, "Auto-record triggered");
        Ok(true)
    }

    pub fn set_directory(&mut self, directory: &str) -> Result<&Path, LoggerError> {
        if self.session.is_some() {
            return Err(LoggerError::Busy);
        }
        self.directory = normalize_directory(Path::new(directory));
        info!(directory = %self.directory.display(), "Log directory updated");
        Ok(self.directory.as_path())
    }

    pub fn status(&self) -> RecordingStatus {
        match &self.session {
            Some(s) => RecordingStatus {
                active: true,
                format: Some(s.format),
                filepath: Some(s.path.clone()),
                frames: s.frames,
            },
            None => RecordingStatus::default(),
        }
    }
}

/// Empty means the working directory, trailing separators are dropped
pub fn normalize_directory(directory: &Path) -> PathBuf {
    let raw = directory.to_string_lossy();
    let trimmed = raw.trim_end_matches(std::path::is_separator);
    if trimmed.is_empty() {
        // All separators means the root
        if raw.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&raw[..1])
        }
    } else {
        PathBuf::from(trimmed)
    }
}

/// Timestamped name in `directory` that doesn't clobber an earlier recording
fn unique_path(directory: &Path, format: LogFormat) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let ext = format.extension();
    let base = format!("{}_{}Z", FILE_PREFIX, stamp);
    let mut path = directory.join(format!("{}.{}", base, ext));
    let mut n = 1;
    while path.exists() {
        path = directory.join(format!("{}_{}.{}", base, n, ext));
        n += 1;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{f_engine::SpectralEngine, synth::sine, PSD_BINS};

    fn analyzed(fft_size: usize) -> (Frame, SpectralResult) {
        let frame = Frame::new(sine(fft_size, 8000, 1000.0, 0.8), 1_700_000_000_000);
        let result = SpectralEngine::new(fft_size, 8000).analyze(&frame);
        (frame, result)
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("CSV".parse::<LogFormat>().unwrap(), LogFormat::Csv);
        assert_eq!("hdf5".parse::<LogFormat>().unwrap(), LogFormat::Container);
        assert_eq!("zarr".parse::<LogFormat>().unwrap(), LogFormat::Container);
        assert_eq!(LogFormat::parse_or_binary("parquet"), LogFormat::Binary);
    }

    #[test]
    fn test_binary_session_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::new(dir.path());
        let (frame, result) = analyzed(512);
        let path = logger
            .start(LogFormat::Binary, dir.path(), 512, 8000, None)
            .unwrap()
            .to_path_buf();
        for _ in 0..25 {
            logger.write(&frame, &result).unwrap();
        }
        assert_eq!(logger.status().frames, 25);
        let summary = logger.stop().unwrap();
        assert_eq!(summary.frames, 25);
        assert_eq!(summary.path, path);
        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, 64 + 25 * (8 + 4 * 512 + 2 * 512 + 4 * PSD_BINS));
    }

    #[test]
    fn test_start_while_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::new(dir.path());
        let (frame, result) = analyzed(512);
        logger
            .start(LogFormat::Binary, dir.path(), 512, 8000, Some("first.bin"))
            .unwrap();
        logger.write(&frame, &result).unwrap();
        let err = logger
            .start(LogFormat::Csv, dir.path(), 512, 8000, Some("second.csv"))
            .unwrap_err();
        assert!(matches!(err, LoggerError::AlreadyRecording));
        let status = logger.status();
        assert_eq!(status.frames, 1);
        assert_eq!(status.format, Some(LogFormat::Binary));
        assert!(!dir.path().join("second.csv").exists());
    }

    #[test]
    fn test_write_while_idle() {
        let mut logger = DataLogger::new(".");
        let (frame, result) = analyzed(512);
        assert!(matches!(
            logger.write(&frame, &result),
            Err(LoggerError::NotRecording)
        ));
        assert!(logger.stop().is_none());
    }

    #[test]
    fn test_create_failure_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let mut logger = DataLogger::new(&blocker);
        let err = logger
            .start(LogFormat::Binary, &blocker, 512, 8000, None)
            .unwrap_err();
        assert!(matches!(err, LoggerError::Create { .. }));
        assert!(!logger.is_recording());
    }

    #[test]
    fn test_names_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::new(dir.path());
        let first = logger
            .start(LogFormat::Csv, dir.path(), 512, 8000, None)
            .unwrap()
            .to_path_buf();
        logger.stop();
        let second = logger
            .start(LogFormat::Csv, dir.path(), 512, 8000, None)
            .unwrap()
            .to_path_buf();
        logger.stop();
        assert_ne!(first, second);
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("fft_data_") && name.ends_with("Z.csv"), "{}", name);
    }

    #[test]
    fn test_auto_trigger_fires_once_per_crossing() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::new(dir.path());
        logger.set_auto_record(true, 20.0);
        let fired: Vec<bool> = [5.0, 10.0, 25.0, 30.0, 28.0]
            .iter()
            .map(|snr| logger.check_auto_trigger(*snr, 512, 8000).unwrap())
            .collect();
        assert_eq!(fired, vec![false, false, true, false, false]);
        assert_eq!(logger.status().format, Some(LogFormat::Binary));

        // A manual stop doesn't immediately restart while the SNR stays high
        logger.stop();
        assert!(!logger.check_auto_trigger(30.0, 512, 8000).unwrap());
        assert!(!logger.check_auto_trigger(5.0, 512, 8000).unwrap());
        assert!(logger.check_auto_trigger(25.0, 512, 8000).unwrap());
        logger.stop();
    }

    #[test]
    fn test_auto_trigger_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::new(dir.path());
        assert!(!logger.check_auto_trigger(99.0, 512, 8000).unwrap());
        logger.set_auto_record(true, 20.0);
        assert!(!logger.check_auto_trigger(f32::NAN, 512, 8000).unwrap());
        logger.set_auto_record(false, 20.0);
        assert!(!logger.check_auto_trigger(25.0, 512, 8000).unwrap());
        assert!(!logger.is_recording());
    }

    #[test]
    fn test_directory_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::new("logs/");
        assert_eq!(logger.directory(), Path::new("logs"));
        assert_eq!(logger.set_directory("").unwrap(), Path::new("."));
        assert_eq!(logger.set_directory("/").unwrap(), Path::new("/"));
        logger
            .start(LogFormat::Binary, dir.path(), 512, 8000, None)
            .unwrap();
        assert!(matches!(
            logger.set_directory("elsewhere"),
            Err(LoggerError::Busy)
        ));
        logger.stop();
        assert!(logger.set_directory("elsewhere").is_ok());
    }

    #[test]
    fn test_container_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::new(dir.path()).with_container_support(false);
        assert!(!logger.supports_container());
        let path = logger
            .start(LogFormat::Container, dir.path(), 512, 8000, None)
            .unwrap()
            .to_path_buf();
        assert_eq!(logger.status().format, Some(LogFormat::Binary));
        assert_eq!(path.extension().unwrap(), "bin");
        logger.stop();
    }

    #[test]
    fn test_csv_session_in_current_directory() {
        let dir = tempfile::tempdir().unwrap();
        let previous = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let mut logger = DataLogger::new("");
        assert_eq!(logger.directory(), Path::new("."));
        let (frame, result) = analyzed(512);
        let path = logger
            .start(LogFormat::Csv, Path::new("."), 512, 8000, None)
            .unwrap()
            .to_path_buf();
        logger.write(&frame, &result).unwrap();
        let summary = logger.stop().unwrap();
        std::env::set_current_dir(previous).unwrap();

        assert_eq!(summary.frames, 1);
        assert_eq!(path.parent().unwrap(), Path::new("."));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("fft_data_") && name.ends_with(".csv"), "{}", name);
        let text = std::fs::read_to_string(dir.path().join(name)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "# fftSize: 512");
        assert!(lines[4].starts_with("1700000000000,"));
    }
}
