//! Summarized recording, one row of per-frame statistics

use std::{
    fs::File,
    io::{self, Write},
    path::Path,
};

use super::FLUSH_INTERVAL;
use crate::{f_engine::SpectralResult, Frame};

pub const COLUMNS: [&str; 5] = [
    "Timestamp_ms",
    "Signal_Avg",
    "Magnitude_Peak",
    "PSD_Avg",
    "SNR_dB",
];

pub struct CsvWriter {
    inner: ::csv::Writer<File>,
    frames: u64,
}

impl CsvWriter {
    pub fn create(
        path: &Path,
        fft_size: usize,
        sample_rate: u32,
        start_time: u64,
    ) -> io::Result<Self> {
        let mut file = File::create(path)?;
        writeln!(file, "# fftSize: {}", fft_size)?;
        writeln!(file, "# sampleRate: {}", sample_rate)?;
        writeln!(file, "# startTime: {}", start_time)?;
        let mut inner = ::csv::Writer::from_writer(file);
        inner.write_record(COLUMNS)?;
        inner.flush()?;
        Ok(Self { inner, frames: 0 })
    }

    pub fn write_frame(&mut self, frame: &Frame, result: &SpectralResult) -> io::Result<()> {
        let signal_avg = mean(frame.samples.iter().map(|s| s.abs()));
        let magnitude_peak = result.magnitude.iter().copied().fold(0f32, f32::max);
        let psd_avg = mean(result.psd.iter().copied());
        self.inner.write_record(&[
            frame.timestamp_ms.to_string(),
            format!("{:.6}", signal_avg),
            format!("{:.6}", magnitude_peak),
            format!("{:.3}", psd_avg),
            format!("{:.2}", result.snr_db),
        ])?;
        self.frames += 1;
        if self.frames % FLUSH_INTERVAL == 0 {
            self.inner.flush()?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn mean(values: impl ExactSizeIterator<Item = f32>) -> f32 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    values.sum::<f32>() / n as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::f_engine::SpectralEngine;
    use crate::synth::sine;

    #[test]
    fn test_single_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let frame = Frame::new(sine(512, 8000, 1000.0, 0.8), 1234);
        let result = SpectralEngine::new(512, 8000).analyze(&frame);
        let mut writer = CsvWriter::create(&path, 512, 8000, 99).unwrap();
        writer.write_frame(&frame, &result).unwrap();
        writer.finish().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            &lines[..4],
            &[
                "# fftSize: 512",
                "# sampleRate: 8000",
                "# startTime: 99",
                "Timestamp_ms,Signal_Avg,Magnitude_Peak,PSD_Avg,SNR_dB"
            ]
        );
        assert_eq!(lines.len(), 5);
        let fields: Vec<&str> = lines[4].split(',').collect();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0], "1234");
        assert_eq!(fields[1].split('.').nth(1).unwrap().len(), 6);
        assert_eq!(fields[3].split('.').nth(1).unwrap().len(), 3);
        assert_eq!(fields[4].split('.').nth(1).unwrap().len(), 2);
    }
}
