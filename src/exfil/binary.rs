//! Fixed-stride little-endian recording format
//!
//! A 64 byte header followed by frames of
//! `timestamp_ms: u64, signal: [f32; F], magnitude: [f32; F/2], psd: [f32; 128]`.
//! There is no per-frame length, readers derive the stride from the header.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};

use byte_slice_cast::AsByteSlice;

use super::FLUSH_INTERVAL;
use crate::{f_engine::SpectralResult, Frame, PSD_BINS};

pub const MAGIC: &[u8; 8] = b"FFTLOG01";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHeader {
    pub version: u32,
    pub fft_size: u32,
    pub sample_rate: u32,
    pub start_time: u64,
}

impl BinaryHeader {
    pub fn new(fft_size: usize, sample_rate: u32, start_time: u64) -> Self {
        Self {
            version: VERSION,
            fft_size: fft_size as u32,
            sample_rate,
            start_time,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(MAGIC);
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.fft_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.sample_rate.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.start_time.to_le_bytes());
        // 28..64 reserved
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> io::Result<Self> {
        if &bytes[0..8] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Not an FFT log (bad magic)",
            ));
        }
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let mut start = [0u8; 8];
        start.copy_from_slice(&bytes[20..28]);
        Ok(Self {
            version: u32_at(8),
            fft_size: u32_at(12),
            sample_rate: u32_at(16),
            start_time: u64::from_le_bytes(start),
        })
    }

    /// Bytes per frame following the header
    pub fn frame_stride(&self) -> usize {
        let f = self.fft_size as usize;
        8 + 4 * (f + f / 2 + PSD_BINS)
    }
}

pub struct BinaryWriter<W: Write> {
    inner: W,
    frames: u64,
}

impl BinaryWriter<BufWriter<File>> {
    pub fn create(
        path: &Path,
        fft_size: usize,
        sample_rate: u32,
        start_time: u64,
    ) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Self::new(file, &BinaryHeader::new(fft_size, sample_rate, start_time))
    }
}

impl<W: Write> BinaryWriter<W> {
    /// Wrap `inner`, writing the header immediately
    pub fn new(mut inner: W, header: &BinaryHeader) -> io::Result<Self> {
        inner.write_all(&header.to_bytes())?;
        inner.flush()?;
        Ok(Self { inner, frames: 0 })
    }

    pub fn write_frame(&mut self, frame: &Frame, result: &SpectralResult) -> io::Result<()> {
        self.inner.write_all(&frame.timestamp_ms.to_le_bytes())?;
        write_f32s(&mut self.inner, &frame.samples)?;
        write_f32s(&mut self.inner, &result.magnitude)?;
        write_f32s(&mut self.inner, &result.psd)?;
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

fn write_f32s<W: Write>(w: &mut W, samples: &[f32]) -> io::Result<()> {
    if cfg!(target_endian = "little") {
        w.write_all(samples.as_byte_slice())
    } else {
        samples.iter().try_for_each(|s| w.write_all(&s.to_le_bytes()))
    }
}

/// One frame as read back from a recording
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryFrame {
    pub timestamp_ms: u64,
    pub signal: Vec<f32>,
    pub magnitude: Vec<f32>,
    pub psd: Vec<f32>,
}

/// Reads a binary recording back, frame by frame
pub struct BinaryLogReader<R: Read> {
    inner: R,
    header: BinaryHeader,
}

impl BinaryLogReader<BufReader<File>> {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> BinaryLogReader<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let mut bytes = [0u8; HEADER_SIZE];
        inner.read_exact(&mut bytes)?;
        let header = BinaryHeader::from_bytes(&bytes)?;
        Ok(Self { inner, header })
    }

    pub fn header(&self) -> &BinaryHeader {
        &self.header
    }

    /// Next frame, `None` at a clean end of file
    pub fn read_frame(&mut self) -> io::Result<Option<BinaryFrame>> {
        let mut ts = [0u8; 8];
        match self.inner.read_exact(&mut ts) {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            r => r?,
        }
        let f = self.header.fft_size as usize;
        Ok(Some(BinaryFrame {
            timestamp_ms: u64::from_le_bytes(ts),
            signal: read_f32s(&mut self.inner, f)?,
            magnitude: read_f32s(&mut self.inner, f / 2)?,
            psd: read_f32s(&mut self.inner, PSD_BINS)?,
        }))
    }
}

impl<R: Read> Iterator for BinaryLogReader<R> {
    type Item = io::Result<BinaryFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame().transpose()
    }
}

fn read_f32s<R: Read>(r: &mut R, n: usize) -> io::Result<Vec<f32>> {
    let mut bytes = vec![0u8; 4 * n];
    r.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
