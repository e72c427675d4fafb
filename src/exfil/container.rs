//! Chunked, compressed container recordings in the Zarr v2 directory layout
//!
//! ```text
//! <name>.zarr/
//!   .zgroup
//!   metadata/.zgroup, .zattrs   {fftSize, sampleRate, startTime}
//!   signal/.zarray, 0.0, 1.0 ...      [frames, F]
//!   magnitude/.zarray, 0.0 ...        [frames, F/2]
//!   psd/.zarray, 0.0 ...              [frames, 128]
//! ```
//!
//! Rows are buffered until a chunk of [`CHUNK_ROWS`] frames fills up, then
//! the chunk is zlib compressed to disk and the array extent rewritten.
//! Closing pads and writes the trailing partial chunk.
//!
//! A frame's three rows are buffered together before any chunk is written,
//! so a failed chunk write leaves the arrays aligned. The full chunk stays
//! buffered and is written again with the next frame.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use byte_slice_cast::AsByteSlice;
use flate2::{write::ZlibEncoder, Compression};
use serde::Serialize;
use serde_json::json;

use crate::{f_engine::SpectralResult, Frame, PSD_BINS};

pub const CHUNK_ROWS: usize = 10;
pub const ZLIB_LEVEL: u32 = 6;

#[derive(Serialize)]
struct Compressor {
    id: &'static str,
    level: u32,
}

#[derive(Serialize)]
struct ArrayMeta {
    zarr_format: u8,
    shape: [usize; 2],
    chunks: [usize; 2],
    dtype: &'static str,
    compressor: Compressor,
    fill_value: f32,
    order: &'static str,
    filters: Option<()>,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut file, value)?;
    file.flush()
}

/// One extensible 2-D float array, `width` columns wide
struct ChunkedArray {
    dir: PathBuf,
    width: usize,
    rows: usize,
    /// Rows already on disk in full chunks
    flushed: usize,
    chunk: Vec<f32>,
}

impl ChunkedArray {
    fn create(dir: PathBuf, width: usize) -> io::Result<Self> {
        fs::create_dir(&dir)?;
        let array = Self {
            dir,
            width,
            rows: 0,
            flushed: 0,
            chunk: Vec::with_capacity(CHUNK_ROWS * width),
        };
        array.write_meta(0)?;
        Ok(array)
    }

    fn write_meta(&self, extent: usize) -> io::Result<()> {
        let meta = ArrayMeta {
            zarr_format: 2,
            shape: [extent, self.width],
            chunks: [CHUNK_ROWS, self.width],
            dtype: "<f4",
            compressor: Compressor {
                id: "zlib",
                level: ZLIB_LEVEL,
            },
            fill_value: 0.0,
            order: "C",
            filters: None,
        };
        write_json(&self.dir.join(".zarray"), &meta)
    }

    /// Extend dimension 0 by one, buffering `row` at (rows, 0)
    fn stage_row(&mut self, row: &[f32]) {
        let n = row.len().min(self.width);
        self.chunk.extend_from_slice(&row[..n]);
        // Rows of the wrong length are padded to keep the array rectangular
        self.chunk.resize(self.chunk.len() + self.width - n, 0.0);
        self.rows += 1;
    }

    /// Write out every full chunk in the buffer
    fn flush_full(&mut self) -> io::Result<()> {
        let chunk_len = CHUNK_ROWS * self.width;
        while self.chunk.len() >= chunk_len {
            write_chunk(&self.dir, self.flushed / CHUNK_ROWS, &self.chunk[..chunk_len])?;
            self.chunk.drain(..chunk_len);
            self.flushed += CHUNK_ROWS;
            self.write_meta(self.flushed)?;
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.flush_full()?;
        if !self.chunk.is_empty() {
            self.chunk.resize(CHUNK_ROWS * self.width, 0.0);
            write_chunk(&self.dir, self.flushed / CHUNK_ROWS, &self.chunk)?;
            self.chunk.clear();
        }
        self.write_meta(self.rows)
    }
}

fn write_chunk(dir: &Path, index: usize, values: &[f32]) -> io::Result<()> {
    let file = File::create(dir.join(format!("{}.0", index)))?;
    let mut encoder = ZlibEncoder::new(BufWriter::new(file), Compression::new(ZLIB_LEVEL));
    if cfg!(target_endian = "little") {
        encoder.write_all(values.as_byte_slice())?;
    } else {
        for v in values {
            encoder.write_all(&v.to_le_bytes())?;
        }
    }
    encoder.finish()?.flush()
}

pub struct ContainerWriter {
    signal: ChunkedArray,
    magnitude: ChunkedArray,
    psd: ChunkedArray,
}

impl ContainerWriter {
    pub fn create(
        root: &Path,
        fft_size: usize,
        sample_rate: u32,
        start_time: u64,
    ) -> io::Result<Self> {
        fs::create_dir(root)?;
        let group = json!({ "zarr_format": 2 });
        write_json(&root.join(".zgroup"), &group)?;
        let metadata = root.join("metadata");
        fs::create_dir(&metadata)?;
        write_json(&metadata.join(".zgroup"), &group)?;
        write_json(
            &metadata.join(".zattrs"),
            &json!({
                "fftSize": fft_size,
                "sampleRate": sample_rate,
                "startTime": start_time,
            }),
        )?;
        Ok(Self {
            signal: ChunkedArray::create(root.join("signal"), fft_size)?,
            magnitude: ChunkedArray::create(root.join("magnitude"), fft_size / 2)?,
            psd: ChunkedArray::create(root.join("psd"), PSD_BINS)?,
        })
    }

    pub fn write_frame(&mut self, frame: &Frame, result: &SpectralResult) -> io::Result<()> {
        self.signal.stage_row(&frame.samples);
        self.magnitude.stage_row(&result.magnitude);
        self.psd.stage_row(&result.psd);
        self.arrays_mut().try_for_each(ChunkedArray::flush_full)
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.arrays_mut().try_for_each(ChunkedArray::close)
    }

    fn arrays_mut(&mut self) -> impl Iterator<Item = &mut ChunkedArray> {
        [&mut self.signal, &mut self.magnitude, &mut self.psd].into_iter()
    }
}
