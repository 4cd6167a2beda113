//! Filesystem stream backend.
//!
//! Raw files carry s16le PCM as-is. WAV files go through `hound`: a
//! reader announces the file's format with a `StreamMarker::Format` before
//! its first bytes, and a writer always creates a fresh file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{StreamContext, StreamIo, StreamMarker};
use crate::buffering::chunk::PcmFormat;
use crate::error::StreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsContainer {
    Raw,
    Wav,
}

impl FsContainer {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("wav") => FsContainer::Wav,
            _ => FsContainer::Raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsMode {
    Reader,
    Writer,
}

enum Handle {
    RawRead(BufReader<File>),
    RawWrite(BufWriter<File>),
    WavRead(hound::WavReader<BufReader<File>>),
    WavWrite(hound::WavWriter<BufWriter<File>>),
}

pub struct FsStream {
    path: PathBuf,
    mode: FsMode,
    container: FsContainer,
    /// Format written into new WAV files; learned from the file on read.
    format: PcmFormat,
    handle: Option<Handle>,
    pending_marker: Option<StreamMarker>,
    /// Low byte of a sample split across two WAV writes.
    carry: Option<u8>,
    bytes: u64,
}

impl FsStream {
    pub fn reader(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            container: FsContainer::from_path(&path),
            path,
            mode: FsMode::Reader,
            format: PcmFormat::VOICE,
            handle: None,
            pending_marker: None,
            carry: None,
            bytes: 0,
        }
    }

    pub fn writer(path: impl Into<PathBuf>, format: PcmFormat) -> Self {
        let path = path.into();
        Self {
            container: FsContainer::from_path(&path),
            path,
            mode: FsMode::Writer,
            format,
            handle: None,
            pending_marker: None,
            carry: None,
            bytes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Bytes moved since the last `init`.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes
    }

    fn open_wav_writer(&self) -> Result<Handle, StreamError> {
        let spec = hound::WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        Ok(Handle::WavWrite(hound::WavWriter::create(&self.path, spec)?))
    }
}

impl StreamIo for FsStream {
    fn init(&mut self, ctx: &StreamContext) -> Result<(), StreamError> {
        if self.path.as_os_str().is_empty() {
            return Err(StreamError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty file path",
            )));
        }
        self.bytes = 0;
        self.carry = None;

        let handle = match (self.mode, self.container) {
            (FsMode::Reader, FsContainer::Raw) => {
                let file = File::open(&self.path)?;
                let size = file.metadata().map(|m| m.len()).unwrap_or(0);
                info!(stream = ctx.name(), path = %self.path.display(), size, "file opened");
                Handle::RawRead(BufReader::new(file))
            }
            (FsMode::Reader, FsContainer::Wav) => {
                let reader = hound::WavReader::open(&self.path)?;
                let spec = reader.spec();
                if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
                    return Err(StreamError::Wav(format!(
                        "only 16-bit integer WAV is supported, got {}-bit {:?}",
                        spec.bits_per_sample, spec.sample_format
                    )));
                }
                self.format = PcmFormat::new(spec.sample_rate, spec.channels, 16);
                self.pending_marker = Some(StreamMarker::Format(self.format));
                info!(
                    stream = ctx.name(),
                    path = %self.path.display(),
                    sample_rate = spec.sample_rate,
                    channels = spec.channels,
                    "wav opened"
                );
                Handle::WavRead(reader)
            }
            (FsMode::Writer, FsContainer::Raw) => {
                Handle::RawWrite(BufWriter::new(File::create(&self.path)?))
            }
            (FsMode::Writer, FsContainer::Wav) => self.open_wav_writer()?,
        };
        self.handle = Some(handle);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let n = match self.handle.as_mut() {
            Some(Handle::RawRead(r)) => r.read(buf)?,
            Some(Handle::WavRead(r)) => {
                let mut n = 0;
                for (slot, sample) in buf.chunks_exact_mut(2).zip(r.samples::<i16>()) {
                    slot.copy_from_slice(&sample?.to_le_bytes());
                    n += 2;
                }
                n
            }
            _ => return Err(StreamError::NotAttached("file reader")),
        };
        if n == 0 {
            return Err(StreamError::EndOfStream);
        }
        self.bytes += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        match self.handle.as_mut() {
            Some(Handle::RawWrite(w)) => w.write_all(buf)?,
            Some(Handle::WavWrite(w)) => {
                let mut rest = buf;
                if let (Some(lo), Some((&hi, tail))) = (self.carry, rest.split_first()) {
                    w.write_sample(i16::from_le_bytes([lo, hi]))?;
                    self.carry = None;
                    rest = tail;
                }
                let mut pairs = rest.chunks_exact(2);
                for pair in &mut pairs {
                    w.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
                }
                if let [lo] = pairs.remainder() {
                    self.carry = Some(*lo);
                }
            }
            _ => return Err(StreamError::NotAttached("file writer")),
        }
        self.bytes += buf.len() as u64;
        Ok(buf.len())
    }

    fn cleanup(&mut self) {
        match self.handle.take() {
            Some(Handle::RawWrite(mut w)) => {
                if let Err(e) = w.flush() {
                    warn!(path = %self.path.display(), "flush failed: {e}");
                }
            }
            Some(Handle::WavWrite(w)) => {
                if let Err(e) = w.finalize() {
                    warn!(path = %self.path.display(), "wav finalize failed: {e}");
                }
            }
            _ => {}
        }
        self.pending_marker = None;
    }

    fn take_marker(&mut self) -> Option<StreamMarker> {
        self.pending_marker.take()
    }

    fn apply_marker(&mut self, marker: &StreamMarker) -> Result<(), StreamError> {
        let StreamMarker::Format(format) = marker else {
            return Ok(());
        };
        if *format == self.format {
            return Ok(());
        }
        if self.mode == FsMode::Writer && self.container == FsContainer::Wav && self.bytes == 0 {
            // Nothing written yet: restart the file with the announced format.
            self.format = *format;
            if let Some(Handle::WavWrite(w)) = self.handle.take() {
                w.finalize()?;
            }
            self.handle = Some(self.open_wav_writer()?);
        } else {
            warn!(path = %self.path.display(), ?format, "format change ignored mid-file");
        }
        Ok(())
    }
}
