//! Raw microphone bytes to voice-format bytes.
//!
//! The mic delivers interleaved s16le at the capture rate (48 kHz stereo
//! on the reference boards). The wake word engine and the recognizer want
//! 16 kHz mono s16le. `MicResampler` downmixes, then runs a rubato
//! `FastFixedIn` session over fixed frames of `frame_ms`.
//!
//! When capture rate == target rate only the downmix runs and no rubato
//! session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::buffering::chunk::{bytes_to_i16, downmix_to_mono, f32_to_i16, PcmFormat};
use crate::error::DspError;

pub struct MicResampler {
    capture: PcmFormat,
    target_rate: u32,
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Bytes of an incomplete interleaved frame carried to the next call.
    carry: Vec<u8>,
    /// Mono input waiting for a full rubato chunk.
    input_buf: Vec<f32>,
    chunk_size: usize,
    output_buf: Vec<Vec<f32>>,
    samples: Vec<i16>,
    mono: Vec<f32>,
}

impl MicResampler {
    /// # Errors
    /// `DspError::Resampler` if the formats are unusable or rubato refuses
    /// the ratio.
    pub fn new(capture: PcmFormat, target_rate: u32, frame_ms: u64) -> Result<Self, DspError> {
        if capture.bits_per_sample != 16 || capture.channels == 0 {
            return Err(DspError::Resampler(format!(
                "unsupported capture format {}ch/{}bit",
                capture.channels, capture.bits_per_sample
            )));
        }
        if capture.sample_rate == 0 || target_rate == 0 {
            return Err(DspError::Resampler("sample rate must be non-zero".into()));
        }
        let chunk_size = ((capture.sample_rate as u64 * frame_ms / 1000) as usize).max(1);

        let (resampler, output_buf) = if capture.sample_rate == target_rate {
            (None, Vec::new())
        } else {
            let ratio = target_rate as f64 / capture.sample_rate as f64;
            let resampler =
                FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
                    .map_err(|e| DspError::Resampler(format!("init: {e}")))?;
            let max_out = resampler.output_frames_max();
            info!(
                from = capture.sample_rate,
                to = target_rate,
                channels = capture.channels,
                chunk_size,
                "mic resampling enabled"
            );
            (Some(resampler), vec![vec![0f32; max_out]; 1])
        };

        Ok(Self {
            capture,
            target_rate,
            resampler,
            carry: Vec::new(),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
            samples: Vec::new(),
            mono: Vec::new(),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Bytes of raw capture making up one resampling frame.
    pub fn frame_bytes(&self) -> usize {
        self.chunk_size * self.capture.frame_bytes()
    }

    pub fn output_format(&self) -> PcmFormat {
        PcmFormat::new(self.target_rate, 1, 16)
    }

    /// Convert `raw` and append voice-format bytes to `out`. Output may be
    /// empty until a full frame has accumulated.
    pub fn process(&mut self, raw: &[u8], out: &mut Vec<u8>) {
        let frame = self.capture.frame_bytes();
        self.carry.extend_from_slice(raw);
        let whole = self.carry.len() / frame * frame;
        if whole == 0 {
            return;
        }
        bytes_to_i16(&self.carry[..whole], &mut self.samples);
        self.carry.drain(..whole);
        downmix_to_mono(&self.samples, self.capture.channels as usize, &mut self.mono);

        let Some(resampler) = self.resampler.as_mut() else {
            push_i16(&self.mono, out);
            return;
        };

        self.input_buf.extend_from_slice(&self.mono);
        while self.input_buf.len() >= self.chunk_size {
            let input = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => push_i16(&self.output_buf[0][..produced], out),
                Err(e) => error!("mic resampler error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }
    }
}

fn push_i16(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&f32_to_i16(*s).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_bytes(frames: usize, value: i16) -> Vec<u8> {
        let mut out = Vec::with_capacity(frames * 4);
        for _ in 0..frames {
            out.extend_from_slice(&value.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    #[test]
    fn same_rate_only_downmixes() {
        let mut rs = MicResampler::new(PcmFormat::new(16_000, 2, 16), 16_000, 20).unwrap();
        assert!(rs.is_passthrough());
        let mut out = Vec::new();
        rs.process(&stereo_bytes(10, 1000), &mut out);
        assert_eq!(out.len(), 20);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), 1000);
    }

    #[test]
    fn one_frame_at_48k_yields_about_320_samples() {
        let mut rs = MicResampler::new(PcmFormat::MIC_RAW, 16_000, 20).unwrap();
        assert!(!rs.is_passthrough());
        assert_eq!(rs.frame_bytes(), 960 * 4);
        let mut out = Vec::new();
        rs.process(&stereo_bytes(960, 0), &mut out);
        let samples = out.len() / 2;
        assert!(
            (samples as isize - 320).unsigned_abs() <= 10,
            "output samples={samples} expected≈320"
        );
    }

    #[test]
    fn partial_frames_accumulate() {
        let mut rs = MicResampler::new(PcmFormat::MIC_RAW, 16_000, 20).unwrap();
        let mut out = Vec::new();
        rs.process(&stereo_bytes(500, 0), &mut out);
        assert!(out.is_empty());
        rs.process(&stereo_bytes(500, 0), &mut out);
        assert!(!out.is_empty(), "second push should complete a frame");
    }

    #[test]
    fn split_interleaved_frame_is_carried() {
        let mut rs = MicResampler::new(PcmFormat::new(16_000, 2, 16), 16_000, 20).unwrap();
        let bytes = stereo_bytes(2, 200);
        let mut out = Vec::new();
        rs.process(&bytes[..3], &mut out);
        assert!(out.is_empty());
        rs.process(&bytes[3..], &mut out);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn rejects_non_16_bit_capture() {
        assert!(matches!(
            MicResampler::new(PcmFormat::new(48_000, 2, 24), 16_000, 20),
            Err(DspError::Resampler(_))
        ));
    }
}
