//! PCM format arithmetic and sample conversion.
//!
//! All byte streams in this crate carry signed 16-bit little-endian
//! interleaved PCM.

use serde::{Deserialize, Serialize};

/// Shape of an interleaved PCM byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcmFormat {
    /// Sample rate in Hz (e.g. 16000, 44100, 48000).
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    /// 16 kHz mono s16le, the wake word and recognizer format.
    pub const VOICE: PcmFormat = PcmFormat {
        sample_rate: 16_000,
        channels: 1,
        bits_per_sample: 16,
    };

    /// 48 kHz stereo s16le, the raw microphone format.
    pub const MIC_RAW: PcmFormat = PcmFormat {
        sample_rate: 48_000,
        channels: 2,
        bits_per_sample: 16,
    };

    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Bytes in one interleaved frame (one sample per channel).
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_bytes()
    }

    /// Bytes covering `ms` milliseconds, rounded down to a whole frame.
    pub fn bytes_for_ms(&self, ms: u64) -> usize {
        let frames = (self.sample_rate as u64).saturating_mul(ms) / 1000;
        frames as usize * self.frame_bytes()
    }

    /// Duration of `bytes` in milliseconds.
    pub fn ms_for_bytes(&self, bytes: usize) -> u64 {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return 0;
        }
        bytes as u64 * 1000 / bps as u64
    }
}

/// Decode s16le bytes into samples. A trailing odd byte is ignored.
pub fn bytes_to_i16(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]])),
    );
}

/// Encode samples as s16le bytes.
pub fn i16_to_bytes(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Saturating conversion back to i16.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Average interleaved channels down to mono f32.
pub fn downmix_to_mono(samples: &[i16], channels: usize, out: &mut Vec<f32>) {
    out.clear();
    if channels <= 1 {
        out.extend(samples.iter().map(|s| i16_to_f32(*s)));
        return;
    }
    out.extend(samples.chunks_exact(channels).map(|frame| {
        frame.iter().map(|s| i16_to_f32(*s)).sum::<f32>() / channels as f32
    }));
}
