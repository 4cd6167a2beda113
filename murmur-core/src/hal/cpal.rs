//! Desktop HAL over cpal.
//!
//! # Design constraints
//!
//! cpal callbacks run on an OS audio thread at elevated priority. They
//! must not allocate, block on a mutex, or perform I/O, so each direction
//! moves i16 samples through a lock-free `ringbuf` pair: the input
//! callback pushes, `read` pops; `write` pushes, the output callback pops.
//!
//! `cpal::Stream` is `!Send` on most platforms. The streams therefore live
//! on a dedicated host thread that `start`/`stop` drive over a channel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, Stream, StreamConfig,
};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::AudioHal;
use crate::buffering::{
    chunk::PcmFormat, create_sample_ring, Consumer, Producer, SampleConsumer, SampleProducer,
};
use crate::error::{MurmurError, Result};

/// Two seconds of 48 kHz stereo per direction.
const SAMPLE_RING_CAPACITY: usize = 48_000 * 2 * 2;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

struct Started {
    format: PcmFormat,
    capture: SampleConsumer,
    playback: SampleProducer,
}

enum HostCommand {
    Start(Sender<Result<Started>>),
    Stop,
}

pub struct CpalHal {
    commands: Sender<HostCommand>,
    capture: Mutex<Option<SampleConsumer>>,
    playback: Mutex<Option<SampleProducer>>,
    capture_format: Mutex<PcmFormat>,
    clock: Mutex<Option<PcmFormat>>,
    silenced: Arc<AtomicBool>,
}

impl CpalHal {
    /// Spawn the host thread. No device is opened until `start`.
    pub fn new() -> Result<Self> {
        let (commands, command_rx) = bounded::<HostCommand>(4);
        let silenced = Arc::new(AtomicBool::new(false));

        let thread_silenced = Arc::clone(&silenced);
        thread::Builder::new()
            .name("murmur-cpal-host".into())
            .spawn(move || {
                let mut streams: Option<(Stream, Option<Stream>)> = None;

                while let Ok(cmd) = command_rx.recv() {
                    match cmd {
                        HostCommand::Start(reply) => {
                            if streams.is_some() {
                                let _ = reply.send(Err(MurmurError::AudioDevice(
                                    "host streams already running".into(),
                                )));
                                continue;
                            }
                            match open_streams(Arc::clone(&thread_silenced)) {
                                Ok((started, input, output)) => {
                                    streams = Some((input, output));
                                    let _ = reply.send(Ok(started));
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(e));
                                }
                            }
                        }
                        HostCommand::Stop => {
                            if streams.take().is_some() {
                                info!("cpal streams closed");
                            }
                        }
                    }
                }
            })
            .map_err(MurmurError::Io)?;

        Ok(Self {
            commands,
            capture: Mutex::new(None),
            playback: Mutex::new(None),
            capture_format: Mutex::new(PcmFormat::MIC_RAW),
            clock: Mutex::new(None),
            silenced,
        })
    }
}

/// Open the default input (required) and output (optional) devices with
/// a fresh pair of sample rings.
fn open_streams(silenced: Arc<AtomicBool>) -> Result<(Started, Stream, Option<Stream>)> {
    let (capture_tx, capture_rx) = create_sample_ring(SAMPLE_RING_CAPACITY);
    let (playback_tx, playback_rx) = create_sample_ring(SAMPLE_RING_CAPACITY);

    let host = cpal::default_host();
    let input = host
        .default_input_device()
        .ok_or_else(|| MurmurError::AudioDevice("no default input device".into()))?;
    info!(
        device = input.name().unwrap_or_default().as_str(),
        "opening input device"
    );

    let supported = input
        .default_input_config()
        .map_err(|e| MurmurError::AudioDevice(e.to_string()))?;
    let format = PcmFormat::new(supported.sample_rate().0, supported.channels(), 16);
    let config: StreamConfig = supported.config();

    let input_stream = build_input(&input, &config, supported.sample_format(), capture_tx)?;
    input_stream
        .play()
        .map_err(|e| MurmurError::AudioDevice(e.to_string()))?;

    let output_stream = match host.default_output_device() {
        Some(device) => match device.default_output_config() {
            Ok(cfg) => match build_output(&device, &cfg.config(), playback_rx, silenced) {
                Ok(stream) => match stream.play() {
                    Ok(()) => Some(stream),
                    Err(e) => {
                        warn!("output stream failed to start: {e}");
                        None
                    }
                },
                Err(e) => {
                    warn!("output stream unavailable: {e}");
                    None
                }
            },
            Err(e) => {
                warn!("no usable output config: {e}");
                None
            }
        },
        None => {
            warn!("no default output device, playback disabled");
            None
        }
    };

    info!(
        sample_rate = format.sample_rate,
        channels = format.channels,
        "cpal capture running"
    );
    Ok((
        Started {
            format,
            capture: capture_rx,
            playback: playback_tx,
        },
        input_stream,
        output_stream,
    ))
}

fn build_input(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    mut producer: SampleProducer,
) -> Result<Stream> {
    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _info| {
                let written = producer.push_slice(data);
                if written < data.len() {
                    warn!("capture ring full: dropped {} samples", data.len() - written);
                }
            },
            |err| error!("input stream error: {err}"),
            None,
        ),
        SampleFormat::F32 => {
            let mut scratch: Vec<i16> = Vec::new();
            device.build_input_stream(
                config,
                move |data: &[f32], _info| {
                    scratch.resize(data.len(), 0);
                    for (dst, src) in scratch.iter_mut().zip(data) {
                        *dst = crate::buffering::chunk::f32_to_i16(*src);
                    }
                    let written = producer.push_slice(&scratch);
                    if written < scratch.len() {
                        warn!("capture ring full: dropped {} samples", scratch.len() - written);
                    }
                },
                |err| error!("input stream error: {err}"),
                None,
            )
        }
        fmt => {
            return Err(MurmurError::AudioDevice(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    };
    stream.map_err(|e| MurmurError::AudioDevice(e.to_string()))
}

fn build_output(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: SampleConsumer,
    silenced: Arc<AtomicBool>,
) -> Result<Stream> {
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info| {
                if silenced.swap(false, Ordering::AcqRel) {
                    consumer.clear();
                }
                for out in data.iter_mut() {
                    *out = consumer
                        .try_pop()
                        .map(crate::buffering::chunk::i16_to_f32)
                        .unwrap_or(0.0);
                }
            },
            |err| error!("output stream error: {err}"),
            None,
        )
        .map_err(|e| MurmurError::AudioDevice(e.to_string()))
}

impl AudioHal for CpalHal {
    fn start(&self) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(HostCommand::Start(reply_tx))
            .map_err(|_| MurmurError::AudioDevice("cpal host thread gone".into()))?;
        let started = reply_rx
            .recv()
            .map_err(|_| MurmurError::AudioDevice("cpal host thread gone".into()))??;
        *self.capture_format.lock() = started.format;
        *self.capture.lock() = Some(started.capture);
        *self.playback.lock() = Some(started.playback);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.capture.lock().take();
        self.playback.lock().take();
        self.commands
            .send(HostCommand::Stop)
            .map_err(|_| MurmurError::AudioDevice("cpal host thread gone".into()))
    }

    fn set_clock(&self, sample_rate: u32, bits_per_sample: u16, channels: u16) -> Result<()> {
        let requested = PcmFormat::new(sample_rate, channels, bits_per_sample);
        if requested.sample_rate != self.capture_format.lock().sample_rate {
            warn!(sample_rate, "playback rate differs from device rate; no resampling on output");
        }
        *self.clock.lock() = Some(requested);
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.capture.lock();
        let Some(consumer) = guard.as_mut() else {
            return Ok(0);
        };
        let want = buf.len() / 2;
        let mut got = 0usize;
        while got == 0 {
            for pair in buf.chunks_exact_mut(2).take(want) {
                match consumer.try_pop() {
                    Some(s) => {
                        pair.copy_from_slice(&s.to_le_bytes());
                        got += 1;
                    }
                    None => break,
                }
            }
            if got > 0 || Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(got * 2)
    }

    fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.playback.lock();
        let Some(producer) = guard.as_mut() else {
            return Ok(buf.len());
        };
        let mut written = 0usize;
        for pair in buf.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            while producer.try_push(sample).is_err() {
                if Instant::now() >= deadline {
                    return Ok(written);
                }
                thread::sleep(POLL_INTERVAL);
            }
            written += 2;
        }
        Ok(written)
    }

    fn silence(&self) {
        self.silenced.store(true, Ordering::Release);
    }

    fn capture_format(&self) -> PcmFormat {
        *self.capture_format.lock()
    }
}
