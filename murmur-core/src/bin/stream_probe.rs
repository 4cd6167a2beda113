use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use murmur_core::buffering::{chunk::PcmFormat, AnchoredRingBuffer};
use murmur_core::config::{default_settings_path, load_settings};
use murmur_core::stream::fs::FsStream;
use murmur_core::stream::port::{MarkedSource, MemorySink};
use murmur_core::stream::{StreamEvent, StreamMarker};
use murmur_core::{AudioStream, HttpPlaybackStream, StreamOptions, StreamState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeSummary {
    url: String,
    offset_ms: u64,
    content_types: Vec<String>,
    bytes: u64,
    out: Option<String>,
    final_state: StreamState,
    failure: Option<String>,
    elapsed_ms: u128,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("murmur_core=info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("stream_probe failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = parse_args()?;

    let mut settings = match &args.settings {
        Some(path) => load_settings(path),
        None => load_settings(&default_settings_path()),
    };
    settings.apply_env_overrides();

    let backend = HttpPlaybackStream::with_reqwest(settings.http_config(), args.url.clone())
        .map_err(|e| format!("http client: {e}"))?
        .with_offset_ms(args.offset_ms);

    let content_types = Arc::new(Mutex::new(Vec::<String>::new()));
    let failure = Arc::new(Mutex::new(None::<String>));
    let options = {
        let content_types = Arc::clone(&content_types);
        let failure = Arc::clone(&failure);
        StreamOptions::default().with_listener(move |_, event| {
            match event {
                StreamEvent::CustomData(data) => content_types.lock().push(data.content_type.clone()),
                StreamEvent::Failed(reason) => *failure.lock() = Some(reason.clone()),
                _ => {}
            }
            Ok(())
        })
    };

    let started = Instant::now();
    let deadline = Duration::from_secs_f64(args.seconds);

    let (final_state, bytes) = match &args.out {
        Some(out) => {
            let (producer, consumer) =
                AnchoredRingBuffer::new::<StreamMarker>("probe", settings.playback_ring_bytes)
                    .map_err(|e| format!("ring: {e}"))?;
            let mut reader = AudioStream::reader("probe-http", backend, producer, options)
                .map_err(|e| format!("reader: {e}"))?;
            let mut writer = AudioStream::writer(
                "probe-file",
                FsStream::writer(out.clone(), PcmFormat::VOICE),
                MarkedSource::new(consumer),
                StreamOptions::default(),
            )
            .map_err(|e| format!("writer: {e}"))?;

            writer.start().map_err(|e| format!("writer start: {e}"))?;
            reader.start().map_err(|e| format!("reader start: {e}"))?;
            let state = wait_until_done(&reader, started, deadline);
            if state == StreamState::Running {
                reader.stop().map_err(|e| format!("reader stop: {e}"))?;
            }
            // The writer drains the ring until the reader's end-of-stream.
            writer.wait_for_state(StreamState::Stopped, Duration::from_secs(5));
            reader.destroy().map_err(|e| format!("reader destroy: {e}"))?;
            writer.destroy().map_err(|e| format!("writer destroy: {e}"))?;

            let bytes = std::fs::metadata(out).map(|m| m.len()).unwrap_or(0);
            (state, bytes)
        }
        None => {
            let sink = MemorySink::new();
            let mut reader = AudioStream::reader("probe-http", backend, sink.clone(), options)
                .map_err(|e| format!("reader: {e}"))?;
            reader.start().map_err(|e| format!("reader start: {e}"))?;
            let state = wait_until_done(&reader, started, deadline);
            reader.destroy().map_err(|e| format!("reader destroy: {e}"))?;
            (state, sink.bytes().len() as u64)
        }
    };

    let summary = ProbeSummary {
        url: args.url,
        offset_ms: args.offset_ms,
        content_types: content_types.lock().clone(),
        bytes,
        out: args.out.map(|p| p.display().to_string()),
        final_state,
        failure: failure.lock().clone(),
        elapsed_ms: started.elapsed().as_millis(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).map_err(|e| format!("serialize summary: {e}"))?
    );
    Ok(())
}

/// Wait for the reader to stop on its own or for the deadline. Returns the
/// state observed last.
fn wait_until_done(reader: &AudioStream, started: Instant, deadline: Duration) -> StreamState {
    loop {
        let state = reader.state();
        if state == StreamState::Stopped || started.elapsed() >= deadline {
            return state;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

struct Args {
    url: String,
    out: Option<PathBuf>,
    offset_ms: u64,
    seconds: f64,
    settings: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut url = None;
    let mut out = None;
    let mut offset_ms = 0u64;
    let mut seconds = 10.0f64;
    let mut settings = None;

    let mut iter = std::env::args().skip(1).peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--url" => {
                url = Some(iter.next().ok_or("--url requires a value")?);
            }
            "--out" => {
                let value = iter.next().ok_or("--out requires a path")?;
                out = Some(PathBuf::from(value));
            }
            "--offset-ms" => {
                let value = iter.next().ok_or("--offset-ms requires a value")?;
                offset_ms = value
                    .parse::<u64>()
                    .map_err(|e| format!("invalid --offset-ms '{value}': {e}"))?;
            }
            "--seconds" => {
                let value = iter.next().ok_or("--seconds requires a value")?;
                seconds = value
                    .parse::<f64>()
                    .map_err(|e| format!("invalid --seconds '{value}': {e}"))?;
                if !seconds.is_finite() || seconds <= 0.0 {
                    return Err(format!("--seconds must be positive, got {value}"));
                }
            }
            "--settings" => {
                let value = iter.next().ok_or("--settings requires a path")?;
                settings = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: stream_probe --url <url> [--out <file>] [--offset-ms <ms>] \
                     [--seconds <n>] [--settings <path>]"
                );
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    let url = url.ok_or("--url is required")?;
    Ok(Args {
        url,
        out,
        offset_ms,
        seconds,
        settings,
    })
}
