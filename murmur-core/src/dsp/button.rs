//! Button edges to capture commands.
//!
//! A board's button driver posts `ButtonEvent`s through the coalescing
//! edge channel from its interrupt path; `ButtonWatcher` waits on the
//! receiving side and steers the pipeline through a `DspHandle`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::DspHandle;
use crate::error::DspError;
use crate::notify::EdgeReceiver;

const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    TapToTalk,
    /// Mic mute button: mutes when unmuted and the other way round.
    MuteToggle,
    Mute,
    Unmute,
}

/// Apply one button press. Tap-to-talk is ignored while the mic is muted.
pub fn dispatch(handle: &DspHandle, event: ButtonEvent) -> Result<(), DspError> {
    match event {
        ButtonEvent::TapToTalk if handle.is_mute_requested() => {
            debug!("tap to talk ignored while muted");
            Ok(())
        }
        ButtonEvent::TapToTalk => handle.tap_to_talk(),
        ButtonEvent::MuteToggle if handle.is_mute_requested() => handle.unmute(),
        ButtonEvent::MuteToggle | ButtonEvent::Mute => handle.mute(),
        ButtonEvent::Unmute => handle.unmute(),
    }
}

pub struct ButtonWatcher {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ButtonWatcher {
    /// Start a thread that dispatches every edge from `edges` until
    /// `stop`, or until every sender is dropped.
    pub fn spawn(edges: EdgeReceiver<ButtonEvent>, handle: DspHandle) -> Result<Self, DspError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("dsp-buttons".into())
            .spawn(move || watch(edges, handle, flag))
            .map_err(|e| DspError::Spawn {
                task: "dsp-buttons",
                reason: e.to_string(),
            })?;
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("button watcher panicked");
            }
        }
    }
}

impl Drop for ButtonWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch(edges: EdgeReceiver<ButtonEvent>, handle: DspHandle, running: Arc<AtomicBool>) {
    info!("button watcher started");
    while running.load(Ordering::Acquire) {
        let event = match edges.wait_timeout(POLL) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(()) => break,
        };
        debug!(?event, "button event");
        if let Err(e) = dispatch(&handle, event) {
            warn!(error = %e, ?event, "button event not delivered");
            if matches!(e, DspError::QueueClosed) {
                break;
            }
        }
    }
    info!("button watcher stopped");
}
