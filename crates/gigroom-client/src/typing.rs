//! Typing indicator debounce.
//!
//! The server relays `typing` and `stopTyping` as-is and keeps no timers, so
//! deciding when a user has stopped typing is up to the client: the first
//! keystroke announces typing, and [`TYPING_IDLE_MS`] without another one
//! announces the stop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use gigroom_shared::constants::TYPING_IDLE_MS;
use gigroom_shared::protocol::{ClientEvent, Typing};

use crate::channel::ChatChannel;
use crate::error::ClientError;

#[derive(Default)]
struct State {
    active: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

pub struct TypingNotifier {
    channel: ChatChannel,
    job_id: String,
    idle: Duration,
    state: Arc<Mutex<State>>,
}

impl TypingNotifier {
    pub fn new(channel: ChatChannel, job_id: impl Into<String>) -> Self {
        Self::with_idle(channel, job_id, Duration::from_millis(TYPING_IDLE_MS))
    }

    pub fn with_idle(channel: ChatChannel, job_id: impl Into<String>, idle: Duration) -> Self {
        Self {
            channel,
            job_id: job_id.into(),
            idle,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Call on every keystroke. Must run inside a tokio runtime.
    pub fn keystroke(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.active {
            self.channel.emit(typing_event(&self.job_id, true))?;
            state.active = true;
        }

        state.generation += 1;
        let generation = state.generation;
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }

        let shared = self.state.clone();
        let channel = self.channel.clone();
        let job_id = self.job_id.clone();
        let idle = self.idle;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
            // A later keystroke re-armed the timer.
            if state.generation != generation || !state.active {
                return;
            }
            state.active = false;
            state.timer = None;
            if let Err(e) = channel.emit(typing_event(&job_id, false)) {
                debug!(job = %job_id, error = %e, "Could not announce stop typing");
            }
        }));
        Ok(())
    }

    /// Announce the stop right away, e.g. when the message is sent.
    pub fn stop(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if !state.active {
            return Ok(());
        }
        state.active = false;
        state.generation += 1;
        self.channel.emit(typing_event(&self.job_id, false))
    }

    pub fn is_typing(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

fn typing_event(job_id: &str, started: bool) -> ClientEvent {
    let payload = Typing {
        job_id: job_id.to_string(),
        sender: None,
    };
    if started {
        ClientEvent::Typing(payload)
    } else {
        ClientEvent::StopTyping(payload)
    }
}
