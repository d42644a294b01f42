//! Channel-keyed log throttling.
//!
//! Hot warning paths (quota rejections, relay failures) check a channel before logging. The
//! first message on a channel is emitted; later ones inside the interval are counted and the
//! count is reported with the next emitted message. The registry is an ordinary value shared
//! by `Arc`, so tests and embedders can reset it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Log now. `suppressed` messages were dropped on this channel since the last emit.
    Emit { suppressed: u64 },
    Suppress,
}

#[derive(Debug, Default)]
struct ChannelState {
    last_emitted: Option<Instant>,
    suppressed: u64,
}

#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    channels: Mutex<HashMap<String, ChannelState>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn check(&self, channel: &str) -> ThrottleDecision {
        self.check_at(channel, Instant::now())
    }

    pub fn check_at(&self, channel: &str, now: Instant) -> ThrottleDecision {
        let mut channels = self.channels.lock();
        let state = channels.entry(channel.to_string()).or_default();
        let due = match state.last_emitted {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            let suppressed = std::mem::take(&mut state.suppressed);
            state.last_emitted = Some(now);
            ThrottleDecision::Emit { suppressed }
        } else {
            state.suppressed += 1;
            ThrottleDecision::Suppress
        }
    }

    pub fn suppressed(&self, channel: &str) -> u64 {
        self.channels
            .lock()
            .get(channel)
            .map(|s| s.suppressed)
            .unwrap_or(0)
    }

    pub fn reset(&self, channel: &str) {
        self.channels.lock().remove(channel);
    }

    pub fn reset_all(&self) {
        self.channels.lock().clear();
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
