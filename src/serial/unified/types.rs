//! Unified serial reader types
use std::time::Duration;
use tokio::time::Instant;
use serde::{Serialize, Deserialize};
use tokio::sync::oneshot;

use crate::live::LiveEvent;
use crate::serial::SerialError;
use crate::serial::frame::FrameAccumulator;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Events broadcast by the reader task to every subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ParsedEvent {
    /// A poll reply recognised by the reply classifier.
    Live(LiveEvent),
    ProtocolNotice { message: String },
    /// The transport failed; the reader task has exited.
    TransportLost { reason: String },
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Text before the completion marker (or all lines for prefix matchers).
    pub payload: String,
    pub latency_ms: u64,
}

/// Decides when a pending request has received its whole reply.
#[derive(Debug, Clone)]
pub enum ResponseMatcher {
    /// A line consisting of `END`; the marker itself is not part of the payload.
    EndMarker,
    /// Any line starting with one of the prefixes (`PINDETECT:` replies).
    AnyPrefix(&'static [&'static str]),
    Custom(fn(&[String]) -> bool),
}

impl ResponseMatcher {
    pub fn is_complete(&self, lines: &[String]) -> bool {
        match self {
            ResponseMatcher::EndMarker => lines.iter().any(|l| l.trim() == crate::serial::frame::END_MARKER),
            ResponseMatcher::AnyPrefix(ps) => lines.iter().any(|l| ps.iter().any(|p| l.starts_with(p))),
            ResponseMatcher::Custom(f) => f(lines),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub timeout: Duration,
    pub matcher: ResponseMatcher,
}

impl CommandSpec {
    /// An `END`-terminated reply with the default 5s budget.
    pub fn framed(name: &'static str) -> Self {
        Self { name, timeout: DEFAULT_COMMAND_TIMEOUT, matcher: ResponseMatcher::EndMarker }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_matcher(mut self, matcher: ResponseMatcher) -> Self {
        self.matcher = matcher;
        self
    }
}

pub type Responder = oneshot::Sender<Result<CommandResponse, SerialError>>;

pub struct PendingRequest {
    pub tag: String,
    pub spec: CommandSpec,
    pub started: Instant,
    pub responder: Responder,
    pub frame: FrameAccumulator,
}

/// A request waiting for the wire to become free.
pub struct QueuedRequest {
    pub tag: String,
    pub cmd: String,
    pub spec: CommandSpec,
    pub responder: Responder,
}

#[derive(Debug)]
pub enum SerialCommand {
    /// Write `cmd` and await a framed reply under `tag`.
    Request { tag: String, cmd: String, spec: CommandSpec, responder: Responder },
    /// Fire-and-forget lines; the optional responder reports the write result.
    Send { lines: Vec<String>, responder: Option<oneshot::Sender<Result<(), SerialError>>> },
    Cancel { tag: String },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub lines_read: u64,
    pub live_events: u64,
    pub command_completed: u64,
    pub command_timeouts: u64,
    pub command_cancelled: u64,
    /// Late replies to timed-out or cancelled requests, discarded.
    pub drained_replies: u64,
    pub last_error: Option<String>,
    pub command_last_latency_ms: Option<u64>,
    pub command_min_latency_ms: Option<u64>,
    pub command_max_latency_ms: Option<u64>,
    pub command_avg_latency_ms: Option<f64>,
    pub command_ema_latency_ms: Option<f64>,
    pub command_latency_samples: u64,
    pub partial_buffer_trims: u64,
    pub unclassified_lines: u64,
    pub utf8_decode_errors: u64,
}

impl MetricsSnapshot {
    pub fn record_latency(&mut self, latency_ms: u64) {
        self.command_completed += 1;
        self.command_latency_samples += 1;
        self.command_last_latency_ms = Some(latency_ms);
        self.command_min_latency_ms = Some(self.command_min_latency_ms.map_or(latency_ms, |m| m.min(latency_ms)));
        self.command_max_latency_ms = Some(self.command_max_latency_ms.map_or(latency_ms, |m| m.max(latency_ms)));
        let samples = self.command_latency_samples as f64;
        self.command_avg_latency_ms = Some(match self.command_avg_latency_ms {
            Some(avg) if samples > 1.0 => (avg * (samples - 1.0) + latency_ms as f64) / samples,
            _ => latency_ms as f64,
        });
        self.command_ema_latency_ms = Some(match self.command_ema_latency_ms {
            Some(prev) => prev * 0.8 + latency_ms as f64 * 0.2,
            None => latency_ms as f64,
        });
    }
}
