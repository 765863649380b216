//! Unified serial reader task.
//!
//! One task per session owns the `SerialInterface`. It performs every write,
//! keeps at most one framed request on the wire, queues the rest FIFO, and
//! routes poll replies to subscribers by content.
//!
//! A request that times out or is cancelled while on the wire leaves the
//! wire draining: its late reply is still framed, then thrown away, before
//! the next queued command is written.
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, broadcast, watch, oneshot};
use tokio::time::Instant;

use crate::cancellation::CancelToken;
use crate::live::{classify_reply, is_poll_reply, LiveEvent};
use crate::serial::frame::{FrameAccumulator, LineBuffer};
use crate::serial::{SerialInterface, SerialError};
use super::types::*;

const READ_TIMEOUT_MS: u64 = 25;
const TIMEOUT_CHECK: Duration = Duration::from_millis(5);
const MAX_PARTIAL: usize = 8192;
/// Longest the wire stays closed waiting for an abandoned request's reply.
pub const DRAIN_WINDOW: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct UnifiedSerialHandle {
    cmd_tx: mpsc::Sender<SerialCommand>,
    events_tx: broadcast::Sender<ParsedEvent>,
    metrics_rx: watch::Receiver<MetricsSnapshot>,
}

impl UnifiedSerialHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<ParsedEvent> { self.events_tx.subscribe() }
    pub fn metrics_receiver(&self) -> watch::Receiver<MetricsSnapshot> { self.metrics_rx.clone() }

    /// True once the reader task has exited.
    pub fn is_closed(&self) -> bool { self.cmd_tx.is_closed() }

    /// Write `cmd` and wait for its framed reply.
    pub async fn request(&self, tag: &str, cmd: impl Into<String>, spec: CommandSpec) -> Result<CommandResponse, SerialError> {
        let (tx, rx) = oneshot::channel();
        let command = SerialCommand::Request { tag: tag.to_string(), cmd: cmd.into(), spec, responder: tx };
        self.cmd_tx.send(command).await.map_err(|_| SerialError::TransportLost("reader stopped".into()))?;
        rx.await.map_err(|_| SerialError::TransportLost("reader dropped request".into()))?
    }

    /// Like `request`, but withdraws the pending entry if `token` fires first.
    pub async fn request_cancellable(&self, tag: &str, cmd: impl Into<String>, spec: CommandSpec, token: &CancelToken) -> Result<CommandResponse, SerialError> {
        match token.run_until_cancelled(self.request(tag, cmd, spec)).await {
            Some(result) => result,
            None => {
                self.cancel(tag).await;
                Err(SerialError::Cancelled)
            }
        }
    }

    /// Fire-and-forget single line.
    pub async fn send_line(&self, line: impl Into<String>) -> Result<(), SerialError> {
        self.send_lines(vec![line.into()]).await
    }

    /// Write several lines back to back; no other write interleaves.
    pub async fn send_lines(&self, lines: Vec<String>) -> Result<(), SerialError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(SerialCommand::Send { lines, responder: Some(tx) }).await
            .map_err(|_| SerialError::TransportLost("reader stopped".into()))?;
        rx.await.map_err(|_| SerialError::TransportLost("reader dropped write".into()))?
    }

    pub async fn cancel(&self, tag: &str) {
        let _ = self.cmd_tx.send(SerialCommand::Cancel { tag: tag.to_string() }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SerialCommand::Shutdown).await;
    }
}

pub struct UnifiedSerialBuilder {
    pub interface: SerialInterface,
    pub event_capacity: usize,
    pub command_capacity: usize,
}

impl UnifiedSerialBuilder {
    pub fn new(interface: SerialInterface) -> Self { Self { interface, event_capacity: 256, command_capacity: 64 } }

    pub fn build(self) -> UnifiedSerialHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(self.command_capacity);
        let (events_tx, _events_rx) = broadcast::channel(self.event_capacity);
        let (metrics_tx, metrics_rx) = watch::channel(MetricsSnapshot::default());

        tokio::spawn(reader_task(self.interface, cmd_rx, events_tx.clone(), metrics_tx));

        UnifiedSerialHandle { cmd_tx, events_tx, metrics_rx }
    }
}

/// Where a single inbound line ends up.
#[derive(Debug, PartialEq)]
pub enum LineRoute {
    Live(LiveEvent),
    /// The line completed the pending frame; carries its payload.
    Completed(String),
    Buffered,
    Unclassified,
}

/// Classify first, then offer the line to the pending frame.
///
/// Poll replies never enter a request buffer, which is what keeps a
/// `READWHAMMY` reply from corrupting an overlapping `READFILE`. A malformed
/// poll reply is dropped rather than buffered.
pub fn route_line(line: &str, frame: Option<&mut FrameAccumulator>) -> LineRoute {
    if is_poll_reply(line) {
        return match classify_reply(line) {
            Some(evt) => LineRoute::Live(evt),
            None => LineRoute::Unclassified,
        };
    }
    match frame {
        Some(frame) => match frame.push_line(line) {
            Some(payload) => LineRoute::Completed(payload),
            None => LineRoute::Buffered,
        },
        None => LineRoute::Unclassified,
    }
}

enum Begin {
    Started(PendingRequest),
    Failed,
    Lost(String),
}

async fn begin(interface: &mut SerialInterface, req: QueuedRequest) -> Begin {
    let line = format!("{}\n", req.cmd);
    match interface.send_data(line.as_bytes()).await {
        Ok(()) => {
            log::debug!("-> {} (tag {})", req.cmd, req.tag);
            Begin::Started(PendingRequest {
                frame: FrameAccumulator::new(req.spec.matcher.clone()),
                tag: req.tag,
                spec: req.spec,
                started: Instant::now(),
                responder: req.responder,
            })
        }
        Err(e) => {
            let lost = e.is_transport_lost().then(|| e.to_string());
            let _ = req.responder.send(Err(e));
            match lost {
                Some(reason) => Begin::Lost(reason),
                None => Begin::Failed,
            }
        }
    }
}

/// Put the next queued request on the wire. Returns a reason if the transport died.
async fn start_next(
    interface: &mut SerialInterface,
    queue: &mut VecDeque<QueuedRequest>,
    in_flight: &mut Option<PendingRequest>,
) -> Option<String> {
    while in_flight.is_none() {
        let next = queue.pop_front()?;
        match begin(interface, next).await {
            Begin::Started(p) => *in_flight = Some(p),
            Begin::Failed => continue,
            Begin::Lost(reason) => return Some(reason),
        }
    }
    None
}

enum Exit {
    Shutdown,
    Lost(String),
}

/// An abandoned request whose reply may still be on its way.
struct Draining {
    tag: String,
    frame: FrameAccumulator,
    until: Instant,
}

impl Draining {
    fn after(tag: String, frame: FrameAccumulator) -> Self {
        Self { tag, frame, until: Instant::now() + DRAIN_WINDOW }
    }
}

pub(crate) async fn reader_task(
    mut interface: SerialInterface,
    mut cmd_rx: mpsc::Receiver<SerialCommand>,
    events_tx: broadcast::Sender<ParsedEvent>,
    metrics_tx: watch::Sender<MetricsSnapshot>,
) {
    use tokio::select;
    use tokio::time::sleep;

    let mut line_buf = LineBuffer::new();
    let mut in_flight: Option<PendingRequest> = None;
    let mut draining: Option<Draining> = None;
    let mut queue: VecDeque<QueuedRequest> = VecDeque::new();
    let mut metrics = MetricsSnapshot::default();
    let mut buf = [0u8; 512];

    let exit = loop {
        select! {
            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(SerialCommand::Request { tag, cmd, spec, responder }) => {
                        let busy = in_flight.as_ref().is_some_and(|p| p.tag == tag) || queue.iter().any(|q| q.tag == tag);
                        if busy {
                            log::warn!("Rejected '{}': tag {} already pending", cmd, tag);
                            let _ = responder.send(Err(SerialError::TagBusy(tag)));
                            continue;
                        }
                        queue.push_back(QueuedRequest { tag, cmd, spec, responder });
                        if draining.is_some() {
                            continue;
                        }
                        if let Some(reason) = start_next(&mut interface, &mut queue, &mut in_flight).await {
                            break Exit::Lost(reason);
                        }
                    }
                    Some(SerialCommand::Send { lines, responder }) => {
                        let data: String = lines.iter().map(|l| format!("{}\n", l)).collect();
                        let result = interface.send_data(data.as_bytes()).await;
                        let lost = match &result {
                            Err(e) if e.is_transport_lost() => Some(e.to_string()),
                            _ => None,
                        };
                        if let Some(responder) = responder {
                            let _ = responder.send(result);
                        }
                        if let Some(reason) = lost {
                            break Exit::Lost(reason);
                        }
                    }
                    Some(SerialCommand::Cancel { tag }) => {
                        if in_flight.as_ref().is_some_and(|p| p.tag == tag) {
                            if let Some(p) = in_flight.take() {
                                metrics.command_cancelled += 1;
                                let _ = p.responder.send(Err(SerialError::Cancelled));
                                draining = Some(Draining::after(p.tag, p.frame));
                            }
                        } else if let Some(pos) = queue.iter().position(|q| q.tag == tag) {
                            if let Some(q) = queue.remove(pos) {
                                metrics.command_cancelled += 1;
                                let _ = q.responder.send(Err(SerialError::Cancelled));
                            }
                        }
                        let _ = metrics_tx.send(metrics.clone());
                    }
                    Some(SerialCommand::Shutdown) | None => break Exit::Shutdown,
                }
            },
            read_res = interface.read_data(&mut buf, READ_TIMEOUT_MS) => {
                match read_res {
                    Ok(n) if n > 0 => {
                        let chunk = match std::str::from_utf8(&buf[..n]) {
                            Ok(s) => s.to_string(),
                            Err(_) => {
                                metrics.utf8_decode_errors += 1;
                                String::from_utf8_lossy(&buf[..n]).to_string()
                            }
                        };
                        let lines = line_buf.push_chunk(&chunk);

                        let mut lost = None;
                        for line in lines {
                            let frame = match (in_flight.as_mut(), draining.as_mut()) {
                                (Some(p), _) => Some(&mut p.frame),
                                (None, Some(d)) => Some(&mut d.frame),
                                (None, None) => None,
                            };
                            // Blank lines only mean something inside a file body.
                            if line.trim().is_empty() && frame.is_none() {
                                continue;
                            }
                            metrics.lines_read += 1;
                            match route_line(&line, frame) {
                                LineRoute::Live(evt) => {
                                    metrics.live_events += 1;
                                    let _ = events_tx.send(ParsedEvent::Live(evt));
                                }
                                LineRoute::Completed(payload) => {
                                    if let Some(stale) = draining.take() {
                                        metrics.drained_replies += 1;
                                        log::debug!("Discarded late reply for {}: {:?}", stale.tag, payload);
                                    } else if let Some(done) = in_flight.take() {
                                        let latency_ms = done.started.elapsed().as_millis() as u64;
                                        metrics.record_latency(latency_ms);
                                        log::debug!("<- {} complete in {}ms", done.tag, latency_ms);
                                        let _ = done.responder.send(Ok(CommandResponse { payload, latency_ms }));
                                    }
                                    if let Some(reason) = start_next(&mut interface, &mut queue, &mut in_flight).await {
                                        lost = Some(reason);
                                        break;
                                    }
                                }
                                LineRoute::Buffered => {}
                                LineRoute::Unclassified => {
                                    metrics.unclassified_lines += 1;
                                    log::debug!("Unclassified line: {}", line);
                                }
                            }
                        }
                        if line_buf.trim_to(MAX_PARTIAL) {
                            metrics.partial_buffer_trims += 1;
                        }
                        let _ = metrics_tx.send(metrics.clone());
                        if let Some(reason) = lost {
                            break Exit::Lost(reason);
                        }
                    }
                    Ok(_) | Err(SerialError::Timeout) => {}
                    Err(e) => break Exit::Lost(e.to_string()),
                }
            },
            _ = sleep(TIMEOUT_CHECK), if in_flight.is_some() || draining.is_some() => {
                let expired = in_flight.as_ref().is_some_and(|p| p.started.elapsed() > p.spec.timeout);
                if expired {
                    if let Some(p) = in_flight.take() {
                        metrics.command_timeouts += 1;
                        if p.frame.lines().is_empty() {
                            log::warn!("Command '{}' (tag {}) timed out after {:?}; no lines received", p.spec.name, p.tag, p.spec.timeout);
                        } else {
                            log::warn!("Command '{}' (tag {}) timed out after {:?}; partial lines: {:?}", p.spec.name, p.tag, p.spec.timeout, p.frame.lines());
                        }
                        let _ = p.responder.send(Err(SerialError::Timeout));
                        let _ = metrics_tx.send(metrics.clone());
                        draining = Some(Draining::after(p.tag, p.frame));
                    }
                } else if draining.as_ref().is_some_and(|d| Instant::now() >= d.until) {
                    if let Some(stale) = draining.take() {
                        log::debug!("No late reply for {} within {:?}; wire reopened", stale.tag, DRAIN_WINDOW);
                    }
                    if let Some(reason) = start_next(&mut interface, &mut queue, &mut in_flight).await {
                        break Exit::Lost(reason);
                    }
                }
            }
        }
    };

    let reason = match &exit {
        Exit::Shutdown => "session closed".to_string(),
        Exit::Lost(reason) => reason.clone(),
    };
    if let Some(p) = in_flight.take() {
        let _ = p.responder.send(Err(SerialError::TransportLost(reason.clone())));
    }
    for q in queue.drain(..) {
        let _ = q.responder.send(Err(SerialError::TransportLost(reason.clone())));
    }
    interface.disconnect();

    match exit {
        Exit::Shutdown => {
            let _ = events_tx.send(ParsedEvent::ProtocolNotice { message: "reader stopped".into() });
        }
        Exit::Lost(reason) => {
            log::warn!("Serial transport lost: {}", reason);
            metrics.last_error = Some(reason.clone());
            let _ = metrics_tx.send(metrics);
            let _ = events_tx.send(ParsedEvent::TransportLost { reason });
        }
    }
}
