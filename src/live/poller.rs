use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, MissedTickBehavior};

use crate::cancellation::CancelToken;
use crate::live::types::*;
use crate::serial::unified::{ParsedEvent, UnifiedSerialHandle};
use crate::serial::{SerialError, DeviceProtocol};

/// Pause between stopping the old pollers and starting the new one, so late
/// replies of the old mode drain before the new mode is listening.
pub const MODE_SWITCH_GRACE: Duration = Duration::from_millis(150);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const SINK_CAPACITY: usize = 256;

type ActiveSet = Arc<RwLock<HashSet<PollChannel>>>;

/// Periodic fire-and-forget polls for one device session.
///
/// Poll writes go through the session's reader task like every other write.
/// Replies come back through the reader's event broadcast; a router task
/// forwards them to subscribers only while the matching channel is active.
pub struct LivePoller {
    handle: UnifiedSerialHandle,
    token: CancelToken,
    sessions: Arc<Mutex<HashMap<PollChannel, PollSession>>>,
    active: ActiveSet,
    sink: broadcast::Sender<LiveEvent>,
    router: JoinHandle<()>,
}

/// One running poll loop
struct PollSession {
    task_handle: JoinHandle<()>,
    stop_tx: mpsc::Sender<()>,
    interval: Duration,
}

impl LivePoller {
    pub fn new(handle: UnifiedSerialHandle, token: CancelToken) -> Self {
        let (sink, _) = broadcast::channel(SINK_CAPACITY);
        let active: ActiveSet = Arc::new(RwLock::new(HashSet::new()));
        let router = tokio::spawn(route_events(
            handle.subscribe_events(),
            token.clone(),
            active.clone(),
            sink.clone(),
        ));
        Self {
            handle,
            token,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            active,
            sink,
            router,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.sink.subscribe()
    }

    pub fn active_channels(&self) -> Vec<PollChannel> {
        match self.active.read() {
            Ok(set) => set.iter().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// True once the session was cancelled or its reader task exited.
    pub fn is_session_closed(&self) -> bool {
        self.token.is_cancelled() || self.handle.is_closed()
    }

    pub fn is_active(&self, channel: PollChannel) -> bool {
        is_active(&self.active, channel)
    }

    /// Interval of the poll loop running on `channel`, if any.
    pub async fn poll_interval(&self, channel: PollChannel) -> Option<Duration> {
        self.sessions.lock().await.get(&channel).map(|s| s.interval)
    }

    /// Start a poll loop. Only one poller per channel may run.
    pub async fn start_polling(&self, kind: PollKind, interval: Duration) -> Result<(), PollError> {
        if self.is_session_closed() {
            return Err(PollError::SessionClosed);
        }
        let channel = kind.channel();
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&channel) {
            log::warn!("Attempted to start {} poller that is already running", channel.as_str());
            return Err(PollError::AlreadyActive(channel));
        }

        set_active(&self.active, channel, true);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task_handle = tokio::spawn(poll_loop(
            kind,
            interval,
            self.handle.clone(),
            self.token.clone(),
            self.active.clone(),
            self.sink.clone(),
            stop_rx,
        ));
        sessions.insert(channel, PollSession { task_handle, stop_tx, interval });
        log::info!("Started {} poller every {:?}", channel.as_str(), interval);
        Ok(())
    }

    pub async fn stop_polling(&self, channel: PollChannel) -> Result<(), PollError> {
        // Deactivate before joining so the router drops replies still in flight.
        set_active(&self.active, channel, false);
        let session = self.sessions.lock().await.remove(&channel);
        match session {
            Some(session) => {
                stop_session(session).await;
                log::info!("Stopped {} poller", channel.as_str());
                Ok(())
            }
            None => Err(PollError::NotActive(channel)),
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(PollChannel, PollSession)> = {
            let mut sessions = self.sessions.lock().await;
            for channel in sessions.keys() {
                set_active(&self.active, *channel, false);
            }
            sessions.drain().collect()
        };
        for (channel, session) in drained {
            stop_session(session).await;
            log::debug!("Stopped {} poller", channel.as_str());
        }
    }

    /// Diagnostics modes are exclusive: stop everything, let stale replies
    /// drain, then start `kind`.
    pub async fn switch_mode(&self, kind: PollKind, interval: Duration) -> Result<(), PollError> {
        self.stop_all().await;
        tokio::time::sleep(MODE_SWITCH_GRACE).await;
        self.start_polling(kind, interval).await
    }
}

impl Drop for LivePoller {
    fn drop(&mut self) {
        self.router.abort();
        if let Ok(mut sessions) = self.sessions.try_lock() {
            for (_, session) in sessions.drain() {
                session.task_handle.abort();
            }
        }
    }
}

async fn stop_session(session: PollSession) {
    let PollSession { mut task_handle, stop_tx, .. } = session;
    let _ = stop_tx.send(()).await;
    if timeout(STOP_JOIN_TIMEOUT, &mut task_handle).await.is_err() {
        log::warn!("Poll task did not stop within {:?}; aborting", STOP_JOIN_TIMEOUT);
        task_handle.abort();
    }
}

fn is_active(active: &ActiveSet, channel: PollChannel) -> bool {
    active.read().map(|set| set.contains(&channel)).unwrap_or(false)
}

fn set_active(active: &ActiveSet, channel: PollChannel, on: bool) {
    if let Ok(mut set) = active.write() {
        if on {
            set.insert(channel);
        } else {
            set.remove(&channel);
        }
    }
}

fn clear_active(active: &ActiveSet) {
    if let Ok(mut set) = active.write() {
        set.clear();
    }
}

/// Forward classified replies for active channels until the session ends.
async fn route_events(
    mut events: broadcast::Receiver<ParsedEvent>,
    token: CancelToken,
    active: ActiveSet,
    sink: broadcast::Sender<LiveEvent>,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            evt = events.recv() => match evt {
                Ok(ParsedEvent::Live(evt)) => {
                    if is_active(&active, evt.channel()) {
                        let _ = sink.send(evt);
                    }
                }
                Ok(ParsedEvent::TransportLost { reason }) => {
                    log::info!("Live poll routing stopped: {}", reason);
                    break;
                }
                Ok(ParsedEvent::ProtocolNotice { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("Live router lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    clear_active(&active);
}

async fn poll_loop(
    kind: PollKind,
    interval: Duration,
    handle: UnifiedSerialHandle,
    token: CancelToken,
    active: ActiveSet,
    sink: broadcast::Sender<LiveEvent>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let channel = kind.channel();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if !is_active(&active, channel) {
                    break;
                }
                match poll_once(&kind, &handle, &token, &active, &sink).await {
                    Ok(()) => {}
                    Err(e) if e.is_transport_lost() => {
                        log::info!("{} poller stopping: {}", channel.as_str(), e);
                        break;
                    }
                    Err(SerialError::Cancelled) => break,
                    Err(e) => log::debug!("{} poll failed: {}", channel.as_str(), e),
                }
            }
        }
    }
    set_active(&active, channel, false);
}

async fn poll_once(
    kind: &PollKind,
    handle: &UnifiedSerialHandle,
    token: &CancelToken,
    active: &ActiveSet,
    sink: &broadcast::Sender<LiveEvent>,
) -> Result<(), SerialError> {
    match kind {
        PollKind::Pins(keys) => {
            if keys.is_empty() {
                return Ok(());
            }
            handle.send_lines(keys.iter().map(|k| format!("READPIN:{}", k)).collect()).await
        }
        PollKind::AxisValue => handle.send_line("READWHAMMY").await,
        PollKind::Joystick => handle.send_line("READJOYSTICK").await,
        PollKind::DeviceNameRefresh => {
            let resp = handle
                .request_cancellable("device-name-refresh", "READDEVICENAME", DeviceProtocol::device_name_spec(), token)
                .await?;
            if let Some(name) = DeviceProtocol::parse_device_name(&resp.payload) {
                if is_active(active, PollChannel::DeviceNameRefresh) {
                    let _ = sink.send(LiveEvent::DeviceName { name });
                }
            }
            Ok(())
        }
    }
}
