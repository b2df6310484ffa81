//! WebSocket chat channel with automatic reconnect.
//!
//! A [`ChatChannel`] owns one background task that holds the socket. Calls
//! on the channel only queue commands, so emitting never waits on the
//! network and frames emitted while reconnecting go out once the socket is
//! back. After a reconnect every room joined so far, except those the server
//! refused, is joined again before anything else is sent.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use gigroom_shared::protocol::{ClientEvent, InboundFrame, JoinRoom, ServerEvent};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Reconnect attempts after a drop before giving up. Zero disables
    /// reconnecting.
    pub max_reconnect_attempts: u32,
    /// Delay before the first attempt; doubles on every failure.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Events buffered per [`ChatChannel::subscribe`] receiver.
    pub event_capacity: usize,
    /// How long [`ChatChannel::call`] waits for an ack.
    pub request_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            event_capacity: 256,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    Reconnecting,
    /// Closed by [`ChatChannel::disconnect`].
    Closed,
    /// Reconnect attempts exhausted.
    Failed,
}

pub(crate) enum Command {
    Send(InboundFrame),
    Close,
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ServerEvent>,
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
    rooms: Mutex<BTreeSet<String>>,
    /// Joins still waiting for the server's verdict, by request id.
    pending_joins: Mutex<HashMap<String, String>>,
    next_request: AtomicU64,
    state: watch::Sender<ChannelState>,
    closing: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    fn new(commands: mpsc::UnboundedSender<Command>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (state, _) = watch::channel(ChannelState::Connected);
        Self {
            commands,
            events,
            handlers: Mutex::new(HashMap::new()),
            rooms: Mutex::new(BTreeSet::new()),
            pending_joins: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            state,
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    fn next_request_id(&self) -> String {
        let n = self.next_request.fetch_add(1, Ordering::Relaxed);
        format!("req-{n}")
    }

    fn track_join(&self, job_id: &str, request_id: &str) {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.to_string());
        self.pending_joins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.to_string(), job_id.to_string());
    }

    /// A refused join must not be replayed after a reconnect.
    fn settle_join(&self, event: &ServerEvent) {
        let (request_id, refused) = match event {
            ServerEvent::Ack { request_id } => (request_id, false),
            ServerEvent::Error {
                request_id: Some(request_id),
                ..
            } => (request_id, true),
            _ => return,
        };
        let job_id = self
            .pending_joins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request_id);
        if let (Some(job_id), true) = (job_id, refused) {
            self.rooms
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&job_id);
            info!(room = %job_id, "Join refused, room dropped");
        }
    }

    /// Hand a server frame to the registered handlers, then to subscribers.
    fn deliver(&self, text: &str) {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed server frame");
                return;
            }
        };
        self.settle_join(&event);

        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.name())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(&event);
        }

        if let ServerEvent::Error { code, message, .. } = &event {
            debug!(?code, message = %message, "Server reported an error");
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn rejoin_frames(&self) -> Vec<InboundFrame> {
        let rooms: Vec<String> = self
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        rooms
            .into_iter()
            .filter_map(|job_id| {
                let request_id = self.next_request_id();
                self.track_join(&job_id, &request_id);
                ClientEvent::JoinRoom(JoinRoom { job_id })
                    .into_frame(Some(request_id))
                    .ok()
            })
            .collect()
    }
}

/// Where to (re)connect and with which credential.
struct Target {
    url: String,
    token: String,
}

impl Target {
    async fn open(&self) -> Result<WsStream, ClientError> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| ClientError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        let (ws, _response) = connect_async(request).await?;
        Ok(ws)
    }
}

/// Client side of a job chat connection.
///
/// Cloning is cheap; all clones drive the same socket.
#[derive(Clone)]
pub struct ChatChannel {
    shared: Arc<Shared>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    request_timeout: Duration,
}

impl ChatChannel {
    /// Open the channel. The first connection attempt is not retried.
    pub async fn connect(
        url: &str,
        token: &str,
        options: ChannelOptions,
    ) -> Result<Self, ClientError> {
        let target = Target {
            url: url.to_string(),
            token: token.to_string(),
        };
        let ws = target.open().await?;
        info!(url = %url, "Connected to chat server");

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(tx, options.event_capacity));
        let request_timeout = options.request_timeout;
        let task = tokio::spawn(run(shared.clone(), ws, target, rx, options));

        Ok(Self {
            shared,
            task: Arc::new(Mutex::new(Some(task))),
            request_timeout,
        })
    }

    /// Send an event without asking for an acknowledgement.
    pub fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.send(event, None)
    }

    /// Send an event with a fresh request id and return that id. The
    /// server answers it with a private `ack` or `error`.
    pub fn request(&self, event: ClientEvent) -> Result<String, ClientError> {
        let request_id = self.shared.next_request_id();
        self.send(event, Some(request_id.clone()))?;
        Ok(request_id)
    }

    /// Send an event and wait for the server's verdict on it.
    pub async fn call(&self, event: ClientEvent) -> Result<(), ClientError> {
        // Subscribe first so the answer cannot slip past.
        let mut events = self.subscribe();
        let request_id = self.request(event)?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::Ack { request_id: id }) if id == request_id => return Ok(()),
                    Ok(ServerEvent::Error {
                        request_id: Some(id),
                        code,
                        message,
                    }) if id == request_id => return Err(ClientError::Rejected { code, message }),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Subscriber lagged while waiting for ack");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Closed),
                }
            }
        };

        tokio::time::timeout(self.request_timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    fn send(&self, event: ClientEvent, request_id: Option<String>) -> Result<(), ClientError> {
        if matches!(self.state(), ChannelState::Closed | ChannelState::Failed) {
            return Err(ClientError::Closed);
        }
        // Joins always carry an id so a refusal can be matched to its room.
        let request_id = match &event {
            ClientEvent::JoinRoom(join) => {
                let request_id = request_id.unwrap_or_else(|| self.shared.next_request_id());
                self.shared.track_join(&join.job_id, &request_id);
                Some(request_id)
            }
            _ => request_id,
        };
        let frame = event.into_frame(request_id)?;
        self.shared
            .commands
            .send(Command::Send(frame))
            .map_err(|_| ClientError::Closed)
    }

    /// Run `handler` for every server event named `event`, e.g.
    /// `"receiveMessage"`.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Every server event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Rooms that will be rejoined after a reconnect. A room drops out once
    /// the server refuses its join.
    pub fn joined_rooms(&self) -> Vec<String> {
        self.shared
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Close the socket and stop reconnecting. Frames already emitted are
    /// flushed first.
    pub async fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let _ = self.shared.commands.send(Command::Close);
        self.shared.shutdown.notify_one();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Channel task failed");
            }
        }
        self.shared.set_state(ChannelState::Closed);
    }

    /// A channel with no socket behind it; commands land in the returned
    /// receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            shared: Arc::new(Shared::new(tx, 16)),
            task: Arc::new(Mutex::new(None)),
            request_timeout: Duration::from_millis(100),
        };
        (channel, rx)
    }
}

enum SessionEnd {
    Closed,
    Dropped,
}

async fn run(
    shared: Arc<Shared>,
    mut ws: WsStream,
    target: Target,
    mut commands: mpsc::UnboundedReceiver<Command>,
    options: ChannelOptions,
) {
    let mut replay = Vec::new();
    loop {
        if let SessionEnd::Closed = session(&shared, ws, &mut commands, replay).await {
            shared.set_state(ChannelState::Closed);
            return;
        }
        if shared.closing.load(Ordering::SeqCst) {
            shared.set_state(ChannelState::Closed);
            return;
        }

        shared.set_state(ChannelState::Reconnecting);
        match reconnect(&shared, &target, &options).await {
            Some(next) => {
                ws = next;
                replay = shared.rejoin_frames();
                shared.set_state(ChannelState::Connected);
            }
            None if shared.closing.load(Ordering::SeqCst) => {
                shared.set_state(ChannelState::Closed);
                return;
            }
            None => {
                warn!(
                    attempts = options.max_reconnect_attempts,
                    "Giving up on chat server"
                );
                shared.set_state(ChannelState::Failed);
                return;
            }
        }
    }
}

async fn reconnect(shared: &Shared, target: &Target, options: &ChannelOptions) -> Option<WsStream> {
    let mut delay = options.initial_backoff;
    for attempt in 1..=options.max_reconnect_attempts {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.shutdown.notified() => return None,
        }
        match target.open().await {
            Ok(ws) => {
                info!(attempt, "Reconnected to chat server");
                return Some(ws);
            }
            Err(e) => warn!(attempt, error = %e, "Reconnect failed"),
        }
        delay = (delay * 2).min(options.max_backoff);
    }
    None
}

async fn session(
    shared: &Shared,
    ws: WsStream,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    replay: Vec<InboundFrame>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    for frame in replay {
        if let Err(e) = send_frame(&mut sink, &frame).await {
            warn!(error = %e, "Failed to rejoin room");
            return SessionEnd::Dropped;
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => {
                    if let Err(e) = send_frame(&mut sink, &frame).await {
                        warn!(event = %frame.event, error = %e, "Send failed, frame lost");
                        return SessionEnd::Dropped;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = sink.close().await;
                    info!("Chat channel closed");
                    return SessionEnd::Closed;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.deliver(text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    info!("Chat server closed the connection");
                    return SessionEnd::Dropped;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Chat connection lost");
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WsStream, Message>,
    frame: &InboundFrame,
) -> Result<(), ClientError> {
    let text = serde_json::to_string(frame).map_err(gigroom_shared::ProtocolError::from)?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use gigroom_shared::protocol::{SendMessage, Typing};
    use gigroom_shared::UserId;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn frames(rx: &mut mpsc::UnboundedReceiver<Command>) -> Vec<InboundFrame> {
        let mut out = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let Command::Send(frame) = command {
                out.push(frame);
            }
        }
        out
    }

    fn join(job_id: &str) -> ClientEvent {
        ClientEvent::JoinRoom(JoinRoom {
            job_id: job_id.into(),
        })
    }

    #[test]
    fn emit_tracks_joined_rooms() {
        let (channel, mut rx) = ChatChannel::detached();
        channel.emit(join("job-42")).unwrap();
        channel.emit(join("job-42")).unwrap();
        channel
            .emit(ClientEvent::Typing(Typing {
                job_id: "job-42".into(),
                sender: None,
            }))
            .unwrap();

        assert_eq!(channel.joined_rooms(), vec!["job-42".to_string()]);
        let sent: Vec<_> = frames(&mut rx).into_iter().map(|f| f.event).collect();
        assert_eq!(sent, vec!["joinRoom", "joinRoom", "typing"]);
    }

    #[test]
    fn refused_join_is_not_replayed() {
        let (channel, mut rx) = ChatChannel::detached();
        channel.emit(join("job-42")).unwrap();
        channel.emit(join("job-7")).unwrap();
        let ids: Vec<_> = frames(&mut rx)
            .into_iter()
            .map(|f| f.request_id.expect("joins carry a request id"))
            .collect();

        channel.shared.deliver(
            &serde_json::json!({ "event": "ack", "data": { "requestId": ids[0] } }).to_string(),
        );
        channel.shared.deliver(
            &serde_json::json!({
                "event": "error",
                "data": { "requestId": ids[1], "code": "forbidden", "message": "no standing" }
            })
            .to_string(),
        );

        assert_eq!(channel.joined_rooms(), vec!["job-42".to_string()]);
        let replay: Vec<_> = channel
            .shared
            .rejoin_frames()
            .into_iter()
            .map(|f| f.data["jobId"].clone())
            .collect();
        assert_eq!(replay, vec![serde_json::json!("job-42")]);
    }

    #[test]
    fn requests_get_distinct_ids() {
        let (channel, mut rx) = ChatChannel::detached();
        let send = || {
            ClientEvent::SendMessage(SendMessage {
                job_id: "job-42".into(),
                sender: None,
                receiver: "B".into(),
                message: "hi".into(),
            })
        };
        let first = channel.request(send()).unwrap();
        let second = channel.request(send()).unwrap();
        assert_ne!(first, second);

        let ids: Vec<_> = frames(&mut rx).into_iter().map(|f| f.request_id).collect();
        assert_eq!(ids, vec![Some(first), Some(second)]);
    }

    #[tokio::test]
    async fn deliver_reaches_handlers_and_subscribers() {
        let (channel, _rx) = ChatChannel::detached();
        let typing_seen = Arc::new(AtomicUsize::new(0));
        {
            let typing_seen = typing_seen.clone();
            channel.on("userTyping", move |_| {
                typing_seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        let mut events = channel.subscribe();

        channel
            .shared
            .deliver(r#"{"event":"userTyping","data":{"sender":"A"}}"#);
        channel
            .shared
            .deliver(r#"{"event":"messageRead","data":{"messageId":"not-a-uuid"}}"#);

        assert_eq!(typing_seen.load(Ordering::SeqCst), 1);
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            ServerEvent::UserTyping {
                sender: UserId::parse("A").unwrap()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn call_maps_errors_and_times_out() {
        let (channel, mut rx) = ChatChannel::detached();

        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call(join("job-42")).await })
        };
        // Answer the request the way the server would.
        let frame = loop {
            if let Some(frame) = frames(&mut rx).pop() {
                break frame;
            }
            tokio::task::yield_now().await;
        };
        let reply = serde_json::json!({
            "event": "error",
            "data": {
                "requestId": frame.request_id,
                "code": "forbidden",
                "message": "no standing"
            }
        });
        channel.shared.deliver(&reply.to_string());

        match pending.await.unwrap() {
            Err(ClientError::Rejected { message, .. }) => assert_eq!(message, "no standing"),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            channel.call(join("job-7")).await,
            Err(ClientError::Timeout)
        ));
    }

    #[tokio::test]
    async fn closed_channel_refuses_events() {
        let (channel, _rx) = ChatChannel::detached();
        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(channel.emit(join("job-42")), Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn rejoins_rooms_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (rejoined_tx, rejoined_rx) = oneshot::channel();

        tokio::spawn(async move {
            // First session: read the join, then drop the socket.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            drop(ws);

            // Second session: the first frame must be the replayed join.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let frame: InboundFrame = serde_json::from_str(text.as_str()).unwrap();
                let _ = rejoined_tx.send(frame);
            }
            // Hold the connection open until the client hangs up.
            while ws.next().await.is_some() {}
        });

        let options = ChannelOptions {
            initial_backoff: Duration::from_millis(10),
            ..ChannelOptions::default()
        };
        let channel = ChatChannel::connect(&url, "token", options).await.unwrap();
        let mut states = channel.state_changes();
        channel.emit(join("job-42")).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), rejoined_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.event, "joinRoom");
        assert_eq!(frame.data["jobId"], "job-42");

        states
            .wait_for(|s| *s == ChannelState::Connected)
            .await
            .unwrap();
        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}
