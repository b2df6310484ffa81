//! Realtime gateway.
//!
//! Owns the connection table and composes the room registry, the delivery
//! guard and the message store for every inbound event. One instance is
//! created at startup and shared by the WebSocket handler and the REST
//! handlers, so a message sent over HTTP reaches the same rooms as one sent
//! over a socket.
//!
//! Fan-out never blocks: each connection drains its own bounded queue, and a
//! member whose queue is full or gone simply misses that event.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gigroom_shared::protocol::{ClientEvent, InboundFrame, ServerEvent, Typing};
use gigroom_shared::{ConnectionId, JobId, UserId};
use gigroom_store::messages::validate_body;
use gigroom_store::{Message, ReadReceipt};

use crate::error::ServerError;
use crate::guard::DeliveryGuard;
use crate::rooms::{RoomRegistry, RoomSequencer};
use crate::store::MessageStore;

struct Peer {
    actor: UserId,
    tx: mpsc::Sender<ServerEvent>,
}

/// Rooms and peers live under one lock so that a broadcast sees a
/// consistent membership and enqueues in one step.
#[derive(Default)]
struct Hub {
    rooms: RoomRegistry,
    peers: HashMap<ConnectionId, Peer>,
}

pub struct Gateway {
    hub: Arc<Mutex<Hub>>,
    sequencer: Arc<RoomSequencer>,
    store: Arc<dyn MessageStore>,
    guard: DeliveryGuard,
    buffer: usize,
}

impl Gateway {
    pub fn new(store: Arc<dyn MessageStore>, guard: DeliveryGuard, buffer: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            sequencer: Arc::new(RoomSequencer::new()),
            store,
            guard,
            buffer: buffer.max(1),
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        lock(&self.hub)
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register a new connection for an authenticated actor. The returned
    /// receiver yields every event addressed to this connection.
    pub fn connect(&self, actor: UserId) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut hub = self.hub();
        hub.peers.insert(conn, Peer { actor: actor.clone(), tx });
        info!(conn = %conn, actor = %actor, peers = hub.peers.len(), "Connection opened");
        (conn, rx)
    }

    /// Drop a connection and its memberships. Safe to call more than once.
    pub fn disconnect(&self, conn: ConnectionId) {
        let mut hub = self.hub();
        let left = hub.rooms.leave_all(conn);
        if let Some(peer) = hub.peers.remove(&conn) {
            info!(
                conn = %conn,
                actor = %peer.actor,
                rooms = left.len(),
                "Connection closed"
            );
        }
    }

    pub fn members_of(&self, job: &JobId) -> HashSet<ConnectionId> {
        self.hub().rooms.members_of(job)
    }

    pub fn connection_count(&self) -> usize {
        self.hub().peers.len()
    }

    // -----------------------------------------------------------------------
    // Inbound events
    // -----------------------------------------------------------------------

    /// Handle one client frame to completion, then answer privately: an
    /// `ack` if the frame asked for one, an `error` on any failure.
    pub async fn dispatch(&self, conn: ConnectionId, frame: InboundFrame) {
        let Some(actor) = self.hub().peers.get(&conn).map(|p| p.actor.clone()) else {
            debug!(conn = %conn, "Frame from unknown connection ignored");
            return;
        };

        let request_id = frame.request_id.clone();
        let outcome = match ClientEvent::from_frame(&frame) {
            Ok(event) => {
                debug!(conn = %conn, event = event.name(), "Handling event");
                self.handle(conn, &actor, event).await
            }
            Err(e) => Err(e.into()),
        };

        match (outcome, request_id) {
            (Ok(()), Some(request_id)) => self.reply(conn, ServerEvent::Ack { request_id }),
            (Ok(()), None) => {}
            (Err(e), request_id) => {
                debug!(conn = %conn, event = %frame.event, error = %e, "Event rejected");
                self.reply(
                    conn,
                    ServerEvent::Error {
                        request_id,
                        code: e.code(),
                        message: e.public_message(),
                    },
                );
            }
        }
    }

    /// Answer a frame that could not even be parsed.
    pub fn reject_frame(&self, conn: ConnectionId, reason: &str) {
        let e = ServerError::BadFrame(reason.to_string());
        self.reply(
            conn,
            ServerEvent::Error {
                request_id: None,
                code: e.code(),
                message: e.public_message(),
            },
        );
    }

    async fn handle(
        &self,
        conn: ConnectionId,
        actor: &UserId,
        event: ClientEvent,
    ) -> Result<(), ServerError> {
        match event {
            ClientEvent::JoinRoom(p) => self.join_room(conn, actor, &p.job_id).await,
            ClientEvent::SendMessage(p) => {
                ensure_sender(actor, p.sender.as_deref())?;
                self.send_message(actor, &p.job_id, &p.receiver, &p.message)
                    .await
                    .map(|_| ())
            }
            ClientEvent::MarkAsRead(p) => self.mark_as_read(actor, &p.message_id).await.map(|_| ()),
            ClientEvent::Typing(p) => self.typing(conn, actor, &p, true),
            ClientEvent::StopTyping(p) => self.typing(conn, actor, &p, false),
        }
    }

    /// Join a job's room. A job the directory does not know yet still gets
    /// a room; an actor with no standing on a known job does not.
    pub async fn join_room(
        &self,
        conn: ConnectionId,
        actor: &UserId,
        job_id: &str,
    ) -> Result<(), ServerError> {
        let job = JobId::parse(job_id)?;
        match self.guard.authorize(actor, &job).await {
            Ok(_) | Err(ServerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.hub().rooms.join(conn, &job);
        Ok(())
    }

    /// Validate, authorize, persist and fan out a message. The sender is
    /// always the authenticated actor. Nothing is broadcast unless the append
    /// succeeded.
    ///
    /// The append and its broadcast run on their own task: once started they
    /// finish together even if the caller is dropped.
    pub async fn send_message(
        &self,
        actor: &UserId,
        job_id: &str,
        receiver: &str,
        body: &str,
    ) -> Result<Message, ServerError> {
        let job = JobId::parse(job_id)?;
        let receiver = UserId::parse(receiver)?;
        validate_body(body)?;
        self.guard.authorize(actor, &job).await?;

        let hub = self.hub.clone();
        let sequencer = self.sequencer.clone();
        let store = self.store.clone();
        let sender = actor.clone();
        let body = body.to_string();
        settle(tokio::spawn(async move {
            let _turn = sequencer.enter(&job).await;
            let message = store
                .append(job.as_str(), sender.as_str(), receiver.as_str(), &body)
                .await
                .inspect_err(|e| warn!(job = %job, actor = %sender, error = %e, "Append failed"))?;

            let event = ServerEvent::ReceiveMessage(message.clone().into());
            let delivered = fan_out(&lock(&hub), &job, &event);
            info!(
                job = %job,
                message = %message.id,
                delivered,
                "Message relayed"
            );
            Ok::<_, ServerError>(message)
        }))
        .await
    }

    /// Mark a message read on behalf of an actor with standing on its job.
    /// `messageRead` goes out only when the flag actually flipped. Like a
    /// send, the update and its broadcast are not split by a dropped caller.
    pub async fn mark_as_read(
        &self,
        actor: &UserId,
        message_id: &str,
    ) -> Result<ReadReceipt, ServerError> {
        let id = Uuid::parse_str(message_id)
            .map_err(|_| ServerError::NotFound(format!("message {message_id}")))?;
        let message = self.store.get(id).await?;
        self.guard.authorize(actor, &message.job_id).await?;

        let hub = self.hub.clone();
        let sequencer = self.sequencer.clone();
        let store = self.store.clone();
        let job = message.job_id;
        settle(tokio::spawn(async move {
            let _turn = sequencer.enter(&job).await;
            let receipt = store.mark_read(id).await?;
            if receipt.changed {
                let event = ServerEvent::MessageRead { message_id: id };
                let delivered = fan_out(&lock(&hub), &job, &event);
                debug!(job = %job, message = %id, delivered, "Read receipt relayed");
            }
            Ok::<_, ServerError>(receipt)
        }))
        .await
    }

    fn typing(
        &self,
        conn: ConnectionId,
        actor: &UserId,
        payload: &Typing,
        started: bool,
    ) -> Result<(), ServerError> {
        ensure_sender(actor, payload.sender.as_deref())?;
        let job = JobId::parse(&payload.job_id)?;

        let event = if started {
            ServerEvent::UserTyping { sender: actor.clone() }
        } else {
            ServerEvent::UserStoppedTyping { sender: actor.clone() }
        };

        let hub = self.hub();
        if !hub.rooms.is_member(conn, &job) {
            return Err(ServerError::Forbidden(format!("not joined to room {job}")));
        }
        fan_out(&hub, &job, &event);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads (REST)
    // -----------------------------------------------------------------------

    pub async fn history(&self, actor: &UserId, job: &JobId) -> Result<Vec<Message>, ServerError> {
        self.guard.authorize(actor, job).await?;
        self.store.list_by_job(job).await
    }

    /// Unread messages of a job addressed to the actor.
    pub async fn unread(&self, actor: &UserId, job: &JobId) -> Result<Vec<Message>, ServerError> {
        self.guard.authorize(actor, job).await?;
        self.store.unread_for(job, actor).await
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    fn reply(&self, conn: ConnectionId, event: ServerEvent) {
        let hub = self.hub();
        if let Some(peer) = hub.peers.get(&conn) {
            enqueue(conn, peer, event);
        }
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn settle<T>(task: JoinHandle<Result<T, ServerError>>) -> Result<T, ServerError> {
    task.await
        .map_err(|e| ServerError::Internal(format!("relay task failed: {e}")))?
}

/// Queue `event` for every member of the room. Returns how many accepted it.
fn fan_out(hub: &Hub, job: &JobId, event: &ServerEvent) -> usize {
    hub.rooms
        .members_of(job)
        .into_iter()
        .filter_map(|conn| hub.peers.get(&conn).map(|peer| (conn, peer)))
        .filter(|(conn, peer)| enqueue(*conn, peer, event.clone()))
        .count()
}

fn enqueue(conn: ConnectionId, peer: &Peer, event: ServerEvent) -> bool {
    let name = event.name();
    match peer.tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(conn = %conn, event = name, "Dropping event for slow connection");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(conn = %conn, event = name, "Dropping event for closed connection");
            false
        }
    }
}

/// A payload may name its sender, but only as the authenticated actor.
fn ensure_sender(actor: &UserId, claimed: Option<&str>) -> Result<(), ServerError> {
    match claimed {
        Some(claimed) if claimed != actor.as_str() => Err(ServerError::Forbidden(format!(
            "sender {claimed} does not match authenticated user"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use gigroom_shared::protocol::ErrorCode;
    use gigroom_store::{Database, JobParticipants};
    use serde_json::json;
    use std::time::Duration;

    use crate::jobs::SqliteJobDirectory;
    use crate::store::{SharedDatabase, SqliteMessageStore};

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    fn job(raw: &str) -> JobId {
        JobId::parse(raw).unwrap()
    }

    fn frame(event: &str, request_id: Option<&str>, data: serde_json::Value) -> InboundFrame {
        InboundFrame {
            event: event.into(),
            request_id: request_id.map(String::from),
            data,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn received_bodies(events: &[ServerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ReceiveMessage(m) => Some(m.message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Gateway over an in-memory database where A is the client of job-42
    /// and B an applicant, and D the client of job-7.
    async fn setup_with_buffer(buffer: usize) -> (Arc<Gateway>, SharedDatabase) {
        let db: SharedDatabase = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let jobs = Arc::new(SqliteJobDirectory::new(db.clone()));
        jobs.upsert(JobParticipants {
            job_id: job("job-42"),
            client: user("A"),
            applicants: vec![user("B")],
            hired_developer: None,
        })
        .await
        .unwrap();
        jobs.upsert(JobParticipants {
            job_id: job("job-7"),
            client: user("D"),
            applicants: vec![],
            hired_developer: None,
        })
        .await
        .unwrap();

        let store = Arc::new(SqliteMessageStore::new(db.clone()));
        let gateway = Gateway::new(store, DeliveryGuard::new(jobs), buffer);
        (Arc::new(gateway), db)
    }

    async fn setup() -> (Arc<Gateway>, SharedDatabase) {
        setup_with_buffer(64).await
    }

    /// Like [`setup`], but messages live in their own database so a test can
    /// stall appends without stalling the guard.
    async fn setup_with_separate_messages() -> (Arc<Gateway>, SharedDatabase) {
        let (directory, jobs_db) = setup().await;
        drop(directory);
        let jobs = Arc::new(SqliteJobDirectory::new(jobs_db));
        let messages: SharedDatabase = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let store = Arc::new(SqliteMessageStore::new(messages.clone()));
        let gateway = Gateway::new(store, DeliveryGuard::new(jobs), 64);
        (Arc::new(gateway), messages)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event")
            .expect("queue closed")
    }

    async fn join(gateway: &Gateway, conn: ConnectionId, job_id: &str) {
        gateway
            .dispatch(conn, frame("joinRoom", None, json!({ "jobId": job_id })))
            .await;
    }

    fn stored(db: &SharedDatabase, job_id: &str) -> Vec<Message> {
        db.lock().unwrap().list_messages_for_job(&job(job_id)).unwrap()
    }

    #[tokio::test]
    async fn send_persists_and_echoes_to_whole_room() {
        let (gateway, db) = setup().await;
        let (a, mut rx_a) = gateway.connect(user("A"));
        let (b, mut rx_b) = gateway.connect(user("B"));
        join(&gateway, a, "job-42").await;
        join(&gateway, b, "job-42").await;

        gateway
            .dispatch(
                a,
                frame(
                    "sendMessage",
                    Some("r-1"),
                    json!({ "jobId": "job-42", "sender": "A", "receiver": "B", "message": "hello" }),
                ),
            )
            .await;

        let history = stored(&db, "job-42");
        assert_eq!(history.len(), 1);
        assert!(!history[0].read);
        assert_eq!(history[0].sender, user("A"));

        let to_a = drain(&mut rx_a);
        assert_eq!(received_bodies(&to_a), vec!["hello"]);
        assert_eq!(
            to_a.last(),
            Some(&ServerEvent::Ack {
                request_id: "r-1".into()
            })
        );
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::ReceiveMessage(history[0].clone().into())]
        );
    }

    #[tokio::test]
    async fn read_receipt_is_broadcast_once() {
        let (gateway, db) = setup().await;
        let (a, mut rx_a) = gateway.connect(user("A"));
        let (b, mut rx_b) = gateway.connect(user("B"));
        join(&gateway, a, "job-42").await;
        join(&gateway, b, "job-42").await;

        let msg = gateway
            .send_message(&user("A"), "job-42", "B", "hello")
            .await
            .unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let mark = frame("markAsRead", None, json!({ "messageId": msg.id.to_string() }));
        gateway.dispatch(b, mark.clone()).await;

        assert!(stored(&db, "job-42")[0].read);
        let expected = ServerEvent::MessageRead { message_id: msg.id };
        assert_eq!(drain(&mut rx_a), vec![expected.clone()]);
        assert_eq!(drain(&mut rx_b), vec![expected]);

        gateway.dispatch(b, mark).await;
        assert!(stored(&db, "job-42")[0].read);
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn outsider_cannot_join_or_send() {
        let (gateway, db) = setup().await;
        let (a, mut rx_a) = gateway.connect(user("A"));
        let (b, mut rx_b) = gateway.connect(user("B"));
        let (c, mut rx_c) = gateway.connect(user("C"));
        join(&gateway, a, "job-42").await;
        join(&gateway, b, "job-42").await;

        gateway
            .dispatch(c, frame("joinRoom", Some("j-1"), json!({ "jobId": "job-42" })))
            .await;
        assert!(!gateway.members_of(&job("job-42")).contains(&c));

        gateway
            .dispatch(
                c,
                frame(
                    "sendMessage",
                    Some("s-1"),
                    json!({ "jobId": "job-42", "receiver": "A", "message": "let me in" }),
                ),
            )
            .await;

        assert!(stored(&db, "job-42").is_empty());
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());

        let codes: Vec<_> = drain(&mut rx_c)
            .into_iter()
            .map(|e| match e {
                ServerEvent::Error {
                    request_id, code, ..
                } => (request_id, code),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                (Some("j-1".to_string()), ErrorCode::Forbidden),
                (Some("s-1".to_string()), ErrorCode::Forbidden),
            ]
        );

        assert!(matches!(
            gateway.history(&user("C"), &job("job-42")).await,
            Err(ServerError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn spoofed_sender_is_rejected() {
        let (gateway, db) = setup().await;
        let (a, mut rx_a) = gateway.connect(user("A"));
        join(&gateway, a, "job-42").await;

        gateway
            .dispatch(
                a,
                frame(
                    "sendMessage",
                    None,
                    json!({ "jobId": "job-42", "sender": "B", "receiver": "A", "message": "hi" }),
                ),
            )
            .await;

        assert!(stored(&db, "job-42").is_empty());
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerEvent::Error {
                code: ErrorCode::Forbidden,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn typing_stays_in_its_room() {
        let (gateway, _db) = setup().await;
        let (a, mut rx_a) = gateway.connect(user("A"));
        let (b, mut rx_b) = gateway.connect(user("B"));
        let (d, mut rx_d) = gateway.connect(user("D"));
        join(&gateway, a, "job-42").await;
        join(&gateway, b, "job-42").await;
        join(&gateway, d, "job-7").await;

        gateway
            .dispatch(a, frame("typing", None, json!({ "jobId": "job-42", "sender": "A" })))
            .await;
        gateway
            .dispatch(a, frame("stopTyping", None, json!({ "jobId": "job-42" })))
            .await;

        let expected = vec![
            ServerEvent::UserTyping { sender: user("A") },
            ServerEvent::UserStoppedTyping { sender: user("A") },
        ];
        assert_eq!(drain(&mut rx_a), expected);
        assert_eq!(drain(&mut rx_b), expected);
        assert!(drain(&mut rx_d).is_empty());
    }

    #[tokio::test]
    async fn typing_requires_membership() {
        let (gateway, _db) = setup().await;
        let (a, _rx_a) = gateway.connect(user("A"));
        let (d, mut rx_d) = gateway.connect(user("D"));
        join(&gateway, a, "job-42").await;

        gateway
            .dispatch(d, frame("typing", Some("t-1"), json!({ "jobId": "job-42" })))
            .await;
        assert!(matches!(
            drain(&mut rx_d).as_slice(),
            [ServerEvent::Error {
                code: ErrorCode::Forbidden,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn disconnect_leaves_every_room() {
        let (gateway, _db) = setup().await;
        let (a, rx_a) = gateway.connect(user("A"));
        let (b, mut rx_b) = gateway.connect(user("B"));
        join(&gateway, a, "job-42").await;
        join(&gateway, a, "job-unknown").await;
        join(&gateway, b, "job-42").await;

        drop(rx_a);
        gateway.disconnect(a);
        gateway.disconnect(a);

        assert_eq!(gateway.members_of(&job("job-42")), HashSet::from([b]));
        assert!(gateway.members_of(&job("job-unknown")).is_empty());
        assert_eq!(gateway.connection_count(), 1);

        gateway
            .send_message(&user("B"), "job-42", "A", "still there?")
            .await
            .unwrap();
        assert_eq!(received_bodies(&drain(&mut rx_b)), vec!["still there?"]);
    }

    #[tokio::test]
    async fn unknown_job_still_joins() {
        let (gateway, _db) = setup().await;
        let (a, mut rx_a) = gateway.connect(user("A"));

        gateway
            .dispatch(a, frame("joinRoom", Some("j-1"), json!({ "jobId": "job-999" })))
            .await;

        assert!(gateway.members_of(&job("job-999")).contains(&a));
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEvent::Ack {
                request_id: "j-1".into()
            }]
        );
    }

    #[tokio::test]
    async fn bad_frames_get_private_errors() {
        let (gateway, _db) = setup().await;
        let (a, mut rx_a) = gateway.connect(user("A"));

        gateway.dispatch(a, frame("shout", Some("x-1"), json!({}))).await;
        gateway
            .dispatch(a, frame("markAsRead", Some("x-2"), json!({ "messageId": "nope" })))
            .await;
        gateway
            .dispatch(a, frame("joinRoom", Some("x-3"), json!({ "jobId": "not valid" })))
            .await;
        gateway.reject_frame(a, "expected JSON");

        let codes: Vec<_> = drain(&mut rx_a)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Error { code, .. } => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                ErrorCode::BadFrame,
                ErrorCode::NotFound,
                ErrorCode::Validation,
                ErrorCode::BadFrame,
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_senders_see_history_order() {
        let (gateway, db) = setup().await;
        let (a, mut rx_a) = gateway.connect(user("A"));
        let (b, mut rx_b) = gateway.connect(user("B"));
        join(&gateway, a, "job-42").await;
        join(&gateway, b, "job-42").await;

        let mut tasks = Vec::new();
        for i in 0..20 {
            let gateway = gateway.clone();
            let (from, to) = if i % 2 == 0 { ("A", "B") } else { ("B", "A") };
            tasks.push(tokio::spawn(async move {
                gateway
                    .send_message(&user(from), "job-42", to, &format!("m{i}"))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let history: Vec<String> = stored(&db, "job-42").into_iter().map(|m| m.body).collect();
        assert_eq!(history.len(), 20);
        assert_eq!(received_bodies(&drain(&mut rx_a)), history);
        assert_eq!(received_bodies(&drain(&mut rx_b)), history);
    }

    #[tokio::test]
    async fn slow_member_does_not_block_the_room() {
        let (gateway, _db) = setup_with_buffer(2).await;
        let (a, mut rx_a) = gateway.connect(user("A"));
        let (b, mut rx_b) = gateway.connect(user("B"));
        join(&gateway, a, "job-42").await;
        join(&gateway, b, "job-42").await;

        let mut seen_by_a = Vec::new();
        for body in ["one", "two", "three"] {
            gateway
                .send_message(&user("A"), "job-42", "B", body)
                .await
                .unwrap();
            seen_by_a.extend(drain(&mut rx_a));
        }

        assert_eq!(received_bodies(&seen_by_a), vec!["one", "two", "three"]);
        assert_eq!(received_bodies(&drain(&mut rx_b)), vec!["one", "two"]);
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn append(
            &self,
            _job_id: &str,
            _sender: &str,
            _receiver: &str,
            _body: &str,
        ) -> Result<Message, ServerError> {
            Err(ServerError::StoreUnavailable("disk full".into()))
        }

        async fn list_by_job(&self, _job_id: &JobId) -> Result<Vec<Message>, ServerError> {
            Err(ServerError::StoreUnavailable("disk full".into()))
        }

        async fn get(&self, _id: Uuid) -> Result<Message, ServerError> {
            Err(ServerError::StoreUnavailable("disk full".into()))
        }

        async fn mark_read(&self, _id: Uuid) -> Result<ReadReceipt, ServerError> {
            Err(ServerError::StoreUnavailable("disk full".into()))
        }

        async fn unread_for(
            &self,
            _job_id: &JobId,
            _receiver: &UserId,
        ) -> Result<Vec<Message>, ServerError> {
            Err(ServerError::StoreUnavailable("disk full".into()))
        }
    }

    #[tokio::test]
    async fn failed_append_is_never_broadcast() {
        let (healthy, db) = setup().await;
        drop(healthy);
        let jobs = Arc::new(SqliteJobDirectory::new(db));
        let gateway = Gateway::new(Arc::new(FailingStore), DeliveryGuard::new(jobs), 16);

        let (a, mut rx_a) = gateway.connect(user("A"));
        let (b, mut rx_b) = gateway.connect(user("B"));
        join(&gateway, a, "job-42").await;
        join(&gateway, b, "job-42").await;

        gateway
            .dispatch(
                a,
                frame(
                    "sendMessage",
                    Some("r-1"),
                    json!({ "jobId": "job-42", "receiver": "B", "message": "hello" }),
                ),
            )
            .await;

        assert!(drain(&mut rx_b).is_empty());
        match drain(&mut rx_a).as_slice() {
            [ServerEvent::Error {
                request_id,
                code,
                message,
            }] => {
                assert_eq!(request_id.as_deref(), Some("r-1"));
                assert_eq!(*code, ErrorCode::StoreUnavailable);
                assert!(!message.contains("disk full"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_send_still_reaches_the_room() {
        let (gateway, messages) = setup_with_separate_messages().await;
        let (b, mut rx_b) = gateway.connect(user("B"));
        join(&gateway, b, "job-42").await;

        // Stall the append, then drop the caller while it waits.
        let held = messages.lock().unwrap();
        let sending = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway
                    .send_message(&user("A"), "job-42", "B", "still delivered")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        sending.abort();
        assert!(sending.await.unwrap_err().is_cancelled());
        drop(held);

        let delivered = next_event(&mut rx_b).await;
        let history = stored(&messages, "job-42");
        assert_eq!(history.len(), 1);
        assert_eq!(delivered, ServerEvent::ReceiveMessage(history[0].clone().into()));
    }

    #[tokio::test]
    async fn sender_disconnecting_mid_send_keeps_the_message() {
        let (gateway, messages) = setup_with_separate_messages().await;
        let (a, rx_a) = gateway.connect(user("A"));
        let (b, mut rx_b) = gateway.connect(user("B"));
        join(&gateway, a, "job-42").await;
        join(&gateway, b, "job-42").await;

        let held = messages.lock().unwrap();
        let dispatching = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway
                    .dispatch(
                        a,
                        frame(
                            "sendMessage",
                            Some("r-1"),
                            json!({ "jobId": "job-42", "receiver": "B", "message": "bye" }),
                        ),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        dispatching.abort();
        drop(rx_a);
        gateway.disconnect(a);
        drop(held);

        assert_eq!(received_bodies(&[next_event(&mut rx_b).await]), vec!["bye"]);
        assert_eq!(stored(&messages, "job-42").len(), 1);
        assert_eq!(gateway.members_of(&job("job-42")), HashSet::from([b]));
    }

    #[tokio::test]
    async fn dropped_mark_as_read_still_broadcasts() {
        let (gateway, messages) = setup_with_separate_messages().await;
        let (a, mut rx_a) = gateway.connect(user("A"));
        join(&gateway, a, "job-42").await;
        let msg = gateway
            .send_message(&user("A"), "job-42", "B", "hello")
            .await
            .unwrap();
        drain(&mut rx_a);

        // Let the lookup through, then stall the update itself.
        let turn = gateway.sequencer.enter(&job("job-42")).await;
        let marking = {
            let gateway = gateway.clone();
            let id = msg.id.to_string();
            tokio::spawn(async move { gateway.mark_as_read(&user("B"), &id).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        marking.abort();
        drop(turn);

        assert_eq!(
            next_event(&mut rx_a).await,
            ServerEvent::MessageRead { message_id: msg.id }
        );
        assert!(stored(&messages, "job-42")[0].read);
    }

    #[tokio::test]
    async fn mark_as_read_unknown_message_is_not_found() {
        let (gateway, _db) = setup().await;
        let (a, mut rx_a) = gateway.connect(user("A"));
        let (b, mut rx_b) = gateway.connect(user("B"));
        join(&gateway, a, "job-42").await;
        join(&gateway, b, "job-42").await;

        let missing = Uuid::new_v4().to_string();
        gateway
            .dispatch(b, frame("markAsRead", Some("m-1"), json!({ "messageId": missing })))
            .await;

        assert!(drain(&mut rx_a).is_empty());
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [ServerEvent::Error {
                code: ErrorCode::NotFound,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn outsider_cannot_mark_as_read() {
        let (gateway, db) = setup().await;
        let (a, mut rx_a) = gateway.connect(user("A"));
        let (d, mut rx_d) = gateway.connect(user("D"));
        join(&gateway, a, "job-42").await;
        let msg = gateway
            .send_message(&user("A"), "job-42", "B", "private")
            .await
            .unwrap();
        drain(&mut rx_a);

        gateway
            .dispatch(
                d,
                frame("markAsRead", Some("m-1"), json!({ "messageId": msg.id.to_string() })),
            )
            .await;

        assert!(!stored(&db, "job-42")[0].read);
        assert!(drain(&mut rx_a).is_empty());
        assert!(matches!(
            drain(&mut rx_d).as_slice(),
            [ServerEvent::Error {
                code: ErrorCode::Forbidden,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn invalid_fields_are_rejected_before_the_guard() {
        let (gateway, db) = setup().await;

        for (receiver, body) in [("B", "   "), ("not valid", "hi")] {
            assert!(matches!(
                gateway.send_message(&user("C"), "job-42", receiver, body).await,
                Err(ServerError::Validation(_))
            ));
        }
        assert!(matches!(
            gateway.send_message(&user("C"), "job-42", "B", "hi").await,
            Err(ServerError::Forbidden(_))
        ));
        assert!(stored(&db, "job-42").is_empty());
    }
}
