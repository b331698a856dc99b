use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use metrics::counter;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{codec::WireWriter, config::ChannelConfig, forward::ForwardInput};

/// Monotonic id of one server→client array within a session. `-1` marks
/// "nothing yet".
pub type ArrayId = i64;

/// Pending forward batches a session will hold while waiting for the gap to
/// fill. Past this the client is either broken or hostile.
const MAX_BUFFERED_BATCHES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Ok,
    Closed,
}

/// Events a session surfaces to the embedding application, in order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// One forward-channel map.
    Map(HashMap<String, String>),
    /// One forward-channel JSON message (a JSON batch item or a `_JSON` map value).
    Message(Value),
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Closed {
        reason: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("session closed: {reason}")]
pub struct SessionClosed {
    pub reason: String,
}

impl SessionClosed {
    fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

/// Receipt delivered once the client acknowledges an array, or once the
/// session closes with the array still outstanding.
pub type DeliveryReceipt = Result<(), SessionClosed>;

struct OutgoingArray {
    id: ArrayId,
    data: Value,
    sent: Option<oneshot::Sender<()>>,
    confirmed: Option<oneshot::Sender<DeliveryReceipt>>,
}

enum BufferedBatch {
    Maps(Vec<HashMap<String, String>>),
    Json(Vec<Value>),
}

impl BufferedBatch {
    fn len(&self) -> usize {
        match self {
            BufferedBatch::Maps(maps) => maps.len(),
            BufferedBatch::Json(items) => items.len(),
        }
    }
}

struct BackChannel {
    writer: WireWriter,
    /// `CI=0` on the bind request: the transport tolerates a hanging chunked
    /// response. When false the channel is closed after every payload.
    chunked: bool,
    epoch: u64,
    /// Disconnect watcher parked on the body channel's `closed()`. It holds
    /// its own sender clone, so it must be aborted on server-side teardown or
    /// the response body stream never ends.
    watcher: JoinHandle<()>,
}

struct SessionInner {
    state: SessionState,
    outgoing: VecDeque<OutgoingArray>,
    last_array_id: ArrayId,
    last_sent_array_id: ArrayId,
    next_map_offset: u64,
    buffered: HashMap<u64, BufferedBatch>,
    back_channel: Option<BackChannel>,
    bind_epoch: u64,
    heartbeat: Option<JoinHandle<()>>,
    timeout: Option<JoinHandle<()>>,
    flush_queued: bool,
}

impl SessionInner {
    fn queue_array(
        &mut self,
        data: Value,
        sent: Option<oneshot::Sender<()>>,
        confirmed: Option<oneshot::Sender<DeliveryReceipt>>,
    ) -> ArrayId {
        self.last_array_id += 1;
        self.outgoing.push_back(OutgoingArray {
            id: self.last_array_id,
            data,
            sent,
            confirmed,
        });
        self.last_array_id
    }

    fn acknowledge(&mut self, aid: ArrayId) {
        while let Some(front) = self.outgoing.front() {
            if front.id > aid {
                break;
            }
            if let Some(array) = self.outgoing.pop_front() {
                if let Some(tx) = array.confirmed {
                    let _ = tx.send(Ok(()));
                }
            }
        }
    }
}

/// One long-poll session: the outgoing array queue, the forward-channel
/// reorder buffer, the back-channel slot, and the two timers. All state lives
/// behind one mutex so every mutation is serialized.
pub(crate) struct Session {
    id: String,
    address: IpAddr,
    app_version: Option<String>,
    keep_alive_interval: Duration,
    session_timeout_interval: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Registry backref; the session removes itself on close.
    sessions: Weak<DashMap<String, Arc<Session>>>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        address: IpAddr,
        app_version: Option<String>,
        config: &ChannelConfig,
        sessions: Weak<DashMap<String, Arc<Session>>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            address,
            app_version,
            keep_alive_interval: config.keep_alive_interval,
            session_timeout_interval: config.session_timeout_interval,
            events,
            sessions,
            inner: Mutex::new(SessionInner {
                state: SessionState::Init,
                outgoing: VecDeque::new(),
                last_array_id: -1,
                last_sent_array_id: -1,
                next_map_offset: 0,
                buffered: HashMap::new(),
                back_channel: None,
                bind_epoch: 0,
                heartbeat: None,
                timeout: None,
                flush_queued: false,
            }),
        });
        (session, events_rx)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn address(&self) -> IpAddr {
        self.address
    }

    pub(crate) fn app_version(&self) -> Option<&str> {
        self.app_version.as_deref()
    }

    pub(crate) async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Queue the connect array and arm the session timeout. Called once by the
    /// registry before the session is handed to anyone else.
    pub(crate) async fn bootstrap(self: &Arc<Self>, connect_array: Value) {
        let mut inner = self.inner.lock().await;
        inner.queue_array(connect_array, None, None);
        self.arm_session_timeout(&mut inner);
    }

    pub(crate) async fn queue_and_flush(
        self: &Arc<Self>,
        data: Value,
        sent: Option<oneshot::Sender<()>>,
        confirmed: Option<oneshot::Sender<DeliveryReceipt>>,
    ) -> Result<ArrayId, SessionClosed> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(SessionClosed::new("Session closed"));
        }
        let id = inner.queue_array(data, sent, confirmed);
        self.schedule_flush(&mut inner);
        Ok(id)
    }

    pub(crate) async fn acknowledge(&self, aid: ArrayId) {
        let mut inner = self.inner.lock().await;
        inner.acknowledge(aid);
    }

    /// Bind a fresh back channel, evicting any previous one. Unacknowledged
    /// arrays are rewound so the new channel retransmits them.
    pub(crate) async fn set_back_channel(self: &Arc<Self>, writer: WireWriter, chunked: bool) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            writer.end();
            return;
        }
        if inner.back_channel.is_some() {
            self.clear_back_channel(&mut inner);
        }

        inner.bind_epoch += 1;
        let epoch = inner.bind_epoch;
        let disconnect = writer.disconnect_handle();

        // The response body stream going away (client disconnect, proxy reset)
        // must unbind this channel, and only this one.
        let weak = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            disconnect.closed().await;
            if let Some(session) = weak.upgrade() {
                session.clear_back_channel_if(epoch).await;
            }
        });

        inner.back_channel = Some(BackChannel {
            writer,
            chunked,
            epoch,
            watcher,
        });
        counter!("beach_pier_back_channel_binds_total", 1);

        if let Some(handle) = inner.timeout.take() {
            handle.abort();
        }
        self.arm_heartbeat(&mut inner);

        if let Some(front) = inner.outgoing.front() {
            inner.last_sent_array_id = front.id - 1;
        }

        self.schedule_flush(&mut inner);
    }

    pub(crate) async fn received_data(self: &Arc<Self>, input: ForwardInput) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        let (offset, batch) = match input {
            ForwardInput::Empty => return,
            ForwardInput::Maps { offset, maps } => (offset, BufferedBatch::Maps(maps)),
            ForwardInput::Json { offset, items } => (offset, BufferedBatch::Json(items)),
        };

        // Duplicate delivery from a client retry.
        if offset < inner.next_map_offset || inner.buffered.contains_key(&offset) {
            return;
        }
        inner.buffered.insert(offset, batch);

        while let Some(batch) = {
            let next = inner.next_map_offset;
            inner.buffered.remove(&next)
        } {
            let len = batch.len() as u64;
            match batch {
                BufferedBatch::Maps(maps) => {
                    for map in maps {
                        if inner.state == SessionState::Closed {
                            return;
                        }
                        let json_payload = map
                            .get("_JSON")
                            .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
                        let _ = self.events.send(SessionEvent::Map(map));
                        if let Some(value) = json_payload {
                            let _ = self.events.send(SessionEvent::Message(value));
                        }
                    }
                }
                BufferedBatch::Json(items) => {
                    for item in items {
                        if inner.state == SessionState::Closed {
                            return;
                        }
                        let _ = self.events.send(SessionEvent::Message(item));
                    }
                }
            }
            inner.next_map_offset += len;
        }

        // Anything still parked is waiting on a gap the client never filled.
        if inner.buffered.len() > MAX_BUFFERED_BATCHES {
            warn!(session_id = %self.id, offset, "forward reorder buffer overflow");
            self.close_locked(&mut inner, "Reorder buffer overflow");
        }
    }

    /// Ask the client to tear down: queue a `["stop"]` array. The returned
    /// receiver resolves once the array has been written to a back channel.
    pub(crate) async fn stop(self: &Arc<Self>) -> Result<oneshot::Receiver<()>, SessionClosed> {
        let (tx, rx) = oneshot::channel();
        self.queue_and_flush(json!(["stop"]), Some(tx), None).await?;
        Ok(rx)
    }

    pub(crate) async fn close(self: &Arc<Self>, reason: &str) {
        let mut inner = self.inner.lock().await;
        self.close_locked(&mut inner, reason);
    }

    /// Snapshot for the forward-channel POST reply:
    /// `(back channel bound, lastSentArrayId, outstanding sent bytes)`.
    pub(crate) async fn forward_snapshot(&self) -> (bool, ArrayId, usize) {
        let inner = self.inner.lock().await;
        let outstanding = inner
            .outgoing
            .iter()
            .filter(|array| array.id <= inner.last_sent_array_id)
            .map(|array| {
                serde_json::to_string(&array.data)
                    .map(|s| s.len())
                    .unwrap_or(0)
            })
            .sum();
        (
            inner.back_channel.is_some(),
            inner.last_sent_array_id,
            outstanding,
        )
    }

    /// Deliveries are deferred one scheduler turn so a burst of synchronous
    /// sends coalesces into a single wire payload.
    fn schedule_flush(self: &Arc<Self>, inner: &mut SessionInner) {
        if inner.flush_queued || inner.state == SessionState::Closed {
            return;
        }
        inner.flush_queued = true;
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut inner = session.inner.lock().await;
            inner.flush_queued = false;
            session.flush_locked(&mut inner);
        });
    }

    fn flush_locked(self: &Arc<Self>, inner: &mut SessionInner) {
        if inner.state == SessionState::Closed || inner.back_channel.is_none() {
            return;
        }
        if !self.send_pending(inner) {
            return;
        }
        if inner.state == SessionState::Init {
            self.change_state(inner, SessionState::Ok);
        }
        let close_after = inner
            .back_channel
            .as_ref()
            .map(|bc| !bc.chunked)
            .unwrap_or(false);
        if close_after {
            self.clear_back_channel(inner);
        }
    }

    fn send_pending(self: &Arc<Self>, inner: &mut SessionInner) -> bool {
        if inner.last_array_id <= inner.last_sent_array_id {
            return false;
        }
        let last_sent = inner.last_sent_array_id;
        let pending: Vec<Value> = inner
            .outgoing
            .iter()
            .filter(|array| array.id > last_sent)
            .map(|array| json!([array.id, array.data.clone()]))
            .collect();
        if pending.is_empty() {
            return false;
        }
        let Ok(mut payload) = serde_json::to_string(&pending) else {
            return false;
        };
        payload.push('\n');

        let write_ok = match inner.back_channel.as_mut() {
            Some(bc) => bc.writer.write(&payload).is_ok(),
            None => return false,
        };
        if !write_ok {
            // The peer vanished between the disconnect watcher and us.
            self.clear_back_channel(inner);
            return false;
        }

        inner.last_sent_array_id = inner.last_array_id;
        for array in inner
            .outgoing
            .iter_mut()
            .filter(|array| array.id > last_sent)
        {
            if let Some(tx) = array.sent.take() {
                let _ = tx.send(());
            }
        }
        true
    }

    fn clear_back_channel(self: &Arc<Self>, inner: &mut SessionInner) {
        if let Some(bc) = inner.back_channel.take() {
            bc.watcher.abort();
            bc.writer.end();
        }
        if let Some(handle) = inner.heartbeat.take() {
            handle.abort();
        }
        if inner.state != SessionState::Closed {
            self.arm_session_timeout(inner);
        }
    }

    async fn clear_back_channel_if(self: &Arc<Self>, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.back_channel.as_ref().map(|bc| bc.epoch) == Some(epoch) {
            debug!(session_id = %self.id, "back channel connection lost");
            self.clear_back_channel(&mut inner);
        }
    }

    fn arm_session_timeout(self: &Arc<Self>, inner: &mut SessionInner) {
        if let Some(handle) = inner.timeout.take() {
            handle.abort();
        }
        let weak = Arc::downgrade(self);
        let interval = self.session_timeout_interval;
        inner.timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(session) = weak.upgrade() {
                counter!("beach_pier_session_timeouts_total", 1);
                session.close("Timed out").await;
            }
        }));
    }

    fn arm_heartbeat(self: &Arc<Self>, inner: &mut SessionInner) {
        if let Some(handle) = inner.heartbeat.take() {
            handle.abort();
        }
        let weak = Arc::downgrade(self);
        let interval = self.keep_alive_interval;
        inner.heartbeat = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(session) = weak.upgrade() else {
                    return;
                };
                let mut inner = session.inner.lock().await;
                if inner.state == SessionState::Closed || inner.back_channel.is_none() {
                    return;
                }
                inner.queue_array(json!(["noop"]), None, None);
                counter!("beach_pier_heartbeats_total", 1);
                session.schedule_flush(&mut inner);
            }
        }));
    }

    fn change_state(&self, inner: &mut SessionInner, to: SessionState) {
        let from = std::mem::replace(&mut inner.state, to);
        let _ = self.events.send(SessionEvent::StateChanged { from, to });
    }

    fn close_locked(self: &Arc<Self>, inner: &mut SessionInner, reason: &str) {
        if inner.state == SessionState::Closed {
            return;
        }
        self.change_state(inner, SessionState::Closed);
        let _ = self.events.send(SessionEvent::Closed {
            reason: reason.to_string(),
        });
        if let Some(bc) = inner.back_channel.take() {
            bc.watcher.abort();
            bc.writer.end();
        }
        if let Some(handle) = inner.heartbeat.take() {
            handle.abort();
        }
        if let Some(handle) = inner.timeout.take() {
            handle.abort();
        }
        for array in inner.outgoing.drain(..) {
            if let Some(tx) = array.confirmed {
                let _ = tx.send(Err(SessionClosed::new(reason)));
            }
        }
        inner.buffered.clear();
        if let Some(sessions) = self.sessions.upgrade() {
            sessions.remove(&self.id);
        }
        counter!("beach_pier_sessions_closed_total", 1);
        debug!(session_id = %self.id, reason, "session closed");
    }
}

/// Application-facing handle to one session. Clones share the session.
#[derive(Clone)]
pub struct ChannelSession {
    session: Arc<Session>,
}

impl ChannelSession {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub(crate) fn raw(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub fn address(&self) -> IpAddr {
        self.session.address()
    }

    pub fn app_version(&self) -> Option<&str> {
        self.session.app_version()
    }

    pub async fn state(&self) -> SessionState {
        self.session.state().await
    }

    /// Queue one array for the client. Returns its id.
    pub async fn send(&self, data: Value) -> Result<ArrayId, SessionClosed> {
        self.session.queue_and_flush(data, None, None).await
    }

    /// Like [`send`](Self::send), also returning a receipt that resolves when
    /// the client acknowledges the array (or with an error if the session
    /// closes first). Redelivery after a back-channel swap means receipts are
    /// at-least-once from the client's point of view.
    pub async fn send_with_receipt(
        &self,
        data: Value,
    ) -> Result<(ArrayId, oneshot::Receiver<DeliveryReceipt>), SessionClosed> {
        let (tx, rx) = oneshot::channel();
        let id = self.session.queue_and_flush(data, None, Some(tx)).await?;
        Ok((id, rx))
    }

    /// Queue a `["stop"]` array telling the client to disconnect gracefully.
    /// The session stays open until the client reacts or [`close`](Self::close)
    /// is called; forward data arriving in between is still delivered.
    pub async fn stop(&self) -> Result<oneshot::Receiver<()>, SessionClosed> {
        self.session.stop().await
    }

    pub async fn close(&self, reason: Option<&str>) {
        self.session.close(reason.unwrap_or("Client closed")).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Framing;
    use bytes::Bytes;

    fn test_session() -> (Arc<Session>, mpsc::UnboundedReceiver<SessionEvent>) {
        Session::new(
            "testsid".to_string(),
            "127.0.0.1".parse().expect("loopback"),
            Some("99".to_string()),
            &ChannelConfig::default(),
            Weak::new(),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> String {
        let mut out = String::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push_str(std::str::from_utf8(&chunk).expect("utf8 chunk"));
        }
        out
    }

    async fn settle() {
        // Let spawned flush/watcher tasks run; under paused time this also
        // fires any timer that is due.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn flush_coalesces_queued_arrays_into_one_payload() {
        let (session, _events) = test_session();
        let (writer, mut rx) = WireWriter::new(Framing::Xhr);
        session.set_back_channel(writer, true).await;

        session
            .queue_and_flush(json!(["a"]), None, None)
            .await
            .expect("queue a");
        session
            .queue_and_flush(json!(["b"]), None, None)
            .await
            .expect("queue b");
        settle().await;

        let out = drain(&mut rx);
        let body = r#"[[0,["a"]],[1,["b"]]]"#;
        assert_eq!(out, format!("{}\n{}\n", body.len() + 1, body));
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_arrays_are_garbage_collected_in_order() {
        let (session, _events) = test_session();
        let (writer, _rx) = WireWriter::new(Framing::Xhr);
        session.set_back_channel(writer, true).await;

        let (_id0, rx0) = {
            let (tx, rx) = oneshot::channel();
            let id = session
                .queue_and_flush(json!(["m0"]), None, Some(tx))
                .await
                .expect("queue");
            (id, rx)
        };
        let (tx1, rx1) = oneshot::channel();
        session
            .queue_and_flush(json!(["m1"]), None, Some(tx1))
            .await
            .expect("queue");
        settle().await;

        session.acknowledge(0).await;
        assert_eq!(rx0.await.expect("receipt 0"), Ok(()));
        // id 1 is still outstanding.
        let (present, last_sent, outstanding) = session.forward_snapshot().await;
        assert!(present);
        assert_eq!(last_sent, 1);
        assert!(outstanding > 0);

        session.acknowledge(1).await;
        assert_eq!(rx1.await.expect("receipt 1"), Ok(()));
        let (_, _, outstanding) = session.forward_snapshot().await;
        assert_eq!(outstanding, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_back_channel_retransmits_unacked_arrays() {
        let (session, _events) = test_session();
        let (writer1, mut rx1) = WireWriter::new(Framing::Xhr);
        session.set_back_channel(writer1, true).await;
        session
            .queue_and_flush(json!(["lost"]), None, None)
            .await
            .expect("queue");
        settle().await;
        assert!(drain(&mut rx1).contains("lost"));

        // Client reconnects without having acknowledged array 0.
        let (writer2, mut rx2) = WireWriter::new(Framing::Xhr);
        session.set_back_channel(writer2, true).await;
        settle().await;

        // The first channel was ended by the replacement.
        assert!(rx1.try_recv().is_err());
        let out = drain(&mut rx2);
        assert!(out.contains(r#"[[0,["lost"]]]"#), "got: {out}");
    }

    #[tokio::test(start_paused = true)]
    async fn non_chunked_back_channel_closes_after_one_payload() {
        let (session, _events) = test_session();
        let (writer, mut rx) = WireWriter::new(Framing::Xhr);
        session.set_back_channel(writer, false).await;
        session
            .queue_and_flush(json!(["once"]), None, None)
            .await
            .expect("queue");
        settle().await;

        assert!(drain(&mut rx).contains("once"));
        // Sender dropped: the response stream has ended.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        let (present, _, _) = session.forward_snapshot().await;
        assert!(!present);
    }

    #[tokio::test(start_paused = true)]
    async fn forward_batches_are_reordered_by_offset() {
        let (session, mut events) = test_session();
        let map = |v: &str| {
            let mut m = HashMap::new();
            m.insert("v".to_string(), v.to_string());
            m
        };

        session
            .received_data(ForwardInput::Maps {
                offset: 2,
                maps: vec![map("2")],
            })
            .await;
        assert!(events.try_recv().is_err());

        session
            .received_data(ForwardInput::Maps {
                offset: 0,
                maps: vec![map("0"), map("1")],
            })
            .await;

        for expected in ["0", "1", "2"] {
            match events.try_recv().expect("map event") {
                SessionEvent::Map(m) => {
                    assert_eq!(m.get("v").map(String::as_str), Some(expected))
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_forward_batches_are_dropped() {
        let (session, mut events) = test_session();
        let batch = ForwardInput::Json {
            offset: 0,
            items: vec![json!("hello")],
        };
        session.received_data(batch.clone()).await;
        session.received_data(batch).await;

        assert!(matches!(
            events.try_recv().expect("message"),
            SessionEvent::Message(_)
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn json_map_values_are_parsed_into_messages() {
        let (session, mut events) = test_session();
        let mut map = HashMap::new();
        map.insert("_JSON".to_string(), r#"{"kind":"ping"}"#.to_string());
        session
            .received_data(ForwardInput::Maps {
                offset: 0,
                maps: vec![map],
            })
            .await;

        assert!(matches!(
            events.try_recv().expect("map"),
            SessionEvent::Map(_)
        ));
        match events.try_recv().expect("message") {
            SessionEvent::Message(value) => assert_eq!(value, json!({"kind": "ping"})),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reorder_buffer_overflow_closes_the_session() {
        let (session, mut events) = test_session();
        for offset in 0..MAX_BUFFERED_BATCHES as u64 + 1 {
            session
                .received_data(ForwardInput::Json {
                    // Leave offset 0 open so nothing drains.
                    offset: offset + 1,
                    items: vec![json!(offset)],
                })
                .await;
        }
        assert_eq!(session.state().await, SessionState::Closed);
        let mut saw_close = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Closed { reason } = event {
                assert_eq!(reason, "Reorder buffer overflow");
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test(start_paused = true)]
    async fn session_times_out_without_a_back_channel() {
        let (session, mut events) = test_session();
        session.bootstrap(json!(["c", "testsid", null, 8])).await;

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(session.state().await, SessionState::Closed);
        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Closed { reason: r } = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason.as_deref(), Some("Timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn bound_back_channel_suppresses_the_session_timeout() {
        let (session, _events) = test_session();
        session.bootstrap(json!(["c", "testsid", null, 8])).await;
        let (writer, _rx) = WireWriter::new(Framing::Xhr);
        session.set_back_channel(writer, true).await;
        settle().await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_ne!(session.state().await, SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_noops_flow_while_bound() {
        let (session, _events) = test_session();
        let (writer, mut rx) = WireWriter::new(Framing::Xhr);
        session.set_back_channel(writer, true).await;
        settle().await;

        tokio::time::sleep(Duration::from_secs(21)).await;
        let out = drain(&mut rx);
        assert!(out.contains(r#"["noop"]"#), "got: {out}");
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_response_stream_unbinds_the_back_channel() {
        let (session, _events) = test_session();
        let (writer, rx) = WireWriter::new(Framing::Xhr);
        session.set_back_channel(writer, true).await;
        settle().await;

        drop(rx);
        settle().await;

        let (present, _, _) = session.forward_snapshot().await;
        assert!(!present);
        // The session itself survives until its timeout.
        assert_ne!(session.state().await, SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_errors_outstanding_receipts_and_rejects_new_sends() {
        let (session, mut events) = test_session();
        let (tx, rx) = oneshot::channel();
        session
            .queue_and_flush(json!(["pending"]), None, Some(tx))
            .await
            .expect("queue");

        session.close("Going away").await;

        let receipt = rx.await.expect("receipt delivered");
        assert_eq!(receipt, Err(SessionClosed::new("Going away")));
        assert!(session
            .queue_and_flush(json!(["more"]), None, None)
            .await
            .is_err());

        let mut saw_state_change = false;
        let mut saw_close = false;
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::StateChanged { to, .. } => {
                    saw_state_change = to == SessionState::Closed
                }
                SessionEvent::Closed { reason } => {
                    assert_eq!(reason, "Going away");
                    saw_close = true;
                }
                _ => {}
            }
        }
        assert!(saw_state_change && saw_close);

        // close is idempotent.
        session.close("Again").await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_resolves_once_written_to_the_wire() {
        let (session, _events) = test_session();
        let (writer, mut rx) = WireWriter::new(Framing::Xhr);
        session.set_back_channel(writer, true).await;

        let stopped = session.stop().await.expect("stop queued");
        settle().await;

        assert!(drain(&mut rx).contains(r#"["stop"]"#));
        stopped.await.expect("sent callback fired");
    }
}
