use std::{net::IpAddr, sync::Arc};

use dashmap::DashMap;
use metrics::counter;
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    config::ChannelConfig,
    session::{ArrayId, ChannelSession, Session, SessionEvent},
};

/// Invoked once per created session, synchronously, after the session is
/// registered but before the creating request completes.
pub type ConnectHandler =
    Arc<dyn Fn(ChannelSession, mpsc::UnboundedReceiver<SessionEvent>) + Send + Sync>;

/// Process-wide map of live sessions. Sessions insert themselves here at
/// creation and remove themselves exactly once, on close.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    config: ChannelConfig,
    connect: ConnectHandler,
}

impl SessionRegistry {
    pub fn new(config: ChannelConfig, connect: ConnectHandler) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config: config.normalized(),
            connect,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Create and register a new session. When the client supplied the id of
    /// its previous session, that ghost is acknowledged up to `old_aid` and
    /// closed so its resources free up immediately.
    pub async fn create(
        &self,
        address: IpAddr,
        app_version: Option<String>,
        old_sid: Option<&str>,
        old_aid: Option<ArrayId>,
    ) -> ChannelSession {
        if let Some(old_sid) = old_sid {
            if let Some(old) = self.lookup(old_sid) {
                if let Some(aid) = old_aid {
                    old.raw().acknowledge(aid).await;
                }
                debug!(session_id = old_sid, "closing ghosted session");
                counter!("beach_pier_sessions_ghosted_total", 1);
                old.raw().close("Reconnected").await;
            }
        }

        let id = loop {
            let candidate = generate_session_id();
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let host_prefix = self.config.pick_host_prefix();

        let (session, events_rx) = Session::new(
            id.clone(),
            address,
            app_version,
            &self.config,
            Arc::downgrade(&self.sessions),
        );
        session
            .bootstrap(json!(["c", id.clone(), host_prefix, 8]))
            .await;
        self.sessions.insert(id.clone(), Arc::clone(&session));
        counter!("beach_pier_sessions_created_total", 1);
        info!(session_id = %id, address = %address, "session created");

        let handle = ChannelSession::new(session);
        (self.connect)(handle.clone(), events_rx);
        handle
    }

    pub fn lookup(&self, id: &str) -> Option<ChannelSession> {
        self.sessions
            .get(id)
            .map(|entry| ChannelSession::new(Arc::clone(entry.value())))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Random base-36 session id. 64 bits of entropy comfortably clears the
/// 40-bit floor the protocol asks for; uniqueness is still enforced against
/// the registry at create time.
fn generate_session_id() -> String {
    to_base36(rand::thread_rng().gen::<u64>())
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::with_capacity(13);
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}
