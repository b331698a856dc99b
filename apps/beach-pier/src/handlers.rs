use std::{net::SocketAddr, time::Duration};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    codec::{error_response, standard_headers, streaming_response, Framing, WireWriter, X_ACCEPT},
    forward,
    registry::SessionRegistry,
};

/// Query parameters shared by every channel endpoint. `zx` (cache buster) and
/// `t` (attempt counter) are deliberately absent: they are ignored.
#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    #[serde(rename = "VER")]
    ver: Option<String>,
    #[serde(rename = "MODE")]
    mode: Option<String>,
    #[serde(rename = "TYPE")]
    channel_type: Option<String>,
    #[serde(rename = "DOMAIN")]
    domain: Option<String>,
    #[serde(rename = "SID")]
    sid: Option<String>,
    #[serde(rename = "RID")]
    rid: Option<String>,
    #[serde(rename = "AID")]
    aid: Option<i64>,
    #[serde(rename = "CVER")]
    cver: Option<String>,
    #[serde(rename = "OSID")]
    osid: Option<String>,
    #[serde(rename = "OAID")]
    oaid: Option<i64>,
    #[serde(rename = "CI")]
    ci: Option<String>,
}

impl ChannelQuery {
    fn framing(&self) -> Framing {
        Framing::from_query(self.channel_type.as_deref(), self.domain.as_deref())
    }
}

/// Mount the channel endpoints under the configured base path. Requests
/// outside the base are untouched, so this router merges into a larger app.
pub fn router(registry: SessionRegistry) -> Router {
    let base = registry.config().base.clone();
    let channel = Router::new()
        .route("/test", get(test_channel))
        .route("/bind", get(back_channel).post(forward_channel))
        .fallback(not_found)
        .with_state(registry);
    Router::new().nest(&base, channel)
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, standard_headers(), "Not found").into_response()
}

async fn test_channel(
    State(registry): State<SessionRegistry>,
    Query(query): Query<ChannelQuery>,
) -> Response {
    let framing = query.framing();
    if query.ver.as_deref() != Some("8") {
        return error_response(&framing, StatusCode::BAD_REQUEST, "Version 8 required");
    }

    if query.mode.as_deref() == Some("init") {
        let host_prefix = registry.config().pick_host_prefix();
        let body = json!([host_prefix, serde_json::Value::Null]).to_string();
        return (
            [(header::CONTENT_TYPE, "text/plain")],
            [(X_ACCEPT, "application/json; application/x-www-form-urlencoded")],
            standard_headers(),
            body,
        )
            .into_response();
    }

    // Buffering-proxy probe: clients watch whether the two chunks arrive
    // separately. A proxy that holds the response until it completes forces
    // the client onto the non-chunked (CI=1) back-channel mode.
    let (mut writer, rx) = WireWriter::new(framing.clone());
    tokio::spawn(async move {
        if writer.write_head().is_err() {
            return;
        }
        if writer.write_raw("11111").is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        let _ = writer.write_raw("2");
        writer.end();
    });
    streaming_response(&framing, rx)
}

/// POST /bind: the forward channel. Without `SID` this creates the session
/// and the response doubles as its first back channel.
async fn forward_channel(
    State(registry): State<SessionRegistry>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ChannelQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let framing = query.framing();
    if query.ver.as_deref() != Some("8") {
        return error_response(&framing, StatusCode::BAD_REQUEST, "Version 8 required");
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let decoded = match forward::decode(content_type, &body) {
        Ok(input) => input,
        Err(err) => {
            counter!("beach_pier_bad_data_total", 1);
            debug!(error = %err, "rejecting forward payload");
            return error_response(&framing, StatusCode::BAD_REQUEST, "Bad data");
        }
    };

    match query.sid.as_deref() {
        Some(sid) => {
            let Some(session) = registry.lookup(sid) else {
                return error_response(&framing, StatusCode::BAD_REQUEST, "Unknown SID");
            };
            if let Some(aid) = query.aid {
                session.raw().acknowledge(aid).await;
            }
            session.raw().received_data(decoded).await;

            let (present, last_sent, outstanding) = session.raw().forward_snapshot().await;
            let payload =
                json!([if present { 1 } else { 0 }, last_sent, outstanding]).to_string();
            (
                [(header::CONTENT_TYPE, "text/plain")],
                standard_headers(),
                format!("{}\n{}", payload.len(), payload),
            )
                .into_response()
        }
        None => {
            let session = registry
                .create(addr.ip(), query.cver.clone(), query.osid.as_deref(), query.oaid)
                .await;
            session.raw().received_data(decoded).await;

            // Initial back channel: always XHR-framed and non-chunked, so the
            // response completes as soon as the connect array is flushed.
            let (writer, rx) = WireWriter::new(Framing::Xhr);
            session.raw().set_back_channel(writer, false).await;
            streaming_response(&Framing::Xhr, rx)
        }
    }
}

/// GET /bind: park the response as the session's back channel.
async fn back_channel(
    State(registry): State<SessionRegistry>,
    Query(query): Query<ChannelQuery>,
) -> Response {
    let framing = query.framing();
    if query.ver.as_deref() != Some("8") {
        return error_response(&framing, StatusCode::BAD_REQUEST, "Version 8 required");
    }
    let Some(session) = query.sid.as_deref().and_then(|sid| registry.lookup(sid)) else {
        return error_response(&framing, StatusCode::BAD_REQUEST, "Unknown SID");
    };
    if query.rid.as_deref() != Some("rpc") {
        return error_response(&framing, StatusCode::BAD_REQUEST, "Bad data");
    }
    if let Some(aid) = query.aid {
        session.raw().acknowledge(aid).await;
    }

    let (mut writer, rx) = WireWriter::new(framing.clone());
    if writer.write_head().is_err() {
        return error_response(&framing, StatusCode::BAD_REQUEST, "Bad data");
    }
    let chunked = query.ci.as_deref() == Some("0");
    session.raw().set_back_channel(writer, chunked).await;
    streaming_response(&framing, rx)
}
