use axum::{
    body::Body,
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};

/// Padding blob appended after the first HTML-framed payload. Old IE builds
/// and several intercepting proxies sit on small responses; this pushes the
/// first script tag past their read buffers. The bytes are fixed for
/// wire compatibility with deployed clients.
pub const IE_JUNK: &str = "7cca69475363026330a0d99468e88d23ce95e222591126443015f5f462d9a177186c8701fb45a6ffee0daf1a178fc0f58cd309308fba7e6f011ac38c9cdd4580760f1d4560a84d5ca0355ecbbed2ab715a3350fe0c479050640bd0e77acec90c58c4d3dd0f5cf8d4510e68c8b12e087bd88cad349aafd2ab16b07b0b1b8276091217a44a9fe92fedacffff48092ee693af\n";

pub const X_ACCEPT: HeaderName = HeaderName::from_static("x-accept");

/// Response framing, chosen per request from the `TYPE` query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Length-prefixed plain text for XHR-capable clients.
    Xhr,
    /// `<script>` tags streamed into a hidden iframe for legacy browsers.
    Html { domain: Option<String> },
}

impl Framing {
    pub fn from_query(channel_type: Option<&str>, domain: Option<&str>) -> Self {
        match channel_type {
            Some("html") => Framing::Html {
                domain: domain.filter(|d| !d.is_empty()).map(str::to_string),
            },
            _ => Framing::Xhr,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Framing::Xhr => "text/plain",
            Framing::Html { .. } => "text/html",
        }
    }
}

#[derive(Debug, Error)]
#[error("response channel closed by peer")]
pub struct WriterClosed;

/// Streaming response writer shared by the back channel and the `/test`
/// buffering probe. Chunks flow through an unbounded channel into the hyper
/// response body; the sender half doubles as the disconnect signal.
pub struct WireWriter {
    framing: Framing,
    tx: mpsc::UnboundedSender<Bytes>,
    wrote_payload: bool,
}

impl WireWriter {
    pub fn new(framing: Framing) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                framing,
                tx,
                wrote_payload: false,
            },
            rx,
        )
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    /// Sender clone used to watch for the underlying connection going away.
    pub fn disconnect_handle(&self) -> mpsc::UnboundedSender<Bytes> {
        self.tx.clone()
    }

    pub fn write_head(&mut self) -> Result<(), WriterClosed> {
        if let Framing::Html { domain } = &self.framing {
            let domain = domain.clone();
            self.send("<html><body>".into())?;
            if let Some(domain) = domain {
                let encoded =
                    serde_json::to_string(&domain).map_err(|_| WriterClosed)?;
                self.send(format!(
                    "<script>try{{document.domain = {encoded};}}catch(e){{}}</script>\n"
                ))?;
            }
        }
        Ok(())
    }

    /// Frame and write one payload.
    pub fn write(&mut self, payload: &str) -> Result<(), WriterClosed> {
        match &self.framing {
            Framing::Xhr => {
                self.send(format!("{}\n{}", payload.len(), payload))?;
            }
            Framing::Html { .. } => {
                self.write_script(payload)?;
            }
        }
        Ok(())
    }

    /// Write without the XHR length prefix. Identical to `write` under HTML
    /// framing, where every payload must ride inside a script tag anyway.
    pub fn write_raw(&mut self, payload: &str) -> Result<(), WriterClosed> {
        match &self.framing {
            Framing::Xhr => self.send(payload.to_string()),
            Framing::Html { .. } => self.write_script(payload),
        }
    }

    pub fn end(mut self) {
        if let Framing::Html { .. } = &self.framing {
            let _ = self.send("<script>try  {parent.d(); }catch (e){}</script>\n".to_string());
        }
        // Dropping the sender terminates the body stream.
    }

    fn write_script(&mut self, payload: &str) -> Result<(), WriterClosed> {
        let encoded = serde_json::to_string(payload).map_err(|_| WriterClosed)?;
        let mut chunk =
            format!("<script>try {{parent.m({encoded})}} catch(e) {{}}</script>\n");
        if !self.wrote_payload {
            chunk.push_str(IE_JUNK);
        }
        self.send(chunk)?;
        self.wrote_payload = true;
        Ok(())
    }

    fn send(&mut self, chunk: String) -> Result<(), WriterClosed> {
        self.tx
            .send(Bytes::from(chunk))
            .map_err(|_| WriterClosed)
    }
}

/// Cache-defeating headers carried by every channel response.
pub fn standard_headers() -> [(HeaderName, &'static str); 4] {
    [
        (
            header::CACHE_CONTROL,
            "no-cache, no-store, max-age=0, must-revalidate",
        ),
        (header::PRAGMA, "no-cache"),
        (header::EXPIRES, "Fri, 01 Jan 1990 00:00:00 GMT"),
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    ]
}

/// Build the streaming response whose body is fed by a [`WireWriter`].
pub fn streaming_response(framing: &Framing, rx: mpsc::UnboundedReceiver<Bytes>) -> Response {
    let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    (
        [(header::CONTENT_TYPE, framing.content_type())],
        standard_headers(),
        Body::from_stream(stream),
    )
        .into_response()
}

/// One-shot error reply in the requested framing. XHR clients get the status
/// and message verbatim; iframe clients cannot observe HTTP status from a
/// script tag, so HTML errors are a 200 carrying an `rpcClose` call.
pub fn error_response(framing: &Framing, status: StatusCode, message: &str) -> Response {
    match framing {
        Framing::Xhr => (
            status,
            standard_headers(),
            [(header::CONTENT_TYPE, "text/plain")],
            message.to_string(),
        )
            .into_response(),
        Framing::Html { .. } => {
            let encoded = serde_json::to_string(message).unwrap_or_else(|_| "\"\"".to_string());
            let body = format!("<script>try {{parent.rpcClose({encoded})}} catch(e){{}}</script>");
            (
                StatusCode::OK,
                standard_headers(),
                [(header::CONTENT_TYPE, "text/html")],
                body,
            )
                .into_response()
        }
    }
}
