//! Long-polling fallback transport speaking the version-8 browser channel
//! protocol: logically bidirectional ordered message streams for clients that
//! only have plain HTTP/1.1 request-response to work with.

pub mod codec;
pub mod config;
pub mod forward;
pub mod handlers;
pub mod registry;
pub mod session;
pub mod telemetry;

pub use config::ChannelConfig;
pub use handlers::router;
pub use registry::{ConnectHandler, SessionRegistry};
pub use session::{
    ArrayId, ChannelSession, DeliveryReceipt, SessionClosed, SessionEvent, SessionState,
};
