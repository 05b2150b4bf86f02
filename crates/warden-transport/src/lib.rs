//! Framed transport and peer router: length-prefixed message framing over
//! TCP, outbound connection reuse, and request/response event
//! demultiplexing. Payloads are opaque bytes here — wire-envelope
//! serialization lives one layer up, in the broker.

pub mod codec;
pub mod connection;
pub mod events;
pub mod router;

pub use codec::{FrameCodec, FrameError};
pub use connection::ConnState;
pub use events::{LogLevel, RouterEvent};
pub use router::Router;
