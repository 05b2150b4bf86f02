use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Warn,
    Error,
}

/// Everything the router surfaces to its owner. A request carries the
/// `requesterId` tagging the inbound connection it arrived on, so a later
/// `Respond` can be routed back onto the same socket.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    Request { payload: Bytes, requester_id: u64 },
    Response { payload: Bytes },
    Disconnect { remote_addr: String },
    Log { level: LogLevel, message: String },
}
