/// Process-level setup failures. Any of these exits nonzero.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tun error: {0}")]
    Tun(#[from] tidy_tuntap::error::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key material: {0}")]
    Key(String),
}

/// Malformed frames at the IP/TCP boundary. These are logged and the
/// datagram dropped; no connection state is touched.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum ParseError {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("bad {0}")]
    BadField(&'static str),
}

/// Per-connection protocol failures, tagged by layer. The dispatcher
/// translates any of these into connection destruction; the listener
/// itself survives.
#[derive(Debug, thiserror::Error)]
pub enum Fatal {
    #[error("tls: {0}")]
    Tls(&'static str),

    #[error("tls: unsupported {0}")]
    Unsupported(&'static str),

    #[error("tls: record authentication failed")]
    BadRecordMac,

    #[error("tls: Finished verify_data mismatch")]
    BadFinished,

    #[error("tls: fatal alert {0} from peer")]
    PeerAlert(u8),

    #[error("h2: {0}")]
    Http2(&'static str),

    #[error("http: {0}")]
    Http1(&'static str),

    #[error("record sequence counter exhausted")]
    CounterExhausted,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
