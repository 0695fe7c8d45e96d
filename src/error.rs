/// Errors raised by the protocol codec, the reassembler and the polling session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The first byte of a would-be frame start is not the header sentinel.
    #[error("Invalid frame header - expected=0xDD received={found:#04X}")]
    InvalidHeader { found: u8 },
    /// A buffer is too short for the frame or field being read.
    #[error("Invalid reply size - required={required} received={received}")]
    ReplySize { required: usize, received: usize },
    /// The byte stream no longer lines up with frame boundaries.
    #[error("Protocol desynchronization - expected={expected} received={received} bytes")]
    Desync { expected: usize, received: usize },
    /// A frame answered a different command than the one outstanding.
    #[error("Unexpected response - expected command={expected:#04X} received={received:#04X}")]
    UnexpectedResponse { expected: u8, received: u8 },
    /// A request was issued while the previous one is still unanswered.
    #[error("A request is already in flight")]
    RequestInFlight,
    /// A frame arrived while no request was outstanding.
    #[error("Unsolicited frame received")]
    UnsolicitedFrame,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Write error: {0}")]
    Write(String),
    #[cfg(feature = "ble")]
    #[error("Bluetooth error: {0}")]
    Ble(#[from] bluest::Error),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
