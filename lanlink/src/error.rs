//! Error types for the link protocol engine.

use thiserror::Error;

/// Result type alias for lanlink operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error types for the protocol engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The named network interface does not exist.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// Opening the raw socket requires link-layer privilege.
    #[error("permission denied opening raw socket")]
    PermissionDenied,

    /// A frame could not be written to the wire.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A frame could not be read from the wire.
    #[error("receive failed: {0}")]
    RecvFailed(String),

    /// Fewer bytes than an Ethernet header were presented.
    #[error("malformed ethernet frame")]
    MalformedFrame,

    /// The PDU carries an unsupported protocol version.
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    /// The PDU type code is outside the known range.
    #[error("unknown pdu type {0}")]
    BadType(u8),

    /// The buffer ends before `payload_len` bytes of payload.
    #[error("truncated pdu")]
    Truncated,

    /// A type-specific payload body failed to decode.
    #[error("invalid payload for pdu type")]
    InvalidPayload,

    /// Payload exceeds what a single frame or transfer can carry.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Destination buffer is too small for the serialized form.
    #[error("buffer too small")]
    BufferTooSmall,

    /// `frag_index` is not addressable within `frag_total`.
    #[error("invalid fragment index")]
    InvalidFragmentIndex,

    /// A fragment disagrees with its reassembly slot on total or type.
    #[error("fragment mismatch")]
    FragmentMismatch,

    /// The engine has been shut down.
    #[error("engine is shut down")]
    Shutdown,

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
