//! Error types for sparsh-io

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// sparsh-io error types
///
/// Transport and lifecycle faults are returned to the caller of the
/// operation that hit them. Protocol anomalies (checksum mismatches,
/// frame resyncs, packet loss) are never surfaced here: they are logged
/// and absorbed by the parsing/decoding layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No device with the requested vendor/product id is attached
    #[error("device {vendor_id:04x}:{product_id:04x} not found")]
    DeviceNotFound {
        /// USB vendor id
        vendor_id: u16,
        /// USB product id
        product_id: u16,
    },

    /// Exclusive access to a USB interface could not be obtained
    #[error("failed to claim usb interface {0}")]
    InterfaceClaimFailed(u8),

    /// The streaming-mode handshake did not complete
    #[error("failed to init streaming mode")]
    StreamInitFailed,

    /// Configuration record read/write transferred too few bytes
    #[error("device config transfer failed: {0}")]
    ConfigIoFailed(String),

    /// Generic short or failed USB transfer
    #[error("usb transfer failed: {0}")]
    UsbIoFailed(String),

    /// Device has been unplugged or the link dropped
    #[error("device disconnected")]
    Disconnected,

    /// Endpoint stall or other pipe-level protocol error
    #[error("usb protocol error: {0}")]
    ProtocolError(String),

    /// Device delivered more data than the host buffer could hold
    #[error("usb buffer overflow")]
    BufferOverflow,

    /// Device or endpoint is busy
    #[error("device busy")]
    DeviceBusy,

    /// Asynchronous write did not complete within its deadline
    #[error("write timed out")]
    WriteTimeout,

    /// Operation attempted on a closed device handle
    #[error("device already closed")]
    DeviceClosed,

    /// Operation attempted on a torn-down packet engine
    #[error("packet engine already shut down")]
    EngineShutDown,

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A worker thread panicked
    #[error("worker thread panicked")]
    ThreadPanic,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file parse error
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration file serialization error
    #[error("config error: {0}")]
    ConfigSer(#[from] toml::ser::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
