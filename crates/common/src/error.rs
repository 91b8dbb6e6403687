// Error taxonomy shared by the control channel, instance state machine,
// and subprocess adapter.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame, wrong protocol version, or unknown `cmd`.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A command arrived in a lifecycle state that doesn't accept it.
    #[error("precondition failed: {0}")]
    PreconditionFailure(String),

    /// Configured provider is outside {ProviderA, ProviderB, Proxy}.
    #[error("provider unsupported: {0}")]
    ProviderUnsupported(String),

    /// A bounded poll (address, forwarded port, host key) never completed.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A mandatory subprocess exited non-zero.
    #[error("subprocess failed: {0}")]
    SubprocessFailure(String),

    /// Control-channel network error; caller should reconnect.
    #[error("control channel connectivity lost: {0}")]
    TransientConnectivityLoss(String),

    /// Shutdown requested via signal or the admin socket; not a failure.
    #[error("operator requested termination: {0}")]
    OperatorTermination(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
