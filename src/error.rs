use thiserror::Error;

/// Failure taxonomy for the smart-account flow.
///
/// Every variant is fatal to the triggering call; nothing in this crate
/// retries internally. A signed, nonce-bound operation must not be re-sent
/// blindly, so transient failures are handed back to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// A required endpoint or address is absent at startup.
    #[error("missing configuration: {0}")]
    ConfigMissing(&'static str),

    /// The owner key is malformed or cannot produce a signature.
    #[error("invalid owner key: {0}")]
    InvalidKey(String),

    /// A numeric input cannot be represented in 256 bits (or failed to parse).
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    /// The paymaster declined sponsorship or was unreachable. The operation
    /// must not be submitted without valid `paymasterAndData`.
    #[error("sponsorship failed: {0}")]
    Unsponsored(String),

    /// The entry point refused the operation before inclusion.
    #[error("rejected by simulation: {0}")]
    RejectedBySimulation(String),

    /// RPC transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// The RPC endpoint answered with an error object or a malformed result.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// ABI encoding or parsing failed.
    #[error("abi error: {0}")]
    Abi(String),
}

impl From<ethers::providers::ProviderError> for Error {
    fn from(e: ethers::providers::ProviderError) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
