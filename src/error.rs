//! Error types for the Palette relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Palette rpc error: {0}")]
    PaletteRpc(String),

    #[error("Poly rpc error: {0}")]
    PolyRpc(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Cross-chain submit rejected: {0}")]
    Submit(SubmitErrorKind),

    #[error("Nonce error for sender {sender}: {message}")]
    Nonce { sender: String, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Signature verification error: {0}")]
    Signature(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("The genesis header has not been synced")]
    GenesisNotSynced,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classified outcome of a cross-chain submission, produced at the chain
/// client boundary so managers never match on raw error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitErrorKind {
    /// The target chain already applied this transfer.
    AlreadyDone,
    /// The relayer account cannot fund the submission right now.
    InsufficientFunds,
    /// Anything else; retried on the next tick.
    Other,
}

impl std::fmt::Display for SubmitErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitErrorKind::AlreadyDone => write!(f, "tx already done"),
            SubmitErrorKind::InsufficientFunds => write!(f, "insufficient funds"),
            SubmitErrorKind::Other => write!(f, "submit failed"),
        }
    }
}

impl SubmitErrorKind {
    /// Map a node error message onto a kind. The Poly node reports these
    /// conditions only through its message text.
    pub fn classify(message: &str) -> Self {
        if message.contains("tx already done") {
            SubmitErrorKind::AlreadyDone
        } else if message.contains("chooseUtxos, current utxo is not enough") {
            SubmitErrorKind::InsufficientFunds
        } else {
            SubmitErrorKind::Other
        }
    }
}

impl RelayerError {
    /// Check if the error is transient and worth retrying on the next tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::PaletteRpc(_)
                | RelayerError::PolyRpc(_)
                | RelayerError::Timeout { .. }
                | RelayerError::Submit(SubmitErrorKind::InsufficientFunds)
                | RelayerError::Submit(SubmitErrorKind::Other)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_submit_errors() {
        assert_eq!(
            SubmitErrorKind::classify("error: tx already done on chain"),
            SubmitErrorKind::AlreadyDone
        );
        assert_eq!(
            SubmitErrorKind::classify("chooseUtxos, current utxo is not enough"),
            SubmitErrorKind::InsufficientFunds
        );
        assert_eq!(
            SubmitErrorKind::classify("connection reset by peer"),
            SubmitErrorKind::Other
        );
    }

    #[test]
    fn already_done_is_not_retryable() {
        assert!(!RelayerError::Submit(SubmitErrorKind::AlreadyDone).is_retryable());
        assert!(RelayerError::Submit(SubmitErrorKind::InsufficientFunds).is_retryable());
    }
}
