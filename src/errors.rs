//! Error types for the wallet engine
//!
//! All fallible operations below the account boundary return [`WalletResult`].
//! The account translates builder failures into [`TxValidationError`] before
//! they reach a caller, so user-facing errors carry a fixed identifier that a
//! UI can localize.

use thiserror::Error;

/// Validation errors for a transaction proposal.
///
/// The `Display` output of each variant is a fixed identifier and never
/// contains free-form text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum TxValidationError {
    #[error("feesNotAvailable")]
    FeesNotAvailable,
    #[error("invalidAddress")]
    InvalidAddress,
    #[error("invalidAmount")]
    InvalidAmount,
    #[error("insufficientFunds")]
    InsufficientFunds,
    #[error("feeTooLow")]
    FeeTooLow,
    #[error("accountNotSynced")]
    AccountNotSynced,
}

impl TxValidationError {
    /// The identifier exposed to user interfaces.
    pub fn id(&self) -> &'static str {
        match self {
            Self::FeesNotAvailable => "feesNotAvailable",
            Self::InvalidAddress => "invalidAddress",
            Self::InvalidAmount => "invalidAmount",
            Self::InsufficientFunds => "insufficientFunds",
            Self::FeeTooLow => "feeTooLow",
            Self::AccountNotSynced => "accountNotSynced",
        }
    }
}

/// Main error type for the wallet engine
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Transaction validation failed: {0}")]
    TxValidation(#[from] TxValidationError),

    #[error("Not available: {0}")]
    NotAvailable(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Aborted by the user")]
    UserAborted,

    #[error("Corrupt data: {0}")]
    Corruption(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid argument: {argument} - {message}")]
    InvalidArgument { argument: String, message: String },

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl WalletError {
    /// Shorthand for an [`WalletError::InvalidArgument`].
    pub fn invalid_argument(argument: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument: argument.into(),
            message: message.into(),
        }
    }

    /// Returns the validation error if this is one.
    pub fn tx_validation(&self) -> Option<TxValidationError> {
        match self {
            Self::TxValidation(err) => Some(*err),
            _ => None,
        }
    }

    /// Whether the error indicates on-disk corruption that warrants a quarantine.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}

impl From<rusqlite::Error> for WalletError {
    fn from(e: rusqlite::Error) -> Self {
        WalletError::StorageError(e.to_string())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(e: serde_json::Error) -> Self {
        WalletError::SerializationError(e.to_string())
    }
}

impl From<std::io::Error> for WalletError {
    fn from(e: std::io::Error) -> Self {
        WalletError::StorageError(e.to_string())
    }
}

impl From<hex::FromHexError> for WalletError {
    fn from(e: hex::FromHexError) -> Self {
        WalletError::SerializationError(format!("invalid hex: {e}"))
    }
}

impl From<bitcoin::consensus::encode::Error> for WalletError {
    fn from(e: bitcoin::consensus::encode::Error) -> Self {
        WalletError::SerializationError(format!("consensus decoding failed: {e}"))
    }
}

impl From<bitcoin::bip32::Error> for WalletError {
    fn from(e: bitcoin::bip32::Error) -> Self {
        WalletError::InternalError(format!("key derivation failed: {e}"))
    }
}

/// Result type for wallet operations
pub type WalletResult<T> = Result<T, WalletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_validation_identifiers_are_fixed() {
        let all = [
            TxValidationError::FeesNotAvailable,
            TxValidationError::InvalidAddress,
            TxValidationError::InvalidAmount,
            TxValidationError::InsufficientFunds,
            TxValidationError::FeeTooLow,
            TxValidationError::AccountNotSynced,
        ];
        for err in all {
            assert_eq!(err.to_string(), err.id());
        }
        assert_eq!(TxValidationError::InvalidAddress.id(), "invalidAddress");
    }

    #[test]
    fn test_tx_validation_wraps_into_wallet_error() {
        let err: WalletError = TxValidationError::InsufficientFunds.into();
        assert_eq!(
            err.tx_validation(),
            Some(TxValidationError::InsufficientFunds)
        );
        assert!(!err.is_corruption());
        assert!(WalletError::Corruption("bad".into()).is_corruption());
    }
}
