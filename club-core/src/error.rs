//! Error taxonomy of the lifecycle controller and its collaborators.

use crate::types::RecordId;
use thiserror::Error;

/// Failures surfaced by the lifecycle controller.
///
/// Every variant ends the running protocol in its `Error` stage; none of them leaves a record
/// partially updated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClubError {
    /// Bad input, rejected before any collaborator is contacted.
    #[error("validation error: {0}")]
    Validation(String),

    /// The encryption gateway failed; nothing was written to the ledger.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Another create (or a verify of the same record) is already in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The signer declined the transaction. Terminal for this attempt.
    #[error("transaction rejected: {0}")]
    LedgerRejected(String),

    /// The ledger failed or refused the submission for any other reason.
    #[error("ledger failure: {0}")]
    LedgerFailed(String),

    /// The decryption verifier failed; the record stays unverified.
    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A freshly generated id already exists on the ledger.
    #[error("record id collision: {0}")]
    IdCollision(RecordId),
}

impl ClubError {
    /// Whether the same request may succeed if issued again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClubError::Encryption(_)
                | ClubError::Conflict(_)
                | ClubError::LedgerFailed(_)
                | ClubError::Decryption(_)
        )
    }
}

/// Failures reported by the external collaborators (gateway, ledger, verifier).
///
/// The controller maps them onto [`ClubError`] depending on the protocol step they occur in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The member's signer refused to sign.
    #[error("declined: {0}")]
    Declined(String),

    #[error("failed: {0}")]
    Failed(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// No response within the configured deadline.
    #[error("timed out")]
    Timeout,
}

/// Failures of the local development engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("decrypted value does not fit in 64 bits")]
    ValueOutOfRange,
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        ServiceError::Failed(e.to_string())
    }
}
