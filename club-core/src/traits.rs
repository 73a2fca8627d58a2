//! Collaborators the lifecycle controller orchestrates.
//!
//! Implementations live outside this crate (a production FHE gateway and ledger client) or in
//! the backend's local development stack.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::ServiceError;
use crate::types::{
    CiphertextHandle, ContractAddress, CreateRecordRequest, DecryptionResult, EncryptedInput, LedgerRecord,
    MemberAddress, PendingTx, RecordId,
};

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Turns a plaintext amount into a ciphertext and a proof bound to (contract, submitter).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EncryptionGateway: Send + Sync {
    async fn encrypt(
        &self,
        contract: &ContractAddress,
        submitter: &MemberAddress,
        plaintext: u64,
    ) -> ServiceResult<EncryptedInput>;
}

/// Append-only store of investment records.
///
/// The store is authoritative for verification status.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerRecordStore: Send + Sync {
    /// Ids of all records, in creation order.
    async fn list_record_ids(&self) -> ServiceResult<Vec<RecordId>>;

    async fn get_record(&self, id: &RecordId) -> ServiceResult<LedgerRecord>;

    /// Submit a creation request. Acceptance is only known after [`Self::await_confirmation`].
    async fn create_record(&self, request: CreateRecordRequest) -> ServiceResult<PendingTx>;

    /// Wait until the ledger accepts or rejects a submitted transaction.
    async fn await_confirmation(&self, tx: &PendingTx) -> ServiceResult<()>;

    async fn get_encrypted_amount_handle(&self, id: &RecordId) -> ServiceResult<CiphertextHandle>;

    /// Submit a decryption proof for the record's amount.
    async fn submit_verification_proof(
        &self,
        id: &RecordId,
        clear_values_encoded: Vec<u8>,
        proof: Vec<u8>,
    ) -> ServiceResult<PendingTx>;

    async fn is_service_available(&self) -> ServiceResult<bool>;
}

/// Decrypts ciphertext handles off-chain and proves the result.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DecryptionVerifier: Send + Sync {
    async fn request_decryption(
        &self,
        handles: &[CiphertextHandle],
        contract: &ContractAddress,
    ) -> ServiceResult<DecryptionResult>;
}
