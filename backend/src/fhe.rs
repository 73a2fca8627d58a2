//! Local stand-ins for the encryption gateway and the decryption key-management service.

use crate::db::{self, Db};
use async_trait::async_trait;
use club_core::ServiceError;
use club_core::engine::LocalFheEngine;
use club_core::traits::{DecryptionVerifier, EncryptionGateway, ServiceResult};
use club_core::types::{CiphertextHandle, ContractAddress, DecryptionResult, EncryptedInput, MemberAddress};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Encrypts amounts on behalf of members with the local engine.
pub struct LocalGateway {
    engine: Arc<LocalFheEngine>,
    rng: Mutex<ChaCha20Rng>,
}

impl LocalGateway {
    pub fn new(engine: Arc<LocalFheEngine>) -> Self {
        Self {
            engine,
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }
}

#[async_trait]
impl EncryptionGateway for LocalGateway {
    async fn encrypt(
        &self,
        contract: &ContractAddress,
        submitter: &MemberAddress,
        plaintext: u64,
    ) -> ServiceResult<EncryptedInput> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ServiceError::Failed("gateway rng poisoned".to_string()))?;
        let input = self.engine.encrypt(&mut *rng, contract, submitter, plaintext)?;
        debug!(handle = %input.ciphertext.handle, %submitter, "encrypted amount");
        Ok(input)
    }
}

/// Decrypts ledger ciphertexts and signs the result.
pub struct LocalKms {
    db: Db,
    engine: Arc<LocalFheEngine>,
}

impl LocalKms {
    pub fn new(db: Db, engine: Arc<LocalFheEngine>) -> Self {
        Self { db, engine }
    }
}

#[async_trait]
impl DecryptionVerifier for LocalKms {
    async fn request_decryption(
        &self,
        handles: &[CiphertextHandle],
        contract: &ContractAddress,
    ) -> ServiceResult<DecryptionResult> {
        let mut clear_values = BTreeMap::new();
        let mut ordered = Vec::with_capacity(handles.len());

        for handle in handles {
            let (bound_contract, bytes) = db::get_ciphertext(&self.db, handle)
                .await
                .map_err(|e| ServiceError::Failed(e.to_string()))?
                .ok_or_else(|| ServiceError::NotFound(format!("ciphertext {handle}")))?;

            if !bound_contract.eq_ignore_ascii_case(contract.as_str()) {
                return Err(ServiceError::Failed(format!(
                    "ciphertext {handle} is not bound to {contract}"
                )));
            }

            let clear = self.engine.decrypt(&bytes)?;
            clear_values.insert(handle.clone(), clear);
            ordered.push(clear);
        }

        let proof = self.engine.prove_decryption(contract, handles, &ordered)?;
        Ok(DecryptionResult { clear_values, proof })
    }
}
