//! SQLite-backed ledger record store.
//!
//! Plays the role of the on-chain contract for a single-node deployment: it checks input proofs
//! on creation, checks decryption proofs on verification, and is the only place that flips a
//! record to verified.

use crate::db::{self, Db, NewRecordRow};
use async_trait::async_trait;
use club_core::ServiceError;
use club_core::engine::LocalFheEngine;
use club_core::traits::{LedgerRecordStore, ServiceResult};
use club_core::types::{
    decode_clear_values, CiphertextHandle, ContractAddress, CreateRecordRequest, LedgerRecord, PendingTx, RecordId,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct LocalLedger {
    db: Db,
    engine: Arc<LocalFheEngine>,
    contract: ContractAddress,
}

fn storage_error(e: sqlx::Error) -> ServiceError {
    warn!(error = %e, "ledger storage error");
    ServiceError::Failed("ledger storage error".to_string())
}

fn new_tx_hash() -> String {
    format!("0x{}", Uuid::new_v4().simple())
}

impl LocalLedger {
    pub fn new(db: Db, engine: Arc<LocalFheEngine>, contract: ContractAddress) -> Self {
        Self { db, engine, contract }
    }
}

#[async_trait]
impl LedgerRecordStore for LocalLedger {
    async fn list_record_ids(&self) -> ServiceResult<Vec<RecordId>> {
        db::list_record_ids(&self.db).await.map_err(storage_error)
    }

    async fn get_record(&self, id: &RecordId) -> ServiceResult<LedgerRecord> {
        db::get_record(&self.db, id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("record {id}")))
    }

    async fn create_record(&self, request: CreateRecordRequest) -> ServiceResult<PendingTx> {
        if db::record_exists(&self.db, &request.id).await.map_err(storage_error)? {
            return Err(ServiceError::Failed(format!("record {} already exists", request.id)));
        }

        if !self
            .engine
            .verify_input(&self.contract, &request.signer, &request.encrypted_amount)
        {
            return Err(ServiceError::Failed("invalid input proof".to_string()));
        }

        let tx_hash = new_tx_hash();
        let ciphertext = &request.encrypted_amount.ciphertext;
        db::insert_record(
            &self.db,
            NewRecordRow {
                id: &request.id,
                name: &request.name,
                description: &request.description,
                creator: &request.signer,
                risk_level: request.risk_level,
                public_signal: request.public_signal,
                handle: &ciphertext.handle,
                contract: self.contract.as_str(),
                ciphertext: &ciphertext.bytes,
            },
            &tx_hash,
        )
        .await
        .map_err(storage_error)?;

        info!(record_id = %request.id, %tx_hash, "record created");
        Ok(PendingTx { tx_hash })
    }

    async fn await_confirmation(&self, tx: &PendingTx) -> ServiceResult<()> {
        match db::tx_status(&self.db, &tx.tx_hash).await.map_err(storage_error)? {
            Some(status) if status == "confirmed" => Ok(()),
            Some(status) => Err(ServiceError::Failed(format!("transaction {} is {status}", tx.tx_hash))),
            None => Err(ServiceError::NotFound(format!("transaction {}", tx.tx_hash))),
        }
    }

    async fn get_encrypted_amount_handle(&self, id: &RecordId) -> ServiceResult<CiphertextHandle> {
        db::get_amount_handle(&self.db, id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("record {id}")))
    }

    async fn submit_verification_proof(
        &self,
        id: &RecordId,
        clear_values_encoded: Vec<u8>,
        proof: Vec<u8>,
    ) -> ServiceResult<PendingTx> {
        let record = self.get_record(id).await?;
        if record.is_verified {
            return Err(ServiceError::Failed(format!("record {id} is already verified")));
        }
        let handle = self.get_encrypted_amount_handle(id).await?;

        let clear = match decode_clear_values(&clear_values_encoded).as_deref() {
            Some([clear]) => *clear,
            _ => return Err(ServiceError::Failed("expected exactly one clear value".to_string())),
        };
        let stored = i64::try_from(clear)
            .map_err(|_| ServiceError::Failed("clear value exceeds ledger range".to_string()))?;

        if !self
            .engine
            .verify_decryption(&self.contract, &[handle], &[clear], &proof)
        {
            return Err(ServiceError::Failed("invalid decryption proof".to_string()));
        }

        let tx_hash = new_tx_hash();
        if !db::mark_verified(&self.db, id, stored, &tx_hash).await.map_err(storage_error)? {
            return Err(ServiceError::Failed(format!("record {id} is already verified")));
        }

        info!(record_id = %id, %tx_hash, "record verified");
        Ok(PendingTx { tx_hash })
    }

    async fn is_service_available(&self) -> ServiceResult<bool> {
        Ok(db::ping(&self.db).await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhe::{LocalGateway, LocalKms};
    use club_core::traits::{DecryptionVerifier, EncryptionGateway};
    use club_core::types::{encode_clear_values, MemberAddress, NewInvestment};
    use club_core::{ClubError, Collaborators, ControllerConfig, InvestmentController};

    const CONTRACT: &str = "0x00000000000000000000000000000000000c1ab0";

    struct Stack {
        _dir: tempfile::TempDir,
        ledger: Arc<LocalLedger>,
        gateway: Arc<LocalGateway>,
        kms: Arc<LocalKms>,
    }

    async fn stack() -> Stack {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("ledger.sqlite").to_string_lossy());
        let db = db::connect(&url, 2).await.unwrap();
        db::init_schema(&db).await.unwrap();

        let engine = Arc::new(LocalFheEngine::from_seed([3u8; 32]));
        Stack {
            _dir: dir,
            ledger: Arc::new(LocalLedger::new(db.clone(), engine.clone(), ContractAddress::from(CONTRACT))),
            gateway: Arc::new(LocalGateway::new(engine.clone())),
            kms: Arc::new(LocalKms::new(db, engine)),
        }
    }

    fn controller(stack: &Stack, member: &str) -> InvestmentController {
        InvestmentController::new(
            Collaborators {
                gateway: stack.gateway.clone(),
                ledger: stack.ledger.clone(),
                verifier: stack.kms.clone(),
            },
            ControllerConfig::new(ContractAddress::from(CONTRACT)).with_submitter(MemberAddress::from(member)),
        )
    }

    fn request(id: &str, signer: &str, input: club_core::types::EncryptedInput) -> CreateRecordRequest {
        CreateRecordRequest {
            id: RecordId::from(id),
            signer: MemberAddress::from(signer),
            name: "Direct".to_string(),
            encrypted_amount: input,
            risk_level: 5,
            public_signal: 0,
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn full_lifecycle_against_sqlite() {
        let stack = stack().await;
        let alice = controller(&stack, "0xalice");

        let id = alice
            .create_investment(NewInvestment {
                name: "Validator fund".to_string(),
                amount: "1000".to_string(),
                risk_level: 7,
                public_signal: 0,
                description: "Stake with a club validator".to_string(),
            })
            .await
            .unwrap();

        let records = alice.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].creator, MemberAddress::from("0xalice"));
        assert!(!records[0].is_verified());

        assert_eq!(alice.verify_and_decrypt(&id).await.unwrap(), 1000);
        assert_eq!(alice.verify_and_decrypt(&id).await.unwrap(), 1000);

        let records = alice.load_all().await.unwrap();
        assert_eq!(records[0].clear_amount(), Some(1000));

        let stats = alice.compute_statistics(&records);
        assert_eq!(stats.total_proposals, 1);
        assert_eq!(stats.verified_proposals, 1);
        assert_eq!(stats.total_investment, 1000);
        assert_eq!(stats.active_members, 1);
    }

    #[tokio::test]
    async fn rejects_input_proof_for_another_signer() {
        let stack = stack().await;
        let input = stack
            .gateway
            .encrypt(&ContractAddress::from(CONTRACT), &MemberAddress::from("0xalice"), 10)
            .await
            .unwrap();

        let err = stack
            .ledger
            .create_record(request("investment-x", "0xmallory", input))
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::Failed("invalid input proof".to_string()));
        assert!(stack.ledger.list_record_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_duplicate_ids() {
        let stack = stack().await;
        let contract = ContractAddress::from(CONTRACT);
        let alice = MemberAddress::from("0xalice");

        let first = stack.gateway.encrypt(&contract, &alice, 1).await.unwrap();
        let tx = stack.ledger.create_record(request("dup", "0xalice", first)).await.unwrap();
        stack.ledger.await_confirmation(&tx).await.unwrap();

        let second = stack.gateway.encrypt(&contract, &alice, 2).await.unwrap();
        assert!(matches!(
            stack.ledger.create_record(request("dup", "0xalice", second)).await,
            Err(ServiceError::Failed(_))
        ));
        assert_eq!(stack.ledger.list_record_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn verification_requires_matching_proof_and_happens_once() {
        let stack = stack().await;
        let contract = ContractAddress::from(CONTRACT);
        let input = stack
            .gateway
            .encrypt(&contract, &MemberAddress::from("0xalice"), 500)
            .await
            .unwrap();
        let handle = input.ciphertext.handle.clone();
        let id = RecordId::from("investment-v");
        stack.ledger.create_record(request("investment-v", "0xalice", input)).await.unwrap();

        let result = stack.kms.request_decryption(&[handle.clone()], &contract).await.unwrap();
        assert_eq!(result.clear_values.get(&handle), Some(&500));

        let forged = stack
            .ledger
            .submit_verification_proof(&id, encode_clear_values(&[501]), result.proof.clone())
            .await;
        assert_eq!(forged, Err(ServiceError::Failed("invalid decryption proof".to_string())));
        assert!(!stack.ledger.get_record(&id).await.unwrap().is_verified);

        let tx = stack
            .ledger
            .submit_verification_proof(&id, encode_clear_values(&[500]), result.proof.clone())
            .await
            .unwrap();
        stack.ledger.await_confirmation(&tx).await.unwrap();

        let record = stack.ledger.get_record(&id).await.unwrap();
        assert!(record.is_verified);
        assert_eq!(record.clear_amount, Some(500));

        assert!(stack
            .ledger
            .submit_verification_proof(&id, encode_clear_values(&[500]), result.proof)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn kms_refuses_other_contracts() {
        let stack = stack().await;
        let contract = ContractAddress::from(CONTRACT);
        let input = stack
            .gateway
            .encrypt(&contract, &MemberAddress::from("0xalice"), 5)
            .await
            .unwrap();
        let handle = input.ciphertext.handle.clone();
        stack.ledger.create_record(request("investment-k", "0xalice", input)).await.unwrap();

        let err = stack
            .kms
            .request_decryption(&[handle], &ContractAddress::from("0xelsewhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Failed(_)));

        let missing = stack
            .kms
            .request_decryption(&[CiphertextHandle::from("00")], &contract)
            .await
            .unwrap_err();
        assert!(matches!(missing, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn members_see_each_others_records() {
        let stack = stack().await;
        let alice = controller(&stack, "0xalice");
        let bob = controller(&stack, "0xbob");

        let proposal = |amount: &str| NewInvestment {
            name: "Pool".to_string(),
            amount: amount.to_string(),
            risk_level: 3,
            public_signal: 4,
            description: String::new(),
        };

        alice.create_investment(proposal("10")).await.unwrap();
        let bob_id = bob.create_investment(proposal("20")).await.unwrap();
        bob.verify_and_decrypt(&bob_id).await.unwrap();

        let records = alice.load_all().await.unwrap();
        let stats = alice.compute_statistics(&records);
        assert_eq!(stats.total_proposals, 2);
        assert_eq!(stats.verified_proposals, 1);
        assert_eq!(stats.total_investment, 20);
        assert_eq!(stats.active_members, 2);
        assert_eq!(stats.avg_public_signal, 4.0);

        assert!(matches!(
            alice.verify_and_decrypt(&RecordId::from("missing")).await,
            Err(ClubError::NotFound(_))
        ));
        assert!(stack.ledger.is_service_available().await.unwrap());
    }
}
