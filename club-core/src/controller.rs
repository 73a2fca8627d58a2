//! Investment lifecycle controller.
//!
//! Orchestrates the create and verify protocols against the collaborators, keeps the last loaded
//! record set with its statistics, and publishes every stage transition on a [`StatusBoard`].
//!
//! Once a protocol reaches its ledger-submission step the remainder runs on a spawned task that
//! owns the in-flight lock, so a caller that goes away cannot abort a ledger write half-way.
//! Earlier steps run on the caller's future; dropping it releases the lock and shows an abandoned
//! error on the board.

use crate::constants::{ERROR_CLEAR_AFTER, RECORD_ID_PREFIX, SUCCESS_CLEAR_AFTER};
use crate::error::{ClubError, ServiceError};
use crate::stats::{compute_statistics, ClubStatistics};
use crate::status::{CreateStage, Progress, Stage, StatusBoard, StatusUpdate, TransactionStatus, VerifyStage};
use crate::traits::{DecryptionVerifier, EncryptionGateway, LedgerRecordStore, ServiceResult};
use crate::types::{
    encode_clear_values, ContractAddress, CreateRecordRequest, InvestmentRecord, MemberAddress, NewInvestment,
    RecordId,
};
use chrono::Utc;
use rand::RngCore;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};

/// The external services one controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn EncryptionGateway>,
    pub ledger: Arc<dyn LedgerRecordStore>,
    pub verifier: Arc<dyn DecryptionVerifier>,
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Contract every ciphertext and proof is bound to.
    pub contract: ContractAddress,
    /// The member this session acts for. Creating requires one; reading does not.
    pub submitter: Option<MemberAddress>,
    /// Upper bound for every collaborator call. `None` leaves deadlines to the collaborators.
    pub call_timeout: Option<Duration>,
    pub success_clear_after: Duration,
    pub error_clear_after: Duration,
}

impl ControllerConfig {
    pub fn new(contract: ContractAddress) -> Self {
        Self {
            contract,
            submitter: None,
            call_timeout: None,
            success_clear_after: SUCCESS_CLEAR_AFTER,
            error_clear_after: ERROR_CLEAR_AFTER,
        }
    }

    pub fn with_submitter(mut self, submitter: MemberAddress) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

pub type IdGenerator = Arc<dyn Fn() -> RecordId + Send + Sync>;

#[derive(Default)]
struct Snapshot {
    records: Vec<InvestmentRecord>,
    stats: ClubStatistics,
}

#[derive(Clone)]
pub struct InvestmentController {
    inner: Arc<Inner>,
}

struct Inner {
    services: Collaborators,
    config: ControllerConfig,
    next_id: IdGenerator,
    create_lock: Arc<Mutex<()>>,
    verify_locks: Arc<StdMutex<HashSet<RecordId>>>,
    snapshot: RwLock<Snapshot>,
    board: StatusBoard,
}

/// Everything the create protocol needs once it is past the abandonable steps.
struct PreparedCreate {
    _guard: OwnedMutexGuard<()>,
    request: CreateRecordRequest,
}

/// In-flight marker for one record's verification.
struct VerifyGuard {
    locks: Arc<StdMutex<HashSet<RecordId>>>,
    id: RecordId,
}

impl Drop for VerifyGuard {
    fn drop(&mut self) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// `investment-<unix millis>-<8 hex chars>`.
pub fn generate_record_id() -> RecordId {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    RecordId::new(format!(
        "{RECORD_ID_PREFIX}-{}-{}",
        Utc::now().timestamp_millis(),
        hex::encode(suffix)
    ))
}

async fn bounded<T>(limit: Option<Duration>, call: impl Future<Output = ServiceResult<T>>) -> ServiceResult<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(ServiceError::Timeout)),
        None => call.await,
    }
}

fn ledger_write_error(e: ServiceError) -> ClubError {
    match e {
        ServiceError::Declined(m) => ClubError::LedgerRejected(m),
        ServiceError::Failed(m) | ServiceError::NotFound(m) => ClubError::LedgerFailed(m),
        ServiceError::Timeout => ClubError::LedgerFailed("ledger did not respond".to_string()),
    }
}

fn ledger_read_error(e: ServiceError) -> ClubError {
    match e {
        ServiceError::NotFound(m) => ClubError::NotFound(m),
        other => ClubError::LedgerFailed(other.to_string()),
    }
}

fn create_failure_message(err: &ClubError) -> String {
    match err {
        ClubError::LedgerRejected(_) => "Transaction rejected".to_string(),
        ClubError::Validation(m) => m.clone(),
        other => format!("Creation failed: {other}"),
    }
}

fn verify_failure_message(err: &ClubError) -> String {
    match err {
        ClubError::LedgerRejected(_) => "Transaction rejected".to_string(),
        other => format!("Decryption failed: {other}"),
    }
}

impl InvestmentController {
    pub fn new(services: Collaborators, config: ControllerConfig) -> Self {
        Self::with_id_generator(services, config, Arc::new(generate_record_id))
    }

    pub fn with_id_generator(services: Collaborators, config: ControllerConfig, next_id: IdGenerator) -> Self {
        let board = StatusBoard::new(config.success_clear_after, config.error_clear_after);
        Self {
            inner: Arc::new(Inner {
                services,
                config,
                next_id,
                create_lock: Arc::new(Mutex::new(())),
                verify_locks: Arc::new(StdMutex::new(HashSet::new())),
                snapshot: RwLock::new(Snapshot::default()),
                board,
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Stream of every status transition published by this controller.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.inner.board.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<StatusUpdate> {
        self.inner.board.watch()
    }

    /// The status currently on display (idle once a terminal status has cleared).
    pub fn current_status(&self) -> StatusUpdate {
        self.inner.board.current()
    }

    /// Records as of the last load, with verification updates applied since.
    pub async fn records(&self) -> Vec<InvestmentRecord> {
        self.inner.snapshot.read().await.records.clone()
    }

    pub async fn statistics(&self) -> ClubStatistics {
        self.inner.snapshot.read().await.stats.clone()
    }

    pub fn compute_statistics(&self, records: &[InvestmentRecord]) -> ClubStatistics {
        compute_statistics(records)
    }

    /// Run the create protocol: validate, encrypt, submit, confirm, refresh.
    ///
    /// Returns the id of the new record once the ledger has confirmed it.
    pub async fn create_investment(&self, input: NewInvestment) -> Result<RecordId, ClubError> {
        let mut progress = Progress::start(self.inner.board.clone(), None, CreateStage::Idle);

        let prepared = match self.prepare_create(&mut progress, input).await {
            Ok(prepared) => prepared,
            Err(e @ ClubError::Conflict(_)) => {
                warn!(error = %e, "create refused");
                progress.reject(create_failure_message(&e));
                return Err(e);
            }
            Err(e) => return Err(Self::fail_create(&mut progress, e)),
        };

        let this = self.clone();
        tokio::spawn(async move { this.finish_create(progress, prepared).await })
            .await
            .map_err(|e| ClubError::LedgerFailed(format!("create task aborted: {e}")))?
    }

    async fn prepare_create(
        &self,
        progress: &mut Progress<CreateStage>,
        input: NewInvestment,
    ) -> Result<PreparedCreate, ClubError> {
        let valid = input.validate()?;
        let submitter = self
            .inner
            .config
            .submitter
            .clone()
            .ok_or_else(|| ClubError::Validation("Please connect wallet".to_string()))?;

        let guard = self
            .inner
            .create_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| ClubError::Conflict("a create is already in flight".to_string()))?;

        let timeout = self.inner.config.call_timeout;
        let contract = &self.inner.config.contract;

        progress.enter(CreateStage::Encrypting, "Creating encrypted investment...");
        let encrypted = bounded(
            timeout,
            self.inner.services.gateway.encrypt(contract, &submitter, valid.amount),
        )
        .await
        .map_err(|e| ClubError::Encryption(e.to_string()))?;

        let id = (self.inner.next_id)();
        progress.set_record_id(id.clone());
        progress.enter(CreateStage::Submitting, "Submitting encrypted investment...");

        let existing = bounded(timeout, self.inner.services.ledger.list_record_ids())
            .await
            .map_err(|e| ClubError::LedgerFailed(e.to_string()))?;
        if existing.contains(&id) {
            return Err(ClubError::IdCollision(id));
        }

        Ok(PreparedCreate {
            _guard: guard,
            request: CreateRecordRequest {
                id,
                signer: submitter,
                name: valid.name,
                encrypted_amount: encrypted,
                risk_level: valid.risk_level,
                public_signal: valid.public_signal,
                description: valid.description,
            },
        })
    }

    async fn finish_create(
        &self,
        mut progress: Progress<CreateStage>,
        prepared: PreparedCreate,
    ) -> Result<RecordId, ClubError> {
        let PreparedCreate { _guard, request } = prepared;
        let id = request.id.clone();
        let timeout = self.inner.config.call_timeout;
        let ledger = &self.inner.services.ledger;

        let tx = match bounded(timeout, ledger.create_record(request)).await {
            Ok(tx) => tx,
            Err(e) => return Err(Self::fail_create(&mut progress, ledger_write_error(e))),
        };

        progress.enter(CreateStage::Confirming, "Waiting for confirmation...");
        if let Err(e) = bounded(timeout, ledger.await_confirmation(&tx)).await {
            return Err(Self::fail_create(&mut progress, ledger_write_error(e)));
        }

        progress.enter(CreateStage::Done, "Investment created!");
        info!(record_id = %id, tx = %tx.tx_hash, "investment created");

        if let Err(e) = self.load_all().await {
            warn!(record_id = %id, error = %e, "refresh after create failed");
        }
        Ok(id)
    }

    fn fail_create(progress: &mut Progress<CreateStage>, err: ClubError) -> ClubError {
        warn!(stage = ?progress.stage(), error = %err, "create failed");
        progress.enter(CreateStage::Error, create_failure_message(&err));
        err
    }

    fn fail_verify(progress: &mut Progress<VerifyStage>, err: ClubError) -> ClubError {
        warn!(stage = ?progress.stage(), error = %err, "verification failed");
        progress.enter(VerifyStage::Error, verify_failure_message(&err));
        err
    }

    fn acquire_verify(&self, id: &RecordId) -> Option<VerifyGuard> {
        let mut in_flight = self
            .inner
            .verify_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(id.clone()) {
            return None;
        }
        Some(VerifyGuard {
            locks: self.inner.verify_locks.clone(),
            id: id.clone(),
        })
    }

    /// Run the verify protocol and return the record's clear amount.
    ///
    /// Already-verified records short-circuit without contacting the decryption verifier.
    pub async fn verify_and_decrypt(&self, id: &RecordId) -> Result<u64, ClubError> {
        let mut progress = Progress::start(self.inner.board.clone(), Some(id.clone()), VerifyStage::Idle);

        let Some(guard) = self.acquire_verify(id) else {
            let err = ClubError::Conflict(format!("verification of {id} already in flight"));
            warn!(record_id = %id, "verification refused");
            progress.reject(verify_failure_message(&err));
            return Err(err);
        };

        let timeout = self.inner.config.call_timeout;
        let services = &self.inner.services;

        progress.enter(VerifyStage::Checking, "Checking verification status...");
        let fields = match bounded(timeout, services.ledger.get_record(id)).await {
            Ok(fields) => fields,
            Err(e) => return Err(Self::fail_verify(&mut progress, ledger_read_error(e))),
        };

        if fields.is_verified {
            let Some(clear) = fields.clear_amount else {
                let err = ClubError::LedgerFailed(format!("record {id} is verified but carries no clear amount"));
                return Err(Self::fail_verify(&mut progress, err));
            };
            self.apply_verified(id, clear).await;
            progress.enter(VerifyStage::Done, "Already verified");
            return Ok(clear);
        }

        progress.enter(VerifyStage::RequestingProof, "Requesting decryption proof...");
        let handle = match bounded(timeout, services.ledger.get_encrypted_amount_handle(id)).await {
            Ok(handle) => handle,
            Err(e) => return Err(Self::fail_verify(&mut progress, ledger_read_error(e))),
        };

        let handles = vec![handle.clone()];
        let decryption = match bounded(
            timeout,
            services.verifier.request_decryption(&handles, &self.inner.config.contract),
        )
        .await
        {
            Ok(result) => result,
            Err(e) => return Err(Self::fail_verify(&mut progress, ClubError::Decryption(e.to_string()))),
        };

        let Some(clear) = decryption.clear_values.get(&handle).copied() else {
            let err = ClubError::Decryption(format!("no clear value returned for handle {handle}"));
            return Err(Self::fail_verify(&mut progress, err));
        };

        progress.enter(VerifyStage::Submitting, "Submitting decryption proof...");
        let this = self.clone();
        let id = id.clone();
        let proof = decryption.proof;
        tokio::spawn(async move {
            let _guard = guard;
            this.finish_verify(progress, id, clear, proof).await
        })
        .await
        .map_err(|e| ClubError::LedgerFailed(format!("verification task aborted: {e}")))?
    }

    async fn finish_verify(
        &self,
        mut progress: Progress<VerifyStage>,
        id: RecordId,
        clear: u64,
        proof: Vec<u8>,
    ) -> Result<u64, ClubError> {
        let timeout = self.inner.config.call_timeout;
        let ledger = &self.inner.services.ledger;

        let encoded = encode_clear_values(&[clear]);
        let tx = match bounded(timeout, ledger.submit_verification_proof(&id, encoded, proof)).await {
            Ok(tx) => tx,
            Err(e) => return Err(Self::fail_verify(&mut progress, ledger_write_error(e))),
        };
        if let Err(e) = bounded(timeout, ledger.await_confirmation(&tx)).await {
            return Err(Self::fail_verify(&mut progress, ledger_write_error(e)));
        }

        self.apply_verified(&id, clear).await;
        progress.enter(VerifyStage::Done, "Decryption verified on-chain");
        info!(record_id = %id, tx = %tx.tx_hash, "investment verified");
        Ok(clear)
    }

    /// Swap a cached record to verified and recompute statistics, under one write lock.
    async fn apply_verified(&self, id: &RecordId, clear: u64) {
        let mut snapshot = self.inner.snapshot.write().await;
        let Some(record) = snapshot.records.iter_mut().find(|r| &r.id == id) else {
            return;
        };
        if record.is_verified() {
            return;
        }
        record.mark_verified(clear);
        snapshot.stats = compute_statistics(&snapshot.records);
    }

    async fn read_record(&self, id: &RecordId) -> Result<InvestmentRecord, ClubError> {
        let timeout = self.inner.config.call_timeout;
        let ledger = &self.inner.services.ledger;

        let fields = bounded(timeout, ledger.get_record(id))
            .await
            .map_err(ledger_read_error)?;
        let handle = bounded(timeout, ledger.get_encrypted_amount_handle(id))
            .await
            .map_err(ledger_read_error)?;
        InvestmentRecord::from_ledger(id.clone(), fields, handle)
    }

    /// Reload the full record set from the ledger and replace the cached snapshot.
    ///
    /// Verification status comes straight from the ledger; nothing cached survives the reload.
    /// Records that cannot be read are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<InvestmentRecord>, ClubError> {
        let ids = bounded(self.inner.config.call_timeout, self.inner.services.ledger.list_record_ids())
            .await
            .map_err(|e| ClubError::LedgerFailed(e.to_string()))?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read_record(&id).await {
                Ok(record) => records.push(record),
                Err(e) => warn!(record_id = %id, error = %e, "skipping unreadable record"),
            }
        }

        let stats = compute_statistics(&records);
        *self.inner.snapshot.write().await = Snapshot {
            records: records.clone(),
            stats,
        };
        Ok(records)
    }

    /// Read one record from the ledger, refreshing its cached copy.
    pub async fn fetch_record(&self, id: &RecordId) -> Result<InvestmentRecord, ClubError> {
        let record = self.read_record(id).await?;

        let mut snapshot = self.inner.snapshot.write().await;
        if let Some(cached) = snapshot.records.iter_mut().find(|r| r.id == record.id) {
            *cached = record.clone();
            snapshot.stats = compute_statistics(&snapshot.records);
        }
        Ok(record)
    }

    /// Ask the ledger whether the encrypted-value service is up, and say so on the board.
    pub async fn check_available(&self) -> Result<bool, ClubError> {
        let board = &self.inner.board;
        let stage = Some(Stage::Availability);

        match bounded(self.inner.config.call_timeout, self.inner.services.ledger.is_service_available()).await {
            Ok(true) => {
                board.publish(stage, None, TransactionStatus::Success, "FHE System Available!");
                Ok(true)
            }
            Ok(false) => {
                board.publish(stage, None, TransactionStatus::Error, "FHE system unavailable");
                Ok(false)
            }
            Err(e) => {
                let err = ClubError::LedgerFailed(e.to_string());
                board.publish(stage, None, TransactionStatus::Error, format!("Availability check failed: {err}"));
                Err(err)
            }
        }
    }
}
