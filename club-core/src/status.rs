//! Protocol stages and the status board subscribers watch.
//!
//! Each protocol is a small state machine. Every transition is published as a [`StatusUpdate`];
//! terminal updates fall back to idle after a fixed delay unless something newer was published.

use crate::constants::{ERROR_CLEAR_AFTER, STATUS_CHANNEL_CAPACITY, SUCCESS_CLEAR_AFTER};
use crate::types::RecordId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Coarse status shown to members.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Idle,
    Pending,
    Success,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateStage {
    Idle,
    Encrypting,
    Submitting,
    Confirming,
    Done,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStage {
    Idle,
    Checking,
    RequestingProof,
    Submitting,
    Done,
    Error,
}

pub trait ProtocolStage: Copy + std::fmt::Debug + Into<Stage> {
    /// Terminal failure stage of the protocol.
    const ERROR: Self;

    fn can_advance_to(self, next: Self) -> bool;
    fn status(self) -> TransactionStatus;
}

impl ProtocolStage for CreateStage {
    const ERROR: Self = CreateStage::Error;

    fn can_advance_to(self, next: Self) -> bool {
        use CreateStage::*;
        matches!(
            (self, next),
            (Idle, Encrypting)
                | (Encrypting, Submitting)
                | (Submitting, Confirming)
                | (Confirming, Done)
                | (Idle | Encrypting | Submitting | Confirming, Error)
                | (Done | Error, Idle)
        )
    }

    fn status(self) -> TransactionStatus {
        match self {
            CreateStage::Idle => TransactionStatus::Idle,
            CreateStage::Encrypting | CreateStage::Submitting | CreateStage::Confirming => TransactionStatus::Pending,
            CreateStage::Done => TransactionStatus::Success,
            CreateStage::Error => TransactionStatus::Error,
        }
    }
}

impl ProtocolStage for VerifyStage {
    const ERROR: Self = VerifyStage::Error;

    fn can_advance_to(self, next: Self) -> bool {
        use VerifyStage::*;
        matches!(
            (self, next),
            (Idle, Checking)
                | (Checking, RequestingProof)
                // Already verified: short-circuit.
                | (Checking, Done)
                | (RequestingProof, Submitting)
                | (Submitting, Done)
                | (Idle | Checking | RequestingProof | Submitting, Error)
                | (Done | Error, Idle)
        )
    }

    fn status(self) -> TransactionStatus {
        match self {
            VerifyStage::Idle => TransactionStatus::Idle,
            VerifyStage::Checking | VerifyStage::RequestingProof | VerifyStage::Submitting => {
                TransactionStatus::Pending
            }
            VerifyStage::Done => TransactionStatus::Success,
            VerifyStage::Error => TransactionStatus::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "protocol", content = "stage")]
pub enum Stage {
    Create(CreateStage),
    Verify(VerifyStage),
    Availability,
}

impl From<CreateStage> for Stage {
    fn from(s: CreateStage) -> Self {
        Stage::Create(s)
    }
}

impl From<VerifyStage> for Stage {
    fn from(s: VerifyStage) -> Self {
        Stage::Verify(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Monotonic per board.
    pub seq: u64,
    pub stage: Option<Stage>,
    pub record_id: Option<RecordId>,
    pub status: TransactionStatus,
    pub message: String,
}

impl StatusUpdate {
    fn idle(seq: u64) -> Self {
        Self {
            seq,
            stage: None,
            record_id: None,
            status: TransactionStatus::Idle,
            message: String::new(),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.status != TransactionStatus::Idle
    }
}

/// Publishes status updates to subscribers and tracks the currently displayed one.
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<BoardInner>,
}

struct BoardInner {
    seq: AtomicU64,
    current: watch::Sender<StatusUpdate>,
    events: broadcast::Sender<StatusUpdate>,
    success_clear_after: Duration,
    error_clear_after: Duration,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(SUCCESS_CLEAR_AFTER, ERROR_CLEAR_AFTER)
    }
}

impl StatusBoard {
    pub fn new(success_clear_after: Duration, error_clear_after: Duration) -> Self {
        let (current, _) = watch::channel(StatusUpdate::idle(0));
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BoardInner {
                seq: AtomicU64::new(0),
                current,
                events,
                success_clear_after,
                error_clear_after,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.inner.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<StatusUpdate> {
        self.inner.current.subscribe()
    }

    pub fn current(&self) -> StatusUpdate {
        self.inner.current.borrow().clone()
    }

    /// Publish a status. Terminal statuses schedule their own clearing.
    pub fn publish(
        &self,
        stage: Option<Stage>,
        record_id: Option<RecordId>,
        status: TransactionStatus,
        message: impl Into<String>,
    ) -> u64 {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let update = StatusUpdate {
            seq,
            stage,
            record_id,
            status,
            message: message.into(),
        };
        debug!(seq, ?status, message = %update.message, "status");

        self.inner.current.send_replace(update.clone());
        // No subscribers is fine.
        let _ = self.inner.events.send(update);

        let clear_after = match status {
            TransactionStatus::Success => Some(self.inner.success_clear_after),
            TransactionStatus::Error => Some(self.inner.error_clear_after),
            TransactionStatus::Idle | TransactionStatus::Pending => None,
        };
        if let Some(delay) = clear_after {
            self.schedule_clear(seq, delay);
        }
        seq
    }

    /// Send an update to subscribers without replacing the displayed status.
    ///
    /// Used for requests turned away while another run of the protocol owns the board.
    pub fn announce(
        &self,
        stage: Option<Stage>,
        record_id: Option<RecordId>,
        status: TransactionStatus,
        message: impl Into<String>,
    ) -> u64 {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let update = StatusUpdate {
            seq,
            stage,
            record_id,
            status,
            message: message.into(),
        };
        debug!(seq, ?status, message = %update.message, "status event");
        let _ = self.inner.events.send(update);
        seq
    }

    fn schedule_clear(&self, seq: u64, delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let board = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            board.clear_if_current(seq);
        });
    }

    fn clear_if_current(&self, seq: u64) {
        let cleared = self.inner.current.send_if_modified(|cur| {
            if cur.seq != seq {
                return false;
            }
            let next = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
            *cur = StatusUpdate::idle(next);
            true
        });
        if cleared {
            let _ = self.inner.events.send(self.current());
        }
    }
}

/// Drives one run of a protocol, checking every transition and publishing it.
pub(crate) struct Progress<S: ProtocolStage> {
    board: StatusBoard,
    record_id: Option<RecordId>,
    stage: S,
}

impl<S: ProtocolStage> Progress<S> {
    pub(crate) fn start(board: StatusBoard, record_id: Option<RecordId>, idle: S) -> Self {
        Self { board, record_id, stage: idle }
    }

    pub(crate) fn stage(&self) -> S {
        self.stage
    }

    pub(crate) fn set_record_id(&mut self, id: RecordId) {
        self.record_id = Some(id);
    }

    pub(crate) fn enter(&mut self, next: S, message: impl Into<String>) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.stage,
            next
        );
        self.stage = next;
        self.board
            .publish(Some(next.into()), self.record_id.clone(), next.status(), message);
    }

    /// Report a run that was refused before it started, leaving the displayed status alone.
    pub(crate) fn reject(&self, message: impl Into<String>) {
        debug_assert_eq!(self.stage.status(), TransactionStatus::Idle);
        self.board.announce(
            Some(S::ERROR.into()),
            self.record_id.clone(),
            TransactionStatus::Error,
            message,
        );
    }
}

impl<S: ProtocolStage> Drop for Progress<S> {
    fn drop(&mut self) {
        if self.stage.status() != TransactionStatus::Pending {
            return;
        }
        warn!(stage = ?self.stage, record_id = ?self.record_id, "protocol run abandoned");
        self.stage = S::ERROR;
        self.board.publish(
            Some(S::ERROR.into()),
            self.record_id.take(),
            TransactionStatus::Error,
            "Operation abandoned",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_transitions() {
        use CreateStage::*;
        assert!(Idle.can_advance_to(Encrypting));
        assert!(Encrypting.can_advance_to(Submitting));
        assert!(Submitting.can_advance_to(Confirming));
        assert!(Confirming.can_advance_to(Done));
        assert!(Encrypting.can_advance_to(Error));
        assert!(Error.can_advance_to(Idle));

        assert!(!Idle.can_advance_to(Submitting));
        assert!(!Encrypting.can_advance_to(Done));
        assert!(!Done.can_advance_to(Error));
        assert!(!Error.can_advance_to(Encrypting));
    }

    #[test]
    fn verify_transitions() {
        use VerifyStage::*;
        assert!(Checking.can_advance_to(Done));
        assert!(Checking.can_advance_to(RequestingProof));
        assert!(RequestingProof.can_advance_to(Submitting));
        assert!(!RequestingProof.can_advance_to(Done));
        assert!(!Idle.can_advance_to(Submitting));
        assert!(!Done.can_advance_to(Checking));
    }

    #[test]
    fn stages_map_to_status() {
        assert_eq!(CreateStage::Confirming.status(), TransactionStatus::Pending);
        assert_eq!(CreateStage::Done.status(), TransactionStatus::Success);
        assert_eq!(VerifyStage::Error.status(), TransactionStatus::Error);
        assert_eq!(VerifyStage::Idle.status(), TransactionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_status_clears_after_delay() {
        let board = StatusBoard::new(Duration::from_secs(2), Duration::from_secs(3));
        board.publish(None, None, TransactionStatus::Error, "Creation failed");
        assert!(board.current().is_visible());

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(board.current().message, "Creation failed");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(board.current().status, TransactionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_clear_does_not_hide_newer_status() {
        let board = StatusBoard::new(Duration::from_secs(2), Duration::from_secs(3));
        board.publish(None, None, TransactionStatus::Success, "Investment created!");
        tokio::time::sleep(Duration::from_secs(1)).await;
        board.publish(None, None, TransactionStatus::Pending, "Creating encrypted investment...");

        tokio::time::sleep(Duration::from_secs(5)).await;
        let current = board.current();
        assert_eq!(current.status, TransactionStatus::Pending);
        assert_eq!(current.message, "Creating encrypted investment...");
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_run_reports_error_then_clears() {
        let board = StatusBoard::new(Duration::from_secs(2), Duration::from_secs(3));
        let mut progress = Progress::start(board.clone(), None, VerifyStage::Idle);
        progress.enter(VerifyStage::Checking, "Checking verification status...");
        drop(progress);

        let current = board.current();
        assert_eq!(current.status, TransactionStatus::Error);
        assert_eq!(current.stage, Some(Stage::Verify(VerifyStage::Error)));
        assert_eq!(current.message, "Operation abandoned");

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(board.current().status, TransactionStatus::Idle);
    }

    #[tokio::test]
    async fn finished_run_publishes_nothing_on_drop() {
        let board = StatusBoard::default();
        let mut progress = Progress::start(board.clone(), None, CreateStage::Idle);
        progress.enter(CreateStage::Encrypting, "Creating encrypted investment...");
        progress.enter(CreateStage::Error, "Creation failed: boom");
        let seq = board.current().seq;
        drop(progress);

        assert_eq!(board.current().seq, seq);
        assert_eq!(board.current().message, "Creation failed: boom");
    }

    #[tokio::test]
    async fn announcements_skip_the_displayed_status() {
        let board = StatusBoard::default();
        board.publish(None, None, TransactionStatus::Pending, "Creating encrypted investment...");
        let mut rx = board.subscribe();

        board.announce(None, None, TransactionStatus::Error, "busy");

        assert_eq!(rx.recv().await.unwrap().message, "busy");
        assert_eq!(board.current().status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn subscribers_see_every_transition() {
        let board = StatusBoard::default();
        let mut rx = board.subscribe();

        let mut progress = Progress::start(board.clone(), None, CreateStage::Idle);
        progress.enter(CreateStage::Encrypting, "Creating encrypted investment...");
        progress.enter(CreateStage::Submitting, "Submitting...");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.stage, Some(Stage::Create(CreateStage::Encrypting)));
        assert_eq!(second.stage, Some(Stage::Create(CreateStage::Submitting)));
        assert!(second.seq > first.seq);
    }
}
