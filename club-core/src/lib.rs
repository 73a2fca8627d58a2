//! Core of the Confidential Investment Club.
//!
//! This crate contains:
//! - The investment record model, whose clear amount only exists once the ledger has verified it.
//! - The lifecycle controller driving the create and verify protocols against an encryption
//!   gateway, a ledger record store and a decryption verifier.
//! - The statistics aggregator.
//! - A local development engine (Poseidon over BN254) that can stand in for the external
//!   encryption and key-management services.

pub mod constants;
pub mod controller;
pub mod engine;
pub mod error;
pub mod stats;
pub mod status;
pub mod traits;
pub mod types;

pub use controller::{Collaborators, ControllerConfig, InvestmentController};
pub use error::{ClubError, ServiceError};
pub use stats::{compute_statistics, ClubStatistics};
