//! Crate-wide constants used by the lifecycle controller and the local engine.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::{find_poseidon_ark_and_mds, PoseidonConfig};
use ark_ff::PrimeField;
use std::time::Duration;

/// Inclusive bounds for the public risk level of a proposal.
pub const RISK_LEVEL_MIN: i64 = 1;
pub const RISK_LEVEL_MAX: i64 = 10;

/// Prefix of generated record ids.
pub const RECORD_ID_PREFIX: &str = "investment";

/// How long a terminal status stays visible before the board falls back to idle.
pub const SUCCESS_CLEAR_AFTER: Duration = Duration::from_secs(2);
pub const ERROR_CLEAR_AFTER: Duration = Duration::from_secs(3);

/// Capacity of the status broadcast channel. Slow subscribers lag, they never block publishers.
pub const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Width of one ABI word used to encode clear values.
pub const CLEAR_VALUE_WORD_BYTES: usize = 32;

// Domain separators absorbed first into every Poseidon invocation of the local engine.
pub const DOMAIN_MASK: u64 = 0x434C_5542_4D41_534B; // "CLUBMASK"
pub const DOMAIN_HANDLE: u64 = 0x434C_5542_4844_4C45; // "CLUBHDLE"
pub const DOMAIN_INPUT: u64 = 0x434C_5542_494E_5054; // "CLUBINPT"
pub const DOMAIN_DECRYPT: u64 = 0x434C_5542_4445_4352; // "CLUBDECR"
pub const DOMAIN_KEY: u64 = 0x434C_5542_4B45_5953; // "CLUBKEYS"

// Poseidon sponge configuration.
//
// Width-3 sponge (rate=2, capacity=1), same instantiation for hashing and MACs.
pub const POSEIDON_RATE: usize = 2;
pub const POSEIDON_CAPACITY: usize = 1;
pub const POSEIDON_FULL_ROUNDS: usize = 8;
pub const POSEIDON_PARTIAL_ROUNDS: usize = 57;
pub const POSEIDON_ALPHA: u64 = 5;

/// Deterministically derive Poseidon parameters for BN254::Fr.
pub fn poseidon_config() -> PoseidonConfig<Fr> {
    let prime_bits = Fr::MODULUS_BIT_SIZE as u64;

    let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(
        prime_bits,
        POSEIDON_RATE,
        POSEIDON_FULL_ROUNDS as u64,
        POSEIDON_PARTIAL_ROUNDS as u64,
        0,
    );

    PoseidonConfig::new(
        POSEIDON_FULL_ROUNDS,
        POSEIDON_PARTIAL_ROUNDS,
        POSEIDON_ALPHA,
        mds,
        ark,
        POSEIDON_RATE,
        POSEIDON_CAPACITY,
    )
}
