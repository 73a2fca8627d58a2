//! Record model and the values exchanged with the collaborators.

use crate::constants::{CLEAR_VALUE_WORD_BYTES, RISK_LEVEL_MAX, RISK_LEVEL_MIN};
use crate::error::ClubError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque, immutable identifier of an investment record.
    RecordId
);
string_id!(
    /// Identity of a club member (the submitter / creator of records).
    MemberAddress
);
string_id!(
    /// Identity of the ledger contract that ciphertexts and proofs are bound to.
    ContractAddress
);
string_id!(
    /// Opaque reference to an encrypted value held by the ledger.
    CiphertextHandle
);

/// Ciphertext produced by the encryption gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    pub handle: CiphertextHandle,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

/// Gateway output: a ciphertext and the proof binding it to (contract, submitter).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedInput {
    pub ciphertext: Ciphertext,
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
}

/// Verifier output: clear values per requested handle plus a proof the ledger can check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionResult {
    pub clear_values: BTreeMap<CiphertextHandle, u64>,
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
}

/// A submitted but not yet confirmed ledger transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingTx {
    pub tx_hash: String,
}

/// Creation request handed to the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRecordRequest {
    pub id: RecordId,
    pub signer: MemberAddress,
    pub name: String,
    pub encrypted_amount: EncryptedInput,
    pub risk_level: u8,
    pub public_signal: u32,
    pub description: String,
}

/// Record fields as reported by the ledger.
///
/// `clear_amount` is only meaningful when `is_verified` is set; the conversion into
/// [`InvestmentRecord`] enforces that.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub name: String,
    pub description: String,
    pub creator: MemberAddress,
    pub created_at: i64,
    pub risk_level: u8,
    pub public_signal: u32,
    pub is_verified: bool,
    pub clear_amount: Option<u64>,
}

/// Encrypted investment amount.
///
/// The clear value only exists in the `Verified` variant, so a record can never expose a clear
/// amount without being verified, nor be verified without one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EncryptedAmount {
    Unverified { handle: CiphertextHandle },
    Verified { handle: CiphertextHandle, clear: u64 },
}

impl EncryptedAmount {
    pub fn handle(&self) -> &CiphertextHandle {
        match self {
            EncryptedAmount::Unverified { handle } | EncryptedAmount::Verified { handle, .. } => handle,
        }
    }
}

/// One investment proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentRecord {
    pub id: RecordId,
    pub name: String,
    pub description: String,
    pub creator: MemberAddress,
    pub created_at: i64,
    pub risk_level: u8,
    pub public_signal: u32,
    pub amount: EncryptedAmount,
}

impl InvestmentRecord {
    /// Build a record from what the ledger reports, taking verification status at face value.
    ///
    /// An unverified record drops whatever clear value the ledger may have sent along. A verified
    /// record without a clear value is inconsistent and rejected.
    pub fn from_ledger(id: RecordId, fields: LedgerRecord, handle: CiphertextHandle) -> Result<Self, ClubError> {
        let amount = match (fields.is_verified, fields.clear_amount) {
            (true, Some(clear)) => EncryptedAmount::Verified { handle, clear },
            (true, None) => {
                return Err(ClubError::LedgerFailed(format!(
                    "record {id} is verified but carries no clear amount"
                )));
            }
            (false, _) => EncryptedAmount::Unverified { handle },
        };

        Ok(Self {
            id,
            name: fields.name,
            description: fields.description,
            creator: fields.creator,
            created_at: fields.created_at,
            risk_level: fields.risk_level,
            public_signal: fields.public_signal,
            amount,
        })
    }

    pub fn is_verified(&self) -> bool {
        matches!(self.amount, EncryptedAmount::Verified { .. })
    }

    pub fn clear_amount(&self) -> Option<u64> {
        match self.amount {
            EncryptedAmount::Verified { clear, .. } => Some(clear),
            EncryptedAmount::Unverified { .. } => None,
        }
    }

    pub fn handle(&self) -> &CiphertextHandle {
        self.amount.handle()
    }

    /// Swap the amount to its verified form. Both fields change in one assignment.
    pub(crate) fn mark_verified(&mut self, clear: u64) {
        let handle = self.amount.handle().clone();
        self.amount = EncryptedAmount::Verified { handle, clear };
    }
}

/// Raw create-form input as a member submits it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvestment {
    pub name: String,
    /// Integer only; parsed during validation.
    pub amount: String,
    pub risk_level: i64,
    #[serde(default)]
    pub public_signal: u32,
    #[serde(default)]
    pub description: String,
}

/// [`NewInvestment`] after validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedInvestment {
    pub name: String,
    pub amount: u64,
    pub risk_level: u8,
    pub public_signal: u32,
    pub description: String,
}

impl NewInvestment {
    pub fn validate(&self) -> Result<ValidatedInvestment, ClubError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ClubError::Validation("name must not be empty".to_string()));
        }

        let amount = self
            .amount
            .trim()
            .parse::<u64>()
            .map_err(|_| ClubError::Validation("amount must be a non-negative integer".to_string()))?;

        if !(RISK_LEVEL_MIN..=RISK_LEVEL_MAX).contains(&self.risk_level) {
            return Err(ClubError::Validation(format!(
                "risk level must be between {RISK_LEVEL_MIN} and {RISK_LEVEL_MAX}"
            )));
        }

        Ok(ValidatedInvestment {
            name: name.to_string(),
            amount,
            risk_level: self.risk_level as u8,
            public_signal: self.public_signal,
            description: self.description.clone(),
        })
    }
}

/// Encode clear values as consecutive 32-byte big-endian words.
pub fn encode_clear_values(values: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * CLEAR_VALUE_WORD_BYTES);
    for v in values {
        out.extend_from_slice(&[0u8; CLEAR_VALUE_WORD_BYTES - 8]);
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}

/// Inverse of [`encode_clear_values`]. Rejects ragged input and words above `u64::MAX`.
pub fn decode_clear_values(bytes: &[u8]) -> Option<Vec<u64>> {
    if bytes.len() % CLEAR_VALUE_WORD_BYTES != 0 {
        return None;
    }

    bytes
        .chunks(CLEAR_VALUE_WORD_BYTES)
        .map(|word| {
            let (high, low) = word.split_at(CLEAR_VALUE_WORD_BYTES - 8);
            if high.iter().any(|b| *b != 0) {
                return None;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(low);
            Some(u64::from_be_bytes(buf))
        })
        .collect()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
