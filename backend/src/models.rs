use chrono::{DateTime, TimeZone, Utc};
use club_core::status::StatusUpdate;
use club_core::types::{CiphertextHandle, InvestmentRecord, MemberAddress, RecordId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// An investment as the API shows it.
///
/// `clear_amount` is only present on verified records. `created_at` is omitted when the ledger
/// timestamp cannot be represented.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordView {
    pub id: RecordId,
    pub name: String,
    pub description: String,
    pub creator: MemberAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub risk_level: u8,
    pub public_signal: u32,
    pub amount_handle: CiphertextHandle,
    pub is_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_amount: Option<u64>,
}

impl From<&InvestmentRecord> for RecordView {
    fn from(record: &InvestmentRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            creator: record.creator.clone(),
            created_at: created_at(record),
            risk_level: record.risk_level,
            public_signal: record.public_signal,
            amount_handle: record.handle().clone(),
            is_verified: record.is_verified(),
            clear_amount: record.clear_amount(),
        }
    }
}

fn created_at(record: &InvestmentRecord) -> Option<DateTime<Utc>> {
    let when = Utc.timestamp_opt(record.created_at, 0).single();
    if when.is_none() {
        warn!(record_id = %record.id, created_at = record.created_at, "ledger timestamp out of range");
    }
    when
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordListResponse {
    pub records: Vec<RecordView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub id: RecordId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub id: RecordId,
    pub clear_amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AvailabilityResponse {
    pub available: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Whether a banner would currently be shown.
    pub visible: bool,
    #[serde(flatten)]
    pub update: StatusUpdate,
}

impl From<StatusUpdate> for StatusResponse {
    fn from(update: StatusUpdate) -> Self {
        Self {
            visible: update.is_visible(),
            update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use club_core::types::EncryptedAmount;

    fn record(created_at: i64) -> InvestmentRecord {
        InvestmentRecord {
            id: RecordId::from("investment-1"),
            name: "Fund".to_string(),
            description: String::new(),
            creator: MemberAddress::from("0xalice"),
            created_at,
            risk_level: 3,
            public_signal: 0,
            amount: EncryptedAmount::Unverified {
                handle: CiphertextHandle::from("h"),
            },
        }
    }

    #[test]
    fn renders_ledger_timestamp() {
        let view = RecordView::from(&record(1_700_000_000));
        assert_eq!(view.created_at.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn unrepresentable_timestamp_is_omitted() {
        let view = RecordView::from(&record(i64::MAX));
        assert!(view.created_at.is_none());

        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("created_at").is_none());
        assert!(json.get("clear_amount").is_none());
    }
}
