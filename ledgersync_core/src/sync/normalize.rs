use crate::sync::models::{AccountId, ObjectKind, RawExternalObject};
use crate::sync::traits::VendorRecord;
use crate::{Error, Result};
use chrono::{DateTime, Utc};

/// Map one vendor record into its canonical envelope.
///
/// The payload is preserved opaquely: unknown or extra fields survive schema
/// drift untouched. Only a missing vendor id or missing update timestamp is
/// a hard failure, and it is per-record — the caller excludes the record
/// from the batch and keeps going.
pub fn normalize(
    record: &VendorRecord,
    account_id: AccountId,
    kind: ObjectKind,
    now: DateTime<Utc>,
) -> Result<RawExternalObject> {
    let id = record
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Normalization(format!("{kind} record is missing a vendor id")))?;

    let updated_at = record.updated_at.ok_or_else(|| {
        Error::Normalization(format!("{kind} record '{id}' is missing an update timestamp"))
    })?;

    RawExternalObject::new(
        account_id,
        kind,
        id,
        record.payload.clone(),
        updated_at,
        now,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn unknown_fields_are_preserved_opaquely() {
        let record = VendorRecord {
            id: Some("42".to_string()),
            updated_at: Some(ts(500)),
            payload: serde_json::json!({
                "Id": "42",
                "DisplayName": "Acme",
                "SomeFutureField": {"nested": [1, 2, 3]},
            }),
        };
        let obj = normalize(&record, AccountId(Uuid::new_v4()), ObjectKind::Customer, ts(501))
            .unwrap();
        assert_eq!(obj.vendor_object_id, "42");
        assert_eq!(obj.vendor_updated_at, ts(500));
        assert_eq!(obj.payload["SomeFutureField"]["nested"][1], 2);
    }

    #[test]
    fn missing_id_is_a_per_record_error() {
        let record = VendorRecord {
            id: None,
            updated_at: Some(ts(500)),
            payload: serde_json::json!({"DisplayName": "NoId"}),
        };
        let err = normalize(&record, AccountId(Uuid::new_v4()), ObjectKind::Customer, ts(501))
            .unwrap_err();
        assert!(matches!(err, Error::Normalization(_)));
    }

    #[test]
    fn blank_id_is_treated_as_missing() {
        let record = VendorRecord {
            id: Some("   ".to_string()),
            updated_at: Some(ts(500)),
            payload: serde_json::json!({}),
        };
        assert!(
            normalize(&record, AccountId(Uuid::new_v4()), ObjectKind::Invoice, ts(501)).is_err()
        );
    }

    #[test]
    fn missing_timestamp_is_a_per_record_error() {
        let record = VendorRecord {
            id: Some("7".to_string()),
            updated_at: None,
            payload: serde_json::json!({"Id": "7"}),
        };
        let err = normalize(&record, AccountId(Uuid::new_v4()), ObjectKind::Invoice, ts(501))
            .unwrap_err();
        assert!(matches!(err, Error::Normalization(_)));
    }
}
