//! Compiled-in JSON Schema documents, one per message type, plus the
//! `IN_TYPES`/`OUT_TYPES` partition `spec.md` §4.5 names directly.
//!
//! Field sets are reconstructed from the message builders in
//! `original_source/tests/test_process_messages.py`
//! (`create_account_purge_msg`, `create_prepare_transfer_msg`,
//! `create_rejected_transfer_msg`); the schema set itself
//! (`smp_schemas.JSON_SCHEMAS`) wasn't among the retrieved source files.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::{json, Value};

use crate::error::ProcessingError;

/// Messages a CA/DA node sends outward to an AA peer, and an AA node
/// receives.
pub const IN_TYPES: &[&str] = &["AccountPurge", "RejectedTransfer"];

/// Messages an AA node sends outward to a CA/DA peer, and a CA/DA node
/// receives.
pub const OUT_TYPES: &[&str] = &["PrepareTransfer"];

fn registry() -> &'static HashMap<&'static str, jsonschema::Validator> {
    static REGISTRY: OnceLock<HashMap<&'static str, jsonschema::Validator>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert("AccountPurge", compile(account_purge_schema()));
        m.insert("PrepareTransfer", compile(prepare_transfer_schema()));
        m.insert("RejectedTransfer", compile(rejected_transfer_schema()));
        m
    })
}

fn compile(schema: Value) -> jsonschema::Validator {
    jsonschema::validator_for(&schema).expect("schema document is valid JSON Schema")
}

/// Validate `instance` against the compiled schema for `message_type`.
/// Panics if `message_type` has no registered schema — callers are
/// expected to have already checked membership in `IN_TYPES`/`OUT_TYPES`.
pub fn validate(message_type: &str, instance: &Value) -> Result<(), ProcessingError> {
    let validator = registry()
        .get(message_type)
        .unwrap_or_else(|| panic!("no schema registered for message type {message_type:?}"));
    if validator.is_valid(instance) {
        Ok(())
    } else {
        Err(ProcessingError::SchemaValidation(
            message_type.to_owned(),
            "message failed schema validation".into(),
        ))
    }
}

fn account_purge_schema() -> Value {
    json!({
        "type": "object",
        "required": ["type", "debtor_id", "creditor_id", "creation_date", "ts"],
        "properties": {
            "type": {"const": "AccountPurge"},
            "debtor_id": {"type": "integer"},
            "creditor_id": {"type": "integer"},
            "creation_date": {"type": "string"},
            "ts": {"type": "string"}
        }
    })
}

fn prepare_transfer_schema() -> Value {
    json!({
        "type": "object",
        "required": [
            "type", "debtor_id", "creditor_id", "min_locked_amount",
            "max_locked_amount", "recipient", "final_interest_rate_ts",
            "max_commit_delay", "coordinator_type", "coordinator_id",
            "coordinator_request_id", "ts"
        ],
        "properties": {
            "type": {"const": "PrepareTransfer"},
            "debtor_id": {"type": "integer"},
            "creditor_id": {"type": "integer"},
            "min_locked_amount": {"type": "integer"},
            "max_locked_amount": {"type": "integer"},
            "recipient": {"type": "string"},
            "final_interest_rate_ts": {"type": "string"},
            "max_commit_delay": {"type": "integer"},
            "coordinator_type": {"type": "string"},
            "coordinator_id": {"type": "integer"},
            "coordinator_request_id": {"type": "integer"},
            "ts": {"type": "string"}
        }
    })
}

fn rejected_transfer_schema() -> Value {
    json!({
        "type": "object",
        "required": [
            "type", "debtor_id", "creditor_id", "coordinator_type",
            "coordinator_id", "coordinator_request_id", "status_code",
            "total_locked_amount", "ts"
        ],
        "properties": {
            "type": {"const": "RejectedTransfer"},
            "debtor_id": {"type": "integer"},
            "creditor_id": {"type": "integer"},
            "coordinator_type": {"type": "string"},
            "coordinator_id": {"type": "integer"},
            "coordinator_request_id": {"type": "integer"},
            "status_code": {"type": "string"},
            "total_locked_amount": {"type": "integer"},
            "ts": {"type": "string"}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_account_purge_passes() {
        let v = json!({
            "type": "AccountPurge",
            "debtor_id": 123,
            "creditor_id": 456,
            "creation_date": "2001-01-01",
            "ts": "2023-01-01T12:00:00+00:00"
        });
        assert!(validate("AccountPurge", &v).is_ok());
    }

    #[test]
    fn missing_field_fails() {
        assert!(validate("AccountPurge", &json!({})).is_err());
    }

    #[test]
    fn non_object_fails() {
        assert!(validate("AccountPurge", &json!("xxx")).is_err());
    }

    #[test]
    fn wrong_type_tag_fails() {
        let v = json!({
            "type": "PrepareTransfer",
            "debtor_id": 1,
            "creditor_id": 2,
            "creation_date": "2001-01-01",
            "ts": "2023-01-01T12:00:00+00:00"
        });
        assert!(validate("AccountPurge", &v).is_err());
    }
}
