//! The message translation pipeline: schema validation, identifier
//! subnet matching/rewriting, header derivation, and routing-key
//! computation.
//!
//! Grounded on `original_source/swpt_stomp/process_messages.py`
//! (`transform_message`, `preprocess_message`, `_change_subnet`,
//! `_as_hex`) and `original_source/tests/test_process_messages.py`
//! (`test_calc_bin_routing_key`, `test_preprocess_message_{aa,ca,da}`),
//! against which the routing-key algorithm and the per-role subnet
//! validation/rewrite rules below were cross-checked.

pub mod schemas;

use std::collections::{BTreeMap, HashSet};

use md5::{Digest, Md5};
use serde_json::{Map, Value};

use crate::broker::BrokerMessage;
use crate::directory::{NodeInfo, NodeRole, PeerInfo};
use crate::error::{ProcessingError, ServerError};
use crate::subnet::{change_subnet, Subnet};

/// A message as exchanged over the STOMP wire, decoupled from its frame
/// representation: the payload of a `SEND`/`MESSAGE` frame plus the
/// handful of headers that matter to translation.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub message_type: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Which direction a translation call is crossing. The only id this
/// affects is the CA role's rewritten `creditor_id`/`coordinator_id`:
/// its pre-rewrite value is expressed in whichever side *produced* the
/// message — the owning node for an outbound `transform`, the peer for
/// an inbound `preprocess`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Transform,
    Preprocess,
}

/// Per-deployment knobs that `spec.md` §9 leaves as configuration
/// rather than hard-coded: the `coordinator_type` values each role
/// accepts.
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub aa_coordinator_types: HashSet<String>,
    pub ca_coordinator_types: HashSet<String>,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        TranslatorConfig {
            aa_coordinator_types: ["direct", "issuing"].into_iter().map(String::from).collect(),
            ca_coordinator_types: ["direct", "agent"].into_iter().map(String::from).collect(),
        }
    }
}

enum Side {
    Owner,
    Peer,
}

fn creditor_subnet_side(role: NodeRole, direction: Direction) -> Side {
    match (role, direction) {
        (NodeRole::Ca, Direction::Transform) => Side::Owner,
        (NodeRole::Ca, Direction::Preprocess) => Side::Peer,
        (NodeRole::Aa, _) | (NodeRole::Da, _) => Side::Peer,
    }
}

fn debtor_subnet_side(role: NodeRole) -> Side {
    match role {
        NodeRole::Da => Side::Owner,
        NodeRole::Aa | NodeRole::Ca => Side::Peer,
    }
}

fn resolve(side: Side, owner: Option<Subnet>, peer: Subnet, what: &'static str) -> Subnet {
    match side {
        Side::Owner => owner.unwrap_or_else(|| panic!("node has no {what} configured for its role")),
        Side::Peer => peer,
    }
}

fn get_i64(obj: &Map<String, Value>, field: &str) -> Result<i64, ProcessingError> {
    obj.get(field)
        .and_then(Value::as_i64)
        .ok_or(ProcessingError::RoutingKeyOverflow)
}

fn as_hex(n: i64) -> String {
    format!("0x{:016x}", n as u64)
}

fn parse_message_body(
    message_type: &str,
    content_type: &str,
    body: &[u8],
    allow_in: bool,
    allow_out: bool,
) -> Result<Value, ProcessingError> {
    if content_type != "application/json" {
        return Err(ProcessingError::UnsupportedContentType(content_type.to_owned()));
    }

    let in_ok = schemas::IN_TYPES.contains(&message_type) && allow_in;
    let out_ok = schemas::OUT_TYPES.contains(&message_type) && allow_out;
    if !in_ok && !out_ok {
        return Err(ProcessingError::InvalidMessageType(message_type.to_owned()));
    }

    let text = std::str::from_utf8(body).map_err(|_| ProcessingError::Utf8)?;
    let value: Value = serde_json::from_str(text)
        .map_err(|_| ProcessingError::SchemaValidation(message_type.to_owned(), "invalid JSON".into()))?;
    schemas::validate(message_type, &value)?;
    Ok(value)
}

/// Translate a broker-originated message into the JSON body to `SEND`
/// to a peer. Rewrites ids into the peer's coordinate system; never
/// touches routing keys or headers, since those are wire-side-only
/// concerns.
pub fn transform_message(
    owner: &NodeInfo,
    peer: &PeerInfo,
    message_type: &str,
    id: &str,
    content_type: &str,
    body: &[u8],
) -> Result<Message, ProcessingError> {
    let allow_in = owner.role == NodeRole::Aa;
    let allow_out = owner.role != NodeRole::Aa;
    let mut data = parse_message_body(message_type, content_type, body, allow_in, allow_out)?;
    let obj = data.as_object_mut().expect("schema requires a JSON object");

    let creditor_id = get_i64(obj, "creditor_id")?;
    let debtor_id = get_i64(obj, "debtor_id")?;

    let creditor_subnet = resolve(
        creditor_subnet_side(owner.role, Direction::Transform),
        owner.creditors_subnet,
        peer.creditors_subnet,
        "creditors_subnet",
    );
    let debtor_subnet = resolve(
        debtor_subnet_side(owner.role),
        owner.debtors_subnet,
        peer.debtors_subnet,
        "debtors_subnet",
    );

    if !creditor_subnet.matches(creditor_id) {
        return Err(ProcessingError::InvalidCreditorId(as_hex(creditor_id)));
    }
    if !debtor_subnet.matches(debtor_id) {
        return Err(ProcessingError::InvalidDebtorId(as_hex(debtor_id)));
    }

    if owner.role == NodeRole::Ca {
        let from = owner.creditors_subnet.expect("CA node has no creditors_subnet configured");
        let to = peer.creditors_subnet;
        let rewritten = change_subnet(creditor_id, from, to)?;
        obj.insert("creditor_id".to_owned(), Value::from(rewritten));
        if obj.contains_key("coordinator_id") {
            let coordinator_id = get_i64(obj, "coordinator_id")?;
            let rewritten = change_subnet(coordinator_id, from, to)?;
            obj.insert("coordinator_id".to_owned(), Value::from(rewritten));
        }
    }

    let body = serde_json::to_vec(&data).expect("a serde_json::Value always serializes");
    Ok(Message {
        id: id.to_owned(),
        message_type: message_type.to_owned(),
        content_type: "application/json".to_owned(),
        body,
    })
}

/// Translate a peer-originated STOMP message into a broker message:
/// rewrites ids into the owning node's coordinate system, derives
/// headers, and computes the routing key.
pub fn preprocess_message(
    owner: &NodeInfo,
    peer: &PeerInfo,
    config: &TranslatorConfig,
    message: &Message,
) -> Result<BrokerMessage, ServerError> {
    preprocess_inner(owner, peer, config, message).map_err(|e| ServerError {
        message: e.to_string(),
        receipt_id: Some(message.id.clone()),
        context: Some(message.body.clone()),
        context_type: Some(message.message_type.clone()),
        context_content_type: Some(message.content_type.clone()),
    })
}

fn preprocess_inner(
    owner: &NodeInfo,
    peer: &PeerInfo,
    config: &TranslatorConfig,
    message: &Message,
) -> Result<BrokerMessage, ProcessingError> {
    let allow_in = owner.role != NodeRole::Aa;
    let allow_out = owner.role == NodeRole::Aa;
    let mut data = parse_message_body(&message.message_type, &message.content_type, &message.body, allow_in, allow_out)?;
    let obj = data.as_object_mut().expect("schema requires a JSON object");

    let mut creditor_id = get_i64(obj, "creditor_id")?;
    let debtor_id = get_i64(obj, "debtor_id")?;

    let creditor_subnet = resolve(
        creditor_subnet_side(owner.role, Direction::Preprocess),
        owner.creditors_subnet,
        peer.creditors_subnet,
        "creditors_subnet",
    );
    let debtor_subnet = resolve(
        debtor_subnet_side(owner.role),
        owner.debtors_subnet,
        peer.debtors_subnet,
        "debtors_subnet",
    );

    if !creditor_subnet.matches(creditor_id) {
        return Err(ProcessingError::InvalidCreditorId(as_hex(creditor_id)));
    }
    if !debtor_subnet.matches(debtor_id) {
        return Err(ProcessingError::InvalidDebtorId(as_hex(debtor_id)));
    }

    let mut coordinator_id = None;
    if owner.role == NodeRole::Ca {
        let from = peer.creditors_subnet;
        let to = owner.creditors_subnet.expect("CA node has no creditors_subnet configured");
        creditor_id = change_subnet(creditor_id, from, to)?;
        obj.insert("creditor_id".to_owned(), Value::from(creditor_id));
        if obj.contains_key("coordinator_id") {
            let raw = get_i64(obj, "coordinator_id")?;
            let rewritten = change_subnet(raw, from, to)?;
            obj.insert("coordinator_id".to_owned(), Value::from(rewritten));
            coordinator_id = Some(rewritten);
        }
    } else if let Some(Value::Number(_)) = obj.get("coordinator_id") {
        coordinator_id = Some(get_i64(obj, "coordinator_id")?);
    }

    let mut headers = BTreeMap::new();
    headers.insert("message-type".to_owned(), Value::from(message.message_type.clone()));
    headers.insert("debtor-id".to_owned(), Value::from(debtor_id));
    headers.insert("creditor-id".to_owned(), Value::from(creditor_id));

    if let Some(coordinator_type) = obj.get("coordinator_type").and_then(Value::as_str).map(str::to_owned) {
        let allow_list = match owner.role {
            NodeRole::Aa => &config.aa_coordinator_types,
            NodeRole::Ca => &config.ca_coordinator_types,
            NodeRole::Da => return Err(ProcessingError::InvalidCoordinatorType(coordinator_type)),
        };
        if !allow_list.contains(&coordinator_type) {
            return Err(ProcessingError::InvalidCoordinatorType(coordinator_type));
        }

        headers.insert("coordinator-id".to_owned(), Value::from(coordinator_id.expect("coordinator_type implies coordinator_id")));
        headers.insert("coordinator-type".to_owned(), Value::from(coordinator_type.clone()));

        if owner.role == NodeRole::Ca {
            let (ca_creditors, ca_trade) = match coordinator_type.as_str() {
                "direct" => (true, false),
                "agent" => (false, true),
                _ => (false, false),
            };
            headers.insert("ca-creditors".to_owned(), Value::from(ca_creditors));
            headers.insert("ca-trade".to_owned(), Value::from(ca_trade));
        }
    }

    let routing_args: Vec<i64> = match owner.role {
        NodeRole::Aa => vec![debtor_id, creditor_id],
        NodeRole::Ca => vec![coordinator_id.unwrap_or(creditor_id)],
        NodeRole::Da => vec![debtor_id],
    };
    let routing_key = calc_bin_routing_key(&routing_args);

    let body = serde_json::to_vec(&data).expect("a serde_json::Value always serializes");
    Ok(BrokerMessage {
        routing_key,
        content_type: "application/json".to_owned(),
        message_type: Some(message.message_type.clone()),
        body,
        headers,
        delivery_tag: None,
    })
}

/// The 24-bit routing key derivation `spec.md` §4.5/§8 defers to the
/// scenarios for: pack each argument big-endian as an `i64`, MD5-hash
/// the concatenated bytes, and render the first 3 digest bytes as a
/// dot-separated sequence of bits, most-significant first.
pub fn calc_bin_routing_key(args: &[i64]) -> String {
    let mut hasher = Md5::new();
    for arg in args {
        hasher.update(arg.to_be_bytes());
    }
    let digest = hasher.finalize();

    let mut bits = String::with_capacity(24 * 2 - 1);
    for (i, byte) in digest[..3].iter().enumerate() {
        for bit in (0..8).rev() {
            if i > 0 || bit < 7 {
                bits.push('.');
            }
            bits.push(if (byte >> bit) & 1 == 1 { '1' } else { '0' });
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subnet::Subnet;

    fn aa_node() -> NodeInfo {
        NodeInfo {
            role: NodeRole::Aa,
            node_id: "aa".into(),
            root_cert: vec![],
            creditors_subnet: None,
            debtors_subnet: None,
        }
    }

    fn ca_peer(creditors: &str, debtors: &str) -> PeerInfo {
        PeerInfo {
            role: NodeRole::Ca,
            node_id: "ca-peer".into(),
            servers: vec![],
            stomp_host: None,
            stomp_destination: None,
            root_cert: vec![],
            peer_cert: vec![],
            sub_cert: None,
            creditors_subnet: Subnet::parse(creditors).unwrap(),
            debtors_subnet: Subnet::parse(debtors).unwrap(),
        }
    }

    fn account_purge(debtor_id: i64, creditor_id: i64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "type": "AccountPurge",
            "debtor_id": debtor_id,
            "creditor_id": creditor_id,
            "creation_date": "2001-01-01",
            "ts": "2023-01-01T12:00:00+00:00"
        }))
        .unwrap()
    }

    #[test]
    fn routing_key_matches_pinned_vectors() {
        assert_eq!(
            calc_bin_routing_key(&[123]),
            "1.1.1.1.1.1.0.0.0.0.0.1.0.0.0.0.0.1.1.0.0.0.1.1"
        );
        assert_eq!(
            calc_bin_routing_key(&[-123]),
            "1.1.0.0.0.0.1.1.1.1.1.1.1.1.1.0.1.0.1.0.1.1.1.1"
        );
        assert_eq!(
            calc_bin_routing_key(&[123, 456]),
            "0.0.0.0.1.0.0.0.0.1.0.0.0.1.0.0.0.0.1.1.0.1.0.0"
        );
    }

    #[test]
    fn transform_aa_to_ca_passes_through_unmodified() {
        let owner = aa_node();
        let peer = ca_peer("000001", "1234abcd");
        let body = account_purge(0x1234ABCD00000001u64 as i64, 0x0000010000000ABCu64 as i64);
        let m = transform_message(&owner, &peer, "AccountPurge", "1", "application/json", &body).unwrap();
        let got: Value = serde_json::from_slice(&m.body).unwrap();
        let want: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn transform_rejects_mismatched_debtor_id() {
        let owner = aa_node();
        let peer = ca_peer("000001", "1234abcd");
        let body = account_purge(0x1234ABCE00000001u64 as i64, 0x0000010000000ABCu64 as i64);
        assert!(transform_message(&owner, &peer, "AccountPurge", "1", "application/json", &body).is_err());
    }

    #[test]
    fn ca_rewrite_scenario_from_seed_4() {
        let owner = NodeInfo {
            role: NodeRole::Ca,
            node_id: "ca".into(),
            root_cert: vec![],
            creditors_subnet: Some(Subnet::parse("000008").unwrap()),
            debtors_subnet: None,
        };
        let peer = PeerInfo {
            role: NodeRole::Aa,
            node_id: "aa-peer".into(),
            servers: vec![],
            stomp_host: None,
            stomp_destination: None,
            root_cert: vec![],
            peer_cert: vec![],
            sub_cert: None,
            creditors_subnet: Subnet::parse("000001").unwrap(),
            debtors_subnet: Subnet::ANY,
        };
        let body = serde_json::to_vec(&serde_json::json!({
            "type": "PrepareTransfer",
            "debtor_id": 0x1234ABCD00000001u64 as i64,
            "creditor_id": 0x0000080000000ABCu64 as i64,
            "min_locked_amount": 1000,
            "max_locked_amount": 2000,
            "recipient": "RECIPIENT",
            "final_interest_rate_ts": "9999-12-31T23:59:59+00:00",
            "max_commit_delay": 100000,
            "coordinator_type": "direct",
            "coordinator_id": 0x0000080000000002u64 as i64,
            "coordinator_request_id": 1111,
            "ts": "2023-01-01T12:00:00+00:00"
        }))
        .unwrap();

        let m = transform_message(&owner, &peer, "PrepareTransfer", "1", "application/json", &body).unwrap();
        let got: Value = serde_json::from_slice(&m.body).unwrap();
        assert_eq!(got["creditor_id"], 0x0000010000000ABCu64 as i64);
        assert_eq!(got["coordinator_id"], 0x0000010000000002u64 as i64);
    }

    #[test]
    fn preprocess_da_computes_single_arg_routing_key() {
        let owner = NodeInfo {
            role: NodeRole::Da,
            node_id: "da".into(),
            root_cert: vec![],
            creditors_subnet: None,
            debtors_subnet: Some(Subnet::parse("1234abcd").unwrap()),
        };
        let peer = PeerInfo {
            role: NodeRole::Aa,
            node_id: "aa-peer".into(),
            servers: vec![],
            stomp_host: None,
            stomp_destination: None,
            root_cert: vec![],
            peer_cert: vec![],
            sub_cert: None,
            creditors_subnet: Subnet::ANY,
            debtors_subnet: Subnet::parse("1234abcd").unwrap(),
        };
        let body = account_purge(0x1234ABCD00000001u64 as i64, 0);
        let message = Message {
            id: "1".into(),
            message_type: "AccountPurge".into(),
            content_type: "application/json".into(),
            body,
        };
        let config = TranslatorConfig::default();
        let m = preprocess_message(&owner, &peer, &config, &message).unwrap();
        assert_eq!(m.routing_key, calc_bin_routing_key(&[0x1234ABCD00000001u64 as i64]));
        assert_eq!(m.headers["debtor-id"], 0x1234ABCD00000001u64 as i64);
        assert!(!m.headers.contains_key("coordinator-id"));
    }

    #[test]
    fn preprocess_rejects_unknown_coordinator_type() {
        let owner = NodeInfo {
            role: NodeRole::Aa,
            node_id: "aa".into(),
            root_cert: vec![],
            creditors_subnet: None,
            debtors_subnet: None,
        };
        let peer = ca_peer("000001", "1234abcd");
        let body = serde_json::to_vec(&serde_json::json!({
            "type": "PrepareTransfer",
            "debtor_id": 0x1234ABCD00000001u64 as i64,
            "creditor_id": 0x0000010000000ABCu64 as i64,
            "min_locked_amount": 1000,
            "max_locked_amount": 2000,
            "recipient": "RECIPIENT",
            "final_interest_rate_ts": "9999-12-31T23:59:59+00:00",
            "max_commit_delay": 100000,
            "coordinator_type": "invalid",
            "coordinator_id": 0x0000010000000ABCu64 as i64,
            "coordinator_request_id": 1111,
            "ts": "2023-01-01T12:00:00+00:00"
        }))
        .unwrap();
        let message = Message {
            id: "1".into(),
            message_type: "PrepareTransfer".into(),
            content_type: "application/json".into(),
            body,
        };
        let config = TranslatorConfig::default();
        assert!(preprocess_message(&owner, &peer, &config, &message).is_err());
    }
}
