use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::config::{InstanceStatus, ServiceType};
use crate::error::MeshError;

/// The value published under a Registry instance key.
///
/// `extra` absorbs any field an operator-edited record carries that this
/// struct does not model by name, so a re-publish after an external `Put`
/// never drops metadata it does not understand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub namespace: String,
    pub service_type: ServiceType,
    pub key: String,
    pub address: String,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InstanceRecord {
    pub fn new(namespace: impl Into<String>, service_type: ServiceType, key: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            service_type,
            key: key.into(),
            address: address.into(),
            weight: 0,
            status: InstanceStatus::Run,
            meta: HashMap::new(),
            extra: Map::new(),
        }
    }

    pub fn encode(&self) -> Result<String, MeshError> {
        serde_json::to_string(self).map_err(|e| MeshError::InvalidRecord(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, MeshError> {
        serde_json::from_str(raw).map_err(|e| MeshError::InvalidRecord(e.to_string()))
    }
}

/// Registry prefix all instances of a `(namespace, service_type, key)` triple
/// are published under: `/{namespace}/{service_type}/{key}/`.
pub fn service_prefix(namespace: &str, service_type: ServiceType, key: &str) -> String {
    format!("/{namespace}/{service_type}/{key}/")
}

/// Full Registry key for one instance, inserting the isolation segment when
/// `machine_id` is present: `/ns/type/svc/{MID}/{instance_id}`.
pub fn instance_key(
    namespace: &str,
    service_type: ServiceType,
    key: &str,
    machine_id: Option<&str>,
    instance_id: &str,
) -> String {
    match machine_id {
        Some(mid) => format!("/{namespace}/{service_type}/{key}/{mid}/{instance_id}"),
        None => format!("/{namespace}/{service_type}/{key}/{instance_id}"),
    }
}

/// Collaborator contract: supplies instance-id generation. Default
/// implementation generates a random-suffix 6-character base36 string.
pub trait InstanceIdSource: Send + Sync {
    fn generate(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomBase36InstanceId;

impl InstanceIdSource for RandomBase36InstanceId {
    fn generate(&self) -> String {
        const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let mut rng = rand::thread_rng();
        (0..6)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }
}

/// Parses the tail of a watched Registry key back into its component parts.
/// Expects `/{namespace}/{service_type}/{key}/[{machine_id}/]{instance_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub namespace: String,
    pub service_type: String,
    pub service_name: String,
    pub machine_id: Option<String>,
    pub instance_id: String,
}

pub fn parse_key(raw: &str) -> Option<ParsedKey> {
    let trimmed = raw.trim_start_matches('/');
    let parts: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    match parts.len() {
        4 => Some(ParsedKey {
            namespace: parts[0].to_string(),
            service_type: parts[1].to_string(),
            service_name: parts[2].to_string(),
            machine_id: None,
            instance_id: parts[3].to_string(),
        }),
        5 => Some(ParsedKey {
            namespace: parts[0].to_string(),
            service_type: parts[1].to_string(),
            service_name: parts[2].to_string(),
            machine_id: Some(parts[3].to_string()),
            instance_id: parts[4].to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json_preserving_unknown_fields() {
        let raw = r#"{"namespace":"ht","service_type":"rpc","key":"user",
            "address":"10.0.0.1:8000","weight":5,"status":"Run",
            "meta":{"zone":"cn-1"},"region":"us-east"}"#;
        let record = InstanceRecord::decode(raw).expect("decode");
        assert_eq!(record.extra.get("region").unwrap(), "us-east");
        let encoded = record.encode().expect("encode");
        let round_tripped = InstanceRecord::decode(&encoded).expect("decode again");
        assert_eq!(round_tripped, record);
    }

    #[test]
    fn instance_key_inserts_isolation_segment_only_when_present() {
        let k = instance_key("ht", ServiceType::Rpc, "user", None, "ab12cd");
        assert_eq!(k, "/ht/rpc/user/ab12cd");
        let k = instance_key("ht", ServiceType::Rpc, "user", Some("deadbeef"), "ab12cd");
        assert_eq!(k, "/ht/rpc/user/deadbeef/ab12cd");
    }

    #[test]
    fn parses_keys_with_and_without_machine_id() {
        let p = parse_key("/ht/rpc/user/ab12cd").unwrap();
        assert_eq!(p.service_name, "user");
        assert!(p.machine_id.is_none());

        let p = parse_key("/ht/rpc/user/deadbeef/ab12cd").unwrap();
        assert_eq!(p.machine_id.as_deref(), Some("deadbeef"));
        assert_eq!(p.instance_id, "ab12cd");
    }

    #[test]
    fn random_base36_instance_id_is_six_chars() {
        let id = RandomBase36InstanceId.generate();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_uppercase()));
    }
}
