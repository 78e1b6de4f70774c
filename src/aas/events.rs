//! AAS event ingestion helpers: the MQTT/webhook topic grammar used to
//! recover submodel/idShort hints from a notification, and the recent-write
//! cache that suppresses the OPC UA -> AAS -> OPC UA echo an AAS-side write
//! would otherwise cause on its next poll or MQTT notification.

use crate::types::AasValue;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Hints recovered from a topic/path, used to fill in whatever the payload
/// itself leaves implicit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventHints {
    pub id_short: Option<String>,
    pub id_short_path: Option<String>,
    pub submodel_id: Option<String>,
}

/// Decodes a base64url (no padding) segment; falls back to the raw value if
/// it does not decode, since some deployments configure plain submodel ids
/// in their topic layout rather than the BaSyx-style encoded identifier.
pub fn decode_base64url(value: &str) -> String {
    if value.is_empty() {
        return value.to_string();
    }
    URL_SAFE_NO_PAD
        .decode(value)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| value.to_string())
}

const TERMINAL_SEGMENTS: &[&str] = &["updated", "patched", "patch", "value", "$value"];

/// Parses `…/submodels/<b64>/submodelElements/<path>/<verb>`, the topic
/// grammar a BaSyx-compatible repository's MQTT bridge or webhook publishes
/// element change notifications under.
pub fn parse_topic(topic: &str) -> EventHints {
    let parts: Vec<&str> = topic.split('/').filter(|p| !p.is_empty()).collect();

    let submodel_id = parts
        .iter()
        .position(|&p| p == "submodels")
        .and_then(|i| parts.get(i + 1))
        .map(|raw| decode_base64url(raw));

    let id_short_path = parts
        .iter()
        .position(|&p| p == "submodelElements")
        .map(|i| parts[i + 1..].to_vec())
        .map(|mut tail| {
            if let Some(last) = tail.last() {
                if TERMINAL_SEGMENTS.iter().any(|seg| seg.eq_ignore_ascii_case(last)) {
                    tail.pop();
                }
            }
            tail.join("/")
        })
        .filter(|s| !s.is_empty());

    let id_short = id_short_path
        .as_ref()
        .and_then(|p| p.rsplit('/').next())
        .map(str::to_string);

    EventHints {
        id_short,
        id_short_path,
        submodel_id,
    }
}

fn hash_value(value: &AasValue) -> u64 {
    let mut hasher = DefaultHasher::new();
    match value {
        AasValue::Bool(v) => v.hash(&mut hasher),
        AasValue::Integer(v) => v.hash(&mut hasher),
        AasValue::Float(v) => v.to_bits().hash(&mut hasher),
        AasValue::String(v) => v.hash(&mut hasher),
        AasValue::Bytes(v) => v.hash(&mut hasher),
        AasValue::DateTime(v) => v.timestamp_nanos_opt().unwrap_or_default().hash(&mut hasher),
    }
    hasher.finish()
}

fn dedup_key(submodel_id: &str, id_short: &str) -> String {
    format!("{submodel_id}#{id_short}")
}

/// Remembers values this bridge itself just wrote to the AAS side, so the
/// next inbound poll or MQTT notification carrying that same value is
/// recognized as an echo rather than re-queued as a fresh AAS->OPCUA write.
/// Keyed on `(submodel_id, id_short)`, not on node id, because the AAS side
/// is where the echo is observed.
pub struct RecentWriteCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, (Instant, u64)>>,
}

impl RecentWriteCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn remember(&self, submodel_id: &str, id_short: &str, value: &AasValue) {
        if self.ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.insert(dedup_key(submodel_id, id_short), (now, hash_value(value)));
        prune(&mut entries, now, self.ttl);
        while entries.len() > self.max_entries {
            let Some(oldest) = entries.iter().min_by_key(|(_, (ts, _))| *ts).map(|(k, _)| k.clone()) else {
                break;
            };
            entries.remove(&oldest);
        }
    }

    pub async fn matches(&self, submodel_id: &str, id_short: &str, value: &AasValue) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        prune(&mut entries, now, self.ttl);
        match entries.get(&dedup_key(submodel_id, id_short)) {
            Some((ts, hash)) if now.duration_since(*ts) <= self.ttl => *hash == hash_value(value),
            _ => false,
        }
    }
}

fn prune(entries: &mut HashMap<String, (Instant, u64)>, now: Instant, ttl: Duration) {
    entries.retain(|_, (ts, _)| now.duration_since(*ts) <= ttl);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_updated_topic_with_encoded_submodel() {
        let submodel_b64 = URL_SAFE_NO_PAD.encode("urn:example:submodel:1");
        let topic = format!("submodels/{submodel_b64}/submodelElements/Temperature/updated");
        let hints = parse_topic(&topic);
        assert_eq!(hints.submodel_id.as_deref(), Some("urn:example:submodel:1"));
        assert_eq!(hints.id_short.as_deref(), Some("Temperature"));
    }

    #[test]
    fn parses_value_suffix_and_nested_path() {
        let topic = "submodels/c3VibW9kZWw/submodelElements/Group/Setpoint/value";
        let hints = parse_topic(topic);
        assert_eq!(hints.id_short_path.as_deref(), Some("Group/Setpoint"));
        assert_eq!(hints.id_short.as_deref(), Some("Setpoint"));
    }

    #[test]
    fn falls_back_to_raw_value_when_not_base64url() {
        assert_eq!(decode_base64url("not base64!!"), "not base64!!");
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_a_remembered_write() {
        let cache = RecentWriteCache::new(Duration::from_secs(1), 100);
        cache.remember("urn:test", "Temperature", &AasValue::Float(21.5)).await;
        assert!(cache.matches("urn:test", "Temperature", &AasValue::Float(21.5)).await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.matches("urn:test", "Temperature", &AasValue::Float(21.5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn a_different_value_does_not_match() {
        let cache = RecentWriteCache::new(Duration::from_secs(5), 100);
        cache.remember("urn:test", "Temperature", &AasValue::Float(21.5)).await;
        assert!(!cache.matches("urn:test", "Temperature", &AasValue::Float(99.9)).await);
    }

    #[tokio::test]
    async fn max_entries_evicts_the_oldest() {
        let cache = RecentWriteCache::new(Duration::from_secs(60), 1);
        cache.remember("urn:test", "A", &AasValue::Integer(1)).await;
        cache.remember("urn:test", "B", &AasValue::Integer(2)).await;
        assert!(!cache.matches("urn:test", "A", &AasValue::Integer(1)).await);
        assert!(cache.matches("urn:test", "B", &AasValue::Integer(2)).await);
    }
}
