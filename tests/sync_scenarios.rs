//! End-to-end scenarios driven against the Memory AAS provider, exercising
//! more than one module wired together: the Mapping Engine's conversion and
//! validation, and the Memory AAS provider's submodel/element store.
//!
//! These intentionally avoid a live OPC UA endpoint (an external
//! collaborator's test fixture, out of this crate's scope) and instead
//! drive the synchronization engine's core from both ends: a
//! `transform_to_aas` + `update_property` pair for the south->north
//! direction, and `transform_to_opcua`'s validation for the north->south
//! direction.

use opcua_aas_bridge::aas::memory::MemoryAasProvider;
use opcua_aas_bridge::aas::AasProvider;
use opcua_aas_bridge::config::{AasProviderConfig, MappingRule, RangeConstraint, SyncDirection};
use opcua_aas_bridge::mapping::MappingEngine;
use opcua_aas_bridge::types::AasValue;
use opcua::types::{Variant, VariantTypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

fn temperature_rule() -> MappingRule {
    MappingRule {
        opcua_node_id: "ns=2;s=Temperature".to_string(),
        aas_id_short: "Temperature".to_string(),
        submodel_id: "urn:test".to_string(),
        endpoint: None,
        semantic_id: None,
        direction: SyncDirection::Bidirectional,
        value_type: "xs:double".to_string(),
        range_constraint: None,
        transform_expression: None,
        enabled: true,
    }
}

fn speed_rule_with_range() -> MappingRule {
    MappingRule {
        opcua_node_id: "ns=2;s=Speed".to_string(),
        aas_id_short: "Speed".to_string(),
        submodel_id: "urn:test".to_string(),
        endpoint: None,
        semantic_id: None,
        direction: SyncDirection::Bidirectional,
        value_type: "xs:double".to_string(),
        range_constraint: Some(RangeConstraint {
            min_value: Some(0.0),
            max_value: Some(100.0),
            unit: None,
        }),
        transform_expression: None,
        enabled: true,
    }
}

fn memory_provider() -> MemoryAasProvider {
    let submodels = Arc::new(TokioMutex::new(HashMap::new()));
    MemoryAasProvider::new(AasProviderConfig::default(), submodels)
}

/// S1: a value written to an OPC UA node flows through the Mapping Engine
/// and lands, unchanged, on the matching AAS property.
#[tokio::test]
async fn s1_opcua_write_reaches_the_aas_property() {
    let engine = MappingEngine::new(vec![temperature_rule()]).unwrap();
    let provider = memory_provider();

    let variant = Variant::Double(42.0);
    let (value, xsd) = engine
        .transform_to_aas("ns=2;s=Temperature", &variant, VariantTypeId::Double)
        .unwrap();
    assert_eq!(xsd, "xs:double");

    let mapping = engine.get_mapping_for_node("ns=2;s=Temperature").unwrap();
    provider.update_property(mapping, value).await.unwrap();

    assert_eq!(
        provider.read_property("urn:test", "Temperature").await,
        Some(AasValue::Float(42.0))
    );
}

/// S2: an AAS-originated write inside the configured range converts cleanly
/// to the OPC UA variant the Control Manager would write.
#[tokio::test]
async fn s2_in_range_aas_write_converts_to_the_expected_variant() {
    let engine = MappingEngine::new(vec![speed_rule_with_range()]).unwrap();

    let variant = engine
        .transform_to_opcua("ns=2;s=Speed", &AasValue::Float(55.0))
        .unwrap();
    match variant {
        Variant::Double(v) => assert_eq!(v, 55.0),
        other => panic!("expected a Double variant, got {other:?}"),
    }
}

/// S3: a value strictly outside the configured range is refused, never
/// clamped, and the failure carries the offending value for the audit trail.
#[tokio::test]
async fn s3_out_of_range_aas_write_is_refused() {
    let engine = MappingEngine::new(vec![speed_rule_with_range()]).unwrap();

    let err = engine
        .transform_to_opcua("ns=2;s=Speed", &AasValue::Float(150.0))
        .unwrap_err();
    assert!(matches!(err, opcua_aas_bridge::errors::BridgeError::Validation { .. }));
}

/// Property 5: boundary values (exactly min/max) pass validation.
#[tokio::test]
async fn range_boundaries_are_inclusive() {
    let engine = MappingEngine::new(vec![speed_rule_with_range()]).unwrap();

    assert!(engine.transform_to_opcua("ns=2;s=Speed", &AasValue::Float(0.0)).is_ok());
    assert!(engine.transform_to_opcua("ns=2;s=Speed", &AasValue::Float(100.0)).is_ok());
}

/// Property 4: a read-only (opcua->aas) rule always refuses a reverse write.
#[tokio::test]
async fn direction_enforcement_blocks_reverse_writes() {
    let mut rule = temperature_rule();
    rule.direction = SyncDirection::OpcuaToAas;
    let engine = MappingEngine::new(vec![rule]).unwrap();

    let err = engine
        .transform_to_opcua("ns=2;s=Temperature", &AasValue::Float(1.0))
        .unwrap_err();
    assert!(matches!(err, opcua_aas_bridge::errors::BridgeError::Mapping(_)));
}

/// Property 2: registering the same submodel twice is a no-op on the
/// element set (idempotent creation).
#[tokio::test]
async fn registration_is_idempotent() {
    let engine = MappingEngine::new(vec![temperature_rule(), speed_rule_with_range()]).unwrap();
    let submodels = engine.submodels();

    engine.register_submodel("urn:test").await;
    let first_count = submodels.lock().await.get("urn:test").unwrap().elements.len();

    engine.register_submodel("urn:test").await;
    let second_count = submodels.lock().await.get("urn:test").unwrap().elements.len();

    assert_eq!(first_count, 2);
    assert_eq!(first_count, second_count);
}

/// S2 continuation: `submit_write` on the Memory provider enqueues a request
/// observable on `write_requests`, matching the AAS->OPCUA submission path
/// an operator-facing surface would use ahead of the Control Manager.
#[tokio::test]
async fn submit_write_is_observable_on_the_write_request_stream() {
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    let provider = memory_provider();
    assert!(provider
        .submit_write("Speed", AasValue::Float(55.0), Some("urn:test".to_string()), Some("tester".to_string()))
        .await);

    let shutdown = CancellationToken::new();
    let mut stream = provider.write_requests(shutdown.clone());
    let request = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
        .await
        .expect("a write request within 1s")
        .expect("stream yields a request");

    assert_eq!(request.id_short, "Speed");
    assert_eq!(request.submodel_id.as_deref(), Some("urn:test"));
    assert_eq!(request.user_id.as_deref(), Some("tester"));
    shutdown.cancel();
}
