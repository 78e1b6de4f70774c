//! Mapping Engine: resolves configured rules against OPC UA node ids and
//! AAS submodel elements, and drives both conversion directions.
//!
//! `ResolvedMapping` deliberately holds only identifiers, never a reference
//! into the submodel/element table: the AAS side is shared, mutable state
//! (concurrently read by the monitoring pipeline and written by the control
//! pipeline), and a back-pointer from a mapping into the very table the
//! mapping engine also owns would be a reference cycle with no clean
//! `Arc`/`Weak` split. Looking the element up by key on every access costs a
//! hash lookup and buys a tree with no cycles.

use crate::aas::model::{Property, SemanticReference, Submodel};
use crate::config::{MappingRule, SyncDirection};
use crate::errors::BridgeError;
use crate::mapping::expr::{self, Expr};
use crate::types::{AasValue, TypeConverter};
use opcua::types::{NodeId, Variant, VariantTypeId};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

pub struct ResolvedMapping {
    pub rule: MappingRule,
    pub node_id: NodeId,
    pub transform: Option<Expr>,
    pub inverse_affine: Option<(f64, f64)>,
}

pub type SubmodelStore = Arc<Mutex<HashMap<String, Submodel>>>;

pub struct MappingEngine {
    resolved: HashMap<String, ResolvedMapping>,
    submodels: SubmodelStore,
    type_converter: TypeConverter,
}

impl MappingEngine {
    pub fn new(rules: Vec<MappingRule>) -> Result<Self, BridgeError> {
        let mut resolved = HashMap::new();
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            let node_id = parse_node_id(&rule.opcua_node_id)?;
            let (transform, inverse_affine) = match &rule.transform_expression {
                Some(expression) => {
                    let expr = expr::parse(expression)
                        .map_err(|e| BridgeError::Mapping(e.to_string()))?;
                    let inverse = expr::recognize_affine(&expr);
                    (Some(expr), inverse)
                }
                None => (None, None),
            };

            let key = rule.opcua_node_id.clone();
            resolved.insert(
                key,
                ResolvedMapping {
                    rule,
                    node_id,
                    transform,
                    inverse_affine,
                },
            );
        }

        Ok(Self {
            resolved,
            submodels: Arc::new(Mutex::new(HashMap::new())),
            type_converter: TypeConverter::new(),
        })
    }

    pub fn submodels(&self) -> SubmodelStore {
        self.submodels.clone()
    }

    /// Ensures `submodel_id` exists in the shared store and that every
    /// enabled mapping targeting it has a corresponding `Property`.
    /// Idempotent: repeated registration of the same submodel is a no-op
    /// beyond the first call for each not-yet-seen `id_short`.
    pub async fn register_submodel(&self, submodel_id: &str) {
        let mut store = self.submodels.lock().await;
        let submodel = store
            .entry(submodel_id.to_string())
            .or_insert_with(|| Submodel::new(submodel_id));

        for mapping in self.resolved.values() {
            if mapping.rule.submodel_id != submodel_id {
                continue;
            }
            if submodel.find_element(&mapping.rule.aas_id_short).is_some() {
                continue;
            }
            let semantic_id = mapping.rule.semantic_id.as_ref().map(|iri| SemanticReference {
                global_reference: iri.clone(),
            });
            let mut property = Property::new(mapping.rule.aas_id_short.clone(), mapping.rule.value_type.clone());
            property.semantic_id = semantic_id;
            submodel.elements.push(property);
        }
    }

    pub fn get_mapping_for_node(&self, node_id: &str) -> Option<&ResolvedMapping> {
        self.resolved.get(node_id)
    }

    /// Resolves an AAS-side `(submodel_id, idShort)` pair back to the
    /// `ResolvedMapping` it targets. Without a submodel qualifier, `idShort`
    /// alone may be ambiguous across submodels; per Design Notes §9 Open
    /// Question (a), an ambiguous lookup warns and returns `None` rather than
    /// guessing or failing hard — the caller treats it as "no mapping".
    pub fn find_by_element(&self, submodel_id: Option<&str>, id_short: &str) -> Option<&ResolvedMapping> {
        let mut matches = self.resolved.values().filter(|m| {
            m.rule.aas_id_short == id_short
                && submodel_id.map(|s| s == m.rule.submodel_id).unwrap_or(true)
        });
        let first = matches.next()?;
        if submodel_id.is_none() && matches.next().is_some() {
            warn!(id_short, "ambiguous idShort with no submodel qualifier, refusing to resolve");
            return None;
        }
        Some(first)
    }

    pub fn resolved_mappings(&self) -> impl Iterator<Item = &ResolvedMapping> {
        self.resolved.values()
    }

    /// Infers a `VariantTypeId` from an `AasValue` when the caller (e.g. an
    /// HTTP write-request poller with no OPC UA source type) has none.
    pub fn infer_variant_type(value: &AasValue) -> VariantTypeId {
        match value {
            AasValue::Bool(_) => VariantTypeId::Boolean,
            AasValue::Integer(_) => VariantTypeId::Int64,
            AasValue::Float(_) => VariantTypeId::Double,
            AasValue::Bytes(_) => VariantTypeId::ByteString,
            AasValue::DateTime(_) => VariantTypeId::DateTime,
            AasValue::String(_) => VariantTypeId::String,
        }
    }

    pub fn transform_to_aas(
        &self,
        node_id: &str,
        variant: &Variant,
        variant_type: VariantTypeId,
    ) -> Result<(AasValue, String), BridgeError> {
        let mapping = self
            .get_mapping_for_node(node_id)
            .ok_or_else(|| BridgeError::Mapping(format!("no mapping for node: {node_id}")))?;

        let (mut value, xsd_type) =
            self.type_converter
                .to_aas(variant, variant_type, Some(&mapping.rule.value_type));

        if let Some(expr) = &mapping.transform {
            if let Some(raw) = value.as_f64() {
                if let Some(transformed) = expr::eval(expr, raw) {
                    value = AasValue::Float(transformed);
                }
            }
        }

        Ok((value, xsd_type))
    }

    pub fn transform_to_opcua(&self, node_id: &str, aas_value: &AasValue) -> Result<Variant, BridgeError> {
        let mapping = self
            .get_mapping_for_node(node_id)
            .ok_or_else(|| BridgeError::Mapping(format!("no mapping for node: {node_id}")))?;

        if mapping.rule.direction == SyncDirection::OpcuaToAas {
            return Err(BridgeError::Mapping(format!("node {node_id} is read-only")));
        }

        let mut value = aas_value.clone();
        if let Some((a, b)) = mapping.inverse_affine {
            if let Some(raw) = value.as_f64() {
                if a != 0.0 {
                    value = AasValue::Float((raw - b) / a);
                }
            }
        }

        if let Some(range) = &mapping.rule.range_constraint {
            validate_range(&value, &mapping.rule.aas_id_short, range)?;
        }

        self.type_converter.to_opcua(&value, &mapping.rule.value_type)
    }
}

fn validate_range(
    value: &AasValue,
    field: &str,
    range: &crate::config::RangeConstraint,
) -> Result<(), BridgeError> {
    let Some(numeric) = value.as_f64() else {
        return Err(BridgeError::Validation {
            field: field.to_string(),
            value: value.audit_repr(),
            constraint: "numeric value required".to_string(),
        });
    };

    if let Some(min) = range.min_value {
        if numeric < min {
            return Err(BridgeError::Validation {
                field: field.to_string(),
                value: value.audit_repr(),
                constraint: format!("must be >= {min}"),
            });
        }
    }
    if let Some(max) = range.max_value {
        if numeric > max {
            return Err(BridgeError::Validation {
                field: field.to_string(),
                value: value.audit_repr(),
                constraint: format!("must be <= {max}"),
            });
        }
    }
    Ok(())
}

/// Parses `ns=N;[sigb]=X` or the bare `i=N` shorthand (namespace 0).
pub fn parse_node_id(text: &str) -> Result<NodeId, BridgeError> {
    if let Some(rest) = text.strip_prefix("i=") {
        let identifier: u32 = rest
            .parse()
            .map_err(|_| BridgeError::Mapping(format!("invalid NodeId format: {text}")))?;
        return Ok(NodeId::new(0, identifier));
    }

    let rest = text
        .strip_prefix("ns=")
        .ok_or_else(|| BridgeError::Mapping(format!("invalid NodeId format: {text}")))?;
    let (ns_part, tail) = rest
        .split_once(';')
        .ok_or_else(|| BridgeError::Mapping(format!("invalid NodeId format: {text}")))?;
    let namespace: u16 = ns_part
        .parse()
        .map_err(|_| BridgeError::Mapping(format!("invalid NodeId format: {text}")))?;

    let mut chars = tail.chars();
    let kind = chars.next().ok_or_else(|| BridgeError::Mapping(format!("invalid NodeId format: {text}")))?;
    let rest = &tail[kind.len_utf8()..];
    let identifier = rest
        .strip_prefix('=')
        .ok_or_else(|| BridgeError::Mapping(format!("invalid NodeId format: {text}")))?;

    match kind.to_ascii_lowercase() {
        's' => Ok(NodeId::new(namespace, identifier.to_string())),
        'i' => {
            let n: u32 = identifier
                .parse()
                .map_err(|_| BridgeError::Mapping(format!("invalid NodeId format: {text}")))?;
            Ok(NodeId::new(namespace, n))
        }
        'g' => {
            let guid = opcua::types::Guid::from_str(identifier)
                .map_err(|_| BridgeError::Mapping(format!("invalid NodeId format: {text}")))?;
            Ok(NodeId::new(namespace, guid))
        }
        'b' => {
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(identifier)
                .map_err(|_| BridgeError::Mapping(format!("invalid NodeId format: {text}")))?;
            Ok(NodeId::new(namespace, opcua::types::ByteString::from(bytes)))
        }
        _ => {
            warn!(node_id = text, "unrecognized NodeId identifier kind, defaulting to string");
            Ok(NodeId::new(namespace, identifier.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(node_id: &str) -> MappingRule {
        MappingRule {
            opcua_node_id: node_id.to_string(),
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

    #[test]
    fn parses_string_node_id() {
        let node_id = parse_node_id("ns=2;s=Temperature").unwrap();
        assert_eq!(node_id, NodeId::new(2, "Temperature"));
    }

    #[test]
    fn parses_numeric_shorthand() {
        let node_id = parse_node_id("i=6099").unwrap();
        assert_eq!(node_id, NodeId::new(0, 6099u32));
    }

    #[test]
    fn rejects_malformed_node_id() {
        assert!(parse_node_id("not-a-node-id").is_err());
    }

    #[tokio::test]
    async fn register_submodel_is_idempotent() {
        let engine = MappingEngine::new(vec![rule("ns=2;s=Temperature")]).unwrap();
        engine.register_submodel("urn:test").await;
        engine.register_submodel("urn:test").await;
        let store = engine.submodels();
        let store = store.lock().await;
        let submodel = store.get("urn:test").unwrap();
        assert_eq!(submodel.elements.len(), 1);
    }

    #[test]
    fn direction_enforcement_rejects_aas_to_opcua_on_readonly_rule() {
        let mut r = rule("ns=2;s=Temperature");
        r.direction = SyncDirection::OpcuaToAas;
        let engine = MappingEngine::new(vec![r]).unwrap();
        let result = engine.transform_to_opcua("ns=2;s=Temperature", &AasValue::Float(1.0));
        assert!(result.is_err());
    }

    #[test]
    fn range_enforcement_rejects_out_of_bounds_value() {
        let mut r = rule("ns=2;s=Temperature");
        r.range_constraint = Some(crate::config::RangeConstraint {
            min_value: Some(0.0),
            max_value: Some(100.0),
            unit: None,
        });
        let engine = MappingEngine::new(vec![r]).unwrap();
        let result = engine.transform_to_opcua("ns=2;s=Temperature", &AasValue::Float(150.0));
        assert!(result.is_err());
        let ok = engine.transform_to_opcua("ns=2;s=Temperature", &AasValue::Float(55.0));
        assert!(ok.is_ok());
    }
}
