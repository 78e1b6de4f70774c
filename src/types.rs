//! Type Converter: translation between OPC UA `Variant` values and the
//! XSD-typed values an AAS `Property` carries.

use crate::errors::BridgeError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use opcua::types::{Variant, VariantTypeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A value on the AAS side of the bridge, tagged by the XSD datatype it was
/// produced for. Kept distinct from `serde_json::Value` so numeric width
/// (byte vs. short vs. int vs. long) survives a round trip through both
/// conversion directions instead of collapsing to an untyped JSON number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AasValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
}

impl AasValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AasValue::Integer(v) => Some(*v as f64),
            AasValue::Float(v) => Some(*v),
            AasValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Rendering used by the audit log and the dedup cache hash; bytes are
    /// never dumped raw into a structured log line.
    pub fn audit_repr(&self) -> String {
        match self {
            AasValue::Bool(v) => v.to_string(),
            AasValue::Integer(v) => v.to_string(),
            AasValue::Float(v) => v.to_string(),
            AasValue::String(v) => v.clone(),
            AasValue::Bytes(v) => format!("<bytes:{}>", v.len()),
            AasValue::DateTime(v) => v.to_rfc3339(),
        }
    }
}

/// `xs:*` datatype name to OPC UA `VariantTypeId`, and back. `xs:string` is
/// the default target for OPC UA types that have no closer XSD analogue
/// (Guid, NodeId, LocalizedText).
pub fn xsd_for_variant(variant_type: VariantTypeId) -> &'static str {
    match variant_type {
        VariantTypeId::Boolean => "xs:boolean",
        VariantTypeId::SByte => "xs:byte",
        VariantTypeId::Byte => "xs:unsignedByte",
        VariantTypeId::Int16 => "xs:short",
        VariantTypeId::UInt16 => "xs:unsignedShort",
        VariantTypeId::Int32 => "xs:int",
        VariantTypeId::UInt32 => "xs:unsignedInt",
        VariantTypeId::Int64 => "xs:long",
        VariantTypeId::UInt64 => "xs:unsignedLong",
        VariantTypeId::Float => "xs:float",
        VariantTypeId::Double => "xs:double",
        VariantTypeId::DateTime => "xs:dateTime",
        VariantTypeId::ByteString => "xs:base64Binary",
        VariantTypeId::String
        | VariantTypeId::Guid
        | VariantTypeId::NodeId
        | VariantTypeId::LocalizedText
        | _ => "xs:string",
    }
}

fn variant_for_xsd(xsd_type: &str) -> Option<VariantTypeId> {
    Some(match xsd_type {
        "xs:boolean" => VariantTypeId::Boolean,
        "xs:byte" => VariantTypeId::SByte,
        "xs:unsignedByte" => VariantTypeId::Byte,
        "xs:short" => VariantTypeId::Int16,
        "xs:unsignedShort" => VariantTypeId::UInt16,
        "xs:int" => VariantTypeId::Int32,
        "xs:unsignedInt" => VariantTypeId::UInt32,
        "xs:long" => VariantTypeId::Int64,
        "xs:unsignedLong" => VariantTypeId::UInt64,
        "xs:float" => VariantTypeId::Float,
        "xs:double" => VariantTypeId::Double,
        "xs:string" => VariantTypeId::String,
        "xs:dateTime" => VariantTypeId::DateTime,
        "xs:base64Binary" => VariantTypeId::ByteString,
        _ => return None,
    })
}

/// Converts a raw OPC UA `Variant` into the crate's AAS value domain.
pub(crate) fn opcua_to_aas_value(variant: &Variant) -> AasValue {
    match variant {
        Variant::Boolean(v) => AasValue::Bool(*v),
        Variant::SByte(v) => AasValue::Integer(*v as i64),
        Variant::Byte(v) => AasValue::Integer(*v as i64),
        Variant::Int16(v) => AasValue::Integer(*v as i64),
        Variant::UInt16(v) => AasValue::Integer(*v as i64),
        Variant::Int32(v) => AasValue::Integer(*v as i64),
        Variant::UInt32(v) => AasValue::Integer(*v as i64),
        Variant::Int64(v) => AasValue::Integer(*v),
        Variant::UInt64(v) => AasValue::Integer(*v as i64),
        Variant::Float(v) => AasValue::Float(*v as f64),
        Variant::Double(v) => AasValue::Float(*v),
        Variant::DateTime(v) => AasValue::DateTime(v.as_chrono()),
        Variant::ByteString(v) => AasValue::Bytes(v.value.clone().unwrap_or_default()),
        Variant::String(v) => AasValue::String(v.to_string()),
        Variant::LocalizedText(v) => AasValue::String(v.text.to_string()),
        Variant::Guid(v) => AasValue::String(v.to_string()),
        Variant::NodeId(v) => AasValue::String(v.to_string()),
        other => AasValue::String(format!("{other:?}")),
    }
}

/// Per-provider overrides for how an `xs:*` type is coerced on the way to
/// AAS, mirroring the original's `register_converter` escape hatch.
pub type AasCoercer = fn(AasValue) -> AasValue;

#[derive(Default)]
pub struct TypeConverter {
    custom_coercers: HashMap<&'static str, AasCoercer>,
}

impl TypeConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_coercer(&mut self, xsd_type: &'static str, coercer: AasCoercer) {
        self.custom_coercers.insert(xsd_type, coercer);
    }

    /// OPC UA value → AAS value, tagged with the XSD type it was converted
    /// for. `target_xsd_type` lets a mapping rule pin a specific XSD type
    /// (e.g. widen a `Byte` reading to `xs:int`) instead of the default.
    pub fn to_aas(
        &self,
        variant: &Variant,
        variant_type: VariantTypeId,
        target_xsd_type: Option<&str>,
    ) -> (AasValue, String) {
        let xsd_type = target_xsd_type
            .map(str::to_string)
            .unwrap_or_else(|| xsd_for_variant(variant_type).to_string());
        let mut value = opcua_to_aas_value(variant);
        if let Some(coercer) = self.custom_coercers.get(xsd_type.as_str()) {
            value = coercer(value);
        }
        (value, xsd_type)
    }

    /// AAS value → OPC UA `Variant`, per the rule's declared XSD type.
    pub fn to_opcua(&self, value: &AasValue, xsd_type: &str) -> Result<Variant, BridgeError> {
        let variant_type = variant_for_xsd(xsd_type).ok_or_else(|| BridgeError::TypeConversion {
            source_type: "aas".to_string(),
            target_type: xsd_type.to_string(),
            value: value.audit_repr(),
        })?;
        convert_to_opcua(value, xsd_type, variant_type)
    }
}

fn convert_to_opcua(
    value: &AasValue,
    xsd_type: &str,
    variant_type: VariantTypeId,
) -> Result<Variant, BridgeError> {
    let fail = || BridgeError::TypeConversion {
        source_type: "aas".to_string(),
        target_type: xsd_type.to_string(),
        value: value.audit_repr(),
    };

    match variant_type {
        VariantTypeId::Boolean => Ok(Variant::Boolean(coerce_bool(value).ok_or_else(fail)?)),
        VariantTypeId::SByte => Ok(Variant::SByte(coerce_i64(value).ok_or_else(fail)? as i8)),
        VariantTypeId::Byte => Ok(Variant::Byte(coerce_i64(value).ok_or_else(fail)? as u8)),
        VariantTypeId::Int16 => Ok(Variant::Int16(coerce_i64(value).ok_or_else(fail)? as i16)),
        VariantTypeId::UInt16 => Ok(Variant::UInt16(coerce_i64(value).ok_or_else(fail)? as u16)),
        VariantTypeId::Int32 => Ok(Variant::Int32(coerce_i64(value).ok_or_else(fail)? as i32)),
        VariantTypeId::UInt32 => Ok(Variant::UInt32(coerce_i64(value).ok_or_else(fail)? as u32)),
        VariantTypeId::Int64 => Ok(Variant::Int64(coerce_i64(value).ok_or_else(fail)?)),
        VariantTypeId::UInt64 => Ok(Variant::UInt64(coerce_i64(value).ok_or_else(fail)? as u64)),
        VariantTypeId::Float => Ok(Variant::Float(coerce_f64(value).ok_or_else(fail)? as f32)),
        VariantTypeId::Double => Ok(Variant::Double(coerce_f64(value).ok_or_else(fail)?)),
        VariantTypeId::String => Ok(Variant::from(coerce_string(value))),
        VariantTypeId::DateTime => {
            let dt = coerce_datetime(value).ok_or_else(fail)?;
            Ok(Variant::from(opcua::types::DateTime::from(dt)))
        }
        VariantTypeId::ByteString => {
            let bytes = coerce_bytes(value).ok_or_else(fail)?;
            Ok(Variant::ByteString(opcua::types::ByteString::from(bytes)))
        }
        _ => Err(fail()),
    }
}

fn coerce_bool(value: &AasValue) -> Option<bool> {
    match value {
        AasValue::Bool(v) => Some(*v),
        AasValue::Integer(v) => Some(*v != 0),
        AasValue::Float(v) => Some(*v != 0.0),
        AasValue::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_i64(value: &AasValue) -> Option<i64> {
    match value {
        AasValue::Integer(v) => Some(*v),
        AasValue::Float(v) => Some(*v as i64),
        AasValue::Bool(v) => Some(if *v { 1 } else { 0 }),
        AasValue::String(s) => s.parse().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }
}

fn coerce_f64(value: &AasValue) -> Option<f64> {
    match value {
        AasValue::Float(v) => Some(*v),
        AasValue::Integer(v) => Some(*v as f64),
        AasValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
        AasValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn coerce_string(value: &AasValue) -> String {
    value.audit_repr()
}

fn coerce_datetime(value: &AasValue) -> Option<DateTime<Utc>> {
    match value {
        AasValue::DateTime(dt) => Some(*dt),
        AasValue::String(s) => {
            let normalized = s.replace('Z', "+00:00");
            DateTime::parse_from_rfc3339(&normalized)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }
        _ => None,
    }
}

fn coerce_bytes(value: &AasValue) -> Option<Vec<u8>> {
    match value {
        AasValue::Bytes(b) => Some(b.clone()),
        AasValue::String(s) => BASE64.decode(s).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcua_to_xsd_table_covers_numeric_widths() {
        assert_eq!(xsd_for_variant(VariantTypeId::Byte), "xs:unsignedByte");
        assert_eq!(xsd_for_variant(VariantTypeId::Int64), "xs:long");
        assert_eq!(xsd_for_variant(VariantTypeId::Double), "xs:double");
        assert_eq!(xsd_for_variant(VariantTypeId::Guid), "xs:string");
    }

    #[test]
    fn round_trip_double() {
        let conv = TypeConverter::new();
        let (aas_value, xsd) = conv.to_aas(&Variant::Double(42.5), VariantTypeId::Double, None);
        assert_eq!(xsd, "xs:double");
        let variant = conv.to_opcua(&aas_value, &xsd).unwrap();
        match variant {
            Variant::Double(v) => assert_eq!(v, 42.5),
            _ => panic!("expected Double variant"),
        }
    }

    #[test]
    fn round_trip_boolean_from_string() {
        let conv = TypeConverter::new();
        let variant = conv
            .to_opcua(&AasValue::String("yes".to_string()), "xs:boolean")
            .unwrap();
        assert!(matches!(variant, Variant::Boolean(true)));
    }

    #[test]
    fn unsupported_xsd_type_fails() {
        let conv = TypeConverter::new();
        let result = conv.to_opcua(&AasValue::Integer(1), "xs:unknown");
        assert!(result.is_err());
    }

    #[test]
    fn datetime_defaults_to_utc_when_naive() {
        let conv = TypeConverter::new();
        let variant = conv
            .to_opcua(
                &AasValue::String("2024-01-01T00:00:00+00:00".to_string()),
                "xs:dateTime",
            )
            .unwrap();
        assert!(matches!(variant, Variant::DateTime(_)));
    }
}
