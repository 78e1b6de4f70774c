//! The reduced AAS element model this bridge operates on: submodels holding
//! properties. Per Design Notes §9, broader AAS element kinds are out of
//! scope; if they are added later, `SubmodelElement` becomes a proper sum
//! type with its own `get_value`/`set_value` capability.

use crate::types::AasValue;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticReference {
    pub global_reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id_short: String,
    pub value_type: String,
    pub value: Option<AasValue>,
    pub semantic_id: Option<SemanticReference>,
}

impl Property {
    pub fn new(id_short: impl Into<String>, value_type: impl Into<String>) -> Self {
        Self {
            id_short: id_short.into(),
            value_type: value_type.into(),
            value: None,
            semantic_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submodel {
    pub id: String,
    pub elements: Vec<Property>,
}

impl Submodel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            elements: Vec::new(),
        }
    }

    pub fn find_element(&self, id_short: &str) -> Option<&Property> {
        self.elements.iter().find(|e| e.id_short == id_short)
    }

    pub fn find_element_mut(&mut self, id_short: &str) -> Option<&mut Property> {
        self.elements.iter_mut().find(|e| e.id_short == id_short)
    }
}
