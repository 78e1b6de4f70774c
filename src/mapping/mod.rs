pub mod engine;
pub mod expr;

pub use engine::{MappingEngine, ResolvedMapping, SubmodelStore};
