//! # OPC UA ⇄ AAS Synchronization Bridge
//!
//! Bidirectional bridge between an OPC UA server population (the
//! industrial "south-side" information model) and an Asset Administration
//! Shell repository (the "north-side" digital-twin model). For each
//! configured mapping rule, a value change on one side is reflected on the
//! other subject to direction, type, range, and deduplication rules.
//!
//! ## Pipelines
//!
//! ```text
//! OPC UA server --> Connection Pool --> subscription callback --> event queue
//!               --> Monitoring Manager --> Mapping Engine (to_aas) --> AAS Provider
//!
//! AAS change source (HTTP poll / MQTT) --> AAS Provider.write_requests
//!               --> Sync Orchestrator --> Control Manager queue
//!               --> Mapping Engine (to_opcua) --> Connection Pool --> OPC UA write
//! ```
//!
//! ## Out of scope
//!
//! The CLI driver and YAML config loader beyond `config::BridgeConfig`,
//! certificate generation, node discovery/bootstrap tooling, the embedded
//! OPC UA demo server used only in tests, and the OpenAPI validation
//! utility are external collaborators, not part of this crate.

pub mod aas;
pub mod config;
pub mod connection;
pub mod errors;
pub mod mapping;
pub mod metrics;
pub mod queue;
pub mod security;
pub mod sync;
pub mod types;
