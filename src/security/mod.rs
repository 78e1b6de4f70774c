//! Security: OPC UA client certificate management and write audit logging.
//!
//! This is the narrower security surface the bridge actually needs (see
//! DESIGN.md for what the original multi-tenant ingestion service carried
//! here instead — IP whitelisting, field-level AES-GCM encryption, a
//! separate authenticator/validator pair — none of which this bridge's
//! scope calls for). What remains: certificate paths for the Connection
//! Pool's security policy, and the audit sink the Control Manager writes
//! through on every OPC UA write.

pub mod audit;
pub mod x509;

pub use audit::AuditLogger;
pub use x509::CertificateManager;
