pub mod pool;

pub use pool::{ConnectionHandle, OpcUaConnectionPool};
