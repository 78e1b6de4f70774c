pub mod control;
pub mod monitor;
pub mod orchestrator;

pub use control::ControlManager;
pub use monitor::MonitoringManager;
pub use orchestrator::SyncOrchestrator;
