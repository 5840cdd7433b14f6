//! Ties the ingestion and cleanse pipelines to the distributed lock, so at
//! most one import and one cleanse analysis run at a time across the fleet
//! of process instances — §4.12, §5.

pub mod cleanse_orchestrator;
pub mod import_orchestrator;

pub use cleanse_orchestrator::CleanseOrchestrator;
pub use import_orchestrator::ImportOrchestrator;

pub const IMPORT_LOCK: &str = "import";
pub const CLEANSE_LOCK: &str = "cleanse-analysis";
