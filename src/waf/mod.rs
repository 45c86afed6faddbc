pub mod audit;
pub mod config;
pub mod engine;
pub mod plugin;
pub mod signature;

pub use audit::{AuditOutput, AuditRecord, ScanResult};
pub use config::{ConfigStore, WafMode, WafPolicy};
pub use engine::ScanEngine;
pub use plugin::{RequestDescriptor, RequestPayload, ScanPlugin, ScanVerdict};
pub use signature::SignaturePlugin;
