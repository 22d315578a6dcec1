use std::path::PathBuf;

use crate::device::Device;

/// Failures raised while constructing, tracing, checking or writing an exportable module.
///
/// Library functions return `anyhow::Result`; callers that need to branch on the failure
/// kind recover it with `err.downcast_ref::<ExportError>()`.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Parameter '{name}' is placed on {actual}, expected {expected}")]
    DeviceMismatch { name: String, expected: Device, actual: Device },

    #[error("Tracing failed at node '{node}': {reason}")]
    Trace { node: String, reason: String },

    #[error("Graph check failed: {0}")]
    Check(String),

    #[error("Output directory does not exist: {}", .0.display())]
    MissingOutputDir(PathBuf),

    #[error("Unsupported precision for export: {0} bits (only 32-bit float graphs are exported)")]
    UnsupportedPrecision(u32),
}

impl ExportError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub(crate) fn check(message: impl Into<String>) -> Self {
        Self::Check(message.into())
    }
}
