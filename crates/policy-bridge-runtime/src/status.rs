//! Engine status and module diagnostics.

use std::fmt;

use serde::Serialize;

use policy_bridge_core::{AbiVersion, Capabilities, CompiledArtifact};

/// Lifecycle state reported to health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// `initialize` has not run.
    Uninitialized,
    /// Policy module loaded and pool built.
    Ready,
    /// Load failed; decisions come from the fallback rule only.
    Degraded,
    /// Pool is being torn down.
    ShuttingDown,
    /// Shut down; evaluations are rejected.
    Stopped,
}

impl EngineStatus {
    /// Returns `true` for `Ready` and `Degraded`.
    pub fn is_initialized(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What the loaded module exports and which protocols it supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleDescription {
    pub export_names: Vec<String>,
    pub has_memory: bool,
    pub supports_context_api: bool,
    pub supports_simple_api: bool,
    pub has_allocator: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abi_version: Option<AbiVersion>,
    pub content_hash: String,
    pub capabilities: Capabilities,
}

impl ModuleDescription {
    /// Describe `artifact` as instantiated with `capabilities`.
    pub fn new(
        artifact: &CompiledArtifact,
        capabilities: Capabilities,
        abi_version: Option<AbiVersion>,
    ) -> Self {
        Self {
            export_names: artifact.export_names(),
            has_memory: artifact.has_memory(),
            supports_context_api: capabilities.supports_context_api,
            supports_simple_api: capabilities.supports_simple_api,
            has_allocator: capabilities.has_allocator,
            abi_version,
            content_hash: artifact.content_hash().to_string(),
            capabilities,
        }
    }

    /// Group the export names for diagnostics.
    pub fn categorize(&self) -> ExportCategories {
        ExportCategories::from_names(&self.export_names)
    }
}

/// Export names grouped by purpose. A name may appear in several groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportCategories {
    pub total: usize,
    /// Names starting with `opa_`.
    pub opa: Vec<String>,
    /// Names containing `eval`, case-insensitive.
    pub eval: Vec<String>,
    /// Allocator entry points.
    pub memory: Vec<String>,
}

impl ExportCategories {
    pub fn from_names(names: &[String]) -> Self {
        let pick = |keep: fn(&str) -> bool| {
            names
                .iter()
                .filter(|name| keep(name))
                .cloned()
                .collect::<Vec<_>>()
        };

        Self {
            total: names.len(),
            opa: pick(|name| name.starts_with("opa_")),
            eval: pick(|name| name.to_ascii_lowercase().contains("eval")),
            memory: pick(|name| name.contains("malloc") || name.contains("free")),
        }
    }
}
