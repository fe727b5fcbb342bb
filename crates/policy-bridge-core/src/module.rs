//! Policy artifact loading and compilation.
//!
//! This module provides [`CompiledArtifact`], a wrapper around Wasmtime's
//! [`Module`] holding the compiled policy. The artifact is loaded once per
//! engine lifetime and shared read-only by every pool slot.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, FuncType, MemoryType, Module};

use policy_bridge_common::LoadError;

/// WebAssembly binary format version this loader accepts.
const WASM_BINARY_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// A compiled policy module.
///
/// # Thread Safety
///
/// `CompiledArtifact` is immutable after load and can be shared across threads.
#[derive(Clone)]
pub struct CompiledArtifact {
    /// The compiled Wasmtime module.
    module: Module,

    /// Hash of the original Wasm bytes.
    content_hash: String,

    /// Where the artifact was loaded from, if from disk.
    source: Option<PathBuf>,
}

/// A function the module imports from its host.
#[derive(Debug, Clone)]
pub struct FunctionImport {
    /// Import module name (normally `env`).
    pub module: String,
    /// Import field name.
    pub name: String,
    /// Declared signature.
    pub ty: FuncType,
}

impl CompiledArtifact {
    /// Load and compile the artifact at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable, not WebAssembly,
    /// or fails to compile. No partial result is produced.
    ///
    /// A `.wat` file is compiled from text.
    #[instrument(skip(engine, path), fields(path = %path.as_ref().display()))]
    pub fn load(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();

        if !path.is_file() {
            return Err(LoadError::NotFound {
                path: path.display().to_string(),
            });
        }

        let bytes = std::fs::read(path).map_err(|e| LoadError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut artifact = if path.extension().is_some_and(|ext| ext == "wat") {
            let text = String::from_utf8(bytes)
                .map_err(|_| LoadError::invalid_header("WAT source is not valid UTF-8"))?;
            Self::from_wat(engine, &text)?
        } else {
            Self::from_bytes(engine, &bytes)?
        };
        artifact.source = Some(path.to_path_buf());
        Ok(artifact)
    }

    /// Compile an artifact from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid or compilation fails.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, LoadError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::from_binary(engine, bytes).map_err(|e| {
            LoadError::compilation_failed(format!("Policy module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            exports = module.exports().len(),
            "Policy module compiled"
        );

        Ok(Self {
            module,
            content_hash,
            source: None,
        })
    }

    /// Compile an artifact from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, LoadError> {
        let module = Module::new(engine, wat)
            .map_err(|e| LoadError::compilation_failed(format!("WAT compilation failed: {e}")))?;

        Ok(Self {
            module,
            content_hash: compute_hash(wat.as_bytes()),
            source: None,
        })
    }

    /// Get the inner Wasmtime module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Get the content hash of the original bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Path the artifact was loaded from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Names of all exports, in declaration order.
    pub fn export_names(&self) -> Vec<String> {
        self.module
            .exports()
            .map(|export| export.name().to_string())
            .collect()
    }

    /// Returns `true` if the module exports or imports a linear memory.
    pub fn has_memory(&self) -> bool {
        self.module
            .exports()
            .any(|export| matches!(export.ty(), ExternType::Memory(_)))
            || self.imported_memory().is_some()
    }

    /// All function imports with their declared signatures.
    pub fn function_imports(&self) -> Vec<FunctionImport> {
        self.module
            .imports()
            .filter_map(|import| match import.ty() {
                ExternType::Func(ty) => Some(FunctionImport {
                    module: import.module().to_string(),
                    name: import.name().to_string(),
                    ty,
                }),
                _ => None,
            })
            .collect()
    }

    /// The memory import, if the module expects its host to provide one.
    pub fn imported_memory(&self) -> Option<(String, String, MemoryType)> {
        self.module.imports().find_map(|import| match import.ty() {
            ExternType::Memory(ty) => Some((
                import.module().to_string(),
                import.name().to_string(),
                ty,
            )),
            _ => None,
        })
    }

    /// Imports that are neither functions nor memories.
    pub fn unsupported_imports(&self) -> Vec<String> {
        self.module
            .imports()
            .filter(|import| !matches!(import.ty(), ExternType::Func(_) | ExternType::Memory(_)))
            .map(|import| format!("{}::{}", import.module(), import.name()))
            .collect()
    }

    /// Validate the WebAssembly magic number and binary version.
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), LoadError> {
        if bytes.len() < 8 {
            return Err(LoadError::invalid_header("file too small"));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(LoadError::invalid_header("bad magic number"));
        }

        if bytes[4..8] != WASM_BINARY_VERSION {
            return Err(LoadError::invalid_header(format!(
                "unsupported binary version {:?}",
                &bytes[4..8]
            )));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("content_hash", &self.content_hash)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use policy_bridge_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig::default(), 1).unwrap()
    }

    #[test]
    fn test_validate_wasm_header_valid() {
        assert!(CompiledArtifact::validate_wasm_header(MINIMAL_WASM).is_ok());
    }

    #[test]
    fn test_validate_wasm_header_too_small() {
        let result = CompiledArtifact::validate_wasm_header(&[0x00, 0x61]);
        assert!(matches!(result, Err(LoadError::InvalidHeader { .. })));
    }

    #[test]
    fn test_validate_wasm_header_bad_magic() {
        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        assert!(CompiledArtifact::validate_wasm_header(bad_wasm).is_err());
    }

    #[test]
    fn test_validate_wasm_header_bad_version() {
        let component = &[0x00, 0x61, 0x73, 0x6d, 0x0d, 0x00, 0x01, 0x00];
        let err = CompiledArtifact::validate_wasm_header(component).unwrap_err();
        assert!(err.to_string().contains("binary version"));
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_from_bytes() {
        let artifact = CompiledArtifact::from_bytes(engine().inner(), MINIMAL_WASM).unwrap();

        assert!(artifact.export_names().is_empty());
        assert!(!artifact.has_memory());
        assert!(artifact.source().is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = CompiledArtifact::load(engine().inner(), "/nonexistent/policy.wasm");
        assert!(matches!(result, Err(LoadError::NotFound { .. })));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.wasm");
        std::fs::write(&path, MINIMAL_WASM).unwrap();

        let artifact = CompiledArtifact::load(engine().inner(), &path).unwrap();
        assert_eq!(artifact.source(), Some(path.as_path()));
    }

    #[test]
    fn test_load_wat_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.wat");
        std::fs::write(&path, r#"(module (memory (export "memory") 1))"#).unwrap();

        let artifact = CompiledArtifact::load(engine().inner(), &path).unwrap();
        assert!(artifact.has_memory());
    }

    #[test]
    fn test_load_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.wasm");
        std::fs::write(&path, b"not a wasm module at all").unwrap();

        let result = CompiledArtifact::load(engine().inner(), &path);
        assert!(matches!(result, Err(LoadError::InvalidHeader { .. })));
    }

    #[test]
    fn test_import_inspection() {
        let wat = r#"
            (module
                (import "env" "memory" (memory 1))
                (import "env" "opa_abort" (func (param i32)))
                (import "env" "opa_builtin2" (func (param i32 i32 i32 i32) (result i32)))
                (func (export "eval") (param i32) (result i32) (i32.const 0))
            )
        "#;
        let artifact = CompiledArtifact::from_wat(engine().inner(), wat).unwrap();

        let imports = artifact.function_imports();
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].name, "opa_abort");
        assert_eq!(imports[1].ty.params().len(), 4);

        let (module, name, _) = artifact.imported_memory().unwrap();
        assert_eq!((module.as_str(), name.as_str()), ("env", "memory"));
        assert!(artifact.has_memory());
        assert!(artifact.unsupported_imports().is_empty());
        assert_eq!(artifact.export_names(), vec!["eval"]);
    }

    #[test]
    fn test_unsupported_imports() {
        let wat = r#"(module (import "env" "table" (table 1 funcref)))"#;
        let artifact = CompiledArtifact::from_wat(engine().inner(), wat).unwrap();

        assert_eq!(artifact.unsupported_imports(), vec!["env::table"]);
    }
}
