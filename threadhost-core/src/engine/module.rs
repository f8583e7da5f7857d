//! Module sources
//!
//! The module binary is fetched once per process and compiled once; every
//! execution unit then instantiates the same compiled [`Module`]. Text format
//! (`.wat`) is accepted wherever binary is.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};
use wasmtime::{Engine, Module};

use crate::engine::bridge::{MAIN_ENTRY, WORKER_ENTRY};
use crate::error::HostError;

/// Where module bytes come from.
#[async_trait]
pub trait ModuleSource: Send + Sync {
    /// Fetch the raw module bytes.
    async fn fetch(&self) -> Result<Vec<u8>>;

    /// Human-readable origin for logs.
    fn describe(&self) -> String;
}

/// A module file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ModuleSource for FileSource {
    async fn fetch(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read module {}", self.path.display()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// A module already held in memory.
#[derive(Debug, Clone)]
pub struct BytesSource {
    name: String,
    bytes: Vec<u8>,
}

impl BytesSource {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

#[async_trait]
impl ModuleSource for BytesSource {
    async fn fetch(&self) -> Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Fetch and compile a module.
///
/// Missing entry points are reported here rather than per unit, but are
/// still re-checked at instantiation time.
pub async fn load(engine: &Engine, source: &dyn ModuleSource) -> Result<Module, HostError> {
    let origin = source.describe();
    info!(module = %origin, "Loading module");

    let bytes = source
        .fetch()
        .await
        .map_err(|e| HostError::ModuleLoad(format!("{e:#}")))?;

    let engine = engine.clone();
    let module = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
        .await
        .map_err(|e| HostError::ModuleLoad(format!("compile task failed: {e}")))?
        .map_err(|e| HostError::ModuleLoad(format!("{origin}: {e:#}")))?;

    for entry in [MAIN_ENTRY, WORKER_ENTRY] {
        if module.get_export(entry).is_none() {
            return Err(HostError::MissingExport(entry));
        }
    }

    debug!(
        imports = module.imports().len(),
        exports = module.exports().len(),
        "Module compiled"
    );
    Ok(module)
}
