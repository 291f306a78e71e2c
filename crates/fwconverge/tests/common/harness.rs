//! Test harness around an in-memory management server.

#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::TempDir;

use fwconverge::store::StoreCall;
use fwconverge::{
    Converger, ElementDescriptor, EngineSpec, MemoryStore, Outcome, PassOptions, Registry,
};

pub struct Harness {
    pub store: MemoryStore,
    pub registry: Registry,
    temp_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            registry: Registry::builtin(),
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Path of the document directory.
    pub fn documents(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    /// Writes a document below the document directory.
    pub fn write_document(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create document dir");
        }
        std::fs::write(&path, content).expect("Failed to write document");
        path
    }

    pub async fn converge(&self, elements: Vec<ElementDescriptor>) -> fwconverge::Result<Outcome> {
        self.converge_with(elements, PassOptions::default()).await
    }

    pub async fn converge_with(
        &self,
        elements: Vec<ElementDescriptor>,
        options: PassOptions,
    ) -> fwconverge::Result<Outcome> {
        Converger::new(&self.store, &self.registry)
            .with_options(options)
            .converge(elements)
            .await
    }

    pub async fn converge_engine(&self, spec: &EngineSpec) -> fwconverge::Result<Outcome> {
        Converger::new(&self.store, &self.registry)
            .converge_engine(spec)
            .await
    }

    /// Names created so far, in call order.
    pub fn created(&self) -> Vec<String> {
        self.store
            .mutations()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::Create { name, .. } | StoreCall::CreateChild { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }
}
