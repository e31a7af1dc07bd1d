//! Dataset lookup and registration.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::info;

use super::Dataset;
use crate::{AppError, Result};

/// Lookup of named file collections.
pub trait DatasetCatalog: Send + Sync {
    /// Resolve a dataset by name.
    fn lookup(&self, name: &str) -> Option<Dataset>;

    /// Register or replace a dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be updated.
    fn register(&self, dataset: Dataset) -> Result<()>;

    /// Known dataset names, sorted.
    fn names(&self) -> Vec<String>;
}

/// In-memory catalog seeded from configuration.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    datasets: RwLock<BTreeMap<String, Vec<PathBuf>>>,
}

impl StaticCatalog {
    /// Build a catalog from the `[datasets]` configuration table.
    #[must_use]
    pub fn from_config(datasets: &HashMap<String, Vec<PathBuf>>) -> Self {
        Self {
            datasets: RwLock::new(
                datasets
                    .iter()
                    .map(|(name, files)| (name.clone(), files.clone()))
                    .collect(),
            ),
        }
    }
}

impl DatasetCatalog for StaticCatalog {
    fn lookup(&self, name: &str) -> Option<Dataset> {
        let datasets = self.datasets.read().ok()?;
        datasets.get(name).map(|files| Dataset {
            name: name.to_owned(),
            files: files.clone(),
        })
    }

    fn register(&self, dataset: Dataset) -> Result<()> {
        let mut datasets = self
            .datasets
            .write()
            .map_err(|_| AppError::Io("dataset catalog lock poisoned".into()))?;
        info!(name = %dataset.name, files = dataset.files.len(), "dataset registered");
        datasets.insert(dataset.name, dataset.files);
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        self.datasets
            .read()
            .map(|datasets| datasets.keys().cloned().collect())
            .unwrap_or_default()
    }
}
