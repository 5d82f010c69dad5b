//! Item and block name catalog.
//!
//! Loaded explicitly from a data directory holding `items.txt` and
//! `blocks.txt`, one name per line. The order is not meaningful but is stable,
//! so inventory spaces built from it are consistent across runs.

use std::path::{Path, PathBuf};

use crate::observation::ObservationKind;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("could not find item and block data: {path} is missing")]
    MissingData { path: PathBuf },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemCatalog {
    items: Vec<String>,
    blocks: Vec<String>,
}

impl ItemCatalog {
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let dir = dir.as_ref();
        let items = read_names(&dir.join("items.txt"))?;
        let blocks = read_names(&dir.join("blocks.txt"))?;
        tracing::debug!(
            dir = %dir.display(),
            items = items.len(),
            blocks = blocks.len(),
            "Loaded item catalog"
        );
        Ok(Self { items, blocks })
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn blocks(&self) -> &[String] {
        &self.blocks
    }

    pub fn contains_item(&self, name: &str) -> bool {
        self.items.iter().any(|i| i == name)
    }

    /// Counts kind over every catalog item.
    pub fn inventory_kind(&self, max: i64) -> ObservationKind {
        ObservationKind::Counts {
            items: self.items.clone(),
            max,
        }
    }
}

fn read_names(path: &Path) -> Result<Vec<String>, CatalogError> {
    if !path.is_file() {
        return Err(CatalogError::MissingData {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
