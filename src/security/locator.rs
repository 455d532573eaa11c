use std::path::{Path, PathBuf};

use crate::config::EncryptionConfig;

/// Finds keystore material by name.
pub trait ResourceLocator: Send + Sync {
    fn locate(&self, name: &str) -> Option<PathBuf>;
}

/// Resolves absolute names directly and relative names against an ordered
/// list of directories, then against the working directory.
#[derive(Debug, Clone, Default)]
pub struct SearchPathLocator {
    search_paths: Vec<PathBuf>,
}

impl SearchPathLocator {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(cfg: &EncryptionConfig) -> Self {
        Self::new(cfg.search_paths.clone().unwrap_or_default())
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

impl ResourceLocator for SearchPathLocator {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        if name.trim().is_empty() {
            return None;
        }
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            return candidate.exists().then(|| candidate.to_path_buf());
        }
        self.search_paths
            .iter()
            .map(|base| base.join(candidate))
            .find(|p| p.exists())
            .or_else(|| candidate.exists().then(|| candidate.to_path_buf()))
    }
}
