use std::path::{Path, PathBuf};

/// Directory under the root that holds one store file per namespace.
pub const CURRENT_LAYOUT_DIR: &str = "messages";

/// Single global store used before per-namespace stores existed.
pub const LEGACY_STORE_FILE: &str = "inbox.db";

const STORE_EXTENSION: &str = "sqlite3";

/// What is on disk for one namespace before its store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutState {
    LegacyDetected,
    Absent,
    CurrentLayoutPresent,
}

/// Deterministic file naming for all stores under one root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Expects an already-normalized namespace.
    #[must_use]
    pub fn current_store_path(&self, namespace: &str) -> PathBuf {
        self.root.join(CURRENT_LAYOUT_DIR).join(format!("{namespace}.{STORE_EXTENSION}"))
    }

    #[must_use]
    pub fn legacy_store_path(&self) -> PathBuf {
        self.root.join(LEGACY_STORE_FILE)
    }

    #[must_use]
    pub fn detect(&self, namespace: &str) -> LayoutState {
        if self.current_store_path(namespace).is_file() {
            LayoutState::CurrentLayoutPresent
        } else if self.legacy_store_path().is_file() {
            LayoutState::LegacyDetected
        } else {
            LayoutState::Absent
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn store_paths_are_derived_from_namespace() {
        let layout = StoreLayout::new("/data");
        assert_eq!(layout.current_store_path("work"), PathBuf::from("/data/messages/work.sqlite3"));
        assert_eq!(layout.legacy_store_path(), PathBuf::from("/data/inbox.db"));
    }

    #[test]
    fn detect_prefers_current_layout_over_legacy() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = StoreLayout::new(dir.path());
        assert_eq!(layout.detect("a"), LayoutState::Absent);

        fs::write(layout.legacy_store_path(), b"")?;
        assert_eq!(layout.detect("a"), LayoutState::LegacyDetected);

        fs::create_dir_all(dir.path().join(CURRENT_LAYOUT_DIR))?;
        fs::write(layout.current_store_path("a"), b"")?;
        assert_eq!(layout.detect("a"), LayoutState::CurrentLayoutPresent);
        assert_eq!(layout.detect("b"), LayoutState::LegacyDetected);
        Ok(())
    }
}
