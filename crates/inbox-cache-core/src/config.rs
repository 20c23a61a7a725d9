use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::Duration;

use crate::error::ConfigError;
use crate::reconcile::{ReconcilePolicy, DEFAULT_ORPHAN_GRACE};

const MAX_NAMESPACE_LEN: usize = 64;
const NAMESPACE_DIGEST_LEN: usize = 16;

fn default_orphan_grace_secs() -> u64 {
    u64::try_from(DEFAULT_ORPHAN_GRACE.whole_seconds()).unwrap_or(86_400)
}

fn default_reader_pool_size() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Settings for one cache instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory holding both the current per-namespace stores and the legacy store.
    pub root_dir: PathBuf,
    /// Logical inbox (e.g. one per account); normalized before use.
    pub namespace: String,
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
    #[serde(default = "default_reader_pool_size")]
    pub reader_pool_size: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl CacheConfig {
    #[must_use]
    pub fn new(root_dir: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            root_dir: root_dir.into(),
            namespace: namespace.into(),
            orphan_grace_secs: default_orphan_grace_secs(),
            reader_pool_size: default_reader_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    /// Parse and validate a YAML document.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed YAML and [`ConfigError::Invalid`]
    /// when a value is out of range.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    ///
    /// # Errors
    /// Returns [`ConfigError::Io`] when the file cannot be read, otherwise the errors
    /// of [`CacheConfig::from_yaml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_yaml_str(&raw)
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] when the namespace is blank or a numeric
    /// setting is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        normalize_namespace(&self.namespace)?;
        if self.reader_pool_size == 0 {
            return Err(ConfigError::Invalid("reader_pool_size MUST be >= 1".to_string()));
        }
        if i64::try_from(self.orphan_grace_secs).is_err() {
            return Err(ConfigError::Invalid("orphan_grace_secs is too large".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        let seconds = i64::try_from(self.orphan_grace_secs).unwrap_or(i64::MAX);
        ReconcilePolicy { orphan_grace: Duration::seconds(seconds) }
    }

    #[must_use]
    pub fn busy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Store file name for a namespace.
///
/// Names that are already lowercase ASCII alphanumerics joined by single hyphens
/// (at most 64 characters) are used as-is. Anything else keeps a readable slug and
/// gains a `--<digest>` suffix of the raw name. Canonical names never contain `--`,
/// so distinct inputs never share a store.
///
/// # Errors
/// Returns [`ConfigError::Invalid`] when the namespace is blank.
pub fn normalize_namespace(raw: &str) -> Result<String, ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::Invalid("namespace MUST NOT be blank".to_string()));
    }

    let slug = slugify(raw);
    if slug == raw && slug.len() <= MAX_NAMESPACE_LEN {
        return Ok(slug);
    }

    let mut readable = slug;
    readable.truncate(MAX_NAMESPACE_LEN - NAMESPACE_DIGEST_LEN - 2);
    while readable.ends_with('-') {
        readable.pop();
    }
    if readable.is_empty() {
        readable.push_str("ns");
    }

    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    Ok(format!("{readable}--{}", &digest[..NAMESPACE_DIGEST_LEN]))
}

fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut pending_hyphen = false;

    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch.to_ascii_lowercase());
        } else if matches!(ch, '-' | '_' | ' ' | '.') {
            pending_hyphen = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_namespaces_are_kept_verbatim() -> anyhow::Result<()> {
        let longest = "x".repeat(MAX_NAMESPACE_LEN);
        for input in ["simple", "user-42", "a1-b2-c3", longest.as_str()] {
            assert_eq!(normalize_namespace(input)?, input);
        }
        Ok(())
    }

    #[test]
    fn lossy_namespaces_keep_a_readable_prefix_and_a_digest() -> anyhow::Result<()> {
        let name = normalize_namespace("User Inbox_1")?;
        assert!(name.starts_with("user-inbox-1--"), "{name}");
        assert_eq!(name.len(), "user-inbox-1--".len() + NAMESPACE_DIGEST_LEN);

        assert!(normalize_namespace("日本")?.starts_with("ns--"));
        assert!(normalize_namespace(&"x".repeat(80))?.len() <= MAX_NAMESPACE_LEN);
        assert_eq!(normalize_namespace("Work")?, normalize_namespace("Work")?);
        assert!(normalize_namespace("").is_err());
        assert!(normalize_namespace("   ").is_err());
        Ok(())
    }

    #[test]
    fn distinct_namespaces_never_share_a_store_name() -> anyhow::Result<()> {
        let inputs = [
            "work", "Work", "WORK", " work", "user-1", "user_1", "user.1", "user 1", "caf",
            "café", "cafe", "--a--", "a", "a--b", "a-b",
        ];
        let mut seen = std::collections::BTreeMap::new();
        for input in inputs {
            let name = normalize_namespace(input)?;
            if let Some(previous) = seen.insert(name.clone(), input) {
                anyhow::bail!("{previous:?} and {input:?} both map to {name}");
            }
        }
        Ok(())
    }

    #[test]
    fn yaml_config_applies_defaults() -> anyhow::Result<()> {
        let config = CacheConfig::from_yaml_str("root_dir: /tmp/inbox\nnamespace: primary\n")?;
        assert_eq!(config.namespace, "primary");
        assert_eq!(config.reader_pool_size, 4);
        assert_eq!(config.reconcile_policy(), ReconcilePolicy::default());
        Ok(())
    }

    #[test]
    fn yaml_config_rejects_unknown_keys_and_bad_values() {
        let unknown = CacheConfig::from_yaml_str("root_dir: /tmp\nnamespace: a\nretries: 3\n");
        assert!(matches!(unknown, Err(ConfigError::Parse(_))));

        let zero_pool =
            CacheConfig::from_yaml_str("root_dir: /tmp\nnamespace: a\nreader_pool_size: 0\n");
        assert!(matches!(zero_pool, Err(ConfigError::Invalid(_))));

        let bad_namespace = CacheConfig::from_yaml_str("root_dir: /tmp\nnamespace: '   '\n");
        assert!(matches!(bad_namespace, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_reads_config_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("inbox.yaml");
        fs::write(&path, "root_dir: /var/lib/inbox\nnamespace: Work\norphan_grace_secs: 60\n")?;

        let config = CacheConfig::load(&path)?;
        assert_eq!(config.reconcile_policy().orphan_grace, Duration::seconds(60));

        let missing = CacheConfig::load(&dir.path().join("absent.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
        Ok(())
    }
}
