//! Identity sources — the catalog of identities currently eligible to run.
//!
//! Eligibility is decided outside the pool and may change between polls:
//! an identity is eligible while its descriptor file exists.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::registry::identity::Identity;

/// Enumerates the identities that may currently be checked out.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Short label used in logs and startup errors.
    fn name(&self) -> &str;

    /// Current eligible set. Callers must not assume it is stable.
    async fn eligible_identities(&self) -> Result<BTreeSet<Identity>, SourceError>;
}

/// Eligible identities are the ones with a `<prefix><identity><suffix>`
/// descriptor file in a directory.
#[derive(Debug, Clone)]
pub struct DescriptorDirSource {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    allowlist: BTreeSet<String>,
    label: String,
}

impl DescriptorDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::from_config(&SourceConfig {
            descriptor_dir: dir.into(),
            ..SourceConfig::default()
        })
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            label: format!(
                "{}/{}*{}",
                config.descriptor_dir.display(),
                config.prefix,
                config.suffix
            ),
            dir: config.descriptor_dir.clone(),
            prefix: config.prefix.clone(),
            suffix: config.suffix.clone(),
            allowlist: config.allowlist.iter().cloned().collect(),
        }
    }

    /// Restrict eligibility to the given identities.
    pub fn with_allowlist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowlist = names.into_iter().map(Into::into).collect();
        self
    }

    /// Path of the descriptor that makes `identity` eligible.
    pub fn descriptor_path(&self, identity: &Identity) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", self.prefix, identity, self.suffix))
    }

    fn identity_from_file_name(&self, file_name: &str) -> Option<Identity> {
        let name = file_name
            .strip_prefix(&self.prefix)?
            .strip_suffix(&self.suffix)?;
        if !self.allowlist.is_empty() && !self.allowlist.contains(name) {
            return None;
        }
        match Identity::new(name) {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!(file = %file_name, error = %e, "Skipping descriptor with invalid identity");
                None
            }
        }
    }
}

#[async_trait]
impl IdentitySource for DescriptorDirSource {
    fn name(&self) -> &str {
        &self.label
    }

    async fn eligible_identities(&self) -> Result<BTreeSet<Identity>, SourceError> {
        let scan_err = |e: std::io::Error| SourceError::Scan {
            path: self.dir.display().to_string(),
            reason: e.to_string(),
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(scan_err)?;
        let mut identities = BTreeSet::new();

        while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
            let file_type = entry.file_type().await.map_err(scan_err)?;
            if !file_type.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(identity) = self.identity_from_file_name(file_name) {
                identities.insert(identity);
            }
        }

        Ok(identities)
    }
}

/// Fixed, in-memory identity list that can be edited while a pool runs.
#[derive(Debug, Default)]
pub struct StaticSource {
    identities: RwLock<BTreeSet<Identity>>,
}

impl StaticSource {
    pub fn new<I: IntoIterator<Item = Identity>>(identities: I) -> Self {
        Self {
            identities: RwLock::new(identities.into_iter().collect()),
        }
    }

    /// Build from names, failing on the first invalid one.
    pub fn from_names<I, S>(names: I) -> Result<Self, SourceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let identities = names
            .into_iter()
            .map(Identity::new)
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self::new(identities))
    }

    /// Replace the whole eligible set.
    pub async fn set<I: IntoIterator<Item = Identity>>(&self, identities: I) {
        *self.identities.write().await = identities.into_iter().collect();
    }

    pub async fn insert(&self, identity: Identity) -> bool {
        self.identities.write().await.insert(identity)
    }

    pub async fn remove(&self, identity: &Identity) -> bool {
        self.identities.write().await.remove(identity)
    }
}

#[async_trait]
impl IdentitySource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn eligible_identities(&self) -> Result<BTreeSet<Identity>, SourceError> {
        Ok(self.identities.read().await.clone())
    }
}
