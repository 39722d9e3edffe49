// Source Catalog
// Reads tools.yaml, validates each source, and serves descriptors by name

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::models::{DialectOptions, RawSource, SourceDescriptor};
use super::ConfigError;

/// Relative locations searched, in order, when no path is given
pub const CONFIG_SEARCH_PATHS: [&str; 4] = [
    "tools.yaml",
    "config/tools.yaml",
    "tools.yml",
    "config/tools.yml",
];

const SYSTEM_CONFIG_PATH: &str = "/etc/database-mcp/tools.yaml";

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    sources: BTreeMap<String, serde_yaml::Value>,
}

/// Summary of the loaded configuration
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConfigSummary {
    pub config_file: Option<PathBuf>,
    pub sources_count: usize,
    pub sources: Vec<String>,
}

/// Name -> descriptor mapping, reloadable at runtime
pub struct SourceCatalog {
    path: RwLock<Option<PathBuf>>,
    sources: RwLock<BTreeMap<String, SourceDescriptor>>,
}

impl SourceCatalog {
    /// Create an empty catalog with no backing file
    pub fn empty() -> Self {
        Self {
            path: RwLock::new(None),
            sources: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a catalog from already-validated descriptors
    pub fn from_sources(sources: impl IntoIterator<Item = SourceDescriptor>) -> Self {
        let sources = sources
            .into_iter()
            .map(|source| (source.name.clone(), source))
            .collect();
        Self {
            path: RwLock::new(None),
            sources: RwLock::new(sources),
        }
    }

    /// Load a catalog from a YAML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let catalog = Self::empty();
        catalog.load_from(path).await?;
        Ok(catalog)
    }

    /// Find a configuration file in the usual locations
    pub fn discover() -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = CONFIG_SEARCH_PATHS.iter().map(PathBuf::from).collect();
        if let Some(dirs) = directories::BaseDirs::new() {
            candidates.push(
                dirs.home_dir()
                    .join(".config")
                    .join("database-mcp")
                    .join("tools.yaml"),
            );
        }
        candidates.push(PathBuf::from(SYSTEM_CONFIG_PATH));

        candidates.into_iter().find(|path| path.is_file())
    }

    /// Parse YAML content into validated descriptors.
    /// Invalid sources are skipped with a warning; malformed YAML is an error.
    pub fn parse(content: &str) -> Result<BTreeMap<String, SourceDescriptor>, ConfigError> {
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let file: ConfigFile = serde_yaml::from_str(content)?;
        let mut sources = BTreeMap::new();

        for (name, value) in file.sources {
            let parsed = serde_yaml::from_value::<RawSource>(value)
                .map_err(|e| ConfigError::InvalidSource {
                    name: name.clone(),
                    reason: e.to_string(),
                })
                .and_then(|raw| raw.into_descriptor(&name));

            match parsed {
                Ok((descriptor, ignored)) => {
                    if !ignored.is_empty() {
                        warn!(
                            source = %name,
                            kind = %descriptor.kind,
                            ignored = ?ignored,
                            "Ignoring options that do not apply to this database kind"
                        );
                    }
                    sources.insert(name, descriptor);
                }
                Err(e) => warn!("Skipping source: {}", e),
            }
        }

        Ok(sources)
    }

    /// Replace the catalog contents with the sources in `path`
    pub async fn load_from(&self, path: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
        let parsed = Self::parse(&content)?;
        let count = parsed.len();

        *self.sources.write().await = parsed;
        *self.path.write().await = Some(path.clone());

        info!(path = %path.display(), sources = count, "Configuration loaded");
        Ok(count)
    }

    /// Re-read the backing file
    pub async fn reload(&self) -> Result<usize, ConfigError> {
        let path = self
            .path
            .read()
            .await
            .clone()
            .ok_or_else(|| ConfigError::NotFound("no configuration file loaded".to_string()))?;
        self.load_from(path).await
    }

    pub async fn get(&self, name: &str) -> Option<SourceDescriptor> {
        self.sources.read().await.get(name).cloned()
    }

    /// Source names in sorted order
    pub async fn names(&self) -> Vec<String> {
        self.sources.read().await.keys().cloned().collect()
    }

    pub async fn sources(&self) -> Vec<SourceDescriptor> {
        self.sources.read().await.values().cloned().collect()
    }

    /// Problems that would make the configuration unusable
    pub async fn validate(&self) -> Vec<String> {
        let sources = self.sources.read().await;
        let mut errors = Vec::new();

        if sources.is_empty() {
            errors.push("No valid database sources configured".to_string());
        }
        for (name, source) in sources.iter() {
            let has_oracle_target = matches!(
                &source.dialect,
                DialectOptions::Oracle { service_name, sid, .. } if service_name.is_some() || sid.is_some()
            );
            if source.database.trim().is_empty() && !has_oracle_target {
                errors.push(format!("Source '{}' has no database name", name));
            }
        }

        errors
    }

    pub async fn summary(&self) -> ConfigSummary {
        let sources = self.names().await;
        ConfigSummary {
            config_file: self.path.read().await.clone(),
            sources_count: sources.len(),
            sources,
        }
    }
}

impl Default for SourceCatalog {
    fn default() -> Self {
        Self::empty()
    }
}
