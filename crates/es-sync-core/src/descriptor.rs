//! Type descriptors
//!
//! Static per-document-type metadata: where writes go, how the concrete index
//! is named, which aliases front it, and the settings/mappings whose digest
//! is used to detect schema drift between runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::{Result, SyncError};

/// Length of the hex-encoded schema digest
const SCHEMA_HASH_LEN: usize = 16;

/// Suffix of the write alias for date-rotated targets
pub const LATEST_ALIAS_SUFFIX: &str = "latest";

/// Static metadata for one document type and its write target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Stable type name, used as the registry key
    pub name: String,

    /// Write target (index or alias base name)
    #[serde(default)]
    pub write_target: Option<String>,

    /// Optional read alias pointed at the concrete index on completion
    #[serde(default)]
    pub read_alias: Option<String>,

    /// chrono strftime pattern; presence means the concrete index rotates
    #[serde(default)]
    pub date_pattern: Option<String>,

    /// Index settings registered with the template
    #[serde(default = "empty_object")]
    pub settings: Value,

    /// Index mappings registered with the template
    #[serde(default = "empty_object")]
    pub mappings: Value,
}

fn empty_object() -> Value {
    json!({})
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            write_target: None,
            read_alias: None,
            date_pattern: None,
            settings: empty_object(),
            mappings: empty_object(),
        }
    }

    /// Builder pattern: set write target
    pub fn with_write_target(mut self, target: impl Into<String>) -> Self {
        self.write_target = Some(target.into());
        self
    }

    /// Builder pattern: set read alias
    pub fn with_read_alias(mut self, alias: impl Into<String>) -> Self {
        self.read_alias = Some(alias.into());
        self
    }

    /// Builder pattern: set date pattern
    pub fn with_date_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.date_pattern = Some(pattern.into());
        self
    }

    /// Builder pattern: set settings
    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    /// Builder pattern: set mappings
    pub fn with_mappings(mut self, mappings: Value) -> Self {
        self.mappings = mappings;
        self
    }

    /// Write target, or a configuration error naming the type
    pub fn target(&self) -> Result<&str> {
        self.write_target
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                SyncError::config(format!("type `{}` has no write target", self.name))
            })
    }

    /// Name writes are directed at
    ///
    /// Date-rotated targets are written through `{target}-latest`.
    pub fn write_alias(&self) -> Result<String> {
        let target = self.target()?;
        Ok(match self.date_pattern {
            Some(_) => format!("{}-{}", target, LATEST_ALIAS_SUFFIX),
            None => target.to_string(),
        })
    }

    pub fn is_rotating(&self) -> bool {
        self.date_pattern.is_some()
    }

    /// Concrete index name for a run starting at `at`
    pub fn concrete_index_name(&self, at: DateTime<Utc>) -> Result<String> {
        let target = self.target()?;
        let Some(ref pattern) = self.date_pattern else {
            return Ok(target.to_string());
        };

        let mut name = format!("{}-", target);
        write!(name, "{}", at.format(pattern)).map_err(|_| {
            SyncError::config(format!(
                "type `{}` has an invalid date pattern `{}`",
                self.name, pattern
            ))
        })?;
        Ok(name.to_lowercase())
    }

    /// Name of the index template registered on bootstrap
    pub fn template_name(&self) -> Result<String> {
        Ok(format!("{}-template", self.target()?))
    }

    /// Index patterns the template applies to
    pub fn index_patterns(&self) -> Result<Vec<String>> {
        let target = self.target()?;
        Ok(match self.date_pattern {
            Some(_) => vec![format!("{}-*", target)],
            None => vec![target.to_string()],
        })
    }

    /// Deterministic digest of the effective settings and mappings
    ///
    /// serde_json maps are ordered by key, so equal configurations always
    /// serialize to the same bytes.
    pub fn schema_hash(&self) -> String {
        let canonical = json!({
            "settings": self.settings,
            "mappings": self.mappings,
        })
        .to_string();

        let digest = Sha256::digest(canonical.as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(SCHEMA_HASH_LEN);
        hash
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Write-once registry of descriptors keyed by type name
#[derive(Debug, Clone, Default)]
pub struct DescriptorRegistry {
    descriptors: HashMap<String, Arc<TypeDescriptor>>,
}

impl DescriptorRegistry {
    pub fn builder() -> DescriptorRegistryBuilder {
        DescriptorRegistryBuilder::default()
    }

    /// Look up a descriptor by type name
    pub fn get(&self, name: &str) -> Result<Arc<TypeDescriptor>> {
        self.descriptors
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::config(format!("no descriptor registered for `{}`", name)))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }
}

/// Builder for [`DescriptorRegistry`]
#[derive(Debug, Default)]
pub struct DescriptorRegistryBuilder {
    descriptors: HashMap<String, Arc<TypeDescriptor>>,
}

impl DescriptorRegistryBuilder {
    /// Register a descriptor; duplicate names are rejected
    pub fn register(mut self, descriptor: TypeDescriptor) -> Result<Self> {
        if self.descriptors.contains_key(&descriptor.name) {
            return Err(SyncError::config(format!(
                "descriptor `{}` registered twice",
                descriptor.name
            )));
        }
        self.descriptors
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(self)
    }

    pub fn build(self) -> DescriptorRegistry {
        DescriptorRegistry {
            descriptors: self.descriptors,
        }
    }
}
