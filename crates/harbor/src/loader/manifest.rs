//! Plugin manifest (`plugin.toml` at the archive root)

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use super::LoadError;
use crate::types::is_valid_name;

/// File name of the manifest inside every archive
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Upper bound for `max_concurrency` in a parallel policy
pub const MAX_CONCURRENCY: usize = 1024;

/// Plugin manifest
///
/// ```toml
/// name = "echo-plugin"
/// version = "1.0.0"
/// entry = "bin/plugin"
/// capabilities = ["echo"]
///
/// [invocation]
/// mode = "parallel"
/// max_concurrency = 8
///
/// [config]
/// greeting = "hi"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    /// Executable inside the archive, relative to its root
    pub entry: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Extra arguments passed to the entry point
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub invocation: InvocationPolicy,
    /// Free-form table handed to the plugin in its Start message
    #[serde(default)]
    pub config: serde_json::Value,
}

/// How many invocations one instance may serve at the same time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum InvocationPolicy {
    /// One invocation at a time; later calls queue behind it
    Serial,
    /// Up to `max_concurrency` invocations run side by side
    Parallel {
        #[serde(default = "default_max_concurrency")]
        max_concurrency: usize,
    },
}

fn default_max_concurrency() -> usize {
    16
}

impl Default for InvocationPolicy {
    fn default() -> Self {
        Self::Serial
    }
}

impl InvocationPolicy {
    /// Number of concurrent invocation permits
    pub fn permits(&self) -> usize {
        match self {
            InvocationPolicy::Serial => 1,
            InvocationPolicy::Parallel { max_concurrency } => *max_concurrency,
        }
    }
}

impl PluginManifest {
    /// Parse and validate manifest text read from `archive`
    pub fn parse(archive: &Path, text: &str) -> Result<Self, LoadError> {
        let mut manifest: PluginManifest = toml::from_str(text)
            .map_err(|e| LoadError::malformed(archive, format!("invalid {MANIFEST_FILE}: {e}")))?;
        manifest.validate(archive)?;
        manifest.entry = normalize_entry(&manifest.entry);
        Ok(manifest)
    }

    /// Check the fields a host relies on
    pub fn validate(&self, archive: &Path) -> Result<(), LoadError> {
        if !is_valid_name(&self.name) {
            return Err(LoadError::malformed(
                archive,
                format!("invalid plugin name '{}'", self.name),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(LoadError::malformed(archive, "version must not be empty"));
        }
        if !is_relative_inside(&self.entry) {
            return Err(LoadError::malformed(
                archive,
                format!("entry '{}' must be a relative path inside the archive", self.entry),
            ));
        }
        if self.capabilities.is_empty() {
            return Err(LoadError::malformed(archive, "no capabilities declared"));
        }

        let mut seen = std::collections::HashSet::new();
        for capability in &self.capabilities {
            if !is_valid_name(capability) {
                return Err(LoadError::malformed(
                    archive,
                    format!("invalid capability name '{capability}'"),
                ));
            }
            if !seen.insert(capability.as_str()) {
                return Err(LoadError::CapabilityConflict(format!(
                    "capability '{capability}' is declared twice by {}",
                    self.name
                )));
            }
        }

        let permits = self.invocation.permits();
        if !(1..=MAX_CONCURRENCY).contains(&permits) {
            return Err(LoadError::malformed(
                archive,
                format!("max_concurrency must be between 1 and {MAX_CONCURRENCY}, got {permits}"),
            ));
        }

        Ok(())
    }
}

fn is_relative_inside(path: &str) -> bool {
    let path = Path::new(path);
    path.components().any(|c| matches!(c, Component::Normal(_)))
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// `./bin//run` -> `bin/run`, the form zip entry names use
fn normalize_entry(entry: &str) -> String {
    Path::new(entry)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<PluginManifest, LoadError> {
        PluginManifest::parse(Path::new("plugin-a.jar"), text)
    }

    #[test]
    fn test_minimal_manifest_defaults_to_serial() {
        let manifest = parse(
            r#"
            name = "plugin-a"
            version = "1.0.0"
            entry = "bin/plugin"
            capabilities = ["echo"]
            "#,
        )
        .unwrap();

        assert_eq!(manifest.capabilities, vec!["echo"]);
        assert_eq!(manifest.invocation, InvocationPolicy::Serial);
        assert_eq!(manifest.invocation.permits(), 1);
    }

    #[test]
    fn test_parallel_policy() {
        let manifest = parse(
            r#"
            name = "plugin-a"
            version = "1.0.0"
            entry = "bin/plugin"
            capabilities = ["echo"]

            [invocation]
            mode = "parallel"
            max_concurrency = 4
            "#,
        )
        .unwrap();

        assert_eq!(manifest.invocation.permits(), 4);
    }

    #[test]
    fn test_concurrency_is_bounded() {
        for value in ["0", "1025", "9223372036854775807"] {
            let err = parse(&format!(
                r#"
                name = "plugin-a"
                version = "1.0.0"
                entry = "bin/plugin"
                capabilities = ["echo"]

                [invocation]
                mode = "parallel"
                max_concurrency = {value}
                "#
            ))
            .unwrap_err();
            assert_eq!(err.kind(), "MALFORMED_ARCHIVE", "{value}");
        }
    }

    #[test]
    fn test_entry_is_normalized() {
        let manifest = parse(
            r#"
            name = "plugin-a"
            version = "1.0.0"
            entry = "./bin/./plugin"
            capabilities = ["echo"]
            "#,
        )
        .unwrap();
        assert_eq!(manifest.entry, "bin/plugin");

        let err = parse(
            r#"
            name = "plugin-a"
            version = "1.0.0"
            entry = "./"
            capabilities = ["echo"]
            "#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "MALFORMED_ARCHIVE");
    }

    #[test]
    fn test_config_table_becomes_json() {
        let manifest = parse(
            r#"
            name = "plugin-a"
            version = "1.0.0"
            entry = "bin/plugin"
            capabilities = ["echo"]

            [config]
            greeting = "hi"
            retries = 3
            "#,
        )
        .unwrap();

        assert_eq!(manifest.config["greeting"], "hi");
        assert_eq!(manifest.config["retries"], 3);
    }

    #[test]
    fn test_duplicate_capability_is_a_conflict() {
        let err = parse(
            r#"
            name = "plugin-a"
            version = "1.0.0"
            entry = "bin/plugin"
            capabilities = ["echo", "echo"]
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, LoadError::CapabilityConflict(_)));
    }

    #[test]
    fn test_entry_may_not_escape_archive() {
        let err = parse(
            r#"
            name = "plugin-a"
            version = "1.0.0"
            entry = "../../bin/sh"
            capabilities = ["echo"]
            "#,
        )
        .unwrap_err();

        assert_eq!(err.kind(), "MALFORMED_ARCHIVE");
    }

    #[test]
    fn test_missing_capabilities_rejected() {
        let err = parse(
            r#"
            name = "plugin-a"
            version = "1.0.0"
            entry = "bin/plugin"
            "#,
        )
        .unwrap_err();

        assert_eq!(err.kind(), "MALFORMED_ARCHIVE");
    }

    #[test]
    fn test_not_toml_is_malformed() {
        assert_eq!(parse("{ nope").unwrap_err().kind(), "MALFORMED_ARCHIVE");
    }
}
