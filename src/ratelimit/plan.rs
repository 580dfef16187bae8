//! Plan tiers and API key resolution.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, trace};

use crate::error::{FloodgateError, Result};

/// A named service level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    /// The most restrictive tier, assigned to unknown callers
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub plan: PlanTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanRegistryFile {
    #[serde(default)]
    keys: Vec<ApiKeyConfig>,
}

/// Static registry mapping API keys to plan tiers.
#[derive(Debug, Clone)]
pub struct PlanRegistry {
    keys: HashMap<String, ApiKeyConfig>,
}

impl PlanRegistry {
    /// Build a registry from key entries. Later duplicates replace earlier ones.
    pub fn new(entries: impl IntoIterator<Item = ApiKeyConfig>) -> Self {
        let keys = entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        Self { keys }
    }

    /// A registry with no keys; every caller is on the free tier.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Load a registry from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading plan registry");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a registry from YAML of the form `keys: [{ key, plan, label }]`.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PlanRegistryFile = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse plan registry: {}", e)))?;
        Ok(Self::new(file.keys))
    }

    /// Resolve the plan tier for an API key.
    ///
    /// Missing, blank and unregistered keys all resolve to [`PlanTier::Free`].
    pub fn resolve(&self, api_key: Option<&str>) -> PlanTier {
        let plan = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .and_then(|key| self.keys.get(key))
            .map(|entry| entry.plan)
            .unwrap_or_default();

        trace!(plan = %plan, "Resolved plan tier");
        plan
    }

    /// Look up the registry entry for an exact key.
    pub fn get(&self, api_key: &str) -> Option<&ApiKeyConfig> {
        self.keys.get(api_key.trim())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for PlanRegistry {
    /// The demo keys shipped with the server.
    fn default() -> Self {
        let demo = |key: &str, plan, label: &str| ApiKeyConfig {
            key: key.to_string(),
            plan,
            label: Some(label.to_string()),
        };

        Self::new([
            demo("FREE-DEMO-KEY", PlanTier::Free, "Example Free key"),
            demo("PRO-DEMO-KEY", PlanTier::Pro, "Example Pro key"),
            demo(
                "ENTERPRISE-DEMO-KEY",
                PlanTier::Enterprise,
                "Example Enterprise key",
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_free() {
        let registry = PlanRegistry::default();
        assert_eq!(registry.resolve(None), PlanTier::Free);
        assert_eq!(registry.resolve(Some("")), PlanTier::Free);
        assert_eq!(registry.resolve(Some("   ")), PlanTier::Free);
    }

    #[test]
    fn test_unknown_key_is_free() {
        let registry = PlanRegistry::default();
        assert_eq!(registry.resolve(Some("not-a-key")), PlanTier::Free);
        // Exact match only
        assert_eq!(registry.resolve(Some("pro-demo-key")), PlanTier::Free);
    }

    #[test]
    fn test_registered_keys_resolve_after_trimming() {
        let registry = PlanRegistry::default();
        assert_eq!(registry.resolve(Some("PRO-DEMO-KEY")), PlanTier::Pro);
        assert_eq!(registry.resolve(Some("  PRO-DEMO-KEY\t")), PlanTier::Pro);
        assert_eq!(
            registry.resolve(Some("ENTERPRISE-DEMO-KEY")),
            PlanTier::Enterprise
        );
        assert_eq!(registry.resolve(Some("FREE-DEMO-KEY")), PlanTier::Free);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
keys:
  - key: team-a
    plan: enterprise
  - key: team-b
    plan: pro
    label: Team B
"#;
        let registry = PlanRegistry::from_yaml(yaml).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve(Some("team-a")), PlanTier::Enterprise);
        assert_eq!(
            registry.get("team-b").and_then(|k| k.label.as_deref()),
            Some("Team B")
        );
    }

    #[test]
    fn test_from_yaml_rejects_unknown_plan() {
        let yaml = r#"
keys:
  - key: team-a
    plan: platinum
"#;
        assert!(matches!(
            PlanRegistry::from_yaml(yaml),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_empty_registry() {
        let registry = PlanRegistry::empty();
        assert!(registry.is_empty());
        assert_eq!(registry.resolve(Some("PRO-DEMO-KEY")), PlanTier::Free);
    }
}
