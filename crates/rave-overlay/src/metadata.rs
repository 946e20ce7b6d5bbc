use std::path::Path;

use globset::{GlobBuilder, GlobMatcher};
use rave_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Kind of payload entry a pattern can scope to.
pub const KIND_FILE: &str = "file";
pub const KIND_SYSTEMD: &str = "systemd";

/// Defaults applied to every entry before pattern merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDefaults {
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_file_mode")]
    pub file_mode: String,
    #[serde(default = "default_dir_mode")]
    pub dir_mode: String,
    #[serde(default)]
    pub restart_units: Vec<String>,
    #[serde(default)]
    pub reload_units: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub daemon_reload: bool,
}

impl Default for MetadataDefaults {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            group: default_group(),
            file_mode: default_file_mode(),
            dir_mode: default_dir_mode(),
            restart_units: Vec::new(),
            reload_units: Vec::new(),
            commands: Vec::new(),
            daemon_reload: false,
        }
    }
}

fn default_owner() -> String {
    "root".to_string()
}
fn default_group() -> String {
    "root".to_string()
}
fn default_file_mode() -> String {
    "0644".to_string()
}
fn default_dir_mode() -> String {
    "0755".to_string()
}

/// One pattern rule. Matches by exact `path` or glob `match`, optionally
/// restricted to a scope (file/systemd). Matching rules merge in order:
/// scalars last-wins, lists append with order-preserving dedup,
/// daemon_reload ORs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPattern {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "match")]
    pub glob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_units: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload_units: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_reload: Option<bool>,
}

/// Parsed `metadata.json` for a layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataPolicy {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub defaults: MetadataDefaults,
    #[serde(default)]
    pub patterns: Vec<MetadataPattern>,
}

fn default_version() -> u32 {
    1
}

impl Default for MetadataPolicy {
    fn default() -> Self {
        Self {
            version: 1,
            defaults: MetadataDefaults::default(),
            patterns: Vec::new(),
        }
    }
}

/// Fully resolved metadata for one target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMetadata {
    pub owner: String,
    pub group: String,
    pub file_mode: String,
    pub dir_mode: String,
    pub restart_units: Vec<String>,
    pub reload_units: Vec<String>,
    pub commands: Vec<String>,
    pub daemon_reload: bool,
}

impl MetadataPolicy {
    /// Load a policy from disk. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            Error::validation(format!("invalid metadata JSON at {}: {e}", path.display()))
        })
    }

    /// Resolve metadata for `(target_relpath, kind)` per the merge rules.
    pub fn resolve(&self, target_relpath: &str, kind: &str) -> ResolvedMetadata {
        let mut result = ResolvedMetadata {
            owner: self.defaults.owner.clone(),
            group: self.defaults.group.clone(),
            file_mode: self.defaults.file_mode.clone(),
            dir_mode: self.defaults.dir_mode.clone(),
            restart_units: self.defaults.restart_units.clone(),
            reload_units: self.defaults.reload_units.clone(),
            commands: self.defaults.commands.clone(),
            daemon_reload: self.defaults.daemon_reload,
        };

        for pattern in &self.patterns {
            if !pattern.scope.is_empty() && !pattern.scope.iter().any(|s| s == kind) {
                continue;
            }

            let matches = match (&pattern.path, &pattern.glob) {
                (Some(path), _) if path == target_relpath => true,
                (_, Some(glob)) => glob_matches(glob, target_relpath),
                _ => false,
            };
            if !matches {
                continue;
            }

            if let Some(v) = &pattern.owner {
                result.owner = v.clone();
            }
            if let Some(v) = &pattern.group {
                result.group = v.clone();
            }
            if let Some(v) = &pattern.file_mode {
                result.file_mode = v.clone();
            }
            if let Some(v) = &pattern.dir_mode {
                result.dir_mode = v.clone();
            }
            if let Some(v) = pattern.daemon_reload {
                result.daemon_reload = result.daemon_reload || v;
            }
            if let Some(v) = &pattern.restart_units {
                merge_unique(&mut result.restart_units, v);
            }
            if let Some(v) = &pattern.reload_units {
                merge_unique(&mut result.reload_units, v);
            }
            if let Some(v) = &pattern.commands {
                merge_unique(&mut result.commands, v);
            }
        }

        result
    }
}

fn merge_unique(target: &mut Vec<String>, values: &[String]) {
    for value in values {
        if !target.iter().any(|v| v == value) {
            target.push(value.clone());
        }
    }
}

fn glob_matches(glob: &str, path: &str) -> bool {
    build_matcher(glob).map(|m| m.is_match(path)).unwrap_or(false)
}

// fnmatch-style semantics: `*` crosses directory separators.
fn build_matcher(glob: &str) -> Option<GlobMatcher> {
    GlobBuilder::new(glob)
        .literal_separator(false)
        .build()
        .ok()
        .map(|g| g.compile_matcher())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(patterns: Vec<MetadataPattern>) -> MetadataPolicy {
        MetadataPolicy {
            version: 1,
            defaults: MetadataDefaults::default(),
            patterns,
        }
    }

    #[test]
    fn test_defaults_apply_without_patterns() {
        let p = policy(vec![]);
        let resolved = p.resolve("etc/nginx/nginx.conf", KIND_FILE);
        assert_eq!(resolved.owner, "root");
        assert_eq!(resolved.file_mode, "0644");
        assert!(resolved.restart_units.is_empty());
        assert!(!resolved.daemon_reload);
    }

    #[test]
    fn test_glob_match_appends_units() {
        let p = policy(vec![MetadataPattern {
            glob: Some("etc/nginx/**".to_string()),
            reload_units: Some(vec!["nginx.service".to_string()]),
            scope: vec![KIND_FILE.to_string()],
            ..MetadataPattern::default()
        }]);
        let resolved = p.resolve("etc/nginx/nginx.conf", KIND_FILE);
        assert_eq!(resolved.reload_units, vec!["nginx.service"]);
    }

    #[test]
    fn test_scope_filters_kind() {
        let p = policy(vec![MetadataPattern {
            glob: Some("etc/systemd/system/**/*.service".to_string()),
            daemon_reload: Some(true),
            scope: vec![KIND_SYSTEMD.to_string()],
            ..MetadataPattern::default()
        }]);
        let systemd = p.resolve("etc/systemd/system/web.service", KIND_SYSTEMD);
        assert!(systemd.daemon_reload);
        let file = p.resolve("etc/systemd/system/web.service", KIND_FILE);
        assert!(!file.daemon_reload);
    }

    #[test]
    fn test_scalar_last_wins_list_dedups() {
        let p = policy(vec![
            MetadataPattern {
                glob: Some("etc/**".to_string()),
                owner: Some("alice".to_string()),
                restart_units: Some(vec!["web.service".to_string()]),
                ..MetadataPattern::default()
            },
            MetadataPattern {
                glob: Some("etc/app/**".to_string()),
                owner: Some("bob".to_string()),
                restart_units: Some(vec![
                    "web.service".to_string(),
                    "worker.service".to_string(),
                ]),
                ..MetadataPattern::default()
            },
        ]);
        let resolved = p.resolve("etc/app/config.toml", KIND_FILE);
        assert_eq!(resolved.owner, "bob");
        assert_eq!(resolved.restart_units, vec!["web.service", "worker.service"]);
    }

    #[test]
    fn test_exact_path_beats_glob_absence() {
        let p = policy(vec![MetadataPattern {
            path: Some("etc/special.conf".to_string()),
            file_mode: Some("0600".to_string()),
            ..MetadataPattern::default()
        }]);
        assert_eq!(p.resolve("etc/special.conf", KIND_FILE).file_mode, "0600");
        assert_eq!(p.resolve("etc/other.conf", KIND_FILE).file_mode, "0644");
    }

    #[test]
    fn test_daemon_reload_ors_across_matches() {
        let p = policy(vec![
            MetadataPattern {
                glob: Some("etc/**".to_string()),
                daemon_reload: Some(true),
                ..MetadataPattern::default()
            },
            MetadataPattern {
                glob: Some("etc/app/**".to_string()),
                daemon_reload: Some(false),
                ..MetadataPattern::default()
            },
        ]);
        assert!(p.resolve("etc/app/x", KIND_FILE).daemon_reload);
    }

    #[test]
    fn test_policy_json_roundtrip() {
        let json = r#"{
            "version": 1,
            "defaults": {"owner": "root", "group": "root"},
            "patterns": [
                {"match": "etc/traefik/**", "reload_units": ["traefik.service"], "scope": ["file"]}
            ]
        }"#;
        let p: MetadataPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(p.patterns.len(), 1);
        assert_eq!(p.defaults.file_mode, "0644");
        let resolved = p.resolve("etc/traefik/dynamic.yaml", KIND_FILE);
        assert_eq!(resolved.reload_units, vec!["traefik.service"]);
    }
}
