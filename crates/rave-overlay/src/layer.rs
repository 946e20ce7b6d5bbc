use std::path::{Path, PathBuf};

use rave_core::{naming, Error, Result};
use serde::{Deserialize, Serialize};

use crate::metadata::{MetadataPattern, MetadataPolicy};

pub const DEFAULT_LAYER_PRIORITY: i64 = 100;

/// On-disk `layer.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_files_dir")]
    pub files_dir: String,
    #[serde(default = "default_systemd_dir")]
    pub systemd_dir: String,
    #[serde(default = "default_metadata_file")]
    pub metadata: String,
}

fn default_priority() -> i64 {
    DEFAULT_LAYER_PRIORITY
}
fn default_files_dir() -> String {
    "files".to_string()
}
fn default_systemd_dir() -> String {
    "systemd".to_string()
}
fn default_metadata_file() -> String {
    "metadata.json".to_string()
}

/// A discovered override layer.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub root: PathBuf,
    pub priority: i64,
    pub description: String,
    pub files_dir: PathBuf,
    pub systemd_dir: PathBuf,
    pub metadata_path: PathBuf,
    pub metadata: MetadataPolicy,
}

impl Layer {
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.files_dir)?;
        std::fs::create_dir_all(&self.systemd_dir)?;
        Ok(())
    }
}

/// Summary row for `override list`.
#[derive(Debug, Clone, Serialize)]
pub struct LayerStats {
    pub name: String,
    pub priority: i64,
    pub description: String,
    pub path: String,
    pub file_count: usize,
}

/// Manages the override layers under `<repo>/config/overrides`.
pub struct OverrideStore {
    pub repo_root: PathBuf,
    pub overrides_root: PathBuf,
}

impl OverrideStore {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let overrides_root = repo_root.join("config").join("overrides");
        Self {
            repo_root,
            overrides_root,
        }
    }

    /// Ensure the overrides root and the `global` layer exist.
    /// Returns true when anything was created.
    pub fn ensure_initialized(&self) -> Result<bool> {
        let mut created = false;
        let global = self.overrides_root.join("global");

        std::fs::create_dir_all(&self.overrides_root)?;

        if !global.exists() {
            self.scaffold_layer(
                "global",
                DEFAULT_LAYER_PRIORITY,
                "Global overrides applied to every RAVE-managed host.",
                None,
            )?;
            return Ok(true);
        }

        // Repair expected structure without clobbering user content.
        std::fs::create_dir_all(global.join("files"))?;
        std::fs::create_dir_all(global.join("systemd"))?;
        if !global.join("layer.json").exists() {
            self.write_layer_config(
                &global,
                "global",
                DEFAULT_LAYER_PRIORITY,
                "Global overrides applied to every RAVE-managed host.",
            )?;
            created = true;
        }
        if !global.join("metadata.json").exists() {
            write_metadata(&global.join("metadata.json"), &default_metadata())?;
            created = true;
        }

        Ok(created)
    }

    /// Create a new layer directory with scaffolding and optional preset
    /// patterns appended to its metadata.
    pub fn create_layer(
        &self,
        name: &str,
        priority: i64,
        description: &str,
        copy_from: Option<&str>,
        presets: &[String],
    ) -> Result<Layer> {
        self.ensure_initialized()?;
        let normalized = naming::normalize_layer_name(name)?;
        let layer_dir = self.overrides_root.join(&normalized);
        if layer_dir.exists() {
            return Err(Error::conflict(format!(
                "override layer '{normalized}' already exists"
            )));
        }

        let mut metadata = match copy_from {
            Some(source) => self.get_layer(source)?.metadata,
            None => default_metadata(),
        };

        for preset in presets {
            let patterns = preset_patterns(preset).ok_or_else(|| {
                Error::validation(format!(
                    "unknown metadata preset '{preset}'. Available presets: {}",
                    PRESET_NAMES.join(", ")
                ))
            })?;
            metadata.patterns.extend(patterns);
        }

        let description = if description.is_empty() {
            format!("Custom override layer '{normalized}'")
        } else {
            description.to_string()
        };
        self.scaffold_layer(&normalized, priority, &description, Some(&metadata))?;
        self.get_layer(&normalized)
    }

    /// Discover configured layers sorted ascending by (priority, name).
    pub fn list_layers(&self) -> Result<Vec<Layer>> {
        let mut layers = Vec::new();
        if !self.overrides_root.exists() {
            return Ok(layers);
        }

        let mut children: Vec<PathBuf> = std::fs::read_dir(&self.overrides_root)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        children.sort();

        for child in children {
            let config_path = child.join("layer.json");
            if !config_path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&config_path)?;
            let config: LayerConfig = serde_json::from_str(&text).map_err(|e| {
                Error::validation(format!(
                    "invalid layer.json at {}: {e}",
                    config_path.display()
                ))
            })?;

            let name = if config.name.is_empty() {
                child
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            } else {
                config.name.clone()
            };
            let metadata_path = child.join(&config.metadata);
            let layer = Layer {
                name,
                priority: config.priority,
                description: config.description,
                files_dir: child.join(&config.files_dir),
                systemd_dir: child.join(&config.systemd_dir),
                metadata: MetadataPolicy::load(&metadata_path)?,
                metadata_path,
                root: child,
            };
            layer.ensure_dirs()?;
            layers.push(layer);
        }

        layers.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        Ok(layers)
    }

    pub fn get_layer(&self, name: &str) -> Result<Layer> {
        self.list_layers()?
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| Error::not_found(format!("override layer '{name}' not found")))
    }

    /// Per-layer stats for display.
    pub fn layer_stats(&self) -> Result<Vec<LayerStats>> {
        let mut stats = Vec::new();
        for layer in self.list_layers()? {
            let sources = crate::package::gather_sources(&layer)?;
            let path = layer
                .root
                .strip_prefix(&self.repo_root)
                .unwrap_or(&layer.root)
                .display()
                .to_string();
            stats.push(LayerStats {
                name: layer.name,
                priority: layer.priority,
                description: layer.description,
                path,
                file_count: sources.len(),
            });
        }
        Ok(stats)
    }

    fn scaffold_layer(
        &self,
        name: &str,
        priority: i64,
        description: &str,
        metadata: Option<&MetadataPolicy>,
    ) -> Result<()> {
        let layer_dir = self.overrides_root.join(name);
        let files_dir = layer_dir.join("files");
        let systemd_dir = layer_dir.join("systemd");
        std::fs::create_dir_all(&files_dir)?;
        std::fs::create_dir_all(&systemd_dir)?;
        std::fs::write(files_dir.join(".gitkeep"), "")?;
        std::fs::write(systemd_dir.join(".gitkeep"), "")?;

        self.write_layer_config(&layer_dir, name, priority, description)?;
        let default = default_metadata();
        write_metadata(
            &layer_dir.join("metadata.json"),
            metadata.unwrap_or(&default),
        )?;
        Ok(())
    }

    fn write_layer_config(
        &self,
        layer_dir: &Path,
        name: &str,
        priority: i64,
        description: &str,
    ) -> Result<()> {
        let config = LayerConfig {
            name: name.to_string(),
            description: description.to_string(),
            priority,
            files_dir: default_files_dir(),
            systemd_dir: default_systemd_dir(),
            metadata: default_metadata_file(),
        };
        std::fs::write(
            layer_dir.join("layer.json"),
            serde_json::to_string_pretty(&config)?,
        )?;
        Ok(())
    }
}

fn write_metadata(target: &Path, metadata: &MetadataPolicy) -> Result<()> {
    std::fs::write(target, serde_json::to_string_pretty(metadata)?)?;
    Ok(())
}

/// Metadata every scaffolded layer starts from: systemd unit globs demand a
/// daemon-reload, proxy config reloads the edge router.
fn default_metadata() -> MetadataPolicy {
    MetadataPolicy {
        version: 1,
        defaults: Default::default(),
        patterns: vec![
            systemd_pattern("etc/systemd/system/**/*.service"),
            systemd_pattern("etc/systemd/system/**/*.timer"),
            systemd_pattern("etc/systemd/system/**/*.path"),
            reload_pattern("etc/traefik/**", "traefik.service"),
            reload_pattern("etc/rave/overrides/traefik/**/*.yaml", "traefik.service"),
            reload_pattern("etc/nginx/**", "traefik.service"),
            reload_pattern("etc/rave/overrides/nginx/**/*.conf", "traefik.service"),
        ],
    }
}

fn systemd_pattern(glob: &str) -> MetadataPattern {
    MetadataPattern {
        glob: Some(glob.to_string()),
        daemon_reload: Some(true),
        scope: vec!["systemd".to_string()],
        ..MetadataPattern::default()
    }
}

fn reload_pattern(glob: &str, unit: &str) -> MetadataPattern {
    MetadataPattern {
        glob: Some(glob.to_string()),
        reload_units: Some(vec![unit.to_string()]),
        scope: vec!["file".to_string()],
        ..MetadataPattern::default()
    }
}

fn restart_pattern(glob: &str, units: &[&str], scope: &str) -> MetadataPattern {
    MetadataPattern {
        glob: Some(glob.to_string()),
        restart_units: Some(units.iter().map(|u| u.to_string()).collect()),
        scope: vec![scope.to_string()],
        ..MetadataPattern::default()
    }
}

const PRESET_NAMES: [&str; 6] = [
    "authentik",
    "gitlab",
    "mattermost",
    "nginx",
    "pomerium",
    "traefik",
];

/// Named pattern bundles for common services.
fn preset_patterns(preset: &str) -> Option<Vec<MetadataPattern>> {
    let patterns = match preset {
        "traefik" | "nginx" => vec![
            reload_pattern("etc/traefik/**", "traefik.service"),
            reload_pattern("etc/rave/overrides/traefik/**/*.yaml", "traefik.service"),
            reload_pattern("etc/nginx/**", "traefik.service"),
            reload_pattern("etc/rave/overrides/nginx/**/*.conf", "traefik.service"),
        ],
        "gitlab" => vec![
            restart_pattern("etc/gitlab/**", &["gitlab.target"], "file"),
            restart_pattern("var/opt/gitlab/**", &["gitlab.target"], "file"),
        ],
        "mattermost" => vec![
            restart_pattern("etc/mattermost/**", &["mattermost.service"], "file"),
            restart_pattern("var/lib/mattermost/**", &["mattermost.service"], "file"),
        ],
        "pomerium" => vec![restart_pattern(
            "etc/pomerium/**",
            &["pomerium.service"],
            "file",
        )],
        "authentik" => vec![
            restart_pattern(
                "etc/authentik/**",
                &["authentik-server.service", "authentik-worker.service"],
                "file",
            ),
            MetadataPattern {
                glob: Some("etc/systemd/system/authentik-*.service".to_string()),
                daemon_reload: Some(true),
                restart_units: Some(vec![
                    "authentik-server.service".to_string(),
                    "authentik-worker.service".to_string(),
                ]),
                scope: vec!["systemd".to_string()],
                ..MetadataPattern::default()
            },
        ],
        _ => return None,
    };
    Some(patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, OverrideStore) {
        let dir = TempDir::new().unwrap();
        let store = OverrideStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_ensure_initialized_creates_global_layer() {
        let (_dir, store) = store();
        assert!(store.ensure_initialized().unwrap());
        let layers = store.list_layers().unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].name, "global");
        assert_eq!(layers[0].priority, DEFAULT_LAYER_PRIORITY);
        assert!(layers[0].files_dir.exists());
        assert!(layers[0].systemd_dir.exists());
        // Second run is a no-op.
        assert!(!store.ensure_initialized().unwrap());
    }

    #[test]
    fn test_create_layer_rejects_duplicates() {
        let (_dir, store) = store();
        store.create_layer("edge", 50, "", None, &[]).unwrap();
        let err = store.create_layer("edge", 60, "", None, &[]).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_create_layer_normalizes_name() {
        let (_dir, store) = store();
        let layer = store.create_layer("my layer", 10, "", None, &[]).unwrap();
        assert_eq!(layer.name, "my-layer");
    }

    #[test]
    fn test_layers_sorted_by_priority_then_name() {
        let (_dir, store) = store();
        store.create_layer("zeta", 10, "", None, &[]).unwrap();
        store.create_layer("alpha", 10, "", None, &[]).unwrap();
        store.create_layer("base", 5, "", None, &[]).unwrap();
        let names: Vec<String> = store
            .list_layers()
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec!["base", "alpha", "zeta", "global"]);
    }

    #[test]
    fn test_presets_extend_metadata() {
        let (_dir, store) = store();
        let layer = store
            .create_layer("chat", 20, "", None, &["mattermost".to_string()])
            .unwrap();
        let resolved = layer
            .metadata
            .resolve("etc/mattermost/config.json", "file");
        assert!(resolved
            .restart_units
            .contains(&"mattermost.service".to_string()));
    }

    #[test]
    fn test_unknown_preset_rejected() {
        let (_dir, store) = store();
        let err = store
            .create_layer("x", 20, "", None, &["nope".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_get_layer_not_found() {
        let (_dir, store) = store();
        store.ensure_initialized().unwrap();
        assert!(matches!(
            store.get_layer("missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_copy_from_carries_metadata() {
        let (_dir, store) = store();
        store
            .create_layer("edge", 10, "", None, &["gitlab".to_string()])
            .unwrap();
        let copy = store
            .create_layer("edge2", 20, "", Some("edge"), &[])
            .unwrap();
        let resolved = copy.metadata.resolve("etc/gitlab/gitlab.rb", "file");
        assert!(resolved.restart_units.contains(&"gitlab.target".to_string()));
    }
}
