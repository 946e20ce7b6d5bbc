use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Host-side CLI settings. Values come from the environment (`RAVE_*`)
/// with documented defaults; config-file loading stays outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub default_profile: String,
    pub config_dir: PathBuf,
    pub port_http: u16,
    pub port_https: u16,
    pub port_ssh: u16,
    pub port_test: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_profile: "development".to_string(),
            config_dir: default_config_dir(),
            port_http: 8081,
            port_https: 8443,
            port_ssh: 2224,
            port_test: 8889,
        }
    }
}

impl Settings {
    /// Read settings from `RAVE_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        let mut s = Self::default();
        if let Ok(v) = std::env::var("RAVE_DEFAULT_PROFILE") {
            if !v.is_empty() {
                s.default_profile = v;
            }
        }
        if let Ok(v) = std::env::var("RAVE_CONFIG_DIR") {
            if !v.is_empty() {
                s.config_dir = PathBuf::from(v);
            }
        }
        for (var, slot) in [
            ("RAVE_PORT_HTTP", &mut s.port_http),
            ("RAVE_PORT_HTTPS", &mut s.port_https),
            ("RAVE_PORT_SSH", &mut s.port_ssh),
            ("RAVE_PORT_TEST", &mut s.port_test),
        ] {
            if let Ok(v) = std::env::var(var) {
                if let Ok(port) = v.parse() {
                    *slot = port;
                }
            }
        }
        s
    }

    /// Preferred host ports keyed by logical forward name.
    pub fn port_config(&self) -> BTreeMap<String, u16> {
        BTreeMap::from([
            ("http".to_string(), self.port_http),
            ("https".to_string(), self.port_https),
            ("ssh".to_string(), self.port_ssh),
            ("test".to_string(), self.port_test),
        ])
    }

    /// Directory holding per-tenant VM records.
    pub fn vms_dir(&self) -> PathBuf {
        self.config_dir.join("vms")
    }
}

fn default_config_dir() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/etc"));
    base.join("rave")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let s = Settings::default();
        let ports = s.port_config();
        assert_eq!(ports["http"], 8081);
        assert_eq!(ports["https"], 8443);
        assert_eq!(ports["ssh"], 2224);
        assert_eq!(ports["test"], 8889);
    }

    #[test]
    fn test_vms_dir_under_config() {
        let s = Settings {
            config_dir: PathBuf::from("/tmp/rave-test"),
            ..Settings::default()
        };
        assert_eq!(s.vms_dir(), PathBuf::from("/tmp/rave-test/vms"));
    }
}
