use std::path::{Path, PathBuf};

use rave_core::{Error, Result};
use serde::Deserialize;

/// Bridge daemon configuration, loaded from TOML.
///
/// Security-sensitive keys have no defaults and must be present; the
/// rest fall back to conservative local-only values.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// External identity provider base URL.
    pub idp_url: String,
    pub oidc_client_id: String,
    pub oidc_client_secret: String,
    /// Chat homeserver base URL for outbound replies.
    pub homeserver_url: String,
    /// Appservice token expected on inbound requests.
    pub as_token: String,
    /// Token used when calling the homeserver.
    pub hs_token: String,

    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_allowed_agent_services")]
    pub allowed_agent_services: Vec<String>,
    #[serde(default = "default_agent_service_prefix")]
    pub agent_service_prefix: String,
    #[serde(default = "default_audit_log_file")]
    pub audit_log_file: PathBuf,
    /// Hex-encoded persistent HMAC key for audit integrity. Generated
    /// per process when unset.
    #[serde(default)]
    pub audit_hmac_key: Option<String>,
}

fn default_host() -> String {
    // Local binding only; the fronting proxy terminates external traffic.
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_max_request_size() -> usize {
    1024 * 1024
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_rate_limit_rpm() -> u32 {
    30
}
fn default_rate_limit_burst() -> u32 {
    5
}
fn default_allowed_commands() -> Vec<String> {
    ["start-agent", "stop-agent", "status-agent", "list-agents", "help"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_allowed_agent_services() -> Vec<String> {
    [
        "backend-architect",
        "frontend-developer",
        "test-writer-fixer",
        "ui-designer",
        "devops-automator",
        "api-tester",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_agent_service_prefix() -> String {
    "rave-agent-".to_string()
}
fn default_audit_log_file() -> PathBuf {
    PathBuf::from("/var/log/rave-bridge/audit.log")
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::resource(format!("failed to read config {}: {e}", path.display()))
        })?;
        let config: BridgeConfig = toml::from_str(&text)
            .map_err(|e| Error::validation(format!("invalid bridge config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("idp_url", &self.idp_url),
            ("oidc_client_id", &self.oidc_client_id),
            ("oidc_client_secret", &self.oidc_client_secret),
            ("homeserver_url", &self.homeserver_url),
            ("as_token", &self.as_token),
            ("hs_token", &self.hs_token),
        ] {
            if value.is_empty() {
                return Err(Error::validation(format!(
                    "missing required config key: {field}"
                )));
            }
        }
        Ok(())
    }

    /// Decode the configured audit HMAC key.
    pub fn audit_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        match &self.audit_hmac_key {
            None => Ok(None),
            Some(hex) => {
                if hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(Error::validation("audit_hmac_key must be hex"));
                }
                let bytes = (0..hex.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
                    .collect();
                Ok(Some(bytes))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        idp_url = "https://gitlab.example.com"
        oidc_client_id = "client"
        oidc_client_secret = "secret"
        homeserver_url = "https://matrix.example.com"
        as_token = "as-token"
        hs_token = "hs-token"
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: BridgeConfig = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.rate_limit_rpm, 30);
        assert_eq!(config.rate_limit_burst, 5);
        assert_eq!(config.max_request_size, 1024 * 1024);
        assert_eq!(config.allowed_commands.len(), 5);
        assert_eq!(config.agent_service_prefix, "rave-agent-");
    }

    #[test]
    fn test_missing_required_key_rejected() {
        let config: std::result::Result<BridgeConfig, _> =
            toml::from_str("host = \"0.0.0.0\"");
        assert!(config.is_err());
    }

    #[test]
    fn test_empty_required_key_rejected() {
        let text = MINIMAL.replace("\"as-token\"", "\"\"");
        let config: BridgeConfig = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_audit_key_decoding() {
        let mut config: BridgeConfig = toml::from_str(MINIMAL).unwrap();
        assert!(config.audit_key_bytes().unwrap().is_none());
        config.audit_hmac_key = Some("00ff10".to_string());
        assert_eq!(config.audit_key_bytes().unwrap().unwrap(), vec![0x00, 0xff, 0x10]);
        config.audit_hmac_key = Some("xyz".to_string());
        assert!(config.audit_key_bytes().is_err());
    }
}
