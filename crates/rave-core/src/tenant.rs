use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::naming;

/// Tenant VM lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Created,
    Stopped,
    Running,
    Error,
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Age-key installation state recorded at create time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsMeta {
    pub age_key_path: PathBuf,
    pub age_key_installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_key_embed_error: Option<String>,
}

/// TLS material bookkeeping for the tenant's reverse proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// External identity-provider wiring recorded at create time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdpMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

/// Persisted per-tenant VM record, one JSON file per tenant.
///
/// The record is the source of truth between CLI invocations; the manager
/// loads it, mutates it, and persists it atomically. `ports` maps logical
/// forward names (http, https, ssh, test, plus data-plane services) to the
/// allocated host ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub name: String,
    pub image_path: PathBuf,
    pub profile: String,
    pub profile_attr: String,
    pub keypair_path: PathBuf,
    pub ssh_public_key: String,
    pub ports: BTreeMap<String, u16>,
    pub status: TenantStatus,
    pub created_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_configured: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<SecretsMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp: Option<IdpMeta>,
}

impl TenantRecord {
    /// Schema validation applied on every load and save.
    pub fn validate(&self) -> Result<()> {
        naming::validate_name(&self.name, "tenant")?;

        if self.ports.is_empty() {
            return Err(Error::validation(format!(
                "tenant '{}' has no port assignments",
                self.name
            )));
        }
        for (service, port) in &self.ports {
            if *port == 0 {
                return Err(Error::validation(format!(
                    "tenant '{}' port '{service}' is out of range",
                    self.name
                )));
            }
        }

        let mut seen = std::collections::BTreeMap::new();
        for (service, port) in &self.ports {
            if let Some(other) = seen.insert(*port, service) {
                return Err(Error::validation(format!(
                    "tenant '{}' assigns port {port} to both '{other}' and '{service}'",
                    self.name
                )));
            }
        }

        Ok(())
    }

    /// Host SSH port for this tenant.
    pub fn ssh_port(&self) -> Result<u16> {
        self.ports.get("ssh").copied().ok_or_else(|| {
            Error::internal(format!("tenant '{}' record has no ssh port", self.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TenantRecord {
        TenantRecord {
            name: "acme".into(),
            image_path: PathBuf::from("/var/lib/rave/acme-development.qcow2"),
            profile: "development".into(),
            profile_attr: "development".into(),
            keypair_path: PathBuf::from("/home/op/.ssh/id_ed25519"),
            ssh_public_key: "ssh-ed25519 AAAA test@host".into(),
            ports: BTreeMap::from([
                ("http".to_string(), 8081),
                ("https".to_string(), 8443),
                ("ssh".to_string(), 2224),
                ("test".to_string(), 8889),
            ]),
            status: TenantStatus::Stopped,
            created_at: 1_700_000_000.0,
            started_at: None,
            ssh_key_configured: None,
            secrets: None,
            tls: None,
            idp: None,
        }
    }

    #[test]
    fn test_valid_record_roundtrip() {
        let rec = record();
        rec.validate().unwrap();
        let json = serde_json::to_string_pretty(&rec).unwrap();
        let back: TenantRecord = serde_json::from_str(&json).unwrap();
        back.validate().unwrap();
        assert_eq!(back.name, rec.name);
        assert_eq!(back.ports, rec.ports);
        assert_eq!(back.status, TenantStatus::Stopped);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TenantStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let mut rec = record();
        rec.ports.insert("test".into(), 8081);
        assert!(matches!(rec.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut rec = record();
        rec.ports.insert("http".into(), 0);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_bad_name_rejected() {
        let mut rec = record();
        rec.name = "-bad".into();
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_optional_sections_omitted_from_json() {
        let rec = record();
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("secrets"));
        assert!(!json.contains("tls"));
        assert!(!json.contains("idp"));
    }
}
