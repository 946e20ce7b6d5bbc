use std::path::Path;
use std::time::Duration;

use base64::Engine;
use rave_core::retry::Backoff;
use rave_core::tenant::TlsMeta;
use rave_core::{time, Error, Result};

use crate::ssh::{self, SshOptions};
use crate::vm::manager::VmManager;

/// One secret file destined for the guest.
#[derive(Debug, Clone)]
pub struct SecretEntry {
    pub remote_path: String,
    pub content: String,
    pub owner: String,
    pub group: String,
    pub mode: String,
    pub dir_mode: String,
}

impl SecretEntry {
    pub fn new(remote_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            content: content.into(),
            owner: "root".into(),
            group: "root".into(),
            mode: "0600".into(),
            dir_mode: "0700".into(),
        }
    }

    pub fn with_ownership(mut self, owner: &str, group: &str) -> Self {
        self.owner = owner.to_string();
        self.group = group.to_string();
        self
    }

    pub fn with_modes(mut self, mode: &str, dir_mode: &str) -> Self {
        self.mode = mode.to_string();
        self.dir_mode = dir_mode.to_string();
        self
    }
}

impl VmManager {
    /// Install the sops-nix Age key on a running VM.
    pub async fn install_age_key(
        &self,
        name: &str,
        key_file: &Path,
        remote_path: &str,
    ) -> Result<String> {
        let record = self.load_running(name)?;

        if !key_file.exists() {
            return Err(Error::not_found(format!(
                "age key file not found: {}",
                key_file.display()
            )));
        }
        let key_text = std::fs::read_to_string(key_file)?;
        let key_text = key_text.trim();
        if key_text.is_empty() {
            return Err(Error::validation("age key file is empty"));
        }

        let remote_file = Path::new(remote_path);
        let remote_dir = remote_file
            .parent()
            .ok_or_else(|| Error::validation("remote path has no parent directory"))?;
        let dir_q = quote(&remote_dir.display().to_string())?;
        let file_q = quote(remote_path)?;

        let remote_script = format!(
            "set -euo pipefail\n\
             install -d -m 700 -o root -g root {dir_q}\n\
             cat <<'EOF' > {file_q}\n\
             {key_text}\n\
             EOF\n\
             chmod 600 {file_q}\n\
             chown root:root {file_q}\n"
        );

        let opts = SshOptions::new(Duration::from_secs(240), "installing age key").with_backoff(
            Backoff {
                max_attempts: 8,
                initial_delay: Duration::from_millis(1500),
                max_delay: Duration::from_secs(16),
            },
        );
        ssh::run_remote_script(&record, &remote_script, &opts).await?;
        Ok(remote_path.to_string())
    }

    /// Install one or more secret files with a single SSH session.
    ///
    /// Contents travel base64-encoded inside quoted heredocs so arbitrary
    /// payload bytes never meet the shell.
    pub async fn install_secret_files(&self, name: &str, entries: &[SecretEntry]) -> Result<()> {
        let record = self.load_running(name)?;

        let secrets: Vec<&SecretEntry> =
            entries.iter().filter(|e| !e.content.is_empty()).collect();
        if secrets.is_empty() {
            return Ok(());
        }

        let mut lines = vec!["set -euo pipefail".to_string()];
        for secret in secrets {
            let remote_file = Path::new(&secret.remote_path);
            let remote_dir = remote_file
                .parent()
                .ok_or_else(|| Error::validation("remote path has no parent directory"))?;
            let dir_q = quote(&remote_dir.display().to_string())?;
            let file_q = quote(&secret.remote_path)?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(&secret.content);

            lines.push(format!(
                "install -d -m {dir_mode} -o {owner} -g {group} {dir_q}",
                dir_mode = secret.dir_mode,
                owner = secret.owner,
                group = secret.group,
            ));
            lines.push(format!("base64 -d <<'EOF' > {file_q}"));
            lines.push(encoded);
            lines.push("EOF".to_string());
            lines.push(format!("chmod {} {file_q}", secret.mode));
            lines.push(format!(
                "chown {}:{} {file_q}",
                secret.owner, secret.group
            ));
        }
        let remote_script = lines.join("\n") + "\n";

        let opts = SshOptions::new(Duration::from_secs(600), "installing secret files");
        ssh::run_remote_script(&record, &remote_script, &opts).await?;
        Ok(())
    }

    /// Copy TLS materials into the VM for the edge router.
    pub async fn install_tls_certificate(
        &self,
        name: &str,
        fullchain_pem: &str,
        key_pem: &str,
        ca_pem: &str,
    ) -> Result<()> {
        let entries = [
            SecretEntry::new("/var/lib/acme/localhost/cert.pem", fullchain_pem)
                .with_modes("0644", "0755"),
            SecretEntry::new("/var/lib/acme/localhost/fullchain.pem", fullchain_pem)
                .with_modes("0644", "0755"),
            SecretEntry::new("/var/lib/acme/localhost/chain.pem", ca_pem).with_modes("0644", "0755"),
            SecretEntry::new("/var/lib/acme/localhost/key.pem", key_pem)
                .with_ownership("root", "traefik")
                .with_modes("0640", "0750"),
        ];
        self.install_secret_files(name, &entries).await
    }

    /// Merge TLS metadata into the tenant record.
    pub fn record_tls_metadata(&self, name: &str, metadata: TlsMeta) -> Result<()> {
        let mut record = self.load(name)?;
        let mut tls = record.tls.take().unwrap_or_default();
        if metadata.issuer.is_some() {
            tls.issuer = metadata.issuer;
        }
        if metadata.domains.is_some() {
            tls.domains = metadata.domains;
        }
        if metadata.expires_at.is_some() {
            tls.expires_at = metadata.expires_at;
        }
        tls.updated_at = Some(time::utc_now());
        record.tls = Some(tls);
        self.store().save(&record)
    }
}

fn quote(value: &str) -> Result<String> {
    shlex::try_quote(value)
        .map(|q| q.into_owned())
        .map_err(|_| Error::validation(format!("path is not shell-safe: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_entry_defaults() {
        let entry = SecretEntry::new("/etc/app/secret", "value");
        assert_eq!(entry.owner, "root");
        assert_eq!(entry.mode, "0600");
        assert_eq!(entry.dir_mode, "0700");
    }

    #[test]
    fn test_quote_escapes_spaces() {
        assert_eq!(quote("/etc/my dir/file").unwrap(), "'/etc/my dir/file'");
        assert_eq!(quote("/etc/plain").unwrap(), "/etc/plain");
    }
}
