use std::path::Path;
use std::time::Duration;

use rave_core::tenant::TenantRecord;
use rave_core::{Error, Result};
use tracing::{info, warn};

use crate::process::{self, RunOptions};

/// How SSH key material ended up available to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionMethod {
    /// Written into the disk image offline via guestfish.
    Guestfish,
    /// Offline injection unavailable; the SSH client installs the key at
    /// runtime through the bootstrap account.
    RuntimeAuth,
}

const GUESTFISH_TIMEOUT: Duration = Duration::from_secs(300);
const DISK_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

/// Create a fresh qcow2 disk: raw allocation, ext4 labelled `nixos`,
/// converted to qcow2 and world-readable for the launcher.
pub async fn create_blank_disk(target: &Path, size_gb: u32) -> Result<()> {
    let qemu_img = which::which("qemu-img")
        .map_err(|_| Error::resource("required tooling missing: qemu-img"))?;
    let mkfs = which::which("mkfs.ext4")
        .map_err(|_| Error::resource("required tooling missing: mkfs.ext4"))?;

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let raw = tempfile::Builder::new()
        .prefix("rave-disk-")
        .suffix(".raw")
        .tempfile()?;
    let raw_path = raw.path().display().to_string();
    let qemu_img = qemu_img.display().to_string();
    let mkfs = mkfs.display().to_string();
    let target_str = target.display().to_string();
    let size = format!("{size_gb}G");

    process::run_checked(
        &[&qemu_img, "create", "-f", "raw", &raw_path, &size],
        RunOptions::with_timeout(DISK_TOOL_TIMEOUT),
    )
    .await?;
    process::run_checked(
        &[&mkfs, "-F", "-L", "nixos", &raw_path],
        RunOptions::with_timeout(DISK_TOOL_TIMEOUT),
    )
    .await?;
    process::run_checked(
        &[
            &qemu_img, "convert", "-f", "raw", "-O", "qcow2", &raw_path, &target_str,
        ],
        RunOptions::with_timeout(DISK_TOOL_TIMEOUT),
    )
    .await?;

    set_mode(target, 0o644)?;
    Ok(())
}

/// Inject an SSH public key into the image's root account via guestfish.
///
/// Falls back to runtime installation when guestfish is unavailable or
/// fails; offline injection is an optimization, not a requirement.
pub async fn inject_ssh_key(image: &Path, ssh_public_key: &str) -> Result<InjectionMethod> {
    if which::which("guestfish").is_err() {
        info!("guestfish not available; deferring SSH key to runtime auth");
        return Ok(InjectionMethod::RuntimeAuth);
    }

    let escaped_key = ssh_public_key.replace('"', "\\\"");
    let script = format!(
        "launch\n\
         list-filesystems\n\
         mount /dev/sda1 /\n\
         mkdir-p /root/.ssh\n\
         write /root/.ssh/authorized_keys \"{escaped_key}\\n\"\n\
         chmod 0700 /root/.ssh\n\
         chmod 0600 /root/.ssh/authorized_keys\n\
         chown 0 0 /root/.ssh\n\
         chown 0 0 /root/.ssh/authorized_keys\n\
         sync\n\
         umount /\n\
         exit\n"
    );

    let image_str = image.display().to_string();
    let opts = RunOptions {
        timeout: Some(GUESTFISH_TIMEOUT),
        stdin: Some(script.into_bytes()),
        ..RunOptions::default()
    };
    match process::run(&["guestfish", "--add", &image_str, "--rw"], opts).await {
        Ok(out) if out.success() => Ok(InjectionMethod::Guestfish),
        Ok(out) => {
            warn!(detail = %out.first_output(), "guestfish injection failed");
            Ok(InjectionMethod::RuntimeAuth)
        }
        Err(e) => {
            warn!(error = %e, "guestfish unavailable at runtime");
            Ok(InjectionMethod::RuntimeAuth)
        }
    }
}

/// Embed the sops-nix Age key into the image so secrets decrypt on first
/// boot. Unlike SSH keys there is no runtime fallback baked in here; the
/// caller records the failure and installs the key post-boot instead.
pub async fn install_age_key(image: &Path, age_key_path: &Path) -> Result<()> {
    if !age_key_path.exists() {
        return Err(Error::not_found(format!(
            "age key not found at {}",
            age_key_path.display()
        )));
    }
    if which::which("guestfish").is_err() {
        return Err(Error::resource(
            "guestfish is not installed; install libguestfs-tools to embed the age key during image build",
        ));
    }

    let key_bytes = std::fs::read(age_key_path).map_err(|e| {
        Error::resource(format!("failed to read age key: {e}"))
    })?;
    let staged = tempfile::Builder::new().prefix("rave-age-key-").tempfile()?;
    std::fs::write(staged.path(), key_bytes)?;

    let remote_path = "/var/lib/sops-nix/key.txt";
    let script = format!(
        "launch\n\
         list-filesystems\n\
         mount /dev/disk/by-label/nixos /\n\
         mkdir-p /var/lib/sops-nix\n\
         upload {staged} {remote_path}\n\
         chmod 0700 /var/lib/sops-nix\n\
         chmod 0400 {remote_path}\n\
         chown 0 0 /var/lib/sops-nix\n\
         chown 0 0 {remote_path}\n\
         sync\n\
         umount /\n\
         exit\n",
        staged = staged.path().display(),
    );

    let image_str = image.display().to_string();
    let opts = RunOptions {
        timeout: Some(GUESTFISH_TIMEOUT),
        stdin: Some(script.into_bytes()),
        ..RunOptions::default()
    };
    let out = process::run(&["guestfish", "--add", &image_str, "--rw"], opts).await?;
    if !out.success() {
        let detail = out.first_output();
        return Err(Error::resource(if detail.is_empty() {
            "guestfish failed to install age key".to_string()
        } else {
            format!("guestfish failed to install age key: {detail}")
        }));
    }
    Ok(())
}

/// Install the root authorized key through the bootstrap account on a
/// freshly booted VM. Retries across the boot window.
pub async fn ensure_runtime_root_key(record: &TenantRecord) -> Result<bool> {
    let public_key = record.ssh_public_key.trim();
    if public_key.is_empty() {
        return Ok(false);
    }
    if which::which("sshpass").is_err() {
        warn!("sshpass not available - skipping automatic SSH key provisioning");
        return Ok(false);
    }

    let ssh_port = record.ssh_port()?.to_string();
    let escaped_key = public_key.replace('\'', "'\"'\"'");
    let remote_cmd = format!(
        "sudo mkdir -p /root/.ssh && \
         sudo sh -c \"grep -qxF '{escaped_key}' /root/.ssh/authorized_keys || echo '{escaped_key}' >> /root/.ssh/authorized_keys\" && \
         sudo chmod 700 /root/.ssh && sudo chmod 600 /root/.ssh/authorized_keys"
    );

    let target = format!("{}@localhost", crate::ssh::BOOTSTRAP_ACCOUNT);
    let argv = [
        "sshpass",
        "-p",
        crate::ssh::BOOTSTRAP_PASSWORD,
        "ssh",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "ConnectTimeout=10",
        "-p",
        &ssh_port,
        &target,
        &remote_cmd,
    ];

    let max_attempts = 30;
    for attempt in 1..=max_attempts {
        let result = process::run(&argv, RunOptions::with_timeout(Duration::from_secs(30))).await;
        if matches!(&result, Ok(out) if out.success()) {
            return Ok(true);
        }
        info!(attempt, max_attempts, "waiting for VM SSH to accept key injection");
        if attempt < max_attempts {
            tokio::time::sleep(Duration::from_secs(6)).await;
        }
    }

    warn!("unable to inject SSH key automatically; password login may be required");
    Ok(false)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
