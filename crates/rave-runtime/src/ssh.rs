use std::time::Duration;

use rave_core::retry::Backoff;
use rave_core::tenant::TenantRecord;
use rave_core::{Error, Result};
use tracing::debug;

use crate::process::{self, ProcessOutput, RunOptions};

/// Development fallback password for the root account when no keypair is
/// usable. Matches the image's debug build; key auth is always preferred.
pub const DEBUG_ROOT_PASSWORD: &str = "debug123";

/// Bootstrap account used for runtime key installation before root key
/// auth is available.
pub const BOOTSTRAP_ACCOUNT: &str = "agent";
pub const BOOTSTRAP_PASSWORD: &str = "agent";

/// Options for retried remote script execution.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub timeout: Duration,
    /// Human description used in log and error messages.
    pub description: String,
    pub connect_timeout: Duration,
    pub backoff: Backoff,
}

impl SshOptions {
    pub fn new(timeout: Duration, description: impl Into<String>) -> Self {
        Self {
            timeout,
            description: description.into(),
            connect_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Build the SSH argv for running a script as root on the tenant VM.
///
/// Uses key authentication when the keypair file exists; otherwise falls
/// back to sshpass with the debug password, or fails if sshpass is missing.
pub fn build_ssh_command(
    record: &TenantRecord,
    remote_script: &str,
    connect_timeout: Duration,
) -> Result<Vec<String>> {
    let ssh_port = record.ssh_port()?;

    let mut common = vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs()),
        "-p".to_string(),
        ssh_port.to_string(),
        "root@localhost".to_string(),
        "bash".to_string(),
        "-lc".to_string(),
        remote_script.to_string(),
    ];

    if record.keypair_path.exists() {
        let mut cmd = vec![
            "ssh".to_string(),
            "-i".to_string(),
            record.keypair_path.display().to_string(),
        ];
        cmd.append(&mut common);
        return Ok(cmd);
    }

    if which::which("sshpass").is_err() {
        return Err(Error::resource(
            "sshpass not available; provide an SSH keypair for VM access",
        ));
    }

    let mut cmd = vec![
        "sshpass".to_string(),
        "-p".to_string(),
        DEBUG_ROOT_PASSWORD.to_string(),
        "ssh".to_string(),
    ];
    cmd.append(&mut common);
    Ok(cmd)
}

/// Execute a remote script over SSH with exponential backoff.
///
/// Any non-zero exit or spawn failure counts as a failed attempt; the last
/// error text is surfaced once attempts are exhausted.
pub async fn run_remote_script(
    record: &TenantRecord,
    remote_script: &str,
    opts: &SshOptions,
) -> Result<ProcessOutput> {
    run_remote_inner(record, remote_script, opts, None).await
}

/// Execute a remote script while piping `data` to its stdin.
/// Used to deliver override layer tarballs.
pub async fn run_remote_stream(
    record: &TenantRecord,
    remote_script: &str,
    data: &[u8],
    opts: &SshOptions,
) -> Result<ProcessOutput> {
    run_remote_inner(record, remote_script, opts, Some(data)).await
}

async fn run_remote_inner(
    record: &TenantRecord,
    remote_script: &str,
    opts: &SshOptions,
    data: Option<&[u8]>,
) -> Result<ProcessOutput> {
    let cmd = build_ssh_command(record, remote_script, opts.connect_timeout)?;
    let argv: Vec<&str> = cmd.iter().map(String::as_str).collect();

    rave_core::retry::retry(opts.backoff, &opts.description, || {
        let argv = argv.clone();
        let run_opts = RunOptions {
            timeout: Some(opts.timeout),
            stdin: data.map(|d| d.to_vec()),
            ..RunOptions::default()
        };
        let description = opts.description.clone();
        async move {
            let output = process::run(&argv, run_opts).await?;
            if output.success() {
                return Ok(output);
            }
            let detail = output.first_output();
            debug!(
                returncode = output.returncode,
                detail = %detail,
                "remote script attempt failed"
            );
            Err(Error::transient(if detail.is_empty() {
                format!("{description} failed with exit code {}", output.returncode)
            } else {
                detail
            }))
        }
    })
    .await
}

/// Probe SSH connectivity with a trivial remote command, returning the argv
/// that worked so the caller can exec into an interactive session.
pub async fn probe_interactive_command(record: &TenantRecord) -> Result<Vec<String>> {
    let connect = Duration::from_secs(10);
    let known_host_flags = [
        "-F",
        "/dev/null",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "GlobalKnownHostsFile=/dev/null",
        "-o",
        "ConnectTimeout=10",
    ];
    let ssh_port = record.ssh_port()?.to_string();

    if record.keypair_path.exists() {
        let keypair = record.keypair_path.display().to_string();
        let mut cmd: Vec<String> = vec!["ssh".into(), "-i".into(), keypair];
        cmd.extend(known_host_flags.iter().map(|s| s.to_string()));
        cmd.extend([
            "-o".to_string(),
            "PasswordAuthentication=no".to_string(),
            "-p".to_string(),
            ssh_port.clone(),
            "root@localhost".to_string(),
        ]);

        if probe(&cmd, connect).await {
            return Ok(cmd);
        }
        debug!("SSH key auth probe failed, trying password fallback");
    }

    if which::which("sshpass").is_err() {
        return Err(Error::resource(
            "sshpass not available; provide an SSH keypair for VM access",
        ));
    }

    let mut cmd: Vec<String> = vec![
        "sshpass".into(),
        "-p".into(),
        DEBUG_ROOT_PASSWORD.into(),
        "ssh".into(),
    ];
    cmd.extend(known_host_flags.iter().map(|s| s.to_string()));
    cmd.extend([
        "-o".to_string(),
        "PreferredAuthentications=password".to_string(),
        "-p".to_string(),
        ssh_port,
        "root@localhost".to_string(),
    ]);

    if probe(&cmd, connect).await {
        return Ok(cmd);
    }

    Err(Error::transient(
        "SSH connection failed with both key and password authentication",
    ))
}

async fn probe(base_cmd: &[String], connect: Duration) -> bool {
    let mut cmd: Vec<&str> = base_cmd.iter().map(String::as_str).collect();
    cmd.extend(["echo", "ok"]);
    matches!(
        process::run(&cmd, RunOptions::with_timeout(connect + Duration::from_secs(5))).await,
        Ok(out) if out.success()
    )
}

/// Replace the current process with an interactive command (SSH/TTY).
/// exec() only returns on error; arguments are passed as an array, never
/// through a shell.
#[cfg(unix)]
pub fn replace_process(argv: &[String]) -> Result<()> {
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::internal("empty command"))?;

    let err = Command::new(program).args(args).exec();
    Err(Error::internal(format!(
        "failed to exec {}: {err}",
        argv.join(" ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use rave_core::tenant::TenantStatus;

    fn record(keypair: PathBuf) -> TenantRecord {
        TenantRecord {
            name: "acme".into(),
            image_path: PathBuf::from("/tmp/acme.qcow2"),
            profile: "development".into(),
            profile_attr: "development".into(),
            keypair_path: keypair,
            ssh_public_key: "ssh-ed25519 AAAA".into(),
            ports: BTreeMap::from([("ssh".to_string(), 2224)]),
            status: TenantStatus::Running,
            created_at: 0.0,
            started_at: None,
            ssh_key_configured: None,
            secrets: None,
            tls: None,
            idp: None,
        }
    }

    #[test]
    fn test_key_auth_command_shape() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, "key material").unwrap();

        let cmd =
            build_ssh_command(&record(key.clone()), "uptime", Duration::from_secs(10)).unwrap();
        assert_eq!(cmd[0], "ssh");
        assert_eq!(cmd[1], "-i");
        assert_eq!(cmd[2], key.display().to_string());
        assert!(cmd.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(cmd.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert!(cmd.contains(&"2224".to_string()));
        assert_eq!(cmd.last().unwrap(), "uptime");
        // Script rides behind bash -lc as a single argv element.
        let idx = cmd.iter().position(|a| a == "bash").unwrap();
        assert_eq!(cmd[idx + 1], "-lc");
    }

    #[test]
    fn test_password_fallback_requires_sshpass() {
        let missing = PathBuf::from("/nonexistent/keypair");
        let result = build_ssh_command(&record(missing), "uptime", Duration::from_secs(10));
        match result {
            Ok(cmd) => assert_eq!(cmd[0], "sshpass"),
            Err(e) => assert!(matches!(e, Error::Resource(_))),
        }
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_last_error() {
        // Point "ssh" at a keypair that exists but an unreachable port so the
        // command itself fails fast; verify the transient classification.
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, "key material").unwrap();
        let mut rec = record(key);
        rec.ports.insert("ssh".into(), 1); // closed port

        let opts = SshOptions::new(Duration::from_secs(5), "probing closed port").with_backoff(
            Backoff {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        );
        let err = run_remote_script(&rec, "true", &opts).await.unwrap_err();
        assert!(err.is_transient() || matches!(err, Error::Resource(_)));
    }
}
