use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rave_core::settings::Settings;
use rave_overlay::{package, OverrideStore, DEFAULT_LAYER_PRIORITY};
use rave_runtime::launcher;
use rave_runtime::vm::secrets::SecretEntry;
use rave_runtime::vm::{CreateRequest, VmManager};

use crate::ui;

#[derive(Parser)]
#[command(
    name = "rave",
    version,
    about = "Multi-tenant DevOps appliance VM orchestrator"
)]
struct Cli {
    /// Emit machine-readable JSON instead of human output where supported.
    #[arg(long, short = 'o', global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tenant VMs
    Vm {
        #[command(subcommand)]
        action: VmCmd,
    },
    /// Manage override layers
    Override {
        #[command(subcommand)]
        action: OverrideCmd,
    },
    /// Install secret material into running VMs
    Secrets {
        #[command(subcommand)]
        action: SecretsCmd,
    },
    /// Check host prerequisites for VM operations
    Doctor,
}

#[derive(Subcommand)]
enum VmCmd {
    /// Create a tenant VM
    Create {
        name: String,
        /// SSH private key path; the matching .pub must exist
        #[arg(long)]
        keypair: PathBuf,
        #[arg(long, default_value = "development")]
        profile: String,
        /// Nix flake attribute to build; defaults to the profile name
        #[arg(long)]
        profile_attr: Option<String>,
        /// Existing image to copy when the build is skipped or fails
        #[arg(long)]
        default_image: Option<PathBuf>,
        /// Age key to embed for sops-nix secrets
        #[arg(long)]
        age_key: Option<PathBuf>,
        /// Skip the nix build and use the cached/default image
        #[arg(long)]
        skip_build: bool,
    },
    /// Start a tenant VM
    Start { name: String },
    /// Stop a tenant VM
    Stop { name: String },
    /// Reset a tenant VM to a blank disk
    Reset { name: String },
    /// Show status for one tenant, or all when omitted
    Status { name: Option<String> },
    /// Open an interactive SSH session
    Ssh { name: String },
    /// Stream guest service logs
    Logs {
        name: String,
        #[arg(long)]
        service: Option<String>,
        #[arg(long, short = 'f')]
        follow: bool,
        #[arg(long, default_value_t = 50)]
        tail: u32,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Install an Age key into a running VM
    InstallAgeKey {
        name: String,
        #[arg(long)]
        key_file: PathBuf,
        #[arg(long, default_value = "/var/lib/sops-nix/key.txt")]
        remote_path: String,
    },
    /// Delete a tenant VM and its disk image
    Delete { name: String },
}

#[derive(Subcommand)]
enum OverrideCmd {
    /// Create the overrides root and the global layer
    Init,
    /// Create a new override layer
    Create {
        name: String,
        #[arg(long, default_value_t = DEFAULT_LAYER_PRIORITY)]
        priority: i64,
        #[arg(long, default_value = "")]
        description: String,
        /// Copy metadata from an existing layer
        #[arg(long)]
        copy_from: Option<String>,
        /// Metadata presets to append (traefik, nginx, gitlab, mattermost, pomerium, authentik)
        #[arg(long)]
        preset: Vec<String>,
    },
    /// List configured layers
    List,
    /// Apply a layer to a running tenant VM
    Apply {
        tenant: String,
        layer: String,
        /// Skip unit restarts/reloads after applying files
        #[arg(long)]
        no_restarts: bool,
    },
    /// Preview what applying a layer would change
    Preview { tenant: String, layer: String },
}

#[derive(Subcommand)]
enum SecretsCmd {
    /// Install a single secret file on a running VM
    Install {
        tenant: String,
        #[arg(long)]
        remote_path: String,
        /// Local file holding the secret content
        #[arg(long)]
        from_file: PathBuf,
        #[arg(long, default_value = "root")]
        owner: String,
        #[arg(long, default_value = "root")]
        group: String,
        #[arg(long, default_value = "0600")]
        mode: String,
    },
}

fn manager(settings: &Settings) -> Result<VmManager> {
    let repo_root = std::env::current_dir()?;
    Ok(VmManager::new(
        settings.vms_dir(),
        repo_root,
        settings.port_config(),
    )?)
}

/// Parse argv and run the selected command. Returns the process exit code.
pub async fn run() -> i32 {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => 0,
        Err(e) => {
            ui::error(&format!("{e:#}"));
            1
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let settings = Settings::from_env();

    match cli.command {
        Commands::Vm { action } => vm_command(&settings, action, cli.json).await,
        Commands::Override { action } => override_command(&settings, action, cli.json).await,
        Commands::Secrets { action } => secrets_command(&settings, action).await,
        Commands::Doctor => doctor(),
    }
}

async fn vm_command(settings: &Settings, action: VmCmd, json: bool) -> Result<()> {
    let mgr = manager(settings)?;

    match action {
        VmCmd::Create {
            name,
            keypair,
            profile,
            profile_attr,
            default_image,
            age_key,
            skip_build,
        } => {
            let sp = ui::spinner(&format!("Creating VM '{name}'..."));
            let outcome = mgr
                .create(CreateRequest {
                    name: name.clone(),
                    keypair_path: keypair,
                    profile_attr: profile_attr.unwrap_or_else(|| profile.clone()),
                    profile,
                    default_image,
                    age_key_path: age_key,
                    custom_ports: BTreeMap::new(),
                    idp: None,
                    skip_build,
                })
                .await;
            sp.finish_and_clear();
            let outcome = outcome?;
            for warning in &outcome.warnings {
                ui::warn(warning);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.record)?);
            } else {
                ui::success(&format!("VM '{name}' created"));
                for (service, port) in &outcome.record.ports {
                    ui::info(&format!("  {service}: localhost:{port}"));
                }
            }
            Ok(())
        }
        VmCmd::Start { name } => {
            mgr.start(&name).await?;
            ui::success(&format!("VM '{name}' started"));
            Ok(())
        }
        VmCmd::Stop { name } => {
            mgr.stop(&name).await?;
            ui::success(&format!("VM '{name}' stopped"));
            Ok(())
        }
        VmCmd::Reset { name } => {
            let sp = ui::spinner(&format!("Resetting VM '{name}'..."));
            let warnings = mgr.reset(&name).await;
            sp.finish_and_clear();
            let warnings = warnings?;
            for warning in &warnings {
                ui::warn(warning);
            }
            ui::success(&format!("VM '{name}' reset"));
            Ok(())
        }
        VmCmd::Status { name } => {
            let statuses = match name {
                Some(name) => vec![mgr.status(&name)?],
                None => mgr.status_all()?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else if statuses.is_empty() {
                ui::info("no tenant VMs configured");
            } else {
                for status in statuses {
                    ui::info(&format!("{:<24} {}", status.name, status.status));
                }
            }
            Ok(())
        }
        VmCmd::Ssh { name } => mgr.ssh(&name).await.map_err(Into::into),
        VmCmd::Logs {
            name,
            service,
            follow,
            tail,
            since,
            all,
        } => mgr
            .logs(&name, service.as_deref(), follow, tail, since.as_deref(), all)
            .await
            .map_err(Into::into),
        VmCmd::InstallAgeKey {
            name,
            key_file,
            remote_path,
        } => {
            let path = mgr.install_age_key(&name, &key_file, &remote_path).await?;
            ui::success(&format!("age key installed at {path}"));
            Ok(())
        }
        VmCmd::Delete { name } => {
            mgr.delete(&name).await?;
            ui::success(&format!("VM '{name}' deleted"));
            Ok(())
        }
    }
}

async fn override_command(settings: &Settings, action: OverrideCmd, json: bool) -> Result<()> {
    let repo_root = std::env::current_dir()?;
    let store = OverrideStore::new(&repo_root);

    match action {
        OverrideCmd::Init => {
            let created = store.ensure_initialized()?;
            if created {
                ui::success("override layers initialized (global layer created)");
            } else {
                ui::info("override layers already initialized");
            }
            Ok(())
        }
        OverrideCmd::Create {
            name,
            priority,
            description,
            copy_from,
            preset,
        } => {
            let layer =
                store.create_layer(&name, priority, &description, copy_from.as_deref(), &preset)?;
            ui::success(&format!(
                "layer '{}' created at {} (priority {})",
                layer.name,
                layer.root.display(),
                layer.priority
            ));
            Ok(())
        }
        OverrideCmd::List => {
            let stats = store.layer_stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else if stats.is_empty() {
                ui::info("no override layers configured (run `rave override init`)");
            } else {
                for layer in stats {
                    ui::info(&format!(
                        "{:<20} priority {:<6} {:>4} files  {}",
                        layer.name, layer.priority, layer.file_count, layer.description
                    ));
                }
            }
            Ok(())
        }
        OverrideCmd::Apply {
            tenant,
            layer,
            no_restarts,
        } => {
            let summary = apply_layer(settings, &store, &tenant, &layer, !no_restarts, false).await?;
            ui::success(&format!(
                "layer '{layer}' applied: {} changed, {} removed",
                summary.changed.len(),
                summary.removed.len()
            ));
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Ok(())
        }
        OverrideCmd::Preview { tenant, layer } => {
            let summary = apply_layer(settings, &store, &tenant, &layer, false, true).await?;
            ui::info(&format!(
                "layer '{layer}' preview: {} would change, {} would be removed",
                summary.changed.len(),
                summary.removed.len()
            ));
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

async fn apply_layer(
    settings: &Settings,
    store: &OverrideStore,
    tenant: &str,
    layer_name: &str,
    apply_restarts: bool,
    preview_only: bool,
) -> Result<rave_overlay::apply::ApplySummary> {
    let layer = store.get_layer(layer_name)?;
    let package = package::build_layer_package(&layer)?;
    let mgr = manager(settings)?;
    let summary = mgr
        .apply_override_layer(
            tenant,
            &package.manifest.layer,
            &package.archive,
            apply_restarts,
            preview_only,
        )
        .await?;
    Ok(summary)
}

async fn secrets_command(settings: &Settings, action: SecretsCmd) -> Result<()> {
    let mgr = manager(settings)?;
    match action {
        SecretsCmd::Install {
            tenant,
            remote_path,
            from_file,
            owner,
            group,
            mode,
        } => {
            let content = std::fs::read_to_string(&from_file)
                .with_context(|| format!("reading {}", from_file.display()))?;
            let entry = SecretEntry::new(remote_path.clone(), content)
                .with_ownership(&owner, &group)
                .with_modes(&mode, "0700");
            mgr.install_secret_files(&tenant, &[entry]).await?;
            ui::success(&format!("secret installed at {remote_path}"));
            Ok(())
        }
    }
}

fn doctor() -> Result<()> {
    let report = launcher::check_prerequisites();
    for warning in &report.warnings {
        ui::warn(warning);
    }
    if report.ok() {
        ui::success("all required tools present");
        Ok(())
    } else {
        anyhow::bail!("missing required tools: {}", report.missing.join(", "));
    }
}
