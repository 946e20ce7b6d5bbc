use std::time::Duration;

use rave_core::retry::Backoff;
use rave_core::Result;
use rave_overlay::apply::{self, ApplySummary};
use tracing::info;

use crate::ssh::{self, SshOptions};
use crate::vm::manager::VmManager;

impl VmManager {
    /// Stream an override layer archive into the VM and apply or preview it.
    ///
    /// The tarball goes over SSH stdin; the guest extracts it into a
    /// staging directory, diffs against the layer's applied state, and
    /// prints a JSON summary line which becomes the authoritative result.
    pub async fn apply_override_layer(
        &self,
        name: &str,
        layer_name: &str,
        archive: &[u8],
        apply_restarts: bool,
        preview_only: bool,
    ) -> Result<ApplySummary> {
        let record = self.load_running(name)?;

        let remote_script =
            apply::remote_apply_script(layer_name, !preview_only, apply_restarts)?;

        let description = if preview_only {
            format!("previewing override layer '{layer_name}'")
        } else {
            format!("applying override layer '{layer_name}'")
        };
        let opts = SshOptions {
            timeout: Duration::from_secs(900),
            description,
            connect_timeout: Duration::from_secs(45),
            backoff: Backoff::default(),
        };

        let output = ssh::run_remote_stream(&record, &remote_script, archive, &opts).await?;
        let summary = apply::parse_summary(&output.stdout_text())?;
        info!(
            tenant = name,
            layer = layer_name,
            changed = summary.changed.len(),
            removed = summary.removed.len(),
            preview = summary.preview,
            "override layer processed"
        );
        Ok(summary)
    }
}
