use std::collections::BTreeMap;

use rave_core::{naming, Error, Result};
use serde::{Deserialize, Serialize};

use crate::package::ManifestEntry;

/// Guest-side roots for override state and staging.
pub const GUEST_BASE_DIR: &str = "/var/lib/rave/overrides";

/// Summary printed by the guest apply program as its final JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySummary {
    pub layer: String,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub restart_units: Vec<String>,
    pub reload_units: Vec<String>,
    pub commands: Vec<String>,
    pub daemon_reload: bool,
    pub daemon_reloaded: bool,
    pub restarts_applied: bool,
    pub preview: bool,
}

/// What applying a new manifest over a prior one would do. Computed both
/// host-side (for previews and tests) and guest-side (authoritatively).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyPlan {
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub restart_units: Vec<String>,
    pub reload_units: Vec<String>,
    pub commands: Vec<String>,
    pub daemon_reload: bool,
}

/// Diff a new manifest against the previously applied entries.
///
/// Changed = new entries whose hash differs from the prior entry at the
/// same path (or which are new). Removed = prior paths absent from the new
/// set. Restart/reload/command hints union across both sets with
/// order-preserving dedup; daemon_reload ORs.
pub fn diff_manifests(prev: &[ManifestEntry], next: &[ManifestEntry]) -> ApplyPlan {
    let prev_index: BTreeMap<&str, &ManifestEntry> =
        prev.iter().map(|e| (e.path.as_str(), e)).collect();
    let next_index: BTreeMap<&str, &ManifestEntry> =
        next.iter().map(|e| (e.path.as_str(), e)).collect();

    let mut plan = ApplyPlan::default();

    for entry in next {
        let prev_hash = prev_index.get(entry.path.as_str()).map(|e| e.hash.as_str());
        if prev_hash != Some(entry.hash.as_str()) {
            plan.changed.push(entry.path.clone());
        }
        plan.daemon_reload |= entry.daemon_reload;
        merge_unique(&mut plan.restart_units, &entry.restart_units);
        merge_unique(&mut plan.reload_units, &entry.reload_units);
        merge_unique(&mut plan.commands, &entry.commands);
    }

    for (path, entry) in &prev_index {
        if next_index.contains_key(*path) {
            continue;
        }
        plan.removed.push(path.to_string());
        plan.daemon_reload |= entry.daemon_reload;
        merge_unique(&mut plan.restart_units, &entry.restart_units);
        merge_unique(&mut plan.reload_units, &entry.reload_units);
        merge_unique(&mut plan.commands, &entry.commands);
    }

    plan.changed.sort();
    plan.changed.dedup();
    plan.removed.sort();
    plan.removed.dedup();
    plan
}

fn merge_unique(target: &mut Vec<String>, values: &[String]) {
    for value in values {
        if !target.iter().any(|v| v == value) {
            target.push(value.clone());
        }
    }
}

/// Parse the authoritative summary from the remote program's stdout:
/// the last line that parses as JSON.
pub fn parse_summary(stdout: &str) -> Result<ApplySummary> {
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(summary) = serde_json::from_str::<ApplySummary>(trimmed) {
            return Ok(summary);
        }
    }
    Err(Error::internal(
        "override layer execution finished but summary missing",
    ))
}

/// Build the remote script that consumes the package tarball on stdin.
///
/// The bash wrapper stages the archive under a mktemp directory and hands
/// control to an embedded python3 program. Everything variable travels as
/// argv: the shell text never interpolates untrusted input (the layer name
/// is shell-quoted, and the mktemp template uses a sanitized form).
pub fn remote_apply_script(layer_name: &str, apply_files: bool, apply_restarts: bool) -> Result<String> {
    naming::validate_name(layer_name, "layer")?;
    let safe_layer = naming::sanitize_for_path(layer_name);
    let quoted_layer = shlex::try_quote(layer_name)
        .map_err(|_| Error::validation("layer name is not shell-safe"))?;
    let apply_files_flag = if apply_files { "1" } else { "0" };
    let apply_restarts_flag = if apply_restarts && apply_files { "1" } else { "0" };

    Ok(format!(
        "set -euo pipefail\n\
         LAYER_NAME={quoted_layer}\n\
         APPLY_FILES={apply_files_flag}\n\
         APPLY_RESTARTS={apply_restarts_flag}\n\
         BASE={GUEST_BASE_DIR}\n\
         mkdir -p \"$BASE/state\" \"$BASE/staging\"\n\
         STAGING=$(mktemp -d \"$BASE/staging/{safe_layer}-XXXXXX\")\n\
         cleanup() {{\n  rm -rf \"$STAGING\"\n}}\n\
         trap cleanup EXIT\n\
         \n\
         tar -xz -f - -C \"$STAGING\"\n\
         \n\
         python3 - \"$STAGING\" \"$BASE/state\" \"$LAYER_NAME\" \"$APPLY_FILES\" \"$APPLY_RESTARTS\" <<'PY'\n\
         {program}\nPY\n",
        program = GUEST_APPLY_PROGRAM,
    ))
}

// The guest-side apply program. Parameterized entirely by argv; reads the
// staged manifest, diffs against the prior state file, applies or previews,
// and prints exactly one JSON summary line.
const GUEST_APPLY_PROGRAM: &str = r#"
import json
import os
import pwd
import grp
import shutil
import subprocess
import sys
import time
from pathlib import Path

staging_root = Path(sys.argv[1])
state_dir = Path(sys.argv[2])
layer_name = sys.argv[3]
apply_files = sys.argv[4] == "1"
apply_restarts = sys.argv[5] == "1"

manifest_path = staging_root / ".rave-manifest.json"
if not manifest_path.exists():
    raise SystemExit("override manifest missing from payload")

with manifest_path.open() as handle:
    manifest = json.load(handle)

entries = manifest.get("entries", [])
state_dir.mkdir(parents=True, exist_ok=True)
state_path = state_dir / f"{layer_name}.json"

prev_data = {}
if state_path.exists():
    try:
        with state_path.open() as handle:
            prev_data = json.load(handle)
    except json.JSONDecodeError:
        prev_data = {}

prev_entries = prev_data.get("entries", [])
prev_index = {entry.get("path"): entry for entry in prev_entries if entry.get("path")}

changed_paths = []
removed_paths = []
new_index = {}
restart_units = []
reload_units = []
commands = []
requires_daemon_reload = False
copy_jobs = []
removal_jobs = []


def _resolve_uid(name):
    try:
        return pwd.getpwnam(name).pw_uid
    except KeyError:
        return 0


def _resolve_gid(name):
    try:
        return grp.getgrnam(name).gr_gid
    except KeyError:
        return 0


def _merge_unique(target, values):
    for value in values or []:
        if value not in target:
            target.append(value)


for entry in entries:
    target_path = Path(entry["path"])
    source_rel = entry["source_relpath"]
    source_path = staging_root / source_rel
    if not source_path.exists():
        raise SystemExit(f"override payload missing {source_rel}")

    owner = entry.get("owner", "root")
    group = entry.get("group", owner)
    file_mode = int(str(entry.get("file_mode", "0644")), 8)
    dir_mode = int(str(entry.get("dir_mode", "0755")), 8)

    copy_jobs.append(
        {
            "target": target_path,
            "source": source_path,
            "uid": _resolve_uid(owner),
            "gid": _resolve_gid(group),
            "file_mode": file_mode,
            "dir_mode": dir_mode,
        }
    )

    prev_hash = prev_index.get(entry["path"], {}).get("hash")
    if prev_hash != entry.get("hash"):
        changed_paths.append(entry["path"])

    new_index[entry["path"]] = entry
    if entry.get("daemon_reload"):
        requires_daemon_reload = True
    _merge_unique(restart_units, entry.get("restart_units"))
    _merge_unique(reload_units, entry.get("reload_units"))
    _merge_unique(commands, entry.get("commands"))


for path, entry in prev_index.items():
    if path in new_index:
        continue
    removal_jobs.append(path)
    removed_paths.append(path)
    if entry.get("daemon_reload"):
        requires_daemon_reload = True
    _merge_unique(restart_units, entry.get("restart_units"))
    _merge_unique(reload_units, entry.get("reload_units"))
    _merge_unique(commands, entry.get("commands"))


def _ensure_parent(directory, mode, uid, gid):
    missing = []
    current = directory
    while not current.exists():
        missing.append(current)
        parent = current.parent
        if parent == current:
            break
        current = parent
    for path in reversed(missing):
        path.mkdir()
        try:
            os.chmod(path, mode)
        except PermissionError:
            pass
        try:
            os.chown(path, uid, gid)
        except PermissionError:
            pass


if apply_files:
    for job in copy_jobs:
        target_path = Path(job["target"])
        source_path = Path(job["source"])
        _ensure_parent(target_path.parent, job["dir_mode"], job["uid"], job["gid"])
        shutil.copy2(source_path, target_path)
        try:
            os.chmod(target_path, job["file_mode"])
        except PermissionError:
            pass
        try:
            os.chown(target_path, job["uid"], job["gid"])
        except PermissionError:
            pass

    for path in removal_jobs:
        if os.path.islink(path) or os.path.isfile(path):
            os.remove(path)

    manifest["applied_at"] = time.time()
    state_tmp = state_path.with_suffix(".tmp")
    next_entries = sorted(new_index.values(), key=lambda item: item.get("target_relpath", ""))
    state_payload = dict(manifest)
    state_payload["entries"] = next_entries
    with state_tmp.open("w") as handle:
        json.dump(state_payload, handle, indent=2)
    os.replace(state_tmp, state_path)


def _run_systemctl(args):
    subprocess.run(["systemctl", *args], check=True)


daemon_reloaded = False
if apply_files and requires_daemon_reload:
    _run_systemctl(["daemon-reload"])
    daemon_reloaded = True

if apply_restarts:
    for unit in reload_units:
        _run_systemctl(["reload", unit])
    for unit in restart_units:
        _run_systemctl(["restart", unit])
    for command in commands:
        subprocess.run(command, check=True, shell=True, executable="/bin/sh")


summary = {
    "layer": layer_name,
    "changed": sorted(set(changed_paths)),
    "removed": sorted(set(removed_paths)),
    "restart_units": restart_units,
    "reload_units": reload_units,
    "commands": commands,
    "daemon_reload": requires_daemon_reload,
    "daemon_reloaded": daemon_reloaded,
    "restarts_applied": apply_restarts,
    "preview": not apply_files,
}
print(json.dumps(summary))
"#;
