use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use rave_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::layer::Layer;
use crate::metadata::{KIND_FILE, KIND_SYSTEMD};

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILE_NAME: &str = ".rave-manifest.json";

/// One payload file gathered from a layer directory.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub source_path: PathBuf,
    pub source_relpath: String,
    pub target_relpath: String,
    pub kind: &'static str,
}

/// Manifest entry describing one guest file and its activation side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub target_relpath: String,
    pub path: String,
    pub source_relpath: String,
    pub kind: String,
    pub owner: String,
    pub group: String,
    pub file_mode: String,
    pub dir_mode: String,
    pub restart_units: Vec<String>,
    pub reload_units: Vec<String>,
    pub commands: Vec<String>,
    pub daemon_reload: bool,
    /// `sha256:<hex>` digest of the payload bytes.
    pub hash: String,
}

/// Machine-readable description of a built override package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub layer: String,
    pub priority: i64,
    pub generated_at: String,
    pub metadata_version: u32,
    pub entries: Vec<ManifestEntry>,
}

/// A built package: manifest plus the tar.gz archive bytes.
#[derive(Debug, Clone)]
pub struct LayerPackage {
    pub manifest: Manifest,
    pub archive: Vec<u8>,
}

/// Walk a layer's payload directories.
///
/// `files/<rel>` targets `/<rel>`; `systemd/<name>` targets
/// `/etc/systemd/system/<name>`. `.gitkeep` markers are skipped.
pub fn gather_sources(layer: &Layer) -> Result<Vec<SourceFile>> {
    let mut sources = Vec::new();
    collect(&layer.files_dir, "files", "", KIND_FILE, &mut sources)?;
    collect(
        &layer.systemd_dir,
        "systemd",
        "etc/systemd/system/",
        KIND_SYSTEMD,
        &mut sources,
    )?;
    Ok(sources)
}

fn collect(
    root: &Path,
    prefix: &str,
    target_prefix: &str,
    kind: &'static str,
    out: &mut Vec<SourceFile>,
) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    let mut stack = vec![root.to_path_buf()];
    let mut paths = Vec::new();
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                paths.push(path);
            }
        }
    }
    paths.sort();

    for path in paths {
        if path.file_name().map(|n| n == ".gitkeep").unwrap_or(false) {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map_err(|_| Error::internal("walked path escaped layer root"))?
            .to_string_lossy()
            .replace('\\', "/");
        out.push(SourceFile {
            source_path: path,
            source_relpath: format!("{prefix}/{rel}"),
            target_relpath: format!("{target_prefix}{rel}"),
            kind,
        });
    }
    Ok(())
}

/// Build the package for a layer: hash every source, resolve its metadata,
/// reject duplicate targets, and assemble the tar.gz with the manifest at
/// the archive root.
pub fn build_layer_package(layer: &Layer) -> Result<LayerPackage> {
    let sources = gather_sources(layer)?;
    let mut entries = Vec::with_capacity(sources.len());
    let mut seen_targets = BTreeSet::new();

    for source in &sources {
        if !seen_targets.insert(source.target_relpath.clone()) {
            return Err(Error::conflict(format!(
                "duplicate target path '{}' in layer '{}'",
                source.target_relpath, layer.name
            )));
        }
        entries.push(build_entry(layer, source)?);
    }

    entries.sort_by(|a, b| a.target_relpath.cmp(&b.target_relpath));

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        layer: layer.name.clone(),
        priority: layer.priority,
        generated_at: rave_core::time::utc_now(),
        metadata_version: layer.metadata.version,
        entries,
    };

    let archive = build_archive(&sources, &manifest)?;
    Ok(LayerPackage { manifest, archive })
}

fn build_entry(layer: &Layer, source: &SourceFile) -> Result<ManifestEntry> {
    let metadata = layer.metadata.resolve(&source.target_relpath, source.kind);
    let bytes = std::fs::read(&source.source_path)?;
    let digest = Sha256::digest(&bytes);

    Ok(ManifestEntry {
        target_relpath: source.target_relpath.clone(),
        path: format!("/{}", source.target_relpath),
        source_relpath: source.source_relpath.clone(),
        kind: source.kind.to_string(),
        owner: metadata.owner,
        group: metadata.group,
        file_mode: metadata.file_mode,
        dir_mode: metadata.dir_mode,
        restart_units: metadata.restart_units,
        reload_units: metadata.reload_units,
        commands: metadata.commands,
        daemon_reload: metadata.daemon_reload,
        hash: format!("sha256:{digest:x}"),
    })
}

fn build_archive(sources: &[SourceFile], manifest: &Manifest) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    for source in sources {
        builder
            .append_path_with_name(&source.source_path, &source.source_relpath)
            .map_err(|e| {
                Error::internal(format!(
                    "failed to archive {}: {e}",
                    source.source_relpath
                ))
            })?;
    }

    let manifest_bytes = serde_json::to_vec_pretty(manifest)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, MANIFEST_FILE_NAME, manifest_bytes.as_slice())
        .map_err(|e| Error::internal(format!("failed to archive manifest: {e}")))?;

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::internal(format!("failed to finish archive: {e}")))?;
    let mut bytes = encoder
        .finish()
        .map_err(|e| Error::internal(format!("failed to finish gzip stream: {e}")))?;
    bytes.shrink_to_fit();
    Ok(bytes)
}
