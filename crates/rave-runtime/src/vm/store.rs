use std::io::Write;
use std::path::{Path, PathBuf};

use rave_core::tenant::TenantRecord;
use rave_core::{Error, Result};
use tracing::warn;

/// One JSON file per tenant under the VM state directory.
///
/// Records are validated on both load and save; a file that is missing,
/// unreadable, or schema-invalid reads as "not found" rather than a
/// partial record. Writes go through a temp file and rename so readers
/// never observe a torn record.
pub struct TenantStore {
    dir: PathBuf,
}

impl TenantStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.load(name).is_ok()
    }

    /// Load and validate a tenant record.
    pub fn load(&self, name: &str) -> Result<TenantRecord> {
        let path = self.record_path(name);
        let text = std::fs::read_to_string(&path)
            .map_err(|_| Error::not_found(format!("VM '{name}' not found")))?;
        let record: TenantRecord = match serde_json::from_str(&text) {
            Ok(record) => record,
            Err(e) => {
                warn!(tenant = name, error = %e, "tenant record is invalid");
                return Err(Error::not_found(format!("VM '{name}' not found")));
            }
        };
        if let Err(e) = record.validate() {
            warn!(tenant = name, error = %e, "tenant record failed validation");
            return Err(Error::not_found(format!("VM '{name}' not found")));
        }
        Ok(record)
    }

    /// Validate and persist a record atomically.
    pub fn save(&self, record: &TenantRecord) -> Result<()> {
        record.validate()?;
        let path = self.record_path(&record.name);
        let json = serde_json::to_string_pretty(record)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|e| Error::internal(format!("failed to persist tenant record: {e}")))?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.record_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Names of every tenant with a record file, sorted.
    pub fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
