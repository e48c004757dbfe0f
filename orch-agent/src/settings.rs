//! Persistent device settings: `config.json`, whose `Orchestrator` section is the assignment record.

use std::io;
use std::path::{Path, PathBuf};

use orch_core::AssignmentRecord;
use serde_json::{Map, Value};
use tracing::warn;

/// Key of the assignment section in the settings document.
const ORCHESTRATOR_KEY: &str = "Orchestrator";

/// Error reading or writing settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings I/O: {0}")]
    Io(#[from] io::Error),
    #[error("settings document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("settings document is not a JSON object")]
    NotAnObject,
}

/// Settings document plus the decoded assignment record.
#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    document: Map<String, Value>,
    assignment: AssignmentRecord,
}

impl Settings {
    /// Factory defaults, not yet written.
    pub fn defaults(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: Map::new(),
            assignment: AssignmentRecord::default(),
        }
    }

    /// Load from disk. A missing file yields factory defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::defaults(path)),
            Err(e) => return Err(e.into()),
        };
        let document = match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(map) => map,
            _ => return Err(SettingsError::NotAnObject),
        };
        let assignment = section_record(&document);
        Ok(Self {
            path,
            document,
            assignment,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where an inbound Push is staged before validation.
    pub fn staging_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }

    pub fn assignment(&self) -> &AssignmentRecord {
        &self.assignment
    }

    pub fn set_assignment(&mut self, record: AssignmentRecord) {
        self.assignment = record;
    }

    /// Persist the document with the current assignment record.
    pub async fn save(&mut self) -> Result<(), SettingsError> {
        let section = serde_json::to_value(&self.assignment)?;
        self.document.insert(ORCHESTRATOR_KEY.to_string(), section);
        let bytes = serde_json::to_vec_pretty(&self.document)?;
        write_replace(&self.path, &bytes).await?;
        Ok(())
    }

    /// Replace the whole document with a validated pushed configuration.
    pub async fn replace(&mut self, config: Value) -> Result<(), SettingsError> {
        let document = match config {
            Value::Object(map) => map,
            _ => return Err(SettingsError::NotAnObject),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;
        write_replace(&self.path, &bytes).await?;
        self.assignment = section_record(&document);
        self.document = document;
        Ok(())
    }

    /// Erase persisted settings; the next load yields factory defaults.
    pub async fn restore_factory_defaults(&mut self) -> Result<(), SettingsError> {
        for p in [self.path.clone(), self.staging_path()] {
            match tokio::fs::remove_file(&p).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.document = Map::new();
        self.assignment = AssignmentRecord::default();
        Ok(())
    }
}

/// Decode the `Orchestrator` section. An unreadable section, or one that claims an owner
/// without a valid `Server ID`, leaves the device unassigned so Add can claim it.
fn section_record(document: &Map<String, Value>) -> AssignmentRecord {
    let Some(section) = document.get(ORCHESTRATOR_KEY) else {
        return AssignmentRecord::default();
    };
    let record: AssignmentRecord = match serde_json::from_value(section.clone()) {
        Ok(r) => r,
        Err(e) => {
            warn!("Orchestrator section unreadable, treating device as unassigned: {}", e);
            return AssignmentRecord::default();
        }
    };
    if section.get("Assigned") == Some(&Value::Bool(true)) && !record.assigned {
        warn!(
            server_id = %section.get("Server ID").unwrap_or(&serde_json::Value::Null),
            "stored assignment has no valid Server ID, treating device as unassigned"
        );
    }
    record
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Write next to `path`, then rename over it, so readers see the old or the new file.
async fn write_replace(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let next = with_suffix(path, ".new");
    tokio::fs::write(&next, bytes).await?;
    tokio::fs::rename(&next, path).await
}
