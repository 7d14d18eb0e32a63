//! On-disk layout of the control plane's work directory.
//!
//! The work directory doubles as the working tree of the audit repository,
//! so everything below it (except `temp/`) ends up version-controlled:
//!
//! ```text
//! <work>/
//!   uuid-state.json            UUID -> lifecycle state
//!   audit.log                  append-only audit trail
//!   repository/<uuid>/         workload source working copy
//!   management/<uuid>/origin.json
//!   management/<uuid>/image-data.json
//!   temp/<uuid>/               transient build context
//! ```

use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const ORIGIN_FILE: &str = "origin.json";
pub const IMAGE_DATA_FILE: &str = "image-data.json";
pub const STATE_FILE: &str = "uuid-state.json";
pub const AUDIT_LOG_FILE: &str = "audit.log";

#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    work_dir: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn state_file(&self) -> PathBuf {
        self.work_dir.join(STATE_FILE)
    }

    pub fn audit_log(&self) -> PathBuf {
        self.work_dir.join(AUDIT_LOG_FILE)
    }

    pub fn gitignore(&self) -> PathBuf {
        self.work_dir.join(".gitignore")
    }

    pub fn repositories_dir(&self) -> PathBuf {
        self.work_dir.join("repository")
    }

    pub fn management_root(&self) -> PathBuf {
        self.work_dir.join("management")
    }

    pub fn temp_root(&self) -> PathBuf {
        self.work_dir.join("temp")
    }

    pub fn repository_dir(&self, uuid: Uuid) -> PathBuf {
        self.repositories_dir().join(uuid.to_string())
    }

    pub fn management_dir(&self, uuid: Uuid) -> PathBuf {
        self.management_root().join(uuid.to_string())
    }

    pub fn temp_dir(&self, uuid: Uuid) -> PathBuf {
        self.temp_root().join(uuid.to_string())
    }

    pub fn origin_file(&self, uuid: Uuid) -> PathBuf {
        self.management_dir(uuid).join(ORIGIN_FILE)
    }

    pub fn image_data_file(&self, uuid: Uuid) -> PathBuf {
        self.management_dir(uuid).join(IMAGE_DATA_FILE)
    }
}
