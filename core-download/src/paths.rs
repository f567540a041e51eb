//! On-disk layout of the download directory.
//!
//! ```text
//! <root>/
//!   <server>/
//!     manifest.json
//!     <item>.<ext>          completed
//!     <item>.<ext>.part     in flight
//! ```
//!
//! Ids made only of `[A-Za-z0-9_-]` and at most 128 chars long are used as
//! they are. Any other id is sanitised and suffixed with `.<hash>` of the
//! raw id; plain names never contain `.`, so the two forms cannot collide.

use crate::models::DownloadRecord;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const PARTIAL_SUFFIX: &str = ".part";
const TMP_SUFFIX: &str = ".tmp";
const MAX_COMPONENT_LEN: usize = 128;
/// Hex chars of the raw-id digest kept in a disambiguated name.
const ID_HASH_LEN: usize = 16;

/// Replace everything outside `[A-Za-z0-9_-]` with `_`, so server and item
/// ids can never escape their directory.
pub fn sanitize_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_COMPONENT_LEN)
        .collect();

    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Path component for an opaque id. Distinct ids map to distinct names.
pub fn id_component(raw: &str) -> String {
    let safe = sanitize_component(raw);
    if safe == raw {
        return safe;
    }
    hashed_component(raw)
}

fn hashed_component(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}.{}", sanitize_component(raw), &digest[..ID_HASH_LEN])
}

#[derive(Debug, Clone)]
pub struct DownloadLayout {
    root: PathBuf,
    manifest_file_name: String,
}

impl DownloadLayout {
    pub fn new(root: impl Into<PathBuf>, manifest_file_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            manifest_file_name: manifest_file_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn server_dir(&self, server_id: &str) -> PathBuf {
        self.root.join(id_component(server_id))
    }

    pub fn manifest_path(&self, server_id: &str) -> PathBuf {
        self.server_dir(server_id).join(&self.manifest_file_name)
    }

    pub fn manifest_path_in(&self, server_dir: &Path) -> PathBuf {
        server_dir.join(&self.manifest_file_name)
    }

    pub fn manifest_tmp_path_in(&self, server_dir: &Path) -> PathBuf {
        server_dir.join(format!("{}{}", self.manifest_file_name, TMP_SUFFIX))
    }

    pub fn media_path(&self, record: &DownloadRecord) -> PathBuf {
        let extension = record.item.file_extension();
        let mut name = format!("{}.{}", id_component(&record.item_id), extension);
        let partial = format!("{}{}", name, PARTIAL_SUFFIX);
        if self.is_manifest_name(&name) || self.is_manifest_name(&partial) {
            name = format!("{}.{}", hashed_component(&record.item_id), extension);
        }
        self.server_dir(&record.server_id).join(name)
    }

    pub fn partial_path(&self, record: &DownloadRecord) -> PathBuf {
        let mut name = self.media_path(record).into_os_string();
        name.push(PARTIAL_SUFFIX);
        PathBuf::from(name)
    }

    pub fn is_manifest_file(&self, path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| self.is_manifest_name(&name.to_string_lossy()))
    }

    fn is_manifest_name(&self, name: &str) -> bool {
        name == self.manifest_file_name
            || name == format!("{}{}", self.manifest_file_name, TMP_SUFFIX)
    }
}
