//! Artifact locator: maps (dataset, stage) to canonical workspace paths.
//!
//! Everything here is pure path arithmetic; nothing touches the filesystem.

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{DatasetId, Stage};

pub const UNPACKED_MARKER: &str = "_unpacked";
pub const PROCESSED_MARKER: &str = "_processed";
pub const TRIMMED_MARKER: &str = "_trimmed";
pub const CLEANUP_MARKER: &str = "_cleanup";
pub const TABLES_DIR: &str = "tables";
pub const TRIMMED_PROBES_FILE: &str = "Probes_trimmed.tsv";

#[derive(Debug, Clone)]
pub struct Layout {
    root: Utf8PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn data_dir(&self) -> Utf8PathBuf {
        self.root.join("data")
    }

    /// Primary artifact a stage produces for a dataset.
    pub fn locate(&self, id: &DatasetId, stage: Stage) -> Utf8PathBuf {
        match stage {
            Stage::Download => self.raw_archive(id),
            Stage::Extract => self.extracted_dir(id),
            Stage::Process => self.processed_dir(id),
            Stage::Trim => self.trimmed_dir(id),
            Stage::Cleanup => self.cleanup_dir(id),
        }
    }

    /// File whose existence records that `stage` completed for `id`.
    ///
    /// The downloaded archive doubles as the download marker.
    pub fn marker(&self, id: &DatasetId, stage: Stage) -> Utf8PathBuf {
        match stage {
            Stage::Download => self.raw_archive(id),
            Stage::Extract => self.extracted_dir(id).join(UNPACKED_MARKER),
            Stage::Process => self.processed_dir(id).join(PROCESSED_MARKER),
            Stage::Trim => self.trimmed_dir(id).join(TRIMMED_MARKER),
            Stage::Cleanup => self.cleanup_dir(id).join(CLEANUP_MARKER),
        }
    }

    /// Advisory lock guarding one (dataset, stage) pair.
    ///
    /// Lock files are left in place once created; neither cleanup nor reset
    /// removes them. Unlinking a lock file another run holds would let a
    /// third run lock a fresh inode alongside it.
    pub fn lock(&self, id: &DatasetId, stage: Stage) -> Utf8PathBuf {
        self.data_dir()
            .join("locks")
            .join(id.as_str())
            .join(format!("{stage}.lock"))
    }

    pub fn raw_archive(&self, id: &DatasetId) -> Utf8PathBuf {
        self.data_dir().join("raw").join(format!("{id}_RAW.tar"))
    }

    pub fn extracted_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.data_dir().join("extracted").join(id.as_str())
    }

    pub fn processed_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.data_dir().join("processed").join(id.as_str())
    }

    pub fn trimmed_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.data_dir().join("trimmed").join(id.as_str())
    }

    pub fn cleanup_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.data_dir().join("cleanup").join(id.as_str())
    }

    /// Working directory for one decompressed member, keyed by its stem.
    pub fn processed_file_dir(&self, id: &DatasetId, stem: &str) -> Utf8PathBuf {
        self.processed_dir(id).join(stem)
    }

    pub fn decompressed_text(&self, id: &DatasetId, stem: &str) -> Utf8PathBuf {
        self.processed_file_dir(id, stem).join(format!("{stem}.txt"))
    }

    pub fn tables_dir(&self, id: &DatasetId, stem: &str) -> Utf8PathBuf {
        self.processed_file_dir(id, stem).join(TABLES_DIR)
    }

    pub fn table_path(&self, id: &DatasetId, stem: &str, section: &str) -> Utf8PathBuf {
        self.tables_dir(id, stem)
            .join(format!("{}.tsv", section_file_name(section)))
    }
}

/// Member name with its trailing `.gz` removed.
pub fn member_stem(file_name: &str) -> &str {
    file_name.strip_suffix(".gz").unwrap_or(file_name)
}

/// Section names come from file content; keep them to one path component.
pub fn section_file_name(section: &str) -> String {
    let cleaned: String = section
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect();
    match cleaned.as_str() {
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}
