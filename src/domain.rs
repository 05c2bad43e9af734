use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// GEO accession naming one pipeline run, e.g. `GSE102902`.
///
/// Opaque apart from being safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Remote directory bucket: the first six characters followed by `nnn`.
    pub fn series_bucket(&self) -> String {
        let head: String = self.0.chars().take(6).collect();
        format!("{head}nnn")
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized != "."
            && normalized != ".."
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
        if !is_valid {
            return Err(IngestError::InvalidDatasetId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for DatasetId {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetId> for String {
    fn from(value: DatasetId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Extract,
    Process,
    Trim,
    Cleanup,
}

impl Stage {
    /// The full chain in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Download,
        Stage::Extract,
        Stage::Process,
        Stage::Trim,
        Stage::Cleanup,
    ];

    pub fn predecessor(self) -> Option<Stage> {
        match self {
            Stage::Download => None,
            Stage::Extract => Some(Stage::Download),
            Stage::Process => Some(Stage::Extract),
            Stage::Trim => Some(Stage::Process),
            Stage::Cleanup => Some(Stage::Trim),
        }
    }

    pub fn successor(self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.predecessor() == Some(self))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Process => "process",
            Stage::Trim => "trim",
            Stage::Cleanup => "cleanup",
        }
    }

    /// Chain prefix ending at `self`.
    pub fn through(self) -> Vec<Stage> {
        Stage::ALL.into_iter().filter(|stage| *stage <= self).collect()
    }

    /// `self` followed by every later stage.
    pub fn onwards(self) -> Vec<Stage> {
        Stage::ALL.into_iter().filter(|stage| *stage >= self).collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| IngestError::InvalidStage(value.to_string()))
    }
}
