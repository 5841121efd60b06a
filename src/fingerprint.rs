use std::fs::{self, Metadata};
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl FileFingerprint {
    pub fn new(modified: DateTime<Utc>, size: u64) -> Self {
        Self { modified, size }
    }

    pub fn from_metadata(metadata: &Metadata) -> io::Result<Self> {
        let modified = metadata.modified()?;
        Ok(Self {
            modified: DateTime::<Utc>::from(modified),
            size: metadata.len(),
        })
    }

    pub fn probe(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Self::from_metadata(&metadata)
    }
}
