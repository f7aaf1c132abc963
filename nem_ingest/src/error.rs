use std::path::PathBuf;

/// Result alias used throughout the ingestion engine
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    /// Network or upstream failure after the retry budget was spent,
    /// or a terminal 4xx that retrying cannot fix
    #[error("fetch failed for {url} after {attempts} attempt(s): {reason}")]
    FetchFailed {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// The upstream has not published this file (yet)
    #[error("not published: {url}")]
    NotPublished { url: String },

    /// Neither known archive layout matches
    #[error("unrecognized archive format for {context}: {detail}")]
    FormatUnrecognized { context: String, detail: String },

    #[error("corrupt archive {name}: {source}")]
    CorruptArchive {
        name: String,
        #[source]
        source: zip::result::ZipError,
    },

    /// No leaf payloads inside the container
    #[error("archive {name} contains no table payloads")]
    EmptyArchive { name: String },

    #[error("schema mismatch in {table} at line {line}: header has {expected} columns, row has {found}")]
    SchemaMismatch {
        table: String,
        line: u64,
        expected: usize,
        found: usize,
    },

    /// Two persisted records share a key after dedup. Indicates a key-column design error.
    #[error("merge conflict in {series}: duplicate key {key} survived deduplication")]
    MergeConflict { series: String, key: String },

    #[error("storage error for {path}: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown series '{0}'")]
    UnknownSeries(String),
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn storage(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        IngestError::Storage {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Expected absence of data: zero records, not a failure of the series
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            IngestError::NotPublished { .. }
                | IngestError::EmptyArchive { .. }
                | IngestError::SchemaMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let fetch = IngestError::FetchFailed {
            url: "http://x".into(),
            attempts: 3,
            reason: "503".into(),
        };
        assert!(!fetch.is_skippable());

        let empty = IngestError::EmptyArchive { name: "a.zip".into() };
        assert!(empty.is_skippable());

        let conflict = IngestError::MergeConflict {
            series: "scada5".into(),
            key: "2025-01-01 00:05:00|X".into(),
        };
        assert!(!conflict.is_skippable());
        assert!(conflict.to_string().contains("scada5"));
    }
}
