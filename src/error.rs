use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid position {0}: the header region is written only by the commit path")]
    InvalidPosition(u64),

    #[error("write to committed space at position {0}")]
    WriteToCommittedSpace(u64),

    #[error("archive is disposed")]
    Disposed,

    #[error("mode violation: {0}")]
    ModeViolation(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
