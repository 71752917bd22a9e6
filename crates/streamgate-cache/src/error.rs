use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment full: {0}")]
    SegmentFull(String),

    #[error("corrupt entry at position {0}")]
    CorruptEntry(u32),

    #[error("cache directory error: {0}")]
    Directory(String),
}
