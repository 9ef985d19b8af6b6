use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    #[error("Sheet write failed: {0}")]
    WriteFailed(String),

    #[error("Sheet read failed: {0}")]
    ReadFailed(String),
}
