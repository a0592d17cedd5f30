pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("truncated cell")]
    TruncatedCell,
    #[error("invalid cell: {0}")]
    InvalidCell(String),
    #[error("write of {len} bytes exceeds the {max} byte limit")]
    WriteTooLarge { len: usize, max: usize },
    #[error("stream closed")]
    StreamClosed,
    #[error("timeout")]
    Timeout,
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidCell(msg.into())
    }
}
