#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Not enough bytes")]
    NotEnoughData {
        /// Number of bytes we got
        actual: usize,
        /// Minimum number of expected bytes
        minimum: usize,
    },

    /// The 3-bit version field of a primary header was nonzero. The declared length is
    /// carried along so a reader can skip the frame.
    #[error("unsupported packet version {version}")]
    UnsupportedVersion { version: u8, len_minus1: u16 },

    /// Fewer bytes were available than a frame declared.
    #[error("truncated frame at offset {offset}: expected {expected} bytes, got {actual}")]
    Truncated {
        offset: usize,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("invalid time window: {0}")]
    InvalidWindow(String),

    #[error("only APID {min} to {max} supported; got {0}", min = crate::modis::APID_MIN, max = crate::modis::APID_MAX)]
    InvalidApid(u16),

    /// A background source worker stopped without reporting its result.
    #[error("source failed: {0}")]
    SourceFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
