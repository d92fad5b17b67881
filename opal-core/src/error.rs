use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    // buffer pool errors
    #[error("out of memory")]
    OutOfMemory,
    #[error("insufficient memory({0})")]
    InsufficientMemory(usize),
    #[error("allocation of {0} bytes exceeds largest page size class")]
    AllocationTooLarge(usize),
    #[error("buffer pool size is too small")]
    BufferPoolSizeTooSmall,
    #[error("io error(errno={errno})")]
    Io { errno: i32 },
}

impl From<io::Error> for Error {
    #[inline]
    fn from(src: io::Error) -> Self {
        Error::Io {
            errno: src.raw_os_error().unwrap_or(0),
        }
    }
}
