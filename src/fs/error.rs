use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FsError {
    #[error("not enough free sectors for operation")]
    NoSpace,
    #[error("file of {0} bytes exceeds the largest indexable size")]
    FileTooLarge(usize),
    #[error("name {0:?} is already bound in this directory")]
    AlreadyExists(String),
    #[error("directory has no free entry")]
    DirectoryFull,
    #[error("found no entry named {0:?}")]
    NotFound(String),
    #[error("{0:?} is not a directory")]
    NotADirectory(String),
    #[error("{0:?} is a directory")]
    IsADirectory(String),
    #[error("name {0:?} is longer than the directory entry allows")]
    NameTooLong(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid disk geometry: {0}")]
    InvalidGeometry(String),
    #[error("host io failed")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;
