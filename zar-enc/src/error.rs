use std::fmt;

/// The result type of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while building an archive.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
pub(crate) enum ErrorInner {
    ParentNotFound,
    NotADirectory,
    DuplicateEntry,
    EmptyName,
    Limit(&'static str),
    Compress(std::io::Error),
    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::ParentNotFound => f.pad("parent directory does not exist"),
            ErrorInner::NotADirectory => f.pad("a path segment refers to a file"),
            ErrorInner::DuplicateEntry => f.pad("an entry with this name already exists"),
            ErrorInner::EmptyName => f.pad("entry name is empty"),
            ErrorInner::Limit(msg) => write!(f, "{msg}"),
            ErrorInner::Compress(err) => write!(f, "failed to compress block: {err}"),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Compress(err) | ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}
