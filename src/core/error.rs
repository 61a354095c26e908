use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    BadArgument,
    NotFound,
    Duplicate,
    AccessDenied,
    Exhausted,
    Protocol,
    Unavailable,
    Source,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    path: Option<PathBuf>,
    hint: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            path: None,
            hint: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::BadArgument => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Duplicate => 4,
        ErrorKind::AccessDenied => 5,
        ErrorKind::Exhausted => 6,
        ErrorKind::Protocol => 7,
        ErrorKind::Unavailable => 8,
        ErrorKind::Source => 9,
        ErrorKind::Io => 10,
    }
}

pub fn map_io_error_kind(err: &std::io::Error) -> ErrorKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => {
            ErrorKind::Unavailable
        }
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, map_io_error_kind, to_exit_code};

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::BadArgument, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::Duplicate, 4),
            (ErrorKind::AccessDenied, 5),
            (ErrorKind::Exhausted, 6),
            (ErrorKind::Protocol, 7),
            (ErrorKind::Unavailable, 8),
            (ErrorKind::Source, 9),
            (ErrorKind::Io, 10),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn refused_connection_maps_to_unavailable() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(map_io_error_kind(&err), ErrorKind::Unavailable);
    }

    #[test]
    fn display_includes_message() {
        let err = super::Error::new(ErrorKind::NotFound).with_message("no such queue");
        assert_eq!(format!("{err}"), "NotFound: no such queue");
    }
}
