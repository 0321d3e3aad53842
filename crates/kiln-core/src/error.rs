use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Location inside a template source. `line` and `column` are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Position {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn locate(source: &str, offset: usize) -> Self {
        let mut offset = offset.min(source.len());
        while !source.is_char_boundary(offset) {
            offset -= 1;
        }
        let before = &source[..offset];
        let line = before.matches('\n').count() + 1;
        let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let column = source[line_start..offset].chars().count() + 1;
        Self {
            offset,
            line,
            column,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at {position}")]
pub struct ParseError {
    pub message: String,
    pub position: Position,
}

impl ParseError {
    pub fn new(message: impl Into<String>, source: &str, offset: usize) -> Self {
        Self {
            message: message.into(),
            position: Position::locate(source, offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolutionError {
    #[error("unknown namespace `{alias}` for view `{path}`")]
    UnknownNamespace { alias: String, path: String },
    #[error("template not found: {path}")]
    NotFound { path: String },
    #[error("failed to read `{path}`: {reason}")]
    Io { path: String, reason: String },
    #[error("no resolver configured to read `{path}`")]
    NoResolver { path: String },
    #[error("view `{path}` climbs out of its namespace root")]
    ParentSegment { path: String },
}

/// Code generation or routine compilation failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    /// Byte offset in the template source, when known.
    pub position: Option<usize>,
    /// 1-based line of the generated routine source, when known.
    pub line: Option<usize>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: None,
            line: None,
        }
    }

    pub fn at(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            position: Some(offset),
            line: None,
        }
    }

    pub fn on_line(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            position: None,
            line: Some(line),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parse(_) => "KILN_E_PARSE",
            Error::Resolution(_) => "KILN_E_RESOLVE",
            Error::Compile(_) => "KILN_E_COMPILE",
            Error::Runtime(_) => "KILN_E_RUNTIME",
        }
    }

    /// Byte offset into the failing template, if the error carries one.
    pub fn offset(&self) -> Option<usize> {
        match self {
            Error::Parse(e) => Some(e.position.offset),
            Error::Compile(e) => e.position,
            Error::Runtime(e) => e.position,
            Error::Resolution(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_counts_lines_and_columns() {
        let src = "ab\ncdé\nf";
        assert_eq!(
            Position::locate(src, 4),
            Position {
                offset: 4,
                line: 2,
                column: 2
            }
        );
        let end = Position::locate(src, 999);
        assert_eq!((end.line, end.column), (3, 2));
    }

    #[test]
    fn codes_follow_error_kind() {
        let err = Error::from(ResolutionError::NotFound {
            path: "/x.kiln".into(),
        });
        assert_eq!(err.code(), "KILN_E_RESOLVE");
        assert_eq!(err.to_string(), "template not found: /x.kiln");
    }
}
