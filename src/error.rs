//! Error taxonomy and positioned diagnostics for the compiler.

use std::fmt;
use std::path::Path;

use thiserror::Error;

/// Failure categories surfaced by the driver.
///
/// Phases collect any number of positioned diagnostics through
/// [`Diagnostics`] and return exactly one of these to signal that the
/// pipeline for the current file must stop.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Option(String),

    #[error("{0}")]
    File(String),

    #[error("syntax error")]
    Syntax,

    #[error("semantic error")]
    Semantic,

    #[error("{cmd} failed (status {status})")]
    Ipc { cmd: String, status: i32 },

    #[error("internal compiler error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Source position: file, 1-based line, 0-based column.
///
/// The file path is leaked once per opened file so positions stay `Copy`
/// throughout the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub file: &'static Path,
    pub line: u32,
    pub col: u32,
}

impl Pos {
    pub fn new(file: &'static Path, line: u32, col: u32) -> Self {
        Self { file, line, col }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.col + 1)
    }
}

/// Collects positioned diagnostics for one compiler invocation.
///
/// Every message is written to `stderr` as `file:line:column: message` the
/// moment it is reported; the driver prints a summary count on exit when any
/// error occurred.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports an error at `pos`.
    pub fn error(&mut self, pos: Pos, msg: impl fmt::Display) {
        eprintln!("{pos}: error: {msg}");
        self.errors += 1;
    }

    /// Reports an error with no usable source position.
    pub fn error_no_pos(&mut self, msg: impl fmt::Display) {
        eprintln!("error: {msg}");
        self.errors += 1;
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    /// Returns `Ok(())` if no error has been reported since `mark`, otherwise
    /// the given taxonomy error.
    pub fn checkpoint(&self, mark: usize, err: Error) -> Result<()> {
        if self.errors > mark { Err(err) } else { Ok(()) }
    }

    /// Prints the closing summary line if any error was reported.
    pub fn summary(&self) {
        match self.errors {
            0 => {}
            1 => eprintln!("1 error generated."),
            n => eprintln!("{n} errors generated."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pos_formats_one_based_column() {
        let pos = Pos::new(Path::new("t.cb"), 3, 0);
        assert_eq!(pos.to_string(), "t.cb:3:1");
    }

    #[test]
    fn checkpoint_passes_without_new_errors() {
        let mut diag = Diagnostics::new();
        let mark = diag.error_count();
        assert!(diag.checkpoint(mark, Error::Semantic).is_ok());

        diag.error(Pos::new(Path::new("t.cb"), 1, 0), "boom");
        assert!(matches!(
            diag.checkpoint(mark, Error::Semantic),
            Err(Error::Semantic)
        ));
    }
}
