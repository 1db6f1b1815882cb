//! Shared error and warning types used across the compilation pipeline.
//!
//! Diagnostics are kept lightweight on purpose – hard failures format the
//! offending source line with a caret under the offending column, and
//! non-fatal warnings travel as plain values so the driver decides where
//! they are printed.

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Snafu)]
pub enum CompileError {
  #[snafu(display("{line}\n{marker} {message}"))]
  Syntax {
    line: String,
    marker: String,
    message: String,
  },
}

impl CompileError {
  /// Construct an error anchored at a specific byte offset in the source.
  pub fn at(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let safe_loc = loc.min(source.len());
    let line_start = source[..safe_loc]
      .rfind('\n')
      .map(|nl| nl + 1)
      .unwrap_or(0);
    let line_end = source[safe_loc..]
      .find('\n')
      .map(|nl| safe_loc + nl)
      .unwrap_or(source.len());
    let column = source[line_start..safe_loc].chars().count();
    Self::Syntax {
      line: source[line_start..line_end].to_string(),
      marker: format!("{}^", " ".repeat(column)),
      message: message.into(),
    }
  }
}

/// Non-fatal diagnostics. The lexer and the generator degrade instead of
/// failing; each degradation is recorded as one of these.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum Warning {
  #[snafu(display("unterminated block comment, stopped at end of input"))]
  UnterminatedComment { loc: usize },

  #[snafu(display("use of undefined variable '{name}'"))]
  UndefinedVariable { name: String },

  #[snafu(display("assignment to undefined variable '{name}'"))]
  UndefinedAssign { name: String },
}
