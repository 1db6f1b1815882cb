//! Crate root: wires together the compilation pipeline.
//!
//! The stages are intentionally small and composable so they can be evolved
//! independently:
//! - `tokenizer` performs lexical analysis and produces a flat token stream.
//! - `parser` owns all syntactic knowledge and returns the program AST.
//! - `codegen` lowers the program into NASM x86-64 assembly.
//! - `error` centralises the error and warning types shared by the stages.
//!
//! The pipeline is strictly linear (`text → tokens → AST → assembly`) and
//! performs no I/O; warnings are returned as values and the driver decides
//! how to report them.

pub mod ast;
pub mod codegen;
pub mod error;
pub mod parser;
pub mod tokenizer;

pub use error::{CompileError, CompileResult, Warning};

use tokenizer::Token;

/// Assembly text plus the non-fatal diagnostics gathered along the way.
#[derive(Debug)]
pub struct CompileOutput {
  pub asm: String,
  pub warnings: Vec<Warning>,
}

/// Compile a source string into NASM x86-64 assembly.
pub fn compile(source: &str) -> CompileResult<CompileOutput> {
  let (tokens, warnings) = tokenizer::tokenize(source);
  compile_tokens(tokens, warnings, source)
}

/// Compile an already-lexed token stream. `warnings` carries whatever the
/// lexer reported for the same source, so a driver that lexed once (say, to
/// echo the tokens) does not have to lex again.
pub fn compile_tokens(
  tokens: Vec<Token>,
  mut warnings: Vec<Warning>,
  source: &str,
) -> CompileResult<CompileOutput> {
  let program = parser::parse(tokens, source)?;
  let generated = codegen::generate(&program);
  warnings.extend(generated.warnings);

  Ok(CompileOutput {
    asm: generated.asm,
    warnings,
  })
}
