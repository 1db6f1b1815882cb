use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{info, warn};

/// Source path used when no input file is given on the command line.
const DEFAULT_INPUT: &str = "main.yb";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Input source file path
  input: Option<PathBuf>,

  /// Where to write the generated NASM assembly
  #[clap(short, long, default_value = "out.asm")]
  output: PathBuf,

  /// Echo the token stream before parsing
  #[clap(long)]
  dump_tokens: bool,
}

fn main() {
  tracing_subscriber::fmt().init();
  let args = Args::parse();

  let input = args.input.unwrap_or_else(|| PathBuf::from(DEFAULT_INPUT));
  info!("reading {}", input.display());
  let source = match fs::read_to_string(&input) {
    Ok(source) => source,
    Err(err) => {
      eprintln!("failed to read {}: {err}", input.display());
      process::exit(1);
    }
  };

  let (tokens, lex_warnings) = ybc::tokenizer::tokenize(&source);
  if args.dump_tokens {
    for (i, token) in tokens.iter().enumerate() {
      println!("{i}: {:?} '{}'", token.kind, token.text);
    }
  }

  match ybc::compile_tokens(tokens, lex_warnings, &source) {
    Ok(output) => {
      for warning in &output.warnings {
        warn!("{warning}");
      }
      if let Err(err) = fs::write(&args.output, &output.asm) {
        eprintln!("failed to write {}: {err}", args.output.display());
        process::exit(1);
      }
      info!("assembly written to {}", args.output.display());
    }
    Err(err) => {
      eprintln!("{err}");
      process::exit(1);
    }
  }
}
