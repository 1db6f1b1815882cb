//! Recursive-descent parser producing the statement and expression tree.
//!
//! The parser keeps a precedence-climbing set of expression helpers and a
//! thin statement layer above them. Statement selection needs at most two
//! tokens of lookahead; the only place the cursor ever moves backwards is
//! the indexed-assignment attempt, which rolls back when the `=` after the
//! closing bracket is missing so a failed attempt consumes nothing.

use crate::ast::{BinOp, Block, Expr, Program, Stmt};
use crate::error::{CompileError, CompileResult};
use crate::tokenizer::{Token, TokenKind};

/// Parse the token stream into a program, stopping at the first error.
pub fn parse(tokens: Vec<Token>, source: &str) -> CompileResult<Program> {
  let mut stream = TokenStream::new(tokens, source);

  let mut stmts = Vec::new();
  while !stream.at_end() {
    stmts.push(parse_stmt(&mut stream)?);
  }

  Ok(Program { stmts })
}

// ----- Statement parsing -----

fn parse_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  match stream.peek_kind() {
    Some(TokenKind::Exit) => parse_exit_stmt(stream),
    Some(TokenKind::Let) => parse_let_stmt(stream),
    Some(TokenKind::Print) => parse_print_stmt(stream),
    Some(TokenKind::If) => parse_if_stmt(stream),
    Some(TokenKind::While) => parse_while_stmt(stream),
    Some(TokenKind::LBrace) => Ok(Stmt::Block(parse_block(stream)?)),
    Some(TokenKind::Ident) => parse_ident_stmt(stream),
    _ => Err(stream.error_here("expected a statement")),
  }
}

fn parse_exit_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  stream.skip(TokenKind::Exit, "expected 'exit'")?;
  stream.skip(TokenKind::LParen, "expected '(' after 'exit'")?;
  let value = parse_expr(stream)?;
  stream.skip(TokenKind::RParen, "expected ')' after exit value")?;
  stream.skip(TokenKind::Semicolon, "expected ';' after statement")?;
  Ok(Stmt::Exit { value })
}

fn parse_let_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  stream.skip(TokenKind::Let, "expected 'let'")?;
  let name = stream.get(TokenKind::Ident, "expected an identifier after 'let'")?;
  stream.skip(TokenKind::Assign, "expected '=' after variable name")?;
  let value = parse_expr(stream)?;
  stream.skip(TokenKind::Semicolon, "expected ';' after statement")?;
  Ok(Stmt::Let { name, value })
}

fn parse_print_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  stream.skip(TokenKind::Print, "expected 'print'")?;
  stream.skip(TokenKind::LParen, "expected '(' after 'print'")?;
  let value = parse_expr(stream)?;
  stream.skip(TokenKind::RParen, "expected ')' after print value")?;
  stream.skip(TokenKind::Semicolon, "expected ';' after statement")?;
  Ok(Stmt::Print { value })
}

fn parse_if_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  stream.skip(TokenKind::If, "expected 'if'")?;
  stream.skip(TokenKind::LParen, "expected '(' after 'if'")?;
  let cond = parse_expr(stream)?;
  stream.skip(TokenKind::RParen, "expected ')' after condition")?;
  let then_block = parse_block(stream)?;

  let else_block = if stream.equal(TokenKind::Else) {
    if stream.peek_is(TokenKind::If) {
      // `else if` becomes an else block holding the nested `if`.
      let nested = parse_if_stmt(stream)?;
      Some(Block {
        stmts: vec![nested],
      })
    } else {
      Some(parse_block(stream)?)
    }
  } else {
    None
  };

  Ok(Stmt::If {
    cond,
    then_block,
    else_block,
  })
}

fn parse_while_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  stream.skip(TokenKind::While, "expected 'while'")?;
  stream.skip(TokenKind::LParen, "expected '(' after 'while'")?;
  let cond = parse_expr(stream)?;
  stream.skip(TokenKind::RParen, "expected ')' after condition")?;
  let body = parse_block(stream)?;
  Ok(Stmt::While { cond, body })
}

fn parse_block(stream: &mut TokenStream) -> CompileResult<Block> {
  stream.skip(TokenKind::LBrace, "expected '{'")?;
  let mut stmts = Vec::new();
  loop {
    if stream.equal(TokenKind::RBrace) {
      break;
    }
    if stream.at_end() {
      return Err(stream.error_here("expected '}' to close block"));
    }
    stmts.push(parse_stmt(stream)?);
  }
  Ok(Block { stmts })
}

/// A statement starting with an identifier: either a plain assignment or an
/// indexed assignment, decided by the second token.
fn parse_ident_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  match stream.peek_second_kind() {
    Some(TokenKind::Assign) => {
      let name = stream.get(TokenKind::Ident, "expected an identifier")?;
      stream.skip(TokenKind::Assign, "expected '='")?;
      let value = parse_expr(stream)?;
      stream.skip(TokenKind::Semicolon, "expected ';' after statement")?;
      Ok(Stmt::Assign { name, value })
    }
    Some(TokenKind::LBracket) => parse_index_assign_stmt(stream),
    _ => Err(stream.error_here("expected '=' or '[' after identifier")),
  }
}

fn parse_index_assign_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  let start = stream.position();
  let name = stream.get(TokenKind::Ident, "expected an identifier")?;
  stream.skip(TokenKind::LBracket, "expected '['")?;
  let index = parse_expr(stream)?;
  stream.skip(TokenKind::RBracket, "expected ']' after index")?;

  if !stream.equal(TokenKind::Assign) {
    // Roll back so the failed attempt consumes nothing.
    stream.rewind(start);
    return Err(stream.error_here("expected '=' after indexed access"));
  }

  let value = parse_expr(stream)?;
  stream.skip(TokenKind::Semicolon, "expected ';' after statement")?;
  Ok(Stmt::IndexAssign {
    array: Expr::Var { token: name },
    index,
    value,
  })
}

// ----- Expression parsing -----

fn parse_expr(stream: &mut TokenStream) -> CompileResult<Expr> {
  parse_or(stream)
}

fn parse_or(stream: &mut TokenStream) -> CompileResult<Expr> {
  let mut node = parse_and(stream)?;
  while stream.equal(TokenKind::OrOr) {
    let rhs = parse_and(stream)?;
    node = Expr::binary(BinOp::Or, node, rhs);
  }
  Ok(node)
}

fn parse_and(stream: &mut TokenStream) -> CompileResult<Expr> {
  let mut node = parse_cmp(stream)?;
  while stream.equal(TokenKind::AndAnd) {
    let rhs = parse_cmp(stream)?;
    node = Expr::binary(BinOp::And, node, rhs);
  }
  Ok(node)
}

/// Equality and relational operators share one precedence level.
fn parse_cmp(stream: &mut TokenStream) -> CompileResult<Expr> {
  let mut node = parse_add(stream)?;

  loop {
    let op = match stream.peek_kind() {
      Some(TokenKind::EqEq) => BinOp::Eq,
      Some(TokenKind::NotEq) => BinOp::Ne,
      Some(TokenKind::Gt) => BinOp::Gt,
      Some(TokenKind::Lt) => BinOp::Lt,
      Some(TokenKind::GtEq) => BinOp::Ge,
      Some(TokenKind::LtEq) => BinOp::Le,
      _ => break,
    };
    stream.advance();
    let rhs = parse_add(stream)?;
    node = Expr::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_add(stream: &mut TokenStream) -> CompileResult<Expr> {
  let mut node = parse_mul(stream)?;

  loop {
    let op = match stream.peek_kind() {
      Some(TokenKind::Plus) => BinOp::Add,
      Some(TokenKind::Minus) => BinOp::Sub,
      _ => break,
    };
    stream.advance();
    let rhs = parse_mul(stream)?;
    node = Expr::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_mul(stream: &mut TokenStream) -> CompileResult<Expr> {
  let mut node = parse_primary(stream)?;

  loop {
    let op = match stream.peek_kind() {
      Some(TokenKind::Star) => BinOp::Mul,
      Some(TokenKind::Slash) => BinOp::Div,
      Some(TokenKind::Percent) => BinOp::Mod,
      _ => break,
    };
    stream.advance();
    let rhs = parse_primary(stream)?;
    node = Expr::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_primary(stream: &mut TokenStream) -> CompileResult<Expr> {
  match stream.peek_kind() {
    Some(TokenKind::IntLit) => {
      let token = stream.get(TokenKind::IntLit, "expected a number")?;
      Ok(Expr::Int { token })
    }
    Some(TokenKind::LBracket) => parse_array_literal(stream),
    Some(TokenKind::Len) => {
      stream.skip(TokenKind::Len, "expected 'len'")?;
      stream.skip(TokenKind::LParen, "expected '(' after 'len'")?;
      let array = parse_expr(stream)?;
      stream.skip(TokenKind::RParen, "expected ')' after len argument")?;
      Ok(Expr::len(array))
    }
    Some(TokenKind::Ident) => {
      let token = stream.get(TokenKind::Ident, "expected an identifier")?;
      if stream.equal(TokenKind::LBracket) {
        let index = parse_expr(stream)?;
        stream.skip(TokenKind::RBracket, "expected ']' after index")?;
        Ok(Expr::index(Expr::Var { token }, index))
      } else {
        Ok(Expr::Var { token })
      }
    }
    Some(TokenKind::LParen) => {
      stream.skip(TokenKind::LParen, "expected '('")?;
      let node = parse_expr(stream)?;
      stream.skip(TokenKind::RParen, "expected ')'")?;
      Ok(node)
    }
    _ => Err(stream.error_here("expected an expression")),
  }
}

fn parse_array_literal(stream: &mut TokenStream) -> CompileResult<Expr> {
  stream.skip(TokenKind::LBracket, "expected '['")?;
  let mut elements = Vec::new();
  if !stream.peek_is(TokenKind::RBracket) {
    loop {
      elements.push(parse_expr(stream)?);
      if !stream.equal(TokenKind::Comma) {
        break;
      }
    }
  }
  stream.skip(TokenKind::RBracket, "expected ']' to close array literal")?;
  Ok(Expr::Array { elements })
}

/// Lightweight cursor over the token vector.
struct TokenStream<'a> {
  tokens: Vec<Token>,
  source: &'a str,
  pos: usize,
}

impl<'a> TokenStream<'a> {
  fn new(tokens: Vec<Token>, source: &'a str) -> Self {
    Self {
      tokens,
      source,
      pos: 0,
    }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn peek_kind(&self) -> Option<TokenKind> {
    self.peek().map(|token| token.kind)
  }

  fn peek_second_kind(&self) -> Option<TokenKind> {
    self.tokens.get(self.pos + 1).map(|token| token.kind)
  }

  fn peek_is(&self, kind: TokenKind) -> bool {
    self.peek_kind() == Some(kind)
  }

  fn at_end(&self) -> bool {
    self.pos >= self.tokens.len()
  }

  fn position(&self) -> usize {
    self.pos
  }

  fn rewind(&mut self, pos: usize) {
    self.pos = pos;
  }

  fn advance(&mut self) {
    self.pos += 1;
  }

  fn current_loc(&self) -> usize {
    self
      .peek()
      .map(|token| token.loc)
      .unwrap_or(self.source.len())
  }

  /// Consume the current token if it has the given kind.
  fn equal(&mut self, kind: TokenKind) -> bool {
    if self.peek_is(kind) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn skip(&mut self, kind: TokenKind, message: &str) -> CompileResult<()> {
    if self.equal(kind) {
      Ok(())
    } else {
      Err(self.error_here(message))
    }
  }

  /// Consume and return the current token, which must have the given kind.
  fn get(&mut self, kind: TokenKind, message: &str) -> CompileResult<Token> {
    match self.peek() {
      Some(token) if token.kind == kind => {
        let token = token.clone();
        self.pos += 1;
        Ok(token)
      }
      _ => Err(self.error_here(message)),
    }
  }

  fn error_here(&self, message: &str) -> CompileError {
    CompileError::at(self.source, self.current_loc(), message)
  }
}
