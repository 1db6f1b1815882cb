//! Code generation: lower the parsed AST into NASM x86-64 assembly.
//!
//! The emitter uses a simple stack machine: every expression leaves its
//! 64-bit result in `rax`, binary operators stage the right operand through
//! the machine stack, and locals live on the frame addressed relative to
//! `rbp`. Arrays are `mmap`ed at run time with a length header and never
//! freed; the emitted programs terminate through the `exit` syscall before
//! that matters.

use std::collections::HashMap;

use crate::ast::{BinOp, Block, Expr, Program, Stmt};
use crate::error::Warning;

/// Result of lowering a program: the assembly text plus any degradation
/// warnings collected along the way.
#[derive(Debug)]
pub struct CodegenOutput {
  pub asm: String,
  pub warnings: Vec<Warning>,
}

/// Emit assembly for a whole program.
pub fn generate(program: &Program) -> CodegenOutput {
  let mut generator = Generator::new();
  generator.gen_program(program);
  CodegenOutput {
    asm: generator.asm,
    warnings: generator.warnings,
  }
}

struct Generator {
  asm: String,
  /// Scope stack; lookups walk from the last entry backwards.
  scopes: Vec<HashMap<String, i64>>,
  /// Byte distance of the most recently allocated local from `rbp`.
  stack_offset: i64,
  if_counter: usize,
  while_counter: usize,
  print_counter: usize,
  exited: bool,
  warnings: Vec<Warning>,
}

impl Generator {
  fn new() -> Self {
    Self {
      asm: String::new(),
      scopes: vec![HashMap::new()],
      stack_offset: 0,
      if_counter: 0,
      while_counter: 0,
      print_counter: 0,
      exited: false,
      warnings: Vec::new(),
    }
  }

  fn emit(&mut self, line: impl AsRef<str>) {
    self.asm.push_str("    ");
    self.asm.push_str(line.as_ref());
    self.asm.push('\n');
  }

  fn label(&mut self, name: impl AsRef<str>) {
    self.asm.push_str(name.as_ref());
    self.asm.push_str(":\n");
  }

  fn lookup(&self, name: &str) -> Option<i64> {
    self
      .scopes
      .iter()
      .rev()
      .find_map(|scope| scope.get(name).copied())
  }

  fn gen_program(&mut self, program: &Program) {
    self.asm.push_str("global _start\n");
    self.asm.push_str("section .text\n");
    self.label("_start");
    self.emit("push rbp");
    self.emit("mov rbp, rsp");

    for stmt in &program.stmts {
      self.gen_stmt(stmt);
    }

    if !self.exited {
      self.emit("mov rax, 60");
      self.emit("mov rdi, 0");
      self.emit("syscall");
    }
  }

  fn gen_stmt(&mut self, stmt: &Stmt) {
    match stmt {
      Stmt::Exit { value } => {
        self.gen_expr(value);
        self.emit("mov rdi, rax");
        self.emit("mov rax, 60");
        self.emit("syscall");
        self.exited = true;
      }
      Stmt::Let { name, value } => {
        self.gen_expr(value);
        let existing = self
          .scopes
          .last()
          .and_then(|scope| scope.get(&name.text))
          .copied();
        let offset = match existing {
          Some(offset) => offset,
          None => {
            self.stack_offset += 8;
            let offset = self.stack_offset;
            if let Some(scope) = self.scopes.last_mut() {
              scope.insert(name.text.clone(), offset);
            }
            self.emit("sub rsp, 8");
            offset
          }
        };
        self.emit(format!("mov [rbp - {offset}], rax"));
      }
      Stmt::Assign { name, value } => match self.lookup(&name.text) {
        Some(offset) => {
          self.gen_expr(value);
          self.emit(format!("mov [rbp - {offset}], rax"));
        }
        None => {
          self.warnings.push(Warning::UndefinedAssign {
            name: name.text.clone(),
          });
          self.emit(format!("; assignment to undefined variable '{}'", name.text));
        }
      },
      Stmt::IndexAssign {
        array,
        index,
        value,
      } => {
        self.gen_expr(array);
        self.emit("push rax");
        self.gen_expr(index);
        self.emit("add rax, 1");
        self.emit("imul rax, 8");
        self.emit("pop rbx");
        self.emit("add rax, rbx");
        self.emit("push rax");
        self.gen_expr(value);
        self.emit("pop rbx");
        self.emit("mov [rbx], rax");
      }
      Stmt::Block(block) => self.gen_block(block),
      Stmt::If {
        cond,
        then_block,
        else_block,
      } => {
        let n = self.if_counter;
        self.if_counter += 1;
        self.gen_expr(cond);
        self.emit("cmp rax, 0");
        match else_block {
          Some(else_block) => {
            self.emit(format!("je .if_else_{n}"));
            self.gen_block(then_block);
            self.emit(format!("jmp .if_end_{n}"));
            self.label(format!(".if_else_{n}"));
            self.gen_block(else_block);
            self.label(format!(".if_end_{n}"));
          }
          None => {
            self.emit(format!("je .if_end_{n}"));
            self.gen_block(then_block);
            self.label(format!(".if_end_{n}"));
          }
        }
      }
      Stmt::While { cond, body } => {
        let n = self.while_counter;
        self.while_counter += 1;
        self.label(format!(".while_start_{n}"));
        self.gen_expr(cond);
        self.emit("cmp rax, 0");
        self.emit(format!("je .while_end_{n}"));
        self.gen_block(body);
        self.emit(format!("jmp .while_start_{n}"));
        self.label(format!(".while_end_{n}"));
      }
      Stmt::Print { value } => self.gen_print(value),
    }
  }

  /// Lower a block: fresh scope on entry; on exit, release the locals the
  /// block allocated and drop the scope.
  fn gen_block(&mut self, block: &Block) {
    self.scopes.push(HashMap::new());
    let entry_offset = self.stack_offset;

    for stmt in &block.stmts {
      self.gen_stmt(stmt);
    }

    let delta = self.stack_offset - entry_offset;
    if delta > 0 {
      self.emit(format!("add rsp, {delta}"));
    }
    self.stack_offset = entry_offset;
    self.scopes.pop();
  }

  fn gen_expr(&mut self, expr: &Expr) {
    match expr {
      Expr::Int { token } => {
        self.emit(format!("mov rax, {}", token.text));
      }
      Expr::Var { token } => match self.lookup(&token.text) {
        Some(offset) => self.emit(format!("mov rax, [rbp - {offset}]")),
        None => {
          self.warnings.push(Warning::UndefinedVariable {
            name: token.text.clone(),
          });
          self.emit(format!("; undefined variable '{}'", token.text));
          self.emit("mov rax, 0");
        }
      },
      Expr::Binary { op, lhs, rhs } => {
        self.gen_expr(rhs);
        self.emit("push rax");
        self.gen_expr(lhs);
        self.emit("pop rbx");
        self.gen_binop(*op);
      }
      Expr::Array { elements } => self.gen_array(elements),
      Expr::Index { array, index } => {
        self.gen_expr(array);
        self.emit("push rax");
        self.gen_expr(index);
        self.emit("add rax, 1");
        self.emit("imul rax, 8");
        self.emit("pop rbx");
        self.emit("add rax, rbx");
        self.emit("mov rax, [rax]");
      }
      Expr::Len { array } => {
        self.gen_expr(array);
        self.emit("mov rax, [rax]");
      }
    }
  }

  /// Apply a binary operator to `rax` (left) and `rbx` (right), leaving the
  /// result in `rax`.
  fn gen_binop(&mut self, op: BinOp) {
    match op {
      BinOp::Add => self.emit("add rax, rbx"),
      BinOp::Sub => self.emit("sub rax, rbx"),
      BinOp::Mul => self.emit("imul rax, rbx"),
      // Unsigned div on purpose: division of negative values is undefined
      // by the language.
      BinOp::Div => {
        self.emit("mov rcx, rbx");
        self.emit("xor rdx, rdx");
        self.emit("div rcx");
      }
      BinOp::Mod => {
        self.emit("mov rcx, rbx");
        self.emit("xor rdx, rdx");
        self.emit("div rcx");
        self.emit("mov rax, rdx");
      }
      BinOp::Eq => self.gen_cmp("sete"),
      BinOp::Ne => self.gen_cmp("setne"),
      BinOp::Gt => self.gen_cmp("setg"),
      BinOp::Lt => self.gen_cmp("setl"),
      BinOp::Ge => self.gen_cmp("setge"),
      BinOp::Le => self.gen_cmp("setle"),
      // Both operands are already evaluated; `&&` and `||` do not
      // short-circuit.
      BinOp::And => self.emit("and rax, rbx"),
      BinOp::Or => self.emit("or rax, rbx"),
    }
  }

  fn gen_cmp(&mut self, set_instr: &str) {
    self.emit("cmp rax, rbx");
    self.emit(format!("{set_instr} al"));
    self.emit("movzx rax, al");
  }

  /// Array constructor: mmap(NULL, (len + 1) * 8, PROT_READ|PROT_WRITE,
  /// MAP_PRIVATE|MAP_ANONYMOUS, -1, 0), store the length header at offset 0
  /// and each element at offset (i + 1) * 8. The block is never unmapped.
  fn gen_array(&mut self, elements: &[Expr]) {
    let size = elements.len();
    self.emit("mov rax, 9");
    self.emit("mov rdi, 0");
    self.emit(format!("mov rsi, {}", (size + 1) * 8));
    self.emit("mov rdx, 3");
    self.emit("mov r10, 0x22");
    self.emit("mov r8, -1");
    self.emit("mov r9, 0");
    self.emit("syscall");
    self.emit("push rax");
    self.emit(format!("mov qword [rax], {size}"));

    for (i, element) in elements.iter().enumerate() {
      self.gen_expr(element);
      self.emit("mov rbx, [rsp]");
      self.emit(format!("mov [rbx + {}], rax", (i + 1) * 8));
    }

    self.emit("pop rax");
  }

  /// Convert the value in `rax` to decimal in a 32-byte stack buffer and
  /// write it to stdout followed by a newline. Digits are produced in
  /// reverse; a minus sign is stored speculatively one byte below the first
  /// digit and included only when the sign flag in `r9` is set.
  fn gen_print(&mut self, value: &Expr) {
    self.gen_expr(value);
    let n = self.print_counter;
    self.print_counter += 1;

    self.emit("sub rsp, 32");
    self.emit("lea rsi, [rsp + 32]");
    self.emit("mov rbx, 0");
    self.emit("dec rsi");
    self.emit("mov byte [rsi], 10");
    self.emit("inc rbx");
    self.emit("mov r9, 0");
    self.emit("cmp rax, 0");
    self.emit(format!("jge .print_positive_{n}"));
    self.emit("neg rax");
    self.emit("mov r9, 1");
    self.label(format!(".print_positive_{n}"));
    self.label(format!(".convert_loop_{n}"));
    self.emit("mov rcx, 10");
    self.emit("xor rdx, rdx");
    self.emit("div rcx");
    self.emit("add rdx, 48");
    self.emit("dec rsi");
    self.emit("mov [rsi], dl");
    self.emit("inc rbx");
    self.emit("cmp rax, 0");
    self.emit(format!("jne .convert_loop_{n}"));
    self.emit("mov byte [rsi - 1], 45");
    self.emit("sub rsi, r9");
    self.emit("add rbx, r9");
    self.emit("mov rax, 1");
    self.emit("mov rdi, 1");
    self.emit("mov rdx, rbx");
    self.emit("syscall");
    self.emit("add rsp, 32");
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use indoc::indoc;

  use super::*;
  use crate::parser::parse;
  use crate::tokenizer::tokenize;

  fn lower(source: &str) -> CodegenOutput {
    let (tokens, _) = tokenize(source);
    let program = parse(tokens, source).unwrap_or_else(|err| panic!("parse failed:\n{err}"));
    generate(&program)
  }

  fn asm(source: &str) -> String {
    lower(source).asm
  }

  #[test]
  fn header_and_default_epilogue() {
    let asm = asm("let x = 1;");
    assert!(asm.starts_with(
      "global _start\nsection .text\n_start:\n    push rbp\n    mov rbp, rsp\n"
    ));
    assert!(asm.ends_with("    mov rax, 60\n    mov rdi, 0\n    syscall\n"));
  }

  #[test]
  fn explicit_exit_suppresses_the_default_epilogue() {
    let asm = asm("exit(7);");
    assert!(asm.trim_end().ends_with("syscall"));
    assert_eq!(asm.matches("mov rax, 60").count(), 1);
    assert!(!asm.contains("mov rdi, 0"));
  }

  #[test]
  fn exit_anywhere_counts_as_an_exit() {
    let asm = asm("if (1) { exit(0); }");
    assert!(!asm.contains("mov rdi, 0"));
  }

  #[test]
  fn binary_operands_stage_through_the_stack() {
    let asm = asm("exit(2 + 5 * 3);");
    // Right operand first: the multiplication is pushed before 2 is loaded.
    let mul = asm.find("imul rax, rbx").expect("imul missing");
    let add = asm.find("add rax, rbx").expect("add missing");
    assert!(mul < add);
    assert_eq!(asm.matches("push rax").count(), 2);
    assert_eq!(asm.matches("pop rbx").count(), 2);
  }

  #[test]
  fn division_is_unsigned_by_design() {
    let asm = asm("exit(10 / 3);");
    assert!(asm.contains("div rcx"));
    assert!(!asm.contains("idiv"));
    assert!(!asm.contains("cqo"));
  }

  #[test]
  fn modulo_moves_the_remainder_into_rax() {
    let asm = asm("exit(10 % 3);");
    assert!(asm.contains("div rcx\n    mov rax, rdx"));
  }

  #[test]
  fn comparisons_produce_zero_or_one() {
    for (source, set_instr) in [
      ("exit(1 == 2);", "sete al"),
      ("exit(1 != 2);", "setne al"),
      ("exit(1 > 2);", "setg al"),
      ("exit(1 < 2);", "setl al"),
      ("exit(1 >= 2);", "setge al"),
      ("exit(1 <= 2);", "setle al"),
    ] {
      let asm = asm(source);
      assert!(asm.contains("cmp rax, rbx"), "{source}");
      assert!(asm.contains(set_instr), "{source}");
      assert!(asm.contains("movzx rax, al"), "{source}");
    }
  }

  #[test]
  fn logical_operators_evaluate_both_sides_without_branching() {
    let conjunction = asm("exit(1 && 2);");
    assert!(conjunction.contains("and rax, rbx"));
    assert!(conjunction.contains("mov rax, 1"));
    assert!(conjunction.contains("mov rax, 2"));
    // No control flow is emitted for `&&`.
    assert!(!conjunction.contains("je "));

    let disjunction = asm("exit(1 || 0);");
    assert!(disjunction.contains("or rax, rbx"));
  }

  #[test]
  fn let_allocates_once_per_name_per_scope() {
    let asm = asm("let x = 1; let x = 2;");
    assert_eq!(asm.matches("sub rsp, 8").count(), 1);
    assert_eq!(asm.matches("mov [rbp - 8], rax").count(), 2);
  }

  #[test]
  fn block_locals_are_released_on_exit() {
    let asm = asm("let x = 1; { let y = 2; let z = 3; } let w = 4;");
    // y and z occupy 16 bytes that the block hands back.
    assert!(asm.contains("add rsp, 16"));
    // w reuses the offsets freed by the block.
    assert_eq!(asm.matches("mov [rbp - 16], rax").count(), 2);
  }

  #[test]
  fn assignment_reaches_through_enclosing_scopes() {
    let asm = asm("let x = 1; { x = 2; }");
    assert_eq!(asm.matches("mov [rbp - 8], rax").count(), 2);
    // The block allocated nothing, so nothing is released.
    assert!(!asm.contains("add rsp,"));
  }

  #[test]
  fn shadowing_gets_its_own_slot() {
    let asm = asm("let x = 1; { let x = 2; }");
    assert!(asm.contains("mov [rbp - 8], rax"));
    assert!(asm.contains("mov [rbp - 16], rax"));
    assert!(asm.contains("add rsp, 8"));
  }

  #[test]
  fn undefined_read_degrades_to_zero_with_a_warning() {
    let output = lower("exit(y);");
    assert_eq!(output.warnings, vec![Warning::UndefinedVariable {
      name: "y".to_string()
    }]);
    assert!(output.asm.contains("; undefined variable 'y'"));
    assert!(output.asm.contains("mov rax, 0"));
  }

  #[test]
  fn undefined_assignment_emits_nothing_but_a_warning() {
    let output = lower("y = 5;");
    assert_eq!(output.warnings, vec![Warning::UndefinedAssign {
      name: "y".to_string()
    }]);
    assert!(output.asm.contains("; assignment to undefined variable 'y'"));
    // The right-hand side is not evaluated and no store happens.
    assert!(!output.asm.contains("mov rax, 5"));
    assert!(!output.asm.contains("mov [rbp"));
  }

  #[test]
  fn out_of_scope_read_warns_after_the_block_closes() {
    let output = lower("{ let y = 1; } exit(y);");
    assert_eq!(output.warnings, vec![Warning::UndefinedVariable {
      name: "y".to_string()
    }]);
  }

  #[test]
  fn array_literal_maps_a_sized_block_and_stores_a_header() {
    let asm = asm("let a = [10, 20, 30];");
    assert!(asm.contains("mov rax, 9"));
    assert!(asm.contains("mov rsi, 32"));
    assert!(asm.contains("mov rdx, 3"));
    assert!(asm.contains("mov r10, 0x22"));
    assert!(asm.contains("mov r8, -1"));
    assert!(asm.contains("mov qword [rax], 3"));
    assert!(asm.contains("mov [rbx + 8], rax"));
    assert!(asm.contains("mov [rbx + 16], rax"));
    assert!(asm.contains("mov [rbx + 24], rax"));
    // The mapping is never released.
    assert!(!asm.contains("munmap"));
  }

  #[test]
  fn indexed_access_scales_past_the_header() {
    let asm = asm("let a = [5]; exit(a[0]);");
    assert!(asm.contains("add rax, 1\n    imul rax, 8\n    pop rbx\n    add rax, rbx\n    mov rax, [rax]"));
  }

  #[test]
  fn indexed_store_mirrors_the_load() {
    let asm = asm("let a = [5]; a[0] = 9;");
    assert!(asm.contains("add rax, 1\n    imul rax, 8\n    pop rbx\n    add rax, rbx\n    push rax"));
    assert!(asm.contains("pop rbx\n    mov [rbx], rax"));
  }

  #[test]
  fn len_dereferences_the_header_word() {
    let asm = asm("let a = [1, 2]; exit(len(a));");
    assert!(asm.contains("mov rax, [rbp - 8]\n    mov rax, [rax]"));
  }

  #[test]
  fn print_converts_through_a_stack_buffer() {
    let asm = asm("print(42);");
    assert!(asm.contains("sub rsp, 32"));
    assert!(asm.contains(".print_positive_0:"));
    assert!(asm.contains(".convert_loop_0:"));
    assert!(asm.contains("mov rax, 1\n    mov rdi, 1\n    mov rdx, rbx\n    syscall"));
    assert!(asm.contains("add rsp, 32"));
  }

  #[test]
  fn labels_are_unique_across_the_program() {
    let asm = asm(indoc! {"
      let i = 0;
      while (i < 3) {
        if (i % 2 == 0) {
          print(i);
        } else {
          print(0 - i);
        }
        i = i + 1;
      }
      while (i > 0) {
        i = i - 1;
      }
      if (i == 0) {
        print(i);
      }
      exit(0);
    "});
    let mut seen = HashSet::new();
    for line in asm.lines() {
      if let Some(label) = line.strip_suffix(':') {
        assert!(seen.insert(label.to_string()), "duplicate label {label}");
      }
    }
    assert!(seen.contains("_start"));
    assert!(seen.contains(".while_start_0"));
    assert!(seen.contains(".while_start_1"));
    assert!(seen.contains(".if_else_0"));
    assert!(seen.contains(".if_end_1"));
    assert!(seen.contains(".print_positive_2"));
  }

  #[test]
  fn empty_program_is_just_the_frame_and_the_default_exit() {
    let asm = asm("");
    assert_eq!(
      asm,
      "global _start\nsection .text\n_start:\n    push rbp\n    mov rbp, rsp\n    mov rax, 60\n    mov rdi, 0\n    syscall\n"
    );
  }
}
