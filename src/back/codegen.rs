//! The code generator.
//!
//! Lowers the resolved program to assembly in one left-to-right, depth-first
//! pass.  There is no intermediate representation: every expression is
//! lowered against a *destination* operand chosen by its context (`%rax` for
//! statement results, a parameter register or outgoing stack slot for call
//! arguments, the resolved l-value for assignments), and every statement
//! emits its text immediately.
//!
//! Three pieces of per-function state thread through the recursion:
//!
//! - the stack *alignment counter*, the exact number of bytes subtracted
//!   from `%rsp` since the prologue.  Every push, pop, and allocation goes
//!   through [`Frame`] so the counter never drifts, and every `call` is
//!   bracketed by an align/release pair computed from it;
//! - the *label counter*.  Each `if`/`while` takes the next value when it
//!   starts lowering, so siblings and nested structures can never collide;
//! - the control [`Flow`]: whether the current straight-line path has
//!   already returned (suppresses unreachable code and the synthetic
//!   epilogue), and the check label of the innermost enclosing loop, which
//!   is where `continue` jumps.
//!
//! Binary operators evaluate the right operand first and park it on the
//! stack while the left operand is built in `%rax`.  This keeps `%rax` free
//! for the whole left subtree at the cost of one push/pop per operator, and
//! it is the only place evaluation order deviates from source order.

use derive_more::Display;

use crate::common::Id;
use crate::front::ast::{BOp, RelOp, UOp};
use crate::middle::sem;
use crate::middle::sem::SymbolKind;

use super::asm::*;

#[derive(Debug, Display)]
pub enum CodegenError {
    #[display(
        "wrong number of arguments for call to {callee} in {caller}: expected {expected}, provided {provided}"
    )]
    ArityMismatch {
        caller: Id,
        callee: Id,
        expected: usize,
        provided: usize,
    },
    #[display("continue outside of any loop in {function}")]
    ContinueOutsideLoop { function: Id },
    #[display("program declares no functions")]
    NoEntryFunction,
}

/// Generate the complete assembly program: the string table, the global
/// variable cells, every function, and the entry trampoline.
pub fn code_gen(program: &sem::Program) -> Result<Assembly, CodegenError> {
    ModuleGen {
        program,
        asm: Emitter::new(),
    }
    .run()
}

/// The stack alignment counter: how many bytes `%rsp` has moved down since
/// the prologue established the frame.  At that point the stack is 16-byte
/// aligned, so a `call` is legal exactly when the counter is a multiple
/// of 16.
#[derive(Default)]
struct Frame {
    alignment: u32,
}

impl Frame {
    /// Grow the stack by `slots` 8-byte cells.  No alignment guarantee.
    fn allocate(&mut self, asm: &mut Emitter, slots: u32) {
        if slots == 0 {
            return;
        }
        self.alignment += 8 * slots;
        asm.ins(format_args!("subq ${}, %rsp", 8 * slots));
    }

    /// Grow the stack by `slots` cells plus whatever padding brings the
    /// counter to a multiple of 16, in a single adjustment.  Returns the
    /// padding.
    fn allocate_aligned(&mut self, asm: &mut Emitter, slots: u32) -> u32 {
        self.alignment += 8 * slots;
        let pad = (16 - self.alignment % 16) % 16;
        self.alignment += pad;
        let total = 8 * slots + pad;
        if total > 0 {
            asm.ins(format_args!("subq ${total}, %rsp"));
        }
        pad
    }

    /// Pad the stack to a multiple of 16 ahead of a call.  Returns the
    /// padding.
    fn align(&mut self, asm: &mut Emitter) -> u32 {
        let pad = (16 - self.alignment % 16) % 16;
        if pad != 0 {
            self.alignment += pad;
            asm.ins(format_args!("subq ${pad}, %rsp"));
        }
        pad
    }

    /// Give back bytes taken by [`Frame::align`] or [`Frame::allocate_aligned`].
    fn release(&mut self, asm: &mut Emitter, bytes: u32) {
        if bytes != 0 {
            self.alignment -= bytes;
            asm.ins(format_args!("addq ${bytes}, %rsp"));
        }
    }

    fn push(&mut self, asm: &mut Emitter, reg: Reg) {
        self.alignment += 8;
        asm.ins(format_args!("pushq {reg}"));
    }

    fn pop(&mut self, asm: &mut Emitter, reg: Reg) {
        self.alignment -= 8;
        asm.ins(format_args!("popq {reg}"));
    }
}

struct ModuleGen<'p> {
    program: &'p sem::Program,
    asm: Emitter,
}

impl<'p> ModuleGen<'p> {
    fn run(mut self) -> Result<Assembly, CodegenError> {
        self.string_table();
        self.global_variables();
        self.functions()?;
        let entry = self.entry()?;
        self.trampoline(entry);
        Ok(self.asm.finish())
    }

    /// `.rodata`: the fixed format strings used by `print` and the
    /// trampoline, then every interned string literal.
    fn string_table(&mut self) {
        self.asm.raw(".section .rodata");
        self.asm.label(".newline");
        self.asm.ins(r#".asciz "\n""#);
        self.asm.label(".intout");
        self.asm.ins(r#".asciz "%ld ""#);
        self.asm.label(".strout");
        self.asm.ins(r#".asciz "%s ""#);
        self.asm.label(".errout");
        self.asm.ins(r#".asciz "Wrong number of arguments""#);

        for (index, string) in self.program.strings.iter().enumerate() {
            self.asm.label(format_args!(".STR{index}"));
            self.asm.ins(format_args!(".asciz \"{string}\""));
        }
    }

    /// `.bss`: one 8-byte cell per global variable.
    fn global_variables(&mut self) {
        self.asm.raw(".section .bss");
        self.asm.raw(".align 8");
        for name in &self.program.globals {
            self.asm.label(Operand::Global(*name));
        }
    }

    fn functions(&mut self) -> Result<(), CodegenError> {
        self.asm.raw(".section .text");
        for function in &self.program.functions {
            FunctionGen {
                asm: &mut self.asm,
                function,
                frame: Frame::default(),
                labels: 0,
            }
            .generate()?;
        }
        Ok(())
    }

    /// The function the trampoline calls: `main` if the program declares
    /// one, otherwise the first-declared function.
    fn entry(&self) -> Result<&'p sem::Function, CodegenError> {
        let functions = &self.program.functions;
        functions
            .iter()
            .find(|function| function.name.as_str() == "main")
            .or_else(|| functions.iter().min_by_key(|function| function.seq))
            .ok_or(CodegenError::NoEntryFunction)
    }

    /// The program entry point: parse the command-line arguments as base-10
    /// integers, hand them to the entry function per the calling convention,
    /// and pass its result to `exit`.
    fn trampoline(&mut self, entry: &sem::Function) {
        let nparms = entry.nparms;
        let mut frame = Frame::default();

        self.asm.raw(".globl main");
        self.asm.raw(".section .text");
        self.asm.label("main");
        self.asm.ins("pushq %rbp");
        self.asm.mov("%rsp", "%rbp");

        // Drop the program name, then reject a wrong argument count.
        self.asm.ins("subq $1, %rdi");
        self.asm.ins(format_args!("cmpq ${nparms}, %rdi"));
        self.asm.ins("jne ABORT");

        if nparms > 0 {
            // Reserve one aligned block of value slots up front and fill it
            // by index.  The loop's own saves then keep every strtol call
            // aligned, and the finished block reads like pushed arguments:
            // value 0 on top, excess values in stack-argument order.
            frame.allocate_aligned(&mut self.asm, nparms as u32);
            self.asm.mov("%rdi", "%rcx");
            self.asm.ins(format_args!("addq ${}, %rsi", 8 * nparms));
            self.asm.label("PARSE_ARGV");
            frame.push(&mut self.asm, Reg::Rcx);
            frame.push(&mut self.asm, Reg::Rsi);
            self.asm.mov("(%rsi)", Reg::Rdi);
            self.asm.mov("$0", Reg::Rsi);
            self.asm.mov("$10", Reg::Rdx);
            let pad = frame.align(&mut self.asm);
            self.asm.ins("call strtol");
            frame.release(&mut self.asm, pad);
            frame.pop(&mut self.asm, Reg::Rsi);
            frame.pop(&mut self.asm, Reg::Rcx);
            self.asm.mov(Reg::Rax, "-8(%rsp,%rcx,8)");
            self.asm.ins("subq $8, %rsi");
            self.asm.ins("loop PARSE_ARGV");

            for index in 0..nparms.min(6) {
                frame.pop(&mut self.asm, PARAMETER_REGISTERS[index]);
            }
        }

        let pad = frame.align(&mut self.asm);
        self.asm.ins(format_args!("call {}", FuncLabel(entry.name)));
        frame.release(&mut self.asm, pad);
        self.asm.ins("jmp END");

        self.asm.label("ABORT");
        self.asm.mov("$.errout", Reg::Rdi);
        self.asm.ins("call puts");

        self.asm.label("END");
        self.asm.mov(Reg::Rax, Reg::Rdi);
        // The two paths reach here at different stack depths; exit never
        // returns, so clamping the pointer satisfies the ABI on both.
        self.asm.ins("andq $-16, %rsp");
        self.asm.ins("call exit");
    }
}

/// Control-flow facts about the statement currently being lowered.
#[derive(Clone, Copy, Default)]
struct Flow {
    /// A `return` has been emitted on this straight-line path.
    returned: bool,
    /// The check label of the innermost enclosing `while`.
    loop_check: Option<ControlLabel>,
}

struct FunctionGen<'a> {
    asm: &'a mut Emitter,
    function: &'a sem::Function,
    frame: Frame,
    labels: u32,
}

impl FunctionGen<'_> {
    fn generate(mut self) -> Result<(), CodegenError> {
        let function = self.function;
        let label = FuncLabel(function.name);
        self.asm.raw(format_args!(".globl {label}"));
        self.asm.label(label);
        self.asm.ins("pushq %rbp");
        self.asm.mov("%rsp", "%rbp");

        let paramc = function.nparms.min(6);
        self.frame
            .allocate(self.asm, (paramc + function.nlocals) as u32);

        // Store register arguments into the frame, last register first, so
        // declaration-order parameters sit at decreasing addresses.
        for slot in 0..paramc {
            self.asm.mov(
                PARAMETER_REGISTERS[paramc - slot - 1],
                Operand::Frame(-8 * (slot as i64 + 1)),
            );
        }

        let mut flow = Flow::default();
        self.stmt(&function.body, &mut flow)?;

        if !flow.returned {
            self.asm.comment("implicit return");
            self.asm.mov("$0", Reg::Rax);
            self.asm.ins("leave");
            self.asm.ins("ret");
        }
        Ok(())
    }

    /// Take the next label index; called once per control structure.
    fn next_label(&mut self) -> u32 {
        let index = self.labels;
        self.labels += 1;
        index
    }

    fn control_label(&self, tag: LabelTag, index: u32) -> ControlLabel {
        ControlLabel {
            function: self.function.name,
            tag,
            index,
        }
    }

    /// The memory or register operand a variable lives in.
    fn variable_operand(&self, symbol: &sem::Symbol) -> Operand {
        let nparms = self.function.nparms;
        match symbol.kind {
            SymbolKind::Global => Operand::Global(symbol.name),
            SymbolKind::Parameter if symbol.seq >= 6 => {
                // Arguments seven onward are read where the caller left
                // them, above the return address and the saved %rbp.
                Operand::Frame(16 + 8 * (symbol.seq as i64 - 6))
            }
            SymbolKind::Parameter => {
                let slot = nparms.min(6) as i64 - 1 - symbol.seq as i64;
                Operand::Frame(-8 * (slot + 1))
            }
            SymbolKind::Local => {
                let slot = (symbol.seq + nparms.min(6)) as i64;
                Operand::Frame(-8 * (slot + 1))
            }
        }
    }

    fn stmt(&mut self, stmt: &sem::Stmt, flow: &mut Flow) -> Result<(), CodegenError> {
        match stmt {
            sem::Stmt::Block(stmts) => {
                for stmt in stmts {
                    if flow.returned {
                        break;
                    }
                    self.stmt(stmt, flow)?;
                }
                Ok(())
            }
            sem::Stmt::Assign {
                target,
                op: None,
                value,
            } => {
                let dest = self.variable_operand(target);
                self.expr(value, dest)
            }
            sem::Stmt::Assign {
                target,
                op: Some(op),
                value,
            } => {
                self.expr(value, Operand::Reg(Reg::R10))?;
                let target = self.variable_operand(target);
                self.asm.mov(target, Reg::Rax);
                self.arith(*op);
                self.asm.mov(Reg::Rax, target);
                Ok(())
            }
            sem::Stmt::Print(items) => {
                for item in items {
                    match item {
                        sem::PrintItem::Text(index) => {
                            self.asm.mov("$.strout", Reg::Rdi);
                            self.asm.mov(format_args!("$.STR{index}"), Reg::Rsi);
                        }
                        sem::PrintItem::Value(expr) => {
                            self.expr(expr, Operand::Reg(Reg::Rsi))?;
                            self.asm.mov("$.intout", Reg::Rdi);
                        }
                    }
                    self.printf();
                }
                self.asm.mov("$.newline", Reg::Rdi);
                self.printf();
                Ok(())
            }
            sem::Stmt::Return(expr) => {
                self.expr(expr, Operand::Reg(Reg::Rax))?;
                self.asm.ins("leave");
                self.asm.ins("ret");
                flow.returned = true;
                Ok(())
            }
            sem::Stmt::If { guard, tt, ff } => {
                let index = self.next_label();
                let endif = self.control_label(LabelTag::Endif, index);
                let skip = match ff {
                    Some(_) => self.control_label(LabelTag::Else, index),
                    None => endif,
                };
                self.relation(guard, skip)?;

                // Each branch tracks its own returned flag: a return in one
                // branch must not suppress the other, and only a return on
                // both sides makes the whole statement terminal.
                let mut tt_flow = Flow {
                    returned: false,
                    loop_check: flow.loop_check,
                };
                self.stmt(tt, &mut tt_flow)?;

                match ff {
                    Some(ff) => {
                        self.asm.ins(format_args!("jmp {endif}"));
                        self.asm.label(skip);
                        let mut ff_flow = Flow {
                            returned: false,
                            loop_check: flow.loop_check,
                        };
                        self.stmt(ff, &mut ff_flow)?;
                        self.asm.label(endif);
                        flow.returned |= tt_flow.returned && ff_flow.returned;
                    }
                    None => self.asm.label(endif),
                }
                Ok(())
            }
            sem::Stmt::While { guard, body } => {
                let index = self.next_label();
                let check = self.control_label(LabelTag::Wcheck, index);
                let end = self.control_label(LabelTag::Wend, index);

                self.asm.label(check);
                self.relation(guard, end)?;
                let mut body_flow = Flow {
                    returned: false,
                    loop_check: Some(check),
                };
                self.stmt(body, &mut body_flow)?;
                self.asm.ins(format_args!("jmp {check}"));
                self.asm.label(end);
                Ok(())
            }
            sem::Stmt::Continue => match flow.loop_check {
                Some(check) => {
                    self.asm.ins(format_args!("jmp {check}"));
                    Ok(())
                }
                None => Err(CodegenError::ContinueOutsideLoop {
                    function: self.function.name,
                }),
            },
        }
    }

    /// Lower a guard: leave the comparison flags set and jump to `skip`
    /// when the relation does not hold.
    fn relation(&mut self, relation: &sem::Relation, skip: ControlLabel) -> Result<(), CodegenError> {
        self.expr(&relation.lhs, Operand::Reg(Reg::Rax))?;
        self.frame.push(self.asm, Reg::Rax);
        self.expr(&relation.rhs, Operand::Reg(Reg::R11))?;
        self.frame.pop(self.asm, Reg::R10);
        self.asm.ins("cmpq %r11, %r10");

        let inverse = match relation.op {
            RelOp::Equal => "jne",
            RelOp::Greater => "jng",
            RelOp::Less => "jnl",
        };
        self.asm.ins(format_args!("{inverse} {skip}"));
        Ok(())
    }

    /// Lower an expression so its value ends up in `dest`.
    fn expr(&mut self, expr: &sem::Expr, dest: Operand) -> Result<(), CodegenError> {
        match expr {
            sem::Expr::Const(value) => {
                self.immediate(*value, dest);
                Ok(())
            }
            sem::Expr::Var(symbol) => {
                self.load(symbol, dest);
                Ok(())
            }
            sem::Expr::Call { callee, args } => {
                self.call(callee, args)?;
                if dest != Operand::Reg(Reg::Rax) {
                    self.asm.mov(Reg::Rax, dest);
                }
                Ok(())
            }
            sem::Expr::UOp { op, operand } => {
                self.expr(operand, dest)?;
                let mnemonic = match op {
                    UOp::Neg => "negq",
                    UOp::Not => "notq",
                };
                self.asm.ins(format_args!("{mnemonic} {dest}"));
                Ok(())
            }
            sem::Expr::BOp { op, lhs, rhs } => {
                self.expr(rhs, Operand::Reg(Reg::Rax))?;
                self.frame.push(self.asm, Reg::Rax);
                self.expr(lhs, Operand::Reg(Reg::Rax))?;
                self.frame.pop(self.asm, Reg::R10);
                self.arith(*op);
                if dest != Operand::Reg(Reg::Rax) {
                    self.asm.mov(Reg::Rax, dest);
                }
                Ok(())
            }
        }
    }

    /// Apply a binary operator to `%rax` (left) and `%r10` (right), leaving
    /// the result in `%rax`.
    fn arith(&mut self, op: BOp) {
        match op {
            BOp::Or => self.asm.ins("orq %r10, %rax"),
            BOp::Xor => self.asm.ins("xorq %r10, %rax"),
            BOp::And => self.asm.ins("andq %r10, %rax"),
            BOp::Add => self.asm.ins("addq %r10, %rax"),
            BOp::Sub => self.asm.ins("subq %r10, %rax"),
            BOp::Mul => self.asm.ins("imulq %r10"),
            BOp::Div => {
                self.asm.ins("cqto");
                self.asm.ins("idivq %r10");
            }
        }
    }

    /// Materialize a constant.  `movq` only sign-extends a 32-bit
    /// immediate, so wider constants reach memory through `%rax`.
    fn immediate(&mut self, value: i64, dest: Operand) {
        if dest.in_memory() && i32::try_from(value).is_err() {
            self.asm.mov(format_args!("${value}"), Reg::Rax);
            self.asm.mov(Reg::Rax, dest);
        } else {
            self.asm.mov(format_args!("${value}"), dest);
        }
    }

    /// Load a variable.  x86 has no memory-to-memory move, so a memory
    /// destination is reached through `%rax`.
    fn load(&mut self, symbol: &sem::Symbol, dest: Operand) {
        let src = self.variable_operand(symbol);
        if dest.in_memory() {
            self.asm.mov(src, Reg::Rax);
            self.asm.mov(Reg::Rax, dest);
        } else {
            self.asm.mov(src, dest);
        }
    }

    /// Lower a call: marshal each argument straight into its parameter
    /// register or outgoing stack slot, with the argument area reserved and
    /// the stack aligned in one adjustment.  The result is in `%rax`.
    fn call(&mut self, callee: &sem::FuncRef, args: &[sem::Expr]) -> Result<(), CodegenError> {
        if args.len() != callee.nparms {
            return Err(CodegenError::ArityMismatch {
                caller: self.function.name,
                callee: callee.name,
                expected: callee.nparms,
                provided: args.len(),
            });
        }

        let extra = callee.nparms.saturating_sub(6) as u32;
        let pad = self.frame.allocate_aligned(self.asm, extra);
        for (index, arg) in args.iter().enumerate() {
            let dest = match PARAMETER_REGISTERS.get(index) {
                Some(reg) => Operand::Reg(*reg),
                None => Operand::StackArg(8 * (index as i64 - 6)),
            };
            self.expr(arg, dest)?;
        }
        self.asm.ins(format_args!("call {}", FuncLabel(callee.name)));
        self.frame.release(self.asm, pad + 8 * extra);
        Ok(())
    }

    /// Call printf with the argument registers already loaded.
    fn printf(&mut self) {
        let pad = self.frame.align(self.asm);
        self.asm.ins("call printf");
        self.frame.release(self.asm, pad);
    }
}
