//! The x86-64 target description and the assembly text sink.
//!
//! The back end targets the System V AMD64 ABI as used by Linux, emitting
//! GAS-syntax text that assembles and links against the C library (`printf`,
//! `puts`, `strtol`, `exit`).
//!
//! Our treatment of the ABI is simpler than the full convention because of
//! the following design decisions:
//! - All values are 64-bit signed integers, so every move is a `movq` and
//!   every stack cell is 8 bytes.
//! - There is no register allocator: every variable lives in memory (a frame
//!   slot or a `.bss` cell), and expression evaluation works in `%rax` with
//!   `%r10`/`%r11` as scratch, spilling intermediates to the stack.
//! - Aggregates, floating point, and variadic conventions never come up; the
//!   only variadic callee is `printf`, which receives at most two integer
//!   class arguments and `%al` is irrelevant for a zero-SSE call on Linux.
//!
//! # Call stack frame
//!
//! The stack grows down and must be 16-byte aligned at every `call`.  A
//! function's frame looks like this:
//!
//! ```txt
//!   High memory addresses
//!
//!   +---------------------------+
//!   | Caller's frame            |
//!   +---------------------------+
//!   | Stack-passed arguments    |  16(%rbp), 24(%rbp), ...
//!   +---------------------------+
//!   | Return address            |
//!   +---------------------------+
//!   | Saved %rbp                |  <- %rbp
//!   +---------------------------+
//!   | Parameter slots           |  -8(%rbp), -16(%rbp), ...
//!   +---------------------------+
//!   | Local variable slots      |
//!   +---------------------------+
//!   | Spills and call padding   |  <- %rsp
//!   +---------------------------+
//!
//!   Low memory addresses
//! ```
//!
//! The first six arguments travel in `%rdi %rsi %rdx %rcx %r8 %r9` and are
//! copied into the parameter slots by the prologue; arguments seven onward
//! are read where the caller left them, above the return address.
//!
//! # Register use
//!
//! The generator touches only caller-saved registers, so functions have no
//! save/restore obligations beyond the `%rbp` frame link:
//!
//! - `%rax` is the working register: every expression is built in it, and it
//!   carries return values.
//! - `%r10` holds the right-hand side of a binary operator after it is popped
//!   back off the stack; `%r11` holds the right-hand side of a comparison.
//! - `%rdx` is clobbered by `cqto`/`idivq`; no value is ever live in it
//!   across an expression.

use std::fmt::{self, Write};

use derive_more::Display;

use crate::common::Id;

/// The registers the code generator touches.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Reg {
    #[display("%rax")]
    Rax,
    #[display("%rcx")]
    Rcx,
    #[display("%rdx")]
    Rdx,
    #[display("%rsi")]
    Rsi,
    #[display("%rdi")]
    Rdi,
    #[display("%r8")]
    R8,
    #[display("%r9")]
    R9,
    #[display("%r10")]
    R10,
    #[display("%r11")]
    R11,
}

/// Argument registers in the System V AMD64 parameter order.
pub static PARAMETER_REGISTERS: [Reg; 6] =
    [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// A destination (or source) operand: where a value must end up.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Operand {
    /// A register.
    #[display("{_0}")]
    Reg(Reg),
    /// A byte offset from the frame pointer.  Negative offsets are this
    /// function's slots; positive ones reach stack-passed arguments in the
    /// caller's frame.
    #[display("{_0}(%rbp)")]
    Frame(i64),
    /// A global variable cell in `.bss`.
    #[display(".{_0}")]
    Global(Id),
    /// An outgoing stack argument, relative to the stack pointer after the
    /// argument area has been reserved.
    #[display("{_0}(%rsp)")]
    StackArg(i64),
}

impl Operand {
    /// Is this operand a memory reference?  x86 has no memory-to-memory
    /// `mov`, so loads into these must be routed through a register.
    pub fn in_memory(&self) -> bool {
        !matches!(self, Operand::Reg(_))
    }
}

/// The mangled label of a compiled function.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[display("_func_{_0}")]
pub struct FuncLabel(pub Id);

/// A control-flow label, unique within the whole program: the function name
/// keeps functions apart and the counter keeps structures apart.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[display("._{function}_{tag}{index}")]
pub struct ControlLabel {
    pub function: Id,
    pub tag: LabelTag,
    pub index: u32,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum LabelTag {
    #[display("ELSE")]
    Else,
    #[display("ENDIF")]
    Endif,
    #[display("WCHECK")]
    Wcheck,
    #[display("WEND")]
    Wend,
}

/// The append-only sink the generator writes assembly lines into.
#[derive(Default)]
pub struct Emitter {
    text: String,
}

impl Emitter {
    pub fn new() -> Self {
        Emitter::default()
    }

    /// Emit one indented instruction line.
    pub fn ins(&mut self, instruction: impl Display) {
        let _ = writeln!(self.text, "\t{instruction}");
    }

    /// Emit a `movq`.
    pub fn mov(&mut self, src: impl Display, dst: impl Display) {
        self.ins(format_args!("movq {src}, {dst}"));
    }

    /// Emit a label definition.
    pub fn label(&mut self, label: impl Display) {
        let _ = writeln!(self.text, "{label}:");
    }

    /// Emit an unindented line, e.g. a section directive.
    pub fn raw(&mut self, line: impl Display) {
        let _ = writeln!(self.text, "{line}");
    }

    /// Emit an indented comment line.
    pub fn comment(&mut self, text: impl Display) {
        let _ = writeln!(self.text, "\t# {text}");
    }

    pub fn finish(self) -> Assembly {
        Assembly { text: self.text }
    }
}

/// A finished assembly program.
pub struct Assembly {
    text: String,
}

impl Assembly {
    pub fn asm_code(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Assembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
