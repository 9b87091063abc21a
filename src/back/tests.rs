//! Back-end tests.
//!
//! Besides checking the emission patterns of representative programs, the
//! suite statically verifies the two frame invariants every generated
//! program must satisfy: each `call` happens with `%rsp` on a 16-byte
//! boundary, and each `ret` sees a balanced stack.  [`check_stack`] performs
//! an abstract interpretation of the text section, tracking the stack depth
//! through pushes, pops, pointer adjustments, and jump joins.

use std::collections::HashMap;

use crate::back::codegen::{code_gen, CodegenError};
use crate::front::{lower, parse};

fn compile(input: &str) -> String {
    let ast = parse(input).unwrap();
    let program = lower(&ast).unwrap();
    code_gen(&program).unwrap().asm_code().to_string()
}

fn generate(input: &str) -> Result<String, CodegenError> {
    let ast = parse(input).unwrap();
    let program = lower(&ast).unwrap();
    code_gen(&program).map(|assembly| assembly.asm_code().to_string())
}

/// Abstract stack depth at a program point: bytes pushed since function
/// entry (the return address itself not counted).
#[derive(Clone, Copy, PartialEq, Debug)]
enum Depth {
    Exact(i64),
    /// Unknown, but 16-byte aligned (only after `andq $-16, %rsp`).
    Aligned,
    /// Reachable from paths that disagree on the depth.
    Mixed,
    Unreachable,
}

fn merge(a: Depth, b: Depth) -> Depth {
    use Depth::*;
    match (a, b) {
        (Unreachable, other) | (other, Unreachable) => other,
        (Exact(x), Exact(y)) if x == y => Exact(x),
        (Aligned, Aligned) => Aligned,
        _ => Mixed,
    }
}

/// Statically verify the alignment and balance invariants over the text
/// section of a generated program.
fn check_stack(asm: &str) {
    use Depth::*;

    let text = &asm[asm.find(".section .text").expect("no text section")..];
    let mut depth = Unreachable;
    // Depth flowing into each label from jumps, and the depth a label was
    // finally visited at (for checking later, backward jumps).
    let mut incoming: HashMap<&str, Depth> = HashMap::new();
    let mut visited: HashMap<&str, Depth> = HashMap::new();

    for line in text.lines() {
        if let Some(instruction) = line.strip_prefix('\t') {
            if instruction.starts_with('#') || instruction.starts_with('.') {
                continue;
            }
            let (mnemonic, operands) = instruction
                .split_once(' ')
                .unwrap_or((instruction, ""));

            let rsp_delta = operands
                .strip_suffix(", %rsp")
                .and_then(|imm| imm.strip_prefix('$'))
                .and_then(|imm| imm.parse::<i64>().ok());

            match mnemonic {
                "pushq" => {
                    if let Exact(d) = depth {
                        depth = Exact(d + 8);
                    }
                }
                "popq" => {
                    if let Exact(d) = depth {
                        depth = Exact(d - 8);
                    }
                }
                "subq" | "addq" => {
                    if let (Exact(d), Some(n)) = (depth, rsp_delta) {
                        depth = Exact(if mnemonic == "subq" { d + n } else { d - n });
                    } else if rsp_delta.is_some() && depth != Unreachable {
                        depth = Mixed;
                    }
                }
                "andq" if operands == "$-16, %rsp" => {
                    if depth != Unreachable {
                        depth = Aligned;
                    }
                }
                "leave" => {
                    if depth != Unreachable {
                        depth = Exact(0);
                    }
                }
                "ret" => {
                    assert_eq!(depth, Exact(0), "unbalanced stack at ret: {line:?}");
                    depth = Unreachable;
                }
                "call" => match depth {
                    Exact(d) => assert_eq!(
                        (d + 8) % 16,
                        0,
                        "misaligned stack (depth {d}) at {line:?}"
                    ),
                    Aligned => {}
                    Mixed => panic!("call on a path-dependent stack depth: {line:?}"),
                    Unreachable => {}
                },
                "jmp" => {
                    if depth != Unreachable {
                        record(&mut incoming, &visited, operands, depth);
                    }
                    depth = Unreachable;
                }
                _ if mnemonic.starts_with('j') || mnemonic == "loop" => {
                    if depth != Unreachable {
                        record(&mut incoming, &visited, operands, depth);
                    }
                }
                _ => {}
            }
        } else if let Some(name) = line.strip_suffix(':') {
            if name.starts_with('.') && !name.starts_with("._") {
                continue; // data labels
            }
            if name.starts_with("_func_") || name == "main" {
                depth = Exact(0);
                continue;
            }
            depth = merge(depth, incoming.get(name).copied().unwrap_or(Unreachable));
            visited.insert(name, depth);
        }
    }
}

fn record<'a>(
    incoming: &mut HashMap<&'a str, Depth>,
    visited: &HashMap<&'a str, Depth>,
    target: &'a str,
    depth: Depth,
) {
    if let Some(&seen) = visited.get(target) {
        // Backward jump: the target was already laid down at a known depth.
        if let (Depth::Exact(a), Depth::Exact(b)) = (seen, depth) {
            assert_eq!(a, b, "jump to {target} at depth {b}, defined at {a}");
        }
        return;
    }
    let merged = merge(incoming.get(target).copied().unwrap_or(Depth::Unreachable), depth);
    incoming.insert(target, merged);
}

/// Every label in the program must be defined exactly once.
fn check_label_uniqueness(asm: &str) {
    let mut seen = HashMap::new();
    for line in asm.lines() {
        if line.starts_with('\t') {
            continue;
        }
        if let Some(name) = line.strip_suffix(':') {
            if let Some(previous) = seen.insert(name.to_string(), line) {
                panic!("label defined twice: {previous:?}");
            }
        }
    }
}

/// The scenario programs exercised throughout the suite.
const SCENARIOS: [&str; 8] = [
    "func f(x) { return x }",
    "func g(a, b) { return a*b + (a-b) }",
    "func main() { var x; x := 7; print \"answer\", x, x*6 }",
    "func h(a) { if a > 0 print \"pos\" else print \"nonpos\" return 0 }",
    "func main() {\n\
         var i\n\
         i := 0\n\
         while i < 5 {\n\
             i += 1\n\
             if i / 2 * 2 = i continue\n\
             print i\n\
         }\n\
         return 0\n\
     }",
    "func main(a, b, c, d, e, f, g) { return total(a, b, c, d, e, f, g) }\n\
     func total(a, b, c, d, e, f, g) { return a + b + c + d + e + f + g }",
    "var g\n\
     func main() { g := 5 if g > 4 { var h; h := g * 2 print \"big\", h } return g }",
    "func f(a, b) { var x, y; x := a; y := b; return x + y }",
];

#[test]
fn every_call_is_aligned_and_every_ret_balanced() {
    for scenario in SCENARIOS {
        check_stack(&compile(scenario));
    }
}

#[test]
fn labels_are_unique() {
    for scenario in SCENARIOS {
        check_label_uniqueness(&compile(scenario));
    }
}

#[test]
fn output_is_deterministic() {
    for scenario in SCENARIOS {
        assert_eq!(compile(scenario), compile(scenario));
    }
}

#[test]
fn every_function_reaches_a_ret() {
    for scenario in SCENARIOS {
        let asm = compile(scenario);
        for (index, _) in asm.match_indices(".globl _func_") {
            let rest = &asm[index..];
            let end = rest[1..]
                .find(".globl")
                .map(|offset| offset + 1)
                .unwrap_or(rest.len());
            assert!(
                rest[..end].contains("\tret\n"),
                "function without ret in:\n{rest}"
            );
        }
    }
}

#[test]
fn identity_function_round_trips_through_its_slot() {
    let asm = compile("func f(x) { return x }");
    assert!(asm.contains(
        ".globl _func_f\n\
         _func_f:\n\
         \tpushq %rbp\n\
         \tmovq %rsp, %rbp\n\
         \tsubq $8, %rsp\n\
         \tmovq %rdi, -8(%rbp)\n\
         \tmovq -8(%rbp), %rax\n\
         \tleave\n\
         \tret\n"
    ));
}

#[test]
fn binary_operators_evaluate_right_operand_first() {
    let asm = compile("func g(a, b) { return a*b + (a-b) }");
    // a is at -16(%rbp), b at -8(%rbp); the (a-b) subtree is evaluated and
    // parked before the a*b subtree starts.
    assert!(asm.contains(
        "\tmovq -8(%rbp), %rax\n\
         \tpushq %rax\n\
         \tmovq -16(%rbp), %rax\n\
         \tpopq %r10\n\
         \tsubq %r10, %rax\n\
         \tpushq %rax\n\
         \tmovq -8(%rbp), %rax\n\
         \tpushq %rax\n\
         \tmovq -16(%rbp), %rax\n\
         \tpopq %r10\n\
         \timulq %r10\n\
         \tpopq %r10\n\
         \taddq %r10, %rax\n\
         \tleave\n\
         \tret\n"
    ));
}

#[test]
fn parameters_and_locals_occupy_disjoint_slots() {
    let asm = compile(SCENARIOS[7]);
    // Parameter slots fill -8/-16 in reverse register order; the locals
    // follow at -24/-32, so all four cells are distinct.
    assert!(asm.contains(
        ".globl _func_f\n\
         _func_f:\n\
         \tpushq %rbp\n\
         \tmovq %rsp, %rbp\n\
         \tsubq $32, %rsp\n\
         \tmovq %rsi, -8(%rbp)\n\
         \tmovq %rdi, -16(%rbp)\n\
         \tmovq -16(%rbp), %rax\n\
         \tmovq %rax, -24(%rbp)\n\
         \tmovq -8(%rbp), %rax\n\
         \tmovq %rax, -32(%rbp)\n"
    ));
    // The sum then reads both locals back from their own slots.
    assert!(asm.contains(
        "\tmovq -32(%rbp), %rax\n\
         \tpushq %rax\n\
         \tmovq -24(%rbp), %rax\n\
         \tpopq %r10\n\
         \taddq %r10, %rax\n\
         \tleave\n\
         \tret\n"
    ));
}

#[test]
fn print_emits_one_printf_per_item_plus_newline() {
    let asm = compile("func main() { var x; x := 7; print \"answer\", x, x*6 }");
    assert!(asm.contains(".STR0:\n\t.asciz \"answer\"\n"));
    assert!(asm.contains("\tmovq $.strout, %rdi\n\tmovq $.STR0, %rsi\n"));
    assert!(asm.contains("\tmovq -8(%rbp), %rsi\n\tmovq $.intout, %rdi\n"));
    assert!(asm.contains("\tmovq $.newline, %rdi\n"));
    assert_eq!(asm.matches("\tcall printf\n").count(), 4);
    // Plain assignment stores straight into the slot.
    assert!(asm.contains("\tmovq $7, -8(%rbp)\n"));
}

#[test]
fn if_else_uses_inverse_jump_and_joined_labels() {
    let asm = compile("func h(a) { if a > 0 print \"pos\" else print \"nonpos\" return 0 }");
    assert!(asm.contains("\tmovq $0, %r11\n\tpopq %r10\n\tcmpq %r11, %r10\n\tjng ._h_ELSE0\n"));
    assert!(asm.contains("\tjmp ._h_ENDIF0\n._h_ELSE0:\n"));
    assert!(asm.contains("._h_ENDIF0:\n"));
    // The trailing return statement follows the join.
    assert!(asm.contains("._h_ENDIF0:\n\tmovq $0, %rax\n\tleave\n\tret\n"));
}

#[test]
fn while_with_continue_jumps_back_to_the_check() {
    let asm = compile(SCENARIOS[4]);
    assert!(asm.contains("._main_WCHECK0:\n"));
    assert!(asm.contains("\tjnl ._main_WEND0\n"));
    // The nested if takes the next label index.
    assert!(asm.contains("\tjne ._main_ENDIF1\n\tjmp ._main_WCHECK0\n._main_ENDIF1:\n"));
    // continue plus the loop's own back edge
    assert_eq!(asm.matches("\tjmp ._main_WCHECK0\n").count(), 2);
    assert!(asm.contains("._main_WEND0:\n"));
    // The compound assignment reads, applies, and writes back.
    assert!(asm.contains(
        "\tmovq $1, %r10\n\
         \tmovq -8(%rbp), %rax\n\
         \taddq %r10, %rax\n\
         \tmovq %rax, -8(%rbp)\n"
    ));
}

#[test]
fn seventh_argument_crosses_the_stack_boundary() {
    let asm = compile(SCENARIOS[5]);
    // Caller side: one aligned slot reserved, the seventh argument staged
    // through %rax into 0(%rsp), and the whole area released after the call.
    assert!(asm.contains(
        "\tsubq $16, %rsp\n\
         \tmovq -48(%rbp), %rdi\n\
         \tmovq -40(%rbp), %rsi\n\
         \tmovq -32(%rbp), %rdx\n\
         \tmovq -24(%rbp), %rcx\n\
         \tmovq -16(%rbp), %r8\n\
         \tmovq -8(%rbp), %r9\n\
         \tmovq 16(%rbp), %rax\n\
         \tmovq %rax, 0(%rsp)\n\
         \tcall _func_total\n\
         \taddq $16, %rsp\n"
    ));
    // Callee side: six register parameters land in distinct slots and the
    // seventh is read from above the frame.
    assert!(asm.contains(
        "_func_total:\n\
         \tpushq %rbp\n\
         \tmovq %rsp, %rbp\n\
         \tsubq $48, %rsp\n\
         \tmovq %r9, -8(%rbp)\n\
         \tmovq %r8, -16(%rbp)\n\
         \tmovq %rcx, -24(%rbp)\n\
         \tmovq %rdx, -32(%rbp)\n\
         \tmovq %rsi, -40(%rbp)\n\
         \tmovq %rdi, -48(%rbp)\n"
    ));
    assert!(asm.contains("\tmovq 16(%rbp), %rax\n"));
    check_stack(&asm);
}

#[test]
fn trampoline_parses_arguments_and_exits_with_the_result() {
    let asm = compile("func f(x) { return x }");
    assert!(asm.contains(
        ".globl main\n\
         .section .text\n\
         main:\n\
         \tpushq %rbp\n\
         \tmovq %rsp, %rbp\n\
         \tsubq $1, %rdi\n\
         \tcmpq $1, %rdi\n\
         \tjne ABORT\n\
         \tsubq $16, %rsp\n"
    ));
    assert!(asm.contains(
        "PARSE_ARGV:\n\
         \tpushq %rcx\n\
         \tpushq %rsi\n\
         \tmovq (%rsi), %rdi\n\
         \tmovq $0, %rsi\n\
         \tmovq $10, %rdx\n\
         \tcall strtol\n\
         \tpopq %rsi\n\
         \tpopq %rcx\n\
         \tmovq %rax, -8(%rsp,%rcx,8)\n\
         \tsubq $8, %rsi\n\
         \tloop PARSE_ARGV\n\
         \tpopq %rdi\n"
    ));
    assert!(asm.contains("\tcall _func_f\n"));
    assert!(asm.contains(
        "ABORT:\n\
         \tmovq $.errout, %rdi\n\
         \tcall puts\n\
         END:\n\
         \tmovq %rax, %rdi\n\
         \tandq $-16, %rsp\n\
         \tcall exit\n"
    ));
}

#[test]
fn trampoline_skips_argument_parsing_for_a_nullary_entry() {
    let asm = compile("func main() { return 0 }");
    assert!(asm.contains("\tcmpq $0, %rdi\n\tjne ABORT\n"));
    assert!(!asm.contains("PARSE_ARGV"));
    assert!(!asm.contains("call strtol"));
}

#[test]
fn trampoline_pops_only_six_registers_for_a_wide_entry() {
    let asm = compile(SCENARIOS[5]);
    assert!(asm.contains(
        "\tloop PARSE_ARGV\n\
         \tpopq %rdi\n\
         \tpopq %rsi\n\
         \tpopq %rdx\n\
         \tpopq %rcx\n\
         \tpopq %r8\n\
         \tpopq %r9\n"
    ));
}

#[test]
fn entry_defaults_to_the_first_function_without_a_main() {
    let asm = compile("func first() { return 1 } func second() { return 2 }");
    assert!(asm.contains("\tcall _func_first\n"));

    let asm = compile("func first() { return 1 } func main() { return 2 }");
    assert!(asm.contains("\tcall _func_main\n"));
}

#[test]
fn globals_live_in_bss_and_are_addressed_by_name() {
    let asm = compile(SCENARIOS[6]);
    assert!(asm.contains(".section .bss\n.align 8\n.g:\n"));
    assert!(asm.contains("\tmovq $5, .g\n"));
    assert!(asm.contains("\tmovq .g, %rax\n"));
}

#[test]
fn functions_without_a_return_get_the_synthetic_epilogue() {
    let asm = compile("func main() { print \"hi\" }");
    assert!(asm.contains("\t# implicit return\n\tmovq $0, %rax\n\tleave\n\tret\n"));
}

#[test]
fn unary_operators_work_in_place_on_the_destination() {
    let asm = compile("func f(x) { return -x }");
    assert!(asm.contains("\tmovq -8(%rbp), %rax\n\tnegq %rax\n"));

    let asm = compile("func f(x) { return ~x }");
    assert!(asm.contains("\tnotq %rax\n"));
}

#[test]
fn division_sign_extends_before_idivq() {
    let asm = compile("func f(a, b) { return a / b }");
    assert!(asm.contains("\tcqto\n\tidivq %r10\n"));

    let asm = compile("func main() { var x; x := 9; x /= 2 return x }");
    assert!(asm.contains(
        "\tmovq $2, %r10\n\
         \tmovq -8(%rbp), %rax\n\
         \tcqto\n\
         \tidivq %r10\n\
         \tmovq %rax, -8(%rbp)\n"
    ));
}

#[test]
fn wide_immediates_reach_memory_through_rax() {
    let asm = compile("func main() { var x; x := 4294967296 return x }");
    assert!(asm.contains("\tmovq $4294967296, %rax\n\tmovq %rax, -8(%rbp)\n"));
}

#[test]
fn nested_structures_get_distinct_labels() {
    let asm = compile("func f(a) { if a > 0 { if a > 1 print \"x\" } return a }");
    assert!(asm.contains("._f_ENDIF0:\n"));
    assert!(asm.contains("._f_ENDIF1:\n"));
    check_label_uniqueness(&asm);
    check_stack(&asm);
}

#[test]
fn a_return_in_one_branch_does_not_silence_the_other() {
    let asm = compile("func f(a) { if a > 0 return 1 else print \"no\" return 0 }");
    // The else branch still prints, and the join still reaches the final
    // return.
    assert!(asm.contains("\tcall printf\n"));
    assert_eq!(asm.matches("\tleave\n\tret\n").count(), 2);
    check_stack(&asm);
}

#[test]
fn arity_mismatch_is_a_fatal_codegen_error() {
    let result = generate("func f(x) { return x } func m() { return f(1, 2) }");
    assert!(matches!(
        result,
        Err(CodegenError::ArityMismatch { expected: 1, provided: 2, .. })
    ));
}

#[test]
fn continue_outside_a_loop_is_a_fatal_codegen_error() {
    let result = generate("func f(x) { continue }");
    assert!(matches!(result, Err(CodegenError::ContinueOutsideLoop { .. })));
}

#[test]
fn a_program_without_functions_has_no_entry() {
    let result = generate("var g");
    assert!(matches!(result, Err(CodegenError::NoEntryFunction)));
}
