//! the VSL compiler binary. takes a source file and an optional output
//! format (assembly by default).
//!
//! run with `--help` for more info.

use vsl::{back::*, front::*};

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file
    file: String,
    /// the output format
    #[arg(value_enum, short, long, default_value_t = Output::Asm)]
    out: Output,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Output {
    /// the list of tokens
    Tokens,
    /// the ast data structure
    Ast,
    /// the resolved program handed to the back end
    Sem,
    /// the resulting assembly code
    Asm,
}

/// Print the diagnostic and terminate with a failing status.
fn fail(diagnostic: impl std::fmt::Display) -> ! {
    eprintln!("{diagnostic}");
    std::process::exit(1);
}

fn main() {
    use Output::*;
    let args = Args::parse();

    let input = match std::fs::read_to_string(&args.file) {
        Ok(input) => input,
        Err(err) => fail(format_args!("cannot read {}: {err}", args.file)),
    };

    match args.out {
        Tokens => {
            let mut lexer = lex::Lexer::new(&input);
            loop {
                match lexer.next() {
                    Ok(Some(token)) => println!("{token}"),
                    Ok(None) => break,
                    Err(err) => fail(err),
                }
            }
        }
        Ast => match parse(&input) {
            Ok(program) => println!("{program:?}"),
            Err(err) => fail(err),
        },
        Sem => match parse(&input).map_err(|err| err.to_string()).and_then(|ast| {
            lower(&ast).map_err(|err| err.to_string())
        }) {
            Ok(program) => println!("{program:?}"),
            Err(err) => fail(err),
        },
        Asm => {
            let ast = parse(&input).unwrap_or_else(|err| fail(err));
            let program = lower(&ast).unwrap_or_else(|err| fail(err));
            let assembly = code_gen(&program).unwrap_or_else(|err| fail(err));
            print!("{assembly}");
        }
    }
}
