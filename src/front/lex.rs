//! The lexer.

use std::fmt;

use derive_more::Display;
use regex::Regex;

/// Tokens in the program
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    pub kind: TokenKind,
    /// What part of the input this token carries.
    pub text: &'src str,
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
pub enum TokenKind {
    #[display("id")]
    Id,
    #[display("num")]
    Num,
    #[display("string")]
    Str,
    #[display("func")]
    Func,
    #[display("var")]
    Var,
    #[display("print")]
    Print,
    #[display("return")]
    Return,
    #[display("if")]
    If,
    #[display("else")]
    Else,
    #[display("while")]
    While,
    #[display("continue")]
    Continue,
    #[display(":=")]
    Assign,
    #[display("+=")]
    AddAssign,
    #[display("-=")]
    SubAssign,
    #[display("*=")]
    MulAssign,
    #[display("/=")]
    DivAssign,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display(",")]
    Comma,
    #[display(";")]
    Semi,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Mul,
    #[display("/")]
    Div,
    #[display("|")]
    Or,
    #[display("^")]
    Xor,
    #[display("&")]
    And,
    #[display("~")]
    Tilde,
    #[display("=")]
    Eq,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
}

pub struct LexError(usize, char);

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lexer error: unexpected character {:?} at {}", self.1, self.0)
    }
}

impl fmt::Debug for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lexer error: unexpected character {:?} at {}", self.1, self.0)
    }
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    whitespace: Regex,
    matchers: Vec<(Regex, TokenKind)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        use TokenKind::*;

        let matcher = |pattern, kind| (Regex::new(pattern).unwrap(), kind);

        Lexer {
            input,
            pos: 0,
            whitespace: Regex::new(r"\A(?:[ \t\f\r\n\v]|(?://.*))*").unwrap(),
            // Tried in order, so multi-character operators come before their
            // single-character prefixes.
            matchers: vec![
                matcher(r#"\A"(?:[^"\\]|\\.)*""#, Str),
                matcher(r"\A[0-9]+", Num),
                matcher(r"\A[A-Za-z_][A-Za-z0-9_]*", Id),
                matcher(r"\A:=", Assign),
                matcher(r"\A\+=", AddAssign),
                matcher(r"\A-=", SubAssign),
                matcher(r"\A\*=", MulAssign),
                matcher(r"\A/=", DivAssign),
                matcher(r"\A\(", LParen),
                matcher(r"\A\)", RParen),
                matcher(r"\A\{", LBrace),
                matcher(r"\A\}", RBrace),
                matcher(r"\A,", Comma),
                matcher(r"\A;", Semi),
                matcher(r"\A\+", Plus),
                matcher(r"\A-", Minus),
                matcher(r"\A\*", Mul),
                matcher(r"\A/", Div),
                matcher(r"\A\|", Or),
                matcher(r"\A\^", Xor),
                matcher(r"\A&", And),
                matcher(r"\A~", Tilde),
                matcher(r"\A=", Eq),
                matcher(r"\A<", Lt),
                matcher(r"\A>", Gt),
            ],
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    // Skip comments and whitespace
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.pos += m.end()
        }
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, LexError> {
        self.skip_whitespace();

        if self.end_of_input() {
            return Ok(None);
        }

        let rest = &self.input[self.pos..];
        for (regex, kind) in &self.matchers {
            if let Some(m) = regex.find(rest) {
                let text = m.as_str();
                self.pos += m.end();
                return Ok(Some(Token {
                    kind: keyword_or(*kind, text),
                    text,
                }));
            }
        }

        Err(LexError(self.pos, rest.chars().next().unwrap_or('\0')))
    }
}

/// Reclassify an identifier that is actually a keyword.
fn keyword_or(kind: TokenKind, text: &str) -> TokenKind {
    use TokenKind::*;

    if kind != Id {
        return kind;
    }

    match text {
        "func" => Func,
        "var" => Var,
        "print" => Print,
        "return" => Return,
        "if" => If,
        "else" => Else,
        "while" => While,
        "continue" => Continue,
        _ => Id,
    }
}
