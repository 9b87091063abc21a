//! The parser

use std::fmt::Debug;

use derive_more::derive::Display;

use crate::common::{id, Id};

use super::ast::*;
use super::lex::*;

#[derive(Display)]
#[display("Parse error: {}", self.0)]
pub struct ParseError(String);

impl Debug for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        ParseError(err.to_string())
    }
}

pub fn parse(input: &str) -> Result<Program, ParseError> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next()? {
        tokens.push(token);
    }

    Parser { tokens, pos: 0 }.program()
}

struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
}

impl<'src> Parser<'src> {
    fn peek(&self) -> Option<TokenKind> {
        self.tokens.get(self.pos).map(|t| t.kind)
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek() == Some(kind)
    }

    fn advance(&mut self) -> Option<Token<'src>> {
        let token = self.tokens.get(self.pos).copied();
        self.pos += 1;
        token
    }

    /// Consume the next token if it has the given kind.
    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token<'src>, ParseError> {
        match self.advance() {
            Some(token) if token.kind == kind => Ok(token),
            Some(token) => Err(ParseError(format!("expected '{kind}', found {token}"))),
            None => Err(ParseError(format!("expected '{kind}', found end of input"))),
        }
    }

    fn program(mut self) -> Result<Program, ParseError> {
        let mut decls = Vec::new();
        while let Some(kind) = self.peek() {
            match kind {
                TokenKind::Func => decls.push(Decl::Function(self.function()?)),
                TokenKind::Var => {
                    self.expect(TokenKind::Var)?;
                    decls.push(Decl::Globals(self.name_list()?));
                }
                TokenKind::Semi => {
                    self.pos += 1;
                }
                _ => {
                    let token = self.advance().unwrap();
                    return Err(ParseError(format!(
                        "expected a function or variable declaration, found {token}"
                    )));
                }
            }
        }
        Ok(Program { decls })
    }

    fn function(&mut self) -> Result<FuncDecl, ParseError> {
        self.expect(TokenKind::Func)?;
        let name = id(self.expect(TokenKind::Id)?.text);

        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.at(TokenKind::RParen) {
            params = self.name_list()?;
        }
        self.expect(TokenKind::RParen)?;

        let body = self.block()?;
        Ok(FuncDecl { name, params, body })
    }

    /// One or more comma-separated identifiers.
    fn name_list(&mut self) -> Result<Vec<Id>, ParseError> {
        let mut names = vec![id(self.expect(TokenKind::Id)?.text)];
        while self.eat(TokenKind::Comma) {
            names.push(id(self.expect(TokenKind::Id)?.text));
        }
        Ok(names)
    }

    fn block(&mut self) -> Result<Stmt, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.eat(TokenKind::RBrace) {
            if self.eat(TokenKind::Semi) {
                continue;
            }
            if self.peek().is_none() {
                return Err(ParseError("unclosed block at end of input".to_string()));
            }
            stmts.push(self.stmt()?);
        }
        Ok(Stmt::Block(stmts))
    }

    fn stmt(&mut self) -> Result<Stmt, ParseError> {
        use TokenKind::*;

        match self.peek() {
            Some(LBrace) => self.block(),
            Some(Var) => {
                self.pos += 1;
                Ok(Stmt::Declare(self.name_list()?))
            }
            Some(Print) => {
                self.pos += 1;
                let mut items = vec![self.print_item()?];
                while self.eat(Comma) {
                    items.push(self.print_item()?);
                }
                Ok(Stmt::Print(items))
            }
            Some(Return) => {
                self.pos += 1;
                Ok(Stmt::Return(self.expr()?))
            }
            Some(If) => {
                self.pos += 1;
                let guard = self.relation()?;
                let tt = Box::new(self.stmt()?);
                let ff = if self.eat(Else) {
                    Some(Box::new(self.stmt()?))
                } else {
                    None
                };
                Ok(Stmt::If { guard, tt, ff })
            }
            Some(While) => {
                self.pos += 1;
                let guard = self.relation()?;
                let body = Box::new(self.stmt()?);
                Ok(Stmt::While { guard, body })
            }
            Some(Continue) => {
                self.pos += 1;
                Ok(Stmt::Continue)
            }
            Some(Id) => self.assignment(),
            Some(_) => {
                let token = self.advance().unwrap();
                Err(ParseError(format!("expected a statement, found {token}")))
            }
            None => Err(ParseError("expected a statement, found end of input".to_string())),
        }
    }

    fn assignment(&mut self) -> Result<Stmt, ParseError> {
        use TokenKind::*;

        let target = id(self.expect(Id)?.text);
        let op = match self.advance() {
            Some(token) => match token.kind {
                Assign => None,
                AddAssign => Some(BOp::Add),
                SubAssign => Some(BOp::Sub),
                MulAssign => Some(BOp::Mul),
                DivAssign => Some(BOp::Div),
                _ => {
                    return Err(ParseError(format!(
                        "expected an assignment operator, found {token}"
                    )))
                }
            },
            None => {
                return Err(ParseError(
                    "expected an assignment operator, found end of input".to_string(),
                ))
            }
        };
        let value = self.expr()?;
        Ok(Stmt::Assign { target, op, value })
    }

    fn print_item(&mut self) -> Result<PrintItem, ParseError> {
        if self.at(TokenKind::Str) {
            let token = self.advance().unwrap();
            // Strip the surrounding quotes; escapes stay as written and are
            // resolved by the assembler.
            let text = token.text[1..token.text.len() - 1].to_string();
            Ok(PrintItem::Text(text))
        } else {
            Ok(PrintItem::Value(self.expr()?))
        }
    }

    fn relation(&mut self) -> Result<Relation, ParseError> {
        use TokenKind::*;

        let lhs = self.expr()?;
        let op = match self.advance() {
            Some(token) => match token.kind {
                Eq => RelOp::Equal,
                Gt => RelOp::Greater,
                Lt => RelOp::Less,
                _ => {
                    return Err(ParseError(format!(
                        "expected '=', '<' or '>', found {token}"
                    )))
                }
            },
            None => {
                return Err(ParseError(
                    "expected a comparison, found end of input".to_string(),
                ))
            }
        };
        let rhs = self.expr()?;
        Ok(Relation { op, lhs, rhs })
    }

    // Expressions, loosest binding first: | then ^ then & then +- then */
    // then unary.

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.binary(0)
    }

    /// Parse a left-associative chain at the given precedence level.
    fn binary(&mut self, level: usize) -> Result<Expr, ParseError> {
        const LEVELS: [&[(TokenKind, BOp)]; 5] = [
            &[(TokenKind::Or, BOp::Or)],
            &[(TokenKind::Xor, BOp::Xor)],
            &[(TokenKind::And, BOp::And)],
            &[(TokenKind::Plus, BOp::Add), (TokenKind::Minus, BOp::Sub)],
            &[(TokenKind::Mul, BOp::Mul), (TokenKind::Div, BOp::Div)],
        ];

        if level == LEVELS.len() {
            return self.unary();
        }

        let mut lhs = self.binary(level + 1)?;
        'chain: loop {
            for (kind, op) in LEVELS[level] {
                if self.eat(*kind) {
                    let rhs = self.binary(level + 1)?;
                    lhs = Expr::BOp {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                    continue 'chain;
                }
            }
            return Ok(lhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = if self.eat(TokenKind::Minus) {
            UOp::Neg
        } else if self.eat(TokenKind::Tilde) {
            UOp::Not
        } else {
            return self.primary();
        };
        Ok(Expr::UOp {
            op,
            operand: Box::new(self.unary()?),
        })
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        use TokenKind::*;

        match self.advance() {
            Some(token) if token.kind == Num => {
                let value = token
                    .text
                    .parse()
                    .map_err(|_| ParseError(format!("integer literal out of range: {}", token.text)))?;
                Ok(Expr::Const(value))
            }
            Some(token) if token.kind == Id => {
                let name = id(token.text);
                if self.eat(LParen) {
                    let mut args = Vec::new();
                    if !self.at(RParen) {
                        args.push(self.expr()?);
                        while self.eat(Comma) {
                            args.push(self.expr()?);
                        }
                    }
                    self.expect(RParen)?;
                    Ok(Expr::Call { callee: name, args })
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(token) if token.kind == LParen => {
                let inner = self.expr()?;
                self.expect(RParen)?;
                Ok(inner)
            }
            Some(token) => Err(ParseError(format!("expected an expression, found {token}"))),
            None => Err(ParseError(
                "expected an expression, found end of input".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(input);
        let mut kinds = Vec::new();
        while let Some(token) = lexer.next().unwrap() {
            kinds.push(token.kind);
        }
        kinds
    }

    #[test]
    fn lexes_operators_and_keywords() {
        use TokenKind::*;
        assert_eq!(
            tokens("func f(x) { x := x + 1 }"),
            vec![Func, Id, LParen, Id, RParen, LBrace, Id, Assign, Id, Plus, Num, RBrace]
        );
        assert_eq!(tokens("x += 2 // comment"), vec![Id, AddAssign, Num]);
        assert_eq!(tokens(r#"print "a b", x"#), vec![Print, Str, Comma, Id]);
    }

    #[test]
    fn rejects_unknown_characters() {
        let mut lexer = Lexer::new("x ? y");
        assert!(lexer.next().unwrap().is_some());
        assert!(lexer.next().is_err());
    }

    #[test]
    fn parses_function_with_statements() {
        let program = parse(
            "func main() {\n\
                 var x; x := 7\n\
                 print \"answer\", x, x*6\n\
             }",
        )
        .unwrap();
        assert_eq!(program.decls.len(), 1);
        let Decl::Function(func) = &program.decls[0] else {
            panic!("expected a function");
        };
        assert_eq!(func.name.as_str(), "main");
        let Stmt::Block(stmts) = &func.body else {
            panic!("expected a block body");
        };
        assert_eq!(stmts.len(), 3);
        assert!(matches!(&stmts[2], Stmt::Print(items) if items.len() == 3));
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let program = parse("func f(a, b) { return a + b * 2 }").unwrap();
        let Decl::Function(func) = &program.decls[0] else {
            panic!("expected a function");
        };
        let Stmt::Block(stmts) = &func.body else {
            panic!("expected a block body");
        };
        let Stmt::Return(Expr::BOp { op: BOp::Add, rhs, .. }) = &stmts[0] else {
            panic!("expected `return _ + _`");
        };
        assert!(matches!(**rhs, Expr::BOp { op: BOp::Mul, .. }));
    }

    #[test]
    fn parses_if_else_without_separators() {
        let program =
            parse("func h(a) { if a > 0 print \"pos\" else print \"nonpos\" return 0 }").unwrap();
        let Decl::Function(func) = &program.decls[0] else {
            panic!("expected a function");
        };
        let Stmt::Block(stmts) = &func.body else {
            panic!("expected a block body");
        };
        assert_eq!(stmts.len(), 2);
        assert!(matches!(&stmts[0], Stmt::If { ff: Some(_), .. }));
        assert!(matches!(&stmts[1], Stmt::Return(_)));
    }

    #[test]
    fn rejects_stray_tokens() {
        assert!(parse("func f() { return }").is_err());
        assert!(parse("x := 1").is_err());
    }
}
