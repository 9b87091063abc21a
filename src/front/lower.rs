//! Symbol resolution: lowers the parse tree into the resolved program.
//!
//! Builds the symbol table in two passes.  The first collects every global
//! name (variables and function signatures share one declaration-order
//! numbering), so calls may refer to functions declared later in the file.
//! The second walks each function body, opening a scope per block, and
//! replaces every name with its resolved symbol.

use derive_more::Display;

use crate::common::{Id, Map};
use crate::front::ast;
use crate::middle::sem;

#[derive(Display, Debug)]
pub enum SemError {
    #[display("'{_0}' is declared more than once at top level")]
    DuplicateGlobal(Id),
    #[display("'{_0}' is declared more than once in the same scope in {_1}")]
    DuplicateLocal(Id, Id),
    #[display("'{_0}' is not declared in {_1}")]
    Undeclared(Id, Id),
    #[display("'{_0}' is a function, not a variable, in {_1}")]
    NotAVariable(Id, Id),
    #[display("'{_0}' is not a function in {_1}")]
    NotAFunction(Id, Id),
}

/// What a global name refers to.
enum GlobalEntry {
    Var { seq: usize },
    Func { seq: usize, nparms: usize },
}

pub fn lower(program: &ast::Program) -> Result<sem::Program, SemError> {
    let mut globals = Map::new();
    let mut global_names = Vec::new();
    let mut seq = 0;

    for decl in &program.decls {
        match decl {
            ast::Decl::Globals(names) => {
                for &name in names {
                    if globals.insert(name, GlobalEntry::Var { seq }).is_some() {
                        return Err(SemError::DuplicateGlobal(name));
                    }
                    global_names.push(name);
                    seq += 1;
                }
            }
            ast::Decl::Function(func) => {
                let entry = GlobalEntry::Func {
                    seq,
                    nparms: func.params.len(),
                };
                if globals.insert(func.name, entry).is_some() {
                    return Err(SemError::DuplicateGlobal(func.name));
                }
                seq += 1;
            }
        }
    }

    let mut strings = Vec::new();
    let mut functions = Vec::new();
    for decl in &program.decls {
        if let ast::Decl::Function(func) = decl {
            let seq = match globals.get(&func.name) {
                Some(GlobalEntry::Func { seq, .. }) => *seq,
                _ => unreachable!("function names map to function entries"),
            };
            functions.push(FunctionScope::new(func, &globals, &mut strings).lower(seq)?);
        }
    }

    Ok(sem::Program {
        strings,
        globals: global_names,
        functions,
    })
}

/// Scoped resolution state for one function body.
struct FunctionScope<'a> {
    func: &'a ast::FuncDecl,
    globals: &'a Map<Id, GlobalEntry>,
    strings: &'a mut Vec<String>,
    /// Innermost scope last.  The outermost scope holds the parameters.
    scopes: Vec<Map<Id, sem::Symbol>>,
    nlocals: usize,
}

impl<'a> FunctionScope<'a> {
    fn new(
        func: &'a ast::FuncDecl,
        globals: &'a Map<Id, GlobalEntry>,
        strings: &'a mut Vec<String>,
    ) -> Self {
        let mut params = Map::new();
        for (seq, &name) in func.params.iter().enumerate() {
            params.insert(
                name,
                sem::Symbol {
                    name,
                    kind: sem::SymbolKind::Parameter,
                    seq,
                },
            );
        }

        FunctionScope {
            func,
            globals,
            strings,
            scopes: vec![params],
            nlocals: 0,
        }
    }

    fn lower(mut self, seq: usize) -> Result<sem::Function, SemError> {
        let func = self.func;
        let body = self.stmt(&func.body)?;
        Ok(sem::Function {
            name: func.name,
            seq,
            nparms: func.params.len(),
            nlocals: self.nlocals,
            body,
        })
    }

    fn declare(&mut self, name: Id) -> Result<(), SemError> {
        let symbol = sem::Symbol {
            name,
            kind: sem::SymbolKind::Local,
            seq: self.nlocals,
        };
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        if scope.insert(name, symbol).is_some() {
            return Err(SemError::DuplicateLocal(name, self.func.name));
        }
        self.nlocals += 1;
        Ok(())
    }

    fn variable(&self, name: Id) -> Result<sem::Symbol, SemError> {
        for scope in self.scopes.iter().rev() {
            if let Some(&symbol) = scope.get(&name) {
                return Ok(symbol);
            }
        }
        match self.globals.get(&name) {
            Some(GlobalEntry::Var { seq }) => Ok(sem::Symbol {
                name,
                kind: sem::SymbolKind::Global,
                seq: *seq,
            }),
            Some(GlobalEntry::Func { .. }) => Err(SemError::NotAVariable(name, self.func.name)),
            None => Err(SemError::Undeclared(name, self.func.name)),
        }
    }

    fn callee(&self, name: Id) -> Result<sem::FuncRef, SemError> {
        match self.globals.get(&name) {
            Some(GlobalEntry::Func { nparms, .. }) => Ok(sem::FuncRef {
                name,
                nparms: *nparms,
            }),
            Some(GlobalEntry::Var { .. }) => Err(SemError::NotAFunction(name, self.func.name)),
            None => Err(SemError::Undeclared(name, self.func.name)),
        }
    }

    fn stmt(&mut self, stmt: &ast::Stmt) -> Result<sem::Stmt, SemError> {
        match stmt {
            ast::Stmt::Block(stmts) => {
                self.scopes.push(Map::new());
                let mut lowered = Vec::new();
                for stmt in stmts {
                    // Declarations only extend the scope; they leave no
                    // statement behind.
                    if let ast::Stmt::Declare(names) = stmt {
                        for &name in names {
                            self.declare(name)?;
                        }
                        continue;
                    }
                    lowered.push(self.stmt(stmt)?);
                }
                self.scopes.pop();
                Ok(sem::Stmt::Block(lowered))
            }
            ast::Stmt::Declare(names) => {
                // A declaration outside a block, e.g. as a bare `if` branch.
                for &name in names {
                    self.declare(name)?;
                }
                Ok(sem::Stmt::Block(Vec::new()))
            }
            ast::Stmt::Assign { target, op, value } => Ok(sem::Stmt::Assign {
                target: self.variable(*target)?,
                op: *op,
                value: self.expr(value)?,
            }),
            ast::Stmt::Print(items) => {
                let items = items
                    .iter()
                    .map(|item| match item {
                        ast::PrintItem::Text(text) => {
                            self.strings.push(text.clone());
                            Ok(sem::PrintItem::Text(self.strings.len() - 1))
                        }
                        ast::PrintItem::Value(expr) => Ok(sem::PrintItem::Value(self.expr(expr)?)),
                    })
                    .collect::<Result<_, _>>()?;
                Ok(sem::Stmt::Print(items))
            }
            ast::Stmt::Return(expr) => Ok(sem::Stmt::Return(self.expr(expr)?)),
            ast::Stmt::If { guard, tt, ff } => Ok(sem::Stmt::If {
                guard: self.relation(guard)?,
                tt: Box::new(self.stmt(tt)?),
                ff: match ff {
                    Some(ff) => Some(Box::new(self.stmt(ff)?)),
                    None => None,
                },
            }),
            ast::Stmt::While { guard, body } => Ok(sem::Stmt::While {
                guard: self.relation(guard)?,
                body: Box::new(self.stmt(body)?),
            }),
            ast::Stmt::Continue => Ok(sem::Stmt::Continue),
        }
    }

    fn relation(&mut self, relation: &ast::Relation) -> Result<sem::Relation, SemError> {
        Ok(sem::Relation {
            op: relation.op,
            lhs: self.expr(&relation.lhs)?,
            rhs: self.expr(&relation.rhs)?,
        })
    }

    fn expr(&mut self, expr: &ast::Expr) -> Result<sem::Expr, SemError> {
        match expr {
            ast::Expr::Const(value) => Ok(sem::Expr::Const(*value)),
            ast::Expr::Var(name) => Ok(sem::Expr::Var(self.variable(*name)?)),
            ast::Expr::Call { callee, args } => Ok(sem::Expr::Call {
                callee: self.callee(*callee)?,
                args: args.iter().map(|arg| self.expr(arg)).collect::<Result<_, _>>()?,
            }),
            ast::Expr::UOp { op, operand } => Ok(sem::Expr::UOp {
                op: *op,
                operand: Box::new(self.expr(operand)?),
            }),
            ast::Expr::BOp { op, lhs, rhs } => Ok(sem::Expr::BOp {
                op: *op,
                lhs: Box::new(self.expr(lhs)?),
                rhs: Box::new(self.expr(rhs)?),
            }),
        }
    }
}
