//! Syntax tree for analyzed programs.
//!
//! A closed set of tagged variants. The checker only cares about imports,
//! calls, attribute access and name references, but the tree keeps every
//! expression position so nothing the program evaluates is hidden from the
//! walk (decorators, default values, annotations, f-string fields, …).

use serde::{Deserialize, Serialize};

/// 1-based line and column (columns count characters, not bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: Location,
}

impl Expr {
    pub fn new(kind: ExprKind, loc: Location) -> Self {
        Self { kind, loc }
    }
}

/// `name [as asname]` in an import statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub name: String,
    pub asname: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    /// `None` for `**mapping` unpacking.
    pub arg: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    PositionalOnly,
    Regular,
    VarArgs,
    KeywordOnly,
    VarKeywords,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub annotation: Option<Expr>,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithItem {
    pub context: Expr,
    pub target: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    pub type_: Option<Expr>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub pattern: Expr,
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
    pub is_async: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DictEntry {
    Pair(Expr, Expr),
    Unpack(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    None,
    Bool(bool),
    Number(String),
    Ellipsis,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    Assign {
        targets: Vec<Expr>,
        value: Expr,
    },
    AugAssign {
        target: Expr,
        op: &'static str,
        value: Expr,
    },
    AnnAssign {
        target: Expr,
        annotation: Expr,
        value: Option<Expr>,
    },
    Delete(Vec<Expr>),
    Pass,
    Break,
    Continue,
    Return(Option<Expr>),
    Raise {
        exc: Option<Expr>,
        cause: Option<Expr>,
    },
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    Import(Vec<Alias>),
    ImportFrom {
        module: Option<String>,
        level: u32,
        names: Vec<Alias>,
    },
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        is_async: bool,
    },
    With {
        items: Vec<WithItem>,
        body: Vec<Stmt>,
        is_async: bool,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },
    FunctionDef {
        name: String,
        params: Vec<Param>,
        returns: Option<Expr>,
        body: Vec<Stmt>,
        decorators: Vec<Expr>,
        is_async: bool,
    },
    ClassDef {
        name: String,
        bases: Vec<Expr>,
        keywords: Vec<Keyword>,
        body: Vec<Stmt>,
        decorators: Vec<Expr>,
    },
    Match {
        subject: Expr,
        cases: Vec<MatchCase>,
    },
    TypeAlias {
        name: Expr,
        value: Expr,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Name(String),
    Constant(Constant),
    /// One or more adjacent string literals. `fields` holds the parsed
    /// replacement fields of any f-string parts.
    Str {
        value: String,
        is_bytes: bool,
        fields: Vec<Expr>,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<Keyword>,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    BoolOp {
        op: &'static str,
        values: Vec<Expr>,
    },
    BinOp {
        left: Box<Expr>,
        op: &'static str,
        right: Box<Expr>,
    },
    UnaryOp {
        op: &'static str,
        operand: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<&'static str>,
        comparators: Vec<Expr>,
    },
    Lambda {
        params: Vec<Param>,
        body: Box<Expr>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Dict(Vec<DictEntry>),
    Set(Vec<Expr>),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Comprehension {
        kind: ComprehensionKind,
        element: Box<Expr>,
        /// Value expression of a dict comprehension.
        value: Option<Box<Expr>>,
        generators: Vec<Comprehension>,
    },
    Await(Box<Expr>),
    Yield(Option<Box<Expr>>),
    YieldFrom(Box<Expr>),
    Starred(Box<Expr>),
    NamedExpr {
        target: Box<Expr>,
        value: Box<Expr>,
    },
}

// ---------------------------------------------------------------------------
// Visitor
// ---------------------------------------------------------------------------

/// Depth-first visitor. Override the `visit_*` hooks and call the matching
/// `walk_*` function to keep descending.
pub trait Visitor {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }
}

pub fn walk_module<V: Visitor + ?Sized>(v: &mut V, module: &Module) {
    walk_body(v, &module.body);
}

fn walk_body<V: Visitor + ?Sized>(v: &mut V, body: &[Stmt]) {
    for stmt in body {
        v.visit_stmt(stmt);
    }
}

fn walk_opt<V: Visitor + ?Sized>(v: &mut V, expr: Option<&Expr>) {
    if let Some(e) = expr {
        v.visit_expr(e);
    }
}

fn walk_params<V: Visitor + ?Sized>(v: &mut V, params: &[Param]) {
    for p in params {
        walk_opt(v, p.annotation.as_ref());
        walk_opt(v, p.default.as_ref());
    }
}

fn walk_keywords<V: Visitor + ?Sized>(v: &mut V, keywords: &[Keyword]) {
    for k in keywords {
        v.visit_expr(&k.value);
    }
}

pub fn walk_stmt<V: Visitor + ?Sized>(v: &mut V, stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::Expr(e) => v.visit_expr(e),
        StmtKind::Assign { targets, value } => {
            for t in targets {
                v.visit_expr(t);
            }
            v.visit_expr(value);
        }
        StmtKind::AugAssign { target, value, .. } => {
            v.visit_expr(target);
            v.visit_expr(value);
        }
        StmtKind::AnnAssign {
            target,
            annotation,
            value,
        } => {
            v.visit_expr(target);
            v.visit_expr(annotation);
            walk_opt(v, value.as_ref());
        }
        StmtKind::Delete(targets) => {
            for t in targets {
                v.visit_expr(t);
            }
        }
        StmtKind::Return(value) => walk_opt(v, value.as_ref()),
        StmtKind::Raise { exc, cause } => {
            walk_opt(v, exc.as_ref());
            walk_opt(v, cause.as_ref());
        }
        StmtKind::Assert { test, msg } => {
            v.visit_expr(test);
            walk_opt(v, msg.as_ref());
        }
        StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
            v.visit_expr(test);
            walk_body(v, body);
            walk_body(v, orelse);
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
            ..
        } => {
            v.visit_expr(target);
            v.visit_expr(iter);
            walk_body(v, body);
            walk_body(v, orelse);
        }
        StmtKind::With { items, body, .. } => {
            for item in items {
                v.visit_expr(&item.context);
                walk_opt(v, item.target.as_ref());
            }
            walk_body(v, body);
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            walk_body(v, body);
            for h in handlers {
                walk_opt(v, h.type_.as_ref());
                walk_body(v, &h.body);
            }
            walk_body(v, orelse);
            walk_body(v, finalbody);
        }
        StmtKind::FunctionDef {
            params,
            returns,
            body,
            decorators,
            ..
        } => {
            for d in decorators {
                v.visit_expr(d);
            }
            walk_params(v, params);
            walk_opt(v, returns.as_ref());
            walk_body(v, body);
        }
        StmtKind::ClassDef {
            bases,
            keywords,
            body,
            decorators,
            ..
        } => {
            for d in decorators {
                v.visit_expr(d);
            }
            for b in bases {
                v.visit_expr(b);
            }
            walk_keywords(v, keywords);
            walk_body(v, body);
        }
        StmtKind::Match { subject, cases } => {
            v.visit_expr(subject);
            for case in cases {
                v.visit_expr(&case.pattern);
                walk_opt(v, case.guard.as_ref());
                walk_body(v, &case.body);
            }
        }
        StmtKind::TypeAlias { name, value } => {
            v.visit_expr(name);
            v.visit_expr(value);
        }
        StmtKind::Pass
        | StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Global(_)
        | StmtKind::Nonlocal(_)
        | StmtKind::Import(_)
        | StmtKind::ImportFrom { .. } => {}
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(v: &mut V, expr: &Expr) {
    match &expr.kind {
        ExprKind::Name(_) | ExprKind::Constant(_) => {}
        ExprKind::Str { fields, .. } => {
            for f in fields {
                v.visit_expr(f);
            }
        }
        ExprKind::Attribute { value, .. } => v.visit_expr(value),
        ExprKind::Call {
            func,
            args,
            keywords,
        } => {
            v.visit_expr(func);
            for a in args {
                v.visit_expr(a);
            }
            walk_keywords(v, keywords);
        }
        ExprKind::Subscript { value, index } => {
            v.visit_expr(value);
            v.visit_expr(index);
        }
        ExprKind::Slice { lower, upper, step } => {
            walk_opt(v, lower.as_deref());
            walk_opt(v, upper.as_deref());
            walk_opt(v, step.as_deref());
        }
        ExprKind::BoolOp { values, .. } => {
            for e in values {
                v.visit_expr(e);
            }
        }
        ExprKind::BinOp { left, right, .. } => {
            v.visit_expr(left);
            v.visit_expr(right);
        }
        ExprKind::UnaryOp { operand, .. } => v.visit_expr(operand),
        ExprKind::Compare {
            left, comparators, ..
        } => {
            v.visit_expr(left);
            for c in comparators {
                v.visit_expr(c);
            }
        }
        ExprKind::Lambda { params, body } => {
            walk_params(v, params);
            v.visit_expr(body);
        }
        ExprKind::IfExp { test, body, orelse } => {
            v.visit_expr(test);
            v.visit_expr(body);
            v.visit_expr(orelse);
        }
        ExprKind::Dict(entries) => {
            for entry in entries {
                match entry {
                    DictEntry::Pair(k, val) => {
                        v.visit_expr(k);
                        v.visit_expr(val);
                    }
                    DictEntry::Unpack(e) => v.visit_expr(e),
                }
            }
        }
        ExprKind::Set(items) | ExprKind::List(items) | ExprKind::Tuple(items) => {
            for e in items {
                v.visit_expr(e);
            }
        }
        ExprKind::Comprehension {
            element,
            value,
            generators,
            ..
        } => {
            v.visit_expr(element);
            walk_opt(v, value.as_deref());
            for g in generators {
                v.visit_expr(&g.target);
                v.visit_expr(&g.iter);
                for cond in &g.ifs {
                    v.visit_expr(cond);
                }
            }
        }
        ExprKind::Await(e) | ExprKind::YieldFrom(e) | ExprKind::Starred(e) => v.visit_expr(e),
        ExprKind::Yield(e) => walk_opt(v, e.as_deref()),
        ExprKind::NamedExpr { target, value } => {
            v.visit_expr(target);
            v.visit_expr(value);
        }
    }
}
