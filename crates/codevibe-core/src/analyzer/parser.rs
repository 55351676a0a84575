//! Recursive-descent parser from tokens to the [`ast`](super::ast) tree.
//!
//! The grammar follows CPython 3.12 closely enough that every program the
//! interpreter accepts parses here, and the common syntax errors (bad
//! indentation, misplaced `return`/`break`, unassignable targets, unclosed
//! brackets) are reported with a location. Type parameter lists are skipped
//! rather than modelled.

use std::collections::HashSet;

use super::ast::*;
use super::lexer::{Lexer, StrToken, Token, TokenKind};
use super::ParseError;

type PResult<T> = Result<T, ParseError>;

/// Deepest nesting of blocks plus expressions the parser will descend into.
pub const MAX_NESTING: usize = 64;

/// Left-nested links (`a.b.c`, `1 + 2 + 3`, `elif`) allowed on the current
/// path through the tree. Keeps the depth of the finished tree bounded.
pub const MAX_CHAIN: usize = 512;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const AUGMENTED_OPS: &[&str] = &[
    "+=", "-=", "*=", "/=", "//=", "%=", "@=", "&=", "|=", "^=", ">>=", "<<=", "**=",
];

const COMPARISON_OPS: &[&str] = &["<", ">", "==", ">=", "<=", "!="];

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Parse a whole program.
pub fn parse_module(source: &str) -> PResult<Module> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens, 0, 0).parse_module()
}

/// Parse one f-string replacement field located at `origin`.
fn parse_fragment(text: &str, origin: Location, depth: usize, chain: usize) -> PResult<Expr> {
    let tokens = Lexer::fragment(text, origin).tokenize()?;
    let mut parser = Parser::new(tokens, depth, chain);
    parser.function_depth = 1;
    let expr = parser.parse_assign_rhs()?;
    if !matches!(parser.peek_kind(), TokenKind::EndMarker) {
        return Err(parser.error_here("f-string: invalid syntax"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    chain: usize,
    function_depth: usize,
    loop_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, depth: usize, chain: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth,
            chain,
            function_depth: 0,
            loop_depth: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Token helpers
    // -----------------------------------------------------------------------

    fn peek(&self) -> &Token {
        self.peek_nth(0)
    }

    fn peek_nth(&self, n: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + n).min(last)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !matches!(token.kind, TokenKind::EndMarker) {
            self.pos += 1;
        }
        token
    }

    fn loc(&self) -> Location {
        self.peek().loc
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.loc())
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        let hit = self.is_op(op);
        if hit {
            self.advance();
        }
        hit
    }

    fn expect_op(&mut self, op: &str) -> PResult<Location> {
        if self.is_op(op) {
            Ok(self.advance().loc)
        } else {
            Err(self.error_here(format!("expected '{op}'")))
        }
    }

    /// Current token as a name, keywords included.
    fn peek_name(&self) -> Option<&str> {
        match self.peek_kind() {
            TokenKind::Name(n) => Some(n.as_str()),
            _ => None,
        }
    }

    fn is_keyword(&self, kw: &str) -> bool {
        self.peek_name() == Some(kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        let hit = self.is_keyword(kw);
        if hit {
            self.advance();
        }
        hit
    }

    fn expect_keyword(&mut self, kw: &str) -> PResult<Location> {
        if self.is_keyword(kw) {
            Ok(self.advance().loc)
        } else {
            Err(self.error_here(format!("expected '{kw}'")))
        }
    }

    /// A non-keyword identifier.
    fn expect_name(&mut self) -> PResult<(String, Location)> {
        match self.peek_name() {
            Some(name) if !is_keyword(name) => {
                let name = name.to_owned();
                let loc = self.advance().loc;
                Ok((name, loc))
            }
            _ => Err(self.error_here("invalid syntax")),
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::EndMarker
        ) || self.is_op(";")
    }

    fn starts_expression(&self) -> bool {
        match self.peek_kind() {
            TokenKind::Name(n) => {
                !is_keyword(n)
                    || matches!(
                        n.as_str(),
                        "not" | "lambda" | "await" | "None" | "True" | "False"
                    )
            }
            TokenKind::Number(_) | TokenKind::Str(_) => true,
            TokenKind::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~" | "*" | "..."),
            _ => false,
        }
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error_here("too many nested blocks or expressions"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn extend_chain(&mut self) -> PResult<()> {
        self.chain += 1;
        if self.chain > MAX_CHAIN {
            return Err(self.error_here("expression chain too long"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn parse_module(&mut self) -> PResult<Module> {
        let mut body = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::EndMarker => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Indent => return Err(self.error_here("unexpected indent")),
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(Module { body })
    }

    fn parse_statement(&mut self) -> PResult<Vec<Stmt>> {
        self.enter()?;
        let result = self.parse_statement_inner();
        self.leave();
        result
    }

    fn parse_statement_inner(&mut self) -> PResult<Vec<Stmt>> {
        if self.is_op("@") {
            return Ok(vec![self.parse_decorated()?]);
        }
        let loc = self.loc();
        let keyword = self.peek_name().map(str::to_owned);
        let stmt = match keyword.as_deref() {
            Some("if") => self.parse_if()?,
            Some("while") => self.parse_while()?,
            Some("for") => self.parse_for(false, loc)?,
            Some("try") => self.parse_try()?,
            Some("with") => self.parse_with(false, loc)?,
            Some("def") => self.parse_def(Vec::new(), false, loc)?,
            Some("class") => self.parse_class(Vec::new(), loc)?,
            Some("async") => self.parse_async(Vec::new())?,
            Some("match") => match self.try_parse_match()? {
                Some(stmt) => stmt,
                None => return self.parse_simple_statements(),
            },
            _ => return self.parse_simple_statements(),
        };
        Ok(vec![stmt])
    }

    /// The suite after a compound statement header's `:`.
    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        if !matches!(self.peek_kind(), TokenKind::Newline) {
            return self.parse_simple_statements();
        }
        self.advance();
        if !matches!(self.peek_kind(), TokenKind::Indent) {
            return Err(self.error_here("expected an indented block"));
        }
        self.advance();
        let mut body = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::EndMarker => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Indent => return Err(self.error_here("unexpected indent")),
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn parse_simple_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.parse_small_statement()?];
        while self.eat_op(";") {
            if matches!(
                self.peek_kind(),
                TokenKind::Newline | TokenKind::EndMarker
            ) {
                break;
            }
            stmts.push(self.parse_small_statement()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn expect_newline(&mut self) -> PResult<()> {
        match self.peek_kind() {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::EndMarker => Ok(()),
            _ => Err(self.error_here("invalid syntax")),
        }
    }

    fn parse_small_statement(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        let keyword = self.peek_name().map(str::to_owned);
        let kind = match keyword.as_deref() {
            Some("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Some("break") => {
                self.advance();
                if self.loop_depth == 0 {
                    return Err(ParseError::new("'break' outside loop", loc));
                }
                StmtKind::Break
            }
            Some("continue") => {
                self.advance();
                if self.loop_depth == 0 {
                    return Err(ParseError::new("'continue' not properly in loop", loc));
                }
                StmtKind::Continue
            }
            Some("return") => {
                self.advance();
                if self.function_depth == 0 {
                    return Err(ParseError::new("'return' outside function", loc));
                }
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_star_expressions()?)
                };
                StmtKind::Return(value)
            }
            Some("raise") => {
                self.advance();
                let (exc, cause) = if self.at_statement_end() {
                    (None, None)
                } else {
                    let exc = self.parse_expression()?;
                    let cause = if self.eat_keyword("from") {
                        Some(self.parse_expression()?)
                    } else {
                        None
                    };
                    (Some(exc), cause)
                };
                StmtKind::Raise { exc, cause }
            }
            Some("global") | Some("nonlocal") => {
                self.advance();
                let mut names = vec![self.expect_name()?.0];
                while self.eat_op(",") {
                    names.push(self.expect_name()?.0);
                }
                if keyword.as_deref() == Some("global") {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            Some("del") => {
                self.advance();
                let mut targets = Vec::new();
                loop {
                    let target = self.parse_bitwise_or()?;
                    check_assignable(&target, "delete")?;
                    targets.push(target);
                    if !self.eat_op(",") || self.at_statement_end() {
                        break;
                    }
                }
                StmtKind::Delete(targets)
            }
            Some("assert") => {
                self.advance();
                let test = self.parse_expression()?;
                let msg = if self.eat_op(",") {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            Some("import") => self.parse_import()?,
            Some("from") => self.parse_from_import()?,
            Some("type") if self.looks_like_type_alias() => self.parse_type_alias()?,
            _ => return self.parse_expression_statement(),
        };
        Ok(Stmt { kind, loc })
    }

    fn parse_expression_statement(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        let first = self.parse_assign_rhs()?;

        if self.is_op("=") {
            let mut targets = vec![first];
            let value = loop {
                self.advance();
                let next = self.parse_assign_rhs()?;
                if self.is_op("=") {
                    targets.push(next);
                } else {
                    break next;
                }
            };
            for target in &targets {
                check_assignable(target, "assign to")?;
            }
            return Ok(Stmt {
                kind: StmtKind::Assign { targets, value },
                loc,
            });
        }

        if let Some(op) = AUGMENTED_OPS.iter().copied().find(|op| self.is_op(op)) {
            if !is_single_target(&first) {
                return Err(ParseError::new(
                    "illegal expression for augmented assignment",
                    first.loc,
                ));
            }
            self.advance();
            let value = self.parse_assign_rhs()?;
            return Ok(Stmt {
                kind: StmtKind::AugAssign {
                    target: first,
                    op,
                    value,
                },
                loc,
            });
        }

        if self.is_op(":") {
            if !is_single_target(&first) {
                return Err(ParseError::new(
                    "only single target (not tuple) can be annotated",
                    first.loc,
                ));
            }
            self.advance();
            let annotation = self.parse_expression()?;
            let value = if self.eat_op("=") {
                Some(self.parse_assign_rhs()?)
            } else {
                None
            };
            return Ok(Stmt {
                kind: StmtKind::AnnAssign {
                    target: first,
                    annotation,
                    value,
                },
                loc,
            });
        }

        Ok(Stmt {
            kind: StmtKind::Expr(first),
            loc,
        })
    }

    fn parse_assign_rhs(&mut self) -> PResult<Expr> {
        if self.is_keyword("yield") {
            self.parse_yield()
        } else {
            self.parse_star_expressions()
        }
    }

    fn parse_import(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut names = Vec::new();
        loop {
            let loc = self.loc();
            let name = self.parse_dotted_name()?;
            let asname = self.parse_as_name()?;
            names.push(Alias { name, asname, loc });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(StmtKind::Import(names))
    }

    fn parse_from_import(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut level = 0u32;
        loop {
            if self.eat_op(".") {
                level += 1;
            } else if self.eat_op("...") {
                level += 3;
            } else {
                break;
            }
        }
        let module = if self.is_keyword("import") {
            None
        } else {
            Some(self.parse_dotted_name()?)
        };
        if level == 0 && module.is_none() {
            return Err(self.error_here("invalid syntax"));
        }
        self.expect_keyword("import")?;

        let mut names = Vec::new();
        if self.is_op("*") {
            let loc = self.advance().loc;
            names.push(Alias {
                name: "*".to_owned(),
                asname: None,
                loc,
            });
        } else {
            let parenthesized = self.eat_op("(");
            loop {
                let (name, loc) = self.expect_name()?;
                let asname = self.parse_as_name()?;
                names.push(Alias { name, asname, loc });
                if !self.eat_op(",") || (parenthesized && self.is_op(")")) {
                    break;
                }
            }
            if parenthesized {
                self.expect_op(")")?;
            }
        }
        Ok(StmtKind::ImportFrom {
            module,
            level,
            names,
        })
    }

    fn parse_dotted_name(&mut self) -> PResult<String> {
        let (mut name, _) = self.expect_name()?;
        while self.eat_op(".") {
            let (part, _) = self.expect_name()?;
            name.push('.');
            name.push_str(&part);
        }
        Ok(name)
    }

    fn parse_as_name(&mut self) -> PResult<Option<String>> {
        if self.eat_keyword("as") {
            Ok(Some(self.expect_name()?.0))
        } else {
            Ok(None)
        }
    }

    fn looks_like_type_alias(&self) -> bool {
        let name_follows =
            matches!(&self.peek_nth(1).kind, TokenKind::Name(n) if !is_keyword(n));
        let then = &self.peek_nth(2).kind;
        name_follows && matches!(then, TokenKind::Op("=") | TokenKind::Op("["))
    }

    fn parse_type_alias(&mut self) -> PResult<StmtKind> {
        self.advance();
        let (name, loc) = self.expect_name()?;
        self.skip_type_params()?;
        self.expect_op("=")?;
        let value = self.parse_expression()?;
        Ok(StmtKind::TypeAlias {
            name: Expr::new(ExprKind::Name(name), loc),
            value,
        })
    }

    /// Skip a `[T, *Ts, **P]` type parameter list.
    fn skip_type_params(&mut self) -> PResult<()> {
        if !self.is_op("[") {
            return Ok(());
        }
        let mut depth = 0usize;
        loop {
            match self.advance().kind {
                TokenKind::Op("[") | TokenKind::Op("(") => depth += 1,
                TokenKind::Op("]") | TokenKind::Op(")") => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                TokenKind::EndMarker => return Err(self.error_here("'[' was never closed")),
                _ => {}
            }
        }
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        // `if` / `elif` chains are folded from the tail so long chains
        // don't recurse.
        let mut branches = Vec::new();
        loop {
            let loc = self.advance().loc;
            let test = self.parse_named_expression()?;
            self.expect_op(":")?;
            let body = self.parse_block()?;
            branches.push((loc, test, body));
            if !self.is_keyword("elif") {
                break;
            }
            if self.chain + branches.len() > MAX_CHAIN {
                return Err(self.error_here("too many 'elif' branches"));
            }
        }
        let mut orelse = if self.eat_keyword("else") {
            self.expect_op(":")?;
            self.parse_block()?
        } else {
            Vec::new()
        };
        let mut result = None;
        while let Some((loc, test, body)) = branches.pop() {
            let stmt = Stmt {
                kind: StmtKind::If { test, body, orelse },
                loc,
            };
            orelse = Vec::new();
            if branches.is_empty() {
                result = Some(stmt);
            } else {
                orelse.push(stmt);
            }
        }
        result.ok_or_else(|| self.error_here("invalid syntax"))
    }

    fn parse_loop_body(&mut self) -> PResult<Vec<Stmt>> {
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        body
    }

    fn parse_else_block(&mut self) -> PResult<Vec<Stmt>> {
        if self.eat_keyword("else") {
            self.expect_op(":")?;
            self.parse_block()
        } else {
            Ok(Vec::new())
        }
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let loc = self.advance().loc;
        let test = self.parse_named_expression()?;
        self.expect_op(":")?;
        let body = self.parse_loop_body()?;
        let orelse = self.parse_else_block()?;
        Ok(Stmt {
            kind: StmtKind::While { test, body, orelse },
            loc,
        })
    }

    fn parse_for(&mut self, is_async: bool, loc: Location) -> PResult<Stmt> {
        self.expect_keyword("for")?;
        let target = self.parse_target_list()?;
        check_assignable(&target, "assign to")?;
        self.expect_keyword("in")?;
        let iter = self.parse_star_expressions()?;
        self.expect_op(":")?;
        let body = self.parse_loop_body()?;
        let orelse = self.parse_else_block()?;
        Ok(Stmt {
            kind: StmtKind::For {
                target,
                iter,
                body,
                orelse,
                is_async,
            },
            loc,
        })
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        let loc = self.advance().loc;
        self.expect_op(":")?;
        let body = self.parse_block()?;

        let mut handlers = Vec::new();
        while self.is_keyword("except") {
            let handler_loc = self.advance().loc;
            self.eat_op("*");
            let type_ = if self.is_op(":") {
                None
            } else {
                Some(self.parse_expression()?)
            };
            let name = if type_.is_some() {
                self.parse_as_name()?
            } else {
                None
            };
            self.expect_op(":")?;
            let handler_body = self.parse_block()?;
            handlers.push(ExceptHandler {
                type_,
                name,
                body: handler_body,
                loc: handler_loc,
            });
        }

        let orelse = if handlers.is_empty() {
            Vec::new()
        } else {
            self.parse_else_block()?
        };
        let finalbody = if self.eat_keyword("finally") {
            self.expect_op(":")?;
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error_here("expected 'except' or 'finally' block"));
        }
        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            loc,
        })
    }

    fn parse_with(&mut self, is_async: bool, loc: Location) -> PResult<Stmt> {
        self.expect_keyword("with")?;
        let items = match self.try_parenthesized_with_items()? {
            Some(items) => items,
            None => self.parse_with_items(false)?,
        };
        self.expect_op(":")?;
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::With {
                items,
                body,
                is_async,
            },
            loc,
        })
    }

    /// `with (a as b, c as d):` is ambiguous with a parenthesized tuple
    /// expression; try the item form first and rewind if it doesn't fit.
    fn try_parenthesized_with_items(&mut self) -> PResult<Option<Vec<WithItem>>> {
        if !self.is_op("(") {
            return Ok(None);
        }
        let (start, depth, chain) = (self.pos, self.depth, self.chain);
        self.advance();
        if let Ok(items) = self.parse_with_items(true) {
            if self.is_op(")") && matches!(self.peek_nth(1).kind, TokenKind::Op(":")) {
                self.advance();
                return Ok(Some(items));
            }
        }
        (self.pos, self.depth, self.chain) = (start, depth, chain);
        Ok(None)
    }

    fn parse_with_items(&mut self, parenthesized: bool) -> PResult<Vec<WithItem>> {
        let mut items = Vec::new();
        loop {
            let context = self.parse_expression()?;
            let target = if self.eat_keyword("as") {
                let target = self.parse_star_target()?;
                check_assignable(&target, "assign to")?;
                Some(target)
            } else {
                None
            };
            items.push(WithItem { context, target });
            if !self.eat_op(",") || (parenthesized && self.is_op(")")) {
                break;
            }
        }
        Ok(items)
    }

    fn parse_decorated(&mut self) -> PResult<Stmt> {
        let mut decorators = Vec::new();
        while self.eat_op("@") {
            decorators.push(self.parse_named_expression()?);
            if !matches!(self.peek_kind(), TokenKind::Newline) {
                return Err(self.error_here("invalid syntax"));
            }
            self.advance();
        }
        let loc = self.loc();
        match self.peek_name() {
            Some("def") => self.parse_def(decorators, false, loc),
            Some("class") => self.parse_class(decorators, loc),
            Some("async") => self.parse_async(decorators),
            _ => Err(self.error_here("invalid syntax")),
        }
    }

    fn parse_async(&mut self, decorators: Vec<Expr>) -> PResult<Stmt> {
        let loc = self.advance().loc;
        match self.peek_name() {
            Some("def") => self.parse_def(decorators, true, loc),
            Some("with") if decorators.is_empty() => self.parse_with(true, loc),
            Some("for") if decorators.is_empty() => self.parse_for(true, loc),
            _ => Err(self.error_here("invalid syntax")),
        }
    }

    fn parse_def(&mut self, decorators: Vec<Expr>, is_async: bool, loc: Location) -> PResult<Stmt> {
        self.expect_keyword("def")?;
        let (name, _) = self.expect_name()?;
        self.skip_type_params()?;
        self.expect_op("(")?;
        let params = self.parse_params(")", true)?;
        self.expect_op(")")?;
        let returns = if self.eat_op("->") {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect_op(":")?;

        let saved = (self.function_depth, self.loop_depth);
        self.function_depth += 1;
        self.loop_depth = 0;
        let body = self.parse_block();
        (self.function_depth, self.loop_depth) = saved;

        Ok(Stmt {
            kind: StmtKind::FunctionDef {
                name,
                params,
                returns,
                body: body?,
                decorators,
                is_async,
            },
            loc,
        })
    }

    fn parse_class(&mut self, decorators: Vec<Expr>, loc: Location) -> PResult<Stmt> {
        self.expect_keyword("class")?;
        let (name, _) = self.expect_name()?;
        self.skip_type_params()?;
        let (bases, keywords) = if self.eat_op("(") {
            self.parse_call_args()?
        } else {
            (Vec::new(), Vec::new())
        };
        self.expect_op(":")?;

        let saved = (self.function_depth, self.loop_depth);
        self.function_depth = 0;
        self.loop_depth = 0;
        let body = self.parse_block();
        (self.function_depth, self.loop_depth) = saved;

        Ok(Stmt {
            kind: StmtKind::ClassDef {
                name,
                bases,
                keywords,
                body: body?,
                decorators,
            },
            loc,
        })
    }

    /// Parameter list up to (not including) `closing`. Lambdas pass
    /// `annotations = false`.
    fn parse_params(&mut self, closing: &str, annotations: bool) -> PResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        let mut names = HashSet::new();
        let mut kind = ParamKind::Regular;
        let mut seen_default = false;
        let mut seen_slash = false;

        while !self.is_op(closing) {
            let loc = self.loc();
            if self.eat_op("/") {
                if seen_slash || kind != ParamKind::Regular || params.is_empty() {
                    return Err(ParseError::new("invalid syntax", loc));
                }
                seen_slash = true;
                for param in &mut params {
                    param.kind = ParamKind::PositionalOnly;
                }
            } else if self.eat_op("**") {
                let (name, name_loc) = self.expect_name()?;
                let annotation = self.parse_annotation(annotations)?;
                register_param(&mut names, &name, name_loc)?;
                params.push(Param {
                    name,
                    kind: ParamKind::VarKeywords,
                    annotation,
                    default: None,
                });
                self.eat_op(",");
                if !self.is_op(closing) {
                    return Err(self.error_here("arguments cannot follow var-keyword argument"));
                }
                break;
            } else if self.eat_op("*") {
                if kind != ParamKind::Regular {
                    return Err(ParseError::new("* argument may appear only once", loc));
                }
                kind = ParamKind::KeywordOnly;
                if !self.is_op(",") && !self.is_op(closing) {
                    let (name, name_loc) = self.expect_name()?;
                    let annotation = if annotations && self.eat_op(":") {
                        Some(self.parse_star_expression()?)
                    } else {
                        None
                    };
                    register_param(&mut names, &name, name_loc)?;
                    params.push(Param {
                        name,
                        kind: ParamKind::VarArgs,
                        annotation,
                        default: None,
                    });
                }
            } else {
                let (name, name_loc) = self.expect_name()?;
                let annotation = self.parse_annotation(annotations)?;
                let default = if self.eat_op("=") {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                if kind == ParamKind::Regular {
                    if default.is_some() {
                        seen_default = true;
                    } else if seen_default {
                        return Err(ParseError::new(
                            "parameter without a default follows parameter with a default",
                            name_loc,
                        ));
                    }
                }
                register_param(&mut names, &name, name_loc)?;
                params.push(Param {
                    name,
                    kind,
                    annotation,
                    default,
                });
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn parse_annotation(&mut self, allowed: bool) -> PResult<Option<Expr>> {
        if allowed && self.eat_op(":") {
            Ok(Some(self.parse_expression()?))
        } else {
            Ok(None)
        }
    }

    /// `match` is a soft keyword: only a statement when the header parses and
    /// is followed by an indented `case` block. Otherwise rewind and let the
    /// caller treat it as an identifier.
    fn try_parse_match(&mut self) -> PResult<Option<Stmt>> {
        let (start, depth, chain) = (self.pos, self.depth, self.chain);
        let loc = self.advance().loc;
        let subject = match self.parse_star_expressions() {
            Ok(subject) => subject,
            Err(_) => {
                (self.pos, self.depth, self.chain) = (start, depth, chain);
                return Ok(None);
            }
        };
        let header = self.is_op(":")
            && matches!(self.peek_nth(1).kind, TokenKind::Newline)
            && matches!(self.peek_nth(2).kind, TokenKind::Indent)
            && matches!(&self.peek_nth(3).kind, TokenKind::Name(n) if n == "case");
        if !header {
            (self.pos, self.depth, self.chain) = (start, depth, chain);
            return Ok(None);
        }
        self.pos += 3;

        let mut cases = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::EndMarker => break,
                _ => {}
            }
            if self.peek_name() != Some("case") {
                return Err(self.error_here("expected 'case' block"));
            }
            self.advance();
            let pattern = self.parse_pattern()?;
            let guard = if self.eat_keyword("if") {
                Some(self.parse_named_expression()?)
            } else {
                None
            };
            self.expect_op(":")?;
            let body = self.parse_block()?;
            cases.push(MatchCase {
                pattern,
                guard,
                body,
            });
        }
        Ok(Some(Stmt {
            kind: StmtKind::Match { subject, cases },
            loc,
        }))
    }

    /// Patterns are parsed as expressions; capture names after `as` are
    /// dropped since they only bind.
    fn parse_pattern(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let mut items = Vec::new();
        loop {
            let item = self.parse_star_target()?;
            self.parse_as_name()?;
            items.push(item);
            if !self.eat_op(",") || self.is_op(":") || self.is_keyword("if") {
                break;
            }
        }
        if items.len() == 1 {
            if let Some(item) = items.pop() {
                return Ok(item);
            }
        }
        Ok(Expr::new(ExprKind::Tuple(items), loc))
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn parse_star_expressions(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let first = self.parse_star_expression()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_star_expression()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), loc))
    }

    fn parse_star_expression(&mut self) -> PResult<Expr> {
        if self.is_op("*") {
            let loc = self.advance().loc;
            let value = self.parse_bitwise_or()?;
            return Ok(Expr::new(ExprKind::Starred(Box::new(value)), loc));
        }
        self.parse_expression()
    }

    fn parse_star_named_expression(&mut self) -> PResult<Expr> {
        if self.is_op("*") {
            let loc = self.advance().loc;
            let value = self.parse_bitwise_or()?;
            return Ok(Expr::new(ExprKind::Starred(Box::new(value)), loc));
        }
        self.parse_named_expression()
    }

    fn parse_target_list(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let first = self.parse_star_target()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_keyword("in") || self.is_op("=") || self.is_op(":") {
                break;
            }
            items.push(self.parse_star_target()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), loc))
    }

    fn parse_star_target(&mut self) -> PResult<Expr> {
        if self.is_op("*") {
            let loc = self.advance().loc;
            let value = self.parse_bitwise_or()?;
            return Ok(Expr::new(ExprKind::Starred(Box::new(value)), loc));
        }
        self.parse_bitwise_or()
    }

    fn parse_named_expression(&mut self) -> PResult<Expr> {
        let is_walrus = matches!(self.peek_kind(), TokenKind::Name(n) if !is_keyword(n))
            && matches!(self.peek_nth(1).kind, TokenKind::Op(":="));
        if !is_walrus {
            return self.parse_expression();
        }
        let (name, loc) = self.expect_name()?;
        self.advance();
        let value = self.parse_expression()?;
        Ok(Expr::new(
            ExprKind::NamedExpr {
                target: Box::new(Expr::new(ExprKind::Name(name), loc)),
                value: Box::new(value),
            },
            loc,
        ))
    }

    fn parse_expression(&mut self) -> PResult<Expr> {
        self.enter()?;
        let result = self.parse_expression_inner();
        self.leave();
        result
    }

    fn parse_expression_inner(&mut self) -> PResult<Expr> {
        if self.is_keyword("lambda") {
            return self.parse_lambda();
        }
        let body = self.parse_disjunction()?;
        if !self.eat_keyword("if") {
            return Ok(body);
        }
        let test = self.parse_disjunction()?;
        if !self.eat_keyword("else") {
            return Err(self.error_here("expected 'else' after 'if' expression"));
        }
        let orelse = self.parse_expression()?;
        let loc = body.loc;
        Ok(Expr::new(
            ExprKind::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            },
            loc,
        ))
    }

    fn parse_lambda(&mut self) -> PResult<Expr> {
        let loc = self.advance().loc;
        let params = self.parse_params(":", false)?;
        self.expect_op(":")?;
        // A lambda body is a function scope: `lambda: (yield)` is a generator.
        self.function_depth += 1;
        let body = self.parse_expression();
        self.function_depth -= 1;
        let body = body?;
        Ok(Expr::new(
            ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
            loc,
        ))
    }

    fn parse_yield(&mut self) -> PResult<Expr> {
        let loc = self.advance().loc;
        if self.function_depth == 0 {
            return Err(ParseError::new("'yield' outside function", loc));
        }
        if self.eat_keyword("from") {
            let value = self.parse_expression()?;
            return Ok(Expr::new(ExprKind::YieldFrom(Box::new(value)), loc));
        }
        let value = if self.starts_expression() {
            Some(Box::new(self.parse_star_expressions()?))
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Yield(value), loc))
    }

    fn parse_bool_op(
        &mut self,
        keyword: &'static str,
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let first = next(self)?;
        if !self.is_keyword(keyword) {
            return Ok(first);
        }
        let loc = first.loc;
        let mut values = vec![first];
        while self.eat_keyword(keyword) {
            values.push(next(self)?);
        }
        Ok(Expr::new(ExprKind::BoolOp { op: keyword, values }, loc))
    }

    fn parse_disjunction(&mut self) -> PResult<Expr> {
        self.parse_bool_op("or", Self::parse_conjunction)
    }

    fn parse_conjunction(&mut self) -> PResult<Expr> {
        self.parse_bool_op("and", Self::parse_inversion)
    }

    fn parse_inversion(&mut self) -> PResult<Expr> {
        if !self.is_keyword("not") {
            return self.parse_comparison();
        }
        let loc = self.advance().loc;
        self.enter()?;
        let operand = self.parse_inversion();
        self.leave();
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op: "not",
                operand: Box::new(operand?),
            },
            loc,
        ))
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let left = self.parse_bitwise_or()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        loop {
            let op = if let Some(op) = COMPARISON_OPS.iter().copied().find(|op| self.is_op(op)) {
                self.advance();
                op
            } else if self.eat_keyword("in") {
                "in"
            } else if self.is_keyword("not")
                && matches!(&self.peek_nth(1).kind, TokenKind::Name(n) if n == "in")
            {
                self.advance();
                self.advance();
                "not in"
            } else if self.eat_keyword("is") {
                if self.eat_keyword("not") {
                    "is not"
                } else {
                    "is"
                }
            } else {
                break;
            };
            ops.push(op);
            comparators.push(self.parse_bitwise_or()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let loc = left.loc;
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
                comparators,
            },
            loc,
        ))
    }

    fn parse_binary_level(
        &mut self,
        ops: &[&'static str],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut left = next(self)?;
        let saved = self.chain;
        while let Some(op) = ops.iter().copied().find(|op| self.is_op(op)) {
            self.advance();
            self.extend_chain()?;
            let right = next(self)?;
            let loc = left.loc;
            left = Expr::new(
                ExprKind::BinOp {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                },
                loc,
            );
        }
        self.chain = saved;
        Ok(left)
    }

    fn parse_bitwise_or(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["|"], Self::parse_bitwise_xor)
    }

    fn parse_bitwise_xor(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["^"], Self::parse_bitwise_and)
    }

    fn parse_bitwise_and(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["&"], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["<<", ">>"], Self::parse_sum)
    }

    fn parse_sum(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["+", "-"], Self::parse_term)
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["*", "/", "//", "%", "@"], Self::parse_factor)
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Op(op @ ("+" | "-" | "~")) => *op,
            _ => return self.parse_power(),
        };
        let loc = self.advance().loc;
        self.enter()?;
        let operand = self.parse_factor();
        self.leave();
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op,
                operand: Box::new(operand?),
            },
            loc,
        ))
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let base = self.parse_await_primary()?;
        if !self.eat_op("**") {
            return Ok(base);
        }
        self.enter()?;
        let exponent = self.parse_factor();
        self.leave();
        let loc = base.loc;
        Ok(Expr::new(
            ExprKind::BinOp {
                left: Box::new(base),
                op: "**",
                right: Box::new(exponent?),
            },
            loc,
        ))
    }

    fn parse_await_primary(&mut self) -> PResult<Expr> {
        if !self.is_keyword("await") {
            return self.parse_primary();
        }
        let loc = self.advance().loc;
        let value = self.parse_primary()?;
        Ok(Expr::new(ExprKind::Await(Box::new(value)), loc))
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_atom()?;
        let saved = self.chain;
        loop {
            let loc = expr.loc;
            if self.is_op(".") || self.is_op("(") || self.is_op("[") {
                self.extend_chain()?;
            }
            if self.eat_op(".") {
                let (attr, _) = self.expect_name()?;
                expr = Expr::new(
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    loc,
                );
            } else if self.eat_op("(") {
                let (args, keywords) = self.parse_call_args()?;
                expr = Expr::new(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                        keywords,
                    },
                    loc,
                );
            } else if self.eat_op("[") {
                let index = self.parse_slices()?;
                expr = Expr::new(
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    loc,
                );
            } else {
                self.chain = saved;
                return Ok(expr);
            }
        }
    }

    /// Arguments after an opening `(`, consuming the closing `)`.
    fn parse_call_args(&mut self) -> PResult<(Vec<Expr>, Vec<Keyword>)> {
        let mut args = Vec::new();
        let mut keywords: Vec<Keyword> = Vec::new();
        while !self.is_op(")") {
            let loc = self.loc();
            if self.eat_op("*") {
                let value = self.parse_expression()?;
                args.push(Expr::new(ExprKind::Starred(Box::new(value)), loc));
            } else if self.eat_op("**") {
                let value = self.parse_expression()?;
                keywords.push(Keyword { arg: None, value });
            } else if matches!(self.peek_kind(), TokenKind::Name(n) if !is_keyword(n))
                && matches!(self.peek_nth(1).kind, TokenKind::Op("="))
            {
                let (arg, _) = self.expect_name()?;
                self.advance();
                let value = self.parse_expression()?;
                keywords.push(Keyword {
                    arg: Some(arg),
                    value,
                });
            } else {
                let value = self.parse_named_expression()?;
                if self.is_keyword("for") || self.is_keyword("async") {
                    let genexp =
                        self.parse_comprehension_tail(ComprehensionKind::Generator, value, None)?;
                    args.push(genexp);
                } else {
                    if keywords.iter().any(|k| k.arg.is_some()) {
                        return Err(ParseError::new(
                            "positional argument follows keyword argument",
                            loc,
                        ));
                    }
                    args.push(value);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, keywords))
    }

    /// Subscript contents after `[`, consuming the closing `]`.
    fn parse_slices(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let first = self.parse_slice()?;
        let index = if self.is_op(",") {
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.is_op("]") {
                    break;
                }
                items.push(self.parse_slice()?);
            }
            Expr::new(ExprKind::Tuple(items), loc)
        } else {
            first
        };
        self.expect_op("]")?;
        Ok(index)
    }

    fn parse_slice(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        if self.is_op("*") {
            return self.parse_star_named_expression();
        }
        let lower = if self.is_op(":") {
            None
        } else {
            let lower = self.parse_named_expression()?;
            if !self.is_op(":") {
                return Ok(lower);
            }
            Some(Box::new(lower))
        };
        self.expect_op(":")?;
        let upper = if self.at_slice_end() {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        let step = if self.eat_op(":") && !self.at_slice_end() {
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Slice { lower, upper, step }, loc))
    }

    fn at_slice_end(&self) -> bool {
        self.is_op(":") || self.is_op("]") || self.is_op(",")
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        let loc = token.loc;
        let kind = match token.kind {
            TokenKind::Name(name) => match name.as_str() {
                "None" => ExprKind::Constant(Constant::None),
                "True" => ExprKind::Constant(Constant::Bool(true)),
                "False" => ExprKind::Constant(Constant::Bool(false)),
                n if is_keyword(n) => return Err(self.error_here("invalid syntax")),
                n => ExprKind::Name(n.to_owned()),
            },
            TokenKind::Number(text) => ExprKind::Constant(Constant::Number(text)),
            TokenKind::Op("...") => ExprKind::Constant(Constant::Ellipsis),
            TokenKind::Str(_) => return self.parse_strings(),
            TokenKind::Op("(") => return self.parse_paren(),
            TokenKind::Op("[") => return self.parse_list(),
            TokenKind::Op("{") => return self.parse_brace(),
            TokenKind::Indent => return Err(self.error_here("unexpected indent")),
            _ => return Err(self.error_here("invalid syntax")),
        };
        self.advance();
        Ok(Expr::new(kind, loc))
    }

    fn parse_paren(&mut self) -> PResult<Expr> {
        let loc = self.advance().loc;
        if self.eat_op(")") {
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), loc));
        }
        if self.is_keyword("yield") {
            let value = self.parse_yield()?;
            self.expect_op(")")?;
            return Ok(value);
        }
        let first = self.parse_star_named_expression()?;
        if self.is_keyword("for") || self.is_keyword("async") {
            let genexp = self.parse_comprehension_tail(ComprehensionKind::Generator, first, None)?;
            self.expect_op(")")?;
            return Ok(genexp);
        }
        if self.is_op(",") {
            let items = self.parse_sequence_rest(first, ")")?;
            return Ok(Expr::new(ExprKind::Tuple(items), loc));
        }
        self.expect_op(")")?;
        if matches!(first.kind, ExprKind::Starred(_)) {
            return Err(ParseError::new("cannot use starred expression here", first.loc));
        }
        Ok(first)
    }

    fn parse_list(&mut self) -> PResult<Expr> {
        let loc = self.advance().loc;
        if self.eat_op("]") {
            return Ok(Expr::new(ExprKind::List(Vec::new()), loc));
        }
        let first = self.parse_star_named_expression()?;
        if self.is_keyword("for") || self.is_keyword("async") {
            let comp = self.parse_comprehension_tail(ComprehensionKind::List, first, None)?;
            self.expect_op("]")?;
            return Ok(comp);
        }
        let items = self.parse_sequence_rest(first, "]")?;
        Ok(Expr::new(ExprKind::List(items), loc))
    }

    /// Remaining comma-separated items after `first`, consuming `closing`.
    fn parse_sequence_rest(&mut self, first: Expr, closing: &str) -> PResult<Vec<Expr>> {
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op(closing) {
                break;
            }
            items.push(self.parse_star_named_expression()?);
        }
        self.expect_op(closing)?;
        Ok(items)
    }

    fn parse_brace(&mut self) -> PResult<Expr> {
        let loc = self.advance().loc;
        if self.eat_op("}") {
            return Ok(Expr::new(ExprKind::Dict(Vec::new()), loc));
        }
        if self.eat_op("**") {
            let value = self.parse_bitwise_or()?;
            let entries = self.parse_dict_rest(vec![DictEntry::Unpack(value)])?;
            return Ok(Expr::new(ExprKind::Dict(entries), loc));
        }
        let first = self.parse_star_named_expression()?;
        if self.eat_op(":") {
            let value = self.parse_expression()?;
            if self.is_keyword("for") || self.is_keyword("async") {
                let comp =
                    self.parse_comprehension_tail(ComprehensionKind::Dict, first, Some(value))?;
                self.expect_op("}")?;
                return Ok(comp);
            }
            let entries = self.parse_dict_rest(vec![DictEntry::Pair(first, value)])?;
            return Ok(Expr::new(ExprKind::Dict(entries), loc));
        }
        if self.is_keyword("for") || self.is_keyword("async") {
            let comp = self.parse_comprehension_tail(ComprehensionKind::Set, first, None)?;
            self.expect_op("}")?;
            return Ok(comp);
        }
        let items = self.parse_sequence_rest(first, "}")?;
        Ok(Expr::new(ExprKind::Set(items), loc))
    }

    fn parse_dict_rest(&mut self, mut entries: Vec<DictEntry>) -> PResult<Vec<DictEntry>> {
        while self.eat_op(",") {
            if self.is_op("}") {
                break;
            }
            if self.eat_op("**") {
                entries.push(DictEntry::Unpack(self.parse_bitwise_or()?));
            } else {
                let key = self.parse_expression()?;
                self.expect_op(":")?;
                let value = self.parse_expression()?;
                entries.push(DictEntry::Pair(key, value));
            }
        }
        self.expect_op("}")?;
        Ok(entries)
    }

    fn parse_comprehension_tail(
        &mut self,
        kind: ComprehensionKind,
        element: Expr,
        value: Option<Expr>,
    ) -> PResult<Expr> {
        let loc = element.loc;
        let mut generators = Vec::new();
        loop {
            let is_async = self.eat_keyword("async");
            if !self.eat_keyword("for") {
                if is_async {
                    return Err(self.error_here("expected 'for'"));
                }
                break;
            }
            let target = self.parse_target_list()?;
            check_assignable(&target, "assign to")?;
            self.expect_keyword("in")?;
            let iter = self.parse_disjunction()?;
            let mut ifs = Vec::new();
            while self.eat_keyword("if") {
                ifs.push(self.parse_disjunction()?);
            }
            generators.push(Comprehension {
                target,
                iter,
                ifs,
                is_async,
            });
        }
        Ok(Expr::new(
            ExprKind::Comprehension {
                kind,
                element: Box::new(element),
                value: value.map(Box::new),
                generators,
            },
            loc,
        ))
    }

    /// Adjacent string literals concatenate into one node.
    fn parse_strings(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let mut value = String::new();
        let mut fields = Vec::new();
        let mut is_bytes = None;
        while let TokenKind::Str(token) = &self.peek().kind {
            let token = token.clone();
            self.advance();
            match is_bytes {
                None => is_bytes = Some(token.is_bytes),
                Some(b) if b != token.is_bytes => {
                    return Err(ParseError::new(
                        "cannot mix bytes and nonbytes literals",
                        loc,
                    ));
                }
                Some(_) => {}
            }
            if token.is_fstring {
                fields.extend(self.parse_fstring_fields(&token)?);
            }
            value.push_str(&token.body);
        }
        Ok(Expr::new(
            ExprKind::Str {
                value,
                is_bytes: is_bytes.unwrap_or(false),
                fields,
            },
            loc,
        ))
    }

    fn parse_fstring_fields(&mut self, token: &StrToken) -> PResult<Vec<Expr>> {
        let chars: Vec<char> = token.body.chars().collect();
        let mut scanner = FieldScanner {
            chars: &chars,
            pos: 0,
            raw: token.is_raw,
            spans: Vec::new(),
        };
        if let Err((at, message)) = scanner.scan_literal(false) {
            return Err(ParseError::new(
                message,
                offset_location(token.body_start, &chars[..at.min(chars.len())]),
            ));
        }
        let mut fields = Vec::new();
        for (start, end) in scanner.spans {
            let origin = offset_location(token.body_start, &chars[..start]);
            let text: String = chars[start..end].iter().collect();
            if text.trim().is_empty() {
                return Err(ParseError::new(
                    "f-string: valid expression required before '}'",
                    origin,
                ));
            }
            fields.push(parse_fragment(&text, origin, self.depth + 1, self.chain)?);
        }
        Ok(fields)
    }
}

// ---------------------------------------------------------------------------
// f-string replacement fields
// ---------------------------------------------------------------------------

type ScanResult = Result<(), (usize, &'static str)>;

/// Finds the expression span of every replacement field in an f-string
/// body, including fields nested in format specs.
struct FieldScanner<'a> {
    chars: &'a [char],
    pos: usize,
    raw: bool,
    spans: Vec<(usize, usize)>,
}

impl FieldScanner<'_> {
    fn at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    /// Literal text; inside a format spec, stops at the closing `}`.
    fn scan_literal(&mut self, in_spec: bool) -> ScanResult {
        while let Some(c) = self.at(0) {
            match c {
                '\\' if !self.raw => self.skip_escape(),
                '{' if !in_spec && self.at(1) == Some('{') => self.pos += 2,
                '{' => {
                    self.pos += 1;
                    self.scan_field()?;
                }
                '}' if in_spec => return Ok(()),
                '}' if self.at(1) == Some('}') => self.pos += 2,
                '}' => return Err((self.pos, "f-string: single '}' is not allowed")),
                _ => self.pos += 1,
            }
        }
        if in_spec {
            Err((self.pos, "f-string: expecting '}'"))
        } else {
            Ok(())
        }
    }

    fn skip_escape(&mut self) {
        match self.at(1) {
            Some('\\') => self.pos += 2,
            Some('N') if self.at(2) == Some('{') => {
                self.pos += 3;
                while let Some(c) = self.at(0) {
                    self.pos += 1;
                    if c == '}' {
                        break;
                    }
                }
            }
            _ => self.pos += 1,
        }
    }

    /// A replacement field; `pos` sits just past its `{`.
    fn scan_field(&mut self) -> ScanResult {
        let start = self.pos;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut expr_end: Option<usize> = None;
        loop {
            let Some(c) = self.at(0) else {
                return Err((start, "f-string: expecting '}'"));
            };
            if let Some(q) = quote {
                if c == '\\' {
                    self.pos += 1;
                } else if c == q {
                    quote = None;
                }
                self.pos += 1;
                continue;
            }
            match c {
                '\'' | '"' => {
                    quote = Some(c);
                    self.pos += 1;
                }
                '(' | '[' | '{' => {
                    depth += 1;
                    self.pos += 1;
                }
                ')' | ']' | '}' if depth > 0 => {
                    depth -= 1;
                    self.pos += 1;
                }
                '}' => {
                    self.spans.push((start, expr_end.unwrap_or(self.pos)));
                    self.pos += 1;
                    return Ok(());
                }
                '!' if depth == 0 && self.at(1) != Some('=') => {
                    expr_end.get_or_insert(self.pos);
                    self.pos += 1;
                    while matches!(self.at(0), Some(c) if c.is_alphanumeric()) {
                        self.pos += 1;
                    }
                    if !matches!(self.at(0), Some(':') | Some('}')) {
                        return Err((self.pos, "f-string: expecting '}'"));
                    }
                }
                ':' if depth == 0 => {
                    let end = expr_end.unwrap_or(self.pos);
                    self.pos += 1;
                    self.scan_literal(true)?;
                    self.spans.push((start, end));
                    self.pos += 1;
                    return Ok(());
                }
                '=' if depth == 0 && self.is_debug_equals() => {
                    expr_end.get_or_insert(self.pos);
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }
    }

    /// `{expr=}` self-documenting form, as opposed to `==`, `<=`, etc.
    fn is_debug_equals(&self) -> bool {
        let prev = self.pos.checked_sub(1).and_then(|i| self.chars.get(i).copied());
        if matches!(prev, Some('=' | '!' | '<' | '>')) || self.at(1) == Some('=') {
            return false;
        }
        let rest = &self.chars[self.pos + 1..];
        matches!(
            rest.iter().copied().find(|c| !c.is_whitespace()),
            Some('}' | '!' | ':')
        )
    }
}

fn offset_location(mut loc: Location, chars: &[char]) -> Location {
    for &c in chars {
        if c == '\n' {
            loc.line += 1;
            loc.column = 1;
        } else {
            loc.column += 1;
        }
    }
    loc
}

// ---------------------------------------------------------------------------
// Target validation
// ---------------------------------------------------------------------------

fn is_single_target(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. }
    )
}

fn check_assignable(expr: &Expr, verb: &str) -> PResult<()> {
    match &expr.kind {
        ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => Ok(()),
        ExprKind::Tuple(items) | ExprKind::List(items) => {
            items.iter().try_for_each(|item| check_assignable(item, verb))
        }
        ExprKind::Starred(inner) if verb != "delete" => check_assignable(inner, verb),
        other => Err(ParseError::new(
            format!("cannot {verb} {}", describe(other)),
            expr.loc,
        )),
    }
}

fn describe(kind: &ExprKind) -> &'static str {
    match kind {
        ExprKind::Call { .. } => "function call",
        ExprKind::Constant(_) | ExprKind::Str { .. } => "literal",
        ExprKind::Lambda { .. } => "lambda",
        ExprKind::Comprehension { .. } => "comprehension",
        ExprKind::Dict(_) | ExprKind::Set(_) => "literal",
        ExprKind::Await(_) => "await expression",
        ExprKind::Yield(_) | ExprKind::YieldFrom(_) => "yield expression",
        ExprKind::NamedExpr { .. } => "named expression",
        ExprKind::IfExp { .. } => "conditional expression",
        ExprKind::Compare { .. } => "comparison",
        ExprKind::Starred(_) => "starred",
        _ => "expression",
    }
}

fn register_param(names: &mut HashSet<String>, name: &str, loc: Location) -> PResult<()> {
    if names.insert(name.to_owned()) {
        Ok(())
    } else {
        Err(ParseError::new(
            format!("duplicate argument '{name}' in function definition"),
            loc,
        ))
    }
}
