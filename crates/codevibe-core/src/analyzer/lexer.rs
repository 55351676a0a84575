//! Tokenizer for Python source.
//!
//! Produces a flat token vector with explicit `Newline` / `Indent` / `Dedent`
//! tokens, the same shape CPython's tokenizer hands to its parser. Newlines
//! inside brackets and after a line-continuation backslash are swallowed.
//! Errors carry the location of the offending character.

use unicode_normalization::UnicodeNormalization;

use super::ast::Location;
use super::ParseError;

const TAB_SIZE: usize = 8;

/// Three-character operators first so longest-match falls out of list order.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "**", "//", ">>", "<<", "<=", ">=", "==", "!=",
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "@", "&", "|",
    "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ";", ".", "=",
];

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Number(String),
    Str(StrToken),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    EndMarker,
}

/// A single string literal, prefix stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct StrToken {
    /// Body between the quotes, escapes left as written.
    pub body: String,
    /// Location of the first body character.
    pub body_start: Location,
    pub is_bytes: bool,
    pub is_fstring: bool,
    pub is_raw: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: Location,
}

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    /// Open indentation levels as (width with 8-column tabs, width with
    /// 1-column tabs). Both orderings must agree or the line is a TabError.
    indents: Vec<(usize, usize)>,
    brackets: Vec<(char, Location)>,
    tokens: Vec<Token>,
    at_line_start: bool,
    /// Fragment mode: no indentation tracking, no trailing NEWLINE.
    fragment: bool,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self::with_origin(source, Location::new(1, 1), false)
    }

    /// Lex a fragment (an f-string replacement field) whose first character
    /// sits at `origin` in the enclosing program.
    pub fn fragment(source: &str, origin: Location) -> Self {
        Self::with_origin(source, origin, true)
    }

    fn with_origin(source: &str, origin: Location, fragment: bool) -> Self {
        let source = match source.strip_prefix('\u{feff}') {
            Some(rest) if !fragment => rest,
            _ => source,
        };
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: origin.line,
            col: origin.column,
            indents: vec![(0, 0)],
            brackets: Vec::new(),
            tokens: Vec::new(),
            at_line_start: !fragment,
            fragment,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        while self.pos < self.chars.len() {
            if self.at_line_start {
                self.at_line_start = false;
                if self.handle_indentation()? {
                    continue;
                }
            }
            self.next_token()?;
        }
        self.finish()
    }

    fn loc(&self) -> Location {
        Location::new(self.line, self.col)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, loc: Location) {
        self.tokens.push(Token { kind, loc });
    }

    /// Measure leading whitespace of a logical line. Returns `true` when the
    /// line was blank or comment-only and has been consumed entirely.
    fn handle_indentation(&mut self) -> Result<bool, ParseError> {
        let mut width = 0usize;
        let mut alt = 0usize;
        while let Some(c) = self.peek() {
            match c {
                ' ' => {
                    width += 1;
                    alt += 1;
                }
                '\t' => {
                    width = (width / TAB_SIZE + 1) * TAB_SIZE;
                    alt += 1;
                }
                '\x0c' => {
                    width = 0;
                    alt = 0;
                }
                _ => break,
            }
            self.bump();
        }

        match self.peek() {
            None => return Ok(true),
            Some('\n') => {
                self.bump();
                self.at_line_start = true;
                return Ok(true);
            }
            Some('\r') => {
                self.bump();
                if self.peek() == Some('\n') {
                    self.bump();
                }
                self.at_line_start = true;
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(true);
            }
            Some('\\') if matches!(self.peek_at(1), Some('\n') | Some('\r')) => {
                // A continuation at the very start of a line keeps the
                // indentation of the line it joins.
                return Ok(false);
            }
            _ => {}
        }

        let loc = self.loc();
        let (current, current_alt) = self.current_indent();
        if width > current {
            if alt <= current_alt {
                return Err(inconsistent_tabs(loc));
            }
            self.indents.push((width, alt));
            self.push(TokenKind::Indent, loc);
        } else if width < current {
            while width < self.current_indent().0 {
                self.indents.pop();
                self.push(TokenKind::Dedent, loc);
            }
            let (outer, outer_alt) = self.current_indent();
            if width != outer {
                return Err(ParseError::new(
                    "unindent does not match any outer indentation level",
                    loc,
                ));
            }
            if alt != outer_alt {
                return Err(inconsistent_tabs(loc));
            }
        } else if alt != current_alt {
            return Err(inconsistent_tabs(loc));
        }
        Ok(false)
    }

    fn current_indent(&self) -> (usize, usize) {
        self.indents.last().copied().unwrap_or((0, 0))
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' || c == '\r' {
                break;
            }
            self.bump();
        }
    }

    fn newline(&mut self, loc: Location) {
        if self.brackets.is_empty() && !self.fragment {
            let last_is_newline = matches!(
                self.tokens.last().map(|t| &t.kind),
                None | Some(TokenKind::Newline) | Some(TokenKind::Indent) | Some(TokenKind::Dedent)
            );
            if !last_is_newline {
                self.push(TokenKind::Newline, loc);
            }
            self.at_line_start = true;
        }
    }

    fn next_token(&mut self) -> Result<(), ParseError> {
        let Some(c) = self.peek() else {
            return Ok(());
        };
        let loc = self.loc();

        match c {
            ' ' | '\t' | '\x0c' => {
                self.bump();
            }
            '\n' => {
                self.bump();
                self.newline(loc);
            }
            '\r' => {
                self.bump();
                if self.peek() == Some('\n') {
                    self.bump();
                }
                self.newline(loc);
            }
            '#' => self.skip_comment(),
            '\\' => {
                self.bump();
                match self.peek() {
                    Some('\n') => {
                        self.bump();
                    }
                    Some('\r') => {
                        self.bump();
                        if self.peek() == Some('\n') {
                            self.bump();
                        }
                    }
                    None => {
                        return Err(ParseError::new("unexpected EOF while parsing", loc));
                    }
                    Some(_) => {
                        return Err(ParseError::new(
                            "unexpected character after line continuation character",
                            loc,
                        ));
                    }
                }
            }
            c if c.is_ascii_digit()
                || (c == '.' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                self.lex_number(loc)?;
            }
            c if c == '_' || c.is_alphabetic() => {
                let ident = self.lex_identifier();
                if let Some(prefix) = string_prefix(&ident) {
                    if matches!(self.peek(), Some('"') | Some('\'')) {
                        return self.lex_string(loc, prefix);
                    }
                }
                // Python folds identifiers to NFKC, so `ｅｖａｌ` is `eval`.
                let ident = if ident.is_ascii() {
                    ident
                } else {
                    ident.nfkc().collect()
                };
                self.push(TokenKind::Name(ident), loc);
            }
            '"' | '\'' => self.lex_string(loc, StringPrefix::default())?,
            _ => self.lex_operator(loc)?,
        }
        Ok(())
    }

    fn lex_identifier(&mut self) -> String {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }
        ident
    }

    fn lex_number(&mut self, loc: Location) -> Result<(), ParseError> {
        let mut text = String::new();
        let radix_prefix = self.peek() == Some('0')
            && matches!(
                self.peek_at(1),
                Some('x') | Some('X') | Some('o') | Some('O') | Some('b') | Some('B')
            );

        while let Some(c) = self.peek() {
            let exponent_sign = !radix_prefix
                && (c == '+' || c == '-')
                && text.ends_with(['e', 'E']);
            let dot_ok = c == '.' && !radix_prefix && !text.contains(['.', 'e', 'E']);
            if c.is_ascii_alphanumeric() || c == '_' || dot_ok || exponent_sign {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }

        if !is_valid_number(&text) {
            return Err(ParseError::new(format!("invalid number literal '{text}'"), loc));
        }
        self.push(TokenKind::Number(text), loc);
        Ok(())
    }

    fn lex_string(&mut self, loc: Location, prefix: StringPrefix) -> Result<(), ParseError> {
        let quote = self.bump().unwrap_or('"');
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let body_start = self.loc();
        let mut body = String::new();
        loop {
            let Some(c) = self.peek() else {
                let msg = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                return Err(ParseError::new(msg, loc));
            };

            if c == '\\' {
                body.push(c);
                self.bump();
                if let Some(escaped) = self.bump() {
                    body.push(escaped);
                }
                continue;
            }

            if c == quote {
                if !triple {
                    self.bump();
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.bump();
                    self.bump();
                    self.bump();
                    break;
                }
            }

            if (c == '\n' || c == '\r') && !triple {
                return Err(ParseError::new("unterminated string literal", loc));
            }

            body.push(c);
            self.bump();
        }

        self.push(
            TokenKind::Str(StrToken {
                body,
                body_start,
                is_bytes: prefix.bytes,
                is_fstring: prefix.format,
                is_raw: prefix.raw,
            }),
            loc,
        );
        Ok(())
    }

    fn lex_operator(&mut self, loc: Location) -> Result<(), ParseError> {
        let op = OPERATORS.iter().copied().find(|op| {
            op.chars()
                .enumerate()
                .all(|(i, ch)| self.peek_at(i) == Some(ch))
        });

        let Some(op) = op else {
            let c = self.peek().unwrap_or('?');
            return Err(ParseError::new(
                format!("invalid character '{c}' (U+{:04X})", c as u32),
                loc,
            ));
        };

        for _ in 0..op.chars().count() {
            self.bump();
        }

        match op {
            "(" | "[" | "{" => {
                let ch = op.chars().next().unwrap_or('(');
                self.brackets.push((ch, loc));
            }
            ")" | "]" | "}" => {
                let close = op.chars().next().unwrap_or(')');
                match self.brackets.pop() {
                    None => {
                        return Err(ParseError::new(format!("unmatched '{close}'"), loc));
                    }
                    Some((open, _)) if matching_close(open) != close => {
                        return Err(ParseError::new(
                            format!(
                                "closing parenthesis '{close}' does not match opening parenthesis '{open}'"
                            ),
                            loc,
                        ));
                    }
                    Some(_) => {}
                }
            }
            _ => {}
        }

        self.push(TokenKind::Op(op), loc);
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<Token>, ParseError> {
        if let Some((open, loc)) = self.brackets.first().copied() {
            return Err(ParseError::new(format!("'{open}' was never closed"), loc));
        }
        let loc = self.loc();
        if !self.fragment {
            if !matches!(
                self.tokens.last().map(|t| &t.kind),
                None | Some(TokenKind::Newline) | Some(TokenKind::Dedent)
            ) {
                self.push(TokenKind::Newline, loc);
            }
            while self.indents.len() > 1 {
                self.indents.pop();
                self.push(TokenKind::Dedent, loc);
            }
        }
        self.push(TokenKind::EndMarker, loc);
        Ok(self.tokens)
    }
}

fn inconsistent_tabs(loc: Location) -> ParseError {
    ParseError::new("inconsistent use of tabs and spaces in indentation", loc)
}

fn matching_close(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StringPrefix {
    bytes: bool,
    format: bool,
    raw: bool,
}

fn string_prefix(ident: &str) -> Option<StringPrefix> {
    if ident.len() > 2 {
        return None;
    }
    let lower = ident.to_ascii_lowercase();
    let valid = matches!(
        lower.as_str(),
        "r" | "u" | "b" | "br" | "rb" | "f" | "fr" | "rf"
    );
    valid.then(|| StringPrefix {
        bytes: lower.contains('b'),
        format: lower.contains('f'),
        raw: lower.contains('r'),
    })
}

fn is_valid_number(text: &str) -> bool {
    let t = text.strip_suffix(['j', 'J']).unwrap_or(text);
    if t.is_empty() || t.starts_with('_') || t.ends_with('_') || t.contains("__") {
        return false;
    }
    let lower = t.to_ascii_lowercase();
    if let Some(digits) = lower.strip_prefix("0x") {
        return !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit() || c == '_');
    }
    if let Some(digits) = lower.strip_prefix("0o") {
        return !digits.is_empty() && digits.chars().all(|c| ('0'..='7').contains(&c) || c == '_');
    }
    if let Some(digits) = lower.strip_prefix("0b") {
        return !digits.is_empty() && digits.chars().all(|c| c == '0' || c == '1' || c == '_');
    }

    let (mantissa, exponent) = match lower.find('e') {
        Some(i) => (&lower[..i], Some(&lower[i + 1..])),
        None => (lower.as_str(), None),
    };
    let mantissa_ok = !mantissa.is_empty()
        && mantissa != "."
        && mantissa.chars().all(|c| c.is_ascii_digit() || c == '_' || c == '.');
    let exponent_ok = match exponent {
        None => true,
        Some(e) => {
            let e = e.strip_prefix(['+', '-']).unwrap_or(e);
            !e.is_empty() && e.chars().all(|c| c.is_ascii_digit() || c == '_')
        }
    };
    mantissa_ok && exponent_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn name(s: &str) -> TokenKind {
        TokenKind::Name(s.into())
    }

    #[test]
    fn test_simple_statement() {
        assert_eq!(
            kinds("x = 1\n"),
            vec![
                name("x"),
                TokenKind::Op("="),
                TokenKind::Number("1".into()),
                TokenKind::Newline,
                TokenKind::EndMarker,
            ]
        );
    }

    #[test]
    fn test_indent_dedent() {
        let k = kinds("if x:\n    y\nz\n");
        assert!(k.contains(&TokenKind::Indent));
        assert!(k.contains(&TokenKind::Dedent));
        let indent = k.iter().position(|t| *t == TokenKind::Indent).unwrap();
        let dedent = k.iter().position(|t| *t == TokenKind::Dedent).unwrap();
        assert!(indent < dedent);
    }

    #[test]
    fn test_missing_trailing_newline_closes_blocks() {
        let k = kinds("def f():\n    return 1");
        assert_eq!(k[k.len() - 1], TokenKind::EndMarker);
        assert_eq!(k[k.len() - 2], TokenKind::Dedent);
    }

    #[test]
    fn test_newlines_inside_brackets_ignored() {
        let k = kinds("f(1,\n  2)\n");
        assert_eq!(k.iter().filter(|t| **t == TokenKind::Newline).count(), 1);
        assert!(!k.contains(&TokenKind::Indent));
    }

    #[test]
    fn test_blank_and_comment_lines_skipped() {
        let k = kinds("x = 1\n\n    # comment\ny = 2\n");
        assert!(!k.contains(&TokenKind::Indent));
    }

    #[test]
    fn test_bad_dedent() {
        let err = Lexer::new("if x:\n        a\n    b\n").tokenize().unwrap_err();
        assert!(err.message.contains("unindent"));
        assert_eq!(err.location.line, 3);
    }

    #[test]
    fn test_mixed_tabs_and_spaces_rejected() {
        let err = Lexer::new("if x:\n\ta\n        b\n").tokenize().unwrap_err();
        assert_eq!(err.message, "inconsistent use of tabs and spaces in indentation");
        assert_eq!(err.location.line, 3);

        let err = Lexer::new("if x:\n        a\n        if y:\n\t b\n")
            .tokenize()
            .unwrap_err();
        assert!(err.message.contains("inconsistent use of tabs"));
    }

    #[test]
    fn test_consistent_tabs_accepted() {
        let k = kinds("if x:\n\ta\n\tif y:\n\t\tb\nc\n");
        assert_eq!(k.iter().filter(|t| **t == TokenKind::Indent).count(), 2);
    }

    #[test]
    fn test_leading_byte_order_mark_skipped() {
        let toks = Lexer::new("\u{feff}x = 1\n").tokenize().unwrap();
        assert_eq!(toks[0].kind, name("x"));
        assert_eq!(toks[0].loc, Location::new(1, 1));
    }

    #[test]
    fn test_identifiers_are_nfkc_folded() {
        assert_eq!(kinds("\u{ff45}\u{ff56}\u{ff41}\u{ff4c}\n")[0], name("eval"));
        // Mathematical bold small letters.
        let k = kinds("__\u{1d422}\u{1d426}\u{1d429}\u{1d428}\u{1d42b}\u{1d42d}__\n");
        assert_eq!(k[0], name("__import__"));
        assert_eq!(kinds("caf\u{e9}\n")[0], name("caf\u{e9}"));
    }

    #[test]
    fn test_string_prefixes() {
        let toks = Lexer::new("f'{x}' rb\"y\" u'z'\n").tokenize().unwrap();
        let strs: Vec<_> = toks
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Str(s) => Some((s.is_fstring, s.is_bytes)),
                _ => None,
            })
            .collect();
        assert_eq!(strs, vec![(true, false), (false, true), (false, false)]);
    }

    #[test]
    fn test_triple_quoted_spans_lines() {
        let toks = Lexer::new("s = '''a\nb'''\nx\n").tokenize().unwrap();
        let x = toks.iter().find(|t| t.kind == name("x")).unwrap();
        assert_eq!(x.loc.line, 3);
    }

    #[test]
    fn test_escaped_quote() {
        let toks = Lexer::new(r#"s = "a\"b""#).tokenize().unwrap();
        assert!(toks
            .iter()
            .any(|t| matches!(&t.kind, TokenKind::Str(s) if s.body == r#"a\"b"#)));
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("print('hi)\n").tokenize().unwrap_err();
        assert_eq!(err.message, "unterminated string literal");
        assert_eq!(err.location, Location::new(1, 7));
    }

    #[test]
    fn test_unclosed_bracket_reports_opening() {
        let err = Lexer::new("x = [1,\n2\n").tokenize().unwrap_err();
        assert_eq!(err.message, "'[' was never closed");
        assert_eq!(err.location, Location::new(1, 5));
    }

    #[test]
    fn test_mismatched_bracket() {
        let err = Lexer::new("f(1]\n").tokenize().unwrap_err();
        assert!(err.message.contains("does not match"));
    }

    #[test]
    fn test_invalid_character() {
        let err = Lexer::new("x = 1 $ 2\n").tokenize().unwrap_err();
        assert!(err.message.contains("invalid character"));
        assert_eq!(err.location.column, 7);
    }

    #[test]
    fn test_numbers() {
        for n in ["1", "1_000", "0x1F", "0b101", "0o17", "1.5", ".5", "1e10", "1.5e-3", "2j", "1."] {
            let k = kinds(&format!("{n}\n"));
            assert_eq!(k[0], TokenKind::Number(n.into()), "{n}");
        }
        assert!(Lexer::new("0x\n").tokenize().is_err());
        assert!(Lexer::new("1__0\n").tokenize().is_err());
    }

    #[test]
    fn test_line_continuation() {
        let k = kinds("x = 1 + \\\n    2\n");
        assert!(!k.contains(&TokenKind::Indent));
        assert_eq!(k.iter().filter(|t| **t == TokenKind::Newline).count(), 1);
    }

    #[test]
    fn test_longest_operator_match() {
        let k = kinds("a **= b // c\n");
        assert!(k.contains(&TokenKind::Op("**=")));
        assert!(k.contains(&TokenKind::Op("//")));
    }

    #[test]
    fn test_fragment_origin() {
        let toks = Lexer::fragment("a + b", Location::new(4, 10)).tokenize().unwrap();
        assert_eq!(toks[0].loc, Location::new(4, 10));
        assert_eq!(toks[2].loc, Location::new(4, 14));
        assert_eq!(toks.last().unwrap().kind, TokenKind::EndMarker);
    }
}
