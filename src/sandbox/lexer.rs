//! Tokenizer for the sandbox language, including indentation tracking.

use super::fault::Fault;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// Raw body of an f-string; expressions are parsed later.
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

// Longest operators first so that prefix matching picks e.g. `**=` over `**`.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=",
    "/=", "%=", "&=", "|=", "^=", "->", ":=", "<<", ">>", "+", "-", "*", "/", "%", "<", ">",
    "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@", "&", "|", "^", "~",
];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    tokens: Vec<Token>,
    indents: Vec<usize>,
    depth: usize,
}

/// Splits source into tokens, emitting `Indent`/`Dedent` around blocks.
pub fn tokenize(src: &str) -> Result<Vec<Token>, Fault> {
    let mut lexer = Lexer {
        chars: src.chars().collect(),
        pos: 0,
        line: 1,
        tokens: Vec::new(),
        indents: vec![0],
        depth: 0,
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn run(&mut self) -> Result<(), Fault> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                at_line_start = false;
                if self.handle_indentation()? {
                    continue;
                }
            }
            let c = match self.peek() {
                Some(c) => c,
                None => break,
            };
            match c {
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.push_newline();
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => self.number()?,
                c if c == '"' || c == '\'' => self.string(String::new())?,
                c if c.is_alphabetic() || c == '_' => self.name_or_prefixed_string()?,
                _ => self.operator()?,
            }
        }
        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    fn push_newline(&mut self) {
        match self.tokens.last() {
            None | Some(Token { tok: Tok::Newline, .. }) => {}
            Some(Token { tok: Tok::Indent, .. }) | Some(Token { tok: Tok::Dedent, .. }) => {}
            _ => self.push(Tok::Newline),
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    /// Measures leading whitespace; returns true if the line was blank.
    fn handle_indentation(&mut self) -> Result<bool, Fault> {
        let mut width = 0usize;
        let mut offset = 0usize;
        while let Some(c) = self.peek_at(offset) {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' => width = 0,
                _ => break,
            }
            offset += 1;
        }
        match self.peek_at(offset) {
            None | Some('\n') | Some('#') => {
                // Blank or comment-only lines do not affect indentation.
                self.pos += offset;
                return Ok(true);
            }
            Some('\r') if self.peek_at(offset + 1) == Some('\n') => {
                self.pos += offset + 1;
                return Ok(true);
            }
            _ => {}
        }
        self.pos += offset;

        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent);
        } else if width < current {
            while width < *self.indents.last().unwrap_or(&0) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if width != *self.indents.last().unwrap_or(&0) {
                return Err(Fault::syntax(
                    self.line,
                    "unindent does not match any outer indentation level",
                ));
            }
        }
        Ok(false)
    }

    fn number(&mut self) -> Result<(), Fault> {
        let start = self.pos;
        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits_start = self.pos;
                while self.peek().is_some_and(|c| c.is_digit(radix) || c == '_') {
                    self.pos += 1;
                }
                let digits: String = self.chars[digits_start..self.pos]
                    .iter()
                    .filter(|c| **c != '_')
                    .collect();
                let value = i64::from_str_radix(&digits, radix)
                    .map_err(|_| Fault::syntax(self.line, "invalid integer literal"))?;
                self.push(Tok::Int(value));
                return Ok(());
            }
        }

        let mut is_float = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.pos += 1;
        }
        if self.peek() == Some('.') && self.peek_at(1) != Some('.') {
            is_float = true;
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = matches!(self.peek_at(1), Some('+') | Some('-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += digit_at;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        if matches!(self.peek(), Some('j') | Some('J')) {
            return Err(Fault::syntax(self.line, "complex literals are not supported"));
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| Fault::syntax(self.line, format!("invalid float literal '{}'", text)))?;
            self.push(Tok::Float(value));
        } else {
            match text.parse::<i64>() {
                Ok(value) => self.push(Tok::Int(value)),
                Err(_) => {
                    return Err(Fault::syntax(
                        self.line,
                        format!("integer literal '{}' is too large", text),
                    ))
                }
            }
        }
        Ok(())
    }

    fn name_or_prefixed_string(&mut self) -> Result<(), Fault> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        let is_prefix = word.len() <= 2
            && word
                .chars()
                .all(|c| matches!(c.to_ascii_lowercase(), 'r' | 'b' | 'f' | 'u'));
        if is_prefix && matches!(self.peek(), Some('"') | Some('\'')) {
            return self.string(word.to_ascii_lowercase());
        }
        self.push(Tok::Name(word));
        Ok(())
    }

    fn string(&mut self, prefix: String) -> Result<(), Fault> {
        let raw = prefix.contains('r');
        let fstring = prefix.contains('f');
        let quote = self.peek().unwrap_or('"');
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        let start_line = self.line;
        self.pos += if triple { 3 } else { 1 };

        let mut out = String::new();
        loop {
            let c = match self.peek() {
                Some(c) => c,
                None => return Err(Fault::syntax(start_line, "unterminated string literal")),
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(Fault::syntax(start_line, "unterminated string literal"));
                }
                self.line += 1;
            }
            if c == '\\' {
                let next = match self.peek_at(1) {
                    Some(n) => n,
                    None => return Err(Fault::syntax(start_line, "unterminated string literal")),
                };
                if raw || fstring {
                    // f-string escapes are resolved after the expression split.
                    out.push('\\');
                    out.push(next);
                    if next == '\n' {
                        self.line += 1;
                    }
                    self.pos += 2;
                    continue;
                }
                self.pos += 2;
                match next {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' => out.push('\\'),
                    '\'' => out.push('\''),
                    '"' => out.push('"'),
                    '\n' => self.line += 1,
                    'x' => out.push(self.hex_escape(2)?),
                    'u' => out.push(self.hex_escape(4)?),
                    'U' => out.push(self.hex_escape(8)?),
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
                continue;
            }
            out.push(c);
            self.pos += 1;
        }

        let tok = if fstring { Tok::FStr(out) } else { Tok::Str(out) };
        self.tokens.push(Token {
            tok,
            line: start_line,
        });
        Ok(())
    }

    fn hex_escape(&mut self, len: usize) -> Result<char, Fault> {
        let end = (self.pos + len).min(self.chars.len());
        let digits: String = self.chars[self.pos..end].iter().collect();
        self.pos = end;
        u32::from_str_radix(&digits, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| Fault::syntax(self.line, "invalid escape sequence"))
    }

    fn operator(&mut self) -> Result<(), Fault> {
        let rest: String = self.chars[self.pos..(self.pos + 3).min(self.chars.len())]
            .iter()
            .collect();
        for op in OPERATORS {
            if rest.starts_with(op) {
                self.pos += op.chars().count();
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        let c = self.peek().unwrap_or(' ');
        Err(Fault::syntax(
            self.line,
            format!("invalid character '{}'", c),
        ))
    }
}

/// Resolves backslash escapes in an f-string literal segment.
pub fn unescape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {}
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn simple_assignment() {
        assert_eq!(
            toks("x = 1"),
            vec![
                Tok::Name("x".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn blocks_emit_indent_and_dedent() {
        let t = toks("if x:\n    y = 1\nz = 2\n");
        assert!(t.contains(&Tok::Indent));
        assert!(t.contains(&Tok::Dedent));
        let indent = t.iter().position(|t| *t == Tok::Indent).unwrap();
        let dedent = t.iter().position(|t| *t == Tok::Dedent).unwrap();
        assert!(indent < dedent);
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let t = toks("x = [1,\n  2]\n");
        assert_eq!(t.iter().filter(|t| **t == Tok::Newline).count(), 1);
        assert!(!t.contains(&Tok::Indent));
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(toks("'a\\nb'")[0], Tok::Str("a\nb".into()));
        assert_eq!(toks("r'a\\nb'")[0], Tok::Str("a\\nb".into()));
        assert_eq!(toks("\"\"\"x\ny\"\"\"")[0], Tok::Str("x\ny".into()));
        assert_eq!(toks("f'{x}!'")[0], Tok::FStr("{x}!".into()));
    }

    #[test]
    fn numbers() {
        assert_eq!(toks("0x1f")[0], Tok::Int(31));
        assert_eq!(toks("1_000")[0], Tok::Int(1000));
        assert_eq!(toks("2.5")[0], Tok::Float(2.5));
        assert_eq!(toks("1e3")[0], Tok::Float(1000.0));
        assert_eq!(toks(".5")[0], Tok::Float(0.5));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let t = toks("# header\n\nx = 1  # trailing\n\n   \n");
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn bad_dedent_is_a_syntax_error() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert_eq!(err.kind, super::super::fault::FaultKind::SyntaxError);
    }

    #[test]
    fn unterminated_string_is_reported() {
        assert!(tokenize("x = 'abc").is_err());
    }
}
