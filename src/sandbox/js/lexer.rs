//! Tokenizer for the script subset.

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Num(f64),
    Str(String),
    /// Raw template literal: literal chunks and `${...}` source snippets.
    Template(Vec<TemplateChunk>),
    Regex { pattern: String, flags: String },
    Ident(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateChunk {
    Text(String),
    Expr(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    /// A line terminator precedes this token (drives automatic semicolons).
    pub newline_before: bool,
}

const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==", "!=",
    "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=",
    "**", "<<", ">>", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-", "*", "/", "%",
    "&", "|", "^", "!", "~", "?", ":", "=", ".",
];

const KEYWORDS_BEFORE_EXPR: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

pub fn tokenize(src: &str) -> Result<Vec<Token>, ScriptError> {
    let mut lx = Lexer { chars: src.chars().collect(), pos: 0, out: Vec::new() };
    lx.run()?;
    Ok(lx.out)
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    out: Vec<Token>,
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<char> {
        self.chars.get(self.pos + off).copied()
    }

    fn unexpected(&self) -> ScriptError {
        ScriptError::Syntax("Invalid or unexpected token".into())
    }

    fn run(&mut self) -> Result<(), ScriptError> {
        let mut newline = false;
        loop {
            // Whitespace and comments.
            match self.peek() {
                None => break,
                Some('\n') | Some('\r') | Some('\u{2028}') | Some('\u{2029}') => {
                    newline = true;
                    self.pos += 1;
                    continue;
                }
                Some(c) if c.is_whitespace() || c == '\u{feff}' => {
                    self.pos += 1;
                    continue;
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                    continue;
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.pos += 2;
                    loop {
                        match self.peek() {
                            None => return Err(self.unexpected()),
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(c) => {
                                if c == '\n' {
                                    newline = true;
                                }
                                self.pos += 1;
                            }
                        }
                    }
                    continue;
                }
                _ => {}
            }

            let tok = self.token()?;
            self.out.push(Token { tok, newline_before: newline });
            newline = false;
        }
        self.out.push(Token { tok: Tok::Eof, newline_before: true });
        Ok(())
    }

    fn token(&mut self) -> Result<Tok, ScriptError> {
        let c = self.peek().ok_or_else(|| self.unexpected())?;
        if c.is_ascii_digit() || (c == '.' && self.peek_at(1).map(|d| d.is_ascii_digit()).unwrap_or(false)) {
            return self.number();
        }
        if c == '"' || c == '\'' {
            return self.string(c);
        }
        if c == '`' {
            return self.template();
        }
        // Private class names lex as identifiers carrying their `#`.
        let private = c == '#' && self.peek_at(1).map(is_ident_start).unwrap_or(false);
        if is_ident_start(c) || private {
            let start = self.pos;
            if private {
                self.pos += 1;
            }
            while self.peek().map(is_ident_part).unwrap_or(false) {
                self.pos += 1;
            }
            return Ok(Tok::Ident(self.chars[start..self.pos].iter().collect()));
        }
        if c == '/' && self.regex_allowed() {
            return self.regex();
        }
        for p in PUNCTUATORS {
            let len = p.chars().count();
            if self.pos + len <= self.chars.len() && self.chars[self.pos..self.pos + len].iter().copied().eq(p.chars()) {
                // `a?.5:1` is a conditional, not optional chaining.
                if *p == "?." && self.peek_at(2).map(|d| d.is_ascii_digit()).unwrap_or(false) {
                    continue;
                }
                self.pos += len;
                return Ok(Tok::Punct(p));
            }
        }
        Err(self.unexpected())
    }

    fn regex_allowed(&self) -> bool {
        match self.out.last().map(|t| &t.tok) {
            None => true,
            Some(Tok::Num(_)) | Some(Tok::Str(_)) | Some(Tok::Template(_)) | Some(Tok::Regex { .. }) => false,
            Some(Tok::Ident(name)) => KEYWORDS_BEFORE_EXPR.contains(&name.as_str()),
            Some(Tok::Punct(p)) => !matches!(*p, ")" | "]" | "}" | "++" | "--"),
            Some(Tok::Eof) => false,
        }
    }

    fn number(&mut self) -> Result<Tok, ScriptError> {
        let start = self.pos;
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X' | 'b' | 'B' | 'o' | 'O')) {
            let radix = match self.peek_at(1) {
                Some('x' | 'X') => 16,
                Some('b' | 'B') => 2,
                _ => 8,
            };
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().map(|d| d.is_digit(radix) || d == '_').unwrap_or(false) {
                self.pos += 1;
            }
            let digits: String = self.chars[digits_start..self.pos].iter().filter(|c| **c != '_').collect();
            let v = u64::from_str_radix(&digits, radix).map_err(|_| self.unexpected())?;
            return Ok(Tok::Num(v as f64));
        }
        while self.peek().map(|d| d.is_ascii_digit() || d == '_').unwrap_or(false) {
            self.pos += 1;
        }
        if self.peek() == Some('.') {
            self.pos += 1;
            while self.peek().map(|d| d.is_ascii_digit() || d == '_').unwrap_or(false) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let save = self.pos;
            self.pos += 1;
            if matches!(self.peek(), Some('+' | '-')) {
                self.pos += 1;
            }
            if self.peek().map(|d| d.is_ascii_digit()).unwrap_or(false) {
                while self.peek().map(|d| d.is_ascii_digit()).unwrap_or(false) {
                    self.pos += 1;
                }
            } else {
                self.pos = save;
            }
        }
        if self.peek() == Some('n') {
            // BigInt suffix; treated as a plain number.
            let text: String = self.chars[start..self.pos].iter().filter(|c| **c != '_').collect();
            self.pos += 1;
            return text.parse::<f64>().map(Tok::Num).map_err(|_| self.unexpected());
        }
        if self.peek().map(is_ident_start).unwrap_or(false) {
            return Err(self.unexpected());
        }
        let text: String = self.chars[start..self.pos].iter().filter(|c| **c != '_').collect();
        text.parse::<f64>().map(Tok::Num).map_err(|_| self.unexpected())
    }

    fn escape(&mut self) -> Result<Option<char>, ScriptError> {
        let c = self.peek().ok_or_else(|| self.unexpected())?;
        self.pos += 1;
        Ok(Some(match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'v' => '\u{b}',
            '0' if !self.peek().map(|d| d.is_ascii_digit()).unwrap_or(false) => '\0',
            'x' => {
                let hex: String = self.chars.get(self.pos..self.pos + 2).ok_or_else(|| self.unexpected())?.iter().collect();
                self.pos += 2;
                let v = u32::from_str_radix(&hex, 16).map_err(|_| self.unexpected())?;
                char::from_u32(v).ok_or_else(|| self.unexpected())?
            }
            'u' => {
                let hex: String = if self.peek() == Some('{') {
                    self.pos += 1;
                    let start = self.pos;
                    while self.peek().map(|d| d != '}').unwrap_or(false) {
                        self.pos += 1;
                    }
                    let s = self.chars[start..self.pos].iter().collect();
                    self.pos += 1;
                    s
                } else {
                    let s = self.chars.get(self.pos..self.pos + 4).ok_or_else(|| self.unexpected())?.iter().collect();
                    self.pos += 4;
                    s
                };
                let v = u32::from_str_radix(&hex, 16).map_err(|_| self.unexpected())?;
                char::from_u32(v).unwrap_or('\u{fffd}')
            }
            '\r' => {
                if self.peek() == Some('\n') {
                    self.pos += 1;
                }
                return Ok(None);
            }
            '\n' | '\u{2028}' | '\u{2029}' => return Ok(None),
            other => other,
        }))
    }

    fn string(&mut self, quote: char) -> Result<Tok, ScriptError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => return Err(self.unexpected()),
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(Tok::Str(out));
                }
                Some('\\') => {
                    self.pos += 1;
                    if let Some(ch) = self.escape()? {
                        out.push(ch);
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn template(&mut self) -> Result<Tok, ScriptError> {
        self.pos += 1;
        let mut chunks = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.unexpected()),
                Some('`') => {
                    self.pos += 1;
                    chunks.push(TemplateChunk::Text(text));
                    return Ok(Tok::Template(chunks));
                }
                Some('\\') => {
                    self.pos += 1;
                    if let Some(ch) = self.escape()? {
                        text.push(ch);
                    }
                }
                Some('$') if self.peek_at(1) == Some('{') => {
                    self.pos += 2;
                    chunks.push(TemplateChunk::Text(std::mem::take(&mut text)));
                    let start = self.pos;
                    let mut depth = 1usize;
                    let mut quote: Option<char> = None;
                    while depth > 0 {
                        let c = self.peek().ok_or_else(|| self.unexpected())?;
                        self.pos += 1;
                        match quote {
                            Some(q) if c == q => quote = None,
                            Some(_) if c == '\\' => self.pos += 1,
                            Some(_) => {}
                            None => match c {
                                '"' | '\'' | '`' => quote = Some(c),
                                '{' => depth += 1,
                                '}' => depth -= 1,
                                _ => {}
                            },
                        }
                    }
                    chunks.push(TemplateChunk::Expr(self.chars[start..self.pos - 1].iter().collect()));
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn regex(&mut self) -> Result<Tok, ScriptError> {
        self.pos += 1;
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            let c = self.peek().ok_or_else(|| self.unexpected())?;
            self.pos += 1;
            match c {
                '\n' => return Err(self.unexpected()),
                '\\' => {
                    pattern.push(c);
                    pattern.push(self.peek().ok_or_else(|| self.unexpected())?);
                    self.pos += 1;
                }
                '[' => {
                    in_class = true;
                    pattern.push(c);
                }
                ']' => {
                    in_class = false;
                    pattern.push(c);
                }
                '/' if !in_class => break,
                _ => pattern.push(c),
            }
        }
        let start = self.pos;
        while self.peek().map(|c| c.is_ascii_alphabetic()).unwrap_or(false) {
            self.pos += 1;
        }
        let flags = self.chars[start..self.pos].iter().collect();
        Ok(Tok::Regex { pattern, flags })
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn punctuators_prefer_longest_match() {
        assert_eq!(
            toks("a !== b"),
            vec![Tok::Ident("a".into()), Tok::Punct("!=="), Tok::Ident("b".into()), Tok::Eof]
        );
        assert_eq!(toks("x?.y")[1], Tok::Punct("?."));
        assert_eq!(toks("x?.5:1")[1], Tok::Punct("?"));
    }

    #[test]
    fn strings_numbers_and_templates() {
        assert_eq!(toks(r#"'a\'b'"#)[0], Tok::Str("a'b".into()));
        assert_eq!(toks("0x1F")[0], Tok::Num(31.0));
        assert_eq!(toks(".5e1")[0], Tok::Num(5.0));
        assert_eq!(
            toks("`n=${a + {b:1}.b}!`")[0],
            Tok::Template(vec![
                TemplateChunk::Text("n=".into()),
                TemplateChunk::Expr("a + {b:1}.b".into()),
                TemplateChunk::Text("!".into()),
            ])
        );
    }

    #[test]
    fn slash_is_regex_or_division_by_context() {
        assert_eq!(toks("a / b")[1], Tok::Punct("/"));
        assert_eq!(toks("x = /ab+c/gi")[2], Tok::Regex { pattern: "ab+c".into(), flags: "gi".into() });
    }

    #[test]
    fn newlines_are_tracked() {
        let t = tokenize("a\nb").unwrap();
        assert!(!t[0].newline_before);
        assert!(t[1].newline_before);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(tokenize("'abc").is_err());
    }
}
