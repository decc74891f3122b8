//! ir/lexer.rs — Tokens de l’IR texte (positions ligne/colonne 1-based).
//!
//! `tensor<...>` est lu d’un bloc (`Tok::Tensor`) : la forme `4x?xf32`
//! mélange chiffres et identifiants et se découpe mieux côté parser.

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    /// `@nom`
    Symbol(String),
    /// `%nom`
    Value(String),
    Str(String),
    Int(i64),
    Float(f64),
    /// Contenu brut entre `tensor<` et `>`.
    Tensor(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Less,
    Greater,
    Comma,
    Colon,
    Equal,
    Arrow,
    Eof,
}

impl Tok {
    pub fn describe(&self) -> String {
        match self {
            Self::Ident(s) => format!("'{s}'"),
            Self::Symbol(s) => format!("'@{s}'"),
            Self::Value(s) => format!("'%{s}'"),
            Self::Str(s) => format!("string {s:?}"),
            Self::Int(i) => format!("integer {i}"),
            Self::Float(x) => format!("float {x:?}"),
            Self::Tensor(s) => format!("'tensor<{s}>'"),
            Self::LParen => "'('".into(),
            Self::RParen => "')'".into(),
            Self::LBrace => "'{'".into(),
            Self::RBrace => "'}'".into(),
            Self::LBracket => "'['".into(),
            Self::RBracket => "']'".into(),
            Self::Less => "'<'".into(),
            Self::Greater => "'>'".into(),
            Self::Comma => "','".into(),
            Self::Colon => "':'".into(),
            Self::Equal => "'='".into(),
            Self::Arrow => "'->'".into(),
            Self::Eof => "end of input".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: Tok,
    pub line: u32,
    pub col: u32,
}

/// Erreur lexicale : (ligne, colonne, message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub line: u32,
    pub col: u32,
    pub message: String,
}

pub struct Lexer<'a> {
    it: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { it: src.chars().peekable(), line: 1, col: 1 }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut out = Vec::new();
        loop {
            let tok = self.next_token()?;
            let eof = tok.kind == Tok::Eof;
            out.push(tok);
            if eof {
                return Ok(out);
            }
        }
    }

    fn err(&self, line: u32, col: u32, message: impl Into<String>) -> LexError {
        LexError { line, col, message: message.into() }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_ws_and_comments();
        let (line, col) = (self.line, self.col);
        let Some(c) = self.bump() else {
            return Ok(Token { kind: Tok::Eof, line, col });
        };
        let kind = match c {
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '{' => Tok::LBrace,
            '}' => Tok::RBrace,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '<' => Tok::Less,
            '>' => Tok::Greater,
            ',' => Tok::Comma,
            ':' => Tok::Colon,
            '=' => Tok::Equal,
            '-' if self.it.peek() == Some(&'>') => {
                self.bump();
                Tok::Arrow
            }
            '"' => Tok::Str(self.read_string(line, col)?),
            '@' | '%' => {
                let name = self.read_while(is_ident_continue);
                if name.is_empty() {
                    return Err(self.err(line, col, format!("expected a name after '{c}'")));
                }
                if c == '@' { Tok::Symbol(name) } else { Tok::Value(name) }
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => self.read_number(c, line, col)?,
            c if is_ident_start(c) => {
                let mut ident = String::from(c);
                ident.push_str(&self.read_while(is_ident_continue));
                if ident == "tensor" && self.it.peek() == Some(&'<') {
                    self.bump();
                    let body = self.read_while(|c| c != '>' && c != '\n');
                    if self.bump() != Some('>') {
                        return Err(self.err(line, col, "unterminated tensor type"));
                    }
                    Tok::Tensor(body.trim().to_string())
                } else {
                    Tok::Ident(ident)
                }
            }
            other => return Err(self.err(line, col, format!("unexpected character {other:?}"))),
        };
        Ok(Token { kind, line, col })
    }

    fn skip_ws_and_comments(&mut self) {
        loop {
            match self.it.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    let mut ahead = self.it.clone();
                    ahead.next();
                    if ahead.next() != Some('/') {
                        return;
                    }
                    while let Some(&c) = self.it.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn read_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut s = String::new();
        while let Some(&c) = self.it.peek() {
            if !pred(c) {
                break;
            }
            s.push(c);
            self.bump();
        }
        s
    }

    fn read_string(&mut self, line: u32, col: u32) -> Result<String, LexError> {
        let mut s = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(s),
                Some('\\') => match self.bump() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('"') => s.push('"'),
                    Some('\\') => s.push('\\'),
                    Some(c) => return Err(self.err(line, col, format!("unknown escape '\\{c}'"))),
                    None => return Err(self.err(line, col, "unterminated string")),
                },
                Some('\n') | None => return Err(self.err(line, col, "unterminated string")),
                Some(c) => s.push(c),
            }
        }
    }

    fn read_number(&mut self, first: char, line: u32, col: u32) -> Result<Tok, LexError> {
        let mut buf = String::from(first);
        let mut is_float = false;
        while let Some(&c) = self.it.peek() {
            let exponent_sign = (c == '-' || c == '+') && (buf.ends_with('e') || buf.ends_with('E'));
            if c.is_ascii_digit() || exponent_sign {
                buf.push(c);
            } else if c == '.' || c == 'e' || c == 'E' {
                is_float = true;
                buf.push(c);
            } else {
                break;
            }
            self.bump();
        }
        let parsed = if is_float {
            buf.parse::<f64>().ok().map(Tok::Float)
        } else {
            buf.parse::<i64>().ok().map(Tok::Int)
        };
        parsed.ok_or_else(|| self.err(line, col, format!("invalid number literal '{buf}'")))
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.it.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Tok> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn op_line() {
        assert_eq!(
            kinds("%0 = mul %a, %b : tensor<4xf32> // product\n"),
            vec![
                Tok::Value("0".into()),
                Tok::Equal,
                Tok::Ident("mul".into()),
                Tok::Value("a".into()),
                Tok::Comma,
                Tok::Value("b".into()),
                Tok::Colon,
                Tok::Tensor("4xf32".into()),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn numbers_and_arrows() {
        assert_eq!(
            kinds("-> -3 2.5 1e-3 -0.5"),
            vec![Tok::Arrow, Tok::Int(-3), Tok::Float(2.5), Tok::Float(1e-3), Tok::Float(-0.5), Tok::Eof]
        );
    }

    #[test]
    fn positions_and_errors() {
        let toks = Lexer::new("func\n  @f").tokenize().unwrap();
        assert_eq!((toks[1].line, toks[1].col), (2, 3));
        let err = Lexer::new("\n  #").tokenize().unwrap_err();
        assert_eq!((err.line, err.col), (2, 3));
        assert!(Lexer::new("\"open").tokenize().is_err());
    }
}
