//! ir/parser.rs — Descente récursive sur les tokens de l’IR texte.
//!
//! S’arrête à la première erreur, rendue comme diagnostic localisé dans la
//! source (`<asm>:L:C` par défaut). La vérification sémantique est faite
//! ensuite par `verify`.

use tessel_bytecode::{BinaryOp, ScalarKind, UnaryOp};

use super::lexer::{Lexer, Tok, Token};
use super::{Attribute, Constant, Function, Location, Module, Number, OpKind, Operation, Type};
use crate::diagnostics::Diagnostic;

pub const DEFAULT_SOURCE_NAME: &str = "<asm>";

type PResult<T> = Result<T, Diagnostic>;

/// Analyse un module complet (ou une suite de `func`, enveloppée dans un module anonyme).
pub fn parse_module(src: &str, source_name: &str) -> PResult<Module> {
    let tokens = Lexer::new(src).tokenize().map_err(|e| {
        Diagnostic::error(Location::file(source_name, e.line, e.col), e.message)
    })?;
    Parser { tokens, pos: 0, source: source_name.to_string() }.parse_top()
}

pub fn scalar_kind_from_name(name: &str) -> Option<ScalarKind> {
    match name {
        "i32" => Some(ScalarKind::I32),
        "i64" => Some(ScalarKind::I64),
        "f32" => Some(ScalarKind::F32),
        "f64" => Some(ScalarKind::F64),
        _ => None,
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    source: String,
}

impl Parser {
    /* ───── Navigation ───── */

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if tok.kind != Tok::Eof {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, tok: &Token) -> Location {
        Location::file(self.source.clone(), tok.line, tok.col)
    }

    fn error_at<T>(&self, tok: &Token, message: impl Into<String>) -> PResult<T> {
        Err(Diagnostic::error(self.at(tok), message))
    }

    fn is(&self, kind: &Tok) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(&self.peek().kind, Tok::Ident(s) if s == word)
    }

    fn eat(&mut self, kind: &Tok) -> bool {
        if self.is(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &Tok) -> PResult<Token> {
        if self.is(kind) {
            return Ok(self.advance());
        }
        let tok = self.peek().clone();
        self.error_at(&tok, format!("expected {}, found {}", kind.describe(), tok.kind.describe()))
    }

    fn expect_keyword(&mut self, word: &str) -> PResult<Token> {
        if self.is_keyword(word) {
            return Ok(self.advance());
        }
        let tok = self.peek().clone();
        self.error_at(&tok, format!("expected '{word}', found {}", tok.kind.describe()))
    }

    fn expect_value(&mut self) -> PResult<String> {
        let tok = self.advance();
        match &tok.kind {
            Tok::Value(name) => Ok(name.clone()),
            other => self.error_at(&tok, format!("expected an SSA value, found {}", other.describe())),
        }
    }

    fn expect_u32(&mut self) -> PResult<u32> {
        let tok = self.advance();
        match &tok.kind {
            Tok::Int(i) => u32::try_from(*i).or_else(|_| self.error_at(&tok, format!("{i} is out of range"))),
            other => self.error_at(&tok, format!("expected an integer, found {}", other.describe())),
        }
    }

    /* ───── Module ───── */

    fn parse_top(mut self) -> PResult<Module> {
        let first = self.peek().clone();
        let module = match &first.kind {
            Tok::Ident(kw) if kw == "module" => {
                let m = self.parse_module_decl()?;
                let tail = self.peek().clone();
                if tail.kind != Tok::Eof {
                    return self.error_at(&tail, format!("expected end of input, found {}", tail.kind.describe()));
                }
                m
            }
            Tok::Ident(kw) if kw == "func" => {
                let mut m = Module::default();
                while self.is_keyword("func") {
                    m.functions.push(self.parse_func()?);
                }
                let tail = self.peek().clone();
                match &tail.kind {
                    Tok::Eof => m,
                    Tok::Ident(other) => return self.error_at(&tail, format!("custom op '{other}' is unknown")),
                    other => return self.error_at(&tail, format!("expected 'func', found {}", other.describe())),
                }
            }
            Tok::Eof => Module::default(),
            Tok::Ident(other) => return self.error_at(&first, format!("custom op '{other}' is unknown")),
            other => return self.error_at(&first, format!("expected 'module' or 'func', found {}", other.describe())),
        };
        Ok(module)
    }

    fn parse_module_decl(&mut self) -> PResult<Module> {
        self.expect_keyword("module")?;
        let mut module = Module::default();
        if let Tok::Symbol(name) = &self.peek().kind {
            module.name = Some(name.clone());
            self.advance();
        }
        if self.is_keyword("attributes") {
            self.advance();
            module.attrs = self.parse_attr_dict()?;
        }
        self.expect(&Tok::LBrace)?;
        loop {
            let tok = self.peek().clone();
            match &tok.kind {
                Tok::RBrace => break,
                Tok::Ident(kw) if kw == "func" => module.functions.push(self.parse_func()?),
                Tok::Ident(other) => return self.error_at(&tok, format!("custom op '{other}' is unknown")),
                other => return self.error_at(&tok, format!("expected 'func' or '}}', found {}", other.describe())),
            }
        }
        self.expect(&Tok::RBrace)?;
        Ok(module)
    }

    fn parse_attr_dict(&mut self) -> PResult<Vec<Attribute>> {
        self.expect(&Tok::LBrace)?;
        let mut attrs = Vec::new();
        if self.eat(&Tok::RBrace) {
            return Ok(attrs);
        }
        loop {
            let tok = self.advance();
            let key = match &tok.kind {
                Tok::Ident(k) => k.clone(),
                other => return self.error_at(&tok, format!("expected an attribute name, found {}", other.describe())),
            };
            let value = if self.eat(&Tok::Equal) {
                let tok = self.advance();
                match &tok.kind {
                    Tok::Str(s) => Some(s.clone()),
                    other => return self.error_at(&tok, format!("expected a string attribute value, found {}", other.describe())),
                }
            } else {
                None
            };
            attrs.push((key, value));
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RBrace)?;
        Ok(attrs)
    }

    /* ───── Types ───── */

    fn parse_type(&mut self) -> PResult<Type> {
        let tok = self.advance();
        match &tok.kind {
            Tok::Ident(name) => match scalar_kind_from_name(name) {
                Some(k) => Ok(Type::Scalar(k)),
                None => self.error_at(&tok, format!("unknown type '{name}'")),
            },
            Tok::Tensor(body) => self.parse_tensor_body(body, &tok),
            other => self.error_at(&tok, format!("expected a type, found {}", other.describe())),
        }
    }

    fn parse_tensor_body(&self, body: &str, tok: &Token) -> PResult<Type> {
        let mut parts: Vec<&str> = body.split('x').map(str::trim).collect();
        let element_name = parts.pop().unwrap_or_default();
        let Some(element) = scalar_kind_from_name(element_name) else {
            return self.error_at(tok, format!("unsupported tensor element type '{element_name}'"));
        };
        let mut dims = Vec::with_capacity(parts.len());
        for part in parts {
            if part == "?" {
                dims.push(None);
            } else if let Ok(n) = part.parse::<u32>() {
                dims.push(Some(n));
            } else {
                return self.error_at(tok, format!("invalid tensor dimension '{part}'"));
            }
        }
        Ok(Type::Tensor { dims, element })
    }

    fn parse_type_list(&mut self) -> PResult<Vec<Type>> {
        let mut types = vec![self.parse_type()?];
        while self.eat(&Tok::Comma) {
            types.push(self.parse_type()?);
        }
        Ok(types)
    }

    /* ───── Fonctions ───── */

    fn parse_func(&mut self) -> PResult<Function> {
        let func_tok = self.expect_keyword("func")?;
        let name_tok = self.advance();
        let Tok::Symbol(name) = name_tok.kind.clone() else {
            return self.error_at(&name_tok, format!("expected a function name, found {}", name_tok.kind.describe()));
        };

        self.expect(&Tok::LParen)?;
        let mut params = Vec::new();
        if !self.is(&Tok::RParen) {
            loop {
                let value = self.expect_value()?;
                self.expect(&Tok::Colon)?;
                params.push((value, self.parse_type()?));
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(&Tok::RParen)?;

        let mut results = Vec::new();
        if self.eat(&Tok::Arrow) {
            if self.eat(&Tok::LParen) {
                if !self.is(&Tok::RParen) {
                    results = self.parse_type_list()?;
                }
                self.expect(&Tok::RParen)?;
            } else {
                results.push(self.parse_type()?);
            }
        }

        let mut attrs = Vec::new();
        if self.is_keyword("attributes") {
            self.advance();
            attrs = self.parse_attr_dict()?;
        }

        self.expect(&Tok::LBrace)?;
        let mut body = Vec::new();
        while !self.is(&Tok::RBrace) {
            if self.is(&Tok::Eof) {
                let tok = self.peek().clone();
                return self.error_at(&tok, format!("unterminated body of function @{name}"));
            }
            body.push(self.parse_op(&results)?);
        }
        self.expect(&Tok::RBrace)?;

        let loc = if self.is_keyword("loc") { self.parse_loc()? } else { self.at(&func_tok) };
        Ok(Function { name, params, results, attrs, body, loc })
    }

    /* ───── Ops ───── */

    fn parse_op(&mut self, declared_results: &[Type]) -> PResult<Operation> {
        let start = self.peek().clone();
        let mut results = Vec::new();
        if self.is(&Tok::Value(String::new())) {
            loop {
                results.push(self.expect_value()?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(&Tok::Equal)?;
        }

        let op_tok = self.advance();
        let Tok::Ident(mnemonic) = op_tok.kind.clone() else {
            return self.error_at(&op_tok, format!("expected an operation, found {}", op_tok.kind.describe()));
        };

        let (kind, types) = match mnemonic.as_str() {
            "constant" => {
                let constant = self.parse_constant()?;
                self.expect(&Tok::Colon)?;
                (OpKind::Constant(constant), vec![self.parse_type()?])
            }
            "neg" | "abs" => {
                let op = UnaryOp::from_mnemonic(&mnemonic).unwrap_or(UnaryOp::Neg);
                let operand = self.expect_value()?;
                self.expect(&Tok::Colon)?;
                (OpKind::Unary { op, operand }, vec![self.parse_type()?])
            }
            "call" => {
                let callee_tok = self.advance();
                let Tok::Symbol(callee) = callee_tok.kind.clone() else {
                    return self.error_at(&callee_tok, format!("expected a callee, found {}", callee_tok.kind.describe()));
                };
                let args = self.parse_value_list()?;
                let types = if self.eat(&Tok::Colon) { self.parse_type_list()? } else { Vec::new() };
                (OpKind::Call { callee, args }, types)
            }
            "trace" => {
                let tag_tok = self.advance();
                let Tok::Str(tag) = tag_tok.kind.clone() else {
                    return self.error_at(&tag_tok, format!("expected a trace tag, found {}", tag_tok.kind.describe()));
                };
                (OpKind::Trace { tag, args: self.parse_value_list()? }, Vec::new())
            }
            "return" => {
                let mut values = Vec::new();
                if self.is(&Tok::Value(String::new())) {
                    loop {
                        values.push(self.expect_value()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                let types = if self.eat(&Tok::Colon) {
                    self.parse_type_list()?
                } else if values.len() == declared_results.len() {
                    declared_results.to_vec()
                } else {
                    Vec::new()
                };
                (OpKind::Return { values }, types)
            }
            other => match BinaryOp::from_mnemonic(other) {
                Some(op) => {
                    let lhs = self.expect_value()?;
                    self.expect(&Tok::Comma)?;
                    let rhs = self.expect_value()?;
                    self.expect(&Tok::Colon)?;
                    (OpKind::Binary { op, lhs, rhs }, vec![self.parse_type()?])
                }
                None => return self.error_at(&op_tok, format!("custom op '{other}' is unknown")),
            },
        };

        let expected_results = match &kind {
            OpKind::Constant(_) | OpKind::Binary { .. } | OpKind::Unary { .. } => Some(1),
            OpKind::Trace { .. } | OpKind::Return { .. } => Some(0),
            OpKind::Call { .. } => None,
        };
        if let Some(n) = expected_results {
            if results.len() != n {
                return self.error_at(
                    &start,
                    format!("'{mnemonic}' op defines {n} result(s), but {} name(s) were given", results.len()),
                );
            }
        }

        let loc = if self.is_keyword("loc") { self.parse_loc()? } else { self.at(&start) };
        Ok(Operation { results, kind, types, loc })
    }

    fn parse_value_list(&mut self) -> PResult<Vec<String>> {
        self.expect(&Tok::LParen)?;
        let mut values = Vec::new();
        if !self.is(&Tok::RParen) {
            loop {
                values.push(self.expect_value()?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(&Tok::RParen)?;
        Ok(values)
    }

    fn parse_number(&mut self) -> PResult<Number> {
        let tok = self.advance();
        match &tok.kind {
            Tok::Int(i) => Ok(Number::Int(*i)),
            Tok::Float(x) => Ok(Number::Float(*x)),
            other => self.error_at(&tok, format!("expected a numeric literal, found {}", other.describe())),
        }
    }

    fn parse_constant(&mut self) -> PResult<Constant> {
        if !self.is_keyword("dense") {
            return self.parse_number().map(Constant::Scalar);
        }
        self.advance();
        self.expect(&Tok::Less)?;
        if let Tok::Str(_) = &self.peek().kind {
            let tok = self.peek().clone();
            return self.error_at(&tok, "elided dense constants cannot be parsed back");
        }
        self.expect(&Tok::LBracket)?;
        let mut values = Vec::new();
        if !self.is(&Tok::RBracket) {
            loop {
                values.push(self.parse_number()?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(&Tok::RBracket)?;
        self.expect(&Tok::Greater)?;
        Ok(Constant::Dense(values))
    }

    /* ───── Locations ───── */

    fn parse_loc(&mut self) -> PResult<Location> {
        self.expect_keyword("loc")?;
        self.expect(&Tok::LParen)?;
        let loc = self.parse_location()?;
        self.expect(&Tok::RParen)?;
        Ok(loc)
    }

    fn parse_location(&mut self) -> PResult<Location> {
        let tok = self.advance();
        match &tok.kind {
            Tok::Ident(kw) if kw == "unknown" => Ok(Location::Unknown),
            Tok::Ident(kw) if kw == "callsite" => {
                self.expect(&Tok::LParen)?;
                let callee = self.parse_location()?;
                self.expect_keyword("at")?;
                let caller = self.parse_location()?;
                self.expect(&Tok::RParen)?;
                Ok(Location::call_site(callee, caller))
            }
            Tok::Ident(kw) if kw == "opaque" => {
                self.expect(&Tok::LParen)?;
                let fallback = self.parse_location()?;
                self.expect(&Tok::RParen)?;
                Ok(Location::opaque(fallback))
            }
            Tok::Str(s) => {
                let s = s.clone();
                if self.eat(&Tok::Colon) {
                    let line = self.expect_u32()?;
                    self.expect(&Tok::Colon)?;
                    let col = self.expect_u32()?;
                    Ok(Location::file(s, line, col))
                } else if self.eat(&Tok::LParen) {
                    let child = self.parse_location()?;
                    self.expect(&Tok::RParen)?;
                    Ok(Location::name(s, child))
                } else {
                    Ok(Location::name(s, Location::Unknown))
                }
            }
            other => self.error_at(&tok, format!("expected a location, found {}", other.describe())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn parses_a_module() {
        let src = indoc! {r#"
            module @arithmetic {
              func @simple_mul(%a: tensor<4xf32>, %b: tensor<4xf32>) -> tensor<4xf32> attributes {export} {
                %0 = mul %a, %b : tensor<4xf32> loc("model.tsl":3:5)
                return %0 : tensor<4xf32>
              }
            }
        "#};
        let m = parse_module(src, "<asm>").unwrap();
        assert_eq!(m.name.as_deref(), Some("arithmetic"));
        let f = &m.functions[0];
        assert!(f.is_exported());
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.body[0].loc, Location::file("model.tsl", 3, 5));
        assert_eq!(f.body[1].loc, Location::file("<asm>", 4, 5));
        assert_eq!(f.loc, Location::file("<asm>", 2, 3));
    }

    #[test]
    fn bare_functions_and_return_type_inference() {
        let src = "func @id(%x: i32) -> i32 { return %x }";
        let m = parse_module(src, "<asm>").unwrap();
        assert!(m.name.is_none());
        assert_eq!(m.functions[0].body[0].types, vec![Type::Scalar(ScalarKind::I32)]);
    }

    #[test]
    fn unknown_ops_are_reported() {
        let err = parse_module("module {\n  func @f() {\n    %0 = frobnicate : i32\n  }\n}", "<asm>").unwrap_err();
        assert_eq!(err.message, "custom op 'frobnicate' is unknown");
        assert_eq!(err.location, Location::file("<asm>", 3, 10));

        let err = parse_module("bogus", "input.tsl").unwrap_err();
        assert_eq!(err.message, "custom op 'bogus' is unknown");
        assert_eq!(err.location, Location::file("input.tsl", 1, 1));
    }

    #[test]
    fn nested_locations() {
        let src = r#"func @f() { trace "t"() loc(callsite("a"("x.tsl":1:2) at opaque(unknown))) return }"#;
        let m = parse_module(src, "<asm>").unwrap();
        assert_eq!(
            m.functions[0].body[0].loc,
            Location::call_site(
                Location::name("a", Location::file("x.tsl", 1, 2)),
                Location::opaque(Location::Unknown)
            )
        );
    }
}
