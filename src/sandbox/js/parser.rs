//! Recursive-descent parser producing [`ast`](super::ast) nodes.
//!
//! Expressions use precedence climbing; statements follow the usual grammar
//! with a permissive automatic-semicolon rule (newline, `}` or end of input).

use std::sync::Arc;

use super::ast::*;
use super::lexer::{tokenize, TemplateChunk, Tok, Token};
use super::ScriptError;

const MAX_DEPTH: usize = 256;

const RESERVED: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do",
    "else", "export", "extends", "finally", "for", "function", "if", "import", "in", "instanceof",
    "new", "return", "super", "switch", "this", "throw", "try", "typeof", "var", "void", "while",
    "with", "true", "false", "null",
];

/// Parse a whole script.
pub fn parse_program(src: &str) -> Result<Vec<Stmt>, ScriptError> {
    let mut p = Parser::new(tokenize(src)?);
    let mut out = Vec::new();
    while !p.at_eof() {
        out.push(p.statement()?);
    }
    Ok(out)
}

/// Parse a single expression; trailing tokens are an error.
pub fn parse_expression(src: &str) -> Result<Expr, ScriptError> {
    let mut p = Parser::new(tokenize(src)?);
    let e = p.expression()?;
    p.eat_punct(";");
    if !p.at_eof() {
        return Err(p.unexpected());
    }
    Ok(e)
}

struct Parser {
    toks: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(toks: Vec<Token>) -> Self {
        Self { toks, pos: 0, depth: 0 }
    }

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, off: usize) -> &Tok {
        self.toks.get(self.pos + off).map(|t| &t.tok).unwrap_or(&Tok::Eof)
    }

    fn newline_before(&self) -> bool {
        self.toks.get(self.pos).map(|t| t.newline_before).unwrap_or(true)
    }

    fn advance(&mut self) -> Tok {
        let t = self.peek().clone();
        if self.pos < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Tok::Eof)
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Tok::Punct(q) if *q == p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), ScriptError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Ident(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self) -> ScriptError {
        let msg = match self.peek() {
            Tok::Eof => "Unexpected end of input".to_string(),
            Tok::Punct(p) => format!("Unexpected token '{p}'"),
            Tok::Ident(n) if RESERVED.contains(&n.as_str()) => format!("Unexpected token '{n}'"),
            Tok::Ident(n) => format!("Unexpected identifier '{n}'"),
            Tok::Num(_) => "Unexpected number".to_string(),
            Tok::Str(_) => "Unexpected string".to_string(),
            Tok::Template(_) => "Unexpected template string".to_string(),
            Tok::Regex { .. } => "Invalid regular expression".to_string(),
        };
        ScriptError::Syntax(msg)
    }

    fn enter(&mut self) -> Result<(), ScriptError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ScriptError::Syntax("Maximum nesting depth exceeded".into()));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn consume_semicolon(&mut self) -> Result<(), ScriptError> {
        if self.eat_punct(";") || self.is_punct("}") || self.at_eof() || self.newline_before() {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn identifier(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Tok::Ident(n) if !RESERVED.contains(&n.as_str()) => {
                let n = n.clone();
                self.pos += 1;
                Ok(n)
            }
            _ => Err(self.unexpected()),
        }
    }

    /// Any identifier-like token, reserved words included (`obj.default`).
    fn property_name(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Tok::Ident(n) => {
                let n = n.clone();
                self.pos += 1;
                Ok(n)
            }
            _ => Err(self.unexpected()),
        }
    }

    // --- Statements ---

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        self.enter()?;
        let s = self.statement_inner();
        self.leave();
        s
    }

    fn statement_inner(&mut self) -> Result<Stmt, ScriptError> {
        if self.is_punct("{") {
            return Ok(Stmt::Block(self.block()?));
        }
        if self.eat_punct(";") {
            return Ok(Stmt::Empty);
        }
        let kw = match self.peek() {
            Tok::Ident(n) => n.clone(),
            _ => return self.expression_statement(),
        };
        match kw.as_str() {
            "var" | "const" => {
                self.pos += 1;
                let kind = if kw == "var" { DeclKind::Var } else { DeclKind::Const };
                let decls = self.declarations(kind)?;
                self.consume_semicolon()?;
                Ok(Stmt::Decl(kind, decls))
            }
            "let" if matches!(self.peek_at(1), Tok::Ident(_)) || matches!(self.peek_at(1), Tok::Punct("[" | "{")) => {
                self.pos += 1;
                let decls = self.declarations(DeclKind::Let)?;
                self.consume_semicolon()?;
                Ok(Stmt::Decl(DeclKind::Let, decls))
            }
            "function" => {
                self.pos += 1;
                Ok(Stmt::Function(Arc::new(self.function_rest(true)?)))
            }
            "async" if matches!(self.peek_at(1), Tok::Ident(n) if n == "function") => {
                self.pos += 2;
                let mut f = self.function_rest(true)?;
                f.is_async = true;
                Ok(Stmt::Function(Arc::new(f)))
            }
            "class" => {
                self.pos += 1;
                Ok(Stmt::Class(Arc::new(self.class_rest(true)?)))
            }
            "if" => {
                self.pos += 1;
                self.expect_punct("(")?;
                let test = self.expression()?;
                self.expect_punct(")")?;
                let consequent = Box::new(self.statement()?);
                let alternate = if self.eat_kw("else") { Some(Box::new(self.statement()?)) } else { None };
                Ok(Stmt::If { test, consequent, alternate })
            }
            "for" => {
                self.pos += 1;
                self.for_statement()
            }
            "while" => {
                self.pos += 1;
                self.expect_punct("(")?;
                let test = self.expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.statement()?);
                Ok(Stmt::While { test, body })
            }
            "do" => {
                self.pos += 1;
                let body = Box::new(self.statement()?);
                if !self.eat_kw("while") {
                    return Err(self.unexpected());
                }
                self.expect_punct("(")?;
                let test = self.expression()?;
                self.expect_punct(")")?;
                self.eat_punct(";");
                Ok(Stmt::DoWhile { body, test })
            }
            "return" => {
                self.pos += 1;
                let value = if self.is_punct(";") || self.is_punct("}") || self.at_eof() || self.newline_before() {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.consume_semicolon()?;
                Ok(Stmt::Return(value))
            }
            "break" | "continue" => {
                self.pos += 1;
                if matches!(self.peek(), Tok::Ident(_)) && !self.newline_before() {
                    // Labels are accepted and ignored.
                    self.pos += 1;
                }
                self.consume_semicolon()?;
                Ok(if kw == "break" { Stmt::Break } else { Stmt::Continue })
            }
            "throw" => {
                self.pos += 1;
                if self.newline_before() {
                    return Err(ScriptError::Syntax("Illegal newline after throw".into()));
                }
                let e = self.expression()?;
                self.consume_semicolon()?;
                Ok(Stmt::Throw(e))
            }
            "try" => {
                self.pos += 1;
                self.try_statement()
            }
            "switch" => {
                self.pos += 1;
                self.switch_statement()
            }
            "import" => Err(ScriptError::Syntax("Cannot use import statement outside a module".into())),
            "export" => Err(self.unexpected()),
            _ if matches!(self.peek_at(1), Tok::Punct(":")) && !RESERVED.contains(&kw.as_str()) => {
                // Labelled statement; the label itself is ignored.
                self.pos += 2;
                self.statement()
            }
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) -> Result<Stmt, ScriptError> {
        let e = self.expression()?;
        self.consume_semicolon()?;
        Ok(Stmt::Expr(e))
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect_punct("{")?;
        let mut out = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected());
            }
            out.push(self.statement()?);
        }
        self.pos += 1;
        Ok(out)
    }

    fn declarations(&mut self, kind: DeclKind) -> Result<Vec<(Pattern, Option<Expr>)>, ScriptError> {
        let mut out = Vec::new();
        loop {
            let pattern = self.binding_pattern()?;
            let init = if self.eat_punct("=") { Some(self.assignment()?) } else { None };
            if init.is_none() && (kind == DeclKind::Const || !matches!(pattern, Pattern::Ident(_))) {
                return Err(ScriptError::Syntax(if kind == DeclKind::Const {
                    "Missing initializer in const declaration".into()
                } else {
                    "Missing initializer in destructuring declaration".into()
                }));
            }
            out.push((pattern, init));
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(out)
    }

    fn for_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.expect_punct("(")?;

        let decl_kind = match self.peek() {
            Tok::Ident(n) if n == "var" => Some(DeclKind::Var),
            Tok::Ident(n) if n == "let" => Some(DeclKind::Let),
            Tok::Ident(n) if n == "const" => Some(DeclKind::Const),
            _ => None,
        };

        let init = if let Some(kind) = decl_kind {
            self.pos += 1;
            let target = self.binding_pattern()?;
            if let Some(stmt) = self.for_each_tail(Some(kind), target.clone())? {
                return Ok(stmt);
            }
            let first_init = if self.eat_punct("=") { Some(self.assignment()?) } else { None };
            let mut decls = vec![(target, first_init)];
            if self.eat_punct(",") {
                decls.extend(self.declarations(kind)?);
            }
            Some(ForInit::Decl(kind, decls))
        } else if self.is_punct(";") {
            None
        } else if matches!(self.peek(), Tok::Ident(_)) && matches!(self.peek_at(1), Tok::Ident(k) if k == "of" || k == "in") {
            let name = self.identifier()?;
            match self.for_each_tail(None, Pattern::Ident(name))? {
                Some(stmt) => return Ok(stmt),
                None => return Err(self.unexpected()),
            }
        } else {
            Some(ForInit::Expr(self.expression()?))
        };

        self.expect_punct(";")?;
        let test = if self.is_punct(";") { None } else { Some(self.expression()?) };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") { None } else { Some(self.expression()?) };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For { init, test, update, body })
    }

    /// `of <expr>) body` / `in <expr>) body` after the loop target.
    fn for_each_tail(&mut self, kind: Option<DeclKind>, target: Pattern) -> Result<Option<Stmt>, ScriptError> {
        let is_of = self.is_kw("of");
        let is_in = self.is_kw("in");
        if !is_of && !is_in {
            return Ok(None);
        }
        self.pos += 1;
        let subject = if is_of { self.assignment()? } else { self.expression()? };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Some(if is_of {
            Stmt::ForOf { kind, target, iterable: subject, body }
        } else {
            Stmt::ForIn { kind, target, object: subject, body }
        }))
    }

    fn try_statement(&mut self) -> Result<Stmt, ScriptError> {
        let block = self.block()?;
        let mut param = None;
        let mut handler = None;
        let mut finalizer = None;
        if self.eat_kw("catch") {
            if self.eat_punct("(") {
                param = Some(self.binding_pattern()?);
                self.expect_punct(")")?;
            }
            handler = Some(self.block()?);
        }
        if self.eat_kw("finally") {
            finalizer = Some(self.block()?);
        }
        if handler.is_none() && finalizer.is_none() {
            return Err(ScriptError::Syntax("Missing catch or finally after try".into()));
        }
        Ok(Stmt::Try { block, param, handler, finalizer })
    }

    fn switch_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.expect_punct("(")?;
        let discriminant = self.expression()?;
        self.expect_punct(")")?;
        self.expect_punct("{")?;
        let mut cases = Vec::new();
        while !self.eat_punct("}") {
            let test = if self.eat_kw("case") {
                Some(self.expression()?)
            } else if self.eat_kw("default") {
                None
            } else {
                return Err(self.unexpected());
            };
            self.expect_punct(":")?;
            let mut body = Vec::new();
            while !self.is_kw("case") && !self.is_kw("default") && !self.is_punct("}") {
                if self.at_eof() {
                    return Err(self.unexpected());
                }
                body.push(self.statement()?);
            }
            cases.push((test, body));
        }
        Ok(Stmt::Switch { discriminant, cases })
    }

    // --- Patterns & functions ---

    fn binding_pattern(&mut self) -> Result<Pattern, ScriptError> {
        if self.eat_punct("{") {
            let mut props = Vec::new();
            while !self.eat_punct("}") {
                if self.eat_punct("...") {
                    let name = self.identifier()?;
                    props.push(ObjectPatternProp {
                        key: String::new(),
                        target: PatternElem { pattern: Pattern::Ident(name), default: None, rest: true },
                    });
                } else {
                    let key = match self.advance() {
                        Tok::Ident(n) => n,
                        Tok::Str(s) => s,
                        Tok::Num(n) => super::value::number_to_string(n),
                        _ => return Err(self.unexpected()),
                    };
                    let pattern = if self.eat_punct(":") { self.binding_pattern()? } else { Pattern::Ident(key.clone()) };
                    let default = if self.eat_punct("=") { Some(self.assignment()?) } else { None };
                    props.push(ObjectPatternProp { key, target: PatternElem { pattern, default, rest: false } });
                }
                if !self.eat_punct(",") {
                    self.expect_punct("}")?;
                    break;
                }
            }
            return Ok(Pattern::Object(props));
        }
        if self.eat_punct("[") {
            let mut items = Vec::new();
            while !self.eat_punct("]") {
                if self.eat_punct(",") {
                    items.push(None);
                    continue;
                }
                items.push(Some(self.pattern_elem()?));
                if !self.eat_punct(",") {
                    self.expect_punct("]")?;
                    break;
                }
            }
            return Ok(Pattern::Array(items));
        }
        Ok(Pattern::Ident(self.identifier()?))
    }

    fn pattern_elem(&mut self) -> Result<PatternElem, ScriptError> {
        let rest = self.eat_punct("...");
        let pattern = self.binding_pattern()?;
        let default = if !rest && self.eat_punct("=") { Some(self.assignment()?) } else { None };
        Ok(PatternElem { pattern, default, rest })
    }

    fn params(&mut self) -> Result<Vec<PatternElem>, ScriptError> {
        self.expect_punct("(")?;
        let mut out = Vec::new();
        while !self.eat_punct(")") {
            out.push(self.pattern_elem()?);
            if !self.eat_punct(",") {
                self.expect_punct(")")?;
                break;
            }
        }
        Ok(out)
    }

    /// After the `function` keyword.
    fn function_rest(&mut self, require_name: bool) -> Result<FunctionDef, ScriptError> {
        if self.is_punct("*") {
            return Err(ScriptError::Syntax("Generator functions are not supported".into()));
        }
        let name = if matches!(self.peek(), Tok::Ident(_)) {
            Some(self.identifier()?)
        } else if require_name {
            return Err(ScriptError::Syntax("Function statements require a function name".into()));
        } else {
            None
        };
        let params = self.params()?;
        let body = FunctionBody::Block(self.block()?);
        Ok(FunctionDef::new(name, params, body))
    }

    fn arrow_body(&mut self, params: Vec<PatternElem>, is_async: bool) -> Result<Expr, ScriptError> {
        self.expect_punct("=>")?;
        let body = if self.is_punct("{") {
            FunctionBody::Block(self.block()?)
        } else {
            FunctionBody::Expr(self.assignment()?)
        };
        let mut f = FunctionDef::new(None, params, body);
        f.arrow = true;
        f.is_async = is_async;
        Ok(Expr::Function(Arc::new(f)))
    }

    /// Method after its key: `(params) { body }`.
    fn method(&mut self, key: &PropKey, is_async: bool) -> Result<FunctionDef, ScriptError> {
        let name = match key {
            PropKey::Static(s) => Some(s.clone()),
            PropKey::Computed(_) => None,
        };
        let params = self.params()?;
        let body = FunctionBody::Block(self.block()?);
        let mut f = FunctionDef::new(name, params, body);
        f.is_async = is_async;
        Ok(f)
    }

    /// Object or class member key.
    fn property_key(&mut self) -> Result<PropKey, ScriptError> {
        let key = match self.peek().clone() {
            Tok::Ident(n) => PropKey::Static(n),
            Tok::Str(s) => PropKey::Static(s),
            Tok::Num(n) => PropKey::Static(super::value::number_to_string(n)),
            Tok::Punct("[") => {
                self.pos += 1;
                let k = self.assignment()?;
                self.expect_punct("]")?;
                return Ok(PropKey::Computed(k));
            }
            _ => return Err(self.unexpected()),
        };
        self.pos += 1;
        Ok(key)
    }

    /// Is the modifier word at the cursor (`get`, `static`, `async`) followed by a key?
    fn modifier_applies(&self) -> bool {
        let next_on_new_line = self.toks.get(self.pos + 1).map(|t| t.newline_before).unwrap_or(true);
        matches!(self.peek_at(1), Tok::Ident(_) | Tok::Str(_) | Tok::Num(_) | Tok::Punct("["))
            && !(self.is_kw("async") && next_on_new_line)
    }

    /// After the `class` keyword.
    fn class_rest(&mut self, require_name: bool) -> Result<ClassDef, ScriptError> {
        let name = if matches!(self.peek(), Tok::Ident(n) if n != "extends") {
            Some(self.identifier()?)
        } else if require_name {
            return Err(ScriptError::Syntax("Class statements require a class name".into()));
        } else {
            None
        };
        let extends = if self.eat_kw("extends") { Some(self.call_member()?) } else { None };
        self.expect_punct("{")?;

        let mut constructor = None;
        let mut fields = Vec::new();
        let mut members = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct(";") {
                continue;
            }
            if self.at_eof() {
                return Err(self.unexpected());
            }
            let is_static = self.is_kw("static") && self.modifier_applies();
            if is_static {
                self.pos += 1;
            }
            let is_async = self.is_kw("async") && self.modifier_applies();
            if is_async {
                self.pos += 1;
            }
            let accessor = if (self.is_kw("get") || self.is_kw("set")) && self.modifier_applies() {
                let getter = self.is_kw("get");
                self.pos += 1;
                Some(getter)
            } else {
                None
            };
            let key = self.property_key()?;

            if self.is_punct("(") {
                let mut f = self.method(&key, is_async)?;
                let is_ctor = !is_static && matches!(&key, PropKey::Static(k) if k == "constructor");
                if is_ctor {
                    if accessor.is_some() || is_async {
                        return Err(ScriptError::Syntax("Class constructor may not be an accessor".into()));
                    }
                    if constructor.is_some() {
                        return Err(ScriptError::Syntax("A class may only have one constructor".into()));
                    }
                    f.name = name.clone();
                    constructor = Some(f);
                    continue;
                }
                let f = Arc::new(f);
                let kind = match accessor {
                    Some(true) => ClassMemberKind::Getter(f),
                    Some(false) => ClassMemberKind::Setter(f),
                    None => ClassMemberKind::Method(f),
                };
                members.push(ClassMember { key, is_static, kind });
                continue;
            }

            if accessor.is_some() || is_async {
                return Err(self.unexpected());
            }
            let init = if self.eat_punct("=") { Some(self.assignment()?) } else { None };
            self.consume_semicolon()?;
            if is_static {
                members.push(ClassMember { key, is_static, kind: ClassMemberKind::Field(init) });
            } else {
                let property = match key {
                    PropKey::Static(k) => MemberKey::Name(k),
                    PropKey::Computed(e) => MemberKey::Computed(Box::new(e)),
                };
                let value = init.unwrap_or(Expr::Unary { op: UnaryOp::Void, expr: Box::new(Expr::Num(0.0)) });
                fields.push(Stmt::Expr(Expr::Assign {
                    op: AssignOp::Assign,
                    target: Box::new(Expr::Member { object: Box::new(Expr::This), property, optional: false }),
                    value: Box::new(value),
                }));
            }
        }

        let kind = if extends.is_some() { CtorKind::Derived } else { CtorKind::Base };
        let mut constructor = constructor.unwrap_or_else(|| {
            if kind == CtorKind::Derived {
                // constructor(...args) { super(...args) }
                let args = PatternElem { pattern: Pattern::Ident("args".into()), default: None, rest: true };
                let call = Expr::SuperCall(vec![ArrayItem::Spread(Expr::Ident("args".into()))]);
                FunctionDef::new(name.clone(), vec![args], FunctionBody::Block(vec![Stmt::Expr(call)]))
            } else {
                FunctionDef::new(name.clone(), Vec::new(), FunctionBody::Block(Vec::new()))
            }
        });
        constructor.ctor = Some(kind);
        let fields = if fields.is_empty() {
            None
        } else {
            Some(Arc::new(FunctionDef::new(None, Vec::new(), FunctionBody::Block(fields))))
        };
        Ok(ClassDef { name, extends, constructor: Arc::new(constructor), fields, members })
    }

    /// Does the `(` at the cursor open an arrow parameter list?
    fn paren_starts_arrow(&self) -> bool {
        let mut depth = 0usize;
        let mut i = self.pos;
        while let Some(t) = self.toks.get(i) {
            match &t.tok {
                Tok::Punct("(" | "[" | "{") => depth += 1,
                Tok::Punct(")" | "]" | "}") => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return matches!(self.toks.get(i + 1).map(|t| &t.tok), Some(Tok::Punct("=>")));
                    }
                }
                Tok::Eof => return false,
                _ => {}
            }
            i += 1;
        }
        false
    }

    // --- Expressions ---

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        let first = self.assignment()?;
        if !self.is_punct(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            items.push(self.assignment()?);
        }
        Ok(Expr::Sequence(items))
    }

    fn assignment(&mut self) -> Result<Expr, ScriptError> {
        self.enter()?;
        let e = self.assignment_inner();
        self.leave();
        e
    }

    fn assignment_inner(&mut self) -> Result<Expr, ScriptError> {
        if self.is_kw("async")
            && !self.toks.get(self.pos + 1).map(|t| t.newline_before).unwrap_or(true)
            && (matches!(self.peek_at(1), Tok::Ident(_)) && matches!(self.peek_at(2), Tok::Punct("=>"))
                || matches!(self.peek_at(1), Tok::Punct("(")))
        {
            let save = self.pos;
            self.pos += 1;
            if matches!(self.peek(), Tok::Ident(_)) {
                let name = self.identifier()?;
                let param = PatternElem { pattern: Pattern::Ident(name), default: None, rest: false };
                return self.arrow_body(vec![param], true);
            }
            if self.paren_starts_arrow() {
                let params = self.params()?;
                return self.arrow_body(params, true);
            }
            self.pos = save;
        }

        if matches!(self.peek(), Tok::Ident(n) if !RESERVED.contains(&n.as_str()))
            && matches!(self.peek_at(1), Tok::Punct("=>"))
        {
            let name = self.identifier()?;
            return self.arrow_body(vec![PatternElem { pattern: Pattern::Ident(name), default: None, rest: false }], false);
        }
        if self.is_punct("(") && self.paren_starts_arrow() {
            let params = self.params()?;
            return self.arrow_body(params, false);
        }

        let left = self.conditional()?;
        let op = match self.peek() {
            Tok::Punct("=") => AssignOp::Assign,
            Tok::Punct("+=") => AssignOp::Compound(BinaryOp::Add),
            Tok::Punct("-=") => AssignOp::Compound(BinaryOp::Sub),
            Tok::Punct("*=") => AssignOp::Compound(BinaryOp::Mul),
            Tok::Punct("/=") => AssignOp::Compound(BinaryOp::Div),
            Tok::Punct("%=") => AssignOp::Compound(BinaryOp::Rem),
            Tok::Punct("**=") => AssignOp::Compound(BinaryOp::Exp),
            Tok::Punct("&=") => AssignOp::Compound(BinaryOp::BitAnd),
            Tok::Punct("|=") => AssignOp::Compound(BinaryOp::BitOr),
            Tok::Punct("^=") => AssignOp::Compound(BinaryOp::BitXor),
            Tok::Punct("<<=") => AssignOp::Compound(BinaryOp::Shl),
            Tok::Punct(">>=") => AssignOp::Compound(BinaryOp::Shr),
            Tok::Punct(">>>=") => AssignOp::Compound(BinaryOp::UShr),
            Tok::Punct("&&=") => AssignOp::Logical(LogicalOp::And),
            Tok::Punct("||=") => AssignOp::Logical(LogicalOp::Or),
            Tok::Punct("??=") => AssignOp::Logical(LogicalOp::Nullish),
            _ => return Ok(left),
        };
        if !matches!(left, Expr::Ident(_) | Expr::Member { .. }) {
            return Err(ScriptError::Syntax("Invalid left-hand side in assignment".into()));
        }
        self.pos += 1;
        let value = self.assignment()?;
        Ok(Expr::Assign { op, target: Box::new(left), value: Box::new(value) })
    }

    fn conditional(&mut self) -> Result<Expr, ScriptError> {
        let test = self.binary(1)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let consequent = self.assignment()?;
        self.expect_punct(":")?;
        let alternate = self.assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    /// Binary operator at the cursor with its precedence.
    fn binary_op(&self) -> Option<(u8, Result<BinaryOp, LogicalOp>)> {
        let op = match self.peek() {
            Tok::Punct(p) => *p,
            Tok::Ident(n) if n == "instanceof" => "instanceof",
            Tok::Ident(n) if n == "in" => "in",
            _ => return None,
        };
        Some(match op {
            "??" => (1, Err(LogicalOp::Nullish)),
            "||" => (2, Err(LogicalOp::Or)),
            "&&" => (3, Err(LogicalOp::And)),
            "|" => (4, Ok(BinaryOp::BitOr)),
            "^" => (5, Ok(BinaryOp::BitXor)),
            "&" => (6, Ok(BinaryOp::BitAnd)),
            "==" => (7, Ok(BinaryOp::Eq)),
            "!=" => (7, Ok(BinaryOp::NotEq)),
            "===" => (7, Ok(BinaryOp::StrictEq)),
            "!==" => (7, Ok(BinaryOp::StrictNotEq)),
            "<" => (8, Ok(BinaryOp::Lt)),
            ">" => (8, Ok(BinaryOp::Gt)),
            "<=" => (8, Ok(BinaryOp::LtEq)),
            ">=" => (8, Ok(BinaryOp::GtEq)),
            "instanceof" => (8, Ok(BinaryOp::InstanceOf)),
            "in" => (8, Ok(BinaryOp::In)),
            "<<" => (9, Ok(BinaryOp::Shl)),
            ">>" => (9, Ok(BinaryOp::Shr)),
            ">>>" => (9, Ok(BinaryOp::UShr)),
            "+" => (10, Ok(BinaryOp::Add)),
            "-" => (10, Ok(BinaryOp::Sub)),
            "*" => (11, Ok(BinaryOp::Mul)),
            "/" => (11, Ok(BinaryOp::Div)),
            "%" => (11, Ok(BinaryOp::Rem)),
            "**" => (12, Ok(BinaryOp::Exp)),
            _ => return None,
        })
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, ScriptError> {
        let mut left = self.unary()?;
        while let Some((prec, op)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let next_min = if prec == 12 { prec } else { prec + 1 };
            let right = self.binary(next_min)?;
            left = match op {
                Ok(op) => Expr::Binary { op, left: Box::new(left), right: Box::new(right) },
                Err(op) => Expr::Logical { op, left: Box::new(left), right: Box::new(right) },
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        self.enter()?;
        let e = self.unary_inner();
        self.leave();
        e
    }

    fn unary_inner(&mut self) -> Result<Expr, ScriptError> {
        let op = match self.peek() {
            Tok::Punct("!") => Some(UnaryOp::Not),
            Tok::Punct("-") => Some(UnaryOp::Neg),
            Tok::Punct("+") => Some(UnaryOp::Plus),
            Tok::Punct("~") => Some(UnaryOp::BitNot),
            Tok::Ident(n) if n == "typeof" => Some(UnaryOp::TypeOf),
            Tok::Ident(n) if n == "void" => Some(UnaryOp::Void),
            Tok::Ident(n) if n == "delete" => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let expr = self.unary()?;
            return Ok(Expr::Unary { op, expr: Box::new(expr) });
        }
        if self.is_kw("await") && (!matches!(self.peek_at(1), Tok::Punct(_)) || matches!(self.peek_at(1), Tok::Punct("(" | "["))) {
            self.pos += 1;
            let expr = self.unary()?;
            return Ok(Expr::Await(Box::new(expr)));
        }
        if self.is_punct("++") || self.is_punct("--") {
            let increment = self.is_punct("++");
            self.pos += 1;
            let target = self.unary()?;
            if !matches!(target, Expr::Ident(_) | Expr::Member { .. }) {
                return Err(ScriptError::Syntax("Invalid left-hand side expression in prefix operation".into()));
            }
            return Ok(Expr::Update { increment, prefix: true, target: Box::new(target) });
        }
        let expr = self.call_member()?;
        if (self.is_punct("++") || self.is_punct("--")) && !self.newline_before() {
            let increment = self.is_punct("++");
            if !matches!(expr, Expr::Ident(_) | Expr::Member { .. }) {
                return Err(ScriptError::Syntax("Invalid left-hand side expression in postfix operation".into()));
            }
            self.pos += 1;
            return Ok(Expr::Update { increment, prefix: false, target: Box::new(expr) });
        }
        Ok(expr)
    }

    fn arguments(&mut self) -> Result<Vec<ArrayItem>, ScriptError> {
        self.expect_punct("(")?;
        let mut out = Vec::new();
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                out.push(ArrayItem::Spread(self.assignment()?));
            } else {
                out.push(ArrayItem::Item(self.assignment()?));
            }
            if !self.eat_punct(",") {
                self.expect_punct(")")?;
                break;
            }
        }
        Ok(out)
    }

    fn call_member(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = if self.eat_kw("new") {
            let callee = self.new_callee()?;
            let args = if self.is_punct("(") { self.arguments()? } else { Vec::new() };
            Expr::New { callee: Box::new(callee), args }
        } else {
            self.primary()?
        };
        loop {
            if self.eat_punct(".") {
                let name = self.property_name()?;
                expr = Expr::Member { object: Box::new(expr), property: MemberKey::Name(name), optional: false };
            } else if self.eat_punct("?.") {
                if self.is_punct("(") {
                    let args = self.arguments()?;
                    expr = Expr::Call { callee: Box::new(expr), args, optional: true };
                } else if self.eat_punct("[") {
                    let key = self.expression()?;
                    self.expect_punct("]")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: MemberKey::Computed(Box::new(key)),
                        optional: true,
                    };
                } else {
                    let name = self.property_name()?;
                    expr = Expr::Member { object: Box::new(expr), property: MemberKey::Name(name), optional: true };
                }
            } else if self.eat_punct("[") {
                let key = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberKey::Computed(Box::new(key)),
                    optional: false,
                };
            } else if self.is_punct("(") {
                let args = self.arguments()?;
                expr = Expr::Call { callee: Box::new(expr), args, optional: false };
            } else if matches!(self.peek(), Tok::Template(_)) && !self.newline_before() {
                return Err(ScriptError::Syntax("Tagged templates are not supported".into()));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// Callee of `new`: member accesses without calls.
    fn new_callee(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = if self.eat_kw("new") {
            let callee = self.new_callee()?;
            let args = if self.is_punct("(") { self.arguments()? } else { Vec::new() };
            Expr::New { callee: Box::new(callee), args }
        } else {
            self.primary()?
        };
        loop {
            if self.eat_punct(".") {
                let name = self.property_name()?;
                expr = Expr::Member { object: Box::new(expr), property: MemberKey::Name(name), optional: false };
            } else if self.eat_punct("[") {
                let key = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberKey::Computed(Box::new(key)),
                    optional: false,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        match self.peek().clone() {
            Tok::Num(n) => {
                self.pos += 1;
                Ok(Expr::Num(n))
            }
            Tok::Str(s) => {
                self.pos += 1;
                Ok(Expr::Str(s))
            }
            Tok::Regex { pattern, flags } => {
                self.pos += 1;
                Ok(Expr::Regex { pattern, flags })
            }
            Tok::Template(chunks) => {
                self.pos += 1;
                let mut parts = Vec::new();
                for c in chunks {
                    match c {
                        TemplateChunk::Text(t) => parts.push(TemplatePart::Text(t)),
                        TemplateChunk::Expr(src) => {
                            self.enter()?;
                            let e = parse_expression(&src);
                            self.leave();
                            parts.push(TemplatePart::Expr(e?));
                        }
                    }
                }
                Ok(Expr::Template(parts))
            }
            Tok::Punct("(") => {
                self.pos += 1;
                let e = self.expression()?;
                self.expect_punct(")")?;
                Ok(e)
            }
            Tok::Punct("[") => {
                self.pos += 1;
                let mut items = Vec::new();
                while !self.eat_punct("]") {
                    if self.eat_punct(",") {
                        items.push(ArrayItem::Hole);
                        continue;
                    }
                    if self.eat_punct("...") {
                        items.push(ArrayItem::Spread(self.assignment()?));
                    } else {
                        items.push(ArrayItem::Item(self.assignment()?));
                    }
                    if !self.eat_punct(",") {
                        self.expect_punct("]")?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            Tok::Punct("{") => {
                self.pos += 1;
                self.object_literal()
            }
            Tok::Ident(n) => match n.as_str() {
                "true" => {
                    self.pos += 1;
                    Ok(Expr::Bool(true))
                }
                "false" => {
                    self.pos += 1;
                    Ok(Expr::Bool(false))
                }
                "null" => {
                    self.pos += 1;
                    Ok(Expr::Null)
                }
                "this" => {
                    self.pos += 1;
                    Ok(Expr::This)
                }
                "function" => {
                    self.pos += 1;
                    Ok(Expr::Function(Arc::new(self.function_rest(false)?)))
                }
                "async" if matches!(self.peek_at(1), Tok::Ident(k) if k == "function") => {
                    self.pos += 2;
                    let mut f = self.function_rest(false)?;
                    f.is_async = true;
                    Ok(Expr::Function(Arc::new(f)))
                }
                "class" => {
                    self.pos += 1;
                    Ok(Expr::Class(Arc::new(self.class_rest(false)?)))
                }
                "super" => {
                    self.pos += 1;
                    if self.is_punct("(") {
                        return Ok(Expr::SuperCall(self.arguments()?));
                    }
                    if self.eat_punct(".") {
                        return Ok(Expr::SuperMember(MemberKey::Name(self.property_name()?)));
                    }
                    if self.eat_punct("[") {
                        let key = self.expression()?;
                        self.expect_punct("]")?;
                        return Ok(Expr::SuperMember(MemberKey::Computed(Box::new(key))));
                    }
                    Err(ScriptError::Syntax("'super' keyword unexpected here".into()))
                }
                _ => Ok(Expr::Ident(self.identifier()?)),
            },
            _ => Err(self.unexpected()),
        }
    }

    fn object_literal(&mut self) -> Result<Expr, ScriptError> {
        let mut props = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct("...") {
                props.push(Property::Spread(self.assignment()?));
            } else if (self.is_kw("get") || self.is_kw("set")) && self.modifier_applies() {
                let getter = self.is_kw("get");
                self.pos += 1;
                let key = self.property_key()?;
                let f = Arc::new(self.method(&key, false)?);
                props.push(if getter { Property::Getter(key, f) } else { Property::Setter(key, f) });
            } else if self.is_kw("async") && self.modifier_applies() {
                self.pos += 1;
                let key = self.property_key()?;
                let f = self.method(&key, true)?;
                props.push(Property::KeyValue(key, Expr::Function(Arc::new(f))));
            } else {
                let shorthand_ok = matches!(self.peek(), Tok::Ident(_));
                let key = self.property_key()?;
                if self.eat_punct(":") {
                    props.push(Property::KeyValue(key, self.assignment()?));
                } else if self.is_punct("(") {
                    let f = self.method(&key, false)?;
                    props.push(Property::KeyValue(key, Expr::Function(Arc::new(f))));
                } else if shorthand_ok {
                    match key {
                        PropKey::Static(name) => props.push(Property::Shorthand(name)),
                        PropKey::Computed(_) => return Err(self.unexpected()),
                    }
                } else {
                    return Err(self.unexpected());
                }
            }
            if !self.eat_punct(",") {
                self.expect_punct("}")?;
                break;
            }
        }
        Ok(Expr::Object(props))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_expressions_parse() {
        let e = parse_expression("document.querySelector('h1') !== null").unwrap();
        assert!(matches!(e, Expr::Binary { op: BinaryOp::StrictNotEq, .. }));
        let e = parse_expression("a && b || c").unwrap();
        assert!(matches!(e, Expr::Logical { op: LogicalOp::Or, .. }));
        let e = parse_expression("1 + 2 * 3").unwrap();
        match e {
            Expr::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn arrows_and_iifes() {
        let e = parse_expression("(() => { const x = 1; return x; })()").unwrap();
        assert!(matches!(e, Expr::Call { .. }));
        let e = parse_expression("items.map(i => i * 2)").unwrap();
        assert!(matches!(e, Expr::Call { .. }));
        let e = parse_expression("async (a, {b}) => a").unwrap();
        assert!(matches!(e, Expr::Function(_)));
    }

    #[test]
    fn statements_with_asi() {
        let prog = parse_program(
            "let count = 0\nconst btn = document.getElementById('b')\nbtn.addEventListener('click', function () {\n  count++\n})",
        )
        .unwrap();
        assert_eq!(prog.len(), 3);
    }

    #[test]
    fn loops_and_switch() {
        let prog = parse_program(
            "for (let i = 0; i < 3; i++) {} for (const x of xs) {} for (k in o) {} \
             switch (a) { case 1: b(); break; default: c() }",
        )
        .unwrap();
        assert!(matches!(prog[0], Stmt::For { .. }));
        assert!(matches!(prog[1], Stmt::ForOf { .. }));
        assert!(matches!(prog[2], Stmt::ForIn { .. }));
        assert!(matches!(prog[3], Stmt::Switch { .. }));
    }

    #[test]
    fn syntax_errors_name_the_token() {
        let err = parse_expression("document.querySelector('h1'))").unwrap_err();
        assert_eq!(err.to_string(), "Unexpected token ')'");
        let err = parse_program("let x = ").unwrap_err();
        assert_eq!(err.to_string(), "Unexpected end of input");
    }

    #[test]
    fn object_literals_and_destructuring() {
        parse_program("const { a, b: [c, d = 2], ...rest } = { a: 1, 'b': [3], [k]: 4, m() { return 1 }, ...o }").unwrap();
    }

    #[test]
    fn accessors_in_object_literals() {
        let e = parse_expression("({ get total() { return 1 }, set total(v) {}, get: 2, set() {} })").unwrap();
        let Expr::Object(props) = e else { panic!("expected object") };
        assert!(matches!(&props[0], Property::Getter(PropKey::Static(k), _) if k == "total"));
        assert!(matches!(&props[1], Property::Setter(PropKey::Static(k), _) if k == "total"));
        assert!(matches!(&props[2], Property::KeyValue(PropKey::Static(k), _) if k == "get"));
        assert!(matches!(&props[3], Property::KeyValue(PropKey::Static(k), Expr::Function(_)) if k == "set"));
    }

    #[test]
    fn classes_collect_members_and_fields() {
        let prog = parse_program(
            "class Counter extends Base {\n  count = 0;\n  #secret = 1\n  static made = 0;\n  \
             constructor(n) { super(n); }\n  get double() { return this.count * 2 }\n  \
             static create() { return new Counter(1) }\n  async load() { await x }\n}",
        )
        .unwrap();
        let Stmt::Class(class) = &prog[0] else { panic!("expected class") };
        assert_eq!(class.name.as_deref(), Some("Counter"));
        assert!(class.extends.is_some());
        assert_eq!(class.constructor.ctor, Some(CtorKind::Derived));
        assert_eq!(class.constructor.name.as_deref(), Some("Counter"));
        let Some(fields) = &class.fields else { panic!("expected instance fields") };
        let FunctionBody::Block(stmts) = &fields.body else { panic!("expected block") };
        assert_eq!(stmts.len(), 2);
        let kinds: Vec<(bool, &str)> = class
            .members
            .iter()
            .map(|m| {
                let kind = match &m.kind {
                    ClassMemberKind::Method(f) if f.is_async => "async",
                    ClassMemberKind::Method(_) => "method",
                    ClassMemberKind::Getter(_) => "get",
                    ClassMemberKind::Setter(_) => "set",
                    ClassMemberKind::Field(_) => "field",
                };
                (m.is_static, kind)
            })
            .collect();
        assert_eq!(kinds, vec![(true, "field"), (false, "get"), (true, "method"), (false, "async")]);
    }

    #[test]
    fn derived_classes_get_a_forwarding_constructor() {
        let Expr::Class(class) = parse_expression("class extends Error {}").unwrap() else { panic!("expected class") };
        let FunctionBody::Block(body) = &class.constructor.body else { panic!("expected block") };
        assert!(matches!(&body[0], Stmt::Expr(Expr::SuperCall(args)) if matches!(args[0], ArrayItem::Spread(_))));
        let err = parse_program("class A { constructor() {} constructor() {} }").unwrap_err();
        assert_eq!(err.to_string(), "A class may only have one constructor");
        let err = parse_program("class { }").unwrap_err();
        assert_eq!(err.to_string(), "Class statements require a class name");
    }

    #[test]
    fn async_functions_and_await() {
        let prog = parse_program("async function load() { const r = await fetchIt(); return r }").unwrap();
        let Stmt::Function(f) = &prog[0] else { panic!("expected function") };
        assert!(f.is_async);
        let FunctionBody::Block(body) = &f.body else { panic!("expected block") };
        assert!(matches!(&body[0], Stmt::Decl(DeclKind::Const, decls) if matches!(decls[0].1, Some(Expr::Await(_)))));
        let Expr::Function(arrow) = parse_expression("async x => await x").unwrap() else { panic!("expected arrow") };
        assert!(arrow.is_async && arrow.arrow);
        assert!(matches!(parse_expression("super.name").unwrap(), Expr::SuperMember(MemberKey::Name(_))));
    }
}
