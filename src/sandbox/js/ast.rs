//! Syntax tree for the script subset.

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Template(Vec<TemplatePart>),
    Regex { pattern: String, flags: String },
    Bool(bool),
    Null,
    Ident(String),
    This,
    Array(Vec<ArrayItem>),
    Object(Vec<Property>),
    Function(Arc<FunctionDef>),
    Class(Arc<ClassDef>),
    Member { object: Box<Expr>, property: MemberKey, optional: bool },
    /// `super.x` / `super[x]` inside a method.
    SuperMember(MemberKey),
    /// `super(...)` inside a derived constructor.
    SuperCall(Vec<ArrayItem>),
    Call { callee: Box<Expr>, args: Vec<ArrayItem>, optional: bool },
    New { callee: Box<Expr>, args: Vec<ArrayItem> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Update { increment: bool, prefix: bool, target: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Logical { op: LogicalOp, left: Box<Expr>, right: Box<Expr> },
    Conditional { test: Box<Expr>, consequent: Box<Expr>, alternate: Box<Expr> },
    Assign { op: AssignOp, target: Box<Expr>, value: Box<Expr> },
    Sequence(Vec<Expr>),
    Await(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayItem {
    Item(Expr),
    Spread(Expr),
    Hole,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    KeyValue(PropKey, Expr),
    Shorthand(String),
    Spread(Expr),
    Getter(PropKey, Arc<FunctionDef>),
    Setter(PropKey, Arc<FunctionDef>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropKey {
    Static(String),
    Computed(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemberKey {
    Name(String),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    BitNot,
    TypeOf,
    Void,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Exp,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
    In,
    InstanceOf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AssignOp {
    Assign,
    Compound(BinaryOp),
    Logical(LogicalOp),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Ident(String),
    Object(Vec<ObjectPatternProp>),
    Array(Vec<Option<PatternElem>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPatternProp {
    pub key: String,
    pub target: PatternElem,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternElem {
    pub pattern: Pattern,
    pub default: Option<Expr>,
    pub rest: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<PatternElem>,
    pub body: FunctionBody,
    pub arrow: bool,
    pub is_async: bool,
    /// Set on class constructors, which only run through `new`.
    pub ctor: Option<CtorKind>,
}

impl FunctionDef {
    pub fn new(name: Option<String>, params: Vec<PatternElem>, body: FunctionBody) -> Self {
        Self { name, params, body, arrow: false, is_async: false, ctor: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CtorKind {
    Base,
    /// `this` comes from `super(...)`.
    Derived,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub name: Option<String>,
    pub extends: Option<Expr>,
    pub constructor: Arc<FunctionDef>,
    /// Instance field initializers, run against each new instance.
    pub fields: Option<Arc<FunctionDef>>,
    pub members: Vec<ClassMember>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassMember {
    pub key: PropKey,
    pub is_static: bool,
    pub kind: ClassMemberKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassMemberKind {
    Method(Arc<FunctionDef>),
    Getter(Arc<FunctionDef>),
    Setter(Arc<FunctionDef>),
    /// Static field; instance fields live in [`ClassDef::fields`].
    Field(Option<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Block(Vec<Stmt>),
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeclKind {
    Var,
    Let,
    Const,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForInit {
    Decl(DeclKind, Vec<(Pattern, Option<Expr>)>),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Decl(DeclKind, Vec<(Pattern, Option<Expr>)>),
    Function(Arc<FunctionDef>),
    Class(Arc<ClassDef>),
    Expr(Expr),
    If { test: Expr, consequent: Box<Stmt>, alternate: Option<Box<Stmt>> },
    For { init: Option<ForInit>, test: Option<Expr>, update: Option<Expr>, body: Box<Stmt> },
    ForOf { kind: Option<DeclKind>, target: Pattern, iterable: Expr, body: Box<Stmt> },
    ForIn { kind: Option<DeclKind>, target: Pattern, object: Expr, body: Box<Stmt> },
    While { test: Expr, body: Box<Stmt> },
    DoWhile { body: Box<Stmt>, test: Expr },
    Switch { discriminant: Expr, cases: Vec<(Option<Expr>, Vec<Stmt>)> },
    Try { block: Vec<Stmt>, param: Option<Pattern>, handler: Option<Vec<Stmt>>, finalizer: Option<Vec<Stmt>> },
    Return(Option<Expr>),
    Throw(Expr),
    Break,
    Continue,
    Block(Vec<Stmt>),
    Empty,
}

impl Pattern {
    /// Names bound by this pattern.
    pub fn names(&self, out: &mut Vec<String>) {
        match self {
            Pattern::Ident(n) => out.push(n.clone()),
            Pattern::Object(props) => {
                for p in props {
                    p.target.pattern.names(out);
                }
            }
            Pattern::Array(items) => {
                for it in items.iter().flatten() {
                    it.pattern.names(out);
                }
            }
        }
    }
}

/// `var` names declared anywhere in `stmts`, not descending into functions.
pub fn var_names(stmts: &[Stmt], out: &mut Vec<String>) {
    for s in stmts {
        collect_vars(s, out);
    }
}

fn collect_vars(stmt: &Stmt, out: &mut Vec<String>) {
    match stmt {
        Stmt::Decl(DeclKind::Var, decls) => {
            for (p, _) in decls {
                p.names(out);
            }
        }
        Stmt::If { consequent, alternate, .. } => {
            collect_vars(consequent, out);
            if let Some(a) = alternate {
                collect_vars(a, out);
            }
        }
        Stmt::For { init, body, .. } => {
            if let Some(ForInit::Decl(DeclKind::Var, decls)) = init {
                for (p, _) in decls {
                    p.names(out);
                }
            }
            collect_vars(body, out);
        }
        Stmt::ForOf { kind, target, body, .. } | Stmt::ForIn { kind, target, body, .. } => {
            if *kind == Some(DeclKind::Var) {
                target.names(out);
            }
            collect_vars(body, out);
        }
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } => collect_vars(body, out),
        Stmt::Switch { cases, .. } => {
            for (_, body) in cases {
                var_names(body, out);
            }
        }
        Stmt::Try { block, handler, finalizer, .. } => {
            var_names(block, out);
            if let Some(h) = handler {
                var_names(h, out);
            }
            if let Some(f) = finalizer {
                var_names(f, out);
            }
        }
        Stmt::Block(b) => var_names(b, out),
        _ => {}
    }
}

/// Whether a block needs its own scope (lexical declarations or functions).
pub fn has_lexical(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|s| {
        matches!(s, Stmt::Decl(DeclKind::Let | DeclKind::Const, _) | Stmt::Function(_) | Stmt::Class(_))
    })
}
