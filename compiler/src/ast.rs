// AST node types for kernel description sources.
//
// One statement per line. Every node carries a `SimpleSpan` for error
// reporting during resolution.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

use crate::kernel::IndexTag;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

// ── Root ──

/// A complete kernel source: a sequence of statements.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSource {
    pub statements: Vec<Statement>,
    pub span: Span,
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Kernel(Ident),
    Set(SetStmt),
    Domain(DomainStmt),
    Arg(ArgStmt),
    Temp(TempStmt),
    Tag(Vec<TagEntry>),
    Insn(InsnStmt),
}

// ── set_stmt: 'set' IDENT '=' set_value ──

#[derive(Debug, Clone, PartialEq)]
pub struct SetStmt {
    pub name: Ident,
    pub value: SetValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    Int(i64, Span),
    Size(u64, Span),
    /// A bare word, e.g. `local` or `global`.
    Word(String, Span),
}

// ── domain_stmt: 'domain' '[' dims ']' ':' chain ('and' chain)* ──

#[derive(Debug, Clone, PartialEq)]
pub struct DomainStmt {
    pub dims: Vec<Ident>,
    pub constraints: Vec<ConstraintChain>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

/// `e0 op1 e1 op2 e2 ...`, meaning every adjacent pair compares.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintChain {
    pub first: ExprNode,
    pub rest: Vec<(CmpOp, ExprNode)>,
    pub span: Span,
}

// ── arg_stmt / temp_stmt ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Global,
    Image,
    Scalar,
}

/// `arg (global|image) DTYPE NAME '[' shape ']'` or
/// `arg scalar DTYPE NAME '~' INT`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgStmt {
    pub kind: ArgKind,
    pub dtype: Ident,
    pub name: Ident,
    pub shape: Vec<ExprNode>,
    pub approximately: Option<(i64, Span)>,
}

/// `temp DTYPE NAME '[' shape ']'`
#[derive(Debug, Clone, PartialEq)]
pub struct TempStmt {
    pub dtype: Ident,
    pub name: Ident,
    pub shape: Vec<ExprNode>,
}

// ── tag_stmt: 'tag' IDENT '=' TAG (',' IDENT '=' TAG)* ──

#[derive(Debug, Clone, PartialEq)]
pub struct TagEntry {
    pub iname: Ident,
    pub tag: IndexTag,
    pub span: Span,
}

// ── insn_stmt: 'insn' (IDENT ':')? lvalue '=' expr deps? inames? ──

#[derive(Debug, Clone, PartialEq)]
pub struct InsnStmt {
    pub id: Option<Ident>,
    pub assignee: ExprNode,
    pub expression: ExprNode,
    pub deps: Vec<Ident>,
    pub inames: Vec<Ident>,
}

// ── Expressions ──

#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

/// An iname bound by a reduction; `duplicate` is the `@` marker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionIname {
    pub name: Ident,
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Var(String),
    /// `name$tag`
    Tagged { name: String, tag: String },
    Subscript { aggregate: Ident, index: Vec<ExprNode> },
    Neg(Box<ExprNode>),
    Binary {
        op: BinOp,
        lhs: Box<ExprNode>,
        rhs: Box<ExprNode>,
    },
    Call { function: Ident, args: Vec<ExprNode> },
    /// `op(j, body)` or `op((j, @k), body)`. `max`/`min` over a name that
    /// is not an iname is a plain call; resolution decides.
    Reduce {
        op: Ident,
        inames: Vec<ReductionIname>,
        body: Box<ExprNode>,
    },
}

// ── Common ──

#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}
