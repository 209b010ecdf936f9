// expr.rs — Instruction expression trees
//
// Expressions are plain values: every rewrite returns a new tree. Subtraction
// is represented as a sum with a `-1` product term and negation as a `-1`
// product, so the arithmetic shape seen by the flop estimator matches the
// written source.
//
// Preconditions: none.
// Postconditions: rewrites never mutate their input.
// Failure modes: `ReductionRewriter` implementations may fail; the error is
//   propagated unchanged.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::convert::Infallible;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::AffineExpr;
use crate::kernel::Dtype;

// ── Reduction operations ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionKind {
    Sum,
    Product,
    Max,
    Min,
}

impl ReductionKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(ReductionKind::Sum),
            "product" => Some(ReductionKind::Product),
            "max" => Some(ReductionKind::Max),
            "min" => Some(ReductionKind::Min),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReductionKind::Sum => "sum",
            ReductionKind::Product => "product",
            ReductionKind::Max => "max",
            ReductionKind::Min => "min",
        }
    }
}

/// An associative, commutative operation with a neutral element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReductionOp {
    pub kind: ReductionKind,
    pub dtype: Dtype,
}

impl ReductionOp {
    pub fn new(kind: ReductionKind, dtype: Dtype) -> Self {
        ReductionOp { kind, dtype }
    }

    pub fn neutral_element(&self) -> Expr {
        match (self.kind, self.dtype.is_float()) {
            (ReductionKind::Sum, _) => Expr::Int(0),
            (ReductionKind::Product, _) => Expr::Int(1),
            (ReductionKind::Max, true) => Expr::negate(Expr::var("INFINITY")),
            (ReductionKind::Min, true) => Expr::var("INFINITY"),
            (ReductionKind::Max, false) => Expr::Int(self.dtype.int_min()),
            (ReductionKind::Min, false) => Expr::Int(self.dtype.int_max()),
        }
    }

    /// `op(acc, value)` as an expression.
    pub fn apply(&self, acc: Expr, value: Expr) -> Expr {
        match self.kind {
            ReductionKind::Sum => Expr::Sum(vec![acc, value]),
            ReductionKind::Product => Expr::Product(vec![acc, value]),
            ReductionKind::Max | ReductionKind::Min => Expr::Call {
                function: self.kind.name().to_string(),
                args: vec![acc, value],
            },
        }
    }
}

/// A reduction node. Inames prefixed with `@` request duplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reduction {
    pub op: ReductionOp,
    pub inames: Vec<String>,
    pub expr: Box<Expr>,
}

impl Reduction {
    /// Reduction inames with any `@` marker removed.
    pub fn untagged_inames(&self) -> impl Iterator<Item = &str> {
        self.inames.iter().map(|i| i.trim_start_matches('@'))
    }
}

/// Rewrites reduction nodes bottom-up with explicit mutable state.
///
/// `rewrite` receives each reduction after its body has been rewritten and
/// returns the replacement expression.
pub trait ReductionRewriter {
    type Error;

    fn rewrite(&mut self, reduction: Reduction) -> Result<Expr, Self::Error>;
}

// ── Expressions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Var(String),
    /// `name$tag`; costs nothing in flop estimates.
    Tagged { name: String, tag: String },
    Subscript { aggregate: String, index: Vec<Expr> },
    Sum(Vec<Expr>),
    Product(Vec<Expr>),
    Quotient(Box<Expr>, Box<Expr>),
    FloorDiv(Box<Expr>, Box<Expr>),
    Remainder(Box<Expr>, Box<Expr>),
    Power(Box<Expr>, Box<Expr>),
    Call { function: String, args: Vec<Expr> },
    Reduction(Reduction),
}

impl Expr {
    pub fn var(name: &str) -> Expr {
        Expr::Var(name.to_string())
    }

    pub fn subscript(aggregate: &str, index: Vec<Expr>) -> Expr {
        Expr::Subscript {
            aggregate: aggregate.to_string(),
            index,
        }
    }

    pub fn negate(e: Expr) -> Expr {
        match e {
            Expr::Int(n) => Expr::Int(-n),
            Expr::Float(x) => Expr::Float(-x),
            other => Expr::Product(vec![Expr::Int(-1), other]),
        }
    }

    /// `lhs + rhs`, flattening nested sums on the left.
    pub fn add(lhs: Expr, rhs: Expr) -> Expr {
        match lhs {
            Expr::Sum(mut terms) => {
                terms.push(rhs);
                Expr::Sum(terms)
            }
            other => Expr::Sum(vec![other, rhs]),
        }
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
        Expr::add(lhs, Expr::negate(rhs))
    }

    /// `lhs * rhs`, flattening nested products on the left.
    pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
        match lhs {
            Expr::Product(mut factors) => {
                factors.push(rhs);
                Expr::Product(factors)
            }
            other => Expr::Product(vec![other, rhs]),
        }
    }

    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Int(_) | Expr::Float(_) | Expr::Var(_) | Expr::Tagged { .. } => Vec::new(),
            Expr::Subscript { index, .. } => index.iter().collect(),
            Expr::Sum(cs) | Expr::Product(cs) => cs.iter().collect(),
            Expr::Quotient(a, b)
            | Expr::FloorDiv(a, b)
            | Expr::Remainder(a, b)
            | Expr::Power(a, b) => vec![&**a, &**b],
            Expr::Call { args, .. } => args.iter().collect(),
            Expr::Reduction(r) => vec![&*r.expr],
        }
    }

    /// Rebuild this node with each direct child replaced by `f(child)`.
    pub fn try_map_children<E>(
        &self,
        f: &mut impl FnMut(&Expr) -> Result<Expr, E>,
    ) -> Result<Expr, E> {
        Ok(match self {
            Expr::Int(_) | Expr::Float(_) | Expr::Var(_) | Expr::Tagged { .. } => self.clone(),
            Expr::Subscript { aggregate, index } => Expr::Subscript {
                aggregate: aggregate.clone(),
                index: map_all(index, f)?,
            },
            Expr::Sum(cs) => Expr::Sum(map_all(cs, f)?),
            Expr::Product(cs) => Expr::Product(map_all(cs, f)?),
            Expr::Call { function, args } => Expr::Call {
                function: function.clone(),
                args: map_all(args, f)?,
            },
            Expr::Quotient(a, b) => Expr::Quotient(map_boxed(a, f)?, map_boxed(b, f)?),
            Expr::FloorDiv(a, b) => Expr::FloorDiv(map_boxed(a, f)?, map_boxed(b, f)?),
            Expr::Remainder(a, b) => Expr::Remainder(map_boxed(a, f)?, map_boxed(b, f)?),
            Expr::Power(a, b) => Expr::Power(map_boxed(a, f)?, map_boxed(b, f)?),
            Expr::Reduction(r) => Expr::Reduction(Reduction {
                op: r.op,
                inames: r.inames.clone(),
                expr: Box::new(f(r.expr.as_ref())?),
            }),
        })
    }

    pub fn map_children(&self, f: &mut impl FnMut(&Expr) -> Expr) -> Expr {
        match self.try_map_children(&mut |e| Ok::<_, Infallible>(f(e))) {
            Ok(e) => e,
            Err(never) => match never {},
        }
    }

    /// Bottom-up rebuild: children first, then `f` on the rebuilt node.
    pub fn try_map_post<E>(&self, f: &mut impl FnMut(Expr) -> Result<Expr, E>) -> Result<Expr, E> {
        let rebuilt = self.try_map_children(&mut |c| c.try_map_post(f))?;
        f(rebuilt)
    }

    pub fn map_post(&self, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
        match self.try_map_post(&mut |e| Ok::<_, Infallible>(f(e))) {
            Ok(e) => e,
            Err(never) => match never {},
        }
    }

    /// Pre-order traversal.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        for c in self.children() {
            c.visit(f);
        }
    }

    pub fn rewrite_reductions<R: ReductionRewriter>(&self, rw: &mut R) -> Result<Expr, R::Error> {
        self.try_map_post(&mut |e| match e {
            Expr::Reduction(r) => rw.rewrite(r),
            other => Ok(other),
        })
    }

    pub fn contains_reduction(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(e, Expr::Reduction(_)) {
                found = true;
            }
        });
        found
    }

    /// Free variable names, including subscripted aggregates. Reduction
    /// inames are bound inside their reduction and are not free.
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_dependencies(&mut out);
        out
    }

    fn collect_dependencies(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Var(name) | Expr::Tagged { name, .. } => {
                out.insert(name.clone());
            }
            Expr::Subscript { aggregate, index } => {
                out.insert(aggregate.clone());
                for i in index {
                    i.collect_dependencies(out);
                }
            }
            Expr::Reduction(r) => {
                let mut inner = BTreeSet::new();
                r.expr.collect_dependencies(&mut inner);
                for iname in r.untagged_inames() {
                    inner.remove(iname);
                }
                out.extend(inner);
            }
            other => {
                for c in other.children() {
                    c.collect_dependencies(out);
                }
            }
        }
    }

    /// All subscript accesses as `(aggregate, index)`, outermost first.
    pub fn array_accesses(&self) -> Vec<(&str, &[Expr])> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Subscript { aggregate, index } = e {
                out.push((aggregate.as_str(), index.as_slice()));
            }
        });
        out
    }

    /// Replace free variables. Reduction inames shadow the map.
    pub fn substitute(&self, map: &BTreeMap<String, Expr>) -> Expr {
        match self {
            Expr::Var(name) => map.get(name).cloned().unwrap_or_else(|| self.clone()),
            Expr::Reduction(r) => {
                let mut inner_map = map.clone();
                for iname in r.untagged_inames() {
                    inner_map.remove(iname);
                }
                Expr::Reduction(Reduction {
                    op: r.op,
                    inames: r.inames.clone(),
                    expr: Box::new(r.expr.substitute(&inner_map)),
                })
            }
            other => other.map_children(&mut |c| c.substitute(map)),
        }
    }

    /// The expression as an affine form, if it is one.
    pub fn to_affine(&self) -> Option<AffineExpr> {
        match self {
            Expr::Int(n) => Some(AffineExpr::constant(*n)),
            Expr::Var(name) => Some(AffineExpr::var(name)),
            Expr::Sum(terms) => {
                let mut acc = AffineExpr::constant(0);
                for t in terms {
                    acc = &acc + &t.to_affine()?;
                }
                Some(acc)
            }
            Expr::Product(factors) => {
                let mut acc = AffineExpr::constant(1);
                for f in factors {
                    let f = f.to_affine()?;
                    acc = if acc.is_constant() {
                        f.scale(acc.constant)
                    } else if f.is_constant() {
                        acc.scale(f.constant)
                    } else {
                        return None;
                    };
                }
                Some(acc)
            }
            _ => None,
        }
    }

    /// Integer value under `env`, if every leaf is known and integral.
    pub fn eval_int(&self, env: &HashMap<String, i64>) -> Option<i64> {
        match self {
            Expr::Int(n) => Some(*n),
            Expr::Var(name) => env.get(name).copied(),
            Expr::Sum(terms) => terms.iter().try_fold(0i64, |acc, t| acc.checked_add(t.eval_int(env)?)),
            Expr::Product(fs) => fs.iter().try_fold(1i64, |acc, f| acc.checked_mul(f.eval_int(env)?)),
            Expr::FloorDiv(a, b) => {
                let d = b.eval_int(env)?;
                (d != 0).then_some(())?;
                Some(a.eval_int(env)?.div_euclid(d))
            }
            Expr::Remainder(a, b) => {
                let d = b.eval_int(env)?;
                (d != 0).then_some(())?;
                Some(a.eval_int(env)?.rem_euclid(d))
            }
            Expr::Quotient(a, b) => {
                let (n, d) = (a.eval_int(env)?, b.eval_int(env)?);
                (d != 0 && n % d == 0).then(|| n / d)
            }
            Expr::Power(a, b) => {
                let e = u32::try_from(b.eval_int(env)?).ok()?;
                a.eval_int(env)?.checked_pow(e)
            }
            _ => None,
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Sum(_) => 1,
            Expr::Product(fs) if is_negation(fs) => 3,
            Expr::Product(_) | Expr::Quotient(..) | Expr::FloorDiv(..) | Expr::Remainder(..) => 2,
            Expr::Int(n) if *n < 0 => 3,
            Expr::Float(x) if *x < 0.0 => 3,
            Expr::Power(..) => 4,
            _ => 5,
        }
    }
}

fn map_boxed<E>(
    item: &Expr,
    f: &mut impl FnMut(&Expr) -> Result<Expr, E>,
) -> Result<Box<Expr>, E> {
    Ok(Box::new(f(item)?))
}

fn map_all<E>(
    items: &[Expr],
    f: &mut impl FnMut(&Expr) -> Result<Expr, E>,
) -> Result<Vec<Expr>, E> {
    items.iter().map(|e| f(e)).collect()
}

fn is_negation(factors: &[Expr]) -> bool {
    factors.len() == 2 && factors[0] == Expr::Int(-1)
}

struct Prec<'a>(&'a Expr, u8);

impl fmt::Display for Prec<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.precedence() < self.1 {
            write!(f, "({})", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, e) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", e)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(n) => write!(f, "{}", n),
            Expr::Float(x) => write!(f, "{:?}", x),
            Expr::Var(name) => write!(f, "{}", name),
            Expr::Tagged { name, tag } => write!(f, "{}${}", name, tag),
            Expr::Subscript { aggregate, index } => {
                write!(f, "{}[", aggregate)?;
                join(f, index)?;
                write!(f, "]")
            }
            Expr::Sum(terms) => {
                for (i, t) in terms.iter().enumerate() {
                    if i == 0 {
                        write!(f, "{}", Prec(t, 1))?;
                        continue;
                    }
                    match t {
                        Expr::Product(fs) if is_negation(fs) => {
                            write!(f, " - {}", Prec(&fs[1], 2))?
                        }
                        Expr::Int(n) if *n < 0 => write!(f, " - {}", -n)?,
                        _ => write!(f, " + {}", Prec(t, 2))?,
                    }
                }
                Ok(())
            }
            Expr::Product(fs) if is_negation(fs) => write!(f, "-{}", Prec(&fs[1], 3)),
            Expr::Product(fs) => {
                for (i, x) in fs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "*")?;
                    }
                    write!(f, "{}", Prec(x, 2))?;
                }
                Ok(())
            }
            Expr::Quotient(a, b) => write!(f, "{} / {}", Prec(a, 2), Prec(b, 3)),
            Expr::FloorDiv(a, b) => write!(f, "{} // {}", Prec(a, 2), Prec(b, 3)),
            Expr::Remainder(a, b) => write!(f, "{} % {}", Prec(a, 2), Prec(b, 3)),
            Expr::Power(a, b) => write!(f, "{}**{}", Prec(a, 5), Prec(b, 5)),
            Expr::Call { function, args } => {
                write!(f, "{}(", function)?;
                join(f, args)?;
                write!(f, ")")
            }
            Expr::Reduction(r) => {
                write!(f, "{}(", r.op.kind.name())?;
                if r.inames.len() == 1 {
                    write!(f, "{}", r.inames[0])?;
                } else {
                    write!(f, "({})", r.inames.join(", "))?;
                }
                write!(f, ", {})", r.expr)
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
