// domain.rs — Affine integer sets (iteration domains)
//
// A kernel's iteration space is a conjunction of affine constraints over its
// loop indices ("set dimensions") and size parameters. This module carries the
// operations the preprocessing passes consume: axis duplication, dimension
// substitution (splitting), Fourier–Motzkin projection, emptiness, gist,
// redundancy removal, integer bounds, static trip counts, symbolic
// cardinality, and point enumeration under concrete parameter values.
//
// Preconditions: constraints are affine with integer coefficients.
// Postconditions: every stored constraint is normalized (content divided
//   out, inequalities tightened to their integer hull along the constant).
// Failure modes: unbounded or non-countable dimensions produce `DomainError`.
// Side effects: none.
//
// Projection and emptiness use the rational relaxation (with integer
// tightening of each derived constraint), which is exact for the unimodular
// boxes and triangles kernels are written with.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::{Add, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::poly::{QPolynomial, Rational};

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    UnknownDim(String),
    DuplicateDim(String),
    /// No lower or no upper bound exists for the dimension.
    Unbounded(String),
    /// The dimension's extent depends on a parameter where a constant is required.
    NonConstantBound(String),
    /// A bound has a non-unit coefficient on the dimension and a symbolic remainder.
    NonUnitCoefficient(String),
    /// Several incomparable bounds; the count would be piecewise.
    NotCountable(String),
    MissingParameter(String),
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainError::UnknownDim(d) => write!(f, "unknown dimension '{}'", d),
            DomainError::DuplicateDim(d) => write!(f, "dimension '{}' already exists", d),
            DomainError::Unbounded(d) => write!(f, "dimension '{}' is unbounded", d),
            DomainError::NonConstantBound(d) => {
                write!(f, "extent of '{}' is not a compile-time constant", d)
            }
            DomainError::NonUnitCoefficient(d) => {
                write!(f, "bound on '{}' has a non-unit coefficient", d)
            }
            DomainError::NotCountable(d) => {
                write!(f, "bounds on '{}' are piecewise; cannot count points", d)
            }
            DomainError::MissingParameter(p) => write!(f, "no value given for parameter '{}'", p),
        }
    }
}

impl std::error::Error for DomainError {}

// ── Affine expressions ──────────────────────────────────────────────────────

/// `Σ coeffs[v] * v + constant`. Zero coefficients are never stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AffineExpr {
    pub coeffs: BTreeMap<String, i64>,
    pub constant: i64,
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn div_ceil(a: i64, b: i64) -> i64 {
    -((-a).div_euclid(b))
}

impl AffineExpr {
    pub fn constant(c: i64) -> Self {
        AffineExpr {
            coeffs: BTreeMap::new(),
            constant: c,
        }
    }

    pub fn var(name: &str) -> Self {
        Self::term(name, 1)
    }

    pub fn term(name: &str, coeff: i64) -> Self {
        let mut coeffs = BTreeMap::new();
        if coeff != 0 {
            coeffs.insert(name.to_string(), coeff);
        }
        AffineExpr {
            coeffs,
            constant: 0,
        }
    }

    pub fn coeff(&self, name: &str) -> i64 {
        self.coeffs.get(name).copied().unwrap_or(0)
    }

    pub fn is_constant(&self) -> bool {
        self.coeffs.is_empty()
    }

    pub fn variables(&self) -> impl Iterator<Item = &String> {
        self.coeffs.keys()
    }

    pub fn scale(&self, k: i64) -> Self {
        if k == 0 {
            return AffineExpr::constant(0);
        }
        AffineExpr {
            coeffs: self.coeffs.iter().map(|(v, c)| (v.clone(), c * k)).collect(),
            constant: self.constant * k,
        }
    }

    /// The expression with the `name` term dropped.
    pub fn without(&self, name: &str) -> Self {
        let mut out = self.clone();
        out.coeffs.remove(name);
        out
    }

    /// Replace `name` by `value`.
    pub fn substitute(&self, name: &str, value: &AffineExpr) -> Self {
        let c = self.coeff(name);
        if c == 0 {
            return self.clone();
        }
        &self.without(name) + &value.scale(c)
    }

    pub fn rename(&self, old: &str, new: &str) -> Self {
        self.substitute(old, &AffineExpr::var(new))
    }

    /// Evaluate with every variable bound by `lookup`.
    pub fn eval(&self, lookup: impl Fn(&str) -> Option<i64>) -> Option<i64> {
        let mut total = self.constant;
        for (v, c) in &self.coeffs {
            total += c * lookup(v)?;
        }
        Some(total)
    }

    pub fn to_qpoly(&self) -> QPolynomial {
        let mut p = QPolynomial::integer(self.constant);
        for (v, c) in &self.coeffs {
            p = &p + &QPolynomial::var(v).scale(Rational::integer(*c));
        }
        p
    }

    fn content(&self) -> i64 {
        self.coeffs.values().fold(0, |g, c| gcd(g, *c))
    }
}

impl Add<&AffineExpr> for &AffineExpr {
    type Output = AffineExpr;
    fn add(self, rhs: &AffineExpr) -> AffineExpr {
        let mut out = self.clone();
        for (v, c) in &rhs.coeffs {
            let e = out.coeffs.entry(v.clone()).or_insert(0);
            *e += c;
            if *e == 0 {
                out.coeffs.remove(v);
            }
        }
        out.constant += rhs.constant;
        out
    }
}

impl Sub<&AffineExpr> for &AffineExpr {
    type Output = AffineExpr;
    fn sub(self, rhs: &AffineExpr) -> AffineExpr {
        self + &rhs.scale(-1)
    }
}

impl Neg for &AffineExpr {
    type Output = AffineExpr;
    fn neg(self) -> AffineExpr {
        self.scale(-1)
    }
}

impl fmt::Display for AffineExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (v, c) in &self.coeffs {
            let mag = c.abs();
            if first {
                if *c < 0 {
                    write!(f, "-")?;
                }
            } else if *c < 0 {
                write!(f, " - ")?;
            } else {
                write!(f, " + ")?;
            }
            if mag == 1 {
                write!(f, "{}", v)?;
            } else {
                write!(f, "{}*{}", mag, v)?;
            }
            first = false;
        }
        if first {
            write!(f, "{}", self.constant)
        } else if self.constant > 0 {
            write!(f, " + {}", self.constant)
        } else if self.constant < 0 {
            write!(f, " - {}", -self.constant)
        } else {
            Ok(())
        }
    }
}

// ── Constraints ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// `expr >= 0`
    Inequality,
    /// `expr = 0`
    Equality,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub expr: AffineExpr,
}

impl Constraint {
    pub fn ge_zero(expr: AffineExpr) -> Self {
        Constraint {
            kind: ConstraintKind::Inequality,
            expr,
        }
        .normalized()
    }

    pub fn eq_zero(expr: AffineExpr) -> Self {
        Constraint {
            kind: ConstraintKind::Equality,
            expr,
        }
        .normalized()
    }

    /// `lhs >= rhs`
    pub fn ge(lhs: &AffineExpr, rhs: &AffineExpr) -> Self {
        Self::ge_zero(lhs - rhs)
    }

    /// `lhs <= rhs`
    pub fn le(lhs: &AffineExpr, rhs: &AffineExpr) -> Self {
        Self::ge_zero(rhs - lhs)
    }

    /// `lhs < rhs`, i.e. `rhs - lhs - 1 >= 0` over the integers.
    pub fn lt(lhs: &AffineExpr, rhs: &AffineExpr) -> Self {
        Self::ge_zero(&(rhs - lhs) - &AffineExpr::constant(1))
    }

    /// `lhs > rhs`
    pub fn gt(lhs: &AffineExpr, rhs: &AffineExpr) -> Self {
        Self::lt(rhs, lhs)
    }

    /// `lhs = rhs`
    pub fn equals(lhs: &AffineExpr, rhs: &AffineExpr) -> Self {
        Self::eq_zero(lhs - rhs)
    }

    pub fn involves(&self, name: &str) -> bool {
        self.expr.coeff(name) != 0
    }

    fn normalized(mut self) -> Self {
        let g = self.expr.content();
        match self.kind {
            ConstraintKind::Inequality => {
                if g > 1 {
                    for c in self.expr.coeffs.values_mut() {
                        *c /= g;
                    }
                    self.expr.constant = self.expr.constant.div_euclid(g);
                }
            }
            ConstraintKind::Equality => {
                if g > 1 && self.expr.constant % g == 0 {
                    for c in self.expr.coeffs.values_mut() {
                        *c /= g;
                    }
                    self.expr.constant /= g;
                }
                if self.expr.coeffs.values().next().is_some_and(|c| *c < 0) {
                    self.expr = -&self.expr;
                }
            }
        }
        self
    }

    pub fn is_tautology(&self) -> bool {
        if !self.expr.is_constant() {
            return false;
        }
        match self.kind {
            ConstraintKind::Inequality => self.expr.constant >= 0,
            ConstraintKind::Equality => self.expr.constant == 0,
        }
    }

    pub fn is_contradiction(&self) -> bool {
        match self.kind {
            ConstraintKind::Inequality => self.expr.is_constant() && self.expr.constant < 0,
            ConstraintKind::Equality => {
                let g = self.expr.content();
                if self.expr.is_constant() {
                    self.expr.constant != 0
                } else {
                    self.expr.constant % g != 0
                }
            }
        }
    }

    /// Constraints whose union is the integer complement of `self`.
    pub fn negations(&self) -> Vec<Constraint> {
        let one = AffineExpr::constant(1);
        match self.kind {
            ConstraintKind::Inequality => vec![Constraint::ge_zero(&(-&self.expr) - &one)],
            ConstraintKind::Equality => vec![
                Constraint::ge_zero(&self.expr - &one),
                Constraint::ge_zero(&(-&self.expr) - &one),
            ],
        }
    }

    pub fn is_satisfied(&self, lookup: impl Fn(&str) -> Option<i64>) -> Option<bool> {
        let v = self.expr.eval(lookup)?;
        Some(match self.kind {
            ConstraintKind::Inequality => v >= 0,
            ConstraintKind::Equality => v == 0,
        })
    }

    fn substitute(&self, name: &str, value: &AffineExpr) -> Constraint {
        Constraint {
            kind: self.kind,
            expr: self.expr.substitute(name, value),
        }
        .normalized()
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConstraintKind::Inequality => write!(f, "{} >= 0", self.expr),
            ConstraintKind::Equality => write!(f, "{} = 0", self.expr),
        }
    }
}

// ── Fourier–Motzkin ─────────────────────────────────────────────────────────

fn push_unique(out: &mut Vec<Constraint>, c: Constraint) {
    if c.is_tautology() || out.contains(&c) {
        return;
    }
    out.push(c);
}

/// Eliminate `v` from a constraint conjunction.
fn eliminate_var(constraints: &[Constraint], v: &str) -> Vec<Constraint> {
    let mut out = Vec::new();

    if let Some(pos) = constraints
        .iter()
        .position(|c| c.kind == ConstraintKind::Equality && c.involves(v))
    {
        let eq = &constraints[pos];
        let (eq_expr, a) = if eq.expr.coeff(v) < 0 {
            (-&eq.expr, -eq.expr.coeff(v))
        } else {
            (eq.expr.clone(), eq.expr.coeff(v))
        };
        for (i, c) in constraints.iter().enumerate() {
            if i == pos {
                continue;
            }
            let b = c.expr.coeff(v);
            if b == 0 {
                push_unique(&mut out, c.clone());
                continue;
            }
            let expr = &c.expr.scale(a) - &eq_expr.scale(b);
            let derived = Constraint { kind: c.kind, expr }.normalized();
            push_unique(&mut out, derived);
        }
        return out;
    }

    let mut lowers = Vec::new();
    let mut uppers = Vec::new();
    for c in constraints {
        let a = c.expr.coeff(v);
        if a > 0 {
            lowers.push(c);
        } else if a < 0 {
            uppers.push(c);
        } else {
            push_unique(&mut out, c.clone());
        }
    }
    for l in &lowers {
        let a = l.expr.coeff(v);
        for u in &uppers {
            let b = -u.expr.coeff(v);
            let expr = &l.expr.scale(b) + &u.expr.scale(a);
            push_unique(&mut out, Constraint::ge_zero(expr));
        }
    }
    out
}

// ── Bounds ──────────────────────────────────────────────────────────────────

/// Integer bounds on one dimension, each affine in the remaining variables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DimBounds {
    pub lower: Vec<AffineExpr>,
    pub upper: Vec<AffineExpr>,
}

// ── Basic sets ──────────────────────────────────────────────────────────────

/// A conjunction of affine constraints over named set dimensions.
///
/// Variables that appear in constraints but are not set dimensions are
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BasicSet {
    pub dims: Vec<String>,
    pub constraints: Vec<Constraint>,
}

impl BasicSet {
    pub fn universe(dims: Vec<String>) -> Self {
        BasicSet {
            dims,
            constraints: Vec::new(),
        }
    }

    pub fn add_constraint(&mut self, c: Constraint) {
        push_unique(&mut self.constraints, c.normalized());
    }

    pub fn with_constraint(mut self, c: Constraint) -> Self {
        self.add_constraint(c);
        self
    }

    pub fn has_dim(&self, name: &str) -> bool {
        self.dims.iter().any(|d| d == name)
    }

    /// All constraint variables that are not set dimensions.
    pub fn params(&self) -> BTreeSet<String> {
        self.constraints
            .iter()
            .flat_map(|c| c.expr.variables().cloned())
            .filter(|v| !self.has_dim(v))
            .collect()
    }

    pub fn add_dim(&self, name: &str) -> Result<BasicSet, DomainError> {
        if self.has_dim(name) {
            return Err(DomainError::DuplicateDim(name.to_string()));
        }
        let mut out = self.clone();
        out.dims.push(name.to_string());
        Ok(out)
    }

    /// Add dimension `new` constrained exactly like `old` (same constraints,
    /// with `old` renamed to `new`).
    pub fn duplicate_axis(&self, old: &str, new: &str) -> Result<BasicSet, DomainError> {
        if !self.has_dim(old) {
            return Err(DomainError::UnknownDim(old.to_string()));
        }
        let mut out = self.add_dim(new)?;
        for c in &self.constraints {
            if c.involves(old) {
                out.add_constraint(c.substitute(old, &AffineExpr::var(new)));
            }
        }
        Ok(out)
    }

    /// Replace dimension `name` by an affine expression in other variables
    /// and drop the dimension.
    pub fn substitute_dim(&self, name: &str, value: &AffineExpr) -> Result<BasicSet, DomainError> {
        if !self.has_dim(name) {
            return Err(DomainError::UnknownDim(name.to_string()));
        }
        let mut out = BasicSet::universe(self.dims.iter().filter(|d| *d != name).cloned().collect());
        for c in &self.constraints {
            out.add_constraint(c.substitute(name, value));
        }
        Ok(out)
    }

    /// Project out the given variables (dimensions or parameters).
    pub fn eliminate(&self, vars: &[String]) -> BasicSet {
        let mut constraints = self.constraints.clone();
        for v in vars {
            constraints = eliminate_var(&constraints, v);
        }
        BasicSet {
            dims: self
                .dims
                .iter()
                .filter(|d| !vars.contains(d))
                .cloned()
                .collect(),
            constraints,
        }
    }

    /// Project out every set dimension not in `keep`. Parameters stay.
    pub fn eliminate_except(&self, keep: &BTreeSet<String>) -> BasicSet {
        let drop: Vec<String> = self
            .dims
            .iter()
            .filter(|d| !keep.contains(*d))
            .cloned()
            .collect();
        self.eliminate(&drop)
    }

    /// Intersect with `other`, aligning dimensions by name.
    pub fn intersect(&self, other: &BasicSet) -> BasicSet {
        let mut out = self.clone();
        for d in &other.dims {
            if !out.has_dim(d) {
                out.dims.push(d.clone());
            }
        }
        for c in &other.constraints {
            out.add_constraint(c.clone());
        }
        out
    }

    fn all_variables(&self) -> Vec<String> {
        let mut vars: Vec<String> = self.dims.clone();
        vars.extend(self.params());
        vars
    }

    /// True if no (rational-relaxed, integer-tightened) point satisfies the set
    /// for any parameter values.
    pub fn is_empty(&self) -> bool {
        if self.constraints.iter().any(Constraint::is_contradiction) {
            return true;
        }
        let projected = self.eliminate(&self.all_variables());
        projected.constraints.iter().any(Constraint::is_contradiction)
    }

    /// True if every point of `self` satisfies `c`.
    pub fn implies(&self, c: &Constraint) -> bool {
        c.negations().into_iter().all(|neg| {
            let mut test = self.clone();
            test.add_constraint(neg);
            test.is_empty()
        })
    }

    /// Drop the constraints that `context` already implies.
    pub fn gist(&self, context: &BasicSet) -> BasicSet {
        let aligned = context.intersect(&BasicSet::universe(self.dims.clone()));
        BasicSet {
            dims: self.dims.clone(),
            constraints: self
                .constraints
                .iter()
                .filter(|c| !aligned.implies(c))
                .cloned()
                .collect(),
        }
    }

    /// Drop constraints implied by the remaining ones.
    pub fn remove_redundancies(&self) -> BasicSet {
        let mut kept: Vec<Constraint> = self.constraints.clone();
        let mut i = 0;
        while i < kept.len() {
            let others = BasicSet {
                dims: self.dims.clone(),
                constraints: kept
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, c)| c.clone())
                    .collect(),
            };
            if others.implies(&kept[i]) {
                kept.remove(i);
            } else {
                i += 1;
            }
        }
        BasicSet {
            dims: self.dims.clone(),
            constraints: kept,
        }
    }

    /// Bounds on `name` read directly off the constraints mentioning it.
    ///
    /// Call on a projection when bounds free of other dimensions are wanted.
    pub fn dim_bounds(&self, name: &str) -> Result<DimBounds, DomainError> {
        if !self.has_dim(name) {
            return Err(DomainError::UnknownDim(name.to_string()));
        }
        let mut bounds = DimBounds::default();
        for c in &self.constraints {
            let a = c.expr.coeff(name);
            if a == 0 {
                continue;
            }
            let rest = c.expr.without(name);
            // a*x + rest (>= | =) 0
            let lower_from = |a: i64, rest: &AffineExpr| -> Result<AffineExpr, DomainError> {
                if a == 1 {
                    Ok(-rest)
                } else if rest.is_constant() {
                    Ok(AffineExpr::constant(div_ceil(-rest.constant, a)))
                } else {
                    Err(DomainError::NonUnitCoefficient(name.to_string()))
                }
            };
            let upper_from = |b: i64, rest: &AffineExpr| -> Result<AffineExpr, DomainError> {
                // -b*x + rest >= 0, b > 0
                if b == 1 {
                    Ok(rest.clone())
                } else if rest.is_constant() {
                    Ok(AffineExpr::constant(rest.constant.div_euclid(b)))
                } else {
                    Err(DomainError::NonUnitCoefficient(name.to_string()))
                }
            };
            match c.kind {
                ConstraintKind::Inequality => {
                    if a > 0 {
                        bounds.lower.push(lower_from(a, &rest)?);
                    } else {
                        bounds.upper.push(upper_from(-a, &rest)?);
                    }
                }
                ConstraintKind::Equality => {
                    let (a, rest) = if a < 0 { (-a, -&rest) } else { (a, rest) };
                    bounds.lower.push(lower_from(a, &rest)?);
                    bounds.upper.push(upper_from(a, &-&rest)?);
                }
            }
        }
        Ok(bounds)
    }

    /// Number of values `name` can take, as a compile-time constant.
    ///
    /// Every other dimension and every parameter is projected out first, so
    /// the result is the extent of the constant hull of the projection.
    pub fn static_size(&self, name: &str) -> Result<i64, DomainError> {
        if !self.has_dim(name) {
            return Err(DomainError::UnknownDim(name.to_string()));
        }
        let others: Vec<String> = self
            .all_variables()
            .into_iter()
            .filter(|v| v != name)
            .collect();
        let projected = self.eliminate(&others);
        let bounds = projected.dim_bounds(name)?;
        let lower = bounds
            .lower
            .iter()
            .filter_map(|b| b.is_constant().then_some(b.constant))
            .max();
        let upper = bounds
            .upper
            .iter()
            .filter_map(|b| b.is_constant().then_some(b.constant))
            .min();
        match (lower, upper) {
            (Some(lo), Some(hi)) => Ok((hi - lo + 1).max(0)),
            _ => Err(DomainError::NonConstantBound(name.to_string())),
        }
    }

    /// Pick the bound that dominates all others under `context`, or report
    /// a pair of bounds the context cannot order.
    fn dominant_bound(
        candidates: &[AffineExpr],
        context: &BasicSet,
        take_max: bool,
        name: &str,
    ) -> Result<Dominance, DomainError> {
        let mut unique: Vec<&AffineExpr> = Vec::new();
        for c in candidates {
            if !unique.contains(&c) {
                unique.push(c);
            }
        }
        match unique.len() {
            0 => return Err(DomainError::Unbounded(name.to_string())),
            1 => return Ok(Dominance::Bound(unique[0].clone())),
            _ => {}
        }
        // `a` is at least as tight as `b`.
        let tighter = |a: &AffineExpr, b: &AffineExpr| {
            let diff = if take_max { a - b } else { b - a };
            context.implies(&Constraint::ge_zero(diff))
        };
        for &cand in &unique {
            if unique.iter().all(|&other| tighter(cand, other)) {
                return Ok(Dominance::Bound(cand.clone()));
            }
        }
        let first = unique[0];
        let Some(other) = unique[1..].iter().copied().find(|&o| !tighter(first, o)) else {
            return Err(DomainError::NotCountable(name.to_string()));
        };
        let split = if take_max { first - other } else { other - first };
        Ok(Dominance::Incomparable(split))
    }

    /// Number of integer points as a polynomial in the parameters.
    ///
    /// Dimensions are summed innermost (last) first. Where no single bound
    /// dominates, the chamber is cut along the difference of two bounds and
    /// the pieces are counted separately. Assumes non-empty ranges for the
    /// parameter values of interest.
    pub fn cardinality(&self) -> Result<QPolynomial, DomainError> {
        count_chamber(self, &self.dims, QPolynomial::integer(1), 0)
    }

    /// All integer points for concrete parameter values, in lexicographic
    /// order of `dims`.
    pub fn enumerate_points(
        &self,
        params: &HashMap<String, i64>,
    ) -> Result<Vec<BTreeMap<String, i64>>, DomainError> {
        let mut fixed = BasicSet::universe(self.dims.clone());
        for c in &self.constraints {
            let mut c = c.clone();
            for v in c.expr.variables().cloned().collect::<Vec<_>>() {
                if self.has_dim(&v) {
                    continue;
                }
                let value = params
                    .get(&v)
                    .ok_or_else(|| DomainError::MissingParameter(v.clone()))?;
                c = c.substitute(&v, &AffineExpr::constant(*value));
            }
            fixed.add_constraint(c);
        }
        if fixed.constraints.iter().any(Constraint::is_contradiction) {
            return Ok(Vec::new());
        }

        // projections[k] constrains dims[..=k] only.
        let n = self.dims.len();
        let mut projections = vec![BasicSet::default(); n];
        let mut current = fixed.clone();
        for k in (0..n).rev() {
            projections[k] = current.clone();
            current = current.eliminate(std::slice::from_ref(&self.dims[k]));
        }

        let mut points = Vec::new();
        let mut point = BTreeMap::new();
        enumerate_level(&fixed, &projections, 0, &mut point, &mut points)?;
        Ok(points)
    }
}

/// Outcome of a bound search on one dimension.
enum Dominance {
    Bound(AffineExpr),
    /// `split >= 0` orders the two bounds one way, `split < 0` the other.
    Incomparable(AffineExpr),
}

const MAX_CHAMBER_CUTS: usize = 32;

/// Sum `count` over `dims` (innermost last) within `set`.
fn count_chamber(
    set: &BasicSet,
    dims: &[String],
    count: QPolynomial,
    cuts: usize,
) -> Result<QPolynomial, DomainError> {
    let Some((name, outer)) = dims.split_last() else {
        return Ok(count);
    };
    let bounds = set.dim_bounds(name)?;
    let context = set.eliminate(std::slice::from_ref(name));
    let split = match (
        BasicSet::dominant_bound(&bounds.lower, &context, true, name)?,
        BasicSet::dominant_bound(&bounds.upper, &context, false, name)?,
    ) {
        (Dominance::Bound(lower), Dominance::Bound(upper)) => {
            let count = count.sum_over(name, &lower.to_qpoly(), &upper.to_qpoly());
            return count_chamber(&context, outer, count, cuts);
        }
        (Dominance::Incomparable(split), _) | (_, Dominance::Incomparable(split)) => split,
    };
    // A cut over parameters alone separates parameter chambers, whose counts
    // cannot be added.
    if cuts >= MAX_CHAMBER_CUTS || !outer.iter().any(|d| split.coeff(d) != 0) {
        return Err(DomainError::NotCountable(name.clone()));
    }

    // The cut does not involve `name`, so both pieces keep its bounds and the
    // sum so far.
    let one = AffineExpr::constant(1);
    let mut total = QPolynomial::zero();
    for cut in [Constraint::ge_zero(split.clone()), Constraint::ge_zero(&(-&split) - &one)] {
        let piece = set.clone().with_constraint(cut);
        if piece.is_empty() {
            continue;
        }
        total = &total + &count_chamber(&piece, dims, count.clone(), cuts + 1)?;
    }
    Ok(total)
}

fn enumerate_level(
    full: &BasicSet,
    projections: &[BasicSet],
    level: usize,
    point: &mut BTreeMap<String, i64>,
    out: &mut Vec<BTreeMap<String, i64>>,
) -> Result<(), DomainError> {
    if level == full.dims.len() {
        let ok = full
            .constraints
            .iter()
            .all(|c| c.is_satisfied(|v| point.get(v).copied()) == Some(true));
        if ok {
            out.push(point.clone());
        }
        return Ok(());
    }
    let name = &full.dims[level];
    let mut lo: Option<i64> = None;
    let mut hi: Option<i64> = None;
    for c in &projections[level].constraints {
        let a = c.expr.coeff(name);
        if a == 0 {
            continue;
        }
        let rest = match c.expr.without(name).eval(|v| point.get(v).copied()) {
            Some(r) => r,
            None => continue,
        };
        let (l, h) = match c.kind {
            ConstraintKind::Inequality if a > 0 => (Some(div_ceil(-rest, a)), None),
            ConstraintKind::Inequality => (None, Some(rest.div_euclid(-a))),
            ConstraintKind::Equality => {
                if rest % a != 0 {
                    return Ok(());
                }
                (Some(-rest / a), Some(-rest / a))
            }
        };
        if let Some(l) = l {
            lo = Some(lo.map_or(l, |x| x.max(l)));
        }
        if let Some(h) = h {
            hi = Some(hi.map_or(h, |x| x.min(h)));
        }
    }
    let (Some(lo), Some(hi)) = (lo, hi) else {
        return Err(DomainError::Unbounded(name.clone()));
    };
    for value in lo..=hi {
        point.insert(name.clone(), value);
        enumerate_level(full, projections, level + 1, point, out)?;
    }
    point.remove(name);
    Ok(())
}

impl fmt::Display for BasicSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ [{}]", self.dims.join(", "))?;
        if !self.constraints.is_empty() {
            let cs: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
            write!(f, " : {}", cs.join(" and "))?;
        }
        write!(f, " }}")
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
