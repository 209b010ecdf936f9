// poly.rs — Rational quasi-polynomials over kernel parameters
//
// Closed-form counts (domain cardinalities, flop estimates) are polynomials
// in the kernel's size parameters with rational coefficients. This module
// provides exact rational arithmetic, polynomial arithmetic, evaluation under
// concrete parameter values, and definite summation over an integer range
// (Faulhaber's formula), which is what turns a domain into a count.
//
// Preconditions: none.
// Postconditions: all values are kept in canonical form (reduced rationals,
//   no zero terms), so structural equality is semantic equality.
// Failure modes: evaluation with a missing parameter returns an error.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

// ── Rational ────────────────────────────────────────────────────────────────

/// Exact rational number. Invariant: `den > 0` and `gcd(num, den) == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    num: i128,
    den: i128,
}

fn gcd(a: i128, b: i128) -> i128 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl Rational {
    pub const ZERO: Rational = Rational { num: 0, den: 1 };
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    /// Build `num / den`. Panics on a zero denominator, which is a logic error.
    pub fn new(num: i128, den: i128) -> Self {
        assert!(den != 0, "rational with zero denominator");
        let g = gcd(num, den).max(1);
        let sign = if den < 0 { -1 } else { 1 };
        Rational {
            num: sign * num / g,
            den: sign * den / g,
        }
    }

    pub fn integer(n: i64) -> Self {
        Rational {
            num: n as i128,
            den: 1,
        }
    }

    pub fn numer(&self) -> i128 {
        self.num
    }

    pub fn denom(&self) -> i128 {
        self.den
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn is_integer(&self) -> bool {
        self.den == 1
    }

    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// The value as an `i64`, if it is an integer in range.
    pub fn to_i64(&self) -> Option<i64> {
        if self.den == 1 {
            i64::try_from(self.num).ok()
        } else {
            None
        }
    }
}

impl Add for Rational {
    type Output = Rational;
    fn add(self, rhs: Rational) -> Rational {
        Rational::new(self.num * rhs.den + rhs.num * self.den, self.den * rhs.den)
    }
}

impl Sub for Rational {
    type Output = Rational;
    fn sub(self, rhs: Rational) -> Rational {
        self + (-rhs)
    }
}

impl Mul for Rational {
    type Output = Rational;
    fn mul(self, rhs: Rational) -> Rational {
        Rational::new(self.num * rhs.num, self.den * rhs.den)
    }
}

impl Div for Rational {
    type Output = Rational;
    fn div(self, rhs: Rational) -> Rational {
        Rational::new(self.num * rhs.den, self.den * rhs.num)
    }
}

impl Neg for Rational {
    type Output = Rational;
    fn neg(self) -> Rational {
        Rational {
            num: -self.num,
            den: self.den,
        }
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rational {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.num * other.den).cmp(&(other.num * self.den))
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

// ── Polynomial ──────────────────────────────────────────────────────────────

/// A monomial: variable name → exponent (exponents are always ≥ 1).
pub type Monomial = BTreeMap<String, u32>;

/// Multivariate polynomial with rational coefficients.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QPolynomial {
    terms: BTreeMap<Monomial, Rational>,
}

/// Error evaluating a polynomial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingParameter(pub String);

impl fmt::Display for MissingParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no value given for parameter '{}'", self.0)
    }
}

impl std::error::Error for MissingParameter {}

impl QPolynomial {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn constant(value: Rational) -> Self {
        let mut p = Self::zero();
        p.add_term(Monomial::new(), value);
        p
    }

    pub fn integer(value: i64) -> Self {
        Self::constant(Rational::integer(value))
    }

    pub fn var(name: &str) -> Self {
        let mut mono = Monomial::new();
        mono.insert(name.to_string(), 1);
        let mut p = Self::zero();
        p.add_term(mono, Rational::ONE);
        p
    }

    fn add_term(&mut self, mono: Monomial, coeff: Rational) {
        if coeff.is_zero() {
            return;
        }
        let entry = self.terms.entry(mono).or_insert(Rational::ZERO);
        *entry = *entry + coeff;
        if entry.is_zero() {
            self.terms.retain(|_, c| !c.is_zero());
        }
    }

    pub fn is_zero(&self) -> bool {
        self.terms.is_empty()
    }

    /// The value if the polynomial has no variables.
    pub fn as_constant(&self) -> Option<Rational> {
        match self.terms.len() {
            0 => Some(Rational::ZERO),
            1 => self.terms.get(&Monomial::new()).copied(),
            _ => None,
        }
    }

    /// All variables appearing with a nonzero coefficient.
    pub fn variables(&self) -> BTreeSet<String> {
        self.terms
            .keys()
            .flat_map(|m| m.keys().cloned())
            .collect()
    }

    pub fn scale(&self, factor: Rational) -> Self {
        let mut out = Self::zero();
        for (mono, c) in &self.terms {
            out.add_term(mono.clone(), *c * factor);
        }
        out
    }

    pub fn pow(&self, exp: u32) -> Self {
        let mut out = Self::integer(1);
        for _ in 0..exp {
            out = &out * self;
        }
        out
    }

    /// Split into coefficients by powers of `var`: `self = Σ_k result[k] * var^k`.
    pub fn coefficients_in(&self, var: &str) -> Vec<QPolynomial> {
        let mut out: Vec<QPolynomial> = Vec::new();
        for (mono, c) in &self.terms {
            let k = mono.get(var).copied().unwrap_or(0) as usize;
            if out.len() <= k {
                out.resize(k + 1, QPolynomial::zero());
            }
            let mut rest = mono.clone();
            rest.remove(var);
            out[k].add_term(rest, *c);
        }
        out
    }

    /// Replace every occurrence of `var` with `value`.
    pub fn substitute(&self, var: &str, value: &QPolynomial) -> Self {
        let mut out = Self::zero();
        for (k, coeff) in self.coefficients_in(var).iter().enumerate() {
            out = &out + &(coeff * &value.pow(k as u32));
        }
        out
    }

    /// Evaluate under concrete integer parameter values.
    pub fn eval(&self, params: &HashMap<String, i64>) -> Result<Rational, MissingParameter> {
        let mut total = Rational::ZERO;
        for (mono, c) in &self.terms {
            let mut term = *c;
            for (name, exp) in mono {
                let v = params
                    .get(name)
                    .ok_or_else(|| MissingParameter(name.clone()))?;
                for _ in 0..*exp {
                    term = term * Rational::integer(*v);
                }
            }
            total = total + term;
        }
        Ok(total)
    }

    /// Definite sum `Σ_{var = lower}^{upper} self`.
    ///
    /// `lower` and `upper` may depend on other variables but not on `var`.
    /// The identity holds for all integer bounds; an empty range (upper =
    /// lower - 1) sums to zero.
    pub fn sum_over(&self, var: &str, lower: &QPolynomial, upper: &QPolynomial) -> Self {
        let below = lower - &QPolynomial::integer(1);
        let mut out = Self::zero();
        for (k, coeff) in self.coefficients_in(var).iter().enumerate() {
            if coeff.is_zero() {
                continue;
            }
            let k = k as u32;
            let range = &power_sum(k, upper) - &power_sum(k, &below);
            out = &out + &(coeff * &range);
        }
        out
    }
}

/// Bernoulli numbers B⁺_0..=B⁺_n (convention B⁺_1 = +1/2).
fn bernoulli_plus(n: usize) -> Vec<Rational> {
    let mut b = vec![Rational::ZERO; n + 1];
    b[0] = Rational::ONE;
    for m in 1..=n {
        let mut acc = Rational::ZERO;
        for (j, bj) in b.iter().enumerate().take(m) {
            acc = acc + Rational::integer(binomial(m as u32 + 1, j as u32)) * *bj;
        }
        b[m] = -acc / Rational::integer(m as i64 + 1);
    }
    if n >= 1 {
        b[1] = Rational::new(1, 2);
    }
    b
}

fn binomial(n: u32, k: u32) -> i64 {
    let mut r: i64 = 1;
    for i in 0..k as i64 {
        r = r * (n as i64 - i) / (i + 1);
    }
    r
}

/// `Σ_{x=0}^{n} x^k` as a polynomial in the polynomial `n` (Faulhaber).
fn power_sum(k: u32, n: &QPolynomial) -> QPolynomial {
    let b = bernoulli_plus(k as usize);
    let mut out = QPolynomial::zero();
    for (j, bj) in b.iter().enumerate() {
        let c = Rational::integer(binomial(k + 1, j as u32)) * *bj;
        if c.is_zero() {
            continue;
        }
        out = &out + &n.pow(k + 1 - j as u32).scale(c);
    }
    out = out.scale(Rational::new(1, k as i128 + 1));
    if k == 0 {
        // x = 0 contributes 0^0 = 1.
        out = &out + &QPolynomial::integer(1);
    }
    out
}

impl Add<&QPolynomial> for &QPolynomial {
    type Output = QPolynomial;
    fn add(self, rhs: &QPolynomial) -> QPolynomial {
        let mut out = self.clone();
        for (mono, c) in &rhs.terms {
            out.add_term(mono.clone(), *c);
        }
        out
    }
}

impl Sub<&QPolynomial> for &QPolynomial {
    type Output = QPolynomial;
    fn sub(self, rhs: &QPolynomial) -> QPolynomial {
        self + &rhs.scale(-Rational::ONE)
    }
}

impl Mul<&QPolynomial> for &QPolynomial {
    type Output = QPolynomial;
    fn mul(self, rhs: &QPolynomial) -> QPolynomial {
        let mut out = QPolynomial::zero();
        for (m1, c1) in &self.terms {
            for (m2, c2) in &rhs.terms {
                let mut mono = m1.clone();
                for (name, exp) in m2 {
                    *mono.entry(name.clone()).or_insert(0) += exp;
                }
                out.add_term(mono, *c1 * *c2);
            }
        }
        out
    }
}

impl Add for QPolynomial {
    type Output = QPolynomial;
    fn add(self, rhs: QPolynomial) -> QPolynomial {
        &self + &rhs
    }
}

impl Mul for QPolynomial {
    type Output = QPolynomial;
    fn mul(self, rhs: QPolynomial) -> QPolynomial {
        &self * &rhs
    }
}

impl fmt::Display for QPolynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "0");
        }
        // Highest-degree terms first; the constant term last.
        let mut terms: Vec<(&Monomial, &Rational)> = self.terms.iter().collect();
        terms.sort_by(|(a, _), (b, _)| {
            let da: u32 = a.values().sum();
            let db: u32 = b.values().sum();
            db.cmp(&da).then_with(|| a.cmp(b))
        });
        for (i, (mono, c)) in terms.into_iter().enumerate() {
            let negative = *c < Rational::ZERO;
            let mag = if negative { -*c } else { *c };
            if i == 0 {
                if negative {
                    write!(f, "-")?;
                }
            } else if negative {
                write!(f, " - ")?;
            } else {
                write!(f, " + ")?;
            }
            let factors: Vec<String> = mono
                .iter()
                .map(|(name, exp)| {
                    if *exp == 1 {
                        name.clone()
                    } else {
                        format!("{}^{}", name, exp)
                    }
                })
                .collect();
            if factors.is_empty() {
                write!(f, "{}", mag)?;
            } else if mag == Rational::ONE {
                write!(f, "{}", factors.join("*"))?;
            } else {
                write!(f, "{}*{}", mag, factors.join("*"))?;
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
