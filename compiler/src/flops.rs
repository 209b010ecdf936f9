// flops.rs — Flop estimator
//
// Counts arithmetic operations per instruction and weights them by the
// number of points in the instruction's iteration domain, producing a
// polynomial in the kernel's size parameters.
//
// Preconditions: reductions should already be realized.
// Postconditions: none.
// Failure modes: E0704 when an instruction's domain cannot be counted;
//   E0704 when evaluation lacks a parameter value.
// Side effects: W0704 for each leftover reduction node.

use std::collections::HashMap;

use crate::diag::{codes, Diagnostic, Subject};
use crate::expr::Expr;
use crate::kernel::Kernel;
use crate::poly::{QPolynomial, Rational};

/// Per-expression operation counter.
struct FlopCounter<'a> {
    insn_id: &'a str,
    diagnostics: Vec<Diagnostic>,
}

impl FlopCounter<'_> {
    fn count(&mut self, expr: &Expr) -> u64 {
        match expr {
            Expr::Int(_) | Expr::Float(_) | Expr::Var(_) | Expr::Tagged { .. } => 0,
            Expr::Subscript { index, .. } => index.iter().map(|i| self.count(i)).sum(),
            Expr::Sum(terms) | Expr::Product(terms) => {
                let nested: u64 = terms.iter().map(|t| self.count(t)).sum();
                terms.len().saturating_sub(1) as u64 + nested
            }
            Expr::Quotient(a, b)
            | Expr::FloorDiv(a, b)
            | Expr::Remainder(a, b)
            | Expr::Power(a, b) => 1 + self.count(a) + self.count(b),
            Expr::Call { args, .. } => args.iter().map(|a| self.count(a)).sum(),
            Expr::Reduction(_) => {
                self.diagnostics.push(
                    Diagnostic::warning(
                        codes::W0704,
                        Subject::Insn(self.insn_id.to_string()),
                        "flop count of an unrealized reduction is taken as zero",
                    )
                    .with_hint("realize reductions before estimating flops"),
                );
                0
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlopResult {
    pub polynomial: QPolynomial,
    pub diagnostics: Vec<Diagnostic>,
}

impl FlopResult {
    pub fn eval(&self, params: &HashMap<String, i64>) -> Result<Rational, Diagnostic> {
        self.polynomial.eval(params).map_err(|e| {
            Diagnostic::error(codes::E0704, Subject::Kernel, e.to_string())
                .with_hint("provide a value for every size parameter")
        })
    }
}

/// Total flops of `kernel` as a polynomial in its parameters.
pub fn kernel_flop_poly(kernel: &Kernel) -> Result<FlopResult, Diagnostic> {
    let mut polynomial = QPolynomial::zero();
    let mut diagnostics = Vec::new();

    for insn in &kernel.instructions {
        let mut counter = FlopCounter {
            insn_id: &insn.id,
            diagnostics: Vec::new(),
        };
        let flops = counter.count(&insn.expression);
        diagnostics.append(&mut counter.diagnostics);
        if flops == 0 {
            continue;
        }

        let inames = kernel.insn_inames(insn);
        let points = kernel
            .domain
            .eliminate_except(&inames)
            .cardinality()
            .map_err(|e| {
                Diagnostic::error(
                    codes::E0704,
                    Subject::Insn(insn.id.clone()),
                    format!("cannot count the iteration domain: {}", e),
                )
            })?;
        let flops = i64::try_from(flops).unwrap_or(i64::MAX);
        polynomial = polynomial + points.scale(Rational::integer(flops));
    }

    Ok(FlopResult {
        polynomial,
        diagnostics,
    })
}

/// Flops of `kernel` for concrete parameter values.
pub fn kernel_flop_count(kernel: &Kernel, params: &HashMap<String, i64>) -> Result<Rational, Diagnostic> {
    let result = kernel_flop_poly(kernel)?;
    for d in &result.diagnostics {
        tracing::warn!("{}", d);
    }
    result.eval(params)
}

// ── Tests ───────────────────────────────────────────────────────────────────
