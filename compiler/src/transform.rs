// transform.rs — Iname splitting and tagging
//
// Preconditions: the named inames are dimensions of the kernel domain.
// Postconditions: split: `iname` is replaced everywhere (domain, expressions,
//   forced dependencies, tags) by `inner_length*outer + inner`, with
//   `0 <= inner < inner_length`.
// Failure modes: unknown iname (E0706), non-positive split length (E0706).
// Side effects: none; a modified copy is returned.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::{codes, Diagnostic, Subject};
use crate::domain::{AffineExpr, Constraint};
use crate::expr::{Expr, Reduction};
use crate::kernel::{IndexTag, Kernel};

fn unknown_iname(iname: &str) -> Diagnostic {
    Diagnostic::error(
        codes::E0706,
        Subject::Iname(iname.to_string()),
        "not a dimension of the kernel domain",
    )
}

fn replace_in_set(set: &mut BTreeSet<String>, iname: &str, with: &[&str]) {
    if set.remove(iname) {
        set.extend(with.iter().map(|s| s.to_string()));
    }
}

/// Split `iname` into `<iname>_outer` and `<iname>_inner`, the inner loop
/// having exactly `inner_length` iterations. Untagged halves become
/// sequential.
pub fn split_iname(
    kernel: &Kernel,
    iname: &str,
    inner_length: i64,
    outer_tag: Option<IndexTag>,
    inner_tag: Option<IndexTag>,
) -> Result<Kernel, Diagnostic> {
    if !kernel.domain.has_dim(iname) {
        return Err(unknown_iname(iname));
    }
    if inner_length <= 0 {
        return Err(Diagnostic::error(
            codes::E0706,
            Subject::Iname(iname.to_string()),
            format!("cannot split by non-positive length {}", inner_length),
        ));
    }

    let outer = kernel.make_unique_var_name(&format!("{}_outer", iname), &BTreeSet::new());
    let inner = kernel.make_unique_var_name(
        &format!("{}_inner", iname),
        &BTreeSet::from([outer.clone()]),
    );

    // ── Domain ──
    let inner_var = AffineExpr::var(&inner);
    let replacement = &AffineExpr::term(&outer, inner_length) + &inner_var;
    let mut domain = kernel
        .domain
        .add_dim(&outer)
        .and_then(|d| d.add_dim(&inner))
        .map_err(|e| {
            Diagnostic::error(codes::E0706, Subject::Iname(iname.to_string()), e.to_string())
        })?;
    domain.add_constraint(Constraint::ge(&inner_var, &AffineExpr::constant(0)));
    domain.add_constraint(Constraint::lt(&inner_var, &AffineExpr::constant(inner_length)));
    let mut domain = domain
        .substitute_dim(iname, &replacement)
        .map_err(|_| unknown_iname(iname))?;
    domain.dims = kernel
        .domain
        .dims
        .iter()
        .flat_map(|d| {
            if d == iname {
                vec![outer.clone(), inner.clone()]
            } else {
                vec![d.clone()]
            }
        })
        .collect();

    // ── Instructions ──
    let value = Expr::add(
        Expr::mul(Expr::Int(inner_length), Expr::var(&outer)),
        Expr::var(&inner),
    );
    let mut rewrite = |e: Expr| match e {
        Expr::Var(name) if name == iname => value.clone(),
        Expr::Reduction(r) => Expr::Reduction(Reduction {
            inames: r
                .inames
                .iter()
                .flat_map(|i| {
                    let marker = if i.starts_with('@') { "@" } else { "" };
                    if i.trim_start_matches('@') == iname {
                        vec![format!("{}{}", marker, outer), format!("{}{}", marker, inner)]
                    } else {
                        vec![i.clone()]
                    }
                })
                .collect(),
            ..r
        }),
        other => other,
    };
    let instructions = kernel
        .instructions
        .iter()
        .map(|insn| {
            let mut insn = insn.clone();
            insn.expression = insn.expression.map_post(&mut rewrite);
            insn.assignee = insn.assignee.map_post(&mut rewrite);
            replace_in_set(&mut insn.forced_iname_deps, iname, &[&outer, &inner]);
            if let Some(into) = insn.boostable_into.as_mut() {
                replace_in_set(into, iname, &[&outer, &inner]);
            }
            insn
        })
        .collect();

    // ── Tags ──
    let mut iname_to_tag: BTreeMap<String, IndexTag> = kernel.iname_to_tag.clone();
    iname_to_tag.remove(iname);
    iname_to_tag.insert(outer.clone(), outer_tag.unwrap_or(IndexTag::Sequential));
    iname_to_tag.insert(inner.clone(), inner_tag.unwrap_or(IndexTag::Sequential));

    tracing::trace!(
        iname,
        outer = %outer,
        inner = %inner,
        inner_length,
        "split iname"
    );

    Ok(Kernel {
        domain,
        instructions,
        iname_to_tag,
        ..kernel.clone()
    })
}

/// Set the tags of existing inames.
pub fn tag_inames(kernel: &Kernel, tags: &[(String, IndexTag)]) -> Result<Kernel, Diagnostic> {
    let mut out = kernel.clone();
    for (iname, tag) in tags {
        if !kernel.domain.has_dim(iname) {
            return Err(unknown_iname(iname));
        }
        out.iname_to_tag.insert(iname.clone(), *tag);
    }
    Ok(out)
}

// ── Tests ───────────────────────────────────────────────────────────────────
