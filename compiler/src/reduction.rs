// reduction.rs — Reduction iname duplication and realization
//
// Two passes over reduction nodes:
//   - duplication gives every `@`-marked reduction iname a fresh,
//     instruction-specific copy in the domain;
//   - realization lowers every reduction into an accumulator temporary plus
//     an init and an update instruction scheduled before the owner.
//
// Preconditions: reduction inames are domain dimensions (checked by resolve).
// Postconditions: after `realize_reduction`, no instruction contains a
//   reduction node; every reduction's value is read from its accumulator.
// Failure modes: E0703 if an ILP iname enclosing a reduction has a
//   non-constant trip count; E0700 if a reduction survives realization;
//   E0706 if a marked iname is not a domain dimension.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::{codes, Diagnostic, Subject};
use crate::domain::BasicSet;
use crate::expr::{Expr, Reduction, ReductionRewriter};
use crate::kernel::{IndexTag, Instruction, Kernel, TemporaryVariable};
use crate::pass::StageCert;

// ── Duplication ─────────────────────────────────────────────────────────────

/// Renames `@`-marked reduction inames of one instruction.
struct InameDuplicator<'k> {
    kernel: &'k Kernel,
    insn_id: &'k str,
    /// Every iname generated so far, kernel-wide.
    generated: &'k mut BTreeSet<String>,
    /// `(old, new)` pairs created for this instruction.
    created: Vec<(String, String)>,
}

impl ReductionRewriter for InameDuplicator<'_> {
    type Error = Diagnostic;

    fn rewrite(&mut self, reduction: Reduction) -> Result<Expr, Diagnostic> {
        let mut subst = BTreeMap::new();
        let mut inames = Vec::with_capacity(reduction.inames.len());
        for iname in &reduction.inames {
            let Some(base) = iname.strip_prefix('@') else {
                inames.push(iname.clone());
                continue;
            };
            let fresh = self
                .kernel
                .make_unique_var_name(&format!("{}_{}", base, self.insn_id), self.generated);
            self.generated.insert(fresh.clone());
            subst.insert(base.to_string(), Expr::var(&fresh));
            self.created.push((base.to_string(), fresh.clone()));
            inames.push(fresh);
        }
        let expr = if subst.is_empty() {
            *reduction.expr
        } else {
            reduction.expr.substitute(&subst)
        };
        Ok(Expr::Reduction(Reduction {
            op: reduction.op,
            inames,
            expr: Box::new(expr),
        }))
    }
}

/// Give every `@`-marked reduction iname a fresh copy named after the
/// owning instruction, and add a matching domain dimension for it.
pub fn duplicate_reduction_inames(kernel: &Kernel) -> Result<Kernel, Diagnostic> {
    let mut generated = BTreeSet::new();
    let mut domain: BasicSet = kernel.domain.clone();
    let mut iname_to_tag = kernel.iname_to_tag.clone();
    let mut instructions = Vec::with_capacity(kernel.instructions.len());

    for insn in &kernel.instructions {
        let mut dup = InameDuplicator {
            kernel,
            insn_id: &insn.id,
            generated: &mut generated,
            created: Vec::new(),
        };
        let expression = insn.expression.rewrite_reductions(&mut dup)?;
        for (old, new) in dup.created {
            domain = domain.duplicate_axis(&old, &new).map_err(|e| {
                Diagnostic::error(codes::E0706, Subject::Insn(insn.id.clone()), e.to_string())
            })?;
            iname_to_tag.insert(new.clone(), IndexTag::Sequential);
            tracing::trace!(insn = %insn.id, %old, %new, "duplicated reduction iname");
        }
        instructions.push(Instruction {
            expression,
            ..insn.clone()
        });
    }

    Ok(Kernel {
        domain,
        instructions,
        iname_to_tag,
        ..kernel.clone()
    })
}

// ── Realization ─────────────────────────────────────────────────────────────

/// Per-kernel realization state, reset per owning instruction where noted.
struct Accumulators<'k> {
    kernel: &'k Kernel,
    temporaries: BTreeMap<String, TemporaryVariable>,
    /// Ids of every instruction emitted so far.
    emitted_ids: BTreeSet<String>,
    emitted: Vec<Instruction>,

    // Per owner.
    owner_id: String,
    owner_deps: BTreeSet<String>,
    owner_inames: BTreeSet<String>,
    ilp: Vec<(String, i64)>,
    /// Accumulator name → id of its update instruction.
    acc_updates: BTreeMap<String, String>,
}

impl<'k> Accumulators<'k> {
    fn new(kernel: &'k Kernel) -> Self {
        Accumulators {
            kernel,
            temporaries: BTreeMap::new(),
            emitted_ids: BTreeSet::new(),
            emitted: Vec::new(),
            owner_id: String::new(),
            owner_deps: BTreeSet::new(),
            owner_inames: BTreeSet::new(),
            ilp: Vec::new(),
            acc_updates: BTreeMap::new(),
        }
    }

    fn begin(&mut self, owner: &Instruction) -> Result<(), Diagnostic> {
        self.owner_id = owner.id.clone();
        self.owner_deps = owner.insn_deps.clone();
        self.owner_inames = self.kernel.insn_inames(owner);
        self.acc_updates.clear();
        self.ilp = self
            .owner_inames
            .iter()
            .filter(|i| self.kernel.iname_tag(i) == IndexTag::Ilp)
            .map(|i| Ok((i.clone(), self.kernel.constant_iname_length(i)?)))
            .collect::<Result<_, Diagnostic>>()?;
        Ok(())
    }

    fn fresh_id(&mut self, base: String) -> String {
        let id = self.kernel.make_unique_instruction_id(&base, &self.emitted_ids);
        self.emitted_ids.insert(id.clone());
        id
    }

    fn push(&mut self, insn: Instruction) {
        self.emitted_ids.insert(insn.id.clone());
        self.emitted.push(insn);
    }
}

impl ReductionRewriter for Accumulators<'_> {
    type Error = Diagnostic;

    fn rewrite(&mut self, reduction: Reduction) -> Result<Expr, Diagnostic> {
        let red_inames: BTreeSet<String> =
            reduction.untagged_inames().map(str::to_string).collect();
        let body_deps = reduction.expr.dependencies();
        // Enclosing reduction inames show up as free inames of a nested body.
        let mut outer_inames = self.owner_inames.clone();
        outer_inames.extend(
            body_deps
                .iter()
                .filter(|d| self.kernel.domain.has_dim(d) && !red_inames.contains(*d))
                .cloned(),
        );

        let taken: BTreeSet<String> = self.temporaries.keys().cloned().collect();
        let acc_name = self.kernel.make_unique_var_name("acc", &taken);
        let acc = if self.ilp.is_empty() {
            Expr::var(&acc_name)
        } else {
            Expr::subscript(&acc_name, self.ilp.iter().map(|(i, _)| Expr::var(i)).collect())
        };
        self.temporaries.insert(
            acc_name.clone(),
            TemporaryVariable::new(
                &acc_name,
                reduction.op.dtype,
                self.ilp.iter().map(|(_, len)| *len).collect(),
            ),
        );

        let joined = reduction
            .untagged_inames()
            .collect::<Vec<_>>()
            .join("_");
        let init_id = self.fresh_id(format!("{}_{}_init", self.owner_id, joined));
        let update_id = self.fresh_id(format!("{}_{}_update", self.owner_id, joined));

        let mut init = Instruction::new(&init_id, acc.clone(), reduction.op.neutral_element());
        init.forced_iname_deps = outer_inames.difference(&red_inames).cloned().collect();

        let mut update = Instruction::new(
            &update_id,
            acc.clone(),
            reduction.op.apply(acc.clone(), *reduction.expr),
        );
        update.insn_deps = self.owner_deps.clone();
        update.insn_deps.insert(init_id.clone());
        update.insn_deps.extend(
            body_deps
                .iter()
                .filter_map(|d| self.acc_updates.get(d).cloned()),
        );
        update.forced_iname_deps = outer_inames.union(&red_inames).cloned().collect();

        tracing::trace!(
            insn = %self.owner_id,
            acc = %acc_name,
            init = %init_id,
            update = %update_id,
            "realized reduction"
        );
        self.acc_updates.insert(acc_name, update_id);
        self.push(init);
        self.push(update);
        Ok(acc)
    }
}

/// Count of reduction nodes left in a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionCert {
    pub remaining: Vec<String>,
}

impl ReductionCert {
    pub fn check(kernel: &Kernel) -> Self {
        ReductionCert {
            remaining: kernel
                .instructions
                .iter()
                .filter(|i| i.expression.contains_reduction() || i.assignee.contains_reduction())
                .map(|i| i.id.clone())
                .collect(),
        }
    }
}

impl StageCert for ReductionCert {
    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![("no reduction node survives realization", self.remaining.is_empty())]
    }
}

/// Lower every reduction into an accumulator with init and update
/// instructions placed before its owner.
pub fn realize_reduction(kernel: &Kernel) -> Result<Kernel, Diagnostic> {
    let mut acc = Accumulators::new(kernel);
    for insn in &kernel.instructions {
        acc.begin(insn)?;
        let expression = insn.expression.rewrite_reductions(&mut acc)?;
        let mut owner = insn.clone();
        owner.expression = expression;
        owner.insn_deps.extend(acc.acc_updates.values().cloned());
        owner.forced_iname_deps = kernel.insn_inames(insn);
        acc.push(owner);
    }

    let mut temporary_variables = kernel.temporary_variables.clone();
    temporary_variables.extend(acc.temporaries);
    let out = Kernel {
        instructions: acc.emitted,
        temporary_variables,
        ..kernel.clone()
    };

    let cert = ReductionCert::check(&out);
    if let Some(id) = cert.remaining.first() {
        return Err(Diagnostic::error(
            codes::E0700,
            Subject::Insn(id.clone()),
            "reduction survived realization",
        ));
    }
    Ok(out)
}

// ── Tests ───────────────────────────────────────────────────────────────────
