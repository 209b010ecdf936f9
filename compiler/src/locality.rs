// locality.rs — Temporary locality classification
//
// A temporary lives in local (shared) memory iff some instruction writes it
// through an index that depends on an iname tagged to a local axis
// (explicit or automatic).
//
// Preconditions: none.
// Postconditions: every temporary's `is_local` flag reflects its writers.
// Failure modes: none.
// Side effects: none.

use std::collections::BTreeSet;

use crate::kernel::Kernel;

/// Recompute `is_local` for every temporary. Idempotent.
pub fn mark_local_temporaries(kernel: &Kernel) -> Kernel {
    let writers = kernel.find_writers();
    let mut out = kernel.clone();
    for temp in out.temporary_variables.values_mut() {
        let Some(ids) = writers.get(&temp.name) else {
            temp.is_local = false;
            continue;
        };
        temp.is_local = ids
            .iter()
            .filter_map(|id| kernel.insn(id))
            .any(|insn| {
                let subscript_deps: BTreeSet<String> = insn
                    .assignee_indices()
                    .iter()
                    .flat_map(|e| e.dependencies())
                    .collect();
                kernel
                    .insn_inames(insn)
                    .intersection(&subscript_deps)
                    .any(|iname| kernel.iname_tag(iname).is_local())
            });
        tracing::trace!(temp = %temp.name, is_local = temp.is_local, "classified temporary");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::domain::{AffineExpr, BasicSet, Constraint};
    use crate::expr::Expr;
    use crate::kernel::{Dtype, IndexTag, Instruction, TemporaryVariable};
    use std::collections::BTreeMap;

    fn kernel(tag_i: IndexTag) -> Kernel {
        let mut domain = BasicSet::universe(vec!["i".to_string(), "j".to_string()]);
        for d in ["i", "j"] {
            domain.add_constraint(Constraint::ge(&AffineExpr::var(d), &AffineExpr::constant(0)));
            domain.add_constraint(Constraint::lt(&AffineExpr::var(d), &AffineExpr::constant(16)));
        }
        let fill = Instruction::new(
            "fill",
            Expr::subscript("tile", vec![Expr::var("i"), Expr::var("j")]),
            Expr::subscript("a", vec![Expr::var("i"), Expr::var("j")]),
        );
        let scratch = Instruction::new(
            "scratch",
            Expr::var("s"),
            Expr::subscript("tile", vec![Expr::var("j"), Expr::var("i")]),
        );
        Kernel {
            name: "t".to_string(),
            domain,
            instructions: vec![fill, scratch],
            args: Vec::new(),
            temporary_variables: BTreeMap::from([
                (
                    "tile".to_string(),
                    TemporaryVariable::new("tile", Dtype::Float32, vec![16, 16]),
                ),
                ("s".to_string(), TemporaryVariable::new("s", Dtype::Float32, vec![])),
            ]),
            iname_to_tag: BTreeMap::from([
                ("i".to_string(), tag_i),
                ("j".to_string(), IndexTag::Sequential),
            ]),
            device: Device::nvidia_fermi(),
            schedule: None,
        }
    }

    #[test]
    fn local_axis_write_makes_temporary_local() {
        for tag in [IndexTag::LocalAxis(0), IndexTag::AutoLocalAxis] {
            let k = mark_local_temporaries(&kernel(tag));
            assert!(k.temporary_variables["tile"].is_local);
            assert!(!k.temporary_variables["s"].is_local);
        }
    }

    #[test]
    fn sequential_write_stays_private() {
        let k = mark_local_temporaries(&kernel(IndexTag::GroupAxis(0)));
        assert!(!k.temporary_variables["tile"].is_local);
    }

    #[test]
    fn idempotent() {
        let once = mark_local_temporaries(&kernel(IndexTag::LocalAxis(0)));
        assert_eq!(mark_local_temporaries(&once), once);
    }
}
