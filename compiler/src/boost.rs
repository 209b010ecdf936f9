// boost.rs — Automatic dependencies and boostability
//
// An instruction is boostable (may be executed redundantly across extra loop
// iterations) iff it does not transitively depend on its own output.
// Variables written by a non-boostable instruction poison every instruction
// that writes or reads them.
//
// Preconditions: reductions have been realized.
// Postconditions: every instruction has `boostable` set; after
//   `limit_boostability`, every instruction has `boostable_into` set, empty
//   for non-boostable ones and disjoint from its own inames.
// Failure modes: E0702 when limiting an instruction with undetermined
//   boostability.
// Side effects: W0700/W0701 advisories.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::{codes, Diagnostic, Subject};
use crate::kernel::Kernel;
use crate::pass::{PassResult, StageCert};

// ── Dependency inference ────────────────────────────────────────────────────

/// Add single-writer dependencies and decide boostability for every
/// instruction.
pub fn add_boostability_and_automatic_dependencies(kernel: &Kernel) -> PassResult {
    let writers = kernel.find_writers();
    let arg_names: BTreeSet<String> = kernel.args.iter().map(|a| a.name().to_string()).collect();
    let mut var_names = arg_names.clone();
    var_names.extend(kernel.temporary_variables.keys().cloned());

    let dep_map: BTreeMap<&str, BTreeSet<String>> = kernel
        .instructions
        .iter()
        .map(|insn| {
            let deps = insn
                .expression
                .dependencies()
                .intersection(&var_names)
                .cloned()
                .collect();
            (insn.id.as_str(), deps)
        })
        .collect();
    let no_writers = BTreeSet::new();
    let writers_of = |var: &str| writers.get(var).unwrap_or(&no_writers);

    let mut diagnostics = Vec::new();
    let mut non_boostable_vars = BTreeSet::new();
    let mut instructions = Vec::with_capacity(kernel.instructions.len());

    for insn in &kernel.instructions {
        let mut auto_deps = BTreeSet::new();
        let mut reached: BTreeSet<String> = BTreeSet::new();

        for var in &dep_map[insn.id.as_str()] {
            let var_writers = writers_of(var.as_str());
            reached.extend(var_writers.iter().cloned());

            if var_writers.is_empty() && !arg_names.contains(var) {
                diagnostics.push(
                    Diagnostic::warning(codes::W0700, Subject::Var(var.clone()), "read, but never written")
                        .with_related(Subject::Insn(insn.id.clone()), "read here"),
                );
            }
            if var_writers.len() > 1 && var_writers.is_disjoint(&insn.insn_deps) {
                diagnostics.push(
                    Diagnostic::warning(
                        codes::W0701,
                        Subject::Var(var.clone()),
                        format!(
                            "written from more than one place, but instruction '{}' \
                             (which reads it) does not depend on any of the writers",
                            insn.id
                        ),
                    )
                    .with_hint("add one of the writers to the instruction's deps(...)"),
                );
            }
            if var_writers.len() == 1 {
                auto_deps.extend(var_writers.iter().cloned());
            }
        }

        // Transitive closure over writers of variables read by writers.
        loop {
            let mut next = reached.clone();
            for writer in &reached {
                for var in dep_map.get(writer.as_str()).into_iter().flatten() {
                    next.extend(writers_of(var.as_str()).iter().cloned());
                }
            }
            if next == reached {
                break;
            }
            reached = next;
        }

        let boostable = !reached.contains(&insn.id);
        if !boostable {
            non_boostable_vars.insert(insn.assignee_var_name().to_string());
        }
        tracing::trace!(insn = %insn.id, boostable, auto_deps = auto_deps.len(), "inferred");

        let mut insn = insn.clone();
        insn.insn_deps.extend(auto_deps);
        insn.boostable = Some(boostable);
        instructions.push(insn);
    }

    for insn in &mut instructions {
        let mut accessed = insn.read_var_names();
        accessed.insert(insn.assignee_var_name().to_string());
        if !accessed.is_disjoint(&non_boostable_vars) {
            insn.boostable = Some(false);
        }
    }

    PassResult {
        kernel: Kernel {
            instructions,
            ..kernel.clone()
        },
        diagnostics,
    }
}

// ── Limiting ────────────────────────────────────────────────────────────────

/// Narrow each boostable instruction to the inames it may be boosted into:
/// inames that co-occur with its own, excluding its own and any iname used
/// by a single instruction.
pub fn limit_boostability(kernel: &Kernel) -> Result<Kernel, Diagnostic> {
    let insn_inames: Vec<BTreeSet<String>> = kernel
        .instructions
        .iter()
        .map(|insn| kernel.insn_inames(insn))
        .collect();

    let mut occurs_with: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    let mut use_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for inames in &insn_inames {
        for iname in inames {
            occurs_with
                .entry(iname.as_str())
                .or_default()
                .extend(inames.iter().cloned());
            *use_counts.entry(iname.as_str()).or_default() += 1;
        }
    }
    let single_use: BTreeSet<String> = use_counts
        .iter()
        .filter(|(_, n)| **n == 1)
        .map(|(i, _)| i.to_string())
        .collect();

    let mut instructions = Vec::with_capacity(kernel.instructions.len());
    for (insn, own) in kernel.instructions.iter().zip(&insn_inames) {
        let into = match insn.boostable {
            None => {
                return Err(Diagnostic::error(
                    codes::E0702,
                    Subject::Insn(insn.id.clone()),
                    "instruction has undetermined boostability",
                )
                .with_hint("run dependency inference before limiting boostability"));
            }
            Some(false) => BTreeSet::new(),
            Some(true) => own
                .iter()
                .flat_map(|i| occurs_with.get(i.as_str()).into_iter().flatten())
                .filter(|i| !own.contains(*i) && !single_use.contains(*i))
                .cloned()
                .collect(),
        };
        let mut insn = insn.clone();
        insn.boostable_into = Some(into);
        instructions.push(insn);
    }

    Ok(Kernel {
        instructions,
        ..kernel.clone()
    })
}

// ── Certificates ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoostCert {
    /// Instructions with undetermined boostability.
    pub undetermined: Vec<String>,
    /// Instructions whose `boostable_into` is missing or malformed.
    pub bad_limits: Vec<String>,
    /// Whether `boostable_into` is expected to be set.
    pub limited: bool,
}

impl BoostCert {
    pub fn check(kernel: &Kernel, limited: bool) -> Self {
        let mut undetermined = Vec::new();
        let mut bad_limits = Vec::new();
        for insn in &kernel.instructions {
            if insn.boostable.is_none() {
                undetermined.push(insn.id.clone());
            }
            if !limited {
                continue;
            }
            let ok = match (&insn.boostable_into, insn.boostable) {
                (Some(into), Some(false)) => into.is_empty(),
                (Some(into), Some(true)) => into.is_disjoint(&kernel.insn_inames(insn)),
                _ => false,
            };
            if !ok {
                bad_limits.push(insn.id.clone());
            }
        }
        BoostCert {
            undetermined,
            bad_limits,
            limited,
        }
    }
}

impl StageCert for BoostCert {
    fn obligations(&self) -> Vec<(&'static str, bool)> {
        let mut out = vec![("boostability determined", self.undetermined.is_empty())];
        if self.limited {
            out.push(("boost targets exclude own inames", self.bad_limits.is_empty()));
        }
        out
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::reduction::realize_reduction;
    use crate::resolve::load_kernel;

    fn kernel(src: &str) -> Kernel {
        load_kernel(src, &Device::nvidia_fermi()).unwrap()
    }

    fn ids(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[test]
    fn single_writer_becomes_dependency() {
        let k = kernel(
            "domain [i] : 0 <= i < n\n\
             arg global float32 a[n]\n\
             arg global float32 out[n]\n\
             temp float32 t[16]\n\
             insn w: t[i] = 2*a[i]\n\
             insn r: out[i] = t[i]\n",
        );
        let res = add_boostability_and_automatic_dependencies(&k);
        assert!(res.diagnostics.is_empty());
        let r = res.kernel.insn("r").unwrap();
        assert_eq!(ids(&r.insn_deps), vec!["w"]);
        assert_eq!(r.boostable, Some(true));
        assert_eq!(res.kernel.insn("w").unwrap().boostable, Some(true));
    }

    #[test]
    fn accumulators_are_not_boostable() {
        let k = kernel(
            "domain [i, j] : 0 <= i < n and 0 <= j < 5\n\
             arg global float32 a[n, 5]\n\
             arg global float32 out[n]\n\
             insn upd: out[i] = sum(j, a[i, j])\n",
        );
        let k = realize_reduction(&k).unwrap();
        let res = add_boostability_and_automatic_dependencies(&k);
        for insn in &res.kernel.instructions {
            assert_eq!(insn.boostable, Some(false), "{}", insn.id);
        }
        // `acc` has two writers; the owner depends on the update explicitly.
        assert!(res.diagnostics.iter().all(|d| d.code != Some(codes::W0701)));
        assert!(BoostCert::check(&res.kernel, false).all_pass());
    }

    #[test]
    fn read_before_write_warns() {
        let k = kernel(
            "domain [i] : 0 <= i < 4\n\
             temp float32 t[4]\n\
             insn r: x = t[i]\n",
        );
        let res = add_boostability_and_automatic_dependencies(&k);
        assert_eq!(res.diagnostics.len(), 1);
        assert_eq!(res.diagnostics[0].code, Some(codes::W0700));
        assert_eq!(res.diagnostics[0].subject, Subject::Var("t".to_string()));
    }

    #[test]
    fn ambiguous_writers_warn() {
        let k = kernel(
            "domain [i] : 0 <= i < 4\n\
             temp float32 t[4]\n\
             insn w1: t[i] = 1\n\
             insn w2: t[i] = 2\n\
             insn r: x = t[i]\n",
        );
        let res = add_boostability_and_automatic_dependencies(&k);
        let found: Vec<_> = res.diagnostics.iter().map(|d| d.code).collect();
        assert_eq!(found, vec![Some(codes::W0701)]);
        assert!(res.kernel.insn("r").unwrap().insn_deps.is_empty());
    }

    #[test]
    fn limit_uses_cooccurring_inames() {
        let k = kernel(
            "domain [i, j, k] : 0 <= i < 4 and 0 <= j < 4 and 0 <= k < 4\n\
             arg global float32 a[4]\n\
             arg global float32 b[4, 4]\n\
             arg global float32 c[4, 4]\n\
             arg global float32 d[4]\n\
             temp float32 t[4]\n\
             insn p: t[i] = a[i]\n\
             insn q: b[i, j] = t[i]\n\
             insn s: c[j, k] = 1\n",
        );
        let k = add_boostability_and_automatic_dependencies(&k).kernel;
        let k = limit_boostability(&k).unwrap();
        // i occurs with j (via q); k is single-use.
        assert_eq!(ids(k.insn("p").unwrap().boostable_into.as_ref().unwrap()), vec!["j"]);
        assert_eq!(ids(k.insn("q").unwrap().boostable_into.as_ref().unwrap()), Vec::<&str>::new());
        assert_eq!(ids(k.insn("s").unwrap().boostable_into.as_ref().unwrap()), vec!["i"]);
        assert!(BoostCert::check(&k, true).all_pass());
    }

    #[test]
    fn limit_requires_inference() {
        let k = kernel("domain [i] : 0 <= i < 4\ninsn a: x = i\n");
        let err = limit_boostability(&k).unwrap_err();
        assert_eq!(err.code, Some(codes::E0702));
        assert_eq!(err.subject, Subject::Insn("a".to_string()));
    }
}
