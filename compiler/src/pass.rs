// pass.rs — Pass descriptor module: metadata, dependency resolution, certificates
//
// Declares the seven kernel preprocessing passes, their dependency edges, and
// the kernel facets they produce. Used by the preprocessing driver to compute
// the minimal pass prefix for a terminal pass.

use std::collections::HashSet;

use crate::diag::Diagnostic;
use crate::kernel::Kernel;

// ── Pass and facet identifiers ─────────────────────────────────────────────

/// Identifies each preprocessing pass. Parsing and resolution happen before
/// the driver runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    MarkLocal,
    DuplicateInames,
    RealizeReduction,
    AssignAxes,
    InferDependencies,
    LimitBoostability,
    AdjustStorage,
}

/// The part of a kernel a pass rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacetId {
    Locality,      // TemporaryVariable::is_local
    Domain,        // Kernel::domain
    Instructions,  // Kernel::instructions
    Temporaries,   // Kernel::temporary_variables
    Tags,          // Kernel::iname_to_tag
    InsnDeps,      // Instruction::insn_deps
    Boostability,  // Instruction::boostable
    BoostTargets,  // Instruction::boostable_into
    StorageShapes, // TemporaryVariable::storage_shape
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a preprocessing pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics and logs.
    pub name: &'static str,
    /// Passes whose output this pass consumes.
    pub inputs: &'static [PassId],
    /// Kernel facets this pass rewrites; logged when the pass completes.
    pub outputs: &'static [FacetId],
    /// Postcondition checked by the pass certificate; the hint of E0705.
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::MarkLocal => PassDescriptor {
            name: "mark_local",
            inputs: &[],
            outputs: &[FacetId::Locality],
            invariants: "temporaries written through local-axis indices are local",
        },
        PassId::DuplicateInames => PassDescriptor {
            name: "duplicate_inames",
            inputs: &[PassId::MarkLocal],
            outputs: &[FacetId::Domain, FacetId::Instructions, FacetId::Tags],
            invariants: "no reduction iname carries a duplication marker",
        },
        PassId::RealizeReduction => PassDescriptor {
            name: "realize_reduction",
            inputs: &[PassId::DuplicateInames],
            outputs: &[FacetId::Instructions, FacetId::Temporaries],
            invariants: "no reduction node remains",
        },
        PassId::AssignAxes => PassDescriptor {
            name: "assign_axes",
            inputs: &[PassId::RealizeReduction],
            outputs: &[FacetId::Tags, FacetId::Domain, FacetId::Instructions],
            invariants: "no automatic local tag remains and no instruction uses a local axis twice",
        },
        PassId::InferDependencies => PassDescriptor {
            name: "infer_dependencies",
            inputs: &[PassId::AssignAxes],
            outputs: &[FacetId::InsnDeps, FacetId::Boostability],
            invariants: "every instruction has determined boostability",
        },
        PassId::LimitBoostability => PassDescriptor {
            name: "limit_boostability",
            inputs: &[PassId::InferDependencies],
            outputs: &[FacetId::BoostTargets],
            invariants: "boost targets are disjoint from own inames",
        },
        PassId::AdjustStorage => PassDescriptor {
            name: "adjust_storage",
            inputs: &[PassId::LimitBoostability],
            outputs: &[FacetId::StorageShapes],
            invariants: "padded local memory stays below the usable size",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in execution order.
pub const ALL_PASSES: [PassId; 7] = [
    PassId::MarkLocal,
    PassId::DuplicateInames,
    PassId::RealizeReduction,
    PassId::AssignAxes,
    PassId::InferDependencies,
    PassId::LimitBoostability,
    PassId::AdjustStorage,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Pass results and certificates ──────────────────────────────────────────

/// Output of a pass that can emit advisories.
#[derive(Debug, Clone)]
pub struct PassResult {
    pub kernel: Kernel,
    pub diagnostics: Vec<Diagnostic>,
}

/// Machine-checkable postconditions of a pass.
pub trait StageCert {
    /// Named obligations and whether each holds.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    fn all_pass(&self) -> bool {
        self.obligations().iter().all(|(_, ok)| *ok)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
