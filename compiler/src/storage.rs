// storage.rs — Local temporary storage layout
//
// Pads the trailing storage dimension of local temporaries to reduce bank
// conflicts, without letting total local memory reach the device budget.
//
// Preconditions: locality flags are current.
// Postconditions: every temporary has a storage shape; non-local ones use
//   their logical shape; a padded layout never pushes total local memory to
//   or past the usable size.
// Failure modes: none.
// Side effects: W0702 when no conflict-free layout fits; W0703 for devices
//   with unknown local memory type.

use crate::device::LocalMemKind;
use crate::diag::{codes, Diagnostic, Subject};
use crate::kernel::Kernel;
use crate::pass::{PassResult, StageCert};

fn product(shape: &[i64]) -> u64 {
    shape.iter().map(|&d| d.max(0) as u64).product()
}

/// Choose a storage shape for every temporary.
pub fn adjust_local_temp_var_storage(kernel: &Kernel) -> PassResult {
    let device = &kernel.device;
    let usable = device.usable_local_mem_size();
    let mut out = kernel.clone();
    let mut diagnostics = Vec::new();

    let names: Vec<String> = kernel.temporary_variables.keys().cloned().collect();
    for name in names {
        let Some(temp) = out.temporary_variables.get(&name).cloned() else {
            continue;
        };
        if !temp.is_local {
            if let Some(t) = out.temporary_variables.get_mut(&name) {
                t.storage_shape = Some(temp.shape.clone());
            }
            continue;
        }

        let storage = temp.effective_storage_shape().to_vec();
        let new_storage = match device.local_mem_kind {
            LocalMemKind::Global => storage,
            LocalMemKind::Unknown => {
                diagnostics.push(Diagnostic::warning(
                    codes::W0703,
                    Subject::Var(name.clone()),
                    format!("unknown type of local memory on device '{}'", device.name),
                ));
                storage
            }
            LocalMemKind::Local if storage.is_empty() => storage,
            LocalMemKind::Local => {
                // Other local temporaries at their current (possibly padded) size.
                let other_bytes: u64 = out
                    .temporary_variables
                    .values()
                    .filter(|t| t.is_local && t.name != name)
                    .map(|t| t.nbytes())
                    .sum();
                let itemsize = temp.dtype.itemsize();
                let last = storage.len() - 1;

                // The unpadded layout is the baseline; padding must beat it
                // and fit in the budget.
                let unpadded = device.local_access_conflicts(itemsize, &temp.shape, &storage);
                let mut min_mult = unpadded.multiplier;
                let mut reason = unpadded.reason;
                let mut good_increment = None;
                let mut over_budget = false;
                let mut best = storage.clone();
                for increment in 1..storage[last] / 2 {
                    let mut test = storage.clone();
                    test[last] += increment;
                    let report = device.local_access_conflicts(itemsize, &temp.shape, &test);
                    if report.multiplier >= min_mult {
                        continue;
                    }
                    if other_bytes + itemsize * product(&test) >= usable {
                        over_budget = true;
                        continue;
                    }
                    tracing::trace!(
                        temp = %name,
                        increment,
                        multiplier = report.multiplier,
                        "accepted padding"
                    );
                    best = test;
                    min_mult = report.multiplier;
                    reason = report.reason;
                    good_increment = Some(increment);
                }

                if min_mult != 1 {
                    let increment = good_increment.map_or("none".to_string(), |i| i.to_string());
                    let mut reason = reason.unwrap_or_else(|| "unknown".to_string());
                    if over_budget {
                        reason.push_str("; a better padding does not fit in local memory");
                    }
                    diagnostics.push(
                        Diagnostic::warning(
                            codes::W0702,
                            Subject::Var(name.clone()),
                            format!(
                                "could not find a conflict-free local memory layout \
                                 (currently: {}x conflict, increment: {}, reason: {})",
                                min_mult, increment, reason
                            ),
                        )
                        .with_hint("reduce local memory use or change the tile shape"),
                    );
                }
                best
            }
        };

        if let Some(t) = out.temporary_variables.get_mut(&name) {
            t.storage_shape = Some(new_storage);
        }
    }

    PassResult {
        kernel: out,
        diagnostics,
    }
}

// ── Certificate ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCert {
    pub missing_storage: Vec<String>,
    /// Some local temporary's storage differs from its logical shape.
    pub padded: bool,
    pub local_bytes: u64,
    pub usable_bytes: u64,
}

impl StorageCert {
    pub fn check(kernel: &Kernel) -> Self {
        let temps = kernel.temporary_variables.values();
        StorageCert {
            missing_storage: temps
                .clone()
                .filter(|t| t.storage_shape.is_none())
                .map(|t| t.name.clone())
                .collect(),
            padded: temps
                .filter(|t| t.is_local)
                .any(|t| t.effective_storage_shape() != t.shape.as_slice()),
            local_bytes: kernel.local_mem_bytes(),
            usable_bytes: kernel.device.usable_local_mem_size(),
        }
    }
}

impl StageCert for StorageCert {
    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("every temporary has a storage shape", self.missing_storage.is_empty()),
            (
                "padding stays within the local memory budget",
                !self.padded || self.local_bytes < self.usable_bytes,
            ),
        ]
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::locality::mark_local_temporaries;
    use crate::resolve::load_kernel;

    const TILES: &str = "domain [i, j] : 0 <= i < 32 and 0 <= j < 32\n\
                         temp float32 a[32, 32]\n\
                         temp float32 b[32, 32]\n\
                         temp float32 p[8]\n\
                         tag i = l.1, j = l.0\n\
                         insn wa: a[i, j] = 1\n\
                         insn wb: b[j, i] = 2\n\
                         insn wp: p[0] = 3\n";

    fn adjusted(device: Device) -> PassResult {
        let k = mark_local_temporaries(&load_kernel(TILES, &device).unwrap());
        adjust_local_temp_var_storage(&k)
    }

    #[test]
    fn pads_square_tiles_by_one() {
        let res = adjusted(Device::nvidia_fermi());
        assert!(res.diagnostics.is_empty());
        let temps = &res.kernel.temporary_variables;
        assert_eq!(temps["a"].storage_shape, Some(vec![32, 33]));
        assert_eq!(temps["b"].storage_shape, Some(vec![32, 33]));
        assert!(!temps["p"].is_local);
        assert_eq!(temps["p"].storage_shape, Some(vec![8]));
        assert!(StorageCert::check(&res.kernel).all_pass());
    }

    #[test]
    fn budget_blocks_padding() {
        let mut device = Device::nvidia_fermi();
        device.local_mem_size = 8300;
        let res = adjusted(device);
        let temps = &res.kernel.temporary_variables;
        assert_eq!(temps["a"].storage_shape, Some(vec![32, 32]));
        assert_eq!(temps["b"].storage_shape, Some(vec![32, 32]));
        assert_eq!(res.diagnostics.len(), 2);
        for d in &res.diagnostics {
            assert_eq!(d.code, Some(codes::W0702));
            assert!(d.message.contains("32x conflict"), "{}", d.message);
            assert!(d.message.contains("increment: none"), "{}", d.message);
        }
        assert!(StorageCert::check(&res.kernel).all_pass());
    }

    #[test]
    fn budget_counts_padding_already_chosen() {
        // Room for exactly one padded tile next to an unpadded one.
        let mut device = Device::nvidia_fermi();
        device.local_mem_size = 4096 + 4224 + 1;
        let res = adjusted(device);
        let temps = &res.kernel.temporary_variables;
        assert_eq!(temps["a"].storage_shape, Some(vec![32, 33]));
        assert_eq!(temps["b"].storage_shape, Some(vec![32, 32]));
        assert_eq!(res.diagnostics.len(), 1);
        assert_eq!(res.diagnostics[0].subject, Subject::Var("b".to_string()));
        assert!(res.kernel.local_mem_bytes() < res.kernel.device.usable_local_mem_size());
    }

    #[test]
    fn conflict_free_layout_over_budget_is_quiet() {
        let mut device = Device::nvidia_fermi();
        device.local_mem_size = 64;
        let k = load_kernel(
            "domain [j] : 0 <= j < 32\n\
             temp float32 r[32]\n\
             tag j = l.0\n\
             insn wr: r[j] = 1\n",
            &device,
        )
        .unwrap();
        let res = adjust_local_temp_var_storage(&mark_local_temporaries(&k));
        assert!(res.diagnostics.is_empty(), "{:?}", res.diagnostics);
        assert_eq!(res.kernel.temporary_variables["r"].storage_shape, Some(vec![32]));
    }

    #[test]
    fn blocked_padding_reports_unpadded_conflict() {
        let mut device = Device::nvidia_fermi();
        device.local_mem_size = 8300;
        let res = adjusted(device);
        for d in &res.diagnostics {
            assert!(d.message.contains("does not fit in local memory"), "{}", d.message);
        }
    }

    #[test]
    fn global_memory_devices_keep_layout() {
        let mut device = Device::generic_cpu();
        device.local_mem_size = 1 << 20;
        let res = adjusted(device);
        assert!(res.diagnostics.is_empty());
        assert_eq!(res.kernel.temporary_variables["a"].storage_shape, Some(vec![32, 32]));
    }

    #[test]
    fn unknown_memory_type_warns() {
        let mut device = Device::nvidia_fermi();
        device.local_mem_kind = LocalMemKind::Unknown;
        let res = adjusted(device);
        assert_eq!(res.diagnostics.len(), 2);
        assert!(res.diagnostics.iter().all(|d| d.code == Some(codes::W0703)));
    }
}
