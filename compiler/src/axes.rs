// axes.rs — Automatic local axis assignment
//
// Maps inames tagged `l.auto` onto the local axes fixed by explicitly tagged
// inames. The search makes one decision at a time and restarts from axis 0
// after each, until a full sweep over every axis (plus one catch-all sweep)
// makes no decision.
//
// Valid sweep (axis < K): for each instruction not yet using `axis`, the
// automatic iname with the smallest aggregate byte stride over its global
// array accesses takes the axis, unless an instruction sharing that iname
// already uses it.
// Catch-all sweep (axis >= K): the longest remaining automatic iname takes
// the first free axis that covers it, else the longest shorter free axis
// (splitting the iname), else becomes sequential.
//
// Preconditions: explicit local axes have constant trip counts.
// Postconditions: no iname keeps `AutoLocalAxis`; every iname tagged to a
//   local axis fits that axis' length.
// Failure modes: E0703 for non-constant trip counts; E0701 when a decision
//   would re-tag an iname that is not automatic.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::{codes, Diagnostic, Subject};
use crate::expr::Expr;
use crate::kernel::{IndexTag, Instruction, Kernel, KernelArg};
use crate::pass::StageCert;
use crate::transform::split_iname;

/// One assignment decision.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Decision {
    insn: String,
    iname: String,
    /// `None` lets the assigner pick an axis.
    axis: Option<usize>,
    /// Local axes already used by any instruction sharing the iname.
    used_axes: BTreeSet<usize>,
}

/// Inames of `insn` ordered by ascending aggregate byte stride over its
/// global array accesses. Inames without stride information sort last.
/// `None` if no access yields any stride.
pub fn auto_axis_iname_ranking_by_stride(kernel: &Kernel, insn: &Instruction) -> Option<Vec<String>> {
    let approx = kernel.approximate_values();
    let insn_inames = kernel.insn_inames(insn);
    let auto: BTreeSet<&String> = insn_inames
        .iter()
        .filter(|i| kernel.iname_tag(i).is_auto())
        .collect();

    let mut accesses = insn.expression.array_accesses();
    if let Expr::Subscript { aggregate, index } = &insn.assignee {
        accesses.push((aggregate.as_str(), index.as_slice()));
    }

    let mut aggregate_strides: BTreeMap<String, i64> = BTreeMap::new();
    for (name, index) in accesses {
        let Some(arg @ KernelArg::Global { .. }) = kernel.arg(name) else {
            continue;
        };
        let Some(strides) = arg.strides() else {
            continue;
        };
        let itemsize = arg.dtype().itemsize() as i64;

        let mut per_access: BTreeMap<String, i64> = BTreeMap::new();
        for (idx, stride) in index.iter().zip(&strides) {
            let (Some(affine), Some(stride)) = (idx.to_affine(), stride.eval_int(&approx)) else {
                continue;
            };
            for var in affine.variables().filter(|v| auto.contains(v)) {
                let bytes = affine
                    .coeff(var)
                    .saturating_mul(stride)
                    .saturating_mul(itemsize)
                    .abs();
                per_access
                    .entry(var.clone())
                    .and_modify(|old| *old = (*old).min(bytes))
                    .or_insert(bytes);
            }
        }
        for (iname, bytes) in per_access {
            let total = aggregate_strides.entry(iname).or_insert(0);
            *total = total.saturating_add(bytes);
        }
    }

    if aggregate_strides.is_empty() {
        return None;
    }
    let mut ranking: Vec<String> = insn_inames.into_iter().collect();
    ranking.sort_by_key(|i| aggregate_strides.get(i).copied().unwrap_or(i64::MAX));
    Some(ranking)
}

fn used_local_axes(kernel: &Kernel, inames: &BTreeSet<String>) -> BTreeSet<usize> {
    inames
        .iter()
        .filter_map(|i| match kernel.iname_tag(i) {
            IndexTag::LocalAxis(n) => Some(n),
            _ => None,
        })
        .collect()
}

/// Local axes used by any instruction that also runs over `iname`.
fn axes_used_alongside(kernel: &Kernel, iname: &str) -> BTreeSet<usize> {
    kernel
        .instructions
        .iter()
        .map(|insn| kernel.insn_inames(insn))
        .filter(|inames| inames.contains(iname))
        .flat_map(|inames| used_local_axes(kernel, &inames))
        .collect()
}

fn next_decision(
    kernel: &Kernel,
    axis: usize,
    local_size: &[i64],
) -> Result<Option<Decision>, Diagnostic> {
    for insn in &kernel.instructions {
        let inames = kernel.insn_inames(insn);
        let auto: Vec<&String> = inames
            .iter()
            .filter(|i| kernel.iname_tag(i).is_auto())
            .collect();
        if auto.is_empty() {
            continue;
        }

        if axis < local_size.len() {
            if used_local_axes(kernel, &inames).contains(&axis) {
                continue;
            }
            let Some(ranking) = auto_axis_iname_ranking_by_stride(kernel, insn) else {
                continue;
            };
            // An iname shared with another instruction must not collide with
            // the axes that instruction already uses.
            let pick = ranking
                .into_iter()
                .filter(|i| kernel.iname_tag(i).is_auto())
                .map(|i| {
                    let used_axes = axes_used_alongside(kernel, &i);
                    (i, used_axes)
                })
                .find(|(_, used_axes)| !used_axes.contains(&axis));
            if let Some((iname, used_axes)) = pick {
                return Ok(Some(Decision {
                    insn: insn.id.clone(),
                    iname,
                    axis: Some(axis),
                    used_axes,
                }));
            }
        } else {
            // Longest first; `auto` is in name order, so ties keep the first.
            let mut best: Option<(&String, i64)> = None;
            for iname in auto {
                let length = kernel.constant_iname_length(iname)?;
                if best.map_or(true, |(_, l)| length > l) {
                    best = Some((iname, length));
                }
            }
            if let Some((iname, _)) = best {
                return Ok(Some(Decision {
                    insn: insn.id.clone(),
                    iname: iname.clone(),
                    axis: None,
                    used_axes: axes_used_alongside(kernel, iname),
                }));
            }
        }
    }
    Ok(None)
}

/// First free axis at least `desired` long, else the longest shorter one.
fn find_axis(desired: i64, used_axes: &BTreeSet<usize>, local_size: &[i64]) -> Option<usize> {
    let free = || (0..local_size.len()).filter(move |a| !used_axes.contains(a));
    if let Some(axis) = free().find(|&a| local_size[a] >= desired) {
        return Some(axis);
    }
    free().fold(None, |best: Option<usize>, a| match best {
        Some(b) if local_size[b] >= local_size[a] => Some(b),
        _ => Some(a),
    })
}

fn apply(kernel: &Kernel, decision: &Decision, local_size: &[i64]) -> Result<Kernel, Diagnostic> {
    let iname = decision.iname.as_str();
    if !kernel.iname_tag(iname).is_auto() {
        return Err(Diagnostic::error(
            codes::E0701,
            Subject::Iname(iname.to_string()),
            format!("cannot re-tag iname with fixed tag '{}'", kernel.iname_tag(iname)),
        )
        .with_related(Subject::Insn(decision.insn.clone()), "selected while assigning axes for"));
    }
    let desired = kernel.constant_iname_length(iname)?;
    let axis = decision
        .axis
        .or_else(|| find_axis(desired, &decision.used_axes, local_size));

    let mut out = kernel.clone();
    match axis {
        None => {
            tracing::trace!(iname, "no local axis available, demoting to sequential");
            out.iname_to_tag.insert(iname.to_string(), IndexTag::Sequential);
        }
        Some(axis) if desired > local_size[axis] => {
            tracing::trace!(iname, axis, length = desired, "splitting onto shorter local axis");
            out = split_iname(
                kernel,
                iname,
                local_size[axis],
                Some(IndexTag::Unroll),
                Some(IndexTag::LocalAxis(axis)),
            )?;
        }
        Some(axis) => {
            tracing::trace!(iname, axis, "assigned local axis");
            out.iname_to_tag.insert(iname.to_string(), IndexTag::LocalAxis(axis));
        }
    }
    Ok(out)
}

/// Replace every `l.auto` tag with a concrete local axis, a split onto one,
/// or a sequential tag.
pub fn assign_automatic_axes(kernel: &Kernel) -> Result<Kernel, Diagnostic> {
    // Axis lengths are fixed by the explicit tags present at entry.
    let local_size = kernel.local_axis_lengths()?;
    let mut kernel = kernel.clone();
    let mut axis = 0;
    loop {
        match next_decision(&kernel, axis, &local_size)? {
            Some(decision) => {
                kernel = apply(&kernel, &decision, &local_size)?;
                axis = 0;
            }
            None if axis >= local_size.len() => break,
            None => axis += 1,
        }
    }
    Ok(kernel)
}

// ── Certificate ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisCert {
    pub remaining_auto: Vec<String>,
    /// Inames whose trip count exceeds the length of their local axis.
    pub oversized: Vec<String>,
    /// Instructions running over two inames tagged with the same local axis.
    pub shared_axis: Vec<String>,
}

impl AxisCert {
    pub fn check(kernel: &Kernel, local_size: &[i64]) -> Self {
        let mut remaining_auto = Vec::new();
        let mut oversized = Vec::new();
        for (iname, tag) in &kernel.iname_to_tag {
            match tag {
                IndexTag::AutoLocalAxis => remaining_auto.push(iname.clone()),
                IndexTag::LocalAxis(axis) => {
                    let fits = match (local_size.get(*axis), kernel.constant_iname_length(iname)) {
                        (Some(max), Ok(len)) => len <= *max,
                        _ => false,
                    };
                    if !fits {
                        oversized.push(iname.clone());
                    }
                }
                _ => {}
            }
        }
        let mut shared_axis = Vec::new();
        for insn in &kernel.instructions {
            let mut seen = BTreeSet::new();
            let clash = kernel
                .insn_inames(insn)
                .iter()
                .filter_map(|i| match kernel.iname_tag(i) {
                    IndexTag::LocalAxis(n) => Some(n),
                    _ => None,
                })
                .any(|axis| !seen.insert(axis));
            if clash {
                shared_axis.push(insn.id.clone());
            }
        }
        AxisCert {
            remaining_auto,
            oversized,
            shared_axis,
        }
    }
}

impl StageCert for AxisCert {
    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("no automatic local tag remains", self.remaining_auto.is_empty()),
            ("local inames fit their axis", self.oversized.is_empty()),
            ("no instruction uses a local axis twice", self.shared_axis.is_empty()),
        ]
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::resolve::load_kernel;

    fn kernel(src: &str) -> Kernel {
        load_kernel(src, &Device::nvidia_fermi()).unwrap()
    }

    fn assigned(src: &str) -> Kernel {
        let k = kernel(src);
        let local_size = k.local_axis_lengths().unwrap();
        let out = assign_automatic_axes(&k).unwrap();
        assert!(AxisCert::check(&out, &local_size).all_pass());
        out
    }

    #[test]
    fn smallest_stride_takes_axis_zero() {
        let k = assigned(
            "domain [i, j, k, m] : 0 <= i < 16 and 0 <= j < 16 and 0 <= k < 16 and 0 <= m < 16\n\
             arg global float32 a[16, 16]\n\
             arg global float32 out[16, 16]\n\
             temp float32 z[16, 16]\n\
             tag i = l.auto, j = l.auto, k = l.0, m = l.1\n\
             insn copy: out[i, j] = a[i, j]\n\
             insn zero: z[k, m] = 0\n",
        );
        assert_eq!(k.iname_tag("j"), IndexTag::LocalAxis(0));
        assert_eq!(k.iname_tag("i"), IndexTag::LocalAxis(1));
    }

    #[test]
    fn ranking_scales_by_approximate_values() {
        let k = kernel(
            "domain [i, j] : 0 <= i < n and 0 <= j < n\n\
             arg global float64 a[n, n]\n\
             arg scalar int32 n ~ 100\n\
             tag i = l.auto, j = l.auto\n\
             insn t: x = a[j, i] + a[j, i]\n",
        );
        let ranking = auto_axis_iname_ranking_by_stride(&k, &k.instructions[0]).unwrap();
        assert_eq!(ranking, vec!["i", "j"]);
    }

    #[test]
    fn long_iname_is_split_onto_axis() {
        let k = assigned(
            "domain [i, k] : 0 <= i < 64 and 0 <= k < 16\n\
             arg global float32 a[64]\n\
             temp float32 z[16]\n\
             tag i = l.auto, k = l.0\n\
             insn copy: x = a[i]\n\
             insn zero: z[k] = 0\n",
        );
        assert_eq!(k.iname_tag("i_inner"), IndexTag::LocalAxis(0));
        assert_eq!(k.iname_tag("i_outer"), IndexTag::Unroll);
        assert_eq!(k.domain.static_size("i_outer").unwrap(), 4);
        assert_eq!(k.instructions[0].expression.to_string(), "a[16*i_outer + i_inner]");
    }

    #[test]
    fn catch_all_sweep_takes_longest_first() {
        let k = assigned(
            "domain [i, j, k] : 0 <= i < 8 and 0 <= j < 32 and 0 <= k < 32\n\
             temp float32 t[32]\n\
             tag i = l.auto, j = l.auto, k = l.0\n\
             insn a: t[k] = 1\n\
             insn b: s = i + j\n",
        );
        assert_eq!(k.iname_tag("j"), IndexTag::LocalAxis(0));
        assert_eq!(k.iname_tag("i"), IndexTag::Sequential);
    }

    #[test]
    fn catch_all_sweep_splits_onto_shorter_axis() {
        let k = assigned(
            "domain [i, j, k] : 0 <= i < 8 and 0 <= j < 64 and 0 <= k < 32\n\
             temp float32 t[32]\n\
             tag i = l.auto, j = l.auto, k = l.0\n\
             insn a: t[k] = 1\n\
             insn b: s = i + j\n",
        );
        assert_eq!(k.iname_tag("j_inner"), IndexTag::LocalAxis(0));
        assert_eq!(k.iname_tag("j_outer"), IndexTag::Unroll);
        assert_eq!(k.iname_tag("i"), IndexTag::Sequential);
    }

    #[test]
    fn without_local_axes_everything_is_sequential() {
        let k = assigned(
            "domain [i] : 0 <= i < 8\n\
             tag i = l.auto\n\
             insn a: s = i\n",
        );
        assert_eq!(k.iname_tag("i"), IndexTag::Sequential);
    }

    #[test]
    fn parametric_automatic_iname_is_fatal() {
        let k = kernel(
            "domain [i] : 0 <= i < n\n\
             tag i = l.auto\n\
             insn a: s = i\n",
        );
        let err = assign_automatic_axes(&k).unwrap_err();
        assert_eq!(err.code, Some(codes::E0703));
    }

    #[test]
    fn shared_iname_avoids_sibling_axes() {
        // `i` takes axis 0 through `ra`, so `j` must not also take axis 0:
        // `wc` runs over both.
        let k = assigned(
            "domain [i, j, k, m] : 0 <= i < 16 and 0 <= j < 16 and 0 <= k < 16 and 0 <= m < 16\n\
             arg global float32 a[16]\n\
             arg global float32 b[16]\n\
             arg global float32 c[16, 16]\n\
             temp float32 z[16, 16]\n\
             tag i = l.auto, j = l.auto, k = l.0, m = l.1\n\
             insn ra: x = a[i]\n\
             insn rb: y = b[j]\n\
             insn wc: c[i, j] = 1\n\
             insn zero: z[k, m] = 0\n",
        );
        assert_eq!(k.iname_tag("i"), IndexTag::LocalAxis(0));
        assert_eq!(k.iname_tag("j"), IndexTag::LocalAxis(1));
    }

    #[test]
    fn cert_flags_axis_shared_within_instruction() {
        let k = kernel(
            "domain [i, j] : 0 <= i < 8 and 0 <= j < 8\n\
             tag i = l.0, j = l.0\n\
             insn w: c[i, j] = 1\n",
        );
        let cert = AxisCert::check(&k, &[8]);
        assert_eq!(cert.shared_axis, vec!["w"]);
        assert!(!cert.all_pass());
    }

    #[test]
    fn free_axis_search() {
        let used = BTreeSet::from([0]);
        assert_eq!(find_axis(10, &used, &[32, 8, 4]), Some(1));
        assert_eq!(find_axis(4, &used, &[32, 8, 4]), Some(1));
        assert_eq!(find_axis(4, &BTreeSet::from([0, 1, 2]), &[32, 8, 4]), None);
        assert_eq!(find_axis(64, &BTreeSet::new(), &[32, 8, 32]), Some(0));
    }
}
