// Property-based tests for preprocessing invariants.
//
// Five categories:
// 1. Generated reduction kernels preprocess cleanly and count their flops
// 2. Generated automatic-axis kernels keep their flops and axis uniqueness
// 3. Integer-set layer: cardinality agrees with point enumeration
// 4. Splitting an iname preserves the iteration space
// 5. Local-storage padding never exceeds the memory budget
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use std::collections::{BTreeSet, HashMap};

use pkc::device::Device;
use pkc::domain::{AffineExpr, BasicSet, Constraint};
use pkc::flops::kernel_flop_count;
use pkc::kernel::{IndexTag, Kernel};
use pkc::pass::StageCert;
use pkc::poly::Rational;
use pkc::preprocess::preprocess;
use pkc::reduction::ReductionCert;
use pkc::resolve::load_kernel;
use pkc::storage::StorageCert;
use pkc::transform::split_iname;
use proptest::prelude::*;

// ── Kernel generator ────────────────────────────────────────────────────────

/// A kernel over `dims` with fixed extents, reducing over a non-empty
/// suffix of the dims. Grammar:
///   domain [d0, ...] : 0 <= d0 < e0 and ...
///   insn r: out[outer...] = (sum|product)(reduced, a[d0, ...])
#[derive(Debug, Clone)]
struct GenKernel {
    extents: Vec<i64>,
    reduced_from: usize,
    op: &'static str,
    ilp_outer: bool,
}

const DIMS: [&str; 3] = ["p", "q", "r"];

impl GenKernel {
    fn source(&self) -> String {
        let dims = &DIMS[..self.extents.len()];
        let bounds: Vec<String> = dims
            .iter()
            .zip(&self.extents)
            .map(|(d, e)| format!("0 <= {} < {}", d, e))
            .collect();
        let outer = &dims[..self.reduced_from];
        let reduced = &dims[self.reduced_from..];
        let assignee = if outer.is_empty() {
            "out[0]".to_string()
        } else {
            format!("out[{}]", outer.join(", "))
        };
        let red = if reduced.len() == 1 {
            reduced[0].to_string()
        } else {
            format!("({})", reduced.join(", "))
        };
        let mut src = format!("domain [{}] : {}\n", dims.join(", "), bounds.join(" and "));
        if self.ilp_outer && !outer.is_empty() {
            src.push_str(&format!("tag {} = ilp\n", outer[0]));
        }
        src.push_str(&format!(
            "insn r: {} = {}({}, a[{}])\n",
            assignee,
            self.op,
            red,
            dims.join(", ")
        ));
        src
    }

    fn points(&self) -> i64 {
        self.extents.iter().product()
    }
}

fn arb_kernel() -> impl Strategy<Value = GenKernel> {
    prop::collection::vec(1i64..6, 1..=3)
        .prop_flat_map(|extents| {
            let n = extents.len();
            (
                Just(extents),
                0..n,
                prop_oneof![Just("sum"), Just("product")],
                any::<bool>(),
            )
        })
        .prop_map(|(extents, reduced_from, op, ilp_outer)| GenKernel {
            extents,
            reduced_from,
            op,
            ilp_outer,
        })
}

/// A kernel with one `l.auto` iname `p` next to an explicitly tagged `k`.
/// Grammar:
///   domain [p, k] : 0 <= p < P and 0 <= k < L
///   tag p = l.auto, k = l.<axis>
///   insn z: t[k] = 0
///   insn s: out[p] = 2*w[0]
///   [insn m: u[p, k] = 1]     (shares `p` with the explicit axis)
#[derive(Debug, Clone)]
struct GenAxisKernel {
    auto_extent: i64,
    axis_extent: i64,
    axis: usize,
    shared: bool,
}

impl GenAxisKernel {
    fn source(&self) -> String {
        let mut src = format!(
            "domain [p, k] : 0 <= p < {} and 0 <= k < {}\n\
             arg global float32 w[1]\n\
             temp float32 t[{}]\n\
             tag p = l.auto, k = l.{}\n\
             insn z: t[k] = 0\n\
             insn s: out[p] = 2*w[0]\n",
            self.auto_extent, self.axis_extent, self.axis_extent, self.axis
        );
        if self.shared {
            src.push_str("insn m: u[p, k] = 1\n");
        }
        src
    }
}

fn arb_axis_kernel() -> impl Strategy<Value = GenAxisKernel> {
    (1i64..40, 2i64..9, 0usize..2, any::<bool>()).prop_map(
        |(auto_extent, axis_extent, axis, shared)| GenAxisKernel {
            auto_extent,
            axis_extent,
            axis,
            shared,
        },
    )
}

/// Instructions running over two inames on the same local axis.
fn axis_clashes(k: &Kernel) -> Vec<String> {
    k.instructions
        .iter()
        .filter(|insn| {
            let mut seen = BTreeSet::new();
            k.insn_inames(insn)
                .iter()
                .filter_map(|i| match k.iname_tag(i) {
                    IndexTag::LocalAxis(n) => Some(n),
                    _ => None,
                })
                .any(|axis| !seen.insert(axis))
        })
        .map(|insn| insn.id.clone())
        .collect()
}

/// Random sequences of front-end tokens, mostly ill-formed.
fn arb_token_soup() -> impl Strategy<Value = String> {
    let tokens = vec![
        "domain", "insn", "tag", "temp", "arg", "set", "global", "float32", "[", "]", "(",
        ")", ",", ":", "=", "<", "<=", "and", "+", "*", "//", "@", "$", "i", "j", "n", "x",
        "sum", "max", "0", "4", "l.0", "l.auto", "16KB", "\n",
    ];
    prop::collection::vec(prop::sample::select(tokens), 0..40).prop_map(|t| t.join(" "))
}

// ── 1. Generated kernels ────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn generated_kernels_preprocess(gen in arb_kernel()) {
        let src = gen.source();
        let kernel = load_kernel(&src, &Device::nvidia_fermi());
        prop_assert!(kernel.is_ok(), "load failed for:\n{}\n{:?}", src, kernel.err());
        let out = preprocess(&kernel.unwrap());
        prop_assert!(out.is_ok(), "preprocess failed for:\n{}\n{:?}", src, out.err());
        let out = out.unwrap();

        prop_assert!(ReductionCert::check(&out.kernel).all_pass());
        prop_assert!(out.kernel.instructions.iter().all(|i| i.boostable.is_some()));
        prop_assert!(out.kernel.iname_to_tag.values().all(|t| !t.is_auto()));

        // One update per domain point, one flop each.
        let flops = kernel_flop_count(&out.kernel, &HashMap::new()).unwrap();
        prop_assert_eq!(flops, Rational::integer(gen.points()));
    }

    #[test]
    fn ilp_accumulators_are_sized_by_extent(gen in arb_kernel()) {
        prop_assume!(gen.ilp_outer && gen.reduced_from > 0);
        let kernel = load_kernel(&gen.source(), &Device::nvidia_fermi()).unwrap();
        let out = preprocess(&kernel).unwrap();
        let acc = &out.kernel.temporary_variables["acc"];
        prop_assert_eq!(acc.shape.clone(), vec![gen.extents[0]]);
    }

    #[test]
    fn front_end_never_panics(src in arb_token_soup()) {
        let _ = load_kernel(&src, &Device::nvidia_fermi());
    }
}

// ── 2. Automatic axes ───────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn automatic_axes_preserve_flops(gen in arb_axis_kernel()) {
        let src = gen.source();
        let kernel = load_kernel(&src, &Device::nvidia_fermi()).unwrap();
        let none = HashMap::new();
        let before = kernel_flop_count(&kernel, &none).unwrap();
        prop_assert_eq!(before, Rational::integer(gen.auto_extent));

        let out = preprocess(&kernel);
        prop_assert!(out.is_ok(), "preprocess failed for:\n{}\n{:?}", src, out.err());
        let k = out.unwrap().kernel;
        prop_assert!(k.iname_to_tag.values().all(|t| !t.is_auto()));
        prop_assert!(axis_clashes(&k).is_empty(), "{:?} in:\n{}", axis_clashes(&k), k);

        let after = kernel_flop_count(&k, &none);
        prop_assert!(after.is_ok(), "cannot count:\n{}\n{:?}", k, after.err());
        prop_assert_eq!(after.unwrap(), before);
    }
}

// ── 3. Cardinality ──────────────────────────────────────────────────────────

fn triangle(offset: i64) -> BasicSet {
    let v = AffineExpr::var;
    let zero = AffineExpr::constant(0);
    BasicSet::universe(vec!["i".to_string(), "j".to_string()])
        .with_constraint(Constraint::ge(&v("i"), &zero))
        .with_constraint(Constraint::lt(&v("i"), &v("n")))
        .with_constraint(Constraint::ge(&v("j"), &zero))
        .with_constraint(Constraint::le(
            &v("j"),
            &(&v("i") + &AffineExpr::constant(offset)),
        ))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn cardinality_matches_enumeration(n in 1i64..12, offset in 0i64..4) {
        let set = triangle(offset);
        let params = HashMap::from([("n".to_string(), n)]);
        let counted = set.cardinality().unwrap().eval(&params).unwrap();
        let listed = set.enumerate_points(&params).unwrap().len() as i64;
        prop_assert_eq!(counted, Rational::integer(listed));
    }

    // ── 4. Splitting ──

    #[test]
    fn split_preserves_iteration_space(extent in 1i64..40, length in 1i64..9) {
        let src = format!("domain [i] : 0 <= i < {}\ninsn w: x[i] = i\n", extent);
        let kernel = load_kernel(&src, &Device::nvidia_fermi()).unwrap();
        let split = split_iname(
            &kernel,
            "i",
            length,
            Some(IndexTag::GroupAxis(0)),
            Some(IndexTag::LocalAxis(0)),
        )
        .unwrap();
        let points = split.domain.enumerate_points(&HashMap::new()).unwrap();
        prop_assert_eq!(points.len() as i64, extent);

        // Every point maps back to a distinct original index.
        let indices: BTreeSet<i64> = points
            .iter()
            .map(|p| p["i_outer"] * length + p["i_inner"])
            .collect();
        prop_assert_eq!(indices, (0..extent).collect::<BTreeSet<i64>>());
        prop_assert!(!split.domain.has_dim("i"));
    }

    // ── 5. Storage budget ──

    #[test]
    fn padding_stays_within_budget(side in 2i64..48, budget in 64u64..20_000) {
        let src = format!(
            "set local_mem = {budget}\n\
             domain [i, j] : 0 <= i < {side} and 0 <= j < {side}\n\
             temp float32 t[{side}, {side}]\n\
             tag i = l.1, j = l.0\n\
             insn w: t[i, j] = 1\n"
        );
        let kernel = load_kernel(&src, &Device::nvidia_fermi()).unwrap();
        let out = preprocess(&kernel).unwrap();
        let temp = &out.kernel.temporary_variables["t"];
        let cert = StorageCert::check(&out.kernel);
        prop_assert!(cert.all_pass(), "{:?}", cert);
        if temp.storage_shape.as_deref() != Some(temp.shape.as_slice()) {
            prop_assert!(out.kernel.local_mem_bytes() < out.kernel.device.usable_local_mem_size());
        }
    }
}
