// Snapshot tests: lock the kernel Display at pass boundaries to detect
// unintended structural changes.
//
// Uses the library API (load_kernel → preprocess_kernel) and snapshots the
// Display output inline with `insta`.
//
// Run `cargo insta review` after intentional output changes to update baselines.

use std::path::{Path, PathBuf};

use pkc::device::Device;
use pkc::kernel::Kernel;
use pkc::pass::PassId;
use pkc::preprocess::{preprocess_kernel, PreprocessOptions};
use pkc::resolve::load_kernel;

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn load(name: &str) -> Kernel {
    let path = project_root().join("kernels").join(name);
    let source = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("cannot read {}: {}", path.display(), e));
    load_kernel(&source, &Device::nvidia_fermi())
        .unwrap_or_else(|d| panic!("{} failed to load: {:?}", name, d))
}

/// Run passes up to `terminal` and return the kernel Display string.
fn snapshot_through(name: &str, terminal: PassId) -> String {
    let options = PreprocessOptions {
        terminal,
        check_certs: true,
    };
    let out = preprocess_kernel(&load(name), &options, |_, _| {})
        .unwrap_or_else(|e| panic!("{}: {}", name, e));
    out.kernel.to_string()
}

#[test]
fn snapshot_resolved_matvec() {
    insta::assert_snapshot!(load("matvec.knl").to_string(), @r"
    kernel matvec
    domain { [i, j] : i >= 0 and -i + n - 1 >= 0 and j >= 0 and -j + 4 >= 0 }
    arg global float32 a[n, 5]
    arg global float32 out[n]
    arg scalar int32 n ~ 1000
    tag i = seq, j = seq
    insn upd: out[i] = sum(j, a[i, j])
    ");
}

#[test]
fn snapshot_realized_matvec() {
    insta::assert_snapshot!(snapshot_through("matvec.knl", PassId::RealizeReduction), @r"
    kernel matvec
    domain { [i, j] : i >= 0 and -i + n - 1 >= 0 and j >= 0 and -j + 4 >= 0 }
    arg global float32 a[n, 5]
    arg global float32 out[n]
    arg scalar int32 n ~ 1000
    temp float32 acc[] private
    tag i = seq, j = seq
    insn upd_j_init: acc = 0 inames(i)
    insn upd_j_update: acc = acc + a[i, j] deps(upd_j_init) inames(i, j)
    insn upd: out[i] = acc deps(upd_j_update) inames(i)
    ");
}

#[test]
fn snapshot_preprocessed_matvec() {
    insta::assert_snapshot!(snapshot_through("matvec.knl", PassId::AdjustStorage), @r"
    kernel matvec
    domain { [i, j] : i >= 0 and -i + n - 1 >= 0 and j >= 0 and -j + 4 >= 0 }
    arg global float32 a[n, 5]
    arg global float32 out[n]
    arg scalar int32 n ~ 1000
    temp float32 acc[] private storage[]
    tag i = seq, j = seq
    insn upd_j_init: acc = 0 inames(i) fixed
    insn upd_j_update: acc = acc + a[i, j] deps(upd_j_init) inames(i, j) fixed
    insn upd: out[i] = acc deps(upd_j_update) inames(i) fixed
    ");
}

#[test]
fn snapshot_preprocessed_transpose() {
    insta::assert_snapshot!(snapshot_through("transpose.knl", PassId::AdjustStorage), @r"
    kernel transpose
    domain { [i, j] : i >= 0 and -i + 31 >= 0 and j >= 0 and -j + 31 >= 0 }
    arg global float32 a[32, 32]
    arg global float32 b[32, 32]
    temp float32 ta[32, 32] local storage[32, 33]
    temp float32 tb[32, 32] local storage[32, 33]
    tag i = l.1, j = l.0
    insn la: ta[i, j] = a[i, j] inames(i, j) boostable()
    insn lb: tb[j, i] = a[i, j] inames(i, j) boostable()
    insn wb: b[i, j] = ta[j, i] + tb[i, j] deps(la, lb) inames(i, j) boostable()
    ");
}
