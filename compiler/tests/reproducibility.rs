// Reproducibility tests for deterministic preprocessing.
//
// These tests verify that preprocessing produces byte-identical outputs
// and fingerprints for identical inputs, and that fingerprints track every
// input the passes depend on.

use std::path::{Path, PathBuf};

use pkc::device::Device;
use pkc::kernel::Kernel;
use pkc::preprocess::{kernel_fingerprint, preprocess};
use pkc::resolve::load_kernel;

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn kernel_sources() -> Vec<(String, String)> {
    let dir = project_root().join("kernels");
    let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)
        .unwrap_or_else(|e| panic!("cannot list {}: {}", dir.display(), e))
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|x| x == "knl"))
        .collect();
    entries.sort();
    entries
        .into_iter()
        .map(|p| {
            let name = p.file_name().unwrap().to_string_lossy().into_owned();
            (name, std::fs::read_to_string(&p).unwrap())
        })
        .collect()
}

fn load(source: &str, device: &Device) -> Kernel {
    load_kernel(source, device).unwrap()
}

/// Preprocessing the same source twice yields byte-identical kernels.
#[test]
fn same_source_identical_output() {
    for (name, source) in kernel_sources() {
        let device = Device::nvidia_fermi();
        let first = preprocess(&load(&source, &device)).unwrap();
        let second = preprocess(&load(&source, &device)).unwrap();
        assert_eq!(
            first.kernel.to_string(),
            second.kernel.to_string(),
            "{} output should be byte-identical across runs",
            name
        );
        assert_eq!(first.provenance, second.provenance, "{}", name);
        assert_eq!(first.provenance.to_json(), second.provenance.to_json(), "{}", name);
    }
}

/// The device is part of the fingerprinted input.
#[test]
fn device_changes_fingerprint() {
    let source = &kernel_sources()[0].1;
    let fermi = load(source, &Device::nvidia_fermi());
    let cpu = load(source, &Device::generic_cpu());
    assert_ne!(kernel_fingerprint(&fermi), kernel_fingerprint(&cpu));
}

/// Comments and blank lines do not reach the kernel.
#[test]
fn formatting_does_not_change_fingerprint() {
    let device = Device::nvidia_fermi();
    let plain = load(
        "kernel k\ndomain [i] : 0 <= i < 8\ninsn a: x[i] = 2*i\n",
        &device,
    );
    let decorated = load(
        "# scaled index\nkernel k\n\ndomain [i] : 0 <= i < 8   # eight\n\ninsn a: x[i] = 2*i\n",
        &device,
    );
    assert_eq!(kernel_fingerprint(&plain), kernel_fingerprint(&decorated));
}

/// A device descriptor survives a JSON round trip unchanged.
#[test]
fn device_json_is_stable() {
    let device = Device::nvidia_fermi();
    let json = serde_json::to_string(&device).unwrap();
    assert_eq!(Device::from_json(&json).unwrap(), device);
    assert_eq!(serde_json::to_string(&Device::from_json(&json).unwrap()).unwrap(), json);
}
