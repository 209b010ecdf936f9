// preprocess.rs — Preprocessing driver and provenance
//
// Runs the minimal pass prefix for a terminal pass over an immutable input
// kernel, threading a fresh kernel value from pass to pass.
//
// Preconditions: the kernel passed resolution (every iname has a tag).
// Postconditions: on success, the output kernel satisfies the certificates
//   of every pass run (when `check_certs` is set).
// Failure modes: any pass returning an error-level diagnostic; a failed
//   certificate (E0705).
// Side effects: calls `on_pass_complete` after each pass for immediate
//   display; logs via `tracing`.

use std::fmt;
use std::time::{Duration, Instant};

use crate::axes::{assign_automatic_axes, AxisCert};
use crate::boost::{add_boostability_and_automatic_dependencies, limit_boostability, BoostCert};
use crate::diag::{codes, has_errors, DiagLevel, Diagnostic, Subject};
use crate::kernel::Kernel;
use crate::locality::mark_local_temporaries;
use crate::pass::{descriptor, required_passes, PassId, PassResult, StageCert};
use crate::reduction::{duplicate_reduction_inames, realize_reduction, ReductionCert};
use crate::storage::{adjust_local_temp_var_storage, StorageCert};

// ── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessOptions {
    /// Last pass to run; its prerequisites run first.
    pub terminal: PassId,
    /// Verify each pass's certificate after it runs.
    pub check_certs: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        PreprocessOptions {
            terminal: PassId::AdjustStorage,
            check_certs: true,
        }
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Fingerprints of the input and output kernels.
///
/// Each fingerprint is the SHA-256 of the kernel's canonical compact JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub input_fingerprint: [u8; 32],
    pub output_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    pub fn input_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.input_fingerprint)
    }

    pub fn output_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.output_fingerprint)
    }

    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"input_fingerprint\": \"{}\",\n  \"output_fingerprint\": \"{}\",\n  \"compiler_version\": \"{}\"\n}}\n",
            self.input_fingerprint_hex(),
            self.output_fingerprint_hex(),
            self.compiler_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// SHA-256 of the kernel's compact JSON.
pub fn kernel_fingerprint(kernel: &Kernel) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let canonical = serde_json::to_vec(kernel).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

pub fn compute_provenance(input: &Kernel, output: &Kernel) -> Provenance {
    Provenance {
        input_fingerprint: kernel_fingerprint(input),
        output_fingerprint: kernel_fingerprint(output),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Output and error types ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PreprocessOutput {
    pub kernel: Kernel,
    /// Advisories from every pass, in pass order.
    pub diagnostics: Vec<Diagnostic>,
    pub provenance: Provenance,
}

/// Preprocessing stopped at a pass that produced an error.
#[derive(Debug, Clone)]
pub struct PreprocessError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
    /// Every diagnostic up to and including the failing pass.
    pub diagnostics: Vec<Diagnostic>,
}

impl PreprocessError {
    /// The first error-level diagnostic.
    pub fn error(&self) -> Option<&Diagnostic> {
        self.diagnostics.iter().find(|d| d.is_error())
    }
}

impl fmt::Display for PreprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", descriptor(self.failing_pass).name)?;
        if let Some(d) = self.error() {
            write!(f, ": {}", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for PreprocessError {}

// ── Pass execution ─────────────────────────────────────────────────────────

fn no_diags(kernel: Kernel) -> PassResult {
    PassResult {
        kernel,
        diagnostics: Vec::new(),
    }
}

fn run_pass(pass_id: PassId, kernel: &Kernel) -> Result<PassResult, Diagnostic> {
    Ok(match pass_id {
        PassId::MarkLocal => no_diags(mark_local_temporaries(kernel)),
        PassId::DuplicateInames => no_diags(duplicate_reduction_inames(kernel)?),
        PassId::RealizeReduction => no_diags(realize_reduction(kernel)?),
        PassId::AssignAxes => no_diags(assign_automatic_axes(kernel)?),
        PassId::InferDependencies => add_boostability_and_automatic_dependencies(kernel),
        PassId::LimitBoostability => no_diags(limit_boostability(kernel)?),
        PassId::AdjustStorage => adjust_local_temp_var_storage(kernel),
    })
}

/// Check the certificate of `pass_id`, comparing against the pass input
/// where the obligation depends on it.
fn certify(pass_id: PassId, before: &Kernel, after: &Kernel) -> Option<Diagnostic> {
    let obligations = match pass_id {
        PassId::MarkLocal | PassId::DuplicateInames => return None,
        PassId::RealizeReduction => ReductionCert::check(after).obligations(),
        PassId::AssignAxes => {
            let local_size = before.local_axis_lengths().unwrap_or_default();
            AxisCert::check(after, &local_size).obligations()
        }
        PassId::InferDependencies => BoostCert::check(after, false).obligations(),
        PassId::LimitBoostability => BoostCert::check(after, true).obligations(),
        PassId::AdjustStorage => StorageCert::check(after).obligations(),
    };
    let failed: Vec<&str> = obligations
        .iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| *name)
        .collect();
    if failed.is_empty() {
        return None;
    }
    let desc = descriptor(pass_id);
    Some(
        Diagnostic::error(
            codes::E0705,
            Subject::Kernel,
            format!("verification failed after {}: {}", desc.name, failed.join(", ")),
        )
        .with_hint(format!("{} must guarantee: {}", desc.name, desc.invariants)),
    )
}

/// Per-pass post-processing: callback, accumulate, log, error check.
fn finish_pass_core(
    all_diags: &mut Vec<Diagnostic>,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PreprocessError> {
    on_pass_complete(pass_id, &diags);
    for d in diags.iter().filter(|d| d.level == DiagLevel::Warning) {
        tracing::warn!(pass = descriptor(pass_id).name, "{}", d);
    }
    let is_err = has_errors(&diags);
    all_diags.extend(diags);
    let desc = descriptor(pass_id);
    tracing::debug!(
        pass = desc.name,
        rewrote = ?desc.outputs,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "pass complete"
    );
    if is_err {
        return Err(PreprocessError {
            failing_pass: pass_id,
            diagnostics: std::mem::take(all_diags),
        });
    }
    Ok(())
}

// ── Driver ─────────────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `options.terminal`.
///
/// Per-pass sequence: execute → certificate → on_pass_complete → error check.
pub fn preprocess_kernel(
    kernel: &Kernel,
    options: &PreprocessOptions,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<PreprocessOutput, PreprocessError> {
    let mut all_diags = Vec::new();
    let mut current = kernel.clone();

    for pass_id in required_passes(options.terminal) {
        let t = Instant::now();
        let (next, mut diags) = match run_pass(pass_id, &current) {
            Ok(result) => (Some(result.kernel), result.diagnostics),
            Err(fatal) => (None, vec![fatal]),
        };
        if let Some(next) = &next {
            if options.check_certs {
                diags.extend(certify(pass_id, &current, next));
            }
        }
        finish_pass_core(&mut all_diags, pass_id, diags, t.elapsed(), &mut on_pass_complete)?;
        if let Some(next) = next {
            current = next;
        }
    }

    let provenance = compute_provenance(kernel, &current);
    Ok(PreprocessOutput {
        kernel: current,
        diagnostics: all_diags,
        provenance,
    })
}

/// Run every pass with default options.
pub fn preprocess(kernel: &Kernel) -> Result<PreprocessOutput, PreprocessError> {
    preprocess_kernel(kernel, &PreprocessOptions::default(), |_, _| {})
}

// ── Tests ──────────────────────────────────────────────────────────────────
