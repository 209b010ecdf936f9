// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used by the kernel front end and by
// every preprocessing pass. Fatal conditions travel as `Err(Diagnostic)` out
// of a pass; advisories are collected into the pass result and never alter
// control flow.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0700`, `W0702`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // ── Front end (E01xx) ──
    pub const E0100: DiagCode = DiagCode("E0100"); // syntax error
    pub const E0101: DiagCode = DiagCode("E0101"); // unknown iname in tag or inames()
    pub const E0102: DiagCode = DiagCode("E0102"); // duplicate variable name
    pub const E0103: DiagCode = DiagCode("E0103"); // non-affine domain constraint
    pub const E0104: DiagCode = DiagCode("E0104"); // duplicate instruction id
    pub const E0105: DiagCode = DiagCode("E0105"); // dependency on unknown instruction
    pub const E0106: DiagCode = DiagCode("E0106"); // invalid `set` directive
    pub const E0107: DiagCode = DiagCode("E0107"); // missing or repeated domain
    pub const E0108: DiagCode = DiagCode("E0108"); // reduction over unknown iname
    pub const E0109: DiagCode = DiagCode("E0109"); // unknown dtype or bad shape

    // ── Preprocessing, fatal (E07xx) ──
    pub const E0700: DiagCode = DiagCode("E0700"); // reduction survived realization
    pub const E0701: DiagCode = DiagCode("E0701"); // re-tagging a fixed iname
    pub const E0702: DiagCode = DiagCode("E0702"); // undetermined boostability
    pub const E0703: DiagCode = DiagCode("E0703"); // trip count not a compile-time constant
    pub const E0704: DiagCode = DiagCode("E0704"); // domain shape not countable
    pub const E0705: DiagCode = DiagCode("E0705"); // stage certificate failed
    pub const E0706: DiagCode = DiagCode("E0706"); // unknown iname in transform

    // ── Preprocessing, advisory (W07xx) ──
    pub const W0700: DiagCode = DiagCode("W0700"); // read, but never written
    pub const W0701: DiagCode = DiagCode("W0701"); // multiple writers, no declared dependency
    pub const W0702: DiagCode = DiagCode("W0702"); // no conflict-free local layout
    pub const W0703: DiagCode = DiagCode("W0703"); // unknown local memory type
    pub const W0704: DiagCode = DiagCode("W0704"); // flop count of unrealized reduction
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Subject ──────────────────────────────────────────────────────────────

/// The entity a diagnostic is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Kernel,
    Insn(String),
    Var(String),
    Iname(String),
    Source(Span),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Kernel => write!(f, "kernel"),
            Subject::Insn(id) => write!(f, "insn '{}'", id),
            Subject::Var(name) => write!(f, "variable '{}'", name),
            Subject::Iname(name) => write!(f, "iname '{}'", name),
            Subject::Source(span) => write!(f, "{}..{}", span.start, span.end),
        }
    }
}

// ── Related subject ──────────────────────────────────────────────────────

/// A secondary entity providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct Related {
    pub subject: Subject,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by the front end or a preprocessing pass.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub subject: Subject,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<Related>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, or related subjects.
    pub fn new(level: DiagLevel, subject: Subject, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            subject,
            message: message.into(),
            hint: None,
            related: Vec::new(),
        }
    }

    pub fn error(code: DiagCode, subject: Subject, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, subject, message).with_code(code)
    }

    pub fn warning(code: DiagCode, subject: Subject, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, subject, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related subject.
    pub fn with_related(mut self, subject: Subject, label: impl Into<String>) -> Self {
        self.related.push(Related {
            subject,
            label: label.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}: {}", level, code, self.subject, self.message)?;
        } else {
            write!(f, "{}: {}: {}", level, self.subject, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

/// True if any diagnostic in the slice is error-level.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(Diagnostic::is_error)
}
