// names.rs — Fresh, kernel-unique names
//
// Synthesized variables, inames and instruction ids are derived from a base
// name and made unique against everything already taken. Candidates are
// tried in a fixed order (`base`, `base_0`, `base_1`, ...), so allocation is
// deterministic for a given input.

use std::collections::BTreeSet;

/// Candidate names for `base`, in allocation order.
pub fn unique_candidates(base: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(base.to_string()).chain((0u64..).map(move |n| format!("{}_{}", base, n)))
}

/// Tracks taken names and hands out fresh ones.
#[derive(Debug, Clone, Default)]
pub struct UniqueNameGenerator {
    taken: BTreeSet<String>,
}

impl UniqueNameGenerator {
    pub fn new(taken: impl IntoIterator<Item = String>) -> Self {
        Self {
            taken: taken.into_iter().collect(),
        }
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.taken.contains(name)
    }

    /// Mark `name` as taken. Returns false if it already was.
    pub fn add(&mut self, name: &str) -> bool {
        self.taken.insert(name.to_string())
    }

    /// The first free candidate for `base`, now marked as taken.
    pub fn fresh(&mut self, base: &str) -> String {
        let name = first_free(base, |n| self.taken.contains(n));
        self.taken.insert(name.clone());
        name
    }
}

/// The first candidate for `base` for which `taken` is false.
pub fn first_free(base: &str, taken: impl Fn(&str) -> bool) -> String {
    unique_candidates(base)
        .find(|n| !taken(n))
        .unwrap_or_else(|| base.to_string())
}
