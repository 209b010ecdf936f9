// device.rs — Device capability descriptor
//
// The few numeric facts the preprocessing passes consume: local memory size
// and kind, bank count and access granularity, and the SIMD group width used
// when estimating bank conflicts. Descriptors are plain serde records so they
// can be loaded from JSON or taken from a preset.
//
// Preconditions: `bank_count`, `simd_group_size` and `bank_granularity` are
//   nonzero for conflict analysis.
// Postconditions: none.
// Failure modes: malformed JSON yields a `serde_json::Error`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// How the device implements `__local` memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalMemKind {
    /// Dedicated on-chip scratchpad with banks.
    Local,
    /// Emulated in global memory (typical for CPUs).
    Global,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    /// Local memory per work group, in bytes.
    pub local_mem_size: u64,
    /// Bytes of local memory the runtime reserves (e.g. for kernel arguments).
    #[serde(default)]
    pub reserved_local_mem: u64,
    pub local_mem_kind: LocalMemKind,
    pub bank_count: u32,
    /// Bytes served by one bank per access.
    pub bank_granularity: u32,
    /// Lanes that access local memory simultaneously.
    pub simd_group_size: u32,
}

/// Result of a bank-conflict check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    /// Worst-case number of distinct words served by a single bank.
    pub multiplier: u32,
    /// Why the access is not conflict-free, if it is not.
    pub reason: Option<String>,
}

impl Device {
    pub fn nvidia_fermi() -> Self {
        Device {
            name: "nvidia-fermi".to_string(),
            local_mem_size: 48 * 1024,
            reserved_local_mem: 0,
            local_mem_kind: LocalMemKind::Local,
            bank_count: 32,
            bank_granularity: 4,
            simd_group_size: 32,
        }
    }

    pub fn generic_cpu() -> Self {
        Device {
            name: "generic-cpu".to_string(),
            local_mem_size: 32 * 1024,
            reserved_local_mem: 0,
            local_mem_kind: LocalMemKind::Global,
            bank_count: 1,
            bank_granularity: 4,
            simd_group_size: 1,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn usable_local_mem_size(&self) -> u64 {
        self.local_mem_size.saturating_sub(self.reserved_local_mem)
    }

    /// Conflict multiplier for one SIMD group sweeping an array along each
    /// axis in turn.
    ///
    /// `shape` is the logical extent, `storage_shape` the padded layout
    /// (row-major). Lanes are spread over the chosen axis and the axes to its
    /// left, the way consecutive work items are laid out. Identical addresses
    /// are broadcast and do not conflict.
    pub fn local_access_conflicts(
        &self,
        itemsize: u64,
        shape: &[i64],
        storage_shape: &[i64],
    ) -> ConflictReport {
        let rank = shape.len();
        let banks = u64::from(self.bank_count.max(1));
        let granularity = u64::from(self.bank_granularity.max(1));

        // Axis 0 below is the fastest-varying (rightmost) one.
        let dims: Vec<(u64, u64)> = shape
            .iter()
            .rev()
            .zip(storage_shape.iter().rev())
            .map(|(&s, &st)| (s.max(1) as u64, st.max(1) as u64))
            .collect();

        for lane_axis in 0..rank {
            let mut words_per_bank: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
            for lane in 0..u64::from(self.simd_group_size.max(1)) {
                let mut left_over = lane;
                let mut addr = 0u64;
                let mut stride = itemsize;
                for (axis, (size, stored)) in dims.iter().enumerate() {
                    let idx = if axis >= lane_axis {
                        let i = left_over % size;
                        left_over /= size;
                        i
                    } else {
                        0
                    };
                    addr += idx * stride;
                    stride *= stored;
                }
                let word = addr / granularity;
                words_per_bank.entry(word % banks).or_default().insert(word);
            }
            let (bank, worst) = words_per_bank
                .iter()
                .map(|(b, words)| (*b, words.len() as u32))
                .max_by_key(|(b, n)| (*n, std::cmp::Reverse(*b)))
                .unwrap_or((0, 1));
            if worst > 1 {
                return ConflictReport {
                    multiplier: worst,
                    reason: Some(format!(
                        "{}x conflict on axis {} (from right, 0-based): bank {} serves {} words",
                        worst, lane_axis, bank, worst
                    )),
                };
            }
        }
        ConflictReport {
            multiplier: 1,
            reason: None,
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::nvidia_fermi()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_tile_conflicts_along_columns() {
        let dev = Device::nvidia_fermi();
        let report = dev.local_access_conflicts(4, &[32, 32], &[32, 32]);
        assert_eq!(report.multiplier, 32);
        assert!(report.reason.unwrap().contains("axis 1"));
    }

    #[test]
    fn padding_by_one_removes_conflicts() {
        let dev = Device::nvidia_fermi();
        let report = dev.local_access_conflicts(4, &[32, 32], &[32, 33]);
        assert_eq!(report.multiplier, 1);
        assert!(report.reason.is_none());
    }

    #[test]
    fn half_warp_rows_wrap_onto_the_same_bank() {
        // Rows of 16 padded to 17: the second row's last element lands on bank 0.
        let dev = Device::nvidia_fermi();
        assert_eq!(dev.local_access_conflicts(4, &[16, 16], &[16, 17]).multiplier, 2);
    }

    #[test]
    fn one_dimensional_access_is_conflict_free() {
        let dev = Device::nvidia_fermi();
        assert_eq!(dev.local_access_conflicts(4, &[256], &[256]).multiplier, 1);
    }

    #[test]
    fn loads_from_json() {
        let json = r#"{
            "name": "small",
            "local_mem_size": 2100,
            "local_mem_kind": "local",
            "bank_count": 32,
            "bank_granularity": 4,
            "simd_group_size": 32
        }"#;
        let dev = Device::from_json(json).unwrap();
        assert_eq!(dev.usable_local_mem_size(), 2100);
        assert_eq!(dev.local_mem_kind, LocalMemKind::Local);
    }
}
