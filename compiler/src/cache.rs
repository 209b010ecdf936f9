// cache.rs — Schedule-indexed query cache
//
// Answers position queries over a scheduled kernel: which inames are active,
// which subkernel contains a point, whether a block contains a barrier, and
// which parallel inames a subkernel may use in conditionals. All tables are
// built in linear forward passes when the cache is created.
//
// The cache borrows exactly one kernel for its whole lifetime; a different
// kernel needs a new cache.
//
// Preconditions: `kernel.schedule` is set and well nested.
// Postconditions: none.
// Failure modes: missing schedule, unmatched blocks, leaving an inactive loop,
//   unknown instruction ids, out-of-range positions.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use crate::kernel::{IndexTag, Kernel};
use crate::schedule::{insn_ids_for_block_at, ScheduleError, ScheduleItem};

pub struct CodegenCache<'k> {
    kernel: &'k Kernel,
    schedule: &'k [ScheduleItem],
    /// Active inames just before each position, `len + 1` entries.
    active: Vec<BTreeSet<String>>,
    /// Enclosing `CallKernel` position just before each position.
    callkernel: Vec<Option<usize>>,
    /// Matching end position of each begin-block item.
    block_end: Vec<Option<usize>>,
    /// Number of barriers strictly before each position.
    barriers_before: Vec<usize>,
    /// Per `CallKernel` position: usable inames without and with a barrier.
    subkernel_usable: BTreeMap<usize, [BTreeSet<String>; 2]>,
}

impl<'k> CodegenCache<'k> {
    pub fn new(kernel: &'k Kernel) -> Result<Self, ScheduleError> {
        let schedule = kernel.schedule.as_deref().ok_or(ScheduleError::Missing)?;
        let n = schedule.len();

        let mut active = Vec::with_capacity(n + 1);
        let mut callkernel = Vec::with_capacity(n + 1);
        let mut barriers_before = Vec::with_capacity(n + 1);
        let mut block_end = vec![None; n];
        let mut open: Vec<usize> = Vec::new();

        let mut current = BTreeSet::new();
        let mut enclosing = None;
        let mut barriers = 0;
        active.push(current.clone());
        callkernel.push(enclosing);
        barriers_before.push(barriers);

        for (index, item) in schedule.iter().enumerate() {
            match item {
                ScheduleItem::EnterLoop { iname } => {
                    current.insert(iname.clone());
                }
                ScheduleItem::LeaveLoop { iname } => {
                    if !current.remove(iname) {
                        return Err(ScheduleError::InactiveLoop {
                            index,
                            iname: iname.clone(),
                        });
                    }
                }
                ScheduleItem::CallKernel { .. } => enclosing = Some(index),
                ScheduleItem::ReturnFromKernel { .. } => enclosing = None,
                ScheduleItem::Barrier => barriers += 1,
                ScheduleItem::RunInstruction { insn_id } => {
                    if kernel.insn(insn_id).is_none() {
                        return Err(ScheduleError::UnknownInstruction {
                            index,
                            insn_id: insn_id.clone(),
                        });
                    }
                }
            }
            if item.is_begin_block() {
                open.push(index);
            } else if item.is_end_block() {
                let start = open.pop().ok_or(ScheduleError::NotBeginBlock { index })?;
                block_end[start] = Some(index);
            }
            active.push(current.clone());
            callkernel.push(enclosing);
            barriers_before.push(barriers);
        }
        if let Some(&index) = open.first() {
            return Err(ScheduleError::Unmatched { index });
        }

        let mut cache = CodegenCache {
            kernel,
            schedule,
            active,
            callkernel,
            block_end,
            barriers_before,
            subkernel_usable: BTreeMap::new(),
        };
        for (index, item) in schedule.iter().enumerate() {
            if matches!(item, ScheduleItem::CallKernel { .. }) {
                let usable = [
                    cache.compute_subkernel_usable(index, false)?,
                    cache.compute_subkernel_usable(index, true)?,
                ];
                cache.subkernel_usable.insert(index, usable);
            }
        }
        Ok(cache)
    }

    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    pub fn schedule_len(&self) -> usize {
        self.schedule.len()
    }

    fn check_point(&self, index: usize) -> Result<(), ScheduleError> {
        if index > self.schedule.len() {
            return Err(ScheduleError::OutOfRange {
                index,
                len: self.schedule.len(),
            });
        }
        Ok(())
    }

    fn check_item(&self, index: usize) -> Result<&'k ScheduleItem, ScheduleError> {
        self.schedule.get(index).ok_or(ScheduleError::OutOfRange {
            index,
            len: self.schedule.len(),
        })
    }

    /// Inames active at the point just before `index`.
    pub fn find_active_inames_at(&self, index: usize) -> Result<&BTreeSet<String>, ScheduleError> {
        self.check_point(index)?;
        Ok(&self.active[index])
    }

    /// Position of the `CallKernel` containing the point just before
    /// `index`, or `None` outside every subkernel.
    pub fn get_callkernel_index(&self, index: usize) -> Result<Option<usize>, ScheduleError> {
        self.check_point(index)?;
        Ok(self.callkernel[index])
    }

    /// For a begin-block item: whether its block contains a barrier. True
    /// for a barrier itself, false for any other item.
    pub fn has_barrier_within(&self, index: usize) -> Result<bool, ScheduleError> {
        let item = self.check_item(index)?;
        if item.is_begin_block() {
            let end = self.block_end[index].ok_or(ScheduleError::Unmatched { index })?;
            return Ok(self.barriers_before[end] > self.barriers_before[index + 1]);
        }
        Ok(matches!(item, ScheduleItem::Barrier))
    }

    pub fn get_insn_ids_for_block_at(&self, index: usize) -> Result<BTreeSet<String>, ScheduleError> {
        insn_ids_for_block_at(self.schedule, index)
    }

    /// Parallel inames of a subkernel's instructions usable in conditionals:
    /// concurrent, not vector lanes, not ILP, and not local axes when the
    /// conditional crosses a barrier.
    pub fn usable_inames_in_subkernel(
        &self,
        subkernel_index: usize,
        crosses_barrier: bool,
    ) -> Result<&BTreeSet<String>, ScheduleError> {
        self.subkernel_usable
            .get(&subkernel_index)
            .map(|usable| &usable[usize::from(crosses_barrier)])
            .ok_or(ScheduleError::NotCallKernel {
                index: subkernel_index,
            })
    }

    fn compute_subkernel_usable(
        &self,
        subkernel_index: usize,
        crosses_barrier: bool,
    ) -> Result<BTreeSet<String>, ScheduleError> {
        let ids = self.get_insn_ids_for_block_at(subkernel_index)?;
        Ok(ids
            .iter()
            .filter_map(|id| self.kernel.insn(id))
            .flat_map(|insn| self.kernel.insn_inames(insn))
            .filter(|iname| {
                let tag = self.kernel.iname_tag(iname);
                tag.is_concurrent()
                    && !matches!(tag, IndexTag::Vectorize | IndexTag::Ilp)
                    && !(tag.is_local() && crosses_barrier)
            })
            .collect())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::Device;
    use crate::resolve::load_kernel;

    fn names(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    pub(crate) fn scheduled_kernel() -> Kernel {
        let mut k = load_kernel(
            "domain [g, m, i, v] : 0 <= g < n and 0 <= m < 16 and 0 <= i < n and 0 <= v < 4\n\
             tag g = g.0, m = l.0, i = seq, v = vec\n\
             insn a: x[g, m] = i\n\
             insn b: y[g, m, v] = 1\n\
             insn c: z = 2\n",
            &Device::nvidia_fermi(),
        )
        .unwrap();
        let s = |name: &str| name.to_string();
        k.schedule = Some(vec![
            ScheduleItem::CallKernel { name: s("knl") },
            ScheduleItem::EnterLoop { iname: s("i") },
            ScheduleItem::RunInstruction { insn_id: s("a") },
            ScheduleItem::Barrier,
            ScheduleItem::LeaveLoop { iname: s("i") },
            ScheduleItem::RunInstruction { insn_id: s("b") },
            ScheduleItem::ReturnFromKernel { name: s("knl") },
            ScheduleItem::RunInstruction { insn_id: s("c") },
        ]);
        k
    }

    #[test]
    fn active_inames_before_each_point() {
        let k = scheduled_kernel();
        let cache = CodegenCache::new(&k).unwrap();
        assert!(cache.find_active_inames_at(0).unwrap().is_empty());
        assert!(cache.find_active_inames_at(1).unwrap().is_empty());
        assert_eq!(names(cache.find_active_inames_at(2).unwrap()), vec!["i"]);
        assert_eq!(names(cache.find_active_inames_at(4).unwrap()), vec!["i"]);
        assert!(cache.find_active_inames_at(5).unwrap().is_empty());
        assert!(cache.find_active_inames_at(8).unwrap().is_empty());
        assert!(cache.find_active_inames_at(9).is_err());
    }

    #[test]
    fn callkernel_index() {
        let k = scheduled_kernel();
        let cache = CodegenCache::new(&k).unwrap();
        assert_eq!(cache.get_callkernel_index(0).unwrap(), None);
        assert_eq!(cache.get_callkernel_index(1).unwrap(), Some(0));
        assert_eq!(cache.get_callkernel_index(6).unwrap(), Some(0));
        assert_eq!(cache.get_callkernel_index(7).unwrap(), None);
    }

    #[test]
    fn barriers_within_blocks() {
        let k = scheduled_kernel();
        let cache = CodegenCache::new(&k).unwrap();
        assert!(cache.has_barrier_within(0).unwrap());
        assert!(cache.has_barrier_within(1).unwrap());
        assert!(!cache.has_barrier_within(2).unwrap());
        assert!(cache.has_barrier_within(3).unwrap());
        assert!(!cache.has_barrier_within(5).unwrap());
    }

    #[test]
    fn subkernel_usable_inames() {
        let k = scheduled_kernel();
        let cache = CodegenCache::new(&k).unwrap();
        assert_eq!(names(cache.usable_inames_in_subkernel(0, false).unwrap()), vec!["g", "m"]);
        assert_eq!(names(cache.usable_inames_in_subkernel(0, true).unwrap()), vec!["g"]);
        assert_eq!(
            cache.usable_inames_in_subkernel(1, false),
            Err(ScheduleError::NotCallKernel { index: 1 })
        );
        let ids = cache.get_insn_ids_for_block_at(0).unwrap();
        assert_eq!(names(&ids), vec!["a", "b"]);
    }

    #[test]
    fn malformed_schedules_are_rejected() {
        let mut k = scheduled_kernel();
        k.schedule = None;
        assert_eq!(CodegenCache::new(&k).err(), Some(ScheduleError::Missing));

        k.schedule = Some(vec![ScheduleItem::LeaveLoop {
            iname: "i".to_string(),
        }]);
        assert!(matches!(
            CodegenCache::new(&k).err(),
            Some(ScheduleError::InactiveLoop { index: 0, .. })
        ));

        k.schedule = Some(vec![ScheduleItem::EnterLoop {
            iname: "i".to_string(),
        }]);
        assert_eq!(CodegenCache::new(&k).err(), Some(ScheduleError::Unmatched { index: 0 }));

        k.schedule = Some(vec![ScheduleItem::RunInstruction {
            insn_id: "nope".to_string(),
        }]);
        assert!(matches!(
            CodegenCache::new(&k).err(),
            Some(ScheduleError::UnknownInstruction { index: 0, .. })
        ));
    }
}
