// schedule.rs — Schedule items and block structure
//
// A schedule is a flat list of items produced by a scheduler outside this
// crate. Loops and subkernels are begin/end item pairs; this module finds
// matching ends and collects the instructions run inside a block.
//
// Preconditions: none; malformed nesting is reported as `ScheduleError`.
// Postconditions: none.
// Failure modes: unmatched begin items, out-of-range positions.
// Side effects: none.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleItem {
    EnterLoop { iname: String },
    LeaveLoop { iname: String },
    CallKernel { name: String },
    ReturnFromKernel { name: String },
    Barrier,
    RunInstruction { insn_id: String },
}

impl ScheduleItem {
    pub fn is_begin_block(&self) -> bool {
        matches!(
            self,
            ScheduleItem::EnterLoop { .. } | ScheduleItem::CallKernel { .. }
        )
    }

    pub fn is_end_block(&self) -> bool {
        matches!(
            self,
            ScheduleItem::LeaveLoop { .. } | ScheduleItem::ReturnFromKernel { .. }
        )
    }
}

impl fmt::Display for ScheduleItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleItem::EnterLoop { iname } => write!(f, "for {}", iname),
            ScheduleItem::LeaveLoop { iname } => write!(f, "end {}", iname),
            ScheduleItem::CallKernel { name } => write!(f, "call {}", name),
            ScheduleItem::ReturnFromKernel { name } => write!(f, "return {}", name),
            ScheduleItem::Barrier => write!(f, "barrier"),
            ScheduleItem::RunInstruction { insn_id } => write!(f, "run {}", insn_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The kernel has not been scheduled.
    Missing,
    OutOfRange { index: usize, len: usize },
    /// A begin item without a matching end item.
    Unmatched { index: usize },
    /// A `LeaveLoop` for an iname that is not active.
    InactiveLoop { index: usize, iname: String },
    NotBeginBlock { index: usize },
    NotCallKernel { index: usize },
    UnknownInstruction { index: usize, insn_id: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Missing => write!(f, "kernel has no schedule"),
            ScheduleError::OutOfRange { index, len } => {
                write!(f, "schedule position {} out of range (length {})", index, len)
            }
            ScheduleError::Unmatched { index } => {
                write!(f, "block opened at position {} is never closed", index)
            }
            ScheduleError::InactiveLoop { index, iname } => {
                write!(f, "position {} leaves loop '{}' which is not active", index, iname)
            }
            ScheduleError::NotBeginBlock { index } => {
                write!(f, "position {} does not open a block", index)
            }
            ScheduleError::NotCallKernel { index } => {
                write!(f, "position {} is not a kernel call", index)
            }
            ScheduleError::UnknownInstruction { index, insn_id } => {
                write!(f, "position {} runs unknown instruction '{}'", index, insn_id)
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// The block opened at `start` and the position of its matching end item.
pub fn gather_schedule_block(
    schedule: &[ScheduleItem],
    start: usize,
) -> Result<(&[ScheduleItem], usize), ScheduleError> {
    let first = schedule.get(start).ok_or(ScheduleError::OutOfRange {
        index: start,
        len: schedule.len(),
    })?;
    if !first.is_begin_block() {
        return Err(ScheduleError::NotBeginBlock { index: start });
    }
    let mut depth = 0usize;
    for (i, item) in schedule.iter().enumerate().skip(start) {
        if item.is_begin_block() {
            depth += 1;
        } else if item.is_end_block() {
            depth -= 1;
            if depth == 0 {
                return Ok((&schedule[start..=i], i));
            }
        }
    }
    Err(ScheduleError::Unmatched { index: start })
}

/// Ids of all instructions run inside the block opened at `start`.
pub fn insn_ids_for_block_at(
    schedule: &[ScheduleItem],
    start: usize,
) -> Result<BTreeSet<String>, ScheduleError> {
    let (block, _) = gather_schedule_block(schedule, start)?;
    Ok(block
        .iter()
        .filter_map(|item| match item {
            ScheduleItem::RunInstruction { insn_id } => Some(insn_id.clone()),
            _ => None,
        })
        .collect())
}
