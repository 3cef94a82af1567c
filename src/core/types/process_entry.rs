//! Process snapshot entries returned by backend enumeration

use std::collections::{HashMap, HashSet};

/// One process in a backend snapshot.
///
/// `sequence_number` is the OS creation-order counter where available; it
/// lets the caller sort a snapshot by creation time instead of pid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeProcessEntry {
    pub name: String,

    /// Parent pid, or [`NativeProcessEntry::INVALID_PARENT`] when the parent
    /// is unknown or was excluded by the snapshot filter.
    pub parent_id: u32,

    pub sequence_number: u64,
}

impl NativeProcessEntry {
    /// Sentinel parent id so filtered process trees don't dangle.
    pub const INVALID_PARENT: u32 = u32::MAX;
}

/// pid -> entry map produced by `get_processes`
pub type NativeProcessMap = HashMap<u32, NativeProcessEntry>;

/// Applies the snapshot filter contract shared by all backends: entries for
/// filtered pids are dropped, and surviving entries whose parent is in the
/// filtered set get their parent remapped to the invalid sentinel.
pub fn apply_pid_filter(map: &mut NativeProcessMap, pid_filter: &HashSet<u32>) {
    if pid_filter.is_empty() {
        return;
    }

    map.retain(|pid, _| !pid_filter.contains(pid));
    for entry in map.values_mut() {
        if pid_filter.contains(&entry.parent_id) {
            entry.parent_id = NativeProcessEntry::INVALID_PARENT;
        }
    }
}
