//! Reconciliation-cycle boundary detection.

use kview_core::{ObjectChange, ObjectRef};

/// Index where the latest cycle starts in a sequence of settled/unsettled
/// states ordered oldest to newest: the last position whose state is settled
/// right after an unsettled one. `None` when no such transition exists.
pub fn find_cycle_start(states: &[bool]) -> Option<usize> {
    (1..states.len()).rev().find(|&i| states[i] && !states[i - 1])
}

/// Same boundary expressed as an index into `changes`, considering only the
/// changes of `root` that carry an evaluated state.
pub fn latest_cycle_start(changes: &[ObjectChange], root: &ObjectRef) -> Option<usize> {
    let stamped: Vec<(usize, bool)> = changes
        .iter()
        .enumerate()
        .filter(|(_, c)| c.object_reference.to_ref() == *root)
        .filter_map(|(i, c)| c.state.map(|s| (i, s)))
        .collect();
    let states: Vec<bool> = stamped.iter().map(|(_, s)| *s).collect();
    find_cycle_start(&states).map(|at| stamped[at].0)
}
