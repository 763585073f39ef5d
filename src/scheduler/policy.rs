//! Queue ordering policy.

use std::collections::{HashMap, VecDeque};

use crate::scheduler::RequestId;
use crate::sequence::SequenceGroup;

/// Decides the service order of a queue of sequence groups.
#[derive(Debug, Clone, Copy, Default)]
pub enum SchedulingPolicy {
    /// First-come-first-served: earliest arrival runs first.
    #[default]
    Fcfs,
}

impl SchedulingPolicy {
    /// Reorder `queue` in place, highest priority first. The sort is
    /// stable, so groups with equal priority keep their FIFO order.
    pub fn sort_by_priority(
        &self,
        queue: &mut VecDeque<RequestId>,
        groups: &HashMap<RequestId, SequenceGroup>,
    ) {
        match self {
            SchedulingPolicy::Fcfs => {
                let mut ids: Vec<RequestId> = queue.drain(..).collect();
                ids.sort_by_key(|id| groups[id].arrival_time);
                queue.extend(ids);
            }
        }
    }
}
