//! Resource barrier batching.
use rustc_hash::FxHashMap;

use crate::host::{Barrier, Command, CommandList, Resource, ResourceState};

/// Collects barriers and flushes them as a single host command.
///
/// Also the only owner of the current state of tracked resources: translation code asks for a
/// resource to be in a state and the batcher works out the transition.
#[derive(Debug, Default)]
pub struct Barriers {
    pending: Vec<Barrier>,
    states: FxHashMap<Resource, ResourceState>,
}

impl Barriers {
    /// Starts tracking `resource`, currently in `state`.
    pub fn track(&mut self, resource: Resource, state: ResourceState) {
        self.states.insert(resource, state);
    }

    /// Stops tracking `resource`.
    pub fn forget(&mut self, resource: Resource) {
        self.states.remove(&resource);
    }

    /// Current state of a tracked resource. Untracked resources are in the common state.
    pub fn state(&self, resource: Resource) -> ResourceState {
        self.states
            .get(&resource)
            .copied()
            .unwrap_or(ResourceState::Common)
    }

    /// Queues a transition. Does nothing if `before == after`.
    pub fn push_transition(
        &mut self,
        resource: Resource,
        before: ResourceState,
        after: ResourceState,
    ) {
        if before == after {
            return;
        }

        self.pending.push(Barrier::Transition {
            resource,
            before,
            after,
        });
    }

    /// Moves a tracked resource to `state`, returning whether a transition was queued.
    pub fn transition(&mut self, resource: Resource, state: ResourceState) -> bool {
        let current = self.states.entry(resource).or_insert(ResourceState::Common);
        let before = std::mem::replace(current, state);
        self.push_transition(resource, before, state);
        before != state
    }

    pub fn push_aliasing(&mut self, before: Option<Resource>, after: Option<Resource>) {
        self.pending.push(Barrier::Aliasing { before, after });
    }

    pub fn push_uav(&mut self, resource: Option<Resource>) {
        self.pending.push(Barrier::Uav(resource));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Records every pending barrier as one command. Returns whether anything was recorded.
    pub fn submit(&mut self, commands: &mut CommandList) -> bool {
        if self.pending.is_empty() {
            return false;
        }

        commands.push(Command::Barriers(std::mem::take(&mut self.pending)));
        true
    }
}
