use std::collections::HashSet;

/// Tracks the local participant id and the set of connected remote ids.
///
/// Updated by the session event loop. Mirrors exactly the remote
/// participants the engine currently reports as connected.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRoster {
    remote: HashSet<u32>,
    local_id: Option<u32>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_id(&mut self, id: u32) {
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<u32> {
        self.local_id
    }

    /// Returns `true` if the id was not already present.
    pub fn add_remote(&mut self, id: u32) -> bool {
        self.remote.insert(id)
    }

    /// Returns `true` if the id was present.
    pub fn remove_remote(&mut self, id: u32) -> bool {
        self.remote.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.remote.contains(&id)
    }

    pub fn remote_ids(&self) -> &HashSet<u32> {
        &self.remote
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    pub fn clear(&mut self) {
        self.remote.clear();
        self.local_id = None;
    }
}
