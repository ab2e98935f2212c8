//! Who is connected to a session.

use std::collections::HashMap;

/// Participants of one session.
///
/// A participant may be connected more than once (several tabs); they count
/// as present until their last connection leaves.
#[derive(Debug, Default)]
pub struct Roster {
    connections: HashMap<String, usize>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns true if the participant is new.
    pub fn join(&mut self, participant_id: &str) -> bool {
        let count = self.connections.entry(participant_id.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop a connection. Returns true if the participant is now gone.
    pub fn leave(&mut self, participant_id: &str) -> bool {
        match self.connections.get_mut(participant_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.connections.remove(participant_id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.connections.contains_key(participant_id)
    }

    /// Number of distinct participants.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }
}
