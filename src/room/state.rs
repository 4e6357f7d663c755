use std::collections::{HashMap, HashSet};

use crate::signaling::ParticipantInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub username: Option<String>,
    pub is_local: bool,
    pub speaking: bool,
    pub muted: bool,
}

impl Participant {
    fn new(id: String, username: Option<String>, is_local: bool) -> Self {
        Self {
            id,
            username,
            is_local,
            speaking: false,
            muted: false,
        }
    }

    /// Username, or `User <first five characters of the id>` when the server sent none.
    pub fn display_name(&self) -> String {
        match self.username.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("User {}", self.id.chars().take(5).collect::<String>()),
        }
    }
}

/// Local cache of the room roster. The server stays authoritative.
#[derive(Debug)]
pub struct Room {
    id: String,
    local_id: String,
    participants: HashMap<String, Participant>,
}

impl Room {
    pub fn new(id: String, local_id: String, local_username: Option<String>) -> Self {
        let mut participants = HashMap::new();
        participants.insert(
            local_id.clone(),
            Participant::new(local_id.clone(), local_username, true),
        );
        Self {
            id,
            local_id,
            participants,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local(&self) -> Option<&Participant> {
        self.participants.get(&self.local_id)
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Adds a remote participant, or refreshes its username. Returns `true` when it was new.
    pub fn upsert_remote(&mut self, id: &str, username: Option<String>) -> bool {
        if id == self.local_id {
            return false;
        }
        match self.participants.get_mut(id) {
            Some(existing) => {
                if username.is_some() {
                    existing.username = username;
                }
                false
            }
            None => {
                self.participants
                    .insert(id.to_string(), Participant::new(id.to_string(), username, false));
                true
            }
        }
    }

    /// Removes a remote participant. The local participant is never removed.
    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        if id == self.local_id {
            return None;
        }
        self.participants.remove(id)
    }

    pub fn remote_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .participants
            .keys()
            .filter(|id| **id != self.local_id)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Remote participants the server no longer reports.
    pub fn stale_ids(&self, reported: &[ParticipantInfo]) -> Vec<String> {
        let reported: HashSet<&str> = reported.iter().map(|p| p.id.as_str()).collect();
        self.remote_ids()
            .into_iter()
            .filter(|id| !reported.contains(id.as_str()))
            .collect()
    }

    pub fn set_speaking(&mut self, id: &str, speaking: bool) -> bool {
        match self.participants.get_mut(id) {
            Some(participant) => {
                participant.speaking = speaking;
                true
            }
            None => false,
        }
    }

    pub fn set_muted(&mut self, id: &str, muted: bool) -> bool {
        match self.participants.get_mut(id) {
            Some(participant) => {
                participant.muted = muted;
                true
            }
            None => false,
        }
    }
}
