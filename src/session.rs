use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize, Serializer};

use crate::encoding;

/// Per-client session counters.
///
/// The archive keeps one of these as its current-session table, advanced by
/// explicit client resets, and every recording keeps one noting the session in
/// which it was last served to each client. A fresh recording answers `get`
/// with its starting session of 0 while a replay archive starts clients at
/// session 1, which is how the matcher tells "never served" apart from
/// "served in the current session".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSessions {
    #[serde(
        rename = "SessionIds",
        default,
        deserialize_with = "encoding::null_to_default"
    )]
    ids: BTreeMap<String, u32>,
    #[serde(rename = "StartingSessionId", default)]
    starting_session: u32,
}

impl ClientSessions {
    pub fn new(starting_session: u32) -> Self {
        Self {
            ids: BTreeMap::new(),
            starting_session,
        }
    }

    /// Returns the counter stored for `remote_addr`, or the starting session
    /// for clients that have never been stored. Never inserts.
    pub fn get(&self, remote_addr: &str) -> u32 {
        self.ids
            .get(remote_addr)
            .copied()
            .unwrap_or(self.starting_session)
    }

    /// Stores 0 for an unknown client, otherwise advances the stored counter
    /// with 32-bit wraparound.
    pub fn increment(&mut self, remote_addr: &str) {
        let next = match self.ids.get(remote_addr) {
            None => 0,
            Some(current) => current.wrapping_add(1),
        };
        self.ids.insert(remote_addr.to_owned(), next);
    }

    pub fn set(&mut self, remote_addr: &str, session_id: u32) {
        self.ids.insert(remote_addr.to_owned(), session_id);
    }
}

/// Session counters behind a lock, so replay paths holding `&Archive` can
/// update them while other threads match concurrently. Every critical
/// section is a single map read or write.
#[derive(Debug, Default)]
pub struct SessionCell(Mutex<ClientSessions>);

impl SessionCell {
    pub fn new(sessions: ClientSessions) -> Self {
        Self(Mutex::new(sessions))
    }

    pub fn get(&self, remote_addr: &str) -> u32 {
        self.lock().get(remote_addr)
    }

    pub fn increment(&self, remote_addr: &str) {
        self.lock().increment(remote_addr);
    }

    pub fn set(&self, remote_addr: &str, session_id: u32) {
        self.lock().set(remote_addr, session_id);
    }

    pub fn snapshot(&self) -> ClientSessions {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, ClientSessions> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Serialize for SessionCell {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.lock().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SessionCell {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        ClientSessions::deserialize(deserializer).map(Self::new)
    }
}
