//! Game rooms and the pseudo-sessions around them.
//!
//! Sessions are preallocated: indices `0..room_count` are real rooms with
//! session 0 as the lobby, followed by three pseudo-sessions for idle slots,
//! pre-auth connections, and proxy links. Each session owns an intrusive
//! singly-linked chain of its users; the idle pseudo-session's chain doubles
//! as the user free list, so every slot is on exactly one chain at all
//! times.

use crate::user::{UserPool, UserState};
use crate::{GameSlot, SessionIdx, Slot};

/// Session 0 is the lobby: never cleared, never password-locked.
pub const LOBBY: SessionIdx = 0;

/// Seconds an empty session in the clearing state survives before the
/// sweep force-clears it.
pub const CLEAR_GRACE_SECS: u64 = 120;

/// Idle seconds after which a populated-looking but socketless session is
/// treated as an orphan.
pub const ORPHAN_TIMEOUT_SECS: u64 = 600;

pub struct Session {
    pub index: SessionIdx,

    // Membership
    pub head: Option<Slot>,
    pub population: usize,

    // Game association
    pub game: Option<GameSlot>,
    pub locker: Option<Slot>,

    // Policy
    pub password: String,
    pub private: bool,
    pub poisoned: bool,
    pub has_game: bool,
    pub scored: bool,
    pub file_written: bool,
    pub clear_deadline: Option<u64>,
    pub room_type: u16,
    pub game_type: u16,
    pub state_key: String,
    pub state_slot: Option<usize>,
    pub reservation: String,

    pub last_active: u64,
}

impl Session {
    fn new(index: SessionIdx) -> Session {
        Session {
            index,
            head: None,
            population: 0,
            game: None,
            locker: None,
            password: String::new(),
            private: false,
            poisoned: false,
            has_game: false,
            scored: false,
            file_written: false,
            clear_deadline: None,
            room_type: 0,
            game_type: 0,
            state_key: String::new(),
            state_slot: None,
            reservation: String::new(),
            last_active: 0,
        }
    }

    /// Whether an emptied session earns the clearing grace window: an
    /// active game, a written file, or outstanding scoring can still race
    /// an external callback or a reconnect.
    #[inline]
    pub fn deserves_grace(&self) -> bool {
        self.has_game || self.file_written || (self.game.is_some() && !self.scored)
    }

    /// Whether the orphan sweep should look at this session at all.
    #[inline]
    pub fn looks_populated(&self) -> bool {
        !self.reservation.is_empty() || !self.password.is_empty() || self.clear_deadline.is_some()
    }

    /// Resets all policy and game state. Membership must already be empty.
    pub fn reset(&mut self) {
        if self.population != 0 {
            panic!(
                "Resetting session {} with {} users still attached",
                self.index, self.population
            );
        }

        let index = self.index;
        *self = Session::new(index);
    }
}

/// Open-addressing table of session fraud-detection state keys. Fixed size,
/// linear probe, tombstones on removal.
pub struct StateKeyTable {
    slots: Vec<KeySlot>,
}

#[derive(Clone, Eq, PartialEq)]
enum KeySlot {
    Empty,
    Tombstone,
    Used(u32, SessionIdx),
}

impl StateKeyTable {
    pub fn new(capacity: usize) -> StateKeyTable {
        StateKeyTable {
            slots: vec![KeySlot::Empty; capacity],
        }
    }

    pub fn hash(key: &str) -> u32 {
        key.bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b.to_ascii_lowercase())))
    }

    /// Inserts a key, returning its slot index, or `None` when the table is
    /// full. An existing entry for another session is left in place; the
    /// caller decides whether a collision is a fraud signal.
    pub fn insert(&mut self, hash: u32, session: SessionIdx) -> Option<usize> {
        let len = self.slots.len();
        let mut idx = hash as usize % len;

        for _ in 0..len {
            match self.slots[idx] {
                KeySlot::Empty | KeySlot::Tombstone => {
                    self.slots[idx] = KeySlot::Used(hash, session);
                    return Some(idx);
                }
                KeySlot::Used(..) => idx = (idx + 1) % len,
            }
        }

        None
    }

    /// Finds a session holding this key hash, other than `except`.
    pub fn find_other(&self, hash: u32, except: SessionIdx) -> Option<SessionIdx> {
        let len = self.slots.len();
        let mut idx = hash as usize % len;

        for _ in 0..len {
            match self.slots[idx] {
                KeySlot::Empty => return None,
                KeySlot::Used(h, session) if h == hash && session != except => {
                    return Some(session);
                }
                _ => idx = (idx + 1) % len,
            }
        }

        None
    }

    pub fn remove(&mut self, slot: usize) {
        if let KeySlot::Used(..) = self.slots[slot] {
            self.slots[slot] = KeySlot::Tombstone;
        }
    }
}

pub struct SessionTable {
    sessions: Vec<Session>,
    room_count: usize,
    pub state_keys: StateKeyTable,
}

impl SessionTable {
    /// `room_count` real rooms (lobby included) plus the three
    /// pseudo-sessions at the tail.
    pub fn new(room_count: usize) -> SessionTable {
        if room_count < 1 {
            panic!("Session table needs at least the lobby, got {}", room_count);
        }

        SessionTable {
            sessions: (0..room_count + 3).map(Session::new).collect(),
            room_count,
            state_keys: StateKeyTable::new(room_count * 2),
        }
    }

    #[inline]
    pub fn room_count(&self) -> usize {
        self.room_count
    }

    /// Pseudo-session holding pooled (free) user slots.
    #[inline]
    pub fn idle_index(&self) -> SessionIdx {
        self.room_count
    }

    /// Pseudo-session for accepted-but-not-introduced connections.
    #[inline]
    pub fn waiting_index(&self) -> SessionIdx {
        self.room_count + 1
    }

    /// Pseudo-session for robot proxy links.
    #[inline]
    pub fn proxy_index(&self) -> SessionIdx {
        self.room_count + 2
    }

    #[inline]
    pub fn get(&self, idx: SessionIdx) -> &Session {
        &self.sessions[idx]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: SessionIdx) -> &mut Session {
        &mut self.sessions[idx]
    }

    #[inline]
    pub fn is_room(&self, idx: SessionIdx) -> bool {
        idx < self.room_count
    }

    /// Links every pool slot into the idle chain. Called once at startup.
    pub fn seed_idle(&mut self, users: &mut UserPool) {
        for slot in 0..users.capacity() {
            self.attach(users, slot, self.idle_index());
        }
    }

    /// Attaches a user at the head of a session's chain.
    pub fn attach(&mut self, users: &mut UserPool, slot: Slot, idx: SessionIdx) {
        let session = &mut self.sessions[idx];
        let user = users.get_mut(slot);

        user.session = idx;
        user.next_in_session = session.head;
        session.head = Some(slot);
        session.population += 1;
    }

    /// Unlinks a user from its current session's chain. Chain/population
    /// disagreement is state corruption and stops the process; it cannot be
    /// attributed to any one client.
    pub fn detach(&mut self, users: &mut UserPool, slot: Slot) {
        let idx = users.get(slot).session;
        let session = &mut self.sessions[idx];

        let mut cursor = session.head;
        let mut prev: Option<Slot> = None;

        while let Some(current) = cursor {
            if current == slot {
                let next = users.get(current).next_in_session;
                match prev {
                    Some(prev_slot) => users.get_mut(prev_slot).next_in_session = next,
                    None => session.head = next,
                }
                users.get_mut(slot).next_in_session = None;
                session.population -= 1;
                return;
            }
            prev = Some(current);
            cursor = users.get(current).next_in_session;
        }

        panic!("User {} not on the chain of its session {}", slot, idx);
    }

    /// Moves a user between sessions in one step.
    pub fn relocate(&mut self, users: &mut UserPool, slot: Slot, to: SessionIdx) {
        self.detach(users, slot);
        self.attach(users, slot, to);
    }

    /// Collects a session's member slots in chain order.
    pub fn members(&self, users: &UserPool, idx: SessionIdx) -> Vec<Slot> {
        let mut out = Vec::with_capacity(self.sessions[idx].population);
        let mut cursor = self.sessions[idx].head;

        while let Some(slot) = cursor {
            out.push(slot);
            cursor = users.get(slot).next_in_session;
        }

        out
    }

    /// Allocates a user slot from the idle chain, or `None` when the pool
    /// is exhausted.
    pub fn allocate_user(&mut self, users: &mut UserPool) -> Option<Slot> {
        let slot = self.sessions[self.idle_index()].head?;
        self.detach(users, slot);
        Some(slot)
    }

    /// Scrubs a user slot and returns it to the idle chain.
    pub fn release_user(&mut self, users: &mut UserPool, slot: Slot) {
        self.detach(users, slot);
        let idle = self.idle_index();
        users.get_mut(slot).scrub(idle);
        self.attach(users, slot, idle);
        users.get_mut(slot).state = UserState::Idle;
    }

    /// Counts members of a session whose accept-time address matches.
    pub fn ip_count(&self, users: &UserPool, idx: SessionIdx, ip: std::net::IpAddr) -> usize {
        self.members(users, idx)
            .iter()
            .filter(|&&slot| users.get(slot).ip == Some(ip))
            .count()
    }

    /// True when no member holds a live socket.
    pub fn socketless(&self, users: &UserPool, idx: SessionIdx) -> bool {
        self.members(users, idx)
            .iter()
            .all(|&slot| !users.get(slot).has_socket())
    }

    /// Verifies that every session's population equals its chain length and
    /// that every user sits on the chain its session index claims. Called
    /// at consistency checkpoints; a violation is a server bug.
    pub fn check_consistency(&self, users: &UserPool) -> Result<(), String> {
        let mut seen = vec![false; users.capacity()];

        for session in &self.sessions {
            let members = self.members(users, session.index);

            if members.len() != session.population {
                return Err(format!(
                    "Session {}: population {} but chain length {}",
                    session.index,
                    session.population,
                    members.len()
                ));
            }

            for slot in members {
                if seen[slot] {
                    return Err(format!("User {} appears on two chains", slot));
                }
                seen[slot] = true;

                if users.get(slot).session != session.index {
                    return Err(format!(
                        "User {} chained to session {} but points at {}",
                        slot,
                        session.index,
                        users.get(slot).session
                    ));
                }
            }
        }

        match seen.iter().position(|&s| !s) {
            Some(slot) => Err(format!("User {} is on no chain", slot)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (SessionTable, UserPool) {
        let mut sessions = SessionTable::new(4);
        let mut users = UserPool::new(8, sessions.idle_index());
        sessions.seed_idle(&mut users);
        (sessions, users)
    }

    #[test]
    fn test_seed_idle_holds_all_slots() {
        let (sessions, users) = fixture();

        assert_eq!(sessions.get(sessions.idle_index()).population, 8);
        sessions.check_consistency(&users).unwrap();
    }

    #[test]
    fn test_allocate_release_roundtrip() {
        let (mut sessions, mut users) = fixture();

        let slot = sessions.allocate_user(&mut users).unwrap();
        sessions.attach(&mut users, slot, LOBBY);

        assert_eq!(sessions.get(LOBBY).population, 1);
        assert_eq!(sessions.get(sessions.idle_index()).population, 7);
        sessions.check_consistency(&users).unwrap();

        sessions.release_user(&mut users, slot);

        assert_eq!(sessions.get(LOBBY).population, 0);
        assert_eq!(sessions.get(sessions.idle_index()).population, 8);
        sessions.check_consistency(&users).unwrap();
    }

    #[test]
    fn test_pool_exhaustion() {
        let (mut sessions, mut users) = fixture();

        for _ in 0..8 {
            let slot = sessions.allocate_user(&mut users).unwrap();
            sessions.attach(&mut users, slot, LOBBY);
        }

        assert_eq!(sessions.allocate_user(&mut users), None);
    }

    #[test]
    fn test_population_tracks_chain_after_mixed_ops() {
        let (mut sessions, mut users) = fixture();

        let a = sessions.allocate_user(&mut users).unwrap();
        sessions.attach(&mut users, a, LOBBY);
        let b = sessions.allocate_user(&mut users).unwrap();
        sessions.attach(&mut users, b, LOBBY);
        let c = sessions.allocate_user(&mut users).unwrap();
        sessions.attach(&mut users, c, 2);

        // Unlink from the middle of the lobby chain.
        sessions.relocate(&mut users, a, 2);

        assert_eq!(sessions.get(LOBBY).population, 1);
        assert_eq!(sessions.get(2).population, 2);
        assert_eq!(sessions.members(&users, 2), vec![a, c]);
        sessions.check_consistency(&users).unwrap();
    }

    #[test]
    #[should_panic(expected = "not on the chain")]
    fn test_double_detach_panics() {
        let (mut sessions, mut users) = fixture();

        let slot = sessions.allocate_user(&mut users).unwrap();
        sessions.attach(&mut users, slot, LOBBY);
        sessions.detach(&mut users, slot);
        sessions.detach(&mut users, slot);
    }

    #[test]
    fn test_grace_policy() {
        let mut session = Session::new(1);
        assert!(!session.deserves_grace());

        session.has_game = true;
        assert!(session.deserves_grace());

        session.has_game = false;
        session.file_written = true;
        assert!(session.deserves_grace());

        session.file_written = false;
        session.game = Some(3);
        session.scored = false;
        assert!(session.deserves_grace());

        session.scored = true;
        assert!(!session.deserves_grace());
    }

    #[test]
    fn test_state_key_table_probe_and_collide() {
        let mut table = StateKeyTable::new(8);
        let hash = StateKeyTable::hash("Match-42");

        let slot_a = table.insert(hash, 1).unwrap();
        assert_eq!(table.find_other(hash, 1), None);

        let _slot_b = table.insert(hash, 2).unwrap();
        assert_eq!(table.find_other(hash, 2), Some(1));

        table.remove(slot_a);
        assert_eq!(table.find_other(hash, 2), None);
    }

    #[test]
    fn test_state_key_hash_case_insensitive() {
        assert_eq!(
            StateKeyTable::hash("ReMatch"),
            StateKeyTable::hash("rematch")
        );
    }

    #[test]
    fn test_reset_requires_empty() {
        let (mut sessions, mut users) = fixture();
        let slot = sessions.allocate_user(&mut users).unwrap();
        sessions.attach(&mut users, slot, 1);

        sessions.get_mut(1).password = "secret".to_string();
        sessions.detach(&mut users, slot);
        sessions.attach(&mut users, slot, sessions.idle_index());

        sessions.get_mut(1).reset();
        assert_eq!(sessions.get(1).password, "");
    }
}
