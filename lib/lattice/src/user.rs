//! User slots and the pool they live in.
//!
//! One `User` per logical connection slot. Slots are preallocated and
//! recycled: allocation resets every field to defaults, release scrubs the
//! slot and hands it back. A player's identity can outlive its socket for a
//! grace window, marked reclaimable, until a takeover splices a new
//! transport onto it or the window lapses.

use crate::net::buffer::{Buffer, BUF_SIZE_INCREMENT};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::net::transport::Transport;
use crate::{SessionIdx, Slot};
use ember::cipher::{self, Keystream};
use ember::UserUid;
use std::net::IpAddr;

/// Consecutive transport failures tolerated before the slot is closed.
pub const MAX_IO_FAILURES: u32 = 5;
/// Unexpected or malformed messages tolerated per connection.
pub const MAX_UNEXPECTED: u32 = 24;
/// Per-connection cap on error lines written to the server log.
pub const MAX_ERRORS_LOGGED: u32 = 16;

/// Seconds a disconnected player stays reclaimable.
pub const RECLAIM_GRACE_SECS: u64 = 180;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UserState {
    /// In the pool, attached to the idle pseudo-session.
    Idle,
    /// Accepted but not yet introduced.
    Waiting,
    /// Member of a real session.
    Session,
    /// Transport gone; identity preserved pending takeover or expiry.
    Closing,
}

pub struct User {
    pub slot: Slot,

    // Identity
    pub uid: UserUid,
    pub name: String,
    pub real_name: String,
    pub cookie: String,
    pub seat: u8,

    // Transport. Robot proxy users have none.
    pub transport: Option<Box<dyn Transport>>,
    pub ip: Option<IpAddr>,

    // Codec state: one keystream per direction plus running line counters.
    pub rx_key: Option<Keystream>,
    pub tx_key: Option<Keystream>,
    pub init_string: String,
    pub uses_crypto: bool,
    pub uses_sequence: bool,
    pub require_checksum: bool,
    pub seq_in: u32,
    pub seq_out: u32,
    pub seq_faults: u32,
    pub seq_fault_logged: bool,

    // Buffers
    pub input: Buffer,
    pub output: Buffer,
    pub scratch: Vec<u8>,

    // Session membership. Every user belongs to exactly one session,
    // pseudo-sessions included; `next_in_session` is the intrusive chain.
    pub session: SessionIdx,
    pub next_in_session: Option<Slot>,

    // Roles
    pub state: UserState,
    pub is_player: bool,
    pub is_robot: bool,
    pub gagged: bool,
    pub supervisor: bool,
    pub awaiting_eof: bool,
    pub input_closed: bool,
    pub output_closed: bool,
    pub trace_log: bool,

    // Liveness accounting
    pub last_active: u64,
    pub io_failures: u32,
    pub io_successes: u32,
    pub errors_logged: u32,
    pub unexpected: u32,
    pub blocked: bool,
    pub blocked_transitions: u32,
    pub unblocked_transitions: u32,

    // Reconnection
    pub reclaimable: bool,
    pub close_deadline: u64,
    pub game_revision: u32,
}

impl User {
    fn new(slot: Slot, idle_session: SessionIdx) -> User {
        User {
            slot,
            uid: 0,
            name: String::new(),
            real_name: String::new(),
            cookie: String::new(),
            seat: 0,
            transport: None,
            ip: None,
            rx_key: None,
            tx_key: None,
            init_string: String::new(),
            uses_crypto: false,
            uses_sequence: false,
            require_checksum: false,
            seq_in: 0,
            seq_out: 0,
            seq_faults: 0,
            seq_fault_logged: false,
            input: Buffer::new(BUF_SIZE_INCREMENT),
            output: Buffer::new(BUF_SIZE_INCREMENT),
            scratch: Vec::new(),
            session: idle_session,
            next_in_session: None,
            state: UserState::Idle,
            is_player: false,
            is_robot: false,
            gagged: false,
            supervisor: false,
            awaiting_eof: false,
            input_closed: false,
            output_closed: false,
            trace_log: false,
            last_active: 0,
            io_failures: 0,
            io_successes: 0,
            errors_logged: 0,
            unexpected: 0,
            blocked: false,
            blocked_transitions: 0,
            unblocked_transitions: 0,
            reclaimable: false,
            close_deadline: 0,
            game_revision: 0,
        }
    }

    /// Resets the slot for a fresh accept. Everything except the slot index
    /// returns to defaults; membership is handled by the session table.
    pub fn reset_for_accept(&mut self, transport: Box<dyn Transport>, init_string: String, now: u64) {
        let ip = transport.peer_ip();

        self.uid = 0;
        self.name.clear();
        self.real_name.clear();
        self.cookie.clear();
        self.seat = 0;
        self.transport = Some(transport);
        self.ip = Some(ip);
        self.rx_key = None;
        self.tx_key = None;
        self.init_string = init_string;
        self.uses_crypto = false;
        self.uses_sequence = false;
        self.require_checksum = false;
        self.seq_in = 0;
        self.seq_out = 0;
        self.seq_faults = 0;
        self.seq_fault_logged = false;
        self.input.clear();
        self.output.clear();
        self.scratch.clear();
        self.state = UserState::Waiting;
        self.is_player = false;
        self.is_robot = false;
        self.gagged = false;
        self.supervisor = false;
        self.awaiting_eof = false;
        self.input_closed = false;
        self.output_closed = false;
        self.trace_log = false;
        self.last_active = now;
        self.io_failures = 0;
        self.io_successes = 0;
        self.errors_logged = 0;
        self.unexpected = 0;
        self.blocked = false;
        self.blocked_transitions = 0;
        self.unblocked_transitions = 0;
        self.reclaimable = false;
        self.close_deadline = 0;
        self.game_revision = 0;
    }

    /// Scrubs the slot on final release. The transport, if any, is shut
    /// down and dropped.
    pub fn scrub(&mut self, idle_session: SessionIdx) {
        if let Some(mut transport) = self.transport.take() {
            drop(transport.shutdown());
        }

        let slot = self.slot;
        *self = User::new(slot, idle_session);
    }

    /// Releases the transport but preserves identity for reconnection: the
    /// display name is parenthesized to mark "disconnected but reclaimable"
    /// and the grace deadline starts.
    pub fn preserve_for_reconnect(&mut self, now: u64) {
        if let Some(mut transport) = self.transport.take() {
            drop(transport.shutdown());
        }

        self.ip = None;
        self.input.clear();
        self.output.clear();
        self.rx_key = None;
        self.tx_key = None;
        self.blocked = false;
        self.state = UserState::Closing;
        self.reclaimable = true;
        self.close_deadline = now + RECLAIM_GRACE_SECS;
        self.name = format!("({})", self.real_name);
    }

    /// Enables the obfuscation codec for both directions. The init string
    /// was issued at accept time; the client echoes its agreement in the
    /// intro flags.
    pub fn enable_crypto(&mut self) {
        let init = self.init_string.as_bytes();
        self.rx_key = Some(Keystream::from_init(init, cipher::SALT_INBOUND));
        self.tx_key = Some(Keystream::from_init(init, cipher::SALT_OUTBOUND));
        self.uses_crypto = true;
    }

    /// Keeps the reply-composition scratch at least as large as the input
    /// buffer plus slack, since replies may quote the input.
    #[inline]
    pub fn reserve_scratch(&mut self) {
        let want = self.input.capacity() + 128;
        if self.scratch.capacity() < want {
            let additional = want - self.scratch.len();
            self.scratch.reserve(additional);
        }
    }

    /// True when the slot holds a live socket.
    #[inline]
    pub fn has_socket(&self) -> bool {
        self.transport.is_some()
    }

    /// Composes and queues one outgoing line. The payload is wrapped in the
    /// `501` checksum envelope when the peer requires checksums, obfuscated
    /// when the codec is on, sequence-prefixed when the peer declared
    /// sequence numbers, and terminated with LF. A full output buffer is a
    /// close-worthy overrun, not a grow-forever condition.
    pub fn enqueue_line(&mut self, payload: &[u8]) -> NetworkResult<()> {
        if self.output_closed {
            return Ok(());
        }

        self.scratch.clear();

        if self.uses_sequence {
            self.seq_out = self.seq_out.wrapping_add(1);
            self.scratch.extend_from_slice(self.seq_out.to_string().as_bytes());
            self.scratch.push(b' ');
        }

        if self.require_checksum {
            // Envelope body: the anti-corruption padding space plus the
            // payload, obfuscated first so the checksum covers wire bytes.
            let mut body = Vec::with_capacity(payload.len() + 1);
            body.push(b' ');
            body.extend_from_slice(payload);

            if let Some(key) = self.tx_key.as_mut() {
                key.encode(&mut body);
            }

            let check = cipher::encode_check(cipher::line_checksum(&body));

            self.scratch.extend_from_slice(b"501 ");
            self.scratch.extend_from_slice(&check);
            self.scratch.push(b' ');
            self.scratch.extend_from_slice(&body);
        } else {
            let start = self.scratch.len();
            self.scratch.extend_from_slice(payload);

            if let Some(key) = self.tx_key.as_mut() {
                key.encode(&mut self.scratch[start..]);
            }
        }

        self.scratch.push(b'\n');

        match self.output.append(&self.scratch) {
            Ok(()) => Ok(()),
            Err(NetworkError::Fatal(ErrorType::Overrun)) => {
                Err(NetworkError::Fatal(ErrorType::OutputOverrun))
            }
            Err(err) => Err(err),
        }
    }

    /// Counts one protocol surprise against the abuse budget.
    #[inline]
    pub fn count_unexpected(&mut self) -> NetworkResult<()> {
        self.unexpected += 1;

        if self.unexpected > MAX_UNEXPECTED {
            return Err(NetworkError::Fatal(ErrorType::AbuseBudget));
        }

        Ok(())
    }
}

/// Fixed pool of user slots. All slots exist from construction; the idle
/// pseudo-session's chain doubles as the free list.
pub struct UserPool {
    users: Vec<User>,
}

impl UserPool {
    pub fn new(capacity: usize, idle_session: SessionIdx) -> UserPool {
        UserPool {
            users: (0..capacity).map(|slot| User::new(slot, idle_session)).collect(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.users.len()
    }

    #[inline]
    pub fn get(&self, slot: Slot) -> &User {
        &self.users[slot]
    }

    #[inline]
    pub fn get_mut(&mut self, slot: Slot) -> &mut User {
        &mut self.users[slot]
    }

    /// Disjoint mutable borrows of two slots, for the takeover splice.
    pub fn pair_mut(&mut self, a: Slot, b: Slot) -> (&mut User, &mut User) {
        if a == b {
            panic!("pair_mut requires distinct slots, got {} twice", a);
        }

        if a < b {
            let (lo, hi) = self.users.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.users.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.iter()
    }
}

/// Moves the fresh connection's transport, buffers, and codec progress onto
/// the preserved identity. The preserved slot keeps its uid, seat, names,
/// cookie, and per-game revision; the fresh slot is left for the caller to
/// scrub and return to the pool. The caller continues as the preserved
/// slot.
pub fn splice_takeover(users: &mut UserPool, preserved: Slot, fresh: Slot, now: u64) {
    let (old, new) = users.pair_mut(preserved, fresh);

    old.transport = new.transport.take();
    old.ip = new.ip.take();

    std::mem::swap(&mut old.input, &mut new.input);
    std::mem::swap(&mut old.output, &mut new.output);
    new.output.clear();

    old.rx_key = new.rx_key.take();
    old.tx_key = new.tx_key.take();
    old.init_string = std::mem::take(&mut new.init_string);
    old.uses_crypto = new.uses_crypto;
    old.uses_sequence = new.uses_sequence;
    old.require_checksum = new.require_checksum;
    old.seq_in = new.seq_in;
    old.seq_out = new.seq_out;

    old.state = UserState::Session;
    old.reclaimable = false;
    old.close_deadline = 0;
    old.blocked = false;
    old.last_active = now;
    old.name = old.real_name.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::MockTransport;

    const IDLE: SessionIdx = 99;

    fn accepted_user(pool: &mut UserPool, slot: Slot) {
        let transport = MockTransport::boxed(b"");
        pool.get_mut(slot)
            .reset_for_accept(transport, "init".to_string(), 1000);
    }

    #[test]
    fn test_reset_scrubs_previous_tenant() {
        let mut pool = UserPool::new(4, IDLE);

        {
            let user = pool.get_mut(0);
            user.name = "mallory".to_string();
            user.unexpected = 99;
            user.is_player = true;
        }

        accepted_user(&mut pool, 0);

        let user = pool.get(0);
        assert_eq!(user.name, "");
        assert_eq!(user.unexpected, 0);
        assert!(!user.is_player);
        assert_eq!(user.state, UserState::Waiting);
        assert!(user.has_socket());
    }

    #[test]
    fn test_preserve_parenthesizes_name() {
        let mut pool = UserPool::new(2, IDLE);
        accepted_user(&mut pool, 0);

        let user = pool.get_mut(0);
        user.real_name = "alice".to_string();
        user.name = "alice".to_string();
        user.preserve_for_reconnect(5000);

        assert_eq!(user.name, "(alice)");
        assert!(user.reclaimable);
        assert!(!user.has_socket());
        assert_eq!(user.close_deadline, 5000 + RECLAIM_GRACE_SECS);
        assert_eq!(user.state, UserState::Closing);
    }

    #[test]
    fn test_splice_moves_transport_keeps_identity() {
        let mut pool = UserPool::new(4, IDLE);

        accepted_user(&mut pool, 0);
        {
            let old = pool.get_mut(0);
            old.real_name = "bob".to_string();
            old.name = "bob".to_string();
            old.uid = 77;
            old.seat = 3;
            old.game_revision = 12;
            old.is_player = true;
            old.preserve_for_reconnect(5000);
        }

        accepted_user(&mut pool, 1);
        {
            let fresh = pool.get_mut(1);
            fresh.enable_crypto();
            fresh.uses_sequence = true;
            fresh.seq_in = 42;
        }

        splice_takeover(&mut pool, 0, 1, 6000);

        let old = pool.get(0);
        assert!(old.has_socket());
        assert_eq!(old.uid, 77);
        assert_eq!(old.seat, 3);
        assert_eq!(old.game_revision, 12);
        assert_eq!(old.name, "bob");
        assert!(old.uses_crypto);
        assert!(old.uses_sequence);
        assert_eq!(old.seq_in, 42);
        assert!(old.is_player);
        assert!(!old.reclaimable);

        assert!(!pool.get(1).has_socket());
    }

    #[test]
    fn test_enqueue_plain_line() {
        let mut pool = UserPool::new(1, IDLE);
        accepted_user(&mut pool, 0);

        let user = pool.get_mut(0);
        user.enqueue_line(b"201 0 5 parlor-1 0 0").unwrap();

        assert_eq!(user.output.read_slice(), b"201 0 5 parlor-1 0 0\n");
    }

    #[test]
    fn test_enqueue_checksum_envelope() {
        let mut pool = UserPool::new(1, IDLE);
        accepted_user(&mut pool, 0);

        let user = pool.get_mut(0);
        user.require_checksum = true;
        user.enqueue_line(b"303 pong").unwrap();

        let wire = user.output.read_slice();
        assert_eq!(&wire[..4], b"501 ");
        // Four check letters, a space, the padding space, then the payload.
        assert_eq!(wire[8], b' ');
        assert_eq!(wire[9], b' ');
        assert_eq!(&wire[10..18], b"303 pong");

        let check = cipher::decode_check(&wire[4..8]).unwrap();
        assert_eq!(check, cipher::line_checksum(&wire[9..wire.len() - 1]));
    }

    #[test]
    fn test_enqueue_crypto_roundtrips() {
        let mut pool = UserPool::new(1, IDLE);
        accepted_user(&mut pool, 0);

        let user = pool.get_mut(0);
        user.enable_crypto();
        user.enqueue_line(b"211 alice hello").unwrap();

        let wire = user.output.read_slice();
        let mut line = wire[..wire.len() - 1].to_vec();

        let mut rx = Keystream::from_init(b"init", cipher::SALT_OUTBOUND);
        rx.decode(&mut line);

        assert_eq!(line, b"211 alice hello".to_vec());
    }

    #[test]
    fn test_abuse_budget_closes() {
        let mut pool = UserPool::new(1, IDLE);
        accepted_user(&mut pool, 0);

        let user = pool.get_mut(0);
        for _ in 0..MAX_UNEXPECTED {
            user.count_unexpected().unwrap();
        }

        assert_eq!(
            user.count_unexpected().unwrap_err(),
            NetworkError::Fatal(ErrorType::AbuseBudget)
        );
    }
}
