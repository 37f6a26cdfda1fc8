//! The readiness loop.
//!
//! Single-threaded cooperative multiplexing over every socket the server
//! owns: reads are serviced first (filling framing buffers and dispatching
//! every complete line), then pending output is flushed, then timers run at
//! most once per wall-clock second, and finally new connections are
//! accepted. Nothing here blocks; a socket that will not take more bytes is
//! simply marked blocked until its next write-ready event. Handlers can
//! close or relocate the very connection being serviced, so liveness is
//! re-checked before every line.

use crate::dispatch::{self, Ctx, Flow};
use crate::game::GameCache;
use crate::guard::Guard;
use crate::net::support::ErrorType;
use crate::net::transport::{TcpTransport, Transport};
use crate::saver::Saver;
use crate::session::{SessionTable, CLEAR_GRACE_SECS, LOBBY, ORPHAN_TIMEOUT_SECS};
use crate::user::{UserPool, UserState, MAX_IO_FAILURES};
use crate::{SessionIdx, Slot};
use ember::logging::{debug, error, info, warn, Logger};
use ember::time::{day_stamp, timestamp_secs};
use ember::UserUid;
use indexmap::IndexSet;
use mio::net::TcpListener;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const LISTENER: mio::Token = mio::Token(0);

/// Length of the per-connection cipher init string.
const INIT_STRING_LEN: usize = 16;

pub struct ServerOpts {
    pub address: String,
    pub port: u16,
    pub server_ident: String,

    pub max_clients: usize,
    pub max_sessions: usize,

    pub per_ip_cap: u32,
    pub per_ip_session_cap: usize,
    pub per_uid_ip_cap: usize,
    pub strict_login: bool,
    pub ban_capacity: usize,

    pub cache_dir: PathBuf,
    pub max_games: usize,
    pub ttl_days: u32,
    pub saves_per_second: u32,
    pub write_pool: usize,

    pub preauth_timeout_secs: u64,
    pub player_timeout_secs: u64,
    pub spectator_timeout_secs: u64,
}

impl Default for ServerOpts {
    fn default() -> ServerOpts {
        ServerOpts {
            address: "0.0.0.0".to_string(),
            port: 4321,
            server_ident: "parlor-1".to_string(),
            max_clients: 512,
            max_sessions: 128,
            per_ip_cap: 16,
            per_ip_session_cap: 8,
            per_uid_ip_cap: 2,
            strict_login: false,
            ban_capacity: 256,
            cache_dir: PathBuf::from("games"),
            max_games: 1024,
            ttl_days: 14,
            saves_per_second: 20,
            write_pool: 32,
            preauth_timeout_secs: 30,
            player_timeout_secs: 3600,
            spectator_timeout_secs: 900,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    poll: mio::Poll,
    events: mio::Events,

    users: UserPool,
    sessions: SessionTable,
    games: GameCache,
    guard: Guard,
    saver: Saver,

    /// Slots currently holding a live socket.
    live: IndexSet<Slot>,
    /// Rotating start offset for servicing ready connections, so no
    /// connection permanently enjoys head-of-queue priority.
    rotation: usize,

    next_uid: UserUid,
    shutdown: bool,
    doomed: Vec<(Slot, ErrorType)>,
    last_maintenance: u64,

    opts: ServerOpts,
    log: Logger,
}

impl Server {
    pub fn new(opts: ServerOpts, log: Logger) -> io::Result<Server> {
        let address: SocketAddr = format!("{}:{}", opts.address, opts.port)
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad bind address"))?;

        let listener = TcpListener::bind(&address)?;
        let poll = mio::Poll::new()?;

        poll.register(&listener, LISTENER, mio::Ready::readable(), mio::PollOpt::edge())?;

        std::fs::create_dir_all(&opts.cache_dir)?;

        let mut sessions = SessionTable::new(opts.max_sessions);
        let mut users = UserPool::new(opts.max_clients, sessions.idle_index());
        sessions.seed_idle(&mut users);

        let mut games = GameCache::new(opts.cache_dir.clone(), opts.max_games, opts.ttl_days);
        games.load_dir(day_stamp(), timestamp_secs(), &log);

        let saver = Saver::spawn(opts.write_pool, log.clone())?;

        info!(log, "Listening"; "address" => %address, "ident" => &opts.server_ident,
              "protocol" => ember::PROTOCOL_REVISION);

        Ok(Server {
            listener,
            poll,
            events: mio::Events::with_capacity(4096),
            users,
            sessions,
            games,
            guard: Guard::new(opts.ban_capacity, opts.per_ip_cap, opts.strict_login),
            saver,
            live: IndexSet::new(),
            rotation: 0,
            next_uid: 1,
            shutdown: false,
            doomed: Vec::new(),
            last_maintenance: 0,
            opts,
            log,
        })
    }

    /// Runs until a supervisor-ordered shutdown. Unrecoverable poll errors
    /// surface; everything connection-level is absorbed.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.shutdown {
            self.tick()?;
        }

        self.finish();
        Ok(())
    }

    /// One pass of the loop. Public so tests can drive the server without
    /// a real clock.
    pub fn tick(&mut self) -> io::Result<()> {
        self.poll
            .poll(&mut self.events, Some(Duration::from_millis(250)))?;

        let mut readable = Vec::new();
        let mut writable = Vec::new();
        let mut accept_ready = false;

        for event in &self.events {
            match event.token() {
                LISTENER => accept_ready = true,
                token => {
                    let slot = token.0 - 1;
                    if event.readiness().is_readable() {
                        readable.push(slot);
                    }
                    if event.readiness().is_writable() {
                        writable.push(slot);
                    }
                }
            }
        }

        if !readable.is_empty() {
            let start = self.rotation % readable.len();
            readable.rotate_left(start);
        }
        self.rotation = self.rotation.wrapping_add(1);

        for slot in readable {
            self.service_read(slot);
        }

        for slot in writable {
            self.service_write(slot);
        }

        // Force-flush pending output on every live connection; with
        // edge-triggered readiness a quiet socket never re-announces
        // writability.
        let backlog: Vec<Slot> = self
            .live
            .iter()
            .copied()
            .filter(|&slot| !self.users.get(slot).output.is_empty())
            .collect();
        for slot in backlog {
            self.service_write(slot);
        }

        let now = timestamp_secs();
        if now != self.last_maintenance {
            self.last_maintenance = now;
            self.maintenance(now);
        }

        if accept_ready {
            self.accept_pass(now);
        }

        Ok(())
    }

    fn service_read(&mut self, slot: Slot) {
        if !self.live.contains(&slot) {
            return;
        }

        let result = {
            let user = self.users.get_mut(slot);
            let transport = match user.transport.as_mut() {
                Some(transport) => transport,
                None => return,
            };
            user.input.ingress(&mut **transport)
        };

        match result {
            Ok(ingress) => {
                {
                    let user = self.users.get_mut(slot);
                    if ingress.count > 0 {
                        user.io_successes += 1;
                        user.io_failures = 0;
                        user.reserve_scratch();
                    }
                    if ingress.closed {
                        user.input_closed = true;
                    }
                }

                let survivor = self.pump_lines(slot);

                if let Some(live_slot) = survivor {
                    if self.users.get(live_slot).input_closed {
                        let awaiting = self.users.get(live_slot).awaiting_eof;
                        let kind = if awaiting { ErrorType::Ordered } else { ErrorType::Closed };
                        self.close_user(live_slot, kind, !awaiting);
                    }
                }
            }
            Err(crate::net::support::NetworkError::Wait) => {}
            Err(crate::net::support::NetworkError::Fatal(kind)) => {
                self.users.get_mut(slot).io_failures += 1;
                self.close_user(slot, kind, true);
            }
        }
    }

    /// Dispatches every complete line in the slot's input buffer,
    /// re-checking liveness between lines and following a takeover to its
    /// new slot. Returns the slot that is still live afterwards, if any.
    fn pump_lines(&mut self, mut slot: Slot) -> Option<Slot> {
        loop {
            if !self.live.contains(&slot) {
                return None;
            }

            let line = match self.users.get_mut(slot).input.next_line() {
                Some(line) => line,
                None => return Some(slot),
            };

            let flow = self.dispatch_line(slot, line);

            // Handlers may doom broadcast targets; close them before the
            // next line so their buffers are not written to again.
            let doomed = std::mem::take(&mut self.doomed);
            for (victim, kind) in doomed {
                if victim != slot {
                    self.close_user(victim, kind, true);
                }
            }

            match flow {
                Flow::Continue => {}
                Flow::Closed(kind) => {
                    let deliberate = kind == ErrorType::Ordered;
                    self.close_user(slot, kind, !deliberate);
                    return None;
                }
                Flow::ResumedAs(new_slot) => {
                    self.remap_tokens(slot, new_slot);
                    slot = new_slot;
                }
            }
        }
    }

    fn dispatch_line(&mut self, slot: Slot, line: Vec<u8>) -> Flow {
        let mut ctx = Ctx {
            users: &mut self.users,
            sessions: &mut self.sessions,
            games: &mut self.games,
            guard: &mut self.guard,
            log: &self.log,
            now: timestamp_secs(),
            today: day_stamp(),
            server_ident: &self.opts.server_ident,
            per_ip_session_cap: self.opts.per_ip_session_cap,
            per_uid_ip_cap: self.opts.per_uid_ip_cap,
            next_uid: &mut self.next_uid,
            shutdown: &mut self.shutdown,
            doomed: &mut self.doomed,
        };

        dispatch::process_line(&mut ctx, slot, line)
    }

    /// After a takeover the transport lives in a different slot; the poll
    /// token must follow it.
    fn remap_tokens(&mut self, old_slot: Slot, new_slot: Slot) {
        self.live.swap_remove(&old_slot);
        self.live.insert(new_slot);

        let user = self.users.get(new_slot);
        if let Some(transport) = user.transport.as_ref() {
            drop(transport.deregister(&self.poll));
            if let Err(err) = transport.register(&self.poll, mio::Token(new_slot + 1)) {
                error!(self.log, "Token remap failed"; "slot" => new_slot, "error" => %err);
            }
        }
    }

    fn service_write(&mut self, slot: Slot) {
        if !self.live.contains(&slot) {
            return;
        }

        let result = {
            let user = self.users.get_mut(slot);

            if user.output.is_empty() {
                Ok(0)
            } else {
                match user.transport.as_mut() {
                    Some(transport) => user.output.egress(&mut **transport),
                    None => return,
                }
            }
        };

        match result {
            Ok(count) => {
                let user = self.users.get_mut(slot);
                if count > 0 {
                    user.io_successes += 1;
                    user.io_failures = 0;
                }
                if user.blocked {
                    user.blocked = false;
                    user.unblocked_transitions += 1;
                }
            }
            Err(crate::net::support::NetworkError::Wait) => {
                let user = self.users.get_mut(slot);
                if !user.blocked {
                    user.blocked = true;
                    user.blocked_transitions += 1;
                }
            }
            Err(crate::net::support::NetworkError::Fatal(kind)) => {
                self.close_user(slot, kind, true);
            }
        }
    }

    /// Admission: ban and per-IP checks happen before a slot is spent.
    fn accept_pass(&mut self, now: u64) {
        loop {
            match self.listener.accept() {
                Ok((stream, address)) => {
                    let ip = address.ip();

                    if let Err(kind) = self.guard.admit(ip, now) {
                        debug!(self.log, "Connection refused"; "ip" => %ip, "reason" => ?kind);
                        continue;
                    }

                    let slot = match self.sessions.allocate_user(&mut self.users) {
                        Some(slot) => slot,
                        None => {
                            warn!(self.log, "User pool exhausted, dropping connection"; "ip" => %ip);
                            continue;
                        }
                    };

                    let transport = match TcpTransport::new(stream) {
                        Ok(transport) => Box::new(transport),
                        Err(err) => {
                            debug!(self.log, "Accept failed mid-setup"; "error" => %err);
                            let idle = self.sessions.idle_index();
                            self.sessions.attach(&mut self.users, slot, idle);
                            continue;
                        }
                    };

                    let init: String = rand::thread_rng()
                        .sample_iter(&Alphanumeric)
                        .take(INIT_STRING_LEN)
                        .map(char::from)
                        .collect();

                    {
                        let user = self.users.get_mut(slot);
                        user.reset_for_accept(transport, init, now);
                    }

                    let register = self
                        .users
                        .get(slot)
                        .transport
                        .as_ref()
                        .expect("freshly accepted transport")
                        .register(&self.poll, mio::Token(slot + 1));

                    if let Err(err) = register {
                        error!(self.log, "Poll registration failed"; "error" => %err);
                        let idle = self.sessions.idle_index();
                        self.users.get_mut(slot).scrub(idle);
                        self.sessions.attach(&mut self.users, slot, idle);
                        continue;
                    }

                    let waiting = self.sessions.waiting_index();
                    self.sessions.attach(&mut self.users, slot, waiting);
                    self.guard.note_connect(ip);
                    self.live.insert(slot);

                    debug!(self.log, "Accepted"; "slot" => slot, "ip" => %ip);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(self.log, "Accept error"; "error" => %err);
                    break;
                }
            }
        }
    }

    /// Once-per-second housekeeping: connection timeouts, expired preserved
    /// identities, session clearing and the orphan sweep, the dirty-game
    /// write-back, and guard decay.
    fn maintenance(&mut self, now: u64) {
        // Timeouts. Pre-auth connections get the short fuse.
        let stale: Vec<Slot> = self
            .live
            .iter()
            .copied()
            .filter(|&slot| {
                let user = self.users.get(slot);
                let timeout = match user.state {
                    UserState::Waiting => self.opts.preauth_timeout_secs,
                    UserState::Session if user.is_player => self.opts.player_timeout_secs,
                    UserState::Session => self.opts.spectator_timeout_secs,
                    _ => return false,
                };
                now.saturating_sub(user.last_active) > timeout
            })
            .collect();

        for slot in stale {
            debug!(self.log, "Idle timeout"; "slot" => slot);
            self.close_user(slot, ErrorType::Timeout, true);
        }

        // A writer that stays blocked with output pending burns its
        // consecutive-failure budget, one tick at a time.
        let stuck: Vec<Slot> = self
            .live
            .iter()
            .copied()
            .filter(|&slot| {
                let user = self.users.get(slot);
                user.blocked && !user.output.is_empty()
            })
            .collect();

        for slot in stuck {
            let failures = {
                let user = self.users.get_mut(slot);
                user.io_failures += 1;
                user.io_failures
            };

            if failures >= MAX_IO_FAILURES {
                self.close_user(slot, ErrorType::IoBudget, true);
            }
        }

        // Preserved identities whose grace lapsed.
        let lapsed: Vec<Slot> = self
            .users
            .iter()
            .filter(|user| user.state == UserState::Closing && user.close_deadline <= now)
            .map(|user| user.slot)
            .collect();

        for slot in lapsed {
            let session = self.users.get(slot).session;
            self.sessions.release_user(&mut self.users, slot);
            self.consider_clearing(session, now, false);
        }

        // Session clearing and the orphan sweep.
        for idx in 1..self.sessions.room_count() {
            let (deadline_hit, orphaned) = {
                let session = self.sessions.get(idx);
                let deadline_hit = session.clear_deadline.map_or(false, |deadline| deadline <= now);
                let orphaned = session.looks_populated()
                    && now.saturating_sub(session.last_active) > ORPHAN_TIMEOUT_SECS
                    && self.sessions.socketless(&self.users, idx);
                (deadline_hit, orphaned)
            };

            if deadline_hit || orphaned {
                if orphaned && !deadline_hit {
                    warn!(self.log, "Orphan sweep clearing session"; "session" => idx);
                }
                self.clear_session(idx);
            }
        }

        // Rate-budgeted write-back.
        self.games.sweep(&self.saver, self.opts.saves_per_second);

        self.guard.decay(now);

        // Consistency checkpoint: a violation here is a server bug worth
        // shouting about, but not worth taking every session down with.
        if let Err(detail) = self.sessions.check_consistency(&self.users) {
            error!(self.log, "Unusual: membership inconsistency"; "detail" => detail);
        }
        if let Err(detail) = self.games.check_refcounts() {
            error!(self.log, "Unusual: game refcount drift"; "detail" => detail);
        }
    }

    /// Tears down one connection. With `allow_grace`, a player in a real
    /// room keeps a preserved identity for reconnection; otherwise the slot
    /// returns to the pool at once.
    fn close_user(&mut self, slot: Slot, kind: ErrorType, allow_grace: bool) {
        if self.users.get(slot).state == UserState::Idle {
            return;
        }

        let now = timestamp_secs();

        // Courtesy flush so a final reply (quit echo, ban notice) has a
        // chance to leave.
        {
            let user = self.users.get_mut(slot);
            if let Some(transport) = user.transport.as_mut() {
                drop(user.output.egress(&mut **transport));
            }
        }

        let (session_idx, is_player, ip) = {
            let user = self.users.get(slot);
            (user.session, user.is_player, user.ip)
        };

        if let Some(ip) = ip {
            self.guard.note_disconnect(ip);
        }

        if let Some(transport) = self.users.get(slot).transport.as_ref() {
            drop(transport.deregister(&self.poll));
        }

        self.live.swap_remove(&slot);

        debug!(self.log, "Closing connection";
               "slot" => slot, "reason" => ?kind, "grace" => allow_grace);

        let in_room = self.sessions.is_room(session_idx);
        let preserve = allow_grace
            && is_player
            && in_room
            && session_idx != LOBBY
            && self.sessions.get(session_idx).deserves_grace();

        if preserve {
            self.users.get_mut(slot).preserve_for_reconnect(now);
        } else {
            self.sessions.release_user(&mut self.users, slot);
        }

        if in_room {
            self.consider_clearing(session_idx, now, !allow_grace);
        }
    }

    /// Applies the clearing policy to a room that may have just emptied:
    /// deliberate departures clear immediately, graced sessions get the
    /// timer, everything else clears when no sockets remain.
    fn consider_clearing(&mut self, idx: SessionIdx, now: u64, deliberate: bool) {
        if idx == LOBBY || !self.sessions.is_room(idx) {
            return;
        }

        if !self.sessions.socketless(&self.users, idx) {
            return;
        }

        let deserves = self.sessions.get(idx).deserves_grace();

        if deliberate || !deserves {
            self.clear_session(idx);
        } else if self.sessions.get(idx).clear_deadline.is_none() {
            self.sessions.get_mut(idx).clear_deadline = Some(now + CLEAR_GRACE_SECS);
            debug!(self.log, "Session entering grace clear"; "session" => idx);
        }
    }

    /// Returns every member to the pool, drops the game claim, forgets the
    /// state key, and resets the room.
    fn clear_session(&mut self, idx: SessionIdx) {
        for member in self.sessions.members(&self.users, idx) {
            self.live.swap_remove(&member);

            if let Some(ip) = self.users.get(member).ip {
                self.guard.note_disconnect(ip);
            }
            if let Some(transport) = self.users.get(member).transport.as_ref() {
                drop(transport.deregister(&self.poll));
            }

            self.sessions.release_user(&mut self.users, member);
        }

        if let Some(game) = self.sessions.get_mut(idx).game.take() {
            self.games.release_claim(game);
        }

        if let Some(state_slot) = self.sessions.get(idx).state_slot {
            self.sessions.state_keys.remove(state_slot);
        }

        self.sessions.get_mut(idx).reset();
        debug!(self.log, "Session cleared"; "session" => idx);
    }

    /// Graceful shutdown: drain the dirty queue through the saver, stop the
    /// worker, and drop every connection.
    fn finish(&mut self) {
        info!(self.log, "Shutting down");

        while self.games.sweep(&self.saver, u32::max_value()) > 0 {}

        let live: Vec<Slot> = self.live.iter().copied().collect();
        for slot in live {
            self.close_user(slot, ErrorType::Ordered, false);
        }

        self.saver.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::MockTransport;

    fn test_server(name: &str) -> Server {
        let mut opts = ServerOpts::default();
        opts.address = "127.0.0.1".to_string();
        opts.port = 0;
        opts.max_clients = 8;
        opts.max_sessions = 4;
        opts.cache_dir = std::env::temp_dir().join(format!("lattice-server-{}-{}", std::process::id(), name));

        let log = ember::logging::init("error", None, 0).unwrap();
        Server::new(opts, log).unwrap()
    }

    /// Wires a fake connection straight into a session, bypassing the
    /// listener.
    fn fake_join(server: &mut Server, session: SessionIdx, name: &str, player: bool) -> Slot {
        let now = timestamp_secs();
        let slot = server.sessions.allocate_user(&mut server.users).unwrap();

        server.users.get_mut(slot).reset_for_accept(
            MockTransport::boxed(b""),
            format!("init-{}", slot),
            now,
        );

        {
            let user = server.users.get_mut(slot);
            user.name = name.to_string();
            user.real_name = name.to_string();
            user.cookie = format!("ck-{}", name);
            user.uid = server.next_uid;
            user.seat = if player { 1 } else { 0 };
            user.is_player = player;
            user.state = UserState::Session;
        }
        server.next_uid += 1;

        server.sessions.attach(&mut server.users, slot, session);
        server.sessions.get_mut(session).last_active = now;
        server.live.insert(slot);
        slot
    }

    #[test]
    fn test_player_disconnect_gets_grace() {
        let mut server = test_server("grace");
        let slot = fake_join(&mut server, 1, "alice", true);

        server.sessions.get_mut(1).has_game = true;
        server.sessions.get_mut(1).scored = false;

        server.close_user(slot, ErrorType::Io(io::ErrorKind::ConnectionReset), true);

        // Identity preserved, session in grace clear rather than gone.
        let user = server.users.get(slot);
        assert_eq!(user.state, UserState::Closing);
        assert!(user.reclaimable);
        assert_eq!(user.name, "(alice)");
        assert!(server.sessions.get(1).clear_deadline.is_some());
        assert_eq!(server.sessions.get(1).population, 1);
        server.sessions.check_consistency(&server.users).unwrap();
    }

    #[test]
    fn test_deliberate_quit_skips_grace() {
        let mut server = test_server("quit");
        let slot = fake_join(&mut server, 1, "bob", true);
        server.sessions.get_mut(1).has_game = true;

        server.close_user(slot, ErrorType::Ordered, false);

        assert_eq!(server.users.get(slot).state, UserState::Idle);
        assert_eq!(server.sessions.get(1).population, 0);
        assert!(!server.sessions.get(1).has_game);
        server.sessions.check_consistency(&server.users).unwrap();
    }

    #[test]
    fn test_spectator_disconnect_released_immediately() {
        let mut server = test_server("spectator");
        let slot = fake_join(&mut server, 1, "watcher", false);
        server.sessions.get_mut(1).has_game = true;

        server.close_user(slot, ErrorType::Closed, true);

        assert_eq!(server.users.get(slot).state, UserState::Idle);
    }

    #[test]
    fn test_grace_deadline_clears_session() {
        let mut server = test_server("deadline");
        let slot = fake_join(&mut server, 1, "carol", true);
        server.sessions.get_mut(1).has_game = true;

        server.close_user(slot, ErrorType::Closed, true);
        assert_eq!(server.users.get(slot).state, UserState::Closing);

        // Rewind the deadlines so maintenance sees them as lapsed.
        let now = timestamp_secs();
        server.users.get_mut(slot).close_deadline = now - 1;
        server.sessions.get_mut(1).clear_deadline = Some(now - 1);

        server.maintenance(now);

        assert_eq!(server.users.get(slot).state, UserState::Idle);
        assert_eq!(server.sessions.get(1).population, 0);
        assert!(!server.sessions.get(1).has_game);
        server.sessions.check_consistency(&server.users).unwrap();
    }

    #[test]
    fn test_orphan_sweep_force_clears() {
        let mut server = test_server("orphan");

        // A session that looks populated (reservation set) but holds no
        // sockets and went idle long ago.
        {
            let session = server.sessions.get_mut(2);
            session.reservation = "stale-key".to_string();
            session.last_active = 1000;
        }

        server.maintenance(1000 + ORPHAN_TIMEOUT_SECS + 1);

        assert_eq!(server.sessions.get(2).reservation, "");
        assert_eq!(server.sessions.get(2).clear_deadline, None);
    }

    #[test]
    fn test_preauth_timeout_is_shorter() {
        let mut server = test_server("preauth");
        let now = timestamp_secs();

        let waiting = server.sessions.waiting_index();
        let slot = server.sessions.allocate_user(&mut server.users).unwrap();
        server.users.get_mut(slot).reset_for_accept(
            MockTransport::boxed(b""),
            "init".to_string(),
            now - server.opts.preauth_timeout_secs - 5,
        );
        server.sessions.attach(&mut server.users, slot, waiting);
        server.live.insert(slot);

        server.maintenance(now);

        assert_eq!(server.users.get(slot).state, UserState::Idle);
        assert!(!server.live.contains(&slot));
    }

    #[test]
    fn test_clear_session_releases_game_claim() {
        let mut server = test_server("claims");
        let slot = fake_join(&mut server, 1, "dave", true);

        let today = day_stamp();
        let now = timestamp_secs();
        let game = server.games.record_new("held", b"x", 1, today, now).unwrap();
        server.games.claim(game, 1);
        server.sessions.get_mut(1).game = Some(game);
        server.sessions.get_mut(1).has_game = true;

        server.close_user(slot, ErrorType::Ordered, false);

        assert_eq!(server.games.get(game).owner, None);
        assert!(server.games.get(game).preserved);
        server.games.check_refcounts().unwrap();
    }

    #[test]
    fn test_finish_drains_dirty_queue() {
        let mut server = test_server("drain");

        let today = day_stamp();
        let now = timestamp_secs();
        server.games.record_new("flush-me", b"bytes", 1, today, now).unwrap();

        server.finish();

        let path = server.games.file_path("flush-me");
        assert!(path.exists());
        drop(std::fs::remove_file(path));
    }
}
