//! Opcode dispatch.
//!
//! Every client line carries a 3-digit opcode. Even codes are requests,
//! odd codes are replies (request + 1), and request + 3 is the
//! broadcast-to-session variant of the reply. The code is parsed once into
//! an `Opcode` and matched exhaustively; prefix ambiguity cannot arise.
//!
//! Handlers report what became of the current connection through `Flow`:
//! takeover is the one operation that resumes the caller as a different
//! slot, and it says so explicitly instead of mutating a shared current-user
//! variable.

use crate::game::{AppendOutcome, GameCache};
use crate::guard::Guard;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::session::{SessionTable, LOBBY};
use crate::user::{splice_takeover, UserPool, UserState};
use crate::{SessionIdx, Slot};
use ember::cipher;
use ember::encoding;
use ember::logging::{debug, info, warn, Logger};
use ember::UserUid;

/// Raw-byte span of a fetch chunk before escaping.
const FETCH_CHUNK: usize = 256;

/// Longest accepted display name.
const MAX_NAME_LEN: usize = 24;

/// Scoring checks carry at most this many uid arguments.
const MAX_SCORE_UIDS: usize = 12;

/// What became of the connection that sent the line.
#[derive(Debug, Eq, PartialEq)]
pub enum Flow {
    /// Keep reading lines for the same slot.
    Continue,
    /// The connection must be closed for the given reason.
    Closed(ErrorType),
    /// A takeover spliced this connection onto a preserved identity; the
    /// caller continues with that slot.
    ResumedAs(Slot),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Opcode {
    Intro,
    Name,
    Chat,
    ScoreCheck,
    Takeover,
    Direct,
    Ping,
    Summary,
    Detail,
    LogOn,
    Password,
    MultiSendNames,
    MultiSendUids,
    WriteGameFile,
    GameQuery,
    GameFetch,
    GameSave,
    GameRemove,
    LogOff,
    GameAppend,
    Reserve,
    SetState,
    GameLock,
    MultiCommand,
    GameQueryFiltered,
    GameList,
    GameListByOwner,
    GameListByAge,
}

impl Opcode {
    pub fn parse(code: u16) -> Option<Opcode> {
        match code {
            200 => Some(Opcode::Intro),
            204 => Some(Opcode::Name),
            210 => Some(Opcode::Chat),
            218 => Some(Opcode::ScoreCheck),
            220 => Some(Opcode::Takeover),
            230 => Some(Opcode::Direct),
            302 => Some(Opcode::Ping),
            304 => Some(Opcode::Summary),
            306 => Some(Opcode::Detail),
            308 => Some(Opcode::LogOn),
            310 => Some(Opcode::Password),
            312 => Some(Opcode::MultiSendNames),
            314 => Some(Opcode::MultiSendUids),
            316 => Some(Opcode::WriteGameFile),
            318 => Some(Opcode::GameQuery),
            320 => Some(Opcode::GameFetch),
            322 => Some(Opcode::GameSave),
            324 => Some(Opcode::GameRemove),
            326 => Some(Opcode::LogOff),
            328 => Some(Opcode::GameAppend),
            332 => Some(Opcode::Reserve),
            334 => Some(Opcode::SetState),
            336 => Some(Opcode::GameLock),
            338 => Some(Opcode::MultiCommand),
            340 => Some(Opcode::GameQueryFiltered),
            342 => Some(Opcode::GameList),
            344 => Some(Opcode::GameListByOwner),
            346 => Some(Opcode::GameListByAge),
            _ => None,
        }
    }
}

/// Everything a handler may touch. Handlers that doom *other* connections
/// (a broadcast target overran its output) record them here; the event loop
/// closes them after the current line finishes.
pub struct Ctx<'a> {
    pub users: &'a mut UserPool,
    pub sessions: &'a mut SessionTable,
    pub games: &'a mut GameCache,
    pub guard: &'a mut Guard,
    pub log: &'a Logger,
    pub now: u64,
    pub today: u32,
    pub server_ident: &'a str,
    pub per_ip_session_cap: usize,
    pub per_uid_ip_cap: usize,
    pub next_uid: &'a mut UserUid,
    pub shutdown: &'a mut bool,
    pub doomed: &'a mut Vec<(Slot, ErrorType)>,
}

impl<'a> Ctx<'a> {
    /// Queues a reply to the current slot. An output overrun here closes
    /// the sender, so it propagates as the fatal error it is.
    fn reply(&mut self, slot: Slot, line: &str) -> NetworkResult<()> {
        self.users.get_mut(slot).enqueue_line(line.as_bytes())
    }

    /// Queues a line to some other slot; an overrun dooms that slot
    /// instead of the sender.
    fn deliver(&mut self, target: Slot, line: &str) {
        let user = self.users.get_mut(target);

        if !user.has_socket() {
            return;
        }

        if let Err(NetworkError::Fatal(kind)) = user.enqueue_line(line.as_bytes()) {
            self.doomed.push((target, kind));
        }
    }

    /// Sends to every session member except `except`.
    fn broadcast(&mut self, session: SessionIdx, except: Option<Slot>, line: &str) {
        for member in self.sessions.members(self.users, session) {
            if Some(member) != except {
                self.deliver(member, line);
            }
        }
    }

    fn count_unexpected(&mut self, slot: Slot) -> NetworkResult<()> {
        self.users.get_mut(slot).count_unexpected()
    }

    /// Logs a protocol complaint, bounded per connection so one abusive
    /// client cannot flood the server log.
    fn log_protocol(&mut self, slot: Slot, what: &str, detail: &str) {
        let user = self.users.get_mut(slot);

        if user.errors_logged < crate::user::MAX_ERRORS_LOGGED {
            user.errors_logged += 1;
            debug!(self.log, "Protocol complaint";
                   "slot" => slot, "what" => what, "detail" => detail);
        }
    }
}

/// Processes one extracted line: sequence prefix, checksum envelope,
/// obfuscation, then opcode dispatch. Decoding happens exactly once per
/// line, on whichever path applies.
pub fn process_line(ctx: &mut Ctx, slot: Slot, raw: Vec<u8>) -> Flow {
    match process_inner(ctx, slot, raw) {
        Ok(flow) => flow,
        Err(NetworkError::Fatal(kind)) => Flow::Closed(kind),
        Err(NetworkError::Wait) => Flow::Continue,
    }
}

fn process_inner(ctx: &mut Ctx, slot: Slot, raw: Vec<u8>) -> NetworkResult<Flow> {
    ctx.users.get_mut(slot).last_active = ctx.now;

    let mut line = raw;

    if ctx.users.get(slot).uses_sequence {
        line = strip_sequence(ctx, slot, line)?;
    }

    if line.starts_with(b"500 ") {
        return checksum_path(ctx, slot, line);
    }

    // Decrypt-only path: the whole line decodes in place, once.
    if let Some(key) = ctx.users.get_mut(slot).rx_key.as_mut() {
        key.decode(&mut line);
    }

    dispatch_payload(ctx, slot, &line)
}

/// Verifies and strips the literal sequence-number prefix. A mismatch is
/// logged once per connection and counted, never fatal on its own.
fn strip_sequence(ctx: &mut Ctx, slot: Slot, line: Vec<u8>) -> NetworkResult<Vec<u8>> {
    let digits = line.iter().take_while(|b| b.is_ascii_digit()).count();

    if digits == 0 || line.get(digits) != Some(&b' ') {
        ctx.log_protocol(slot, "sequence", "missing counter prefix");
        ctx.count_unexpected(slot)?;
        return Ok(line);
    }

    let received: u32 = std::str::from_utf8(&line[..digits])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(NetworkError::Fatal(ErrorType::Malformed))?;

    let user = ctx.users.get_mut(slot);
    let expected = user.seq_in.wrapping_add(1);

    if received != expected {
        user.seq_faults += 1;

        if !user.seq_fault_logged {
            user.seq_fault_logged = true;
            warn!(ctx.log, "Sequence mismatch";
                  "slot" => slot, "expected" => expected, "received" => received);
        }
    }

    user.seq_in = received;
    Ok(line[digits + 1..].to_vec())
}

/// The `500` envelope: four check letters over the wire bytes of the
/// remainder. A mismatch kills the line, not the connection.
fn checksum_path(ctx: &mut Ctx, slot: Slot, line: Vec<u8>) -> NetworkResult<Flow> {
    let sum = match line.get(4..8).and_then(cipher::decode_check) {
        Some(sum) if line.get(8) == Some(&b' ') => sum,
        _ => {
            ctx.log_protocol(slot, "envelope", "malformed 500 header");
            ctx.count_unexpected(slot)?;
            return Ok(Flow::Continue);
        }
    };

    let mut payload = line[9..].to_vec();

    if cipher::line_checksum(&payload) != sum {
        ctx.log_protocol(slot, "checksum", "line checksum mismatch");
        ctx.count_unexpected(slot)?;
        ctx.reply(slot, "501 failed")?;
        return Ok(Flow::Continue);
    }

    // The client is checksumming; wrap our own lines from here on.
    ctx.users.get_mut(slot).require_checksum = true;

    if let Some(key) = ctx.users.get_mut(slot).rx_key.as_mut() {
        key.decode(&mut payload);
    }

    dispatch_payload(ctx, slot, &payload)
}

fn dispatch_payload(ctx: &mut Ctx, slot: Slot, payload: &[u8]) -> NetworkResult<Flow> {
    let code = match parse_code(payload) {
        Some(code) => code,
        None => {
            ctx.log_protocol(slot, "opcode", "unparseable line head");
            ctx.count_unexpected(slot)?;
            ctx.reply(slot, &format!("999 {}", preview(payload)))?;
            return Ok(Flow::Continue);
        }
    };

    if code % 2 == 1 {
        // Odd opcodes belong to the server; a client sending one is abuse.
        ctx.log_protocol(slot, "opcode", "client sent a reply code");
        ctx.count_unexpected(slot)?;
        return Ok(Flow::Continue);
    }

    let args = match std::str::from_utf8(payload.get(4..).unwrap_or(b"")) {
        Ok(args) => args.to_string(),
        Err(_) => {
            ctx.count_unexpected(slot)?;
            return Ok(Flow::Continue);
        }
    };

    let opcode = match Opcode::parse(code) {
        Some(opcode) => opcode,
        None => {
            ctx.log_protocol(slot, "opcode", "unrecognized");
            ctx.count_unexpected(slot)?;
            ctx.reply(slot, &format!("999 {}", preview(payload)))?;
            return Ok(Flow::Continue);
        }
    };

    if ctx.users.get(slot).trace_log {
        info!(ctx.log, "Trace"; "slot" => slot, "code" => code, "args" => &args);
    }

    match opcode {
        Opcode::Intro => intro(ctx, slot, &args),
        Opcode::Name => rename(ctx, slot, &args),
        Opcode::Chat => chat(ctx, slot, &args),
        Opcode::ScoreCheck => score_check(ctx, slot, &args),
        Opcode::Takeover => takeover(ctx, slot, &args),
        Opcode::Direct => direct(ctx, slot, &args),
        Opcode::Ping => ping(ctx, slot, &args),
        Opcode::Summary => summary(ctx, slot),
        Opcode::Detail => detail(ctx, slot, &args),
        Opcode::LogOn => set_trace(ctx, slot, true),
        Opcode::LogOff => set_trace(ctx, slot, false),
        Opcode::Password => password(ctx, slot, &args),
        Opcode::MultiSendNames => multi_send(ctx, slot, &args, false),
        Opcode::MultiSendUids => multi_send(ctx, slot, &args, true),
        Opcode::WriteGameFile => write_game_file(ctx, slot),
        Opcode::GameQuery => game_query(ctx, slot, &args),
        Opcode::GameFetch => game_fetch(ctx, slot, &args),
        Opcode::GameSave => game_save(ctx, slot, &args),
        Opcode::GameRemove => game_remove(ctx, slot, &args),
        Opcode::GameAppend => game_append(ctx, slot, &args),
        Opcode::Reserve => reserve(ctx, slot, &args),
        Opcode::SetState => set_state(ctx, slot, &args),
        Opcode::GameLock => game_lock(ctx, slot, &args),
        Opcode::MultiCommand => multi_command(ctx, slot, &args),
        Opcode::GameQueryFiltered => game_list(ctx, slot, GameFilter::Prefix(args.trim().to_string()), 341),
        Opcode::GameList => game_list(ctx, slot, GameFilter::All, 343),
        Opcode::GameListByOwner => {
            match args.trim().parse::<UserUid>() {
                Ok(uid) => game_list(ctx, slot, GameFilter::Owner(uid), 345),
                Err(_) => malformed(ctx, slot, "344 needs a uid"),
            }
        }
        Opcode::GameListByAge => {
            match args.trim().parse::<u32>() {
                Ok(days) => game_list(ctx, slot, GameFilter::MaxAgeDays(days), 347),
                Err(_) => malformed(ctx, slot, "346 needs a day count"),
            }
        }
    }
}

fn parse_code(payload: &[u8]) -> Option<u16> {
    if payload.len() < 3 || !payload[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }

    if payload.len() > 3 && payload[3] != b' ' {
        return None;
    }

    std::str::from_utf8(&payload[..3]).ok()?.parse().ok()
}

/// Short printable echo of a rejected line for the 999 reply.
fn preview(payload: &[u8]) -> String {
    let cut = payload.len().min(32);
    String::from_utf8_lossy(&encoding::escape(&payload[..cut])).into_owned()
}

fn malformed(ctx: &mut Ctx, slot: Slot, detail: &str) -> NetworkResult<Flow> {
    ctx.log_protocol(slot, "args", detail);
    ctx.count_unexpected(slot)?;
    Ok(Flow::Continue)
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_graphic() && b != b'(' && b != b')')
}

/// Smallest seat number not taken by a player in the session.
fn free_seat(ctx: &Ctx, session: SessionIdx) -> u8 {
    let mut taken = [false; 256];

    for member in ctx.sessions.members(ctx.users, session) {
        let user = ctx.users.get(member);
        if user.is_player || user.reclaimable {
            taken[user.seat as usize] = true;
        }
    }

    (1..=255u8).find(|&seat| !taken[seat as usize]).unwrap_or(0)
}

/// `200 <session> <name> <ip> <pwd|<none>> <cookie> <flags>` — the
/// introduction that moves a waiting connection into a session.
fn intro(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    if ctx.users.get(slot).state != UserState::Waiting {
        return malformed(ctx, slot, "intro from a non-waiting slot");
    }

    let fields: Vec<&str> = args.split_whitespace().collect();

    if fields.len() < 6 {
        return malformed(ctx, slot, "intro needs 6 fields");
    }

    let target: SessionIdx = match fields[0].parse() {
        Ok(idx) => idx,
        Err(_) => return malformed(ctx, slot, "bad session index"),
    };
    let name = fields[1];
    let password = fields[3];
    let cookie = fields[4];
    let flags: u32 = fields[5].parse().unwrap_or(0);

    if !ctx.sessions.is_room(target) {
        ctx.reply(slot, "201 failed no-such-session")?;
        return malformed(ctx, slot, "intro to nonexistent session");
    }

    if !valid_name(name) {
        ctx.reply(slot, "201 failed bad-name")?;
        return malformed(ctx, slot, "unusable display name");
    }

    if ctx.guard.banned_identity(cookie, name, 0) {
        return Err(NetworkError::Fatal(ErrorType::Banned));
    }

    let ip = ctx.users.get(slot).ip;

    if let Some(ip) = ip {
        if !ctx.guard.check_prereg(ip, ctx.now) {
            ctx.reply(slot, "201 failed not-registered")?;
            return malformed(ctx, slot, "strict login, no preregistration");
        }

        if ctx.sessions.ip_count(ctx.users, target, ip) >= ctx.per_ip_session_cap {
            ctx.reply(slot, "201 failed session-ip-cap")?;
            return malformed(ctx, slot, "per-ip-per-session cap");
        }
    }

    let (poisoned, password_ok) = {
        let session = ctx.sessions.get(target);
        let password_ok = session.password.is_empty()
            || (password != "<none>" && password == session.password);
        (session.poisoned, password_ok)
    };

    if poisoned {
        ctx.reply(slot, "201 failed closed")?;
        return malformed(ctx, slot, "intro to poisoned session");
    }

    if !password_ok {
        ctx.reply(slot, "201 failed password")?;
        return malformed(ctx, slot, "wrong session password");
    }

    // Same uid behind the same address joining over and over is a proxy
    // loop; bound it.
    if let Some(ip) = ip {
        let dupes = ctx
            .sessions
            .members(ctx.users, target)
            .iter()
            .filter(|&&m| {
                let other = ctx.users.get(m);
                other.ip == Some(ip) && other.cookie == cookie
            })
            .count();

        if dupes >= ctx.per_uid_ip_cap {
            ctx.reply(slot, "201 failed uid-ip-cap")?;
            return malformed(ctx, slot, "per-uid-per-ip cap");
        }
    }

    let uid = *ctx.next_uid;
    *ctx.next_uid += 1;

    let wants_player = flags & 0x1 != 0;
    let is_robot = flags & 0x2 != 0;
    let wants_crypto = flags & 0x4 != 0;
    let wants_sequence = flags & 0x8 != 0;

    let seat = if wants_player { free_seat(ctx, target) } else { 0 };

    {
        let user = ctx.users.get_mut(slot);
        user.uid = uid;
        user.name = name.to_string();
        user.real_name = name.to_string();
        user.cookie = cookie.to_string();
        user.seat = seat;
        user.is_player = wants_player;
        user.is_robot = is_robot;
        user.state = UserState::Session;
    }

    ctx.sessions.relocate(ctx.users, slot, target);

    {
        let session = ctx.sessions.get_mut(target);
        session.last_active = ctx.now;
        session.clear_deadline = None;
    }

    let init = ctx.users.get(slot).init_string.clone();
    let reply = format!(
        "201 {} {} {} {} {} 0",
        target, uid, ctx.server_ident, seat, init
    );
    ctx.reply(slot, &reply)?;

    // The 201 went out in the clear; everything after obeys the flags.
    if wants_crypto {
        ctx.users.get_mut(slot).enable_crypto();
    }
    if wants_sequence {
        ctx.users.get_mut(slot).uses_sequence = true;
    }

    let joined = format!("203 {} {} joined", name, uid);
    ctx.broadcast(target, Some(slot), &joined);

    info!(ctx.log, "User joined"; "slot" => slot, "session" => target,
          "name" => name, "uid" => uid, "player" => wants_player);

    Ok(Flow::Continue)
}

/// `204 <newname>`
fn rename(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let name = args.trim();

    if ctx.users.get(slot).state != UserState::Session || !valid_name(name) {
        return malformed(ctx, slot, "unusable rename");
    }

    let old = ctx.users.get(slot).name.clone();

    {
        let user = ctx.users.get_mut(slot);
        user.name = name.to_string();
        user.real_name = name.to_string();
    }

    ctx.reply(slot, &format!("205 {} {}", old, name))?;
    Ok(Flow::Continue)
}

/// `210 <text>` — session chat. The sender always hears the echo; the rest
/// of the session hears the broadcast unless the sender is gagged.
fn chat(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    if ctx.users.get(slot).state != UserState::Session {
        return malformed(ctx, slot, "chat outside a session");
    }

    let (name, session, gagged, supervisor) = {
        let user = ctx.users.get(slot);
        (user.name.clone(), user.session, user.gagged, user.supervisor)
    };

    ctx.reply(slot, &format!("211 {} {}", name, args))?;

    if !gagged || supervisor {
        let line = format!("213 {} {}", name, args);
        ctx.broadcast(session, Some(slot), &line);
    }

    Ok(Flow::Continue)
}

/// `218 <uid> [<uid> ...]` — external-scoring presence check.
fn score_check(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let uids: Vec<UserUid> = args
        .split_whitespace()
        .take(MAX_SCORE_UIDS)
        .filter_map(|field| field.parse().ok())
        .collect();

    if uids.is_empty() {
        return malformed(ctx, slot, "score check without uids");
    }

    let mut verdicts = Vec::with_capacity(uids.len());
    let mut all_present = true;

    for uid in &uids {
        let present = ctx
            .users
            .iter()
            .any(|user| user.state == UserState::Session && user.uid == *uid);
        all_present &= present;
        verdicts.push(format!("{}:{}", uid, present as u8));
    }

    if all_present {
        let session = ctx.users.get(slot).session;
        if ctx.sessions.is_room(session) {
            ctx.sessions.get_mut(session).scored = true;
        }
    }

    ctx.reply(slot, &format!("219 {}", verdicts.join(" ")))?;
    Ok(Flow::Continue)
}

/// `220 quit`, or `220 <session> <seat> <cookie>` to reclaim a preserved
/// identity.
fn takeover(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let fields: Vec<&str> = args.split_whitespace().collect();

    if fields.first() == Some(&"quit") {
        ctx.users.get_mut(slot).awaiting_eof = true;
        ctx.reply(slot, "221 bye")?;
        return Ok(Flow::Closed(ErrorType::Ordered));
    }

    if ctx.users.get(slot).state != UserState::Waiting {
        return malformed(ctx, slot, "takeover from a non-waiting slot");
    }

    if fields.len() < 3 {
        return malformed(ctx, slot, "takeover needs session, seat, cookie");
    }

    let (target, seat): (SessionIdx, u8) = match (fields[0].parse(), fields[1].parse()) {
        (Ok(t), Ok(s)) => (t, s),
        _ => return malformed(ctx, slot, "bad takeover fields"),
    };
    let cookie = fields[2];

    if !ctx.sessions.is_room(target) {
        ctx.reply(slot, "221 failed")?;
        return malformed(ctx, slot, "takeover of nonexistent session");
    }

    let preserved = ctx
        .sessions
        .members(ctx.users, target)
        .into_iter()
        .find(|&member| {
            let user = ctx.users.get(member);
            user.reclaimable && user.seat == seat && user.cookie == cookie
        });

    let preserved = match preserved {
        Some(member) => member,
        None => {
            ctx.reply(slot, "221 failed")?;
            ctx.count_unexpected(slot)?;
            return Ok(Flow::Continue);
        }
    };

    // Splice the fresh transport onto the preserved identity, then scrub
    // the fresh slot back into the pool.
    splice_takeover(ctx.users, preserved, slot, ctx.now);
    ctx.sessions.release_user(ctx.users, slot);

    {
        let session = ctx.sessions.get_mut(target);
        session.last_active = ctx.now;
        session.clear_deadline = None;
    }

    ctx.reply(preserved, &format!("221 {} {} resumed", target, seat))?;

    let name = ctx.users.get(preserved).name.clone();
    ctx.broadcast(target, Some(preserved), &format!("223 {} returned", name));

    info!(ctx.log, "Seat takeover"; "session" => target, "seat" => seat,
          "slot" => preserved);

    Ok(Flow::ResumedAs(preserved))
}

/// `230 <name|#uid> <text>` — message to one user anywhere on the server.
fn direct(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    if ctx.users.get(slot).state != UserState::Session {
        return malformed(ctx, slot, "direct send outside a session");
    }

    let mut split = args.splitn(2, ' ');
    let target_field = split.next().unwrap_or("");
    let text = split.next().unwrap_or("");

    if target_field.is_empty() || text.is_empty() {
        return malformed(ctx, slot, "direct send needs target and text");
    }

    let target = find_user(ctx, target_field);

    let (from, gagged, supervisor) = {
        let user = ctx.users.get(slot);
        (user.name.clone(), user.gagged, user.supervisor)
    };

    match target {
        Some(target) if !gagged || supervisor => {
            let line = format!("231 {} {}", from, text);
            ctx.deliver(target, &line);
        }
        Some(_) => {} // Gagged senders whisper into the void.
        None => ctx.reply(slot, "231 failed no-such-user")?,
    }

    Ok(Flow::Continue)
}

fn find_user(ctx: &Ctx, field: &str) -> Option<Slot> {
    if let Some(uid_text) = field.strip_prefix('#') {
        let uid: UserUid = uid_text.parse().ok()?;
        return ctx
            .users
            .iter()
            .find(|user| user.state == UserState::Session && user.uid == uid)
            .map(|user| user.slot);
    }

    ctx.users
        .iter()
        .find(|user| user.state == UserState::Session && user.name.eq_ignore_ascii_case(field))
        .map(|user| user.slot)
}

/// `302 <payload>` → `303 <payload>`.
fn ping(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    ctx.reply(slot, &format!("303 {}", args))?;
    Ok(Flow::Continue)
}

/// `304` — one `305` line per occupied room, closed by `305 .`.
fn summary(ctx: &mut Ctx, slot: Slot) -> NetworkResult<Flow> {
    for idx in 0..ctx.sessions.room_count() {
        let session = ctx.sessions.get(idx);

        if session.population == 0 && !session.looks_populated() {
            continue;
        }

        let line = format!(
            "305 {} {} {} {} {} {}",
            idx,
            session.population,
            session.room_type,
            session.game_type,
            session.private as u8,
            !session.password.is_empty() as u8,
        );
        ctx.reply(slot, &line)?;
    }

    ctx.reply(slot, "305 .")?;
    Ok(Flow::Continue)
}

/// `306 <session> [all]` — member roster; with `all` the lines also go to
/// the whole session as `309`.
fn detail(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let fields: Vec<&str> = args.split_whitespace().collect();

    let target: SessionIdx = match fields.first().and_then(|f| f.parse().ok()) {
        Some(idx) => idx,
        None => return malformed(ctx, slot, "detail needs a session"),
    };

    if !ctx.sessions.is_room(target) {
        return malformed(ctx, slot, "detail of nonexistent session");
    }

    let broadcast_too = fields.get(1) == Some(&"all");
    let mut lines = Vec::new();

    for member in ctx.sessions.members(ctx.users, target) {
        let user = ctx.users.get(member);
        lines.push(format!(
            "307 {} {} {} {} {} {}",
            member, user.name, user.uid, user.seat, user.is_player as u8, user.is_robot as u8,
        ));
    }
    lines.push("307 .".to_string());

    for line in &lines {
        ctx.reply(slot, line)?;
    }

    if broadcast_too {
        for line in &lines {
            let line = format!("309 {}", &line[4..]);
            ctx.broadcast(target, Some(slot), &line);
        }
    }

    Ok(Flow::Continue)
}

/// `308` / `326` — per-user server-side trace logging.
fn set_trace(ctx: &mut Ctx, slot: Slot, enable: bool) -> NetworkResult<Flow> {
    ctx.users.get_mut(slot).trace_log = enable;

    match enable {
        true => ctx.reply(slot, "309 log 1")?,
        false => ctx.reply(slot, "327 log 0")?,
    }

    Ok(Flow::Continue)
}

/// `310 [password]` — set or clear the session password. Players only;
/// the lobby stays open.
fn password(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let (session, is_player) = {
        let user = ctx.users.get(slot);
        (user.session, user.is_player)
    };

    if !is_player || !ctx.sessions.is_room(session) || session == LOBBY {
        ctx.reply(slot, "311 failed")?;
        return malformed(ctx, slot, "password change refused");
    }

    ctx.sessions.get_mut(session).password = args.trim().to_string();
    ctx.reply(slot, "311 ok")?;
    Ok(Flow::Continue)
}

/// `312 <a,b,c> <text>` by names, `314 <1,2,3> <text>` by uids.
fn multi_send(ctx: &mut Ctx, slot: Slot, args: &str, by_uid: bool) -> NetworkResult<Flow> {
    if ctx.users.get(slot).state != UserState::Session {
        return malformed(ctx, slot, "multi-send outside a session");
    }

    let mut split = args.splitn(2, ' ');
    let list = split.next().unwrap_or("");
    let text = split.next().unwrap_or("");

    if list.is_empty() || text.is_empty() {
        return malformed(ctx, slot, "multi-send needs targets and text");
    }

    let (from, gagged, supervisor) = {
        let user = ctx.users.get(slot);
        (user.name.clone(), user.gagged, user.supervisor)
    };

    if gagged && !supervisor {
        return Ok(Flow::Continue);
    }

    let reply_code = if by_uid { 315 } else { 313 };
    let line = format!("{} {} {}", reply_code, from, text);

    for field in list.split(',') {
        let target = if by_uid {
            find_user(ctx, &format!("#{}", field))
        } else {
            find_user(ctx, field)
        };

        if let Some(target) = target {
            if target != slot {
                ctx.deliver(target, &line);
            }
        }
    }

    Ok(Flow::Continue)
}

/// `316` — force the session's game into the write-back queue.
fn write_game_file(ctx: &mut Ctx, slot: Slot) -> NetworkResult<Flow> {
    let session = ctx.users.get(slot).session;

    if !ctx.sessions.is_room(session) {
        return malformed(ctx, slot, "write-file outside a room");
    }

    match ctx.sessions.get(session).game {
        Some(game) if ctx.games.get(game).preserved => {
            ctx.games.mark_dirty(game, ctx.now);
            ctx.sessions.get_mut(session).file_written = true;
            ctx.reply(slot, "317 queued")?;
        }
        _ => ctx.reply(slot, "317 failed")?,
    }

    Ok(Flow::Continue)
}

/// Resolves a game id for this session: `"*"` is the session-scoped,
/// never-hashed buffer, lazily created when `create` is set.
fn resolve_game(
    ctx: &mut Ctx,
    session: SessionIdx,
    id: &str,
    create: bool,
) -> Option<crate::GameSlot> {
    if id == "*" {
        if let Some(game) = ctx.sessions.get(session).game {
            return Some(game);
        }

        if !create {
            return None;
        }

        let game = ctx.games.create("*", ctx.today, ctx.now);
        ctx.games.claim(game, session);
        ctx.sessions.get_mut(session).game = Some(game);
        return Some(game);
    }

    ctx.games.find_named(id, ctx.today, ctx.now)
}

/// `318 <id>`.
fn game_query(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let id = args.trim();

    if id.is_empty() {
        return malformed(ctx, slot, "query without id");
    }

    let session = ctx.users.get(slot).session;

    match resolve_game(ctx, session, id, false) {
        Some(game) => {
            let (uid, len) = {
                let game = ctx.games.get(game);
                (game.uid, game.log.len())
            };
            ctx.reply(slot, &format!("319 {} {} {}", id, uid, len))?;
        }
        None => ctx.reply(slot, &format!("319 {} none", id))?,
    }

    Ok(Flow::Continue)
}

/// `320 <id>` — stream the stored log back in escaped chunks.
fn game_fetch(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let id = args.trim();

    if id.is_empty() {
        return malformed(ctx, slot, "fetch without id");
    }

    let session = ctx.users.get(slot).session;

    let game = match resolve_game(ctx, session, id, false) {
        Some(game) => game,
        None => {
            ctx.reply(slot, &format!("321 {} none", id))?;
            return Ok(Flow::Continue);
        }
    };

    let log_copy = ctx.games.get(game).log.clone();

    for (index, chunk) in log_copy.chunks(FETCH_CHUNK).enumerate() {
        let escaped = String::from_utf8_lossy(&encoding::escape(chunk)).into_owned();
        ctx.reply(slot, &format!("321 {} {}", index * FETCH_CHUNK, escaped))?;
    }

    ctx.reply(slot, "321 .")?;
    Ok(Flow::Continue)
}

/// Demotes every player in a session that holds the same game another
/// session is now claiming: one game may be live in one room only.
fn zap_duplicate_session(ctx: &mut Ctx, game: crate::GameSlot, claimant: SessionIdx) {
    let other = match ctx.games.get(game).owner {
        Some(owner) if owner != claimant => owner,
        _ => return,
    };

    for member in ctx.sessions.members(ctx.users, other) {
        ctx.users.get_mut(member).is_player = false;
    }

    ctx.games.release_claim(game);

    {
        let session = ctx.sessions.get_mut(other);
        session.game = None;
        session.has_game = false;
    }

    warn!(ctx.log, "Duplicate game claim, prior session demoted";
          "game" => ctx.games.get(game).uid, "loser" => other, "winner" => claimant);
}

/// `322 <id> <payload>` — record (or re-record from scratch) a game under
/// this session's ownership.
fn game_save(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let (session, uid, is_player) = {
        let user = ctx.users.get(slot);
        (user.session, user.uid, user.is_player)
    };

    if !is_player || !ctx.sessions.is_room(session) {
        ctx.reply(slot, "323 failed")?;
        return malformed(ctx, slot, "save from a non-player");
    }

    let mut split = args.splitn(2, ' ');
    let id = split.next().unwrap_or("").trim().to_string();
    let payload = match encoding::unescape(split.next().unwrap_or("").as_bytes()) {
        Some(payload) => payload,
        None => return malformed(ctx, slot, "bad escape in save payload"),
    };

    if id.is_empty() {
        return malformed(ctx, slot, "save without id");
    }

    let game = if id == "*" {
        let game = match resolve_game(ctx, session, "*", true) {
            Some(game) => game,
            None => unreachable!("create-mode resolve"),
        };
        ctx.games.rewrite(game, &payload, ctx.today, ctx.now);
        game
    } else {
        match ctx.games.find_named(&id, ctx.today, ctx.now) {
            Some(existing) => {
                zap_duplicate_session(ctx, existing, session);

                if ctx.games.get(existing).owner.is_none() {
                    release_session_game(ctx, session);
                    ctx.games.claim(existing, session);
                    ctx.sessions.get_mut(session).game = Some(existing);
                }

                ctx.games.rewrite(existing, &payload, ctx.today, ctx.now);
                existing
            }
            None => {
                let created = match ctx.games.record_new(&id, &payload, uid, ctx.today, ctx.now) {
                    Ok(created) => created,
                    Err(_) => {
                        ctx.reply(slot, "323 failed cache-full")?;
                        ctx.log_protocol(slot, "cache", "preserved-game ceiling, nothing evictable");
                        return Ok(Flow::Continue);
                    }
                };
                release_session_game(ctx, session);
                ctx.games.claim(created, session);
                ctx.sessions.get_mut(session).game = Some(created);
                created
            }
        }
    };

    {
        let session = ctx.sessions.get_mut(session);
        session.has_game = true;
        session.last_active = ctx.now;
    }

    let (game_uid, offset) = {
        let game = ctx.games.get(game);
        (game.uid, game.log.len())
    };

    ctx.reply(slot, &format!("323 {} {}", game_uid, offset))?;
    Ok(Flow::Continue)
}

/// Drops this session's current game claim, if any.
fn release_session_game(ctx: &mut Ctx, session: SessionIdx) {
    if let Some(old) = ctx.sessions.get_mut(session).game.take() {
        ctx.games.release_claim(old);
    }
}

/// `324 <id>`.
fn game_remove(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let id = args.trim();
    let session = ctx.users.get(slot).session;
    let supervisor = ctx.users.get(slot).supervisor;

    if id.is_empty() || id == "*" {
        return malformed(ctx, slot, "remove needs a real id");
    }

    let game = match ctx.games.find_named(id, ctx.today, ctx.now) {
        Some(game) => game,
        None => {
            ctx.reply(slot, "325 failed")?;
            return Ok(Flow::Continue);
        }
    };

    let owner = ctx.games.get(game).owner;

    if owner != Some(session) && owner.is_some() && !supervisor {
        ctx.reply(slot, "325 failed owned")?;
        return Ok(Flow::Continue);
    }

    if owner == Some(session) {
        release_session_game(ctx, session);
        let s = ctx.sessions.get_mut(session);
        s.has_game = false;
    } else if let Some(other) = owner {
        // Supervisor removal of a claimed game.
        ctx.games.release_claim(game);
        let s = ctx.sessions.get_mut(other);
        s.game = None;
        s.has_game = false;
    }

    ctx.games.unpreserve(game, ctx.now);
    ctx.reply(slot, "325 ok")?;
    Ok(Flow::Continue)
}

/// `328 <id> <offset> <check> <payload>` — append with prefix proof.
fn game_append(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let fields: Vec<&str> = args.splitn(4, ' ').collect();

    if fields.len() < 4 {
        return malformed(ctx, slot, "append needs id, offset, check, payload");
    }

    let id = fields[0];
    let offset: usize = match fields[1].parse() {
        Ok(offset) => offset,
        Err(_) => return malformed(ctx, slot, "bad append offset"),
    };
    let check: u16 = match fields[2].parse() {
        Ok(check) => check,
        Err(_) => return malformed(ctx, slot, "bad append checksum"),
    };
    let payload = match encoding::unescape(fields[3].as_bytes()) {
        Some(payload) => payload,
        None => return malformed(ctx, slot, "bad escape in append payload"),
    };

    let session = ctx.users.get(slot).session;

    let game = match resolve_game(ctx, session, id, id == "*") {
        Some(game) => game,
        None => {
            ctx.reply(slot, &format!("329 {} none", id))?;
            return Ok(Flow::Continue);
        }
    };

    match ctx.games.append(game, offset, check, &payload, ctx.today, ctx.now) {
        AppendOutcome::Appended { offset } => {
            ctx.reply(slot, &format!("329 {}", offset))?;
        }
        AppendOutcome::Desync => {
            warn!(ctx.log, "Append desynchronization, full resend requested";
                  "slot" => slot, "game" => id, "offset" => offset);
            ctx.reply(slot, "329 resend")?;
        }
    }

    Ok(Flow::Continue)
}

/// `332 <session> <key>` — stamp a reservation on an empty room.
fn reserve(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let fields: Vec<&str> = args.split_whitespace().collect();

    if fields.len() < 2 {
        return malformed(ctx, slot, "reserve needs session and key");
    }

    let target: SessionIdx = match fields[0].parse() {
        Ok(idx) => idx,
        Err(_) => return malformed(ctx, slot, "bad reserve session"),
    };

    if !ctx.sessions.is_room(target) || target == LOBBY {
        ctx.reply(slot, "333 failed")?;
        return Ok(Flow::Continue);
    }

    let busy = {
        let session = ctx.sessions.get(target);
        session.population != 0 || !session.reservation.is_empty()
    };

    if busy {
        ctx.reply(slot, "333 failed busy")?;
        return Ok(Flow::Continue);
    }

    {
        let session = ctx.sessions.get_mut(target);
        session.reservation = fields[1].to_string();
        session.last_active = ctx.now;
    }

    ctx.reply(slot, &format!("333 {} reserved", target))?;
    Ok(Flow::Continue)
}

/// `334 <room_type> <game_type> <state_key>` — session mode codes and the
/// fraud-detection state key.
fn set_state(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let session_idx = ctx.users.get(slot).session;

    if !ctx.sessions.is_room(session_idx) {
        return malformed(ctx, slot, "set-state outside a room");
    }

    let fields: Vec<&str> = args.split_whitespace().collect();

    if fields.len() < 3 {
        return malformed(ctx, slot, "set-state needs three fields");
    }

    let (room_type, game_type): (u16, u16) = match (fields[0].parse(), fields[1].parse()) {
        (Ok(r), Ok(g)) => (r, g),
        _ => return malformed(ctx, slot, "bad state codes"),
    };
    let key = fields[2];

    let hash = crate::session::StateKeyTable::hash(key);
    let duplicate = ctx.sessions.state_keys.find_other(hash, session_idx);

    if let Some(other) = duplicate {
        warn!(ctx.log, "State key collision";
              "session" => session_idx, "other" => other, "key" => key);
    }

    let old_slot = ctx.sessions.get(session_idx).state_slot;
    if let Some(old) = old_slot {
        ctx.sessions.state_keys.remove(old);
    }

    let new_slot = ctx.sessions.state_keys.insert(hash, session_idx);

    {
        let session = ctx.sessions.get_mut(session_idx);
        session.room_type = room_type;
        session.game_type = game_type;
        session.state_key = key.to_string();
        session.state_slot = new_slot;
    }

    let flag = if duplicate.is_some() { "dup" } else { "ok" };
    ctx.reply(slot, &format!("335 {}", flag))?;
    Ok(Flow::Continue)
}

/// `336 on|off` — the cooperative game edit lock.
fn game_lock(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    let session_idx = ctx.users.get(slot).session;

    if !ctx.sessions.is_room(session_idx) {
        return malformed(ctx, slot, "lock outside a room");
    }

    let holder = ctx.sessions.get(session_idx).locker;

    let verdict = match args.trim() {
        "on" => match holder {
            None => {
                ctx.sessions.get_mut(session_idx).locker = Some(slot);
                "337 locked"
            }
            Some(current) if current == slot => "337 locked",
            Some(_) => "337 busy",
        },
        "off" => {
            if holder == Some(slot) {
                ctx.sessions.get_mut(session_idx).locker = None;
                "337 unlocked"
            } else {
                "337 failed"
            }
        }
        _ => return malformed(ctx, slot, "lock wants on or off"),
    };

    ctx.reply(slot, verdict)?;
    Ok(Flow::Continue)
}

/// `338 <cmd>|<cmd>|...` — dispatch each embedded command in order. A
/// supervisor may embed `shutdown` to stop the server gracefully.
fn multi_command(ctx: &mut Ctx, slot: Slot, args: &str) -> NetworkResult<Flow> {
    for part in args.split('|') {
        let part = part.trim();

        if part.is_empty() {
            continue;
        }

        if part == "shutdown" {
            if ctx.users.get(slot).supervisor {
                info!(ctx.log, "Supervisor shutdown"; "slot" => slot);
                *ctx.shutdown = true;
                ctx.reply(slot, "339 shutting-down")?;
            } else {
                ctx.count_unexpected(slot)?;
            }
            continue;
        }

        match dispatch_payload(ctx, slot, part.as_bytes())? {
            Flow::Continue => {}
            other => return Ok(other),
        }
    }

    Ok(Flow::Continue)
}

enum GameFilter {
    All,
    Prefix(String),
    Owner(UserUid),
    MaxAgeDays(u32),
}

/// The list family: `342` everything, `340` by id prefix, `344` by owning
/// uid, `346` by maximum age in days.
fn game_list(ctx: &mut Ctx, slot: Slot, filter: GameFilter, reply_code: u16) -> NetworkResult<Flow> {
    let lines: Vec<String> = ctx
        .games
        .preserved_slots()
        .into_iter()
        .filter_map(|game_slot| {
            let game = ctx.games.get(game_slot);

            let keep = match &filter {
                GameFilter::All => true,
                GameFilter::Prefix(prefix) => game
                    .id
                    .get(..prefix.len())
                    .map_or(false, |head| head.eq_ignore_ascii_case(prefix)),
                GameFilter::Owner(uid) => game.owner_uid == *uid,
                GameFilter::MaxAgeDays(days) => ctx.today.saturating_sub(game.last_day) <= *days,
            };

            if keep {
                Some(format!(
                    "{} {} {} {} {}",
                    reply_code,
                    game.id,
                    game.uid,
                    game.log.len(),
                    game.day_stamp
                ))
            } else {
                None
            }
        })
        .collect();

    for line in lines {
        ctx.reply(slot, &line)?;
    }

    ctx.reply(slot, &format!("{} .", reply_code))?;
    Ok(Flow::Continue)
}
