//! The game-record cache.
//!
//! One `GameBuffer` per distinct move-log, reference-counted through three
//! holds: presence in the name table (preserved), membership in the dirty
//! write-back queue, and ownership by a session. A buffer is freed exactly
//! when the count reaches zero, which by construction means none of the
//! three holds remain. Every acquire/release is paired inside this module;
//! callers never touch the count.

use crate::saver::{SaveJob, SaveSink};
use crate::{GameSlot, SessionIdx};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use ember::cipher::line_checksum;
use ember::logging::{info, warn, Logger};
use ember::{GameUid, UserUid};
use std::fs;
use std::io::Read;
use std::path::PathBuf;

/// Log allocations are rounded up to this granularity.
pub const GAME_ALLOC_GRAIN: usize = 1024;

/// Magic tag of the current on-disk layout. Legacy files carry no tag.
const FILE_MAGIC: [u8; 4] = *b"PGB1";

/// Fixed id field width of the legacy layout.
const LEGACY_ID_FIELD: usize = 32;
/// Legacy header: id field plus day stamp plus owner uid.
const LEGACY_HEADER: usize = LEGACY_ID_FIELD + 8;

#[derive(Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    Appended { offset: usize },
    /// Offset or prefix checksum disagreed with the stored log; the client
    /// is desynchronized and must resend from scratch.
    Desync,
}

#[derive(Debug, Eq, PartialEq)]
pub enum CacheError {
    /// Every preserved buffer is owned by a live session; nothing can be
    /// evicted to make room.
    Full,
}

pub struct GameBuffer {
    pub id: String,
    pub uid: GameUid,
    pub hash: u32,
    pub log: Vec<u8>,

    pub ref_count: u32,
    pub preserved: bool,
    pub dirty: bool,
    pub hashed: bool,
    pub owner: Option<SessionIdx>,
    pub owner_uid: UserUid,

    /// Creation day, persisted in the file header.
    pub day_stamp: u32,
    /// Last-activity day; expiry is measured from this.
    pub last_day: u32,
    pub last_active: u64,

    name_slot: Option<usize>,
    prev_all: Option<GameSlot>,
    next_all: Option<GameSlot>,
    next_dirty: Option<GameSlot>,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum NameSlot {
    Empty,
    Tombstone,
    Used(GameSlot),
}

pub struct GameCache {
    entries: Vec<Option<GameBuffer>>,
    free: Vec<GameSlot>,
    names: Vec<NameSlot>,

    all_head: Option<GameSlot>,
    all_tail: Option<GameSlot>,
    dirty_head: Option<GameSlot>,
    dirty_tail: Option<GameSlot>,

    next_uid: GameUid,
    preserved_count: usize,

    max_games: usize,
    ttl_days: u32,
    dir: PathBuf,
}

impl GameCache {
    pub fn new(dir: PathBuf, max_games: usize, ttl_days: u32) -> GameCache {
        GameCache {
            entries: Vec::new(),
            free: Vec::new(),
            names: vec![NameSlot::Empty; (max_games * 2).max(8)],
            all_head: None,
            all_tail: None,
            dirty_head: None,
            dirty_tail: None,
            next_uid: 1,
            preserved_count: 0,
            max_games,
            ttl_days,
            dir,
        }
    }

    /// Case-insensitive hash of a game id.
    pub fn name_hash(id: &str) -> u32 {
        id.bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b.to_ascii_lowercase())))
    }

    #[inline]
    pub fn get(&self, slot: GameSlot) -> &GameBuffer {
        self.entries[slot].as_ref().expect("Stale game slot")
    }

    #[inline]
    pub fn get_mut(&mut self, slot: GameSlot) -> &mut GameBuffer {
        self.entries[slot].as_mut().expect("Stale game slot")
    }

    #[inline]
    pub fn preserved_count(&self) -> usize {
        self.preserved_count
    }

    #[inline]
    pub fn is_live(&self, slot: GameSlot) -> bool {
        self.entries.get(slot).map_or(false, Option::is_some)
    }

    /// Path of the per-game file: the id sanitized to a safe character set.
    pub fn file_path(&self, id: &str) -> PathBuf {
        let mut name = String::with_capacity(id.len() + 8);

        for byte in id.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' => name.push(byte as char),
                _ => name.push_str(&format!("%{:02x}", byte)),
            }
        }

        name.push_str(".game");
        self.dir.join(name)
    }

    #[inline]
    fn expired(&self, game: &GameBuffer, today: u32) -> bool {
        today.saturating_sub(game.last_day) > self.ttl_days
    }

    /// Looks up a preserved game by name. An expired hit is evicted on the
    /// spot and reported as not found; a live hit has its activity stamps
    /// refreshed.
    pub fn find_named(&mut self, id: &str, today: u32, now: u64) -> Option<GameSlot> {
        let slot = self.probe(id)?;

        if self.expired(self.get(slot), today) {
            self.unpreserve(slot, now);
            return None;
        }

        let game = self.get_mut(slot);
        game.last_day = today;
        game.last_active = now;
        Some(slot)
    }

    fn probe(&self, id: &str) -> Option<GameSlot> {
        let hash = Self::name_hash(id);
        let len = self.names.len();
        let mut idx = hash as usize % len;

        for _ in 0..len {
            match self.names[idx] {
                NameSlot::Empty => return None,
                NameSlot::Used(slot) => {
                    let game = self.get(slot);
                    if game.hash == hash && game.id.eq_ignore_ascii_case(id) {
                        return Some(slot);
                    }
                    idx = (idx + 1) % len;
                }
                NameSlot::Tombstone => idx = (idx + 1) % len,
            }
        }

        None
    }

    fn name_insert(&mut self, slot: GameSlot) -> usize {
        let hash = self.get(slot).hash;
        let len = self.names.len();
        let mut idx = hash as usize % len;

        for _ in 0..len {
            match self.names[idx] {
                NameSlot::Empty | NameSlot::Tombstone => {
                    self.names[idx] = NameSlot::Used(slot);
                    return idx;
                }
                NameSlot::Used(_) => idx = (idx + 1) % len,
            }
        }

        // The table is sized at twice the preserved ceiling, which eviction
        // enforces before every insert.
        panic!("Game name table full");
    }

    /// Creates a fresh, unpreserved, unowned buffer. Used for both named
    /// games (preserved immediately by `record_new`) and session-scoped
    /// `"*"` games (claimed by their session, never hashed).
    pub fn create(&mut self, id: &str, today: u32, now: u64) -> GameSlot {
        let uid = self.next_uid;
        self.next_uid += 1;

        let game = GameBuffer {
            id: id.to_string(),
            uid,
            hash: Self::name_hash(id),
            log: Vec::new(),
            ref_count: 0,
            preserved: false,
            dirty: false,
            hashed: false,
            owner: None,
            owner_uid: 0,
            day_stamp: today,
            last_day: today,
            last_active: now,
            name_slot: None,
            prev_all: None,
            next_all: None,
            next_dirty: None,
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.entries[slot] = Some(game);
                slot
            }
            None => {
                self.entries.push(Some(game));
                self.entries.len() - 1
            }
        };

        self.all_push_back(slot);
        slot
    }

    /// Records a new named game sized to the payload: creates, preserves,
    /// and marks it dirty. Fails only when the cache is full of owned
    /// buffers.
    pub fn record_new(
        &mut self,
        id: &str,
        payload: &[u8],
        owner_uid: UserUid,
        today: u32,
        now: u64,
    ) -> Result<GameSlot, CacheError> {
        self.evict_for_room(today, now)?;

        let slot = self.create(id, today, now);

        {
            let game = self.get_mut(slot);
            game.owner_uid = owner_uid;
            reserve_grain(&mut game.log, payload.len());
            game.log.extend_from_slice(payload);
        }

        self.preserve(slot);
        self.mark_dirty(slot, now);
        Ok(slot)
    }

    /// Replaces a buffer's content from offset zero.
    pub fn rewrite(&mut self, slot: GameSlot, payload: &[u8], today: u32, now: u64) {
        {
            let game = self.get_mut(slot);
            game.log.clear();
            reserve_grain(&mut game.log, payload.len());
            game.log.extend_from_slice(payload);
            game.last_day = today;
        }

        if self.get(slot).preserved {
            self.mark_dirty(slot, now);
        } else {
            self.get_mut(slot).last_active = now;
        }
    }

    /// Appends at a caller-supplied offset, verified against the committed
    /// length and a rolling checksum of the stored prefix. Either mismatch
    /// means the client lost sync with what the server holds.
    pub fn append(
        &mut self,
        slot: GameSlot,
        offset: usize,
        prefix_check: u16,
        payload: &[u8],
        today: u32,
        now: u64,
    ) -> AppendOutcome {
        {
            let game = self.get_mut(slot);

            if offset != game.log.len() || line_checksum(&game.log) != prefix_check {
                return AppendOutcome::Desync;
            }

            reserve_grain(&mut game.log, payload.len());
            game.log.extend_from_slice(payload);
            game.last_day = today;
        }

        if self.get(slot).preserved {
            self.mark_dirty(slot, now);
        } else {
            self.get_mut(slot).last_active = now;
        }

        AppendOutcome::Appended {
            offset: self.get(slot).log.len(),
        }
    }

    /// Enters the buffer into the name table. One refcount hold.
    fn preserve(&mut self, slot: GameSlot) {
        if self.get(slot).preserved {
            return;
        }

        let name_slot = self.name_insert(slot);
        let game = self.get_mut(slot);
        game.preserved = true;
        game.hashed = true;
        game.name_slot = Some(name_slot);
        game.ref_count += 1;
        self.preserved_count += 1;
    }

    /// Removes the buffer from the name table and queues the file deletion
    /// via the dirty sweep. Unpreserving an already-unpreserved buffer is a
    /// no-op; the count is never double-decremented.
    pub fn unpreserve(&mut self, slot: GameSlot, now: u64) {
        if !self.get(slot).preserved {
            return;
        }

        // Dirty-queue the buffer first so dropping the preservation hold
        // cannot free it out from under the sweep.
        self.mark_dirty(slot, now);

        let name_slot = {
            let game = self.get_mut(slot);
            game.preserved = false;
            game.hashed = false;
            game.ref_count -= 1;
            game.name_slot.take()
        };

        if let Some(name_slot) = name_slot {
            self.names[name_slot] = NameSlot::Tombstone;
        }

        self.preserved_count -= 1;
        self.maybe_free(slot);
    }

    /// Claims the buffer for a session. One refcount hold per owner.
    pub fn claim(&mut self, slot: GameSlot, session: SessionIdx) {
        let game = self.get_mut(slot);

        if let Some(current) = game.owner {
            panic!(
                "Game {} already owned by session {}, claimed for {}",
                game.uid, current, session
            );
        }

        game.owner = Some(session);
        game.ref_count += 1;
    }

    /// Drops a session's claim, freeing the buffer if nothing else holds
    /// it.
    pub fn release_claim(&mut self, slot: GameSlot) {
        let released = {
            let game = self.get_mut(slot);
            match game.owner.take() {
                Some(_) => {
                    game.ref_count -= 1;
                    true
                }
                None => false,
            }
        };

        if released {
            self.maybe_free(slot);
        }
    }

    /// Marks a buffer dirty and appends it to the write-back queue, taking
    /// one refcount hold for the queue membership. Already-dirty buffers
    /// just refresh their stamps.
    pub fn mark_dirty(&mut self, slot: GameSlot, now: u64) {
        let game = self.get_mut(slot);
        game.last_active = now;

        if game.dirty {
            return;
        }

        game.dirty = true;
        game.ref_count += 1;
        game.next_dirty = None;

        match self.dirty_tail {
            Some(tail) => {
                self.get_mut(tail).next_dirty = Some(slot);
                self.dirty_tail = Some(slot);
            }
            None => {
                self.dirty_head = Some(slot);
                self.dirty_tail = Some(slot);
            }
        }
    }

    fn dirty_pop_front(&mut self) -> Option<GameSlot> {
        let slot = self.dirty_head?;
        let next = self.get_mut(slot).next_dirty.take();
        self.dirty_head = next;

        if next.is_none() {
            self.dirty_tail = None;
        }

        Some(slot)
    }

    fn dirty_push_front(&mut self, slot: GameSlot) {
        let head = self.dirty_head;
        self.get_mut(slot).next_dirty = head;
        self.dirty_head = Some(slot);

        if self.dirty_tail.is_none() {
            self.dirty_tail = Some(slot);
        }
    }

    /// Drains up to `budget` dirty buffers into the save sink, oldest
    /// first. A full sink pushes the entry back and stops; the remainder
    /// waits for the next tick. Returns the number of entries handed off.
    pub fn sweep<S: SaveSink>(&mut self, sink: &S, budget: u32) -> u32 {
        let mut flushed = 0;

        while flushed < budget {
            let slot = match self.dirty_pop_front() {
                Some(slot) => slot,
                None => break,
            };

            let job = {
                let game = self.get(slot);
                let path = self.file_path(&game.id);

                if game.preserved {
                    SaveJob::Write {
                        path,
                        bytes: encode_file(game),
                    }
                } else {
                    SaveJob::Delete { path }
                }
            };

            if sink.try_submit(job).is_err() {
                self.dirty_push_front(slot);
                break;
            }

            let game = self.get_mut(slot);
            game.dirty = false;
            game.ref_count -= 1;
            self.maybe_free(slot);
            flushed += 1;
        }

        flushed
    }

    /// Makes room for one more preserved buffer: evicts expired unowned
    /// buffers first, then the stalest unowned one.
    fn evict_for_room(&mut self, today: u32, now: u64) -> Result<(), CacheError> {
        while self.preserved_count >= self.max_games {
            let victim = self
                .find_expired_unowned(today)
                .or_else(|| self.find_stalest_unowned());

            match victim {
                Some(slot) => self.unpreserve(slot, now),
                None => return Err(CacheError::Full),
            }
        }

        Ok(())
    }

    fn find_expired_unowned(&self, today: u32) -> Option<GameSlot> {
        let mut cursor = self.all_head;

        while let Some(slot) = cursor {
            let game = self.get(slot);
            if game.preserved && game.owner.is_none() && self.expired(game, today) {
                return Some(slot);
            }
            cursor = game.next_all;
        }

        None
    }

    fn find_stalest_unowned(&self) -> Option<GameSlot> {
        let mut best: Option<(u64, GameSlot)> = None;
        let mut cursor = self.all_head;

        while let Some(slot) = cursor {
            let game = self.get(slot);
            if game.preserved && game.owner.is_none() {
                match best {
                    Some((stamp, _)) if stamp <= game.last_active => {}
                    _ => best = Some((game.last_active, slot)),
                }
            }
            cursor = game.next_all;
        }

        best.map(|(_, slot)| slot)
    }

    fn maybe_free(&mut self, slot: GameSlot) {
        {
            let game = self.get(slot);

            if game.ref_count > 0 {
                return;
            }

            if game.preserved || game.dirty || game.owner.is_some() {
                panic!("Game {} held but refcount hit zero", game.uid);
            }
        }

        self.all_unlink(slot);
        self.entries[slot] = None;
        self.free.push(slot);
    }

    fn all_push_back(&mut self, slot: GameSlot) {
        let tail = self.all_tail;

        {
            let game = self.get_mut(slot);
            game.prev_all = tail;
            game.next_all = None;
        }

        match tail {
            Some(tail) => self.get_mut(tail).next_all = Some(slot),
            None => self.all_head = Some(slot),
        }

        self.all_tail = Some(slot);
    }

    fn all_unlink(&mut self, slot: GameSlot) {
        let (prev, next) = {
            let game = self.get_mut(slot);
            (game.prev_all.take(), game.next_all.take())
        };

        match prev {
            Some(prev_slot) => self.get_mut(prev_slot).next_all = next,
            None => self.all_head = next,
        }

        match next {
            Some(next_slot) => self.get_mut(next_slot).prev_all = prev,
            None => self.all_tail = prev,
        }
    }

    /// Preserved buffers in creation order.
    pub fn preserved_slots(&self) -> Vec<GameSlot> {
        let mut out = Vec::with_capacity(self.preserved_count);
        let mut cursor = self.all_head;

        while let Some(slot) = cursor {
            let game = self.get(slot);
            if game.preserved {
                out.push(slot);
            }
            cursor = game.next_all;
        }

        out
    }

    /// Rebuilds the cache from the save directory, accepting both the
    /// current tagged layout and the legacy headerless one. Expired records
    /// are skipped; refcounts on disk are never trusted, every surviving
    /// record starts with exactly the preservation hold.
    pub fn load_dir(&mut self, today: u32, now: u64, log: &Logger) {
        let dir = match fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(log, "Game cache directory unreadable"; "dir" => %self.dir.display(), "error" => %err);
                return;
            }
        };

        let mut loaded = 0usize;
        let mut skipped = 0usize;

        for entry in dir.flatten() {
            let path = entry.path();

            if path.extension().map_or(true, |ext| ext != "game") {
                continue;
            }

            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(log, "Unreadable game file"; "path" => %path.display(), "error" => %err);
                    continue;
                }
            };

            let decoded = match decode_file(&bytes) {
                Some(decoded) => decoded,
                None => {
                    warn!(log, "Corrupt game file"; "path" => %path.display());
                    continue;
                }
            };

            if today.saturating_sub(decoded.day_stamp) > self.ttl_days {
                skipped += 1;
                continue;
            }

            if self.probe(&decoded.id).is_some() || self.preserved_count >= self.max_games {
                skipped += 1;
                continue;
            }

            let slot = self.create(&decoded.id, decoded.day_stamp, now);
            {
                let game = self.get_mut(slot);
                game.owner_uid = decoded.owner_uid;
                game.last_day = decoded.day_stamp;
                reserve_grain(&mut game.log, decoded.log.len());
                game.log.extend_from_slice(&decoded.log);
            }
            self.preserve(slot);
            loaded += 1;
        }

        info!(log, "Game cache reloaded"; "loaded" => loaded, "skipped" => skipped);
    }

    /// Verifies the §refcount identity for every live buffer. Test and
    /// checkpoint use.
    pub fn check_refcounts(&self) -> Result<(), String> {
        let mut preserved = 0usize;

        for entry in self.entries.iter().flatten() {
            let expected = u32::from(entry.preserved)
                + u32::from(entry.dirty)
                + u32::from(entry.owner.is_some());

            if entry.ref_count != expected {
                return Err(format!(
                    "Game {}: refcount {} but holds sum to {}",
                    entry.uid, entry.ref_count, expected
                ));
            }

            if entry.preserved {
                preserved += 1;
            }
        }

        if preserved != self.preserved_count {
            return Err(format!(
                "Preserved count {} but {} buffers preserved",
                self.preserved_count, preserved
            ));
        }

        Ok(())
    }
}

#[inline]
fn reserve_grain(log: &mut Vec<u8>, additional: usize) {
    let want = (log.len() + additional + GAME_ALLOC_GRAIN - 1) / GAME_ALLOC_GRAIN * GAME_ALLOC_GRAIN;
    if want > log.capacity() {
        log.reserve_exact(want - log.len());
    }
}

pub struct DecodedGame {
    pub id: String,
    pub day_stamp: u32,
    pub owner_uid: UserUid,
    pub log: Vec<u8>,
}

/// Serializes a buffer in the tagged layout: magic, id, day stamp, name
/// hash, owning uid, then the raw move-log bytes.
pub fn encode_file(game: &GameBuffer) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 + game.id.len() + 12 + game.log.len());

    out.extend_from_slice(&FILE_MAGIC);
    out.write_u16::<BigEndian>(game.id.len() as u16).expect("vec write");
    out.extend_from_slice(game.id.as_bytes());
    out.write_u32::<BigEndian>(game.day_stamp).expect("vec write");
    out.write_u32::<BigEndian>(game.hash).expect("vec write");
    out.write_u32::<BigEndian>(game.owner_uid).expect("vec write");
    out.extend_from_slice(&game.log);

    out
}

/// Parses either on-disk layout. Tagged files start with the magic; legacy
/// files have a fixed 32-byte NUL-padded id field at offset zero.
pub fn decode_file(bytes: &[u8]) -> Option<DecodedGame> {
    if bytes.len() >= 4 && bytes[..4] == FILE_MAGIC {
        let mut rest = &bytes[4..];

        let id_len = rest.read_u16::<BigEndian>().ok()? as usize;
        if rest.len() < id_len + 12 {
            return None;
        }

        let mut id_bytes = vec![0u8; id_len];
        rest.read_exact(&mut id_bytes).ok()?;
        let id = String::from_utf8(id_bytes).ok()?;

        let day_stamp = rest.read_u32::<BigEndian>().ok()?;
        let _hash = rest.read_u32::<BigEndian>().ok()?;
        let owner_uid = rest.read_u32::<BigEndian>().ok()?;

        return Some(DecodedGame {
            id,
            day_stamp,
            owner_uid,
            log: rest.to_vec(),
        });
    }

    // Legacy layout.
    if bytes.len() < LEGACY_HEADER {
        return None;
    }

    let id_field = &bytes[..LEGACY_ID_FIELD];
    let id_end = id_field.iter().position(|&b| b == 0).unwrap_or(LEGACY_ID_FIELD);
    let id = std::str::from_utf8(&id_field[..id_end]).ok()?.to_string();

    if id.is_empty() {
        return None;
    }

    let mut rest = &bytes[LEGACY_ID_FIELD..];
    let day_stamp = rest.read_u32::<BigEndian>().ok()?;
    let owner_uid = rest.read_u32::<BigEndian>().ok()?;

    Some(DecodedGame {
        id,
        day_stamp,
        owner_uid,
        log: rest.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saver::MemorySink;

    const TODAY: u32 = 738_000;
    const NOW: u64 = 1_700_000_000;

    fn cache(max_games: usize) -> GameCache {
        GameCache::new(PathBuf::from("/tmp/lattice-test-cache"), max_games, 14)
    }

    #[test]
    fn test_record_find_roundtrip() {
        let mut cache = cache(8);

        let slot = cache.record_new("MyGame", b"moves", 7, TODAY, NOW).unwrap();

        assert_eq!(cache.find_named("mygame", TODAY, NOW + 1), Some(slot));
        assert_eq!(cache.find_named("MYGAME", TODAY, NOW + 2), Some(slot));
        assert_eq!(cache.find_named("other", TODAY, NOW), None);
        cache.check_refcounts().unwrap();
    }

    #[test]
    fn test_append_preserves_prefix() {
        let mut cache = cache(8);
        let slot = cache.record_new("g", b"abc", 1, TODAY, NOW).unwrap();

        let check = line_checksum(b"abc");
        let outcome = cache.append(slot, 3, check, b"def", TODAY, NOW + 1);

        assert_eq!(outcome, AppendOutcome::Appended { offset: 6 });
        assert_eq!(cache.get(slot).log, b"abcdef".to_vec());

        let check = line_checksum(b"abcdef");
        cache.append(slot, 6, check, b"ghi", TODAY, NOW + 2);

        assert_eq!(cache.get(slot).log, b"abcdefghi".to_vec());
        cache.check_refcounts().unwrap();
    }

    #[test]
    fn test_append_desync_on_bad_offset_or_check() {
        let mut cache = cache(8);
        let slot = cache.record_new("g", b"abc", 1, TODAY, NOW).unwrap();

        let good = line_checksum(b"abc");

        assert_eq!(
            cache.append(slot, 2, good, b"x", TODAY, NOW),
            AppendOutcome::Desync
        );
        assert_eq!(
            cache.append(slot, 3, good.wrapping_add(1), b"x", TODAY, NOW),
            AppendOutcome::Desync
        );

        // Content untouched after a rejected append.
        assert_eq!(cache.get(slot).log, b"abc".to_vec());
    }

    #[test]
    fn test_refcount_identity_through_lifecycle() {
        let mut cache = cache(8);
        let slot = cache.record_new("g", b"abc", 1, TODAY, NOW).unwrap();

        // preserved + dirty
        assert_eq!(cache.get(slot).ref_count, 2);

        cache.claim(slot, 3);
        assert_eq!(cache.get(slot).ref_count, 3);
        cache.check_refcounts().unwrap();

        let sink = MemorySink::new(16);
        cache.sweep(&sink, 8);
        assert_eq!(cache.get(slot).ref_count, 2);

        cache.release_claim(slot);
        assert_eq!(cache.get(slot).ref_count, 1);

        cache.unpreserve(slot, NOW);
        // Unpreserve re-dirties for file deletion: one hold remains.
        assert_eq!(cache.get(slot).ref_count, 1);
        assert!(cache.get(slot).dirty);
        cache.check_refcounts().unwrap();

        cache.sweep(&sink, 8);
        assert!(!cache.is_live(slot));

        let jobs = sink.jobs.borrow();
        assert!(matches!(jobs[0], SaveJob::Write { .. }));
        assert!(matches!(jobs[1], SaveJob::Delete { .. }));
    }

    #[test]
    fn test_unpreserve_idempotent() {
        let mut cache = cache(8);
        let slot = cache.record_new("g", b"abc", 1, TODAY, NOW).unwrap();

        cache.unpreserve(slot, NOW);
        let count = cache.get(slot).ref_count;

        cache.unpreserve(slot, NOW);
        assert_eq!(cache.get(slot).ref_count, count);
        cache.check_refcounts().unwrap();
    }

    #[test]
    fn test_dirty_queue_fifo_and_backpressure() {
        let mut cache = cache(8);
        let a = cache.record_new("a", b"1", 1, TODAY, NOW).unwrap();
        let b = cache.record_new("b", b"2", 1, TODAY, NOW).unwrap();
        let c = cache.record_new("c", b"3", 1, TODAY, NOW).unwrap();

        // Sink takes two jobs per tick; the third entry must survive.
        let sink = MemorySink::new(2);
        let flushed = cache.sweep(&sink, 10);

        assert_eq!(flushed, 2);
        assert!(!cache.get(a).dirty);
        assert!(!cache.get(b).dirty);
        assert!(cache.get(c).dirty);
        cache.check_refcounts().unwrap();

        let sink = MemorySink::new(2);
        assert_eq!(cache.sweep(&sink, 10), 1);
        assert!(!cache.get(c).dirty);
    }

    #[test]
    fn test_sweep_budget_rate_limits() {
        let mut cache = cache(8);
        for name in ["a", "b", "c", "d"] {
            cache.record_new(name, b"x", 1, TODAY, NOW).unwrap();
        }

        let sink = MemorySink::new(16);
        assert_eq!(cache.sweep(&sink, 3), 3);
        assert_eq!(cache.sweep(&sink, 3), 1);
    }

    #[test]
    fn test_eviction_prefers_expired_then_stalest() {
        let mut cache = cache(2);

        let old = cache.record_new("old", b"1", 1, TODAY - 30, NOW - 99).unwrap();
        {
            // Backdate past the TTL.
            let game = cache.get_mut(old);
            game.last_day = TODAY - 30;
        }
        let fresh = cache.record_new("fresh", b"2", 1, TODAY, NOW).unwrap();

        // Third record: the expired one goes first.
        cache.record_new("third", b"3", 1, TODAY, NOW + 1).unwrap();

        assert!(!cache.get(old).preserved);
        assert!(cache.get(fresh).preserved);
        assert_eq!(cache.preserved_count(), 2);

        // Fourth record: nothing expired, the stalest unowned goes.
        cache.record_new("fourth", b"4", 1, TODAY, NOW + 2).unwrap();
        assert!(!cache.get(fresh).preserved);
        cache.check_refcounts().unwrap();
    }

    #[test]
    fn test_eviction_skips_owned() {
        let mut cache = cache(2);

        let a = cache.record_new("a", b"1", 1, TODAY, NOW).unwrap();
        let b = cache.record_new("b", b"2", 1, TODAY, NOW + 1).unwrap();
        cache.claim(a, 1);
        cache.claim(b, 2);

        assert_eq!(
            cache.record_new("c", b"3", 1, TODAY, NOW + 2).unwrap_err(),
            CacheError::Full
        );

        cache.release_claim(a);
        let c = cache.record_new("c", b"3", 1, TODAY, NOW + 3).unwrap();

        assert!(!cache.get(a).preserved);
        assert!(cache.get(c).preserved);
        cache.check_refcounts().unwrap();
    }

    #[test]
    fn test_star_game_untracked_by_name() {
        let mut cache = cache(8);

        let slot = cache.create("*", TODAY, NOW);
        cache.claim(slot, 4);
        cache.rewrite(slot, b"session moves", TODAY, NOW);

        assert_eq!(cache.find_named("*", TODAY, NOW), None);
        assert!(!cache.get(slot).dirty);
        cache.check_refcounts().unwrap();

        cache.release_claim(slot);
        assert!(!cache.is_live(slot));
    }

    #[test]
    fn test_tagged_file_roundtrip() {
        let mut cache = cache(8);
        let slot = cache.record_new("Rematch-7", b"the move log", 42, TODAY, NOW).unwrap();

        let bytes = encode_file(cache.get(slot));
        let decoded = decode_file(&bytes).unwrap();

        assert_eq!(decoded.id, "Rematch-7");
        assert_eq!(decoded.day_stamp, TODAY);
        assert_eq!(decoded.owner_uid, 42);
        assert_eq!(decoded.log, b"the move log".to_vec());
    }

    #[test]
    fn test_legacy_file_decodes() {
        let mut bytes = Vec::new();
        let mut id_field = [0u8; LEGACY_ID_FIELD];
        id_field[..7].copy_from_slice(b"oldgame");
        bytes.extend_from_slice(&id_field);
        bytes.write_u32::<BigEndian>(TODAY - 3).unwrap();
        bytes.write_u32::<BigEndian>(9).unwrap();
        bytes.extend_from_slice(b"legacy log");

        let decoded = decode_file(&bytes).unwrap();

        assert_eq!(decoded.id, "oldgame");
        assert_eq!(decoded.day_stamp, TODAY - 3);
        assert_eq!(decoded.owner_uid, 9);
        assert_eq!(decoded.log, b"legacy log".to_vec());
    }

    #[test]
    fn test_corrupt_files_rejected() {
        assert!(decode_file(b"").is_none());
        assert!(decode_file(b"PGB1").is_none());
        assert!(decode_file(&[0u8; LEGACY_HEADER]).is_none());

        let mut truncated = FILE_MAGIC.to_vec();
        truncated.extend_from_slice(&[0, 200]);
        truncated.extend_from_slice(b"short");
        assert!(decode_file(&truncated).is_none());
    }

    #[test]
    fn test_file_path_sanitized() {
        let cache = cache(8);
        let path = cache.file_path("war/peace #1");
        let name = path.file_name().unwrap().to_str().unwrap();

        assert_eq!(name, "war%2fpeace%20%231.game");
    }

    #[test]
    fn test_load_dir_restores_records() {
        let log = ember::logging::init("error", None, 0).unwrap();

        let mut dir = std::env::temp_dir();
        dir.push(format!("lattice-game-load-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let mut writer = GameCache::new(dir.clone(), 8, 14);
        let slot = writer.record_new("persisted", b"log bytes", 5, TODAY, NOW).unwrap();
        fs::write(writer.file_path("persisted"), encode_file(writer.get(slot))).unwrap();

        // An expired record alongside, which must not be loaded.
        let expired = writer.record_new("ancient", b"x", 5, TODAY - 100, NOW).unwrap();
        writer.get_mut(expired).day_stamp = TODAY - 100;
        fs::write(writer.file_path("ancient"), encode_file(writer.get(expired))).unwrap();

        let mut reader = GameCache::new(dir.clone(), 8, 14);
        reader.load_dir(TODAY, NOW, &log);

        let found = reader.find_named("persisted", TODAY, NOW).unwrap();
        assert_eq!(reader.get(found).log, b"log bytes".to_vec());
        assert_eq!(reader.get(found).ref_count, 1);
        assert!(!reader.get(found).dirty);

        assert_eq!(reader.find_named("ancient", TODAY, NOW), None);
        reader.check_refcounts().unwrap();

        drop(fs::remove_dir_all(&dir));
    }
}
