use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use std::io;

/// Buffers grow one increment at a time and never shrink.
pub const BUF_SIZE_INCREMENT: usize = 4096;
/// Hard cap. A connection that accumulates this much without a terminator
/// (or without draining its output) is closed rather than grown further.
pub const BUF_SIZE_MAX: usize = 65536;

/// Result of one ingress pass.
#[derive(Debug, Eq, PartialEq)]
pub struct Ingress {
    pub count: usize,
    /// Peer closed its end; no further data will arrive.
    pub closed: bool,
}

/// A growable byte queue with line extraction. Data is appended at the tail
/// and consumed from the head; unconsumed bytes are left-shifted when free
/// space runs low, and the backing storage grows in whole increments up to
/// the cap.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    /// Highest offset already scanned for a terminator, so repeated
    /// `next_line` calls never rescan.
    scan: usize,
    /// A CR ended the previous extraction at the very end of the buffer; a
    /// leading LF on the next pass belongs to it.
    pending_lf: bool,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size % BUF_SIZE_INCREMENT != 0 || size == 0 || size > BUF_SIZE_MAX {
            panic!(
                "Buffer size must be a positive multiple of {} up to {}, got {}",
                BUF_SIZE_INCREMENT, BUF_SIZE_MAX, size
            );
        }

        Buffer {
            data: vec![0; size],
            head: 0,
            tail: 0,
            scan: 0,
            pending_lf: false,
        }
    }

    /// The number of unconsumed bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Current allocated size.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Free space at the tail without compaction or growth.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.tail
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.scan = 0;
        self.pending_lf = false;
    }

    /// Unconsumed bytes.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Makes at least `needed` bytes of tail space available: first by
    /// left-shifting unconsumed bytes, then by growing an increment at a
    /// time. Fails with `Overrun` once the cap is reached.
    fn make_room(&mut self, needed: usize) -> NetworkResult<()> {
        if self.free_capacity() >= needed {
            return Ok(());
        }

        if self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.scan = self.scan.saturating_sub(self.head);
            self.head = 0;
        }

        while self.free_capacity() < needed {
            if self.data.len() >= BUF_SIZE_MAX {
                return Err(NetworkError::Fatal(ErrorType::Overrun));
            }
            self.data.resize(self.data.len() + BUF_SIZE_INCREMENT, 0);
        }

        Ok(())
    }

    /// Reads from the supplied reader until it would block, the peer closes,
    /// or the cap is exceeded. WouldBlock is not an error: the accumulated
    /// count is returned and the next readiness event resumes.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> NetworkResult<Ingress> {
        let mut total = 0;

        loop {
            self.make_room(1)?;

            match reader.read(&mut self.data[self.tail..]) {
                Ok(0) => return Ok(Ingress { count: total, closed: true }),
                Ok(count) => {
                    self.tail += count;
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Ingress { count: total, closed: false });
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Appends bytes at the tail, growing as needed. Used for the output
    /// direction, where the cap doubles as the blocked-client ceiling.
    pub fn append(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        self.make_room(bytes.len())?;
        self.data[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
        Ok(())
    }

    /// Writes buffered bytes to the supplied writer, advancing the head.
    /// Returns `Wait` when the writer blocks mid-flush; the remainder stays
    /// queued for the next write-ready event.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> NetworkResult<usize> {
        let orig_len = self.len();

        while self.head < self.tail {
            match writer.write(&self.data[self.head..self.tail]) {
                Ok(0) => return Err(NetworkError::Fatal(ErrorType::Closed)),
                Ok(count) => {
                    self.head += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Err(NetworkError::Wait);
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        if self.is_empty() {
            self.clear();
        }

        Ok(orig_len - self.len())
    }

    /// Extracts the next complete line, without its terminator. CR, LF, and
    /// CRLF all end a line identically; a CRLF split across two reads yields
    /// a single line. Returns `None` until a terminator arrives.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        if self.pending_lf {
            if self.is_empty() {
                // No byte has arrived to resolve the split; keep deferring.
                return None;
            }

            if self.data[self.head] == b'\n' {
                self.head += 1;
                if self.scan < self.head {
                    self.scan = self.head;
                }
            }
            self.pending_lf = false;

            if self.is_empty() {
                self.clear();
                return None;
            }
        }

        let mut idx = self.scan.max(self.head);

        while idx < self.tail {
            let byte = self.data[idx];

            if byte == b'\n' || byte == b'\r' {
                let line = self.data[self.head..idx].to_vec();
                let mut next = idx + 1;

                if byte == b'\r' {
                    if next < self.tail {
                        if self.data[next] == b'\n' {
                            next += 1;
                        }
                    } else {
                        self.pending_lf = true;
                    }
                }

                self.head = next;
                self.scan = next;

                if self.is_empty() {
                    let defer = self.pending_lf;
                    self.clear();
                    self.pending_lf = defer;
                }

                return Some(line);
            }

            idx += 1;
        }

        self.scan = self.tail;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn drain_lines(buffer: &mut Buffer) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        while let Some(line) = buffer.next_line() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_ingress_extract() {
        let mut channel = MockChannel::new(b"200 0 alice\n204 bob\n".to_vec(), 7, 0);
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let ingress = buffer.ingress(&mut channel).unwrap();

        assert_eq!(ingress.count, 20);
        assert!(!ingress.closed);
        assert_eq!(
            drain_lines(&mut buffer),
            vec![b"200 0 alice".to_vec(), b"204 bob".to_vec()]
        );
    }

    #[test]
    fn test_terminators_equivalent() {
        for wire in [&b"one\ntwo\n"[..], &b"one\rtwo\r"[..], &b"one\r\ntwo\r\n"[..]] {
            let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
            buffer.append(wire).unwrap();

            assert_eq!(
                drain_lines(&mut buffer),
                vec![b"one".to_vec(), b"two".to_vec()],
                "wire {:?}",
                wire
            );
        }
    }

    #[test]
    fn test_crlf_split_across_reads() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        buffer.append(b"alpha\r").unwrap();
        assert_eq!(drain_lines(&mut buffer), vec![b"alpha".to_vec()]);

        buffer.append(b"\nbeta\n").unwrap();
        assert_eq!(drain_lines(&mut buffer), vec![b"beta".to_vec()]);
    }

    #[test]
    fn test_partial_reads_same_lines() {
        let wire = b"first line\r\nsecond\rthird one here\n\nlast\r\n";

        let whole = {
            let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
            buffer.append(wire).unwrap();
            drain_lines(&mut buffer)
        };

        for chunk in 1..wire.len() {
            let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
            let mut lines = Vec::new();

            for piece in wire.chunks(chunk) {
                buffer.append(piece).unwrap();
                lines.extend(drain_lines(&mut buffer));
            }

            assert_eq!(lines, whole, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_compaction_preserves_partial_line() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        buffer.append(b"aaa\npartial").unwrap();
        assert_eq!(buffer.next_line().unwrap(), b"aaa".to_vec());

        // Fits only once the unconsumed bytes are shifted left, and without
        // growing the allocation.
        let filler = vec![b'y'; BUF_SIZE_INCREMENT - 11 + 2];
        buffer.append(&filler).unwrap();
        buffer.append(b"\n").unwrap();

        assert_eq!(buffer.capacity(), BUF_SIZE_INCREMENT);

        let line = buffer.next_line().unwrap();
        assert_eq!(&line[..7], b"partial");
        assert_eq!(line.len(), 7 + filler.len());
    }

    #[test]
    fn test_growth_then_cap() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let big = vec![b'z'; BUF_SIZE_MAX - 1];
        buffer.append(&big).unwrap();
        assert!(buffer.capacity() <= BUF_SIZE_MAX);

        let result = buffer.append(&[b'z'; 2]);
        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::Overrun));
    }

    #[test]
    fn test_ingress_cap_overrun() {
        let unterminated = vec![b'q'; BUF_SIZE_MAX + 1];
        let mut channel = MockChannel::new(unterminated, 4096, 0);
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let result = buffer.ingress(&mut channel);

        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::Overrun));
    }

    #[test]
    fn test_ingress_reports_close() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        let ingress = buffer.ingress(&b"tail data"[..]).unwrap();

        assert_eq!(ingress.count, 9);
        assert!(ingress.closed);
    }

    #[test]
    fn test_egress_roundtrip() {
        let mut channel = MockChannel::new(Vec::new(), 5, 1000);
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        buffer.append(b"101 welcome\n").unwrap();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, 12);
        assert!(buffer.is_empty());
        assert_eq!(channel.data, b"101 welcome\n".to_vec());
    }

    #[test]
    fn test_egress_blocked_keeps_remainder() {
        let mut channel = MockChannel::new(Vec::new(), 4, 4);
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        buffer.append(b"12345678").unwrap();
        let result = buffer.egress(&mut channel);

        assert_eq!(result.unwrap_err(), NetworkError::Wait);
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.read_slice(), b"5678");
    }

    #[test]
    fn test_reset_when_caught_up() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        buffer.append(b"abc\n").unwrap();
        buffer.next_line().unwrap();

        assert_eq!(buffer.head, 0);
        assert_eq!(buffer.tail, 0);
    }

    #[test]
    #[should_panic(expected = "Buffer size must be a positive multiple")]
    fn test_fail_on_incorrect_increment() {
        let _ = Buffer::new(1000);
    }
}
