use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown};

/// Byte-stream transport behind a connection.
///
/// Plain TCP is the common case. A websocket fronting layer plugs in here
/// too: it owns the frame parsing and hands this interface a plain byte
/// stream, so nothing above this trait knows which one it is talking to.
/// Robot proxy users carry no transport at all.
pub trait Transport: io::Read + io::Write {
    /// Address of the remote end, as seen at accept time.
    fn peer_ip(&self) -> IpAddr;

    /// Registers the underlying socket for edge-triggered readiness.
    fn register(&self, poll: &mio::Poll, token: mio::Token) -> io::Result<()>;

    fn deregister(&self, poll: &mio::Poll) -> io::Result<()>;

    /// Drops both directions. Errors are ignored by callers; the socket is
    /// gone either way.
    fn shutdown(&mut self) -> io::Result<()>;
}

pub struct TcpTransport {
    stream: TcpStream,
    peer: IpAddr,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<TcpTransport> {
        let peer = stream.peer_addr()?.ip();
        Ok(TcpTransport { stream, peer })
    }
}

impl io::Read for TcpTransport {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl io::Write for TcpTransport {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    #[inline]
    fn peer_ip(&self) -> IpAddr {
        self.peer
    }

    #[inline]
    fn register(&self, poll: &mio::Poll, token: mio::Token) -> io::Result<()> {
        poll.register(
            &self.stream,
            token,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )
    }

    #[inline]
    fn deregister(&self, poll: &mio::Poll) -> io::Result<()> {
        poll.deregister(&self.stream)
    }

    #[inline]
    fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}

/// In-memory transport for tests: reads come from a preloaded script, writes
/// accumulate for inspection, and both directions can be made to block or
/// fail on demand.
#[cfg(test)]
pub(crate) struct MockTransport {
    pub incoming: io::Cursor<Vec<u8>>,
    pub written: Vec<u8>,
    pub block_writes: bool,
    pub fail_reads: bool,
    pub peer: IpAddr,
}

#[cfg(test)]
impl MockTransport {
    pub fn new(incoming: &[u8]) -> MockTransport {
        MockTransport {
            incoming: io::Cursor::new(incoming.to_vec()),
            written: Vec::new(),
            block_writes: false,
            fail_reads: false,
            peer: IpAddr::V4(std::net::Ipv4Addr::new(10, 1, 2, 3)),
        }
    }

    pub fn boxed(incoming: &[u8]) -> Box<MockTransport> {
        Box::new(Self::new(incoming))
    }
}

#[cfg(test)]
impl io::Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_reads {
            return Err(io::ErrorKind::ConnectionReset.into());
        }

        match self.incoming.read(buf)? {
            0 => Err(io::ErrorKind::WouldBlock.into()),
            count => Ok(count),
        }
    }
}

#[cfg(test)]
impl io::Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.block_writes {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        self.written.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn peer_ip(&self) -> IpAddr {
        self.peer
    }

    fn register(&self, _poll: &mio::Poll, _token: mio::Token) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&self, _poll: &mio::Poll) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_script_then_block() {
        let mut mock = MockTransport::new(b"hello");
        let mut buf = [0u8; 16];

        assert_eq!(mock.read(&mut buf).unwrap(), 5);
        assert_eq!(
            mock.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_mock_collects_writes() {
        let mut mock = MockTransport::new(b"");

        mock.write_all(b"201 ok\n").unwrap();
        assert_eq!(mock.written, b"201 ok\n".to_vec());
    }
}
