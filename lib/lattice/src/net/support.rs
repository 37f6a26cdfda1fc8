use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level failure taxonomy: `Wait` covers everything the next readiness
/// cycle will retry (partial reads, full kernel buffers) and is never an
/// error; `Fatal` terminates the one offending connection, never the
/// process.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// Peer closed its end of the stream.
    Closed,
    /// Input accumulated past the buffer cap without a terminator.
    Overrun,
    /// Pending output exceeded the output ceiling.
    OutputOverrun,
    /// Checksum envelope did not match the line.
    Checksum,
    /// Malformed escape sequence or opcode field.
    Malformed,
    /// The per-connection unexpected-message budget ran out.
    AbuseBudget,
    /// Too many consecutive transport failures.
    IoBudget,
    /// Admission refused by the ban table.
    Banned,
    /// Admission refused by a connection cap.
    AdmissionCap,
    /// No free user slot remained.
    ServerFull,
    /// No activity within the applicable timeout.
    Timeout,
    /// Explicit quit or supervisor-ordered close.
    Ordered,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            io::ErrorKind::Interrupted => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wouldblock_folds_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);
    }

    #[test]
    fn test_other_io_is_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(
            err,
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_wait_has_not_failed() {
        let result: NetworkResult<()> = Err(NetworkError::Wait);
        assert!(!result.has_failed());

        let result: NetworkResult<()> = Err(NetworkError::Fatal(ErrorType::Closed));
        assert!(result.has_failed());
    }
}
