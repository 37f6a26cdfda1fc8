//! Connection plumbing: buffering, framing, transport, and the error
//! taxonomy shared by everything that touches a socket.

pub mod buffer;
pub mod support;
pub mod transport;
