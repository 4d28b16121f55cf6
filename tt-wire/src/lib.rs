//! Framed, deadline-bounded socket I/O and big-endian wire encoding shared by
//! every protocol front-end (binary, memcached-text, HTTP) and by the update
//! log's on-disk record format.

mod error;
mod framed;
pub mod ints;

pub use error::WireError;
pub use framed::{FramedIo, MAX_LINE_LEN, READ_BUF_CAP};
