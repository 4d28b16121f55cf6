//! The binary command codes (§4.G) and the length-prefixed argument codec
//! shared by the binary protocol handler, the Logged-DB facade, and
//! replication: a log entry's payload and a client's binary request frame
//! are the same shape, `(magic=0xC8, cmdByte, [len-prefixed args…], ...)`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::Snafu;

use tt_wire::ints::{pack_double, unpack_double};

/// The single byte marking a binary-protocol frame, also the first byte of
/// every update-log entry's payload.
pub const MAGIC: u8 = 0xC8;

pub mod codes {
    pub const PUT: u8 = 0x10;
    pub const PUTKEEP: u8 = 0x11;
    pub const PUTCAT: u8 = 0x12;
    pub const PUTSHL: u8 = 0x13;
    pub const PUTNR: u8 = 0x18;
    pub const OUT: u8 = 0x20;
    pub const GET: u8 = 0x30;
    pub const MGET: u8 = 0x31;
    pub const VSIZ: u8 = 0x38;
    pub const ITERINIT: u8 = 0x50;
    pub const ITERNEXT: u8 = 0x51;
    pub const FWMKEYS: u8 = 0x58;
    pub const ADDINT: u8 = 0x60;
    pub const ADDDOUBLE: u8 = 0x61;
    pub const EXT: u8 = 0x68;
    pub const SYNC: u8 = 0x70;
    pub const OPTIMIZE: u8 = 0x71;
    pub const VANISH: u8 = 0x72;
    pub const COPY: u8 = 0x73;
    pub const RESTORE: u8 = 0x74;
    pub const SETMST: u8 = 0x78;
    pub const RNUM: u8 = 0x80;
    pub const SIZE: u8 = 0x81;
    pub const STAT: u8 = 0x88;
    pub const MISC: u8 = 0x90;
    pub const REPL: u8 = 0xA0;

    /// Not part of the wire-visible binary command set (§4.G's table stops
    /// at the codes above); these back the memcached-text composite ops
    /// (§4.G/§4.I: "replace" and "prepend") so they still have a cmd byte
    /// to tag their update-log payload with, the same as every other
    /// mutating op.
    pub const REPLACE: u8 = 0x14;
    pub const PREPEND: u8 = 0x15;
    /// Memcached `incr`/`decr`'s textual read-modify-write (§4.I); distinct
    /// from the binary `addint` (0x60), which stores a 4-byte binary int
    /// and creates the key on absence.
    pub const INCR: u8 = 0x16;
}

#[derive(Debug, Snafu)]
pub enum CommandError {
    #[snafu(display("truncated argument list"))]
    Truncated,
    #[snafu(display("unknown command byte {cmd_byte:#04x}"))]
    UnknownCommand { cmd_byte: u8 },
    #[snafu(display("command {cmd_byte:#04x} expects {expected} argument(s), got {got}"))]
    ArgCount { cmd_byte: u8, expected: usize, got: usize },
    #[snafu(display("malformed fixed-width argument"))]
    MalformedFixedWidth,
}

/// Appends `arg` to `out` as a 4-byte big-endian length followed by the
/// bytes themselves — the arg framing every binary command and every
/// update-log payload uses.
pub fn put_arg(out: &mut BytesMut, arg: &[u8]) {
    out.put_u32(arg.len() as u32);
    out.put_slice(arg);
}

/// Splits a byte run of back-to-back length-prefixed args into its parts.
pub fn parse_args(mut body: &[u8]) -> Result<Vec<Bytes>, CommandError> {
    let mut args = Vec::new();
    while !body.is_empty() {
        if body.len() < 4 {
            return Err(CommandError::Truncated);
        }
        let len = u32::from_be_bytes(body[..4].try_into().unwrap()) as usize;
        body = &body[4..];
        if body.len() < len {
            return Err(CommandError::Truncated);
        }
        args.push(Bytes::copy_from_slice(&body[..len]));
        body = &body[len..];
    }
    Ok(args)
}

fn expect_args(cmd_byte: u8, args: &[Bytes], expected: usize) -> Result<(), CommandError> {
    if args.len() != expected {
        return Err(CommandError::ArgCount {
            cmd_byte,
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

/// A decoded mutating operation: the subset of binary commands that pass
/// through the Logged-DB facade and get recorded in the update log (§4.D).
#[derive(Clone, Debug, PartialEq)]
pub enum LoggedOp {
    Put { key: Bytes, val: Bytes },
    PutKeep { key: Bytes, val: Bytes },
    PutCat { key: Bytes, val: Bytes },
    PutShl { key: Bytes, val: Bytes, width: u32 },
    /// Memcached `replace`: store `val` only if `key` already exists.
    Replace { key: Bytes, val: Bytes },
    /// Memcached `prepend`: stick `val` in front of the existing value;
    /// vetoed (no-op) if `key` is absent.
    Prepend { key: Bytes, val: Bytes },
    /// Memcached `incr`/`decr`: parses the existing value as an ASCII
    /// decimal integer (garbage parses as `0`, matching `tcatoi`), adds
    /// `delta` (negative for `decr`), clamps the result to `0`, and writes
    /// it back as ASCII decimal. Vetoed (no-op) if `key` is absent — it is
    /// never created by `incr`/`decr`.
    Incr { key: Bytes, delta: i64 },
    Out { key: Bytes },
    AddInt { key: Bytes, delta: i32 },
    AddDouble { key: Bytes, delta: f64 },
    Misc { name: String, args: Vec<Bytes> },
    Sync,
    Optimize { params: String },
    Vanish,
}

impl LoggedOp {
    pub fn cmd_byte(&self) -> u8 {
        match self {
            LoggedOp::Put { .. } => codes::PUT,
            LoggedOp::PutKeep { .. } => codes::PUTKEEP,
            LoggedOp::PutCat { .. } => codes::PUTCAT,
            LoggedOp::PutShl { .. } => codes::PUTSHL,
            LoggedOp::Replace { .. } => codes::REPLACE,
            LoggedOp::Prepend { .. } => codes::PREPEND,
            LoggedOp::Incr { .. } => codes::INCR,
            LoggedOp::Out { .. } => codes::OUT,
            LoggedOp::AddInt { .. } => codes::ADDINT,
            LoggedOp::AddDouble { .. } => codes::ADDDOUBLE,
            LoggedOp::Misc { .. } => codes::MISC,
            LoggedOp::Sync => codes::SYNC,
            LoggedOp::Optimize { .. } => codes::OPTIMIZE,
            LoggedOp::Vanish => codes::VANISH,
        }
    }

    /// Whether this op targets a single key and therefore a single
    /// record-lock slot, as opposed to a whole-database barrier op.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            LoggedOp::Put { key, .. }
            | LoggedOp::PutKeep { key, .. }
            | LoggedOp::PutCat { key, .. }
            | LoggedOp::PutShl { key, .. }
            | LoggedOp::Replace { key, .. }
            | LoggedOp::Prepend { key, .. }
            | LoggedOp::Incr { key, .. }
            | LoggedOp::Out { key }
            | LoggedOp::AddInt { key, .. }
            | LoggedOp::AddDouble { key, .. } => Some(key),
            LoggedOp::Misc { .. } | LoggedOp::Sync | LoggedOp::Optimize { .. } | LoggedOp::Vanish => None,
        }
    }

    /// Encodes the argument block (everything between the command byte and
    /// the trailing success byte).
    pub fn encode_args(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            LoggedOp::Put { key, val }
            | LoggedOp::PutKeep { key, val }
            | LoggedOp::PutCat { key, val }
            | LoggedOp::Replace { key, val }
            | LoggedOp::Prepend { key, val } => {
                put_arg(&mut out, key);
                put_arg(&mut out, val);
            }
            LoggedOp::PutShl { key, val, width } => {
                put_arg(&mut out, key);
                put_arg(&mut out, val);
                put_arg(&mut out, &width.to_be_bytes());
            }
            LoggedOp::Incr { key, delta } => {
                put_arg(&mut out, key);
                put_arg(&mut out, &delta.to_be_bytes());
            }
            LoggedOp::Out { key } => put_arg(&mut out, key),
            LoggedOp::AddInt { key, delta } => {
                put_arg(&mut out, key);
                put_arg(&mut out, &delta.to_be_bytes());
            }
            LoggedOp::AddDouble { key, delta } => {
                put_arg(&mut out, key);
                let (integral, fractional) = pack_double(*delta);
                let mut buf = [0u8; 16];
                buf[0..8].copy_from_slice(&integral.to_be_bytes());
                buf[8..16].copy_from_slice(&fractional.to_be_bytes());
                put_arg(&mut out, &buf);
            }
            LoggedOp::Misc { name, args } => {
                put_arg(&mut out, name.as_bytes());
                for arg in args {
                    put_arg(&mut out, arg);
                }
            }
            LoggedOp::Sync | LoggedOp::Vanish => {}
            LoggedOp::Optimize { params } => put_arg(&mut out, params.as_bytes()),
        }
        out.freeze()
    }

    /// Full payload as stored in the update log or sent over the wire:
    /// `magic | cmdByte | args`. The trailing success byte is appended
    /// separately once the caller knows the outcome.
    pub fn encode_payload(&self) -> Bytes {
        let args = self.encode_args();
        let mut out = BytesMut::with_capacity(2 + args.len());
        out.put_u8(MAGIC);
        out.put_u8(self.cmd_byte());
        out.put_slice(&args);
        out.freeze()
    }

    /// Decodes a `(cmdByte, args)` pair as read back from the update log or
    /// a replication stream.
    pub fn decode(cmd_byte: u8, args: &[Bytes]) -> Result<Self, CommandError> {
        match cmd_byte {
            codes::PUT => {
                expect_args(cmd_byte, args, 2)?;
                Ok(LoggedOp::Put { key: args[0].clone(), val: args[1].clone() })
            }
            codes::PUTKEEP => {
                expect_args(cmd_byte, args, 2)?;
                Ok(LoggedOp::PutKeep { key: args[0].clone(), val: args[1].clone() })
            }
            codes::PUTCAT => {
                expect_args(cmd_byte, args, 2)?;
                Ok(LoggedOp::PutCat { key: args[0].clone(), val: args[1].clone() })
            }
            codes::PUTSHL => {
                expect_args(cmd_byte, args, 3)?;
                let width_bytes: [u8; 4] = args[2].as_ref().try_into().map_err(|_| CommandError::MalformedFixedWidth)?;
                Ok(LoggedOp::PutShl {
                    key: args[0].clone(),
                    val: args[1].clone(),
                    width: u32::from_be_bytes(width_bytes),
                })
            }
            codes::REPLACE => {
                expect_args(cmd_byte, args, 2)?;
                Ok(LoggedOp::Replace { key: args[0].clone(), val: args[1].clone() })
            }
            codes::PREPEND => {
                expect_args(cmd_byte, args, 2)?;
                Ok(LoggedOp::Prepend { key: args[0].clone(), val: args[1].clone() })
            }
            codes::INCR => {
                expect_args(cmd_byte, args, 2)?;
                let delta_bytes: [u8; 8] = args[1].as_ref().try_into().map_err(|_| CommandError::MalformedFixedWidth)?;
                Ok(LoggedOp::Incr { key: args[0].clone(), delta: i64::from_be_bytes(delta_bytes) })
            }
            codes::OUT => {
                expect_args(cmd_byte, args, 1)?;
                Ok(LoggedOp::Out { key: args[0].clone() })
            }
            codes::ADDINT => {
                expect_args(cmd_byte, args, 2)?;
                let delta_bytes: [u8; 4] = args[1].as_ref().try_into().map_err(|_| CommandError::MalformedFixedWidth)?;
                Ok(LoggedOp::AddInt { key: args[0].clone(), delta: i32::from_be_bytes(delta_bytes) })
            }
            codes::ADDDOUBLE => {
                expect_args(cmd_byte, args, 2)?;
                let pair = args[1].as_ref();
                if pair.len() != 16 {
                    return Err(CommandError::MalformedFixedWidth);
                }
                let integral = i64::from_be_bytes(pair[0..8].try_into().unwrap());
                let fractional = i64::from_be_bytes(pair[8..16].try_into().unwrap());
                Ok(LoggedOp::AddDouble { key: args[0].clone(), delta: unpack_double(integral, fractional) })
            }
            codes::MISC => {
                if args.is_empty() {
                    return Err(CommandError::ArgCount { cmd_byte, expected: 1, got: 0 });
                }
                let name = String::from_utf8_lossy(&args[0]).into_owned();
                Ok(LoggedOp::Misc { name, args: args[1..].to_vec() })
            }
            codes::SYNC => {
                expect_args(cmd_byte, args, 0)?;
                Ok(LoggedOp::Sync)
            }
            codes::OPTIMIZE => {
                expect_args(cmd_byte, args, 1)?;
                Ok(LoggedOp::Optimize { params: String::from_utf8_lossy(&args[0]).into_owned() })
            }
            codes::VANISH => {
                expect_args(cmd_byte, args, 0)?;
                Ok(LoggedOp::Vanish)
            }
            other => Err(CommandError::UnknownCommand { cmd_byte: other }),
        }
    }
}

/// Splits a raw payload (as read from the update log, sans the leading
/// magic byte) into its command byte, argument list, and trailing success
/// byte.
pub fn split_logged_payload(payload: &[u8]) -> Result<(u8, Vec<Bytes>, bool), CommandError> {
    if payload.len() < 2 {
        return Err(CommandError::Truncated);
    }
    let cmd_byte = payload[1];
    let body = &payload[2..];
    let (args_bytes, success_byte) = body.split_at(body.len().saturating_sub(1));
    if success_byte.is_empty() {
        return Err(CommandError::Truncated);
    }
    let args = parse_args(args_bytes)?;
    Ok((cmd_byte, args, success_byte[0] == 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_round_trips_through_payload_and_args() {
        let op = LoggedOp::Put { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"v") };
        let payload = op.encode_payload();
        assert_eq!(payload[0], MAGIC);
        assert_eq!(payload[1], codes::PUT);
        let args = parse_args(&payload[2..]).unwrap();
        assert_eq!(LoggedOp::decode(codes::PUT, &args).unwrap(), op);
    }

    #[test]
    fn add_int_round_trips_delta() {
        let op = LoggedOp::AddInt { key: Bytes::from_static(b"n"), delta: -7 };
        let args = parse_args(&op.encode_args()).unwrap();
        assert_eq!(LoggedOp::decode(codes::ADDINT, &args).unwrap(), op);
    }

    #[test]
    fn incr_round_trips_a_negative_delta() {
        let op = LoggedOp::Incr { key: Bytes::from_static(b"n"), delta: -7 };
        let args = parse_args(&op.encode_args()).unwrap();
        assert_eq!(LoggedOp::decode(codes::INCR, &args).unwrap(), op);
    }

    #[test]
    fn add_double_round_trips_through_pack_double() {
        let op = LoggedOp::AddDouble { key: Bytes::from_static(b"n"), delta: 3.5 };
        let args = parse_args(&op.encode_args()).unwrap();
        match LoggedOp::decode(codes::ADDDOUBLE, &args).unwrap() {
            LoggedOp::AddDouble { delta, .. } => assert!((delta - 3.5).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn split_logged_payload_recovers_success_flag() {
        let op = LoggedOp::Out { key: Bytes::from_static(b"k") };
        let mut payload = op.encode_payload().to_vec();
        payload.push(0);
        let (cmd_byte, args, success) = split_logged_payload(&payload).unwrap();
        assert_eq!(cmd_byte, codes::OUT);
        assert!(success);
        assert_eq!(LoggedOp::decode(cmd_byte, &args).unwrap(), op);
    }

    #[test]
    fn truncated_args_are_rejected() {
        assert!(parse_args(&[0, 0, 0, 5, 1, 2]).is_err());
    }
}
