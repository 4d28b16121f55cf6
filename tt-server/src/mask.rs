//! Command-mask bitset (§4.H "checks the command-mask bitset"). `-mask`
//! and `-unmask` each take a comma- or space-separated list of command
//! names (or a raw `0x...` bitmask) and OR/AND-NOT it into the running
//! mask; a masked command is refused before it reaches the Logged-DB.

use crate::command::codes;

/// One bit per binary command, indexed by its low nibble family — mirrors
/// the source table, not the raw command byte, so the bitset stays dense.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandMask(u64);

fn bit_for(cmd_byte: u8) -> Option<u32> {
    let bit = match cmd_byte {
        codes::PUT => 0,
        codes::PUTKEEP => 1,
        codes::PUTCAT => 2,
        codes::PUTSHL => 3,
        codes::PUTNR => 4,
        codes::OUT => 5,
        codes::GET => 6,
        codes::MGET => 7,
        codes::VSIZ => 8,
        codes::ITERINIT => 9,
        codes::ITERNEXT => 10,
        codes::FWMKEYS => 11,
        codes::ADDINT => 12,
        codes::ADDDOUBLE => 13,
        codes::EXT => 14,
        codes::SYNC => 15,
        codes::OPTIMIZE => 16,
        codes::VANISH => 17,
        codes::COPY => 18,
        codes::RESTORE => 19,
        codes::SETMST => 20,
        codes::RNUM => 21,
        codes::SIZE => 22,
        codes::STAT => 23,
        codes::MISC => 24,
        codes::REPL => 25,
        _ => return None,
    };
    Some(bit)
}

fn bit_for_name(name: &str) -> Option<u32> {
    let cmd_byte = match name.to_ascii_lowercase().as_str() {
        "put" => codes::PUT,
        "putkeep" => codes::PUTKEEP,
        "putcat" => codes::PUTCAT,
        "putshl" => codes::PUTSHL,
        "putnr" => codes::PUTNR,
        "out" => codes::OUT,
        "get" => codes::GET,
        "mget" => codes::MGET,
        "vsiz" => codes::VSIZ,
        "iterinit" => codes::ITERINIT,
        "iternext" => codes::ITERNEXT,
        "fwmkeys" => codes::FWMKEYS,
        "addint" => codes::ADDINT,
        "adddouble" => codes::ADDDOUBLE,
        "ext" => codes::EXT,
        "sync" => codes::SYNC,
        "optimize" => codes::OPTIMIZE,
        "vanish" => codes::VANISH,
        "copy" => codes::COPY,
        "restore" => codes::RESTORE,
        "setmst" => codes::SETMST,
        "rnum" => codes::RNUM,
        "size" => codes::SIZE,
        "stat" => codes::STAT,
        "misc" => codes::MISC,
        "repl" => codes::REPL,
        _ => return None,
    };
    bit_for(cmd_byte)
}

fn parse_expr(expr: &str) -> u64 {
    let mut mask = 0u64;
    for token in expr.split([',', ' ']).map(str::trim).filter(|s| !s.is_empty()) {
        if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
            if let Ok(v) = u64::from_str_radix(hex, 16) {
                mask |= v;
                continue;
            }
        }
        if let Some(bit) = bit_for_name(token) {
            mask |= 1u64 << bit;
        }
    }
    mask
}

impl CommandMask {
    /// Every command permitted; the default with no `-mask` given.
    pub fn allow_all() -> Self {
        Self(0)
    }

    /// Adds the commands named in `expr` (comma/space separated, or a raw
    /// `0x`-prefixed bitmask) to the set of forbidden commands.
    pub fn mask(&mut self, expr: &str) {
        self.0 |= parse_expr(expr);
    }

    /// Removes the commands named in `expr` from the set of forbidden
    /// commands.
    pub fn unmask(&mut self, expr: &str) {
        self.0 &= !parse_expr(expr);
    }

    /// Whether `cmd_byte` is currently forbidden. Unrecognized command
    /// bytes are never masked by name, so they fall through as permitted.
    pub fn is_forbidden(&self, cmd_byte: u8) -> bool {
        match bit_for(cmd_byte) {
            Some(bit) => self.0 & (1u64 << bit) != 0,
            None => false,
        }
    }
}

impl Default for CommandMask {
    fn default() -> Self {
        Self::allow_all()
    }
}

/// Maps a memcached-text verb onto the binary command bit that gates it.
/// The original tests the same `TTSEQ*` bits from `do_mc_get`/`do_mc_incr`/
/// `do_mc_delete` etc. as the binary dispatcher does (`ttserver.c:2655,
/// 2700,2735`); this mask is one bit per binary command rather than the
/// original's richer `TTSEQALLMC`/`ALLREAD`/`ALLWRITE` groups, so verbs with
/// no directly wire-exposed equivalent (`replace`, `prepend`, `incr`,
/// `decr`) are gated by the nearest command of the same kind (a write or an
/// arithmetic op) instead.
pub fn binary_equivalent_for_memcached_verb(verb: &str) -> Option<u8> {
    Some(match verb {
        "set" => codes::PUT,
        "add" => codes::PUTKEEP,
        "replace" => codes::PUT,
        "append" => codes::PUTCAT,
        "prepend" => codes::PUTCAT,
        "get" | "gets" => codes::GET,
        "delete" => codes::OUT,
        "incr" | "decr" => codes::ADDINT,
        "flush_all" => codes::VANISH,
        "stats" => codes::STAT,
        _ => return None,
    })
}

/// Maps an HTTP method onto the binary command bit that gates it (§4.G,
/// §6). `OPTIONS` advertises status only and mutates nothing (§8 testable
/// property 8), so it has no gate.
pub fn binary_equivalent_for_http_method(method: &str) -> Option<u8> {
    Some(match method {
        "GET" | "HEAD" => codes::GET,
        "PUT" => codes::PUT,
        "DELETE" => codes::OUT,
        "POST" => codes::MISC,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_then_unmasking_a_command_restores_it() {
        let mut mask = CommandMask::allow_all();
        assert!(!mask.is_forbidden(codes::PUT));
        mask.mask("put,out");
        assert!(mask.is_forbidden(codes::PUT));
        assert!(mask.is_forbidden(codes::OUT));
        assert!(!mask.is_forbidden(codes::GET));
        mask.unmask("put");
        assert!(!mask.is_forbidden(codes::PUT));
        assert!(mask.is_forbidden(codes::OUT));
    }

    #[test]
    fn raw_hex_expression_sets_bits_directly() {
        let mut mask = CommandMask::allow_all();
        mask.mask("0x1");
        assert!(mask.is_forbidden(codes::PUT));
    }

    #[test]
    fn unknown_names_are_ignored_rather_than_rejected() {
        let mut mask = CommandMask::allow_all();
        mask.mask("bogus");
        assert!(!mask.is_forbidden(codes::PUT));
    }

    #[test]
    fn masking_put_also_forbids_the_memcached_set_and_replace_equivalents() {
        let mut mask = CommandMask::allow_all();
        mask.mask("put");
        assert!(mask.is_forbidden(binary_equivalent_for_memcached_verb("set").unwrap()));
        assert!(mask.is_forbidden(binary_equivalent_for_memcached_verb("replace").unwrap()));
        assert!(!mask.is_forbidden(binary_equivalent_for_memcached_verb("get").unwrap()));
    }

    #[test]
    fn masking_out_also_forbids_http_delete() {
        let mut mask = CommandMask::allow_all();
        mask.mask("out");
        assert!(mask.is_forbidden(binary_equivalent_for_http_method("DELETE").unwrap()));
        assert!(binary_equivalent_for_http_method("OPTIONS").is_none());
    }
}
