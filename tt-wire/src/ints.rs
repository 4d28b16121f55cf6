//! Big-endian integer and double packing shared by every wire protocol.
//!
//! A double is serialized as a pair of big-endian `i64`s: the truncated
//! integer part, and the fractional part scaled by `10^12`. `NaN` encodes as
//! `(MIN, MIN)`; `+inf`/`-inf` as `(MAX, 0)`/`(MIN, 0)`.

const FRAC_SCALE: f64 = 1_000_000_000_000.0;

/// Splits a finite/NaN/infinite `f64` into the `(integral, fractional)` pair
/// used on the wire.
pub fn pack_double(value: f64) -> (i64, i64) {
    if value.is_nan() {
        return (i64::MIN, i64::MIN);
    }
    if value.is_infinite() {
        return if value > 0.0 {
            (i64::MAX, 0)
        } else {
            (i64::MIN, 0)
        };
    }
    let integ = value.trunc() as i64;
    let frac = ((value - value.trunc()) * FRAC_SCALE).round() as i64;
    (integ, frac)
}

/// Reassembles the `(integral, fractional)` wire pair into an `f64`.
pub fn unpack_double(integ: i64, frac: i64) -> f64 {
    if integ == i64::MIN && frac == i64::MIN {
        return f64::NAN;
    }
    if integ == i64::MAX && frac == 0 {
        return f64::INFINITY;
    }
    if integ == i64::MIN && frac == 0 {
        return f64::NEG_INFINITY;
    }
    integ as f64 + (frac as f64) / FRAC_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_round_trips() {
        let (i, f) = pack_double(f64::NAN);
        assert!(unpack_double(i, f).is_nan());
    }

    #[test]
    fn infinities_round_trip() {
        assert_eq!(unpack_double(pack_double(f64::INFINITY).0, pack_double(f64::INFINITY).1), f64::INFINITY);
        assert_eq!(
            unpack_double(pack_double(f64::NEG_INFINITY).0, pack_double(f64::NEG_INFINITY).1),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn finite_values_round_trip() {
        for v in [0.0, 1.0, -1.0, 3.25, -3.25, 123456.0, -0.000001] {
            let (integ, frac) = pack_double(v);
            let back = unpack_double(integ, frac);
            assert!((back - v).abs() < 1e-9, "{v} -> {back}");
        }
    }
}
