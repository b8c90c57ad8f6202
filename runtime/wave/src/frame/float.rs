//! Floating-point operators with WebAssembly NaN rules.
//!
//! The host FPU may return a differently signed or encoded NaN for invalid
//! operations, so every combination that WASM defines to produce a NaN is
//! detected up front and answered with the canonical quiet NaN. Operations
//! that pass a NaN through force the quiet bit on.

macro_rules! float_semantics {
    (
        $module:ident, $float:ty, $bits:ty,
        sign = $sign:expr, quiet = $quiet:expr, canonical = $canonical:expr,
        sqrt = $sqrt:path, ceil = $ceil:path, floor = $floor:path,
        trunc = $trunc:path, nearest = $nearest:path
    ) => {
        pub(crate) mod $module {
            /// Sign bit.
            pub const SIGN: $bits = $sign;
            /// Quiet bit of the NaN payload.
            pub const QUIET: $bits = $quiet;
            /// Positive quiet NaN with an empty payload.
            pub const CANONICAL_NAN: $bits = $canonical;

            fn canonical() -> $float {
                <$float>::from_bits(CANONICAL_NAN)
            }

            /// Forces the quiet bit of a NaN.
            pub fn quiet(x: $float) -> $float {
                <$float>::from_bits(x.to_bits() | QUIET)
            }

            pub fn add(a: $float, b: $float) -> $float {
                if a.is_infinite() && b.is_infinite() && a.is_sign_negative() != b.is_sign_negative()
                {
                    return canonical();
                }
                a + b
            }

            pub fn sub(a: $float, b: $float) -> $float {
                if a.is_infinite() && b.is_infinite() && a.is_sign_negative() == b.is_sign_negative()
                {
                    return canonical();
                }
                a - b
            }

            pub fn mul(a: $float, b: $float) -> $float {
                if (a.is_infinite() && b == 0.0) || (a == 0.0 && b.is_infinite()) {
                    return canonical();
                }
                a * b
            }

            pub fn div(a: $float, b: $float) -> $float {
                if (a == 0.0 && b == 0.0) || (a.is_infinite() && b.is_infinite()) {
                    return canonical();
                }
                a / b
            }

            pub fn sqrt(x: $float) -> $float {
                if x.is_nan() {
                    return quiet(x);
                }
                if x < 0.0 {
                    return canonical();
                }
                $sqrt(x)
            }

            pub fn min(a: $float, b: $float) -> $float {
                if a.is_nan() {
                    return quiet(a);
                }
                if b.is_nan() {
                    return quiet(b);
                }
                // +0 and -0: the negative one wins
                if a == b && a.to_bits() != b.to_bits() {
                    return <$float>::from_bits(a.to_bits() | b.to_bits());
                }
                if a < b {
                    a
                } else {
                    b
                }
            }

            pub fn max(a: $float, b: $float) -> $float {
                if a.is_nan() {
                    return quiet(a);
                }
                if b.is_nan() {
                    return quiet(b);
                }
                if a == b && a.to_bits() != b.to_bits() {
                    return <$float>::from_bits(a.to_bits() & b.to_bits());
                }
                if a > b {
                    a
                } else {
                    b
                }
            }

            pub fn abs(x: $float) -> $float {
                <$float>::from_bits(x.to_bits() & !SIGN)
            }

            pub fn neg(x: $float) -> $float {
                <$float>::from_bits(x.to_bits() ^ SIGN)
            }

            pub fn copysign(a: $float, b: $float) -> $float {
                <$float>::from_bits((a.to_bits() & !SIGN) | (b.to_bits() & SIGN))
            }

            pub fn ceil(x: $float) -> $float {
                if x.is_nan() {
                    return quiet(x);
                }
                $ceil(x)
            }

            pub fn floor(x: $float) -> $float {
                if x.is_nan() {
                    return quiet(x);
                }
                $floor(x)
            }

            pub fn trunc(x: $float) -> $float {
                if x.is_nan() {
                    return quiet(x);
                }
                $trunc(x)
            }

            /// Round to nearest, ties to even.
            pub fn nearest(x: $float) -> $float {
                if x.is_nan() {
                    return quiet(x);
                }
                $nearest(x)
            }
        }
    };
}

float_semantics!(
    f32s, f32, u32,
    sign = 0x8000_0000, quiet = 0x0040_0000, canonical = 0x7FC0_0000,
    sqrt = libm::sqrtf, ceil = libm::ceilf, floor = libm::floorf,
    trunc = libm::truncf, nearest = libm::rintf
);

float_semantics!(
    f64s, f64, u64,
    sign = 0x8000_0000_0000_0000, quiet = 0x0008_0000_0000_0000,
    canonical = 0x7FF8_0000_0000_0000,
    sqrt = libm::sqrt, ceil = libm::ceil, floor = libm::floor,
    trunc = libm::trunc, nearest = libm::rint
);

/// `f32.demote_f64`, keeping the top of a NaN payload and quieting it.
pub(crate) fn demote(x: f64) -> f32 {
    if x.is_nan() {
        let bits = x.to_bits();
        let sign = ((bits >> 32) as u32) & f32s::SIGN;
        let payload = ((bits >> 29) as u32) & 0x003F_FFFF;
        return f32::from_bits(sign | f32s::CANONICAL_NAN | payload);
    }
    x as f32
}

/// `f64.promote_f32`, keeping a NaN payload and quieting it.
pub(crate) fn promote(x: f32) -> f64 {
    if x.is_nan() {
        let bits = x.to_bits();
        let sign = ((bits & f32s::SIGN) as u64) << 32;
        let payload = ((bits & 0x003F_FFFF) as u64) << 29;
        return f64::from_bits(sign | f64s::CANONICAL_NAN | payload);
    }
    x as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_combinations_are_canonical() {
        assert_eq!(f32s::add(f32::INFINITY, f32::NEG_INFINITY).to_bits(), 0x7FC0_0000);
        assert_eq!(f32s::sub(f32::INFINITY, f32::INFINITY).to_bits(), 0x7FC0_0000);
        assert_eq!(f32s::mul(f32::NEG_INFINITY, 0.0).to_bits(), 0x7FC0_0000);
        assert_eq!(f32s::div(-0.0, 0.0).to_bits(), 0x7FC0_0000);
        assert_eq!(f64s::add(f64::NEG_INFINITY, f64::INFINITY).to_bits(), f64s::CANONICAL_NAN);
        assert_eq!(f64s::mul(0.0, f64::INFINITY).to_bits(), f64s::CANONICAL_NAN);
        assert_eq!(f64s::div(0.0, -0.0).to_bits(), f64s::CANONICAL_NAN);
        assert_eq!(f32s::add(f32::INFINITY, f32::INFINITY), f32::INFINITY);
        assert_eq!(f64s::div(1.0, 0.0), f64::INFINITY);
    }

    #[test]
    fn test_sqrt() {
        assert_eq!(f32s::sqrt(-4.0).to_bits(), 0x7FC0_0000);
        assert_eq!(f32s::sqrt(-0.0).to_bits(), 0x8000_0000);
        assert_eq!(f32s::sqrt(16.0), 4.0);
        let signalling = f32::from_bits(0x7F80_0001);
        assert_eq!(f32s::sqrt(signalling).to_bits(), 0x7FC0_0001);
        let signalling = f64::from_bits(0xFFF0_0000_0000_0001);
        assert_eq!(f64s::sqrt(signalling).to_bits(), 0xFFF8_0000_0000_0001);
    }

    #[test]
    fn test_min_max() {
        assert_eq!(f32s::min(0.0, -0.0).to_bits(), 0x8000_0000);
        assert_eq!(f32s::min(-0.0, 0.0).to_bits(), 0x8000_0000);
        assert_eq!(f32s::max(-0.0, 0.0).to_bits(), 0);
        assert_eq!(f64s::max(0.0, -0.0).to_bits(), 0);
        assert_eq!(f32s::min(1.0, 2.0), 1.0);
        assert_eq!(f64s::max(1.0, 2.0), 2.0);

        let nan = f32::from_bits(0x7F80_0001);
        assert_eq!(f32s::min(nan, 1.0).to_bits(), 0x7FC0_0001);
        assert_eq!(f32s::max(1.0, nan).to_bits(), 0x7FC0_0001);
        assert!(f64s::min(f64::NAN, 1.0).is_nan());
        assert_ne!(f64s::max(1.0, f64::NAN).to_bits() & f64s::QUIET, 0);
    }

    #[test]
    fn test_sign_ops_preserve_payload() {
        let nan = f32::from_bits(0x7FA0_0001);
        assert_eq!(f32s::neg(nan).to_bits(), 0xFFA0_0001);
        assert_eq!(f32s::abs(f32s::neg(nan)).to_bits(), 0x7FA0_0001);
        assert_eq!(f64s::copysign(3.0, -0.0), -3.0);
        assert_eq!(f32s::copysign(-3.0, 1.0), 3.0);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(f32s::nearest(2.5), 2.0);
        assert_eq!(f32s::nearest(3.5), 4.0);
        assert_eq!(f64s::nearest(-0.5).to_bits(), (-0.0f64).to_bits());
        assert_eq!(f64s::ceil(-1.5), -1.0);
        assert_eq!(f64s::floor(-1.5), -2.0);
        assert_eq!(f32s::trunc(-1.7), -1.0);
    }

    #[test]
    fn test_demote_promote_nan() {
        let nan = f64::from_bits(0x7FF4_0000_0000_0000);
        assert_eq!(demote(nan).to_bits(), 0x7FE0_0000);
        assert_eq!(promote(f32::from_bits(0xFFA0_0000)).to_bits(), 0xFFFC_0000_0000_0000);
        assert_eq!(demote(1.5), 1.5f32);
        assert_eq!(promote(1.5), 1.5f64);
    }
}
