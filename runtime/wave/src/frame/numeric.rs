//! Pure numeric operators over the operand stack.

use crate::error::Trap;
use crate::ops::NumericOp;

use super::float::{self, f32s, f64s};
use super::stack::{Cell, ValueStack};
use super::StepError;

macro_rules! integer_semantics {
    ($module:ident, $signed:ty, $unsigned:ty) => {
        pub(crate) mod $module {
            use crate::error::Trap;

            const BITS: $unsigned = <$unsigned>::BITS as $unsigned;

            pub fn div_s(a: $signed, b: $signed) -> Result<$signed, Trap> {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                if a == <$signed>::MIN && b == -1 {
                    return Err(Trap::IntegerOverflow);
                }
                Ok(a / b)
            }

            pub fn div_u(a: $unsigned, b: $unsigned) -> Result<$unsigned, Trap> {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                Ok(a / b)
            }

            /// `MIN % -1` is 0, not a trap.
            pub fn rem_s(a: $signed, b: $signed) -> Result<$signed, Trap> {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                Ok(a.wrapping_rem(b))
            }

            pub fn rem_u(a: $unsigned, b: $unsigned) -> Result<$unsigned, Trap> {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                Ok(a % b)
            }

            pub fn shl(a: $unsigned, s: $unsigned) -> $unsigned {
                a << (s % BITS)
            }

            pub fn shr_u(a: $unsigned, s: $unsigned) -> $unsigned {
                a >> (s % BITS)
            }

            /// Arithmetic shift built from a logical one plus a mask of
            /// `s` leading ones for negative operands.
            pub fn shr_s(a: $unsigned, s: $unsigned) -> $unsigned {
                let s = s % BITS;
                let shifted = a >> s;
                if s != 0 && a >> (BITS - 1) == 1 {
                    shifted | !(<$unsigned>::MAX >> s)
                } else {
                    shifted
                }
            }

            pub fn rotl(a: $unsigned, s: $unsigned) -> $unsigned {
                a.rotate_left((s % BITS) as u32)
            }

            pub fn rotr(a: $unsigned, s: $unsigned) -> $unsigned {
                a.rotate_right((s % BITS) as u32)
            }
        }
    };
}

integer_semantics!(i32s, i32, u32);
integer_semantics!(i64s, i64, u64);

/// Checks a float against the open interval `(lower, upper)` of values that
/// truncate into the target integer type.
fn truncatable(x: f64, lower: f64, upper: f64) -> Result<f64, Trap> {
    if x.is_nan() || x.is_infinite() {
        return Err(Trap::InvalidConversion);
    }
    if x <= lower || x >= upper {
        return Err(Trap::IntegerOverflow);
    }
    Ok(x)
}

fn trunc_i32_s(x: f64) -> Result<i32, Trap> {
    truncatable(x, -2_147_483_649.0, 2_147_483_648.0).map(|x| x as i32)
}

fn trunc_i32_u(x: f64) -> Result<u32, Trap> {
    truncatable(x, -1.0, 4_294_967_296.0).map(|x| x as u32)
}

fn trunc_i64_s(x: f64) -> Result<i64, Trap> {
    // Next f64 below -2^63 is -2^63 - 2048.
    truncatable(x, -9_223_372_036_854_777_856.0, 9_223_372_036_854_775_808.0).map(|x| x as i64)
}

fn trunc_i64_u(x: f64) -> Result<u64, Trap> {
    truncatable(x, -1.0, 18_446_744_073_709_551_616.0).map(|x| x as u64)
}

fn unary<A: Cell, R: Cell>(stack: &mut ValueStack, f: impl FnOnce(A) -> R) -> Result<(), StepError> {
    let a = stack.pop::<A>()?;
    stack.push(f(a));
    Ok(())
}

fn binary<A: Cell, R: Cell>(
    stack: &mut ValueStack,
    f: impl FnOnce(A, A) -> R,
) -> Result<(), StepError> {
    let b = stack.pop::<A>()?;
    let a = stack.pop::<A>()?;
    stack.push(f(a, b));
    Ok(())
}

fn try_unary<A: Cell, R: Cell>(
    stack: &mut ValueStack,
    f: impl FnOnce(A) -> Result<R, Trap>,
) -> Result<(), StepError> {
    let a = stack.pop::<A>()?;
    stack.push(f(a)?);
    Ok(())
}

fn try_binary<A: Cell, R: Cell>(
    stack: &mut ValueStack,
    f: impl FnOnce(A, A) -> Result<R, Trap>,
) -> Result<(), StepError> {
    let b = stack.pop::<A>()?;
    let a = stack.pop::<A>()?;
    stack.push(f(a, b)?);
    Ok(())
}

/// Executes one numeric operator.
pub(crate) fn execute(op: NumericOp, stack: &mut ValueStack) -> Result<(), StepError> {
    use NumericOp::*;

    match op {
        // i32 comparisons
        I32Eqz => unary(stack, |a: u32| a == 0),
        I32Eq => binary(stack, |a: u32, b| a == b),
        I32Ne => binary(stack, |a: u32, b| a != b),
        I32LtS => binary(stack, |a: i32, b| a < b),
        I32LtU => binary(stack, |a: u32, b| a < b),
        I32GtS => binary(stack, |a: i32, b| a > b),
        I32GtU => binary(stack, |a: u32, b| a > b),
        I32LeS => binary(stack, |a: i32, b| a <= b),
        I32LeU => binary(stack, |a: u32, b| a <= b),
        I32GeS => binary(stack, |a: i32, b| a >= b),
        I32GeU => binary(stack, |a: u32, b| a >= b),

        // i64 comparisons
        I64Eqz => unary(stack, |a: u64| a == 0),
        I64Eq => binary(stack, |a: u64, b| a == b),
        I64Ne => binary(stack, |a: u64, b| a != b),
        I64LtS => binary(stack, |a: i64, b| a < b),
        I64LtU => binary(stack, |a: u64, b| a < b),
        I64GtS => binary(stack, |a: i64, b| a > b),
        I64GtU => binary(stack, |a: u64, b| a > b),
        I64LeS => binary(stack, |a: i64, b| a <= b),
        I64LeU => binary(stack, |a: u64, b| a <= b),
        I64GeS => binary(stack, |a: i64, b| a >= b),
        I64GeU => binary(stack, |a: u64, b| a >= b),

        // float comparisons
        F32Eq => binary(stack, |a: f32, b| a == b),
        F32Ne => binary(stack, |a: f32, b| a != b),
        F32Lt => binary(stack, |a: f32, b| a < b),
        F32Gt => binary(stack, |a: f32, b| a > b),
        F32Le => binary(stack, |a: f32, b| a <= b),
        F32Ge => binary(stack, |a: f32, b| a >= b),
        F64Eq => binary(stack, |a: f64, b| a == b),
        F64Ne => binary(stack, |a: f64, b| a != b),
        F64Lt => binary(stack, |a: f64, b| a < b),
        F64Gt => binary(stack, |a: f64, b| a > b),
        F64Le => binary(stack, |a: f64, b| a <= b),
        F64Ge => binary(stack, |a: f64, b| a >= b),

        // i32 arithmetic
        I32Clz => unary(stack, |a: u32| a.leading_zeros()),
        I32Ctz => unary(stack, |a: u32| a.trailing_zeros()),
        I32Popcnt => unary(stack, |a: u32| a.count_ones()),
        I32Add => binary(stack, |a: u32, b| a.wrapping_add(b)),
        I32Sub => binary(stack, |a: u32, b| a.wrapping_sub(b)),
        I32Mul => binary(stack, |a: u32, b| a.wrapping_mul(b)),
        I32DivS => try_binary(stack, i32s::div_s),
        I32DivU => try_binary(stack, i32s::div_u),
        I32RemS => try_binary(stack, i32s::rem_s),
        I32RemU => try_binary(stack, i32s::rem_u),
        I32And => binary(stack, |a: u32, b| a & b),
        I32Or => binary(stack, |a: u32, b| a | b),
        I32Xor => binary(stack, |a: u32, b| a ^ b),
        I32Shl => binary(stack, i32s::shl),
        I32ShrS => binary(stack, i32s::shr_s),
        I32ShrU => binary(stack, i32s::shr_u),
        I32Rotl => binary(stack, i32s::rotl),
        I32Rotr => binary(stack, i32s::rotr),

        // i64 arithmetic
        I64Clz => unary(stack, |a: u64| a.leading_zeros() as u64),
        I64Ctz => unary(stack, |a: u64| a.trailing_zeros() as u64),
        I64Popcnt => unary(stack, |a: u64| a.count_ones() as u64),
        I64Add => binary(stack, |a: u64, b| a.wrapping_add(b)),
        I64Sub => binary(stack, |a: u64, b| a.wrapping_sub(b)),
        I64Mul => binary(stack, |a: u64, b| a.wrapping_mul(b)),
        I64DivS => try_binary(stack, i64s::div_s),
        I64DivU => try_binary(stack, i64s::div_u),
        I64RemS => try_binary(stack, i64s::rem_s),
        I64RemU => try_binary(stack, i64s::rem_u),
        I64And => binary(stack, |a: u64, b| a & b),
        I64Or => binary(stack, |a: u64, b| a | b),
        I64Xor => binary(stack, |a: u64, b| a ^ b),
        I64Shl => binary(stack, i64s::shl),
        I64ShrS => binary(stack, i64s::shr_s),
        I64ShrU => binary(stack, i64s::shr_u),
        I64Rotl => binary(stack, i64s::rotl),
        I64Rotr => binary(stack, i64s::rotr),

        // f32 arithmetic
        F32Abs => unary(stack, f32s::abs),
        F32Neg => unary(stack, f32s::neg),
        F32Ceil => unary(stack, f32s::ceil),
        F32Floor => unary(stack, f32s::floor),
        F32Trunc => unary(stack, f32s::trunc),
        F32Nearest => unary(stack, f32s::nearest),
        F32Sqrt => unary(stack, f32s::sqrt),
        F32Add => binary(stack, f32s::add),
        F32Sub => binary(stack, f32s::sub),
        F32Mul => binary(stack, f32s::mul),
        F32Div => binary(stack, f32s::div),
        F32Min => binary(stack, f32s::min),
        F32Max => binary(stack, f32s::max),
        F32Copysign => binary(stack, f32s::copysign),

        // f64 arithmetic
        F64Abs => unary(stack, f64s::abs),
        F64Neg => unary(stack, f64s::neg),
        F64Ceil => unary(stack, f64s::ceil),
        F64Floor => unary(stack, f64s::floor),
        F64Trunc => unary(stack, f64s::trunc),
        F64Nearest => unary(stack, f64s::nearest),
        F64Sqrt => unary(stack, f64s::sqrt),
        F64Add => binary(stack, f64s::add),
        F64Sub => binary(stack, f64s::sub),
        F64Mul => binary(stack, f64s::mul),
        F64Div => binary(stack, f64s::div),
        F64Min => binary(stack, f64s::min),
        F64Max => binary(stack, f64s::max),
        F64Copysign => binary(stack, f64s::copysign),

        // conversions
        I32WrapI64 => unary(stack, |a: u64| a as u32),
        I32TruncF32S => try_unary(stack, |a: f32| trunc_i32_s(a as f64)),
        I32TruncF32U => try_unary(stack, |a: f32| trunc_i32_u(a as f64)),
        I32TruncF64S => try_unary(stack, trunc_i32_s),
        I32TruncF64U => try_unary(stack, trunc_i32_u),
        I64ExtendI32S => unary(stack, |a: i32| a as i64),
        I64ExtendI32U => unary(stack, |a: u32| a as u64),
        I64TruncF32S => try_unary(stack, |a: f32| trunc_i64_s(a as f64)),
        I64TruncF32U => try_unary(stack, |a: f32| trunc_i64_u(a as f64)),
        I64TruncF64S => try_unary(stack, trunc_i64_s),
        I64TruncF64U => try_unary(stack, trunc_i64_u),
        F32ConvertI32S => unary(stack, |a: i32| a as f32),
        F32ConvertI32U => unary(stack, |a: u32| a as f32),
        F32ConvertI64S => unary(stack, |a: i64| a as f32),
        F32ConvertI64U => unary(stack, |a: u64| a as f32),
        F32DemoteF64 => unary(stack, float::demote),
        F64ConvertI32S => unary(stack, |a: i32| a as f64),
        F64ConvertI32U => unary(stack, |a: u32| a as f64),
        F64ConvertI64S => unary(stack, |a: i64| a as f64),
        F64ConvertI64U => unary(stack, |a: u64| a as f64),
        F64PromoteF32 => unary(stack, float::promote),
        I32ReinterpretF32 => unary(stack, |a: f32| a.to_bits()),
        I64ReinterpretF64 => unary(stack, |a: f64| a.to_bits()),
        F32ReinterpretI32 => unary(stack, f32::from_bits),
        F64ReinterpretI64 => unary(stack, f64::from_bits),
    }
}
