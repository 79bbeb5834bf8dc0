use fuzzx_io::InputType;
use num_traits::Bounded;

/// A typed stdin variable, reconstructed from its bit chunk.
///
/// Rust rendition of a raw-union value overlay: each variant stores
/// the value in its declared width, and all arithmetic happens
/// through saturating `f64` round-trips so the descent can treat the
/// variable vector as a point in `R^n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

fn saturating_int<T>(value: f64) -> T
where
    T: Bounded + num_traits::NumCast,
{
    let value = value.round();
    let lo = num_traits::cast::<T, f64>(T::min_value()).unwrap_or(f64::MIN);
    let hi = num_traits::cast::<T, f64>(T::max_value()).unwrap_or(f64::MAX);
    if value.is_nan() {
        return T::min_value();
    }
    if value <= lo {
        T::min_value()
    } else if value >= hi {
        T::max_value()
    } else {
        num_traits::cast::<f64, T>(value).unwrap_or(T::min_value())
    }
}

impl TypedValue {
    /// Saturating conversion from the descent's `f64` coordinate.
    /// Integers round to nearest and clamp at the type bounds.
    pub fn from_f64(ty: InputType, value: f64) -> Option<TypedValue> {
        Some(match ty {
            InputType::Bool => TypedValue::Bool(value >= 0.5),
            InputType::U8 => TypedValue::U8(saturating_int(value)),
            InputType::I8 => TypedValue::I8(saturating_int(value)),
            InputType::U16 => TypedValue::U16(saturating_int(value)),
            InputType::I16 => TypedValue::I16(saturating_int(value)),
            InputType::U32 => TypedValue::U32(saturating_int(value)),
            InputType::I32 => TypedValue::I32(saturating_int(value)),
            InputType::U64 => TypedValue::U64(saturating_int(value)),
            InputType::I64 => TypedValue::I64(saturating_int(value)),
            InputType::F32 => TypedValue::F32(value as f32),
            InputType::F64 => TypedValue::F64(value),
            _ => return None,
        })
    }

    pub fn from_le_bytes(ty: InputType, bytes: &[u8]) -> Option<TypedValue> {
        let take = |n: usize| -> Option<&[u8]> { bytes.get(..n) };
        Some(match ty {
            InputType::Bool => TypedValue::Bool(*bytes.first()? != 0),
            InputType::U8 => TypedValue::U8(*bytes.first()?),
            InputType::I8 => TypedValue::I8(*bytes.first()? as i8),
            InputType::U16 => TypedValue::U16(u16::from_le_bytes(take(2)?.try_into().ok()?)),
            InputType::I16 => TypedValue::I16(i16::from_le_bytes(take(2)?.try_into().ok()?)),
            InputType::U32 => TypedValue::U32(u32::from_le_bytes(take(4)?.try_into().ok()?)),
            InputType::I32 => TypedValue::I32(i32::from_le_bytes(take(4)?.try_into().ok()?)),
            InputType::U64 => TypedValue::U64(u64::from_le_bytes(take(8)?.try_into().ok()?)),
            InputType::I64 => TypedValue::I64(i64::from_le_bytes(take(8)?.try_into().ok()?)),
            InputType::F32 => TypedValue::F32(f32::from_le_bytes(take(4)?.try_into().ok()?)),
            InputType::F64 => TypedValue::F64(f64::from_le_bytes(take(8)?.try_into().ok()?)),
            _ => return None,
        })
    }

    pub fn to_le_bytes(self) -> Vec<u8> {
        match self {
            TypedValue::Bool(v) => vec![v as u8],
            TypedValue::U8(v) => vec![v],
            TypedValue::I8(v) => vec![v as u8],
            TypedValue::U16(v) => v.to_le_bytes().to_vec(),
            TypedValue::I16(v) => v.to_le_bytes().to_vec(),
            TypedValue::U32(v) => v.to_le_bytes().to_vec(),
            TypedValue::I32(v) => v.to_le_bytes().to_vec(),
            TypedValue::U64(v) => v.to_le_bytes().to_vec(),
            TypedValue::I64(v) => v.to_le_bytes().to_vec(),
            TypedValue::F32(v) => v.to_le_bytes().to_vec(),
            TypedValue::F64(v) => v.to_le_bytes().to_vec(),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            TypedValue::Bool(v) => v as u8 as f64,
            TypedValue::U8(v) => v as f64,
            TypedValue::I8(v) => v as f64,
            TypedValue::U16(v) => v as f64,
            TypedValue::I16(v) => v as f64,
            TypedValue::U32(v) => v as f64,
            TypedValue::I32(v) => v as f64,
            TypedValue::U64(v) => v as f64,
            TypedValue::I64(v) => v as f64,
            TypedValue::F32(v) => v as f64,
            TypedValue::F64(v) => v,
        }
    }

    pub fn is_finite(self) -> bool {
        match self {
            TypedValue::F32(v) => v.is_finite(),
            TypedValue::F64(v) => v.is_finite(),
            _ => true,
        }
    }
}

/// The smallest meaningful finite-difference step for the type:
/// 1 for integers and booleans, a relative delta for floats.
pub fn smallest_step(ty: InputType, from: f64) -> f64 {
    if ty.is_float() {
        let delta = from.abs() * 1e-3;
        if delta.is_finite() && delta > 0.0 {
            delta
        } else {
            1e-3
        }
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_round_trips() {
        assert_eq!(
            TypedValue::from_f64(InputType::U8, 300.0),
            Some(TypedValue::U8(255))
        );
        assert_eq!(
            TypedValue::from_f64(InputType::I8, -200.0),
            Some(TypedValue::I8(-128))
        );
        assert_eq!(
            TypedValue::from_f64(InputType::U32, 3.6),
            Some(TypedValue::U32(4))
        );
        assert!(TypedValue::from_f64(InputType::Untyped16, 1.0).is_none());
    }

    #[test]
    fn le_byte_round_trip() {
        let v = TypedValue::U32(0xDEAD_BEEF);
        let bytes = v.to_le_bytes();
        assert_eq!(TypedValue::from_le_bytes(InputType::U32, &bytes), Some(v));

        let f = TypedValue::F64(-2.5);
        assert_eq!(
            TypedValue::from_le_bytes(InputType::F64, &f.to_le_bytes()),
            Some(f)
        );
    }

    #[test]
    fn integer_steps_are_unit() {
        assert_eq!(smallest_step(InputType::I32, 1e6), 1.0);
        assert!(smallest_step(InputType::F64, 0.0) > 0.0);
        assert!((smallest_step(InputType::F64, 100.0) - 0.1).abs() < 1e-12);
    }
}
