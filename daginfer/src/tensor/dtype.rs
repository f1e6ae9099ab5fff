use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type tag carried by every tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F16,
    F32,
    F64,
    I32,
    I64,
    U8,
    Bool,
}

impl DType {
    pub fn as_str(self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::Bool => "bool",
        }
    }

    /// Byte width of one element.
    pub fn size_of(self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::U8 => 1,
            DType::Bool => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Process-wide name registry, write-once at first use.
static DTYPE_REGISTRY: Lazy<HashMap<&'static str, DType>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for dtype in [
        DType::F16,
        DType::F32,
        DType::F64,
        DType::I32,
        DType::I64,
        DType::U8,
        DType::Bool,
    ] {
        map.insert(dtype.as_str(), dtype);
    }
    map
});

impl std::str::FromStr for DType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        DTYPE_REGISTRY
            .get(value)
            .copied()
            .ok_or_else(|| Error::invalid_model(format!("unknown dtype {}", value)))
    }
}

/// IEEE binary16 value stored as raw bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct F16 {
    pub bits: u16,
}

impl F16 {
    pub const ZERO: F16 = F16 { bits: 0 };

    pub fn from_f32(value: f32) -> Self {
        let bits = value.to_bits();
        let sign = ((bits >> 16) & 0x8000) as u16;
        let exp = ((bits >> 23) & 0xff) as i32;
        let mantissa = bits & 0x007f_ffff;

        if exp == 0xff {
            // Inf / NaN
            let payload = if mantissa != 0 { 0x0200 } else { 0 };
            return F16 {
                bits: sign | 0x7c00 | payload,
            };
        }

        let unbiased = exp - 127;
        if unbiased > 15 {
            // Overflow to infinity.
            return F16 { bits: sign | 0x7c00 };
        }
        if unbiased >= -14 {
            let half_exp = ((unbiased + 15) as u16) << 10;
            let half_mantissa = (mantissa >> 13) as u16;
            // Round to nearest, ties away handled by the carry into the exponent.
            let round = (mantissa >> 12) & 1;
            return F16 {
                bits: sign | ((half_exp | half_mantissa) + round as u16),
            };
        }
        if unbiased >= -24 {
            // Subnormal half.
            let shift = (-1 - unbiased) as u32;
            let full = mantissa | 0x0080_0000;
            let half_mantissa = (full >> (shift + 14)) as u16;
            let round = (full >> (shift + 13)) & 1;
            return F16 {
                bits: sign | (half_mantissa + round as u16),
            };
        }
        // Underflow to signed zero.
        F16 { bits: sign }
    }

    pub fn to_f32(self) -> f32 {
        let sign = ((self.bits & 0x8000) as u32) << 16;
        let exp = ((self.bits >> 10) & 0x1f) as u32;
        let mantissa = (self.bits & 0x03ff) as u32;

        let bits = if exp == 0 {
            if mantissa == 0 {
                sign
            } else {
                // Normalize the subnormal.
                let mut exp = 127 - 15 + 1;
                let mut mantissa = mantissa;
                while mantissa & 0x0400 == 0 {
                    mantissa <<= 1;
                    exp -= 1;
                }
                sign | ((exp as u32) << 23) | ((mantissa & 0x03ff) << 13)
            }
        } else if exp == 0x1f {
            sign | 0x7f80_0000 | (mantissa << 13)
        } else {
            sign | ((exp + 127 - 15) << 23) | (mantissa << 13)
        };
        f32::from_bits(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f16_round_trips_representable_values() {
        for value in [0.0f32, 1.0, -1.0, 0.5, 2.0, 65504.0, -0.25] {
            let half = F16::from_f32(value);
            assert_eq!(half.to_f32(), value, "value {}", value);
        }
    }

    #[test]
    fn f16_saturates_to_infinity() {
        assert_eq!(F16::from_f32(1.0e6).to_f32(), f32::INFINITY);
        assert_eq!(F16::from_f32(-1.0e6).to_f32(), f32::NEG_INFINITY);
    }

    #[test]
    fn dtype_parses_by_name() {
        assert_eq!("f32".parse::<DType>().unwrap(), DType::F32);
        assert!("f128".parse::<DType>().is_err());
    }
}
