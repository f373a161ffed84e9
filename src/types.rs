//! The canonical scalar types of the store and the tagged value that carries
//! them.
//!
//! Every keyword and every array element is one of these types. Each
//! non-string type designates a *missing* sentinel: integers reserve their
//! minimum representable value, floating types use a quiet NaN with a fixed
//! bit pattern (top exponent, quiet bit, all remaining fraction bits set,
//! low 16/48 bits zero) so that a missing value survives byte-level round
//! trips that a generic NaN would not.

use crate::error::{ExportError, Result};
use crate::timefmt;

/// Quiet NaN used as the 32-bit missing sentinel.
pub const MISSING_F32_BITS: u32 = 0x7fff_0000;
/// Quiet NaN used as the 64-bit missing sentinel.
pub const MISSING_F64_BITS: u64 = 0x7fff_0000_0000_0000;

pub const MISSING_CHAR: i8 = i8::MIN;
pub const MISSING_SHORT: i16 = i16::MIN;
pub const MISSING_INT: i32 = i32::MIN;
pub const MISSING_LONG: i64 = i64::MIN;

pub fn missing_f32() -> f32 {
    f32::from_bits(MISSING_F32_BITS)
}

pub fn missing_f64() -> f64 {
    f64::from_bits(MISSING_F64_BITS)
}

/// Type tags. `Raw` means "whatever on-disk form the segment has" and is
/// legal only for array payloads, never for keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreType {
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Time,
    String,
    Raw,
}

impl StoreType {
    pub fn name(&self) -> &'static str {
        match self {
            StoreType::Char => "char",
            StoreType::Short => "short",
            StoreType::Int => "int",
            StoreType::Long => "longlong",
            StoreType::Float => "float",
            StoreType::Double => "double",
            StoreType::Time => "time",
            StoreType::String => "string",
            StoreType::Raw => "raw",
        }
    }

    pub fn parse(s: &str) -> Result<StoreType> {
        match s.to_ascii_lowercase().as_str() {
            "char" => Ok(StoreType::Char),
            "short" => Ok(StoreType::Short),
            "int" => Ok(StoreType::Int),
            "longlong" | "long" => Ok(StoreType::Long),
            "float" => Ok(StoreType::Float),
            "double" => Ok(StoreType::Double),
            "time" => Ok(StoreType::Time),
            "string" => Ok(StoreType::String),
            "raw" => Ok(StoreType::Raw),
            other => Err(ExportError::BadRequest(format!("unknown type name '{other}'"))),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            StoreType::Char | StoreType::Short | StoreType::Int | StoreType::Long
        )
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, StoreType::Float | StoreType::Double | StoreType::Time)
    }

    /// Size of one element of this type on disk, in bytes.
    pub fn size(&self) -> usize {
        match self {
            StoreType::Char => 1,
            StoreType::Short => 2,
            StoreType::Int | StoreType::Float => 4,
            StoreType::Long | StoreType::Double | StoreType::Time => 8,
            StoreType::String | StoreType::Raw => 0,
        }
    }
}

/// A value tagged with its store type. String values own their bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Char(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Time(f64),
    String(String),
}

impl StoreValue {
    pub fn store_type(&self) -> StoreType {
        match self {
            StoreValue::Char(_) => StoreType::Char,
            StoreValue::Short(_) => StoreType::Short,
            StoreValue::Int(_) => StoreType::Int,
            StoreValue::Long(_) => StoreType::Long,
            StoreValue::Float(_) => StoreType::Float,
            StoreValue::Double(_) => StoreType::Double,
            StoreValue::Time(_) => StoreType::Time,
            StoreValue::String(_) => StoreType::String,
        }
    }

    /// The designated missing value for `ty`. `String` missing is the empty
    /// string; `Raw` has no missing value and is rejected.
    pub fn missing(ty: StoreType) -> Result<StoreValue> {
        Ok(match ty {
            StoreType::Char => StoreValue::Char(MISSING_CHAR),
            StoreType::Short => StoreValue::Short(MISSING_SHORT),
            StoreType::Int => StoreValue::Int(MISSING_INT),
            StoreType::Long => StoreValue::Long(MISSING_LONG),
            StoreType::Float => StoreValue::Float(missing_f32()),
            StoreType::Double => StoreValue::Double(missing_f64()),
            StoreType::Time => StoreValue::Time(missing_f64()),
            StoreType::String => StoreValue::String(String::new()),
            StoreType::Raw => {
                return Err(ExportError::Internal(
                    "raw type has no missing value".into(),
                ))
            }
        })
    }

    pub fn is_missing(&self) -> bool {
        match self {
            StoreValue::Char(v) => *v == MISSING_CHAR,
            StoreValue::Short(v) => *v == MISSING_SHORT,
            StoreValue::Int(v) => *v == MISSING_INT,
            StoreValue::Long(v) => *v == MISSING_LONG,
            StoreValue::Float(v) => v.is_nan(),
            StoreValue::Double(v) | StoreValue::Time(v) => v.is_nan(),
            StoreValue::String(s) => s.is_empty(),
        }
    }

    /// Widen to f64, with the missing sentinel mapping to NaN.
    pub fn as_f64(&self) -> Result<f64> {
        if self.is_missing() {
            return Ok(missing_f64());
        }

        Ok(match self {
            StoreValue::Char(v) => *v as f64,
            StoreValue::Short(v) => *v as f64,
            StoreValue::Int(v) => *v as f64,
            StoreValue::Long(v) => *v as f64,
            StoreValue::Float(v) => *v as f64,
            StoreValue::Double(v) | StoreValue::Time(v) => *v,
            StoreValue::String(s) => s.trim().parse::<f64>().map_err(|_| {
                ExportError::Unsupported(format!("cannot read '{s}' as a number"))
            })?,
        })
    }

    /// Widen to i64, rounding floating values. Missing maps to the long
    /// sentinel.
    pub fn as_i64(&self) -> Result<i64> {
        if self.is_missing() {
            return Ok(MISSING_LONG);
        }

        Ok(match self {
            StoreValue::Char(v) => *v as i64,
            StoreValue::Short(v) => *v as i64,
            StoreValue::Int(v) => *v as i64,
            StoreValue::Long(v) => *v,
            StoreValue::Float(v) => (*v as f64).round() as i64,
            StoreValue::Double(v) | StoreValue::Time(v) => v.round() as i64,
            StoreValue::String(s) => s.trim().parse::<i64>().map_err(|_| {
                ExportError::Unsupported(format!("cannot read '{s}' as an integer"))
            })?,
        })
    }

    /// Convert to `dst`. Missing converts to missing. Numeric narrowing that
    /// cannot represent the value fails with `Overflow`; string endpoints
    /// without a defined parse fail with `Unsupported`.
    pub fn convert(&self, dst: StoreType) -> Result<StoreValue> {
        if self.store_type() == dst {
            return Ok(self.clone());
        }

        if self.is_missing() {
            return StoreValue::missing(dst);
        }

        match dst {
            StoreType::Char | StoreType::Short | StoreType::Int | StoreType::Long => {
                let wide = self.as_i64()?;
                narrow_integer(wide, dst)
            }
            StoreType::Float => {
                let wide = self.as_f64()?;
                if wide.is_finite() && wide.abs() > f32::MAX as f64 {
                    return Err(ExportError::Overflow {
                        value: format!("{wide}"),
                        dest: "float",
                    });
                }
                Ok(StoreValue::Float(wide as f32))
            }
            StoreType::Double => Ok(StoreValue::Double(self.as_f64()?)),
            StoreType::Time => Ok(StoreValue::Time(self.as_f64()?)),
            StoreType::String => Ok(StoreValue::String(self.format_default())),
            StoreType::Raw => Err(ExportError::Unsupported(
                "cannot convert a keyword value to raw".into(),
            )),
        }
    }

    /// Equality under a type tag, treating two missing values as equal and
    /// comparing floats exactly (bitwise for NaN sentinels).
    pub fn equal(&self, other: &StoreValue) -> bool {
        if self.store_type() != other.store_type() {
            return false;
        }

        if self.is_missing() || other.is_missing() {
            return self.is_missing() && other.is_missing();
        }

        match (self, other) {
            (StoreValue::Float(a), StoreValue::Float(b)) => a.to_bits() == b.to_bits(),
            (StoreValue::Double(a), StoreValue::Double(b))
            | (StoreValue::Time(a), StoreValue::Time(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }

    /// Default textual rendering, used when no per-keyword format applies.
    pub fn format_default(&self) -> String {
        match self {
            StoreValue::Char(v) => format!("{v}"),
            StoreValue::Short(v) => format!("{v}"),
            StoreValue::Int(v) => format!("{v}"),
            StoreValue::Long(v) => format!("{v}"),
            StoreValue::Float(v) => format!("{v}"),
            StoreValue::Double(v) => format!("{v}"),
            StoreValue::Time(v) => timefmt::format_time(*v, "UTC", 0),
            StoreValue::String(s) => s.clone(),
        }
    }

    /// Render with a printf-style format string, the way keyword `format`
    /// fields are declared. Time values ignore `spec` here; their formatting
    /// discipline lives with the keyword engine.
    pub fn format_with(&self, spec: &str) -> String {
        match self {
            StoreValue::Char(v) => printf_one(spec, PrintfArg::Int(*v as i64)),
            StoreValue::Short(v) => printf_one(spec, PrintfArg::Int(*v as i64)),
            StoreValue::Int(v) => printf_one(spec, PrintfArg::Int(*v as i64)),
            StoreValue::Long(v) => printf_one(spec, PrintfArg::Int(*v)),
            StoreValue::Float(v) => printf_one(spec, PrintfArg::Float(*v as f64)),
            StoreValue::Double(v) => printf_one(spec, PrintfArg::Float(*v)),
            StoreValue::Time(v) => timefmt::format_time(*v, "UTC", 0),
            StoreValue::String(s) => printf_one(spec, PrintfArg::Str(s)),
        }
    }
}

fn narrow_integer(wide: i64, dst: StoreType) -> Result<StoreValue> {
    // The destination minimum is reserved for missing, so the usable range
    // starts one above it.
    let (lo, hi, dest) = match dst {
        StoreType::Char => (i8::MIN as i64 + 1, i8::MAX as i64, "char"),
        StoreType::Short => (i16::MIN as i64 + 1, i16::MAX as i64, "short"),
        StoreType::Int => (i32::MIN as i64 + 1, i32::MAX as i64, "int"),
        StoreType::Long => (i64::MIN + 1, i64::MAX, "longlong"),
        _ => unreachable!(),
    };

    if wide < lo || wide > hi {
        return Err(ExportError::Overflow {
            value: format!("{wide}"),
            dest,
        });
    }

    Ok(match dst {
        StoreType::Char => StoreValue::Char(wide as i8),
        StoreType::Short => StoreValue::Short(wide as i16),
        StoreType::Int => StoreValue::Int(wide as i32),
        StoreType::Long => StoreValue::Long(wide),
        _ => unreachable!(),
    })
}

pub enum PrintfArg<'a> {
    Int(i64),
    Float(f64),
    Str(&'a str),
}

/// Render a single value through a C printf-style format string. Keyword
/// formats in series definitions are printf specs (`%d`, `%7.3f`, `%s`, with
/// optional `-`/`0`/`+` flags and `l`/`ll` length modifiers), so we honor
/// that subset. Unrecognized specs fall back to a plain rendering rather
/// than erroring: a bad format in a series definition must not kill an
/// export.
pub fn printf_one(spec: &str, arg: PrintfArg<'_>) -> String {
    let mut out = String::new();
    let mut chars = spec.chars().peekable();
    let mut consumed = false;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        if let Some('%') = chars.peek() {
            chars.next();
            out.push('%');
            continue;
        }

        if consumed {
            // Only one argument is available; leave further specs verbatim.
            out.push('%');
            continue;
        }

        let mut left = false;
        let mut zero = false;
        let mut plus = false;
        while let Some(&f) = chars.peek() {
            match f {
                '-' => left = true,
                '0' => zero = true,
                '+' => plus = true,
                ' ' | '#' => {}
                _ => break,
            }
            chars.next();
        }

        let mut width = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() {
                width.push(d);
                chars.next();
            } else {
                break;
            }
        }
        let width: usize = width.parse().unwrap_or(0);

        let mut precision: Option<usize> = None;
        if let Some('.') = chars.peek() {
            chars.next();
            let mut p = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    p.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            precision = Some(p.parse().unwrap_or(0));
        }

        // length modifiers are irrelevant once everything is 64-bit
        while let Some(&m) = chars.peek() {
            if m == 'l' || m == 'h' || m == 'z' {
                chars.next();
            } else {
                break;
            }
        }

        let conv = match chars.next() {
            Some(c) => c,
            None => break,
        };

        let body = match (conv, &arg) {
            ('d' | 'i' | 'u', PrintfArg::Int(v)) => {
                if plus && *v >= 0 {
                    format!("+{v}")
                } else {
                    format!("{v}")
                }
            }
            ('x', PrintfArg::Int(v)) => format!("{v:x}"),
            ('X', PrintfArg::Int(v)) => format!("{v:X}"),
            ('o', PrintfArg::Int(v)) => format!("{v:o}"),
            ('d' | 'i', PrintfArg::Float(v)) => format!("{}", v.round() as i64),
            ('f' | 'F', PrintfArg::Float(v)) => {
                format!("{:.*}", precision.unwrap_or(6), v)
            }
            ('e', PrintfArg::Float(v)) => format_exp(*v, precision.unwrap_or(6), false),
            ('E', PrintfArg::Float(v)) => format_exp(*v, precision.unwrap_or(6), true),
            ('g' | 'G', PrintfArg::Float(v)) => format!("{v}"),
            ('f' | 'e' | 'g', PrintfArg::Int(v)) => format!("{}", *v as f64),
            ('s', PrintfArg::Str(s)) => match precision {
                Some(p) => s.chars().take(p).collect(),
                None => (*s).to_owned(),
            },
            ('s', PrintfArg::Int(v)) => format!("{v}"),
            ('s', PrintfArg::Float(v)) => format!("{v}"),
            (_, PrintfArg::Int(v)) => format!("{v}"),
            (_, PrintfArg::Float(v)) => format!("{v}"),
            (_, PrintfArg::Str(s)) => (*s).to_owned(),
        };
        consumed = true;

        if body.len() >= width {
            out.push_str(&body);
        } else if left {
            out.push_str(&body);
            out.extend(std::iter::repeat(' ').take(width - body.len()));
        } else if zero && !matches!(&arg, PrintfArg::Str(_)) {
            if let Some(rest) = body.strip_prefix('-') {
                out.push('-');
                out.extend(std::iter::repeat('0').take(width - body.len()));
                out.push_str(rest);
            } else {
                out.extend(std::iter::repeat('0').take(width - body.len()));
                out.push_str(&body);
            }
        } else {
            out.extend(std::iter::repeat(' ').take(width - body.len()));
            out.push_str(&body);
        }
    }

    out
}

fn format_exp(v: f64, precision: usize, upper: bool) -> String {
    let s = format!("{:.*e}", precision, v);
    // Rust emits "1.5e2"; C emits "1.5e+02". Patch the exponent.
    if let Some(pos) = s.find('e') {
        let (mantissa, exp) = s.split_at(pos);
        let exp: i32 = exp[1..].parse().unwrap_or(0);
        let e = if upper { 'E' } else { 'e' };
        format!("{mantissa}{e}{}{:02}", if exp < 0 { "-" } else { "+" }, exp.abs())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sentinels_have_fixed_bits() {
        assert_eq!(missing_f32().to_bits(), 0x7fff_0000);
        assert_eq!(missing_f64().to_bits(), 0x7fff_0000_0000_0000);
        assert!(missing_f32().is_nan());
        assert!(missing_f64().is_nan());
    }

    #[test]
    fn convert_preserves_missing() {
        let m = StoreValue::missing(StoreType::Short).unwrap();
        let wide = m.convert(StoreType::Int).unwrap();
        assert!(wide.is_missing());
        assert_eq!(wide, StoreValue::Int(MISSING_INT));

        let f = m.convert(StoreType::Float).unwrap();
        assert!(f.is_missing());
    }

    #[test]
    fn narrowing_overflow_is_reported() {
        let v = StoreValue::Int(40000);
        match v.convert(StoreType::Short) {
            Err(ExportError::Overflow { dest, .. }) => assert_eq!(dest, "short"),
            other => panic!("expected overflow, got {other:?}"),
        }

        // the destination minimum is reserved for missing
        let v = StoreValue::Int(i16::MIN as i32);
        assert!(v.convert(StoreType::Short).is_err());
        let v = StoreValue::Int(i16::MIN as i32 + 1);
        assert!(v.convert(StoreType::Short).is_ok());
    }

    #[test]
    fn string_parse_round_trip() {
        let v = StoreValue::String("  42 ".into());
        assert_eq!(v.convert(StoreType::Int).unwrap(), StoreValue::Int(42));

        let v = StoreValue::String("not a number".into());
        assert!(matches!(
            v.convert(StoreType::Double),
            Err(ExportError::Unsupported(_))
        ));
    }

    #[test]
    fn printf_subset() {
        assert_eq!(
            printf_one("%05d", PrintfArg::Int(42)),
            "00042".to_string()
        );
        assert_eq!(printf_one("%7.3f", PrintfArg::Float(3.5)), "  3.500");
        assert_eq!(printf_one("%-6d|", PrintfArg::Int(12)), "12    |");
        assert_eq!(printf_one("%s", PrintfArg::Str("abc")), "abc");
        assert_eq!(printf_one("%e", PrintfArg::Float(1234.5)), "1.234500e+03");
    }
}
