use serde::{Deserialize, Serialize};
use std::fmt;

/// A literal value bound to a command parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
    /// Days since the UNIX epoch
    Date32(i32),
    /// Microseconds since the UNIX epoch
    Timestamp(i64),
}

impl ScalarValue {
    /// Stable one-byte tag identifying the value's type
    pub fn type_tag(&self) -> u8 {
        match self {
            ScalarValue::Null => 0,
            ScalarValue::Boolean(_) => 1,
            ScalarValue::Int64(_) => 2,
            ScalarValue::UInt64(_) => 3,
            ScalarValue::Float64(_) => 4,
            ScalarValue::Utf8(_) => 5,
            ScalarValue::Binary(_) => 6,
            ScalarValue::Date32(_) => 7,
            ScalarValue::Timestamp(_) => 8,
        }
    }

    /// Append a type-tagged, length-prefixed encoding of this value.
    ///
    /// The encoding is identical across processes and platforms, so it can
    /// feed a digest. Values of different types never encode the same way.
    pub fn write_canonical(&self, out: &mut Vec<u8>) {
        out.push(self.type_tag());
        match self {
            ScalarValue::Null => {}
            ScalarValue::Boolean(v) => out.push(u8::from(*v)),
            ScalarValue::Int64(v) => out.extend_from_slice(&v.to_be_bytes()),
            ScalarValue::UInt64(v) => out.extend_from_slice(&v.to_be_bytes()),
            ScalarValue::Float64(v) => {
                // all NaNs and both zeros compare equal as parameters
                let bits = if v.is_nan() {
                    f64::NAN.to_bits()
                } else if *v == 0.0 {
                    0u64
                } else {
                    v.to_bits()
                };
                out.extend_from_slice(&bits.to_be_bytes());
            }
            ScalarValue::Utf8(v) => {
                out.extend_from_slice(&(v.len() as u64).to_be_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            ScalarValue::Binary(v) => {
                out.extend_from_slice(&(v.len() as u64).to_be_bytes());
                out.extend_from_slice(v);
            }
            ScalarValue::Date32(v) => out.extend_from_slice(&v.to_be_bytes()),
            ScalarValue::Timestamp(v) => out.extend_from_slice(&v.to_be_bytes()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(v) => write!(f, "{}", v),
            ScalarValue::Int64(v) => write!(f, "{}", v),
            ScalarValue::UInt64(v) => write!(f, "{}", v),
            ScalarValue::Float64(v) => write!(f, "{}", v),
            ScalarValue::Utf8(v) => write!(f, "'{}'", v.replace('\'', "''")),
            ScalarValue::Binary(v) => {
                let hex: String = v.iter().map(|b| format!("{:02X}", b)).collect();
                write!(f, "X'{}'", hex)
            }
            ScalarValue::Date32(v) => write!(f, "DATE({})", v),
            ScalarValue::Timestamp(v) => write!(f, "TIMESTAMP({})", v),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Boolean(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int64(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int64(i64::from(v))
    }
}

impl From<u64> for ScalarValue {
    fn from(v: u64) -> Self {
        ScalarValue::UInt64(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float64(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Utf8(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Utf8(v)
    }
}

impl From<Vec<u8>> for ScalarValue {
    fn from(v: Vec<u8>) -> Self {
        ScalarValue::Binary(v)
    }
}

impl<T: Into<ScalarValue>> From<Option<T>> for ScalarValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ScalarValue::Null)
    }
}
