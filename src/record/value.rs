use std::cmp::Ordering;
use std::fmt;

use super::key::Collation;

/// A single field of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Storage class rank: NULL < numbers < text < blob.
    fn class(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }

    /// Total order used by keys. Text is compared under `collation`.
    pub fn compare(&self, other: &Value, collation: Collation) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Real(b)) => compare_int_real(*a, *b),
            (Value::Real(a), Value::Integer(b)) => compare_int_real(*b, *a).reverse(),
            (Value::Text(a), Value::Text(b)) => collation.compare(a, b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => self.class().cmp(&other.class()),
        }
    }
}

/// Compares an integer with a float without losing precision on either
/// side.
fn compare_int_real(i: i64, r: f64) -> Ordering {
    if r.is_nan() {
        return Ordering::Greater;
    }
    if r < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    if r >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    let whole = r.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0f64.total_cmp(&(r - whole)),
        ord => ord,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r:?}"),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Blob(b) => {
                write!(f, "x'")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "'")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Integer(b as i64)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Blob(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_order() {
        let values = [
            Value::Null,
            Value::Integer(-5),
            Value::Real(2.5),
            Value::Integer(3),
            Value::Text("a".into()),
            Value::Blob(vec![0]),
        ];
        for pair in values.windows(2) {
            assert_eq!(pair[0].compare(&pair[1], Collation::Binary), Ordering::Less);
        }
    }

    #[test]
    fn test_int_real_comparison() {
        let c = Collation::Binary;
        assert_eq!(Value::Integer(2).compare(&Value::Real(2.0), c), Ordering::Equal);
        assert_eq!(Value::Integer(2).compare(&Value::Real(2.5), c), Ordering::Less);
        assert_eq!(Value::Integer(-2).compare(&Value::Real(-2.5), c), Ordering::Greater);
        assert_eq!(Value::Real(1e300).compare(&Value::Integer(i64::MAX), c), Ordering::Greater);
        assert_eq!(Value::Integer(i64::MIN).compare(&Value::Real(-1e300), c), Ordering::Greater);
        // 2^53 + 1 is not representable as f64.
        let big = (1i64 << 53) + 1;
        assert_eq!(Value::Integer(big).compare(&Value::Real((1u64 << 53) as f64), c), Ordering::Greater);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Text("it's".into()).to_string(), "'it''s'");
        assert_eq!(Value::Blob(vec![0xAB, 1]).to_string(), "x'ab01'");
        assert_eq!(Value::from(None::<i64>).to_string(), "NULL");
        assert_eq!(Value::from(true), Value::Integer(1));
    }
}
