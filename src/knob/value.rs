//! Typed casting between knob text and Rust values.
//!
//! The wire carries everything as ASCII. Booleans travel as `0`/`1`, lists as
//! comma-separated values (the device sometimes answers with spaces instead, so
//! decoding accepts both).

use std::fmt;

/// Value type declared for a knob in a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnobKind {
    /// `0` / `1`
    Bool,
    /// Signed integer
    Int,
    /// Floating point
    Float,
    /// Free text
    Str,
    /// List of integers
    IntList,
    /// List of floats
    FloatList,
    /// Bare command without a value
    Exec,
}

impl fmt::Display for KnobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KnobKind::Bool => "bool",
            KnobKind::Int => "int",
            KnobKind::Float => "float",
            KnobKind::Str => "string",
            KnobKind::IntList => "int list",
            KnobKind::FloatList => "float list",
            KnobKind::Exec => "executable",
        };
        write!(f, "{}", label)
    }
}

/// A Rust type that can be read from and written to a knob.
pub trait KnobType: Sized + Send + Sync + 'static {
    /// Schema kind this type corresponds to.
    const KIND: KnobKind;

    /// Render the value as request text. Only executables render as nothing.
    fn encode(&self) -> String;

    /// Parse a response body.
    fn decode(raw: &str) -> Result<Self, String>;
}

impl KnobType for () {
    const KIND: KnobKind = KnobKind::Exec;

    fn encode(&self) -> String {
        String::new()
    }

    fn decode(_raw: &str) -> Result<Self, String> {
        Ok(())
    }
}

impl KnobType for bool {
    const KIND: KnobKind = KnobKind::Bool;

    fn encode(&self) -> String {
        if *self { "1" } else { "0" }.to_string()
    }

    fn decode(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        raw.parse::<i64>()
            .map(|v| v != 0)
            .map_err(|_| format!("'{}' is not a boolean (expected 0/1)", raw))
    }
}

impl KnobType for i64 {
    const KIND: KnobKind = KnobKind::Int;

    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        raw.parse::<i64>()
            .map_err(|_| format!("'{}' is not an integer", raw))
    }
}

impl KnobType for f64 {
    const KIND: KnobKind = KnobKind::Float;

    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        raw.parse::<f64>()
            .map_err(|_| format!("'{}' is not a number", raw))
    }
}

impl KnobType for String {
    const KIND: KnobKind = KnobKind::Str;

    fn encode(&self) -> String {
        self.clone()
    }

    fn decode(raw: &str) -> Result<Self, String> {
        Ok(raw.trim().to_string())
    }
}

impl KnobType for Vec<i64> {
    const KIND: KnobKind = KnobKind::IntList;

    fn encode(&self) -> String {
        join_list(self)
    }

    fn decode(raw: &str) -> Result<Self, String> {
        split_list(raw).map(i64::decode).collect()
    }
}

impl KnobType for Vec<f64> {
    const KIND: KnobKind = KnobKind::FloatList;

    fn encode(&self) -> String {
        join_list(self)
    }

    fn decode(raw: &str) -> Result<Self, String> {
        split_list(raw).map(f64::decode).collect()
    }
}

fn join_list<T: fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_travels_as_digit() {
        assert_eq!(true.encode(), "1");
        assert_eq!(false.encode(), "0");
        assert!(bool::decode(" 1\n").unwrap());
        assert!(!bool::decode("0").unwrap());
        assert!(bool::decode("yes").is_err());
    }

    #[test]
    fn lists_accept_commas_and_spaces() {
        assert_eq!(Vec::<i64>::decode("1,2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(Vec::<i64>::decode("1 2  3").unwrap(), vec![1, 2, 3]);
        assert_eq!(
            Vec::<f64>::decode("3.05e-4, 3.06e-4").unwrap(),
            vec![3.05e-4, 3.06e-4]
        );
        assert_eq!(vec![1i64, 0, 1].encode(), "1,0,1");
        assert!(Vec::<i64>::decode("").unwrap().is_empty());
    }

    #[test]
    fn float_round_trips_through_text() {
        let v = 0.000_305_175_781_25f64;
        assert_eq!(f64::decode(&v.encode()).unwrap(), v);
    }
}
