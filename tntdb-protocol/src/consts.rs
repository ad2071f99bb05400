//! IPROTO constants: command codes, map keys, response codes, iterators.
//!
//! Only the subset of the protocol this client speaks is described here.

use std::str::FromStr;

use thiserror::Error;

/// Request header map keys.
pub mod header {
    pub const CODE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SCHEMA_ID: u8 = 0x05;
}

/// Request and response body map keys.
pub mod body {
    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USERNAME: u8 = 0x23;
    pub const EXPRESSION: u8 = 0x27;
    pub const OPS: u8 = 0x28;
    pub const DATA: u8 = 0x30;
    pub const ERROR: u8 = 0x31;
}

/// Command codes carried in the request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    Select = 0x01,
    Insert = 0x02,
    Replace = 0x03,
    Update = 0x04,
    Delete = 0x05,
    /// Legacy CALL wrapping every result into a tuple. Defined for wire
    /// compatibility; the typed surface dispatches [`RequestType::Call`].
    Call16 = 0x06,
    Auth = 0x07,
    Eval = 0x08,
    Upsert = 0x09,
    Call = 0x0a,
    Ping = 0x40,
}

/// Response header code. Zero is success; anything else carries the raw
/// server error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    Error(u32),
}

/// Success code on the wire.
pub const RESPONSE_OK: u32 = 0x00;
/// Generic error code on the wire.
pub const RESPONSE_ERROR: u32 = 0x01;

impl ResponseCode {
    pub fn from_raw(raw: u32) -> Self {
        if raw == RESPONSE_OK {
            ResponseCode::Ok
        } else {
            ResponseCode::Error(raw)
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            ResponseCode::Ok => RESPONSE_OK,
            ResponseCode::Error(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, ResponseCode::Ok)
    }
}

/// SELECT match predicate kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IteratorType {
    Equal = 0,
    ReversedEqual = 1,
    All = 2,
    LessThan = 3,
    LessThanOrEqual = 4,
    GreaterThanOrEqual = 5,
    GreaterThan = 6,
    BitsAllSet = 7,
    BitsAnySet = 8,
    /// No string alias; reachable through the typed form only.
    BitsAllNotSet = 9,
    RtreeOverlaps = 10,
    RtreeNeighbor = 11,
}

impl IteratorType {
    /// Maps a string alias to its iterator kind.
    pub fn from_alias(alias: &str) -> Option<Self> {
        let it = match alias {
            "eq" | "==" => IteratorType::Equal,
            "reveq" | "==<" => IteratorType::ReversedEqual,
            "all" | "*" => IteratorType::All,
            "lt" | "<" => IteratorType::LessThan,
            "lte" | "<=" => IteratorType::LessThanOrEqual,
            "gte" | ">=" => IteratorType::GreaterThanOrEqual,
            "gt" | ">" => IteratorType::GreaterThan,
            "bitall" | "&=" => IteratorType::BitsAllSet,
            "bitany" | "&" => IteratorType::BitsAnySet,
            "overlaps" | "&&" => IteratorType::RtreeOverlaps,
            "neighbor" | "<->" => IteratorType::RtreeNeighbor,
            _ => return None,
        };
        Some(it)
    }
}

/// Alias lookup failure, reported to callers as a bad argument.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown iterator alias: {0:?}")]
pub struct UnknownIterator(pub String);

impl FromStr for IteratorType {
    type Err = UnknownIterator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_alias(s).ok_or_else(|| UnknownIterator(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_values() {
        assert_eq!(RequestType::Select as u8, 0x01);
        assert_eq!(RequestType::Call16 as u8, 0x06);
        assert_eq!(RequestType::Auth as u8, 0x07);
        assert_eq!(RequestType::Upsert as u8, 0x09);
        assert_eq!(RequestType::Call as u8, 0x0a);
        assert_eq!(RequestType::Ping as u8, 0x40);
    }

    #[test]
    fn test_response_code_roundtrip() {
        assert_eq!(ResponseCode::from_raw(0), ResponseCode::Ok);
        assert!(ResponseCode::from_raw(0).is_ok());
        assert_eq!(ResponseCode::from_raw(0x8002), ResponseCode::Error(0x8002));
        assert_eq!(ResponseCode::Error(0x8002).raw(), 0x8002);
        assert!(!ResponseCode::from_raw(RESPONSE_ERROR).is_ok());
    }

    #[test]
    fn test_iterator_aliases() {
        let cases = [
            ("eq", IteratorType::Equal),
            ("==", IteratorType::Equal),
            ("reveq", IteratorType::ReversedEqual),
            ("==<", IteratorType::ReversedEqual),
            ("all", IteratorType::All),
            ("*", IteratorType::All),
            ("lt", IteratorType::LessThan),
            ("<", IteratorType::LessThan),
            ("lte", IteratorType::LessThanOrEqual),
            ("<=", IteratorType::LessThanOrEqual),
            ("gte", IteratorType::GreaterThanOrEqual),
            (">=", IteratorType::GreaterThanOrEqual),
            ("gt", IteratorType::GreaterThan),
            (">", IteratorType::GreaterThan),
            ("bitall", IteratorType::BitsAllSet),
            ("&=", IteratorType::BitsAllSet),
            ("bitany", IteratorType::BitsAnySet),
            ("&", IteratorType::BitsAnySet),
            ("overlaps", IteratorType::RtreeOverlaps),
            ("&&", IteratorType::RtreeOverlaps),
            ("neighbor", IteratorType::RtreeNeighbor),
            ("<->", IteratorType::RtreeNeighbor),
        ];
        for (alias, expected) in cases {
            assert_eq!(alias.parse::<IteratorType>().unwrap(), expected, "{alias}");
        }
    }

    #[test]
    fn test_unknown_alias_rejected() {
        assert!(IteratorType::from_alias("between").is_none());
        let err = "!=".parse::<IteratorType>().unwrap_err();
        assert_eq!(err, UnknownIterator("!=".to_owned()));
    }

    #[test]
    fn test_bits_all_not_set_has_no_alias() {
        // Typed form only.
        assert_eq!(IteratorType::BitsAllNotSet as u8, 9);
        for alias in [
            "eq", "==", "reveq", "==<", "all", "*", "lt", "<", "lte", "<=", "gte", ">=", "gt",
            ">", "bitall", "&=", "bitany", "&", "overlaps", "&&", "neighbor", "<->",
        ] {
            assert_ne!(
                IteratorType::from_alias(alias),
                Some(IteratorType::BitsAllNotSet)
            );
        }
    }
}
