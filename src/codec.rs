//! `Codec` is this crate's equivalent of the teacher's `core::Serialize`
//! trait: a two-way `(bytes <-> value)` conversion, pluggable per type,
//! with byte-wise lexicographic order preserved for types used as keys.

use std::convert::TryInto;

use crate::error::{Error, Result};

pub trait Codec: Sized {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(buf: &[u8]) -> Result<Self>;
}

impl Codec for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.as_bytes());
    }

    fn decode(buf: &[u8]) -> Result<String> {
        String::from_utf8(buf.to_vec())
            .map_err(|e| Error::DecodeFail(format!("invalid utf-8 term: {}", e)))
    }
}

impl Codec for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }

    fn decode(buf: &[u8]) -> Result<Vec<u8>> {
        Ok(buf.to_vec())
    }
}

/// Big-endian so that byte-wise comparison of the encoding matches
/// numeric ordering, the way a sortable key codec must.
impl Codec for i64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self ^ i64::MIN).to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Result<i64> {
        let arr: [u8; 8] = buf
            .try_into()
            .map_err(|_| Error::DecodeFail("i64 needs exactly 8 bytes".into()))?;
        Ok(i64::from_be_bytes(arr) ^ i64::MIN)
    }
}

impl Codec for u64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Result<u64> {
        let arr: [u8; 8] = buf
            .try_into()
            .map_err(|_| Error::DecodeFail("u64 needs exactly 8 bytes".into()))?;
        Ok(u64::from_be_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip() {
        let s = "hello".to_string();
        let mut buf = Vec::new();
        s.encode(&mut buf);
        assert_eq!(String::decode(&buf).unwrap(), s);
    }

    #[test]
    fn i64_order_preserving() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        (-5i64).encode(&mut a);
        (3i64).encode(&mut b);
        assert!(a < b);
    }
}
