//! Compact, self-describing binary encoding of integers and strings.
//!
//! Every item starts with a one-byte tag. The tag is a bias (which kind of
//! item follows) plus either the value itself, when it is at most 23, or a
//! marker announcing 1, 2, 4 or 8 big-endian trailing bytes. Strings reuse
//! the integer scheme for their length prefix. The layout follows CBOR so
//! persisted traces can be inspected with off-the-shelf tools.

use thiserror::Error;

const INT: u8 = 0x00;
const STR: u8 = 0x60;
const ARRAY: u8 = 0x80;
const TAG: u8 = 0xc0;
const NULL: u8 = 0xf6;

const DIRECT_MAX: u8 = 0x17;
const ONE_BYTE: u8 = 0x18;
const TWO_BYTES: u8 = 0x19;
const FOUR_BYTES: u8 = 0x1a;
const EIGHT_BYTES: u8 = 0x1b;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of input")]
    EndOfInput,
    #[error("malformed tag {0:#04x}")]
    MalformedTag(u8),
    #[error("{0}")]
    Mismatch(String),
    #[error("string is not valid UTF-8")]
    Utf8,
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait Encode {
    fn encode(&self, enc: &mut Encoder);
}

pub trait Decode: Sized {
    /// # Errors
    ///
    /// Returns `Err` when the input is truncated or not a valid encoding of
    /// `Self`.
    fn decode(dec: &mut Decoder<'_>) -> Result<Self>;
}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn raw_u64(&mut self, value: u64, bias: u8) {
        if let Ok(byte) = u8::try_from(value) {
            if byte <= DIRECT_MAX {
                self.buf.push(bias + byte);
            } else {
                self.buf.push(bias + ONE_BYTE);
                self.buf.push(byte);
            }
        } else if let Ok(short) = u16::try_from(value) {
            self.buf.push(bias + TWO_BYTES);
            self.buf.extend_from_slice(&short.to_be_bytes());
        } else if let Ok(word) = u32::try_from(value) {
            self.buf.push(bias + FOUR_BYTES);
            self.buf.extend_from_slice(&word.to_be_bytes());
        } else {
            self.buf.push(bias + EIGHT_BYTES);
            self.buf.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn u64(&mut self, value: u64) {
        self.raw_u64(value, INT);
    }

    pub fn bool(&mut self, value: bool) {
        self.u64(u64::from(value));
    }

    /// Length prefix of a sequence.
    pub fn count(&mut self, len: usize) {
        self.raw_u64(len as u64, ARRAY);
    }

    pub fn tag(&mut self, value: u64) {
        self.raw_u64(value, TAG);
    }

    pub fn str(&mut self, value: &str) {
        self.raw_u64(value.len() as u64, STR);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn opt_str(&mut self, value: Option<&str>) {
        match value {
            Some(s) => self.str(s),
            None => self.buf.push(NULL),
        }
    }

    /// Append bytes verbatim, without any tag.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn seq<T: Encode>(&mut self, items: &[T]) {
        self.count(items.len());
        for item in items {
            item.encode(self);
        }
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Result<u8> {
        self.input.get(self.pos).copied().ok_or(Error::EndOfInput)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::EndOfInput)?;
        let bytes = self.input.get(self.pos..end).ok_or(Error::EndOfInput)?;
        self.pos = end;
        Ok(bytes)
    }

    fn raw_u64(&mut self, bias: u8) -> Result<u64> {
        let tag = self.peek()?;
        if tag < bias || tag - bias > EIGHT_BYTES {
            return Err(Error::MalformedTag(tag));
        }
        self.pos += 1;

        let width = match tag - bias {
            v @ 0..=DIRECT_MAX => return Ok(u64::from(v)),
            ONE_BYTE => 1,
            TWO_BYTES => 2,
            FOUR_BYTES => 4,
            _ => 8,
        };

        let bytes = self.take(width)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// # Errors
    ///
    /// Returns `EndOfInput` on truncation and `MalformedTag` when the next
    /// item is not an integer.
    pub fn u64(&mut self) -> Result<u64> {
        self.raw_u64(INT)
    }

    /// # Errors
    ///
    /// Same as [`Decoder::u64`], plus `Mismatch` when the value overflows.
    pub fn u32(&mut self) -> Result<u32> {
        let value = self.u64()?;
        u32::try_from(value).map_err(|_| Error::Mismatch(format!("{value} overflows u32")))
    }

    /// # Errors
    ///
    /// Same as [`Decoder::u64`], plus `Mismatch` when the value overflows.
    pub fn i64(&mut self) -> Result<i64> {
        let value = self.u64()?;
        i64::try_from(value).map_err(|_| Error::Mismatch(format!("{value} overflows i64")))
    }

    /// # Errors
    ///
    /// Same as [`Decoder::u64`], plus `Mismatch` for values other than 0/1.
    pub fn bool(&mut self) -> Result<bool> {
        match self.u64()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Mismatch(format!("{other} is not a boolean"))),
        }
    }

    /// # Errors
    ///
    /// Returns `EndOfInput` on truncation and `MalformedTag` when the next
    /// item is not a length prefix.
    pub fn count(&mut self) -> Result<usize> {
        let len = self.raw_u64(ARRAY)?;
        usize::try_from(len).map_err(|_| Error::Mismatch(format!("{len} items")))
    }

    /// # Errors
    ///
    /// Returns `EndOfInput` on truncation and `MalformedTag` when the next
    /// item is not a tag.
    pub fn tag(&mut self) -> Result<u64> {
        self.raw_u64(TAG)
    }

    /// # Errors
    ///
    /// Returns `EndOfInput` on truncation, `MalformedTag` when the next item
    /// is not a string and `Utf8` when its bytes are not UTF-8.
    pub fn str(&mut self) -> Result<String> {
        let len = self.raw_u64(STR)?;
        let len = usize::try_from(len).map_err(|_| Error::EndOfInput)?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Utf8)
    }

    /// # Errors
    ///
    /// Same as [`Decoder::str`].
    pub fn opt_str(&mut self) -> Result<Option<String>> {
        if self.peek()? == NULL {
            self.pos += 1;
            return Ok(None);
        }
        self.str().map(Some)
    }

    /// Consume `expected` verbatim.
    ///
    /// # Errors
    ///
    /// Returns `EndOfInput` on truncation and `Mismatch` if the bytes differ.
    pub fn expect_raw(&mut self, expected: &[u8]) -> Result<()> {
        let found = self.take(expected.len())?;
        if found == expected {
            Ok(())
        } else {
            Err(Error::Mismatch(format!("expected {expected:02x?}, found {found:02x?}")))
        }
    }

    /// # Errors
    ///
    /// Returns the first error met while decoding the prefix or an item.
    pub fn seq<T: Decode>(&mut self) -> Result<Vec<T>> {
        let len = self.count()?;
        let mut items = Vec::new();
        for _ in 0..len {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn encoded_u64(value: u64) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u64(value);
        enc.finish()
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(encoded_u64(0), vec![0x00]);
        assert_eq!(encoded_u64(23), vec![0x17]);
        assert_eq!(encoded_u64(24), vec![0x18, 24]);
        assert_eq!(encoded_u64(0x1234), vec![0x19, 0x12, 0x34]);
        assert_eq!(encoded_u64(0x1_0000), vec![0x1a, 0, 1, 0, 0]);
        assert_eq!(encoded_u64(u64::MAX), vec![0x1b, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_string_and_null() {
        let mut enc = Encoder::new();
        enc.str("ab");
        enc.opt_str(None);
        enc.opt_str(Some(""));
        let bytes = enc.finish();
        assert_eq!(bytes, vec![0x62, b'a', b'b', 0xf6, 0x60]);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.str().expect("str"), "ab");
        assert_eq!(dec.opt_str().expect("null"), None);
        assert_eq!(dec.opt_str().expect("empty"), Some(String::new()));
        assert!(dec.is_empty());
    }

    #[test]
    fn test_truncated_input() {
        let mut dec = Decoder::new(&[]);
        assert_eq!(dec.u64(), Err(Error::EndOfInput));

        let mut dec = Decoder::new(&[0x19, 0x12]);
        assert_eq!(dec.u64(), Err(Error::EndOfInput));

        let mut dec = Decoder::new(&[0x65, b'a']);
        assert_eq!(dec.str(), Err(Error::EndOfInput));
    }

    #[test]
    fn test_malformed_tag() {
        let mut dec = Decoder::new(&[0x62, b'a', b'b']);
        assert_eq!(dec.u64(), Err(Error::MalformedTag(0x62)));

        let mut dec = Decoder::new(&[0x1c]);
        assert_eq!(dec.u64(), Err(Error::MalformedTag(0x1c)));

        let mut dec = Decoder::new(&[0x05]);
        assert_eq!(dec.str(), Err(Error::MalformedTag(0x05)));
    }

    #[test]
    fn test_expect_raw() {
        let mut dec = Decoder::new(b"abc");
        assert!(dec.expect_raw(b"ab").is_ok());
        assert!(matches!(dec.expect_raw(b"x"), Err(Error::Mismatch(_))));
    }

    #[test]
    fn test_bool_and_overflow() {
        let bytes = encoded_u64(2);
        assert!(matches!(Decoder::new(&bytes).bool(), Err(Error::Mismatch(_))));

        let bytes = encoded_u64(u64::from(u32::MAX) + 1);
        assert!(matches!(Decoder::new(&bytes).u32(), Err(Error::Mismatch(_))));
    }

    proptest! {
        #[test]
        fn prop_u64_round_trip(value in any::<u64>()) {
            let bytes = encoded_u64(value);
            let mut dec = Decoder::new(&bytes);
            prop_assert_eq!(dec.u64(), Ok(value));
            prop_assert!(dec.is_empty());
        }

        #[test]
        fn prop_str_round_trip(value in ".*") {
            let mut enc = Encoder::new();
            enc.str(&value);
            let bytes = enc.finish();
            prop_assert_eq!(Decoder::new(&bytes).str(), Ok(value));
        }

        #[test]
        fn prop_truncation_never_panics(value in ".{1,64}", cut in 0usize..64) {
            let mut enc = Encoder::new();
            enc.str(&value);
            let bytes = enc.finish();
            let cut = cut.min(bytes.len() - 1);
            prop_assert_eq!(Decoder::new(&bytes[..cut]).str(), Err(Error::EndOfInput));
        }
    }
}
