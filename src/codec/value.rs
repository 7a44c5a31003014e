use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::util::buf::{put_string_u32, try_get_bytes, try_get_string_u32};

/// One encoding per representable value, discriminated by a single-byte tag.
///  Values of application types with no built-in tag travel as `Opaque` byte
///  blobs produced by a pluggable [ObjectSerializer].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Byte(i8),
    Bool(bool),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Str(String),
    ByteArray(Vec<i8>),
    BoolArray(Vec<bool>),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StrArray(Vec<String>),
    CharArray(Vec<char>),
    Opaque(Vec<u8>),
}

const TAG_NULL: u8 = 0;
const TAG_BYTE: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_SHORT: u8 = 3;
const TAG_INT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_FLOAT: u8 = 6;
const TAG_DOUBLE: u8 = 7;
const TAG_STR: u8 = 8;
const TAG_CHAR: u8 = 9;
const TAG_BYTE_ARRAY: u8 = 11;
const TAG_BOOL_ARRAY: u8 = 12;
const TAG_SHORT_ARRAY: u8 = 13;
const TAG_INT_ARRAY: u8 = 14;
const TAG_LONG_ARRAY: u8 = 15;
const TAG_FLOAT_ARRAY: u8 = 16;
const TAG_DOUBLE_ARRAY: u8 = 17;
const TAG_STR_ARRAY: u8 = 18;
const TAG_CHAR_ARRAY: u8 = 19;
const TAG_OPAQUE: u8 = 100;

// The original wire format had a second set of array tags (21..=29) for boxed
//  element types. They decode onto the same array variants; encode only ever
//  emits the primitive tags.
const LEGACY_ARRAY_TAG_OFFSET: u8 = 10;

impl Value {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => buf.put_u8(TAG_NULL),
            Value::Byte(v) => {
                buf.put_u8(TAG_BYTE);
                buf.put_i8(*v);
            }
            Value::Bool(v) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(*v as u8);
            }
            Value::Short(v) => {
                buf.put_u8(TAG_SHORT);
                buf.put_i16(*v);
            }
            Value::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i32(*v);
            }
            Value::Long(v) => {
                buf.put_u8(TAG_LONG);
                buf.put_i64(*v);
            }
            Value::Float(v) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f32(*v);
            }
            Value::Double(v) => {
                buf.put_u8(TAG_DOUBLE);
                buf.put_f64(*v);
            }
            Value::Str(v) => {
                buf.put_u8(TAG_STR);
                put_string_u32(buf, v);
            }
            Value::Char(v) => {
                buf.put_u8(TAG_CHAR);
                buf.put_u32(*v as u32);
            }
            Value::ByteArray(v) => {
                buf.put_u8(TAG_BYTE_ARRAY);
                buf.put_u32(v.len() as u32);
                for e in v {
                    buf.put_i8(*e);
                }
            }
            Value::BoolArray(v) => {
                buf.put_u8(TAG_BOOL_ARRAY);
                buf.put_u32(v.len() as u32);
                for e in v {
                    buf.put_u8(*e as u8);
                }
            }
            Value::ShortArray(v) => {
                buf.put_u8(TAG_SHORT_ARRAY);
                buf.put_u32(v.len() as u32);
                for e in v {
                    buf.put_i16(*e);
                }
            }
            Value::IntArray(v) => {
                buf.put_u8(TAG_INT_ARRAY);
                buf.put_u32(v.len() as u32);
                for e in v {
                    buf.put_i32(*e);
                }
            }
            Value::LongArray(v) => {
                buf.put_u8(TAG_LONG_ARRAY);
                buf.put_u32(v.len() as u32);
                for e in v {
                    buf.put_i64(*e);
                }
            }
            Value::FloatArray(v) => {
                buf.put_u8(TAG_FLOAT_ARRAY);
                buf.put_u32(v.len() as u32);
                for e in v {
                    buf.put_f32(*e);
                }
            }
            Value::DoubleArray(v) => {
                buf.put_u8(TAG_DOUBLE_ARRAY);
                buf.put_u32(v.len() as u32);
                for e in v {
                    buf.put_f64(*e);
                }
            }
            Value::StrArray(v) => {
                buf.put_u8(TAG_STR_ARRAY);
                buf.put_u32(v.len() as u32);
                for e in v {
                    put_string_u32(buf, e);
                }
            }
            Value::CharArray(v) => {
                buf.put_u8(TAG_CHAR_ARRAY);
                buf.put_u32(v.len() as u32);
                for e in v {
                    buf.put_u32(*e as u32);
                }
            }
            Value::Opaque(v) => {
                buf.put_u8(TAG_OPAQUE);
                buf.put_u32(v.len() as u32);
                buf.put_slice(v);
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Value> {
        let tag = buf.try_get_u8()?;
        let result = match tag {
            TAG_NULL => Value::Null,
            TAG_BYTE => Value::Byte(buf.try_get_i8()?),
            TAG_BOOL => Value::Bool(buf.try_get_u8()? != 0),
            TAG_SHORT => Value::Short(buf.try_get_i16()?),
            TAG_INT => Value::Int(buf.try_get_i32()?),
            TAG_LONG => Value::Long(buf.try_get_i64()?),
            TAG_FLOAT => Value::Float(buf.try_get_f32()?),
            TAG_DOUBLE => Value::Double(buf.try_get_f64()?),
            TAG_STR => Value::Str(try_get_string_u32(buf)?),
            TAG_CHAR => Value::Char(try_get_char(buf)?),
            TAG_OPAQUE => {
                let len = buf.try_get_u32()? as usize;
                Value::Opaque(try_get_bytes(buf, len)?)
            }
            _ => {
                let array_tag = if (TAG_BYTE_ARRAY + LEGACY_ARRAY_TAG_OFFSET
                    ..=TAG_CHAR_ARRAY + LEGACY_ARRAY_TAG_OFFSET)
                    .contains(&tag)
                {
                    tag - LEGACY_ARRAY_TAG_OFFSET
                } else {
                    tag
                };
                Self::try_deser_array(array_tag, buf)?
            }
        };
        Ok(result)
    }

    fn try_deser_array(tag: u8, buf: &mut impl Buf) -> anyhow::Result<Value> {
        let count = buf.try_get_u32()? as usize;
        let result = match tag {
            TAG_BYTE_ARRAY => Value::ByteArray(try_get_elements(buf, count, |b| Ok(b.try_get_i8()?))?),
            TAG_BOOL_ARRAY => Value::BoolArray(try_get_elements(buf, count, |b| Ok(b.try_get_u8()? != 0))?),
            TAG_SHORT_ARRAY => Value::ShortArray(try_get_elements(buf, count, |b| Ok(b.try_get_i16()?))?),
            TAG_INT_ARRAY => Value::IntArray(try_get_elements(buf, count, |b| Ok(b.try_get_i32()?))?),
            TAG_LONG_ARRAY => Value::LongArray(try_get_elements(buf, count, |b| Ok(b.try_get_i64()?))?),
            TAG_FLOAT_ARRAY => Value::FloatArray(try_get_elements(buf, count, |b| Ok(b.try_get_f32()?))?),
            TAG_DOUBLE_ARRAY => Value::DoubleArray(try_get_elements(buf, count, |b| Ok(b.try_get_f64()?))?),
            TAG_STR_ARRAY => Value::StrArray(try_get_elements(buf, count, try_get_string_u32)?),
            TAG_CHAR_ARRAY => Value::CharArray(try_get_elements(buf, count, try_get_char)?),
            _ => bail!("unknown value tag: {}", tag),
        };
        Ok(result)
    }

    /// Wraps an application value into the opaque extension path.
    pub fn opaque<T>(serializer: &dyn ObjectSerializer<T>, value: &T) -> anyhow::Result<Value> {
        Ok(Value::Opaque(serializer.serialize(value)?))
    }

    /// Recovers an application value from the opaque extension path.
    pub fn extract_opaque<T>(&self, serializer: &dyn ObjectSerializer<T>) -> anyhow::Result<T> {
        match self {
            Value::Opaque(bytes) => serializer.deserialize(bytes),
            other => bail!("expected an opaque value, got {:?}", other),
        }
    }
}

fn try_get_char(buf: &mut impl Buf) -> anyhow::Result<char> {
    let raw = buf.try_get_u32()?;
    match char::from_u32(raw) {
        Some(c) => Ok(c),
        None => bail!("invalid char scalar value: {:#x}", raw),
    }
}

fn try_get_elements<B: Buf, T>(
    buf: &mut B,
    count: usize,
    get: impl Fn(&mut B) -> anyhow::Result<T>,
) -> anyhow::Result<Vec<T>> {
    // cap the pre-allocation: a lying count field fails on the first short read
    let mut result = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        result.push(get(buf)?);
    }
    Ok(result)
}

/// The only extension point of the codec: values whose type has no built-in
///  tag are serialized to a byte blob by the application and travel under the
///  opaque tag; decoding hands the blob back to the same serializer.
pub trait ObjectSerializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> anyhow::Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> anyhow::Result<T>;
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn round_trip(v: &Value) -> Value {
        let mut buf = BytesMut::new();
        v.ser(&mut buf);
        let mut read: &[u8] = &buf;
        let result = Value::try_deser(&mut read).unwrap();
        assert!(read.is_empty(), "decoder left {} bytes unconsumed", read.len());
        result
    }

    #[rstest]
    #[case::null(Value::Null)]
    #[case::byte(Value::Byte(-7))]
    #[case::bool_true(Value::Bool(true))]
    #[case::bool_false(Value::Bool(false))]
    #[case::short(Value::Short(-12345))]
    #[case::int(Value::Int(i32::MIN))]
    #[case::long(Value::Long(i64::MAX))]
    #[case::float(Value::Float(1.25))]
    #[case::double(Value::Double(-0.000123))]
    #[case::char_ascii(Value::Char('x'))]
    #[case::char_beyond_bmp(Value::Char('🦀'))]
    #[case::string(Value::Str("hello".to_string()))]
    #[case::empty_string(Value::Str(String::new()))]
    #[case::byte_array(Value::ByteArray(vec![-1, 0, 1]))]
    #[case::bool_array(Value::BoolArray(vec![true, false]))]
    #[case::short_array(Value::ShortArray(vec![7, -7]))]
    #[case::int_array(Value::IntArray(vec![1, 2, 3]))]
    #[case::long_array(Value::LongArray(vec![i64::MIN, i64::MAX]))]
    #[case::float_array(Value::FloatArray(vec![0.5]))]
    #[case::double_array(Value::DoubleArray(vec![1.0, 2.0]))]
    #[case::str_array(Value::StrArray(vec!["a".to_string(), String::new()]))]
    #[case::char_array(Value::CharArray(vec!['a', 'ß']))]
    #[case::empty_int_array(Value::IntArray(vec![]))]
    #[case::empty_str_array(Value::StrArray(vec![]))]
    #[case::opaque(Value::Opaque(vec![0xde, 0xad, 0xbe, 0xef]))]
    #[case::empty_opaque(Value::Opaque(vec![]))]
    fn test_round_trip(#[case] v: Value) {
        assert_eq!(round_trip(&v), v);
    }

    #[rstest]
    #[case::boxed_int_array(24, Value::IntArray(vec![3, 4]))]
    #[case::boxed_char_array(29, Value::CharArray(vec!['q']))]
    fn test_legacy_boxed_array_tags(#[case] legacy_tag: u8, #[case] expected: Value) {
        let mut buf = BytesMut::new();
        expected.ser(&mut buf);
        buf[0] = legacy_tag;
        let mut read: &[u8] = &buf;
        assert_eq!(Value::try_deser(&mut read).unwrap(), expected);
    }

    #[rstest]
    #[case::unknown_tag(b"\x63".as_slice())]
    #[case::empty(b"".as_slice())]
    #[case::truncated_int(b"\x04\x00\x00".as_slice())]
    #[case::truncated_array(b"\x0e\x00\x00\x00\x02\x00\x00\x00\x01".as_slice())]
    #[case::lying_array_count(b"\x0e\xff\xff\xff\xff".as_slice())]
    #[case::invalid_char(b"\x09\xff\xff\xff\xff".as_slice())]
    fn test_malformed_input(#[case] mut buf: &[u8]) {
        assert!(Value::try_deser(&mut buf).is_err());
    }

    struct CsvPoint;
    impl ObjectSerializer<(i32, i32)> for CsvPoint {
        fn serialize(&self, value: &(i32, i32)) -> anyhow::Result<Vec<u8>> {
            Ok(format!("{},{}", value.0, value.1).into_bytes())
        }
        fn deserialize(&self, bytes: &[u8]) -> anyhow::Result<(i32, i32)> {
            let s = std::str::from_utf8(bytes)?;
            let (x, y) = s.split_once(',').ok_or_else(|| anyhow::anyhow!("malformed point"))?;
            Ok((x.parse()?, y.parse()?))
        }
    }

    #[test]
    fn test_opaque_serializer_round_trip() {
        let point = (17, -4);
        let value = Value::opaque(&CsvPoint, &point).unwrap();
        let decoded = round_trip(&value);
        assert_eq!(decoded.extract_opaque(&CsvPoint).unwrap(), point);
    }
}
