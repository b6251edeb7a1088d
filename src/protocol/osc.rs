//! Minimal OSC 1.0 message codec
//!
//! Messages only. Strings are NUL-terminated and padded to 4 bytes,
//! numbers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MessageError;

/// One OSC argument
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
}

impl OscArg {
    /// Type tag character
    pub fn tag(&self) -> u8 {
        match self {
            OscArg::Int(_) => b'i',
            OscArg::Long(_) => b'h',
            OscArg::Float(_) => b'f',
            OscArg::Double(_) => b'd',
            OscArg::Str(_) => b's',
        }
    }

    /// Integer value of an `i` or `h` argument
    pub fn as_int(&self) -> Option<i64> {
        match self {
            OscArg::Int(v) => Some(*v as i64),
            OscArg::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Value of an `f` or `d` argument
    pub fn as_float(&self) -> Option<f64> {
        match self {
            OscArg::Float(v) => Some(*v as f64),
            OscArg::Double(v) => Some(*v),
            _ => None,
        }
    }
}

/// Address plus arguments
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: OscArg) -> Self {
        self.args.push(arg);
        self
    }

    /// Serialize into a single datagram
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(padded_len(self.address.len()) + 8 + self.args.len() * 8);
        put_padded_str(&mut buf, &self.address);

        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        tags.extend(self.args.iter().map(|a| a.tag() as char));
        put_padded_str(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                OscArg::Int(v) => buf.put_i32(*v),
                OscArg::Long(v) => buf.put_i64(*v),
                OscArg::Float(v) => buf.put_f32(*v),
                OscArg::Double(v) => buf.put_f64(*v),
                OscArg::Str(s) => put_padded_str(&mut buf, s),
            }
        }
        buf.freeze()
    }

    /// Parse one datagram
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        let mut buf = data;

        let address = take_padded_str(&mut buf)?;
        if address == "#bundle" {
            return Err(MessageError::Malformed("OSC bundles are not supported".into()));
        }
        if !address.starts_with('/') {
            return Err(MessageError::Malformed(format!("bad address {address:?}")));
        }

        // A message without a type tag string carries no arguments
        if !buf.has_remaining() {
            return Ok(Self { address, args: Vec::new() });
        }

        let tags = take_padded_str(&mut buf)?;
        let tags = tags
            .strip_prefix(',')
            .ok_or_else(|| MessageError::Malformed("type tags must start with ','".into()))?;

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.bytes() {
            let arg = match tag {
                b'i' => OscArg::Int(take(&mut buf, 4)?.get_i32()),
                b'h' => OscArg::Long(take(&mut buf, 8)?.get_i64()),
                b'f' => OscArg::Float(take(&mut buf, 4)?.get_f32()),
                b'd' => OscArg::Double(take(&mut buf, 8)?.get_f64()),
                b's' => OscArg::Str(take_padded_str(&mut buf)?),
                other => {
                    return Err(MessageError::Malformed(format!(
                        "unsupported type tag '{}'",
                        other as char
                    )))
                }
            };
            args.push(arg);
        }

        Ok(Self { address, args })
    }
}

fn padded_len(len: usize) -> usize {
    (len + 4) & !3
}

fn put_padded_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_bytes(0, padded_len(s.len()) - s.len());
}

/// Split `n` bytes off the front of `buf`
fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], MessageError> {
    if buf.len() < n {
        return Err(MessageError::Malformed(format!(
            "truncated message: need {n} bytes, have {}",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_padded_str(buf: &mut &[u8]) -> Result<String, MessageError> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| MessageError::Malformed("unterminated string".into()))?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|e| MessageError::Malformed(format!("invalid UTF-8: {e}")))?
        .to_owned();
    take(buf, padded_len(end))?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encoding() {
        let msg = OscMessage::new("/ppg/0").with_arg(OscArg::Int(1));
        let bytes = msg.encode();
        assert_eq!(&bytes[..], b"/ppg/0\0\0,i\0\0\0\0\0\x01");
    }

    #[test]
    fn test_string_padding() {
        assert_eq!(padded_len(0), 4);
        assert_eq!(padded_len(3), 4);
        assert_eq!(padded_len(4), 8);
        assert_eq!(padded_len(7), 8);
    }

    #[test]
    fn test_mixed_arguments_decode() {
        let msg = OscMessage::new("/beat/3")
            .with_arg(OscArg::Double(1_700_000_000.5))
            .with_arg(OscArg::Float(72.0))
            .with_arg(OscArg::Long(-9))
            .with_arg(OscArg::Str("hello".into()));
        let decoded = OscMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_truncated_argument_rejected() {
        let bytes = OscMessage::new("/ppg/0").with_arg(OscArg::Int(7)).encode();
        let err = OscMessage::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, MessageError::Malformed(_)));
    }

    #[test]
    fn test_bundle_rejected() {
        let bytes = OscMessage::new("#bundle").encode();
        assert!(matches!(OscMessage::decode(&bytes), Err(MessageError::Malformed(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(OscMessage::decode(b"").is_err());
        assert!(OscMessage::decode(b"no-slash\0\0\0\0").is_err());
        assert!(OscMessage::decode(&[0xff, 0xfe, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut raw = BytesMut::new();
        put_padded_str(&mut raw, "/x");
        put_padded_str(&mut raw, ",T");
        assert!(OscMessage::decode(&raw).is_err());
    }
}
