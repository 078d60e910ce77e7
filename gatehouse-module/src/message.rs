use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::collections::BTreeMap;
use thiserror::Error;

/// First two bytes of every serialized message.
pub const MESSAGE_HEADER: [u8; 2] = [0xA6, 0x10];

/// An empty message still carries the header, its own size, a property count,
/// and a content size.
const MIN_WIRE_LEN: usize = 14;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("serialized message is too short ({0} bytes)")]
    TooShort(usize),

    #[error("byte array is not a gateway message serialization")]
    BadHeader,

    #[error("embedded message size {embedded} does not match buffer size {actual}")]
    SizeMismatch { embedded: i32, actual: usize },

    #[error("invalid property count {0}")]
    BadPropertyCount(i32),

    #[error("read past the end of the serialized message")]
    Truncated,

    #[error("property string is not NUL-terminated")]
    UnterminatedProperty,

    #[error("property string is not valid UTF-8")]
    BadPropertyEncoding(#[from] std::str::Utf8Error),

    #[error("content length does not add up to the message size")]
    ContentSizeMismatch,

    #[error("property strings may not contain NUL bytes")]
    EmbeddedNul,

    #[error("message too large to serialize")]
    TooLarge,
}

/// A broker message: a string property bag plus an opaque content payload.
///
/// Messages are immutable once constructed. The wire form produced by
/// [`to_bytes`](Message::to_bytes) is what crosses the boundary into an
/// embedded runtime, and [`from_bytes`](Message::from_bytes) is what the
/// publish callback uses to reconstitute a message coming back out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    properties: BTreeMap<String, String>,
    content: Vec<u8>,
}

impl Message {
    pub fn new(properties: BTreeMap<String, String>, content: impl Into<Vec<u8>>) -> Self {
        Message {
            properties,
            content: content.into(),
        }
    }

    /// A message with content but no properties.
    pub fn with_content(content: impl Into<Vec<u8>>) -> Self {
        Message::new(BTreeMap::new(), content)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Serialize to the framed wire form:
    ///
    /// ```text
    /// [header: 2][total size: i32][property count: i32]
    /// (key NUL value NUL)*[content size: i32][content]
    /// ```
    ///
    /// All integers are big-endian. The total size includes the header.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let mut properties_len = 0usize;
        for (key, value) in &self.properties {
            if key.as_bytes().contains(&0) || value.as_bytes().contains(&0) {
                return Err(MessageError::EmbeddedNul);
            }
            properties_len += key.len() + 1 + value.len() + 1;
        }

        let total = 2 + 4 + 4 + properties_len + 4 + self.content.len();
        if total > i32::max_value() as usize || self.properties.len() > i32::max_value() as usize {
            return Err(MessageError::TooLarge);
        }

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&MESSAGE_HEADER);
        buf.write_i32::<BigEndian>(total as i32)
            .expect("write to Vec cannot fail");
        buf.write_i32::<BigEndian>(self.properties.len() as i32)
            .expect("write to Vec cannot fail");
        for (key, value) in &self.properties {
            buf.extend_from_slice(key.as_bytes());
            buf.push(0);
            buf.extend_from_slice(value.as_bytes());
            buf.push(0);
        }
        buf.write_i32::<BigEndian>(self.content.len() as i32)
            .expect("write to Vec cannot fail");
        buf.extend_from_slice(&self.content);

        debug_assert_eq!(buf.len(), total);
        Ok(buf)
    }

    /// Reconstruct a message from its framed wire form.
    pub fn from_bytes(source: &[u8]) -> Result<Self, MessageError> {
        if source.len() < MIN_WIRE_LEN {
            return Err(MessageError::TooShort(source.len()));
        }
        if source[0..2] != MESSAGE_HEADER {
            return Err(MessageError::BadHeader);
        }

        let mut pos = 2usize;
        let total = read_i32(source, &mut pos)?;
        if total < 0 || total as usize != source.len() {
            return Err(MessageError::SizeMismatch {
                embedded: total,
                actual: source.len(),
            });
        }

        let count = read_i32(source, &mut pos)?;
        if count < 0 || count == i32::max_value() {
            return Err(MessageError::BadPropertyCount(count));
        }

        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let key = read_nul_terminated(source, &mut pos)?;
            let value = read_nul_terminated(source, &mut pos)?;
            properties.insert(key.to_owned(), value.to_owned());
        }

        let content_len = read_i32(source, &mut pos)?;
        if content_len < 0 || pos + content_len as usize != source.len() {
            return Err(MessageError::ContentSizeMismatch);
        }

        Ok(Message {
            properties,
            content: source[pos..].to_vec(),
        })
    }
}

fn read_i32(source: &[u8], pos: &mut usize) -> Result<i32, MessageError> {
    if *pos + 4 > source.len() {
        return Err(MessageError::Truncated);
    }
    let value = BigEndian::read_i32(&source[*pos..*pos + 4]);
    *pos += 4;
    Ok(value)
}

fn read_nul_terminated<'a>(source: &'a [u8], pos: &mut usize) -> Result<&'a str, MessageError> {
    let rest = &source[*pos..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(MessageError::UnterminatedProperty)?;
    let s = std::str::from_utf8(&rest[..nul])?;
    *pos += nul + 1;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut props = BTreeMap::new();
        props.insert("source".to_owned(), "sensor-1".to_owned());
        props.insert("unit".to_owned(), "celsius".to_owned());
        Message::new(props, &b"21.7"[..])
    }

    #[test]
    fn round_trip() {
        let msg = sample();
        let bytes = msg.to_bytes().expect("serializes");
        let back = Message::from_bytes(&bytes).expect("deserializes");
        assert_eq!(msg, back);
        assert_eq!(back.content(), b"21.7");
        assert_eq!(back.properties()["unit"], "celsius");
    }

    #[test]
    fn empty_message_is_minimum_length() {
        let bytes = Message::default().to_bytes().expect("serializes");
        assert_eq!(bytes.len(), MIN_WIRE_LEN);
        let back = Message::from_bytes(&bytes).expect("deserializes");
        assert_eq!(back, Message::default());
    }

    #[test]
    fn rejects_short_input() {
        match Message::from_bytes(&[0xA6]) {
            Err(MessageError::TooShort(1)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_header() {
        let mut bytes = Message::default().to_bytes().unwrap();
        bytes[0] = 0xFF;
        match Message::from_bytes(&bytes) {
            Err(MessageError::BadHeader) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut bytes = sample().to_bytes().unwrap();
        // lie about the embedded size
        bytes[5] = bytes[5].wrapping_add(1);
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(MessageError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_truncated_properties() {
        let bytes = sample().to_bytes().unwrap();
        // keep the embedded size honest but cut the property region short
        let mut short = bytes[..bytes.len() - 8].to_vec();
        let len = short.len() as i32;
        short[2..6].copy_from_slice(&len.to_be_bytes());
        assert!(Message::from_bytes(&short).is_err());
    }

    #[test]
    fn rejects_nul_in_property() {
        let mut props = BTreeMap::new();
        props.insert("k\0ey".to_owned(), "value".to_owned());
        let msg = Message::new(props, vec![]);
        assert!(matches!(msg.to_bytes(), Err(MessageError::EmbeddedNul)));
    }

    #[test]
    fn content_equality_not_identity() {
        let msg = Message::with_content(vec![0u8, 1, 2, 3, 255]);
        let bytes = msg.to_bytes().unwrap();
        let back = Message::from_bytes(&bytes).unwrap();
        assert_eq!(back.content(), msg.content());
        assert_ne!(back.content().as_ptr(), msg.content().as_ptr());
    }
}
