//! Frame encoding and decoding.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::constants::{FrameTag, MAX_PAYLOAD};
use crate::error::{ProtocolError, Result};

/// A complete wire frame: `{ u32 length, u32 tag, payload[length] }`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: FrameTag,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: FrameTag, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    /// An empty-payload frame (`Reset`).
    pub fn bare(tag: FrameTag) -> Self {
        Self { tag, payload: Vec::new() }
    }

    /// Write the frame to a stream.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        assert!(self.payload.len() <= MAX_PAYLOAD);
        writer.write_u32::<LittleEndian>(self.payload.len() as u32)?;
        writer.write_u32::<LittleEndian>(self.tag.to_u32())?;
        writer.write_all(&self.payload)?;
        Ok(())
    }

    /// Read one frame from a stream. A short read surfaces as an IO error;
    /// an absurd length word or unknown tag is rejected before the payload
    /// is touched.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let len = reader.read_u32::<LittleEndian>()? as usize;
        if len > MAX_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge { len, max: MAX_PAYLOAD });
        }
        let raw_tag = reader.read_u32::<LittleEndian>()?;
        let tag = FrameTag::from_u32(raw_tag).ok_or(ProtocolError::UnknownTag(raw_tag))?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        Ok(Self { tag, payload })
    }

    /// Total encoded size, header included.
    pub fn encoded_size(&self) -> usize {
        8 + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::new(FrameTag::PlanStep, vec![1, 2, 3, 4, 5]);
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), frame.encoded_size());

        let decoded = Frame::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded.tag, FrameTag::PlanStep);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let frame = Frame::bare(FrameTag::Reset);
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 8);

        let decoded = Frame::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded.tag, FrameTag::Reset);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = Vec::new();
        Frame::new(FrameTag::Reset, vec![]).write_to(&mut buf).unwrap();
        buf[4] = 0x7E; // Corrupt the tag word.

        let result = Frame::read_from(&mut Cursor::new(&buf));
        assert!(matches!(result, Err(ProtocolError::UnknownTag(0x7E))));
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let frame = Frame::new(FrameTag::PlanResult, vec![0; 64]);
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 10);

        let result = Frame::read_from(&mut Cursor::new(&buf));
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }

    #[test]
    fn oversized_length_word_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        buf.extend_from_slice(&FrameTag::PlanStep.to_u32().to_le_bytes());

        let result = Frame::read_from(&mut Cursor::new(&buf));
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }
}
