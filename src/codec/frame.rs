use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

pub const DEFAULT_MAX_FRAME_LEN: usize = 2048;

/// Prepends the 4-byte big-endian length to an opcode + payload, producing one
///  complete frame on the wire: `u32 length | i32 opcode | payload`. The
///  length covers the opcode and the payload.
pub fn encode_frame(opcode: i32, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u32((4 + payload.len()) as u32);
    buf.put_i32(opcode);
    buf.put_slice(payload);
    buf
}

/// Reassembles length-prefixed frames from a byte stream that arrives in
///  arbitrary chunks. Partial frames are never delivered; a frame longer than
///  the configured maximum is a protocol error, and the connection feeding
///  this decoder must be torn down.
pub struct FrameDecoder {
    max_frame_len: usize,
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> FrameDecoder {
        FrameDecoder {
            max_frame_len,
            buf: BytesMut::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame (opcode + payload, length stripped),
    ///  or `None` if not enough bytes have arrived yet.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<BytesMut>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if frame_len > self.max_frame_len {
            bail!(
                "frame of {} bytes exceeds the configured maximum of {} - closing the connection",
                frame_len,
                self.max_frame_len
            );
        }
        if frame_len < 4 {
            bail!("frame of {} bytes is too short to carry an opcode", frame_len);
        }
        if self.buf.len() < 4 + frame_len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(frame_len)))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame.to_vec());
        }
        frames
    }

    #[test]
    fn test_whole_stream() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&encode_frame(7, b"abc"));
        stream.extend_from_slice(&encode_frame(-104, b""));
        stream.extend_from_slice(&encode_frame(1, b"xyz123"));

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.push(&stream);
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][4..], b"abc");
        assert_eq!(frames[1].len(), 4);
        assert_eq!(&frames[2][4..], b"xyz123");
    }

    #[rstest]
    #[case::byte_by_byte(1)]
    #[case::three_bytes(3)]
    #[case::mid_header(5)]
    #[case::large_chunks(11)]
    fn test_arbitrary_split_boundaries(#[case] chunk_size: usize) {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&encode_frame(7, b"abc"));
        stream.extend_from_slice(&encode_frame(-104, b"defgh"));
        stream.extend_from_slice(&encode_frame(1, b""));

        let mut whole = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        whole.push(&stream);
        let expected = drain(&mut whole);

        let mut chunked = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        let mut frames = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            chunked.push(chunk);
            frames.extend(drain(&mut chunked));
        }
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_partial_frame_not_delivered() {
        let frame = encode_frame(7, b"abcdef");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.push(&frame[..frame.len() - 1]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&frame[frame.len() - 1..]);
        assert_eq!(&decoder.next_frame().unwrap().unwrap()[4..], b"abcdef");
    }

    #[test]
    fn test_oversized_frame_is_protocol_error() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&encode_frame(7, &[0u8; 32]));
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_undersized_frame_is_protocol_error() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.push(&2u32.to_be_bytes());
        decoder.push(&[0u8; 2]);
        assert!(decoder.next_frame().is_err());
    }
}
