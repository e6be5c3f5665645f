use crate::prelude::*;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::sax::packet::{Frame, MbapHeader, MAX_FRAME_BYTES};

/// Accumulates a TCP stream into complete MBAP frames, tolerating partial
/// reads. A nonsense length field is fatal; the stream has lost framing.
#[derive(Default)]
pub struct PacketDecoder {}

impl PacketDecoder {
    pub fn new() -> Self {
        Self {}
    }
}

impl Decoder for PacketDecoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < MbapHeader::SIZE {
            return Ok(None);
        }

        let declared = u16::from_be_bytes([src[4], src[5]]) as usize;
        if declared < 2 {
            bail!("mbap length {} too short for a pdu", declared);
        }

        let frame_len = MbapHeader::SIZE - 1 + declared;
        if frame_len > MAX_FRAME_BYTES {
            bail!("mbap length {} exceeds frame limit", declared);
        }

        if src.len() < frame_len {
            return Ok(None);
        }

        let bytes = src.split_to(frame_len);
        Frame::parse(&bytes).map(Some)
    }
}
