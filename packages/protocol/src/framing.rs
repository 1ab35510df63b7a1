//! Compact binary form for `document-update` frames.
//!
//! Layout, big-endian: `[kind u8][doc-id len u16][doc-id bytes][seq u64]
//! [update bytes]`. Clients may use this instead of the JSON form for bulk
//! update traffic; the JSON form is always accepted.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// Frame kind discriminator for document updates.
pub const KIND_UPDATE: u8 = 0x01;

/// A decoded binary update frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryUpdate {
    pub document_id: String,
    pub seq: u64,
    pub update: Vec<u8>,
}

pub fn encode_update(document_id: &str, seq: u64, update: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 2 + document_id.len() + 8 + update.len());
    buf.put_u8(KIND_UPDATE);
    buf.put_u16(document_id.len() as u16);
    buf.put_slice(document_id.as_bytes());
    buf.put_u64(seq);
    buf.put_slice(update);
    buf.freeze()
}

pub fn decode_update(frame: &[u8]) -> Result<BinaryUpdate, ProtocolError> {
    let mut buf = frame;
    if buf.remaining() < 3 {
        return Err(ProtocolError::BadBinaryFrame("truncated header".into()));
    }
    let kind = buf.get_u8();
    if kind != KIND_UPDATE {
        return Err(ProtocolError::BadBinaryFrame(format!(
            "unknown frame kind {kind:#04x}"
        )));
    }
    let id_len = buf.get_u16() as usize;
    if buf.remaining() < id_len + 8 {
        return Err(ProtocolError::BadBinaryFrame("truncated body".into()));
    }
    let document_id = std::str::from_utf8(&buf[..id_len])
        .map_err(|_| ProtocolError::BadBinaryFrame("doc id is not utf-8".into()))?
        .to_owned();
    buf.advance(id_len);
    let seq = buf.get_u64();
    Ok(BinaryUpdate {
        document_id,
        seq,
        update: buf.to_vec(),
    })
}
