//! Batch and message codec.
//!
//! Frame layout:
//!
//! ```text
//! [compression tag: u8][payload]
//! payload (after optional zlib inflate):
//!   varint message count,
//!   then per message: varint byte length, message bytes
//! message bytes:
//!   varint kind wire id,
//!   varint field count,
//!   then per field: tag byte + value
//! ```
//!
//! Integers use LEB128 varints; signed values are zigzag-encoded.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::batch::{Batch, Compression};
use crate::error::CodecError;
use crate::message::{Field, Message, MessageKind};

const FIELD_ENTITY_ID: u8 = 0;
const FIELD_BLOCK_ID: u8 = 1;
const FIELD_ITEM_ID: u8 = 2;
const FIELD_DIMENSION: u8 = 3;
const FIELD_UINT: u8 = 4;
const FIELD_TEXT: u8 = 5;
const FIELD_RAW: u8 = 6;

/// Encodes a message list as a framed batch at the given compression.
pub fn encode_batch(messages: &[Message], compression: Compression) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::new();
    write_varint(&mut body, messages.len() as u64);
    for message in messages {
        let mut encoded = Vec::new();
        encode_message(message, &mut encoded);
        write_varint(&mut body, encoded.len() as u64);
        body.extend_from_slice(&encoded);
    }

    let mut frame = vec![compression.tag()];
    match compression {
        Compression::None => frame.extend_from_slice(&body),
        Compression::Zlib => {
            let mut encoder = ZlibEncoder::new(&mut frame, flate2::Compression::default());
            encoder.write_all(&body)?;
            encoder.finish()?;
        }
    }
    Ok(frame)
}

/// Decodes one framed batch, retaining the original bytes for pass-through.
pub fn decode_batch(bytes: &[u8]) -> Result<Batch, CodecError> {
    let (&tag, payload) = bytes
        .split_first()
        .ok_or(CodecError::UnexpectedEof("compression tag"))?;
    let compression = Compression::from_tag(tag).ok_or(CodecError::UnknownCompression(tag))?;

    let body = match compression {
        Compression::None => payload.to_vec(),
        Compression::Zlib => {
            let mut inflated = Vec::new();
            ZlibDecoder::new(payload).read_to_end(&mut inflated)?;
            inflated
        }
    };

    let mut cursor = body.as_slice();
    let count = read_varint(&mut cursor)? as usize;
    let mut messages = Vec::with_capacity(count);
    for _ in 0..count {
        let length = read_varint(&mut cursor)? as usize;
        if cursor.len() < length {
            return Err(CodecError::UnexpectedEof("message body"));
        }
        let (message_bytes, rest) = cursor.split_at(length);
        let mut message_cursor = message_bytes;
        let message = decode_message(&mut message_cursor)?;
        if !message_cursor.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        messages.push(message);
        cursor = rest;
    }
    if !cursor.is_empty() {
        return Err(CodecError::TrailingBytes);
    }

    Ok(Batch::from_parts(messages, bytes.to_vec(), compression))
}

/// Encodes one message into `out`.
pub fn encode_message(message: &Message, out: &mut Vec<u8>) {
    write_varint(out, message.kind.wire_id() as u64);
    write_varint(out, message.fields.len() as u64);
    for field in &message.fields {
        match field {
            Field::EntityId(id) => {
                out.push(FIELD_ENTITY_ID);
                write_varint(out, zigzag(*id as i64));
            }
            Field::BlockId(id) => {
                out.push(FIELD_BLOCK_ID);
                write_varint(out, *id as u64);
            }
            Field::ItemId(id) => {
                out.push(FIELD_ITEM_ID);
                write_varint(out, *id as u64);
            }
            Field::Dimension(dim) => {
                out.push(FIELD_DIMENSION);
                write_varint(out, zigzag(*dim as i64));
            }
            Field::UInt(value) => {
                out.push(FIELD_UINT);
                write_varint(out, *value);
            }
            Field::Text(text) => {
                out.push(FIELD_TEXT);
                write_varint(out, text.len() as u64);
                out.extend_from_slice(text.as_bytes());
            }
            Field::Raw(bytes) => {
                out.push(FIELD_RAW);
                write_varint(out, bytes.len() as u64);
                out.extend_from_slice(bytes);
            }
        }
    }
}

/// Decodes one message from the front of `input`, advancing it.
pub fn decode_message(input: &mut &[u8]) -> Result<Message, CodecError> {
    let kind = MessageKind::from_wire_id(read_varint(input)? as u16);
    let field_count = read_varint(input)? as usize;
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        let (&tag, rest) = input
            .split_first()
            .ok_or(CodecError::UnexpectedEof("field tag"))?;
        *input = rest;
        let field = match tag {
            FIELD_ENTITY_ID => Field::EntityId(unzigzag(read_varint(input)?) as i32),
            FIELD_BLOCK_ID => Field::BlockId(read_varint(input)? as u32),
            FIELD_ITEM_ID => Field::ItemId(read_varint(input)? as u32),
            FIELD_DIMENSION => Field::Dimension(unzigzag(read_varint(input)?) as i32),
            FIELD_UINT => Field::UInt(read_varint(input)?),
            FIELD_TEXT => {
                let bytes = read_bytes(input)?;
                Field::Text(String::from_utf8(bytes).map_err(|_| CodecError::InvalidText)?)
            }
            FIELD_RAW => Field::Raw(read_bytes(input)?),
            other => return Err(CodecError::UnknownFieldTag(other)),
        };
        fields.push(field);
    }
    Ok(Message::new(kind, fields))
}

fn read_bytes(input: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let length = read_varint(input)? as usize;
    if input.len() < length {
        return Err(CodecError::UnexpectedEof("length-prefixed bytes"));
    }
    let (bytes, rest) = input.split_at(length);
    *input = rest;
    Ok(bytes.to_vec())
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(input: &mut &[u8]) -> Result<u64, CodecError> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let (&byte, rest) = input
            .split_first()
            .ok_or(CodecError::UnexpectedEof("varint"))?;
        *input = rest;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::InvalidVarint)
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
