//! Codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding batches and messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input ended before a complete value could be read.
    #[error("unexpected end of input while decoding {0}")]
    UnexpectedEof(&'static str),

    /// A field tag byte did not match any known field type.
    #[error("unknown field tag {0:#04x}")]
    UnknownFieldTag(u8),

    /// A variable-length integer exceeded its maximum width.
    #[error("malformed varint")]
    InvalidVarint,

    /// A text field was not valid UTF-8.
    #[error("invalid utf-8 in text field")]
    InvalidText,

    /// The frame carried an unknown compression tag.
    #[error("unknown compression tag {0:#04x}")]
    UnknownCompression(u8),

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Bytes remained after the declared message count was decoded.
    #[error("trailing bytes after batch payload")]
    TrailingBytes,
}
