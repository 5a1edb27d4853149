use bytes::{Buf, Bytes, BytesMut};

use crate::errors::{FragError, Result};
use crate::typed::{AsyncTypedArray, ElementType};
use crate::view::AsyncView;

/// Default lookahead chunk size in bytes.
pub const DEFAULT_DECODER_CHUNK: usize = 1 << 9;

/// Asynchronously decode reserved datatypes from an [`AsyncView`].
///
/// A sequential cursor with a private lookahead buffer, separate from the
/// buffer's chunk cache. Decode calls take `&mut self`: a primitive spanning
/// several suspension points can never interleave with another call on the
/// same decoder.
pub struct AsyncDecoder {
    view: AsyncView,
    /// Bytes consumed from the view into the lookahead so far.
    fetched: u64,
    cache: Bytes,
    chunk: usize,
}

impl AsyncDecoder {
    pub fn new(view: AsyncView, chunk: Option<usize>) -> Self {
        Self {
            view,
            fetched: 0,
            cache: Bytes::new(),
            chunk: chunk.unwrap_or(DEFAULT_DECODER_CHUNK).max(1),
        }
    }

    /// The current read position within the view. Useful for determining how
    /// many bytes some variable-width value occupied after decoding it.
    pub fn read(&self) -> u64 {
        self.fetched - self.cache.len() as u64
    }

    /// Create a new view on the data that has yet to be read, with optional
    /// relative offset and length.
    pub fn view(&self, rel: u64, length: Option<u64>) -> AsyncView {
        let pos = self.read() + rel;
        let length = length.unwrap_or_else(|| self.view.bytes().saturating_sub(pos));
        self.view.view(pos, Some(length))
    }

    // Ensure the lookahead holds at least `need` bytes, fetching the longer
    // of the known cached run and the configured chunk size each round.
    async fn refill(&mut self, need: usize) -> Result<()> {
        while self.cache.len() < need {
            let pos = self.fetched;
            let want = (self.chunk as u64)
                .max(self.view.cached(pos))
                .max((need - self.cache.len()) as u64);
            let data = self.view.slice(pos, pos + want).await?;
            self.fetched += data.len() as u64;
            self.cache = concat(std::mem::take(&mut self.cache), data);
        }
        Ok(())
    }

    /// Read a single byte. Advances the read position by 1.
    pub async fn byte(&mut self) -> Result<u8> {
        self.refill(1).await?;
        let value = self.cache[0];
        self.cache.advance(1);
        Ok(value)
    }

    /// Decode a variable-width unsigned int: little-endian base-128, seven
    /// payload bits per byte, continuation in bit 7, at most 5 bytes.
    pub async fn vuint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for offset in 0..5 {
            self.refill(offset + 1).await?;
            let byte = self.cache[offset];
            value |= u64::from(byte & 0x7f) << (7 * offset as u32);
            if byte < 0x80 {
                self.cache.advance(offset + 1);
                return Ok(value);
            }
        }
        Err(FragError::Unsupported(
            "decoding integers of 6 bytes or more not supported by vuint()".to_owned(),
        ))
    }

    /// Decode a null-terminated UTF-8 string; the terminator is consumed
    /// but not included.
    pub async fn ntu8_string(&mut self) -> Result<String> {
        let mut searched = 0;
        loop {
            if searched >= self.cache.len() {
                self.refill(self.cache.len() + 1).await?;
            }
            if let Some(at) = self.cache[searched..].iter().position(|&byte| byte == 0) {
                let end = searched + at;
                let value = std::str::from_utf8(&self.cache[..end])?.to_owned();
                self.cache.advance(end + 1);
                return Ok(value);
            }
            searched = self.cache.len();
        }
    }

    /// Decode a length-prefixed UTF-8 string: a `vuint` byte length followed
    /// by exactly that many bytes.
    pub async fn lpu8_string(&mut self) -> Result<String> {
        let length = self.vuint().await? as usize;
        self.refill(length).await?;
        let value = std::str::from_utf8(&self.cache[..length])?.to_owned();
        self.cache.advance(length);
        Ok(value)
    }

    /// Decode a typed-array header (element-type tag byte and `vuint`
    /// element count) and wrap the payload span in an [`AsyncTypedArray`]
    /// without reading it; the read position advances past the span.
    pub async fn typed_array(&mut self) -> Result<AsyncTypedArray> {
        let tag = self.byte().await?;
        let count = self.vuint().await?;
        let ty = ElementType::from_tag(tag)?;
        let span = count * ty.width() as u64;
        let items = self.view(0, Some(span));

        if span >= self.cache.len() as u64 {
            // went beyond the lookahead; reset it past the span
            self.fetched = self.read() + span;
            self.cache = Bytes::new();
        } else {
            self.cache.advance(span as usize);
        }

        Ok(AsyncTypedArray::new(items, ty, Some(count)))
    }
}

fn concat(a: Bytes, b: Bytes) -> Bytes {
    if a.is_empty() {
        return b;
    }
    let mut out = BytesMut::with_capacity(a.len() + b.len());
    out.extend_from_slice(&a);
    out.extend_from_slice(&b);
    out.freeze()
}
