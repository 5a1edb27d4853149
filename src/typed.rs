use bytes::{Buf, Bytes};

use crate::errors::{FragError, Result};
use crate::view::AsyncView;

/// Default cursor read-ahead size in bytes.
pub const DEFAULT_CURSOR_CHUNK: usize = 1 << 11;

/// Element categories supported by [`AsyncTypedArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Uint,
    Int,
    Float,
}

/// A fixed-width little-endian element type; `width = 1 << shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementType {
    kind: ElementKind,
    shift: u32,
}

impl ElementType {
    pub const U8: Self = Self::new(ElementKind::Uint, 0);
    pub const U16: Self = Self::new(ElementKind::Uint, 1);
    pub const U32: Self = Self::new(ElementKind::Uint, 2);
    pub const I8: Self = Self::new(ElementKind::Int, 0);
    pub const I16: Self = Self::new(ElementKind::Int, 1);
    pub const I32: Self = Self::new(ElementKind::Int, 2);
    pub const F32: Self = Self::new(ElementKind::Float, 2);
    pub const F64: Self = Self::new(ElementKind::Float, 3);

    const fn new(kind: ElementKind, shift: u32) -> Self {
        Self { kind, shift }
    }

    /// Decode a header tag byte: high nibble is the kind (0 unsigned,
    /// 1 signed, 2 float), low nibble is the byte width.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0x01 => Ok(Self::U8),
            0x02 => Ok(Self::U16),
            0x04 => Ok(Self::U32),
            0x11 => Ok(Self::I8),
            0x12 => Ok(Self::I16),
            0x14 => Ok(Self::I32),
            0x24 => Ok(Self::F32),
            0x28 => Ok(Self::F64),
            _ => Err(FragError::Unsupported(format!(
                "unknown typed-array element tag 0x{tag:02x}"
            ))),
        }
    }

    pub fn tag(&self) -> u8 {
        let kind = match self.kind {
            ElementKind::Uint => 0x00,
            ElementKind::Int => 0x10,
            ElementKind::Float => 0x20,
        };
        kind | self.width() as u8
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Bytes per element.
    pub fn width(&self) -> usize {
        1 << self.shift
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    fn read(&self, buf: &[u8], at: usize) -> Scalar {
        let word = &buf[at..at + self.width()];
        match (self.kind, self.width()) {
            (ElementKind::Uint, 1) => Scalar::Uint(word[0].into()),
            (ElementKind::Uint, 2) => {
                Scalar::Uint(u16::from_le_bytes([word[0], word[1]]).into())
            }
            (ElementKind::Uint, 4) => Scalar::Uint(
                u32::from_le_bytes(word.try_into().expect("element width")).into(),
            ),
            (ElementKind::Int, 1) => Scalar::Int((word[0] as i8).into()),
            (ElementKind::Int, 2) => {
                Scalar::Int(i16::from_le_bytes([word[0], word[1]]).into())
            }
            (ElementKind::Int, 4) => Scalar::Int(
                i32::from_le_bytes(word.try_into().expect("element width")).into(),
            ),
            (ElementKind::Float, 4) => Scalar::Float(
                f32::from_le_bytes(word.try_into().expect("element width")).into(),
            ),
            (ElementKind::Float, 8) => {
                Scalar::Float(f64::from_le_bytes(word.try_into().expect("element width")))
            }
            _ => unreachable!("constructed only through the named element types"),
        }
    }
}

/// A decoded element value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Uint(u64),
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_u64(&self) -> u64 {
        match *self {
            Scalar::Uint(value) => value,
            Scalar::Int(value) => value as u64,
            Scalar::Float(value) => value as u64,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match *self {
            Scalar::Uint(value) => value as i64,
            Scalar::Int(value) => value,
            Scalar::Float(value) => value as i64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Scalar::Uint(value) => value as f64,
            Scalar::Int(value) => value as f64,
            Scalar::Float(value) => value,
        }
    }
}

/// A lazy, fixed-width-element array over a byte view. Elements are fetched
/// through the view (and thus the shared chunk cache) on access; nothing is
/// read eagerly.
#[derive(Clone)]
pub struct AsyncTypedArray {
    items: AsyncView,
    ty: ElementType,
    /// `None` when the extent is defined by the caller rather than decoded.
    count: Option<u64>,
}

impl AsyncTypedArray {
    pub fn new(items: AsyncView, ty: ElementType, count: Option<u64>) -> Self {
        Self { items, ty, count }
    }

    /// Number of elements, when known.
    pub fn len(&self) -> Option<u64> {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == Some(0)
    }

    pub fn element_type(&self) -> ElementType {
        self.ty
    }

    /// Access the element at the given position.
    pub async fn access(&self, at: u64) -> Result<Scalar> {
        if let Some(count) = self.count {
            if at >= count {
                return Err(FragError::OutOfRange {
                    position: at,
                    extent: count,
                });
            }
        }
        let shift = self.ty.shift();
        let data = self.items.slice(at << shift, (at + 1) << shift).await?;
        if data.len() < self.ty.width() {
            // resource ended mid-element
            return Err(FragError::OutOfRange {
                position: at,
                extent: at + (data.len() as u64 >> shift),
            });
        }
        Ok(self.ty.read(&data, 0))
    }

    /// Access two contiguous elements starting at the given position, in a
    /// single fetch.
    pub async fn pair(&self, lo: u64) -> Result<(Scalar, Scalar)> {
        let shift = self.ty.shift();
        let data = self.items.slice(lo << shift, (lo + 2) << shift).await?;
        if data.len() < 2 * self.ty.width() {
            return Err(FragError::OutOfRange {
                position: lo + 1,
                extent: lo + (data.len() as u64 >> shift),
            });
        }
        Ok((self.ty.read(&data, 0), self.ty.read(&data, self.ty.width())))
    }

    /// Materialize the elements `[lo, hi)`.
    pub async fn slice(&self, lo: u64, hi: u64) -> Result<Vec<Scalar>> {
        let shift = self.ty.shift();
        let data = self.items.slice(lo << shift, hi << shift).await?;
        Ok(data
            .chunks_exact(self.ty.width())
            .map(|word| self.ty.read(word, 0))
            .collect())
    }

    /// A sequential cursor over the elements `[lo, hi)`, reading ahead
    /// `chunk` bytes at a time (default 2 KiB).
    pub fn cursor(&self, lo: u64, hi: u64, chunk: Option<usize>) -> TypedArrayCursor {
        TypedArrayCursor {
            items: self.items.clone(),
            ty: self.ty,
            index: lo,
            hi,
            cache: Bytes::new(),
            chunk: chunk.unwrap_or(DEFAULT_CURSOR_CHUNK).max(1),
            finished: hi == lo,
        }
    }

    /// The view immediately following this array's extent; requires the
    /// element count to be known.
    pub fn remainder(&self) -> Result<AsyncView> {
        let count = self.count.ok_or_else(|| {
            FragError::InvalidState(
                "cannot take the remainder of a typed array whose size was not set".to_owned(),
            )
        })?;
        let start = count << self.ty.shift();
        Ok(self
            .items
            .view(start, Some(self.items.bytes().saturating_sub(start))))
    }
}

/// Sequential element reader produced by [`AsyncTypedArray::cursor`].
pub struct TypedArrayCursor {
    items: AsyncView,
    ty: ElementType,
    /// Next element index to yield.
    index: u64,
    hi: u64,
    cache: Bytes,
    chunk: usize,
    finished: bool,
}

impl TypedArrayCursor {
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Yield the next element.
    pub async fn next(&mut self) -> Result<Scalar> {
        if self.finished {
            return Err(FragError::OutOfRange {
                position: self.index,
                extent: self.hi,
            });
        }
        let shift = self.ty.shift();
        let width = self.ty.width();
        if self.cache.len() < width {
            let ahead = ((self.chunk >> shift).max(1) as u64).min(self.hi - self.index);
            self.cache = self
                .items
                .slice(self.index << shift, (self.index + ahead) << shift)
                .await?;
            if self.cache.len() < width {
                // resource ended mid-element
                return Err(FragError::OutOfRange {
                    position: self.index,
                    extent: self.hi,
                });
            }
        }
        let value = self.ty.read(&self.cache, 0);
        self.cache.advance(width);
        self.index += 1;
        if self.index >= self.hi {
            self.finished = true;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::buffer::{AsyncBuffer, BufferConfig};
    use crate::connection::MemoryConnection;
    use crate::errors::FragError;

    use super::{AsyncTypedArray, ElementType, Scalar};

    fn array_over(data: Vec<u8>, ty: ElementType, count: Option<u64>) -> AsyncTypedArray {
        let connection = Arc::new(MemoryConnection::new(data));
        let buffer = AsyncBuffer::new(connection, BufferConfig::default());
        AsyncTypedArray::new(buffer.view(0, None), ty, count)
    }

    fn encode_u32(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn tags_round_trip() {
        for ty in [
            ElementType::U8,
            ElementType::U16,
            ElementType::U32,
            ElementType::I8,
            ElementType::I16,
            ElementType::I32,
            ElementType::F32,
            ElementType::F64,
        ] {
            assert_eq!(ElementType::from_tag(ty.tag()).unwrap(), ty);
        }
        assert!(matches!(
            ElementType::from_tag(0x38),
            Err(FragError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn access_decodes_little_endian_elements() {
        let array = array_over(
            encode_u32(&[7, 1_000_000, u32::MAX]),
            ElementType::U32,
            Some(3),
        );
        assert_eq!(array.access(0).await.unwrap(), Scalar::Uint(7));
        assert_eq!(array.access(1).await.unwrap(), Scalar::Uint(1_000_000));
        assert_eq!(array.access(2).await.unwrap(), Scalar::Uint(u32::MAX as u64));
    }

    #[tokio::test]
    async fn access_out_of_bounds_fails() {
        let array = array_over(encode_u32(&[1, 2]), ElementType::U32, Some(2));
        match array.access(2).await {
            Err(FragError::OutOfRange { position, extent }) => {
                assert_eq!((position, extent), (2, 2));
            }
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn signed_elements_preserve_sign() {
        let data: Vec<u8> = [-5i16, 300, -30_000]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let array = array_over(data, ElementType::I16, Some(3));
        assert_eq!(array.access(0).await.unwrap(), Scalar::Int(-5));
        assert_eq!(array.access(1).await.unwrap(), Scalar::Int(300));
        assert_eq!(array.access(2).await.unwrap(), Scalar::Int(-30_000));
    }

    #[tokio::test]
    async fn float_elements_round_trip() {
        let data: Vec<u8> = [1.5f64, -0.25, 6.02e23]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let array = array_over(data, ElementType::F64, Some(3));
        assert_eq!(array.access(0).await.unwrap().as_f64(), 1.5);
        assert_eq!(array.access(1).await.unwrap().as_f64(), -0.25);
        assert_eq!(array.access(2).await.unwrap().as_f64(), 6.02e23);
    }

    #[tokio::test]
    async fn pair_fetches_two_elements_in_one_call() {
        let connection = Arc::new(MemoryConnection::new(encode_u32(&[10, 20, 30, 40])));
        let buffer = AsyncBuffer::new(connection.clone(), BufferConfig::default());
        let array = AsyncTypedArray::new(buffer.view(0, None), ElementType::U32, Some(4));

        let (a, b) = array.pair(1).await.unwrap();
        assert_eq!((a, b), (Scalar::Uint(20), Scalar::Uint(30)));
        assert_eq!(connection.fetch_log().len(), 1);
    }

    #[tokio::test]
    async fn slice_materializes_a_range() {
        let array = array_over(encode_u32(&[0, 10, 20, 30, 40]), ElementType::U32, Some(5));
        let values = array.slice(1, 4).await.unwrap();
        assert_eq!(
            values,
            vec![Scalar::Uint(10), Scalar::Uint(20), Scalar::Uint(30)]
        );
    }

    #[tokio::test]
    async fn cursor_yields_every_element_once() {
        let values: Vec<u32> = (0..100).map(|i| i * 3).collect();
        let array = array_over(encode_u32(&values), ElementType::U32, Some(100));

        // a small chunk forces several read-ahead refills
        let mut cursor = array.cursor(0, 100, Some(16));
        let mut seen = Vec::new();
        while !cursor.finished() {
            seen.push(cursor.next().await.unwrap().as_u64() as u32);
        }
        assert_eq!(seen, values);
        assert!(cursor.next().await.is_err());
    }

    #[tokio::test]
    async fn cursor_over_a_subrange() {
        let values: Vec<u32> = (0..20).collect();
        let array = array_over(encode_u32(&values), ElementType::U32, Some(20));
        let mut cursor = array.cursor(5, 8, None);
        assert_eq!(cursor.next().await.unwrap(), Scalar::Uint(5));
        assert_eq!(cursor.next().await.unwrap(), Scalar::Uint(6));
        assert!(!cursor.finished());
        assert_eq!(cursor.next().await.unwrap(), Scalar::Uint(7));
        assert!(cursor.finished());
    }

    #[tokio::test]
    async fn empty_cursor_is_born_finished() {
        let array = array_over(encode_u32(&[1]), ElementType::U32, Some(1));
        let cursor = array.cursor(0, 0, None);
        assert!(cursor.finished());
    }

    #[tokio::test]
    async fn remainder_begins_after_the_extent() {
        let mut data = encode_u32(&[1, 2]);
        data.extend_from_slice(b"after");
        let array = array_over(data, ElementType::U32, Some(2));
        let rest = array.remainder().unwrap();
        let bytes = rest.slice(0, 5).await.unwrap();
        assert_eq!(&bytes[..], b"after");
    }

    #[tokio::test]
    async fn remainder_of_unbounded_array_is_invalid() {
        let array = array_over(encode_u32(&[1, 2]), ElementType::U32, None);
        assert!(matches!(
            array.remainder(),
            Err(FragError::InvalidState(_))
        ));
        // but unbounded access within the view still works
        assert_eq!(array.access(1).await.unwrap(), Scalar::Uint(2));
    }
}
