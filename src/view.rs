use bytes::Bytes;

use crate::buffer::AsyncBuffer;
use crate::decoder::AsyncDecoder;
use crate::errors::Result;

/// A window onto a specific range of an [`AsyncBuffer`], allowing the same
/// buffer instance to be reused across different views for better memory
/// management. Views address the resource relative to a starting position;
/// they own no bytes themselves.
#[derive(Clone)]
pub struct AsyncView {
    buffer: AsyncBuffer,
    start: u64,
    /// `None` spans to the end of the resource.
    length: Option<u64>,
}

impl AsyncView {
    pub fn new(buffer: AsyncBuffer, start: u64, length: Option<u64>) -> Self {
        Self {
            buffer,
            start,
            length,
        }
    }

    /// Size of the view range in bytes.
    pub fn bytes(&self) -> u64 {
        match self.length {
            Some(length) => length,
            None => self.buffer.bytes().saturating_sub(self.start),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn buffer(&self) -> &AsyncBuffer {
        &self.buffer
    }

    /// Create a new [`AsyncDecoder`] reading from the start of this view.
    pub fn decoder(&self, chunk: Option<usize>) -> AsyncDecoder {
        AsyncDecoder::new(self.clone(), chunk)
    }

    /// Number of contiguous cached bytes following the given position
    /// (relative to this view), clamped to the remainder of the view.
    pub fn cached(&self, rel: u64) -> u64 {
        let run = self.buffer.cached(self.start + rel);
        run.min(self.bytes().saturating_sub(rel))
    }

    /// Extract at least `min_len` bytes starting at `lo`, extending to the
    /// full cached run when one is available, to reduce fetch fragmentation.
    pub async fn pluck(&self, lo: u64, min_len: u64) -> Result<Bytes> {
        let len = min_len.max(self.cached(lo));
        self.slice(lo, lo + len).await
    }

    /// Select a subregion of the current view, reusing this view's buffer
    /// (the cache is preserved). `None` length spans to the end of this
    /// view's range.
    pub fn view(&self, rel: u64, length: Option<u64>) -> AsyncView {
        let length = length.or_else(|| self.length.map(|len| len.saturating_sub(rel)));
        AsyncView::new(self.buffer.clone(), self.start + rel, length)
    }

    /// Extract the byte range `[lo, hi)` relative to this view.
    pub async fn slice(&self, lo: u64, hi: u64) -> Result<Bytes> {
        self.buffer
            .slice(self.start + lo, self.start.saturating_add(hi))
            .await
    }

    /// Extract a list of byte ranges relative to this view in one batched
    /// request.
    pub async fn slices(&self, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        let absolute: Vec<(u64, u64)> = ranges
            .iter()
            .map(|&(lo, hi)| (self.start + lo, self.start.saturating_add(hi)))
            .collect();
        self.buffer.slices(&absolute).await
    }

    /// A new view starting where this view ends, unbounded.
    pub fn remainder(&self) -> AsyncView {
        AsyncView::new(self.buffer.clone(), self.start + self.bytes(), None)
    }

    /// A new view over the same range backed by a fresh (empty) buffer on
    /// the same connection: the cache is not preserved.
    pub fn fresh(&self) -> AsyncView {
        AsyncView::new(self.buffer.fresh(), self.start, self.length)
    }
}
