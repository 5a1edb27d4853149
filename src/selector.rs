use std::collections::HashMap;
use std::fmt::Write as _;

use crate::buffer::{AsyncBuffer, ClearedReport};
use crate::errors::{FragError, Result};
use crate::view::AsyncView;

/// A hub for creating [`AsyncView`] instances over a set of named buffers,
/// for formats partitioned into labeled sections that share one logical
/// offset scheme. Each region keeps its own cache; the selector keeps one
/// shared relative window.
#[derive(Clone)]
pub struct AsyncViewSelector {
    buffers: HashMap<String, AsyncBuffer>,
    start: u64,
    length: u64,
}

impl AsyncViewSelector {
    /// `None` length is deduced from the extent of one of the buffers.
    pub fn new(buffers: HashMap<String, AsyncBuffer>, start: u64, length: Option<u64>) -> Self {
        let length = length
            .or_else(|| buffers.values().next().map(|buffer| buffer.bytes()))
            .unwrap_or(0);
        Self {
            buffers,
            start,
            length,
        }
    }

    /// Size of the shared window in bytes.
    pub fn bytes(&self) -> u64 {
        self.length
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Create an [`AsyncView`] over the named region at the selector's
    /// current window.
    pub fn select(&self, region: &str) -> Result<AsyncView> {
        let buffer = self
            .buffers
            .get(region)
            .ok_or_else(|| FragError::UnknownRegion(region.to_owned()))?;
        Ok(AsyncView::new(buffer.clone(), self.start, Some(self.length)))
    }

    /// Narrow the selector itself; affects all subsequently selected
    /// regions identically. `None` length spans to the end of the current
    /// window.
    pub fn view(&self, rel: u64, length: Option<u64>) -> AsyncViewSelector {
        AsyncViewSelector {
            buffers: self.buffers.clone(),
            start: self.start + rel,
            length: length.unwrap_or_else(|| self.length.saturating_sub(rel)),
        }
    }

    /// Advance the window start by `n` bytes in place.
    pub fn skip(&mut self, n: u64) -> &mut Self {
        self.start += n;
        self.length = self.length.saturating_sub(n);
        self
    }

    /// Clear the cache of the named region.
    pub async fn clear(&self, region: &str) -> Result<ClearedReport> {
        let buffer = self
            .buffers
            .get(region)
            .ok_or_else(|| FragError::UnknownRegion(region.to_owned()))?;
        Ok(buffer.clear().await)
    }

    /// Human-readable per-region cache figures, for logging.
    pub fn report(&self) -> String {
        let mut names: Vec<&String> = self.buffers.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let buffer = &self.buffers[name];
            let _ = writeln!(
                out,
                "[[{name}]]: {{\n\tchunks: {},\n\tfootprint: {:.3} MiB,\n}}",
                buffer.chunk_count(),
                buffer.footprint() as f64 / 1024.0 / 1024.0,
            );
        }
        out
    }
}
