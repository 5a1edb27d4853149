use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::Result;

mod auto;
mod file;
mod http;
mod memory;

pub use auto::AutoConnection;
pub use file::FileConnection;
pub use http::HttpRangeConnection;
pub use memory::MemoryConnection;

/// A connection to some byte-addressable resource.
///
/// Constructors are async and return fully-initialized values with the
/// total size resolved, so a connection can never be fetched from before
/// initialization completes.
#[async_trait]
pub trait ResourceConnection: Send + Sync {
    /// The total size of the resource in bytes.
    fn bytes(&self) -> u64;

    /// Fetch the byte range `[lo, hi)`. Returns exactly `hi - lo` bytes, or
    /// fewer at end-of-resource when `hi` was not pre-clamped by the caller.
    async fn fetch(&self, lo: u64, hi: u64) -> Result<Bytes>;

    /// Fetch several ranges, preserving request order in the result.
    ///
    /// Connections with native multi-range support should override this to
    /// batch into one round-trip; the default issues the single-range fetch
    /// concurrently for each range.
    async fn fetch_many(&self, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        futures::future::try_join_all(ranges.iter().map(|&(lo, hi)| self.fetch(lo, hi))).await
    }
}
