use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::{FragError, Result};

use super::ResourceConnection;

/// A connection serving an in-memory blob. Records every call it serves,
/// which the test suites rely on to assert fetch behavior.
pub struct MemoryConnection {
    data: Bytes,
    /// One entry per connection call; batched calls record all their ranges.
    log: Mutex<Vec<Vec<(u64, u64)>>>,
    fail_next: AtomicBool,
}

impl MemoryConnection {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            log: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Total number of ranges served so far.
    pub fn fetch_count(&self) -> usize {
        self.log().iter().map(Vec::len).sum()
    }

    /// The served calls, one entry per connection round-trip.
    pub fn fetch_log(&self) -> Vec<Vec<(u64, u64)>> {
        self.log().clone()
    }

    /// Make the next fetch call fail, for failure-path tests.
    pub fn fail_next_fetch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Vec<Vec<(u64, u64)>>> {
        self.log.lock().expect("fetch log poisoned")
    }

    fn take_failure(&self) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(FragError::Other(anyhow::anyhow!("injected fetch failure")));
        }
        Ok(())
    }

    fn serve(&self, lo: u64, hi: u64) -> Result<Bytes> {
        let extent = self.data.len() as u64;
        if lo > extent {
            return Err(FragError::OutOfRange {
                position: lo,
                extent,
            });
        }
        let hi = hi.min(extent).max(lo);
        Ok(self.data.slice(lo as usize..hi as usize))
    }
}

#[async_trait]
impl ResourceConnection for MemoryConnection {
    fn bytes(&self) -> u64 {
        self.data.len() as u64
    }

    async fn fetch(&self, lo: u64, hi: u64) -> Result<Bytes> {
        self.take_failure()?;
        self.log().push(vec![(lo, hi)]);
        self.serve(lo, hi)
    }

    async fn fetch_many(&self, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        self.take_failure()?;
        self.log().push(ranges.to_vec());
        ranges.iter().map(|&(lo, hi)| self.serve(lo, hi)).collect()
    }
}
