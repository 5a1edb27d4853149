use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{select_ok, BoxFuture};

use crate::errors::{FragError, Result};

use super::ResourceConnection;

/// Future resolving to an initialized connection, as raced by
/// [`AutoConnection::first_ready`].
pub type ConnectionFuture = BoxFuture<'static, Result<Arc<dyn ResourceConnection>>>;

/// A composite connection that races several candidates and delegates every
/// call to whichever initialized first. Candidates still pending when one
/// wins are dropped.
pub struct AutoConnection {
    inner: Arc<dyn ResourceConnection>,
}

impl AutoConnection {
    pub async fn first_ready(candidates: Vec<ConnectionFuture>) -> Result<Self> {
        if candidates.is_empty() {
            return Err(FragError::InvalidState(
                "no candidate connections to select from".to_owned(),
            ));
        }
        let (inner, _pending) = select_ok(candidates).await?;
        Ok(Self { inner })
    }

    pub fn from_connection(inner: Arc<dyn ResourceConnection>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ResourceConnection for AutoConnection {
    fn bytes(&self) -> u64 {
        self.inner.bytes()
    }

    async fn fetch(&self, lo: u64, hi: u64) -> Result<Bytes> {
        self.inner.fetch(lo, hi).await
    }

    async fn fetch_many(&self, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        self.inner.fetch_many(ranges).await
    }
}
