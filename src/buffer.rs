use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};

use crate::connection::ResourceConnection;
use crate::errors::{FragError, Result};
use crate::lock::AsyncLock;
use crate::view::AsyncView;

/// Footprint notification handler.
pub type NotifyFn = Box<dyn Fn(u64) + Send + Sync>;

type PendingNotify = (NotifyFn, u64);

/// Construction options for [`AsyncBuffer`]: an optional one-shot memory
/// footprint monitor.
#[derive(Default)]
pub struct BufferConfig {
    /// Cumulative cached-byte count at which `notify` fires (once).
    pub threshold: Option<u64>,
    pub notify: Option<NotifyFn>,
}

/// How many chunks were cleared and their cumulative size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearedReport {
    pub chunks: usize,
    pub footprint: u64,
}

/// A contiguous cached byte range.
struct Chunk {
    lo: u64,
    hi: u64,
    data: Bytes,
}

struct BufferState {
    /// Sorted ascending by `lo`, pairwise non-overlapping. Exactly-touching
    /// neighbors stay separate until a request spans the boundary.
    chunks: Vec<Chunk>,
    footprint: u64,
    threshold: Option<u64>,
    notify: Option<NotifyFn>,
}

struct BufferInner {
    connection: Arc<dyn ResourceConnection>,
    /// Serializes every mutation and fetch-triggering read; see `fill`.
    lock: AsyncLock,
    /// Never held across an await.
    state: Mutex<BufferState>,
}

/// Provides asynchronous random access to some resource. All fetched
/// fragments are cached in memory for later use; requests are satisfied from
/// cache wherever possible, with only the missing gaps fetched and merged
/// into neighboring chunks.
///
/// Handles are cheap to clone and share one cache.
#[derive(Clone)]
pub struct AsyncBuffer {
    inner: Arc<BufferInner>,
}

impl AsyncBuffer {
    pub fn new(connection: Arc<dyn ResourceConnection>, config: BufferConfig) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                connection,
                lock: AsyncLock::new(),
                state: Mutex::new(BufferState {
                    chunks: Vec::new(),
                    footprint: 0,
                    threshold: config.threshold,
                    notify: config.notify,
                }),
            }),
        }
    }

    /// Create a new (empty) buffer reusing this buffer's connection, for an
    /// independent read path that does not contend on this cache.
    pub fn fresh(&self) -> Self {
        Self::new(self.inner.connection.clone(), BufferConfig::default())
    }

    /// Total size of the underlying resource in bytes.
    pub fn bytes(&self) -> u64 {
        self.inner.connection.bytes()
    }

    /// Cumulative size of cached chunks in bytes.
    ///
    /// NOTE: this does not reflect total memory consumption of the cache
    /// since each chunk incurs additional overhead.
    pub fn footprint(&self) -> u64 {
        self.state().footprint
    }

    pub fn chunk_count(&self) -> usize {
        self.state().chunks.len()
    }

    /// The `(lo, hi)` spans of all cached chunks, ascending.
    pub fn chunk_spans(&self) -> Vec<(u64, u64)> {
        self.state().chunks.iter().map(|c| (c.lo, c.hi)).collect()
    }

    pub fn connection(&self) -> &Arc<dyn ResourceConnection> {
        &self.inner.connection
    }

    /// Install (or re-arm) the one-shot footprint monitor.
    pub fn set_monitor(&self, threshold: u64, notify: impl Fn(u64) + Send + Sync + 'static) {
        let mut state = self.state();
        state.threshold = Some(threshold);
        state.notify = Some(Box::new(notify));
    }

    /// Create a new [`AsyncView`] on a specific portion of the buffer;
    /// `None` length spans to the end of the resource.
    pub fn view(&self, start: u64, length: Option<u64>) -> AsyncView {
        AsyncView::new(self.clone(), start, length)
    }

    /// The number of contiguous cached bytes starting at the given position
    /// (0 if the position is uncached). Read-only.
    pub fn cached(&self, position: u64) -> u64 {
        let state = self.state();
        let chunks = &state.chunks;
        let mut lo = 0;
        let mut hi = chunks.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let chunk = &chunks[mid];
            if position >= chunk.hi {
                lo = mid + 1;
            } else if position < chunk.lo {
                hi = mid;
            } else {
                return chunk.hi - position;
            }
        }
        0
    }

    /// Drop all cached chunks.
    pub async fn clear(&self) -> ClearedReport {
        let _guard = self.inner.lock.acquire().await;
        let mut state = self.state();
        let report = ClearedReport {
            chunks: state.chunks.len(),
            footprint: state.footprint,
        };
        state.chunks.clear();
        state.footprint = 0;
        log::debug!(
            "buffer: cleared {} chunk(s) spanning {} byte(s)",
            report.chunks,
            report.footprint
        );
        report
    }

    /// Extract the byte range `[ask_lo, ask_hi)` from the resource, using
    /// cache when available and fetching missing gaps when necessary.
    ///
    /// `ask_hi` is clamped to the resource size. The returned [`Bytes`] is a
    /// zero-copy window over the cached chunk.
    pub async fn slice(&self, ask_lo: u64, ask_hi: u64) -> Result<Bytes> {
        let guard = self.inner.lock.acquire().await;
        let mut pending = None;
        let result = {
            let source = FetchSource::Connection(&self.inner.connection);
            self.fill(ask_lo, ask_hi, &source, &mut pending).await
        };
        drop(guard);
        if let Some((notify, footprint)) = pending {
            notify(footprint);
        }
        result
    }

    /// Extract multiple byte ranges, pooling every missing gap across all
    /// ranges into a single batched connection request. Results correspond
    /// to `ranges` in order.
    pub async fn slices(&self, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        let guard = self.inner.lock.acquire().await;
        let total = self.inner.connection.bytes();

        // Plan all gaps in request order against a grow-only coverage model
        // so each byte is fetched at most once.
        let fetches = {
            let state = self.state();
            let mut coverage = Coverage::from_chunks(&state.chunks);
            let mut fetches = Vec::new();
            for &(lo, hi) in ranges {
                if lo >= total {
                    return Err(FragError::OutOfRange {
                        position: lo,
                        extent: total,
                    });
                }
                let hi = hi.min(total);
                for (gap_lo, gap_hi) in coverage.gaps(lo, hi) {
                    coverage.add(gap_lo, gap_hi);
                    fetches.push((gap_lo, gap_hi));
                }
            }
            fetches
        };

        let mut stash = GapStash::default();
        if !fetches.is_empty() {
            log::trace!(
                "buffer: batching {} gap fetch(es) for {} range(s)",
                fetches.len(),
                ranges.len()
            );
            let fetched = self.inner.connection.fetch_many(&fetches).await?;
            for (&(lo, _), data) in fetches.iter().zip(fetched) {
                stash.insert(lo, data);
            }
        }

        let mut pending = None;
        let mut out = Vec::with_capacity(ranges.len());
        {
            let source = FetchSource::Stash(&stash);
            for &(lo, hi) in ranges {
                out.push(self.fill(lo, hi, &source, &mut pending).await?);
            }
        }
        drop(guard);
        if let Some((notify, footprint)) = pending {
            notify(footprint);
        }
        Ok(out)
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.inner.state.lock().expect("buffer state poisoned")
    }

    // Core fill: locate overlap, compute gaps, fetch them, merge into one
    // chunk and splice it into the sorted list. The caller holds the async
    // lock, so plan indices stay valid across the fetch await.
    async fn fill(
        &self,
        ask_lo: u64,
        ask_hi: u64,
        source: &FetchSource<'_>,
        pending: &mut Option<PendingNotify>,
    ) -> Result<Bytes> {
        let total = self.inner.connection.bytes();
        if ask_lo >= total {
            return Err(FragError::OutOfRange {
                position: ask_lo,
                extent: total,
            });
        }
        let ask_hi = ask_hi.min(total);
        if ask_hi <= ask_lo {
            return Ok(Bytes::new());
        }

        let plan = {
            let state = self.state();
            match plan_fill(&state.chunks, ask_lo, ask_hi) {
                Located::Cached(data) => return Ok(data),
                Located::Plan(plan) => plan,
            }
        };

        let fetched = if plan.gaps.is_empty() {
            Vec::new()
        } else {
            log::trace!(
                "buffer: slice [{}, {}) fetching {} gap(s)",
                ask_lo,
                ask_hi,
                plan.gaps.len()
            );
            source.fetch_many(&plan.gaps).await?
        };

        let mut state = self.state();
        let mut merged = BytesMut::with_capacity((plan.merge_hi - plan.merge_lo) as usize);
        let mut added = 0u64;
        {
            // In-order walk over retained chunks and fetched gaps; together
            // they tile [merge_lo, merge_hi) exactly.
            let chunks = &state.chunks;
            let mut ci = plan.splice_lo;
            let mut gi = 0;
            while ci < plan.splice_hi || gi < plan.gaps.len() {
                let chunk_next = ci < plan.splice_hi
                    && (gi >= plan.gaps.len() || chunks[ci].lo < plan.gaps[gi].0);
                if chunk_next {
                    merged.extend_from_slice(&chunks[ci].data);
                    ci += 1;
                } else {
                    debug_assert_eq!(
                        fetched[gi].len() as u64,
                        plan.gaps[gi].1 - plan.gaps[gi].0
                    );
                    merged.extend_from_slice(&fetched[gi]);
                    added += fetched[gi].len() as u64;
                    gi += 1;
                }
            }
        }

        let data = merged.freeze();
        let out = data.slice((ask_lo - plan.merge_lo) as usize..(ask_hi - plan.merge_lo) as usize);
        state.chunks.splice(
            plan.splice_lo..plan.splice_hi,
            std::iter::once(Chunk {
                lo: plan.merge_lo,
                hi: plan.merge_hi,
                data,
            }),
        );
        state.footprint += added;

        if let Some(threshold) = state.threshold {
            if state.footprint >= threshold {
                state.threshold = None;
                if let Some(notify) = state.notify.take() {
                    log::debug!(
                        "buffer: footprint {} reached threshold {}",
                        state.footprint,
                        threshold
                    );
                    *pending = Some((notify, state.footprint));
                }
            }
        }

        Ok(out)
    }
}

enum Located {
    /// Fully satisfied by an existing chunk: zero-copy sub-slice.
    Cached(Bytes),
    Plan(FillPlan),
}

struct FillPlan {
    /// Non-empty byte spans to fetch, ascending.
    gaps: Vec<(u64, u64)>,
    /// Chunk index range replaced by the merged chunk.
    splice_lo: usize,
    splice_hi: usize,
    /// Byte bounds of the merged chunk.
    merge_lo: u64,
    merge_hi: u64,
}

fn plan_fill(chunks: &[Chunk], ask_lo: u64, ask_hi: u64) -> Located {
    let mut lo_idx = 0;
    let mut hi_idx = chunks.len();
    let mut merge_left = false;
    let mut fetch_lo = ask_lo;

    while lo_idx < hi_idx {
        let mid = (lo_idx + hi_idx) / 2;
        let chunk = &chunks[mid];
        if ask_lo >= chunk.hi {
            lo_idx = mid + 1;
        } else if ask_lo < chunk.lo {
            hi_idx = mid;
        } else if ask_hi <= chunk.hi {
            // target completely within this chunk
            return Located::Cached(
                chunk
                    .data
                    .slice((ask_lo - chunk.lo) as usize..(ask_hi - chunk.lo) as usize),
            );
        } else {
            // target partially overlaps this chunk; absorb it to the left
            hi_idx = mid + 1;
            fetch_lo = chunk.hi;
            merge_left = true;
            break;
        }
    }

    // perfect snap fit against the preceding chunk also merges left
    if !merge_left && hi_idx > 0 && chunks[hi_idx - 1].hi == fetch_lo {
        merge_left = true;
    }
    let splice_lo = if merge_left { hi_idx - 1 } else { hi_idx };

    // scan rightward collecting gap ranges until the cursor reaches the ask
    // end; chunks touched or overlapped on the way are absorbed
    let mut gaps = Vec::new();
    let mut cursor = fetch_lo;
    let mut merge_right = false;
    let mut scan = hi_idx;
    while scan < chunks.len() {
        let (chunk_lo, chunk_hi) = (chunks[scan].lo, chunks[scan].hi);
        if chunk_lo > ask_hi {
            break;
        }
        if cursor < chunk_lo {
            gaps.push((cursor, chunk_lo));
        }
        scan += 1;
        cursor = chunk_hi;
        if chunk_hi >= ask_hi {
            merge_right = true;
            break;
        }
    }
    if !merge_right && cursor < ask_hi {
        gaps.push((cursor, ask_hi));
    }

    let merge_lo = if merge_left {
        chunks[splice_lo].lo
    } else {
        ask_lo
    };
    let merge_hi = if merge_right {
        chunks[scan - 1].hi
    } else {
        ask_hi
    };

    Located::Plan(FillPlan {
        gaps,
        splice_lo,
        splice_hi: scan,
        merge_lo,
        merge_hi,
    })
}

enum FetchSource<'a> {
    Connection(&'a Arc<dyn ResourceConnection>),
    /// Pre-fetched gap bytes for a batched `slices` call.
    Stash(&'a GapStash),
}

impl FetchSource<'_> {
    async fn fetch_many(&self, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        match self {
            FetchSource::Connection(connection) => connection.fetch_many(ranges).await,
            FetchSource::Stash(stash) => ranges.iter().map(|&(lo, hi)| stash.serve(lo, hi)).collect(),
        }
    }
}

/// Sorted disjoint interval set used to plan batched fetches.
struct Coverage {
    spans: Vec<(u64, u64)>,
}

impl Coverage {
    fn from_chunks(chunks: &[Chunk]) -> Self {
        let mut spans: Vec<(u64, u64)> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match spans.last_mut() {
                Some(last) if chunk.lo <= last.1 => last.1 = last.1.max(chunk.hi),
                _ => spans.push((chunk.lo, chunk.hi)),
            }
        }
        Self { spans }
    }

    /// The sub-ranges of `[lo, hi)` not covered by any span.
    fn gaps(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut cursor = lo;
        let start = self.spans.partition_point(|&(_, span_hi)| span_hi <= lo);
        for &(span_lo, span_hi) in &self.spans[start..] {
            if span_lo >= hi {
                break;
            }
            if cursor < span_lo {
                out.push((cursor, span_lo));
            }
            cursor = cursor.max(span_hi);
            if cursor >= hi {
                break;
            }
        }
        if cursor < hi {
            out.push((cursor, hi));
        }
        out
    }

    fn add(&mut self, lo: u64, hi: u64) {
        let at = self.spans.partition_point(|&(span_lo, _)| span_lo < lo);
        self.spans.insert(at, (lo, hi));
        // added spans come from gaps() and never overlap existing ones, so
        // only touching neighbors need merging
        if at + 1 < self.spans.len() && self.spans[at].1 >= self.spans[at + 1].0 {
            self.spans[at].1 = self.spans[at + 1].1;
            self.spans.remove(at + 1);
        }
        if at > 0 && self.spans[at - 1].1 >= self.spans[at].0 {
            self.spans[at - 1].1 = self.spans[at].1;
            self.spans.remove(at);
        }
    }
}

/// Fetched gap bytes keyed by position, serving arbitrary sub-ranges.
#[derive(Default)]
struct GapStash {
    segments: Vec<(u64, Bytes)>,
}

impl GapStash {
    fn insert(&mut self, lo: u64, data: Bytes) {
        let at = self.segments.partition_point(|&(seg_lo, _)| seg_lo < lo);
        self.segments.insert(at, (lo, data));
    }

    fn serve(&self, lo: u64, hi: u64) -> Result<Bytes> {
        let mut pieces: Vec<Bytes> = Vec::new();
        let mut cursor = lo;
        let start = self
            .segments
            .partition_point(|(seg_lo, data)| seg_lo + data.len() as u64 <= lo);
        for (seg_lo, data) in &self.segments[start..] {
            if cursor >= hi || *seg_lo > cursor {
                break;
            }
            let seg_hi = *seg_lo + data.len() as u64;
            pieces.push(data.slice((cursor - seg_lo) as usize..(hi.min(seg_hi) - seg_lo) as usize));
            cursor = hi.min(seg_hi);
        }
        if cursor < hi {
            return Err(FragError::InvalidState(format!(
                "batched fetch stash is missing bytes [{cursor}, {hi})"
            )));
        }
        if pieces.len() == 1 {
            return Ok(pieces.remove(0));
        }
        let mut out = BytesMut::with_capacity((hi - lo) as usize);
        for piece in &pieces {
            out.extend_from_slice(piece);
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::{AsyncBuffer, BufferConfig};
    use crate::connection::MemoryConnection;
    use crate::errors::FragError;

    fn buffer_over(data: Vec<u8>) -> (AsyncBuffer, Arc<MemoryConnection>) {
        let connection = Arc::new(MemoryConnection::new(data));
        let buffer = AsyncBuffer::new(connection.clone(), BufferConfig::default());
        (buffer, connection)
    }

    fn assert_sorted_non_overlapping(buffer: &AsyncBuffer) {
        let spans = buffer.chunk_spans();
        for pair in spans.windows(2) {
            assert!(
                pair[0].1 <= pair[1].0,
                "chunks overlap or are unsorted: {spans:?}"
            );
        }
    }

    #[tokio::test]
    async fn gap_fill_merges_into_one_chunk() {
        let mut data = vec![0u8; 1000];
        data[500] = 0xff;
        let (buffer, connection) = buffer_over(data);

        assert_eq!(buffer.slice(0, 100).await.unwrap().len(), 100);
        assert_eq!(buffer.slice(600, 700).await.unwrap().len(), 100);
        assert_eq!(buffer.chunk_count(), 2);
        assert_sorted_non_overlapping(&buffer);

        let calls_before = connection.fetch_log();
        let merged = buffer.slice(50, 650).await.unwrap();
        assert_eq!(merged.len(), 600);
        assert_eq!(merged[450], 0xff);

        // only the gap between the cached chunks was fetched
        let calls: Vec<_> = connection.fetch_log()[calls_before.len()..].to_vec();
        assert_eq!(calls, vec![vec![(100, 600)]]);
        assert_eq!(buffer.chunk_count(), 1);
        assert_eq!(buffer.chunk_spans(), vec![(0, 700)]);
        assert_eq!(buffer.footprint(), 700);
    }

    #[tokio::test]
    async fn fully_cached_reads_are_idempotent_and_fetch_free() {
        let data: Vec<u8> = (0..=255).cycle().take(4096).map(|b| b as u8).collect();
        let (buffer, connection) = buffer_over(data.clone());

        let first = buffer.slice(100, 300).await.unwrap();
        let fetches = connection.fetch_count();
        let second = buffer.slice(100, 300).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(connection.fetch_count(), fetches);
        assert_eq!(&first[..], &data[100..300]);

        // interior sub-range is also served without fetching
        let interior = buffer.slice(150, 250).await.unwrap();
        assert_eq!(connection.fetch_count(), fetches);
        assert_eq!(&interior[..], &data[150..250]);
    }

    #[tokio::test]
    async fn zero_length_requests_never_fetch() {
        let (buffer, connection) = buffer_over(vec![7u8; 64]);
        let empty = buffer.slice(10, 10).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(connection.fetch_count(), 0);
    }

    #[tokio::test]
    async fn ask_past_end_is_out_of_range() {
        let (buffer, _connection) = buffer_over(vec![0u8; 16]);
        match buffer.slice(16, 20).await {
            Err(FragError::OutOfRange { position, extent }) => {
                assert_eq!((position, extent), (16, 16));
            }
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hi_is_clamped_to_resource_size() {
        let (buffer, _connection) = buffer_over((0u8..64).collect());
        let tail = buffer.slice(48, 1024).await.unwrap();
        assert_eq!(tail.len(), 16);
        assert_eq!(tail[0], 48);
    }

    #[tokio::test]
    async fn snap_fit_merges_touching_chunks() {
        let (buffer, _connection) = buffer_over((0u8..=255).collect());
        buffer.slice(0, 64).await.unwrap();
        buffer.slice(64, 128).await.unwrap();
        assert_eq!(buffer.chunk_count(), 2);

        // spans the exact boundary: no new bytes right of 128 are needed
        let merged = buffer.slice(32, 128).await.unwrap();
        assert_eq!(&merged[..], &(32u8..128).collect::<Vec<_>>()[..]);
        assert_eq!(buffer.chunk_spans(), vec![(0, 128)]);
        assert_sorted_non_overlapping(&buffer);
    }

    #[tokio::test]
    async fn wedge_between_chunks_combines_three_pieces() {
        let (buffer, connection) = buffer_over((0..512).map(|i| (i % 251) as u8).collect());
        buffer.slice(0, 100).await.unwrap();
        buffer.slice(200, 300).await.unwrap();

        let calls_before = connection.fetch_log().len();
        let wedge = buffer.slice(100, 200).await.unwrap();
        assert_eq!(wedge.len(), 100);
        assert_eq!(buffer.chunk_spans(), vec![(0, 300)]);
        assert_eq!(connection.fetch_log().len(), calls_before + 1);
        assert_sorted_non_overlapping(&buffer);
    }

    #[tokio::test]
    async fn tail_extension_past_last_chunk_returns_full_range() {
        let expected: Vec<u8> = (0..1024).map(|i| (i * 7 % 256) as u8).collect();
        let (buffer, _connection) = buffer_over(expected.clone());
        buffer.slice(0, 100).await.unwrap();
        buffer.slice(200, 300).await.unwrap();

        // extends beyond the last cached chunk; the tail gap must be fetched
        let wide = buffer.slice(50, 900).await.unwrap();
        assert_eq!(wide.len(), 850);
        assert_eq!(&wide[..], &expected[50..900]);
        assert_eq!(buffer.chunk_spans(), vec![(0, 900)]);
    }

    #[tokio::test]
    async fn footprint_never_exceeds_resource_size() {
        let (buffer, _connection) = buffer_over(vec![1u8; 300]);
        for (lo, hi) in [(0, 120), (60, 180), (100, 300), (0, 300), (20, 280)] {
            buffer.slice(lo, hi).await.unwrap();
            assert!(buffer.footprint() <= 300);
            assert_sorted_non_overlapping(&buffer);
        }
        assert_eq!(buffer.footprint(), 300);
    }

    #[tokio::test]
    async fn clear_drops_chunks_and_resets_footprint() {
        let (buffer, connection) = buffer_over(vec![9u8; 128]);
        buffer.slice(0, 50).await.unwrap();
        buffer.slice(100, 128).await.unwrap();

        let report = buffer.clear().await;
        assert_eq!(report.chunks, 2);
        assert_eq!(report.footprint, 78);
        assert_eq!(buffer.footprint(), 0);
        assert_eq!(buffer.chunk_count(), 0);

        // cache rebuilds from scratch afterwards
        let fetches = connection.fetch_count();
        buffer.slice(0, 50).await.unwrap();
        assert!(connection.fetch_count() > fetches);
    }

    #[tokio::test]
    async fn threshold_notifies_exactly_once() {
        let fired = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(AtomicU64::new(0));
        let connection = Arc::new(MemoryConnection::new(vec![0u8; 4096]));
        let buffer = AsyncBuffer::new(
            connection,
            BufferConfig {
                threshold: Some(1000),
                notify: Some(Box::new({
                    let fired = fired.clone();
                    let seen = seen.clone();
                    move |footprint| {
                        fired.fetch_add(1, Ordering::SeqCst);
                        seen.store(footprint, Ordering::SeqCst);
                    }
                })),
            },
        );

        buffer.slice(0, 512).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        buffer.slice(512, 1024).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1024);

        buffer.slice(2000, 3000).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn monitor_can_be_rearmed_manually() {
        let fired = Arc::new(AtomicU64::new(0));
        let (buffer, _connection) = buffer_over(vec![0u8; 4096]);
        buffer.set_monitor(100, {
            let fired = fired.clone();
            move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        buffer.slice(0, 256).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        buffer.set_monitor(512, {
            let fired = fired.clone();
            move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        buffer.slice(256, 1024).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_reports_contiguous_run() {
        let (buffer, _connection) = buffer_over(vec![0u8; 256]);
        buffer.slice(16, 48).await.unwrap();
        assert_eq!(buffer.cached(0), 0);
        assert_eq!(buffer.cached(16), 32);
        assert_eq!(buffer.cached(40), 8);
        assert_eq!(buffer.cached(48), 0);
    }

    #[tokio::test]
    async fn slices_batches_all_gaps_into_one_request() {
        let expected: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        let (buffer, connection) = buffer_over(expected.clone());
        buffer.slice(100, 200).await.unwrap();

        let calls_before = connection.fetch_log().len();
        let parts = buffer
            .slices(&[(0, 150), (180, 400), (1000, 1100)])
            .await
            .unwrap();
        // one batched connection call for all three ranges
        assert_eq!(connection.fetch_log().len(), calls_before + 1);

        assert_eq!(&parts[0][..], &expected[0..150]);
        assert_eq!(&parts[1][..], &expected[180..400]);
        assert_eq!(&parts[2][..], &expected[1000..1100]);
        assert_sorted_non_overlapping(&buffer);

        // everything the ranges covered is now cached
        let fetches = connection.fetch_count();
        buffer.slice(0, 400).await.unwrap();
        buffer.slice(1000, 1100).await.unwrap();
        assert_eq!(connection.fetch_count(), fetches);
    }

    #[tokio::test]
    async fn slices_handles_overlapping_requests() {
        let expected: Vec<u8> = (0..512).map(|i| (i * 3 % 256) as u8).collect();
        let (buffer, _connection) = buffer_over(expected.clone());
        let parts = buffer
            .slices(&[(0, 100), (50, 150), (140, 160), (0, 512)])
            .await
            .unwrap();
        assert_eq!(&parts[0][..], &expected[0..100]);
        assert_eq!(&parts[1][..], &expected[50..150]);
        assert_eq!(&parts[2][..], &expected[140..160]);
        assert_eq!(&parts[3][..], &expected[..]);
        assert_eq!(buffer.footprint(), 512);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cache_unchanged() {
        let (buffer, connection) = buffer_over(vec![0u8; 100]);
        buffer.slice(0, 10).await.unwrap();
        let spans = buffer.chunk_spans();
        let footprint = buffer.footprint();

        connection.fail_next_fetch();
        assert!(buffer.slice(5, 50).await.is_err());
        assert_eq!(buffer.chunk_spans(), spans);
        assert_eq!(buffer.footprint(), footprint);

        // the next attempt succeeds and the cache recovers
        let data = buffer.slice(5, 50).await.unwrap();
        assert_eq!(data.len(), 45);
    }

    #[tokio::test]
    async fn fresh_shares_connection_but_not_chunks() {
        let (buffer, connection) = buffer_over(vec![3u8; 64]);
        buffer.slice(0, 32).await.unwrap();

        let other = buffer.fresh();
        assert_eq!(other.chunk_count(), 0);
        let fetches = connection.fetch_count();
        other.slice(0, 32).await.unwrap();
        assert!(connection.fetch_count() > fetches);
        assert_eq!(buffer.chunk_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_serialize_on_one_cache() {
        let (buffer, _connection) = buffer_over((0..4096).map(|i| (i % 256) as u8).collect());
        let mut tasks = Vec::new();
        for i in 0..8u64 {
            let buffer = buffer.clone();
            tasks.push(tokio::spawn(async move {
                let lo = i * 256;
                let data = buffer.slice(lo, lo + 512).await.unwrap();
                (lo, data)
            }));
        }
        for task in tasks {
            let (lo, data) = task.await.unwrap();
            for (offset, byte) in data.iter().enumerate() {
                assert_eq!(*byte, ((lo + offset as u64) % 256) as u8);
            }
        }
        assert_sorted_non_overlapping(&buffer);
        assert!(buffer.footprint() <= 4096);
    }
}
