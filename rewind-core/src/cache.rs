use std::{
    collections::VecDeque,
    io::Read,
    ops::Range,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    buffer::BlockBuffer,
    error::Error,
    fetch::{RangeFetcher, RemoteInfo},
    ranges::ByteRanges,
};

/// How much of a stream we copy into the buffer per iteration of the
/// download loop.
const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Pause between attempts while recovering with a reconnect callback, so a
/// dead server does not spin the loop.
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct CacheConfig {
    /// Upper bound on cached bytes; also the largest allowed single read.
    pub budget: u64,
    pub block_size: u64,
    /// A connection positioned at most this far before a request is kept
    /// instead of replaced.
    pub close_enough: u64,
    /// Two stream errors within this window latch the cache closed when no
    /// reconnect callback is configured.
    pub hard_failure_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget: 200 * 1024 * 1024,
            block_size: 100 * 1024 * 1024,
            close_enough: 5 * 1024 * 1024,
            hard_failure_window: Duration::from_millis(100),
        }
    }
}

/// Called with `true` when the download starts failing and recovery is being
/// attempted, and with `false` once data flows again.
pub type ReconnectCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Random-access `read(offset, length)` view of a remote file, backed by a
/// bounded [`BlockBuffer`] and at most one long-running download stream.
///
/// Readers block until their range is downloaded.  The download worker owns
/// the stream and decides, through [`connection_plan`], whether the current
/// stream will satisfy the head of the pending-read queue soon enough or
/// whether to replace it.
pub struct RemoteFileCache {
    config: CacheConfig,
    shared: Arc<Shared>,
    fetcher: Mutex<Option<Box<dyn RangeFetcher>>>,
    reconnect: Mutex<Option<ReconnectCallback>>,
    info: Mutex<Option<RemoteInfo>>,
    open_lock: Mutex<()>,
}

struct Shared {
    state: Mutex<CacheState>,
    // Wakes the download worker when the queue or the buffer changes.
    worker_wake: Condvar,
    // Wakes blocked readers when data lands or the cache latches closed.
    data_ready: Condvar,
}

#[derive(Default)]
struct CacheState {
    file_size: Option<u64>,
    buffer: Option<BlockBuffer>,
    pending: VecDeque<PendingRead>,
    next_read_id: u64,
    // Remaining span of the in-flight download stream.  `start` advances as
    // bytes arrive.  Present iff the worker holds a live stream.
    connection: Option<Range<u64>>,
    last_resolved_end: Option<u64>,
    last_error_at: Option<Instant>,
    reconnecting: bool,
    closed: bool,
    failure: Option<String>,
}

struct PendingRead {
    id: u64,
    range: Range<u64>,
}

impl RemoteFileCache {
    pub fn new(fetcher: Box<dyn RangeFetcher>, config: CacheConfig) -> RemoteFileCache {
        RemoteFileCache {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState::default()),
                worker_wake: Condvar::new(),
                data_ready: Condvar::new(),
            }),
            fetcher: Mutex::new(Some(fetcher)),
            reconnect: Mutex::new(None),
            info: Mutex::new(None),
            open_lock: Mutex::new(()),
        }
    }

    /// Registers the reconnect callback.  Must happen before `open`, the
    /// download worker takes it along.
    pub fn set_reconnect_callback(&self, callback: ReconnectCallback) {
        *self.reconnect.lock() = Some(callback);
    }

    /// Opens the remote file and starts the download worker.  Idempotent; a
    /// failed open leaves the cache unopened and retryable.
    pub fn open(&self) -> Result<RemoteInfo, Error> {
        let _guard = self.open_lock.lock();
        {
            let state = self.shared.state.lock();
            if state.closed {
                return Err(closed_error(&state));
            }
            if state.file_size.is_some() {
                return Ok(self.info.lock().clone().expect("info set when open"));
            }
        }

        let mut fetcher = self.fetcher.lock().take().ok_or(Error::NotOpen)?;
        let info = match fetcher.open() {
            Ok(info) => info,
            Err(err) => {
                *self.fetcher.lock() = Some(fetcher);
                return Err(err);
            }
        };

        // Small files live in one slab and are never evicted.  Larger ones
        // get the budgeted block count, plus two so a read straddling the
        // last cached block cannot evict a block the same read still needs.
        let buffer = if info.size <= self.config.budget {
            BlockBuffer::contiguous(info.size)
        } else {
            let blocks = self.config.budget.div_ceil(self.config.block_size) as usize + 2;
            BlockBuffer::blocked(info.size, self.config.block_size, blocks)
        };

        {
            let mut state = self.shared.state.lock();
            state.file_size = Some(info.size);
            state.buffer = Some(buffer);
        }
        *self.info.lock() = Some(info.clone());

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let reconnect = self.reconnect.lock().take();
        thread::Builder::new()
            .name("cache-download".into())
            .spawn(move || download_loop(shared, config, fetcher, reconnect))?;

        Ok(info)
    }

    pub fn size(&self) -> Result<u64, Error> {
        self.shared.state.lock().file_size.ok_or(Error::NotOpen)
    }

    /// Byte ranges currently resident in the buffer.
    pub fn loaded_ranges(&self) -> Vec<Range<u64>> {
        let state = self.shared.state.lock();
        state
            .buffer
            .as_ref()
            .map(|b| b.filled().to_vec())
            .unwrap_or_default()
    }

    /// Reads `length` bytes at `offset`, blocking until the range has been
    /// downloaded or the cache closes.
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(closed_error(&state));
        }
        let size = state.file_size.ok_or(Error::NotOpen)?;
        if length == 0 {
            return Ok(Vec::new());
        }
        if length > self.config.budget {
            return Err(Error::InvalidArg(format!(
                "read of {} bytes exceeds cache budget of {}",
                length, self.config.budget
            )));
        }
        let end = offset
            .checked_add(length)
            .ok_or_else(|| Error::InvalidArg("read range overflows".into()))?;
        if end > size {
            return Err(Error::InvalidArg(format!(
                "read {}..{} is past the end of the file at {}",
                offset, end, size
            )));
        }
        let range = offset..end;

        if let Some(data) = try_resolve(&mut state, &range) {
            return Ok(data);
        }

        let id = state.next_read_id;
        state.next_read_id += 1;
        state.pending.push_back(PendingRead {
            id,
            range: range.clone(),
        });
        self.shared.worker_wake.notify_all();

        loop {
            self.shared.data_ready.wait(&mut state);
            if state.closed {
                state.pending.retain(|p| p.id != id);
                return Err(closed_error(&state));
            }
            if let Some(data) = try_resolve(&mut state, &range) {
                state.pending.retain(|p| p.id != id);
                // The head of the queue may have changed, let the worker
                // re-evaluate the connection.
                self.shared.worker_wake.notify_all();
                return Ok(data);
            }
        }
    }

    /// Closes the cache, rejecting blocked and future reads and releasing
    /// the buffer.  The download worker exits at its next step.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.buffer = None;
        state.connection = None;
        self.shared.worker_wake.notify_all();
        self.shared.data_ready.notify_all();
    }
}

impl Drop for RemoteFileCache {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error(state: &CacheState) -> Error {
    match &state.failure {
        Some(msg) => Error::NetworkFatal(msg.clone()),
        None => Error::Closed,
    }
}

/// Slices `range` out of the buffer if it is fully downloaded, recording the
/// resolved end for the sequential-read heuristic.
fn try_resolve(state: &mut CacheState, range: &Range<u64>) -> Option<Vec<u8>> {
    let data = {
        let buffer = state.buffer.as_ref()?;
        if !buffer.has(range) {
            return None;
        }
        buffer.slice(range).into_owned()
    };
    state.last_resolved_end = Some(range.end);
    Some(data)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionPlan {
    /// Nothing to transfer.
    Idle,
    /// The current stream will cover the request soon enough, keep it.
    Keep,
    /// Replace the stream with one over this range.
    Open(Range<u64>),
}

/// The connection decision.  `connection` is the remaining span of the
/// current stream, `request` the head of the pending-read queue, `have` the
/// downloaded ranges.
fn connection_plan(
    connection: Option<&Range<u64>>,
    request: Option<&Range<u64>>,
    have: &ByteRanges,
    last_resolved_end: Option<u64>,
    budget: u64,
    file_size: u64,
    close_enough: u64,
) -> ConnectionPlan {
    let streaming = connection.is_some();
    let keep_or_idle = if streaming {
        ConnectionPlan::Keep
    } else {
        ConnectionPlan::Idle
    };

    let Some(request) = request else {
        // Nothing is waiting; an existing stream may keep prefetching its
        // span.
        return keep_or_idle;
    };
    let Some(missing) = have.first_missing_in(request) else {
        // Fully downloaded; the cache-hit pass will resolve it.
        return keep_or_idle;
    };

    if let Some(current) = connection {
        let alive = current.start < current.end && current.end > missing.start;
        let in_missing = current.start >= missing.start && current.start < missing.end;
        let close_before =
            current.start <= missing.start && missing.start - current.start <= close_enough;
        if alive && (in_missing || close_before) {
            // Sequential delivery will reach the request shortly.
            return ConnectionPlan::Keep;
        }
    }

    // Reading right where the previous read ended suggests a forward scan;
    // extend the stream toward the end of the file as readahead.
    let sequential = last_resolved_end
        .map(|lre| request.start >= lre && request.start - lre <= close_enough)
        .unwrap_or(false);

    let mut end = if sequential { file_size } else { request.end };
    if let Some(next_have) = have.next_start_at_or_after(missing.start) {
        end = end.min(next_have);
    }
    end = end.min(missing.start + budget).min(file_size);
    ConnectionPlan::Open(missing.start..end)
}

fn download_loop(
    shared: Arc<Shared>,
    config: CacheConfig,
    mut fetcher: Box<dyn RangeFetcher>,
    reconnect: Option<ReconnectCallback>,
) {
    let mut stream: Option<Box<dyn Read + Send>> = None;
    let mut chunk = vec![0u8; DOWNLOAD_CHUNK];

    loop {
        // Decide what the connection should be doing.
        let open_range = {
            let mut state = shared.state.lock();
            loop {
                if state.closed {
                    return;
                }
                let file_size = state.file_size.unwrap_or(0);
                let plan = match state.buffer.as_ref() {
                    Some(buffer) => connection_plan(
                        state.connection.as_ref(),
                        state.pending.front().map(|p| &p.range),
                        buffer.filled(),
                        state.last_resolved_end,
                        config.budget,
                        file_size,
                        config.close_enough,
                    ),
                    None => ConnectionPlan::Idle,
                };
                match plan {
                    ConnectionPlan::Open(range) => {
                        state.connection = Some(range.clone());
                        break Some(range);
                    }
                    ConnectionPlan::Keep if stream.is_some() => break None,
                    ConnectionPlan::Keep | ConnectionPlan::Idle => {
                        state.connection = None;
                        stream = None;
                        shared.worker_wake.wait(&mut state);
                    }
                }
            }
        };

        if let Some(range) = open_range {
            stream = None;
            log::trace!("downloading {}..{}", range.start, range.end);
            match fetcher.fetch(range.start, range.end - range.start) {
                Ok(body) => stream = Some(body),
                Err(err) => {
                    if !handle_stream_error(&shared, &config, &reconnect, err.to_string()) {
                        return;
                    }
                    continue;
                }
            }
        }

        let Some(body) = stream.as_mut() else {
            continue;
        };
        match body.read(&mut chunk) {
            Ok(0) => {
                let premature = {
                    let mut state = shared.state.lock();
                    let premature = state
                        .connection
                        .as_ref()
                        .map(|c| c.start < c.end)
                        .unwrap_or(false);
                    state.connection = None;
                    premature
                };
                stream = None;
                if premature
                    && !handle_stream_error(
                        &shared,
                        &config,
                        &reconnect,
                        "stream ended before the requested range".into(),
                    )
                {
                    return;
                }
            }
            Ok(n) => {
                let recovered;
                {
                    let mut state = shared.state.lock();
                    if state.closed {
                        return;
                    }
                    let Some(conn) = state.connection.clone() else {
                        stream = None;
                        continue;
                    };
                    let take = (n as u64).min(conn.end - conn.start) as usize;
                    if let Some(buffer) = state.buffer.as_mut() {
                        buffer.write(&chunk[..take], conn.start);
                    }
                    let advanced = conn.start + take as u64;
                    state.connection = Some(advanced..conn.end);
                    state.last_error_at = None;
                    recovered = state.reconnecting;
                    state.reconnecting = false;

                    // Stop streaming once the head of the queue is satisfied
                    // or the span is exhausted.
                    let head_covered = match (state.pending.front(), state.buffer.as_ref()) {
                        (Some(head), Some(buffer)) => buffer.has(&head.range),
                        _ => false,
                    };
                    if advanced >= conn.end || head_covered {
                        state.connection = None;
                        stream = None;
                    }
                }
                // Signal recovery before waking readers, so an observer that
                // saw a read complete has also seen the recovery.
                if recovered {
                    if let Some(callback) = &reconnect {
                        callback(false);
                    }
                }
                shared.data_ready.notify_all();
            }
            Err(err) => {
                {
                    let mut state = shared.state.lock();
                    state.connection = None;
                }
                stream = None;
                if !handle_stream_error(&shared, &config, &reconnect, err.to_string()) {
                    return;
                }
            }
        }
    }
}

/// Records a stream failure.  Returns `false` when the failure is hard and
/// the worker should exit.
fn handle_stream_error(
    shared: &Arc<Shared>,
    config: &CacheConfig,
    reconnect: &Option<ReconnectCallback>,
    message: String,
) -> bool {
    log::warn!("download failed: {}", message);
    let mut state = shared.state.lock();
    state.connection = None;

    if let Some(callback) = reconnect {
        let first = !state.reconnecting;
        state.reconnecting = true;
        drop(state);
        if first {
            callback(true);
        }
        thread::sleep(RECONNECT_DELAY);
        return true;
    }

    let now = Instant::now();
    let hard = state
        .last_error_at
        .map(|prev| now.duration_since(prev) <= config.hard_failure_window)
        .unwrap_or(false);
    if hard {
        state.closed = true;
        state.failure = Some(message);
        state.buffer = None;
        shared.data_ready.notify_all();
        false
    } else {
        state.last_error_at = Some(now);
        true
    }
}
