//! Stream assembler: LLM token deltas → sentence-bounded TTS utterances.
//!
//! State is partitioned per correlation id; there is no cross-correlation
//! locking. Each correlation owns a bounded chunk queue drained by its
//! own publisher task, so flushed chunks reach the TTS topic in assembly
//! order. Cancellation clears the queue, discards the accumulator, and
//! publishes `tts.control{stop}` exactly once per correlation.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rumqttc::QoS;
use tars_contracts::events::{EventPayload, LlmStream, TtsAction, TtsControl, TtsSay};
use tars_contracts::{envelope, topics};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::boundary::BoundaryScanner;
use crate::config::{OverflowPolicy, StreamConfig};
use crate::metrics::{names, Metrics};
use crate::traits::Publish;

/// How many closed/cancelled correlation ids to remember for late-chunk
/// suppression.
const CLOSED_CAPACITY: usize = 256;

// ── Per-correlation state ────────────────────────────────────────────

/// One flush-ready chunk on its way to the TTS topic.
#[derive(Debug)]
struct TtsChunk {
    text: String,
    is_last: bool,
}

struct StreamBuf {
    /// Accumulated, not-yet-flushed text.
    acc: String,
    /// Next expected sequence number.
    next_seq: u64,
    /// Out-of-order deltas held until their turn, bounded by the
    /// reorder window.
    pending: BTreeMap<u64, LlmStream>,
    /// Bounded FIFO to this correlation's publisher task.
    tx: mpsc::Sender<TtsChunk>,
    /// The publisher task; aborted on cancellation to clear the queue.
    task: JoinHandle<()>,
    chunks_flushed: u64,
    last_flush: Instant,
}

/// Work computed under the buffer lock, executed outside it.
struct FlushStep {
    tx: mpsc::Sender<TtsChunk>,
    chunks: Vec<TtsChunk>,
    finished: bool,
}

/// Bounded set of recently closed correlation ids.
struct RecentSet {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentSet {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Insert; returns `false` when already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        while self.set.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }
}

// ── Assembler ────────────────────────────────────────────────────────

/// Converts bursty `llm.stream` deltas into ordered `tts.say` chunks.
pub struct StreamAssembler {
    config: StreamConfig,
    handler_timeout: Duration,
    scanner: BoundaryScanner,
    publisher: Arc<dyn Publish>,
    metrics: Metrics,
    buffers: Mutex<HashMap<String, StreamBuf>>,
    closed: Mutex<RecentSet>,
}

impl StreamAssembler {
    pub fn new(
        config: StreamConfig,
        handler_timeout: Duration,
        publisher: Arc<dyn Publish>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            handler_timeout,
            scanner: BoundaryScanner::default(),
            publisher,
            metrics,
            buffers: Mutex::new(HashMap::new()),
            closed: Mutex::new(RecentSet::new(CLOSED_CAPACITY)),
        }
    }

    /// Number of live stream buffers (for tests and gauges).
    pub fn active_streams(&self) -> usize {
        lock(&self.buffers).len()
    }

    /// Feed one delta for `correlate`.
    ///
    /// Out-of-order deltas are buffered up to the reorder window; a wider
    /// gap resets the stream. Duplicate or pre-window sequence numbers
    /// are dropped. Flush-ready chunks are enqueued on the correlation's
    /// bounded FIFO under the configured overflow policy.
    pub async fn handle_delta(&self, correlate: &str, delta: LlmStream) {
        if lock(&self.closed).contains(correlate) {
            debug!(correlate, seq = delta.seq, "delta for closed stream ignored");
            return;
        }

        let Some(step) = self.ingest(correlate, delta) else {
            return;
        };

        for chunk in step.chunks {
            self.enqueue(&step.tx, chunk).await;
        }
        self.metrics.set_gauge(
            names::STREAM_QUEUE_DEPTH,
            "",
            (step.tx.max_capacity() - step.tx.capacity()) as f64,
        );

        if step.finished {
            lock(&self.closed).insert(correlate);
            debug!(correlate, "stream completed");
        }
    }

    /// Cancel the stream for `correlate`: clear its queue, discard the
    /// accumulator, and publish `tts.control{stop}` exactly once.
    ///
    /// Cancels for already-closed (completed or cancelled) streams are
    /// idempotent no-ops.
    pub async fn cancel(&self, correlate: &str) {
        let newly_closed = lock(&self.closed).insert(correlate);
        let buf = lock(&self.buffers).remove(correlate);

        if let Some(buf) = &buf {
            // Aborting the publisher task drops its receiver, discarding
            // every queued chunk.
            buf.task.abort();
        }

        if !newly_closed {
            debug!(correlate, "cancel for closed stream ignored");
            return;
        }

        let payload = EventPayload::TtsControl(TtsControl {
            action: TtsAction::Stop,
        });
        if let Err(e) = self
            .publisher
            .publish_event(
                crate::SERVICE_NAME,
                topics::TTS_CONTROL,
                &payload,
                Some(correlate.to_string()),
                QoS::AtLeastOnce,
                false,
            )
            .await
        {
            warn!(correlate, error = %e, "failed to publish tts.control stop");
        }
        debug!(correlate, "stream cancelled");
    }

    /// Drop every live stream without publishing anything. Shutdown path.
    pub fn cancel_all(&self) {
        let buffers = std::mem::take(&mut *lock(&self.buffers));
        for (correlate, buf) in buffers {
            debug!(correlate = %correlate, "dropping stream at shutdown");
            buf.task.abort();
        }
    }

    // ── Ingestion (synchronous, under the buffer lock) ───────────────

    fn ingest(&self, correlate: &str, delta: LlmStream) -> Option<FlushStep> {
        let mut buffers = lock(&self.buffers);
        let buf = buffers
            .entry(correlate.to_string())
            .or_insert_with(|| self.new_buf(correlate));

        if delta.seq < buf.next_seq {
            debug!(correlate, seq = delta.seq, "duplicate or stale delta dropped");
            return None;
        }

        if delta.seq > buf.next_seq {
            let gap = delta.seq - buf.next_seq;
            if gap > self.config.reorder_window
                || buf.pending.len() as u64 >= self.config.reorder_window
            {
                warn!(
                    correlate,
                    expected = buf.next_seq,
                    got = delta.seq,
                    "stream gap exceeds reorder window, resetting stream"
                );
                self.metrics.incr(names::STREAM_GAPS, "");
                buf.acc.clear();
                buf.pending.clear();
                buf.next_seq = delta.seq;
                // Fall through and admit the offending delta.
            } else {
                buf.pending.insert(delta.seq, delta);
                return None;
            }
        }

        // Admit the delta, then drain any now-in-order pending deltas.
        let mut saw_final = false;
        let mut current = Some(delta);
        while let Some(d) = current {
            buf.acc.push_str(&d.delta);
            saw_final |= d.is_final;
            buf.next_seq = d.seq + 1;
            current = buf.pending.remove(&buf.next_seq);
        }

        let chunks = self.compute_chunks(buf, saw_final);
        if chunks.is_empty() && !saw_final {
            return None;
        }

        let now = Instant::now();
        for _ in &chunks {
            self.metrics.incr(names::STREAM_CHUNKS_FLUSHED, "");
            self.metrics.observe(
                names::STREAM_FLUSH_INTERVAL_MS,
                "",
                now.duration_since(buf.last_flush).as_secs_f64() * 1000.0,
            );
            buf.last_flush = now;
        }
        buf.chunks_flushed += chunks.len() as u64;

        let tx = buf.tx.clone();
        if saw_final {
            // Destroy the per-correlation state; the publisher task keeps
            // draining and exits once the last sender is dropped.
            buffers.remove(correlate);
        }

        Some(FlushStep {
            tx,
            chunks,
            finished: saw_final,
        })
    }

    /// Flush decision over the accumulator. Mutates `buf.acc` in place.
    fn compute_chunks(&self, buf: &mut StreamBuf, is_final: bool) -> Vec<TtsChunk> {
        let mut chunks = Vec::new();

        // Forced flush: emit windows of exactly `max_chars` until the
        // accumulator fits.
        while char_count(&buf.acc) > self.config.max_chars {
            let split = byte_offset(&buf.acc, self.config.max_chars);
            let text: String = buf.acc.drain(..split).collect();
            chunks.push(TtsChunk {
                text,
                is_last: false,
            });
        }

        if self.config.flush_on_boundary {
            if let Some(split) = self.scanner.latest_boundary(&buf.acc) {
                if char_count(&buf.acc[..split]) >= self.config.min_chars {
                    let text: String = buf.acc.drain(..split).collect();
                    chunks.push(TtsChunk {
                        text,
                        is_last: false,
                    });
                }
            }
        } else if char_count(&buf.acc) >= self.config.min_chars {
            let text = std::mem::take(&mut buf.acc);
            chunks.push(TtsChunk {
                text,
                is_last: false,
            });
        }

        if is_final {
            if !buf.acc.is_empty() {
                let text = std::mem::take(&mut buf.acc);
                chunks.push(TtsChunk {
                    text,
                    is_last: true,
                });
            } else if let Some(last) = chunks.last_mut() {
                last.is_last = true;
            } else if buf.chunks_flushed > 0 {
                // Everything was already flushed; emit an end marker so
                // TTS can close the utterance.
                chunks.push(TtsChunk {
                    text: String::new(),
                    is_last: true,
                });
            }
        }

        chunks
    }

    fn new_buf(&self, correlate: &str) -> StreamBuf {
        let (tx, rx) = mpsc::channel(self.config.queue_max);
        let task = tokio::spawn(publish_loop(
            correlate.to_string(),
            rx,
            self.publisher.clone(),
        ));
        debug!(correlate, "stream buffer created");
        StreamBuf {
            acc: String::new(),
            next_seq: 1,
            pending: BTreeMap::new(),
            tx,
            task,
            chunks_flushed: 0,
            last_flush: Instant::now(),
        }
    }

    async fn enqueue(&self, tx: &mpsc::Sender<TtsChunk>, chunk: TtsChunk) {
        match self.config.overflow {
            OverflowPolicy::Drop => match tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("tts chunk queue full, dropping chunk");
                    self.metrics.incr(names::STREAM_CHUNKS_DROPPED, "");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("tts chunk queue closed, dropping chunk");
                }
            },
            OverflowPolicy::Block => {
                match tokio::time::timeout(self.handler_timeout, tx.send(chunk)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        debug!("tts chunk queue closed, dropping chunk");
                    }
                    Err(_) => {
                        warn!(
                            timeout = ?self.handler_timeout,
                            "tts chunk queue blocked past the handler timeout, dropping chunk"
                        );
                        self.metrics.incr(names::STREAM_CHUNKS_DROPPED, "");
                    }
                }
            }
        }
    }
}

/// Drain one correlation's chunk queue, publishing in FIFO order.
async fn publish_loop(
    correlate: String,
    mut rx: mpsc::Receiver<TtsChunk>,
    publisher: Arc<dyn Publish>,
) {
    while let Some(chunk) = rx.recv().await {
        let payload = EventPayload::TtsSay(TtsSay {
            text: chunk.text,
            utterance_id: envelope::fresh_id(),
            voice: None,
            is_last: chunk.is_last.then_some(true),
        });
        if let Err(e) = publisher
            .publish_event(
                crate::SERVICE_NAME,
                topics::TTS_SAY,
                &payload,
                Some(correlate.clone()),
                QoS::AtLeastOnce,
                false,
            )
            .await
        {
            warn!(correlate = %correlate, error = %e, "failed to publish tts.say");
        }
    }
    debug!(correlate = %correlate, "tts publisher task finished");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn char_count(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `chars`-th character (or the end of the string).
fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len())
}

// ── Tests ────────────────────────────────────────────────────────────
