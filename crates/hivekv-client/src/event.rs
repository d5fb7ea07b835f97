//! Reusable I/O contexts and admission control.
//!
//! An [`EventContext`] carries the buffer segment a command reads and writes
//! through. The pool holds a fixed number of contexts; every in-flight
//! command owns exactly one. When the pool is exhausted, acquisition either
//! parks the caller on a FIFO (blocking mode) or fails with
//! `CommandRejected` (non-blocking mode).
//!
//! Context hand-off to parked callers runs through a single-flight scheduler:
//! one worker at a time drains `(free context, oldest waiter)` pairs, guarded
//! by a compare-and-swap on `job_scheduled` with a re-check after clearing
//! it. Every released context consults the FIFO before rejoining the free
//! list, so no parked command can be overtaken indefinitely.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use hivekv_common::buffer::{BufferPool, BufferSegment, BUFFER_CUTOFF};
use hivekv_common::error::{HiveError, Result};

/// Scheduling handle owned by one in-flight command at a time.
///
/// Between commands the context rests in the pool holding its buffer
/// segment; in flight, the segment is temporarily swapped for an oversized
/// heap segment when a message outgrows the pool cutoff, and the original is
/// stashed so it can be restored on release.
#[derive(Debug)]
pub struct EventContext {
    id: usize,
    segment: BufferSegment,
    segment_orig: Option<BufferSegment>,
}

impl EventContext {
    fn new(id: usize, segment: BufferSegment) -> EventContext {
        EventContext {
            id,
            segment,
            segment_orig: None,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn segment(&mut self) -> &mut BufferSegment {
        &mut self.segment
    }

    pub(crate) fn segment_ref(&self) -> &BufferSegment {
        &self.segment
    }

    /// Makes the active segment able to hold `needed` bytes.
    ///
    /// Within the current allocation this just widens the active range.
    /// Past the pool cutoff the pooled segment is swapped out for a one-shot
    /// heap segment; the original is kept aside and restored on release.
    pub(crate) fn ensure_capacity(&mut self, needed: usize) {
        if needed <= self.segment.capacity() {
            self.segment.set_size(needed);
            return;
        }
        let fresh = BufferSegment::oversized(needed);
        let old = mem::replace(&mut self.segment, fresh);
        if old.is_pooled() && self.segment_orig.is_none() {
            self.segment_orig = Some(old);
        }
    }

    /// Restores the original pooled segment, dropping any oversized
    /// replacement. Called when the owning command terminates.
    pub(crate) fn restore_segment(&mut self) {
        if let Some(orig) = self.segment_orig.take() {
            let _oversized = mem::replace(&mut self.segment, orig);
        }
    }

    /// Swaps in a replacement segment, returning the old one.
    pub(crate) fn swap_segment(&mut self, segment: BufferSegment) -> BufferSegment {
        mem::replace(&mut self.segment, segment)
    }
}

/// Bounded pool of event contexts.
#[derive(Debug)]
pub struct EventPool {
    free: Mutex<VecDeque<EventContext>>,
    waiters: Mutex<VecDeque<oneshot::Sender<EventContext>>>,
    job_scheduled: AtomicBool,
    block_on_full: bool,
    total: usize,
}

impl EventPool {
    /// Creates `size` contexts, each pre-bound to a pooled buffer segment.
    pub async fn new(size: usize, block_on_full: bool, buffers: &BufferPool) -> EventPool {
        let mut free = VecDeque::with_capacity(size);
        for id in 0..size {
            let segment = buffers.get_next(BUFFER_CUTOFF).await;
            free.push_back(EventContext::new(id, segment));
        }
        EventPool {
            free: Mutex::new(free),
            waiters: Mutex::new(VecDeque::new()),
            job_scheduled: AtomicBool::new(false),
            block_on_full,
            total: size,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Contexts currently at rest.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    fn try_acquire(&self) -> Option<EventContext> {
        self.free.lock().pop_front()
    }

    /// Acquires a context, parking FIFO or rejecting per the pool mode.
    pub async fn acquire(&self) -> Result<EventContext> {
        if let Some(ctx) = self.try_acquire() {
            return Ok(ctx);
        }
        if !self.block_on_full {
            tracing::debug!(total = self.total, "event context pool exhausted, rejecting");
            return Err(HiveError::CommandRejected);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back(tx);
        // A context may have been freed between the failed pop and the park;
        // run the scheduler so the hand-off cannot be lost.
        self.schedule();
        rx.await.map_err(|_| HiveError::CommandRejected)
    }

    /// Returns a context to the pool, waking the oldest parked command first.
    pub fn release(&self, ctx: EventContext) {
        self.free.lock().push_back(ctx);
        self.schedule();
    }

    /// Single-flight pairing of free contexts with parked commands.
    fn schedule(&self) {
        loop {
            if self
                .job_scheduled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another worker is draining; it will observe our queue entry
                // in its re-check.
                return;
            }
            loop {
                let pair = {
                    let mut waiters = self.waiters.lock();
                    if waiters.is_empty() {
                        None
                    } else {
                        let mut free = self.free.lock();
                        free.pop_front().map(|ctx| {
                            let waiter = waiters.pop_front();
                            (ctx, waiter)
                        })
                    }
                };
                match pair {
                    Some((ctx, Some(waiter))) => {
                        if let Err(ctx) = waiter.send(ctx) {
                            // The waiter gave up; recycle its context.
                            self.free.lock().push_back(ctx);
                        }
                    }
                    Some((ctx, None)) => {
                        self.free.lock().push_back(ctx);
                        break;
                    }
                    None => break,
                }
            }
            self.job_scheduled.store(false, Ordering::Release);
            // Re-check both queues: a release or park that raced the store
            // above must not be stranded.
            let pending = {
                let waiters = self.waiters.lock();
                !waiters.is_empty() && !self.free.lock().is_empty()
            };
            if !pending {
                return;
            }
        }
    }
}
