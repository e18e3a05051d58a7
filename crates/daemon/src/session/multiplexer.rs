//! Subscriber fan-out for session output.
//!
//! Each attached subscriber owns a bounded output queue. Broadcasting never
//! waits on a subscriber: when a queue is full the chunk is dropped for that
//! subscriber alone and a `DataDropped` notification is left pending for it.
//! At most one drop notification is pending per subscriber; later drops fold
//! into it. The control lane only carries state changes. Subscribers whose
//! receiving side went away are removed on the next broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::lifecycle::SessionState;
use super::SessionId;

/// Unique identifier for a subscriber attachment.
pub type SubscriberId = String;

/// Default output queue capacity per subscriber.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// State changes per session are bounded by the number of states.
const CONTROL_QUEUE_CAPACITY: usize = 8;

/// An event delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// A chunk of process output.
    Output(Bytes),
    /// The session changed state. `exit_code` is set once the process exited.
    StateChanged {
        /// The new state.
        state: SessionState,
        /// Exit code of the process, when known.
        exit_code: Option<i32>,
    },
    /// Chunks were dropped because this subscriber fell behind.
    DataDropped {
        /// Total chunks dropped for this subscriber so far.
        dropped: u64,
    },
}

/// Statistics about a subscriber's delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberStats {
    /// Chunks queued successfully.
    pub chunks_sent: u64,
    /// Chunks dropped because the queue was full.
    pub chunks_dropped: u64,
    /// Whether the subscriber is currently falling behind.
    pub is_backpressured: bool,
}

/// Outcome of delivering one chunk to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The chunk was queued.
    Sent,
    /// The queue was full; the chunk was dropped.
    Dropped,
    /// The receiving side is gone.
    Closed,
}

/// The session-side half of an attachment.
pub struct SubscriberHandle {
    id: SubscriberId,
    session_id: SessionId,
    output_tx: mpsc::Sender<Bytes>,
    control_tx: mpsc::Sender<SubscriberEvent>,
    stats: SubscriberStats,
    pending_dropped: Arc<AtomicU64>,
    detached: Arc<AtomicBool>,
}

impl SubscriberHandle {
    /// Creates a handle and its matching stream with a fresh subscriber id.
    pub fn new(session_id: SessionId, capacity: usize) -> (Self, SubscriberStream) {
        let id = Uuid::new_v4().to_string();
        let (output_tx, output_rx) = mpsc::channel(capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let pending_dropped = Arc::new(AtomicU64::new(0));
        let detached = Arc::new(AtomicBool::new(false));

        let handle = SubscriberHandle {
            id: id.clone(),
            session_id: session_id.clone(),
            output_tx,
            control_tx,
            stats: SubscriberStats::default(),
            pending_dropped: Arc::clone(&pending_dropped),
            detached: Arc::clone(&detached),
        };
        let stream = SubscriberStream {
            id,
            session_id,
            held: None,
            output_rx,
            control_rx,
            pending_dropped,
            detached,
        };
        (handle, stream)
    }

    /// Returns the subscriber ID.
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Returns a copy of the current statistics.
    pub fn stats(&self) -> SubscriberStats {
        self.stats.clone()
    }

    /// Returns whether the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.output_tx.is_closed()
    }

    /// Queues `chunk` without waiting.
    ///
    /// The first drop of a back-pressure episode leaves a `DataDropped`
    /// notification pending; the episode ends at the next successful send.
    /// A notification still pending from an earlier episode is replaced with
    /// the newer total.
    pub fn deliver(&mut self, chunk: Bytes) -> Delivery {
        match self.output_tx.try_send(chunk) {
            Ok(()) => {
                self.stats.chunks_sent += 1;
                if self.stats.is_backpressured {
                    self.stats.is_backpressured = false;
                    tracing::debug!(
                        session_id = %self.session_id,
                        subscriber_id = %self.id,
                        "Subscriber recovered from backpressure"
                    );
                }
                Delivery::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.chunks_dropped += 1;
                if !self.stats.is_backpressured {
                    self.stats.is_backpressured = true;
                    tracing::warn!(
                        session_id = %self.session_id,
                        subscriber_id = %self.id,
                        dropped = self.stats.chunks_dropped,
                        "Subscriber is backpressured, dropping output"
                    );
                    self.pending_dropped
                        .store(self.stats.chunks_dropped, Ordering::SeqCst);
                }
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscriber_id = %self.id, "Subscriber channel closed");
                Delivery::Closed
            }
        }
    }

    /// Queues a state change on the control lane.
    pub fn notify(&self, event: SubscriberEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.control_tx.try_send(event) {
            tracing::debug!(
                subscriber_id = %self.id,
                event = ?event,
                "Control queue full, dropping event"
            );
        }
    }

    /// Marks the attachment as detached; the stream yields nothing afterwards.
    fn mark_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}

/// The subscriber-side half of an attachment.
///
/// Yields output chunks in production order. Pending output is always
/// delivered before a pending drop notification, and both before state
/// changes queued at the same time, so a final `Closed` state arrives after
/// the last output chunk.
pub struct SubscriberStream {
    id: SubscriberId,
    session_id: SessionId,
    held: Option<SubscriberEvent>,
    output_rx: mpsc::Receiver<Bytes>,
    control_rx: mpsc::Receiver<SubscriberEvent>,
    pending_dropped: Arc<AtomicU64>,
    detached: Arc<AtomicBool>,
}

impl SubscriberStream {
    /// Returns the subscriber ID.
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Returns the session this stream is attached to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Sets the event yielded before anything else, e.g. the state at attach.
    pub fn with_initial(mut self, event: SubscriberEvent) -> Self {
        self.held = Some(event);
        self
    }

    /// Receives the next event.
    ///
    /// Returns `None` after detach, or once the session released the
    /// subscriber and every queued event was consumed.
    pub async fn recv(&mut self) -> Option<SubscriberEvent> {
        if self.detached.load(Ordering::SeqCst) {
            return None;
        }

        let event = if let Some(event) = self.held.take() {
            event
        } else if let Ok(chunk) = self.output_rx.try_recv() {
            SubscriberEvent::Output(chunk)
        } else if let Some(dropped) = self.take_dropped() {
            dropped
        } else {
            // A drop is only recorded while the output queue is full, so
            // waiting on the queues also wakes for it.
            tokio::select! {
                biased;
                Some(chunk) = self.output_rx.recv() => SubscriberEvent::Output(chunk),
                Some(event) = self.control_rx.recv() => match self.take_dropped() {
                    Some(dropped) => {
                        self.held = Some(event);
                        dropped
                    }
                    None => event,
                },
                else => match self.take_dropped() {
                    Some(dropped) => dropped,
                    None => return None,
                },
            }
        };

        if self.detached.load(Ordering::SeqCst) {
            return None;
        }
        Some(event)
    }

    fn take_dropped(&self) -> Option<SubscriberEvent> {
        match self.pending_dropped.swap(0, Ordering::SeqCst) {
            0 => None,
            dropped => Some(SubscriberEvent::DataDropped { dropped }),
        }
    }
}

/// The set of subscribers attached to one session.
///
/// Not synchronized itself; the owning session guards it with its lock.
#[derive(Default)]
pub struct SubscriberSet {
    subscribers: HashMap<SubscriberId, SubscriberHandle>,
}

impl SubscriberSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn insert(&mut self, handle: SubscriberHandle) {
        self.subscribers.insert(handle.id.clone(), handle);
    }

    /// Removes a subscriber and returns its final statistics.
    ///
    /// The removed subscriber's stream yields nothing afterwards.
    pub fn remove(&mut self, id: &str) -> Option<SubscriberStats> {
        self.subscribers.remove(id).map(|handle| {
            handle.mark_detached();
            handle.stats()
        })
    }

    /// Returns whether a subscriber is attached.
    pub fn contains(&self, id: &str) -> bool {
        self.subscribers.contains_key(id)
    }

    /// Returns the number of attached subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Returns whether no subscriber is attached.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Returns statistics for one subscriber.
    pub fn stats(&self, id: &str) -> Option<SubscriberStats> {
        self.subscribers.get(id).map(SubscriberHandle::stats)
    }

    /// Returns the attached subscriber IDs.
    pub fn ids(&self) -> Vec<SubscriberId> {
        self.subscribers.keys().cloned().collect()
    }

    /// Delivers `chunk` to every subscriber.
    ///
    /// Subscribers whose stream was dropped are removed. Returns the number of
    /// subscribers that queued the chunk.
    pub fn broadcast(&mut self, chunk: &Bytes) -> usize {
        let mut disconnected = Vec::new();
        let mut delivered = 0;

        for (id, handle) in self.subscribers.iter_mut() {
            if handle.is_closed() {
                disconnected.push(id.clone());
                continue;
            }
            match handle.deliver(chunk.clone()) {
                Delivery::Sent => delivered += 1,
                Delivery::Dropped => {}
                Delivery::Closed => disconnected.push(id.clone()),
            }
        }

        for id in disconnected {
            self.subscribers.remove(&id);
            tracing::debug!(subscriber_id = %id, "Removed disconnected subscriber");
        }

        delivered
    }

    /// Queues a control event for every subscriber.
    pub fn notify_all(&self, event: SubscriberEvent) {
        for handle in self.subscribers.values() {
            handle.notify(event.clone());
        }
    }

    /// Drops every handle. Streams drain what is queued and then end.
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}
