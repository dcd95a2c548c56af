//! Pull-based consumers
//!
//! A session protocol engine (RTSP, chunked HTTP) decides when a client starts
//! and stops reading; each reading client is a node in a singly linked chain
//! that the capture thread walks for every frame. Nodes live in an arena and
//! link by index, and the chain is guarded by one reentrant lock so a consumer
//! may start or stop streams from inside its own delivery callback.

use bytes::Bytes;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::capture::{Frame, FrameSink};
use crate::gate::{Admission, KeyFrameGate};

/// Receives the payload copied out of each delivered frame
pub trait PullConsumer: Send + Sync {
    /// Frames are skipped (before key frame gating) while this is false
    fn is_awaiting_data(&self) -> bool {
        true
    }

    /// `payload` holds at most `max_payload_size` bytes; `truncated_bytes` is what did not fit
    fn frame_ready(&self, payload: Bytes, truncated_bytes: usize);
}

/// Identity of one logical stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey(u64);

struct PullStreamNode {
    key: StreamKey,
    gate: KeyFrameGate,
    max_payload_size: usize,
    last_truncated_bytes: usize,
    consumer: Arc<dyn PullConsumer>,
    next: Option<usize>,
}

#[derive(Default)]
struct Chain {
    slots: Vec<Option<PullStreamNode>>,
    free: Vec<usize>,
    head: Option<usize>,
    index: HashMap<StreamKey, usize>,
}

impl Chain {
    fn node(&self, slot: usize) -> Option<&PullStreamNode> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize, key: StreamKey) -> Option<&mut PullStreamNode> {
        self.slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .filter(|node| node.key == key)
    }

    fn insert_head(&mut self, mut node: PullStreamNode) -> usize {
        node.next = self.head;
        let key = node.key;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.head = Some(slot);
        self.index.insert(key, slot);
        slot
    }

    fn unlink(&mut self, key: StreamKey) -> bool {
        let Some(target) = self.index.remove(&key) else {
            return false;
        };

        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let next = self.node(slot).and_then(|node| node.next);
            if slot == target {
                match prev {
                    None => self.head = next,
                    Some(prev) => {
                        if let Some(node) = self.slots[prev].as_mut() {
                            node.next = next;
                        }
                    }
                }
                self.slots[slot] = None;
                self.free.push(slot);
                return true;
            }
            prev = cursor;
            cursor = next;
        }

        tracing::warn!(?key, "Pull stream indexed but not linked");
        false
    }

    /// Current chain as (slot, key) pairs, head first
    fn snapshot(&self) -> Vec<(usize, StreamKey)> {
        let mut out = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let Some(node) = self.node(slot) else {
                break;
            };
            out.push((slot, node.key));
            cursor = node.next;
        }
        out
    }
}

/// Registry of pull consumers
pub struct PullSessionList {
    chain: ReentrantMutex<RefCell<Chain>>,
    next_key: AtomicU64,
}

impl PullSessionList {
    pub fn new() -> Self {
        Self {
            chain: ReentrantMutex::new(RefCell::new(Chain::default())),
            next_key: AtomicU64::new(1),
        }
    }

    /// Allocate an identity for a new logical stream
    pub fn new_key(&self) -> StreamKey {
        StreamKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Link a consumer at the head of the chain. Returns false if `key` is already started.
    pub fn start(
        &self,
        key: StreamKey,
        consumer: Arc<dyn PullConsumer>,
        max_payload_size: usize,
    ) -> bool {
        let guard = self.chain.lock();
        let mut chain = guard.borrow_mut();

        if chain.index.contains_key(&key) {
            return false;
        }

        chain.insert_head(PullStreamNode {
            key,
            gate: KeyFrameGate::new(),
            max_payload_size,
            last_truncated_bytes: 0,
            consumer,
            next: None,
        });
        tracing::debug!(?key, streams = chain.index.len(), "Pull stream started");
        true
    }

    /// Unlink a consumer. Returns false if it was not started.
    pub fn stop(&self, key: StreamKey) -> bool {
        let guard = self.chain.lock();
        let mut chain = guard.borrow_mut();

        let removed = chain.unlink(key);
        if removed {
            tracing::debug!(?key, streams = chain.index.len(), "Pull stream stopped");
        }
        removed
    }

    pub fn any_active(&self) -> bool {
        self.chain.lock().borrow().head.is_some()
    }

    pub fn is_started(&self, key: StreamKey) -> bool {
        self.chain.lock().borrow().index.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.chain.lock().borrow().index.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.any_active()
    }

    /// Started streams in chain order, most recent first
    pub fn keys(&self) -> Vec<StreamKey> {
        let guard = self.chain.lock();
        let chain = guard.borrow();
        chain.snapshot().into_iter().map(|(_, key)| key).collect()
    }

    pub fn last_truncated_bytes(&self, key: StreamKey) -> Option<usize> {
        let guard = self.chain.lock();
        let chain = guard.borrow();
        let slot = *chain.index.get(&key)?;
        chain.node(slot).map(|node| node.last_truncated_bytes)
    }

    /// Offer a frame to every started stream.
    ///
    /// Walks the chain as it was when delivery began; streams stopped by an
    /// earlier callback in the same walk are skipped, streams started during
    /// it wait for the next frame.
    pub fn deliver(&self, frame: &Frame<'_>) {
        let guard = self.chain.lock();
        let snapshot = guard.borrow().snapshot();

        for (slot, key) in snapshot {
            let consumer = match guard.borrow_mut().node_mut(slot, key) {
                Some(node) => node.consumer.clone(),
                None => continue,
            };
            if !consumer.is_awaiting_data() {
                continue;
            }

            let admitted = {
                let mut chain = guard.borrow_mut();
                let Some(node) = chain.node_mut(slot, key) else {
                    continue;
                };

                match node.gate.admit(frame.is_key_frame()) {
                    Admission::Drop { request_key_frame } => Err(request_key_frame),
                    Admission::Deliver => {
                        let size = frame.len().min(node.max_payload_size);
                        node.last_truncated_bytes = frame.len() - size;
                        Ok((
                            Bytes::copy_from_slice(&frame.data()[..size]),
                            node.last_truncated_bytes,
                        ))
                    }
                }
            };

            match admitted {
                Ok((payload, truncated)) => {
                    if truncated > 0 {
                        tracing::debug!(?key, truncated, "Frame truncated for pull stream");
                    }
                    consumer.frame_ready(payload, truncated);
                }
                Err(true) => {
                    tracing::debug!(?key, "Pull stream waiting for key frame, requesting one");
                    frame.device().force_key_frame();
                }
                Err(false) => {}
            }
        }
    }
}

impl Default for PullSessionList {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for PullSessionList {
    fn needs_frame(&self) -> bool {
        self.any_active()
    }

    fn on_frame(&self, frame: &Frame<'_>) {
        self.deliver(frame);
    }
}

/// One logical pull stream, started and stopped by its protocol engine.
/// Dropping the handle stops the stream.
pub struct PullStream {
    list: Arc<PullSessionList>,
    key: StreamKey,
    consumer: Arc<dyn PullConsumer>,
    max_payload_size: usize,
}

impl PullStream {
    pub fn new(
        list: Arc<PullSessionList>,
        consumer: Arc<dyn PullConsumer>,
        max_payload_size: usize,
    ) -> Self {
        let key = list.new_key();
        Self {
            list,
            key,
            consumer,
            max_payload_size,
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// Begin receiving frames; a no-op if already started
    pub fn start(&self) {
        self.list
            .start(self.key, self.consumer.clone(), self.max_payload_size);
    }

    /// Stop receiving frames; a no-op if not started
    pub fn stop(&self) {
        self.list.stop(self.key);
    }

    pub fn is_started(&self) -> bool {
        self.list.is_started(self.key)
    }
}

impl Drop for PullStream {
    fn drop(&mut self) {
        self.list.stop(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::CountingDevice;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::Weak;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<(Bytes, usize)>>,
    }

    impl Collect {
        fn count(&self) -> usize {
            self.frames.lock().len()
        }
    }

    impl PullConsumer for Collect {
        fn frame_ready(&self, payload: Bytes, truncated_bytes: usize) {
            self.frames.lock().push((payload, truncated_bytes));
        }
    }

    fn started(list: &PullSessionList, max: usize) -> (StreamKey, Arc<Collect>) {
        let consumer = Arc::new(Collect::default());
        let key = list.new_key();
        assert!(list.start(key, consumer.clone(), max));
        (key, consumer)
    }

    #[test]
    fn test_any_active_tracks_membership() {
        let list = PullSessionList::new();
        assert!(!list.any_active());

        let (key, _consumer) = started(&list, 1024);
        assert!(list.any_active());
        assert!(list.stop(key));
        assert!(!list.any_active());
    }

    #[test]
    fn test_start_is_idempotent() {
        let list = PullSessionList::new();
        let (key, consumer) = started(&list, 1024);

        assert!(!list.start(key, consumer, 1024));
        assert_eq!(list.len(), 1);
        assert!(!list.stop(list.new_key()));
    }

    #[test]
    fn test_unlink_preserves_order() {
        for victim in 0..3 {
            let list = PullSessionList::new();
            let keys: Vec<_> = (0..3).map(|_| started(&list, 16).0).collect();
            // head insertion: newest first
            let mut expected: Vec<_> = keys.iter().rev().copied().collect();
            assert_eq!(list.keys(), expected);

            assert!(list.stop(keys[victim]));
            expected.retain(|k| *k != keys[victim]);
            assert_eq!(list.keys(), expected, "removing stream {victim}");
        }
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let list = PullSessionList::new();
        let (a, _) = started(&list, 16);
        let (b, _) = started(&list, 16);
        list.stop(a);
        let (c, _) = started(&list, 16);

        assert_eq!(list.keys(), vec![c, b]);
        assert_eq!(list.chain.lock().borrow().slots.len(), 2);
    }

    #[test]
    fn test_truncates_to_max_payload() {
        let list = PullSessionList::new();
        let device = CountingDevice::default();
        let (key, consumer) = started(&list, 4);

        list.deliver(&Frame::new(&[9; 10], true, &device));

        let frames = consumer.frames.lock();
        assert_eq!(frames[0].0.len(), 4);
        assert_eq!(frames[0].1, 6);
        drop(frames);
        assert_eq!(list.last_truncated_bytes(key), Some(6));

        list.deliver(&Frame::new(&[9; 3], false, &device));
        assert_eq!(consumer.frames.lock()[1].0.len(), 3);
        assert_eq!(list.last_truncated_bytes(key), Some(0));
    }

    #[test]
    fn test_gates_until_key_frame() {
        let list = PullSessionList::new();
        let device = CountingDevice::default();
        let (_key, consumer) = started(&list, 1024);

        list.deliver(&Frame::new(&[1], false, &device));
        list.deliver(&Frame::new(&[2], false, &device));
        assert_eq!(consumer.count(), 0);
        assert_eq!(device.requests(), 1);

        list.deliver(&Frame::new(&[3], true, &device));
        list.deliver(&Frame::new(&[4], false, &device));
        assert_eq!(consumer.count(), 2);
        assert_eq!(device.requests(), 1);
    }

    #[test]
    fn test_two_streams_then_one_stops() {
        let list = PullSessionList::new();
        let device = CountingDevice::default();
        let (first, a) = started(&list, 1024);
        let (_second, b) = started(&list, 1024);

        list.deliver(&Frame::new(&[1, 2], true, &device));
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);

        list.stop(first);
        list.deliver(&Frame::new(&[3], false, &device));
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 2);
    }

    #[test]
    fn test_skips_consumers_not_awaiting_data() {
        struct Busy;
        impl PullConsumer for Busy {
            fn is_awaiting_data(&self) -> bool {
                false
            }
            fn frame_ready(&self, _: Bytes, _: usize) {
                panic!("busy consumer must not receive frames");
            }
        }

        let list = PullSessionList::new();
        let device = CountingDevice::default();
        list.start(list.new_key(), Arc::new(Busy), 1024);

        list.deliver(&Frame::new(&[1], false, &device));
        assert_eq!(device.requests(), 0);
    }

    struct StopsItself {
        list: Weak<PullSessionList>,
        key: StreamKey,
        victim: Option<StreamKey>,
        frames: Mutex<usize>,
    }

    impl PullConsumer for StopsItself {
        fn frame_ready(&self, _: Bytes, _: usize) {
            *self.frames.lock() += 1;
            if let Some(list) = self.list.upgrade() {
                list.stop(self.key);
                if let Some(victim) = self.victim {
                    list.stop(victim);
                }
            }
        }
    }

    #[test]
    fn test_stop_from_inside_delivery() {
        let list = Arc::new(PullSessionList::new());
        let device = CountingDevice::default();

        // chain after inserts: [stopper, other]
        let (other, other_consumer) = started(&list, 1024);
        let key = list.new_key();
        let stopper = Arc::new(StopsItself {
            list: Arc::downgrade(&list),
            key,
            victim: Some(other),
            frames: Mutex::new(0),
        });
        list.start(key, stopper.clone(), 1024);

        list.deliver(&Frame::new(&[1], true, &device));

        assert_eq!(*stopper.frames.lock(), 1);
        assert_eq!(other_consumer.count(), 0);
        assert!(!list.any_active());
    }

    /// Records what one consumer received
    #[derive(Default)]
    struct FirstFrame {
        first: Mutex<Option<u8>>,
        frames: AtomicU64,
    }

    impl PullConsumer for FirstFrame {
        fn frame_ready(&self, payload: Bytes, _: usize) {
            self.first.lock().get_or_insert(payload[0]);
            self.frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_churn_while_delivering() {
        const KEY: u8 = 0x65;
        const DELTA: u8 = 0x41;

        let list = Arc::new(PullSessionList::new());
        let device = Arc::new(CountingDevice::default());
        let running = Arc::new(AtomicBool::new(true));

        let producer = {
            let list = list.clone();
            let device = device.clone();
            let running = running.clone();
            std::thread::spawn(move || {
                let mut n = 0u64;
                while running.load(Ordering::Relaxed) {
                    let key_frame = n % 7 == 0;
                    let data = [if key_frame { KEY } else { DELTA }, n as u8];
                    list.deliver(&Frame::new(&data, key_frame, &*device));
                    n += 1;
                }
                n
            })
        };

        let mut consumers = Vec::new();
        let mut live = Vec::new();
        for round in 0..300 {
            let consumer = Arc::new(FirstFrame::default());
            let stream = PullStream::new(list.clone(), consumer.clone(), 64);
            stream.start();
            consumers.push(consumer);

            if round % 3 == 0 {
                drop(stream);
            } else {
                live.push(stream);
                if live.len() > 8 {
                    live.remove(0);
                }
            }
            std::thread::yield_now();
        }
        // let the survivors see a few key frames
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(live);

        running.store(false, Ordering::Relaxed);
        let produced = producer.join().unwrap();

        assert!(produced > 0);
        assert!(list.is_empty());
        assert!(list.keys().is_empty());
        // one request at most per started stream
        assert!(device.requests() <= consumers.len());
        for consumer in &consumers {
            if let Some(first) = *consumer.first.lock() {
                assert_eq!(first, KEY);
            }
        }
        assert!(consumers.iter().any(|c| c.frames.load(Ordering::Relaxed) > 0));
    }

    #[test]
    fn test_pull_stream_handle_stops_on_drop() {
        let list = Arc::new(PullSessionList::new());
        let stream = PullStream::new(list.clone(), Arc::new(Collect::default()), 1024);

        assert!(!stream.is_started());
        stream.start();
        stream.start();
        assert_eq!(list.len(), 1);

        drop(stream);
        assert!(!list.any_active());
    }
}
