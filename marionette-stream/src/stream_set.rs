#![forbid(unsafe_code)]

//! All streams multiplexed over one physical connection.

use crate::cell::Cell;
use crate::errors::{Error, Result};
use crate::stream::Stream;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Cloning yields another handle to the same set.
#[derive(Clone)]
pub struct StreamSet {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<SetState>,
    write_notify: Arc<Notify>,
}

/// How many finished stream ids a set remembers. Late cells for an id that
/// has aged out open a fresh stream.
pub const RETIRED_WINDOW: usize = 4096;

#[derive(Default)]
struct SetState {
    streams: HashMap<u32, Stream>,
    /// Recently finished ids; late cells for them are dropped.
    retired: HashSet<u32>,
    /// `retired` in retirement order, oldest first.
    retired_order: VecDeque<u32>,
    accept_tx: Option<mpsc::UnboundedSender<Stream>>,
    closed: bool,
}

impl Default for StreamSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSet").field("streams", &self.len()).finish()
    }
}

impl StreamSet {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { state: Mutex::new(SetState::default()), write_notify: Arc::new(Notify::new()) }) }
    }

    /// A set that also hands every newly registered stream to the returned
    /// receiver.
    pub fn with_accept_queue() -> (Self, mpsc::UnboundedReceiver<Stream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let set = Self::new();
        set.lock().accept_tx = Some(tx);
        (set, rx)
    }

    fn lock(&self) -> MutexGuard<'_, SetState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, st: &mut SetState, id: u32) -> Stream {
        let stream = Stream::with_set_notify(id, self.inner.write_notify.clone());
        st.streams.insert(id, stream.clone());
        if let Some(tx) = &st.accept_tx {
            let _ = tx.send(stream.clone());
        }
        debug!(stream_id = id, "stream registered");
        stream
    }

    /// New stream with a random non-zero 31-bit id.
    pub fn create(&self) -> Result<Stream> {
        let mut st = self.lock();
        if st.closed {
            return Err(Error::StreamClosed);
        }
        let mut rng = rand::thread_rng();
        let id = loop {
            let id = rng.gen_range(1..=i32::MAX as u32);
            if !st.streams.contains_key(&id) && !st.retired.contains(&id) {
                break id;
            }
        };
        Ok(self.register(&mut st, id))
    }

    pub fn get(&self, id: u32) -> Option<Stream> {
        self.lock().streams.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Route a received cell to its stream, creating the stream on first
    /// sight. Heartbeat cells are ignored.
    pub fn enqueue(&self, cell: Cell) {
        if cell.is_heartbeat() {
            return;
        }
        let id = cell.stream_id;
        let stream = {
            let mut st = self.lock();
            if st.closed || st.retired.contains(&id) {
                trace!(stream_id = id, "cell for retired stream dropped");
                return;
            }
            match st.streams.get(&id) {
                Some(s) => s.clone(),
                None => self.register(&mut st, id),
            }
        };
        stream.enqueue(cell);
        if stream.is_finished() {
            self.retire(id);
        }
    }

    /// Next cell of total size `n` from a randomly chosen stream with pending
    /// data or an unsent end marker.
    pub fn dequeue(&self, n: usize) -> Option<Cell> {
        let ready: Vec<Stream> = self.lock().streams.values().filter(|s| s.has_pending()).cloned().collect();
        let stream = ready.choose(&mut rand::thread_rng())?;
        let cell = stream.dequeue(n);
        if stream.is_finished() {
            self.retire(stream.id());
        }
        cell
    }

    fn retire(&self, id: u32) {
        let mut st = self.lock();
        if st.streams.remove(&id).is_some() {
            if st.retired.insert(id) {
                st.retired_order.push_back(id);
            }
            while st.retired_order.len() > RETIRED_WINDOW {
                if let Some(old) = st.retired_order.pop_front() {
                    st.retired.remove(&old);
                }
            }
            debug!(stream_id = id, "stream finished");
        }
    }

    /// Fired whenever any member stream's write side changes.
    pub fn write_notify(&self) -> Arc<Notify> {
        self.inner.write_notify.clone()
    }

    /// Close every stream and stop accepting new ones.
    pub fn close(&self) {
        let streams: Vec<Stream> = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.accept_tx = None;
            st.streams.drain().map(|(_, s)| s).collect()
        };
        for s in &streams {
            s.close();
        }
        self.inner.write_notify.notify_waiters();
        debug!(count = streams.len(), "stream set closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellType;

    #[tokio::test]
    async fn create_assigns_unique_31_bit_ids() {
        let set = StreamSet::new();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let s = set.create().unwrap();
            assert!(s.id() > 0 && s.id() <= i32::MAX as u32);
            assert!(seen.insert(s.id()));
        }
        assert_eq!(set.len(), 64);
    }

    #[tokio::test]
    async fn end_of_stream_then_removal() {
        let set = StreamSet::new();
        let s = set.create().unwrap();
        s.write(b"abc").await.unwrap();
        assert_eq!(set.dequeue(64).unwrap().payload, b"abc");
        s.close();
        let eos = set.dequeue(64).unwrap();
        assert_eq!(eos.cell_type, CellType::EndOfStream);
        assert_eq!(eos.sequence_id, 1);
        assert_eq!(eos.stream_id, s.id());
        assert!(set.dequeue(64).is_none());
        assert!(set.get(s.id()).is_none());
    }

    #[tokio::test]
    async fn enqueue_creates_and_announces() {
        let (set, mut accepted) = StreamSet::with_accept_queue();
        set.enqueue(Cell::new(CellType::Normal, 77, 0, b"hi".to_vec()));
        let s = accepted.recv().await.unwrap();
        assert_eq!(s.id(), 77);
        let mut buf = [0u8; 8];
        assert_eq!(s.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
    }

    #[test]
    fn heartbeat_is_ignored() {
        let set = StreamSet::new();
        set.enqueue(Cell::empty(128));
        assert!(set.is_empty());
    }

    #[test]
    fn empty_set_dequeues_nothing() {
        assert!(StreamSet::new().dequeue(128).is_none());
    }

    #[tokio::test]
    async fn late_cells_for_finished_stream_are_dropped() {
        let (set, mut accepted) = StreamSet::with_accept_queue();
        set.enqueue(Cell::new(CellType::EndOfStream, 5, 0, Vec::new()));
        let s = accepted.recv().await.unwrap();
        s.close_write();
        assert_eq!(set.dequeue(64).unwrap().cell_type, CellType::EndOfStream);
        assert!(set.get(5).is_none());
        set.enqueue(Cell::new(CellType::Normal, 5, 1, b"late".to_vec()));
        assert!(set.get(5).is_none());
        assert!(accepted.try_recv().is_err());
    }

    #[tokio::test]
    async fn retired_ids_stay_within_window() {
        let set = StreamSet::new();
        let mut first = None;
        for _ in 0..RETIRED_WINDOW + 500 {
            let s = set.create().unwrap();
            first.get_or_insert(s.id());
            s.close();
            assert_eq!(set.dequeue(64).unwrap().cell_type, CellType::EndOfStream);
        }
        assert!(set.is_empty());
        {
            let st = set.lock();
            assert_eq!(st.retired.len(), RETIRED_WINDOW);
            assert_eq!(st.retired_order.len(), RETIRED_WINDOW);
        }

        // The oldest id has aged out, so a cell for it opens a new stream.
        let first = first.unwrap();
        set.enqueue(Cell::new(CellType::Normal, first, 0, b"again".to_vec()));
        assert!(set.get(first).is_some());
    }

    #[tokio::test]
    async fn close_rejects_new_streams() {
        let set = StreamSet::new();
        let s = set.create().unwrap();
        set.close();
        assert!(s.is_closed());
        assert_eq!(set.create().unwrap_err(), Error::StreamClosed);
        assert!(set.is_empty());
    }
}
