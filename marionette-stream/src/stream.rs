#![forbid(unsafe_code)]

//! A single logical byte stream carried inside cells.
//!
//! Incoming cells are reordered by sequence id before their payload becomes
//! readable; outgoing bytes wait in a bounded write buffer until the engine
//! cuts them into cells with [`Stream::dequeue`].

use crate::cell::{Cell, CellType, CELL_HEADER_SIZE, MAX_CELL_LENGTH};
use crate::errors::{Error, Result};
use bytes::{Buf, BytesMut};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<Inner>,
}

struct Inner {
    id: u32,
    state: Mutex<State>,
    read_notify: Notify,
    write_notify: Notify,
    set_notify: Option<Arc<Notify>>,
}

struct State {
    read_buf: BytesMut,
    pending: BTreeMap<u32, Cell>,
    next_read_seq: u32,
    remote_eos: bool,
    read_closed: bool,

    write_buf: BytesMut,
    next_write_seq: u32,
    write_closed: bool,
    eos_sent: bool,

    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    last_activity: Instant,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.inner.id).finish()
    }
}

impl Stream {
    pub fn new(id: u32) -> Self {
        Self::build(id, None)
    }

    /// Stream whose write activity also wakes a set-wide waiter.
    pub(crate) fn with_set_notify(id: u32, notify: Arc<Notify>) -> Self {
        Self::build(id, Some(notify))
    }

    fn build(id: u32, set_notify: Option<Arc<Notify>>) -> Self {
        let state = State {
            read_buf: BytesMut::new(),
            pending: BTreeMap::new(),
            next_read_seq: 0,
            remote_eos: false,
            read_closed: false,
            write_buf: BytesMut::new(),
            next_write_seq: 0,
            write_closed: false,
            eos_sent: false,
            read_deadline: None,
            write_deadline: None,
            last_activity: Instant::now(),
        };
        Self {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(state),
                read_notify: Notify::new(),
                write_notify: Notify::new(),
                set_notify,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_read(&self) {
        self.inner.read_notify.notify_waiters();
    }

    fn signal_write(&self) {
        self.inner.write_notify.notify_waiters();
        if let Some(n) = &self.inner.set_notify {
            n.notify_waiters();
        }
    }

    /// Accept a received cell. Cells arriving ahead of the expected sequence
    /// id are held back; already delivered sequence ids are discarded.
    pub fn enqueue(&self, cell: Cell) {
        let mut st = self.lock();
        if st.read_closed || st.remote_eos || cell.sequence_id < st.next_read_seq {
            trace!(stream_id = self.id(), seq = cell.sequence_id, "stale cell dropped");
            return;
        }
        st.pending.entry(cell.sequence_id).or_insert(cell);
        let mut progressed = false;
        loop {
            let next = st.next_read_seq;
            let Some(cell) = st.pending.remove(&next) else { break };
            progressed = true;
            st.next_read_seq = next.wrapping_add(1);
            st.read_buf.extend_from_slice(&cell.payload);
            if cell.cell_type == CellType::EndOfStream {
                st.remote_eos = true;
                st.pending.clear();
                break;
            }
        }
        if progressed {
            st.last_activity = Instant::now();
            drop(st);
            self.signal_read();
        }
    }

    /// Read buffered bytes. Returns `Ok(0)` once the peer ended the stream and
    /// everything before the end marker has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.inner.read_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let deadline = {
                let mut st = self.lock();
                if st.read_closed {
                    return Err(Error::StreamClosed);
                }
                if !st.read_buf.is_empty() {
                    let n = buf.len().min(st.read_buf.len());
                    buf[..n].copy_from_slice(&st.read_buf[..n]);
                    st.read_buf.advance(n);
                    return Ok(n);
                }
                if st.remote_eos {
                    return Ok(0);
                }
                st.read_deadline
            };
            wait(notified, deadline).await?;
        }
    }

    /// Queue bytes for sending. A single write may not exceed
    /// [`MAX_CELL_LENGTH`]; a full write buffer blocks until the engine drains it.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.len() > MAX_CELL_LENGTH {
            return Err(Error::WriteTooLarge { len: data.len(), max: MAX_CELL_LENGTH });
        }
        loop {
            let notified = self.inner.write_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let deadline = {
                let mut st = self.lock();
                if st.write_closed {
                    return Err(Error::StreamClosed);
                }
                if st.write_buf.len() + data.len() <= MAX_CELL_LENGTH {
                    st.write_buf.extend_from_slice(data);
                    st.last_activity = Instant::now();
                    drop(st);
                    if !data.is_empty() {
                        self.signal_write();
                    }
                    return Ok(data.len());
                }
                st.write_deadline
            };
            wait(notified, deadline).await?;
        }
    }

    /// Write `data` in chunks of at most [`MAX_CELL_LENGTH`] bytes.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = data.len().min(MAX_CELL_LENGTH);
            self.write(&data[..n]).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Cut the next outgoing cell of total size `n`. Once the write side is
    /// closed and drained, a single end-of-stream cell is produced.
    pub fn dequeue(&self, n: usize) -> Option<Cell> {
        let mut st = self.lock();
        let budget = n.saturating_sub(CELL_HEADER_SIZE);
        let cell_type = if !st.write_buf.is_empty() {
            if budget == 0 {
                return None;
            }
            CellType::Normal
        } else if st.write_closed && !st.eos_sent {
            st.eos_sent = true;
            CellType::EndOfStream
        } else {
            return None;
        };
        let take = budget.min(st.write_buf.len());
        let payload = st.write_buf.split_to(take).to_vec();
        let seq = st.next_write_seq;
        st.next_write_seq = seq.wrapping_add(1);
        st.last_activity = Instant::now();
        drop(st);
        trace!(stream_id = self.id(), seq, len = payload.len(), ?cell_type, "cell dequeued");
        self.signal_write();
        Some(Cell::new(cell_type, self.id(), seq, payload).with_length(n))
    }

    /// Buffered bytes or an unsent end marker.
    pub fn has_pending(&self) -> bool {
        let st = self.lock();
        !st.write_buf.is_empty() || (st.write_closed && !st.eos_sent)
    }

    pub fn close_read(&self) {
        let mut st = self.lock();
        if st.read_closed {
            return;
        }
        st.read_closed = true;
        st.read_buf.clear();
        st.pending.clear();
        drop(st);
        self.signal_read();
    }

    pub fn close_write(&self) {
        let mut st = self.lock();
        if st.write_closed {
            return;
        }
        st.write_closed = true;
        drop(st);
        self.signal_write();
    }

    pub fn close(&self) {
        self.close_read();
        self.close_write();
    }

    /// Both directions closed, locally or by the peer's end marker.
    pub fn is_closed(&self) -> bool {
        let st = self.lock();
        (st.read_closed || st.remote_eos) && st.write_closed
    }

    /// Nothing left to send and nothing more to receive. Bytes already
    /// buffered stay readable through existing handles.
    pub fn is_finished(&self) -> bool {
        let st = self.lock();
        st.eos_sent && (st.read_closed || st.remote_eos)
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.lock().read_deadline = deadline;
        self.signal_read();
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.lock().write_deadline = deadline;
        self.inner.write_notify.notify_waiters();
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }
}

async fn wait(notified: Pin<&mut Notified<'_>>, deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, notified).await.map_err(|_| Error::Timeout),
        None => {
            notified.await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn data(seq: u32, payload: &[u8]) -> Cell {
        Cell::new(CellType::Normal, 1, seq, payload.to_vec())
    }

    async fn read_all(s: &Stream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = s.read(&mut buf).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn in_order_delivery() {
        let s = Stream::new(1);
        s.enqueue(data(0, b"foo"));
        s.enqueue(data(1, b"bar"));
        s.enqueue(Cell::new(CellType::EndOfStream, 1, 2, Vec::new()));
        assert_eq!(read_all(&s).await, b"foobar");
    }

    #[tokio::test]
    async fn out_of_order_delivery() {
        let s = Stream::new(1);
        s.enqueue(data(1, b"bar"));
        s.enqueue(data(0, b"foo"));
        s.enqueue(data(2, b"baz"));
        s.enqueue(Cell::new(CellType::EndOfStream, 1, 3, Vec::new()));
        assert_eq!(read_all(&s).await, b"foobarbaz");
    }

    #[tokio::test]
    async fn duplicates_are_suppressed() {
        let s = Stream::new(1);
        s.enqueue(data(0, b"foo"));
        s.enqueue(data(0, b"foo"));
        s.enqueue(data(2, b"baz"));
        s.enqueue(data(2, b"baz"));
        s.enqueue(data(1, b"bar"));
        s.enqueue(data(1, b"bar"));
        s.enqueue(Cell::new(CellType::EndOfStream, 1, 3, Vec::new()));
        assert_eq!(read_all(&s).await, b"foobarbaz");
    }

    #[tokio::test]
    async fn duplicate_does_not_wake_reader() {
        let s = Stream::new(1);
        s.enqueue(data(0, b"foo"));
        let notified = s.inner.read_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        s.enqueue(data(0, b"foo"));
        assert!(timeout(Duration::from_millis(20), notified.as_mut()).await.is_err());
        s.enqueue(data(1, b"bar"));
        assert!(timeout(Duration::from_millis(20), notified).await.is_ok());
    }

    #[tokio::test]
    async fn oversized_write_leaves_stream_untouched() {
        let s = Stream::new(1);
        let big = vec![0u8; MAX_CELL_LENGTH + 1];
        assert_eq!(s.write(&big).await, Err(Error::WriteTooLarge { len: MAX_CELL_LENGTH + 1, max: MAX_CELL_LENGTH }));
        assert!(!s.has_pending());
        assert!(s.dequeue(128).is_none());
    }

    #[tokio::test]
    async fn full_buffer_blocks_until_dequeue() {
        let s = Stream::new(1);
        let chunk = vec![7u8; MAX_CELL_LENGTH / 2 + 1];
        s.write(&chunk).await.unwrap();

        let mut second = tokio_test::task::spawn(s.write(&chunk));
        tokio_test::assert_pending!(second.poll());

        let cell = s.dequeue(MAX_CELL_LENGTH).unwrap();
        assert_eq!(cell.payload.len(), chunk.len());
        assert!(second.is_woken());
        tokio_test::assert_ready_eq!(second.poll(), Ok(chunk.len()));
    }

    #[tokio::test]
    async fn dequeue_respects_cell_size_and_sequence() {
        let s = Stream::new(9);
        s.write(b"abcdefghij").await.unwrap();
        let a = s.dequeue(CELL_HEADER_SIZE + 4).unwrap();
        let b = s.dequeue(CELL_HEADER_SIZE + 100).unwrap();
        assert_eq!(a.payload, b"abcd");
        assert_eq!((a.stream_id, a.sequence_id), (9, 0));
        assert_eq!(b.payload, b"efghij");
        assert_eq!(b.sequence_id, 1);
        assert_eq!(b.size(), CELL_HEADER_SIZE + 100);
        assert!(s.dequeue(128).is_none());
    }

    #[tokio::test]
    async fn end_of_stream_once() {
        let s = Stream::new(3);
        s.write(b"x").await.unwrap();
        s.close_write();
        assert_eq!(s.write(b"y").await, Err(Error::StreamClosed));
        assert_eq!(s.dequeue(64).unwrap().cell_type, CellType::Normal);
        let eos = s.dequeue(64).unwrap();
        assert_eq!(eos.cell_type, CellType::EndOfStream);
        assert_eq!(eos.sequence_id, 1);
        assert!(s.dequeue(64).is_none());
        assert!(!s.has_pending());
    }

    #[tokio::test]
    async fn close_unblocks_reader() {
        let s = Stream::new(1);
        let reader = s.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        s.close();
        s.close();
        assert_eq!(handle.await.unwrap(), Err(Error::StreamClosed));
        assert!(s.is_closed());
    }

    #[tokio::test]
    async fn read_deadline() {
        let s = Stream::new(1);
        s.set_read_deadline(Some(Instant::now() + Duration::from_millis(10)));
        let mut buf = [0u8; 4];
        assert_eq!(s.read(&mut buf).await, Err(Error::Timeout));
    }
}
