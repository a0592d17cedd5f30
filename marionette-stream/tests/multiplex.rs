//! Two stream sets wired back to back through marshalled cells.

use marionette_stream::{Cell, StreamSet};
use std::time::Duration;
use tokio::time::timeout;

fn pump(from: &StreamSet, to: &StreamSet, cell_len: usize) -> usize {
    let mut moved = 0;
    while let Some(cell) = from.dequeue(cell_len) {
        let wire = cell.marshal().unwrap();
        to.enqueue(Cell::unmarshal(&wire).unwrap());
        moved += 1;
    }
    moved
}

#[tokio::test]
async fn streams_survive_a_round_trip() {
    let client = StreamSet::new();
    let (server, mut accepted) = StreamSet::with_accept_queue();

    let a = client.create().unwrap();
    let b = client.create().unwrap();
    a.write(b"first stream payload").await.unwrap();
    b.write(b"second").await.unwrap();
    a.close_write();

    assert!(pump(&client, &server, 32) >= 4);

    let mut got = Vec::new();
    for _ in 0..2 {
        let s = timeout(Duration::from_secs(1), accepted.recv()).await.unwrap().unwrap();
        let mut buf = vec![0u8; 64];
        let mut out = Vec::new();
        loop {
            let n = timeout(Duration::from_millis(50), s.read(&mut buf)).await;
            match n {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => panic!("read failed: {e}"),
            }
        }
        got.push((s.id(), out));
    }
    got.sort();
    let mut want = vec![(a.id(), b"first stream payload".to_vec()), (b.id(), b"second".to_vec())];
    want.sort();
    assert_eq!(got, want);

    let reply = server.get(a.id()).unwrap();
    reply.write(b"ack").await.unwrap();
    reply.close_write();
    pump(&server, &client, 64);
    let mut buf = [0u8; 8];
    assert_eq!(a.read(&mut buf).await.unwrap(), 3);
    assert_eq!(&buf[..3], b"ack");
    assert_eq!(a.read(&mut buf).await.unwrap(), 0);
    assert!(client.get(a.id()).is_none());
    assert!(server.get(a.id()).is_none());
}

#[tokio::test]
async fn write_wakes_set_waiters() {
    let set = StreamSet::new();
    let s = set.create().unwrap();
    let notify = set.write_notify();
    let notified = notify.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    s.write(b"x").await.unwrap();
    timeout(Duration::from_millis(100), notified).await.unwrap();
}
