//! SocketReader behaviour over real loopback sockets.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use burrow_tunnel::reader::{SocketEvent, SocketReader};

async fn socket_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
    let addr = listener.local_addr().unwrap();
    let (connected, accepted) = tokio::join!(TcpStream::connect(addr), async {
        listener.accept().await.unwrap().0
    });
    (connected.unwrap(), accepted)
}

/// Wait for `live()` to drain to the expected value; the per-socket tasks
/// decrement it as they finish, slightly after their last event is seen.
async fn expect_live(reader: &SocketReader<i64>, want: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while reader.live() != want {
        assert!(
            tokio::time::Instant::now() < deadline,
            "live count stuck at {} (want {want})",
            reader.live()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn many_connections_are_tagged_data_then_eof() {
    const N: usize = 50;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (reader, mut events) = SocketReader::new(4096);

    // Keep our write halves alive so the only EOF comes from the client.
    let mut write_halves = Vec::with_capacity(N);
    for i in 0..N {
        let (mut client, accepted) = socket_pair(&listener).await;
        let (rd, wr) = accepted.into_split();
        write_halves.push(wr);
        reader.add(rd, i as i64);
        client.write_all(format!("{i}").as_bytes()).await.unwrap();
        // Dropping the client closes its socket: Data first, then Eof.
    }

    let mut received: Vec<Vec<u8>> = vec![Vec::new(); N];
    let mut eof_seen = vec![false; N];
    let mut eofs = 0;
    while eofs < N {
        let ev = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for a socket event")
            .expect("event channel closed");
        match ev {
            SocketEvent::Data(tag, bytes) => {
                let i = tag as usize;
                assert!(!eof_seen[i], "data after eof on tag {tag}");
                received[i].extend(bytes);
            }
            SocketEvent::Eof(tag) => {
                let i = tag as usize;
                assert_eq!(received[i], format!("{i}").as_bytes(), "tag {tag}");
                assert!(!eof_seen[i], "double eof on tag {tag}");
                eof_seen[i] = true;
                eofs += 1;
            }
            SocketEvent::Error(tag, e) => panic!("unexpected error on tag {tag}: {e}"),
        }
    }

    expect_live(&reader, 0).await;
}

#[tokio::test]
async fn abort_stops_events_from_that_tag() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (reader, mut events) = SocketReader::new(64);

    let (mut client, accepted) = socket_pair(&listener).await;
    let (rd, _wr) = accepted.into_split();
    let abort = reader.add(rd, 7);
    assert_eq!(reader.live(), 1);

    client.write_all(b"first").await.unwrap();
    match timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("no event for the first write")
        .expect("event channel closed")
    {
        SocketEvent::Data(tag, bytes) => {
            assert_eq!(tag, 7);
            assert_eq!(bytes, b"first");
        }
        _ => panic!("expected a Data event"),
    }

    abort.abort();
    expect_live(&reader, 0).await;

    // The read task is gone: further writes surface nothing.
    client.write_all(b"second").await.unwrap();
    assert!(
        timeout(Duration::from_millis(500), events.recv()).await.is_err(),
        "aborted socket still produced events"
    );
}

#[tokio::test]
async fn reset_connection_is_reported_as_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (reader, mut events) = SocketReader::new(64);

    let (client, accepted) = socket_pair(&listener).await;
    let (rd, _wr) = accepted.into_split();
    reader.add(rd, 3);

    // Linger 0 turns the close into an RST, which the blocked read sees as
    // an error rather than a clean EOF.
    client.set_linger(Some(Duration::from_secs(0))).unwrap();
    drop(client);

    match timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event after reset")
        .expect("event channel closed")
    {
        SocketEvent::Error(tag, _) => assert_eq!(tag, 3),
        SocketEvent::Eof(tag) => panic!("reset surfaced as clean eof on tag {tag}"),
        SocketEvent::Data(tag, _) => panic!("unexpected data on tag {tag}"),
    }
    expect_live(&reader, 0).await;
}
