//! Carrier handshake over loopback.

use tokio::net::{TcpListener, TcpStream};

use burrow_tunnel::handshake;
use burrow_tunnel::{TunnelError, TunnelKey};

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connected, accepted) = tokio::join!(TcpStream::connect(addr), async {
        listener.accept().await.unwrap().0
    });
    (connected.unwrap(), accepted)
}

#[tokio::test]
async fn matching_keys_exchange_the_comm_id() {
    let key = TunnelKey::from_secret(b"foo bar foo bar ").unwrap();
    let (mut initiator, mut responder) = socket_pair().await;

    let responder_key = key.clone();
    let accept = tokio::spawn(async move { handshake::accept(&mut responder, &responder_key).await });

    handshake::initiate(&mut initiator, &key, 0x1122334455667788).await.unwrap();
    let comm_id = accept.await.unwrap().unwrap();
    assert_eq!(comm_id, 0x1122334455667788);
}

#[tokio::test]
async fn mismatched_keys_are_rejected_with_status_zero() {
    let local_key = TunnelKey::from_secret(b"wrong key wrong ").unwrap();
    let remote_key = TunnelKey::from_secret(b"foo bar foo bar ").unwrap();
    let (mut initiator, mut responder) = socket_pair().await;

    let accept = tokio::spawn(async move { handshake::accept(&mut responder, &remote_key).await });

    match handshake::initiate(&mut initiator, &local_key, 1).await {
        Err(TunnelError::AuthRejected) => {}
        Ok(()) => panic!("handshake must not succeed across different keys"),
        Err(e) => panic!("expected AuthRejected, got {e}"),
    }
    match accept.await.unwrap() {
        Err(TunnelError::AuthRejected) => {}
        other => panic!("responder must reject too, got {other:?}"),
    }
}

#[tokio::test]
async fn connect_dials_and_authenticates() {
    let key = TunnelKey::from_secret(b"foo bar foo bar ").unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let responder_key = key.clone();
    let accept = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake::accept(&mut stream, &responder_key).await
    });

    let stream = handshake::connect(&addr, &key, 99).await.unwrap();
    assert!(stream.peer_addr().is_ok());
    assert_eq!(accept.await.unwrap().unwrap(), 99);
}
