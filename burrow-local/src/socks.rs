//! Minimal SOCKS5 CONNECT acceptor.
//!
//! Only what a tunnel entry point needs: no-auth negotiation and the
//! CONNECT command. The success reply is sent immediately — the actual dial
//! happens at the far end of the tunnel, so there is no local connection to
//! report an address for.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_CMD_UNSUPPORTED: u8 = 0x07;
const REPLY_ATYP_UNSUPPORTED: u8 = 0x08;

/// A client that completed negotiation and wants `host_port` dialled.
#[derive(Debug)]
pub struct SocksClient {
    /// The accepted client socket, positioned right after the success reply.
    pub stream: TcpStream,
    /// Requested target as `host:port`.
    pub host_port: String,
}

/// How long one client may take to finish negotiating.
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept clients forever, pushing each successfully negotiated one into
/// `clients`.
pub async fn serve(listener: TcpListener, clients: mpsc::Sender<SocksClient>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("[socks] accept failed: {e}");
                continue;
            }
        };
        let tx = clients.clone();
        tokio::spawn(async move {
            match timeout(NEGOTIATE_TIMEOUT, negotiate(stream)).await {
                Ok(Ok(client)) => {
                    log::debug!("[socks] {peer} → {}", client.host_port);
                    let _ = tx.send(client).await;
                }
                Ok(Err(e)) => log::debug!("[socks] {peer} negotiation failed: {e}"),
                Err(_) => log::debug!("[socks] {peer} negotiation timed out"),
            }
        });
    }
}

async fn negotiate(mut stream: TcpStream) -> io::Result<SocksClient> {
    // Greeting: VER NMETHODS METHODS…
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("not SOCKS5 (version byte {:#04x})", head[0]),
        ));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP ADDR PORT
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[1] != CMD_CONNECT {
        reply(&mut stream, REPLY_CMD_UNSUPPORTED).await?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported command {:#04x}", request[1]),
        ));
    }

    let host = match request[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "domain is not UTF-8"))?
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            format!("[{}]", Ipv6Addr::from(addr))
        }
        other => {
            reply(&mut stream, REPLY_ATYP_UNSUPPORTED).await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported address type {other:#04x}"),
            ));
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    reply(&mut stream, REPLY_SUCCESS).await?;
    Ok(SocksClient {
        stream,
        host_port: format!("{host}:{port}"),
    })
}

/// VER REP RSV ATYP=IPv4 BND.ADDR=0.0.0.0 BND.PORT=0
async fn reply(stream: &mut TcpStream, code: u8) -> io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::JoinHandle;

    async fn negotiation_pair() -> (TcpStream, JoinHandle<io::Result<SocksClient>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.unwrap().0
        });
        (connected.unwrap(), tokio::spawn(negotiate(accepted)))
    }

    /// Greeting (no-auth) up to and including the method reply.
    async fn greet(client: &mut TcpStream) {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [SOCKS_VERSION, METHOD_NO_AUTH]);
    }

    async fn read_reply(client: &mut TcpStream) -> u8 {
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], SOCKS_VERSION);
        reply[1]
    }

    #[tokio::test]
    async fn ipv4_connect_yields_host_port() {
        let (mut client, task) = negotiation_pair().await;
        greet(&mut client).await;
        client
            .write_all(&[0x05, CMD_CONNECT, 0x00, 0x01, 10, 0, 0, 1, 0x1f, 0x90])
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, REPLY_SUCCESS);
        let negotiated = task.await.unwrap().unwrap();
        assert_eq!(negotiated.host_port, "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn domain_connect_yields_host_port() {
        let (mut client, task) = negotiation_pair().await;
        greet(&mut client).await;
        let mut request = vec![0x05, CMD_CONNECT, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.org");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();
        assert_eq!(read_reply(&mut client).await, REPLY_SUCCESS);
        let negotiated = task.await.unwrap().unwrap();
        assert_eq!(negotiated.host_port, "example.org:443");
    }

    #[tokio::test]
    async fn ipv6_connect_is_bracketed() {
        let (mut client, task) = negotiation_pair().await;
        greet(&mut client).await;
        let mut request = vec![0x05, CMD_CONNECT, 0x00, 0x04];
        let mut addr = [0u8; 16];
        addr[15] = 1; // ::1
        request.extend_from_slice(&addr);
        request.extend_from_slice(&53u16.to_be_bytes());
        client.write_all(&request).await.unwrap();
        assert_eq!(read_reply(&mut client).await, REPLY_SUCCESS);
        let negotiated = task.await.unwrap().unwrap();
        assert_eq!(negotiated.host_port, "[::1]:53");
    }

    #[tokio::test]
    async fn bind_command_is_refused() {
        let (mut client, task) = negotiation_pair().await;
        greet(&mut client).await;
        // CMD 0x02 = BIND, which the tunnel does not speak.
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, REPLY_CMD_UNSUPPORTED);
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn unknown_address_type_is_refused() {
        let (mut client, task) = negotiation_pair().await;
        greet(&mut client).await;
        client
            .write_all(&[0x05, CMD_CONNECT, 0x00, 0x05])
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, REPLY_ATYP_UNSUPPORTED);
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn non_utf8_domain_is_refused() {
        let (mut client, task) = negotiation_pair().await;
        greet(&mut client).await;
        client
            .write_all(&[0x05, CMD_CONNECT, 0x00, 0x03, 3, 0xff, 0xfe, 0xfd, 0, 80])
            .await
            .unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn wrong_version_is_refused() {
        let (mut client, task) = negotiation_pair().await;
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
