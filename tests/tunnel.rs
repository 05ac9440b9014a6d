//! End-to-end tests: a local end, a remote end, and a destination server
//! wired together over loopback sockets.

use rand::RngCore;
use shadowx::{CipherKind, KeyMaterial, LocalHandler, RemoteAddress, RemoteHandler, SocksHandler};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const SECRET: &str = "correct horse battery staple but longer!";

fn keys(proto: CipherKind, data: CipherKind, secret: &str) -> (KeyMaterial, KeyMaterial) {
    (
        KeyMaterial::derive(proto, secret).unwrap(),
        KeyMaterial::derive(data, secret).unwrap(),
    )
}

async fn serve<H>(handler: H) -> SocketAddr
where
    H: SocksHandler + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let handler = Arc::new(handler);

        loop {
            let (mut incoming, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let _ = handler.accept_request(&mut incoming).await;
            });
        }
    });

    addr
}

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };

            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

async fn spawn_tunnel(proto: CipherKind, data: CipherKind, secret: &str) -> SocketAddr {
    let (proto_key, data_key) = keys(proto, data, secret);
    let remote_addr = serve(RemoteHandler::new(secret, proto_key, data_key)).await;

    let (proto_key, data_key) = keys(proto, data, secret);
    let remote = RemoteAddress::new(remote_addr.ip().to_string(), remote_addr.port());
    let local = LocalHandler::new(remote, secret, proto_key, data_key).await.unwrap();

    serve(local).await
}

/// Performs the plaintext SOCKS5 side of a CONNECT as an application would.
async fn socks5_connect(local: SocketAddr, destination: SocketAddr) -> TcpStream {
    let mut app = TcpStream::connect(local).await.unwrap();

    app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    match destination {
        SocketAddr::V4(v4) => request.extend_from_slice(&v4.ip().octets()),
        SocketAddr::V6(_) => unreachable!("tests use IPv4 loopback"),
    }
    request.extend_from_slice(&destination.port().to_be_bytes());
    app.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00, "expected a successful reply");

    app
}

#[tokio::test]
async fn connect_relays_both_directions() {
    let echo = spawn_tcp_echo().await;
    let local = spawn_tunnel(CipherKind::Aes128Cfb, CipherKind::Aes128Cfb, SECRET).await;

    let mut app = socks5_connect(local, echo).await;

    // A kilobyte each way, twice, to exercise keystream continuity.
    for _ in 0..2 {
        let mut payload = vec![0u8; 1024];
        rand::thread_rng().fill_bytes(&mut payload);

        app.write_all(&payload).await.unwrap();

        let mut echoed = vec![0u8; 1024];
        app.read_exact(&mut echoed).await.unwrap();

        assert_eq!(echoed, payload);
    }
}

#[tokio::test]
async fn connect_works_with_mixed_ciphers() {
    let echo = spawn_tcp_echo().await;

    // Table for the control plane, ChaCha20 for the data plane, keyed by a
    // password that satisfies both derivations.
    let password = shadowx::rand_password();
    let local = spawn_tunnel(CipherKind::Table, CipherKind::ChaCha20, &password).await;

    let mut app = socks5_connect(local, echo).await;

    app.write_all(b"ping over a mixed tunnel").await.unwrap();

    let mut echoed = [0u8; 24];
    app.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping over a mixed tunnel");
}

#[tokio::test]
async fn mismatched_secrets_fail_the_handshake() {
    let echo = spawn_tcp_echo().await;

    let (proto_key, data_key) = keys(CipherKind::Aes128Cfb, CipherKind::Aes128Cfb, SECRET);
    let remote_addr = serve(RemoteHandler::new(SECRET, proto_key, data_key)).await;

    let other = "a different secret that is long enough!!";
    let (proto_key, data_key) = keys(CipherKind::Aes128Cfb, CipherKind::Aes128Cfb, other);
    let remote = RemoteAddress::new(remote_addr.ip().to_string(), remote_addr.port());
    let local = serve(LocalHandler::new(remote, other, proto_key, data_key).await.unwrap()).await;

    let mut app = TcpStream::connect(local).await.unwrap();
    app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(&echo.port().to_be_bytes());
    app.write_all(&request).await.unwrap();

    // The tunnel handshake cannot survive different keys; the application
    // sees a failure reply, never an established relay.
    let mut reply = [0u8; 10];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_ne!(reply[1], 0x00);
}

#[tokio::test]
async fn bind_is_refused() {
    let local = spawn_tunnel(CipherKind::Aes128Cfb, CipherKind::Aes128Cfb, SECRET).await;

    let mut app = TcpStream::connect(local).await.unwrap();
    app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    app.read_exact(&mut reply).await.unwrap();

    // BIND request for 127.0.0.1:0.
    let request = [0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 0];
    app.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07);
}

#[tokio::test]
async fn greeting_without_anonymous_method_is_rejected() {
    let local = spawn_tunnel(CipherKind::Aes128Cfb, CipherKind::Aes128Cfb, SECRET).await;

    let mut app = TcpStream::connect(local).await.unwrap();

    // Only username/password offered; the local end accepts anonymous only.
    app.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut reply = [0u8; 2];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);

    // The connection is closed afterwards.
    let mut rest = [0u8; 1];
    assert_eq!(app.read(&mut rest).await.unwrap(), 0);
}

#[tokio::test]
async fn udp_associate_relays_datagrams() {
    // UDP echo destination.
    let destination = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let destination_addr = destination.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            match destination.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    let _ = destination.send_to(&buf[..n], peer).await;
                }
                Err(_) => break,
            }
        }
    });

    let local = spawn_tunnel(CipherKind::Aes128Cfb, CipherKind::Aes128Cfb, SECRET).await;

    // UDP ASSOCIATE over the SOCKS5 TCP connection.
    let mut app = TcpStream::connect(local).await.unwrap();
    app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    app.read_exact(&mut reply).await.unwrap();

    let request = [0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
    app.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    let relay_port = u16::from_be_bytes([reply[8], reply[9]]);
    let relay_addr = SocketAddr::from(([127, 0, 0, 1], relay_port));

    // Send one datagram through the association, SOCKS5-framed.
    let app_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = vec![0x00, 0x00, 0x00, 0x01, 127, 0, 0, 1];
    datagram.extend_from_slice(&destination_addr.port().to_be_bytes());
    datagram.extend_from_slice(b"udp ping");
    app_udp.send_to(&datagram, relay_addr).await.unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = app_udp.recv_from(&mut buf).await.unwrap();

    // Reply header: RSV RSV FRAG ATYP ADDR(4) PORT(2), then the payload.
    assert!(n > 10);
    assert_eq!(buf[2], 0x00);
    assert_eq!(buf[3], 0x01);
    assert_eq!(&buf[n - 8..n], b"udp ping");
}
