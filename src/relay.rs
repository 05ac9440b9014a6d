//! Byte movement once a tunnel is established, plus the small pieces of
//! ciphered I/O the handshake itself needs.

use crate::common::addresses::{self, Address};
use crate::common::constants::*;
use crate::common::util;
use crate::crypto::{Cipher, CipherPair, KeyMaterial};
use crate::error::Error;
use bytes::{BufMut, BytesMut};
use futures::ready;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::{io, net::Ipv4Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

const RELAY_BUF_SIZE: usize = 16 * 1024;
const DATAGRAM_BUF_SIZE: usize = 64 * 1024;

/// Reads exactly `buf.len()` bytes and decrypts them in place.
pub(crate) async fn read_enc<S>(
    stream: &mut S,
    cipher: &mut dyn Cipher,
    buf: &mut [u8],
) -> Result<(), Error>
where
    S: AsyncRead + Unpin,
{
    stream.read_exact(buf).await?;
    cipher.decrypt(buf)?;

    Ok(())
}

/// Encrypts a copy of `data` and writes it out in full.
pub(crate) async fn write_enc<S>(
    stream: &mut S,
    cipher: &mut dyn Cipher,
    data: &[u8],
) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let mut data = data.to_vec();
    cipher.encrypt(&mut data)?;
    stream.write_all(&data).await?;

    Ok(())
}

/// Adapter that decrypts everything read through it, so variable-length
/// wire structures (addresses) can be parsed straight off the encrypted
/// stream.
pub(crate) struct CipherReader<'a, S> {
    stream: &'a mut S,
    cipher: &'a mut Box<dyn Cipher>,
}

impl<'a, S> CipherReader<'a, S> {
    pub fn new(stream: &'a mut S, cipher: &'a mut Box<dyn Cipher>) -> Self {
        CipherReader { stream, cipher }
    }
}

impl<'a, S> AsyncRead for CipherReader<'a, S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let already_filled = buf.filled().len();
        ready!(Pin::new(&mut *this.stream).poll_read(cx, buf))?;

        let fresh = &mut buf.filled_mut()[already_filled..];
        if !fresh.is_empty() {
            this.cipher
                .decrypt(fresh)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }

        Poll::Ready(Ok(()))
    }
}

/// Exchanges per-connection IVs and builds the connection's cipher pair.
///
/// Each endpoint sends a fresh random `proto_iv || data_iv` block in the
/// clear and reads the peer's, then seeds its outgoing keystreams with its
/// own block and its incoming keystreams with the peer's. Table ciphers
/// contribute zero bytes, so two table endpoints exchange nothing.
pub(crate) async fn exchange_ivs<S>(
    stream: &mut S,
    proto_key: &KeyMaterial,
    data_key: &KeyMaterial,
) -> Result<CipherPair, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let proto_iv = proto_key.random_iv();
    let data_iv = data_key.random_iv();

    let mut ours = Vec::with_capacity(proto_iv.len() + data_iv.len());
    ours.extend_from_slice(&proto_iv);
    ours.extend_from_slice(&data_iv);

    if !ours.is_empty() {
        stream.write_all(&ours).await?;
    }

    let mut theirs = vec![0u8; ours.len()];
    if !theirs.is_empty() {
        stream.read_exact(&mut theirs).await?;
    }

    let (peer_proto_iv, peer_data_iv) = theirs.split_at(proto_iv.len());

    Ok(CipherPair {
        proto: proto_key.session(&proto_iv, peer_proto_iv)?,
        data: data_key.session(&data_iv, peer_data_iv)?,
    })
}

/// Pumps bytes between the plaintext side and the tunnel until either
/// direction sees EOF or the transport fails. Closing one side tears down
/// the whole relay; half-close is not modeled.
pub async fn pump(
    plain: &mut TcpStream,
    tunnel: &mut TcpStream,
    cipher: &mut dyn Cipher,
) -> Result<(), Error> {
    let (mut plain_rd, mut plain_wr) = plain.split();
    let (mut tunnel_rd, mut tunnel_wr) = tunnel.split();

    let mut outbound = vec![0u8; RELAY_BUF_SIZE];
    let mut inbound = vec![0u8; RELAY_BUF_SIZE];

    loop {
        tokio::select! {
            read = plain_rd.read(&mut outbound) => {
                let n = read?;
                if n == 0 {
                    break;
                }

                cipher.encrypt(&mut outbound[..n])?;
                tunnel_wr.write_all(&outbound[..n]).await?;
            }
            read = tunnel_rd.read(&mut inbound) => {
                let n = read?;
                if n == 0 {
                    break;
                }

                cipher.decrypt(&mut inbound[..n])?;
                plain_wr.write_all(&inbound[..n]).await?;
            }
        }
    }

    Ok(())
}

/// Seals one datagram for the wire:
/// `proto_iv || data_iv || hdr_len (u16 BE) || ciphered header || ciphered payload`.
///
/// The header is the destination re-encoded as the SOCKS5 atyp+addr+port
/// triplet, ciphered with the protocol cipher; the payload is ciphered with
/// the data cipher. Every datagram gets fresh IVs and fresh cipher
/// instances because datagrams may be lost or reordered.
pub(crate) fn seal_datagram(
    proto_key: &KeyMaterial,
    data_key: &KeyMaterial,
    destination: &Address,
    payload: &[u8],
) -> Result<BytesMut, Error> {
    let proto_iv = proto_key.random_iv();
    let data_iv = data_key.random_iv();

    let mut header = destination.as_socks_bytes();
    proto_key.datagram(&proto_iv)?.encrypt(&mut header)?;

    let mut body = payload.to_vec();
    data_key.datagram(&data_iv)?.encrypt(&mut body)?;

    let mut frame =
        BytesMut::with_capacity(proto_iv.len() + data_iv.len() + 2 + header.len() + body.len());
    frame.put_slice(&proto_iv);
    frame.put_slice(&data_iv);
    frame.put_u16(header.len() as u16);
    frame.put_slice(&header);
    frame.put_slice(&body);

    Ok(frame)
}

/// Inverse of [`seal_datagram`].
pub(crate) async fn open_datagram(
    proto_key: &KeyMaterial,
    data_key: &KeyMaterial,
    frame: &[u8],
) -> Result<(Address, Vec<u8>), Error> {
    let proto_iv_len = proto_key.iv_len();
    let data_iv_len = data_key.iv_len();

    if frame.len() < proto_iv_len + data_iv_len + 2 {
        return Err(Error::malformed_address("datagram too short for its IVs"));
    }

    let (proto_iv, rest) = frame.split_at(proto_iv_len);
    let (data_iv, rest) = rest.split_at(data_iv_len);

    let header_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    let rest = &rest[2..];
    if rest.len() < header_len {
        return Err(Error::malformed_address("datagram shorter than its header length"));
    }

    let mut header = rest[..header_len].to_vec();
    proto_key.datagram(proto_iv)?.decrypt(&mut header)?;

    let mut cursor: &[u8] = &header;
    let destination = addresses::read_address(&mut cursor).await?;
    if !cursor.is_empty() {
        return Err(Error::malformed_address("trailing bytes after datagram header"));
    }

    let mut payload = rest[header_len..].to_vec();
    data_key.datagram(data_iv)?.decrypt(&mut payload)?;

    Ok((destination, payload))
}

/// Application-facing half of a UDP association.
///
/// Unwraps the standard SOCKS5 UDP request header from the application,
/// seals the datagram, and forwards it to the remote end's relay port;
/// replies travel the reverse path. Runs until the owning association
/// aborts it. Fragmented requests are dropped.
pub async fn udp_local(
    app: UdpSocket,
    remote: SocketAddr,
    proto_key: KeyMaterial,
    data_key: KeyMaterial,
) -> Result<(), Error> {
    let relay = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    relay.connect(remote).await?;

    let mut app_peer: Option<SocketAddr> = None;
    let mut app_buf = vec![0u8; DATAGRAM_BUF_SIZE];
    let mut relay_buf = vec![0u8; DATAGRAM_BUF_SIZE];

    loop {
        tokio::select! {
            received = app.recv_from(&mut app_buf) => {
                let (n, peer) = received?;
                app_peer = Some(peer);

                // RSV RSV FRAG precede the address; fragments are dropped.
                if n < 4 || app_buf[2] != SOCKS_UDP_FRAG_NONE {
                    continue;
                }

                let mut cursor = &app_buf[3..n];
                let destination = match addresses::read_address(&mut cursor).await {
                    Ok(destination) => destination,
                    Err(e) => {
                        debug!("dropping datagram: {}", e);
                        continue;
                    }
                };

                let frame = seal_datagram(&proto_key, &data_key, &destination, cursor)?;
                relay.send(&frame).await?;
            }
            received = relay.recv(&mut relay_buf) => {
                let n = received?;

                let (source, payload) = match open_datagram(&proto_key, &data_key, &relay_buf[..n]).await {
                    Ok(opened) => opened,
                    Err(e) => {
                        debug!("dropping datagram: {}", e);
                        continue;
                    }
                };

                if let Some(peer) = app_peer {
                    let source = source.as_socks_bytes();

                    let mut reply = BytesMut::with_capacity(3 + source.len() + payload.len());
                    reply.put_slice(&[SOCKS_RSV, SOCKS_RSV, SOCKS_UDP_FRAG_NONE]);
                    reply.put_slice(&source);
                    reply.put_slice(&payload);

                    app.send_to(&reply, peer).await?;
                }
            }
        }
    }
}

/// Remote half of a UDP association: opens sealed datagrams, forwards the
/// payload to the named destination, and seals replies back to the local
/// end. Runs until the owning association aborts it.
pub async fn udp_remote(
    relay: UdpSocket,
    proto_key: KeyMaterial,
    data_key: KeyMaterial,
) -> Result<(), Error> {
    let outbound = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;

    let mut local_peer: Option<SocketAddr> = None;
    let mut relay_buf = vec![0u8; DATAGRAM_BUF_SIZE];
    let mut outbound_buf = vec![0u8; DATAGRAM_BUF_SIZE];

    loop {
        tokio::select! {
            received = relay.recv_from(&mut relay_buf) => {
                let (n, peer) = received?;
                local_peer = Some(peer);

                let (destination, payload) = match open_datagram(&proto_key, &data_key, &relay_buf[..n]).await {
                    Ok(opened) => opened,
                    Err(e) => {
                        debug!("dropping datagram: {}", e);
                        continue;
                    }
                };

                let destination = match util::resolve_addr(destination.to_string()).await {
                    Ok(destination) => destination,
                    Err(e) => {
                        debug!("dropping datagram: {}", e);
                        continue;
                    }
                };

                outbound.send_to(&payload, destination).await?;
            }
            received = outbound.recv_from(&mut outbound_buf) => {
                let (n, from) = received?;

                if let Some(peer) = local_peer {
                    let frame = seal_datagram(&proto_key, &data_key, &Address::from(from), &outbound_buf[..n])?;
                    relay.send_to(&frame, peer).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{password, CipherKind};

    fn keys() -> (KeyMaterial, KeyMaterial) {
        let proto = KeyMaterial::derive(CipherKind::Table, &password::rand_password()).unwrap();
        let data = KeyMaterial::derive(CipherKind::Aes128Cfb, "0123456789abcdef").unwrap();

        (proto, data)
    }

    #[tokio::test]
    async fn datagram_framing_round_trips() {
        let (proto_key, data_key) = keys();
        let destination = Address::new("192.0.2.10", 5353);
        let payload = b"a reasonably sized datagram payload";

        let frame = seal_datagram(&proto_key, &data_key, &destination, payload).unwrap();
        let (decoded, opened) = open_datagram(&proto_key, &data_key, &frame).await.unwrap();

        assert_eq!(decoded, destination);
        assert_eq!(opened, payload.to_vec());
    }

    #[tokio::test]
    async fn datagram_with_domain_destination_round_trips() {
        let (proto_key, data_key) = keys();
        let destination = Address::new("resolver.example.com", 53);

        let frame = seal_datagram(&proto_key, &data_key, &destination, b"query").unwrap();
        let (decoded, opened) = open_datagram(&proto_key, &data_key, &frame).await.unwrap();

        assert_eq!(decoded, destination);
        assert_eq!(opened, b"query".to_vec());
    }

    #[tokio::test]
    async fn truncated_datagram_is_rejected() {
        let (proto_key, data_key) = keys();
        let frame = seal_datagram(&proto_key, &data_key, &Address::new("192.0.2.10", 53), b"x").unwrap();

        let err = open_datagram(&proto_key, &data_key, &frame[..frame.len() - 2])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedAddress(_) | Error::Transport(_)));
    }

    #[tokio::test]
    async fn iv_exchange_produces_interoperating_pairs() {
        let (mut left, mut right) = tokio::io::duplex(256);
        let (proto_key, data_key) = keys();

        let (left_pair, right_pair) = tokio::join!(
            exchange_ivs(&mut left, &proto_key, &data_key),
            exchange_ivs(&mut right, &proto_key, &data_key),
        );
        let mut left_pair = left_pair.unwrap();
        let mut right_pair = right_pair.unwrap();

        let mut message = b"negotiation bytes".to_vec();
        left_pair.proto.encrypt(&mut message).unwrap();
        right_pair.proto.decrypt(&mut message).unwrap();
        assert_eq!(&message, b"negotiation bytes");

        let mut payload = b"relayed payload".to_vec();
        right_pair.data.encrypt(&mut payload).unwrap();
        left_pair.data.decrypt(&mut payload).unwrap();
        assert_eq!(&payload, b"relayed payload");
    }
}
