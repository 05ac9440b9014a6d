use crate::common::addresses::{self, Address};
use crate::common::constants::*;
use crate::common::interface::SocksHandler;
use crate::crypto::{CipherPair, KeyMaterial};
use crate::relay::{self, CipherReader};
use crate::socks5::state::ServerHandshake;
use crate::socks5::{self, Socks5Command, Socks5Reply};
use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};

/// Remote end of the tunnel.
///
/// Decrypts inbound protocol messages, validates them against the state
/// machine's expectation, dials the requested destination, and relays.
/// Garbled bytes from a key mismatch fail validation like any other
/// protocol violation: the connection closes, nothing is retried.
#[derive(Clone)]
pub struct RemoteHandler {
    secret: String,
    proto_key: KeyMaterial,
    data_key: KeyMaterial,
}

impl RemoteHandler {
    pub fn new<S: Into<String>>(
        secret: S,
        proto_key: KeyMaterial,
        data_key: KeyMaterial,
    ) -> Self {
        RemoteHandler {
            secret: secret.into(),
            proto_key,
            data_key,
        }
    }

    async fn connect(
        &self,
        source: &mut TcpStream,
        mut machine: ServerHandshake,
        mut pair: CipherPair,
        destination: Address,
    ) -> Result<()> {
        machine.dialing()?;

        let mut target = match TcpStream::connect(destination.to_string()).await {
            Ok(target) => target,
            Err(e) => {
                machine.fail();
                let reply = socks5::make_reply(Socks5Reply::HostUnreachable, &destination);
                relay::write_enc(source, pair.proto.as_mut(), &reply).await?;
                return Err(e.into());
            }
        };

        machine.established()?;
        info!("connected to {} for {}", destination.to_string(), source.peer_addr()?);

        let binding = Address::from(target.local_addr()?);
        let reply = socks5::make_reply(Socks5Reply::Success, &binding);
        relay::write_enc(source, pair.proto.as_mut(), &reply).await?;

        let relayed = relay::pump(&mut target, source, pair.data.as_mut()).await;
        machine.disconnected();

        relayed.map_err(Into::into)
    }

    async fn udp_associate(
        &self,
        source: &mut TcpStream,
        mut machine: ServerHandshake,
        mut pair: CipherPair,
    ) -> Result<()> {
        machine.dialing()?;

        // Datagrams from the local end arrive on this socket; its port is
        // advertised in the reply.
        let relay_sock = UdpSocket::bind((source.local_addr()?.ip(), 0)).await?;

        machine.established()?;

        let binding = Address::from(relay_sock.local_addr()?);
        let reply = socks5::make_reply(Socks5Reply::Success, &binding);
        relay::write_enc(source, pair.proto.as_mut(), &reply).await?;

        let udp_task = tokio::spawn(relay::udp_remote(
            relay_sock,
            self.proto_key.clone(),
            self.data_key.clone(),
        ));

        // Hold the association open until the tunnel connection goes away.
        let mut buf = [0u8; 1];
        let _ = source.read(&mut buf).await;

        udp_task.abort();
        machine.disconnected();

        Ok(())
    }

    /// Runs the encrypted conversation up to (and including) the command,
    /// leaving the connection one dial away from relaying.
    async fn handshake(
        &self,
        source: &mut TcpStream,
    ) -> Result<(ServerHandshake, CipherPair, Socks5Request)> {
        let mut pair = relay::exchange_ivs(source, &self.proto_key, &self.data_key).await?;

        let mut machine = ServerHandshake::new();
        machine.connected()?;

        // Method negotiation.
        let mut greeting = [0; 2];
        relay::read_enc(source, pair.proto.as_mut(), &mut greeting).await?;

        // A wrong version byte here means a non-SOCKS5 peer or a key
        // mismatch; fail before trusting the length byte next to it.
        if greeting[0] != SOCKS_VER_5 {
            machine.fail();
            bail!("Peer opened with version {:#04x}; wrong version or wrong key.", greeting[0]);
        }

        let nmethods = greeting[1] as usize;
        let mut methods = vec![0; nmethods];
        relay::read_enc(source, pair.proto.as_mut(), &mut methods).await?;

        let method = match machine.methods(greeting[0], &methods) {
            Ok(method) => method,
            Err(e) => {
                let reply = [SOCKS_VER_5, SOCKS_AUTH_NO_ACCEPTABLE_METHODS];
                relay::write_enc(source, pair.proto.as_mut(), &reply).await?;
                return Err(e.into());
            }
        };
        debug!("use authentication method: {:#04x}", method);

        let reply = machine.select_method()?;
        relay::write_enc(source, pair.proto.as_mut(), &reply).await?;

        // Token sub-negotiation.
        let mut header = [0; 2];
        relay::read_enc(source, pair.proto.as_mut(), &mut header).await?;

        let mut token = vec![0; header[1] as usize];
        relay::read_enc(source, pair.proto.as_mut(), &mut token).await?;

        if let Err(e) = machine.authenticate(header[0], &token, self.secret.as_bytes()) {
            let reply = [SOCKS_VER_5, SOCKS_AUTH_FAILED];
            relay::write_enc(source, pair.proto.as_mut(), &reply).await?;
            return Err(e.into());
        }

        let reply = machine.auth_result()?;
        relay::write_enc(source, pair.proto.as_mut(), &reply).await?;

        // Command phase.
        let mut header = [0; 3];
        relay::read_enc(source, pair.proto.as_mut(), &mut header).await?;

        let destination = {
            let mut reader = CipherReader::new(source, &mut pair.proto);
            addresses::read_address(&mut reader).await?
        };

        let request = match machine.command(header[0], header[1], destination) {
            Ok(request) => request,
            Err(e) => {
                let reply = socks5::make_reply(
                    Socks5Reply::CommandNotSupported,
                    &Address::from(SocketAddr::from(([0, 0, 0, 0], 0))),
                );
                relay::write_enc(source, pair.proto.as_mut(), &reply).await?;
                return Err(e.into());
            }
        };

        Ok((machine, pair, request))
    }
}

#[async_trait]
impl SocksHandler for RemoteHandler {
    async fn accept_request(
        &self,
        source: &mut TcpStream,
    ) -> Result<()> {
        let handshake = tokio::time::timeout(super::HANDSHAKE_TIMEOUT, self.handshake(source));
        let (mut machine, mut pair, request) = match handshake.await {
            Ok(completed) => completed?,
            Err(_) => bail!("Tunnel handshake timed out."),
        };

        match request.command {
            Socks5Command::Connect => self.connect(source, machine, pair, request.destination).await,
            Socks5Command::UdpAssociate => self.udp_associate(source, machine, pair).await,
            Socks5Command::Bind => {
                machine.fail();
                let reply = socks5::make_reply(
                    Socks5Reply::CommandNotSupported,
                    &Address::from(SocketAddr::from(([0, 0, 0, 0], 0))),
                );
                relay::write_enc(source, pair.proto.as_mut(), &reply).await?;
                bail!("BIND is not supported.");
            }
        }
    }

    async fn refuse_request(
        &self,
        source: &mut TcpStream,
    ) -> Result<()> {
        // Refusals happen before any IV exchange, so the peer only observes
        // a reply it cannot decrypt followed by the close.
        socks5::write_reply(source, Socks5Reply::ConnectionRefused).await?;

        Ok(())
    }
}
