use crate::common::addresses::{self, Address, RemoteAddress};
use crate::common::constants::*;
use crate::common::interface::SocksHandler;
use crate::crypto::KeyMaterial;
use crate::relay;
use crate::socks5::{self, Socks5Command, Socks5Reply, Socks5Request, TunnelClient};
use anyhow::Result;
use async_trait::async_trait;
use num_traits::FromPrimitive;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Application-facing end of the tunnel.
///
/// Speaks plain SOCKS5 with local applications (anonymous method only) and
/// forwards their intent through an encrypted tunnel connection per
/// request. Applications never see the cipher layer.
#[derive(Clone)]
pub struct LocalHandler {
    client: TunnelClient,
    proto_key: KeyMaterial,
    data_key: KeyMaterial,
}

impl LocalHandler {
    pub async fn new<S: Into<String>>(
        remote: RemoteAddress,
        secret: S,
        proto_key: KeyMaterial,
        data_key: KeyMaterial,
    ) -> Result<Self> {
        let client = TunnelClient::new(remote, secret, proto_key.clone(), data_key.clone()).await?;

        Ok(LocalHandler {
            client,
            proto_key,
            data_key,
        })
    }

    async fn connect(
        &self,
        source: &mut TcpStream,
        destination: Address,
    ) -> Result<()> {
        let peer = source.peer_addr()?;
        info!("tunneling {} for {}", destination.to_string(), peer);

        let request = Socks5Request::new(Socks5Command::Connect, destination);
        let (mut tunnel, mut pair, _binding) = match self.client.connect(request).await {
            Ok(connected) => connected,
            Err(e) => {
                socks5::write_reply(source, Socks5Reply::HostUnreachable).await?;
                return Err(e);
            }
        };

        // Notify source that the connection has been set up.
        socks5::write_reply(source, Socks5Reply::Success).await?;
        source.flush().await?;

        let relayed = relay::pump(source, &mut tunnel, pair.data.as_mut()).await;
        debug!("relay for {} finished", peer);

        relayed.map_err(Into::into)
    }

    async fn udp_associate(
        &self,
        source: &mut TcpStream,
        claimed: Address,
    ) -> Result<()> {
        let peer = source.peer_addr()?;

        let request = Socks5Request::new(Socks5Command::UdpAssociate, claimed);
        let (mut tunnel, _pair, binding) = match self.client.connect(request).await {
            Ok(connected) => connected,
            Err(e) => {
                socks5::write_reply(source, Socks5Reply::HostUnreachable).await?;
                return Err(e);
            }
        };

        // The remote advertises only its relay port; its address is the one
        // the tunnel already dialed.
        let remote_udp = SocketAddr::new(tunnel.peer_addr()?.ip(), binding.port());

        // Application-facing datagram socket, on the interface the
        // application reached us on.
        let app_sock = UdpSocket::bind((source.local_addr()?.ip(), 0)).await?;
        let bound = Address::from(app_sock.local_addr()?);

        source.write_all(&socks5::make_reply(Socks5Reply::Success, &bound)).await?;
        source.flush().await?;

        let udp_task = tokio::spawn(relay::udp_local(
            app_sock,
            remote_udp,
            self.proto_key.clone(),
            self.data_key.clone(),
        ));

        // The association lives as long as the TCP connection; any EOF (or
        // unexpected bytes) on either side tears the whole thing down.
        let mut source_buf = [0u8; 1];
        let mut tunnel_buf = [0u8; 1];
        tokio::select! {
            _ = source.read(&mut source_buf) => {}
            _ = tunnel.read(&mut tunnel_buf) => {}
        }

        udp_task.abort();
        debug!("udp association for {} closed", peer);

        Ok(())
    }
}

#[async_trait]
impl SocksHandler for LocalHandler {
    async fn accept_request(
        &self,
        source: &mut TcpStream,
    ) -> Result<()> {
        let mut request = [0; 2];
        source.read_exact(&mut request).await?;

        let socks_version = request[0];
        if socks_version != SOCKS_VER_5 {
            bail!("Client uses a different SOCKS version: {}.", socks_version);
        }

        // Get all authentication methods the client proposes.
        let nmethods = request[1] as usize;

        let mut methods = vec![0; nmethods];
        source.read_exact(&mut methods).await?;

        // Applications authenticate with the tunnel secret implicitly, so
        // only anonymous access is offered on this side.
        if !methods.contains(&SOCKS_AUTH_NOT_REQUIRED) {
            source.write_all(&[SOCKS_VER_5, SOCKS_AUTH_NO_ACCEPTABLE_METHODS]).await?;
            bail!("Client proposed no acceptable authentication method.");
        }

        source.write_all(&[SOCKS_VER_5, SOCKS_AUTH_NOT_REQUIRED]).await?;

        let mut request = [0; 3];
        source.read_exact(&mut request).await?;

        let socks_version = request[0];
        if socks_version != SOCKS_VER_5 {
            bail!("Client uses a different SOCKS version: {}.", socks_version);
        }

        let command = request[1];
        let destination = addresses::read_address(source).await?;

        match Socks5Command::from_u8(command) {
            Some(Socks5Command::Connect) => self.connect(source, destination).await,
            Some(Socks5Command::UdpAssociate) => self.udp_associate(source, destination).await,
            _ => {
                socks5::write_reply(source, Socks5Reply::CommandNotSupported).await?;
                bail!("Unsupported command: {:#04x}.", command);
            }
        }
    }

    async fn refuse_request(
        &self,
        source: &mut TcpStream,
    ) -> Result<()> {
        // Notify source that the connection is refused.
        socks5::write_reply(source, Socks5Reply::ConnectionRefused).await?;

        Ok(())
    }
}
