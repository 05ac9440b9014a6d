use crate::common::addresses::{self, Address, RemoteAddress};
use crate::common::util;
use crate::crypto::{CipherPair, KeyMaterial};
use crate::relay::{self, CipherReader};
use crate::socks5::state::ClientHandshake;
use crate::socks5::Socks5Request;
use anyhow::Result;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Originates encrypted tunnel connections to the remote end.
///
/// One `connect` call drives the whole encrypted conversation described in
/// [rfc1928]: method negotiation, token authentication, and the command
/// naming the real destination. Everything after the IV exchange travels
/// through the protocol cipher.
///
/// [rfc1928] https://tools.ietf.org/html/rfc1928
#[derive(Clone)]
pub struct TunnelClient {
    remote_addr: SocketAddr,
    secret: String,
    proto_key: KeyMaterial,
    data_key: KeyMaterial,
}

impl TunnelClient {
    pub async fn new<S: Into<String>>(
        remote: RemoteAddress,
        secret: S,
        proto_key: KeyMaterial,
        data_key: KeyMaterial,
    ) -> Result<Self> {
        let remote_addr = util::resolve_addr(remote.to_string()).await?;

        let secret = secret.into();
        ensure!(!secret.is_empty(), "The secret MUST NOT be empty.");
        ensure!(secret.len() <= 255, "The secret MUST NOT be larger than 255 bytes.");

        Ok(TunnelClient {
            remote_addr,
            secret,
            proto_key,
            data_key,
        })
    }

    /// Opens a tunnel connection and drives it to the established state.
    ///
    /// Returns the connected stream, the cipher pair bound to it, and the
    /// address the remote end bound for this request (the dialed socket for
    /// CONNECT, the relay port for UDP ASSOCIATE).
    pub async fn connect(&self, request: Socks5Request) -> Result<(TcpStream, CipherPair, Address)> {
        let mut stream = TcpStream::connect(self.remote_addr).await?;

        let handshake = async {
            let mut pair = relay::exchange_ivs(&mut stream, &self.proto_key, &self.data_key).await?;

            let mut machine = ClientHandshake::new();
            machine.connected()?;

            // Method negotiation.
            let greeting = machine.greeting()?;
            relay::write_enc(&mut stream, pair.proto.as_mut(), &greeting).await?;

            let mut reply = [0; 2];
            relay::read_enc(&mut stream, pair.proto.as_mut(), &mut reply).await?;
            machine.method_selected(reply[0], reply[1])?;

            // Token authentication.
            let auth = machine.authenticate(self.secret.as_bytes())?;
            relay::write_enc(&mut stream, pair.proto.as_mut(), &auth).await?;

            let mut reply = [0; 2];
            relay::read_enc(&mut stream, pair.proto.as_mut(), &mut reply).await?;
            machine.auth_result(reply[0], reply[1])?;
            machine.await_command()?;

            // Command phase.
            let command = machine.command(request)?;
            relay::write_enc(&mut stream, pair.proto.as_mut(), &command).await?;

            let mut reply = [0; 3];
            relay::read_enc(&mut stream, pair.proto.as_mut(), &mut reply).await?;
            machine.command_reply(reply[0], reply[1])?;

            let binding = {
                let mut reader = CipherReader::new(&mut stream, &mut pair.proto);
                addresses::read_address(&mut reader).await?
            };

            machine.await_connection()?;
            machine.established()?;

            Ok::<_, anyhow::Error>((pair, binding))
        };

        let (pair, binding) = match tokio::time::timeout(super::HANDSHAKE_TIMEOUT, handshake).await {
            Ok(completed) => completed?,
            Err(_) => bail!("Tunnel handshake timed out."),
        };

        debug!("tunnel to {} established, bound to {}", self.remote_addr, binding.to_string());

        Ok((stream, pair, binding))
    }
}
