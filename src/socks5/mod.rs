use crate::common::addresses::Address;
use crate::common::constants::*;
use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

mod s5_client;
mod s5_local;
mod s5_remote;
pub mod state;

pub use s5_client::TunnelClient;
pub use s5_local::LocalHandler;
pub use s5_remote::RemoteHandler;

/// A handshake that hasn't completed within this window is torn down; a
/// peer with mismatched keys produces garbled lengths that would otherwise
/// leave both ends blocked on reads forever.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[repr(u8)]
#[derive(Clone, Debug, FromPrimitive, PartialEq)]
pub enum Socks5Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// A command together with the destination it names. Immutable once the
/// command phase has parsed it.
#[derive(Clone, Debug)]
pub struct Socks5Request {
    pub command: Socks5Command,
    pub destination: Address,
}

impl Socks5Request {
    pub fn new(
        command: Socks5Command,
        destination: Address,
    ) -> Self {
        Socks5Request {
            command,
            destination,
        }
    }

    /// Encodes as VER CMD RSV ATYP ADDR PORT.
    pub fn into_socks_bytes(self) -> Vec<u8> {
        let mut data = vec![SOCKS_VER_5, self.command as u8, SOCKS_RSV];
        data.extend(self.destination.as_socks_bytes());

        data
    }
}

#[repr(u8)]
#[derive(Clone, Debug, FromPrimitive, PartialEq)]
pub enum Socks5Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TTLExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
    ConnectionAttemptTimeOut = 0x09,
}

/// Encodes a reply as VER REP RSV ATYP BND.ADDR BND.PORT.
pub fn make_reply(
    reply: Socks5Reply,
    binding: &Address,
) -> Vec<u8> {
    let mut data = vec![SOCKS_VER_5, reply as u8, SOCKS_RSV];
    data.extend(binding.as_socks_bytes());

    data
}

/// Writes a reply carrying the all-zero binding, for paths where no bound
/// address exists (refusals, failures).
pub async fn write_reply<S>(
    stream: &mut S,
    reply: Socks5Reply,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let unspecified = Address::from(SocketAddr::from(([0, 0, 0, 0], 0)));
    stream.write_all(&make_reply(reply, &unspecified)).await?;

    Ok(())
}
