use crate::common::constants::*;
use crate::error::Error;
use std::convert::TryFrom;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

/// Address of the remote end of the tunnel, as given in the configuration.
///
/// Accepts either a `shadow://host:port` URL or a bare `host:port` pair.
#[derive(Clone, Debug)]
pub struct RemoteAddress {
    pub host: String,
    pub port: u16,
}

impl RemoteAddress {
    pub fn new<S: Into<String>>(
        host: S,
        port: u16,
    ) -> Self {
        RemoteAddress {
            host: host.into(),
            port,
        }
    }
}

impl ToString for RemoteAddress {
    fn to_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl TryFrom<String> for RemoteAddress {
    type Error = anyhow::Error;

    fn try_from(remote_addr: String) -> anyhow::Result<Self> {
        if remote_addr.contains("://") {
            let remote_addr = Url::parse(&remote_addr)?;

            ensure!(
                remote_addr.scheme() == "shadow",
                "Unrecognized remote scheme: {}",
                remote_addr.scheme()
            );
            ensure!(
                remote_addr.host().is_some(),
                "Missing explicit IP/host in remote address."
            );
            ensure!(remote_addr.port().is_some(), "Missing explicit port in remote address.");

            Ok(Self::new(
                remote_addr.host().map(|h| h.to_string()).unwrap_or_default(),
                remote_addr.port().unwrap_or_default(),
            ))
        } else if let Some((host, port)) = remote_addr.split_once(':') {
            Ok(Self::new(host, port.parse()?))
        } else {
            bail!("Remote address doesn't seperate host and port by ':'.")
        }
    }
}

/// A destination as it appears on the SOCKS5 wire: a domain name or an IP,
/// always paired with a port.
#[derive(Clone, Debug, PartialEq)]
pub enum Address {
    Domainname { host: String, port: u16 },
    Ip(SocketAddr),
}

impl Address {
    pub fn new<S: Into<String>>(
        host: S,
        port: u16,
    ) -> Self {
        let host = host.into();

        if let Ok(host) = host.parse::<IpAddr>() {
            Address::Ip(SocketAddr::new(host, port))
        } else {
            Address::Domainname { host, port }
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Domainname { port, .. } => *port,
            Address::Ip(socket_addr) => socket_addr.port(),
        }
    }

    /// Encodes as the SOCKS5 atyp+addr+port triplet.
    pub fn as_socks_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![];

        match self {
            Address::Ip(dst_addr) => {
                match dst_addr.ip() {
                    IpAddr::V4(host) => {
                        bytes.push(SOCKS_ATYP_IPV4);
                        bytes.extend(host.octets().iter());
                    }
                    IpAddr::V6(host) => {
                        bytes.push(SOCKS_ATYP_IPV6);
                        bytes.extend(host.octets().iter());
                    }
                }

                bytes.extend(dst_addr.port().to_be_bytes().iter())
            }
            Address::Domainname { host, port } => {
                bytes.push(SOCKS_ATYP_DOMAINNAME);

                let host = host.as_bytes();
                bytes.push(host.len() as u8);
                bytes.extend(host);

                bytes.extend(port.to_be_bytes().iter());
            }
        }

        bytes
    }
}

impl ToString for Address {
    fn to_string(&self) -> String {
        match self {
            Address::Domainname { host, port } => format!("{}:{}", host, port),
            Address::Ip(socket_addr) => socket_addr.to_string(),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

/// Decodes a SOCKS5 atyp+addr+port triplet from the stream.
pub async fn read_address<S>(stream: &mut S) -> Result<Address, Error>
where
    S: AsyncRead + Unpin,
{
    // Read address type.
    let mut address_type = [0; 1];
    stream.read_exact(&mut address_type).await?;

    let dst_addr = match address_type[0] {
        SOCKS_ATYP_IPV4 => {
            let mut dst_addr = [0; 4];
            stream.read_exact(&mut dst_addr).await?;

            IpAddr::from(dst_addr).to_string()
        }
        SOCKS_ATYP_IPV6 => {
            let mut dst_addr = [0; 16];
            stream.read_exact(&mut dst_addr).await?;

            IpAddr::from(dst_addr).to_string()
        }
        SOCKS_ATYP_DOMAINNAME => {
            let mut length = [0; 1];
            stream.read_exact(&mut length).await?;

            let mut dst_addr = vec![0; length[0] as usize];
            stream.read_exact(&mut dst_addr).await?;

            String::from_utf8(dst_addr)
                .map_err(|_| Error::malformed_address("domain name is not valid UTF-8"))?
        }
        atyp => {
            return Err(Error::MalformedAddress(format!(
                "unknown address type: {:#04x}",
                atyp
            )));
        }
    };

    // Read destination port.
    let mut dst_port = [0; 2];
    stream.read_exact(&mut dst_port).await?;

    let dst_port = ((dst_port[0] as u16) << 8) | dst_port[1] as u16;

    Ok(Address::new(dst_addr, dst_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    #[tokio::test]
    async fn address_codec_round_trips() {
        for address in vec![
            Address::new("93.184.216.34", 443),
            Address::new("2606:2800:220:1::", 80),
            Address::new("example.com", 8080),
        ] {
            let bytes = address.as_socks_bytes();
            let mut cursor: &[u8] = &bytes;

            let decoded = read_address(&mut cursor).await.unwrap();
            assert_eq!(decoded, address);
            assert!(cursor.is_empty());
        }
    }

    #[tokio::test]
    async fn read_address_rejects_unknown_atyp() {
        let mut cursor: &[u8] = &[0x02, 0, 0, 0, 0, 0, 0];
        let err = read_address(&mut cursor).await.unwrap_err();

        assert!(matches!(err, Error::MalformedAddress(_)));
    }

    #[tokio::test]
    async fn read_address_fails_on_truncated_input() {
        let mut cursor: &[u8] = &[SOCKS_ATYP_IPV4, 127, 0];
        let err = read_address(&mut cursor).await.unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn remote_address_parses_both_forms() {
        let plain: RemoteAddress = String::from("198.51.100.7:8388").try_into().unwrap();
        assert_eq!(plain.host, "198.51.100.7");
        assert_eq!(plain.port, 8388);

        let url: RemoteAddress = String::from("shadow://tunnel.example.com:8388").try_into().unwrap();
        assert_eq!(url.host, "tunnel.example.com");
        assert_eq!(url.port, 8388);

        let bad: Result<RemoteAddress, _> = String::from("socks5://127.0.0.1:1080").try_into();
        assert!(bad.is_err());
    }
}
