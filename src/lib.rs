#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;
#[macro_use]
extern crate num_derive;

pub mod common;
pub mod crypto;
pub mod error;
pub mod relay;
pub mod socks5;

pub use common::addresses::{Address, RemoteAddress};
pub use common::constants;
pub use common::interface::SocksHandler;
pub use common::util::resolve_addr;
pub use crypto::password::{derive_key, parse_password, rand_password};
pub use crypto::{new_cipher, Cipher, CipherKind, CipherPair, KeyMaterial};
pub use error::Error;
pub use socks5::{LocalHandler, RemoteHandler, TunnelClient};
