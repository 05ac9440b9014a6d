//! Connection state machines for both ends of the tunnel.
//!
//! The handshake types are pure protocol logic: they validate parsed
//! inbound messages against the state they expect, emit the outbound
//! message bytes, and advance. They never touch sockets or ciphers; the
//! handlers own the I/O and feed them. Any message that arrives out of
//! order, carries the wrong version, or fails validation moves the machine
//! to `Error` and the owning connection is torn down — there is no retry
//! and no partial recovery. Garbled bytes from a cipher mismatch surface
//! here as version or method violations.

use crate::common::addresses::Address;
use crate::common::constants::*;
use crate::common::util;
use crate::error::Error;
use crate::socks5::{Socks5Command, Socks5Reply, Socks5Request};
use num_traits::FromPrimitive;

/// States of the tunnel-originating (local) end, in wire order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Connected,
    SentInitialHandshake,
    ReceivedInitialHandshakeResponse,
    SentAuthentication,
    ReceivedAuthenticationResponse,
    WaitingCommand,
    SentCommand,
    ReceivedCommandResponse,
    WaitingConnection,
    Established,
    Disconnected,
    Error,
}

/// Drives the conversation with the remote end, one instance per
/// connection. Transitions are monotonic; only `Error` and `Disconnected`
/// can be entered out of order.
pub struct ClientHandshake {
    state: ClientState,
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHandshake {
    pub fn new() -> Self {
        ClientHandshake {
            state: ClientState::Created,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Marks the machine failed; used by the owning handler when an
    /// operation outside the message flow (e.g. the transport) gives up.
    pub fn fail(&mut self) {
        self.state = ClientState::Error;
    }

    pub fn disconnected(&mut self) {
        if self.state != ClientState::Error {
            self.state = ClientState::Disconnected;
        }
    }

    pub fn connected(&mut self) -> Result<(), Error> {
        self.expect(ClientState::Created, "transport connected")?;
        self.state = ClientState::Connected;

        Ok(())
    }

    /// Emits the greeting; only the token method is offered.
    pub fn greeting(&mut self) -> Result<Vec<u8>, Error> {
        self.expect(ClientState::Connected, "greeting")?;
        self.state = ClientState::SentInitialHandshake;

        Ok(vec![SOCKS_VER_5, 0x01, SOCKS_AUTH_TOKEN])
    }

    pub fn method_selected(&mut self, ver: u8, method: u8) -> Result<(), Error> {
        self.expect(ClientState::SentInitialHandshake, "method selection")?;
        self.check_version(ver)?;

        if method != SOCKS_AUTH_TOKEN {
            return Err(self.violation(format!("server selected unsupported method: {:#04x}", method)));
        }

        self.state = ClientState::ReceivedInitialHandshakeResponse;

        Ok(())
    }

    /// Emits the token sub-negotiation request: VER ULEN UTOKEN.
    pub fn authenticate(&mut self, token: &[u8]) -> Result<Vec<u8>, Error> {
        self.expect(ClientState::ReceivedInitialHandshakeResponse, "authentication")?;

        if token.is_empty() || token.len() > 255 {
            return Err(self.violation(format!("token must be 1 to 255 bytes, got {}", token.len())));
        }

        let mut message = vec![SOCKS_VER_5, token.len() as u8];
        message.extend_from_slice(token);

        self.state = ClientState::SentAuthentication;

        Ok(message)
    }

    pub fn auth_result(&mut self, ver: u8, status: u8) -> Result<(), Error> {
        self.expect(ClientState::SentAuthentication, "authentication result")?;
        self.check_version(ver)?;

        if status != SOCKS_AUTH_SUCCESS {
            return Err(self.violation(format!("authentication rejected with status {:#04x}", status)));
        }

        self.state = ClientState::ReceivedAuthenticationResponse;

        Ok(())
    }

    pub fn await_command(&mut self) -> Result<(), Error> {
        self.expect(ClientState::ReceivedAuthenticationResponse, "command readiness")?;
        self.state = ClientState::WaitingCommand;

        Ok(())
    }

    pub fn command(&mut self, request: Socks5Request) -> Result<Vec<u8>, Error> {
        self.expect(ClientState::WaitingCommand, "command")?;
        self.state = ClientState::SentCommand;

        Ok(request.into_socks_bytes())
    }

    pub fn command_reply(&mut self, ver: u8, rep: u8) -> Result<(), Error> {
        self.expect(ClientState::SentCommand, "command reply")?;
        self.check_version(ver)?;

        match Socks5Reply::from_u8(rep) {
            Some(Socks5Reply::Success) => {
                self.state = ClientState::ReceivedCommandResponse;
                Ok(())
            }
            Some(reply) => Err(self.violation(format!("request refused: {:?}", reply))),
            None => Err(self.violation(format!("unknown reply code: {:#04x}", rep))),
        }
    }

    pub fn await_connection(&mut self) -> Result<(), Error> {
        self.expect(ClientState::ReceivedCommandResponse, "connection wait")?;
        self.state = ClientState::WaitingConnection;

        Ok(())
    }

    pub fn established(&mut self) -> Result<(), Error> {
        self.expect(ClientState::WaitingConnection, "relay establishment")?;
        self.state = ClientState::Established;

        Ok(())
    }

    fn expect(&mut self, expected: ClientState, action: &str) -> Result<(), Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.violation(format!("{} while in state {:?}", action, self.state)))
        }
    }

    fn check_version(&mut self, ver: u8) -> Result<(), Error> {
        if ver == SOCKS_VER_5 {
            Ok(())
        } else {
            Err(self.violation(format!("unsupported SOCKS version: {:#04x}", ver)))
        }
    }

    fn violation(&mut self, message: String) -> Error {
        self.state = ClientState::Error;

        Error::ProtocolViolation(message)
    }
}

/// States of the dialing (remote) end, in wire order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Connected,
    ReceivedMethods,
    SentMethod,
    ReceivedAuth,
    SentAuthResult,
    ReceivedCommand,
    WaitingConnection,
    Established,
    Disconnected,
    Error,
}

/// Mirror of [`ClientHandshake`] from the remote peer's perspective.
pub struct ServerHandshake {
    state: ServerState,
    method: Option<u8>,
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandshake {
    pub fn new() -> Self {
        ServerHandshake {
            state: ServerState::Created,
            method: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn fail(&mut self) {
        self.state = ServerState::Error;
    }

    pub fn disconnected(&mut self) {
        if self.state != ServerState::Error {
            self.state = ServerState::Disconnected;
        }
    }

    pub fn connected(&mut self) -> Result<(), Error> {
        self.expect(ServerState::Created, "transport connected")?;
        self.state = ServerState::Connected;

        Ok(())
    }

    /// Validates the greeting and picks the authentication method; only the
    /// token method is supported.
    pub fn methods(&mut self, ver: u8, methods: &[u8]) -> Result<u8, Error> {
        self.expect(ServerState::Connected, "method negotiation")?;
        self.check_version(ver)?;

        let method = util::select_method(methods, &[SOCKS_AUTH_TOKEN]);
        if method == SOCKS_AUTH_NO_ACCEPTABLE_METHODS {
            return Err(self.violation("no acceptable authentication method offered".to_string()));
        }

        self.method = Some(method);
        self.state = ServerState::ReceivedMethods;

        Ok(method)
    }

    /// Emits the method selection reply.
    pub fn select_method(&mut self) -> Result<Vec<u8>, Error> {
        self.expect(ServerState::ReceivedMethods, "method selection")?;

        let method = match self.method {
            Some(method) => method,
            None => return Err(self.violation("no method negotiated".to_string())),
        };

        self.state = ServerState::SentMethod;

        Ok(vec![SOCKS_VER_5, method])
    }

    /// Validates the token against the configured secret. A mismatch is an
    /// authentication failure, not a transient error.
    pub fn authenticate(&mut self, ver: u8, token: &[u8], expected: &[u8]) -> Result<(), Error> {
        self.expect(ServerState::SentMethod, "authentication")?;
        self.check_version(ver)?;

        if token.is_empty() || token != expected {
            return Err(self.violation("token does not match the configured secret".to_string()));
        }

        self.state = ServerState::ReceivedAuth;

        Ok(())
    }

    /// Emits the successful authentication result.
    pub fn auth_result(&mut self) -> Result<Vec<u8>, Error> {
        self.expect(ServerState::ReceivedAuth, "authentication result")?;
        self.state = ServerState::SentAuthResult;

        Ok(vec![SOCKS_VER_5, SOCKS_AUTH_SUCCESS])
    }

    pub fn command(&mut self, ver: u8, cmd: u8, destination: Address) -> Result<Socks5Request, Error> {
        self.expect(ServerState::SentAuthResult, "command")?;
        self.check_version(ver)?;

        let command = match Socks5Command::from_u8(cmd) {
            Some(command) => command,
            None => return Err(self.violation(format!("unknown command: {:#04x}", cmd))),
        };

        self.state = ServerState::ReceivedCommand;

        Ok(Socks5Request::new(command, destination))
    }

    pub fn dialing(&mut self) -> Result<(), Error> {
        self.expect(ServerState::ReceivedCommand, "destination dialing")?;
        self.state = ServerState::WaitingConnection;

        Ok(())
    }

    pub fn established(&mut self) -> Result<(), Error> {
        self.expect(ServerState::WaitingConnection, "relay establishment")?;
        self.state = ServerState::Established;

        Ok(())
    }

    fn expect(&mut self, expected: ServerState, action: &str) -> Result<(), Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.violation(format!("{} while in state {:?}", action, self.state)))
        }
    }

    fn check_version(&mut self, ver: u8) -> Result<(), Error> {
        if ver == SOCKS_VER_5 {
            Ok(())
        } else {
            Err(self.violation(format!("unsupported SOCKS version: {:#04x}", ver)))
        }
    }

    fn violation(&mut self, message: String) -> Error {
        self.state = ServerState::Error;

        Error::ProtocolViolation(message)
    }
}
