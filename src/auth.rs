//! Authentication at the daemon's edge.
//!
//! The handshake framing lives here; deciding whether a mechanism's
//! credentials hold is the [`AuthEngine`]'s business, and the bundled
//! engine only speaks ANONYMOUS. The same hello/welcome exchange carries
//! the bus-to-bus negotiation (GUID, protocol version, name transfer).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    codec::{self, CodecError, NameTransfer},
    guid::Guid,
};

pub const MECHANISM_ANONYMOUS: &str = "ANONYMOUS";

/// Explicit name-transfer negotiation arrived with protocol 9; older peers
/// inherit the mode from their session options.
pub const PROTOCOL_VERSION_NAME_TRANSFER: u32 = 9;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("handshake failed: {0}")]
    Codec(#[from] CodecError),
    #[error("mechanism `{0}` not supported")]
    UnsupportedMechanism(String),
    #[error("authentication rejected: {0}")]
    Rejected(String),
}

/// First frame on every fresh connection, client to server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloFrame {
    pub mechanism: String,
    /// Set when the peer is another router.
    pub guid: Option<Guid>,
    pub protocol_version: u32,
    pub bus_to_bus: bool,
    pub name_transfer: NameTransfer,
    /// Whether the attachment wants messages from behind bus-to-bus links.
    pub allow_remote: bool,
}

impl HelloFrame {
    pub fn attachment(allow_remote: bool) -> Self {
        Self {
            mechanism: MECHANISM_ANONYMOUS.to_string(),
            guid: None,
            protocol_version: codec::PROTOCOL_VERSION,
            bus_to_bus: false,
            name_transfer: NameTransfer::AllNames,
            allow_remote,
        }
    }

    pub fn router(guid: Guid, name_transfer: NameTransfer) -> Self {
        Self {
            mechanism: MECHANISM_ANONYMOUS.to_string(),
            guid: Some(guid),
            protocol_version: codec::PROTOCOL_VERSION,
            bus_to_bus: true,
            name_transfer,
            allow_remote: true,
        }
    }

    /// Name-transfer mode after version gating.
    pub fn negotiated_name_transfer(&self) -> NameTransfer {
        if self.protocol_version < PROTOCOL_VERSION_NAME_TRANSFER {
            NameTransfer::AllNames
        } else {
            self.name_transfer
        }
    }
}

/// Server's answer; after this frame the connection carries messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WelcomeFrame {
    pub guid: Guid,
    pub unique_name: String,
    pub protocol_version: u32,
    pub name_transfer: NameTransfer,
}

/// Decides whether a hello may proceed. Mechanism execution beyond the
/// bundled ANONYMOUS exchange is plugged in from outside.
pub trait AuthEngine: Send + Sync {
    fn verify(&self, hello: &HelloFrame) -> Result<(), AuthError>;
}

pub struct Anonymous;

impl AuthEngine for Anonymous {
    fn verify(&self, hello: &HelloFrame) -> Result<(), AuthError> {
        if hello.mechanism == MECHANISM_ANONYMOUS {
            Ok(())
        } else {
            Err(AuthError::UnsupportedMechanism(hello.mechanism.clone()))
        }
    }
}

/// Server side, step one: read the peer's hello.
pub async fn read_hello<S>(stream: &mut S) -> Result<HelloFrame, AuthError>
where
    S: AsyncRead + Unpin,
{
    Ok(codec::read_frame(stream).await?)
}

/// Server side, step two: welcome the peer onto the bus.
pub async fn send_welcome<S>(stream: &mut S, welcome: &WelcomeFrame) -> Result<(), AuthError>
where
    S: AsyncWrite + Unpin,
{
    Ok(codec::write_frame(stream, welcome).await?)
}

/// Client side: present a hello, wait to be let in.
pub async fn connect<S>(stream: &mut S, hello: &HelloFrame) -> Result<WelcomeFrame, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    codec::write_frame(stream, hello).await?;
    Ok(codec::read_frame(stream).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn anonymous_handshake_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let guid = Guid::generate();
        let server_guid = guid.clone();

        let server_task = tokio::spawn(async move {
            let hello = read_hello(&mut server).await.unwrap();
            Anonymous.verify(&hello).unwrap();
            assert!(!hello.bus_to_bus);
            send_welcome(
                &mut server,
                &WelcomeFrame {
                    guid: server_guid.clone(),
                    unique_name: format!(":{}.2", server_guid.short()),
                    protocol_version: codec::PROTOCOL_VERSION,
                    name_transfer: NameTransfer::AllNames,
                },
            )
            .await
            .unwrap();
        });

        let welcome = connect(&mut client, &HelloFrame::attachment(true))
            .await
            .unwrap();
        server_task.await.unwrap();
        assert_eq!(welcome.unique_name, format!(":{}.2", guid.short()));
    }

    #[test]
    fn unknown_mechanism_is_refused() {
        let mut hello = HelloFrame::attachment(true);
        hello.mechanism = "EXTERNAL".to_string();
        assert!(matches!(
            Anonymous.verify(&hello),
            Err(AuthError::UnsupportedMechanism(_))
        ));
    }

    #[test]
    fn old_peers_inherit_all_names() {
        let mut hello = HelloFrame::router(Guid::generate(), NameTransfer::ControllerOnly);
        assert_eq!(
            hello.negotiated_name_transfer(),
            NameTransfer::ControllerOnly
        );
        hello.protocol_version = 8;
        assert_eq!(hello.negotiated_name_transfer(), NameTransfer::AllNames);
    }
}
