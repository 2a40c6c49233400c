//! The in-memory message model routed by the daemon, and the frame codec
//! used to move messages between routers.
//!
//! Routing never looks at marshalled bytes: endpoints decode a frame into a
//! [`Message`] on receive and encode on transmit, everything in between works
//! on the decoded form. A frame is a 4-byte little-endian length prefix
//! followed by a bincode payload.

use enumflags2::{bitflags, BitFlags};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Version of the session control protocol spoken between routers.
///
/// `RemoveSessionMember` and `SessionLostWithReason` require ≥ 7 at the far
/// end; explicit name-transfer negotiation requires ≥ 9.
pub const PROTOCOL_VERSION: u32 = 10;

/// Upper bound on a single wire frame.
pub const MAX_FRAME_LEN: u32 = 1 << 17;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),
    #[error("malformed frame: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("argument {index} missing or not a {expected}")]
    BadArg { index: usize, expected: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageFlags {
    NoReplyExpected = 0x01,
    AutoStart = 0x02,
    AllowRemoteMessages = 0x04,
    Sessionless = 0x10,
    GlobalBroadcast = 0x20,
}

/// Transports a name is advertised on or a session may be carried over.
#[bitflags]
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMask {
    Local = 0x0001,
    Tcp = 0x0004,
}

/// All transport bits set.
pub fn transport_any() -> BitFlags<TransportMask> {
    BitFlags::all()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Traffic {
    Messages,
    RawUnreliable,
    RawReliable,
}

/// Which names a router shares with its peer over a bus-to-bus link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameTransfer {
    /// Every locally owned unique name with its aliases.
    AllNames,
    /// Only this router's controller name.
    ControllerOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOpts {
    pub traffic: Traffic,
    pub is_multipoint: bool,
    pub proximity: u8,
    pub transports: BitFlags<TransportMask>,
    pub name_transfer: NameTransfer,
}

pub const PROXIMITY_ANY: u8 = 0xff;

impl SessionOpts {
    pub fn messages_point_to_point() -> Self {
        Self {
            traffic: Traffic::Messages,
            is_multipoint: false,
            proximity: PROXIMITY_ANY,
            transports: transport_any(),
            name_transfer: NameTransfer::AllNames,
        }
    }

    pub fn messages_multipoint() -> Self {
        Self {
            is_multipoint: true,
            ..Self::messages_point_to_point()
        }
    }

    pub fn raw_reliable_point_to_point() -> Self {
        Self {
            traffic: Traffic::RawReliable,
            ..Self::messages_point_to_point()
        }
    }

    /// Whether a joiner requesting `other` can be admitted to a session
    /// bound with `self`. Multipointness is taken from the binder, so it
    /// does not participate here.
    pub fn is_compatible(&self, other: &SessionOpts) -> bool {
        self.traffic == other.traffic
            && self.transports.intersects(other.transports)
            && (self.proximity & other.proximity) != 0
    }
}

/// One row of an ExchangeNames payload: a unique name with the well-known
/// aliases it owns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameSetEntry {
    pub unique: String,
    pub aliases: Vec<String>,
}

/// A decoded message argument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Bool(bool),
    U16(u16),
    U32(u32),
    U64(u64),
    Str(String),
    StrArray(Vec<String>),
    NameSet(Vec<NameSetEntry>),
    SessionOpts(SessionOpts),
}

impl Arg {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Arg::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Arg::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str_array(&self) -> Option<&[String]> {
        match self {
            Arg::StrArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_name_set(&self) -> Option<&[NameSetEntry]> {
        match self {
            Arg::NameSet(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_session_opts(&self) -> Option<&SessionOpts> {
        match self {
            Arg::SessionOpts(v) => Some(v),
            _ => None,
        }
    }
}

/// A decoded bus message.
///
/// `serial` is assigned by the sending attachment (or by the router for
/// locally originated messages). `session_id` is zero for everything that is
/// not session multicast — including, notoriously, the DetachSession daemon
/// signal, which carries the real id in its first body argument instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub ty: MessageType,
    pub serial: u32,
    pub reply_serial: Option<u32>,
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub session_id: u32,
    pub flags: BitFlags<MessageFlags>,
    pub ttl_ms: Option<u32>,
    pub args: Vec<Arg>,
    /// Unique name of the endpoint this message arrived on. Stamped by the
    /// receiving endpoint, never marshalled.
    #[serde(skip)]
    pub rcv_endpoint: Option<String>,
}

impl Message {
    pub fn method_call(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        args: Vec<Arg>,
    ) -> Self {
        Self {
            ty: MessageType::MethodCall,
            serial: 0,
            reply_serial: None,
            sender: None,
            destination: Some(destination.into()),
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            error_name: None,
            session_id: 0,
            flags: BitFlags::empty(),
            ttl_ms: None,
            args,
            rcv_endpoint: None,
        }
    }

    pub fn method_return(call: &Message, args: Vec<Arg>) -> Self {
        Self {
            ty: MessageType::MethodReturn,
            serial: 0,
            reply_serial: Some(call.serial),
            sender: None,
            destination: call.sender.clone(),
            path: None,
            interface: None,
            member: None,
            error_name: None,
            session_id: 0,
            flags: BitFlags::empty(),
            ttl_ms: None,
            args,
            rcv_endpoint: None,
        }
    }

    pub fn error(call: &Message, error_name: impl Into<String>, description: &str) -> Self {
        Self {
            ty: MessageType::Error,
            serial: 0,
            reply_serial: Some(call.serial),
            sender: None,
            destination: call.sender.clone(),
            path: None,
            interface: None,
            member: None,
            error_name: Some(error_name.into()),
            session_id: 0,
            flags: BitFlags::empty(),
            ttl_ms: None,
            args: vec![Arg::Str(description.to_owned())],
            rcv_endpoint: None,
        }
    }

    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        args: Vec<Arg>,
    ) -> Self {
        Self {
            ty: MessageType::Signal,
            serial: 0,
            reply_serial: None,
            sender: None,
            destination: None,
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            error_name: None,
            session_id: 0,
            flags: BitFlags::empty(),
            ttl_ms: None,
            args,
            rcv_endpoint: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_session_id(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_flags(mut self, flags: BitFlags<MessageFlags>) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_signal(&self) -> bool {
        self.ty == MessageType::Signal
    }

    pub fn is_sessionless(&self) -> bool {
        self.flags.contains(MessageFlags::Sessionless)
    }

    pub fn is_global_broadcast(&self) -> bool {
        self.flags.contains(MessageFlags::GlobalBroadcast)
    }

    /// Method calls without the no-reply flag expect exactly one reply.
    pub fn reply_expected(&self) -> bool {
        self.ty == MessageType::MethodCall && !self.flags.contains(MessageFlags::NoReplyExpected)
    }

    pub fn is_member(&self, interface: &str, member: &str) -> bool {
        self.interface.as_deref() == Some(interface) && self.member.as_deref() == Some(member)
    }

    /// Typed argument access with a routing-friendly error.
    pub fn arg(&self, index: usize) -> Result<&Arg, CodecError> {
        self.args.get(index).ok_or(CodecError::BadArg {
            index,
            expected: "argument",
        })
    }

    pub fn arg_u16(&self, index: usize) -> Result<u16, CodecError> {
        self.arg(index)?.as_u16().ok_or(CodecError::BadArg {
            index,
            expected: "u16",
        })
    }

    pub fn arg_u32(&self, index: usize) -> Result<u32, CodecError> {
        self.arg(index)?.as_u32().ok_or(CodecError::BadArg {
            index,
            expected: "u32",
        })
    }

    pub fn arg_str(&self, index: usize) -> Result<&str, CodecError> {
        self.arg(index)?.as_str().ok_or(CodecError::BadArg {
            index,
            expected: "string",
        })
    }

    pub fn arg_session_opts(&self, index: usize) -> Result<SessionOpts, CodecError> {
        self.arg(index)?
            .as_session_opts()
            .copied()
            .ok_or(CodecError::BadArg {
                index,
                expected: "session options",
            })
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(value)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let msg = Message::method_call(
            "org.alljoyn.Bus",
            "/org/alljoyn/Bus",
            "org.alljoyn.Bus",
            "BindSessionPort",
            vec![
                Arg::U16(42),
                Arg::SessionOpts(SessionOpts::messages_point_to_point()),
            ],
        );

        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &msg).await.unwrap();
        let decoded: Message = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn opts_compatibility() {
        let host = SessionOpts::messages_point_to_point();
        let mut joiner = host;
        assert!(host.is_compatible(&joiner));

        joiner.traffic = Traffic::RawReliable;
        assert!(!host.is_compatible(&joiner));

        joiner = host;
        joiner.transports = TransportMask::Local.into();
        let mut tcp_host = host;
        tcp_host.transports = TransportMask::Tcp.into();
        assert!(!tcp_host.is_compatible(&joiner));
    }

    #[test]
    fn reply_expected_honors_flag() {
        let mut msg = Message::method_call("x", "/", "i", "m", vec![]);
        assert!(msg.reply_expected());
        msg.flags |= MessageFlags::NoReplyExpected;
        assert!(!msg.reply_expected());
        assert!(!Message::signal("/", "i", "m", vec![]).reply_expected());
    }
}
