use strum_macros::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    ConnectionError(#[from] ConnectionError),
    #[error(transparent)]
    ProtocolError(#[from] ProtocolError),
    #[error(transparent)]
    AuthorizationError(#[from] AuthorizationError),
    #[error(transparent)]
    RoomError(#[from] RoomError),
    #[error(transparent)]
    NegotiationError(#[from] NegotiationError),
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
}

impl Error {
    pub fn new_connection(message: String, kind: ConnectionErrorKind) -> Self {
        Error::ConnectionError(ConnectionError { kind, message })
    }

    pub fn new_protocol(message: String, kind: ProtocolErrorKind) -> Self {
        Error::ProtocolError(ProtocolError { kind, message })
    }

    pub fn new_authorization(message: String, kind: AuthorizationErrorKind) -> Self {
        Error::AuthorizationError(AuthorizationError { kind, message })
    }

    pub fn new_room(message: String, kind: RoomErrorKind) -> Self {
        Error::RoomError(RoomError { kind, message })
    }

    pub fn new_negotiation(message: String, kind: NegotiationErrorKind) -> Self {
        Error::NegotiationError(NegotiationError { kind, message })
    }

    pub fn new_config(message: String, kind: ConfigErrorKind) -> Self {
        Error::ConfigError(ConfigError { kind, message })
    }

    /// Returns the room error kind when this is a [`RoomError`].
    pub fn room_kind(&self) -> Option<RoomErrorKind> {
        match self {
            Error::RoomError(err) => Some(err.kind),
            _ => None,
        }
    }

    /// Returns the authorization error kind when this is an [`AuthorizationError`].
    pub fn authorization_kind(&self) -> Option<AuthorizationErrorKind> {
        match self {
            Error::AuthorizationError(err) => Some(err.kind),
            _ => None,
        }
    }

    /// Returns the connection error kind when this is a [`ConnectionError`].
    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Error::ConnectionError(err) => Some(err.kind),
            _ => None,
        }
    }
}

/// Read or write failure on a single client connection.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    Closed,
    ReadFailed,
    WriteFailed,
    QueueFull,
}

/// Unknown or malformed envelope.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    UnexpectedMessage,
    MalformedPayload,
    MissingHandshake,
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct AuthorizationError {
    pub kind: AuthorizationErrorKind,
    pub message: String,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationErrorKind {
    InvalidSecret,
    InvalidKey,
    Forbidden,
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct RoomError {
    pub kind: RoomErrorKind,
    pub message: String,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum RoomErrorKind {
    RoomStopped,
    DuplicateClient,
    ClientNotFound,
    RoomNotFound,
    RoomExists,
    UnsupportedRole,
    StreamerMissing,
}

/// SDP or ICE failure, local to one SFU participant.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct NegotiationError {
    pub kind: NegotiationErrorKind,
    pub message: String,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationErrorKind {
    LocalDescriptionMissing,
    SfuClosed,
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    InvalidValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::new_room("room bob is stopped".to_owned(), RoomErrorKind::RoomStopped);
        assert_eq!(err.to_string(), "RoomStopped: room bob is stopped");
        assert_eq!(err.room_kind(), Some(RoomErrorKind::RoomStopped));
        assert_eq!(err.authorization_kind(), None);
    }
}
