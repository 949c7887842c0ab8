use crate::message::Address;

/// Errors returned from various operations.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("I/O error: {0:?}")]
    IoError(::std::io::ErrorKind),

    #[error("Nom error: {0:?}")]
    NomError(nom::error::ErrorKind),

    /// The modem refused a command, usually because it was busy.
    #[error("Command was not acknowledged by the modem")]
    NotAcknowledged,

    /// Failure to parse a [Frame](crate::Frame) or modem command.
    #[error("Parse error")]
    Parse,

    /// The modem did not echo a command in time.
    #[error("Operation timed out")]
    Timeout,

    /// An unexpected response was received.
    #[error("Unexpected response received")]
    UnexpectedResponse,

    /// An invalid [Address](crate::Address) string was passed.
    #[error("Invalid address format. Expected 'xx.xx.xx'.")]
    InvalidAddress,

    /// The modem was disconnected.
    #[error("Modem was disconnected.")]
    Disconnected,

    /// A buffer held fewer bytes than the wire format requires.
    #[error("frame too short: need {expected} bytes, got {got}")]
    FrameTooShort { expected: usize, got: usize },

    /// No message arrived before the receive deadline.
    #[error("read timeout")]
    ReadTimeout,

    /// The device did not acknowledge a message before the deadline.
    #[error("timeout waiting for device acknowledgement")]
    AckTimeout,

    /// The device answered with a negative acknowledgement.
    #[error("device sent a negative acknowledgement")]
    Nak,

    /// The device is not linked to the modem and will not talk to it.
    #[error("device is not linked to the modem")]
    NotLinked,

    /// Both halves of a link already exist.
    #[error("responder already linked to controller")]
    AlreadyLinked,

    /// No matching record in a link database.
    #[error("link not found in database")]
    LinkNotFound,

    #[error("invalid ttl {0}, must be in range 0-3")]
    InvalidTtl(u8),

    /// Every memory slot of the link database is taken.
    #[error("link database is full")]
    LinkDbFull,

    /// The device does not expose an all-link database.
    #[error("device {0} is not linkable")]
    NotLinkable(Address),

    /// The [Frame](crate::Frame) is only ever sent by the modem.
    #[error("frame cannot be sent to the modem")]
    Unencodable,
}

impl From<::std::io::Error> for Error {
    fn from(e: ::std::io::Error) -> Error {
        Error::IoError(e.kind())
    }
}

impl From<nom::error::ErrorKind> for Error {
    fn from(e: nom::error::ErrorKind) -> Error {
        Error::NomError(e)
    }
}

impl<I> From<nom::Err<nom::error::Error<I>>> for Error {
    fn from(e: nom::Err<nom::error::Error<I>>) -> Error {
        match e {
            nom::Err::Incomplete(_) => Error::Parse,
            nom::Err::Error(e) | nom::Err::Failure(e) => e.code.into(),
        }
    }
}

impl From<futures::channel::mpsc::SendError> for Error {
    fn from(_: futures::channel::mpsc::SendError) -> Error {
        Error::Disconnected
    }
}

impl<T> From<futures::channel::mpsc::TrySendError<T>> for Error {
    fn from(_: futures::channel::mpsc::TrySendError<T>) -> Error {
        Error::Disconnected
    }
}

impl From<futures::channel::oneshot::Canceled> for Error {
    fn from(_: futures::channel::oneshot::Canceled) -> Error {
        Error::Disconnected
    }
}
