use crate::MessageId;
use std::fmt;
use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Error plumbing for all socket and protocol state machines. `Wait`
/// means "not enough data or kernel capacity right now, retry on the next
/// readiness event"; everything else is fatal for the session it occurred
/// on.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(ErrorKind),
}

/// Broad classification of fatal errors, mirroring the disconnect
/// taxonomy: protocol violations, policy denials, transport failures,
/// plug-in loading failures and resource exhaustion.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    ProtocolViolation,
    PolicyDenied,
    TransportError,
    PluginLoadError,
    ResourceError,
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorKind {
    // Protocol violations
    MalformedHandshake,
    UnknownMessage(MessageId),
    Truncated,
    MalformedVarInt,
    UndefinedType(u16),
    ArityOverflow,
    SizeOverflow,
    DepthOverflow,
    TypeMismatch,
    // Policy denials
    WrongVersion,
    WrongPassword,
    TicketMismatch,
    StaleVersion,
    // Transport errors
    PeerClosed,
    WriteZero,
    Io(io::ErrorKind),
    // Plug-in loading errors
    PluginMissing,
    PluginVersionMismatch,
    // Resource errors
    BufferOverflow,
}

impl ErrorKind {
    pub fn class(&self) -> ErrorClass {
        use ErrorKind::*;
        match self {
            MalformedHandshake | UnknownMessage(_) | Truncated | MalformedVarInt
            | UndefinedType(_) | ArityOverflow | SizeOverflow | DepthOverflow | TypeMismatch => {
                ErrorClass::ProtocolViolation
            }
            WrongVersion | WrongPassword | TicketMismatch | StaleVersion => {
                ErrorClass::PolicyDenied
            }
            PeerClosed | WriteZero | Io(_) => ErrorClass::TransportError,
            PluginMissing | PluginVersionMismatch => ErrorClass::PluginLoadError,
            BufferOverflow => ErrorClass::ResourceError,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetError::Wait => write!(f, "operation would block"),
            NetError::Fatal(kind) => write!(f, "{}", kind),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorKind::*;
        match self {
            MalformedHandshake => write!(f, "Malformed handshake message"),
            UnknownMessage(id) => write!(f, "Unknown message ID {}", id),
            Truncated => write!(f, "Truncated message"),
            MalformedVarInt => write!(f, "Malformed variable-width integer"),
            UndefinedType(id) => write!(f, "Data type dictionary references undefined type {}", id),
            ArityOverflow => write!(f, "Structure arity exceeds 256 elements"),
            SizeOverflow => write!(f, "Array size exceeds 65536 elements"),
            DepthOverflow => write!(f, "Data type nesting exceeds maximum depth"),
            TypeMismatch => write!(f, "Value does not match its declared data type"),
            WrongVersion => write!(f, "Unsupported protocol version"),
            WrongPassword => write!(f, "Wrong session password"),
            TicketMismatch => write!(f, "UDP connection ticket mismatch"),
            StaleVersion => write!(f, "Replace request against stale object version"),
            PeerClosed => write!(f, "Peer closed the connection"),
            WriteZero => write!(f, "Socket accepted zero bytes"),
            Io(kind) => write!(f, "I/O error: {:?}", kind),
            PluginMissing => write!(f, "Plug-in protocol not available"),
            PluginVersionMismatch => write!(f, "Plug-in protocol version mismatch"),
            BufferOverflow => write!(f, "Message buffer capacity exceeded"),
        }
    }
}

impl From<io::Error> for NetError {
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    /// True if the result is a fatal error; `Ok` and `Wait` are not
    /// failures.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        matches!(self, Err(NetError::Fatal(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetError::Wait);
    }

    #[test]
    fn test_other_io_errors_are_fatal() {
        let err: NetError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(
            err,
            NetError::Fatal(ErrorKind::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_wait_is_not_a_failure() {
        let wait: NetResult<()> = Err(NetError::Wait);
        let fatal: NetResult<()> = Err(NetError::Fatal(ErrorKind::PeerClosed));

        assert!(!wait.has_failed());
        assert!(!Ok::<(), NetError>(()).has_failed());
        assert!(fatal.has_failed());
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ErrorKind::MalformedVarInt.class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(ErrorKind::WrongPassword.class(), ErrorClass::PolicyDenied);
        assert_eq!(ErrorKind::PeerClosed.class(), ErrorClass::TransportError);
        assert_eq!(ErrorKind::PluginMissing.class(), ErrorClass::PluginLoadError);
        assert_eq!(ErrorKind::BufferOverflow.class(), ErrorClass::ResourceError);
    }
}
