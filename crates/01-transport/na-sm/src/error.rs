use std::io;

use sm_transport::TransportError;
use thiserror::Error;

pub type NaResult<T> = Result<T, NaError>;

/// Return codes of the network abstraction layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NaError {
    #[error("operation not permitted")]
    Permission,
    #[error("no such file or directory")]
    NoEntry,
    #[error("operation interrupted")]
    Interrupt,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("out of memory")]
    NoMem,
    #[error("permission denied")]
    Access,
    #[error("bad address")]
    Fault,
    #[error("device or resource busy")]
    Busy,
    #[error("entry already exists")]
    Exist,
    #[error("no such device")]
    NoDev,
    #[error("invalid argument")]
    InvalidArg,
    #[error("invalid state")]
    InvalidState,
    #[error("protocol error")]
    ProtocolError,
    #[error("value too large")]
    Overflow,
    #[error("message size mismatch")]
    MsgSize,
    #[error("protocol not supported")]
    ProtoNoSupport,
    #[error("operation not supported")]
    OpNotSupported,
    #[error("address already in use")]
    AddrInUse,
    #[error("address not available")]
    AddrNotAvail,
    #[error("operation timed out")]
    Timeout,
    #[error("operation canceled")]
    Canceled,
}

impl NaError {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EPERM => NaError::Permission,
            libc::ENOENT => NaError::NoEntry,
            libc::EINTR => NaError::Interrupt,
            libc::EAGAIN => NaError::Again,
            libc::ENOMEM => NaError::NoMem,
            libc::EACCES => NaError::Access,
            libc::EFAULT => NaError::Fault,
            libc::EBUSY => NaError::Busy,
            libc::EEXIST => NaError::Exist,
            libc::ENODEV => NaError::NoDev,
            libc::EINVAL => NaError::InvalidArg,
            libc::EOVERFLOW | libc::ENAMETOOLONG => NaError::Overflow,
            libc::EMSGSIZE => NaError::MsgSize,
            libc::EPROTONOSUPPORT => NaError::ProtoNoSupport,
            libc::EOPNOTSUPP => NaError::OpNotSupported,
            libc::EADDRINUSE => NaError::AddrInUse,
            libc::EADDRNOTAVAIL => NaError::AddrNotAvail,
            libc::ETIMEDOUT => NaError::Timeout,
            libc::ECANCELED => NaError::Canceled,
            _ => NaError::ProtocolError,
        }
    }
}

impl From<io::Error> for NaError {
    fn from(err: io::Error) -> Self {
        err.raw_os_error()
            .map(NaError::from_errno)
            .unwrap_or(NaError::ProtocolError)
    }
}

impl From<TransportError> for NaError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NameTooLong { .. } => NaError::Overflow,
            TransportError::RegionSize { .. } | TransportError::Map { .. } => NaError::NoDev,
            TransportError::InvalidHeader { .. } => NaError::InvalidArg,
            TransportError::Os { source, .. } => source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_taxonomy() {
        assert_eq!(NaError::from_errno(libc::EAGAIN), NaError::Again);
        assert_eq!(NaError::from_errno(libc::ENAMETOOLONG), NaError::Overflow);
        assert_eq!(NaError::from_errno(libc::EMSGSIZE), NaError::MsgSize);
        assert_eq!(NaError::from_errno(libc::EXDEV), NaError::ProtocolError);
    }

    #[test]
    fn transport_errors_fold_into_return_codes() {
        let too_long = TransportError::NameTooLong {
            name: "x".into(),
            limit: 1,
        };
        assert_eq!(NaError::from(too_long), NaError::Overflow);

        let os = TransportError::Os {
            op: "sendmsg",
            source: io::Error::from_raw_os_error(libc::ECONNREFUSED),
        };
        assert_eq!(NaError::from(os), NaError::ProtocolError);

        let missing = TransportError::Os {
            op: "sendmsg",
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert_eq!(NaError::from(missing), NaError::NoEntry);
    }
}
