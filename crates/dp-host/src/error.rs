//! §7's closed error-kind list, surfaced to the host's error callback. Every
//! error a dependency crate can raise collapses into exactly one of these
//! nine kinds; nothing downstream of `Device` should ever need to match on
//! `RegistryError`/`FabricError`/`CodecError` directly.

use dp_codec::{CodecError, ObjectKind};
use dp_fabric::FabricError;
use dp_framebuffer::FrameBufferError;
use dp_handle::Handle;
use dp_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("allocation failed: {0}")]
    OutOfMemory(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("handle {0} not found")]
    NotFound(Handle),
    #[error("handle {0} has kind {actual:?}, expected {expected:?}", actual = .1, expected = .2)]
    TypeMismatch(Handle, ObjectKind, ObjectKind),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("state error: {0}")]
    StateError(String),
    #[error("unsupported cpu: {0}")]
    UnsupportedCpu(String),
    #[error("peer disconnected")]
    Disconnect,
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl From<RegistryError> for OffloadError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(handle) => OffloadError::NotFound(handle),
            RegistryError::TypeMismatch(handle, actual, expected) => {
                OffloadError::TypeMismatch(handle, actual, expected)
            }
            RegistryError::Duplicate(_) | RegistryError::Uncommitted(_) => {
                OffloadError::StateError(err.to_string())
            }
        }
    }
}

impl From<FabricError> for OffloadError {
    fn from(err: FabricError) -> Self {
        match err {
            FabricError::Disconnect(_) | FabricError::Io(_) => OffloadError::Disconnect,
            FabricError::RankOutOfRange(..) | FabricError::NoPortLine | FabricError::BadPortLine(_) => {
                OffloadError::ProtocolError(err.to_string())
            }
        }
    }
}

impl From<dp_buffer::BufferError> for OffloadError {
    fn from(err: dp_buffer::BufferError) -> Self {
        match err {
            dp_buffer::BufferError::Fabric(fabric_err) => fabric_err.into(),
        }
    }
}

impl From<CodecError> for OffloadError {
    fn from(err: CodecError) -> Self {
        OffloadError::ProtocolError(err.to_string())
    }
}

impl From<FrameBufferError> for OffloadError {
    fn from(err: FrameBufferError) -> Self {
        OffloadError::InvalidArgument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_handle::NULL_HANDLE;

    #[test]
    fn registry_not_found_maps_to_not_found() {
        let err: OffloadError = RegistryError::NotFound(NULL_HANDLE).into();
        assert!(matches!(err, OffloadError::NotFound(h) if h == NULL_HANDLE));
    }

    #[test]
    fn registry_uncommitted_maps_to_state_error() {
        let err: OffloadError = RegistryError::Uncommitted(NULL_HANDLE).into();
        assert!(matches!(err, OffloadError::StateError(_)));
    }

    #[test]
    fn fabric_disconnect_maps_to_disconnect() {
        let err: OffloadError = FabricError::Disconnect(2).into();
        assert!(matches!(err, OffloadError::Disconnect));
    }

    #[test]
    fn fabric_rank_out_of_range_maps_to_protocol_error() {
        let err: OffloadError = FabricError::RankOutOfRange(5, 2).into();
        assert!(matches!(err, OffloadError::ProtocolError(_)));
    }
}
