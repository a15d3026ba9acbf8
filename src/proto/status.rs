//! Response status codes and their semantic grouping.
//!
//! Server statuses occupy the low range defined by the wire protocol.
//! Statuses the client synthesises locally (timeouts, transport loss,
//! decode failures) live at 0x0200 and above so they can never collide
//! with a server-reported code.

use std::fmt;

use crate::error::ErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    DeltaBadval,
    VBucketBelongsToAnotherServer,
    BucketNotConnected,
    Locked,
    AuthenticationError,
    AuthenticationContinue,
    InvalidRange,
    Rollback,
    Eaccess,
    NotInitialized,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    UnknownCollection,
    NoCollectionsManifest,
    DurabilityInvalidLevel,
    DurabilityImpossible,
    SyncWriteInProgress,
    SyncWriteAmbiguous,
    SyncWriteReCommitInProgress,
    SubDocPathNotFound,
    SubDocPathMismatch,
    SubDocPathInvalid,
    SubDocPathTooBig,
    SubDocDocTooDeep,
    SubDocCannotInsert,
    SubDocDocNotJson,
    SubDocNumRange,
    SubDocDeltaRange,
    SubDocPathExists,
    SubDocValueTooDeep,
    SubDocInvalidCombo,
    SubDocMultiPathFailure,
    SubDocSuccessDeleted,
    SubDocXattrInvalidFlagCombo,
    SubDocXattrInvalidKeyCombo,
    SubDocXattrUnknownMacro,
    // Client-synthesised statuses (never appear on the wire).
    OperationTimeout,
    NoReplicasFound,
    NodeUnavailable,
    TransportFailure,
    DocumentMutationLost,
    DocumentMutationDetected,
    ClientFailure,
    Unknown(u16),
}

impl Status {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0006 => Status::DeltaBadval,
            0x0007 => Status::VBucketBelongsToAnotherServer,
            0x0008 => Status::BucketNotConnected,
            0x0009 => Status::Locked,
            0x0020 => Status::AuthenticationError,
            0x0021 => Status::AuthenticationContinue,
            0x0022 => Status::InvalidRange,
            0x0023 => Status::Rollback,
            0x0024 => Status::Eaccess,
            0x0025 => Status::NotInitialized,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0083 => Status::NotSupported,
            0x0084 => Status::InternalError,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            0x0088 => Status::UnknownCollection,
            0x0089 => Status::NoCollectionsManifest,
            0x00a0 => Status::DurabilityInvalidLevel,
            0x00a1 => Status::DurabilityImpossible,
            0x00a2 => Status::SyncWriteInProgress,
            0x00a3 => Status::SyncWriteAmbiguous,
            0x00a4 => Status::SyncWriteReCommitInProgress,
            0x00c0 => Status::SubDocPathNotFound,
            0x00c1 => Status::SubDocPathMismatch,
            0x00c2 => Status::SubDocPathInvalid,
            0x00c3 => Status::SubDocPathTooBig,
            0x00c4 => Status::SubDocDocTooDeep,
            0x00c5 => Status::SubDocCannotInsert,
            0x00c6 => Status::SubDocDocNotJson,
            0x00c7 => Status::SubDocNumRange,
            0x00c8 => Status::SubDocDeltaRange,
            0x00c9 => Status::SubDocPathExists,
            0x00ca => Status::SubDocValueTooDeep,
            0x00cb => Status::SubDocInvalidCombo,
            0x00cc => Status::SubDocMultiPathFailure,
            0x00cd => Status::SubDocSuccessDeleted,
            0x00ce => Status::SubDocXattrInvalidFlagCombo,
            0x00cf => Status::SubDocXattrInvalidKeyCombo,
            0x00d0 => Status::SubDocXattrUnknownMacro,
            0x0200 => Status::OperationTimeout,
            0x0201 => Status::NoReplicasFound,
            0x0202 => Status::NodeUnavailable,
            0x0203 => Status::TransportFailure,
            0x0204 => Status::DocumentMutationLost,
            0x0205 => Status::DocumentMutationDetected,
            0x0206 => Status::ClientFailure,
            other => Status::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::DeltaBadval => 0x0006,
            Status::VBucketBelongsToAnotherServer => 0x0007,
            Status::BucketNotConnected => 0x0008,
            Status::Locked => 0x0009,
            Status::AuthenticationError => 0x0020,
            Status::AuthenticationContinue => 0x0021,
            Status::InvalidRange => 0x0022,
            Status::Rollback => 0x0023,
            Status::Eaccess => 0x0024,
            Status::NotInitialized => 0x0025,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::NotSupported => 0x0083,
            Status::InternalError => 0x0084,
            Status::Busy => 0x0085,
            Status::TemporaryFailure => 0x0086,
            Status::UnknownCollection => 0x0088,
            Status::NoCollectionsManifest => 0x0089,
            Status::DurabilityInvalidLevel => 0x00a0,
            Status::DurabilityImpossible => 0x00a1,
            Status::SyncWriteInProgress => 0x00a2,
            Status::SyncWriteAmbiguous => 0x00a3,
            Status::SyncWriteReCommitInProgress => 0x00a4,
            Status::SubDocPathNotFound => 0x00c0,
            Status::SubDocPathMismatch => 0x00c1,
            Status::SubDocPathInvalid => 0x00c2,
            Status::SubDocPathTooBig => 0x00c3,
            Status::SubDocDocTooDeep => 0x00c4,
            Status::SubDocCannotInsert => 0x00c5,
            Status::SubDocDocNotJson => 0x00c6,
            Status::SubDocNumRange => 0x00c7,
            Status::SubDocDeltaRange => 0x00c8,
            Status::SubDocPathExists => 0x00c9,
            Status::SubDocValueTooDeep => 0x00ca,
            Status::SubDocInvalidCombo => 0x00cb,
            Status::SubDocMultiPathFailure => 0x00cc,
            Status::SubDocSuccessDeleted => 0x00cd,
            Status::SubDocXattrInvalidFlagCombo => 0x00ce,
            Status::SubDocXattrInvalidKeyCombo => 0x00cf,
            Status::SubDocXattrUnknownMacro => 0x00d0,
            Status::OperationTimeout => 0x0200,
            Status::NoReplicasFound => 0x0201,
            Status::NodeUnavailable => 0x0202,
            Status::TransportFailure => 0x0203,
            Status::DocumentMutationLost => 0x0204,
            Status::DocumentMutationDetected => 0x0205,
            Status::ClientFailure => 0x0206,
            Status::Unknown(other) => other,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Success | Status::SubDocSuccessDeleted)
    }

    /// Semantic grouping surfaced by the dispatcher.
    pub fn kind(self) -> ErrorKind {
        match self {
            Status::Success | Status::SubDocSuccessDeleted => ErrorKind::InternalOrRetryable,
            Status::KeyNotFound | Status::ItemNotStored => ErrorKind::KeyNotFound,
            Status::KeyExists => ErrorKind::KeyExists,
            Status::ValueTooLarge => ErrorKind::ValueTooLarge,
            Status::InvalidArguments | Status::InvalidRange | Status::DeltaBadval => {
                ErrorKind::InvalidArgument
            }
            Status::TemporaryFailure | Status::OutOfMemory | Status::Busy => {
                ErrorKind::TemporaryFailure
            }
            Status::OperationTimeout => ErrorKind::Timeout,
            Status::Locked => ErrorKind::Locked,
            Status::DocumentMutationLost
            | Status::DocumentMutationDetected
            | Status::NoReplicasFound
            | Status::DurabilityInvalidLevel
            | Status::DurabilityImpossible
            | Status::SyncWriteInProgress
            | Status::SyncWriteAmbiguous
            | Status::SyncWriteReCommitInProgress => ErrorKind::Durability,
            Status::Eaccess | Status::AuthenticationError | Status::AuthenticationContinue => {
                ErrorKind::Auth
            }
            Status::Rollback
            | Status::VBucketBelongsToAnotherServer
            | Status::BucketNotConnected
            | Status::NotInitialized
            | Status::NotSupported
            | Status::UnknownCommand
            | Status::InternalError
            | Status::UnknownCollection
            | Status::NoCollectionsManifest
            | Status::NodeUnavailable
            | Status::SubDocInvalidCombo
            | Status::SubDocXattrInvalidFlagCombo
            | Status::SubDocXattrInvalidKeyCombo
            | Status::SubDocXattrUnknownMacro
            | Status::Unknown(_) => ErrorKind::InternalOrRetryable,
            Status::SubDocPathNotFound => ErrorKind::PathNotFound,
            Status::SubDocPathMismatch => ErrorKind::PathMismatch,
            Status::SubDocPathInvalid => ErrorKind::PathInvalid,
            Status::SubDocPathTooBig => ErrorKind::PathTooBig,
            Status::SubDocDocTooDeep
            | Status::SubDocCannotInsert
            | Status::SubDocDocNotJson
            | Status::SubDocNumRange
            | Status::SubDocDeltaRange
            | Status::SubDocPathExists
            | Status::SubDocValueTooDeep
            | Status::SubDocMultiPathFailure => ErrorKind::SubdocGeneric,
            Status::TransportFailure => ErrorKind::Transport,
            Status::ClientFailure => ErrorKind::Client,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}(0x{:04x})", self.as_u16())
    }
}
