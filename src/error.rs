//! Structured engine errors.

use thiserror::Error;

use crate::adapters::transport::TransportError;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("binding invalidated: {path}")]
    InvalidBinding { path: String },

    #[error("invalid value type for {path}: expected {expected}, got {got}")]
    InvalidType {
        path: String,
        expected: String,
        got: &'static str,
    },

    #[error("out of range at {path}: {message}")]
    OutOfRange { path: String, message: String },

    #[error("read-only: {path}")]
    ReadOnly { path: String },

    #[error("coordinator already initialized")]
    TransportBusy,

    #[error("connect failed")]
    ConnectFailed(#[source] TransportError),

    #[error("disconnect failed")]
    DisconnectFailed(#[source] TransportError),

    #[error("source change detection setup failed")]
    ChangeDetectionFailed(#[source] TransportError),

    #[error("subscribe failed for {path}")]
    SubscribeFailed {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("unsubscribe failed for {path}")]
    UnsubscribeFailed {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("raw encode failed for {path}")]
    ToRawFailed {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("raw decode failed for {path}")]
    FromRawFailed {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("bulk write failed for {path}")]
    WriteFailed {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("bulk read failed for {path}")]
    ReadFailed {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("data type catalogue fetch failed")]
    TypeQueryFailed(#[source] TransportError),

    #[error("symbol catalogue fetch failed")]
    SymbolQueryFailed(#[source] TransportError),

    #[error("rpc call {method} failed on {path}")]
    RpcCallFailed {
        path: String,
        method: String,
        #[source]
        source: TransportError,
    },

    #[error(
        "namespace {namespace} spans more than one index group ({expected_group:#x} vs {found_group:#x})"
    )]
    InvalidNamespace {
        namespace: String,
        expected_group: u32,
        found_group: u32,
    },
}
