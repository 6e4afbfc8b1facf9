//! Transport facade.
//!
//! Contract the engine consumes from a wire-protocol client: connection
//! lifecycle, bulk raw I/O, the primitive value codec, catalogue fetches,
//! change notifications and controller-side method invocation. The crate
//! ships the contract plus an in-memory mock; a real protocol client
//! lives outside.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::model::{Pointer, RawPackage, RawSymbolDescriptor, RawTypeDescriptor, RpcResult};
use crate::core::value::Value;

pub mod mock;

pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Fired with the current bytes of a subscribed range.
pub type NotifyCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("timeout")]
    Timeout,

    #[error("comm error: {message}")]
    Comm { message: String },

    #[error("unknown type: {name}")]
    UnknownType { name: String },

    #[error("unknown symbol: {path}")]
    UnknownSymbol { path: String },

    #[error("codec error: {message}")]
    Codec { message: String },
}

/// Handle for a change notifier installed on the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: Uuid,
}

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for SubscriptionHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectionLost,
    Reconnected,
}

/// The wire-protocol client as the engine sees it.
///
/// All operations are suspendable; implementations decide their own
/// locking. Catalogue maps are keyed the way the engine consumes them:
/// data types by lowercased name, symbols by full path.
pub trait Transport: Send + Sync {
    fn connect(&self) -> TransportFuture<'_, ()>;

    fn disconnect(&self, force: bool) -> TransportFuture<'_, ()>;

    fn read_raw_multi<'a>(&'a self, pointers: &'a [Pointer])
        -> TransportFuture<'a, Vec<RawPackage>>;

    fn write_raw_multi<'a>(&'a self, packages: &'a [RawPackage]) -> TransportFuture<'a, ()>;

    /// Decode one primitive leaf value. `type_name` is resolved against
    /// the cached catalogue, so derived names work too.
    fn convert_from_raw<'a>(&'a self, data: &'a [u8], type_name: &'a str)
        -> TransportFuture<'a, Value>;

    /// Encode one primitive leaf value.
    fn convert_to_raw<'a>(
        &'a self,
        value: &'a Value,
        type_name: &'a str,
    ) -> TransportFuture<'a, Vec<u8>>;

    fn read_and_cache_data_types(
        &self,
    ) -> TransportFuture<'_, HashMap<String, RawTypeDescriptor>>;

    fn read_and_cache_symbols(&self) -> TransportFuture<'_, HashMap<String, RawSymbolDescriptor>>;

    /// Install a change notifier on a symbol path.
    fn subscribe_path<'a>(
        &'a self,
        path: &'a str,
        callback: NotifyCallback,
        cycle_ms: Option<u32>,
    ) -> TransportFuture<'a, SubscriptionHandle>;

    /// Install a change notifier on a raw byte range.
    fn subscribe_raw<'a>(
        &'a self,
        pointer: Pointer,
        callback: NotifyCallback,
        cycle_ms: u32,
    ) -> TransportFuture<'a, SubscriptionHandle>;

    fn unsubscribe(&self, handle: SubscriptionHandle) -> TransportFuture<'_, ()>;

    fn unsubscribe_all(&self) -> TransportFuture<'_, ()>;

    fn invoke_rpc_method<'a>(
        &'a self,
        path: &'a str,
        method: &'a str,
        args: &'a IndexMap<String, Value>,
    ) -> TransportFuture<'a, RpcResult>;

    /// Connection-loss / reconnect notifications.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}
