//! Client-side mirror of a running PLC.
//!
//! At connect time the coordinator introspects the controller's type and
//! symbol catalogues over the transport, resolves them into a canonical
//! type registry and materialises a graph of addressable symbol nodes.
//! Reading a node pulls and decodes bytes, writing validates and pushes,
//! clearing restores defaults, subscribing installs a change notifier.
//! When the controller swaps its loaded program the whole graph is
//! rebuilt and previously handed-out handles are invalidated.
//!
//! The wire protocol itself stays outside: implement
//! [`adapters::transport::Transport`] for a real client, or use the
//! bundled [`adapters::transport::mock::MockTransport`] for demos and
//! tests.

pub mod adapters;
pub mod core;
pub mod error;
pub mod symbols;
pub mod usecase;

pub use crate::adapters::transport::{
    ConnectionEvent, SubscriptionHandle, Transport, TransportError,
};
pub use crate::core::model::{
    Dimension, EnumField, Pointer, RawChild, RawPackage, RawSymbolDescriptor, RawTypeDescriptor,
    RpcResult, WireKind,
};
pub use crate::core::registry::TypeRegistry;
pub use crate::core::settings::MirrorSettings;
pub use crate::core::value::Value;
pub use crate::error::MirrorError;
pub use crate::symbols::binding::ValueCallback;
pub use crate::symbols::events::{Listener, ListenerId, SymbolEvent};
pub use crate::symbols::graph::SymbolGraph;
pub use crate::symbols::node::{SymbolKind, SymbolNode};
pub use crate::usecase::coordinator::{Coordinator, SourceChangeHandler};
