//! Symbol nodes: user-visible handles over the controller's variables.
//!
//! A node wraps one byte-range binding plus an optional child table
//! (struct members / namespace entries keyed by name, array elements by
//! index). Nodes are structurally immutable after the graph is built;
//! only the validity flag ever changes, once, from true to false.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::adapters::transport::{SubscriptionHandle, Transport};
use crate::core::model::{Dimension, Pointer};
use crate::core::types::TypeNode;
use crate::core::value::Value;
use crate::error::MirrorError;

use super::events::{
    Emitter, Listener, ListenerId, SymbolEvent, EVENT_CHANGED, EVENT_CLEARED, EVENT_GET,
    EVENT_INVALIDATED, EVENT_SET,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Boolean,
    Numeric,
    String,
    Enum,
    Struct,
    Array,
    Namespace,
}

/// Shared by every node of one graph.
pub(crate) struct BindingContext {
    pub transport: Arc<dyn Transport>,
    pub max_items_per_request: usize,
    pub default_cycle_ms: u32,
}

pub(crate) enum Children {
    None,
    Keyed(IndexMap<String, Arc<SymbolNode>>),
    Indexed {
        start_index: i32,
        items: Vec<Arc<SymbolNode>>,
    },
}

pub struct SymbolNode {
    pub(crate) path: String,
    pub(crate) kind: SymbolKind,
    /// Resolved type; absent only on namespaces.
    pub(crate) type_node: Option<Arc<TypeNode>>,
    pub(crate) pointer: Pointer,
    pub(crate) read_only: bool,
    pub(crate) valid: AtomicBool,
    pub(crate) children: Children,
    pub(crate) emitter: Arc<Emitter>,
    pub(crate) ctx: Arc<BindingContext>,
    pub(crate) subscription: AsyncMutex<Option<SubscriptionHandle>>,
    pub(crate) rpc_methods: Vec<String>,
    /// Remaining array dimensions at this depth (outermost first).
    pub(crate) dimensions: Vec<Dimension>,
}

impl SymbolNode {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> SymbolKind {
        self.kind
    }

    pub fn pointer(&self) -> Pointer {
        self.pointer
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_node.as_deref().map(TypeNode::name)
    }

    /// RPC method names this node exposes (struct nodes only).
    pub fn rpc_methods(&self) -> &[String] {
        &self.rpc_methods
    }

    /// Child lookup by member or namespace key; controller identifiers
    /// are case-insensitive, so an exact match is tried first and a
    /// case-insensitive scan second.
    pub fn child(&self, name: &str) -> Option<Arc<SymbolNode>> {
        let Children::Keyed(map) = &self.children else {
            return None;
        };
        if let Some(node) = map.get(name) {
            return Some(Arc::clone(node));
        }
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, node)| Arc::clone(node))
    }

    /// Array element lookup; caller index 0 maps to the dimension's
    /// start index.
    pub fn index(&self, i: usize) -> Option<Arc<SymbolNode>> {
        let Children::Indexed { items, .. } = &self.children else {
            return None;
        };
        items.get(i).cloned()
    }

    pub fn child_count(&self) -> usize {
        match &self.children {
            Children::None => 0,
            Children::Keyed(map) => map.len(),
            Children::Indexed { items, .. } => items.len(),
        }
    }

    /// Visit children in declaration order. Array children are keyed by
    /// their controller-side index.
    pub fn each(&self, mut f: impl FnMut(&str, &Arc<SymbolNode>)) {
        match &self.children {
            Children::None => {}
            Children::Keyed(map) => {
                for (key, node) in map {
                    f(key, node);
                }
            }
            Children::Indexed { start_index, items } => {
                for (i, node) in items.iter().enumerate() {
                    f(&(start_index + i as i32).to_string(), node);
                }
            }
        }
    }

    pub fn on(&self, event: &str, callback: Listener) -> ListenerId {
        self.emitter.on(event, callback)
    }

    pub fn once(&self, event: &str, callback: Listener) -> ListenerId {
        self.emitter.once(event, callback)
    }

    pub fn off(&self, id: ListenerId) {
        self.emitter.off(id)
    }

    pub fn on_invalidated(&self, callback: Listener) -> ListenerId {
        self.emitter.on(EVENT_INVALIDATED, callback)
    }

    /// Tear down this subtree: children first, then the node itself.
    /// Further read/write/clear/subscribe calls fail with
    /// `InvalidBinding`. Idempotent.
    pub fn invalidate(&self) {
        if !self.is_valid() {
            return;
        }
        match &self.children {
            Children::None => {}
            Children::Keyed(map) => {
                for node in map.values() {
                    node.invalidate();
                }
            }
            Children::Indexed { items, .. } => {
                for node in items {
                    node.invalidate();
                }
            }
        }
        self.valid.store(false, Ordering::SeqCst);
        self.emitter.emit_local(&SymbolEvent::new(
            EVENT_INVALIDATED,
            &self.path,
            "invalidate",
            None,
        ));
    }

    pub(crate) fn ensure_valid(&self) -> Result<(), MirrorError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(MirrorError::InvalidBinding {
                path: self.path.clone(),
            })
        }
    }

    /// Effective event name after alias attributes.
    pub(crate) fn event_name<'s>(&'s self, canonical: &'s str) -> &'s str {
        let Some(ty) = &self.type_node else {
            return canonical;
        };
        let aliases = &ty.base().aliases;
        match canonical {
            EVENT_SET => aliases.on_set.as_deref().unwrap_or(canonical),
            EVENT_GET => aliases.on_get.as_deref().unwrap_or(canonical),
            EVENT_CLEARED => aliases.on_clear.as_deref().unwrap_or(canonical),
            EVENT_CHANGED => aliases.on_change.as_deref().unwrap_or(canonical),
            _ => canonical,
        }
    }

    pub(crate) fn emit(&self, canonical: &str, context: &str, payload: Option<Value>) {
        let event = SymbolEvent::new(self.event_name(canonical), &self.path, context, payload);
        self.emitter.emit(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::transport::mock::MockTransport;

    pub(crate) fn test_ctx() -> Arc<BindingContext> {
        Arc::new(BindingContext {
            transport: Arc::new(MockTransport::new()),
            max_items_per_request: 500,
            default_cycle_ms: 200,
        })
    }

    fn leaf(path: &str, ctx: &Arc<BindingContext>) -> Arc<SymbolNode> {
        Arc::new(SymbolNode {
            path: path.to_string(),
            kind: SymbolKind::Boolean,
            type_node: None,
            pointer: Pointer::new(0x4020, 0, 1),
            read_only: false,
            valid: AtomicBool::new(true),
            children: Children::None,
            emitter: Arc::new(Emitter::new()),
            ctx: Arc::clone(ctx),
            subscription: AsyncMutex::new(None),
            rpc_methods: Vec::new(),
            dimensions: Vec::new(),
        })
    }

    #[test]
    fn child_lookup_is_case_insensitive() {
        let ctx = test_ctx();
        let member = leaf("Main.BoolValue", &ctx);
        let mut map = IndexMap::new();
        map.insert("BoolValue".to_string(), Arc::clone(&member));
        let parent = Arc::new(SymbolNode {
            path: "Main".to_string(),
            kind: SymbolKind::Namespace,
            type_node: None,
            pointer: Pointer::new(0x4020, 0, 1),
            read_only: false,
            valid: AtomicBool::new(true),
            children: Children::Keyed(map),
            emitter: Arc::new(Emitter::new()),
            ctx,
            subscription: AsyncMutex::new(None),
            rpc_methods: Vec::new(),
            dimensions: Vec::new(),
        });

        assert!(parent.child("BoolValue").is_some());
        assert!(parent.child("boolvalue").is_some());
        assert!(parent.child("other").is_none());
        assert!(parent.index(0).is_none());
    }

    #[test]
    fn invalidate_cascades_children_first() {
        let ctx = test_ctx();
        let member = leaf("Main.x", &ctx);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let order_child = Arc::clone(&order);
        member.on_invalidated(Arc::new(move |_| order_child.lock().push("child")));

        let mut map = IndexMap::new();
        map.insert("x".to_string(), Arc::clone(&member));
        let parent = Arc::new(SymbolNode {
            path: "Main".to_string(),
            kind: SymbolKind::Namespace,
            type_node: None,
            pointer: Pointer::new(0x4020, 0, 1),
            read_only: false,
            valid: AtomicBool::new(true),
            children: Children::Keyed(map),
            emitter: Arc::new(Emitter::new()),
            ctx,
            subscription: AsyncMutex::new(None),
            rpc_methods: Vec::new(),
            dimensions: Vec::new(),
        });
        let order_parent = Arc::clone(&order);
        parent.on_invalidated(Arc::new(move |_| order_parent.lock().push("parent")));

        parent.invalidate();
        parent.invalidate();

        assert_eq!(*order.lock(), vec!["child", "parent"]);
        assert!(!member.is_valid());
        assert!(!parent.is_valid());
        assert!(matches!(
            member.ensure_valid(),
            Err(MirrorError::InvalidBinding { .. })
        ));
    }
}
