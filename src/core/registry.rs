//! Type registry: resolves the raw catalogue into canonical type nodes.
//!
//! The resolver is recursive with memoization and re-entrant; individual
//! types that cannot be made bindable are silently dropped, and their raw
//! entries are deleted so pathological cycles cannot be re-walked. The
//! build fails as a whole only when the catalogue fetch or the
//! default-value encoder fails.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;

use crate::adapters::transport::Transport;
use crate::core::model::{RawTypeDescriptor, WireKind};
use crate::core::types::{Mutator, TypeNode};
use crate::error::MirrorError;
use crate::symbols::events::{Emitter, SymbolEvent, EVENT_CREATED, EVENT_DESTROYED};

const POINTER_PREFIX: &str = "POINTER TO ";
const REFERENCE_PREFIX: &str = "REFERENCE TO ";

/// Canonical, cycle-free map of bindable type nodes, keyed by the
/// original catalogue name. Read-only after build.
pub struct TypeRegistry {
    types: IndexMap<String, Arc<TypeNode>>,
    by_lower: HashMap<String, String>,
    emitter: Arc<Emitter>,
}

impl TypeRegistry {
    pub async fn build(
        transport: &dyn Transport,
        parent_emitter: Option<&Arc<Emitter>>,
    ) -> Result<Self, MirrorError> {
        let catalogue = transport
            .read_and_cache_data_types()
            .await
            .map_err(MirrorError::TypeQueryFailed)?;

        let mut resolver = Resolver {
            codec: transport,
            raw: catalogue
                .into_iter()
                .map(|(key, raw)| (key.trim().to_ascii_lowercase(), raw))
                .collect(),
            resolved: IndexMap::new(),
            by_lower: HashMap::new(),
            chain: Vec::new(),
        };

        let mut names: Vec<String> = resolver.raw.keys().cloned().collect();
        names.sort();
        for name in names {
            resolver.resolve(&name).await?;
        }

        let emitter = Arc::new(Emitter::new());
        if let Some(parent) = parent_emitter {
            emitter.set_parent(parent);
        }
        let registry = Self {
            types: resolver.resolved,
            by_lower: resolver.by_lower,
            emitter,
        };
        debug!("type registry built: {} bindable types", registry.types.len());
        registry
            .emitter
            .emit(&SymbolEvent::new(EVENT_CREATED, "types", "build", None));
        Ok(registry)
    }

    /// Case-insensitive lookup by catalogue name.
    pub fn get(&self, name: &str) -> Option<Arc<TypeNode>> {
        if let Some(node) = self.types.get(name) {
            return Some(Arc::clone(node));
        }
        let key = name.trim().to_ascii_lowercase();
        self.by_lower
            .get(&key)
            .and_then(|original| self.types.get(original))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<TypeNode>)> {
        self.types.iter()
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    pub fn destroy(&self) {
        self.emitter
            .emit(&SymbolEvent::new(EVENT_DESTROYED, "types", "teardown", None));
    }
}

struct Resolver<'a> {
    codec: &'a dyn Transport,
    /// Working catalogue; entries that fail to resolve are deleted.
    raw: HashMap<String, RawTypeDescriptor>,
    resolved: IndexMap<String, Arc<TypeNode>>,
    by_lower: HashMap<String, String>,
    /// Lowercased names currently being resolved; re-entry means a cycle.
    chain: Vec<String>,
}

type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Arc<TypeNode>>, MirrorError>> + Send + 'a>>;

impl<'a> Resolver<'a> {
    fn resolve<'b>(&'b mut self, name: &str) -> ResolveFuture<'b> {
        let key = name.trim().to_ascii_lowercase();
        let upper = name.trim().to_ascii_uppercase();
        Box::pin(async move {
            if let Some(original) = self.by_lower.get(&key) {
                return Ok(self.resolved.get(original).cloned());
            }

            if upper.starts_with(POINTER_PREFIX) || upper.starts_with(REFERENCE_PREFIX) {
                self.raw.remove(&key);
                return Ok(None);
            }

            let Some(raw) = self.raw.get(&key).cloned() else {
                return Ok(None);
            };

            if self.chain.contains(&key) {
                debug!("dropping self-recursive type {}", raw.name);
                self.raw.remove(&key);
                return Ok(None);
            }

            self.chain.push(key.clone());
            let constructed = self.construct(&raw).await;
            self.chain.pop();

            match constructed? {
                Some(node) => {
                    if !self.resolved.contains_key(&raw.name) {
                        self.resolved.insert(raw.name.clone(), Arc::new(node));
                        self.by_lower.insert(key, raw.name.clone());
                    }
                    Ok(self.resolved.get(&raw.name).cloned())
                }
                None => {
                    debug!("dropping unbindable type {}", raw.name);
                    self.raw.remove(&key);
                    Ok(None)
                }
            }
        })
    }

    async fn construct(&mut self, raw: &RawTypeDescriptor) -> Result<Option<TypeNode>, MirrorError> {
        // Arrays resolve their element through the parent name; a failed
        // element (pointer, reference, ignored) fails the array.
        if !raw.array_dimensions.is_empty() {
            if raw.parent_name.trim().is_empty() {
                return Ok(None);
            }
            let element_name = raw.parent_name.clone();
            return match self.resolve(&element_name).await? {
                Some(element) => element.extend(raw, self.codec).await,
                None => Ok(None),
            };
        }

        if self.has_parent(raw) {
            let parent_name = raw.parent_name.clone();
            return match self.resolve(&parent_name).await? {
                Some(parent) => parent.extend(raw, self.codec).await,
                None => Ok(None),
            };
        }

        match raw.kind {
            WireKind::Bit => TypeNode::new_boolean(raw, self.codec).await,
            kind if kind.is_numeric() => TypeNode::new_numeric(raw, self.codec).await,
            kind if kind.is_string() => TypeNode::new_string(raw, self.codec).await,
            WireKind::Composite if !raw.children.is_empty() => {
                let mut members = Vec::with_capacity(raw.children.len());
                for child in &raw.children {
                    let Some(resolved) = self.resolve(&child.type_name).await? else {
                        continue;
                    };
                    let mutator = Mutator::from_type_child(child);
                    let Some(cloned) = resolved.clone_with(&mutator, self.codec).await? else {
                        continue;
                    };
                    members.push((child.member_name.clone(), Arc::new(cloned)));
                }
                Ok(TypeNode::new_struct(raw, members))
            }
            _ => Ok(None),
        }
    }

    /// A raw entry has a parent iff the parent name is set, differs from
    /// its own and the catalogue holds a type of that name with the same
    /// wire kind.
    fn has_parent(&self, raw: &RawTypeDescriptor) -> bool {
        let parent = raw.parent_name.trim();
        if parent.is_empty() {
            return false;
        }
        let parent_key = parent.to_ascii_lowercase();
        if parent_key == raw.name.trim().to_ascii_lowercase() {
            return false;
        }
        match self.raw.get(&parent_key) {
            Some(entry) => entry.kind == raw.kind,
            None => false,
        }
    }
}
