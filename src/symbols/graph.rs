//! Symbol graph: expands the raw symbol catalogue over the type registry
//! into namespaces of bindable nodes.
//!
//! Per-symbol cloning and instantiation runs concurrently; attachment is
//! deterministic (catalogue paths sorted). A namespace absorbs its
//! children into one contiguous byte interval so a single bulk read can
//! cover a whole program; members in more than one index group are a
//! fatal configuration error.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use futures::future::try_join_all;
use indexmap::IndexMap;
use log::{debug, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::adapters::transport::Transport;
use crate::core::model::{Dimension, Pointer, RawSymbolDescriptor};
use crate::core::registry::TypeRegistry;
use crate::core::settings::MirrorSettings;
use crate::core::types::{Mutator, TypeNode};
use crate::error::MirrorError;

use super::events::{Emitter, SymbolEvent, EVENT_CREATED, EVENT_DESTROYED};
use super::node::{BindingContext, Children, SymbolKind, SymbolNode};

pub struct SymbolGraph {
    namespaces: IndexMap<String, Arc<SymbolNode>>,
    emitter: Arc<Emitter>,
}

impl std::fmt::Debug for SymbolGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolGraph")
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SymbolGraph {
    pub async fn build(
        transport: Arc<dyn Transport>,
        registry: &TypeRegistry,
        settings: &MirrorSettings,
        parent_emitter: Option<&Arc<Emitter>>,
    ) -> Result<Self, MirrorError> {
        let raw_symbols = transport
            .read_and_cache_symbols()
            .await
            .map_err(MirrorError::SymbolQueryFailed)?;

        let emitter = Arc::new(Emitter::new());
        if let Some(parent) = parent_emitter {
            emitter.set_parent(parent);
        }
        let ctx = Arc::new(BindingContext {
            transport: Arc::clone(&transport),
            max_items_per_request: settings.max_items_per_request,
            default_cycle_ms: settings.default_cycle_time_ms,
        });

        let mut paths: Vec<&String> = raw_symbols.keys().collect();
        paths.sort();

        let mut ns_order: Vec<String> = Vec::new();
        let mut ns_emitters: HashMap<String, Arc<Emitter>> = HashMap::new();
        let mut plan: Vec<(String, String, &RawSymbolDescriptor)> = Vec::new();
        for path in paths {
            let raw = &raw_symbols[path];
            let Some((ns, local)) = raw.full_path.split_once('.') else {
                warn!("skipping symbol without namespace: {}", raw.full_path);
                continue;
            };
            if !ns_emitters.contains_key(ns) {
                let ns_emitter = Arc::new(Emitter::new());
                ns_emitter.set_parent(&emitter);
                ns_emitters.insert(ns.to_string(), ns_emitter);
                ns_order.push(ns.to_string());
            }
            plan.push((ns.to_string(), local.to_string(), raw));
        }

        let built = try_join_all(plan.iter().map(|(ns, local, raw)| {
            let ctx = Arc::clone(&ctx);
            let ns_emitter = Arc::clone(&ns_emitters[ns.as_str()]);
            async move {
                let node = build_symbol(&ctx, registry, *raw, &ns_emitter).await?;
                Ok::<_, MirrorError>((ns.clone(), local.clone(), node))
            }
        }))
        .await?;

        struct NsAccum {
            children: IndexMap<String, Arc<SymbolNode>>,
            group: u32,
            start: u32,
            end: u32,
        }
        let mut accums: IndexMap<String, NsAccum> = IndexMap::new();
        for (ns, local, node) in built {
            let Some(node) = node else {
                continue;
            };
            let pointer = node.pointer();
            match accums.entry(ns) {
                indexmap::map::Entry::Vacant(entry) => {
                    let mut children = IndexMap::new();
                    children.insert(local, node);
                    entry.insert(NsAccum {
                        children,
                        group: pointer.index_group,
                        start: pointer.index_offset,
                        end: pointer.end(),
                    });
                }
                indexmap::map::Entry::Occupied(mut entry) => {
                    let namespace = entry.key().clone();
                    let accum = entry.get_mut();
                    if accum.group != pointer.index_group {
                        return Err(MirrorError::InvalidNamespace {
                            namespace,
                            expected_group: accum.group,
                            found_group: pointer.index_group,
                        });
                    }
                    accum.start = accum.start.min(pointer.index_offset);
                    accum.end = accum.end.max(pointer.end());
                    accum.children.insert(local, node);
                }
            }
        }

        let mut namespaces = IndexMap::new();
        for ns in ns_order {
            // Namespaces whose every symbol was skipped are not attached.
            let Some(accum) = accums.shift_remove(&ns) else {
                continue;
            };
            let node = Arc::new(SymbolNode {
                path: ns.clone(),
                kind: SymbolKind::Namespace,
                type_node: None,
                pointer: Pointer::new(accum.group, accum.start, accum.end - accum.start),
                read_only: false,
                valid: AtomicBool::new(true),
                children: Children::Keyed(accum.children),
                emitter: Arc::clone(&ns_emitters[ns.as_str()]),
                ctx: Arc::clone(&ctx),
                subscription: AsyncMutex::new(None),
                rpc_methods: Vec::new(),
                dimensions: Vec::new(),
            });
            namespaces.insert(ns, node);
        }

        let graph = Self {
            namespaces,
            emitter,
        };
        debug!("symbol graph built: {} namespaces", graph.namespaces.len());
        graph
            .emitter
            .emit(&SymbolEvent::new(EVENT_CREATED, "symbols", "build", None));
        Ok(graph)
    }

    pub fn namespaces(&self) -> &IndexMap<String, Arc<SymbolNode>> {
        &self.namespaces
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<SymbolNode>> {
        if let Some(node) = self.namespaces.get(name) {
            return Some(Arc::clone(node));
        }
        self.namespaces
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, node)| Arc::clone(node))
    }

    /// Walk a dotted path with optional `[i]` indices, e.g.
    /// `MAIN.arrayValue[3]`. Bracket indices are controller-side indices.
    pub fn symbol(&self, path: &str) -> Option<Arc<SymbolNode>> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let (ns_name, indices) = split_indices(first)?;
        let mut current = self.namespace(ns_name)?;
        current = descend_indices(current, &indices)?;
        for part in parts {
            let (name, indices) = split_indices(part)?;
            current = current.child(name)?;
            current = descend_indices(current, &indices)?;
        }
        Some(current)
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    /// Invalidate every handed-out handle, children first.
    pub fn destroy(&self) {
        for node in self.namespaces.values() {
            node.invalidate();
        }
        self.emitter
            .emit(&SymbolEvent::new(EVENT_DESTROYED, "symbols", "teardown", None));
    }
}

fn descend_indices(
    mut current: Arc<SymbolNode>,
    indices: &[i32],
) -> Option<Arc<SymbolNode>> {
    for controller_index in indices {
        let Children::Indexed { start_index, .. } = &current.children else {
            return None;
        };
        let zero_based = controller_index.checked_sub(*start_index)?;
        if zero_based < 0 {
            return None;
        }
        current = current.index(zero_based as usize)?;
    }
    Some(current)
}

/// `arrayValue[3][2]` -> (`arrayValue`, [3, 2]).
fn split_indices(part: &str) -> Option<(&str, Vec<i32>)> {
    let Some(bracket) = part.find('[') else {
        return Some((part, Vec::new()));
    };
    let name = &part[..bracket];
    let mut indices = Vec::new();
    for segment in part[bracket..].split('[').skip(1) {
        let segment = segment.strip_suffix(']')?;
        indices.push(segment.parse().ok()?);
    }
    Some((name, indices))
}

async fn build_symbol(
    ctx: &Arc<BindingContext>,
    registry: &TypeRegistry,
    raw: &RawSymbolDescriptor,
    ns_emitter: &Arc<Emitter>,
) -> Result<Option<Arc<SymbolNode>>, MirrorError> {
    let Some(ty) = registry.get(&raw.type_name) else {
        debug!(
            "skipping symbol {}: unresolved type {}",
            raw.full_path, raw.type_name
        );
        return Ok(None);
    };
    let mutator = Mutator::from_symbol(raw);
    let Some(ty) = ty.clone_with(&mutator, ctx.transport.as_ref()).await? else {
        debug!("skipping ignored symbol {}", raw.full_path);
        return Ok(None);
    };
    Ok(Some(instantiate(
        ctx,
        &Arc::new(ty),
        raw.full_path.clone(),
        raw.pointer,
        false,
        ns_emitter,
    )))
}

fn instantiate(
    ctx: &Arc<BindingContext>,
    ty: &Arc<TypeNode>,
    path: String,
    pointer: Pointer,
    inherited_read_only: bool,
    parent_emitter: &Arc<Emitter>,
) -> Arc<SymbolNode> {
    instantiate_with_dims(ctx, ty, path, pointer, inherited_read_only, parent_emitter, None)
}

/// `dims_override` carries the remaining dimensions when recursing into a
/// multidimensional array's proxy children.
fn instantiate_with_dims(
    ctx: &Arc<BindingContext>,
    ty: &Arc<TypeNode>,
    path: String,
    pointer: Pointer,
    inherited_read_only: bool,
    parent_emitter: &Arc<Emitter>,
    dims_override: Option<Vec<Dimension>>,
) -> Arc<SymbolNode> {
    let read_only = inherited_read_only || ty.base().read_only;
    let emitter = Arc::new(Emitter::new());
    emitter.set_parent(parent_emitter);

    let mut rpc_methods = Vec::new();
    let mut dimensions = Vec::new();
    let (kind, children) = match ty.as_ref() {
        TypeNode::Boolean(_) => (SymbolKind::Boolean, Children::None),
        TypeNode::Numeric(_) => (SymbolKind::Numeric, Children::None),
        TypeNode::String(_) => (SymbolKind::String, Children::None),
        TypeNode::Enum(_) => (SymbolKind::Enum, Children::None),
        TypeNode::Struct(st) => {
            let mut map = IndexMap::with_capacity(st.members.len());
            for (key, member) in &st.members {
                let child_pointer = Pointer::new(
                    pointer.index_group,
                    pointer.index_offset + member.offset(),
                    member.byte_size(),
                );
                let child = instantiate(
                    ctx,
                    member,
                    format!("{path}.{key}"),
                    child_pointer,
                    read_only,
                    &emitter,
                );
                map.insert(key.clone(), child);
            }
            rpc_methods = st.rpc_methods.clone();
            (SymbolKind::Struct, Children::Keyed(map))
        }
        TypeNode::Array(array) => {
            let dims = dims_override.unwrap_or_else(|| array.dimensions.clone());
            let children = match dims.first().copied() {
                None => Children::None,
                Some(dim) => {
                    let length = dim.length.max(1);
                    let mut items = Vec::with_capacity(length as usize);
                    if dims.len() > 1 {
                        // Proxy children spanning an equal share of the
                        // parent range.
                        let span = pointer.size / length;
                        for i in 0..length {
                            let idx = dim.start_index + i as i32;
                            let child_pointer = Pointer::new(
                                pointer.index_group,
                                pointer.index_offset + i * span,
                                span,
                            );
                            items.push(instantiate_with_dims(
                                ctx,
                                ty,
                                format!("{path}[{idx}]"),
                                child_pointer,
                                read_only,
                                &emitter,
                                Some(dims[1..].to_vec()),
                            ));
                        }
                    } else {
                        let step = array.element.byte_size();
                        for i in 0..length {
                            let idx = dim.start_index + i as i32;
                            let child_pointer = Pointer::new(
                                pointer.index_group,
                                pointer.index_offset + i * step,
                                step,
                            );
                            items.push(instantiate(
                                ctx,
                                &array.element,
                                format!("{path}[{idx}]"),
                                child_pointer,
                                read_only,
                                &emitter,
                            ));
                        }
                    }
                    Children::Indexed {
                        start_index: dim.start_index,
                        items,
                    }
                }
            };
            dimensions = dims;
            (SymbolKind::Array, children)
        }
    };

    Arc::new(SymbolNode {
        path,
        kind,
        type_node: Some(Arc::clone(ty)),
        pointer,
        read_only,
        valid: AtomicBool::new(true),
        children,
        emitter,
        ctx: Arc::clone(ctx),
        subscription: AsyncMutex::new(None),
        rpc_methods,
        dimensions,
    })
}
