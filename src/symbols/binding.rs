//! Binding operations on symbol nodes.
//!
//! Reads collect the subtree's leaf pointers, fan the bulk result back
//! out by declaration order and decode concurrently; writes validate per
//! kind, encode concurrently and emit packages in declaration order.
//! Bulk calls are split at the transport item cap, order preserved.

use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use indexmap::IndexMap;
use log::warn;

use crate::adapters::transport::NotifyCallback;
use crate::core::model::{Pointer, RawPackage, RpcResult};
use crate::core::types::{Bounds, TypeNode};
use crate::core::value::Value;
use crate::error::MirrorError;

use super::events::{EVENT_CHANGED, EVENT_CLEARED, EVENT_GET, EVENT_SET};
use super::node::{BindingContext, Children, SymbolKind, SymbolNode};

/// Invoked with the freshly-read value each time a subscription fires.
pub type ValueCallback = Arc<dyn Fn(Value) + Send + Sync>;

fn out_of_range(node: &SymbolNode, message: impl Into<String>) -> MirrorError {
    MirrorError::OutOfRange {
        path: node.path.clone(),
        message: message.into(),
    }
}

fn invalid_type(node: &SymbolNode, expected: impl Into<String>, got: &Value) -> MirrorError {
    MirrorError::InvalidType {
        path: node.path.clone(),
        expected: expected.into(),
        got: got.kind_name(),
    }
}

fn lookup_value<'v>(map: &'v IndexMap<String, Value>, key: &str) -> Option<&'v Value> {
    map.get(key)
        .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v))
}

impl SymbolNode {
    /// Number of transport items a read of this subtree produces.
    pub fn read_package_count(&self) -> usize {
        match &self.children {
            Children::None => 1,
            Children::Keyed(map) => map.values().map(|c| c.read_package_count()).sum(),
            Children::Indexed { items, .. } => {
                items.iter().map(|c| c.read_package_count()).sum()
            }
        }
    }

    pub(crate) fn read_packages(&self, out: &mut Vec<Pointer>) {
        match &self.children {
            Children::None => out.push(self.pointer),
            Children::Keyed(map) => {
                for child in map.values() {
                    child.read_packages(out);
                }
            }
            Children::Indexed { items, .. } => {
                for child in items {
                    child.read_packages(out);
                }
            }
        }
    }

    /// Write packages restoring defaults; read-only leaves are skipped.
    pub(crate) fn clear_packages(&self, out: &mut Vec<RawPackage>) {
        match &self.children {
            Children::None => {
                if self.read_only {
                    return;
                }
                let Some(ty) = &self.type_node else {
                    return;
                };
                let default_raw = &ty.base().default_raw;
                if default_raw.is_empty() {
                    return;
                }
                out.push(RawPackage::new(
                    self.pointer.index_group,
                    self.pointer.index_offset,
                    default_raw.clone(),
                ));
            }
            Children::Keyed(map) => {
                for child in map.values() {
                    child.clear_packages(out);
                }
            }
            Children::Indexed { items, .. } => {
                for child in items {
                    child.clear_packages(out);
                }
            }
        }
    }

    /// Pull the subtree's bytes and decode them.
    pub async fn get(self: &Arc<Self>) -> Result<Value, MirrorError> {
        self.ensure_valid()?;
        let mut pointers = Vec::with_capacity(self.read_package_count());
        self.read_packages(&mut pointers);
        let packages = read_chunked(&self.ctx, &self.path, &pointers).await?;
        let value = self.decode_packages(&packages).await?;
        self.emit(EVENT_GET, "read", Some(value.clone()));
        Ok(value)
    }

    /// Validate, encode and push a value. Composite writes dispatch only
    /// the keys present in the caller's value.
    pub async fn set(self: &Arc<Self>, value: Value) -> Result<Value, MirrorError> {
        self.ensure_valid()?;
        let packages = self.encode_packages(&value).await?;
        write_chunked(&self.ctx, &self.path, &packages).await?;
        self.emit(EVENT_SET, "write", Some(value.clone()));
        Ok(value)
    }

    /// Restore the subtree to its type defaults, skipping read-only
    /// descendants.
    pub async fn clear(self: &Arc<Self>) -> Result<(), MirrorError> {
        self.ensure_valid()?;
        if self.read_only {
            return Err(MirrorError::ReadOnly {
                path: self.path.clone(),
            });
        }
        let mut packages = Vec::new();
        self.clear_packages(&mut packages);
        if !packages.is_empty() {
            write_chunked(&self.ctx, &self.path, &packages).await?;
        }
        self.emit(EVENT_CLEARED, "clear", None);
        Ok(())
    }

    /// Install a change notifier; firing schedules a fresh read and then
    /// invokes the callback with its result. Idempotent.
    pub async fn subscribe(
        self: &Arc<Self>,
        cycle_ms: Option<u32>,
        callback: ValueCallback,
    ) -> Result<(), MirrorError> {
        self.ensure_valid()?;
        let mut slot = self.subscription.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let cycle = cycle_ms.unwrap_or(self.ctx.default_cycle_ms);
        let weak = Arc::downgrade(self);
        let notify: NotifyCallback = Arc::new(move |_bytes: &[u8]| {
            let Some(node) = weak.upgrade() else {
                return;
            };
            let callback = Arc::clone(&callback);
            tokio::spawn(async move {
                match node.get().await {
                    Ok(value) => {
                        node.emit(EVENT_CHANGED, "notification", Some(value.clone()));
                        callback(value);
                    }
                    Err(err) => warn!("subscription read failed for {}: {err}", node.path),
                }
            });
        });
        let handle = self
            .ctx
            .transport
            .subscribe_raw(self.pointer, notify, cycle)
            .await
            .map_err(|source| MirrorError::SubscribeFailed {
                path: self.path.clone(),
                source,
            })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Remove the change notifier; a no-op when none is installed.
    pub async fn unsubscribe(&self) -> Result<(), MirrorError> {
        let mut slot = self.subscription.lock().await;
        let Some(handle) = slot.take() else {
            return Ok(());
        };
        self.ctx
            .transport
            .unsubscribe(handle)
            .await
            .map_err(|source| MirrorError::UnsubscribeFailed {
                path: self.path.clone(),
                source,
            })
    }

    /// Controller-side method invocation; available on struct nodes that
    /// exposed RPC methods. Arguments are passed through unchecked.
    pub async fn invoke(
        &self,
        method: &str,
        args: IndexMap<String, Value>,
    ) -> Result<RpcResult, MirrorError> {
        self.ensure_valid()?;
        let known = self.kind == SymbolKind::Struct
            && self
                .rpc_methods
                .iter()
                .any(|name| name.eq_ignore_ascii_case(method));
        if !known {
            return Err(out_of_range(self, format!("unknown rpc method {method}")));
        }
        self.ctx
            .transport
            .invoke_rpc_method(&self.path, method, &args)
            .await
            .map_err(|source| MirrorError::RpcCallFailed {
                path: self.path.clone(),
                method: method.to_string(),
                source,
            })
    }

    fn decode_packages<'a>(
        &'a self,
        packages: &'a [RawPackage],
    ) -> BoxFuture<'a, Result<Value, MirrorError>> {
        Box::pin(async move {
            match &self.children {
                Children::None => {
                    if packages.len() != 1 {
                        return Err(out_of_range(
                            self,
                            format!("expected 1 data package, got {}", packages.len()),
                        ));
                    }
                    self.decode_leaf(&packages[0].data).await
                }
                Children::Keyed(map) => {
                    let slices = slice_by_children(self, map.values(), packages)?;
                    let decoded = try_join_all(
                        map.values()
                            .zip(slices.iter().copied())
                            .map(|(child, slice)| child.decode_packages(slice)),
                    )
                    .await?;
                    let mut out = IndexMap::with_capacity(map.len());
                    for (key, value) in map.keys().zip(decoded) {
                        out.insert(key.clone(), value);
                    }
                    Ok(Value::Struct(out))
                }
                Children::Indexed { items, .. } => {
                    let slices = slice_by_children(self, items.iter(), packages)?;
                    let decoded = try_join_all(
                        items
                            .iter()
                            .zip(slices.iter().copied())
                            .map(|(child, slice)| child.decode_packages(slice)),
                    )
                    .await?;
                    Ok(Value::Array(decoded))
                }
            }
        })
    }

    async fn decode_leaf(&self, data: &[u8]) -> Result<Value, MirrorError> {
        let Some(ty) = self.type_node.as_deref() else {
            return Err(out_of_range(self, "leaf without a resolved type"));
        };
        let value = self
            .ctx
            .transport
            .convert_from_raw(data, ty.name())
            .await
            .map_err(|source| MirrorError::FromRawFailed {
                path: self.path.clone(),
                source,
            })?;
        match ty {
            // The wire layer reports 64-bit values signed; mask unsigned
            // reads back into the full range.
            TypeNode::Numeric(numeric) if numeric.base.kind.is_unsigned() => match value {
                Value::Int(n) => Ok(Value::UInt(n as u64)),
                other => Ok(other),
            },
            TypeNode::Enum(en) => match value {
                Value::String(name) if !name.contains('.') => {
                    Ok(Value::String(format!("{}.{name}", en.base.name)))
                }
                other => Ok(other),
            },
            _ => Ok(value),
        }
    }

    fn encode_packages<'a>(
        &'a self,
        value: &'a Value,
    ) -> BoxFuture<'a, Result<Vec<RawPackage>, MirrorError>> {
        Box::pin(async move {
            if self.read_only {
                return Err(MirrorError::ReadOnly {
                    path: self.path.clone(),
                });
            }
            match &self.children {
                Children::None => {
                    let data = self.encode_leaf(value).await?;
                    Ok(vec![RawPackage::new(
                        self.pointer.index_group,
                        self.pointer.index_offset,
                        data,
                    )])
                }
                Children::Keyed(map) => {
                    let Some(fields) = value.as_struct() else {
                        return Err(invalid_type(self, "struct", value));
                    };
                    for key in fields.keys() {
                        let known = map.contains_key(key)
                            || map.keys().any(|k| k.eq_ignore_ascii_case(key));
                        if !known {
                            return Err(out_of_range(self, format!("unknown member {key}")));
                        }
                    }
                    // Only keys present in the caller's value are written;
                    // the rest of the struct is left untouched.
                    let selected: Vec<(&Arc<SymbolNode>, &Value)> = map
                        .iter()
                        .filter_map(|(key, child)| {
                            lookup_value(fields, key).map(|value| (child, value))
                        })
                        .collect();
                    let encoded = try_join_all(
                        selected
                            .into_iter()
                            .map(|(child, value)| child.encode_packages(value)),
                    )
                    .await?;
                    Ok(encoded.into_iter().flatten().collect())
                }
                Children::Indexed { items, .. } => {
                    let Some(values) = value.as_array() else {
                        return Err(invalid_type(self, "array", value));
                    };
                    if values.len() > items.len() {
                        return Err(out_of_range(
                            self,
                            format!(
                                "array accepts at most {} elements, got {}",
                                items.len(),
                                values.len()
                            ),
                        ));
                    }
                    let encoded = try_join_all(
                        items
                            .iter()
                            .zip(values)
                            .map(|(child, value)| child.encode_packages(value)),
                    )
                    .await?;
                    Ok(encoded.into_iter().flatten().collect())
                }
            }
        })
    }

    async fn encode_leaf(&self, value: &Value) -> Result<Vec<u8>, MirrorError> {
        let Some(ty) = self.type_node.as_deref() else {
            return Err(out_of_range(self, "leaf without a resolved type"));
        };
        match ty {
            TypeNode::Boolean(_) => {
                if value.as_bool().is_none() {
                    return Err(invalid_type(self, "bool", value));
                }
            }
            TypeNode::Numeric(numeric) => {
                if numeric.base.kind.is_float() {
                    let Some(v) = value.as_f64() else {
                        return Err(invalid_type(self, "float", value));
                    };
                    if !numeric.bounds.contains_float(v) {
                        return Err(out_of_range(self, bounds_message(&numeric.bounds, v)));
                    }
                } else {
                    let Some(v) = value.as_i128() else {
                        return Err(invalid_type(self, "integer", value));
                    };
                    if !numeric.bounds.contains_int(v) {
                        return Err(out_of_range(
                            self,
                            bounds_message(&numeric.bounds, v as f64),
                        ));
                    }
                }
            }
            TypeNode::String(string) => {
                let Some(text) = value.as_str() else {
                    return Err(invalid_type(self, "string", value));
                };
                let units = if string.wide {
                    text.encode_utf16().count()
                } else {
                    text.len()
                };
                if units > string.max_len {
                    return Err(out_of_range(
                        self,
                        format!("string of {units} units exceeds max {}", string.max_len),
                    ));
                }
            }
            TypeNode::Enum(en) => {
                let Some(name) = value.as_str() else {
                    return Err(invalid_type(self, "qualified enum member", value));
                };
                // Writes never call the encoder: the pre-encoded member
                // bytes are dispatched directly.
                let raw = en.encoding.get(name).or_else(|| {
                    en.encoding
                        .iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case(name))
                        .map(|(_, raw)| raw)
                });
                return match raw {
                    Some(raw) => Ok(raw.clone()),
                    None => Err(out_of_range(
                        self,
                        format!("{name} is not a member of {}", en.base.name),
                    )),
                };
            }
            TypeNode::Struct(_) | TypeNode::Array(_) => {
                return Err(invalid_type(self, ty.variant_name(), value));
            }
        }
        self.ctx
            .transport
            .convert_to_raw(value, ty.name())
            .await
            .map_err(|source| MirrorError::ToRawFailed {
                path: self.path.clone(),
                source,
            })
    }
}

fn bounds_message(bounds: &Bounds, value: f64) -> String {
    match bounds {
        Bounds::Int { lower, upper } => {
            format!("{value} outside [{lower}, {upper}]")
        }
        Bounds::Float { lower, upper } => {
            format!("{value} outside [{lower}, {upper}]")
        }
    }
}

/// Partition a composite's data packages by each child's package count.
fn slice_by_children<'p, 'c>(
    node: &SymbolNode,
    children: impl Iterator<Item = &'c Arc<SymbolNode>>,
    packages: &'p [RawPackage],
) -> Result<Vec<&'p [RawPackage]>, MirrorError> {
    let mut slices = Vec::new();
    let mut cursor = 0usize;
    for child in children {
        let count = child.read_package_count();
        let end = cursor + count;
        if end > packages.len() {
            return Err(out_of_range(
                node,
                format!("expected at least {end} data packages, got {}", packages.len()),
            ));
        }
        slices.push(&packages[cursor..end]);
        cursor = end;
    }
    if cursor != packages.len() {
        return Err(out_of_range(
            node,
            format!("expected {cursor} data packages, got {}", packages.len()),
        ));
    }
    Ok(slices)
}

pub(crate) async fn read_chunked(
    ctx: &BindingContext,
    path: &str,
    pointers: &[Pointer],
) -> Result<Vec<RawPackage>, MirrorError> {
    let cap = ctx.max_items_per_request.max(1);
    let mut out = Vec::with_capacity(pointers.len());
    for chunk in pointers.chunks(cap) {
        let packages = ctx
            .transport
            .read_raw_multi(chunk)
            .await
            .map_err(|source| MirrorError::ReadFailed {
                path: path.to_string(),
                source,
            })?;
        if packages.len() != chunk.len() {
            return Err(MirrorError::OutOfRange {
                path: path.to_string(),
                message: format!(
                    "transport returned {} packages for {} pointers",
                    packages.len(),
                    chunk.len()
                ),
            });
        }
        out.extend(packages);
    }
    Ok(out)
}

pub(crate) async fn write_chunked(
    ctx: &BindingContext,
    path: &str,
    packages: &[RawPackage],
) -> Result<(), MirrorError> {
    let cap = ctx.max_items_per_request.max(1);
    for chunk in packages.chunks(cap) {
        ctx.transport
            .write_raw_multi(chunk)
            .await
            .map_err(|source| MirrorError::WriteFailed {
                path: path.to_string(),
                source,
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::transport::mock::MockTransport;
    use crate::adapters::transport::Transport;

    #[tokio::test]
    async fn chunked_reads_split_at_the_item_cap_in_order() {
        let mock = Arc::new(MockTransport::new());
        mock.connect().await.unwrap();
        let ctx = BindingContext {
            transport: Arc::clone(&mock) as Arc<dyn Transport>,
            max_items_per_request: 4,
            default_cycle_ms: 200,
        };

        let pointers: Vec<Pointer> =
            (0..10).map(|i| Pointer::new(0x4020, i, 1)).collect();
        let packages = read_chunked(&ctx, "test", &pointers).await.unwrap();

        assert_eq!(packages.len(), 10);
        assert_eq!(mock.read_call_sizes(), vec![4, 4, 2]);
        let offsets: Vec<u32> = packages.iter().map(|p| p.index_offset).collect();
        assert_eq!(offsets, (0..10).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn chunked_writes_split_at_the_item_cap() {
        let mock = Arc::new(MockTransport::new());
        mock.connect().await.unwrap();
        let ctx = BindingContext {
            transport: Arc::clone(&mock) as Arc<dyn Transport>,
            max_items_per_request: 3,
            default_cycle_ms: 200,
        };

        let packages: Vec<RawPackage> = (0..7)
            .map(|i| RawPackage::new(0x4020, i, vec![i as u8]))
            .collect();
        write_chunked(&ctx, "test", &packages).await.unwrap();

        assert_eq!(mock.write_call_sizes(), vec![3, 3, 1]);
        assert_eq!(mock.memory_at(0x4020, 6, 1), vec![6]);
    }
}
