//! In-memory mock transport for demos and tests without a live controller.
//!
//! Behaviour:
//! - byte-addressed memory per index group, zero-filled on first touch
//! - little-endian primitive codec resolved through the registered
//!   catalogue, so derived type names work like on a real controller
//! - raw subscriptions fire when a write overlaps their range; path
//!   subscriptions fire on `update_system_value` (and once at subscribe
//!   time, establishing the baseline)
//! - per-call item counts are recorded so tests can observe splitting

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::model::{
    Pointer, RawPackage, RawSymbolDescriptor, RawTypeDescriptor, RpcResult, WireKind,
};
use crate::core::value::Value;

use super::{
    ConnectionEvent, NotifyCallback, SubscriptionHandle, Transport, TransportError,
    TransportFuture,
};

pub type RpcHandler =
    Arc<dyn Fn(&IndexMap<String, Value>) -> Result<RpcResult, TransportError> + Send + Sync>;

struct RawSub {
    pointer: Pointer,
    callback: NotifyCallback,
}

struct PathSub {
    path: String,
    callback: NotifyCallback,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    memory: HashMap<u32, Vec<u8>>,
    data_types: HashMap<String, RawTypeDescriptor>,
    symbols: HashMap<String, RawSymbolDescriptor>,
    system_values: HashMap<String, Vec<u8>>,
    raw_subs: HashMap<Uuid, RawSub>,
    path_subs: HashMap<Uuid, PathSub>,
    rpc_handlers: HashMap<String, RpcHandler>,
    read_calls: Vec<usize>,
    write_calls: Vec<usize>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Fresh mock with the primitive types a controller seeds its
    /// catalogue with.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        let mock = Self {
            state: Mutex::new(MockState::default()),
            events,
        };
        for (name, kind, size) in [
            ("BOOL", WireKind::Bit, 1),
            ("BYTE", WireKind::UInt8, 1),
            ("SINT", WireKind::Int8, 1),
            ("USINT", WireKind::UInt8, 1),
            ("INT", WireKind::Int16, 2),
            ("UINT", WireKind::UInt16, 2),
            ("DINT", WireKind::Int32, 4),
            ("UDINT", WireKind::UInt32, 4),
            ("LINT", WireKind::Int64, 8),
            ("ULINT", WireKind::UInt64, 8),
            ("REAL", WireKind::Real32, 4),
            ("LREAL", WireKind::Real64, 8),
        ] {
            mock.insert_data_type(RawTypeDescriptor::primitive(name, kind, size));
        }
        mock
    }

    pub fn insert_data_type(&self, raw: RawTypeDescriptor) {
        let key = raw.name.trim().to_ascii_lowercase();
        self.state.lock().data_types.insert(key, raw);
    }

    pub fn insert_symbol(&self, raw: RawSymbolDescriptor) {
        self.state
            .lock()
            .symbols
            .insert(raw.full_path.clone(), raw);
    }

    pub fn load_memory(&self, group: u32, offset: u32, bytes: &[u8]) {
        let mut state = self.state.lock();
        let memory = state.memory.entry(group).or_default();
        let end = offset as usize + bytes.len();
        if memory.len() < end {
            memory.resize(end, 0);
        }
        memory[offset as usize..end].copy_from_slice(bytes);
    }

    pub fn memory_at(&self, group: u32, offset: u32, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        read_range(&state.memory, Pointer::new(group, offset, len as u32))
    }

    /// Set a system-info variable and fire its path subscriptions.
    pub fn update_system_value(&self, path: &str, bytes: &[u8]) {
        let fired: Vec<NotifyCallback> = {
            let mut state = self.state.lock();
            state.system_values.insert(path.to_string(), bytes.to_vec());
            state
                .path_subs
                .values()
                .filter(|sub| sub.path == path)
                .map(|sub| Arc::clone(&sub.callback))
                .collect()
        };
        for callback in fired {
            callback(bytes);
        }
    }

    pub fn register_rpc(&self, path: &str, method: &str, handler: RpcHandler) {
        self.state
            .lock()
            .rpc_handlers
            .insert(rpc_key(path, method), handler);
    }

    pub fn fire_connection_event(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn read_call_sizes(&self) -> Vec<usize> {
        self.state.lock().read_calls.clone()
    }

    pub fn write_call_sizes(&self) -> Vec<usize> {
        self.state.lock().write_calls.clone()
    }

    pub fn clear_call_log(&self) {
        let mut state = self.state.lock();
        state.read_calls.clear();
        state.write_calls.clear();
    }

    pub fn subscription_count(&self) -> usize {
        let state = self.state.lock();
        state.raw_subs.len() + state.path_subs.len()
    }
}

fn rpc_key(path: &str, method: &str) -> String {
    format!("{}::{}", path.to_ascii_lowercase(), method.to_ascii_lowercase())
}

fn read_range(memory: &HashMap<u32, Vec<u8>>, pointer: Pointer) -> Vec<u8> {
    let mut out = vec![0u8; pointer.size as usize];
    if let Some(bytes) = memory.get(&pointer.index_group) {
        let start = (pointer.index_offset as usize).min(bytes.len());
        let end = (pointer.end() as usize).min(bytes.len());
        out[..end - start].copy_from_slice(&bytes[start..end]);
    }
    out
}

fn overlaps(a: Pointer, b: Pointer) -> bool {
    a.index_group == b.index_group && a.index_offset < b.end() && b.index_offset < a.end()
}

fn ensure_connected(state: &MockState) -> Result<(), TransportError> {
    if state.connected {
        Ok(())
    } else {
        Err(TransportError::NotConnected)
    }
}

fn codec_entry(
    state: &MockState,
    type_name: &str,
) -> Result<RawTypeDescriptor, TransportError> {
    state
        .data_types
        .get(&type_name.trim().to_ascii_lowercase())
        .cloned()
        .ok_or_else(|| TransportError::UnknownType {
            name: type_name.to_string(),
        })
}

fn require_len(data: &[u8], needed: usize, type_name: &str) -> Result<(), TransportError> {
    if data.len() < needed {
        return Err(TransportError::Codec {
            message: format!("{type_name}: need {needed} bytes, got {}", data.len()),
        });
    }
    Ok(())
}

fn decode(raw: &RawTypeDescriptor, data: &[u8]) -> Result<Value, TransportError> {
    if !raw.enum_fields.is_empty() {
        let needed = raw.byte_size as usize;
        require_len(data, needed, &raw.name)?;
        return raw
            .enum_fields
            .iter()
            .find(|field| field.raw.get(..needed) == Some(&data[..needed]))
            .map(|field| Value::String(field.name.clone()))
            .ok_or_else(|| TransportError::Codec {
                message: format!("{}: no enum member for raw value", raw.name),
            });
    }

    match raw.kind {
        WireKind::Bit => {
            require_len(data, 1, &raw.name)?;
            Ok(Value::Bool(data[0] != 0))
        }
        WireKind::Int8 => {
            require_len(data, 1, &raw.name)?;
            Ok(Value::Int(data[0] as i8 as i64))
        }
        WireKind::UInt8 => {
            require_len(data, 1, &raw.name)?;
            Ok(Value::UInt(data[0] as u64))
        }
        WireKind::Int16 => {
            require_len(data, 2, &raw.name)?;
            Ok(Value::Int(i16::from_le_bytes([data[0], data[1]]) as i64))
        }
        WireKind::UInt16 => {
            require_len(data, 2, &raw.name)?;
            Ok(Value::UInt(u16::from_le_bytes([data[0], data[1]]) as u64))
        }
        WireKind::Int32 => {
            require_len(data, 4, &raw.name)?;
            Ok(Value::Int(
                i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64,
            ))
        }
        WireKind::UInt32 => {
            require_len(data, 4, &raw.name)?;
            Ok(Value::UInt(
                u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64,
            ))
        }
        // The wire layer reports 64-bit values signed; unsigned masking
        // is the binding's job.
        WireKind::Int64 | WireKind::UInt64 => {
            require_len(data, 8, &raw.name)?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[..8]);
            Ok(Value::Int(i64::from_le_bytes(bytes)))
        }
        WireKind::Real32 => {
            require_len(data, 4, &raw.name)?;
            Ok(Value::Float(
                f32::from_le_bytes([data[0], data[1], data[2], data[3]]) as f64,
            ))
        }
        WireKind::Real64 => {
            require_len(data, 8, &raw.name)?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[..8]);
            Ok(Value::Float(f64::from_le_bytes(bytes)))
        }
        WireKind::String => {
            let terminator = data.iter().position(|b| *b == 0).unwrap_or(data.len());
            Ok(Value::String(
                String::from_utf8_lossy(&data[..terminator]).into_owned(),
            ))
        }
        WireKind::WString => {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .take_while(|unit| *unit != 0)
                .collect();
            Ok(Value::String(String::from_utf16_lossy(&units)))
        }
        _ => Err(TransportError::Codec {
            message: format!("{}: not a primitive leaf kind", raw.name),
        }),
    }
}

fn encode_int(value: &Value, raw: &RawTypeDescriptor) -> Result<i128, TransportError> {
    value.as_i128().ok_or_else(|| TransportError::Codec {
        message: format!("{}: expected integer, got {}", raw.name, value.kind_name()),
    })
}

fn encode(raw: &RawTypeDescriptor, value: &Value) -> Result<Vec<u8>, TransportError> {
    if !raw.enum_fields.is_empty() {
        let Value::String(name) = value else {
            return Err(TransportError::Codec {
                message: format!("{}: expected member name", raw.name),
            });
        };
        let bare = name.rsplit('.').next().unwrap_or(name);
        return raw
            .enum_fields
            .iter()
            .find(|field| field.name == bare)
            .map(|field| {
                let mut bytes = field.raw.clone();
                bytes.resize(raw.byte_size as usize, 0);
                bytes
            })
            .ok_or_else(|| TransportError::Codec {
                message: format!("{}: unknown enum member {name}", raw.name),
            });
    }

    match raw.kind {
        WireKind::Bit => {
            let flag = value.as_bool().ok_or_else(|| TransportError::Codec {
                message: format!("{}: expected bool, got {}", raw.name, value.kind_name()),
            })?;
            Ok(vec![flag as u8])
        }
        WireKind::Int8 | WireKind::UInt8 => {
            Ok(vec![(encode_int(value, raw)? as u8)])
        }
        WireKind::Int16 | WireKind::UInt16 => {
            Ok((encode_int(value, raw)? as u16).to_le_bytes().to_vec())
        }
        WireKind::Int32 | WireKind::UInt32 => {
            Ok((encode_int(value, raw)? as u32).to_le_bytes().to_vec())
        }
        WireKind::Int64 | WireKind::UInt64 => {
            Ok((encode_int(value, raw)? as u64).to_le_bytes().to_vec())
        }
        WireKind::Real32 => {
            let v = value.as_f64().ok_or_else(|| TransportError::Codec {
                message: format!("{}: expected float, got {}", raw.name, value.kind_name()),
            })?;
            Ok((v as f32).to_le_bytes().to_vec())
        }
        WireKind::Real64 => {
            let v = value.as_f64().ok_or_else(|| TransportError::Codec {
                message: format!("{}: expected float, got {}", raw.name, value.kind_name()),
            })?;
            Ok(v.to_le_bytes().to_vec())
        }
        WireKind::String => {
            let Value::String(text) = value else {
                return Err(TransportError::Codec {
                    message: format!("{}: expected string, got {}", raw.name, value.kind_name()),
                });
            };
            let capacity = (raw.byte_size as usize).saturating_sub(1);
            let mut bytes: Vec<u8> = text.bytes().take(capacity).collect();
            bytes.resize(raw.byte_size as usize, 0);
            Ok(bytes)
        }
        WireKind::WString => {
            let Value::String(text) = value else {
                return Err(TransportError::Codec {
                    message: format!("{}: expected string, got {}", raw.name, value.kind_name()),
                });
            };
            let capacity = (raw.byte_size as usize / 2).saturating_sub(1);
            let mut bytes = Vec::with_capacity(raw.byte_size as usize);
            for unit in text.encode_utf16().take(capacity) {
                bytes.extend_from_slice(&unit.to_le_bytes());
            }
            bytes.resize(raw.byte_size as usize, 0);
            Ok(bytes)
        }
        _ => Err(TransportError::Codec {
            message: format!("{}: not a primitive leaf kind", raw.name),
        }),
    }
}

impl Transport for MockTransport {
    fn connect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().connected = true;
            Ok(())
        })
    }

    fn disconnect(&self, _force: bool) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.connected = false;
            state.raw_subs.clear();
            state.path_subs.clear();
            Ok(())
        })
    }

    fn read_raw_multi<'a>(
        &'a self,
        pointers: &'a [Pointer],
    ) -> TransportFuture<'a, Vec<RawPackage>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            ensure_connected(&state)?;
            state.read_calls.push(pointers.len());
            Ok(pointers
                .iter()
                .map(|pointer| RawPackage {
                    index_group: pointer.index_group,
                    index_offset: pointer.index_offset,
                    data: read_range(&state.memory, *pointer),
                })
                .collect())
        })
    }

    fn write_raw_multi<'a>(&'a self, packages: &'a [RawPackage]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let fired: Vec<(NotifyCallback, Vec<u8>)> = {
                let mut state = self.state.lock();
                ensure_connected(&state)?;
                state.write_calls.push(packages.len());
                for package in packages {
                    let memory = state.memory.entry(package.index_group).or_default();
                    let end = package.index_offset as usize + package.data.len();
                    if memory.len() < end {
                        memory.resize(end, 0);
                    }
                    memory[package.index_offset as usize..end].copy_from_slice(&package.data);
                }
                state
                    .raw_subs
                    .values()
                    .filter(|sub| {
                        packages
                            .iter()
                            .any(|package| overlaps(sub.pointer, package.pointer()))
                    })
                    .map(|sub| {
                        (
                            Arc::clone(&sub.callback),
                            read_range(&state.memory, sub.pointer),
                        )
                    })
                    .collect()
            };
            for (callback, bytes) in fired {
                callback(&bytes);
            }
            Ok(())
        })
    }

    fn convert_from_raw<'a>(
        &'a self,
        data: &'a [u8],
        type_name: &'a str,
    ) -> TransportFuture<'a, Value> {
        Box::pin(async move {
            let raw = codec_entry(&self.state.lock(), type_name)?;
            decode(&raw, data)
        })
    }

    fn convert_to_raw<'a>(
        &'a self,
        value: &'a Value,
        type_name: &'a str,
    ) -> TransportFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let raw = codec_entry(&self.state.lock(), type_name)?;
            encode(&raw, value)
        })
    }

    fn read_and_cache_data_types(
        &self,
    ) -> TransportFuture<'_, HashMap<String, RawTypeDescriptor>> {
        Box::pin(async move { Ok(self.state.lock().data_types.clone()) })
    }

    fn read_and_cache_symbols(&self) -> TransportFuture<'_, HashMap<String, RawSymbolDescriptor>> {
        Box::pin(async move { Ok(self.state.lock().symbols.clone()) })
    }

    fn subscribe_path<'a>(
        &'a self,
        path: &'a str,
        callback: NotifyCallback,
        _cycle_ms: Option<u32>,
    ) -> TransportFuture<'a, SubscriptionHandle> {
        Box::pin(async move {
            let handle = SubscriptionHandle::new();
            let initial: Option<Vec<u8>> = {
                let mut state = self.state.lock();
                ensure_connected(&state)?;
                let initial = state.system_values.get(path).cloned().or_else(|| {
                    state
                        .symbols
                        .get(path)
                        .map(|symbol| read_range(&state.memory, symbol.pointer))
                });
                if initial.is_none() {
                    return Err(TransportError::UnknownSymbol {
                        path: path.to_string(),
                    });
                }
                state.path_subs.insert(
                    handle.id,
                    PathSub {
                        path: path.to_string(),
                        callback: Arc::clone(&callback),
                    },
                );
                initial
            };
            if let Some(bytes) = initial {
                callback(&bytes);
            }
            Ok(handle)
        })
    }

    fn subscribe_raw<'a>(
        &'a self,
        pointer: Pointer,
        callback: NotifyCallback,
        _cycle_ms: u32,
    ) -> TransportFuture<'a, SubscriptionHandle> {
        Box::pin(async move {
            let mut state = self.state.lock();
            ensure_connected(&state)?;
            let handle = SubscriptionHandle::new();
            state.raw_subs.insert(handle.id, RawSub { pointer, callback });
            Ok(handle)
        })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.raw_subs.remove(&handle.id);
            state.path_subs.remove(&handle.id);
            Ok(())
        })
    }

    fn unsubscribe_all(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.raw_subs.clear();
            state.path_subs.clear();
            Ok(())
        })
    }

    fn invoke_rpc_method<'a>(
        &'a self,
        path: &'a str,
        method: &'a str,
        args: &'a IndexMap<String, Value>,
    ) -> TransportFuture<'a, RpcResult> {
        Box::pin(async move {
            let handler = {
                let state = self.state.lock();
                ensure_connected(&state)?;
                state.rpc_handlers.get(&rpc_key(path, method)).cloned()
            };
            match handler {
                Some(handler) => handler(args),
                None => Err(TransportError::Comm {
                    message: format!("no rpc handler for {path}::{method}"),
                }),
            }
        })
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
