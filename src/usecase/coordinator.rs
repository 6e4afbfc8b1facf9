//! Top-level coordinator: owns the transport, the type registry and the
//! symbol graph.
//!
//! `initialize` connects, installs the source-change probe and builds
//! types then symbols. `kill` is best-effort teardown in the opposite
//! order; it keeps going past failures and re-raises the first one after
//! the coordinator state is torn down. A changed source timestamp
//! defaults to `reinitialize`, overridable via an injected handler.

use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapters::transport::{
    ConnectionEvent, NotifyCallback, SubscriptionHandle, Transport,
};
use crate::core::registry::TypeRegistry;
use crate::core::settings::MirrorSettings;
use crate::error::MirrorError;
use crate::symbols::events::{
    Emitter, Listener, ListenerId, SymbolEvent, EVENT_CONNECTED, EVENT_CONNECTION_LOST,
    EVENT_DISCONNECTED, EVENT_KILLED, EVENT_RECONNECTED, EVENT_REINITIALIZED,
    EVENT_SOURCE_CHANGED,
};
use crate::symbols::graph::SymbolGraph;
use crate::symbols::node::SymbolNode;

/// Reaction to a detected source change; replaces the default
/// `reinitialize`.
pub type SourceChangeHandler = Arc<dyn Fn(Arc<Coordinator>) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Initializing,
    Initialized,
}

#[derive(Default)]
struct CoordinatorState {
    types: Option<TypeRegistry>,
    graph: Option<SymbolGraph>,
    probe: Option<SubscriptionHandle>,
    forwarder: Option<JoinHandle<()>>,
}

pub struct Coordinator {
    id: Uuid,
    settings: MirrorSettings,
    transport: Arc<dyn Transport>,
    emitter: Arc<Emitter>,
    phase: Mutex<Phase>,
    state: Mutex<CoordinatorState>,
    probe_stamp: Mutex<Option<Vec<u8>>>,
    source_change_handler: Mutex<Option<SourceChangeHandler>>,
}

impl Coordinator {
    pub fn new(transport: Arc<dyn Transport>, settings: MirrorSettings) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            settings,
            transport,
            emitter: Arc::new(Emitter::new()),
            phase: Mutex::new(Phase::Idle),
            state: Mutex::new(CoordinatorState::default()),
            probe_stamp: Mutex::new(None),
            source_change_handler: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &MirrorSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        *self.phase.lock() == Phase::Initialized
    }

    /// Connect, install the source-change probe, build types, build
    /// symbols. Fails with `TransportBusy` when already initialized.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), MirrorError> {
        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Idle {
                return Err(MirrorError::TransportBusy);
            }
            *phase = Phase::Initializing;
        }
        match self.initialize_inner().await {
            Ok(()) => {
                *self.phase.lock() = Phase::Initialized;
                debug!("[mirror][{}] initialized", self.id);
                Ok(())
            }
            Err(err) => {
                *self.phase.lock() = Phase::Idle;
                Err(err)
            }
        }
    }

    async fn initialize_inner(self: &Arc<Self>) -> Result<(), MirrorError> {
        self.transport
            .connect()
            .await
            .map_err(MirrorError::ConnectFailed)?;
        self.emit_lifecycle(EVENT_CONNECTED);

        let forwarder = self.spawn_connection_forwarder();
        match self.build_mirror().await {
            Ok((types, graph, probe)) => {
                let mut state = self.state.lock();
                state.types = Some(types);
                state.graph = Some(graph);
                state.probe = probe;
                state.forwarder = Some(forwarder);
                Ok(())
            }
            Err(err) => {
                forwarder.abort();
                let _ = self.transport.unsubscribe_all().await;
                let _ = self.transport.disconnect(false).await;
                Err(err)
            }
        }
    }

    async fn build_mirror(
        self: &Arc<Self>,
    ) -> Result<(TypeRegistry, SymbolGraph, Option<SubscriptionHandle>), MirrorError> {
        let probe = if self.settings.monitor_source_changes {
            let weak = Arc::downgrade(self);
            let callback: NotifyCallback = Arc::new(move |bytes: &[u8]| {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.on_probe_sample(bytes);
                }
            });
            let handle = self
                .transport
                .subscribe_path(
                    &self.settings.source_probe_path,
                    callback,
                    Some(self.settings.health_check_interval_ms),
                )
                .await
                .map_err(MirrorError::ChangeDetectionFailed)?;
            Some(handle)
        } else {
            None
        };

        let types = TypeRegistry::build(self.transport.as_ref(), Some(&self.emitter)).await?;
        let graph = SymbolGraph::build(
            Arc::clone(&self.transport),
            &types,
            &self.settings,
            Some(&self.emitter),
        )
        .await?;
        Ok((types, graph, probe))
    }

    /// Best-effort teardown: symbols, types, probe, transport. Keeps
    /// going past failures, re-raises the first one at the end. A no-op
    /// on an idle coordinator.
    pub async fn kill(self: &Arc<Self>) -> Result<(), MirrorError> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Idle => return Ok(()),
                Phase::Initializing => return Err(MirrorError::TransportBusy),
                Phase::Initialized => *phase = Phase::Idle,
            }
        }

        let (types, graph, probe, forwarder) = {
            let mut state = self.state.lock();
            (
                state.types.take(),
                state.graph.take(),
                state.probe.take(),
                state.forwarder.take(),
            )
        };

        let mut first_err: Option<MirrorError> = None;
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Some(graph) = graph {
            graph.destroy();
        }
        if let Some(types) = types {
            types.destroy();
        }
        if let Some(probe) = probe {
            if let Err(source) = self.transport.unsubscribe(probe).await {
                first_err.get_or_insert(MirrorError::UnsubscribeFailed {
                    path: self.settings.source_probe_path.clone(),
                    source,
                });
            }
        }
        if let Err(source) = self.transport.unsubscribe_all().await {
            first_err.get_or_insert(MirrorError::UnsubscribeFailed {
                path: "*".to_string(),
                source,
            });
        }
        if let Err(source) = self.transport.disconnect(false).await {
            first_err.get_or_insert(MirrorError::DisconnectFailed(source));
        }

        self.emit_lifecycle(EVENT_DISCONNECTED);
        self.emit_lifecycle(EVENT_KILLED);
        debug!("[mirror][{}] killed", self.id);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Kill then initialize; the whole graph is rebuilt and previously
    /// handed-out handles stay invalid.
    pub async fn reinitialize(self: &Arc<Self>) -> Result<(), MirrorError> {
        if let Err(err) = self.kill().await {
            warn!("[mirror][{}] teardown during reinitialize failed: {err}", self.id);
        }
        self.initialize().await?;
        self.emit_lifecycle(EVENT_REINITIALIZED);
        Ok(())
    }

    /// Top-level namespaces of the current graph (empty when not
    /// initialized).
    pub fn namespaces(&self) -> IndexMap<String, Arc<SymbolNode>> {
        self.state
            .lock()
            .graph
            .as_ref()
            .map(|graph| graph.namespaces().clone())
            .unwrap_or_default()
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<SymbolNode>> {
        self.state
            .lock()
            .graph
            .as_ref()
            .and_then(|graph| graph.namespace(name))
    }

    /// Dotted-path lookup, e.g. `MAIN.structuredValue.realValue`.
    pub fn symbol(&self, path: &str) -> Option<Arc<SymbolNode>> {
        self.state
            .lock()
            .graph
            .as_ref()
            .and_then(|graph| graph.symbol(path))
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

    pub fn set_source_change_handler(&self, handler: SourceChangeHandler) {
        *self.source_change_handler.lock() = Some(handler);
    }

    fn emit_lifecycle(&self, name: &str) {
        self.emitter
            .emit(&SymbolEvent::new(name, "coordinator", "lifecycle", None));
    }

    fn spawn_connection_forwarder(&self) -> JoinHandle<()> {
        let mut rx = self.transport.connection_events();
        let emitter = Arc::clone(&self.emitter);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ConnectionEvent::ConnectionLost) => emitter.emit(&SymbolEvent::new(
                        EVENT_CONNECTION_LOST,
                        "transport",
                        "connection",
                        None,
                    )),
                    Ok(ConnectionEvent::Reconnected) => emitter.emit(&SymbolEvent::new(
                        EVENT_RECONNECTED,
                        "transport",
                        "connection",
                        None,
                    )),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Probe samples: the first observed value is the baseline; any later
    /// difference means the controller swapped its program.
    fn on_probe_sample(self: &Arc<Self>, bytes: &[u8]) {
        let changed = {
            let mut stamp = self.probe_stamp.lock();
            match stamp.as_deref() {
                None => {
                    *stamp = Some(bytes.to_vec());
                    false
                }
                Some(previous) if previous == bytes => false,
                _ => {
                    *stamp = Some(bytes.to_vec());
                    true
                }
            }
        };
        if !changed {
            return;
        }
        debug!("[mirror][{}] source change detected", self.id);
        self.emitter.emit(&SymbolEvent::new(
            EVENT_SOURCE_CHANGED,
            "transport",
            "probe",
            None,
        ));
        let handler = self.source_change_handler.lock().clone();
        let coordinator = Arc::clone(self);
        match handler {
            Some(handler) => handler(coordinator),
            None => {
                tokio::spawn(async move {
                    if let Err(err) = coordinator.reinitialize().await {
                        warn!(
                            "[mirror][{}] rebuild after source change failed: {err}",
                            coordinator.id
                        );
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::transport::mock::MockTransport;
    use crate::core::model::{Pointer, RawSymbolDescriptor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mock_with_program() -> Arc<MockTransport> {
        let mock = Arc::new(MockTransport::new());
        mock.insert_symbol(RawSymbolDescriptor {
            full_path: "MAIN.counter".to_string(),
            type_name: "INT".to_string(),
            pointer: Pointer::new(0x4020, 0, 2),
            attributes: Vec::new(),
        });
        mock.update_system_value("SystemInfo.AppTimestamp", &1u64.to_le_bytes());
        mock
    }

    #[tokio::test]
    async fn initialize_twice_is_busy() {
        let mock = mock_with_program();
        let coordinator =
            Coordinator::new(Arc::clone(&mock) as Arc<dyn Transport>, MirrorSettings::default());

        coordinator.initialize().await.unwrap();
        let err = coordinator.initialize().await.unwrap_err();
        assert!(matches!(err, MirrorError::TransportBusy));
    }

    #[tokio::test]
    async fn kill_invalidates_handles_and_is_idempotent() {
        let mock = mock_with_program();
        let coordinator =
            Coordinator::new(Arc::clone(&mock) as Arc<dyn Transport>, MirrorSettings::default());
        coordinator.initialize().await.unwrap();

        let handle = coordinator.symbol("MAIN.counter").unwrap();
        coordinator.kill().await.unwrap();

        assert!(!handle.is_valid());
        assert!(coordinator.namespaces().is_empty());
        assert_eq!(mock.subscription_count(), 0);
        coordinator.kill().await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_events_reach_root_listeners() {
        let mock = mock_with_program();
        let coordinator =
            Coordinator::new(Arc::clone(&mock) as Arc<dyn Transport>, MirrorSettings::default());

        let connected = Arc::new(AtomicUsize::new(0));
        let killed = Arc::new(AtomicUsize::new(0));
        let connected_probe = Arc::clone(&connected);
        coordinator.on(
            EVENT_CONNECTED,
            Arc::new(move |_| {
                connected_probe.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let killed_probe = Arc::clone(&killed);
        coordinator.on(
            EVENT_KILLED,
            Arc::new(move |_| {
                killed_probe.fetch_add(1, Ordering::SeqCst);
            }),
        );

        coordinator.initialize().await.unwrap();
        coordinator.kill().await.unwrap();

        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(killed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_source_change_handler_replaces_the_default() {
        let mock = mock_with_program();
        let coordinator =
            Coordinator::new(Arc::clone(&mock) as Arc<dyn Transport>, MirrorSettings::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_probe = Arc::clone(&fired);
        coordinator.set_source_change_handler(Arc::new(move |_coordinator| {
            fired_probe.fetch_add(1, Ordering::SeqCst);
        }));

        coordinator.initialize().await.unwrap();
        let handle = coordinator.symbol("MAIN.counter").unwrap();

        mock.update_system_value("SystemInfo.AppTimestamp", &2u64.to_le_bytes());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The custom handler chose not to rebuild, handles stay alive.
        assert!(handle.is_valid());
    }
}
