//! Link lifecycle: adapter, scan, connection and listener ownership
//!
//! Every callback registered with the BLE stack is held as a
//! [`Subscription`]; dropping it unregisters the callback. The
//! [`LinkManager`] keeps at most one subscription per [`ListenerKind`] and
//! drops all of them on [`LinkManager::teardown`], so nothing registered by a
//! session outlives it.
//!
//! Every call into the stack that involves the peripheral is bounded by the
//! manager's operation timeout. Queued writes and reads run in order on a
//! per-connection task so a stalled one never blocks the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::discovery::{self, Selection};
use crate::engine::{Event, EventSink, WritePurpose};
use crate::error::{BackendError, DiscoveryError, LinkError};
use crate::gatt::{CharacteristicRef, PeripheralHandle, PeripheralId};

/// Callback payloads delivered by the BLE stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    DeviceFound {
        id: PeripheralId,
        name: Option<String>,
    },
    AdapterState {
        available: bool,
    },
    ValueChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    DeviceFound,
    AdapterState,
    ValueChanged,
}

impl ListenerKind {
    pub fn of(event: &LinkEvent) -> Self {
        match event {
            LinkEvent::DeviceFound { .. } => Self::DeviceFound,
            LinkEvent::AdapterState { .. } => Self::AdapterState,
            LinkEvent::ValueChanged { .. } => Self::ValueChanged,
        }
    }
}

pub type Listener = Box<dyn Fn(LinkEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The BLE stack as seen by the provisioning flow.
///
/// Implemented over btleplug by [`BtleplugBackend`](crate::BtleplugBackend);
/// tests plug in a scripted fake.
#[async_trait::async_trait]
pub trait BleBackend: Send + Sync + 'static {
    /// Acquire the radio. Fails with [`BackendError::RadioOff`] when the
    /// radio is powered down and [`BackendError::AlreadyOpen`] when already
    /// acquired.
    async fn open_adapter(&self) -> Result<(), BackendError>;
    async fn close_adapter(&self);

    async fn start_discovery(&self) -> Result<(), BackendError>;
    async fn stop_discovery(&self);

    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), BackendError>;
    async fn disconnect(&self, peripheral: &PeripheralId);

    async fn services(&self, peripheral: &PeripheralId) -> Result<Vec<Uuid>, BackendError>;
    async fn characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<CharacteristicRef>, BackendError>;

    async fn enable_notifications(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicRef,
    ) -> Result<(), BackendError>;
    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), BackendError>;
    async fn read(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>, BackendError>;

    fn add_listener(&self, kind: ListenerKind, listener: Listener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}

/// Callback table a backend dispatches [`LinkEvent`]s through.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<ListenerId, (ListenerKind, Arc<Listener>)>>,
}

impl ListenerRegistry {
    pub fn add(&self, kind: ListenerKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).insert(id, (kind, Arc::new(listener)));
        id
    }

    pub fn remove(&self, id: ListenerId) {
        lock(&self.listeners).remove(&id);
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, kind: ListenerKind) -> usize {
        lock(&self.listeners)
            .values()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Call every listener of the event's kind. The table is not locked
    /// while callbacks run.
    pub fn dispatch(&self, event: LinkEvent) {
        let kind = ListenerKind::of(&event);
        let targets: Vec<Arc<Listener>> = lock(&self.listeners)
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| l.clone())
            .collect();
        for listener in targets {
            listener(event.clone());
        }
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A registered callback; unregistered when dropped.
pub struct Subscription<B: BleBackend> {
    id: ListenerId,
    kind: ListenerKind,
    backend: Arc<B>,
}

impl<B: BleBackend> Subscription<B> {
    pub fn register(backend: &Arc<B>, kind: ListenerKind, listener: Listener) -> Self {
        let id = backend.add_listener(kind, listener);
        debug!("registered {kind:?} listener {id:?}");
        Self {
            id,
            kind,
            backend: backend.clone(),
        }
    }
}

impl<B: BleBackend> Drop for Subscription<B> {
    fn drop(&mut self) {
        debug!("removing {:?} listener {:?}", self.kind, self.id);
        self.backend.remove_listener(self.id);
    }
}

/// At most one live subscription per kind.
struct Subscriptions<B: BleBackend> {
    active: HashMap<ListenerKind, Subscription<B>>,
}

impl<B: BleBackend> Subscriptions<B> {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
        }
    }

    /// Drop the current subscription of this kind, then register the new one.
    fn replace(&mut self, backend: &Arc<B>, kind: ListenerKind, listener: Listener) {
        self.release(kind);
        self.active
            .insert(kind, Subscription::register(backend, kind, listener));
    }

    fn release(&mut self, kind: ListenerKind) {
        self.active.remove(&kind);
    }

    fn release_all(&mut self) {
        self.active.clear();
    }

    fn len(&self) -> usize {
        self.active.len()
    }
}

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

async fn bounded<T>(
    limit: Duration,
    operation: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(limit, operation)
        .await
        .unwrap_or_else(|_| Err(BackendError::TimedOut(limit)))
}

enum Io {
    Write {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        purpose: WritePurpose,
        sink: EventSink,
    },
    Read {
        characteristic: CharacteristicRef,
        sink: EventSink,
    },
}

/// Writes and reads for one connection, run in submission order. Outcomes
/// are reported through the sink each request carries.
struct IoQueue {
    tx: mpsc::UnboundedSender<Io>,
    task: JoinHandle<()>,
}

impl IoQueue {
    fn spawn<B: BleBackend>(backend: Arc<B>, peripheral: PeripheralId, limit: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(io) = rx.recv().await {
                match io {
                    Io::Write {
                        characteristic,
                        value,
                        purpose,
                        sink,
                    } => {
                        let result = bounded(limit, backend.write(&peripheral, &characteristic, &value))
                            .await
                            .map_err(|e| e.to_string());
                        if let Err(e) = &result {
                            debug!("{purpose:?} write failed: {e}");
                        }
                        sink.send(Event::WriteFinished { purpose, result });
                    }
                    Io::Read {
                        characteristic,
                        sink,
                    } => match bounded(limit, backend.read(&peripheral, &characteristic)).await {
                        Ok(value) => sink.send(Event::ValueReceived(value)),
                        Err(e) => debug!("read from {characteristic} failed: {e}"),
                    },
                }
            }
        });
        Self { tx, task }
    }

    fn submit(&self, io: Io) -> Result<(), LinkError> {
        self.tx.send(io).map_err(|_| LinkError::NotConnected)
    }

    /// Let already queued requests finish, waiting at most `limit`.
    async fn drain(self, limit: Duration) {
        let IoQueue { tx, mut task } = self;
        drop(tx);
        if tokio::time::timeout(limit, &mut task).await.is_err() {
            debug!("abandoning queued link i/o after {limit:?}");
            task.abort();
        }
    }

    fn abort(self) {
        self.task.abort();
    }
}

pub struct LinkManager<B: BleBackend> {
    backend: Arc<B>,
    timeout: Duration,
    adapter_open: bool,
    scanning: bool,
    handle: Option<PeripheralHandle>,
    io: Option<IoQueue>,
    subscriptions: Subscriptions<B>,
}

impl<B: BleBackend> LinkManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            timeout: DEFAULT_OPERATION_TIMEOUT,
            adapter_open: false,
            scanning: false,
            handle: None,
            io: None,
            subscriptions: Subscriptions::new(),
        }
    }

    /// Bound connect, discovery, write and read calls by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn handle(&self) -> Option<&PeripheralHandle> {
        self.handle.as_ref()
    }

    /// Live subscriptions held by this manager
    pub fn listener_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Acquire the adapter. Calling it again, or finding the adapter
    /// already open, is not an error.
    pub async fn open(&mut self) -> Result<(), LinkError> {
        if self.adapter_open {
            return Ok(());
        }
        match self.backend.open_adapter().await {
            Ok(()) => {}
            Err(BackendError::AlreadyOpen) => debug!("bluetooth adapter already open"),
            Err(BackendError::RadioOff) => return Err(LinkError::RadioUnavailable),
            Err(e) => return Err(LinkError::Adapter(e)),
        }
        info!("bluetooth adapter open");
        self.adapter_open = true;
        self.subscriptions.release(ListenerKind::AdapterState);
        Ok(())
    }

    /// Report radio power changes to `sink` until the adapter opens or the
    /// link is torn down.
    pub fn watch_radio(&mut self, sink: EventSink) {
        self.subscriptions.replace(
            &self.backend,
            ListenerKind::AdapterState,
            Box::new(move |event: LinkEvent| {
                if let LinkEvent::AdapterState { available } = event {
                    sink.send(Event::RadioStateChanged { available });
                }
            }),
        );
    }

    /// Start discovery and report the first advertisement named exactly
    /// `target`. Later matches in the same scan are dropped.
    pub async fn scan(&mut self, target: &str, sink: EventSink) -> Result<(), LinkError> {
        let target = target.to_string();
        let matched = AtomicBool::new(false);
        self.subscriptions.replace(
            &self.backend,
            ListenerKind::DeviceFound,
            Box::new(move |event: LinkEvent| {
                let LinkEvent::DeviceFound { id, name } = event else {
                    return;
                };
                debug!("found device {id}: {name:?}");
                if name.as_deref() != Some(target.as_str()) {
                    return;
                }
                if matched.swap(true, Ordering::SeqCst) {
                    debug!("ignoring repeated match {id}");
                    return;
                }
                sink.send(Event::DeviceFound {
                    peripheral: id,
                    name: target.clone(),
                });
            }),
        );

        if let Err(e) = self.backend.start_discovery().await {
            self.subscriptions.release(ListenerKind::DeviceFound);
            return Err(LinkError::Scan(e));
        }
        self.scanning = true;
        Ok(())
    }

    pub async fn stop_scan(&mut self) {
        self.subscriptions.release(ListenerKind::DeviceFound);
        if self.scanning {
            self.backend.stop_discovery().await;
            self.scanning = false;
        }
    }

    pub async fn connect(&mut self, id: &PeripheralId) -> Result<&PeripheralHandle, LinkError> {
        if self.handle.is_some() {
            self.disconnect().await;
        }
        info!("connecting to {id}");
        bounded(self.timeout, self.backend.connect(id))
            .await
            .map_err(LinkError::Connect)?;
        info!("connected to {id}");
        self.io = Some(IoQueue::spawn(self.backend.clone(), id.clone(), self.timeout));
        Ok(self.handle.insert(PeripheralHandle::new(id.clone())))
    }

    /// Select the command/response characteristics and start listening for
    /// values on the connected peripheral. The value listener is in place
    /// before this returns, so before any command is written.
    pub async fn discover(&mut self, sink: EventSink) -> Result<Selection, LinkError> {
        let id = self.connected()?.clone();
        let selection = tokio::time::timeout(self.timeout, discovery::discover(self.backend.as_ref(), &id))
            .await
            .map_err(|_| DiscoveryError::Services(BackendError::TimedOut(self.timeout)))??;
        info!("writing to {}, reading from {}", selection.write, selection.read);

        self.subscriptions.replace(
            &self.backend,
            ListenerKind::ValueChanged,
            Box::new(move |event: LinkEvent| {
                if let LinkEvent::ValueChanged { value, .. } = event {
                    sink.send(Event::ValueReceived(value));
                }
            }),
        );

        if selection.read.capabilities.can_push() {
            // explicit reads still work without notifications
            let enabled = bounded(self.timeout, self.backend.enable_notifications(&id, &selection.read));
            if let Err(e) = enabled.await {
                warn!("failed to enable notifications on {}: {e}", selection.read);
            }
        }

        Ok(selection)
    }

    pub async fn write(&self, characteristic: &CharacteristicRef, value: &[u8]) -> Result<(), LinkError> {
        let id = self.connected()?;
        bounded(self.timeout, self.backend.write(id, characteristic, value))
            .await
            .map_err(LinkError::Write)
    }

    pub async fn read(&self, characteristic: &CharacteristicRef) -> Result<Vec<u8>, LinkError> {
        let id = self.connected()?;
        bounded(self.timeout, self.backend.read(id, characteristic))
            .await
            .map_err(LinkError::Read)
    }

    /// Queue a write behind earlier ones; its outcome arrives on `sink` as
    /// [`Event::WriteFinished`].
    pub fn queue_write(
        &self,
        characteristic: &CharacteristicRef,
        value: Vec<u8>,
        purpose: WritePurpose,
        sink: EventSink,
    ) -> Result<(), LinkError> {
        self.queue()?.submit(Io::Write {
            characteristic: characteristic.clone(),
            value,
            purpose,
            sink,
        })
    }

    /// Queue a read; the value arrives on `sink` as [`Event::ValueReceived`].
    /// Failed reads are only logged.
    pub fn queue_read(&self, characteristic: &CharacteristicRef, sink: EventSink) -> Result<(), LinkError> {
        self.queue()?.submit(Io::Read {
            characteristic: characteristic.clone(),
            sink,
        })
    }

    /// Close the connection, invalidating the handle. Queued writes and
    /// reads get one operation timeout to finish first. No-op when nothing
    /// is connected.
    pub async fn disconnect(&mut self) {
        if let Some(io) = self.io.take() {
            io.drain(self.timeout).await;
        }
        if let Some(handle) = self.handle.take() {
            info!("disconnecting from {}", handle.id());
            self.backend.disconnect(handle.id()).await;
        }
    }

    /// Release every listener, stop discovery, drop the connection and close
    /// the adapter. Safe to call any number of times from any state.
    pub async fn teardown(&mut self) {
        if let Some(io) = self.io.take() {
            io.abort();
        }
        self.subscriptions.release_all();
        self.backend.stop_discovery().await;
        self.scanning = false;
        self.disconnect().await;
        self.backend.close_adapter().await;
        self.adapter_open = false;
        debug!("link torn down");
    }

    fn queue(&self) -> Result<&IoQueue, LinkError> {
        self.io.as_ref().ok_or(LinkError::NotConnected)
    }

    fn connected(&self) -> Result<&PeripheralId, LinkError> {
        self.handle
            .as_ref()
            .map(PeripheralHandle::id)
            .ok_or(LinkError::NotConnected)
    }
}
