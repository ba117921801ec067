//! btleplug implementation of [`BleBackend`]
//!
//! One adapter per backend. Adapter events (advertisements, radio power)
//! and characteristic notifications are pumped by background tasks into a
//! [`ListenerRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::BackendError;
use crate::gatt::{Capabilities, CharacteristicRef, PeripheralId};
use crate::link::{BleBackend, LinkEvent, Listener, ListenerId, ListenerKind, ListenerRegistry, lock};

/// A device seen by [`scan`]
#[derive(Debug, Clone)]
pub struct NearbyDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertised name equals the name being looked for
    pub is_target: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, BackendError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(BackendError::NoAdapter)
}

/// Scan for `duration` and list everything that advertised a name.
pub async fn scan(duration: Duration, target: &str) -> Result<Vec<NearbyDevice>, BackendError> {
    let adapter = get_adapter().await?;

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let is_target = name == target;
            devices.push(NearbyDevice {
                name,
                address: peripheral.address().to_string(),
                rssi: props.rssi,
                is_target,
            });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

struct Radio {
    adapter: Adapter,
    events: JoinHandle<()>,
    powered: bool,
}

#[derive(Default)]
pub struct BtleplugBackend {
    radio: Mutex<Option<Radio>>,
    peripherals: Arc<Mutex<HashMap<PeripheralId, Peripheral>>>,
    notifications: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
    listeners: Arc<ListenerRegistry>,
}

impl BtleplugBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn adapter(&self) -> Result<Adapter, BackendError> {
        lock(&self.radio)
            .as_ref()
            .map(|r| r.adapter.clone())
            .ok_or(BackendError::AdapterClosed)
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, BackendError> {
        lock(&self.peripherals)
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::UnknownPeripheral(id.to_string()))
    }

    async fn spawn_event_pump(&self, adapter: &Adapter) -> Result<JoinHandle<()>, BackendError> {
        let mut events = adapter.events().await?;
        let adapter = adapter.clone();
        let peripherals = self.peripherals.clone();
        let listeners = self.listeners.clone();

        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(pid) | CentralEvent::DeviceUpdated(pid) => {
                        let Ok(peripheral) = adapter.peripheral(&pid).await else {
                            continue;
                        };
                        let name = match peripheral.properties().await {
                            Ok(props) => props.and_then(|p| p.local_name),
                            Err(e) => {
                                debug!("no properties for {pid:?}: {e}");
                                None
                            }
                        };
                        let id = PeripheralId::new(format!("{pid:?}"));
                        lock(&peripherals).insert(id.clone(), peripheral);
                        listeners.dispatch(LinkEvent::DeviceFound { id, name });
                    }
                    CentralEvent::StateUpdate(state) => {
                        debug!("adapter state: {state:?}");
                        listeners.dispatch(LinkEvent::AdapterState {
                            available: state == CentralState::PoweredOn,
                        });
                    }
                    _ => {}
                }
            }
            debug!("adapter event stream ended");
        }))
    }

    fn characteristic(
        peripheral: &Peripheral,
        target: &CharacteristicRef,
    ) -> Result<Characteristic, BackendError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.characteristic && c.service_uuid == target.service)
            .ok_or(BackendError::UnknownCharacteristic(target.characteristic))
    }
}

fn capabilities(flags: CharPropFlags) -> Capabilities {
    Capabilities {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn write_type(capabilities: Capabilities) -> WriteType {
    if capabilities.write {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    }
}

#[async_trait::async_trait]
impl BleBackend for BtleplugBackend {
    async fn open_adapter(&self) -> Result<(), BackendError> {
        let existing = lock(&self.radio).as_ref().map(|r| (r.adapter.clone(), r.powered));
        let adapter = match existing {
            Some((_, true)) => return Err(BackendError::AlreadyOpen),
            Some((adapter, false)) => adapter,
            None => {
                let adapter = get_adapter().await?;
                // pump runs while the radio is off so power-on is observed
                let events = self.spawn_event_pump(&adapter).await?;
                *lock(&self.radio) = Some(Radio {
                    adapter: adapter.clone(),
                    events,
                    powered: false,
                });
                adapter
            }
        };

        if adapter.adapter_state().await? == CentralState::PoweredOff {
            return Err(BackendError::RadioOff);
        }
        if let Some(radio) = lock(&self.radio).as_mut() {
            radio.powered = true;
        }
        info!("adapter {} ready", adapter.adapter_info().await.unwrap_or_default());
        Ok(())
    }

    async fn close_adapter(&self) {
        for (_, pump) in lock(&self.notifications).drain() {
            pump.abort();
        }
        lock(&self.peripherals).clear();
        if let Some(radio) = lock(&self.radio).take() {
            radio.events.abort();
            debug!("adapter closed");
        }
    }

    async fn start_discovery(&self) -> Result<(), BackendError> {
        self.adapter()?.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_discovery(&self) {
        let Ok(adapter) = self.adapter() else {
            return;
        };
        if let Err(e) = adapter.stop_scan().await {
            debug!("stop_scan: {e}");
        }
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), BackendError> {
        let peripheral = self.peripheral(id)?;
        peripheral.connect().await?;

        let mut stream = peripheral.notifications().await?;
        let listeners = self.listeners.clone();
        let pump = tokio::spawn(async move {
            while let Some(n) = stream.next().await {
                listeners.dispatch(LinkEvent::ValueChanged {
                    characteristic: n.uuid,
                    value: n.value,
                });
            }
        });
        if let Some(old) = lock(&self.notifications).insert(id.clone(), pump) {
            old.abort();
        }
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) {
        if let Some(pump) = lock(&self.notifications).remove(id) {
            pump.abort();
        }
        let Ok(peripheral) = self.peripheral(id) else {
            return;
        };
        if let Err(e) = peripheral.disconnect().await {
            warn!("disconnect from {id}: {e}");
        }
    }

    async fn services(&self, id: &PeripheralId) -> Result<Vec<Uuid>, BackendError> {
        let peripheral = self.peripheral(id)?;
        peripheral.discover_services().await?;
        Ok(peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<CharacteristicRef>, BackendError> {
        let peripheral = self.peripheral(id)?;
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or(BackendError::UnknownService(service))?;
        Ok(service
            .characteristics
            .iter()
            .map(|c| CharacteristicRef {
                service: service.uuid,
                characteristic: c.uuid,
                capabilities: capabilities(c.properties),
            })
            .collect())
    }

    async fn enable_notifications(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
    ) -> Result<(), BackendError> {
        let peripheral = self.peripheral(id)?;
        let c = Self::characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&c).await?;
        Ok(())
    }

    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), BackendError> {
        let peripheral = self.peripheral(id)?;
        let c = Self::characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&c, value, write_type(characteristic.capabilities))
            .await?;
        Ok(())
    }

    async fn read(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>, BackendError> {
        let peripheral = self.peripheral(id)?;
        let c = Self::characteristic(&peripheral, characteristic)?;
        Ok(peripheral.read(&c).await?)
    }

    fn add_listener(&self, kind: ListenerKind, listener: Listener) -> ListenerId {
        self.listeners.add(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}
