//! Characteristic discovery
//!
//! The alarm firmware does not pin its GATT layout, so we pick the
//! characteristics to talk to at connect time: the first writable one is
//! used for commands, the first readable-but-not-writable one (or failing
//! that, the first one that can be read, notified or indicated) is used for
//! responses. Both picks are made across every service, in service order.

use helpme_proto::ble::is_standard_service;
use log::{debug, warn};
use uuid::Uuid;

use crate::error::DiscoveryError;
use crate::gatt::{CharacteristicRef, PeripheralId};
use crate::link::BleBackend;

/// The two characteristics a session talks through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub write: CharacteristicRef,
    pub read: CharacteristicRef,
}

/// Two-slot accumulator folded over the characteristics of each service.
/// A slot is never replaced once filled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates {
    write: Option<CharacteristicRef>,
    read_only: Option<CharacteristicRef>,
    observable: Option<CharacteristicRef>,
}

impl Candidates {
    pub fn absorb(self, characteristics: &[CharacteristicRef]) -> Self {
        characteristics.iter().fold(self, Self::offer)
    }

    fn offer(self, c: &CharacteristicRef) -> Self {
        let caps = c.capabilities;
        Self {
            write: self.write.or_else(|| caps.can_write().then(|| c.clone())),
            read_only: self
                .read_only
                .or_else(|| (caps.read && !caps.can_write()).then(|| c.clone())),
            observable: self
                .observable
                .or_else(|| caps.can_observe().then(|| c.clone())),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.write.is_some() && (self.read_only.is_some() || self.observable.is_some())
    }

    pub fn finish(self) -> Result<Selection, DiscoveryError> {
        match (self.write, self.read_only.or(self.observable)) {
            (Some(write), Some(read)) => Ok(Selection { write, read }),
            _ => Err(DiscoveryError::NoUsableCharacteristics),
        }
    }
}

/// Vendor services when the peripheral has any, otherwise everything.
pub fn prefer_vendor_services(services: Vec<Uuid>) -> Vec<Uuid> {
    let vendor: Vec<Uuid> = services
        .iter()
        .copied()
        .filter(|s| !is_standard_service(&s.to_string()))
        .collect();
    if vendor.is_empty() { services } else { vendor }
}

/// Walk the services of a connected peripheral and select the command and
/// response characteristics.
pub async fn discover<B: BleBackend + ?Sized>(
    backend: &B,
    peripheral: &PeripheralId,
) -> Result<Selection, DiscoveryError> {
    let services = backend
        .services(peripheral)
        .await
        .map_err(DiscoveryError::Services)?;
    debug!("{peripheral} exposes {} services", services.len());

    let mut candidates = Candidates::default();
    for service in prefer_vendor_services(services) {
        match backend.characteristics(peripheral, service).await {
            Ok(characteristics) => {
                debug!("service {service}: {} characteristics", characteristics.len());
                candidates = candidates.absorb(&characteristics);
            }
            Err(e) => warn!("skipping service {service}: {e}"),
        }
    }

    candidates.finish()
}
