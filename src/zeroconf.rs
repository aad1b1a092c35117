//! Bridge from the store's mempool processing into the notification pipeline

use crate::notification::{Notification, ZcNotificationPacket};
use crate::registry::RegistryInner;
use crate::store::ZeroConfCallbacks;
use crate::types::ScrAddr;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Holds only a weak reference: the store may outlive the registry, and
/// every callback is a no-op once the registry is gone or stopping.
#[derive(Debug, Clone)]
pub struct ZeroConfBridge {
    registry: Weak<RegistryInner>,
}

impl ZeroConfBridge {
    pub(crate) fn new(registry: Weak<RegistryInner>) -> Self {
        Self { registry }
    }

    fn live(&self) -> Option<Arc<RegistryInner>> {
        self.registry.upgrade().filter(|r| r.is_running())
    }
}

impl ZeroConfCallbacks for ZeroConfBridge {
    fn has_scr_addr(&self, scr_addr: &ScrAddr) -> BTreeSet<String> {
        let Some(registry) = self.live() else {
            return BTreeSet::new();
        };
        registry
            .sessions()
            .snapshot()
            .iter()
            .filter(|(_, session)| session.has_scr_addr(scr_addr))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn push_zc_notification(&self, packet: ZcNotificationPacket) {
        match self.live() {
            Some(registry) => registry.enqueue_notification(Notification::ZeroConf(packet)),
            None => debug!(bdv_id = %packet.bdv_id, "zero conf packet after shutdown dropped"),
        }
    }

    fn error_callback(&self, bdv_id: &str, error: String, tx_hash: &str) {
        if let Some(registry) = self.live() {
            registry.enqueue_notification(Notification::ZcError {
                bdv_id: bdv_id.to_string(),
                message: error,
                tx_hash: tx_hash.to_string(),
            });
        }
    }
}
