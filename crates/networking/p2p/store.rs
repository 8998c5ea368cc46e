use crate::record::{AddressRecord, AddressState};
use crate::types::{PeerAddress, PeerId, SignalId};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

/// Indexed container of address records.
///
/// The primary index maps identity key to record, at most one per key. RTC
/// records are additionally reachable through their signal id. The store
/// maintains the count of records in state `Connecting`; all state changes
/// must go through [`set_state`](AddressStore::set_state) so the counter
/// stays exact.
#[derive(Debug, Default)]
pub struct AddressStore {
    records: IndexMap<PeerId, AddressRecord>,
    by_signal_id: FxHashMap<SignalId, PeerId>,
    connecting_count: usize,
}

impl AddressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting_count
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&AddressRecord> {
        self.records.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut AddressRecord> {
        self.records.get_mut(peer_id)
    }

    pub fn get_by_signal_id(&self, signal_id: &SignalId) -> Option<&AddressRecord> {
        let peer_id = self.by_signal_id.get(signal_id)?;
        self.records.get(peer_id)
    }

    pub fn values(&self) -> impl Iterator<Item = &AddressRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PeerId, &mut AddressRecord)> {
        self.records.iter_mut()
    }

    /// Inserts a record. Rejects duplicates: callers are expected to have
    /// checked [`get`](AddressStore::get) first.
    pub fn add(&mut self, record: AddressRecord) -> bool {
        let peer_id = record.address.peer_id;
        if self.records.contains_key(&peer_id) {
            return false;
        }
        if let Some(signal_id) = record.address.signal_id {
            self.by_signal_id.insert(signal_id, peer_id);
        }
        if record.state() == AddressState::Connecting {
            self.connecting_count += 1;
        }
        self.records.insert(peer_id, record);
        true
    }

    /// Removes a record, dropping its signal-id index entry and adjusting the
    /// connecting counter for its prior state.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<AddressRecord> {
        let record = self.records.swap_remove(peer_id)?;
        if let Some(signal_id) = record.address.signal_id {
            self.by_signal_id.remove(&signal_id);
        }
        if record.state() == AddressState::Connecting {
            self.connecting_count -= 1;
        }
        Some(record)
    }

    /// Transitions a record, keeping the connecting counter exact.
    /// Returns the prior state.
    pub fn set_state(&mut self, peer_id: &PeerId, state: AddressState) -> Option<AddressState> {
        let record = self.records.get_mut(peer_id)?;
        let prior = record.state;
        record.state = state;
        if prior == AddressState::Connecting && state != AddressState::Connecting {
            self.connecting_count -= 1;
        } else if prior != AddressState::Connecting && state == AddressState::Connecting {
            self.connecting_count += 1;
        }
        Some(prior)
    }

    /// Replaces the stored address of a record, migrating the signal-id index
    /// entry if the relay identity changed.
    pub fn update_address(&mut self, peer_id: &PeerId, address: PeerAddress) {
        let Some(record) = self.records.get_mut(peer_id) else {
            return;
        };
        let old_signal = record.address.signal_id;
        let new_signal = address.signal_id;
        record.address = address;
        if old_signal != new_signal {
            if let Some(old) = old_signal {
                self.by_signal_id.remove(&old);
            }
            if let Some(new) = new_signal {
                self.by_signal_id.insert(new, *peer_id);
            }
        }
    }
}
