//! Supplier directory
//!
//! Tracks the ordered supplier list for one customer: which peer occupies
//! each slot and whether it is currently reachable. A slot is *active* only
//! when it is both assigned and online; every scan and dispatch decision in
//! the crate uses that single predicate.

use parking_lot::RwLock;

use crate::fragment::SupplierSlot;

/// One occupied supplier slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplierInfo {
    /// Peer identity string, e.g. `"carol@node-c"`.
    pub peer: String,
    pub online: bool,
}

/// Ordered supplier slots with online status, shared behind a lock so the
/// transport side can flip reachability while the engine reads.
pub struct SupplierDirectory {
    slots: RwLock<Vec<Option<SupplierInfo>>>,
}

impl SupplierDirectory {
    /// Create a directory with `count` empty slots.
    pub fn new(count: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; count]),
        }
    }

    /// Create a directory with every slot assigned and online.
    pub fn with_peers(peers: &[&str]) -> Self {
        let slots = peers
            .iter()
            .map(|peer| {
                Some(SupplierInfo {
                    peer: peer.to_string(),
                    online: true,
                })
            })
            .collect();
        Self {
            slots: RwLock::new(slots),
        }
    }

    pub fn count(&self) -> usize {
        self.slots.read().len()
    }

    /// Assign a peer to a slot, replacing any previous occupant. New
    /// assignments start offline until the transport confirms contact.
    pub fn assign(&self, slot: SupplierSlot, peer: impl Into<String>) {
        let mut slots = self.slots.write();
        if let Some(entry) = slots.get_mut(slot) {
            *entry = Some(SupplierInfo {
                peer: peer.into(),
                online: false,
            });
        }
    }

    pub fn clear_slot(&self, slot: SupplierSlot) {
        let mut slots = self.slots.write();
        if let Some(entry) = slots.get_mut(slot) {
            *entry = None;
        }
    }

    pub fn set_online(&self, slot: SupplierSlot, online: bool) {
        let mut slots = self.slots.write();
        if let Some(Some(info)) = slots.get_mut(slot) {
            info.online = online;
        }
    }

    pub fn peer(&self, slot: SupplierSlot) -> Option<String> {
        self.slots
            .read()
            .get(slot)
            .and_then(|entry| entry.as_ref())
            .map(|info| info.peer.clone())
    }

    pub fn is_assigned(&self, slot: SupplierSlot) -> bool {
        self.slots
            .read()
            .get(slot)
            .map(|entry| entry.is_some())
            .unwrap_or(false)
    }

    pub fn is_online(&self, slot: SupplierSlot) -> bool {
        self.slots
            .read()
            .get(slot)
            .and_then(|entry| entry.as_ref())
            .map(|info| info.online)
            .unwrap_or(false)
    }

    /// Assigned and online.
    pub fn is_active(&self, slot: SupplierSlot) -> bool {
        self.slots
            .read()
            .get(slot)
            .and_then(|entry| entry.as_ref())
            .map(|info| info.online)
            .unwrap_or(false)
    }

    /// Slots that are assigned and online, in slot order.
    pub fn active_slots(&self) -> Vec<SupplierSlot> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.as_ref().map(|info| info.online).unwrap_or(false))
            .map(|(slot, _)| slot)
            .collect()
    }

    /// True when no slot is empty. Send sweeps refuse to run otherwise
    /// because fragment routing would be ambiguous.
    pub fn all_assigned(&self) -> bool {
        self.slots.read().iter().all(|entry| entry.is_some())
    }

    /// Which slot a peer currently occupies.
    pub fn position_of(&self, peer: &str) -> Option<SupplierSlot> {
        self.slots
            .read()
            .iter()
            .position(|entry| entry.as_ref().map(|info| info.peer == peer).unwrap_or(false))
    }

    /// Snapshot of the active predicate per slot, for presence math.
    pub fn active_bitmap(&self) -> Vec<bool> {
        self.slots
            .read()
            .iter()
            .map(|entry| entry.as_ref().map(|info| info.online).unwrap_or(false))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_directory() {
        let dir = SupplierDirectory::new(4);
        assert_eq!(dir.count(), 4);
        assert!(!dir.all_assigned());
        assert!(dir.active_slots().is_empty());
        assert!(!dir.is_active(0));
        assert!(dir.peer(0).is_none());
    }

    #[test]
    fn test_assign_starts_offline() {
        let dir = SupplierDirectory::new(2);
        dir.assign(0, "carol@node-c");
        assert!(dir.is_assigned(0));
        assert!(!dir.is_online(0));
        assert!(!dir.is_active(0));

        dir.set_online(0, true);
        assert!(dir.is_active(0));
        assert_eq!(dir.active_slots(), vec![0]);
    }

    #[test]
    fn test_with_peers_all_active() {
        let dir = SupplierDirectory::with_peers(&["a@1", "b@2", "c@3"]);
        assert!(dir.all_assigned());
        assert_eq!(dir.active_slots(), vec![0, 1, 2]);
        assert_eq!(dir.active_bitmap(), vec![true, true, true]);
    }

    #[test]
    fn test_offline_slot_is_not_active() {
        let dir = SupplierDirectory::with_peers(&["a@1", "b@2"]);
        dir.set_online(1, false);
        assert!(dir.is_assigned(1));
        assert!(!dir.is_active(1));
        assert_eq!(dir.active_slots(), vec![0]);
        assert_eq!(dir.active_bitmap(), vec![true, false]);
        // Still fully assigned even while offline.
        assert!(dir.all_assigned());
    }

    #[test]
    fn test_clear_slot() {
        let dir = SupplierDirectory::with_peers(&["a@1", "b@2"]);
        dir.clear_slot(0);
        assert!(!dir.is_assigned(0));
        assert!(!dir.all_assigned());
        assert_eq!(dir.active_slots(), vec![1]);
    }

    #[test]
    fn test_position_of() {
        let dir = SupplierDirectory::with_peers(&["a@1", "b@2", "c@3"]);
        assert_eq!(dir.position_of("b@2"), Some(1));
        assert_eq!(dir.position_of("nobody@x"), None);
    }

    #[test]
    fn test_out_of_range_slot_is_safe() {
        let dir = SupplierDirectory::new(2);
        dir.assign(9, "x@y");
        dir.set_online(9, true);
        assert!(!dir.is_assigned(9));
        assert!(!dir.is_active(9));
    }
}
