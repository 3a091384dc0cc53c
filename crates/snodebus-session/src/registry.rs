use bytes::Bytes;
use snodebus_frame::MAX_PAYLOAD;
use tokio::sync::mpsc;

use crate::error::{Result, SessionError};
use crate::opcode::KEY_LEN;

/// Most endpoints an Init packet can carry in one frame.
pub const MAX_ENDPOINTS: usize = (MAX_PAYLOAD - 2) / KEY_LEN;

/// Handle to a registry entry that survives renumbering.
pub(crate) type Slot = u64;

#[derive(Debug)]
struct Entry {
    slot: Slot,
    key: [u8; KEY_LEN],
    id: Option<u8>,
    inbound: mpsc::UnboundedSender<Bytes>,
}

/// Registry contents captured for one handshake.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub slots: Vec<Slot>,
    pub keys: Vec<[u8; KEY_LEN]>,
    revision: u64,
}

/// Ordered endpoint list whose positions are the wire ids.
///
/// Every mutation bumps `revision` and marks the registry dirty. A
/// handshake only clears the dirty flag when nothing changed while it was
/// in flight; `generation` counts completed handshakes.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: Vec<Entry>,
    next_slot: Slot,
    revision: u64,
    dirty: bool,
    generation: u64,
}

impl Registry {
    pub fn insert(
        &mut self,
        key: [u8; KEY_LEN],
        inbound: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Slot> {
        if self.entries.len() >= MAX_ENDPOINTS {
            return Err(SessionError::RegistryFull(MAX_ENDPOINTS));
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.entries.push(Entry {
            slot,
            key,
            id: None,
            inbound,
        });
        self.touch();
        Ok(slot)
    }

    /// Remove the entry for `slot`, dropping its inbound route.
    pub fn remove(&mut self, slot: Slot) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.slot == slot) else {
            return false;
        };
        self.entries.remove(pos);
        self.touch();
        true
    }

    /// Drop every entry. Used when the session shuts down.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.touch();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            slots: self.entries.iter().map(|e| e.slot).collect(),
            keys: self.entries.iter().map(|e| e.key).collect(),
            revision: self.revision,
        }
    }

    /// Apply a completed handshake: ids follow snapshot order.
    ///
    /// Entries added after the snapshot stay unassigned. Returns the new
    /// generation.
    pub fn complete_handshake(&mut self, snapshot: &Snapshot) -> u64 {
        for entry in &mut self.entries {
            entry.id = snapshot
                .slots
                .iter()
                .position(|&slot| slot == entry.slot)
                .map(|index| index as u8);
        }
        if self.revision == snapshot.revision {
            self.dirty = false;
        }
        self.generation += 1;
        self.generation
    }

    /// Current id of `slot` together with the generation it belongs to.
    pub fn resolve(&self, slot: Slot) -> Result<(u8, u64)> {
        let entry = self.entry(slot).ok_or(SessionError::EndpointClosed)?;
        let id = entry.id.ok_or(SessionError::Unassigned)?;
        Ok((id, self.generation))
    }

    /// Re-validate an id captured under `generation` before transmitting.
    ///
    /// Within the same generation the id is still what the device knows. After
    /// a newer handshake it is only valid if the endpoint kept the same id.
    pub fn confirm(&self, slot: Slot, id: u8, generation: u64) -> Result<u8> {
        if generation == self.generation {
            return Ok(id);
        }
        match self.entry(slot) {
            Some(entry) if entry.id == Some(id) => Ok(id),
            Some(entry) => Err(SessionError::StaleId {
                expected: id,
                current: entry.id,
            }),
            None => Err(SessionError::EndpointClosed),
        }
    }

    pub fn id_of(&self, slot: Slot) -> Option<u8> {
        self.entry(slot).and_then(|e| e.id)
    }

    /// Inbound route for messages addressed to `id`.
    pub fn route(&self, id: u8) -> Option<&mpsc::UnboundedSender<Bytes>> {
        self.entries
            .iter()
            .find(|e| e.id == Some(id))
            .map(|e| &e.inbound)
    }

    fn entry(&self, slot: Slot) -> Option<&Entry> {
        self.entries.iter().find(|e| e.slot == slot)
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.dirty = true;
    }
}
