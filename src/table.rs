use std::collections::HashMap;

use rand::{Rng, RngCore};

use crate::error::{Error, Result};

/// Local or remote connection identifier. Zero is never assigned.
pub type ConnectionId = u16;

/// Caller-derived identity of a peer (e.g. a hash of its address), used to find a connection
/// before connection IDs have been exchanged.
pub type SenderKey = u64;

pub const INVALID_CONNECTION_ID: ConnectionId = 0;

const LOOKUP_CAPACITY_GROWN_MIN: usize = 32;
const LOOKUP_CAPACITY_MAX: usize = 1 << 16;

/// What the table knows about a live connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionRecord {
    /// ID assigned by this side.
    pub local_id: ConnectionId,
    /// ID assigned by the peer, zero until the peer has told us.
    pub remote_id: ConnectionId,
    pub sender_key: SenderKey,
}

/// Active connections, keyed by local ID and by sender key.
///
/// Records live in an open-addressed array whose size is a power of two; a record with ID
/// `id` is always found at `id & (capacity - 1)`, and no two records share a slot. The array
/// is grown before an allocation would fill it beyond 75%.
pub struct ConnectionTable {
    // Lookup array, the only storage for records
    slots: Vec<Option<ConnectionRecord>>,
    // Number of occupied slots
    count: usize,
    // Maximum number of simultaneous connections
    count_max: usize,
    // Reverse lookup for connections without an ID exchange
    by_sender: HashMap<SenderKey, ConnectionId>,
    // Source of ID candidates
    rng: Box<dyn RngCore + Send>,
}

impl ConnectionTable {
    pub fn new(capacity: usize, count_max: usize, rng: Box<dyn RngCore + Send>) -> Self {
        debug_assert!(capacity.is_power_of_two());
        debug_assert!(capacity <= LOOKUP_CAPACITY_MAX);

        Self {
            slots: vec![None; capacity],
            count: 0,
            count_max,
            by_sender: HashMap::new(),
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Size of the lookup array.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index_of(&self, id: ConnectionId) -> usize {
        id as usize & (self.slots.len() - 1)
    }

    fn needs_growth(&self) -> bool {
        self.count + 1 >= self.slots.len() * 3 / 4
    }

    /// Doubles the lookup array (to at least 32 slots) and moves every record whose index
    /// changed under the new mask.
    ///
    /// Every record remains reachable by its ID afterwards.
    pub fn grow(&mut self) -> Result<()> {
        let old_capacity = self.slots.len();

        if old_capacity >= LOOKUP_CAPACITY_MAX {
            return Err(Error::TableFull(self.count));
        }

        let new_capacity = (old_capacity * 2)
            .max(LOOKUP_CAPACITY_GROWN_MIN)
            .min(LOOKUP_CAPACITY_MAX);

        self.slots.resize(new_capacity, None);

        // A record at old index k moves to k + n * old_capacity, which is always in the newly
        // added region, so nothing is overwritten
        for k in 0..old_capacity {
            if let Some(record) = self.slots[k] {
                let new_index = self.index_of(record.local_id);

                if new_index != k {
                    debug_assert!(self.slots[new_index].is_none());

                    self.slots[new_index] = Some(record);
                    self.slots[k] = None;
                }
            }
        }

        tracing::debug!(
            old_capacity,
            new_capacity,
            connections = self.count,
            "grew connection lookup table"
        );

        Ok(())
    }

    fn random_candidate(&mut self) -> ConnectionId {
        // Two separate byte draws, so that generators with fewer than 16 random bits per
        // draw still cover the whole ID space
        let low = self.rng.gen::<u8>() as u16;
        let high = self.rng.gen::<u8>() as u16;

        (high << 8) | low
    }

    /// Probes forward from a random candidate for up to `capacity` candidates, returning the
    /// first nonzero ID whose slot is free.
    fn find_free_id(&mut self) -> Option<ConnectionId> {
        let mut candidate = self.random_candidate();

        for _ in 0..self.slots.len() {
            if candidate != INVALID_CONNECTION_ID && self.slots[self.index_of(candidate)].is_none()
            {
                return Some(candidate);
            }

            candidate = candidate.wrapping_add(1);
        }

        None
    }

    /// Assigns a fresh local ID to a new connection.
    ///
    /// Fails if the connection limit has been reached or no free ID could be found; the
    /// latter means the table is saturated.
    pub fn allocate(&mut self, sender_key: SenderKey) -> Result<ConnectionId> {
        if self.count >= self.count_max {
            return Err(Error::Capacity(self.count_max));
        }

        if self.needs_growth() {
            self.grow()?;
        }

        let local_id = self.find_free_id().ok_or(Error::TableFull(self.count))?;

        let index = self.index_of(local_id);

        self.slots[index] = Some(ConnectionRecord {
            local_id,
            remote_id: INVALID_CONNECTION_ID,
            sender_key,
        });
        self.count += 1;

        self.by_sender.insert(sender_key, local_id);

        Ok(local_id)
    }

    /// Removes a connection, returning its record. Unknown IDs are ignored.
    pub fn release(&mut self, local_id: ConnectionId) -> Option<ConnectionRecord> {
        self.get(local_id)?;

        let index = self.index_of(local_id);
        let record = self.slots[index].take()?;

        self.count -= 1;

        // Another connection may have claimed the same sender key since
        if self.by_sender.get(&record.sender_key) == Some(&local_id) {
            self.by_sender.remove(&record.sender_key);
        }

        Some(record)
    }

    pub fn get(&self, local_id: ConnectionId) -> Option<&ConnectionRecord> {
        if local_id == INVALID_CONNECTION_ID {
            return None;
        }

        self.slots[self.index_of(local_id)]
            .as_ref()
            .filter(|record| record.local_id == local_id)
    }

    pub fn find_by_sender(&self, sender_key: SenderKey) -> Option<&ConnectionRecord> {
        self.by_sender
            .get(&sender_key)
            .and_then(|&local_id| self.get(local_id))
    }

    pub fn set_remote_id(&mut self, local_id: ConnectionId, remote_id: ConnectionId) -> Result<()> {
        self.get(local_id)
            .ok_or(Error::UnknownConnection(local_id))?;

        let index = self.index_of(local_id);

        if let Some(record) = self.slots[index].as_mut() {
            record.remote_id = remote_id;
        }

        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }
}
