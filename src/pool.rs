use crate::error::{Error, Result};

/// Free list of reusable objects.
///
/// Objects are moved out on [`Pool::rent`] and moved back with [`Pool::restore`]. The pool
/// never clears an object, so the renter is responsible for overwriting every field it
/// relies on. Storage which was once allocated (e.g. a payload buffer's capacity) is kept
/// across rentals.
pub struct Pool<T> {
    free: Vec<Box<T>>,
    allocated: usize,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self {
            free: Vec::new(),
            allocated: 0,
        }
    }
}

impl<T> Pool<T>
where
    T: Default,
{
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns a free object, allocating a new one if none are available.
    pub fn rent(&mut self) -> Box<T> {
        match self.free.pop() {
            Some(object) => object,
            None => {
                self.allocated += 1;
                Box::new(T::default())
            }
        }
    }

    pub fn restore(&mut self, object: Box<T>) {
        debug_assert!(self.free.len() < self.allocated);
        self.free.push(object);
    }

    /// Number of objects this pool has ever allocated.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Number of objects currently waiting to be rented.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// Identifies a leased object. Copying a lease does not add a reference.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Lease {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    object: Option<Box<T>>,
    ref_count: u32,
    generation: u32,
}

/// Reference-counted table of objects currently rented from a [`Pool`].
///
/// An object enters with a count of one and is handed back to the caller of
/// [`Leases::release`] once its count reaches zero. Slots are recycled through a free index
/// list, and a generation counter rejects leases which outlived their object.
pub struct Leases<T> {
    slots: Vec<Slot<T>>,
    free_slots: Vec<u32>,
    len: usize,
}

impl<T> Default for Leases<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Leases<T> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, object: Box<T>) -> Lease {
        self.len += 1;

        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];

            debug_assert!(slot.object.is_none());

            slot.object = Some(object);
            slot.ref_count = 1;

            Lease {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;

            self.slots.push(Slot {
                object: Some(object),
                ref_count: 1,
                generation: 0,
            });

            Lease {
                index,
                generation: 0,
            }
        }
    }

    fn slot(&self, lease: Lease) -> Option<&Slot<T>> {
        self.slots
            .get(lease.index as usize)
            .filter(|slot| slot.generation == lease.generation && slot.object.is_some())
    }

    fn slot_mut(&mut self, lease: Lease) -> Result<&mut Slot<T>> {
        self.slots
            .get_mut(lease.index as usize)
            .filter(|slot| slot.generation == lease.generation && slot.object.is_some())
            .ok_or(Error::StaleHandle)
    }

    pub fn get(&self, lease: Lease) -> Option<&T> {
        self.slot(lease).and_then(|slot| slot.object.as_deref())
    }

    pub fn get_mut(&mut self, lease: Lease) -> Option<&mut T> {
        self.slot_mut(lease)
            .ok()
            .and_then(|slot| slot.object.as_deref_mut())
    }

    pub fn ref_count(&self, lease: Lease) -> Option<u32> {
        self.slot(lease).map(|slot| slot.ref_count)
    }

    /// Adds a holder and returns the new count.
    pub fn add_ref(&mut self, lease: Lease) -> Result<u32> {
        let slot = self.slot_mut(lease)?;

        slot.ref_count += 1;

        Ok(slot.ref_count)
    }

    /// Drops a holder. Once the last holder is gone the object is removed from the table and
    /// returned, and the lease becomes stale.
    pub fn release(&mut self, lease: Lease) -> Result<Option<Box<T>>> {
        let slot = self.slot_mut(lease)?;

        debug_assert!(slot.ref_count > 0);

        slot.ref_count -= 1;

        if slot.ref_count > 0 {
            return Ok(None);
        }

        let object = slot.object.take();
        slot.generation = slot.generation.wrapping_add(1);

        self.free_slots.push(lease.index);
        self.len -= 1;

        Ok(object)
    }

    /// Number of objects currently leased.
    pub fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_restore_reuses_storage() {
        let mut pool = Pool::<Vec<u8>>::new();

        let mut a = pool.rent();
        a.extend_from_slice(&[1, 2, 3]);
        let a_ptr = a.as_ptr();
        pool.restore(a);

        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.available(), 1);

        // Contents are left to the renter
        let b = pool.rent();
        assert_eq!(b.as_slice(), &[1, 2, 3]);
        assert_eq!(b.as_ptr(), a_ptr);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn pool_grows_on_demand() {
        let mut pool = Pool::<u32>::new();

        let objects = (0..5).map(|_| pool.rent()).collect::<Vec<_>>();
        assert_eq!(pool.allocated(), 5);

        for object in objects {
            pool.restore(object);
        }

        for _ in 0..100 {
            let object = pool.rent();
            pool.restore(object);
        }

        assert_eq!(pool.allocated(), 5);
        assert_eq!(pool.available(), 5);
    }

    #[test]
    fn lease_counts() {
        let mut leases = Leases::new();

        let lease = leases.insert(Box::new(7u32));
        assert_eq!(leases.ref_count(lease), Some(1));
        assert_eq!(leases.add_ref(lease).unwrap(), 2);

        assert!(leases.release(lease).unwrap().is_none());
        assert_eq!(leases.get(lease), Some(&7));

        let object = leases.release(lease).unwrap();
        assert_eq!(object.as_deref(), Some(&7));
        assert_eq!(leases.len(), 0);

        // Lease is now stale
        assert!(leases.get(lease).is_none());
        assert!(matches!(leases.release(lease), Err(Error::StaleHandle)));
        assert!(matches!(leases.add_ref(lease), Err(Error::StaleHandle)));
    }

    #[test]
    fn recycled_slot_rejects_old_lease() {
        let mut leases = Leases::new();

        let old = leases.insert(Box::new(1u32));
        leases.release(old).unwrap();

        let new = leases.insert(Box::new(2u32));
        assert_ne!(old, new);
        assert_eq!(leases.len(), 1);
        assert!(leases.get(old).is_none());
        assert_eq!(leases.get(new), Some(&2));

        *leases.get_mut(new).unwrap() = 3;
        assert_eq!(leases.get(new), Some(&3));
    }
}
