use parking_lot::RwLock;

use std::mem::MaybeUninit;

/// A simple slab allocator.
///
/// A `Slab` stores values of type `T` in a contiguous array and
/// returns stable indices that can be reused after removal.
///
/// Internally, it keeps track of:
/// - initialized slots,
/// - free indices,
/// - and uninitialized memory using [`MaybeUninit`].
pub(crate) struct Slab<T> {
    /// Storage for items (may contain uninitialized slots).
    items: Vec<MaybeUninit<T>>,
    /// Stack of free indices that can be reused.
    free: Vec<usize>,
    /// Marks whether a slot is currently initialized.
    used: Vec<bool>,
    /// Number of initialized slots.
    len: usize,
}

impl<T> Slab<T> {
    /// Creates a new `Slab` with `size` free slots.
    pub(crate) fn new(size: usize) -> Self {
        let items = (0..size).map(|_| MaybeUninit::<T>::uninit()).collect();
        let free = (0..size).rev().collect();
        let used = vec![false; size];

        Self {
            items,
            free,
            used,
            len: 0,
        }
    }

    /// Returns the index the next [`insert`](Self::insert) will use.
    pub(crate) fn vacant(&mut self) -> usize {
        if let Some(&i) = self.free.last() {
            return i;
        }

        let len = self.items.len();
        let new_len = if len == 0 { 1 } else { 2 * len };

        self.items
            .extend((len..new_len).map(|_| MaybeUninit::<T>::uninit()));
        self.free.extend((len..new_len).rev());
        self.used.resize(new_len, false);

        len
    }

    /// Inserts a value into the slab and returns its index.
    ///
    /// If a free slot is available, it is reused.
    /// Otherwise, the slab grows exponentially.
    pub(crate) fn insert(&mut self, item: T) -> usize {
        let index = self.vacant();
        self.free.pop();

        self.items[index] = MaybeUninit::new(item);
        self.used[index] = true;
        self.len += 1;

        index
    }

    /// Removes and returns the value stored at `index`, if any.
    ///
    /// The slot becomes free and may be reused by future insertions.
    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        if !self.contains(index) {
            return None;
        }

        self.free.push(index);
        self.used[index] = false;
        self.len -= 1;

        // SAFETY: `used[index]` was set, so the slot is initialized.
        let item = unsafe { self.items[index].assume_init_read() };
        self.items[index] = MaybeUninit::uninit();

        Some(item)
    }

    /// Returns `true` if `index` holds a value.
    pub(crate) fn contains(&self, index: usize) -> bool {
        self.used.get(index).copied().unwrap_or(false)
    }

    /// Returns a reference to the value at `index`, if any.
    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        if !self.contains(index) {
            return None;
        }

        // SAFETY: checked above.
        Some(unsafe { self.items[index].assume_init_ref() })
    }

    /// Number of stored values.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Iterates over `(index, value)` pairs.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .zip(self.used.iter())
            .enumerate()
            .filter(|(_, (_, used))| **used)
            // SAFETY: only initialized slots pass the filter.
            .map(|(i, (slot, _))| (i, unsafe { slot.assume_init_ref() }))
    }
}

impl<T> Drop for Slab<T> {
    /// Drops all initialized elements stored in the slab.
    fn drop(&mut self) {
        for (slot, &used) in self.items.iter_mut().zip(self.used.iter()) {
            if used {
                // SAFETY: `used` marks initialized slots.
                unsafe {
                    slot.assume_init_drop();
                }
            }
        }
    }
}

/// A [`Slab`] shared between threads.
///
/// Index allocation and removal take the write lock; lookups only take
/// the read lock, so dispatch threads never serialize on each other.
/// Callers are responsible for not freeing an index that an in-flight
/// dispatch may still resolve.
pub(crate) struct SlotTable<T> {
    slab: RwLock<Slab<T>>,
}

impl<T> SlotTable<T> {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            slab: RwLock::new(Slab::new(size)),
        }
    }

    #[cfg(test)]
    pub(crate) fn insert(&self, item: T) -> usize {
        self.slab.write().insert(item)
    }

    /// Stores a value that needs to know its own index.
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn insert_keyed(&self, build: impl FnOnce(usize) -> T) -> usize {
        let mut slab = self.slab.write();
        let index = slab.vacant();
        slab.insert(build(index))
    }

    pub(crate) fn remove(&self, index: usize) -> Option<T> {
        self.slab.write().remove(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every stored value.
    pub(crate) fn drain(&self) -> Vec<T> {
        let mut slab = self.slab.write();
        let indices: Vec<usize> = slab.iter().map(|(i, _)| i).collect();
        indices.into_iter().filter_map(|i| slab.remove(i)).collect()
    }
}

impl<T: Clone> SlotTable<T> {
    /// Builds a value from the index it will be stored under.
    ///
    /// Nothing is stored if `build` fails.
    pub(crate) fn insert_with<E>(
        &self,
        build: impl FnOnce(usize) -> Result<T, E>,
    ) -> Result<(usize, T), E> {
        let mut slab = self.slab.write();
        let index = slab.vacant();
        let item = build(index)?;
        slab.insert(item.clone());

        Ok((index, item))
    }

    pub(crate) fn get(&self, index: usize) -> Option<T> {
        self.slab.read().get(index).cloned()
    }

    /// Clones out every stored value.
    pub(crate) fn snapshot(&self) -> Vec<(usize, T)> {
        self.slab
            .read()
            .iter()
            .map(|(i, item)| (i, item.clone()))
            .collect()
    }
}
