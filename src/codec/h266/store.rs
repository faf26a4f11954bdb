// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Registry of decoded parameter sets, indexed by their ID.

use std::rc::Rc;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("parameter set id {id} exceeds the maximum of {max}")]
    IdOutOfRange { id: usize, max: usize },
}

/// Holds the parameter sets of one kind. Each slot owns a reference to the
/// last set received with that ID; slices that were parsed against an older
/// set keep their own reference to it, so replacing a slot never invalidates
/// them.
#[derive(Debug)]
pub struct ParameterSetStore<T> {
    entries: Vec<Option<Rc<T>>>,
    max_entries: usize,
    /// ID of the set most recently activated by a slice.
    current: Option<usize>,
}

impl<T> ParameterSetStore<T> {
    /// Creates a store accepting IDs in `0..max_entries`. Storage grows on
    /// demand.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            current: None,
        }
    }

    /// Stores `set` under `id`, dropping the store's reference to any set
    /// previously registered with the same ID.
    pub fn add_header(&mut self, id: usize, set: T) -> Result<Rc<T>, StoreError> {
        if id >= self.max_entries {
            return Err(StoreError::IdOutOfRange {
                id,
                max: self.max_entries - 1,
            });
        }

        if self.entries.len() <= id {
            self.entries.resize_with(id + 1, || None);
        }

        let set = Rc::new(set);
        if self.entries[id].replace(Rc::clone(&set)).is_some() {
            log::debug!("Replacing parameter set {}", id);
        }

        Ok(set)
    }

    /// Returns the set registered under `id`, if any.
    pub fn get_header(&self, id: usize) -> Option<&Rc<T>> {
        self.entries.get(id).and_then(Option::as_ref)
    }

    /// Records `id` as the currently active set.
    pub fn set_current(&mut self, id: usize) {
        self.current = Some(id);
    }

    /// The currently active set, if it is still registered.
    pub fn current(&self) -> Option<&Rc<T>> {
        self.current.and_then(|id| self.get_header(id))
    }

    /// Clears the store. A partial reset keeps the currently active set so
    /// that decoding can carry on across a soft reconfiguration.
    pub fn reset(&mut self, partial: bool) {
        let keep = match (partial, self.current) {
            (true, Some(id)) => self.entries.get_mut(id).and_then(Option::take),
            _ => None,
        };

        self.entries.clear();

        match keep {
            Some(set) => {
                if let Some(id) = self.current {
                    self.entries.resize_with(id + 1, || None);
                    self.entries[id] = Some(set);
                }
            }
            None => self.current = None,
        }
    }

    /// Number of registered sets.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the registered sets as `(id, set)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Rc<T>)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(id, e)| e.as_ref().map(|set| (id, set)))
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::ParameterSetStore;
    use super::StoreError;

    #[test]
    fn replacing_an_id_releases_the_previous_set() {
        let mut store = ParameterSetStore::new(16);

        let first = store.add_header(3, "first").unwrap();
        assert_eq!(Rc::strong_count(&first), 2);

        let second = store.add_header(3, "second").unwrap();
        assert_eq!(Rc::strong_count(&first), 1);
        assert_eq!(Rc::strong_count(&second), 2);

        assert_eq!(**store.get_header(3).unwrap(), "second");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn ids_are_bounded() {
        let mut store = ParameterSetStore::new(16);

        assert_eq!(
            store.add_header(16, 0u32).unwrap_err(),
            StoreError::IdOutOfRange { id: 16, max: 15 }
        );
        assert!(store.is_empty());
        assert!(store.get_header(16).is_none());

        store.add_header(15, 0u32).unwrap();
        assert!(store.get_header(15).is_some());
        assert!(store.get_header(2).is_none());
    }

    #[test]
    fn partial_reset_keeps_current() {
        let mut store = ParameterSetStore::new(64);
        store.add_header(1, 'a').unwrap();
        store.add_header(7, 'b').unwrap();
        store.set_current(7);

        store.reset(true);
        assert_eq!(store.len(), 1);
        assert_eq!(**store.current().unwrap(), 'b');
        assert!(store.get_header(1).is_none());

        store.reset(false);
        assert!(store.is_empty());
        assert!(store.current().is_none());
    }

    #[test]
    fn iterates_in_id_order() {
        let mut store = ParameterSetStore::new(8);
        store.add_header(5, 50).unwrap();
        store.add_header(2, 20).unwrap();

        let ids: Vec<_> = store.iter().map(|(id, set)| (id, **set)).collect();
        assert_eq!(ids, vec![(2, 20), (5, 50)]);
    }
}
