use alloc::vec::Vec;

/// Handle to a pending operation.
///
/// The generation changes every time a slot is reused, so a completion for
/// an operation that already finished can never reach its successor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OperationId {
    index: u16,
    generation: u16,
}

impl OperationId {
    pub const fn index(&self) -> u16 {
        self.index
    }

    pub const fn generation(&self) -> u16 {
        self.generation
    }
}

enum Entry<V> {
    Vacant { generation: u16 },
    Occupied { generation: u16, value: V },
}

/// Generation-checked slot table owning the values stored in it.
pub(crate) struct Slots<V> {
    entries: Vec<Entry<V>>,
    free: Vec<u16>,
    len: usize,
}

impl<V> Slots<V> {
    pub const fn new() -> Self {
        Self { entries: Vec::new(), free: Vec::new(), len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn insert(&mut self, value: V) -> OperationId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            let generation = match &*entry {
                Entry::Vacant { generation } => *generation,
                Entry::Occupied { .. } => unreachable!(),
            };
            *entry = Entry::Occupied { generation, value };
            OperationId { index, generation }
        } else {
            let index = self.entries.len() as u16;
            self.entries.push(Entry::Occupied { generation: 0, value });
            OperationId { index, generation: 0 }
        }
    }

    pub fn get(&self, id: OperationId) -> Option<&V> {
        match self.entries.get(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Move the value out, vacating the slot. `None` for stale ids.
    pub fn remove(&mut self, id: OperationId) -> Option<V> {
        let entry = self.entries.get_mut(id.index as usize)?;
        match &*entry {
            Entry::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }

        let next = Entry::Vacant { generation: id.generation.wrapping_add(1) };
        match core::mem::replace(entry, next) {
            Entry::Occupied { value, .. } => {
                self.free.push(id.index);
                self.len -= 1;
                Some(value)
            }
            Entry::Vacant { .. } => unreachable!(),
        }
    }

    /// Ids of all values matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&V) -> bool) -> Vec<OperationId> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } if pred(value) => {
                    Some(OperationId { index: index as u16, generation: *generation })
                }
                _ => None,
            })
            .collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        })
    }
}
