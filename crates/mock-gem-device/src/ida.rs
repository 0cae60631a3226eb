use std::collections::BTreeSet;

/// Allocator of small integer IDs. Always hands out the lowest free ID.
#[derive(Debug, Default, Clone)]
pub struct Ida {
    used: BTreeSet<u32>,
}

impl Ida {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> Option<u32> {
        self.alloc_range(0, u32::MAX)
    }

    /// Lowest free ID in `min..=max`.
    pub fn alloc_range(&mut self, min: u32, max: u32) -> Option<u32> {
        let mut candidate = min;
        for &id in self.used.range(min..=max) {
            if id != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        if candidate > max {
            return None;
        }
        self.used.insert(candidate);
        Some(candidate)
    }

    pub fn free(&mut self, id: u32) -> bool {
        self.used.remove(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }
}
