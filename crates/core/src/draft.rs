/// Fixed-size slot pool backing the device tensors that hold speculative
/// draft-token state.
///
/// The pool only hands out slot indices; the tensors themselves live with the
/// draft model. Preemption and finalization return slots here, the post-step
/// reconciler never touches the pool directly.
#[derive(Debug)]
pub struct DraftTokenWorkspace {
    num_slots: usize,
    free: Vec<i32>,
}

impl DraftTokenWorkspace {
    pub fn new(num_slots: usize) -> Self {
        // LIFO free list, lowest slot on top.
        let free = (0..num_slots as i32).rev().collect();
        Self { num_slots, free }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Allocate one slot, or None when the pool is exhausted.
    pub fn alloc(&mut self) -> Option<i32> {
        let slot = self.free.pop();
        if slot.is_none() {
            tracing::warn!(num_slots = self.num_slots, "draft token workspace exhausted");
        }
        slot
    }

    pub fn free(&mut self, slots: &[i32]) {
        for &slot in slots {
            debug_assert!(
                (0..self.num_slots as i32).contains(&slot),
                "freeing foreign draft slot {slot}"
            );
            debug_assert!(!self.free.contains(&slot), "double free of draft slot {slot}");
            self.free.push(slot);
        }
    }
}
