//! Primitive arena.
//!
//! Each slot carries one primitive's parameters together with its Adam
//! moments, its current gradient and its densification statistics, so no
//! structural operation can leave the auxiliary state out of step with the
//! parameters. Handles are stable across removals and strictly increase with
//! insertion order; slot order always follows handle order.

use std::fmt;

use super::primitive::{Primitive, PARAM_DIM};

/// Stable reference to a primitive in a [`PrimitiveStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrimitiveHandle(u64);

impl PrimitiveHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PrimitiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optimizer and densification state owned by one primitive
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimitiveState {
    /// Adam first moment
    pub moment1: [f32; PARAM_DIM],
    /// Adam second moment
    pub moment2: [f32; PARAM_DIM],
    /// Gradient of the current iteration
    pub grad: [f32; PARAM_DIM],
    /// Screen-space position gradient of the current iteration
    pub screen_grad: [f32; 2],
    /// Whether the primitive contributed to the current render
    pub visible: bool,
    /// Sum of screen-space gradient norms since the last densify event
    pub grad_accum: f32,
    /// Number of visible iterations since the last densify event
    pub denom: f32,
}

impl Default for PrimitiveState {
    fn default() -> Self {
        Self {
            moment1: [0.0; PARAM_DIM],
            moment2: [0.0; PARAM_DIM],
            grad: [0.0; PARAM_DIM],
            screen_grad: [0.0; 2],
            visible: false,
            grad_accum: 0.0,
            denom: 0.0,
        }
    }
}

impl PrimitiveState {
    pub fn clear_grad(&mut self) {
        self.grad = [0.0; PARAM_DIM];
        self.screen_grad = [0.0; 2];
        self.visible = false;
    }

    pub fn clear_moments(&mut self) {
        self.moment1 = [0.0; PARAM_DIM];
        self.moment2 = [0.0; PARAM_DIM];
    }

    pub fn clear_densify_stats(&mut self) {
        self.grad_accum = 0.0;
        self.denom = 0.0;
    }

    /// Average screen-space gradient norm; zero when never visible
    pub fn mean_screen_grad(&self) -> f32 {
        let mean = self.grad_accum / self.denom;
        if mean.is_finite() {
            mean
        } else {
            0.0
        }
    }
}

/// One occupied arena slot
#[derive(Debug, Clone)]
pub struct PrimitiveEntry {
    pub handle: PrimitiveHandle,
    pub primitive: Primitive,
    pub state: PrimitiveState,
    /// Frame index at which the primitive was created
    pub birth_frame: usize,
}

/// Per-primitive gradient as produced by the renderer's backward pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimitiveGrad {
    pub params: [f32; PARAM_DIM],
    pub screen: [f32; 2],
    pub visible: bool,
}

impl Default for PrimitiveGrad {
    fn default() -> Self {
        Self {
            params: [0.0; PARAM_DIM],
            screen: [0.0; 2],
            visible: false,
        }
    }
}

/// Gradient list whose length does not match the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradientCountMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// The mutable map: all live primitives with their optimizer state
#[derive(Debug, Clone, Default)]
pub struct PrimitiveStore {
    entries: Vec<PrimitiveEntry>,
    next_handle: u64,
}

impl PrimitiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a primitive with zeroed optimizer state
    pub fn push(&mut self, primitive: Primitive, birth_frame: usize) -> PrimitiveHandle {
        let handle = PrimitiveHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push(PrimitiveEntry {
            handle,
            primitive,
            state: PrimitiveState::default(),
            birth_frame,
        });
        handle
    }

    pub fn extend<I>(&mut self, primitives: I, birth_frame: usize) -> usize
    where
        I: IntoIterator<Item = Primitive>,
    {
        let before = self.entries.len();
        for primitive in primitives {
            self.push(primitive, birth_frame);
        }
        self.entries.len() - before
    }

    /// Re-insert an entry with its original handle and state (checkpoint restore).
    ///
    /// Entries must arrive in increasing handle order; out-of-order handles are rejected.
    pub fn restore_entry(&mut self, entry: PrimitiveEntry) -> bool {
        if let Some(last) = self.entries.last() {
            if entry.handle <= last.handle {
                return false;
            }
        }
        self.next_handle = self.next_handle.max(entry.handle.0 + 1);
        self.entries.push(entry);
        true
    }

    /// Position of a handle in iteration order
    pub fn index_of(&self, handle: PrimitiveHandle) -> Option<usize> {
        self.entries.binary_search_by_key(&handle, |e| e.handle).ok()
    }

    pub fn get(&self, handle: PrimitiveHandle) -> Option<&Primitive> {
        self.index_of(handle).map(|i| &self.entries[i].primitive)
    }

    pub fn get_mut(&mut self, handle: PrimitiveHandle) -> Option<&mut Primitive> {
        let idx = self.index_of(handle)?;
        Some(&mut self.entries[idx].primitive)
    }

    pub fn state(&self, handle: PrimitiveHandle) -> Option<&PrimitiveState> {
        self.index_of(handle).map(|i| &self.entries[i].state)
    }

    pub fn state_mut(&mut self, handle: PrimitiveHandle) -> Option<&mut PrimitiveState> {
        let idx = self.index_of(handle)?;
        Some(&mut self.entries[idx].state)
    }

    pub fn entries(&self) -> &[PrimitiveEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut PrimitiveEntry> {
        self.entries.iter_mut()
    }

    pub fn handles(&self) -> impl Iterator<Item = PrimitiveHandle> + '_ {
        self.entries.iter().map(|e| e.handle)
    }

    pub fn primitives(&self) -> impl Iterator<Item = &Primitive> {
        self.entries.iter().map(|e| &e.primitive)
    }

    /// Keep only entries for which `keep` returns true; returns the number removed
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&PrimitiveEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|e| keep(e));
        before - self.entries.len()
    }

    /// Remove the given handles; unknown handles are ignored
    pub fn remove(&mut self, handles: &[PrimitiveHandle]) -> usize {
        if handles.is_empty() {
            return 0;
        }
        let mut sorted = handles.to_vec();
        sorted.sort_unstable();
        self.retain(|e| sorted.binary_search(&e.handle).is_err())
    }

    /// Load one backward pass worth of gradients, aligned with iteration order
    pub fn set_gradients(&mut self, grads: &[PrimitiveGrad]) -> Result<(), GradientCountMismatch> {
        if grads.len() != self.entries.len() {
            return Err(GradientCountMismatch {
                expected: self.entries.len(),
                actual: grads.len(),
            });
        }
        for (entry, grad) in self.entries.iter_mut().zip(grads) {
            entry.state.grad = grad.params;
            entry.state.screen_grad = grad.screen;
            entry.state.visible = grad.visible;
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        for entry in &mut self.entries {
            entry.state.clear_grad();
        }
    }

    pub fn reset_moments(&mut self) {
        for entry in &mut self.entries {
            entry.state.clear_moments();
        }
    }

    pub fn reset_densify_stats(&mut self) {
        for entry in &mut self.entries {
            entry.state.clear_densify_stats();
        }
    }
}
