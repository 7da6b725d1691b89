//! Fixed-capacity FIFO of vCPUs shared by the built-in policies
//!
//! Storage is allocated once when the policy is created; queue
//! operations never allocate.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::domain::Vcpu;
use crate::scheduler::types::{MAX_DOMAINS, MAX_VIRT_CPUS};

/// Enough slots for every guest vCPU to sit on one pCPU.
pub const RUNQ_CAPACITY: usize = MAX_DOMAINS * MAX_VIRT_CPUS;

pub struct VcpuRing {
    slots: Box<[Option<Arc<Vcpu>>]>,
    head: usize,
    len: usize,
}

impl VcpuRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot(&self, pos: usize) -> usize {
        (self.head + pos) % self.slots.len()
    }

    pub fn contains(&self, v: &Vcpu) -> bool {
        self.position(v).is_some()
    }

    fn position(&self, v: &Vcpu) -> Option<usize> {
        (0..self.len).find(|&pos| {
            self.slots[self.slot(pos)]
                .as_ref()
                .is_some_and(|q| core::ptr::eq(Arc::as_ptr(q), v))
        })
    }

    /// Append `v` unless it is already queued. Returns whether it was added.
    pub fn push_back(&mut self, v: &Arc<Vcpu>) -> bool {
        if self.contains(v) {
            return false;
        }
        if self.len == self.slots.len() {
            crate::kpanic!("run queue overflow queueing {}", v);
        }
        let idx = self.slot(self.len);
        self.slots[idx] = Some(v.clone());
        self.len += 1;
        true
    }

    pub fn pop_front(&mut self) -> Option<Arc<Vcpu>> {
        if self.len == 0 {
            return None;
        }
        let v = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        v
    }

    /// Remove `v` wherever it is. Returns whether it was queued.
    pub fn remove(&mut self, v: &Vcpu) -> bool {
        let Some(pos) = self.position(v) else {
            return false;
        };
        self.take_at(pos);
        true
    }

    /// Remove and return the first queued vCPU matching `pred`.
    pub fn take_first<F>(&mut self, mut pred: F) -> Option<Arc<Vcpu>>
    where
        F: FnMut(&Arc<Vcpu>) -> bool,
    {
        let pos = (0..self.len).find(|&pos| {
            self.slots[self.slot(pos)].as_ref().is_some_and(&mut pred)
        })?;
        self.take_at(pos)
    }

    fn take_at(&mut self, pos: usize) -> Option<Arc<Vcpu>> {
        let v = self.slots[self.slot(pos)].take();
        for p in pos..self.len - 1 {
            let from = self.slot(p + 1);
            let to = self.slot(p);
            self.slots[to] = self.slots[from].take();
        }
        self.len -= 1;
        v
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Vcpu>> + '_ {
        (0..self.len).filter_map(move |pos| self.slots[self.slot(pos)].as_ref())
    }
}
