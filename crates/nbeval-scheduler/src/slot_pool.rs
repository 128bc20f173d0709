//! Slot pool tracking CPU and GPU worker slots
//!
//! CPU slots occupy indices `[0, cpus)` and GPU slots `[cpus, cpus + gpus)`.
//! A slot is claimed in this process exactly when its inter-process lock is
//! held, so another scheduler of the same user on this host sees it as busy.

use nbeval_core::NbevalResult;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info};

use crate::lock::{InterProcessLock, LockNamespace};

/// Kind of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Cpu,
    Gpu,
}

impl std::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotKind::Cpu => write!(f, "cpu"),
            SlotKind::Gpu => write!(f, "gpu"),
        }
    }
}

/// Pool of CPU and GPU slots
pub struct SlotPool {
    /// Number of CPU slots
    num_cpus: usize,
    /// Device index behind each GPU slot
    gpu_devices: Vec<u32>,
    /// In-process claimed flag of every slot
    claimed: Vec<bool>,
    /// Inter-process lock of every slot
    locks: Vec<InterProcessLock>,
}

impl SlotPool {
    /// Create a pool of `num_cpus` CPU slots and one slot per GPU device
    pub fn new(num_cpus: u32, gpu_devices: Vec<u32>, namespace: &LockNamespace) -> NbevalResult<Self> {
        let mut locks = Vec::with_capacity(num_cpus as usize + gpu_devices.len());
        for i in 0..num_cpus {
            locks.push(InterProcessLock::open(namespace.slot_path(SlotKind::Cpu, i))?);
        }
        for device in &gpu_devices {
            locks.push(InterProcessLock::open(
                namespace.slot_path(SlotKind::Gpu, *device),
            )?);
        }

        info!(
            cpus = num_cpus,
            gpus = ?gpu_devices,
            "Slot pool initialized"
        );

        Ok(Self {
            num_cpus: num_cpus as usize,
            claimed: vec![false; locks.len()],
            gpu_devices,
            locks,
        })
    }

    /// Get the number of CPU slots
    pub fn cpu_count(&self) -> u32 {
        self.num_cpus as u32
    }

    /// Get the number of GPU slots
    pub fn gpu_count(&self) -> u32 {
        self.gpu_devices.len() as u32
    }

    /// Kind of the slot at `slot`
    pub fn kind(&self, slot: usize) -> SlotKind {
        if slot < self.num_cpus {
            SlotKind::Cpu
        } else {
            SlotKind::Gpu
        }
    }

    /// Number of slots of `kind` not claimed by this process
    pub fn available_count(&self, kind: SlotKind) -> u32 {
        self.range(kind).filter(|&i| !self.claimed[i]).count() as u32
    }

    /// Claim `cpus` CPU slots and `gpus` GPU slots, all or nothing
    ///
    /// Returns the claimed slot indices, CPU slots first. When the full set
    /// cannot be assembled nothing stays claimed.
    pub fn try_acquire(&mut self, cpus: u32, gpus: u32) -> Option<Vec<usize>> {
        let mut acquired = Vec::with_capacity((cpus + gpus) as usize);

        if self.claim(SlotKind::Cpu, cpus, &mut acquired)
            && self.claim(SlotKind::Gpu, gpus, &mut acquired)
        {
            return Some(acquired);
        }

        self.release(&acquired);
        None
    }

    fn claim(&mut self, kind: SlotKind, count: u32, acquired: &mut Vec<usize>) -> bool {
        let mut got = 0;
        for slot in self.range(kind) {
            if got == count {
                break;
            }
            if self.claimed[slot] {
                continue;
            }
            if self.locks[slot].try_acquire() {
                self.claimed[slot] = true;
                acquired.push(slot);
                got += 1;
            }
        }
        got == count
    }

    /// Release previously claimed slots
    pub fn release(&mut self, slots: &[usize]) {
        for &slot in slots {
            if self.claimed[slot] {
                self.locks[slot].release();
                self.claimed[slot] = false;
                debug!(slot = slot, kind = %self.kind(slot), "Released slot");
            }
        }
    }

    /// Device indices behind the GPU slots among `slots`
    pub fn gpu_devices(&self, slots: &[usize]) -> Vec<u32> {
        slots
            .iter()
            .filter(|&&s| s >= self.num_cpus)
            .map(|&s| self.gpu_devices[s - self.num_cpus])
            .collect()
    }

    /// Render slots as `CPU [0] GPU [1]`
    pub fn describe(&self, slots: &[usize]) -> String {
        let cpus: Vec<usize> = slots.iter().copied().filter(|&s| s < self.num_cpus).collect();
        let gpus = self.gpu_devices(slots);

        let mut parts = Vec::new();
        if !cpus.is_empty() {
            parts.push(format!("CPU {:?}", cpus));
        }
        if !gpus.is_empty() {
            parts.push(format!("GPU {:?}", gpus));
        }
        if parts.is_empty() {
            "no slots".to_string()
        } else {
            parts.join(" ")
        }
    }

    fn range(&self, kind: SlotKind) -> Range<usize> {
        match kind {
            SlotKind::Cpu => 0..self.num_cpus,
            SlotKind::Gpu => self.num_cpus..self.claimed.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace(dir: &tempfile::TempDir) -> LockNamespace {
        LockNamespace::new(dir.path(), "nbeval", "test")
    }

    #[test]
    fn test_pool_counts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(2, vec![0, 1], &namespace(&dir)).unwrap();
        assert_eq!(pool.cpu_count(), 2);
        assert_eq!(pool.gpu_count(), 2);
        assert_eq!(pool.kind(1), SlotKind::Cpu);
        assert_eq!(pool.kind(2), SlotKind::Gpu);
    }

    #[test]
    fn test_acquire_mixed_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SlotPool::new(2, vec![0, 1], &namespace(&dir)).unwrap();

        let slots = pool.try_acquire(1, 2).unwrap();
        assert_eq!(slots, vec![0, 2, 3]);
        assert_eq!(pool.gpu_devices(&slots), vec![0, 1]);
        assert_eq!(pool.describe(&slots), "CPU [0] GPU [0, 1]");
        assert_eq!(pool.available_count(SlotKind::Cpu), 1);
        assert_eq!(pool.available_count(SlotKind::Gpu), 0);
    }

    #[test]
    fn test_failed_acquire_keeps_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SlotPool::new(2, vec![0], &namespace(&dir)).unwrap();

        let held = pool.try_acquire(0, 1).unwrap();
        assert!(pool.try_acquire(1, 1).is_none());
        assert_eq!(pool.available_count(SlotKind::Cpu), 2);

        pool.release(&held);
        assert!(pool.try_acquire(1, 1).is_some());
    }

    #[test]
    fn test_release_restores_availability() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SlotPool::new(1, Vec::new(), &namespace(&dir)).unwrap();

        for _ in 0..5 {
            let slots = pool.try_acquire(1, 0).unwrap();
            assert!(pool.try_acquire(1, 0).is_none());
            pool.release(&slots);
        }
        assert_eq!(pool.available_count(SlotKind::Cpu), 1);
    }

    #[test]
    fn test_pools_sharing_namespace_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = SlotPool::new(1, vec![0], &namespace(&dir)).unwrap();
        let mut second = SlotPool::new(1, vec![0], &namespace(&dir)).unwrap();

        let held = first.try_acquire(0, 1).unwrap();
        assert!(second.try_acquire(0, 1).is_none());
        assert!(second.try_acquire(1, 0).is_some());

        first.release(&held);
        assert!(second.try_acquire(0, 1).is_some());
    }

    #[test]
    fn test_gpu_locks_follow_device_index() {
        let dir = tempfile::tempdir().unwrap();
        let ns = namespace(&dir);
        let mut pool = SlotPool::new(0, vec![3], &ns).unwrap();
        let slots = pool.try_acquire(0, 1).unwrap();
        assert_eq!(pool.gpu_devices(&slots), vec![3]);

        let mut other = InterProcessLock::open(ns.slot_path(SlotKind::Gpu, 3)).unwrap();
        assert!(!other.try_acquire());
    }

    #[test]
    fn test_describe_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(1, Vec::new(), &namespace(&dir)).unwrap();
        assert_eq!(pool.describe(&[]), "no slots");
    }
}
