//! The swap table: page-sized slots on the swap device, tracked by an
//! in-memory bitmap. A set bit means the slot holds live contents. The
//! bitmap is never persisted.

use alloc::sync::Arc;

use bitvec::prelude::*;

use crate::hal::BlockDevice;
use crate::lock::SpinLock;
use crate::param::{PAGE_SECTORS, PGSIZE, SECTOR_SIZE};

pub struct Swap {
    device: Option<Arc<dyn BlockDevice>>,
    bitmap: SpinLock<BitVec>,
}

impl Swap {
    pub(crate) fn new(device: Option<Arc<dyn BlockDevice>>) -> Self {
        let slots = match &device {
            Some(device) => device.size() as usize / PAGE_SECTORS,
            None => {
                log::warn!("no swap device, swap disabled");
                0
            }
        };
        Self {
            device,
            bitmap: SpinLock::new("swap", bitvec![0; slots]),
        }
    }

    /// Writes one page into a free slot and returns the slot id, or fails
    /// when the swap is full. The bitmap lock covers only the scan.
    pub(crate) fn swap_out(&self, data: &[u8; PGSIZE]) -> Result<usize, ()> {
        let slot = {
            let mut bitmap = self.bitmap.lock();
            let slot = bitmap.iter_zeros().next().ok_or(())?;
            bitmap.set(slot, true);
            slot
        };
        let device = self.device.as_ref().expect("slot from empty bitmap");
        let mut sec = [0u8; SECTOR_SIZE];
        for i in 0..PAGE_SECTORS {
            sec.copy_from_slice(&data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            device.write((slot * PAGE_SECTORS + i) as u32, &sec);
        }
        Ok(slot)
    }

    /// Reads slot `slot` into `data` and frees the slot.
    pub(crate) fn swap_in(&self, slot: usize, data: &mut [u8; PGSIZE]) {
        let device = self.device.as_ref().expect("swap_in without swap device");
        let mut sec = [0u8; SECTOR_SIZE];
        for i in 0..PAGE_SECTORS {
            device.read((slot * PAGE_SECTORS + i) as u32, &mut sec);
            data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sec);
        }
        self.free_slot(slot);
    }

    pub(crate) fn free_slot(&self, slot: usize) {
        self.bitmap.lock().set(slot, false);
    }

    /// Number of live slots right now.
    pub fn slots_in_use(&self) -> usize {
        self.bitmap.lock().count_ones()
    }
}
