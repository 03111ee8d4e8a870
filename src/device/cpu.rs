use std::sync::Mutex;

use crate::buffer::Buffer;

use super::{Device, DeviceError};

#[derive(Default)]
struct CpuSlot {
    data: Vec<u8>,
    labels: Vec<u8>,
    meta: Vec<i32>,
}

/// Host-memory device: the two buffer slots are plain vectors, resized
/// to whatever batch layout arrives.
#[derive(Default)]
pub struct CpuDevice {
    slots: [Mutex<CpuSlot>; 2],
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, idx: usize) -> Result<std::sync::MutexGuard<'_, CpuSlot>, DeviceError> {
        self.slots.get(idx).map(|slot| slot.lock().unwrap()).ok_or(DeviceError::BadSlot(idx))
    }

    /// Snapshot of a slot's metadata upload. Testing only.
    pub fn meta_back(&self, idx: usize) -> Vec<i32> {
        self.slots[idx].lock().unwrap().meta.clone()
    }
}

impl Device for CpuDevice {
    fn init(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn copy_data(&self, idx: usize, buf: &Buffer<u8>) -> Result<(), DeviceError> {
        let mut slot = self.slot(idx)?;
        slot.data.clear();
        slot.data.extend_from_slice(buf.as_slice());
        Ok(())
    }

    fn copy_labels(&self, idx: usize, buf: &Buffer<u8>) -> Result<(), DeviceError> {
        let mut slot = self.slot(idx)?;
        slot.labels.clear();
        slot.labels.extend_from_slice(buf.as_slice());
        Ok(())
    }

    fn copy_meta(&self, idx: usize, buf: &Buffer<i32>) -> Result<(), DeviceError> {
        let mut slot = self.slot(idx)?;
        slot.meta.clear();
        slot.meta.extend_from_slice(buf.as_slice());
        Ok(())
    }

    fn copy_data_back(&self, idx: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        let slot = self.slot(idx)?;
        if out.len() > slot.data.len() {
            return Err(DeviceError::Copy(format!(
                "slot {idx} holds {} data bytes, caller asked for {}",
                slot.data.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&slot.data[..out.len()]);
        Ok(())
    }

    fn copy_labels_back(&self, idx: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        let slot = self.slot(idx)?;
        if out.len() > slot.labels.len() {
            return Err(DeviceError::Copy(format!(
                "slot {idx} holds {} label bytes, caller asked for {}",
                slot.labels.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&slot.labels[..out.len()]);
        Ok(())
    }

    fn is_cpu(&self) -> bool {
        true
    }
}
