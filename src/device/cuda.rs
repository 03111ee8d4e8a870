use std::sync::{Arc, Mutex};

use cudarc::driver::{CudaContext, CudaSlice, CudaStream};

use crate::buffer::Buffer;

use super::{Device, DeviceError};

#[derive(Default)]
struct CudaSlot {
    data: Option<CudaSlice<u8>>,
    labels: Option<CudaSlice<u8>>,
    meta: Option<CudaSlice<i32>>,
}

/// CUDA device: two device-resident slots fed from the host staging
/// buffers over the context's default stream.
pub struct CudaDevice {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    slots: [Mutex<CudaSlot>; 2],
}

impl CudaDevice {
    pub fn new(ordinal: usize) -> Result<Self, DeviceError> {
        let ctx = CudaContext::new(ordinal).map_err(DeviceError::Driver)?;
        let stream = ctx.default_stream();

        Ok(Self { ctx, stream, slots: Default::default() })
    }

    fn slot(&self, idx: usize) -> Result<std::sync::MutexGuard<'_, CudaSlot>, DeviceError> {
        self.slots.get(idx).map(|slot| slot.lock().unwrap()).ok_or(DeviceError::BadSlot(idx))
    }

    fn upload<T: cudarc::driver::DeviceRepr + cudarc::driver::ValidAsZeroBits + Unpin>(
        &self,
        dst: &mut Option<CudaSlice<T>>,
        src: &[T],
    ) -> Result<(), DeviceError> {
        let needs_alloc = dst.as_ref().map_or(true, |slice| slice.len() != src.len());
        if needs_alloc {
            *dst = Some(self.stream.alloc_zeros::<T>(src.len()).map_err(DeviceError::Driver)?);
        }

        let slice = dst.as_mut().unwrap();
        self.stream.memcpy_htod(src, &mut slice.slice_mut(0..src.len())).map_err(DeviceError::Driver)
    }

    fn download<T: cudarc::driver::DeviceRepr + Unpin>(
        &self,
        src: &Option<CudaSlice<T>>,
        out: &mut [T],
    ) -> Result<(), DeviceError> {
        let Some(slice) = src.as_ref() else {
            return Err(DeviceError::Copy("slot has not been uploaded yet".to_string()));
        };
        if out.len() > slice.len() {
            return Err(DeviceError::Copy(format!(
                "slot holds {} elements, caller asked for {}",
                slice.len(),
                out.len()
            )));
        }

        self.stream.memcpy_dtoh(&slice.slice(0..out.len()), out).map_err(DeviceError::Driver)
    }
}

impl Device for CudaDevice {
    fn init(&self) -> Result<(), DeviceError> {
        // Binds the context on the manager thread and surfaces any
        // pending driver fault before the first batch.
        self.ctx.bind_to_thread().map_err(DeviceError::Driver)?;
        self.stream.synchronize().map_err(DeviceError::Driver)
    }

    fn copy_data(&self, idx: usize, buf: &Buffer<u8>) -> Result<(), DeviceError> {
        let mut slot = self.slot(idx)?;
        self.upload(&mut slot.data, buf.as_slice())
    }

    fn copy_labels(&self, idx: usize, buf: &Buffer<u8>) -> Result<(), DeviceError> {
        let mut slot = self.slot(idx)?;
        self.upload(&mut slot.labels, buf.as_slice())
    }

    fn copy_meta(&self, idx: usize, buf: &Buffer<i32>) -> Result<(), DeviceError> {
        let mut slot = self.slot(idx)?;
        self.upload(&mut slot.meta, buf.as_slice())
    }

    fn copy_data_back(&self, idx: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        let slot = self.slot(idx)?;
        self.download(&slot.data, out)
    }

    fn copy_labels_back(&self, idx: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        let slot = self.slot(idx)?;
        self.download(&slot.labels, out)
    }

    fn is_cpu(&self) -> bool {
        false
    }
}
