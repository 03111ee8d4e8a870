pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;

use std::fmt::{Display, Formatter};

use crate::buffer::Buffer;

#[derive(Debug)]
pub enum DeviceError {
    Init(String),
    Copy(String),
    BadSlot(usize),
    #[cfg(feature = "cuda")]
    Driver(cudarc::driver::DriverError),
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for DeviceError {}

/// The upload sink at the end of the pipeline.
///
/// A device exposes two buffer slots; the manager alternates uploads
/// between them so the trainer can keep consuming slot `idx ^ 1` while
/// slot `idx` receives the next batch. `init` runs on the manager
/// thread before any batch is produced and a failure there is fatal to
/// the pipeline.
pub trait Device: Send + Sync + 'static {
    fn init(&self) -> Result<(), DeviceError>;

    fn copy_data(&self, slot: usize, buf: &Buffer<u8>) -> Result<(), DeviceError>;

    fn copy_labels(&self, slot: usize, buf: &Buffer<u8>) -> Result<(), DeviceError>;

    fn copy_meta(&self, slot: usize, buf: &Buffer<i32>) -> Result<(), DeviceError>;

    /// Downloads slot contents back to the host. Testing only.
    fn copy_data_back(&self, slot: usize, out: &mut [u8]) -> Result<(), DeviceError>;

    fn copy_labels_back(&self, slot: usize, out: &mut [u8]) -> Result<(), DeviceError>;

    /// Drives the pinned-allocation request for decode output buffers.
    fn is_cpu(&self) -> bool;
}
