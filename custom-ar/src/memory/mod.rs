mod buffer;
mod device_mem;

pub use buffer::{BufferPtr, BufferRef, Device, MemorySpace};
pub use device_mem::{DEVICE_ALIGN, DeviceMemory};
