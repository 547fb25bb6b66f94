pub mod barrier;
pub mod bootstrap;
pub mod collective;
pub mod comm;
pub mod config;
pub mod error;
pub mod graph;
pub mod ipc;
pub mod memory;
pub mod ops;
mod peers;
pub mod rank_data;
pub(crate) mod reduce;
mod registry;
pub mod stream;
pub mod topology;
pub mod types;

pub use barrier::{BarrierStats, LocalBarrier, PhaseBarrier};
pub use bootstrap::LocalGroup;
pub use collective::Strategy;
pub use comm::CustomAllreduce;
pub use config::CustomArConfig;
pub use error::{CustomArError, Result};
pub use graph::{GraphBufferEntry, GraphBufferMeta};
pub use ipc::{DeviceIpc, IPC_HANDLE_SIZE, IpcHandle, IpcTransport, LocalIpc, PeerMapping};
pub use memory::{BufferPtr, BufferRef, DEVICE_ALIGN, Device, DeviceMemory, MemorySpace};
pub use ops::{CommHandle, CustomArOps};
pub use rank_data::{MAX_BUFFER_SLOTS, MAX_RANKS, meta_size};
pub use stream::{Graph, Kernel, Stream};
pub use topology::PeerTopology;
pub use types::{DataType, DeviceId, Element, Rank};
