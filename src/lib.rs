pub mod alloc;
pub mod device_ops;
pub mod error;
pub mod features;
pub mod fdt;
pub mod header;
pub mod ioevent;
pub mod mmio;
pub mod msi;
pub mod regs;
pub mod rsld;
pub mod stats;
pub mod transport;
pub mod virtqueue;
pub mod vm;

pub use device_ops::VirtioDeviceOps;
pub use error::{Result, TransportError};
pub use transport::{DeviceConfig, MmioTransport};
pub use vm::VmInterface;
