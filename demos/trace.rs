//! Stands a single virtio-MMIO device up against a toy, logging
//! `VmInterface` and drives it through the bring-up sequence from
//! `src/transport.rs`'s own tests, so the crate's `debug!`/`warn!` trace
//! (`virtio-mmio: ...`) is visible end to end, the way the teacher crate's
//! own examples install `simple_logger` over whatever backend logging they
//! exercise (`examples/echoer.rs`, `examples/pcap.rs`).
//!
//! Run with `cargo run --example trace`.

use std::sync::Arc;

use log::info;
use simple_logger::SimpleLogger;

use virtio_mmio_core::alloc::MmioAllocator;
use virtio_mmio_core::error::Result;
use virtio_mmio_core::header::Endian;
use virtio_mmio_core::ioevent::IoEventDispatcher;
use virtio_mmio_core::regs;
use virtio_mmio_core::transport::{DeviceConfig, MmioTransport};
use virtio_mmio_core::vm::{Gsi, IrqLine, RouteOutcome, VmInterface};
use virtio_mmio_core::VirtioDeviceOps;

/// Logs every call instead of issuing real `ioctl`s, so the trace shows the
/// full path from a register write down to the (simulated) VM interface.
struct LoggingVm {
    next_irq: std::cell::Cell<IrqLine>,
}

impl VmInterface for LoggingVm {
    fn register_mmio(&self, addr: u64, len: u64) -> Result<()> {
        info!("vm: register_mmio({:#x}, {:#x})", addr, len);
        Ok(())
    }

    fn deregister_mmio(&self, addr: u64) -> Result<()> {
        info!("vm: deregister_mmio({:#x})", addr);
        Ok(())
    }

    fn alloc_irq_line(&self) -> Result<IrqLine> {
        let line = self.next_irq.get();
        self.next_irq.set(line + 1);
        info!("vm: alloc_irq_line() -> {}", line);
        Ok(line)
    }

    fn trigger_irq(&self, line: IrqLine) -> Result<()> {
        info!("vm: trigger_irq({})", line);
        Ok(())
    }

    fn add_msix_route(
        &self,
        msg: virtio_mmio_core::msi::MsiMessage,
        devid: u32,
    ) -> Result<RouteOutcome> {
        info!("vm: add_msix_route({:?}, devid={})", msg, devid);
        Ok(RouteOutcome::Routed(0))
    }

    fn inject_msi(&self, msg: virtio_mmio_core::msi::MsiMessage) -> Result<()> {
        info!("vm: inject_msi({:?})", msg);
        Ok(())
    }

    fn install_ioeventfd(&self, fd: std::os::unix::io::RawFd, addr: u64, datamatch: u32, user_poll: bool) -> Result<()> {
        info!(
            "vm: install_ioeventfd(fd={}, {:#x}, {}, user_poll={})",
            fd, addr, datamatch, user_poll
        );
        Ok(())
    }

    fn remove_ioeventfd(&self, addr: u64, datamatch: u32) -> Result<()> {
        info!("vm: remove_ioeventfd({:#x}, {})", addr, datamatch);
        Ok(())
    }

    fn sample_endian(&self) -> Endian {
        Endian::Little
    }
}

/// A back-end with no real storage; every call is just logged.
struct TracedOps {
    config: Vec<u8>,
}

impl VirtioDeviceOps for TracedOps {
    fn get_host_features(&self) -> u32 {
        0xF
    }
    fn set_guest_features(&mut self, features: u32) {
        info!("ops: set_guest_features({:#x})", features);
    }
    fn get_config(&self) -> &[u8] {
        &self.config
    }
    fn get_config_mut(&mut self) -> &mut [u8] {
        &mut self.config
    }
    fn get_vq_count(&self) -> u32 {
        1
    }
    fn get_size_vq(&self, _vq: u32) -> u32 {
        128
    }
    fn set_size_vq(&mut self, vq: u32, size: u32) {
        info!("ops: set_size_vq({}, {})", vq, size);
    }
    fn init_vq(&mut self, vq: u32, page_size: u32, align: u32, pfn: u32) -> Result<()> {
        info!(
            "ops: init_vq({}, page_size={}, align={}, pfn={:#x})",
            vq, page_size, align, pfn
        );
        Ok(())
    }
    fn notify_vq(&mut self, vq: u32) {
        info!("ops: notify_vq({})", vq);
    }
    fn notify_vq_gsi(&mut self, vq: u32, gsi: Gsi) {
        info!("ops: notify_vq_gsi({}, {})", vq, gsi);
    }
    fn notify_status(&mut self, status: u32) {
        info!("ops: notify_status({:#x})", status);
    }
}

fn main() {
    SimpleLogger::new().init().unwrap();

    let vm = Arc::new(LoggingVm {
        next_irq: std::cell::Cell::new(0),
    });
    let dispatcher = Arc::new(IoEventDispatcher::new().unwrap());
    let mut allocator = MmioAllocator::new(0x1000_0000, 0x2000_0000);
    let ops = TracedOps { config: vec![0; 4] };

    let transport = MmioTransport::init(
        DeviceConfig::new(2, 1).msi_capable(true),
        vm,
        &mut allocator,
        None,
        dispatcher,
        ops,
    )
    .unwrap();

    let _ = transport.write_register(regs::HOST_FEATURES_SEL, 0);
    let host = transport.read_register(regs::HOST_FEATURES);
    let _ = transport.write_register(regs::GUEST_FEATURES_SEL, 0);
    let _ = transport.write_register(regs::GUEST_FEATURES, host);
    let _ = transport.write_register(regs::QUEUE_SEL, 0);
    let _ = transport.write_register(regs::QUEUE_NUM, 128);
    let _ = transport.write_register(regs::QUEUE_ALIGN, 4096);
    let _ = transport.write_register(regs::QUEUE_PFN, 0x1000);
    let _ = transport.write_register(regs::STATUS, 0x0f);

    transport.signal_vq(0).unwrap();

    transport.exit().unwrap();
}
