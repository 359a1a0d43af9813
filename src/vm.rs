use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::msi::MsiMessage;

/// Opaque handle to a guest-physical IRQ line allocated through the VM
/// interface (§3, §5 "Shared resources").
pub type IrqLine = u32;

/// A Global System Interrupt routing entry, as returned by
/// [`VmInterface::add_msix_route`] (§4.3, GLOSSARY).
pub type Gsi = u32;

/// Whether an `add_msix_route` call actually needs a kernel-side routing
/// entry, or whether the device can use the direct-injection fast path
/// instead (§4.3: "If the VM interface reports 'no routing needed' and
/// this device has SIGNAL_MSI capability, the route is skipped").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed(Gsi),
    NotNeeded,
}

/// The host hypervisor interface this transport core is built against
/// (§1 "Out of scope": concrete KVM-style ioctl plumbing lives on the
/// other side of this trait). Every method here stands in for an adapter
/// that in production would issue `ioctl`s against `/dev/kvm` and per-VM
/// file descriptors; the transport only needs the shape of the contract.
pub trait VmInterface {
    /// Registers the MMIO callback for `[addr, addr+len)`. Returns
    /// [`crate::error::TransportError::Resource`] if the window overlaps
    /// an existing registration or the host is out of MMIO slots.
    fn register_mmio(&self, addr: u64, len: u64) -> Result<()>;

    fn deregister_mmio(&self, addr: u64) -> Result<()>;

    /// Allocates a legacy IRQ line. Lines are drawn from a pool shared
    /// across the whole VM (§5).
    fn alloc_irq_line(&self) -> Result<IrqLine>;

    /// Asserts (edge-triggers) the given legacy IRQ line.
    fn trigger_irq(&self, line: IrqLine) -> Result<()>;

    /// Installs or refreshes a GSI route for `msg`, tagged with `devid`
    /// for the routing table. Called once per vector on first CONFIGURE,
    /// and again on every subsequent CONFIGURE of the same vector (§4.3).
    fn add_msix_route(&self, msg: MsiMessage, devid: u32) -> Result<RouteOutcome>;

    /// Directly injects an MSI payload without going through GSI routing
    /// (the `SIGNAL_MSI` transport capability fast path, §4.4).
    fn inject_msi(&self, msg: MsiMessage) -> Result<()>;

    /// Installs a kernel-side ioeventfd binding on a caller-owned `fd`
    /// (created by [`crate::ioevent::IoEventDispatcher::register`]):
    /// guest writes matching `(addr, datamatch)` signal `fd` directly and
    /// never exit to user space. `user_poll` requests the fallback where
    /// writes are instead delivered to user space via an epoll-driven
    /// dispatcher (§4.8, C2). Mirrors KVM's own `kvm_ioeventfd` ioctl,
    /// which takes the fd to bind rather than handing one back.
    fn install_ioeventfd(&self, fd: RawFd, addr: u64, datamatch: u32, user_poll: bool) -> Result<()>;

    fn remove_ioeventfd(&self, addr: u64, datamatch: u32) -> Result<()>;

    /// Samples the running vCPU's current endianness, for `STATUS := 0`'s
    /// re-sampling step (§4.5, §8 invariant 5). Adapters that only ever run
    /// little-endian guests can rely on the default.
    fn sample_endian(&self) -> crate::header::Endian {
        crate::header::Endian::Little
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::cell::RefCell;

    /// An in-process stand-in for a hypervisor adapter, used by the
    /// orchestrator's own tests and suitable for a consuming crate's tests
    /// too (the way the teacher crate keeps a tiny local fake for `align`
    /// rather than reaching for a mocking framework).
    #[derive(Default)]
    pub struct MockVm {
        pub irq_lines: RefCell<u32>,
        pub triggered: RefCell<Vec<IrqLine>>,
        pub routes: RefCell<Vec<(MsiMessage, u32)>>,
        pub injected: RefCell<Vec<MsiMessage>>,
        pub ioevents: RefCell<Vec<(u64, u32)>>,
        pub route_outcome: RouteOutcome,
    }

    impl Default for RouteOutcome {
        fn default() -> Self {
            RouteOutcome::Routed(0)
        }
    }

    impl VmInterface for MockVm {
        fn register_mmio(&self, _addr: u64, _len: u64) -> Result<()> {
            Ok(())
        }

        fn deregister_mmio(&self, _addr: u64) -> Result<()> {
            Ok(())
        }

        fn alloc_irq_line(&self) -> Result<IrqLine> {
            let mut lines = self.irq_lines.borrow_mut();
            let line = *lines;
            *lines += 1;
            Ok(line)
        }

        fn trigger_irq(&self, line: IrqLine) -> Result<()> {
            self.triggered.borrow_mut().push(line);
            Ok(())
        }

        fn add_msix_route(&self, msg: MsiMessage, devid: u32) -> Result<RouteOutcome> {
            self.routes.borrow_mut().push((msg, devid));
            Ok(self.route_outcome)
        }

        fn inject_msi(&self, msg: MsiMessage) -> Result<()> {
            self.injected.borrow_mut().push(msg);
            Ok(())
        }

        fn install_ioeventfd(&self, _fd: RawFd, addr: u64, datamatch: u32, _user_poll: bool) -> Result<()> {
            self.ioevents.borrow_mut().push((addr, datamatch));
            Ok(())
        }

        fn remove_ioeventfd(&self, addr: u64, datamatch: u32) -> Result<()> {
            self.ioevents
                .borrow_mut()
                .retain(|&(a, d)| !(a == addr && d == datamatch));
            Ok(())
        }
    }
}
