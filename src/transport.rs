//! The transport orchestrator (C9, §4.9) — the public entry point a
//! concrete device back-end is built against. Owns the per-device
//! register state ([`MmioDevice`]), wires its decode actions into the VM
//! interface (ioeventfd binding, MSI routing, IRQ assertion) and,
//! optionally, the RSLD shadow-header path.
//!
//! Grounded on kvmtool's `virtio_mmio_init`/`virtio_mmio_exit` and
//! `virtio_mmio_signal_vring_irq`/`virtio_mmio_signal_config_irq`
//! (`virtio/mmio.c`) for the init/signal control flow, generalized from
//! the teacher crate's device-bring-up pattern in
//! `virtio.rs::VirtioDevice::init` (register resources, then hand a
//! handle back, roll back on partial failure).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::alloc::{MmioAllocator, ShmemAllocator};
use crate::device_ops::VirtioDeviceOps;
use crate::error::{Result, TransportError};
use crate::fdt::{DeviceTreeFragment, IrqPropertyProvider};
use crate::ioevent::IoEventDispatcher;
use crate::mmio::{DecodeAction, MmioDevice};
use crate::msi::MsiEffect;
use crate::regs::{self, CONFIG, INT_CONFIG, INT_VRING, MSI_NO_VECTOR};
use crate::rsld::{self, RsldAction, RsldShadow, ShadowSnapshot};
use crate::stats::Stat;
use crate::vm::{Gsi, IrqLine, RouteOutcome, VmInterface};

/// Construction-time configuration for one MMIO device (§A of the
/// expanded spec — a builder, not an external config file, since the
/// transport has no files/env of its own to parse).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: u32,
    pub subsys_id: u32,
    pub class: u32,
    pub queue_count: u32,
    pub msi_capable: bool,
    pub msi_sharing: bool,
    pub rsld: bool,
    /// `SIGNAL_MSI` transport capability (§3, §4.3): whether this device
    /// may use the direct-injection fast path when the VM interface
    /// reports no routing is needed for a vector.
    pub signal_msi: bool,
}

impl DeviceConfig {
    pub fn new(device_id: u32, queue_count: u32) -> Self {
        DeviceConfig {
            device_id,
            subsys_id: device_id,
            class: 0,
            queue_count,
            msi_capable: false,
            msi_sharing: false,
            rsld: false,
            signal_msi: false,
        }
    }

    pub fn subsys_id(mut self, v: u32) -> Self {
        self.subsys_id = v;
        self
    }

    pub fn class(mut self, v: u32) -> Self {
        self.class = v;
        self
    }

    pub fn msi_capable(mut self, v: bool) -> Self {
        self.msi_capable = v;
        self
    }

    pub fn msi_sharing(mut self, v: bool) -> Self {
        self.msi_sharing = v;
        self
    }

    pub fn rsld(mut self, v: bool) -> Self {
        self.rsld = v;
        self
    }

    pub fn signal_msi(mut self, v: bool) -> Self {
        self.signal_msi = v;
        self
    }
}

struct Locked<O: VirtioDeviceOps> {
    device: MmioDevice,
    ops: O,
    rsld: Option<RsldShadow>,
    /// The device's shared-memory block (shadow header + config window +
    /// private arena), present only when RSLD is enabled (§4.7, §6
    /// "shared-memory layout"). Accessed byte-wise, never as a native
    /// struct, matching §9 "RSLD shadow aliasing".
    shmem: Option<Vec<u8>>,
    /// `MSI_VEC_SEL`-indexed route cache; absent until the vector's first
    /// CONFIGURE (§4.3 "the first refresh per vector creates a GSI").
    routes: HashMap<u32, RouteOutcome>,
}

/// One virtio-MMIO device's transport instance (C9). Generic over the VM
/// interface so tests can drive it against [`crate::vm::mock::MockVm`]
/// without a real hypervisor.
pub struct MmioTransport<V: VmInterface, O: VirtioDeviceOps> {
    window_base: u64,
    irq_line: IrqLine,
    /// Dedicated IRQ line pulsed by the RSLD signal path (§4.7); allocated
    /// at `init` only when RSLD is enabled, distinct from `irq_line`.
    hvl_irq: Option<IrqLine>,
    vm: Arc<V>,
    dispatcher: Arc<IoEventDispatcher>,
    devid: u32,
    inner: Mutex<Locked<O>>,
}

impl<V: VmInterface, O: VirtioDeviceOps> MmioTransport<V, O> {
    /// Allocates a window, registers it and an IRQ line with the VM
    /// interface, negotiates transport-feature offers, and returns the
    /// ready-to-drive instance. On any resource failure, partially
    /// registered state is rolled back before returning (§4.9 "Failure
    /// semantics").
    ///
    /// `shmem` is the shared-memory block allocator; it must be `Some` when
    /// `config.rsld` is set (§4.9 "In RSLD, also allocates a shared-memory
    /// block and initializes the shadow header"), and is ignored otherwise.
    pub fn init(
        config: DeviceConfig,
        vm: Arc<V>,
        allocator: &mut MmioAllocator,
        shmem: Option<&mut ShmemAllocator>,
        dispatcher: Arc<IoEventDispatcher>,
        ops: O,
    ) -> Result<Self> {
        let window_base = allocator.alloc()?;

        vm.register_mmio(window_base, u64::from(regs::IO_SIZE))?;

        let irq_line = match vm.alloc_irq_line() {
            Ok(line) => line,
            Err(e) => {
                let _ = vm.deregister_mmio(window_base);
                return Err(e);
            }
        };

        let mut device = MmioDevice::new(config.device_id, config.queue_count, config.msi_sharing, config.msi_capable);
        device.negotiate_notification_offer();
        device.offer_msi();
        device.set_signal_msi_capable(config.signal_msi);

        let (rsld, shmem_bytes, hvl_irq) = if config.rsld {
            let shmem_alloc = match shmem {
                Some(a) => a,
                None => {
                    let _ = vm.deregister_mmio(window_base);
                    return Err(TransportError::Resource(
                        "rsld device requires a shared-memory allocator".into(),
                    ));
                }
            };
            let header_and_config_size = rsld::shadow_header_size() + u64::from(ops.get_config_size());
            let private_arena_size = ops.get_mem_size();
            let shm_base = match shmem_alloc.alloc(header_and_config_size, private_arena_size) {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = vm.deregister_mmio(window_base);
                    return Err(e);
                }
            };
            let rsld_irq = match vm.alloc_irq_line() {
                Ok(line) => line,
                Err(e) => {
                    let _ = vm.deregister_mmio(window_base);
                    return Err(e);
                }
            };
            device.header.shm_base = shm_base;
            device.header.shm_len = header_and_config_size + private_arena_size;
            let bytes = vec![0u8; (header_and_config_size + private_arena_size) as usize];
            (Some(RsldShadow::new()), Some(bytes), Some(rsld_irq))
        } else {
            (None, None, None)
        };

        Ok(MmioTransport {
            window_base,
            irq_line,
            hvl_irq,
            vm,
            dispatcher,
            devid: config.subsys_id,
            inner: Mutex::new(Locked {
                device,
                ops,
                rsld,
                shmem: shmem_bytes,
                routes: HashMap::new(),
            }),
        })
    }

    pub fn window_base(&self) -> u64 {
        self.window_base
    }

    pub fn irq_line(&self) -> IrqLine {
        self.irq_line
    }

    /// The shared-memory shadow address for this device, if RSLD is
    /// enabled — what [`Self::emit_fdt_node`]'s `shadow_addr` should be
    /// populated with (§4.6).
    pub fn shm_base(&self) -> Option<u64> {
        let locked = self.inner.lock().unwrap();
        if locked.rsld.is_some() {
            Some(locked.device.header.shm_base)
        } else {
            None
        }
    }

    /// A register read in `[0, CONFIG)`. Callers in the config window
    /// (`offset >= CONFIG`) should use [`Self::read_config_byte`] instead.
    pub fn read_register(&self, offset: u32) -> u32 {
        let mut locked = self.inner.lock().unwrap();
        let Locked { device, ops, .. } = &mut *locked;
        device.read(offset, ops)
    }

    pub fn read_config_byte(&self, offset: u32) -> u8 {
        let locked = self.inner.lock().unwrap();
        locked.device.read_config(offset - CONFIG, &locked.ops)
    }

    /// A register write in `[0, CONFIG)`, applying whatever VM-interface
    /// side effect the decode produced (§4.2–§4.4).
    pub fn write_register(&self, offset: u32, value: u32) -> Result<()> {
        let action = {
            let mut locked = self.inner.lock().unwrap();
            let Locked { device, ops, .. } = &mut *locked;
            device.write(offset, value, ops)
        };
        self.apply_action(action)
    }

    pub fn write_config_byte(&self, offset: u32, value: u8) {
        let mut locked = self.inner.lock().unwrap();
        let Locked { device, ops, .. } = &mut *locked;
        device.write_config(offset - CONFIG, value, ops);
    }

    fn apply_action(&self, action: DecodeAction) -> Result<()> {
        match action {
            DecodeAction::None | DecodeAction::QueueNotified { .. } => Ok(()),
            DecodeAction::ArmQueue { vq, notify_addr, page_size, align, pfn } => {
                let addr = self.window_base + notify_addr;
                let devid = self.devid;
                let fd = self.dispatcher.register(addr, vq, move || {
                    debug!("virtio-mmio[{:#x}]: ioeventfd fired for vq {}", devid, vq);
                })?;
                // Bind KVM's fast path to the very fd the dispatcher is
                // already epoll-watching, so a matching guest write signals
                // it directly whether or not the kernel fast path is
                // actually engaged (`user_poll=false`: it is here).
                self.vm.install_ioeventfd(fd, addr, vq, false)?;
                let mut locked = self.inner.lock().unwrap();
                // §4.2: the ioeventfd bind precedes `init_vq`, so it is
                // called here rather than at decode time.
                if let Err(e) = locked.ops.init_vq(vq, page_size, align, pfn) {
                    debug!("virtio-mmio: init_vq({}) failed: {}", vq, e);
                }
                locked.ops.notify_vq_eventfd(vq, fd);
                Ok(())
            }
            DecodeAction::TearDownQueue { vq, notify_addr } => {
                let addr = self.window_base + notify_addr;
                self.dispatcher.unregister(addr, vq)?;
                self.vm.remove_ioeventfd(addr, vq)?;
                Ok(())
            }
            DecodeAction::Msi(effect) => self.apply_msi_effect(effect),
            DecodeAction::Reset => {
                let endian = self.vm.sample_endian();
                let mut locked = self.inner.lock().unwrap();
                locked.device.header.reset(endian);
                if let Some(t) = locked.device.msi.as_mut() {
                    t.reset();
                }
                self.teardown_all_queues(&mut locked);
                Ok(())
            }
        }
    }

    fn apply_msi_effect(&self, effect: MsiEffect) -> Result<()> {
        match effect {
            MsiEffect::None => Ok(()),
            MsiEffect::RouteRefresh(vector) => {
                let msg = {
                    let locked = self.inner.lock().unwrap();
                    locked
                        .device
                        .msi
                        .as_ref()
                        .and_then(|t| t.message(vector))
                        .unwrap_or_default()
                };
                match self.vm.add_msix_route(msg, self.devid) {
                    Ok(outcome) => {
                        let mut locked = self.inner.lock().unwrap();
                        locked.routes.insert(vector, outcome);
                        if let RouteOutcome::Routed(gsi) = outcome {
                            let vq = locked.device.msi.as_ref().and_then(|t| t.vq_for_vector(vector));
                            if let Some(vq) = vq {
                                locked.ops.notify_vq_gsi(vq, gsi);
                            }
                        }
                        Ok(())
                    }
                    Err(e) => {
                        // MSI was already advertised to the guest; there is
                        // no safe downgrade (§4.9 "Route configuration
                        // failures in the MSI path are fatal by design").
                        Err(TransportError::Fatal(format!(
                            "msi route install failed for vector {}: {}",
                            vector, e
                        )))
                    }
                }
            }
            MsiEffect::Redeliver(vector) => self.deliver_msi(vector),
        }
    }

    fn deliver_msi(&self, vector: u32) -> Result<()> {
        let (msg, outcome, signal_msi_capable) = {
            let mut locked = self.inner.lock().unwrap();
            locked.device.stats.bump(Stat::CheckIrq);
            let msg = locked
                .device
                .msi
                .as_ref()
                .and_then(|t| t.message(vector))
                .unwrap_or_default();
            let outcome = locked
                .routes
                .get(&vector)
                .copied()
                .unwrap_or(RouteOutcome::NotNeeded);
            (msg, outcome, locked.device.signal_msi_capable())
        };
        match outcome {
            // §4.3 "the route is skipped" direct-injection fast path —
            // only licensed when the device actually advertises SIGNAL_MSI.
            RouteOutcome::NotNeeded if signal_msi_capable => {
                self.vm.inject_msi(msg)?;
                self.inner.lock().unwrap().device.stats.bump(Stat::SignalMsi);
            }
            // No GSI was routed and direct injection isn't licensed either —
            // MSI was already advertised to the guest, so there is no safe
            // downgrade (§4.9 "Route configuration failures in the MSI path
            // are fatal by design").
            RouteOutcome::NotNeeded => {
                return Err(TransportError::Fatal(format!(
                    "vector {} has no route and device lacks SIGNAL_MSI capability",
                    vector
                )));
            }
            RouteOutcome::Routed(gsi) => {
                self.trigger_gsi(gsi)?;
            }
        }
        Ok(())
    }

    fn trigger_gsi(&self, gsi: Gsi) -> Result<()> {
        self.vm.trigger_irq(gsi)?;
        self.inner.lock().unwrap().device.stats.bump(Stat::SignalIrq);
        Ok(())
    }

    /// `ops.signal_vq` — the device back-end's interrupt-raise path
    /// (§4.4). Routes through MSI when enabled and bound, else the legacy
    /// IRQ line.
    pub fn signal_vq(&self, vq: u32) -> Result<()> {
        let vector = {
            let locked = self.inner.lock().unwrap();
            locked
                .device
                .msi
                .as_ref()
                .filter(|t| t.is_enabled())
                .map(|t| t.vq_vector(vq as usize))
                .unwrap_or(MSI_NO_VECTOR)
        };
        self.signal(vector, INT_VRING)
    }

    pub fn signal_config(&self) -> Result<()> {
        let vector = {
            let locked = self.inner.lock().unwrap();
            locked
                .device
                .msi
                .as_ref()
                .filter(|t| t.is_enabled())
                .map(|t| t.config_vector())
                .unwrap_or(MSI_NO_VECTOR)
        };
        self.signal(vector, INT_CONFIG)
    }

    fn signal(&self, vector: u32, bits: u32) -> Result<()> {
        let rsld_irq = {
            let mut locked = self.inner.lock().unwrap();
            if locked.rsld.is_some() {
                locked.device.header.raise(bits);
                if let Some(shmem) = locked.shmem.as_mut() {
                    ShadowSnapshot::raise_interrupt_bits(shmem, bits);
                }
                Some(
                    self.hvl_irq
                        .expect("hvl_irq is allocated whenever rsld is enabled"),
                )
            } else {
                None
            }
        };
        if let Some(line) = rsld_irq {
            // §4.7: RSLD signals through its own line, never MSI/legacy IRQ.
            return self.trigger_gsi(line);
        }

        if vector != MSI_NO_VECTOR {
            let masked = {
                let mut locked = self.inner.lock().unwrap();
                let masked = locked
                    .device
                    .msi
                    .as_ref()
                    .map(|t| t.is_masked(vector))
                    .unwrap_or(false);
                if masked {
                    if let Some(t) = locked.device.msi.as_mut() {
                        t.defer(vector);
                    }
                }
                masked
            };
            if masked {
                return Ok(());
            }
            return self.deliver_msi(vector);
        }

        let mut locked = self.inner.lock().unwrap();
        locked.device.header.raise(bits);
        drop(locked);
        self.trigger_gsi(self.irq_line)
    }

    /// RSLD doorbell entry point (§4.7). Not meaningful unless the device
    /// was configured with `rsld(true)`.
    pub fn doorbell(&self, snapshot: ShadowSnapshot) -> Result<()> {
        let mut locked = self.inner.lock().unwrap();
        let Locked { device, ops, rsld, .. } = &mut *locked;
        let shadow = match rsld {
            Some(s) => s,
            None => {
                warn!("virtio-mmio: doorbell rung on a device without RSLD enabled");
                return Ok(());
            }
        };
        let actions = shadow.on_doorbell(snapshot, device, ops);
        for action in actions {
            if let RsldAction::Reset = action {
                let endian = self.vm.sample_endian();
                device.header.reset(endian);
            }
        }
        Ok(())
    }

    /// `reset()` (§4.9): tears down every running queue and clears
    /// `MSI_ENABLED`, matching scenario S5.
    pub fn reset(&self) -> Result<()> {
        let mut locked = self.inner.lock().unwrap();
        if let Some(t) = locked.device.msi.as_mut() {
            t.reset();
        }
        self.teardown_all_queues(&mut locked);
        locked.device.header.status = 0;
        Ok(())
    }

    fn teardown_all_queues(&self, locked: &mut Locked<O>) {
        for vq in 0..locked.device.queues.len() as u32 {
            if locked.device.queues[vq as usize].has_ioevent() {
                let notify_addr = locked.device.notify_addr_offset(vq) as u64;
                let addr = self.window_base + notify_addr;
                let _ = self.dispatcher.unregister(addr, vq);
                let _ = self.vm.remove_ioeventfd(addr, vq);
            }
            locked.device.queues[vq as usize].write_pfn(0);
        }
    }

    /// `exit()` (§4.9): reset, then deregister the MMIO window.
    pub fn exit(self) -> Result<()> {
        self.reset()?;
        self.vm.deregister_mmio(self.window_base)
    }

    /// Emits this device's device-tree node (C8, §4.6). `shadow_addr`
    /// should be `Some` only when RSLD is enabled, per §4.6.
    pub fn emit_fdt_node(
        &self,
        fragment: &mut DeviceTreeFragment,
        shadow_addr: Option<u64>,
        irq_props: &dyn IrqPropertyProvider,
    ) {
        let addr = shadow_addr.unwrap_or(self.window_base);
        fragment.add_device(addr, u64::from(regs::IO_SIZE), self.irq_line, irq_props);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::mock::MockVm;

    struct NullOps {
        config: Vec<u8>,
        vq_count: u32,
    }

    impl VirtioDeviceOps for NullOps {
        fn get_host_features(&self) -> u32 {
            0xF
        }
        fn set_guest_features(&mut self, _f: u32) {}
        fn get_config(&self) -> &[u8] {
            &self.config
        }
        fn get_config_mut(&mut self) -> &mut [u8] {
            &mut self.config
        }
        fn get_vq_count(&self) -> u32 {
            self.vq_count
        }
        fn get_size_vq(&self, _vq: u32) -> u32 {
            128
        }
        fn set_size_vq(&mut self, _vq: u32, _size: u32) {}
        fn init_vq(&mut self, _vq: u32, _page_size: u32, _align: u32, _pfn: u32) -> Result<()> {
            Ok(())
        }
        fn notify_vq(&mut self, _vq: u32) {}
        fn notify_status(&mut self, _status: u32) {}
    }

    fn setup() -> (MmioTransport<MockVm, NullOps>, Arc<MockVm>) {
        let vm = Arc::new(MockVm::default());
        let dispatcher = Arc::new(IoEventDispatcher::new().unwrap());
        let mut allocator = MmioAllocator::new(0x1000_0000, 0x2000_0000);
        let ops = NullOps { config: vec![0; 8], vq_count: 1 };
        let transport = MmioTransport::init(
            DeviceConfig::new(2, 1),
            vm.clone(),
            &mut allocator,
            None,
            dispatcher,
            ops,
        )
        .unwrap();
        (transport, vm)
    }

    fn setup_rsld() -> (MmioTransport<MockVm, NullOps>, Arc<MockVm>) {
        let vm = Arc::new(MockVm::default());
        let dispatcher = Arc::new(IoEventDispatcher::new().unwrap());
        let mut allocator = MmioAllocator::new(0x1000_0000, 0x2000_0000);
        let mut shmem = ShmemAllocator::new(0x4000_0000, 0x1000, 0x1_0000_0000);
        let ops = NullOps { config: vec![0; 8], vq_count: 1 };
        let transport = MmioTransport::init(
            DeviceConfig::new(2, 1).rsld(true),
            vm.clone(),
            &mut allocator,
            Some(&mut shmem),
            dispatcher,
            ops,
        )
        .unwrap();
        (transport, vm)
    }

    #[test]
    fn bring_up_asserts_legacy_irq_on_signal_vq() {
        let (t, vm) = setup();
        t.write_register(regs::HOST_FEATURES_SEL, 0);
        let host = t.read_register(regs::HOST_FEATURES);
        t.write_register(regs::GUEST_FEATURES_SEL, 0);
        t.write_register(regs::GUEST_FEATURES, host);
        t.write_register(regs::QUEUE_SEL, 0);
        t.write_register(regs::QUEUE_NUM, 128);
        t.write_register(regs::QUEUE_ALIGN, 4096);
        t.write_register(regs::QUEUE_PFN, 0x1000);
        t.write_register(regs::STATUS, 0x0f);

        t.signal_vq(0).unwrap();
        assert_eq!(*vm.triggered.borrow(), vec![t.irq_line()]);
        assert_eq!(t.read_register(regs::INTERRUPT_STATUS), INT_VRING);
    }

    #[test]
    fn reset_tears_down_queues_and_clears_status() {
        let (t, _vm) = setup();
        t.write_register(regs::QUEUE_SEL, 0);
        t.write_register(regs::QUEUE_NUM, 128);
        t.write_register(regs::QUEUE_ALIGN, 4096);
        t.write_register(regs::QUEUE_PFN, 0x1000);
        t.write_register(regs::STATUS, 0x0f);

        t.reset().unwrap();
        assert_eq!(t.read_register(regs::STATUS), 0);
        assert_eq!(t.read_register(regs::QUEUE_PFN), 0);
    }

    #[test]
    fn status_write_of_zero_clears_msi_enabled() {
        let vm = Arc::new(MockVm::default());
        let dispatcher = Arc::new(IoEventDispatcher::new().unwrap());
        let mut allocator = MmioAllocator::new(0x1000_0000, 0x2000_0000);
        let ops = NullOps { config: vec![0; 8], vq_count: 1 };
        let t = MmioTransport::init(
            DeviceConfig::new(2, 1).msi_capable(true),
            vm,
            &mut allocator,
            None,
            dispatcher,
            ops,
        )
        .unwrap();

        t.write_register(regs::MSI_CMD, regs::MSI_CMD_ENABLE);
        assert_eq!(
            t.read_register(regs::MSI_STATE) & regs::MSI_STATE_ENABLED,
            regs::MSI_STATE_ENABLED
        );

        // S5: STATUS := 0 must clear MSI_ENABLED, not just header state —
        // this goes through the decode path (`DecodeAction::Reset`), not
        // the explicit `reset()` method.
        t.write_register(regs::STATUS, 0).unwrap();
        assert_eq!(t.read_register(regs::MSI_STATE) & regs::MSI_STATE_ENABLED, 0);
    }

    #[test]
    fn init_rejects_rsld_config_without_a_shmem_allocator() {
        let vm = Arc::new(MockVm::default());
        let dispatcher = Arc::new(IoEventDispatcher::new().unwrap());
        let mut allocator = MmioAllocator::new(0x1000_0000, 0x2000_0000);
        let ops = NullOps { config: vec![0; 8], vq_count: 1 };
        let err = MmioTransport::init(
            DeviceConfig::new(2, 1).rsld(true),
            vm,
            &mut allocator,
            None,
            dispatcher,
            ops,
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::Resource(_)));
    }

    #[test]
    fn rsld_init_allocates_shared_memory_and_a_dedicated_irq_line() {
        let (t, _vm) = setup_rsld();
        // shadow header + 8-byte config, no private arena
        let expected_base = 0x4000_0000u64 + 0x1000;
        assert_eq!(t.shm_base(), Some(expected_base));
        // a second, distinct IRQ line from the legacy one (MockVm hands out
        // sequential lines: 0 for irq_line, 1 for hvl_irq)
        assert_ne!(t.irq_line(), 1);
    }

    #[test]
    fn rsld_signal_pulses_hvl_irq_and_mirrors_into_shared_memory() {
        let (t, vm) = setup_rsld();
        t.signal_vq(0).unwrap();
        assert_eq!(*vm.triggered.borrow(), vec![1]);
        assert_eq!(t.read_register(regs::INTERRUPT_STATUS), INT_VRING);
    }

    #[test]
    fn non_rsld_device_without_signal_msi_capability_faults_on_unneeded_route() {
        let vm = Arc::new(MockVm {
            route_outcome: RouteOutcome::NotNeeded,
            ..MockVm::default()
        });
        let dispatcher = Arc::new(IoEventDispatcher::new().unwrap());
        let mut allocator = MmioAllocator::new(0x1000_0000, 0x2000_0000);
        let ops = NullOps { config: vec![0; 8], vq_count: 1 };
        let t = MmioTransport::init(
            DeviceConfig::new(2, 1).msi_capable(true),
            vm,
            &mut allocator,
            None,
            dispatcher,
            ops,
        )
        .unwrap();

        t.write_register(regs::QUEUE_SEL, 0);
        t.write_register(regs::QUEUE_NUM, 128);
        t.write_register(regs::QUEUE_ALIGN, 4096);
        t.write_register(regs::QUEUE_PFN, 0x1000);
        t.write_register(regs::STATUS, 0x0f);

        t.write_register(regs::MSI_VEC_SEL, 1);
        t.write_register(regs::MSI_ADDR_LO, 0xAAAA);
        t.write_register(regs::MSI_ADDR_HI, 0);
        t.write_register(regs::MSI_DATA, 0xBBBB);
        t.write_register(regs::MSI_CMD, regs::MSI_CMD_CONFIGURE);
        t.write_register(regs::MSI_CMD, regs::MSI_CMD_ENABLE);

        let err = t.signal_vq(0).unwrap_err();
        assert!(matches!(err, TransportError::Fatal(_)));
    }
}
