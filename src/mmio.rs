//! Bit-exact decode/encode of the virtio-MMIO register window (C6, §4.5,
//! §6). Grounded on kvmtool's `virtio_mmio_config_in`/`virtio_mmio_config_out`
//! in `virtio/mmio.c`, which this module's `read`/`write` mirror register
//! for register, including the "unrecognized offset reads zero, write is
//! ignored" and "read-only register write is silently dropped" policies
//! (§7 *Protocol* error kind).
//!
//! This module never talks to a [`crate::vm::VmInterface`] directly —
//! consistent with the control-flow description in the overview, C6 only
//! mutates C3/C4/C5 state or calls into the device back-end, and hands the
//! orchestrator (C9) a [`DecodeAction`] describing anything that needs a
//! VM-interface side effect (ioeventfd bind, MSI route refresh, signal).

use log::debug;

use crate::device_ops::VirtioDeviceOps;
use crate::features::FeatureNegotiator;
use crate::header::{Endian, MmioHeader};
use crate::msi::{MsiCommand, MsiEffect, MsiTable};
use crate::regs::*;
use crate::stats::{Stat, Stats};
use crate::virtqueue::{VirtQueueSlot, VqTransition};

/// Work the decoder cannot do itself, to be carried out by the
/// orchestrator against the [`crate::vm::VmInterface`] (§4.2–§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeAction {
    None,
    /// `QUEUE_PFN` armed a queue: bind an ioeventfd at `notify_addr` with
    /// `datamatch = vq`, then call `ops.init_vq(vq, page_size, align, pfn)`
    /// (§4.2: ioeventfd bind precedes `init_vq`).
    ArmQueue {
        vq: u32,
        notify_addr: u64,
        page_size: u32,
        align: u32,
        pfn: u32,
    },
    /// `QUEUE_PFN := 0` tore a queue down: remove its ioeventfd.
    TearDownQueue { vq: u32, notify_addr: u64 },
    /// A queue-notify write reached user space directly (ioeventfd not yet
    /// bound, or the extension register was used before negotiation).
    QueueNotified { vq: u32 },
    /// An `MSI_CMD` write produced an effect the orchestrator must apply
    /// (route refresh or deferred redelivery, §4.3/§4.4).
    Msi(MsiEffect),
    /// `STATUS := 0`: every running queue must be torn down and `reset()`
    /// called on the device back-end (§4.9 `exit`, §8 scenario S5).
    Reset,
}

/// Per-device transport state the decoder owns directly: the register
/// image, feature negotiation, the virtqueue table and (if configured) the
/// MSI vector table. One instance per `MmioDevice` (§3).
pub struct MmioDevice {
    pub header: MmioHeader,
    pub features: FeatureNegotiator,
    pub queues: Vec<VirtQueueSlot>,
    pub msi: Option<MsiTable>,
    pub stats: Stats,
    /// Non-zero once `MMIO_NOTIFICATION` is negotiated; see
    /// [`Self::notify_offset`] (§4.1, §6, scenario S4).
    notify_offset: u32,
    msi_vec_num: u32,
    /// Transport capabilities bitmask (§3 `MmioDevice.features`); currently
    /// only [`crate::regs::FEATURE_SIGNAL_MSI`]. Latched at device creation
    /// by the monitor, not negotiated with the guest.
    capabilities: u32,
}

impl MmioDevice {
    pub fn new(device_id: u32, vq_count: u32, msi_sharing: bool, msi_capable: bool) -> Self {
        let queues = (0..vq_count).map(|_| VirtQueueSlot::default()).collect();
        MmioDevice {
            header: MmioHeader::new(device_id),
            features: FeatureNegotiator::new(0, 0),
            queues,
            msi: if msi_capable {
                Some(MsiTable::new(msi_sharing))
            } else {
                None
            },
            stats: Stats::new(),
            notify_offset: 0,
            msi_vec_num: if msi_capable { MAX_VQ as u32 + 1 } else { 0 },
            capabilities: 0,
        }
    }

    /// Latches the `SIGNAL_MSI` transport capability (§3, §4.3 "direct-
    /// injection fast path"). Called once from `MmioTransport::init`.
    pub fn set_signal_msi_capable(&mut self, capable: bool) {
        if capable {
            self.capabilities |= FEATURE_SIGNAL_MSI;
        } else {
            self.capabilities &= !FEATURE_SIGNAL_MSI;
        }
    }

    pub fn signal_msi_capable(&self) -> bool {
        self.capabilities & FEATURE_SIGNAL_MSI != 0
    }

    /// Offers `MMIO_NOTIFICATION` only if there is room for a per-queue
    /// notify word below the configuration window (§4.1): `queue_count * 4
    /// <= CONFIG - (MSI_DATA + 4)`.
    pub fn negotiate_notification_offer(&mut self) {
        let room = CONFIG - (MSI_ADDR_LO.max(MSI_DATA) + 4);
        let fits = (self.queues.len() as u32) * 4 <= room;
        self.features.offer_notification(fits);
        if fits {
            self.notify_offset = MSI_DATA + 4;
        }
    }

    pub fn offer_msi(&mut self) {
        self.features.offer_msi(self.msi.is_some());
    }

    /// Value returned by a `QUEUE_NOTIFY` read once the notification
    /// extension is accepted: `(notify_offset << 16) | notify_multiplier`
    /// with a fixed multiplier of 4 (one `u32` slot per queue, §4.1/§6).
    fn notify_extension_value(&self) -> u32 {
        (self.notify_offset << 16) | 4
    }

    /// Guest-physical offset (relative to the device's window base) that
    /// must be bound to an ioeventfd for queue `vq` (§4.2 scenario S4).
    pub fn notify_addr_offset(&self, vq: u32) -> u32 {
        if self.features.notification_accepted() {
            self.notify_offset + 4 * vq
        } else {
            QUEUE_NOTIFY
        }
    }

    /// A 4-byte-aligned register read in `[0, CONFIG)` (§4.5). Config-space
    /// reads are handled separately by the caller via
    /// [`Self::read_config`], since they are byte-granular and go through
    /// the device back-end.
    pub fn read(&mut self, offset: u32, ops: &dyn VirtioDeviceOps) -> u32 {
        self.stats.bump(Stat::TrapIn);
        match offset {
            MAGIC_VALUE => u32::from_le_bytes(MAGIC),
            VERSION => VERSION_VALUE,
            DEVICE_ID => self.header.device_id,
            VENDOR_ID => self.header.vendor_id,
            HOST_FEATURES => {
                self.features.set_host_word0(ops.get_host_features());
                self.features.host_features()
            }
            QUEUE_NUM_MAX => QUEUE_NUM_MAX_VALUE,
            QUEUE_PFN => self.queue_sel().map(|q| q.pfn()).unwrap_or(0),
            QUEUE_NOTIFY if self.features.notification_accepted() => {
                self.notify_extension_value()
            }
            INTERRUPT_STATUS => self.header.interrupt_state,
            STATUS => self.header.status,
            SHM_BASE_LOW => self.header.shm_base as u32,
            SHM_BASE_HIGH => (self.header.shm_base >> 32) as u32,
            SHM_LEN_LOW => self.header.shm_len as u32,
            SHM_LEN_HIGH => (self.header.shm_len >> 32) as u32,
            MSI_VEC_NUM => self.msi_vec_num,
            MSI_STATE => self.msi_state(),
            _ => {
                debug!("virtio-mmio: read of unrecognized offset {:#x}", offset);
                0
            }
        }
    }

    fn msi_state(&self) -> u32 {
        match &self.msi {
            None => 0,
            Some(table) => {
                let mut v = 0;
                if table.is_enabled() {
                    v |= MSI_STATE_ENABLED;
                }
                if table.is_sharing() {
                    v |= MSI_STATE_SHARING;
                }
                v
            }
        }
    }

    /// A 4-byte-aligned register write in `[0, CONFIG)` (§4.5). Returns the
    /// [`DecodeAction`] the orchestrator must apply, if any.
    pub fn write(&mut self, offset: u32, value: u32, ops: &mut dyn VirtioDeviceOps) -> DecodeAction {
        self.stats.bump(Stat::TrapOut);
        match offset {
            HOST_FEATURES_SEL => {
                self.features.set_host_sel(value);
                DecodeAction::None
            }
            GUEST_FEATURES => {
                self.features.write_guest_features(value);
                // The device back-end only cares about the device feature
                // word (word 0); transport bits (word 1) are consumed
                // entirely inside the negotiator.
                ops.set_guest_features(self.features.guest_word(0));
                DecodeAction::None
            }
            GUEST_FEATURES_SEL => {
                self.features.set_guest_sel(value);
                DecodeAction::None
            }
            GUEST_PAGE_SIZE => {
                self.header.guest_page_size = value;
                DecodeAction::None
            }
            QUEUE_SEL => {
                self.stats.bump(Stat::QueueSel);
                self.header.queue_sel = value;
                DecodeAction::None
            }
            QUEUE_NUM => {
                if let Some(vq) = self.queue_sel_mut() {
                    vq.set_size(value, QUEUE_NUM_MAX_VALUE);
                    ops.set_size_vq(self.header.queue_sel, vq_size(self, self.header.queue_sel));
                }
                DecodeAction::None
            }
            QUEUE_ALIGN => {
                if let Some(vq) = self.queue_sel_mut() {
                    vq.set_align(value);
                }
                DecodeAction::None
            }
            QUEUE_PFN => self.write_queue_pfn(value),
            QUEUE_NOTIFY => {
                self.stats.bump(Stat::QueueNotify);
                ops.notify_vq(value);
                DecodeAction::QueueNotified { vq: value }
            }
            INTERRUPT_ACK => {
                self.stats.bump(Stat::AckIrq);
                self.header.ack_interrupts(value);
                DecodeAction::None
            }
            STATUS => self.write_status(value, ops),
            MSI_CMD => self.write_msi_cmd(value),
            MSI_VEC_SEL => {
                if let Some(table) = &mut self.msi {
                    table.set_vec_sel(value);
                }
                DecodeAction::None
            }
            MSI_ADDR_LO => {
                if let Some(table) = &mut self.msi {
                    table.stage_addr_lo(value);
                }
                DecodeAction::None
            }
            MSI_ADDR_HI => {
                if let Some(table) = &mut self.msi {
                    table.stage_addr_hi(value);
                }
                DecodeAction::None
            }
            MSI_DATA => {
                if let Some(table) = &mut self.msi {
                    table.stage_data(value);
                }
                DecodeAction::None
            }
            // MAGIC, VERSION, DEVICE_ID, VENDOR_ID, HOST_FEATURES,
            // QUEUE_NUM_MAX, INTERRUPT_STATUS, MSI_VEC_NUM, MSI_STATE,
            // SHM_* are read-only; writes are silently dropped (§7).
            MAGIC_VALUE | VERSION | DEVICE_ID | VENDOR_ID | HOST_FEATURES | QUEUE_NUM_MAX
            | INTERRUPT_STATUS | MSI_VEC_NUM | MSI_STATE | SHM_BASE_LOW | SHM_BASE_HIGH
            | SHM_LEN_LOW | SHM_LEN_HIGH => {
                debug!("virtio-mmio: write to read-only offset {:#x} dropped", offset);
                DecodeAction::None
            }
            _ => {
                debug!("virtio-mmio: write to unrecognized offset {:#x} ignored", offset);
                DecodeAction::None
            }
        }
    }

    fn write_queue_pfn(&mut self, pfn: u32) -> DecodeAction {
        let vq = self.header.queue_sel;
        let page_size = self.header.guest_page_size;
        let (transition, align) = match self.queue_sel_mut() {
            Some(slot) => (slot.write_pfn(pfn), slot.align()),
            None => return DecodeAction::None,
        };
        let notify_addr = self.notify_addr_offset(vq) as u64;
        match transition {
            // `ops.init_vq` is not called here: §4.2 orders ioeventfd bind
            // before `init_vq`, and the bind itself is the orchestrator's
            // job (it owns the VM interface), so `init_vq` is deferred to
            // `apply_action` handling this action, after the bind.
            VqTransition::Armed => DecodeAction::ArmQueue { vq, notify_addr, page_size, align, pfn },
            VqTransition::TornDown => DecodeAction::TearDownQueue { vq, notify_addr },
            VqTransition::NoOp => DecodeAction::None,
        }
    }

    fn write_status(&mut self, value: u32, ops: &mut dyn VirtioDeviceOps) -> DecodeAction {
        self.header.status = value;
        ops.notify_status(value);
        if value == 0 {
            // Endian re-sampling belongs to the orchestrator, which has
            // access to the vCPU context through the VM interface; here we
            // only flag that a reset happened. The orchestrator calls
            // `header.reset(sampled_endian)` itself after observing this
            // action (§4.5, §8 invariant 5).
            DecodeAction::Reset
        } else {
            DecodeAction::None
        }
    }

    fn write_msi_cmd(&mut self, value: u32) -> DecodeAction {
        self.stats.bump(Stat::MsiCmd);
        let cmd = match MsiCommand::decode(value) {
            Some(c) => c,
            None => {
                debug!("virtio-mmio: unrecognized MSI_CMD {:#x}", value);
                return DecodeAction::None;
            }
        };
        if cmd == MsiCommand::Mask || cmd == MsiCommand::Unmask {
            self.stats.bump(Stat::MsiMask);
        }
        if cmd == MsiCommand::MapQueue {
            let queue_sel = self.header.queue_sel as usize;
            if let Some(table) = &mut self.msi {
                table.map_queue(queue_sel);
            }
        }
        match &mut self.msi {
            Some(table) => DecodeAction::Msi(table.apply(cmd)),
            None => DecodeAction::None,
        }
    }

    /// Byte-granular read from the device configuration window
    /// (`offset >= CONFIG`, §4.5). `rel` is the offset already adjusted
    /// to be relative to `CONFIG`.
    pub fn read_config(&self, rel: u32, ops: &dyn VirtioDeviceOps) -> u8 {
        ops.get_config().get(rel as usize).copied().unwrap_or(0)
    }

    pub fn write_config(&mut self, rel: u32, value: u8, ops: &mut dyn VirtioDeviceOps) {
        if let Some(byte) = ops.get_config_mut().get_mut(rel as usize) {
            *byte = value;
        } else {
            debug!("virtio-mmio: config write past device config size at {:#x}", rel);
        }
    }

    fn queue_sel(&self) -> Option<&VirtQueueSlot> {
        self.queues.get(self.header.queue_sel as usize)
    }

    fn queue_sel_mut(&mut self) -> Option<&mut VirtQueueSlot> {
        let sel = self.header.queue_sel as usize;
        self.queues.get_mut(sel)
    }

    pub fn running_queues(&self) -> impl Iterator<Item = u32> + '_ {
        self.queues
            .iter()
            .enumerate()
            .filter(|(_, q)| q.is_running())
            .map(|(i, _)| i as u32)
    }
}

fn vq_size(dev: &MmioDevice, vq: u32) -> u32 {
    dev.queues.get(vq as usize).map(|q| q.size()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeOps {
        host_features: u32,
        guest_features: u32,
        config: Vec<u8>,
        notified: Vec<u32>,
        statuses: Vec<u32>,
    }

    impl VirtioDeviceOps for FakeOps {
        fn get_host_features(&self) -> u32 {
            self.host_features
        }
        fn set_guest_features(&mut self, features: u32) {
            self.guest_features = features;
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
        fn set_size_vq(&mut self, _vq: u32, _size: u32) {}
        fn init_vq(&mut self, _vq: u32, _page_size: u32, _align: u32, _pfn: u32) -> crate::error::Result<()> {
            Ok(())
        }
        fn notify_vq(&mut self, vq: u32) {
            self.notified.push(vq);
        }
        fn notify_status(&mut self, status: u32) {
            self.statuses.push(status);
        }
    }

    fn fake_ops() -> FakeOps {
        FakeOps {
            host_features: 0xF,
            guest_features: 0,
            config: vec![0; 4],
            notified: Vec::new(),
            statuses: Vec::new(),
        }
    }

    #[test]
    fn bring_up_sequence_arms_queue_and_raises_interrupt() {
        let mut dev = MmioDevice::new(2, 1, false, false);
        let mut ops = fake_ops();

        dev.write(HOST_FEATURES_SEL, 0, &mut ops);
        let host = dev.read(HOST_FEATURES, &ops);
        assert_eq!(host, 0xF);

        dev.write(GUEST_FEATURES_SEL, 0, &mut ops);
        dev.write(GUEST_FEATURES, host, &mut ops);

        dev.write(QUEUE_SEL, 0, &mut ops);
        dev.write(QUEUE_NUM, 128, &mut ops);
        dev.write(QUEUE_ALIGN, 4096, &mut ops);
        let action = dev.write(QUEUE_PFN, 0x1000, &mut ops);
        assert_eq!(
            action,
            DecodeAction::ArmQueue {
                vq: 0,
                notify_addr: QUEUE_NOTIFY as u64,
                page_size: 0,
                align: 4096,
                pfn: 0x1000,
            }
        );

        dev.header.raise(INT_VRING);
        assert_eq!(dev.read(INTERRUPT_STATUS, &ops), INT_VRING);
    }

    #[test]
    fn status_write_of_zero_signals_reset() {
        let mut dev = MmioDevice::new(2, 1, false, false);
        let mut ops = fake_ops();
        dev.write(STATUS, 0x0f, &mut ops);
        assert_eq!(ops.statuses, vec![0x0f]);
        let action = dev.write(STATUS, 0, &mut ops);
        assert_eq!(action, DecodeAction::Reset);
    }

    #[test]
    fn read_only_register_write_is_dropped() {
        let mut dev = MmioDevice::new(2, 1, false, false);
        let mut ops = fake_ops();
        dev.write(VENDOR_ID, 0xdeadbeef, &mut ops);
        assert_eq!(dev.read(VENDOR_ID, &ops), VENDOR_ID_VALUE);
    }

    #[test]
    fn unrecognized_offset_reads_zero_and_ignores_writes() {
        let mut dev = MmioDevice::new(2, 1, false, false);
        let mut ops = fake_ops();
        dev.write(0x0a8, 0x1234, &mut ops);
        assert_eq!(dev.read(0x0a8, &ops), 0);
    }

    #[test]
    fn notification_extension_offered_when_room_exists() {
        let mut dev = MmioDevice::new(2, 4, false, false);
        dev.negotiate_notification_offer();
        assert!(dev.features.host_word(1) != 0);
    }

    #[test]
    fn config_window_is_byte_granular_and_forwards_to_backend() {
        let mut dev = MmioDevice::new(2, 1, false, false);
        let mut ops = fake_ops();
        dev.write_config(1, 0xAB, &mut ops);
        assert_eq!(dev.read_config(1, &ops), 0xAB);
    }
}
