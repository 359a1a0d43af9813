use std::sync::atomic::{AtomicU64, Ordering};

/// Index into [`Stats`], matching kvmtool's `VIRTIO_MMIO_STAT_*` enum in
/// `include/kvm/virtio-mmio.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Stat {
    QueueNotify = 0,
    TrapIn = 1,
    TrapOut = 2,
    AckIrq = 3,
    CheckIrq = 4,
    QueueSel = 5,
    MsiCmd = 6,
    MsiMask = 7,
    SignalMsi = 8,
    SignalIrq = 9,
}

pub const STAT_MAX: usize = 10;

/// Per-device statistics counters. Written from the vCPU thread (decoder),
/// the I/O thread (ioeventfd callbacks) and the RSLD thread (doorbell) —
/// each counter is therefore a plain atomic rather than a field guarded by
/// the device lock, since increments never need to be ordered against one
/// another.
///
/// These are the primary observability surface for the core (§7); they are
/// never reset.
#[derive(Debug)]
pub struct Stats {
    counters: [AtomicU64; STAT_MAX],
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            counters: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    pub fn bump(&self, stat: Stat) {
        self.counters[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }
}
