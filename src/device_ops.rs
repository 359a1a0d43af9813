use crate::error::Result;

/// The "virtio_device ops" contract (§4.9): operations a concrete device
/// back-end (block, net, console, rng, balloon, vsock, 9p, scsi —
/// §1 "Out of scope") implements and the transport calls into. This crate
/// never implements a back-end itself; it only defines and drives this
/// trait.
pub trait VirtioDeviceOps {
    fn get_host_features(&self) -> u32;
    fn set_guest_features(&mut self, features: u32);

    /// Byte-granular device configuration space, forwarded to from
    /// `CONFIG`-offset accesses (§4.5).
    fn get_config(&self) -> &[u8];
    fn get_config_mut(&mut self) -> &mut [u8];

    /// RSLD only: size of the configuration window copied into the shared
    /// shadow at `init` time (§4.9, §6 shared-memory layout).
    fn get_config_size(&self) -> u32 {
        self.get_config().len() as u32
    }

    /// RSLD only: size of the per-device private arena carved out of the
    /// shared-memory region, beyond the shadow header and config window
    /// (§6).
    fn get_mem_size(&self) -> u64 {
        0
    }

    fn get_vq_count(&self) -> u32;
    fn get_size_vq(&self, vq: u32) -> u32;
    fn set_size_vq(&mut self, vq: u32, size: u32);

    /// Brings a virtqueue up once the guest has armed it with a non-zero
    /// `QUEUE_PFN` (§4.2).
    fn init_vq(&mut self, vq: u32, page_size: u32, align: u32, pfn: u32) -> Result<()>;

    /// Consumes one queue-notify, either because ioeventfd delivered it or
    /// because the write reached user space before ioeventfd was bound
    /// (§4.2). Must be idempotent (§9 open question: vsock's RSLD path
    /// relies on this).
    fn notify_vq(&mut self, vq: u32);

    /// Optional: requests that vhost-style back-ends bind their own
    /// notifier to `fd` instead of waiting on `notify_vq` calls (§4.8).
    fn notify_vq_eventfd(&mut self, _vq: u32, _fd: i32) {}

    /// Optional: informs the back-end which GSI a queue's interrupt path
    /// now routes through.
    fn notify_vq_gsi(&mut self, _vq: u32, _gsi: u32) {}

    /// Called on every `STATUS` write (not only transitions to zero — see
    /// `SPEC_FULL.md` §B) with the new status value.
    fn notify_status(&mut self, status: u32);
}
