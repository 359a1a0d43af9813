/// The vCPU endianness sampled at `STATUS := 0` (§4.5 "endian re-sampling
/// on reset", §8 invariant 5). A real adapter reads this off the vCPU
/// state; the transport only needs to store and forward whatever the VM
/// interface reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Default for Endian {
    fn default() -> Self {
        Endian::Little
    }
}

/// The authoritative register image (§3 `MmioDevice.header`): the subset of
/// device state the decoder owns directly, as opposed to state that lives
/// in [`crate::features::FeatureNegotiator`], [`crate::msi::MsiTable`] or
/// [`crate::virtqueue::VirtQueueSlot`].
///
/// `device_id`/`vendor_id` are fixed at construction (they back `DEVICE_ID`
/// and `VENDOR_ID`, both read-only); everything else is guest-writable
/// register state. The `shm_*` fields are populated only when RSLD is
/// active (§B of the expanded spec) and otherwise read as zero.
#[derive(Debug)]
pub struct MmioHeader {
    pub device_id: u32,
    pub vendor_id: u32,
    pub guest_page_size: u32,
    pub queue_sel: u32,
    pub interrupt_state: u32,
    pub status: u32,
    pub endian: Endian,
    pub shm_base: u64,
    pub shm_len: u64,
}

impl MmioHeader {
    pub fn new(device_id: u32) -> Self {
        MmioHeader {
            device_id,
            vendor_id: crate::regs::VENDOR_ID_VALUE,
            guest_page_size: 0,
            queue_sel: 0,
            interrupt_state: 0,
            status: 0,
            endian: Endian::default(),
            shm_base: 0,
            shm_len: 0,
        }
    }

    /// `STATUS := 0` resets every queue-independent piece of header state
    /// back to its power-on value and re-samples `endian` (§4.5).
    pub fn reset(&mut self, sampled_endian: Endian) {
        self.status = 0;
        self.interrupt_state = 0;
        self.endian = sampled_endian;
    }

    pub fn ack_interrupts(&mut self, ack: u32) {
        self.interrupt_state &= !ack;
    }

    pub fn raise(&mut self, bits: u32) {
        self.interrupt_state |= bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_status_and_interrupt_state() {
        let mut hdr = MmioHeader::new(2);
        hdr.status = 0x0f;
        hdr.raise(crate::regs::INT_VRING);
        hdr.reset(Endian::Big);
        assert_eq!(hdr.status, 0);
        assert_eq!(hdr.interrupt_state, 0);
        assert_eq!(hdr.endian, Endian::Big);
    }

    #[test]
    fn ack_only_clears_selected_bits() {
        let mut hdr = MmioHeader::new(2);
        hdr.raise(crate::regs::INT_VRING | crate::regs::INT_CONFIG);
        hdr.ack_interrupts(crate::regs::INT_VRING);
        assert_eq!(hdr.interrupt_state, crate::regs::INT_CONFIG);
    }
}
