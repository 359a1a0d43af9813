use crate::regs::{MAX_VQ, MSI_NO_VECTOR};

/// `(addr_lo, addr_hi, data)` — the payload of a message-signaled
/// interrupt, latched from `MSI_ADDR_LO`/`MSI_ADDR_HI`/`MSI_DATA` on a
/// CONFIGURE command (§4.3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsiMessage {
    pub addr_lo: u32,
    pub addr_hi: u32,
    pub data: u32,
}

/// Decoded `MSI_CMD` values (§4.3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiCommand {
    Enable,
    Disable,
    Configure,
    Mask,
    Unmask,
    MapConfig,
    MapQueue,
}

impl MsiCommand {
    pub fn decode(value: u32) -> Option<MsiCommand> {
        use crate::regs::*;
        match value {
            MSI_CMD_ENABLE => Some(MsiCommand::Enable),
            MSI_CMD_DISABLE => Some(MsiCommand::Disable),
            MSI_CMD_CONFIGURE => Some(MsiCommand::Configure),
            MSI_CMD_MASK => Some(MsiCommand::Mask),
            MSI_CMD_UNMASK => Some(MsiCommand::Unmask),
            MSI_CMD_MAP_CONFIG => Some(MsiCommand::MapConfig),
            MSI_CMD_MAP_QUEUE => Some(MsiCommand::MapQueue),
            _ => None,
        }
    }
}

/// Outcome of processing an `MSI_CMD` write, consumed by the orchestrator
/// to drive GSI route refresh and deferred-delivery re-arm (§4.3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiEffect {
    None,
    /// CONFIGURE touched this vector; the route for it must be
    /// (re-)installed.
    RouteRefresh(u32),
    /// UNMASK cleared a pending bit; this vector must be delivered exactly
    /// once, right now.
    Redeliver(u32),
}

/// Per-device MSI vector table: message payloads, mask/pending bitmaps and
/// the vector-to-queue/config binding (§3, §4.3).
///
/// Vector 0 is conventionally the configuration vector; vectors 1..=N map
/// to queues 0..N-1 in non-sharing mode, or are bound explicitly via
/// MAP_CONFIG/MAP_QUEUE in sharing mode (latched at `init` from
/// compile-time — here, `DeviceConfig` — configuration and surfaced to the
/// guest as `MSI_STATE`'s `SHARING` bit).
#[derive(Debug)]
pub struct MsiTable {
    sharing: bool,
    enabled: bool,
    vec_sel: u32,
    vq_vector: [u32; MAX_VQ],
    config_vector: u32,
    msi_msg: [MsiMessage; MAX_VQ + 1],
    mba: u32,
    pba: u32,
    pending_addr_lo: u32,
    pending_addr_hi: u32,
    pending_data: u32,
}

impl MsiTable {
    pub fn new(sharing: bool) -> Self {
        MsiTable {
            sharing,
            enabled: false,
            vec_sel: 0,
            vq_vector: [MSI_NO_VECTOR; MAX_VQ],
            config_vector: MSI_NO_VECTOR,
            msi_msg: [MsiMessage::default(); MAX_VQ + 1],
            mba: 0,
            pba: 0,
            pending_addr_lo: 0,
            pending_addr_hi: 0,
            pending_data: 0,
        }
    }

    pub fn is_sharing(&self) -> bool {
        self.sharing
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn vq_vector(&self, vq: usize) -> u32 {
        self.vq_vector.get(vq).copied().unwrap_or(MSI_NO_VECTOR)
    }

    pub fn config_vector(&self) -> u32 {
        self.config_vector
    }

    /// Reverse lookup: which queue, if any, `vector` is currently bound to.
    /// Used by the orchestrator to tell the device back-end which GSI a
    /// queue's interrupt path now routes through (§4.9 `notify_vq_gsi`).
    pub fn vq_for_vector(&self, vector: u32) -> Option<u32> {
        self.vq_vector
            .iter()
            .position(|&v| v == vector)
            .map(|i| i as u32)
    }

    pub fn message(&self, vector: u32) -> Option<MsiMessage> {
        self.msi_msg.get(vector as usize).copied()
    }

    pub fn pba(&self) -> u32 {
        self.pba
    }

    pub fn mba(&self) -> u32 {
        self.mba
    }

    pub fn set_vec_sel(&mut self, sel: u32) {
        self.vec_sel = sel;
    }

    pub fn stage_addr_lo(&mut self, v: u32) {
        self.pending_addr_lo = v;
    }

    pub fn stage_addr_hi(&mut self, v: u32) {
        self.pending_addr_hi = v;
    }

    pub fn stage_data(&mut self, v: u32) {
        self.pending_data = v;
    }

    pub fn reset(&mut self) {
        self.enabled = false;
        self.vq_vector = [MSI_NO_VECTOR; MAX_VQ];
        self.config_vector = MSI_NO_VECTOR;
        self.mba = 0;
        self.pba = 0;
    }

    /// Records a MAP_QUEUE binding made in sharing mode (§4.3).
    pub fn map_queue(&mut self, queue_sel: usize) {
        if self.sharing {
            if let Some(slot) = self.vq_vector.get_mut(queue_sel) {
                *slot = self.vec_sel;
            }
        }
    }

    /// Records a MAP_CONFIG binding made in sharing mode (§4.3).
    pub fn map_config(&mut self) {
        if self.sharing {
            self.config_vector = self.vec_sel;
        }
    }

    /// Applies one decoded `MSI_CMD`, returning what the orchestrator must
    /// do as a result.
    pub fn apply(&mut self, cmd: MsiCommand) -> MsiEffect {
        match cmd {
            MsiCommand::Enable => {
                self.enabled = true;
                MsiEffect::None
            }
            MsiCommand::Disable => {
                self.enabled = false;
                MsiEffect::None
            }
            MsiCommand::Configure => {
                let vector = self.vec_sel;
                if let Some(slot) = self.msi_msg.get_mut(vector as usize) {
                    *slot = MsiMessage {
                        addr_lo: self.pending_addr_lo,
                        addr_hi: self.pending_addr_hi,
                        data: self.pending_data,
                    };
                }
                if !self.sharing {
                    self.auto_bind_non_sharing(vector);
                }
                MsiEffect::RouteRefresh(vector)
            }
            MsiCommand::Mask => {
                self.mba |= 1 << self.vec_sel;
                MsiEffect::None
            }
            MsiCommand::Unmask => {
                let bit = 1 << self.vec_sel;
                self.mba &= !bit;
                if self.pba & bit != 0 {
                    self.pba &= !bit;
                    MsiEffect::Redeliver(self.vec_sel)
                } else {
                    MsiEffect::None
                }
            }
            MsiCommand::MapConfig => {
                self.map_config();
                MsiEffect::None
            }
            MsiCommand::MapQueue => {
                // queue_sel is tracked by the caller (it is a transport,
                // not an MSI, register); binding happens through
                // `map_queue` directly.
                MsiEffect::None
            }
        }
    }

    fn auto_bind_non_sharing(&mut self, vector: u32) {
        if vector == 0 {
            if self.config_vector == MSI_NO_VECTOR {
                self.config_vector = 0;
            }
            return;
        }
        let queue = (vector - 1) as usize;
        if let Some(slot) = self.vq_vector.get_mut(queue) {
            if *slot == MSI_NO_VECTOR {
                *slot = vector;
            }
        }
    }

    /// Marks `vector` pending without injecting it (the MASK branch of
    /// §4.4's delivery algorithm).
    pub fn defer(&mut self, vector: u32) {
        self.pba |= 1 << vector;
    }

    pub fn is_masked(&self, vector: u32) -> bool {
        (self.mba >> vector) & 1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_in_non_sharing_mode_auto_binds_vectors() {
        let mut table = MsiTable::new(false);
        table.set_vec_sel(1);
        table.stage_addr_lo(0xAAAA);
        table.stage_addr_hi(0xBBBB);
        table.stage_data(0xCCCC);
        let effect = table.apply(MsiCommand::Configure);
        assert_eq!(effect, MsiEffect::RouteRefresh(1));
        assert_eq!(table.vq_vector(0), 1);
        assert_eq!(
            table.message(1).unwrap(),
            MsiMessage {
                addr_lo: 0xAAAA,
                addr_hi: 0xBBBB,
                data: 0xCCCC
            }
        );
    }

    #[test]
    fn mask_then_three_signals_defer_and_unmask_redelivers_once() {
        let mut table = MsiTable::new(false);
        table.set_vec_sel(1);
        table.apply(MsiCommand::Mask);
        assert!(table.is_masked(1));

        for _ in 0..3 {
            table.defer(1);
        }
        assert_eq!(table.pba() & (1 << 1), 1 << 1);

        let effect = table.apply(MsiCommand::Unmask);
        assert_eq!(effect, MsiEffect::Redeliver(1));
        assert_eq!(table.pba() & (1 << 1), 0);
    }

    #[test]
    fn disable_clears_enabled_flag() {
        let mut table = MsiTable::new(false);
        table.apply(MsiCommand::Enable);
        assert!(table.is_enabled());
        table.apply(MsiCommand::Disable);
        assert!(!table.is_enabled());
    }

    #[test]
    fn sharing_mode_binds_only_through_map_commands() {
        let mut table = MsiTable::new(true);
        table.set_vec_sel(3);
        table.apply(MsiCommand::Configure);
        // no auto-bind in sharing mode
        assert_eq!(table.vq_vector(2), MSI_NO_VECTOR);
        assert_eq!(table.config_vector(), MSI_NO_VECTOR);

        table.map_queue(2);
        assert_eq!(table.vq_vector(2), 3);
        table.map_config();
        assert_eq!(table.config_vector(), 3);
    }
}
