//! Device-tree fragment emission (C8, §4.6). Produces the data for one
//! `virtio,mmio` node per registered device; serializing it into a flat
//! device tree blob is the out-of-scope CLI/boot layer's job (§1, §B of
//! the expanded spec) — this module only ever produces plain data.

/// One `virtio@<addr>` device-tree node's worth of information (§4.6).
/// `addr` is the shared-memory shadow address in RSLD mode, or
/// `window_base` otherwise (§4.6: "In RSLD mode the address reported is
/// the shared-memory shadow address... not `window_base`").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtioMmioNode {
    pub addr: u64,
    pub size: u64,
    pub compatible: &'static str,
    pub dma_coherent: bool,
    pub irq: Vec<u32>,
}

impl VirtioMmioNode {
    pub fn new(addr: u64, size: u64, irq: Vec<u32>) -> Self {
        VirtioMmioNode {
            addr,
            size,
            compatible: "virtio,mmio",
            dma_coherent: true,
            irq,
        }
    }

    pub fn node_name(&self) -> String {
        format!("virtio@{:x}", self.addr)
    }
}

/// Architecture-provided callback producing the `interrupts` property for
/// a device's assigned IRQ line (§4.6: "an IRQ property filled in by an
/// architecture-provided callback").
pub trait IrqPropertyProvider {
    fn irq_property(&self, irq_line: u32) -> Vec<u32>;
}

/// Collects one node per registered device. The VM instance owns this as
/// a plain `Vec` (§9 "Global device list": "model as an owned collection
/// held by the VM, iterated at finalize time; avoid process-global
/// mutables").
#[derive(Debug, Default)]
pub struct DeviceTreeFragment {
    nodes: Vec<VirtioMmioNode>,
}

impl DeviceTreeFragment {
    pub fn new() -> Self {
        DeviceTreeFragment::default()
    }

    /// `addr` is the shadow address when RSLD is enabled for this device,
    /// otherwise `window_base` (§4.6).
    pub fn add_device(
        &mut self,
        addr: u64,
        size: u64,
        irq_line: u32,
        irq_props: &dyn IrqPropertyProvider,
    ) {
        self.nodes.push(VirtioMmioNode::new(
            addr,
            size,
            irq_props.irq_property(irq_line),
        ));
    }

    pub fn nodes(&self) -> &[VirtioMmioNode] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeIrqProps;
    impl IrqPropertyProvider for FakeIrqProps {
        fn irq_property(&self, irq_line: u32) -> Vec<u32> {
            vec![0, irq_line, 4]
        }
    }

    #[test]
    fn node_name_formats_as_virtio_at_hex_address() {
        let node = VirtioMmioNode::new(0x1000_0000, 0x200, vec![]);
        assert_eq!(node.node_name(), "virtio@10000000");
    }

    #[test]
    fn fragment_collects_one_node_per_device() {
        let mut frag = DeviceTreeFragment::new();
        frag.add_device(0x1000_0000, 0x200, 5, &FakeIrqProps);
        frag.add_device(0x1000_0200, 0x200, 6, &FakeIrqProps);
        assert_eq!(frag.nodes().len(), 2);
        assert_eq!(frag.nodes()[0].irq, vec![0, 5, 4]);
        assert!(frag.nodes()[0].dma_coherent);
        assert_eq!(frag.nodes()[1].compatible, "virtio,mmio");
    }
}
