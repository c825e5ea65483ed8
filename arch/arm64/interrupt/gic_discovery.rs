//! GIC boot discovery
//!
//! Picks the interrupt controller out of the resources the boot code
//! collected from the device tree, validates and maps its register frames,
//! and registers the resulting driver as the process-wide GIC.
//!
//! ## Device tree binding
//!
//! ```text
//! interrupt-controller@2c001000 {
//!     compatible = "arm,cortex-a15-gic";
//!     #interrupt-cells = <3>;
//!     interrupt-controller;
//!     reg = <0x2c001000 0x1000>,   // GICD
//!           <0x2c002000 0x2000>,   // GICC
//!           <0x2c004000 0x2000>,   // GICH
//!           <0x2c006000 0x2000>;   // GICV
//!     interrupts = <1 9 0xf04>;    // maintenance PPI
//! };
//! ```
//!
//! Any missing or misaligned frame is fatal: [`gic_init`] panics with the
//! [`DiscoveryError`] diagnostic.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::arch::arm64::interrupt::gic::{register_gic_ops, GicContext, GIC_SPI_BASE, NR_GIC_SGI};
use crate::arch::arm64::interrupt::gic_v2::{GicV2, GicV2Config, GicV2Frames};
use crate::arch::arm64::interrupt::handlers::IrqFramework;
use crate::arch::arm64::interrupt::routing::IrqTrigger;
use crate::config::{GICD_FRAME_SIZE, PAGE_SIZE};
use crate::utils::is_aligned;
use crate::{Error, Result};

/// Compatible strings of the GICv2-class controllers the driver handles
pub const GICV2_COMPATIBLE: &[&str] = &[
    "arm,cortex-a15-gic",
    "arm,cortex-a7-gic",
    "arm,cortex-a9-gic",
    "arm,gic-400",
];

/// Size of the CPU interface frame: GICC_DIR lives in the second page
const GICC_FRAME_SIZE: u64 = 2 * PAGE_SIZE;
/// Size of the hypervisor interface frame
const GICH_FRAME_SIZE: u64 = PAGE_SIZE;

/// One `interrupt-controller` node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GicNode {
    pub compatible: &'static str,
    /// Distributor
    pub dbase: Option<u64>,
    /// CPU interface
    pub cbase: Option<u64>,
    /// Hypervisor interface
    pub hbase: Option<u64>,
    /// Virtual CPU interface
    pub vbase: Option<u64>,
    pub maintenance_irq: Option<u32>,
}

/// Controller resources collected by the boot code
#[derive(Debug, Clone, Default)]
pub struct GicResources {
    pub nodes: Vec<GicNode>,
    /// The platform aliases the second GICV page at 64K
    pub stride_64k: bool,
}

/// Register frame named in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GicFrame {
    Distributor,
    CpuInterface,
    HypInterface,
    VcpuInterface,
}

impl fmt::Display for GicFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GicFrame::Distributor => "distributor",
            GicFrame::CpuInterface => "CPU interface",
            GicFrame::HypInterface => "hypervisor interface",
            GicFrame::VcpuInterface => "virtual CPU interface",
        };
        f.write_str(name)
    }
}

/// Boot-fatal discovery failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryError {
    /// No node matches [`GICV2_COMPATIBLE`]
    NoController,
    MissingFrame(GicFrame),
    Misaligned(GicFrame, u64),
    MissingMaintenanceIrq,
    /// Maintenance interrupt is not a PPI
    BadMaintenanceIrq(u32),
    MapFailed(GicFrame, u64),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::NoController => write!(f, "GIC: no compatible interrupt controller"),
            DiscoveryError::MissingFrame(frame) => write!(f, "GIC: {} address missing", frame),
            DiscoveryError::Misaligned(frame, addr) => {
                write!(f, "GIC: {} address {:#x} not page aligned", frame, addr)
            }
            DiscoveryError::MissingMaintenanceIrq => {
                write!(f, "GIC: maintenance interrupt missing")
            }
            DiscoveryError::BadMaintenanceIrq(irq) => {
                write!(f, "GIC: maintenance interrupt {} is not a PPI", irq)
            }
            DiscoveryError::MapFailed(frame, addr) => {
                write!(f, "GIC: failed to map {} at {:#x}", frame, addr)
            }
        }
    }
}

/// Device mapping of physical register frames into the hypervisor
pub trait IoRemap {
    /// Map `size` bytes at `paddr` as device memory for the rest of the
    /// program; `None` when the mapping cannot be made
    fn ioremap(&self, paddr: u64, size: u64) -> Option<usize>;
}

fn required(frame: GicFrame, addr: Option<u64>) -> core::result::Result<u64, DiscoveryError> {
    let addr = addr.ok_or(DiscoveryError::MissingFrame(frame))?;
    if !is_aligned(addr, PAGE_SIZE) {
        return Err(DiscoveryError::Misaligned(frame, addr));
    }
    Ok(addr)
}

fn map(
    remap: &dyn IoRemap,
    frame: GicFrame,
    addr: u64,
    size: u64,
) -> core::result::Result<usize, DiscoveryError> {
    remap
        .ioremap(addr, size)
        .ok_or(DiscoveryError::MapFailed(frame, addr))
}

/// Find and validate the controller node
pub fn probe(res: &GicResources) -> core::result::Result<(&GicNode, [u64; 4], u32), DiscoveryError> {
    let node = res
        .nodes
        .iter()
        .find(|n| GICV2_COMPATIBLE.contains(&n.compatible))
        .ok_or(DiscoveryError::NoController)?;

    let bases = [
        required(GicFrame::Distributor, node.dbase)?,
        required(GicFrame::CpuInterface, node.cbase)?,
        required(GicFrame::HypInterface, node.hbase)?,
        required(GicFrame::VcpuInterface, node.vbase)?,
    ];

    let irq = node
        .maintenance_irq
        .ok_or(DiscoveryError::MissingMaintenanceIrq)?;
    if !(NR_GIC_SGI..GIC_SPI_BASE).contains(&irq) {
        return Err(DiscoveryError::BadMaintenanceIrq(irq));
    }

    Ok((node, bases, irq))
}

/// Probe, map and construct the GICv2 driver
pub fn create_gic_v2(
    res: &GicResources,
    remap: &dyn IoRemap,
) -> core::result::Result<&'static GicV2, DiscoveryError> {
    let (node, [dbase, cbase, hbase, vbase], maintenance_irq) = probe(res)?;
    log::info!("GIC: found {} node", node.compatible);

    let frames = GicV2Frames {
        dist: map(remap, GicFrame::Distributor, dbase, GICD_FRAME_SIZE)?,
        cpu: map(remap, GicFrame::CpuInterface, cbase, GICC_FRAME_SIZE)?,
        hyp: map(remap, GicFrame::HypInterface, hbase, GICH_FRAME_SIZE)?,
    };
    let config = GicV2Config {
        frames,
        dbase,
        cbase,
        vbase,
        maintenance_irq,
        stride_64k: res.stride_64k,
    };

    // SAFETY: every frame was mapped as device memory by `remap` and is
    // never unmapped.
    let gic = unsafe { GicV2::new(&config) };
    Ok(Box::leak(Box::new(gic)))
}

/// Boot-CPU controller initialization
///
/// Discovers and initializes the GICv2, registers it as the process-wide
/// controller for `nr_cpus` CPUs and requests the maintenance interrupt.
/// Any failure halts the boot.
pub fn gic_init(
    res: &GicResources,
    remap: &dyn IoRemap,
    fw: &dyn IrqFramework,
    nr_cpus: usize,
) -> &'static GicContext {
    let gic = match create_gic_v2(res, remap) {
        Ok(gic) => gic,
        Err(err) => panic!("{}", err),
    };
    gic.init();

    let ctx = register_gic_ops(gic, nr_cpus);
    if let Err(err) = ctx.request_maintenance_irq(fw) {
        panic!("GIC: cannot request maintenance interrupt: {}", err);
    }
    ctx
}

/// Interrupt specifier translated to a GIC line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqSpec {
    pub irq: u32,
    /// `None` when the flags cell leaves the sense unspecified
    pub trigger: Option<IrqTrigger>,
}

/// Device tree `IRQ_TYPE_*` sense bits
const IRQ_TYPE_EDGE_BOTH: u32 = 0x3;
const IRQ_TYPE_LEVEL_BOTH: u32 = 0xc;

/// Translate a three-cell interrupt specifier `<type number flags>`
///
/// Type 0 is an SPI (number + 32), type 1 a PPI (number + 16).
pub fn irq_xlate(intspec: &[u32]) -> Result<IrqSpec> {
    let &[kind, number, flags, ..] = intspec else {
        return Err(Error::InvalidArgument);
    };

    let irq = match kind {
        0 => number + GIC_SPI_BASE,
        1 => number + NR_GIC_SGI,
        _ => return Err(Error::InvalidArgument),
    };

    let trigger = if flags & IRQ_TYPE_LEVEL_BOTH != 0 {
        Some(IrqTrigger::Level)
    } else if flags & IRQ_TYPE_EDGE_BOTH != 0 {
        Some(IrqTrigger::Edge)
    } else {
        None
    };

    Ok(IrqSpec { irq, trigger })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::interrupt::gic::GicHwOps;
    use alloc::vec;
    use test_case::test_case;

    fn node() -> GicNode {
        GicNode {
            compatible: "arm,cortex-a15-gic",
            dbase: Some(0x2c00_1000),
            cbase: Some(0x2c00_2000),
            hbase: Some(0x2c00_4000),
            vbase: Some(0x2c00_6000),
            maintenance_irq: Some(25),
        }
    }

    fn resources(node: GicNode) -> GicResources {
        GicResources {
            nodes: vec![node],
            stride_64k: false,
        }
    }

    /// Backs each mapping with zeroed heap memory
    struct HeapRemap;

    impl IoRemap for HeapRemap {
        fn ioremap(&self, _paddr: u64, size: u64) -> Option<usize> {
            let words = vec![0u32; size as usize / 4].into_boxed_slice();
            let base = Box::leak(words).as_mut_ptr() as usize;
            Some(base)
        }
    }

    struct NoRemap;

    impl IoRemap for NoRemap {
        fn ioremap(&self, _paddr: u64, _size: u64) -> Option<usize> {
            None
        }
    }

    #[test]
    fn test_probe_skips_unknown_nodes() {
        let mut res = resources(node());
        res.nodes.insert(
            0,
            GicNode {
                compatible: "arm,gic-v3",
                ..GicNode::default()
            },
        );
        let (found, bases, irq) = probe(&res).unwrap();
        assert_eq!(found.compatible, "arm,cortex-a15-gic");
        assert_eq!(bases, [0x2c00_1000, 0x2c00_2000, 0x2c00_4000, 0x2c00_6000]);
        assert_eq!(irq, 25);
    }

    #[test]
    fn test_probe_errors() {
        assert_eq!(
            probe(&GicResources::default()).unwrap_err(),
            DiscoveryError::NoController
        );

        let mut n = node();
        n.hbase = None;
        assert_eq!(
            probe(&resources(n)).unwrap_err(),
            DiscoveryError::MissingFrame(GicFrame::HypInterface)
        );

        let mut n = node();
        n.vbase = Some(0x2c00_6800);
        assert_eq!(
            probe(&resources(n)).unwrap_err(),
            DiscoveryError::Misaligned(GicFrame::VcpuInterface, 0x2c00_6800)
        );

        let mut n = node();
        n.maintenance_irq = Some(40);
        assert_eq!(
            probe(&resources(n)).unwrap_err(),
            DiscoveryError::BadMaintenanceIrq(40)
        );
    }

    #[test]
    fn test_error_display() {
        let err = DiscoveryError::Misaligned(GicFrame::Distributor, 0x1234);
        assert_eq!(
            alloc::format!("{}", err),
            "GIC: distributor address 0x1234 not page aligned"
        );
    }

    #[test]
    fn test_create_reads_geometry() {
        let gic = create_gic_v2(&resources(node()), &HeapRemap).unwrap();
        let info = gic.info();
        // Zeroed frames: one rank of lines, one list register
        assert_eq!(info.nr_lines, 32);
        assert_eq!(info.nr_lrs, 1);
        assert_eq!((info.dbase, info.cbase), (0x2c00_1000, 0x2c00_2000));
        assert_eq!(info.maintenance_irq, 25);
    }

    #[test]
    fn test_create_map_failure() {
        let err = create_gic_v2(&resources(node()), &NoRemap).err();
        assert_eq!(err, Some(DiscoveryError::MapFailed(GicFrame::Distributor, 0x2c00_1000)));
    }

    #[test_case(&[0, 10, 4], 42, Some(IrqTrigger::Level); "spi level high")]
    #[test_case(&[1, 9, 0xf04], 25, Some(IrqTrigger::Level); "ppi with cpu mask")]
    #[test_case(&[0, 3, 1], 35, Some(IrqTrigger::Edge); "spi rising edge")]
    #[test_case(&[1, 14, 0], 30, None; "ppi no sense")]
    fn test_irq_xlate(spec: &[u32], irq: u32, trigger: Option<IrqTrigger>) {
        assert_eq!(irq_xlate(spec), Ok(IrqSpec { irq, trigger }));
    }

    #[test]
    fn test_irq_xlate_rejects_malformed() {
        assert_eq!(irq_xlate(&[0, 10]), Err(Error::InvalidArgument));
        assert_eq!(irq_xlate(&[2, 10, 4]), Err(Error::InvalidArgument));
    }
}
