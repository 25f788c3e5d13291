//! Interface mapper: alternate settings exposed to the host.
//!
//! Every partition with a storage target gets one alternate setting, in
//! phase id order, followed by the virtual channels. Before a layout is
//! known a single `FlashLayout` setting backed by RAM replaces the
//! partitions.


use tracing::debug;

use crate::device::{Device, ModelError};
use crate::layout::{HwPartition, PartitionDescriptor, Target};
use crate::protocol::constants::*;
use crate::state::Phase;

const SZ_1K: u64 = 1 << 10;
const SZ_1M: u64 = 1 << 20;
const SZ_1G: u64 = 1 << 30;

/// What an alternate setting reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltTarget {
    /// RAM buffer receiving the flash layout.
    Layout { address: u32, size: usize },
    /// Logical partition of a device partition table.
    Partition {
        target: Target,
        part_index: u32,
        addr: u64,
        size: u64,
    },
    /// Block range of the user area or of a hardware boot partition.
    Raw {
        target: Target,
        hw: Option<HwPartition>,
        addr: u64,
        blocks: u64,
        block_size: u64,
    },
    /// Command, OTP or PMIC channel serviced by the session itself.
    Virtual { phase: Phase, size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSetting {
    pub alt_id: u8,
    /// DFU interface class: `mmc`, `ram` or `virt`.
    pub interface: &'static str,
    pub devstr: String,
    /// DFU alt description string.
    pub descriptor: String,
    pub target: AltTarget,
    /// Arena index of the partition behind this setting.
    pub partition: Option<usize>,
}

impl AltSetting {
    pub fn is_virtual(&self) -> bool {
        matches!(self.target, AltTarget::Virtual { .. })
    }

    pub fn virtual_phase(&self) -> Option<Phase> {
        match self.target {
            AltTarget::Virtual { phase, .. } => Some(phase),
            _ => None,
        }
    }

    /// Bytes addressable through this setting.
    pub fn size(&self) -> u64 {
        match &self.target {
            AltTarget::Layout { size, .. } | AltTarget::Virtual { size, .. } => *size as u64,
            AltTarget::Partition { size, .. } => *size,
            AltTarget::Raw {
                blocks, block_size, ..
            } => blocks * block_size,
        }
    }
}

/// Board facts the mapper needs besides the partition model.
#[derive(Debug, Clone, Copy)]
pub struct AltConfig {
    pub load_address: u32,
    pub layout_size: usize,
    pub otp_size: Option<usize>,
    pub pmic: bool,
}

/// Rebuild the alternate settings, assigning `alt_id` on every partition.
pub fn build_alt_settings(
    parts: &mut [PartitionDescriptor],
    devices: &[Device],
    config: &AltConfig,
) -> Result<Vec<AltSetting>, ModelError> {
    let mut alts = Vec::new();

    for part in parts.iter_mut() {
        part.alt_id = None;
    }

    if parts.is_empty() {
        alts.push(AltSetting {
            alt_id: 0,
            interface: "ram",
            devstr: String::new(),
            descriptor: format!(
                "@FlashLayout/0x{:02x}/1*256Ke ram {:x} 40000",
                PHASE_FLASHLAYOUT, config.load_address
            ),
            target: AltTarget::Layout {
                address: config.load_address,
                size: config.layout_size,
            },
            partition: None,
        });
    } else {
        let mut order: Vec<usize> = (0..parts.len())
            .filter(|&i| parts[i].target != Target::None)
            .collect();
        order.sort_by_key(|&i| parts[i].id);

        for index in order {
            let alt_id = alts.len() as u8;
            let part = &mut parts[index];
            let device = part
                .device
                .and_then(|d| devices.get(d))
                .ok_or_else(|| ModelError::Unbound {
                    name: part.name.clone(),
                    id: part.id,
                })?;
            part.alt_id = Some(alt_id);
            alts.push(partition_alt(alt_id, index, part, device));
        }
    }

    let mut virt = |name: &str, phase: Phase, size: usize| {
        let alt_id = alts.len() as u8;
        alts.push(AltSetting {
            alt_id,
            interface: "virt",
            devstr: phase.id().to_string(),
            descriptor: format!("@{}/0x{:02x}/1*{}Be", name, phase.id(), size),
            target: AltTarget::Virtual { phase, size },
            partition: None,
        });
    };
    virt("virtual", Phase::CMD, CMD_SIZE);
    if let Some(otp_size) = config.otp_size {
        virt("OTP", Phase::OTP, otp_size);
    }
    if config.pmic {
        virt("PMIC", Phase::PMIC, PMIC_SIZE);
    }

    for alt in &alts {
        debug!(alt = alt.alt_id, interface = alt.interface, "{}", alt.descriptor);
    }
    Ok(alts)
}

fn partition_alt(
    alt_id: u8,
    index: usize,
    part: &PartitionDescriptor,
    device: &Device,
) -> AltSetting {
    // max 3 digits for the sector size
    let (size, multiplier) = if part.size > SZ_1G {
        (part.size / SZ_1G, 'G')
    } else if part.size > SZ_1M {
        (part.size / SZ_1M, 'M')
    } else if part.size > SZ_1K {
        (part.size / SZ_1K, 'K')
    } else {
        (part.size, 'B')
    };
    let access = if part.option.is_programmed() { 'e' } else { 'a' };

    let mut descriptor = format!(
        "@{}/0x{:02x}/1*{}{}{} ",
        part.name, part.id, size, multiplier, access
    );

    let block_size = device.block_size.max(1);
    let target = if part.is_raw_image() {
        let blocks = part.size / block_size;
        descriptor.push_str(&format!("raw 0x0 0x{:x}", blocks));
        AltTarget::Raw {
            target: part.target,
            hw: None,
            addr: 0,
            blocks,
            block_size,
        }
    } else if let Some(hw) = part.hw_partition() {
        let blocks = part.size / block_size;
        descriptor.push_str(&format!(
            "raw 0x{:x} 0x{:x} mmcpart {}",
            part.addr(),
            blocks,
            hw.index()
        ));
        AltTarget::Raw {
            target: part.target,
            hw: Some(hw),
            addr: part.addr(),
            blocks,
            block_size,
        }
    } else {
        let part_index = part.part_index.unwrap_or(0);
        descriptor.push_str(&format!(
            "part {} {}",
            part.target.dev_id(),
            part_index
        ));
        AltTarget::Partition {
            target: part.target,
            part_index,
            addr: part.addr(),
            size: part.size,
        }
    };

    AltSetting {
        alt_id,
        interface: "mmc",
        devstr: part.target.dev_id().to_string(),
        descriptor,
        target,
        partition: Some(index),
    }
}
