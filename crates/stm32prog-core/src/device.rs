//! Partition/device model builder.
//!
//! Groups the parsed partitions by storage device, orders each device by
//! address, resolves partition sizes and validates the resulting geometry
//! against what the driver reports.

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::backend::{BackendError, BlockDevice};
use crate::layout::{PartAddress, PartitionDescriptor, Target};
use crate::protocol::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Layout: selected none phase = 0x{id:x} for part {name}")]
    SelectedWithoutTarget { name: String, id: u8 },

    #[error("Layout: invalid phase = 0x{id:x} for part {name}")]
    InvalidPhase { name: String, id: u8 },

    #[error("Layout: duplicated phase 0x{id:x} for part {first} and {second}")]
    DuplicatePhase {
        id: u8,
        first: String,
        second: String,
    },

    #[error("Layout: too many device")]
    TooManyDevices,

    #[error("{target} device not available: {source}")]
    DeviceUnavailable {
        target: Target,
        source: BackendError,
    },

    #[error("{name} (0x{id:x}): same address : 0x{addr:x} == {next} (0x{next_id:x}): 0x{next_addr:x}")]
    SameAddress {
        name: String,
        id: u8,
        addr: u64,
        next: String,
        next_id: u8,
        next_addr: u64,
    },

    #[error("{name} (0x{id:x}): invalid address 0x{addr:x} (max=0x{max:x})")]
    AddressAboveEnd {
        name: String,
        id: u8,
        addr: u64,
        max: u64,
    },

    #[error("{name} (0x{id:x}): invalid address 0x{addr:x} (min=0x{min:x})")]
    AddressBelowStart {
        name: String,
        id: u8,
        addr: u64,
        min: u64,
    },

    #[error("{name} (0x{id:x}): not aligned address : 0x{addr:x} on erase size 0x{erase_size:x}")]
    NotAligned {
        name: String,
        id: u8,
        addr: u64,
        erase_size: u64,
    },

    #[error("{name} (0x{id:x}): {source}")]
    MissingPartition {
        name: String,
        id: u8,
        source: BackendError,
    },

    #[error("{name} (0x{id:x}): Bad address for partition {index} ({existing}) = 0x{addr:x} <> 0x{expected:x} expected")]
    BadAddress {
        name: String,
        id: u8,
        index: u32,
        existing: String,
        addr: u64,
        expected: u64,
    },

    #[error("{name} (0x{id:x}): Bad size for partition {index} ({existing}) at 0x{addr:x} = 0x{size:x} <> 0x{expected:x} expected")]
    BadSize {
        name: String,
        id: u8,
        index: u32,
        existing: String,
        addr: u64,
        size: u64,
        expected: u64,
    },

    #[error("GPT partitionning fail: {source}")]
    Commit { source: BackendError },

    #[error("{name} (0x{id:x}): erase failed: {source}")]
    Erase {
        name: String,
        id: u8,
        source: BackendError,
    },

    #[error("{name} (0x{id:x}): partition not bound to a device")]
    Unbound { name: String, id: u8 },
}

/// One storage device referenced by the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub target: Target,
    pub erase_size: u64,
    pub block_size: u64,
    pub capacity: u64,
    pub boot_size: u64,
    /// First usable byte after the reserved head.
    pub first_addr: u64,
    /// End of the usable range before the reserved tail.
    pub last_addr: u64,
    /// Every partition of the device is selected: the table is rewritten.
    pub full_update: bool,
    /// Arena indices, in address order once initialized.
    pub parts: Vec<usize>,
}

impl Device {
    fn new(target: Target) -> Self {
        Self {
            target,
            erase_size: 0,
            block_size: 0,
            capacity: 0,
            boot_size: 0,
            first_addr: 0,
            last_addr: 0,
            full_update: true,
            parts: Vec::new(),
        }
    }
}

/// Group partitions by device and validate phase ids.
pub fn group_partitions(parts: &mut [PartitionDescriptor]) -> Result<Vec<Device>, ModelError> {
    let mut devices: Vec<Device> = Vec::new();

    for i in 0..parts.len() {
        parts[i].alt_id = None;
        parts[i].device = None;
        parts[i].part_index = None;

        let part = &parts[i];
        // skip partition with IP="none"
        if part.target == Target::None {
            if part.option.is_select() {
                return Err(ModelError::SelectedWithoutTarget {
                    name: part.name.clone(),
                    id: part.id,
                });
            }
            continue;
        }
        if u16::from(part.id) == PHASE_FLASHLAYOUT || u16::from(part.id) > PHASE_LAST_USER {
            return Err(ModelError::InvalidPhase {
                name: part.name.clone(),
                id: part.id,
            });
        }
        if let Some(other) = parts[i + 1..].iter().find(|p| p.id == part.id) {
            return Err(ModelError::DuplicatePhase {
                id: part.id,
                first: part.name.clone(),
                second: other.name.clone(),
            });
        }

        let index = match devices.iter().position(|d| d.target == part.target) {
            Some(index) => index,
            None => {
                if devices.len() == STM32PROG_MAX_DEV {
                    return Err(ModelError::TooManyDevices);
                }
                devices.push(Device::new(part.target));
                devices.len() - 1
            }
        };
        let device = &mut devices[index];
        if !part.option.is_select() {
            device.full_update = false;
        }
        device.parts.push(i);
        parts[i].device = Some(index);
    }
    Ok(devices)
}

/// Probe one device, then order, size and check its partitions.
#[instrument(level = "debug", skip_all, fields(target = %device.target))]
pub fn init_device<B: BlockDevice + ?Sized>(
    device: &mut Device,
    parts: &mut [PartitionDescriptor],
    backend: &mut B,
) -> Result<(), ModelError> {
    let geometry = backend
        .geometry(device.target)
        .map_err(|source| ModelError::DeviceUnavailable {
            target: device.target,
            source,
        })?;

    device.block_size = geometry.block_size;
    device.capacity = geometry.capacity();
    device.boot_size = geometry.boot_size;
    device.erase_size = geometry.erase_size();
    // reserve a full erase group for each GPT header
    if geometry.erase_group_blocks > GPT_HEADER_SZ {
        device.first_addr = device.erase_size;
        device.last_addr =
            geometry.blocks.saturating_sub(geometry.erase_group_blocks) * geometry.block_size;
    } else {
        device.first_addr = GPT_HEADER_SZ * geometry.block_size;
        device.last_addr =
            geometry.blocks.saturating_sub(GPT_HEADER_SZ + 1) * geometry.block_size;
    }
    debug!(
        blocks = geometry.blocks,
        block_size = geometry.block_size,
        first = %format!("0x{:x}", device.first_addr),
        last = %format!("0x{:x}", device.last_addr),
        erase_size = %format!("0x{:x}", device.erase_size),
        full_update = device.full_update,
        "Device geometry"
    );

    // a raw image covers the whole device from address 0
    for &i in &device.parts {
        if parts[i].is_raw_image() {
            parts[i].address = PartAddress::Offset(0);
        }
    }

    // boot partitions first, then everything else by address
    device.parts.sort_by_key(|&i| {
        let rank = parts[i].hw_partition().map_or(u8::MAX, |hw| hw.index());
        (rank, parts[i].addr())
    });

    let mut part_index = 1;
    for (pos, &i) in device.parts.iter().enumerate() {
        if parts[i].is_raw_image() {
            parts[i].size = device.capacity;
            debug!(part = %parts[i], size = %format!("0x{:x}", parts[i].size), "Raw image");
            continue;
        }

        if parts[i].is_boot_partition() {
            parts[i].size = device.boot_size;
        } else {
            let next = device.parts[pos + 1..]
                .iter()
                .copied()
                .find(|&n| parts[n].is_logical());
            let part = &parts[i];
            let size = match next {
                Some(n) => {
                    let next = &parts[n];
                    if part.addr() >= next.addr() {
                        return Err(ModelError::SameAddress {
                            name: part.name.clone(),
                            id: part.id,
                            addr: part.addr(),
                            next: next.name.clone(),
                            next_id: next.id,
                            next_addr: next.addr(),
                        });
                    }
                    next.addr() - part.addr()
                }
                // last partition: size to the end of the device
                None => {
                    if part.addr() > device.last_addr {
                        return Err(ModelError::AddressAboveEnd {
                            name: part.name.clone(),
                            id: part.id,
                            addr: part.addr(),
                            max: device.last_addr,
                        });
                    }
                    device.last_addr - part.addr()
                }
            };
            if part.addr() < device.first_addr {
                return Err(ModelError::AddressBelowStart {
                    name: part.name.clone(),
                    id: part.id,
                    addr: part.addr(),
                    min: device.first_addr,
                });
            }
            parts[i].size = size;
            parts[i].part_index = Some(part_index);
            part_index += 1;
        }

        let part = &parts[i];
        if device.erase_size != 0 && part.addr() % device.erase_size != 0 {
            return Err(ModelError::NotAligned {
                name: part.name.clone(),
                id: part.id,
                addr: part.addr(),
                erase_size: device.erase_size,
            });
        }
        debug!(
            part = %part,
            index = ?part.part_index,
            addr = %format!("0x{:x}", part.addr()),
            size = %format!("0x{:x}", part.size),
            "Partition"
        );

        // the table is only checked for partial update, it is rewritten otherwise
        if device.full_update || part.is_boot_partition() {
            continue;
        }
        check_existing(part, backend)?;
    }
    Ok(())
}

fn check_existing<B: BlockDevice + ?Sized>(
    part: &PartitionDescriptor,
    backend: &mut B,
) -> Result<(), ModelError> {
    let index = part.part_index.unwrap_or(0);
    let info = backend
        .partition_info(part.target, index)
        .map_err(|source| ModelError::MissingPartition {
            name: part.name.clone(),
            id: part.id,
            source,
        })?;
    if part.addr() != info.start {
        return Err(ModelError::BadAddress {
            name: part.name.clone(),
            id: part.id,
            index,
            existing: info.name,
            addr: part.addr(),
            expected: info.start,
        });
    }
    if part.size != info.size {
        return Err(ModelError::BadSize {
            name: part.name.clone(),
            id: part.id,
            index,
            existing: info.name,
            addr: part.addr(),
            size: part.size,
            expected: info.size,
        });
    }
    Ok(())
}

/// Group, probe and size every device of the layout.
pub fn build_devices<B: BlockDevice + ?Sized>(
    parts: &mut [PartitionDescriptor],
    backend: &mut B,
) -> Result<Vec<Device>, ModelError> {
    let mut devices = group_partitions(parts)?;
    for device in devices.iter_mut() {
        init_device(device, parts, backend)?;
    }
    Ok(devices)
}

/// Erase a selected partition marked with the `D` option.
pub fn delete_partition<B: BlockDevice + ?Sized>(
    part: &PartitionDescriptor,
    backend: &mut B,
) -> Result<(), ModelError> {
    info!(part = %part, target = %part.target, "Erasing");
    backend
        .erase(part.target, part.hw_partition(), part.addr(), part.size)
        .map_err(|source| ModelError::Erase {
            name: part.name.clone(),
            id: part.id,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlockGeometry, MemoryBoard, PartitionTable};
    use crate::layout::parse_flash_layout;

    const BLOCKS: u64 = 0x10_0000; // 512 MiB of 512-byte blocks

    fn board() -> MemoryBoard {
        let mut board = MemoryBoard::new();
        board.add_mmc(
            0,
            BlockGeometry {
                block_size: 512,
                blocks: BLOCKS,
                erase_group_blocks: 1,
                boot_size: 0x8_0000,
            },
        );
        board.add_mmc(
            1,
            BlockGeometry {
                block_size: 512,
                blocks: BLOCKS,
                erase_group_blocks: 1024,
                boot_size: 0x40_0000,
            },
        );
        board.add_mmc(
            2,
            BlockGeometry {
                block_size: 256,
                blocks: BLOCKS,
                erase_group_blocks: 64,
                boot_size: 0,
            },
        );
        board
    }

    fn build(text: &str, board: &mut MemoryBoard) -> Result<(Vec<PartitionDescriptor>, Vec<Device>), ModelError> {
        let mut parts = parse_flash_layout(text.as_bytes()).unwrap();
        let devices = build_devices(&mut parts, board)?;
        Ok((parts, devices))
    }

    #[test]
    fn test_two_partitions_same_device() {
        let (parts, devices) = build(
            "P\t0x01\ta\tBinary\tmmc2\t0x4000\n\
             P\t0x02\tb\tBinary\tmmc2\t0x8000\n",
            &mut board(),
        )
        .unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.first_addr, 0x4000);
        assert_eq!(device.last_addr, (BLOCKS - 64) * 256);
        assert_eq!(parts[0].size, 0x4000);
        assert_eq!(parts[1].size, device.last_addr - 0x8000);
        assert_eq!(parts[0].part_index, Some(1));
        assert_eq!(parts[1].part_index, Some(2));
    }

    #[test]
    fn test_ordering_and_boot_partitions() {
        let (parts, devices) = build(
            "P\t0x10\trootfs\tFileSystem\tmmc1\t0x00800000\n\
             P\t0x01\tfsbl1\tBinary\tmmc1\tboot1\n\
             P\t0x02\tfsbl2\tBinary\tmmc1\tboot2\n\
             P\t0x03\tssbl\tBinary\tmmc1\t0x00080000\n",
            &mut board(),
        )
        .unwrap();
        let device = &devices[0];
        // large erase group: the whole group is reserved
        assert_eq!(device.erase_size, 512 * 1024);
        assert_eq!(device.first_addr, 512 * 1024);
        assert_eq!(device.last_addr, (BLOCKS - 1024) * 512);
        assert_eq!(device.parts, vec![1, 2, 3, 0]);

        assert_eq!(parts[1].size, 0x40_0000);
        assert_eq!(parts[1].part_index, None);
        assert_eq!(parts[3].size, 0x80_0000 - 0x8_0000);
        assert_eq!(parts[3].part_index, Some(1));
        assert_eq!(parts[0].part_index, Some(2));

        // address ascending and non-overlapping
        let logical: Vec<&PartitionDescriptor> = device
            .parts
            .iter()
            .map(|&i| &parts[i])
            .filter(|p| p.is_logical())
            .collect();
        for pair in logical.windows(2) {
            assert!(pair[0].addr() + pair[0].size <= pair[1].addr());
        }
    }

    #[test]
    fn test_small_erase_group_reserves_gpt_blocks() {
        let (_, devices) = build("P\t0x01\ta\tBinary\tmmc0\t0x4400\n", &mut board()).unwrap();
        assert_eq!(devices[0].first_addr, 34 * 512);
        assert_eq!(devices[0].last_addr, (BLOCKS - 35) * 512);
    }

    #[test]
    fn test_raw_image_takes_whole_device() {
        let (parts, _) = build(
            "P\t0x01\tdisk\tRawImage\tmmc0\t0x0\n\
             P\t0x02\tdata\tFileSystem\tmmc0\t0x4400\n",
            &mut board(),
        )
        .unwrap();
        assert_eq!(parts[0].size, BLOCKS * 512);
        assert_eq!(parts[0].part_index, None);
        assert_eq!(parts[1].part_index, Some(1));
    }

    #[test]
    fn test_raw_image_offset_ignored() {
        let mut b = board();
        let (parts, devices) = build(
            "PD\t0x01\tdisk\tRawImage\tmmc0\t0x100000\n",
            &mut b,
        )
        .unwrap();
        assert_eq!(parts[0].addr(), 0);
        assert_eq!(parts[0].size, devices[0].capacity);

        delete_partition(&parts[0], &mut b).unwrap();
        assert_eq!(b.erased(), &[(Target::Mmc(0), None, 0, BLOCKS * 512)]);
    }

    #[test]
    fn test_selected_none_rejected() {
        let err = build("P\t0x01\tdoc\tBinary\tnone\t0x0\n", &mut board()).unwrap_err();
        assert!(matches!(err, ModelError::SelectedWithoutTarget { id: 0x01, .. }));
        // unselected is only documentation
        let (parts, devices) = build(
            "-\t0x01\tdoc\tBinary\tnone\t0x0\nP\t0x02\ta\tBinary\tmmc0\t0x4400\n",
            &mut board(),
        )
        .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(parts[0].device, None);
    }

    #[test]
    fn test_structural_errors() {
        let mut b = board();
        assert!(matches!(
            build("P\t0x00\ta\tBinary\tmmc0\t0x4400\n", &mut b),
            Err(ModelError::InvalidPhase { id: 0, .. })
        ));
        assert!(matches!(
            build(
                "P\t0x01\ta\tBinary\tmmc0\t0x4400\nP\t0x01\tb\tBinary\tmmc0\t0x8000\n",
                &mut b
            ),
            Err(ModelError::DuplicatePhase { id: 1, .. })
        ));
        assert!(matches!(
            build(
                "P\t0x01\ta\tBinary\tmmc0\t0x8000\nP\t0x02\tb\tBinary\tmmc0\t0x8000\n",
                &mut b
            ),
            Err(ModelError::SameAddress { .. })
        ));
        assert!(matches!(
            build("P\t0x01\ta\tBinary\tmmc0\t0x200\n", &mut b),
            Err(ModelError::AddressBelowStart { min: 0x4400, .. })
        ));
        assert!(matches!(
            build("P\t0x01\ta\tBinary\tmmc0\t0x40000000\n", &mut b),
            Err(ModelError::AddressAboveEnd { .. })
        ));
        assert!(matches!(
            build("P\t0x01\ta\tBinary\tmmc1\t0x00090000\n", &mut b),
            Err(ModelError::NotAligned { erase_size: 0x80000, .. })
        ));
        assert!(matches!(
            build("P\t0x01\ta\tBinary\tmmc7\t0x4400\n", &mut b),
            Err(ModelError::DeviceUnavailable { .. })
        ));
    }

    #[test]
    fn test_too_many_devices() {
        let text: String = (0..6)
            .map(|i| format!("P\t{}\tp{}\tBinary\tmmc{}\t0x4400\n", i + 1, i, i))
            .collect();
        let mut parts = parse_flash_layout(text.as_bytes()).unwrap();
        assert_eq!(group_partitions(&mut parts), Err(ModelError::TooManyDevices));
    }

    #[test]
    fn test_partial_update_checks_existing_table() {
        let mut b = board();
        b.commit_table(
            Target::Mmc(0),
            "gpt write mmc 0 \"name=a,start=0x4400,size=0x3c00,type=linux;name=b,start=0x8000,size=0x1000,type=linux;\"",
        )
        .unwrap();

        // b is not selected: the device keeps its table
        let err = build(
            "P\t0x01\ta\tBinary\tmmc0\t0x4400\n-\t0x02\tb\tBinary\tmmc0\t0x8000\n",
            &mut b,
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::BadSize { index: 2, .. }));

        let err = build(
            "P\t0x01\ta\tBinary\tmmc0\t0x4600\n-\t0x02\tb\tBinary\tmmc0\t0x8000\n",
            &mut b,
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::BadAddress { index: 1, .. }));

        let mut fresh = board();
        let err = build(
            "P\t0x01\ta\tBinary\tmmc0\t0x4400\n-\t0x02\tb\tBinary\tmmc0\t0x8000\n",
            &mut fresh,
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::MissingPartition { .. }));
    }
}
