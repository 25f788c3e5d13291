//! Partition table committer.
//!
//! Builds one `gpt write` command per fully updated device and hands it to
//! the partition-table service, then asks the block layer to reprobe.


use tracing::{debug, info};

use crate::backend::PartitionTable;
use crate::device::{Device, ModelError};
use crate::layout::{PartType, PartitionDescriptor};

/// Type GUID of firmware partitions.
pub const LINUX_RESERVED_UUID: &str = "8DA63339-0007-60C0-C436-083AC8230908";

/// Partition GUID given to the first `rootfs` of mmc0, mmc1 and mmc2.
pub const ROOTFS_UUID: [&str; 3] = [
    "E91C4E10-16E6-4C0E-BD0E-77BECF4A3582",
    "491F6117-415D-4F53-88C9-6E0DE54DEAC6",
    "FD58F1C7-BE0D-4338-88E9-AD8F050AEB18",
];

/// Command buffer size; partitions that no longer fit are skipped.
const GPT_COMMAND_MAX: usize = 8 * 1024;

/// Table definition for `device`, or `None` when it has no logical partition.
pub fn gpt_command(device: &Device, parts: &[PartitionDescriptor]) -> Option<String> {
    let mut command = String::new();
    let mut rootfs_found = false;

    for &i in &device.parts {
        let part = &parts[i];
        // skip eMMC boot partitions and raw images
        if !part.is_logical() {
            continue;
        }
        if command.len() + 100 > GPT_COMMAND_MAX {
            debug!(part = %part, "GPT command too long, partition skipped");
            continue;
        }
        if command.is_empty() {
            command.push_str(&format!("gpt write mmc {} \"", device.target.dev_id()));
        }
        command.push_str(&format!(
            "name={},start=0x{:x},size=0x{:x}",
            part.name,
            part.addr(),
            part.size
        ));
        let type_str = match part.part_type {
            PartType::Binary => LINUX_RESERVED_UUID,
            _ => "linux",
        };
        command.push_str(&format!(",type={}", type_str));
        if part.part_type == PartType::System {
            command.push_str(",bootable");
        }
        if !rootfs_found && part.name == "rootfs" {
            rootfs_found = true;
            if let Some(uuid) = ROOTFS_UUID.get(usize::from(part.target.dev_id())) {
                command.push_str(&format!(",uuid={}", uuid));
            }
        }
        command.push(';');
    }

    if command.is_empty() {
        None
    } else {
        command.push('"');
        Some(command)
    }
}

/// Commit the partition table of every fully updated device.
pub fn commit_partition_tables<B: PartitionTable + ?Sized>(
    devices: &[Device],
    parts: &[PartitionDescriptor],
    backend: &mut B,
) -> Result<(), ModelError> {
    for device in devices.iter().filter(|d| d.full_update) {
        info!(target = %device.target, "Creating partitions");
        if let Some(command) = gpt_command(device, parts) {
            debug!(cmd = %command, "GPT command");
            backend
                .commit_table(device.target, &command)
                .map_err(|source| ModelError::Commit { source })?;
        }
        backend
            .reprobe(device.target)
            .map_err(|source| ModelError::Commit { source })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlockGeometry, MemoryBoard};
    use crate::device::build_devices;
    use crate::layout::{Target, parse_flash_layout};

    fn board() -> MemoryBoard {
        let mut board = MemoryBoard::new();
        board.add_mmc(
            1,
            BlockGeometry {
                block_size: 512,
                blocks: 0x10_0000,
                erase_group_blocks: 1024,
                boot_size: 0x40_0000,
            },
        );
        board
    }

    const LAYOUT: &str = "P\t0x01\tfsbl1\tBinary\tmmc1\tboot1\n\
        P\t0x03\tssbl\tBinary\tmmc1\t0x00080000\n\
        P\t0x10\tbootfs\tSystem\tmmc1\t0x00100000\n\
        P\t0x11\trootfs\tFileSystem\tmmc1\t0x00200000\n";

    #[test]
    fn test_gpt_command() {
        let mut board = board();
        let mut parts = parse_flash_layout(LAYOUT.as_bytes()).unwrap();
        let devices = build_devices(&mut parts, &mut board).unwrap();
        let command = gpt_command(&devices[0], &parts).unwrap();
        let last = (0x10_0000u64 - 1024) * 512;
        let expected = format!(
            "gpt write mmc 1 \"\
             name=ssbl,start=0x80000,size=0x80000,type={};\
             name=bootfs,start=0x100000,size=0x100000,type=linux,bootable;\
             name=rootfs,start=0x200000,size=0x{:x},type=linux,uuid={};\"",
            LINUX_RESERVED_UUID,
            last - 0x20_0000,
            ROOTFS_UUID[1]
        );
        assert_eq!(command, expected);
    }

    #[test]
    fn test_commit_only_full_update() {
        let mut b = board();
        let mut parts = parse_flash_layout(LAYOUT.as_bytes()).unwrap();
        let devices = build_devices(&mut parts, &mut b).unwrap();
        commit_partition_tables(&devices, &parts, &mut b).unwrap();
        assert_eq!(b.committed_tables().len(), 1);
        assert_eq!(b.reprobes(), &[Target::Mmc(1)]);

        let mut b = board();
        let partial = LAYOUT.replace("P\t0x10", "-\t0x10");
        b.commit_table(
                Target::Mmc(1),
                "gpt write mmc 1 \"name=ssbl,start=0x80000,size=0x80000;\
                 name=bootfs,start=0x100000,size=0x100000;\
                 name=rootfs,start=0x200000,size=0x1fd80000;\"",
            )
            .unwrap();
        let mut parts = parse_flash_layout(partial.as_bytes()).unwrap();
        let devices = build_devices(&mut parts, &mut b).unwrap();
        assert!(!devices[0].full_update);
        commit_partition_tables(&devices, &parts, &mut b).unwrap();
        assert_eq!(b.committed_tables().len(), 1);
    }

    #[test]
    fn test_boot_only_device_has_no_table() {
        let mut board = board();
        let mut parts = parse_flash_layout(b"P\t0x01\tfsbl1\tBinary\tmmc1\tboot1\n").unwrap();
        let devices = build_devices(&mut parts, &mut board).unwrap();
        assert_eq!(gpt_command(&devices[0], &parts), None);
    }
}
