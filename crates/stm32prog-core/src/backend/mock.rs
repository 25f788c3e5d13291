//! In-memory board for tests and the simulated target.

use std::collections::BTreeMap;

use tracing::debug;

use super::traits::*;
use crate::alt::{AltSetting, AltTarget};
use crate::config::BoardConfig;
use crate::layout::parser::parse_address;
use crate::layout::{HwPartition, Target};

/// OTP or PMIC image held in memory.
#[derive(Debug, Clone)]
pub struct MemoryNvm {
    data: Vec<u8>,
    writes: usize,
}

impl MemoryNvm {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            writes: 0,
        }
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data, writes: 0 }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of committed images.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl NvmBackend for MemoryNvm {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn read_all(&mut self, buf: &mut [u8]) -> Result<(), BackendError> {
        let len = buf.len().min(self.data.len());
        buf[..len].copy_from_slice(&self.data[..len]);
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), BackendError> {
        let len = data.len().min(self.data.len());
        self.data[..len].copy_from_slice(&data[..len]);
        self.writes += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryMmc {
    geometry: Option<BlockGeometry>,
    user: Vec<u8>,
    boot: [Vec<u8>; 2],
    table: Vec<PartitionInfo>,
    boot_partition: Option<HwPartition>,
}

impl MemoryMmc {
    fn area(&mut self, hw: Option<HwPartition>) -> &mut Vec<u8> {
        match hw {
            None => &mut self.user,
            Some(HwPartition::Boot1) => &mut self.boot[0],
            Some(HwPartition::Boot2) => &mut self.boot[1],
        }
    }
}

/// Board whose storage, NVM and RAM are plain byte vectors.
///
/// Storage grows on demand; unwritten bytes read back as zero.
#[derive(Debug, Default)]
pub struct MemoryBoard {
    mmc: BTreeMap<u8, MemoryMmc>,
    ram_base: u32,
    ram: Vec<u8>,
    otp: Option<MemoryNvm>,
    pmic: Option<MemoryNvm>,
    committed: Vec<(Target, String)>,
    reprobes: Vec<Target>,
    erased: Vec<(Target, Option<HwPartition>, u64, u64)>,
    flushed: Vec<u8>,
    executed: Vec<u32>,
    delays: Vec<u32>,
    cancel: bool,
    fail_writes: bool,
}

impl MemoryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &BoardConfig) -> Self {
        let mut board = Self::new();
        for mmc in &config.mmc {
            board.add_mmc(
                mmc.dev_id,
                BlockGeometry {
                    block_size: mmc.block_size,
                    blocks: mmc.blocks,
                    erase_group_blocks: mmc.erase_group_blocks,
                    boot_size: mmc.boot_size,
                },
            );
        }
        if let Some(size) = config.otp_size {
            board.otp = Some(MemoryNvm::new(size));
        }
        if config.pmic {
            board.pmic = Some(MemoryNvm::new(crate::protocol::PMIC_SIZE));
        }
        board.ram_base = config.ram_base;
        board.ram = vec![0; config.ram_size];
        board
    }

    pub fn add_mmc(&mut self, dev_id: u8, geometry: BlockGeometry) {
        self.mmc.entry(dev_id).or_default().geometry = Some(geometry);
    }

    pub fn set_otp(&mut self, otp: MemoryNvm) {
        self.otp = Some(otp);
    }

    pub fn set_pmic(&mut self, pmic: MemoryNvm) {
        self.pmic = Some(pmic);
    }

    pub fn set_ram(&mut self, base: u32, data: Vec<u8>) {
        self.ram_base = base;
        self.ram = data;
    }

    pub fn set_cancel(&mut self, cancel: bool) {
        self.cancel = cancel;
    }

    /// Make every medium write fail.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn otp_image(&self) -> Option<&MemoryNvm> {
        self.otp.as_ref()
    }

    pub fn pmic_image(&self) -> Option<&MemoryNvm> {
        self.pmic.as_ref()
    }

    pub fn committed_tables(&self) -> &[(Target, String)] {
        &self.committed
    }

    pub fn reprobes(&self) -> &[Target] {
        &self.reprobes
    }

    pub fn erased(&self) -> &[(Target, Option<HwPartition>, u64, u64)] {
        &self.erased
    }

    pub fn flushed(&self) -> &[u8] {
        &self.flushed
    }

    pub fn executed(&self) -> &[u32] {
        &self.executed
    }

    pub fn delays(&self) -> &[u32] {
        &self.delays
    }

    pub fn boot_partition(&self, target: Target) -> Option<HwPartition> {
        self.mmc
            .get(&target.dev_id())
            .and_then(|mmc| mmc.boot_partition)
    }

    pub fn partition_table(&self, target: Target) -> &[PartitionInfo] {
        self.mmc
            .get(&target.dev_id())
            .map(|mmc| mmc.table.as_slice())
            .unwrap_or(&[])
    }

    /// Bytes of the user area (or a boot partition), zero filled.
    pub fn read_back(
        &self,
        target: Target,
        hw: Option<HwPartition>,
        offset: u64,
        len: usize,
    ) -> Vec<u8> {
        let mut out = vec![0; len];
        if let Some(mmc) = self.mmc.get(&target.dev_id()) {
            let area = match hw {
                None => &mmc.user,
                Some(HwPartition::Boot1) => &mmc.boot[0],
                Some(HwPartition::Boot2) => &mmc.boot[1],
            };
            copy_out(area, offset, &mut out);
        }
        out
    }

    fn mmc(&mut self, target: Target) -> Result<&mut MemoryMmc, BackendError> {
        match target {
            Target::Mmc(dev_id) => self
                .mmc
                .get_mut(&dev_id)
                .filter(|mmc| mmc.geometry.is_some())
                .ok_or(BackendError::DeviceNotFound(target)),
            Target::None => Err(BackendError::DeviceNotFound(target)),
        }
    }

    /// Storage area, offset and limit behind an alternate setting.
    fn resolve(
        alt: &AltSetting,
    ) -> Result<(Target, Option<HwPartition>, u64, u64), BackendError> {
        match &alt.target {
            AltTarget::Partition {
                target, addr, size, ..
            } => Ok((*target, None, *addr, *size)),
            AltTarget::Raw {
                target,
                hw,
                addr,
                blocks,
                block_size,
            } => Ok((*target, *hw, *addr, blocks * block_size)),
            AltTarget::Layout { .. } | AltTarget::Virtual { .. } => {
                Err(BackendError::Unsupported("medium access on this alternate"))
            }
        }
    }
}

fn copy_out(area: &[u8], offset: u64, out: &mut [u8]) {
    let start = (offset as usize).min(area.len());
    let end = (start + out.len()).min(area.len());
    out[..end - start].copy_from_slice(&area[start..end]);
}

fn parse_gpt_command(command: &str) -> Option<Vec<PartitionInfo>> {
    let (_, rest) = command.split_once('"')?;
    let body = rest.strip_suffix('"')?;
    let mut table = Vec::new();
    for entry in body.split(';').filter(|e| !e.is_empty()) {
        let mut name = None;
        let mut start = None;
        let mut size = None;
        for field in entry.split(',') {
            match field.split_once('=') {
                Some(("name", v)) => name = Some(v.to_string()),
                Some(("start", v)) => start = parse_address(v),
                Some(("size", v)) => size = parse_address(v),
                _ => {}
            }
        }
        table.push(PartitionInfo {
            name: name?,
            start: start?,
            size: size?,
        });
    }
    Some(table)
}

impl BlockDevice for MemoryBoard {
    fn geometry(&mut self, target: Target) -> Result<BlockGeometry, BackendError> {
        let mmc = self.mmc(target)?;
        mmc.geometry.ok_or(BackendError::DeviceNotFound(target))
    }

    fn partition_info(
        &mut self,
        target: Target,
        index: u32,
    ) -> Result<PartitionInfo, BackendError> {
        let mmc = self.mmc(target)?;
        index
            .checked_sub(1)
            .and_then(|i| mmc.table.get(i as usize))
            .cloned()
            .ok_or(BackendError::PartitionNotFound { target, index })
    }

    fn erase(
        &mut self,
        target: Target,
        hw: Option<HwPartition>,
        offset: u64,
        len: u64,
    ) -> Result<(), BackendError> {
        let area = self.mmc(target)?.area(hw);
        let start = (offset as usize).min(area.len());
        let end = ((offset + len) as usize).min(area.len());
        area[start..end].fill(0);
        self.erased.push((target, hw, offset, len));
        Ok(())
    }

    fn select_boot_partition(
        &mut self,
        target: Target,
        hw: HwPartition,
    ) -> Result<(), BackendError> {
        self.mmc(target)?.boot_partition = Some(hw);
        Ok(())
    }
}

impl PartitionTable for MemoryBoard {
    fn commit_table(&mut self, target: Target, command: &str) -> Result<(), BackendError> {
        let table = parse_gpt_command(command).ok_or_else(|| BackendError::Command {
            command: command.to_string(),
            reason: "malformed table".to_string(),
        })?;
        self.mmc(target)?.table = table;
        self.committed.push((target, command.to_string()));
        Ok(())
    }

    fn reprobe(&mut self, target: Target) -> Result<(), BackendError> {
        self.mmc(target)?;
        self.reprobes.push(target);
        Ok(())
    }
}

impl DfuMedium for MemoryBoard {
    fn medium_write(
        &mut self,
        alt: &AltSetting,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        if self.fail_writes {
            return Err(BackendError::Io {
                operation: "write",
                reason: "injected failure".to_string(),
            });
        }
        let (target, hw, base, limit) = Self::resolve(alt)?;
        let len = data.len() as u64;
        if offset + len > limit {
            return Err(BackendError::OutOfRange {
                offset,
                len,
                limit,
            });
        }
        let area = self.mmc(target)?.area(hw);
        let start = (base + offset) as usize;
        if area.len() < start + data.len() {
            area.resize(start + data.len(), 0);
        }
        area[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn medium_read(
        &mut self,
        alt: &AltSetting,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, BackendError> {
        let (target, hw, base, limit) = Self::resolve(alt)?;
        if offset > limit {
            return Err(BackendError::OutOfRange {
                offset,
                len: buf.len() as u64,
                limit,
            });
        }
        let len = buf.len().min((limit - offset) as usize);
        let area = self.mmc(target)?.area(hw);
        copy_out(area, base + offset, &mut buf[..len]);
        Ok(len)
    }

    fn medium_flush(&mut self, alt: &AltSetting) -> Result<(), BackendError> {
        self.flushed.push(alt.alt_id);
        Ok(())
    }
}

impl Platform for MemoryBoard {
    fn execute(&mut self, address: u32) -> Result<(), BackendError> {
        debug!(address = %format!("0x{:08x}", address), "Execute");
        self.executed.push(address);
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
    }

    fn cancel_requested(&mut self) -> bool {
        self.cancel
    }

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<(), BackendError> {
        let offset = u64::from(address.wrapping_sub(self.ram_base));
        let limit = self.ram.len() as u64;
        if address < self.ram_base || offset + buf.len() as u64 > limit {
            return Err(BackendError::OutOfRange {
                offset,
                len: buf.len() as u64,
                limit,
            });
        }
        copy_out(&self.ram, offset, buf);
        Ok(())
    }
}

impl Board for MemoryBoard {
    fn otp(&mut self) -> Option<&mut dyn NvmBackend> {
        self.otp.as_mut().map(|otp| otp as &mut dyn NvmBackend)
    }

    fn pmic(&mut self) -> Option<&mut dyn NvmBackend> {
        self.pmic.as_mut().map(|pmic| pmic as &mut dyn NvmBackend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> BlockGeometry {
        BlockGeometry {
            block_size: 512,
            blocks: 0x1000,
            erase_group_blocks: 1,
            boot_size: 0x1000,
        }
    }

    fn raw_alt(hw: Option<HwPartition>) -> AltSetting {
        AltSetting {
            alt_id: 0,
            interface: "mmc",
            devstr: "0".to_string(),
            descriptor: String::new(),
            target: AltTarget::Raw {
                target: Target::Mmc(0),
                hw,
                addr: 0,
                blocks: 8,
                block_size: 512,
            },
            partition: None,
        }
    }

    #[test]
    fn test_medium_write_read() {
        let mut board = MemoryBoard::new();
        board.add_mmc(0, geometry());
        let alt = raw_alt(Some(HwPartition::Boot2));
        board.medium_write(&alt, 0x10, b"fsbl").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(board.medium_read(&alt, 0x0E, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"\0\0fsbl\0\0");
        assert_eq!(
            board.read_back(Target::Mmc(0), Some(HwPartition::Boot2), 0x10, 4),
            b"fsbl"
        );
        assert_eq!(board.read_back(Target::Mmc(0), None, 0x10, 4), vec![0; 4]);

        assert!(matches!(
            board.medium_write(&alt, 4094, b"xyz"),
            Err(BackendError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_commit_table_parsing() {
        let mut board = MemoryBoard::new();
        board.add_mmc(0, geometry());
        board
            .commit_table(
                Target::Mmc(0),
                "gpt write mmc 0 \"name=a,start=0x4400,size=0x1000,type=linux;name=b,start=0x5400,size=0x2000,type=linux,bootable;\"",
            )
            .unwrap();
        let info = board.partition_info(Target::Mmc(0), 2).unwrap();
        assert_eq!(info.name, "b");
        assert_eq!(info.start, 0x5400);
        assert!(board.partition_info(Target::Mmc(0), 3).is_err());
        assert!(board.partition_info(Target::Mmc(0), 0).is_err());
        assert!(board.commit_table(Target::Mmc(0), "gpt write mmc 0").is_err());
        assert!(board.commit_table(Target::Mmc(3), "gpt write mmc 3 \"\"").is_err());
    }

    #[test]
    fn test_read_memory_bounds() {
        let mut board = MemoryBoard::new();
        board.set_ram(0xC000_0000, (0..16).collect());
        let mut buf = [0u8; 4];
        board.read_memory(0xC000_0004, &mut buf).unwrap();
        assert_eq!(buf, [4, 5, 6, 7]);
        assert!(board.read_memory(0xC000_000E, &mut buf).is_err());
        assert!(board.read_memory(0x2000_0000, &mut buf).is_err());
    }
}
