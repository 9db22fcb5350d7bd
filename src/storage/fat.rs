//! FAT16 on-disk layout: probing, usage accounting and formatting.
//!
//! The medium carries an MBR with a single FAT16 partition starting at block 8,
//! so the boot sector lands on an erase-sector boundary. Formatting chooses the
//! smallest cluster size that keeps the cluster count inside the FAT16 range.

use embedded_sdmmc::{Block, BlockDevice, BlockIdx};

const BLOCK: usize = Block::LEN;

const SIGNATURE_OFFSET: usize = 510;
const SIGNATURE: [u8; 2] = [0x55, 0xAA];

const PARTITION_TABLE: usize = 446;
const PARTITION_ENTRY: usize = 16;
const PARTITION_FAT16_SMALL: u8 = 0x04;
const PARTITION_FAT16: u8 = 0x06;
const PARTITION_FAT16_LBA: u8 = 0x0E;

const PARTITION_START: u32 = 8;
const RESERVED_BLOCKS: u16 = 1;
const NUM_FATS: u8 = 2;
const ROOT_ENTRIES: u16 = 512;
const MEDIA_FIXED: u8 = 0xF8;
const VOLUME_ID: u32 = 0x414C_524D;

const MIN_CLUSTERS: u32 = 4085;
const MAX_CLUSTERS: u32 = 65524;

pub const DEFAULT_LABEL: &str = "NO NAME";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum ProbeError<E> {
    Device(E),
    /// Block 0 has no MBR signature.
    NoPartitionTable,
    /// No FAT16 partition (with the requested label) was found.
    NoVolume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum FormatError<E> {
    Device(E),
    /// The medium is too small or too large for a FAT16 volume.
    UnsupportedSize { blocks: u32 },
    /// Labels are at most 11 ASCII characters.
    InvalidLabel,
}

/// Geometry of a FAT16 volume, in blocks relative to the start of the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub struct Fat16Layout {
    pub partition_start: u32,
    pub total_blocks: u32,
    pub blocks_per_cluster: u8,
    pub reserved_blocks: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub fat_blocks: u16,
    pub label: [u8; 11],
}

impl Fat16Layout {
    pub fn fat_start(&self) -> u32 {
        self.partition_start + self.reserved_blocks as u32
    }

    pub fn root_dir_start(&self) -> u32 {
        self.fat_start() + self.num_fats as u32 * self.fat_blocks as u32
    }

    pub fn root_dir_blocks(&self) -> u32 {
        (self.root_entries as u32 * 32).div_ceil(BLOCK as u32)
    }

    pub fn data_start(&self) -> u32 {
        self.root_dir_start() + self.root_dir_blocks()
    }

    pub fn cluster_count(&self) -> u32 {
        let data = self.total_blocks - (self.data_start() - self.partition_start);
        data / self.blocks_per_cluster as u32
    }

    pub fn cluster_bytes(&self) -> u32 {
        self.blocks_per_cluster as u32 * BLOCK as u32
    }

    pub fn label_matches(&self, label: &str) -> bool {
        let stored = trim_label(&self.label);
        stored.len() == label.len()
            && stored
                .iter()
                .zip(label.bytes())
                .all(|(a, b)| a.eq_ignore_ascii_case(&b))
    }

    /// Lays out a volume covering everything after the partition table.
    pub fn plan(device_blocks: u32, label: &str) -> Option<Self> {
        let label = encode_label(label)?;
        let total_blocks = device_blocks.checked_sub(PARTITION_START)?;

        let mut blocks_per_cluster: u32 = 1;
        while blocks_per_cluster <= 128 {
            let mut layout = Self {
                partition_start: PARTITION_START,
                total_blocks,
                blocks_per_cluster: blocks_per_cluster as u8,
                reserved_blocks: RESERVED_BLOCKS,
                num_fats: NUM_FATS,
                root_entries: ROOT_ENTRIES,
                fat_blocks: 0,
                label,
            };
            // FAT size depends on the cluster count, which depends on the FAT size
            loop {
                let overhead = layout.data_start() - layout.partition_start;
                let clusters = total_blocks.checked_sub(overhead)? / blocks_per_cluster;
                let needed = ((clusters + 2) * 2).div_ceil(BLOCK as u32);
                if needed <= layout.fat_blocks as u32 {
                    break;
                }
                layout.fat_blocks = u16::try_from(needed).ok()?;
            }

            let clusters = layout.cluster_count();
            if clusters < MIN_CLUSTERS {
                return None;
            }
            if clusters <= MAX_CLUSTERS {
                return Some(layout);
            }
            blocks_per_cluster *= 2;
        }
        None
    }

    /// Parses a boot sector found at `partition_start`.
    fn parse(boot: &Block, partition_start: u32) -> Option<Self> {
        let b = &boot.contents;
        if b[SIGNATURE_OFFSET..] != SIGNATURE {
            return None;
        }
        if u16_at(b, 11) as usize != BLOCK {
            return None;
        }

        let blocks_per_cluster = b[13];
        let reserved_blocks = u16_at(b, 14);
        let num_fats = b[16];
        let root_entries = u16_at(b, 17);
        let fat_blocks = u16_at(b, 22);
        let total_blocks = match u16_at(b, 19) {
            0 => u32_at(b, 32),
            small => small as u32,
        };
        if !blocks_per_cluster.is_power_of_two()
            || reserved_blocks == 0
            || num_fats == 0
            || fat_blocks == 0
        {
            return None;
        }

        let mut label = [b' '; 11];
        if b[38] == 0x29 {
            label.copy_from_slice(&b[43..54]);
        }

        let layout = Self {
            partition_start,
            total_blocks,
            blocks_per_cluster,
            reserved_blocks,
            num_fats,
            root_entries,
            fat_blocks,
            label,
        };
        if layout.data_start() - partition_start >= total_blocks {
            return None;
        }
        let clusters = layout.cluster_count();
        (MIN_CLUSTERS..=MAX_CLUSTERS)
            .contains(&clusters)
            .then_some(layout)
    }

    fn boot_sector(&self) -> Block {
        let mut boot = Block::new();
        let b = &mut boot.contents;
        b[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        b[3..11].copy_from_slice(b"MSWIN4.1");
        put_u16(b, 11, BLOCK as u16);
        b[13] = self.blocks_per_cluster;
        put_u16(b, 14, self.reserved_blocks);
        b[16] = self.num_fats;
        put_u16(b, 17, self.root_entries);
        match u16::try_from(self.total_blocks) {
            Ok(small) => put_u16(b, 19, small),
            Err(_) => put_u32(b, 32, self.total_blocks),
        }
        b[21] = MEDIA_FIXED;
        put_u16(b, 22, self.fat_blocks);
        put_u16(b, 24, 32);
        put_u16(b, 26, 64);
        put_u32(b, 28, self.partition_start);
        b[36] = 0x80;
        b[38] = 0x29;
        put_u32(b, 39, VOLUME_ID);
        b[43..54].copy_from_slice(&self.label);
        b[54..62].copy_from_slice(b"FAT16   ");
        b[SIGNATURE_OFFSET..].copy_from_slice(&SIGNATURE);
        boot
    }
}

/// Capacity and usage of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub struct FsInfo {
    pub total_bytes: u32,
    pub used_bytes: u32,
}

/// Finds the FAT16 partition to mount: the one carrying `label`, or the first.
pub fn probe<D: BlockDevice>(
    device: &D,
    label: Option<&str>,
) -> Result<(usize, Fat16Layout), ProbeError<D::Error>> {
    let mut mbr = [Block::new()];
    device.read(&mut mbr, BlockIdx(0)).map_err(ProbeError::Device)?;
    if mbr[0].contents[SIGNATURE_OFFSET..] != SIGNATURE {
        return Err(ProbeError::NoPartitionTable);
    }

    for index in 0..4 {
        let entry = &mbr[0].contents[PARTITION_TABLE + index * PARTITION_ENTRY..][..PARTITION_ENTRY];
        if !matches!(
            entry[4],
            PARTITION_FAT16_SMALL | PARTITION_FAT16 | PARTITION_FAT16_LBA
        ) {
            continue;
        }
        let start = u32_at(entry, 8);

        let mut boot = [Block::new()];
        device.read(&mut boot, BlockIdx(start)).map_err(ProbeError::Device)?;
        let Some(layout) = Fat16Layout::parse(&boot[0], start) else {
            continue;
        };
        if label.is_none_or(|label| layout.label_matches(label)) {
            return Ok((index, layout));
        }
    }
    Err(ProbeError::NoVolume)
}

/// Writes a fresh partition table and an empty FAT16 volume over the whole device.
pub fn format<D: BlockDevice>(
    device: &D,
    label: Option<&str>,
) -> Result<Fat16Layout, FormatError<D::Error>> {
    let blocks = device.num_blocks().map_err(FormatError::Device)?.0;
    let label = label.unwrap_or(DEFAULT_LABEL);
    if encode_label(label).is_none() {
        return Err(FormatError::InvalidLabel);
    }
    let layout = Fat16Layout::plan(blocks, label).ok_or(FormatError::UnsupportedSize { blocks })?;

    let write = |block: &Block, idx: u32| {
        device
            .write(core::slice::from_ref(block), BlockIdx(idx))
            .map_err(FormatError::Device)
    };

    let mut mbr = Block::new();
    {
        let entry = &mut mbr.contents[PARTITION_TABLE..][..PARTITION_ENTRY];
        entry[1..4].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
        entry[4] = PARTITION_FAT16;
        entry[5..8].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
        put_u32(entry, 8, layout.partition_start);
        put_u32(entry, 12, layout.total_blocks);
    }
    mbr.contents[SIGNATURE_OFFSET..].copy_from_slice(&SIGNATURE);
    write(&mbr, 0)?;
    write(&layout.boot_sector(), layout.partition_start)?;

    let zero = Block::new();
    let mut fat_head = Block::new();
    put_u16(&mut fat_head.contents, 0, 0xFF00 | MEDIA_FIXED as u16);
    put_u16(&mut fat_head.contents, 2, 0xFFFF);

    for copy in 0..layout.num_fats as u32 {
        let start = layout.fat_start() + copy * layout.fat_blocks as u32;
        write(&fat_head, start)?;
        for idx in start + 1..start + layout.fat_blocks as u32 {
            write(&zero, idx)?;
        }
    }
    for idx in layout.root_dir_start()..layout.data_start() {
        write(&zero, idx)?;
    }
    Ok(layout)
}

/// Counts allocated clusters in the first FAT.
pub fn usage<D: BlockDevice>(device: &D, layout: &Fat16Layout) -> Result<FsInfo, D::Error> {
    let clusters = layout.cluster_count();
    let entries_per_block = (BLOCK / 2) as u32;

    let mut used = 0u32;
    let mut block = [Block::new()];
    for fat_block in 0..layout.fat_blocks as u32 {
        let first_entry = fat_block * entries_per_block;
        // Entries 0 and 1 are reserved; data clusters are numbered from 2
        if first_entry >= clusters + 2 {
            break;
        }
        device.read(&mut block, BlockIdx(layout.fat_start() + fat_block))?;
        used += block[0]
            .contents
            .chunks_exact(2)
            .enumerate()
            .map(|(i, raw)| (first_entry + i as u32, u16::from_le_bytes([raw[0], raw[1]])))
            .filter(|(entry, value)| (2..clusters + 2).contains(entry) && *value != 0)
            .count() as u32;
    }

    Ok(FsInfo {
        total_bytes: clusters * layout.cluster_bytes(),
        used_bytes: used * layout.cluster_bytes(),
    })
}

fn encode_label(label: &str) -> Option<[u8; 11]> {
    if label.len() > 11 || !label.bytes().all(|c| c.is_ascii_graphic() || c == b' ') {
        return None;
    }
    let mut out = [b' '; 11];
    for (dst, src) in out.iter_mut().zip(label.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    Some(out)
}

fn trim_label(label: &[u8; 11]) -> &[u8] {
    let end = label.iter().rposition(|c| *c != b' ').map_or(0, |i| i + 1);
    &label[..end]
}

fn u16_at(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn put_u16(b: &mut [u8], at: usize, value: u16) {
    b[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(b: &mut [u8], at: usize, value: u32) {
    b[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block_device::FlashBlockDevice;
    use crate::storage::testing::RamFlash;

    const FOUR_MIB: usize = 4 * 1024 * 1024;

    #[test]
    fn plan_for_four_mebibytes() {
        let layout = Fat16Layout::plan(8192, DEFAULT_LABEL).unwrap();
        assert_eq!(layout.partition_start, 8);
        assert_eq!(layout.total_blocks, 8184);
        assert_eq!(layout.blocks_per_cluster, 1);
        assert_eq!(layout.fat_blocks, 32);
        assert_eq!(layout.root_dir_blocks(), 32);
        assert_eq!(layout.cluster_count(), 8184 - 1 - 64 - 32);
    }

    #[test]
    fn plan_scales_cluster_size() {
        // 64 MiB would need more than 65524 single-block clusters
        let layout = Fat16Layout::plan(131_072, DEFAULT_LABEL).unwrap();
        assert!(layout.blocks_per_cluster > 1);
        assert!(layout.cluster_count() <= MAX_CLUSTERS);
        assert!(layout.cluster_count() >= MIN_CLUSTERS);
    }

    #[test]
    fn plan_rejects_tiny_media() {
        assert_eq!(Fat16Layout::plan(1024, DEFAULT_LABEL), None);
    }

    #[test]
    fn blank_flash_has_no_partition_table() {
        let device = FlashBlockDevice::new(RamFlash::new(FOUR_MIB)).unwrap();
        assert_eq!(probe(&device, None), Err(ProbeError::NoPartitionTable));
    }

    #[test]
    fn formatted_volume_probes_back() {
        let device = FlashBlockDevice::new(RamFlash::new(FOUR_MIB)).unwrap();
        let written = format(&device, Some("storage")).unwrap();

        let (index, found) = probe(&device, None).unwrap();
        assert_eq!(index, 0);
        assert_eq!(found, written);
        assert!(found.label_matches("STORAGE"));

        assert_eq!(probe(&device, Some("storage")).unwrap().1, written);
        assert_eq!(probe(&device, Some("other")), Err(ProbeError::NoVolume));
    }

    #[test]
    fn empty_volume_usage() {
        let device = FlashBlockDevice::new(RamFlash::new(FOUR_MIB)).unwrap();
        let layout = format(&device, None).unwrap();
        let info = usage(&device, &layout).unwrap();
        assert_eq!(info.total_bytes, layout.cluster_count() * 512);
        assert_eq!(info.used_bytes, 0);
    }

    #[test]
    fn format_rejects_bad_label() {
        let device = FlashBlockDevice::new(RamFlash::new(FOUR_MIB)).unwrap();
        assert_eq!(
            format(&device, Some("far too long label")),
            Err(FormatError::InvalidLabel)
        );
    }

    #[test]
    fn format_rejects_small_device() {
        let device = FlashBlockDevice::new(RamFlash::new(512 * 1024)).unwrap();
        assert_eq!(
            format(&device, None),
            Err(FormatError::UnsupportedSize { blocks: 1024 })
        );
    }
}
