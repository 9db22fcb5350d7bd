//! 512-byte block view over a NOR flash.
//!
//! NOR cells can only be programmed from 1 to 0 and are erased in whole
//! sectors, so a block write reads the surrounding 4 KiB sector, patches it and
//! erases + reprograms it. Writes landing on already erased cells skip the erase.

use core::cell::RefCell;

use embedded_sdmmc::{Block, BlockCount, BlockDevice, BlockIdx};
use embedded_storage::nor_flash::NorFlash;

/// Size of the read-modify-write window. Every supported chip's erase size divides it.
pub const SECTOR_SIZE: usize = 4096;
const BLOCKS_PER_SECTOR: usize = SECTOR_SIZE / Block::LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum BlockDeviceError<E> {
    Flash(E),
    /// Erase, write or read granularity of the flash is incompatible with 512-byte blocks.
    Geometry,
    OutOfRange,
}

struct Inner<F> {
    flash: F,
    sector: [u8; SECTOR_SIZE],
}

pub struct FlashBlockDevice<F> {
    inner: RefCell<Inner<F>>,
    num_blocks: u32,
}

impl<F: NorFlash> FlashBlockDevice<F> {
    pub fn new(flash: F) -> Result<Self, BlockDeviceError<F::Error>> {
        let compatible = F::ERASE_SIZE <= SECTOR_SIZE
            && SECTOR_SIZE % F::ERASE_SIZE == 0
            && Block::LEN % F::WRITE_SIZE == 0
            && Block::LEN % F::READ_SIZE == 0;
        if !compatible {
            return Err(BlockDeviceError::Geometry);
        }

        let num_blocks = (flash.capacity() / SECTOR_SIZE * BLOCKS_PER_SECTOR) as u32;
        Ok(Self {
            inner: RefCell::new(Inner {
                flash,
                sector: [0xFF; SECTOR_SIZE],
            }),
            num_blocks,
        })
    }

    pub fn block_count(&self) -> u32 {
        self.num_blocks
    }

    pub fn release(self) -> F {
        self.inner.into_inner().flash
    }

    fn check_range(&self, start: BlockIdx, count: usize) -> Result<(), BlockDeviceError<F::Error>> {
        match start.0.checked_add(count as u32) {
            Some(end) if end <= self.num_blocks => Ok(()),
            _ => Err(BlockDeviceError::OutOfRange),
        }
    }
}

impl<F: NorFlash> Inner<F> {
    /// Writes `blocks` starting at block `first` within the sector at `base`.
    fn write_sector(&mut self, base: u32, first: usize, blocks: &[Block]) -> Result<(), F::Error> {
        let Inner { flash, sector } = self;
        flash.read(base, sector)?;

        let start = first * Block::LEN;
        let end = start + blocks.len() * Block::LEN;
        let window = &mut sector[start..end];

        let unchanged = window
            .chunks(Block::LEN)
            .zip(blocks)
            .all(|(old, new)| old == &new.contents[..]);
        if unchanged {
            return Ok(());
        }

        let erased = window.iter().all(|b| *b == 0xFF);
        for (dst, block) in window.chunks_mut(Block::LEN).zip(blocks) {
            dst.copy_from_slice(&block.contents);
        }

        if erased {
            flash.write(base + start as u32, &sector[start..end])
        } else {
            flash.erase(base, base + SECTOR_SIZE as u32)?;
            flash.write(base, &sector[..])
        }
    }
}

impl<F: NorFlash> BlockDevice for FlashBlockDevice<F> {
    type Error = BlockDeviceError<F::Error>;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.check_range(start_block_idx, blocks.len())?;
        let mut inner = self.inner.borrow_mut();
        for (i, block) in blocks.iter_mut().enumerate() {
            let offset = (start_block_idx.0 + i as u32) * Block::LEN as u32;
            inner
                .flash
                .read(offset, &mut block.contents)
                .map_err(BlockDeviceError::Flash)?;
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.check_range(start_block_idx, blocks.len())?;
        let mut inner = self.inner.borrow_mut();

        let mut idx = start_block_idx.0 as usize;
        let mut rest = blocks;
        while !rest.is_empty() {
            let first = idx % BLOCKS_PER_SECTOR;
            let base = ((idx - first) * Block::LEN) as u32;
            let (chunk, tail) = rest.split_at((BLOCKS_PER_SECTOR - first).min(rest.len()));

            inner
                .write_sector(base, first, chunk)
                .map_err(BlockDeviceError::Flash)?;

            idx += chunk.len();
            rest = tail;
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount(self.num_blocks))
    }
}

/// Shared handle so the FAT layer and the usage walk can both reach the device.
pub struct DeviceRef<'a, F>(pub &'a FlashBlockDevice<F>);

impl<F: NorFlash> BlockDevice for DeviceRef<'_, F> {
    type Error = BlockDeviceError<F::Error>;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.0.read(blocks, start_block_idx)
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.0.write(blocks, start_block_idx)
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        self.0.num_blocks()
    }
}
