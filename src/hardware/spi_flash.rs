//! W25Qxx SPI NOR flash driver

use embedded_hal::spi::{Operation, SpiDevice};
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

const CMD_WRITE_ENABLE: u8 = 0x06;
const CMD_READ_STATUS1: u8 = 0x05;
const CMD_READ_DATA: u8 = 0x03;
const CMD_PAGE_PROGRAM: u8 = 0x02;
const CMD_SECTOR_ERASE: u8 = 0x20;
const CMD_JEDEC_ID: u8 = 0x9F;
const CMD_RELEASE_POWER_DOWN: u8 = 0xAB;

const STATUS_BUSY: u8 = 0x01;

// 2^24 bytes, the whole 3-byte address space
const MAX_CAPACITY_CODE: u8 = 0x18;

/// Program granularity: a page program must not cross this boundary.
pub const PAGE_SIZE: usize = 256;
/// Smallest erasable unit.
pub const SECTOR_SIZE: usize = 4096;

// A 4 KiB sector erase takes at most 400 ms on the W25Q32
const MAX_BUSY_POLLS: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum FlashError<E> {
    Spi(E),
    NotAligned,
    OutOfBounds,
    /// The chip stayed busy longer than any erase or program should take.
    Timeout,
    /// JEDEC ID did not describe a usable chip (nothing on the bus reads as 0x00/0xFF).
    UnknownDevice(JedecId),
}

impl<E: core::fmt::Debug> NorFlashError for FlashError<E> {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            FlashError::NotAligned => NorFlashErrorKind::NotAligned,
            FlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            _ => NorFlashErrorKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub struct JedecId {
    pub manufacturer: u8,
    pub memory_type: u8,
    pub capacity_code: u8,
}

impl JedecId {
    /// Density in bytes, encoded as a power of two (0x16 = 4 MiB).
    ///
    /// Only chips reachable with 3-byte addresses are accepted. Anything above
    /// 16 MiB would need the 4-byte command set.
    pub fn capacity_bytes(&self) -> Option<u32> {
        match (self.manufacturer, self.capacity_code) {
            (0x00 | 0xFF, _) => None,
            (_, code @ 0x10..=MAX_CAPACITY_CODE) => Some(1 << code),
            _ => None,
        }
    }
}

pub struct SpiNorFlash<SPI> {
    spi: SPI,
    id: JedecId,
    capacity: u32,
}

impl<SPI: SpiDevice> SpiNorFlash<SPI> {
    /// Wakes the chip and identifies it.
    pub fn new(mut spi: SPI) -> Result<Self, FlashError<SPI::Error>> {
        spi.write(&[CMD_RELEASE_POWER_DOWN]).map_err(FlashError::Spi)?;

        let mut raw = [0u8; 3];
        spi.transaction(&mut [Operation::Write(&[CMD_JEDEC_ID]), Operation::Read(&mut raw)])
            .map_err(FlashError::Spi)?;
        let id = JedecId {
            manufacturer: raw[0],
            memory_type: raw[1],
            capacity_code: raw[2],
        };
        let capacity = id.capacity_bytes().ok_or(FlashError::UnknownDevice(id))?;

        let mut flash = Self { spi, id, capacity };
        flash.wait_idle()?;
        Ok(flash)
    }

    pub fn jedec_id(&self) -> JedecId {
        self.id
    }

    fn status(&mut self) -> Result<u8, FlashError<SPI::Error>> {
        let mut status = [0u8; 1];
        self.spi
            .transaction(&mut [Operation::Write(&[CMD_READ_STATUS1]), Operation::Read(&mut status)])
            .map_err(FlashError::Spi)?;
        Ok(status[0])
    }

    fn wait_idle(&mut self) -> Result<(), FlashError<SPI::Error>> {
        for _ in 0..MAX_BUSY_POLLS {
            if self.status()? & STATUS_BUSY == 0 {
                return Ok(());
            }
        }
        Err(FlashError::Timeout)
    }

    fn write_enable(&mut self) -> Result<(), FlashError<SPI::Error>> {
        self.spi.write(&[CMD_WRITE_ENABLE]).map_err(FlashError::Spi)
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<(), FlashError<SPI::Error>> {
        match offset.checked_add(len as u32) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(FlashError::OutOfBounds),
        }
    }
}

fn command(cmd: u8, addr: u32) -> [u8; 4] {
    [cmd, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
}

impl<SPI: SpiDevice> ErrorType for SpiNorFlash<SPI> {
    type Error = FlashError<SPI::Error>;
}

impl<SPI: SpiDevice> ReadNorFlash for SpiNorFlash<SPI> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check_range(offset, bytes.len())?;
        let cmd = command(CMD_READ_DATA, offset);
        self.spi
            .transaction(&mut [Operation::Write(&cmd), Operation::Read(bytes)])
            .map_err(FlashError::Spi)
    }

    fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

impl<SPI: SpiDevice> NorFlash for SpiNorFlash<SPI> {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % SECTOR_SIZE as u32 != 0 || to % SECTOR_SIZE as u32 != 0 || from > to {
            return Err(FlashError::NotAligned);
        }
        self.check_range(from, (to - from) as usize)?;

        for sector in (from..to).step_by(SECTOR_SIZE) {
            self.write_enable()?;
            self.spi
                .write(&command(CMD_SECTOR_ERASE, sector))
                .map_err(FlashError::Spi)?;
            self.wait_idle()?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check_range(offset, bytes.len())?;

        let mut addr = offset;
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = PAGE_SIZE - (addr as usize % PAGE_SIZE);
            let (chunk, tail) = rest.split_at(room.min(rest.len()));

            self.write_enable()?;
            let cmd = command(CMD_PAGE_PROGRAM, addr);
            self.spi
                .transaction(&mut [Operation::Write(&cmd), Operation::Write(chunk)])
                .map_err(FlashError::Spi)?;
            self.wait_idle()?;

            addr += chunk.len() as u32;
            rest = tail;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    /// Behavioural model of a W25Q with 64 KiB of NOR cells.
    pub struct FakeChip {
        pub mem: Vec<u8>,
        write_enabled: bool,
        pub id: [u8; 3],
    }

    impl FakeChip {
        pub fn new() -> Self {
            Self {
                mem: vec![0xFF; 64 * 1024],
                write_enabled: false,
                id: [0xEF, 0x40, 0x10],
            }
        }
    }

    impl embedded_hal::spi::ErrorType for FakeChip {
        type Error = Infallible;
    }

    impl SpiDevice for FakeChip {
        fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
            let (cmd, rest) = operations.split_first_mut().unwrap();
            let Operation::Write(cmd) = cmd else {
                panic!("transaction must start with a command")
            };
            let addr = || ((cmd[1] as usize) << 16) | ((cmd[2] as usize) << 8) | cmd[3] as usize;

            match cmd[0] {
                CMD_RELEASE_POWER_DOWN => {}
                CMD_WRITE_ENABLE => self.write_enabled = true,
                CMD_JEDEC_ID | CMD_READ_STATUS1 => {
                    let Operation::Read(buf) = &mut rest[0] else { panic!() };
                    if cmd[0] == CMD_JEDEC_ID {
                        buf.copy_from_slice(&self.id);
                    } else {
                        buf[0] = 0;
                    }
                }
                CMD_READ_DATA => {
                    let start = addr();
                    let Operation::Read(buf) = &mut rest[0] else { panic!() };
                    let len = buf.len();
                    buf.copy_from_slice(&self.mem[start..start + len]);
                }
                CMD_PAGE_PROGRAM => {
                    assert!(self.write_enabled);
                    let start = addr();
                    let Operation::Write(data) = &rest[0] else { panic!() };
                    assert!(start % PAGE_SIZE + data.len() <= PAGE_SIZE, "page wrap");
                    for (cell, byte) in self.mem[start..].iter_mut().zip(data.iter()) {
                        *cell &= *byte;
                    }
                    self.write_enabled = false;
                }
                CMD_SECTOR_ERASE => {
                    assert!(self.write_enabled);
                    let start = addr();
                    self.mem[start..start + SECTOR_SIZE].fill(0xFF);
                    self.write_enabled = false;
                }
                other => panic!("unexpected command {other:#x}"),
            }
            Ok(())
        }
    }

    #[test]
    fn capacity_from_jedec_id() {
        let id = |m, c| JedecId {
            manufacturer: m,
            memory_type: 0x40,
            capacity_code: c,
        };
        assert_eq!(id(0xEF, 0x16).capacity_bytes(), Some(4 * 1024 * 1024));
        assert_eq!(id(0xEF, 0x18).capacity_bytes(), Some(16 * 1024 * 1024));
        assert_eq!(id(0xEF, 0x19).capacity_bytes(), None);
        assert_eq!(id(0xFF, 0x16).capacity_bytes(), None);
        assert_eq!(id(0xEF, 0x05).capacity_bytes(), None);
    }

    #[test]
    fn chips_beyond_three_byte_addressing_are_rejected() {
        // W25Q256: 32 MiB, the upper half is unreachable with 24-bit commands
        let mut chip = FakeChip::new();
        chip.id = [0xEF, 0x40, 0x19];
        assert!(matches!(
            SpiNorFlash::new(chip),
            Err(FlashError::UnknownDevice(JedecId { capacity_code: 0x19, .. }))
        ));
    }

    #[test]
    fn missing_chip_is_reported() {
        let mut chip = FakeChip::new();
        chip.id = [0xFF, 0xFF, 0xFF];
        assert!(matches!(SpiNorFlash::new(chip), Err(FlashError::UnknownDevice(_))));
    }

    #[test]
    fn write_spanning_pages_reads_back() {
        let mut flash = SpiNorFlash::new(FakeChip::new()).unwrap();
        assert_eq!(flash.capacity(), 64 * 1024);

        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        flash.write(200, &data).unwrap();

        let mut back = vec![0u8; data.len()];
        flash.read(200, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn erase_restores_ones() {
        let mut flash = SpiNorFlash::new(FakeChip::new()).unwrap();
        flash.write(4096, &[0u8; 16]).unwrap();
        flash.erase(4096, 8192).unwrap();

        let mut back = [0u8; 16];
        flash.read(4096, &mut back).unwrap();
        assert_eq!(back, [0xFF; 16]);
    }

    #[test]
    fn range_and_alignment_are_checked() {
        let mut flash = SpiNorFlash::new(FakeChip::new()).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(flash.read(64 * 1024 - 4, &mut buf), Err(FlashError::OutOfBounds));
        assert_eq!(flash.erase(100, 4096), Err(FlashError::NotAligned));
        assert_eq!(flash.erase(0, 128 * 1024), Err(FlashError::OutOfBounds));
    }
}
