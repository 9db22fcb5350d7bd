//! Flash-backed filesystem mounted at a base path.
//!
//! ```text
//! SpiNorFlash ── FlashBlockDevice ── embedded-sdmmc VolumeManager ── FileSystem
//! ```
//!
//! Only the root directory is used; paths are `<base_path>/<8.3 name>`.

pub mod block_device;
pub mod fat;

use core::cell::Cell;
use core::mem::ManuallyDrop;

use embedded_sdmmc::{RawDirectory, RawFile, RawVolume, TimeSource, Timestamp, VolumeIdx, VolumeManager};
use embedded_storage::nor_flash::NorFlash;
use heapless::String;

pub use block_device::{BlockDeviceError, DeviceRef, FlashBlockDevice};
pub use embedded_sdmmc::Mode;
pub use fat::{Fat16Layout, FormatError, FsInfo, ProbeError};

/// Upper bound for `MountConfig::max_files`, the open-file slots of the FAT driver.
pub const MAX_OPEN_FILES: usize = 5;
/// `read_line` returns at most `LINE_CAPACITY - 1` bytes, like a 64-byte `fgets` buffer.
pub const LINE_CAPACITY: usize = 64;

/// Filesystem mount parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub struct MountConfig {
    pub base_path: &'static str,
    /// Volume label to mount; `None` takes the first FAT16 partition.
    pub partition_label: Option<&'static str>,
    /// Files that may be open at the same time through [`FileSystem::open`].
    pub max_files: usize,
    /// Erase and format the medium when no usable volume is found.
    pub format_if_mount_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum MountError<E> {
    /// `max_files` is zero or above [`MAX_OPEN_FILES`].
    MaxFiles(usize),
    Probe(ProbeError<E>),
    Format(FormatError<E>),
    /// The FAT driver refused a volume the probe accepted.
    Open(FsError<E>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum FsError<E> {
    Device(E),
    NotFound,
    /// Path outside the base path, inside a subdirectory, or not an 8.3 name.
    InvalidPath,
    TooManyOpenFiles,
    DiskFull,
    /// The line read is not UTF-8.
    NotText,
    /// Any other FAT level failure (corrupt volume, unsupported layout).
    Fat,
}

impl<E: core::fmt::Debug> From<embedded_sdmmc::Error<E>> for FsError<E> {
    fn from(err: embedded_sdmmc::Error<E>) -> Self {
        use embedded_sdmmc::Error;
        match err {
            Error::DeviceError(e) => FsError::Device(e),
            Error::NotFound => FsError::NotFound,
            Error::FilenameError(_) => FsError::InvalidPath,
            Error::TooManyOpenFiles => FsError::TooManyOpenFiles,
            Error::DiskFull | Error::NotEnoughSpace => FsError::DiskFull,
            _ => FsError::Fat,
        }
    }
}

/// There is no RTC on the board; files get a fixed timestamp.
#[derive(Default)]
pub struct FixedTime;

impl TimeSource for FixedTime {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 55,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

type Volumes<'a, F> = VolumeManager<DeviceRef<'a, F>, FixedTime, 2, MAX_OPEN_FILES, 1>;
type DeviceError<F> = BlockDeviceError<<F as embedded_storage::nor_flash::ErrorType>::Error>;

/// Mounts the FAT16 volume on `device`, formatting it first if allowed and needed.
pub fn mount<'a, F: NorFlash>(
    device: &'a FlashBlockDevice<F>,
    config: &MountConfig,
) -> Result<FileSystem<'a, F>, MountError<DeviceError<F>>> {
    if config.max_files == 0 || config.max_files > MAX_OPEN_FILES {
        return Err(MountError::MaxFiles(config.max_files));
    }

    let (index, layout) = match fat::probe(device, config.partition_label) {
        Ok(found) => found,
        Err(_) if config.format_if_mount_failed => {
            fat::format(device, config.partition_label).map_err(MountError::Format)?;
            fat::probe(device, config.partition_label).map_err(MountError::Probe)?
        }
        Err(err) => return Err(MountError::Probe(err)),
    };

    let volumes: Volumes<'a, F> = VolumeManager::new_with_limits(DeviceRef(device), FixedTime, 0);
    let volume = volumes
        .open_raw_volume(VolumeIdx(index))
        .map_err(|e| MountError::Open(e.into()))?;
    let root = match volumes.open_root_dir(volume) {
        Ok(root) => root,
        Err(e) => {
            let _ = volumes.close_volume(volume);
            return Err(MountError::Open(e.into()));
        }
    };

    Ok(FileSystem {
        device,
        volumes,
        volume,
        root,
        layout,
        base_path: config.base_path,
        max_files: config.max_files,
        open_files: Cell::new(0),
    })
}

pub struct FileSystem<'a, F: NorFlash> {
    device: &'a FlashBlockDevice<F>,
    volumes: Volumes<'a, F>,
    volume: RawVolume,
    root: RawDirectory,
    layout: Fat16Layout,
    base_path: &'static str,
    max_files: usize,
    open_files: Cell<usize>,
}

impl<'a, F: NorFlash> FileSystem<'a, F> {
    pub fn layout(&self) -> &Fat16Layout {
        &self.layout
    }

    /// Total and used bytes of the data area.
    pub fn info(&self) -> Result<FsInfo, DeviceError<F>> {
        fat::usage(self.device, &self.layout)
    }

    /// Opens `path`. At most `max_files` files can be open at once.
    pub fn open(&self, path: &str, mode: Mode) -> Result<File<'_, 'a, F>, FsError<DeviceError<F>>> {
        let name = self.resolve(path)?;
        if self.open_files.get() >= self.max_files {
            return Err(FsError::TooManyOpenFiles);
        }
        let raw = self.volumes.open_file_in_dir(self.root, name.as_str(), mode)?;
        self.open_files.set(self.open_files.get() + 1);
        Ok(File { fs: self, raw })
    }

    /// Reads the first line of `path`, without its line terminator.
    pub fn read_line(&self, path: &str) -> Result<String<LINE_CAPACITY>, FsError<DeviceError<F>>> {
        let mut buf = [0u8; LINE_CAPACITY - 1];
        let mut file = self.open(path, Mode::ReadOnly)?;
        let mut filled = 0;
        while filled < buf.len() && !buf[..filled].contains(&b'\n') {
            match file.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        file.close()?;

        let cut_short = filled == buf.len() && !buf.contains(&b'\n');
        let line = buf[..filled].split(|b| *b == b'\n').next().unwrap_or_default();
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = match core::str::from_utf8(line) {
            Ok(text) => text,
            // The buffer ended in the middle of a multi-byte character
            Err(e) if cut_short && e.error_len().is_none() => {
                core::str::from_utf8(&line[..e.valid_up_to()]).map_err(|_| FsError::NotText)?
            }
            Err(_) => return Err(FsError::NotText),
        };

        let mut out = String::new();
        out.push_str(text).map_err(|_| FsError::NotText)?;
        Ok(out)
    }

    /// Creates or truncates `path` and writes `contents` to it.
    pub fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), FsError<DeviceError<F>>> {
        let mut file = self.open(path, Mode::ReadWriteCreateOrTruncate)?;
        file.write(contents)?;
        file.close()
    }

    pub fn unmount(self) -> Result<(), FsError<DeviceError<F>>> {
        self.volumes.close_dir(self.root)?;
        self.volumes.close_volume(self.volume)?;
        Ok(())
    }

    fn release(&self, raw: RawFile) -> Result<(), FsError<DeviceError<F>>> {
        self.open_files.set(self.open_files.get() - 1);
        self.volumes.close_file(raw)?;
        Ok(())
    }

    /// Maps `<base_path>/name.ext` to the upper-case short name in the root directory.
    fn resolve(&self, path: &str) -> Result<String<12>, FsError<DeviceError<F>>> {
        let name = path
            .strip_prefix(self.base_path)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .ok_or(FsError::InvalidPath)?;

        let mut short = String::new();
        for c in name.chars() {
            short
                .push(c.to_ascii_uppercase())
                .map_err(|_| FsError::InvalidPath)?;
        }
        Ok(short)
    }
}

/// A file open on a [`FileSystem`]. Dropping it closes the file; [`File::close`]
/// reports a failed close instead of ignoring it.
pub struct File<'fs, 'a, F: NorFlash> {
    fs: &'fs FileSystem<'a, F>,
    raw: RawFile,
}

impl<F: NorFlash> File<'_, '_, F> {
    /// Returns the number of bytes read, 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError<DeviceError<F>>> {
        Ok(self.fs.volumes.read(self.raw, buf)?)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), FsError<DeviceError<F>>> {
        Ok(self.fs.volumes.write(self.raw, data)?)
    }

    pub fn close(self) -> Result<(), FsError<DeviceError<F>>> {
        let file = ManuallyDrop::new(self);
        file.fs.release(file.raw)
    }
}

impl<F: NorFlash> Drop for File<'_, '_, F> {
    fn drop(&mut self) {
        let _ = self.fs.release(self.raw);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};

    /// NOR flash model in RAM: erase sets 0xFF, programming can only clear bits.
    pub struct RamFlash {
        pub mem: Vec<u8>,
        pub erase_count: usize,
        pub write_count: usize,
        /// Makes every erase and write fail, like a write-protected chip.
        pub read_only: bool,
    }

    impl RamFlash {
        pub fn new(capacity: usize) -> Self {
            Self {
                mem: vec![0xFF; capacity],
                erase_count: 0,
                write_count: 0,
                read_only: false,
            }
        }
    }

    impl ErrorType for RamFlash {
        type Error = NorFlashErrorKind;
    }

    impl ReadNorFlash for RamFlash {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let src = self
                .mem
                .get(start..start + bytes.len())
                .ok_or(NorFlashErrorKind::OutOfBounds)?;
            bytes.copy_from_slice(src);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.mem.len()
        }
    }

    impl NorFlash for RamFlash {
        const WRITE_SIZE: usize = 1;
        const ERASE_SIZE: usize = 4096;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if self.read_only {
                return Err(NorFlashErrorKind::Other);
            }
            if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            self.mem
                .get_mut(from as usize..to as usize)
                .ok_or(NorFlashErrorKind::OutOfBounds)?
                .fill(0xFF);
            self.erase_count += 1;
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            if self.read_only {
                return Err(NorFlashErrorKind::Other);
            }
            let start = offset as usize;
            let cells = self
                .mem
                .get_mut(start..start + bytes.len())
                .ok_or(NorFlashErrorKind::OutOfBounds)?;
            for (cell, byte) in cells.iter_mut().zip(bytes) {
                *cell &= *byte;
            }
            self.write_count += 1;
            Ok(())
        }
    }
}
