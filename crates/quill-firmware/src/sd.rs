//! SD card binding for the storage capability.
//!
//! SD card operations are blocking, same as every other user of the SPI bus.
//! Each operation opens the volume, walks to the target directory, does its
//! work, and closes everything again; the card is never held open across
//! operations, so a yanked card surfaces as a per-operation error instead of
//! wedging the whole store.

use core::cell::RefCell;

use alloc::rc::Rc;
use embedded_sdmmc::{Mode, SdCard, SdCardError, TimeSource, Timestamp, VolumeIdx, VolumeManager};
use log::debug;

use quill_core::storage::{DirEntry, StorageError, StorageService};

type SdError = embedded_sdmmc::Error<SdCardError>;

/// The card is FAT; timestamps on it are meaningless without an RTC, so
/// every write gets the same fixed stamp.
pub struct NullTimeSource;

impl TimeSource for NullTimeSource {
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

/// The directory layout is flat: every path is `/file` or `/dir/file`.
fn split_path(path: &str) -> Result<(Option<&str>, &str), StorageError> {
    let path = path.strip_prefix('/').ok_or(StorageError::PathTooLong)?;
    match path.split_once('/') {
        None => Ok((None, path)),
        Some((dir, name)) if !name.is_empty() && !name.contains('/') => Ok((Some(dir), name)),
        Some(_) => Err(StorageError::PathTooLong),
    }
}

fn map_err(e: SdError) -> StorageError {
    match e {
        SdError::DeviceError(_) => StorageError::Unavailable,
        SdError::NotFound | SdError::NoSuchVolume => StorageError::NotFound,
        SdError::FilenameError(_) => StorageError::PathTooLong,
        SdError::DiskFull => StorageError::Full,
        _ => StorageError::Io,
    }
}

pub struct SdStorage<S, D>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
{
    volume_mgr: VolumeManager<SdCard<S, D>, NullTimeSource, 4, 4, 1>,
}

impl<S, D> SdStorage<S, D>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
{
    pub fn new(sd_card: SdCard<S, D>) -> Self {
        let volume_mgr = VolumeManager::new(sd_card, NullTimeSource);

        Self { volume_mgr }
    }
}

impl<S, D> StorageService for SdStorage<S, D>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
{
    fn exists(&mut self, path: &str) -> Result<bool, StorageError> {
        let (dir, name) = split_path(path)?;
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume0.open_root_dir().map_err(map_err)?;

        let found = match dir {
            None => root_dir.find_directory_entry(name),
            Some(dir) => {
                let parent = root_dir.open_dir(dir).map_err(map_err)?;
                let found = parent.find_directory_entry(name);
                parent.close().map_err(map_err)?;
                found
            }
        };
        root_dir.close().map_err(map_err)?;
        volume0.close().map_err(map_err)?;

        match found {
            Ok(_) => Ok(true),
            Err(SdError::NotFound) => Ok(false),
            Err(e) => Err(map_err(e)),
        }
    }

    fn mkdir(&mut self, path: &str) -> Result<(), StorageError> {
        let (dir, name) = split_path(path)?;
        if dir.is_some() {
            return Err(StorageError::PathTooLong);
        }
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume0.open_root_dir().map_err(map_err)?;

        let result = root_dir.make_dir_in_dir(name).map_err(map_err);

        root_dir.close().map_err(map_err)?;
        volume0.close().map_err(map_err)?;
        result
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        let (dir, name) = split_path(path)?;
        let dir = dir.ok_or(StorageError::NotFound)?;
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume0.open_root_dir().map_err(map_err)?;
        let parent = root_dir.open_dir(dir).map_err(map_err)?;

        let result = parent.delete_file_in_dir(name).map_err(map_err);

        parent.close().map_err(map_err)?;
        root_dir.close().map_err(map_err)?;
        volume0.close().map_err(map_err)?;
        result
    }

    /// FAT has no rename primitive in this driver, so rename is copy then
    /// delete. The promote order in the save protocol still guarantees a
    /// complete copy of the data exists at every step.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        let (from_dir, from_name) = split_path(from)?;
        let (to_dir, to_name) = split_path(to)?;
        if from_dir != to_dir {
            return Err(StorageError::PathTooLong);
        }
        let dir = from_dir.ok_or(StorageError::NotFound)?;

        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume0.open_root_dir().map_err(map_err)?;
        let parent = root_dir.open_dir(dir).map_err(map_err)?;

        let result = (|| -> Result<(), SdError> {
            let source = parent.open_file_in_dir(from_name, Mode::ReadOnly)?;
            let dest = parent.open_file_in_dir(to_name, Mode::ReadWriteCreateOrTruncate)?;
            let mut buf = [0u8; 512];
            loop {
                let n = source.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                dest.write(&buf[..n])?;
            }
            dest.close()?;
            source.close()?;
            parent.delete_file_in_dir(from_name)?;
            Ok(())
        })()
        .map_err(map_err);

        parent.close().map_err(map_err)?;
        root_dir.close().map_err(map_err)?;
        volume0.close().map_err(map_err)?;
        result
    }

    fn file_size(&mut self, path: &str) -> Result<u64, StorageError> {
        let (dir, name) = split_path(path)?;
        let dir = dir.ok_or(StorageError::NotFound)?;
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume0.open_root_dir().map_err(map_err)?;
        let parent = root_dir.open_dir(dir).map_err(map_err)?;

        let result = parent
            .find_directory_entry(name)
            .map(|entry| entry.size as u64)
            .map_err(map_err);

        parent.close().map_err(map_err)?;
        root_dir.close().map_err(map_err)?;
        volume0.close().map_err(map_err)?;
        result
    }

    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.read_at(path, 0, buf)
    }

    fn read_at(
        &mut self,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        let (dir, name) = split_path(path)?;
        let dir = dir.ok_or(StorageError::NotFound)?;
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume0.open_root_dir().map_err(map_err)?;
        let parent = root_dir.open_dir(dir).map_err(map_err)?;

        let result = (|| -> Result<usize, SdError> {
            let file = parent.open_file_in_dir(name, Mode::ReadOnly)?;
            file.seek_from_start(offset as u32)?;
            let mut total = 0;
            while total < buf.len() {
                let n = file.read(&mut buf[total..])?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            file.close()?;
            Ok(total)
        })()
        .map_err(map_err);

        parent.close().map_err(map_err)?;
        root_dir.close().map_err(map_err)?;
        volume0.close().map_err(map_err)?;
        result
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<usize, StorageError> {
        let (dir, name) = split_path(path)?;
        let dir = dir.ok_or(StorageError::NotFound)?;
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume0.open_root_dir().map_err(map_err)?;
        let parent = root_dir.open_dir(dir).map_err(map_err)?;

        let result = (|| -> Result<usize, SdError> {
            let file = parent.open_file_in_dir(name, Mode::ReadWriteCreateOrTruncate)?;
            file.write(data)?;
            file.close()?;
            Ok(data.len())
        })()
        .map_err(map_err);

        parent.close().map_err(map_err)?;
        root_dir.close().map_err(map_err)?;
        volume0.close().map_err(map_err)?;
        result
    }

    fn iter_dir(
        &mut self,
        path: &str,
        visit: &mut dyn FnMut(&DirEntry),
    ) -> Result<(), StorageError> {
        let (dir, name) = split_path(path)?;
        if dir.is_some() {
            return Err(StorageError::PathTooLong);
        }
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume0.open_root_dir().map_err(map_err)?;
        let target = root_dir.open_dir(name).map_err(map_err)?;

        let result = target
            .iterate_dir(|entry| {
                // 8.3 names come back uppercase; the on-card layout is all
                // lowercase.
                let mut name = heapless::String::<{ quill_core::storage::MAX_NAME_LEN }>::new();
                let mut raw = heapless::String::<16>::new();
                let _ = core::fmt::write(&mut raw, format_args!("{}", entry.name));
                for c in raw.chars() {
                    let _ = name.push(c.to_ascii_lowercase());
                }
                visit(&DirEntry {
                    name,
                    is_directory: entry.attributes.is_directory(),
                    size: entry.size as u64,
                });
            })
            .map_err(map_err);

        target.close().map_err(map_err)?;
        root_dir.close().map_err(map_err)?;
        volume0.close().map_err(map_err)?;
        result
    }

    fn sleep(&mut self) {
        // Nothing persistent to release: the card deselects between
        // transactions and the driver re-probes it on the next command.
        debug!("sd idle");
    }
}

/// Shared handle so the file store and the key-value store can use one card.
///
/// Everything runs on a single executor core and every storage operation
/// completes synchronously, so a `RefCell` is sufficient.
pub struct SharedStorage<S: StorageService>(Rc<RefCell<S>>);

impl<S: StorageService> SharedStorage<S> {
    pub fn new(storage: S) -> Self {
        Self(Rc::new(RefCell::new(storage)))
    }
}

impl<S: StorageService> Clone for SharedStorage<S> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<S: StorageService> StorageService for SharedStorage<S> {
    fn exists(&mut self, path: &str) -> Result<bool, StorageError> {
        self.0.borrow_mut().exists(path)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), StorageError> {
        self.0.borrow_mut().mkdir(path)
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        self.0.borrow_mut().remove(path)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        self.0.borrow_mut().rename(from, to)
    }

    fn file_size(&mut self, path: &str) -> Result<u64, StorageError> {
        self.0.borrow_mut().file_size(path)
    }

    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.0.borrow_mut().read(path, buf)
    }

    fn read_at(
        &mut self,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        self.0.borrow_mut().read_at(path, offset, buf)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<usize, StorageError> {
        self.0.borrow_mut().write(path, data)
    }

    fn iter_dir(
        &mut self,
        path: &str,
        visit: &mut dyn FnMut(&DirEntry),
    ) -> Result<(), StorageError> {
        self.0.borrow_mut().iter_dir(path, visit)
    }

    fn sleep(&mut self) {
        self.0.borrow_mut().sleep()
    }
}
