//! Shared test doubles for the capability traits, plus a tiny executor so
//! async code can run inside ordinary `#[test]` functions.

use core::convert::Infallible;
use core::future::Future;
use core::net::Ipv4Addr;
use core::task::{Context, Poll, Waker};

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::config::bounded;
use crate::creds::{KvError, KvStore, KvValue, MAX_KV_VALUE_LEN};
use crate::engine::{ScanStatus, SyncRadio};
use crate::storage::{DirEntry, StorageError, StorageService};

/// Drive a future to completion. The code under test never actually waits,
/// so a no-op waker and a poll loop are enough.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let mut fut = core::pin::pin!(fut);
    let mut cx = Context::from_waker(Waker::noop());
    loop {
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return out;
        }
    }
}

/// In-memory [`StorageService`]: a flat map of paths to contents, with knobs
/// for forcing unavailability and short writes.
pub struct FakeStorage {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    available: bool,
    write_limit: Option<usize>,
    sleeps: usize,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            available: true,
            write_limit: None,
            sleeps: 0,
        }
    }

    /// Place a file directly, bypassing the trait (and its failure knobs).
    pub fn seed(&mut self, path: &str, contents: &[u8]) {
        self.files.insert(path.to_string(), contents.to_vec());
    }

    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }

    /// Cap every subsequent write at `n` bytes to simulate a full or flaky
    /// device reporting a short write.
    pub fn limit_writes_to(&mut self, n: usize) {
        self.write_limit = Some(n);
    }

    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    pub fn sleep_count(&self) -> usize {
        self.sleeps
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available {
            Ok(())
        } else {
            Err(StorageError::Unavailable)
        }
    }
}

impl StorageService for FakeStorage {
    fn exists(&mut self, path: &str) -> Result<bool, StorageError> {
        self.check()?;
        Ok(self.files.contains_key(path) || self.dirs.contains(path))
    }

    fn mkdir(&mut self, path: &str) -> Result<(), StorageError> {
        self.check()?;
        self.dirs.insert(path.to_string());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        self.check()?;
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        self.check()?;
        let contents = self.files.remove(from).ok_or(StorageError::NotFound)?;
        self.files.insert(to.to_string(), contents);
        Ok(())
    }

    fn file_size(&mut self, path: &str) -> Result<u64, StorageError> {
        self.check()?;
        self.files
            .get(path)
            .map(|v| v.len() as u64)
            .ok_or(StorageError::NotFound)
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
        self.check()?;
        let contents = self.files.get(path).ok_or(StorageError::NotFound)?;
        let start = (offset as usize).min(contents.len());
        let n = (contents.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&contents[start..start + n]);
        Ok(n)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<usize, StorageError> {
        self.check()?;
        let n = self.write_limit.map_or(data.len(), |l| l.min(data.len()));
        self.files.insert(path.to_string(), data[..n].to_vec());
        Ok(n)
    }

    fn iter_dir(
        &mut self,
        path: &str,
        visit: &mut dyn FnMut(&DirEntry),
    ) -> Result<(), StorageError> {
        self.check()?;
        if !self.dirs.contains(path) {
            return Err(StorageError::NotFound);
        }
        let mut prefix = path.to_string();
        prefix.push('/');
        for (file, contents) in &self.files {
            if let Some(name) = file.strip_prefix(&prefix)
                && !name.contains('/')
            {
                visit(&DirEntry {
                    name: bounded(name),
                    is_directory: false,
                    size: contents.len() as u64,
                });
            }
        }
        for dir in &self.dirs {
            if let Some(name) = dir.strip_prefix(&prefix)
                && !name.contains('/')
            {
                visit(&DirEntry {
                    name: bounded(name),
                    is_directory: true,
                    size: 0,
                });
            }
        }
        Ok(())
    }

    fn sleep(&mut self) {
        self.sleeps += 1;
    }
}

/// In-memory [`KvStore`] over two plain maps.
pub struct FakeKv {
    strings: BTreeMap<String, String>,
    numbers: BTreeMap<String, u32>,
}

impl FakeKv {
    pub fn new() -> Self {
        Self {
            strings: BTreeMap::new(),
            numbers: BTreeMap::new(),
        }
    }
}

impl KvStore for FakeKv {
    fn get_str(&mut self, key: &str) -> Result<Option<KvValue>, KvError> {
        Ok(self.strings.get(key).map(|v| bounded(v)))
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        if value.len() > MAX_KV_VALUE_LEN {
            return Err(KvError::ValueTooLong);
        }
        self.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_u32(&mut self, key: &str) -> Result<Option<u32>, KvError> {
        Ok(self.numbers.get(key).copied())
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), KvError> {
        self.numbers.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), KvError> {
        self.strings.remove(key);
        self.numbers.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCall {
    StartScan,
    Connect,
    Disconnect,
    StartDiscovery,
    StopDiscovery,
    PowerOff,
}

/// Scripted [`SyncRadio`]: tests preload `scan` and flip `connected`, and
/// assert on the recorded call sequence afterwards.
pub struct FakeRadio {
    pub scan: ScanStatus,
    pub connected: bool,
    pub ip: Option<Ipv4Addr>,
    pub calls: Vec<RadioCall>,
    last_connect: Option<(String, String)>,
}

impl FakeRadio {
    pub fn new() -> Self {
        Self {
            scan: ScanStatus::Pending,
            connected: false,
            ip: Some(Ipv4Addr::new(192, 168, 1, 50)),
            calls: Vec::new(),
            last_connect: None,
        }
    }

    pub fn connect_args(&self) -> Option<(&str, &str)> {
        self.last_connect
            .as_ref()
            .map(|(ssid, password)| (ssid.as_str(), password.as_str()))
    }
}

impl SyncRadio for FakeRadio {
    fn start_scan(&mut self) {
        self.calls.push(RadioCall::StartScan);
    }

    fn scan_status(&mut self) -> ScanStatus {
        core::mem::replace(&mut self.scan, ScanStatus::Pending)
    }

    fn connect(&mut self, ssid: &str, password: &str) {
        self.calls.push(RadioCall::Connect);
        self.last_connect = Some((ssid.to_string(), password.to_string()));
    }

    fn disconnect(&mut self) {
        self.calls.push(RadioCall::Disconnect);
        self.connected = false;
    }

    fn link_up(&mut self) -> bool {
        self.connected
    }

    fn local_ip(&mut self) -> Option<Ipv4Addr> {
        self.ip
    }

    fn start_discovery(&mut self) {
        self.calls.push(RadioCall::StartDiscovery);
    }

    fn stop_discovery(&mut self) {
        self.calls.push(RadioCall::StopDiscovery);
    }

    fn power_off(&mut self) {
        self.calls.push(RadioCall::PowerOff);
        self.connected = false;
    }
}

/// [`embedded_io_async::Write`] into a growable buffer.
pub struct VecWriter(Vec<u8>);

impl VecWriter {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl embedded_io_async::ErrorType for VecWriter {
    type Error = Infallible;
}

impl embedded_io_async::Write for VecWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
