//! Persistent key-value namespaces backed by the SD card.
//!
//! Each namespace is one postcard-encoded file under `/sys`. The whole table
//! is small (a handful of credential slots and book positions), so it is
//! loaded once at open and rewritten after every mutation. Writes go through
//! the same storage capability as notes.

use core::fmt::Write as _;

use heapless::{FnvIndexMap, String};
use log::{info, warn};
use postcard::{from_bytes, to_allocvec};
use serde::{Deserialize, Serialize};

use quill_core::creds::{KvError, KvStore, KvValue, MAX_KV_KEY_LEN};
use quill_core::storage::{PathString, StorageError, StorageService};

const KV_DIR: &str = "/sys";
/// Entries per namespace. Credentials need 9 (four slots of two keys plus
/// the count); book positions get the rest.
const KV_CAPACITY: usize = 16;

type KvKey = String<MAX_KV_KEY_LEN>;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Entry {
    Str(KvValue),
    U32(u32),
}

pub struct FlashKv<S: StorageService> {
    storage: S,
    path: PathString,
    map: FnvIndexMap<KvKey, Entry, KV_CAPACITY>,
}

impl<S: StorageService> FlashKv<S> {
    /// Open a namespace, creating `/sys` and starting empty if the backing
    /// file does not exist yet.
    pub fn open(mut storage: S, namespace: &str) -> Result<Self, KvError> {
        let mut path = PathString::new();
        write!(path, "{KV_DIR}/{namespace}.kv").map_err(|_| KvError::Unavailable)?;

        match storage.exists(KV_DIR) {
            Ok(false) => storage.mkdir(KV_DIR).map_err(map_err)?,
            Ok(true) => {}
            Err(e) => return Err(map_err(e)),
        }

        let map = match storage.file_size(&path) {
            Ok(size) => {
                let mut buf = alloc::vec![0u8; size as usize];
                let n = storage.read(&path, &mut buf).map_err(map_err)?;
                match from_bytes(&buf[..n]) {
                    Ok(map) => map,
                    Err(e) => {
                        // A truncated table is not worth bricking over.
                        warn!("kv namespace {namespace} corrupt ({e}), starting empty");
                        FnvIndexMap::new()
                    }
                }
            }
            Err(StorageError::NotFound) => FnvIndexMap::new(),
            Err(e) => return Err(map_err(e)),
        };

        info!("kv namespace {namespace} open, {} entries", map.len());
        Ok(Self { storage, path, map })
    }

    fn persist(&mut self) -> Result<(), KvError> {
        let encoded = to_allocvec(&self.map).map_err(|_| KvError::Unavailable)?;
        let written = self.storage.write(&self.path, &encoded).map_err(map_err)?;
        if written != encoded.len() {
            return Err(KvError::Unavailable);
        }
        Ok(())
    }

    fn insert(&mut self, key: &str, entry: Entry) -> Result<(), KvError> {
        let mut bounded_key = KvKey::new();
        for c in key.chars().take(MAX_KV_KEY_LEN) {
            let _ = bounded_key.push(c);
        }
        self.map
            .insert(bounded_key, entry)
            .map_err(|_| KvError::Full)?;
        self.persist()
    }
}

impl<S: StorageService> KvStore for FlashKv<S> {
    fn get_str(&mut self, key: &str) -> Result<Option<KvValue>, KvError> {
        Ok(match self.map.get(key) {
            Some(Entry::Str(value)) => Some(value.clone()),
            _ => None,
        })
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        let mut bounded = KvValue::new();
        bounded.push_str(value).map_err(|_| KvError::ValueTooLong)?;
        self.insert(key, Entry::Str(bounded))
    }

    fn get_u32(&mut self, key: &str) -> Result<Option<u32>, KvError> {
        Ok(match self.map.get(key) {
            Some(Entry::U32(value)) => Some(*value),
            _ => None,
        })
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), KvError> {
        self.insert(key, Entry::U32(value))
    }

    fn remove(&mut self, key: &str) -> Result<(), KvError> {
        if self.map.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }
}

fn map_err(e: StorageError) -> KvError {
    warn!("kv storage error: {e}");
    KvError::Unavailable
}
