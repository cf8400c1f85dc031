//! Learned WiFi credentials and reading positions.
//!
//! Both live in a namespaced key/value capability ([`KvStore`], NVS-style on
//! the real device). Credentials use fixed-pattern keys `ssid_<slot>` /
//! `pass_<slot>` plus a `count` key: a flat table of capacity 4. Uniqueness
//! is enforced by update-in-place; overflow overwrites the earliest-inserted
//! slot (round-robin, not a true LRU).

use core::fmt::Write as _;

use heapless::String;
use log::{debug, info};
use thiserror_no_std::Error;

use crate::config::{PasswordString, SsidString, bounded};

/// Longest value a [`KvStore`] holds (a WPA passphrase fits with room).
pub const MAX_KV_VALUE_LEN: usize = 64;
/// Key buffer capacity; `pass_<slot>` and bookmark keys both fit.
pub const MAX_KV_KEY_LEN: usize = 16;
/// NVS caps key names at 15 characters; bookmark keys are truncated to fit.
pub const MAX_BOOKMARK_KEY_LEN: usize = 15;

/// The credential table never grows past four slots.
pub const CREDENTIAL_CAPACITY: u32 = 4;

pub type KvValue = String<MAX_KV_VALUE_LEN>;
type KvKey = String<MAX_KV_KEY_LEN>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvError {
    #[error("key/value backend unavailable")]
    Unavailable,
    #[error("key/value backend is full")]
    Full,
    #[error("value exceeds the supported length")]
    ValueTooLong,
}

/// Namespaced string/integer key/value persistence, as provided by the
/// platform (NVS on the original hardware). One instance per namespace.
pub trait KvStore {
    fn get_str(&mut self, key: &str) -> Result<Option<KvValue>, KvError>;
    fn put_str(&mut self, key: &str, value: &str) -> Result<(), KvError>;
    fn get_u32(&mut self, key: &str) -> Result<Option<u32>, KvError>;
    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), KvError>;
    fn remove(&mut self, key: &str) -> Result<(), KvError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub ssid: SsidString,
    pub password: PasswordString,
}

/// Bounded persistent table of learned network credentials.
pub struct CredentialStore<K: KvStore> {
    kv: K,
}

impl<K: KvStore> CredentialStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    fn count(&mut self) -> Result<u32, KvError> {
        Ok(self
            .kv
            .get_u32("count")?
            .unwrap_or(0)
            .min(CREDENTIAL_CAPACITY))
    }

    fn slot_ssid(&mut self, slot: u32) -> Result<Option<KvValue>, KvError> {
        self.kv.get_str(&ssid_key(slot))
    }

    /// Linear scan for the stored password of `ssid`.
    pub fn lookup(&mut self, ssid: &str) -> Result<Option<PasswordString>, KvError> {
        let count = self.count()?;
        for slot in 0..count {
            if self.slot_ssid(slot)?.is_some_and(|s| s.as_str() == ssid) {
                let pass = self.kv.get_str(&pass_key(slot))?.unwrap_or_default();
                return Ok(Some(bounded(&pass)));
            }
        }
        Ok(None)
    }

    pub fn contains(&mut self, ssid: &str) -> bool {
        matches!(self.lookup(ssid), Ok(Some(_)))
    }

    /// Update in place when `ssid` is already stored; otherwise append, or
    /// overwrite the earliest-inserted slot once the table is full.
    pub fn upsert(&mut self, ssid: &str, password: &str) -> Result<(), KvError> {
        let count = self.count()?;
        for slot in 0..count {
            if self.slot_ssid(slot)?.is_some_and(|s| s.as_str() == ssid) {
                self.kv.put_str(&pass_key(slot), password)?;
                debug!("credential for {ssid} updated in slot {slot}");
                return Ok(());
            }
        }

        let slot = if count < CREDENTIAL_CAPACITY {
            count
        } else {
            count % CREDENTIAL_CAPACITY
        };
        self.kv.put_str(&ssid_key(slot), ssid)?;
        self.kv.put_str(&pass_key(slot), password)?;
        if count < CREDENTIAL_CAPACITY {
            self.kv.put_u32("count", count + 1)?;
        }
        info!("credential for {ssid} stored in slot {slot}");
        Ok(())
    }

    /// Remove the entry for `ssid`, shifting later entries down to keep the
    /// table gap-free.
    pub fn forget(&mut self, ssid: &str) -> Result<(), KvError> {
        let count = self.count()?;
        for slot in 0..count {
            if !self.slot_ssid(slot)?.is_some_and(|s| s.as_str() == ssid) {
                continue;
            }
            for j in slot..count.saturating_sub(1) {
                let next_ssid = self.kv.get_str(&ssid_key(j + 1))?.unwrap_or_default();
                let next_pass = self.kv.get_str(&pass_key(j + 1))?.unwrap_or_default();
                self.kv.put_str(&ssid_key(j), &next_ssid)?;
                self.kv.put_str(&pass_key(j), &next_pass)?;
            }
            let last = count - 1;
            self.kv.remove(&ssid_key(last))?;
            self.kv.remove(&pass_key(last))?;
            self.kv.put_u32("count", last)?;
            info!("credential for {ssid} forgotten");
            return Ok(());
        }
        Ok(())
    }

    /// Slot 0, if any entry exists. Used for opportunistic auto-connect at
    /// session start.
    pub fn first(&mut self) -> Result<Option<Credential>, KvError> {
        if self.count()? == 0 {
            return Ok(None);
        }
        let Some(ssid) = self.slot_ssid(0)? else {
            return Ok(None);
        };
        if ssid.is_empty() {
            return Ok(None);
        }
        let password = self.kv.get_str(&pass_key(0))?.unwrap_or_default();
        Ok(Some(Credential {
            ssid: bounded(&ssid),
            password: bounded(&password),
        }))
    }
}

fn ssid_key(slot: u32) -> KvKey {
    let mut key = KvKey::new();
    let _ = write!(key, "ssid_{slot}");
    key
}

fn pass_key(slot: u32) -> KvKey {
    let mut key = KvKey::new();
    let _ = write!(key, "pass_{slot}");
    key
}

/// Reading positions for the book catalog, keyed by filename with the
/// extension stripped and the rest truncated to the key limit.
pub struct Bookmarks<K: KvStore> {
    kv: K,
}

impl<K: KvStore> Bookmarks<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn position(&mut self, filename: &str) -> u32 {
        self.kv
            .get_u32(&bookmark_key(filename))
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    pub fn set_position(&mut self, filename: &str, position: u32) -> Result<(), KvError> {
        self.kv.put_u32(&bookmark_key(filename), position)
    }
}

fn bookmark_key(filename: &str) -> KvKey {
    let mut key = KvKey::new();
    for c in filename.chars() {
        if c == '.' || key.len() >= MAX_BOOKMARK_KEY_LEN || key.push(c).is_err() {
            break;
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeKv;

    fn store() -> CredentialStore<FakeKv> {
        CredentialStore::new(FakeKv::new())
    }

    #[test]
    fn lookup_finds_stored_password() {
        let mut creds = store();
        creds.upsert("Home", "hunter2").unwrap();
        creds.upsert("Cafe", "espresso").unwrap();
        assert_eq!(creds.lookup("Cafe").unwrap().unwrap().as_str(), "espresso");
        assert!(creds.lookup("Office").unwrap().is_none());
    }

    #[test]
    fn upsert_updates_in_place() {
        let mut creds = store();
        creds.upsert("Home", "old").unwrap();
        creds.upsert("Home", "new").unwrap();
        assert_eq!(creds.lookup("Home").unwrap().unwrap().as_str(), "new");
        // Still a single entry.
        creds.forget("Home").unwrap();
        assert!(creds.first().unwrap().is_none());
    }

    #[test]
    fn fifth_credential_overwrites_slot_zero() {
        let mut creds = store();
        for (ssid, pass) in [("A", "1"), ("B", "2"), ("C", "3"), ("D", "4")] {
            creds.upsert(ssid, pass).unwrap();
        }
        creds.upsert("E", "5").unwrap();

        // Slot 0 (first-inserted) was replaced; the rest survive.
        assert!(creds.lookup("A").unwrap().is_none());
        assert_eq!(creds.first().unwrap().unwrap().ssid.as_str(), "E");
        for (ssid, pass) in [("B", "2"), ("C", "3"), ("D", "4"), ("E", "5")] {
            assert_eq!(creds.lookup(ssid).unwrap().unwrap().as_str(), pass);
        }
    }

    #[test]
    fn forget_compacts_without_gaps() {
        let mut creds = store();
        for (ssid, pass) in [("A", "1"), ("B", "2"), ("C", "3")] {
            creds.upsert(ssid, pass).unwrap();
        }
        creds.forget("B").unwrap();

        assert!(creds.lookup("B").unwrap().is_none());
        assert_eq!(creds.lookup("A").unwrap().unwrap().as_str(), "1");
        assert_eq!(creds.lookup("C").unwrap().unwrap().as_str(), "3");

        // The freed slot is reused by the next insert, not left as a hole.
        creds.upsert("D", "4").unwrap();
        assert_eq!(creds.lookup("D").unwrap().unwrap().as_str(), "4");
        assert_eq!(creds.first().unwrap().unwrap().ssid.as_str(), "A");
    }

    #[test]
    fn forget_unknown_ssid_is_a_no_op() {
        let mut creds = store();
        creds.upsert("A", "1").unwrap();
        creds.forget("Z").unwrap();
        assert_eq!(creds.lookup("A").unwrap().unwrap().as_str(), "1");
    }

    #[test]
    fn first_returns_none_on_empty_table() {
        let mut creds = store();
        assert!(creds.first().unwrap().is_none());
    }

    #[test]
    fn bookmark_keys_strip_extension_and_truncate() {
        let mut bookmarks = Bookmarks::new(FakeKv::new());
        bookmarks
            .set_position("a_very_long_book_filename.txt", 1234)
            .unwrap();
        assert_eq!(bookmarks.position("a_very_long_book_filename.txt"), 1234);
        assert_eq!(bookmarks.position("other.txt"), 0);
        // NVS rejects key names longer than 15 characters.
        assert_eq!(
            bookmark_key("war_and_peace_volume_two.txt").as_str(),
            "war_and_peace_v"
        );
        assert_eq!(bookmark_key("short.txt").as_str(), "short");
    }
}
