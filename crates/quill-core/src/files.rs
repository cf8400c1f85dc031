//! Note/book catalogs and crash-consistent file persistence.
//!
//! [`FileStore`] owns the storage capability and exposes everything the
//! editor, the UI lists, and the transfer protocol need: bounded catalogs
//! rebuilt in full on demand, deterministic title/filename derivation, and a
//! three-phase atomic save (write temp, verify, rotate backup, promote) that
//! never leaves the device without either the previous or the new content.

use core::fmt::Write as _;

use heapless::Vec;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::config::{
    BOOKS_DIR, DEFAULT_BASENAME, FilenameString, MAX_BOOKS, MAX_NOTES, MAX_SHORT_BASE_LEN,
    NOTE_EXTENSION, NOTES_DIR, TitleString, UNTITLED_TITLE, bounded,
};
use crate::storage::{PathString, StorageError, StorageService};

/// Filename suffix probing stops after `_99`.
const MAX_NAME_SUFFIX: u32 = 99;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStoreError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    /// The temp file came up short during an atomic save. The previously
    /// committed file and its backup are untouched.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    /// Every suffix `_2`..`_99` for this title is already taken.
    #[error("no unused filename suffix remains for this title")]
    NameSpaceExhausted,
}

/// One catalog entry. Mirrors the filesystem; never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: FilenameString,
    pub title: TitleString,
    /// Reserved; the storage driver does not report timestamps yet.
    pub mod_time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Notes,
    Books,
}

impl CatalogKind {
    pub fn dir(self) -> &'static str {
        match self {
            CatalogKind::Notes => NOTES_DIR,
            CatalogKind::Books => BOOKS_DIR,
        }
    }
}

/// Catalogs plus the storage capability they are rebuilt from.
pub struct FileStore<S: StorageService> {
    pub(crate) storage: S,
    notes: Vec<FileRecord, MAX_NOTES>,
    books: Vec<FileRecord, MAX_BOOKS>,
}

impl<S: StorageService> FileStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            notes: Vec::new(),
            books: Vec::new(),
        }
    }

    /// First-boot provisioning: ensure the data directories exist, then
    /// build the note catalog.
    pub fn setup(&mut self) -> Result<(), FileStoreError> {
        if !self.storage.exists(NOTES_DIR)? {
            self.storage.mkdir(NOTES_DIR)?;
        }
        if !self.storage.exists(BOOKS_DIR)? {
            self.storage.mkdir(BOOKS_DIR)?;
        }
        self.refresh(CatalogKind::Notes)?;
        Ok(())
    }

    pub fn notes(&self) -> &[FileRecord] {
        &self.notes
    }

    pub fn books(&self) -> &[FileRecord] {
        &self.books
    }

    pub fn records(&self, kind: CatalogKind) -> &[FileRecord] {
        match kind {
            CatalogKind::Notes => &self.notes,
            CatalogKind::Books => &self.books,
        }
    }

    /// Rebuild a catalog from the filesystem, then let the device sleep.
    ///
    /// Hidden entries and foreign extensions are skipped; entries beyond the
    /// catalog cap are dropped.
    pub fn refresh(&mut self, kind: CatalogKind) -> Result<usize, FileStoreError> {
        let result = match kind {
            CatalogKind::Notes => Self::scan_dir(&mut self.storage, kind.dir(), &mut self.notes),
            CatalogKind::Books => Self::scan_dir(&mut self.storage, kind.dir(), &mut self.books),
        };
        self.storage.sleep();
        match &result {
            Ok(count) => debug!("catalog {}: {count} entries", kind.dir()),
            Err(e) => warn!("catalog {} refresh failed: {e:?}", kind.dir()),
        }
        result
    }

    fn scan_dir<const N: usize>(
        storage: &mut S,
        dir: &str,
        out: &mut Vec<FileRecord, N>,
    ) -> Result<usize, FileStoreError> {
        out.clear();
        storage.iter_dir(dir, &mut |entry| {
            if out.is_full() || entry.is_directory || entry.name.starts_with('.') {
                return;
            }
            if entry.name.len() <= NOTE_EXTENSION.len() || !entry.name.ends_with(NOTE_EXTENSION) {
                return;
            }
            let record = FileRecord {
                filename: bounded(&entry.name),
                title: filename_to_title(&entry.name),
                mod_time: 0,
            };
            let _ = out.push(record);
        })?;
        Ok(out.len())
    }

    /// Derive a FAT-safe filename for `title` that does not collide with any
    /// existing note, probing `_2`..`_99` suffixes as needed.
    pub fn derive_unique_filename(
        &mut self,
        title: &str,
    ) -> Result<FilenameString, FileStoreError> {
        let name = title_to_filename(title);
        if !self.storage.exists(&note_path(&name)?)? {
            return Ok(name);
        }

        let base = name.strip_suffix(NOTE_EXTENSION).unwrap_or(&name);
        for suffix in 2..=MAX_NAME_SUFFIX {
            let mut candidate = FilenameString::new();
            write!(candidate, "{base}_{suffix}{NOTE_EXTENSION}")
                .map_err(|_| StorageError::PathTooLong)?;
            if !self.storage.exists(&note_path(&candidate)?)? {
                return Ok(candidate);
            }
        }
        Err(FileStoreError::NameSpaceExhausted)
    }

    /// Atomically replace the note `filename` with `content`.
    ///
    /// Three phases: write `content` to the `.tmp` sibling and verify the
    /// byte count (the only guarded step; a mismatch aborts with the
    /// committed file untouched), rotate the committed file to the `.bak`
    /// sibling, promote the temp file. A crash between rotation and
    /// promotion leaves the previous generation recoverable in the backup.
    pub fn save(&mut self, filename: &str, content: &[u8]) -> Result<(), FileStoreError> {
        let result = self.save_inner(filename, content);
        self.storage.sleep();
        result
    }

    fn save_inner(&mut self, filename: &str, content: &[u8]) -> Result<(), FileStoreError> {
        let path = note_path(filename)?;
        let tmp = sibling(&path, ".tmp")?;
        let bak = sibling(&path, ".bak")?;

        let written = self.storage.write(&tmp, content)?;
        if written != content.len() {
            let _ = self.storage.remove(&tmp);
            warn!("save {filename}: short write ({written}/{})", content.len());
            return Err(FileStoreError::ShortWrite {
                written,
                expected: content.len(),
            });
        }

        if self.storage.exists(&path)? {
            let _ = self.storage.remove(&bak);
            self.storage.rename(&path, &bak)?;
        }
        self.storage.rename(&tmp, &path)?;
        info!("saved {filename} ({} bytes)", content.len());
        Ok(())
    }

    /// Rename a note on storage to match a new title, if the derived
    /// filename differs, then rebuild the catalog.
    pub fn update_title(
        &mut self,
        filename: &str,
        new_title: &str,
    ) -> Result<FilenameString, FileStoreError> {
        let new_name = self.derive_unique_filename(new_title)?;
        if new_name.as_str() != filename {
            self.storage
                .rename(&note_path(filename)?, &note_path(&new_name)?)?;
        }
        self.refresh(CatalogKind::Notes)?;
        Ok(new_name)
    }

    /// Remove a note and its backup sibling, then rebuild the catalog.
    pub fn delete(&mut self, filename: &str) -> Result<(), FileStoreError> {
        let path = note_path(filename)?;
        self.storage.remove(&path)?;
        // The backup only exists once the note has been saved over.
        let _ = self.storage.remove(&sibling(&path, ".bak")?);
        self.refresh(CatalogKind::Notes)?;
        info!("deleted {filename}");
        Ok(())
    }

    /// Whole-file read for the editor collaborator.
    pub fn read_note(&mut self, filename: &str, buf: &mut [u8]) -> Result<usize, FileStoreError> {
        let path = note_path(filename)?;
        let result = self.storage.read(&path, buf);
        self.storage.sleep();
        Ok(result?)
    }

    pub fn note_size(&mut self, filename: &str) -> Result<u64, FileStoreError> {
        Ok(self.storage.file_size(&note_path(filename)?)?)
    }

    /// Chunked read used while streaming a download. Does not sleep the
    /// device between chunks; the serving loop owns that window.
    pub fn read_note_at(
        &mut self,
        filename: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, FileStoreError> {
        Ok(self.storage.read_at(&note_path(filename)?, offset, buf)?)
    }

    /// Whole-file read for the book reader collaborator.
    pub fn read_book(&mut self, filename: &str, buf: &mut [u8]) -> Result<usize, FileStoreError> {
        let mut path = PathString::new();
        write!(path, "{BOOKS_DIR}/{filename}").map_err(|_| StorageError::PathTooLong)?;
        let result = self.storage.read(&path, buf);
        self.storage.sleep();
        Ok(result?)
    }
}

fn note_path(filename: &str) -> Result<PathString, StorageError> {
    let mut path = PathString::new();
    write!(path, "{NOTES_DIR}/{filename}").map_err(|_| StorageError::PathTooLong)?;
    Ok(path)
}

/// Swap the extension of `path` for `ext`: `/notes/a.txt` -> `/notes/a.tmp`.
///
/// The extension is replaced rather than appended because the FAT driver
/// accepts only 8.3 short names; a second dot makes the name unopenable.
fn sibling(path: &str, ext: &str) -> Result<PathString, StorageError> {
    let stem = path.rsplit_once('.').map_or(path, |(stem, _)| stem);
    let mut out = PathString::new();
    write!(out, "{stem}{ext}").map_err(|_| StorageError::PathTooLong)?;
    Ok(out)
}

/// Derive the display title from a filename: `my_note_2.txt` -> `My Note 2`.
///
/// Underscores become spaces, the character after a separator is
/// capitalized, and the extension is dropped. An empty result maps to
/// "Untitled".
pub fn filename_to_title(filename: &str) -> TitleString {
    let mut out = TitleString::new();
    let mut capitalize_next = true;
    for c in filename.chars() {
        if c == '.' {
            break;
        }
        if c == '_' {
            if !out.is_empty() && out.push(' ').is_err() {
                break;
            }
            capitalize_next = true;
        } else {
            let c = if capitalize_next {
                c.to_ascii_uppercase()
            } else {
                c
            };
            capitalize_next = false;
            if out.push(c).is_err() {
                break;
            }
        }
    }
    if out.is_empty() {
        out = bounded(UNTITLED_TITLE);
    }
    out
}

/// Reduce a title to an 8.3-safe filename: lowercase, alphanumerics kept,
/// runs of space/underscore/hyphen collapsed to one `_`, trailing `_`
/// trimmed, `.txt` appended. `note.txt` when nothing survives.
pub fn title_to_filename(title: &str) -> FilenameString {
    // The base plus a `_99` collision suffix must fit a short-name base.
    let max_base = MAX_SHORT_BASE_LEN - 3;
    let mut out = FilenameString::new();
    for c in title.chars() {
        if out.len() >= max_base {
            break;
        }
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            let _ = out.push(c);
        } else if c == ' ' || c == '_' || c == '-' {
            if !out.is_empty() && !out.ends_with('_') {
                let _ = out.push('_');
            }
        }
    }
    while out.ends_with('_') {
        out.truncate(out.len() - 1);
    }
    if out.is_empty() {
        out = bounded(DEFAULT_BASENAME);
    }
    let _ = out.push_str(NOTE_EXTENSION);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStorage;

    fn store_with(files: &[(&str, &[u8])]) -> FileStore<FakeStorage> {
        let mut storage = FakeStorage::new();
        storage.mkdir(NOTES_DIR).unwrap();
        storage.mkdir(BOOKS_DIR).unwrap();
        for (path, content) in files {
            storage.seed(path, content);
        }
        FileStore::new(storage)
    }

    #[test]
    fn title_derivation_capitalizes_after_separators() {
        assert_eq!(filename_to_title("my_note_2.txt").as_str(), "My Note 2");
        assert_eq!(filename_to_title("a.txt").as_str(), "A");
        assert_eq!(filename_to_title(".txt").as_str(), "Untitled");
        assert_eq!(filename_to_title("_.txt").as_str(), "Untitled");
    }

    #[test]
    fn filename_derivation_is_fat_safe() {
        assert_eq!(title_to_filename("My Note").as_str(), "my_no.txt");
        assert_eq!(title_to_filename("Hello,   World!").as_str(), "hello.txt");
        assert_eq!(title_to_filename("--- ___ ").as_str(), "note.txt");
        assert_eq!(title_to_filename("").as_str(), "note.txt");
        assert_eq!(title_to_filename("trailing-").as_str(), "trail.txt");
    }

    #[test]
    fn derived_filenames_fit_short_name_limits() {
        // 8.3: base of at most 8 with room for a `_99` suffix, one dot.
        for title in ["Fresh Title", "War and Peace, Volume Two", "a-b-c-d-e"] {
            let name = title_to_filename(title);
            let (base, ext) = name.as_str().rsplit_once('.').unwrap();
            assert!(base.len() + 3 <= MAX_SHORT_BASE_LEN, "{name}");
            assert_eq!(ext, "txt");
            assert_eq!(name.matches('.').count(), 1);
        }
    }

    #[test]
    fn unique_filename_probes_lowest_unused_suffix() {
        let mut store = store_with(&[
            ("/notes/draft.txt", b"x"),
            ("/notes/draft_2.txt", b"x"),
            ("/notes/draft_4.txt", b"x"),
        ]);
        assert_eq!(
            store.derive_unique_filename("Draft").unwrap().as_str(),
            "draft_3.txt"
        );
    }

    #[test]
    fn unique_filename_exhaustion_is_an_error() {
        let mut store = store_with(&[("/notes/draft.txt", b"x")]);
        for suffix in 2..=99 {
            let mut path = alloc::string::String::new();
            core::fmt::write(&mut path, format_args!("/notes/draft_{suffix}.txt")).unwrap();
            store.storage.seed(&path, b"x");
        }
        assert_eq!(
            store.derive_unique_filename("Draft"),
            Err(FileStoreError::NameSpaceExhausted)
        );
    }

    #[test]
    fn three_saves_keep_the_last_two_generations() {
        let mut store = store_with(&[]);
        store.save("note.txt", b"C1").unwrap();
        store.save("note.txt", b"C2").unwrap();
        store.save("note.txt", b"C3").unwrap();
        assert_eq!(store.storage.contents("/notes/note.txt"), Some(&b"C3"[..]));
        assert_eq!(store.storage.contents("/notes/note.bak"), Some(&b"C2"[..]));
        assert!(store.storage.contents("/notes/note.tmp").is_none());
    }

    #[test]
    fn save_artifacts_use_single_dot_short_names() {
        let mut store = store_with(&[]);
        store.save("note.txt", b"C1").unwrap();
        store.save("note.txt", b"C2").unwrap();
        // Double-dotted siblings never open on the FAT driver.
        assert!(store.storage.contents("/notes/note.txt.tmp").is_none());
        assert!(store.storage.contents("/notes/note.txt.bak").is_none());
        assert_eq!(store.storage.contents("/notes/note.bak"), Some(&b"C1"[..]));
    }

    #[test]
    fn short_write_aborts_and_preserves_committed_state() {
        let mut store = store_with(&[]);
        store.save("note.txt", b"first").unwrap();
        store.save("note.txt", b"second").unwrap();

        store.storage.limit_writes_to(3);
        let err = store.save("note.txt", b"truncated").unwrap_err();
        assert_eq!(
            err,
            FileStoreError::ShortWrite {
                written: 3,
                expected: 9
            }
        );

        // Committed file and backup are byte-identical to their pre-call state.
        assert_eq!(
            store.storage.contents("/notes/note.txt"),
            Some(&b"second"[..])
        );
        assert_eq!(
            store.storage.contents("/notes/note.bak"),
            Some(&b"first"[..])
        );
        assert!(store.storage.contents("/notes/note.tmp").is_none());
    }

    #[test]
    fn refresh_skips_hidden_and_foreign_entries() {
        let mut store = store_with(&[
            ("/notes/alpha.txt", b"a"),
            ("/notes/.hidden.txt", b"h"),
            ("/notes/readme.md", b"m"),
            ("/notes/beta_two.txt", b"b"),
        ]);
        let count = store.refresh(CatalogKind::Notes).unwrap();
        assert_eq!(count, 2);
        let titles: alloc::vec::Vec<&str> =
            store.notes().iter().map(|r| r.title.as_str()).collect();
        assert!(titles.contains(&"Alpha"));
        assert!(titles.contains(&"Beta Two"));
        assert!(store.storage.sleep_count() >= 1);
    }

    #[test]
    fn refresh_caps_the_catalog() {
        let mut store = store_with(&[]);
        for i in 0..(MAX_NOTES + 10) {
            let mut path = alloc::string::String::new();
            core::fmt::write(&mut path, format_args!("/notes/note_{i}.txt")).unwrap();
            store.storage.seed(&path, b"x");
        }
        let count = store.refresh(CatalogKind::Notes).unwrap();
        assert_eq!(count, MAX_NOTES);
    }

    #[test]
    fn delete_removes_note_and_backup() {
        let mut store = store_with(&[("/notes/gone.txt", b"x"), ("/notes/gone.bak", b"y")]);
        store.delete("gone.txt").unwrap();
        assert!(store.storage.contents("/notes/gone.txt").is_none());
        assert!(store.storage.contents("/notes/gone.bak").is_none());
    }

    #[test]
    fn update_title_renames_only_when_derived_name_differs() {
        let mut store = store_with(&[("/notes/old_name.txt", b"body")]);
        let new_name = store.update_title("old_name.txt", "Fresh Title").unwrap();
        assert_eq!(new_name.as_str(), "fresh.txt");
        assert!(store.storage.contents("/notes/old_name.txt").is_none());
        assert_eq!(
            store.storage.contents("/notes/fresh.txt"),
            Some(&b"body"[..])
        );
    }

    #[test]
    fn operations_degrade_when_storage_is_unavailable() {
        let mut store = store_with(&[("/notes/a.txt", b"x")]);
        store.storage.set_available(false);
        assert!(matches!(
            store.refresh(CatalogKind::Notes),
            Err(FileStoreError::Storage(StorageError::Unavailable))
        ));
        assert!(store.save("a.txt", b"y").is_err());
    }
}
