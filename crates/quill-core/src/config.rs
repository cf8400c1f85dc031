//! Shared constants and bounded string aliases for the quill device.

use embassy_time::Duration;

/// Directory holding user notes on the storage device.
pub const NOTES_DIR: &str = "/notes";
/// Directory holding read-only books.
pub const BOOKS_DIR: &str = "/books";
/// The only file extension the catalogs (and the transfer protocol) serve.
pub const NOTE_EXTENSION: &str = ".txt";
/// Basename used when a title reduces to nothing filename-safe.
pub const DEFAULT_BASENAME: &str = "note";
/// Display title used when a filename reduces to nothing printable.
pub const UNTITLED_TITLE: &str = "Untitled";

/// Catalog caps. Entries beyond the cap are dropped on refresh.
pub const MAX_NOTES: usize = 64;
pub const MAX_BOOKS: usize = 32;

pub const MAX_FILENAME_LEN: usize = 64;
pub const MAX_TITLE_LEN: usize = 64;
/// The FAT driver accepts only 8.3 short names; derived basenames must fit
/// an 8-character base including any collision suffix.
pub const MAX_SHORT_BASE_LEN: usize = 8;

/// Most networks a single scan will keep after deduplication.
pub const MAX_NETWORKS: usize = 20;
/// 802.11 SSIDs are at most 32 bytes.
pub const MAX_SSID_LEN: usize = 32;
/// WPA passphrases are at most 63 characters.
pub const MAX_PASSWORD_LEN: usize = 63;

/// Session event log shown on the sync screen.
pub const MAX_LOG_LINES: usize = 6;
pub const MAX_LOG_LINE_LEN: usize = 48;
pub const MAX_STATUS_LEN: usize = 64;

/// Hostname advertised on the local network while serving.
pub const HOSTNAME: &str = "quill";
pub const HTTP_PORT: u16 = 80;
/// Download responses are streamed in chunks of this size.
pub const DOWNLOAD_CHUNK: usize = 512;

/// A connection attempt is abandoned after this window. No automatic retry.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// An idle transfer session auto-terminates after this long with no requests.
pub const SYNC_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// The transfer summary stays on screen this long before teardown.
pub const DONE_DISPLAY_TIME: Duration = Duration::from_secs(3);

pub type SsidString = heapless::String<MAX_SSID_LEN>;
pub type PasswordString = heapless::String<MAX_PASSWORD_LEN>;
pub type FilenameString = heapless::String<MAX_FILENAME_LEN>;
pub type TitleString = heapless::String<MAX_TITLE_LEN>;
pub type StatusString = heapless::String<MAX_STATUS_LEN>;
pub type LogLine = heapless::String<MAX_LOG_LINE_LEN>;

/// Copy `s` into a bounded string, truncating at the capacity boundary.
pub fn bounded<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}
