//! Keyboard matrix scanner.
//!
//! Rows are driven low one at a time; columns idle high through pull-ups
//! and read low when the key at the intersection is held. Press edges are
//! translated to [`KeyEvent`]s and pushed into a channel the main loop
//! drains; releases only update the held state.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
use esp_hal::gpio::{Input, Output};

use quill_core::engine::KeyEvent;

pub const KEY_ROWS: usize = 4;
pub const KEY_COLS: usize = 12;

/// Scan period; doubles as the debounce window.
const SCAN_INTERVAL: Duration = Duration::from_millis(20);

/// Events the main loop has not consumed yet.
pub static KEY_EVENTS: Channel<CriticalSectionRawMutex, KeyEvent, 16> = Channel::new();

// Non-printable positions, chosen outside ASCII's printable range.
const K_NONE: u8 = 0x00;
const K_ENTER: u8 = 0x0D;
const K_ESC: u8 = 0x1B;
const K_BACKSPACE: u8 = 0x08;
const K_SHIFT: u8 = 0x0E;
const K_UP: u8 = 0x11;
const K_DOWN: u8 = 0x12;

#[rustfmt::skip]
const KEYMAP: [[u8; KEY_COLS]; KEY_ROWS] = [
    [b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', K_BACKSPACE],
    [b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', K_UP, K_DOWN],
    [b'a', b's', b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', K_ENTER],
    [K_SHIFT, b'z', b'x', b'c', b'v', b'b', b'n', b'm', b',', b'.', b' ', K_ESC],
];

#[rustfmt::skip]
const KEYMAP_SHIFTED: [[u8; KEY_COLS]; KEY_ROWS] = [
    [b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', K_BACKSPACE],
    [b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', K_UP, K_DOWN],
    [b'A', b'S', b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', K_ENTER],
    [K_SHIFT, b'Z', b'X', b'C', b'V', b'B', b'N', b'M', b'<', b'>', b' ', K_ESC],
];

pub struct KeyMatrix {
    pub rows: [Output<'static>; KEY_ROWS],
    pub cols: [Input<'static>; KEY_COLS],
}

fn decode(code: u8) -> Option<KeyEvent> {
    match code {
        K_NONE | K_SHIFT => None,
        K_ENTER => Some(KeyEvent::Enter),
        K_ESC => Some(KeyEvent::Escape),
        K_BACKSPACE => Some(KeyEvent::Backspace),
        K_UP => Some(KeyEvent::Up),
        K_DOWN => Some(KeyEvent::Down),
        c => Some(KeyEvent::Char(c as char)),
    }
}

#[embassy_executor::task]
pub async fn keyboard_task(mut matrix: KeyMatrix) {
    let mut held = [[false; KEY_COLS]; KEY_ROWS];

    loop {
        let mut down = [[false; KEY_COLS]; KEY_ROWS];
        for (r, row) in matrix.rows.iter_mut().enumerate() {
            row.set_low();
            // Let the lines settle before sampling.
            Timer::after(Duration::from_micros(50)).await;
            for (c, col) in matrix.cols.iter().enumerate() {
                down[r][c] = col.is_low();
            }
            row.set_high();
        }

        let shifted = down[3][0];
        for r in 0..KEY_ROWS {
            for c in 0..KEY_COLS {
                if down[r][c] && !held[r][c] {
                    let code = if shifted {
                        KEYMAP_SHIFTED[r][c]
                    } else {
                        KEYMAP[r][c]
                    };
                    if let Some(event) = decode(code)
                        && KEY_EVENTS.try_send(event).is_err()
                    {
                        log::warn!("key event dropped");
                    }
                }
                held[r][c] = down[r][c];
            }
        }

        Timer::after(SCAN_INTERVAL).await;
    }
}
