//! Sync session state machine.
//!
//! One [`SyncEngine`] drives the whole transfer lifecycle: scan → select →
//! connect → serve → done. It runs in a single cooperative context; the
//! firmware calls [`SyncEngine::poll`] periodically and
//! [`SyncEngine::handle_key`] for discrete key events, and the two never
//! interleave. The only asynchronous operation is the WiFi scan, submitted
//! once through [`SyncRadio`] and polled to completion.
//!
//! Session state is a tagged union: each state carries only its own payload
//! (the password buffer exists only while one is being entered or tried), so
//! illegal state/data combinations are unrepresentable. The session context
//! is constructed at start and destroyed at stop; the radio is torn down
//! unconditionally on every exit path.

use core::fmt::Write as _;
use core::net::Ipv4Addr;

use embassy_time::Instant;
use heapless::Vec;
use log::{info, warn};

use crate::config::{
    CONNECT_TIMEOUT, DONE_DISPLAY_TIME, LogLine, MAX_LOG_LINES, MAX_NETWORKS, PasswordString,
    SYNC_IDLE_TIMEOUT, SsidString, StatusString, bounded,
};
use crate::creds::{CredentialStore, KvStore};

/// Raw scan results before deduplication.
pub const MAX_SCAN_HITS: usize = 32;

/// Discrete input events, already translated from scancodes by the keyboard
/// collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Up,
    Down,
    Enter,
    Escape,
    Backspace,
    Char(char),
}

/// One raw access point sighting from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit {
    pub ssid: SsidString,
    pub rssi: i8,
    pub encrypted: bool,
}

/// Non-blocking scan completion status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus {
    Pending,
    Failed,
    Complete(Vec<ScanHit, MAX_SCAN_HITS>),
}

/// Radio capability consumed by the engine. The firmware bridges this onto
/// the actual WiFi controller; tests substitute a scripted fake.
pub trait SyncRadio {
    /// Submit an asynchronous scan. Completion is observed via
    /// [`SyncRadio::scan_status`].
    fn start_scan(&mut self);
    fn scan_status(&mut self) -> ScanStatus;
    /// Begin a connection attempt. Progress is observed via
    /// [`SyncRadio::link_up`]; the engine owns the timeout.
    fn connect(&mut self, ssid: &str, password: &str);
    fn disconnect(&mut self);
    fn link_up(&mut self) -> bool;
    fn local_ip(&mut self) -> Option<Ipv4Addr>;
    /// Advertise the device hostname on the local network.
    fn start_discovery(&mut self);
    fn stop_discovery(&mut self);
    fn power_off(&mut self);
}

/// One deduplicated, sorted network list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    pub ssid: SsidString,
    pub rssi: i8,
    pub encrypted: bool,
    pub saved: bool,
}

/// How the password for the current connection attempt was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Loaded from the credential store. `auto_connect` distinguishes the
    /// startup shortcut from a manual list selection.
    Stored { auto_connect: bool },
    /// Typed into the password prompt this session.
    Typed,
    /// Unencrypted network; no password involved.
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Scanning,
    NetworkList,
    PasswordEntry {
        password: PasswordString,
    },
    Connecting {
        ssid: SsidString,
        password: PasswordString,
        source: CredentialSource,
        started: Instant,
    },
    /// Connected with a freshly typed password; offer to persist it.
    SavePrompt {
        ssid: SsidString,
        password: PasswordString,
    },
    /// A stored credential failed; offer to erase it.
    ForgetPrompt {
        ssid: SsidString,
    },
    Syncing {
        last_activity: Instant,
    },
    Done {
        since: Instant,
    },
    ConnectFailed,
}

/// Per-session context. Created at start, destroyed at stop; there is no
/// ambient session state outside this struct.
struct SyncSession {
    state: SyncState,
    networks: Vec<NetworkRecord, MAX_NETWORKS>,
    selected: usize,
    status: StatusString,
    files_sent: u32,
    files_received: u32,
    log: Vec<LogLine, MAX_LOG_LINES>,
}

impl SyncSession {
    fn new() -> Self {
        Self {
            state: SyncState::Scanning,
            networks: Vec::new(),
            selected: 0,
            status: StatusString::new(),
            files_sent: 0,
            files_received: 0,
            log: Vec::new(),
        }
    }
}

pub struct SyncEngine<R: SyncRadio, K: KvStore> {
    pub(crate) radio: R,
    creds: CredentialStore<K>,
    session: Option<SyncSession>,
    redraw: bool,
}

impl<R: SyncRadio, K: KvStore> SyncEngine<R, K> {
    pub fn new(radio: R, creds: CredentialStore<K>) -> Self {
        Self {
            radio,
            creds,
            session: None,
            redraw: false,
        }
    }

    /// Begin a sync session: auto-connect to the first stored credential if
    /// one exists, otherwise start scanning. No-op while already active.
    pub fn start(&mut self, now: Instant) {
        if self.session.is_some() {
            return;
        }
        let mut session = SyncSession::new();
        match self.creds.first() {
            Ok(Some(cred)) => {
                info!("auto-connecting to saved network {}", cred.ssid);
                self.begin_connect(
                    &mut session,
                    cred.ssid,
                    cred.password,
                    CredentialSource::Stored { auto_connect: true },
                    now,
                );
            }
            _ => self.begin_scan(&mut session),
        }
        self.session = Some(session);
        self.redraw = true;
    }

    /// Destroy the session and tear the radio down. Safe to call twice.
    pub fn stop(&mut self) {
        if self.session.take().is_none() {
            return;
        }
        self.teardown();
        info!("sync session stopped");
    }

    /// Advance scan/connection/timeout state. Called periodically from the
    /// firmware's main loop; never blocks.
    pub fn poll(&mut self, now: Instant) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let mut stop = false;
        match &session.state {
            SyncState::Scanning => self.process_scan(&mut session),
            SyncState::Connecting { .. } => self.poll_connection(&mut session, now),
            SyncState::Syncing { last_activity } => {
                if now - *last_activity >= SYNC_IDLE_TIMEOUT {
                    info!(
                        "idle timeout: no requests for {}s",
                        SYNC_IDLE_TIMEOUT.as_secs()
                    );
                    self.enter_done(&mut session, now);
                }
            }
            SyncState::Done { since } => {
                if now - *since >= DONE_DISPLAY_TIME {
                    stop = true;
                }
            }
            _ => {}
        }
        if stop {
            self.teardown();
        } else {
            self.session = Some(session);
        }
    }

    /// Dispatch one key event against the current state.
    pub fn handle_key(&mut self, key: KeyEvent, now: Instant) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if self.dispatch_key(&mut session, key, now) {
            self.teardown();
            info!("sync session stopped");
        } else {
            self.session = Some(session);
        }
    }

    /// Returns true when the session should end.
    fn dispatch_key(&mut self, session: &mut SyncSession, key: KeyEvent, now: Instant) -> bool {
        match &mut session.state {
            SyncState::Scanning => matches!(key, KeyEvent::Escape),

            SyncState::NetworkList => match key {
                KeyEvent::Down if !session.networks.is_empty() => {
                    session.selected = (session.selected + 1) % session.networks.len();
                    self.redraw = true;
                    false
                }
                KeyEvent::Up if !session.networks.is_empty() => {
                    let len = session.networks.len();
                    session.selected = (session.selected + len - 1) % len;
                    self.redraw = true;
                    false
                }
                KeyEvent::Enter if !session.networks.is_empty() => {
                    self.select_network(session, now);
                    false
                }
                KeyEvent::Escape => true,
                _ => false,
            },

            SyncState::PasswordEntry { password } => {
                match key {
                    KeyEvent::Enter => {
                        if !password.is_empty() {
                            let password = password.clone();
                            let ssid = session.networks[session.selected].ssid.clone();
                            self.begin_connect(
                                session,
                                ssid,
                                password,
                                CredentialSource::Typed,
                                now,
                            );
                        }
                    }
                    KeyEvent::Escape => {
                        session.state = SyncState::NetworkList;
                        self.redraw = true;
                    }
                    KeyEvent::Backspace => {
                        if password.pop().is_some() {
                            self.redraw = true;
                        }
                    }
                    KeyEvent::Char(c) => {
                        if (c == ' ' || c.is_ascii_graphic()) && password.push(c).is_ok() {
                            self.redraw = true;
                        }
                    }
                    _ => {}
                }
                false
            }

            SyncState::Connecting { source, .. } => {
                // The timeout owns failure; Escape is the only input honored.
                if matches!(key, KeyEvent::Escape) {
                    let auto = matches!(
                        source,
                        CredentialSource::Stored { auto_connect: true }
                    );
                    self.radio.disconnect();
                    if auto {
                        self.begin_scan(session);
                    } else {
                        session.state = SyncState::NetworkList;
                        self.redraw = true;
                    }
                }
                false
            }

            SyncState::SavePrompt { ssid, password } => {
                match key {
                    KeyEvent::Up | KeyEvent::Enter => {
                        let (ssid, password) = (ssid.clone(), password.clone());
                        if let Err(e) = self.creds.upsert(&ssid, &password) {
                            warn!("could not persist credential for {ssid}: {e:?}");
                        }
                        self.enter_syncing(session, now);
                    }
                    KeyEvent::Down | KeyEvent::Escape => self.enter_syncing(session, now),
                    _ => {}
                }
                false
            }

            SyncState::ForgetPrompt { ssid } => {
                match key {
                    KeyEvent::Up | KeyEvent::Enter => {
                        let ssid = ssid.clone();
                        if let Err(e) = self.creds.forget(&ssid) {
                            warn!("could not erase credential for {ssid}: {e:?}");
                        }
                        self.begin_scan(session);
                    }
                    KeyEvent::Down | KeyEvent::Escape => self.begin_scan(session),
                    _ => {}
                }
                false
            }

            SyncState::Syncing { .. } => matches!(key, KeyEvent::Escape),

            // Any key dismisses the summary immediately.
            SyncState::Done { .. } => true,

            SyncState::ConnectFailed => match key {
                KeyEvent::Enter => {
                    self.begin_scan(session);
                    false
                }
                KeyEvent::Escape => true,
                _ => false,
            },
        }
    }

    fn select_network(&mut self, session: &mut SyncSession, now: Instant) {
        let net = session.networks[session.selected].clone();
        match self.creds.lookup(&net.ssid) {
            Ok(Some(password)) => self.begin_connect(
                session,
                net.ssid,
                password,
                CredentialSource::Stored {
                    auto_connect: false,
                },
                now,
            ),
            _ if !net.encrypted => self.begin_connect(
                session,
                net.ssid,
                PasswordString::new(),
                CredentialSource::Open,
                now,
            ),
            _ => {
                session.state = SyncState::PasswordEntry {
                    password: PasswordString::new(),
                };
                self.redraw = true;
            }
        }
    }

    fn begin_scan(&mut self, session: &mut SyncSession) {
        session.networks.clear();
        session.selected = 0;
        session.status = bounded("Scanning...");
        self.radio.start_scan();
        session.state = SyncState::Scanning;
        self.redraw = true;
        info!("wifi scan started");
    }

    fn process_scan(&mut self, session: &mut SyncSession) {
        let hits = match self.radio.scan_status() {
            ScanStatus::Pending => return,
            ScanStatus::Failed => {
                session.networks.clear();
                session.status = bounded("Scan failed");
                session.state = SyncState::NetworkList;
                self.redraw = true;
                return;
            }
            ScanStatus::Complete(hits) => hits,
        };

        session.networks.clear();
        for hit in &hits {
            // Hidden networks report an empty name.
            if hit.ssid.is_empty() {
                continue;
            }
            if let Some(existing) = session.networks.iter_mut().find(|n| n.ssid == hit.ssid) {
                if hit.rssi > existing.rssi {
                    existing.rssi = hit.rssi;
                }
                continue;
            }
            let saved = self.creds.contains(&hit.ssid);
            let _ = session.networks.push(NetworkRecord {
                ssid: hit.ssid.clone(),
                rssi: hit.rssi,
                encrypted: hit.encrypted,
                saved,
            });
        }

        // Saved networks first, then by descending signal strength.
        session
            .networks
            .sort_unstable_by(|a, b| b.saved.cmp(&a.saved).then(b.rssi.cmp(&a.rssi)));

        session.selected = 0;
        session.status = if session.networks.is_empty() {
            bounded("No networks found")
        } else {
            StatusString::new()
        };
        session.state = SyncState::NetworkList;
        self.redraw = true;
        info!("scan complete: {} networks", session.networks.len());
    }

    fn begin_connect(
        &mut self,
        session: &mut SyncSession,
        ssid: SsidString,
        password: PasswordString,
        source: CredentialSource,
        now: Instant,
    ) {
        self.radio.disconnect();
        self.radio.connect(&ssid, &password);
        session.status.clear();
        let _ = write!(session.status, "Connecting to {ssid}...");
        info!("connecting to {ssid}");
        session.state = SyncState::Connecting {
            ssid,
            password,
            source,
            started: now,
        };
        self.redraw = true;
    }

    fn poll_connection(&mut self, session: &mut SyncSession, now: Instant) {
        let (ssid, password, source, started) = match &session.state {
            SyncState::Connecting {
                ssid,
                password,
                source,
                started,
            } => (ssid.clone(), password.clone(), *source, *started),
            _ => return,
        };

        if self.radio.link_up() {
            match source {
                CredentialSource::Typed => {
                    session.status = ip_status(self.radio.local_ip());
                    session.state = SyncState::SavePrompt { ssid, password };
                    self.redraw = true;
                }
                _ => self.enter_syncing(session, now),
            }
            return;
        }

        if now - started >= CONNECT_TIMEOUT {
            warn!("connection to {ssid} timed out");
            self.radio.disconnect();
            session.status = bounded("Connection failed");
            session.state = match source {
                CredentialSource::Stored { .. } => SyncState::ForgetPrompt { ssid },
                _ => SyncState::ConnectFailed,
            };
            self.redraw = true;
        }
    }

    fn enter_syncing(&mut self, session: &mut SyncSession, now: Instant) {
        session.files_sent = 0;
        session.files_received = 0;
        session.log.clear();
        self.radio.start_discovery();
        session.status = ip_status(self.radio.local_ip());
        session.state = SyncState::Syncing { last_activity: now };
        self.redraw = true;
        info!("serving at {}", session.status);
    }

    fn enter_done(&mut self, session: &mut SyncSession, now: Instant) {
        self.radio.stop_discovery();
        self.radio.disconnect();
        self.radio.power_off();

        session.status.clear();
        if session.files_sent == 0 && session.files_received == 0 {
            session.status = bounded("No changes");
        } else {
            let _ = write!(
                session.status,
                "Sent: {}  Received: {}",
                session.files_sent, session.files_received
            );
        }
        session.state = SyncState::Done { since: now };
        self.redraw = true;
        info!("sync done: {}", session.status);
    }

    fn teardown(&mut self) {
        self.radio.stop_discovery();
        self.radio.disconnect();
        self.radio.power_off();
        self.redraw = true;
    }

    // ---- transfer protocol feedback -------------------------------------

    /// Every HTTP request refreshes the idle clock.
    pub fn note_activity(&mut self, now: Instant) {
        if let Some(session) = self.session.as_mut()
            && let SyncState::Syncing { last_activity } = &mut session.state
        {
            *last_activity = now;
        }
    }

    /// A file left the device; count it and log it.
    pub fn record_sent(&mut self, filename: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.files_sent += 1;
        push_log(&mut session.log, "Sent: ", filename);
        self.redraw = true;
    }

    /// The peer signaled completion; end the serving window.
    pub fn complete_sync(&mut self, now: Instant) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if matches!(session.state, SyncState::Syncing { .. }) {
            info!("peer signaled sync complete");
            self.enter_done(&mut session, now);
        }
        self.session = Some(session);
    }

    // ---- read-only accessors for the UI collaborator --------------------

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// True while the HTTP server should accept requests.
    pub fn is_serving(&self) -> bool {
        matches!(
            self.session.as_ref().map(|s| &s.state),
            Some(SyncState::Syncing { .. })
        )
    }

    pub fn state(&self) -> Option<&SyncState> {
        self.session.as_ref().map(|s| &s.state)
    }

    pub fn networks(&self) -> &[NetworkRecord] {
        self.session.as_ref().map_or(&[], |s| &s.networks)
    }

    pub fn selected_network(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.selected)
    }

    /// The in-progress password buffer, empty outside password entry.
    pub fn password(&self) -> &str {
        match self.session.as_ref().map(|s| &s.state) {
            Some(SyncState::PasswordEntry { password }) => password,
            _ => "",
        }
    }

    pub fn status_text(&self) -> &str {
        self.session.as_ref().map_or("", |s| &s.status)
    }

    pub fn files_sent(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.files_sent)
    }

    pub fn files_received(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.files_received)
    }

    pub fn log_lines(&self) -> &[LogLine] {
        self.session.as_ref().map_or(&[], |s| &s.log)
    }

    pub fn credentials_mut(&mut self) -> &mut CredentialStore<K> {
        &mut self.creds
    }

    /// Consume the redraw-needed flag raised on every visible change.
    pub fn take_redraw(&mut self) -> bool {
        core::mem::replace(&mut self.redraw, false)
    }
}

fn ip_status(ip: Option<Ipv4Addr>) -> StatusString {
    let mut status = StatusString::new();
    if let Some(ip) = ip {
        let _ = write!(status, "{ip}");
    }
    status
}

/// Shift-and-append: the oldest line falls off once the log is full.
fn push_log(log: &mut Vec<LogLine, MAX_LOG_LINES>, prefix: &str, filename: &str) {
    if log.is_full() {
        log.remove(0);
    }
    let mut line = LogLine::new();
    let _ = line.push_str(prefix);
    for c in filename.chars() {
        if line.push(c).is_err() {
            break;
        }
    }
    let _ = log.push(line);
}
