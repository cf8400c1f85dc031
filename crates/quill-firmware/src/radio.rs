//! WiFi control task and the radio capability bridge.
//!
//! The sync engine runs in the main loop and must never block, so it talks
//! to the radio through a command channel plus a handful of shared cells.
//! [`wifi_task`] owns the `WifiController` and executes commands; [`EspRadio`]
//! is the cheap handle the engine holds.

use core::cell::RefCell;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_futures::select::{Either, select};
use embassy_net::Stack;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer, with_timeout};
use esp_radio::wifi::{AuthMethod, ClientConfiguration, Configuration, WifiController};
use heapless::Vec;
use log::{debug, info, warn};

use quill_core::config::{CONNECT_TIMEOUT, PasswordString, SsidString, bounded};
use quill_core::engine::{MAX_SCAN_HITS, ScanHit, ScanStatus, SyncRadio};

/// How often the link/IP cells are refreshed while no command is pending.
const STATUS_REFRESH: Duration = Duration::from_millis(500);

enum RadioCommand {
    StartScan,
    Connect {
        ssid: SsidString,
        password: PasswordString,
    },
    Disconnect,
    PowerOff,
}

static RADIO_COMMANDS: Channel<CriticalSectionRawMutex, RadioCommand, 4> = Channel::new();
static SCAN_RESULT: BlockingMutex<CriticalSectionRawMutex, RefCell<Option<ScanStatus>>> =
    BlockingMutex::new(RefCell::new(None));
static LINK_UP: AtomicBool = AtomicBool::new(false);
/// Local IPv4 address as a big-endian word; zero means none.
static LOCAL_IP: AtomicU32 = AtomicU32::new(0);
/// Gates the mDNS responder; flipped by the engine around the serving window.
pub(crate) static DISCOVERY_ENABLED: AtomicBool = AtomicBool::new(false);

/// [`SyncRadio`] implementation handed to the engine. All methods complete
/// immediately; the work happens in [`wifi_task`].
pub struct EspRadio;

impl EspRadio {
    pub fn new() -> Self {
        Self
    }

    fn send(&self, command: RadioCommand) {
        if RADIO_COMMANDS.try_send(command).is_err() {
            warn!("radio command queue full, command dropped");
        }
    }
}

impl SyncRadio for EspRadio {
    fn start_scan(&mut self) {
        SCAN_RESULT.lock(|cell| cell.borrow_mut().take());
        self.send(RadioCommand::StartScan);
    }

    fn scan_status(&mut self) -> ScanStatus {
        SCAN_RESULT
            .lock(|cell| cell.borrow_mut().take())
            .unwrap_or(ScanStatus::Pending)
    }

    fn connect(&mut self, ssid: &str, password: &str) {
        self.send(RadioCommand::Connect {
            ssid: bounded(ssid),
            password: bounded(password),
        });
    }

    fn disconnect(&mut self) {
        self.send(RadioCommand::Disconnect);
    }

    fn link_up(&mut self) -> bool {
        LINK_UP.load(Ordering::Relaxed)
    }

    fn local_ip(&mut self) -> Option<Ipv4Addr> {
        match LOCAL_IP.load(Ordering::Relaxed) {
            0 => None,
            ip => Some(Ipv4Addr::from(ip)),
        }
    }

    fn start_discovery(&mut self) {
        DISCOVERY_ENABLED.store(true, Ordering::Relaxed);
    }

    fn stop_discovery(&mut self) {
        DISCOVERY_ENABLED.store(false, Ordering::Relaxed);
    }

    fn power_off(&mut self) {
        self.send(RadioCommand::PowerOff);
    }
}

fn publish_scan(status: ScanStatus) {
    SCAN_RESULT.lock(|cell| cell.borrow_mut().replace(status));
}

async fn ensure_started(controller: &mut WifiController<'static>) -> bool {
    if matches!(controller.is_started(), Ok(true)) {
        return true;
    }
    if let Err(e) = controller.start_async().await {
        warn!("wifi start failed: {e:?}");
        return false;
    }
    true
}

/// Owns the WiFi controller for the lifetime of the firmware.
#[embassy_executor::task]
pub async fn wifi_task(mut controller: WifiController<'static>, stack: Stack<'static>) {
    loop {
        match select(
            RADIO_COMMANDS.receive(),
            Timer::after(STATUS_REFRESH),
        )
        .await
        {
            Either::First(RadioCommand::StartScan) => {
                if !ensure_started(&mut controller).await {
                    publish_scan(ScanStatus::Failed);
                    continue;
                }
                match controller.scan_with_config_async(Default::default()).await {
                    Ok(points) => {
                        let mut hits: Vec<ScanHit, MAX_SCAN_HITS> = Vec::new();
                        for ap in &points {
                            let hit = ScanHit {
                                ssid: bounded(ap.ssid.as_str()),
                                rssi: ap.signal_strength,
                                encrypted: !matches!(ap.auth_method, Some(AuthMethod::None)),
                            };
                            if hits.push(hit).is_err() {
                                break;
                            }
                        }
                        info!("scan found {} access points", hits.len());
                        publish_scan(ScanStatus::Complete(hits));
                    }
                    Err(e) => {
                        warn!("wifi scan failed: {e:?}");
                        publish_scan(ScanStatus::Failed);
                    }
                }
            }
            Either::First(RadioCommand::Connect { ssid, password }) => {
                let config = Configuration::Client(ClientConfiguration {
                    ssid: ssid.as_str().into(),
                    password: password.as_str().into(),
                    ..Default::default()
                });
                if let Err(e) = controller.set_configuration(&config) {
                    warn!("wifi configuration rejected: {e:?}");
                    continue;
                }
                if !ensure_started(&mut controller).await {
                    continue;
                }
                // The engine owns the user-visible timeout; this bound only
                // keeps the task from wedging on a hung join.
                match with_timeout(CONNECT_TIMEOUT, controller.connect_async()).await {
                    Ok(Ok(())) => info!("associated with {ssid}"),
                    Ok(Err(e)) => warn!("association with {ssid} failed: {e:?}"),
                    Err(_) => warn!("association with {ssid} timed out"),
                }
            }
            Either::First(RadioCommand::Disconnect) => {
                let _ = controller.disconnect_async().await;
                LINK_UP.store(false, Ordering::Relaxed);
                LOCAL_IP.store(0, Ordering::Relaxed);
            }
            Either::First(RadioCommand::PowerOff) => {
                let _ = controller.disconnect_async().await;
                if let Err(e) = controller.stop_async().await {
                    warn!("wifi stop failed: {e:?}");
                }
                LINK_UP.store(false, Ordering::Relaxed);
                LOCAL_IP.store(0, Ordering::Relaxed);
                debug!("wifi powered off");
            }
            Either::Second(()) => {
                // Link means associated *and* addressed: the engine moves to
                // serving only once a peer could actually reach us.
                let config = stack.config_v4();
                let up = stack.is_link_up() && config.is_some();
                LINK_UP.store(up, Ordering::Relaxed);
                let ip = config.map_or(0, |c| u32::from(c.address.address()));
                LOCAL_IP.store(ip, Ordering::Relaxed);
            }
        }
    }
}

/// Drives the network stack; must outlive every socket.
#[embassy_executor::task]
pub async fn net_task(mut runner: embassy_net::Runner<'static, esp_radio::wifi::WifiDevice<'static>>) {
    runner.run().await
}
