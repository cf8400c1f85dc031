#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_net::{DhcpConfig, StackResources};
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_time::{Delay, Duration, Instant, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::SdCard;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::rng::Rng;
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::timer::timg::TimerGroup;
use log::{debug, info, warn};
use rtt_target::rprintln;
use static_cell::StaticCell;

use quill_core::config::HOSTNAME;
use quill_core::creds::CredentialStore;
use quill_core::engine::{KeyEvent, SyncEngine};
use quill_core::files::FileStore;

use quill_firmware::keys::{KEY_EVENTS, KeyMatrix, keyboard_task};
use quill_firmware::kv::FlashKv;
use quill_firmware::radio::{EspRadio, net_task, wifi_task};
use quill_firmware::sd::{SdStorage, SharedStorage};
use quill_firmware::server::http_task;
use quill_firmware::{CoreContext, CoreMutex, discovery};

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

/// Main loop cadence: keyboard dispatch plus engine poll.
const TICK: Duration = Duration::from_millis(100);

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_print!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 98304);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    rprintln!("Embassy initialized!");

    // Radio and network stack

    let radio_init = esp_radio::init().expect("Failed to initialize Wi-Fi controller");
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(&radio_init, peripherals.WIFI, Default::default())
            .expect("Failed to initialize Wi-Fi interface");

    let mut rng = Rng::new();
    let seed = ((rng.random() as u64) << 32) | rng.random() as u64;

    let mut dhcp = DhcpConfig::default();
    dhcp.hostname = Some(HOSTNAME.try_into().expect("hostname fits"));

    static RESOURCES: StaticCell<StackResources<8>> = StaticCell::new();
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        embassy_net::Config::dhcpv4(dhcp),
        RESOURCES.init(StackResources::new()),
        seed,
    );

    spawner.spawn(net_task(runner)).expect("spawn net task");
    spawner
        .spawn(wifi_task(wifi_controller, stack))
        .expect("spawn wifi task");

    // SD card over SPI

    let spi_bus = Spi::new(peripherals.SPI2, SpiConfig::default())
        .unwrap()
        .with_sck(peripherals.GPIO12)
        .with_mosi(peripherals.GPIO11)
        .with_miso(peripherals.GPIO13);
    let cs = Output::new(peripherals.GPIO10, Level::High, OutputConfig::default());
    let spi_device = ExclusiveDevice::new(spi_bus, cs, Delay).unwrap();
    let sd_card = SdCard::new(spi_device, Delay);
    let storage = SharedStorage::new(SdStorage::new(sd_card));

    let mut files = FileStore::new(storage.clone());
    if let Err(e) = files.setup() {
        // The store keeps retrying per-operation; an absent card at boot is
        // not fatal.
        warn!("storage setup failed: {e}");
    }
    info!("{} notes, {} books", files.notes().len(), files.books().len());

    let creds_kv = FlashKv::open(storage.clone(), "wifi").expect("credential namespace");
    let engine = SyncEngine::new(EspRadio::new(), CredentialStore::new(creds_kv));

    static CORE: StaticCell<CoreMutex> = StaticCell::new();
    let core: &'static CoreMutex = CORE.init(AsyncMutex::new(CoreContext { engine, files }));

    spawner.spawn(http_task(stack, core)).expect("spawn http task");
    spawner
        .spawn(discovery::discovery_task(stack))
        .expect("spawn discovery task");

    // Keyboard matrix

    let matrix = KeyMatrix {
        rows: [
            Output::new(peripherals.GPIO1, Level::High, OutputConfig::default()),
            Output::new(peripherals.GPIO2, Level::High, OutputConfig::default()),
            Output::new(peripherals.GPIO3, Level::High, OutputConfig::default()),
            Output::new(peripherals.GPIO4, Level::High, OutputConfig::default()),
        ],
        cols: [
            Input::new(peripherals.GPIO5, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO6, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO7, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO8, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO9, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO14, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO15, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO16, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO17, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO18, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO21, InputConfig::default().with_pull(Pull::Up)),
            Input::new(peripherals.GPIO33, InputConfig::default().with_pull(Pull::Up)),
        ],
    };
    spawner.spawn(keyboard_task(matrix)).expect("spawn keyboard task");

    info!("quill ready");

    loop {
        let now = Instant::now();
        {
            let mut ctx = core.lock().await;
            while let Ok(key) = KEY_EVENTS.try_receive() {
                if ctx.engine.is_active() {
                    ctx.engine.handle_key(key, now);
                } else if key == KeyEvent::Enter {
                    // Sync is the only menu entry wired up so far; the
                    // editor and reader screens hook in here.
                    ctx.engine.start(now);
                }
            }
            ctx.engine.poll(now);
            if ctx.engine.take_redraw() {
                // The e-ink renderer consumes this flag once the panel
                // driver lands; until then surface it on the debug channel.
                debug!(
                    "state: {:?} status: {}",
                    ctx.engine.state(),
                    ctx.engine.status_text()
                );
            }
        }
        Timer::after(TICK).await;
    }
}
