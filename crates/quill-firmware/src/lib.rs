//! ESP32-S3 firmware-specific modules for quill
//!
//! This crate contains hardware-specific code that cannot compile on desktop
//! targets: SD card access over SPI, WiFi control through the radio
//! coprocessor, the keyboard matrix scanner, and the network-facing tasks
//! (HTTP transfer server and mDNS hostname discovery).
//!
//! All device logic lives in `quill-core`; this crate only implements its
//! capability traits and wires them to embassy tasks.

#![no_std]

extern crate alloc;

pub mod discovery;
pub mod keys;
pub mod kv;
pub mod radio;
pub mod sd;
pub mod server;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_time::Delay;
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::Blocking;
use esp_hal::gpio::Output;
use esp_hal::spi::master::Spi;

use quill_core::engine::SyncEngine;
use quill_core::files::FileStore;

use crate::kv::FlashKv;
use crate::radio::EspRadio;
use crate::sd::{SdStorage, SharedStorage};

/// The one SPI device on the board: the SD card slot.
pub type SdSpiDevice = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, Delay>;

/// Storage handle shared between the file store and the key-value store.
pub type DeviceStorage = SharedStorage<SdStorage<SdSpiDevice, Delay>>;

/// Everything the main loop and the network tasks contend over.
///
/// Embassy tasks cannot be generic, so the core types are pinned to their
/// concrete hardware bindings here.
pub struct CoreContext {
    pub engine: SyncEngine<EspRadio, FlashKv<DeviceStorage>>,
    pub files: FileStore<DeviceStorage>,
}

/// Only one logical owner touches the core at a time; the HTTP task holds
/// this lock for the duration of a request.
pub type CoreMutex = AsyncMutex<CriticalSectionRawMutex, CoreContext>;
