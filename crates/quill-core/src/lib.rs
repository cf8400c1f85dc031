//! Hardware-independent core library for quill
//!
//! This crate contains all platform-agnostic logic for the quill e-ink
//! note-taking device: the note/book file catalog with crash-consistent
//! saves, the rotating WiFi credential table, the sync session state
//! machine, and the embedded HTTP transfer protocol served to the desktop
//! peer.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both the
//! embedded target (ESP32-S3) and desktop hosts (for tests). Hardware is
//! reached only through the capability traits in [`storage`], [`creds`],
//! and [`engine`]; the firmware crate provides the real implementations.

#![no_std]

extern crate alloc;

pub mod config;
pub mod creds;
pub mod engine;
pub mod files;
pub mod protocol;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;
