#![no_std]
#![allow(dead_code)]

//! Open-Channel SSD controller core.
//!
//! The crate is split the same way the device is: a media manager exposes raw
//! NAND-style channels (the `mmgr` module, including the RAM-backed `volt`
//! emulator), the application FTL translates logical block addresses into
//! physical page addresses (`ftl`), and the controller core (`controller`)
//! wires both together behind a multi-queue host command pipe (`mq`).
//!
//! Everything is pump-driven: queues, media completions and garbage
//! collection advance when the embedder calls `Controller::poll`, which makes
//! the whole pipeline deterministic under test.
//! Run tests with: cargo test --target x86_64-unknown-linux-gnu --lib

extern crate alloc;

pub mod config;
pub mod controller;
pub mod ftl;
pub mod geo;
pub mod mmgr;
pub mod mq;
pub mod ppa;
pub mod rng;
pub mod sync;
