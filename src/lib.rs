//! # `esp8266-at-hal`
//! This is a driver for ESP8266 modules running the Espressif AT firmware,
//! reachable only through a textual, line-delimited command/response protocol
//! over a serial link.
//! ## Driver overview
//! This chapter gives a short overview of how the driver is structured.
//!
//! ### Transactions
//! The module exposes everything as command lines followed by response lines
//! on a single half-duplex channel, so every public operation is one
//! transaction: take the channel lock, send the command, wait for the
//! expected responses, release the lock. Operations that chain several
//! commands (like [Esp8266::startup], which configures the mode and then
//! enables multiplexing) hold the lock across the whole sequence, so another
//! thread never observes a torn command stream. The engine that does the
//! actual line matching and formatting is behind the [AtEngine] trait; the
//! driver never touches the serial link directly.
//!
//! ### Out-of-band events
//! While a transaction waits for its response, the module may interleave
//! unsolicited text: inbound-data announcements (`+IPD`) and asynchronous
//! join-status reports (`+CWJAP:`). The engine dispatches those to the
//! driver's [OobHandler] synchronously, nested inside the wait that observed
//! them and on the thread already holding the channel lock. That is why the
//! packet queue and the join latch need no locking of their own, and why a
//! handler only ever sees the narrowed [OobIo] view of the engine: it must
//! not re-enter the driver. The join-status handler is also the only place
//! a wait gets cancelled, via [OobIo::abort], so a failed join returns
//! promptly instead of running out its timeout.
//!
//! ### Receive (RX)
//! An inbound-data announcement names a logical connection id (0..=4) and a
//! byte count. The handler reads exactly that many raw bytes and appends
//! them to a slab-backed packet queue, keyed by connection id. Payloads that
//! cannot be buffered are drained and dropped silently; the announcement has
//! no caller to report to. [Esp8266::recv] first drains all pending
//! out-of-band events, then serves the queue with partial-read semantics:
//! whatever the caller's buffer does not cover stays queued for the next
//! call.

#![cfg_attr(not(test), no_std)]
pub(crate) mod fmt;

mod engine;
mod esp8266;
mod packet_queue;
mod parse;

pub use engine::*;
pub use esp8266::*;

#[cfg(not(feature = "critical_section"))]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(feature = "critical_section")]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
