//! # PPT Control
//!
//! The configuration and bring-up engine for detector modules behind a PPT.
//!
//! ## Overview
//!
//! A PPT controls up to four I/O boards (IOBs). Every IOB carries a JTAG daisy chain of
//! readout ASICs. The engine keeps the last known configuration of five register
//! families and moves it to the hardware:
//!
//! | Family      | Reached through                      | Model trait       |
//! |-------------|--------------------------------------|-------------------|
//! | EPC         | `EPCC` register accesses             | [RegisterModel]   |
//! | IOB         | `IOBC` register accesses             | [RegisterModel]   |
//! | JTAG        | JTAG frames, one device per ASIC     | [RegisterModel]   |
//! | Pixel       | JTAG frames, one device per pixel    | [RegisterModel]   |
//! | Sequencer   | JTAG frames, replicated to all ASICs | [SequencerModel]  |
//!
//! The models themselves are external. The engine only relies on the traits below.
//! [memory] provides simple in-memory implementations.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use ppt_client::PptClient;
//! use ppt_control::{Builder, DeviceContext, registers::Registers};
//!
//! let registers = Arc::new(Registers::new(epc, iob, jtag, pixel, sequencer));
//! let mut controller = Builder::new().build(PptClient::connect("192.168.0.125:2384")?, registers);
//!
//! let report = controller.init_system()?;
//! if report.failed() {
//!     eprintln!("{}", report);
//! }
//! let verdict = controller.program_pixels(DeviceContext::new(1)?, true)?;
//! ```
//!
//! ## Results
//!
//! Every operation returns `Result<_, Error>`. Programming operations return a
//! [Verdict] on success, because a failed verification is an expected outcome rather
//! than an error. Failures that are also interesting to aggregating callers can be
//! mirrored into an [status::ErrorSink].
use bitvec::prelude::*;
use ppt_protocol::jtag::Bits;

pub mod bringup;
pub mod builder;
pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod memory;
pub mod names;
pub mod readback;
pub mod registers;
pub mod status;

pub use config::{Builder, Config, OutputMode, RetryPolicy, Timing, Topology};
pub use context::DeviceContext;
pub use engine::Controller;
pub use error::Error;
pub use readback::Verdict;

use registers::{BitMismatch, DeviceSelector, Layout};

/// The last known configuration of one register family.
pub trait RegisterModel: Send {
    /// Names of all module sets, in programming order.
    fn module_sets(&self) -> Vec<String>;

    fn layout(&self, set: &str) -> Option<Layout>;

    /// Bit image of the selected devices, one device after the other.
    fn content(&self, set: &str, devices: &DeviceSelector) -> Bits;

    /// Whether every device of `set` holds the same value.
    fn is_uniform(&self, set: &str) -> bool;

    /// Compares bits read from the hardware with the selected devices.
    ///
    /// Status bits, meaning all bits of read-only sets and the bits of read-only
    /// signals, always take the value read. Writable bits take the value read only with
    /// `overwrite`. Only writable bits can mismatch.
    fn compare(
        &mut self,
        bits: &BitSlice<u8, Lsb0>,
        set: &str,
        devices: &DeviceSelector,
        overwrite: bool,
    ) -> Vec<BitMismatch>;

    fn signal(&self, set: &str, device: usize, name: &str) -> Option<u32>;

    /// Returns `false` when the set or the signal do not exist.
    fn set_signal(&mut self, set: &str, devices: &DeviceSelector, name: &str, value: u32)
    -> bool;
}

/// The dynamic bits of one sequencer track.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Track {
    pub sub_address: u8,
    pub bits: Bits,
}

/// The timing generator of an ASIC. All ASICs of a chain share one configuration.
pub trait SequencerModel: Send {
    /// Derives the hold counts and track bits from the timing parameters.
    fn compile(&mut self) -> Result<(), String>;

    fn hold_bits(&self) -> Bits;

    fn tracks(&self) -> Vec<Track>;

    /// Compares the hold counts of one ASIC with the model.
    fn compare_hold(&mut self, bits: &BitSlice<u8, Lsb0>) -> Vec<BitMismatch>;

    fn compare_track(&mut self, index: usize, bits: &BitSlice<u8, Lsb0>) -> Vec<BitMismatch>;
}
