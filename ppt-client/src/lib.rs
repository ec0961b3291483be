//! # PPT Client
//!
//! A Rust client library for the command interface of the PPT, the controller of a
//! detector module's I/O boards and readout ASICs.
//!
//! ## Overview
//!
//! All hardware access goes through the [Transport] trait. Two implementations exist:
//!
//! - [PptClient]: talks to real hardware over a persistent TCP connection and moves
//!   large payloads through the passive-mode transfer server of the PPT
//! - [journal::Journal]: a simulation transport that appends every hardware access to
//!   a journal instead, so that the generated traffic can be inspected without hardware
//!
//! For detailed protocol information, see the [`ppt_protocol`] crate.
//!
//! ## Basic Usage
//!
//! ### Connecting to a PPT
//!
//! ```ignore
//! use ppt_client::{PptClient, Transport};
//! use ppt_protocol::Command;
//!
//! let mut client = PptClient::connect("192.168.0.125:2384")?;
//!
//! // Read the FPGA build date register
//! let value = client.scalar(&Command::EpcRead { address: 12 })?;
//! println!("Register 12: {:#x}", value);
//! ```
//!
//! ### Transferring Files
//!
//! ```ignore
//! client.upload("cmdsFromSoftware", b"34\n2\nff\nff\n")?;
//! client.checked(&Command::StartJtagProgramming)?;
//! let readback = client.download("ReadBackJtagCommands")?;
//! ```
//!
//! ## Timeouts and Cancellation
//!
//! Connecting and sending use a send timeout, waiting for replies a receive timeout.
//! Both are configured through [client::Builder]. A
//! [`CancellationToken`](tokio_util::sync::CancellationToken) may be attached, which is
//! checked before every round trip.
pub mod client;
pub mod error;
pub mod journal;
pub mod transfer;

pub use client::PptClient;
pub use error::Error;

use ppt_protocol::{Command, Reply};

/// Access to a PPT, either real or simulated.
///
/// Implementations must process requests strictly in order and never have more than
/// one request in flight.
pub trait Transport {
    /// Sends `command` and returns its reply.
    ///
    /// The reply is guaranteed to echo the code of `command`.
    fn exchange(&mut self, command: &Command) -> Result<Reply, Error>;

    /// Stores `contents` as the file `name` on the PPT.
    fn upload(&mut self, name: &str, contents: &[u8]) -> Result<(), Error>;

    /// Fetches the file `name` from the PPT.
    fn download(&mut self, name: &str) -> Result<Vec<u8>, Error>;

    /// Whether requests are journaled instead of reaching hardware.
    fn is_simulated(&self) -> bool {
        false
    }

    /// Notes that `len` bytes of readback data were expected from `engine`.
    fn record_readback(&mut self, _engine: u32, _len: usize) -> Result<(), Error> {
        Ok(())
    }

    fn scalar(&mut self, command: &Command) -> Result<u32, Error> {
        let reply = self.exchange(command)?;
        reply.scalar().map_err(|err| {
            log::error!("Unexpected reply to {}: {}", command.code(), reply);
            err.into()
        })
    }

    fn wide(&mut self, command: &Command) -> Result<u64, Error> {
        let reply = self.exchange(command)?;
        reply.wide().map_err(|err| {
            log::error!("Unexpected reply to {}: {}", command.code(), reply);
            err.into()
        })
    }

    fn vector(&mut self, command: &Command) -> Result<Vec<u32>, Error> {
        let reply = self.exchange(command)?;
        reply.vector().map_err(|err| {
            log::error!("Unexpected reply to {}: {}", command.code(), reply);
            err.into()
        })
    }

    /// Sends `command` and requires a reply of zero.
    fn checked(&mut self, command: &Command) -> Result<(), Error> {
        match self.scalar(command)? {
            0 => Ok(()),
            code => {
                log::error!("{} failed with code {}", command.code(), code);
                Err(Error::Rejected {
                    command: command.code(),
                    code,
                })
            }
        }
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn exchange(&mut self, command: &Command) -> Result<Reply, Error> {
        (**self).exchange(command)
    }

    fn upload(&mut self, name: &str, contents: &[u8]) -> Result<(), Error> {
        (**self).upload(name, contents)
    }

    fn download(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        (**self).download(name)
    }

    fn is_simulated(&self) -> bool {
        (**self).is_simulated()
    }

    fn record_readback(&mut self, engine: u32, len: usize) -> Result<(), Error> {
        (**self).record_readback(engine, len)
    }
}
