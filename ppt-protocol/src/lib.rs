//! # PPT Protocol Library
//!
//! This crate implements the messages exchanged with the PPT, the FPGA based
//! controller that configures and monitors the I/O boards and readout ASICs of a
//! detector module, together with the JTAG frame format used to configure the ASIC
//! chains.
//!
//! ## Overview
//!
//! Every low level access is a text request over a persistent TCP connection that
//! is answered by exactly one text reply. This library allows you to:
//!
//! - Serialize and parse requests ([Command])
//! - Parse replies and check that they echo the request ([Reply])
//! - Build and decode JTAG frames for daisy chained ASICs ([jtag::JtagFrame])
//!
//! ## Basic Usage
//!
//! ### Writing a Request
//!
//! ```
//! use ppt_protocol::Command;
//!
//! let mut buffer = Vec::new();
//! Command::EpcRead { address: 12 }
//!     .write_to(&mut buffer)
//!     .expect("Writing to vector shouldn't fail");
//! assert_eq!(buffer, b"cmdXFEL EPCC R 12\0");
//! ```
//!
//! ### Reading a Reply
//!
//! ```
//! use ppt_protocol::{Command, Reply};
//! use std::io::Cursor;
//!
//! let mut reader = Cursor::new(b"EPCC 42\0");
//! let reply = Reply::from_reader(&mut reader, 1000).expect("Reply should parse");
//! reply
//!     .check_echo(&Command::EpcRead { address: 12 })
//!     .expect("Reply answers the request");
//! assert_eq!(reply.scalar().unwrap(), 42);
//! ```
//!
//! ### Building a JTAG Frame
//!
//! ```
//! use ppt_protocol::jtag::{Bits, Instruction, JtagFrame};
//!
//! // Program the sequencer hold counters of the third device of a 16 device chain
//! let data = Bits::repeat(true, 40);
//! let frame = JtagFrame::addressed(16, 2, Instruction::SEQUENCER_HOLD, data, false)
//!     .expect("Frame should be valid");
//! assert_eq!(frame.encoded_len(), 5 + 10 + 5);
//! ```
//!
//! ## Message Format
//!
//! - **Request**: `cmdXFEL <CMD4> <arguments>\0`
//! - **Scalar reply**: `<CMD4> <decimal value>`
//! - **Vector reply**: `<CMD4> <retcode>;<count>;<v0>;<v1>;...`
//!
//! ## Error Handling
//!
//! Parsing errors are reported as [error::ReadError], misuse of the JTAG frame
//! format as [error::FrameError].
//!
//! ## Features
//!
//! - `tokio`: Provides [codec::DeviceCodec], a `tokio-util` codec for the device side of
//!   a connection.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
pub mod jtag;
