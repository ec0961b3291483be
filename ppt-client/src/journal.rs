//! Simulation transport.
//!
//! A [Journal] never touches hardware. Every request that would change or read hardware
//! state is appended to a journal as hex words, one per line, in the layout of the
//! register engine of the PPT: the engine address, the number of data words, then the
//! data words themselves. Reads are marked by adding [READ_MARKER] to the address.
use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
};

use ppt_protocol::{Command, Reply};

use crate::{Transport, error::Error};

/// Added to an engine address to mark a read access.
pub const READ_MARKER: u32 = 0x100_0000;

pub const MULTI_PURPOSE_ADDRESS: u32 = 8;
pub const AURORA_RX_CONTROL_ADDRESS: u32 = 84;
pub const ETHERNET_RESET_ADDRESS: u32 = 108;
pub const JTAG_STATUS_ADDRESS: u32 = 144;

const IOB_ENGINE_ADDRESS: u32 = 28;
const IOB_AURORA_RESET: u32 = 0x514;
const IOB_START_SEND: u32 = 0xa0;
const IOB_START_READ: u32 = 0xa1;
const IOB_WRITE: u32 = 0x29;
const IOB_READ: u32 = 0x28;

/// Address of the register engine that talks to the I/O board in slot `module`.
pub fn iob_engine_address(module: u8) -> u32 {
    IOB_ENGINE_ADDRESS + (u32::from(module.max(1)) - 1) * 4
}

/// Address of the JTAG engine of the ASIC chain of `module`.
pub fn jtag_engine_address(module: u8) -> u32 {
    52 + (u32::from(module.max(1)) - 1) * 4
}

pub struct Journal<W: Write> {
    writer: W,
}

impl Journal<BufWriter<File>> {
    /// Appends to the journal file at `path`, creating it if necessary.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Journal<BufWriter<File>>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Journal::new(BufWriter::new(file)))
    }
}

impl<W: Write> Journal<W> {
    pub fn new(writer: W) -> Journal<W> {
        Journal { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn record(&mut self, words: &[u32]) -> io::Result<()> {
        for word in words {
            writeln!(self.writer, "{:x}", word)?;
        }
        self.writer.flush()
    }

    fn record_epc_write(&mut self, address: u32, value: u32) -> io::Result<()> {
        self.record(&[address, 1, value])
    }

    fn record_iob_write(&mut self, module: u8, address: u32, value: u32) -> io::Result<()> {
        self.record(&[
            iob_engine_address(module),
            8,
            IOB_START_SEND,
            IOB_WRITE,
            (address >> 8) & 0xff,
            address & 0xff,
            (value >> 24) & 0xff,
            (value >> 16) & 0xff,
            (value >> 8) & 0xff,
            value & 0xff,
        ])
    }

    fn record_iob_read(&mut self, module: u8, address: u32) -> io::Result<()> {
        let engine = iob_engine_address(module);
        self.record(&[
            engine,
            4,
            IOB_START_READ,
            IOB_READ,
            (address >> 8) & 0xff,
            address & 0xff,
            engine + READ_MARKER,
            5,
        ])
    }

    /// Records the engine words of a direct write payload `<n>;<w0>;...;<wn-1>$`.
    fn record_direct_write(&mut self, payload: &str) -> Result<(), Error> {
        let words = payload
            .trim_end_matches('$')
            .split(';')
            .map(|word| u32::from_str_radix(word, 16))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| Error::Protocol(err.into()))?;
        match words.split_first() {
            Some((count, words)) if *count as usize == words.len() => Ok(self.record(words)?),
            _ => Err(Error::Protocol(ppt_protocol::error::ReadError::InvalidFormat(
                format!("Malformed direct write payload {}", payload),
            ))),
        }
    }

    fn record_command(&mut self, command: &Command) -> Result<(), Error> {
        match command {
            Command::EpcWrite { address, value } => self.record_epc_write(*address, *value)?,
            Command::EpcRead { address } => self.record(&[address + READ_MARKER, 1])?,
            Command::IobWrite {
                module,
                address,
                value,
            } => self.record_iob_write(*module, *address, *value)?,
            Command::IobRead { module, address } => self.record_iob_read(*module, *address)?,
            Command::ResetAll(true) => {
                self.record_epc_write(MULTI_PURPOSE_ADDRESS, 0x800f)?;
                self.record_epc_write(MULTI_PURPOSE_ADDRESS, 0)?;
                self.record_epc_write(AURORA_RX_CONTROL_ADDRESS, 0x4000_0000)?;
                self.record_iob_write(1, IOB_AURORA_RESET, 1)?;
                self.record_epc_write(ETHERNET_RESET_ADDRESS, 0xf)?;
                self.record_epc_write(MULTI_PURPOSE_ADDRESS, 0x840f)?;
            }
            Command::ResetAll(false) => {
                self.record_epc_write(MULTI_PURPOSE_ADDRESS, 0)?;
                self.record_epc_write(AURORA_RX_CONTROL_ADDRESS, 0)?;
                self.record_iob_write(1, IOB_AURORA_RESET, 1)?;
                self.record_epc_write(ETHERNET_RESET_ADDRESS, 0)?;
            }
            Command::ResetJtag { module } => {
                self.record(&[jtag_engine_address(*module), 1, 0xff])?
            }
            Command::WaitJtag { .. } => self.record(&[JTAG_STATUS_ADDRESS + READ_MARKER, 1])?,
            Command::DirectWrite(payload) => self.record_direct_write(payload)?,
            other => log::debug!("Simulation: {} leaves no journal record", other.code()),
        }
        Ok(())
    }
}

impl<W: Write> Transport for Journal<W> {
    fn exchange(&mut self, command: &Command) -> Result<Reply, Error> {
        log::debug!("Simulation: {}", command);
        self.record_command(command)?;
        Ok(match command {
            Command::SibReceive => Reply::vector_answer(command, 0, &[]),
            _ => Reply::answer(command, 0),
        })
    }

    /// The file contents are appended to the journal.
    fn upload(&mut self, name: &str, contents: &[u8]) -> Result<(), Error> {
        log::debug!("Simulation: journaling {} ({} bytes)", name, contents.len());
        self.writer.write_all(contents)?;
        self.writer.flush()?;
        Ok(())
    }

    fn download(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        log::debug!("Simulation: {} is empty", name);
        Ok(Vec::new())
    }

    fn is_simulated(&self) -> bool {
        true
    }

    fn record_readback(&mut self, engine: u32, len: usize) -> Result<(), Error> {
        self.record(&[engine + READ_MARKER, len as u32])?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn journal_of(commands: &[Command]) -> String {
        let mut journal = Journal::new(Vec::new());
        for command in commands {
            assert_eq!(journal.scalar(command).unwrap(), 0);
        }
        String::from_utf8(journal.into_inner()).unwrap()
    }

    #[test]
    fn epc_records() {
        let text = journal_of(&[
            Command::EpcWrite {
                address: 104,
                value: 0x1f,
            },
            Command::EpcRead { address: 12 },
        ]);
        assert_eq!(text, "68\n1\n1f\n100000c\n1\n");
    }

    #[test]
    fn iob_records() {
        let text = journal_of(&[
            Command::IobWrite {
                module: 2,
                address: 0x514,
                value: 0x0102_0304,
            },
            Command::IobRead {
                module: 1,
                address: 16,
            },
        ]);
        assert_eq!(
            text,
            "20\n8\na0\n29\n5\n14\n1\n2\n3\n4\n1c\n4\na1\n28\n0\n10\n100001c\n5\n"
        );
    }

    #[test]
    fn reset_all_records() {
        let text = journal_of(&[Command::ResetAll(true), Command::ResetAll(false)]);
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines[..9], ["8", "1", "800f", "8", "1", "0", "54", "1", "40000000"]);
        assert_eq!(lines[19..28], ["6c", "1", "f", "8", "1", "840f", "8", "1", "0"]);
        assert_eq!(lines.len(), 25 + 19);
    }

    #[test]
    fn jtag_engine_records() {
        let text = journal_of(&[
            Command::ResetJtag { module: 2 },
            Command::WaitJtag { module: 2 },
        ]);
        assert_eq!(text, "38\n1\nff\n1000090\n1\n");
    }

    #[test]
    fn direct_write_records_engine_words() {
        let text = journal_of(&[
            Command::DirectWriteLength(11),
            Command::DirectWrite("4;34;2;ff;1$".to_string()),
        ]);
        assert_eq!(text, "34\n2\nff\n1\n");
    }

    #[test]
    fn malformed_direct_write() {
        let mut journal = Journal::new(Vec::new());
        assert!(
            journal
                .exchange(&Command::DirectWrite("5;34;2$".to_string()))
                .is_err()
        );
    }
}
