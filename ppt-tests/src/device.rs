//! What the fake PPT remembers and how it answers requests.
use std::collections::{BTreeMap, HashMap};

use ppt_control::names;
use ppt_protocol::{
    Command, Reply,
    jtag::{JtagFrame, pack_bits},
};

const OK: &str = "0";
const FAILED: &str = "1";

/// Register memory, files and request history of the fake PPT.
///
/// Every register address holds a single word. Writes are stored as given and reads
/// return the stored word, except for forced bits, which stand for status bits driven
/// by the hardware.
#[derive(Debug, Default)]
pub struct Device {
    pub(crate) epc: BTreeMap<u32, u32>,
    pub(crate) epc_forced: HashMap<u32, (u32, u32)>,
    pub(crate) iob: BTreeMap<(u8, u32), u32>,
    pub(crate) files: HashMap<String, Vec<u8>>,
    pub(crate) requests: Vec<Command>,
    pub(crate) frames: Vec<(u32, JtagFrame)>,
    pub(crate) replies: HashMap<&'static str, String>,
    pub(crate) echo: Option<String>,
    pub(crate) flip: Option<usize>,
    pub(crate) drop_readback: bool,
    pub(crate) truncate_uploads: bool,
    pub(crate) serial: u64,
    pub(crate) sib: Vec<u32>,
    readback: Vec<u8>,
    announced: Option<usize>,
}

fn parse_hex(field: &str) -> Option<u32> {
    u32::from_str_radix(field.trim(), 16).ok()
}

fn tmp_name(path: &str) -> &str {
    path.strip_prefix("/tmp/").unwrap_or(path)
}

impl Device {
    /// Answers one request and records it.
    pub fn answer(&mut self, command: Command) -> Reply {
        let body = match self.replies.get(command.code()) {
            Some(body) => body.clone(),
            None => self.execute(&command),
        };
        let code = match &self.echo {
            Some(code) => code.clone(),
            None => command.code().to_string(),
        };
        self.requests.push(command);
        Reply::new(code, body)
    }

    fn execute(&mut self, command: &Command) -> String {
        match command {
            Command::EpcRead { address } => self.read_epc(*address).to_string(),
            Command::EpcWrite { address, value } => {
                self.epc.insert(*address, *value);
                OK.to_string()
            }
            Command::IobRead { module, address } => self
                .iob
                .get(&(*module, *address))
                .copied()
                .unwrap_or(0)
                .to_string(),
            Command::IobWrite {
                module,
                address,
                value,
            } => {
                self.iob.insert((*module, *address), *value);
                OK.to_string()
            }
            Command::StartJtagProgramming => self.run_command_file().to_string(),
            Command::DirectWriteLength(len) => {
                self.announced = Some(*len);
                OK.to_string()
            }
            Command::DirectWrite(payload) => self.run_direct(payload).to_string(),
            Command::Exec(line) => self.shell(line).to_string(),
            Command::SerialNumber => self.serial.to_string(),
            Command::Temperature => "41".to_string(),
            Command::SibReceive => Reply::vector_answer(command, 0, &self.sib).body().to_string(),
            _ => OK.to_string(),
        }
    }

    fn read_epc(&self, address: u32) -> u32 {
        let stored = self.epc.get(&address).copied().unwrap_or(0);
        match self.epc_forced.get(&address) {
            Some((mask, value)) => (stored & !mask) | (value & mask),
            None => stored,
        }
    }

    /// Supports the one command the engine runs: moving a file.
    fn shell(&mut self, line: &str) -> &'static str {
        let fields = line.split_ascii_whitespace().collect::<Vec<_>>();
        let ["mv", from, to] = fields[..] else {
            log::warn!("Fake PPT cannot run {:?}", line);
            return FAILED;
        };
        match self.files.remove(tmp_name(from)) {
            Some(contents) => {
                if tmp_name(from) == names::READBACK_FILE {
                    self.readback.clear();
                }
                self.files.insert(tmp_name(to).to_string(), contents);
                OK
            }
            None => FAILED,
        }
    }

    /// Stores an uploaded file, dropping its last byte when uploads are set to fail.
    pub fn store(&mut self, name: &str, mut contents: Vec<u8>) {
        if self.truncate_uploads {
            contents.pop();
        }
        self.files.insert(name.to_string(), contents);
    }

    fn run_command_file(&mut self) -> &'static str {
        let Some(file) = self.files.get(names::COMMAND_FILE) else {
            return FAILED;
        };
        let text = String::from_utf8_lossy(file).to_string();
        let mut values = text.lines().map(parse_hex);
        let (Some(Some(engine)), Some(Some(count))) = (values.next(), values.next()) else {
            return FAILED;
        };
        let words = values
            .map(|value| value.and_then(|v| u8::try_from(v).ok()))
            .collect::<Option<Vec<_>>>();
        match words {
            Some(words) if words.len() == count as usize => self.run_engine(engine, &words),
            _ => FAILED,
        }
    }

    fn run_direct(&mut self, payload: &str) -> &'static str {
        if self.announced.take() != Some(payload.len()) {
            return FAILED;
        }
        let Some(body) = payload.strip_suffix('$') else {
            return FAILED;
        };
        let Some(fields) = body.split(';').map(parse_hex).collect::<Option<Vec<_>>>() else {
            return FAILED;
        };
        let [count, engine, len, words @ ..] = &fields[..] else {
            return FAILED;
        };
        if *count as usize != words.len() + 2 || *len as usize != words.len() {
            return FAILED;
        }
        let Some(words) = words
            .iter()
            .map(|word| u8::try_from(*word).ok())
            .collect::<Option<Vec<_>>>()
        else {
            return FAILED;
        };
        self.run_engine(*engine, &words)
    }

    /// Shifts `words` through a chain in which every device returns what it was given.
    fn run_engine(&mut self, engine: u32, words: &[u8]) -> &'static str {
        let frames = match JtagFrame::decode_stream(words) {
            Ok(frames) => frames,
            Err(err) => {
                log::warn!("Fake PPT rejected engine words: {}", err);
                return FAILED;
            }
        };
        self.record_frames(engine, frames);
        OK
    }

    fn record_frames(&mut self, engine: u32, frames: Vec<JtagFrame>) {
        let start = self.readback.len() * 8;
        for frame in &frames {
            if frame.readback() && !self.drop_readback {
                self.readback.extend(pack_bits(frame.data()));
            }
        }
        // the flipped bit counts from the start of the readback file
        if let Some(bit) = self.flip
            && (start..self.readback.len() * 8).contains(&bit)
        {
            self.readback[bit / 8] ^= 1 << (bit % 8);
            self.flip = None;
        }
        if !self.readback.is_empty() {
            let text = self
                .readback
                .iter()
                .map(|byte| format!("{:x}\n", byte))
                .collect::<String>();
            self.files.insert(names::READBACK_FILE.to_string(), text.into_bytes());
        }
        self.frames
            .extend(frames.into_iter().map(|frame| (engine, frame)));
    }
}

#[cfg(test)]
mod test {
    use bitvec::prelude::*;
    use ppt_protocol::jtag::Instruction;

    use super::*;

    #[test]
    fn registers_remember_writes() {
        let mut device = Device::default();
        device.answer(Command::EpcWrite {
            address: 64,
            value: 0xf0,
        });
        device.epc_forced.insert(64, (0x4, 0x4));
        let reply = device.answer(Command::EpcRead { address: 64 });
        assert_eq!(reply.scalar().unwrap(), 0xf4);
        assert_eq!(device.requests.len(), 2);
    }

    #[test]
    fn direct_write_must_be_announced() {
        let frame = JtagFrame::broadcast(1, Instruction::PIXEL_0, bitvec![u8, Lsb0; 1; 9], true)
            .unwrap();
        let words = frame.encode();
        let mut payload = format!("{:x};34;{:x}", words.len() + 2, words.len());
        for word in &words {
            payload.push_str(&format!(";{:x}", word));
        }
        payload.push('$');

        let mut device = Device::default();
        let reply = device.answer(Command::DirectWrite(payload.clone()));
        assert_eq!(reply.body(), FAILED);

        device.answer(Command::DirectWriteLength(payload.len()));
        let reply = device.answer(Command::DirectWrite(payload));
        assert_eq!(reply.body(), OK);
        assert_eq!(device.frames.len(), 1);
        assert_eq!(
            device.files[names::READBACK_FILE],
            b"ff\n1\n".to_vec()
        );
    }
}
