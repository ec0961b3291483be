/// Read and write implementations for the protocol messages
use std::io::{self, Read, Write};

use crate::{
    error::ReadError,
    protocol::{COMMAND_PREFIX, Command, Reply},
};

const TERMINATOR: u8 = 0;

/// Reads up to, but excluding, the first byte contained in `terminators`.
fn read_message(
    reader: &mut impl Read,
    terminators: &[u8],
    max_len: usize,
) -> Result<Vec<u8>, ReadError> {
    let mut message = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) if message.is_empty() => {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            Ok(0) => break,
            Ok(_) => {
                if terminators.contains(&byte[0]) {
                    break;
                }
                if message.len() >= max_len {
                    return Err(ReadError::TooManyBytes {
                        max: max_len,
                        got: message.len() + 1,
                    });
                }
                message.push(byte[0]);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(message)
}

impl Command {
    /// Writes the request in a single write, so that a partial write surfaces as an error.
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        let mut message = COMMAND_PREFIX.to_vec();
        write!(&mut message, "{}", self)?;
        message.push(TERMINATOR);
        writer.write_all(&message)
    }

    pub fn from_reader(reader: &mut impl Read, max_len: usize) -> Result<Command, ReadError> {
        let message = read_message(reader, &[TERMINATOR], max_len)?;
        let Some(text) = message.strip_prefix(COMMAND_PREFIX) else {
            let len = message.len().min(COMMAND_PREFIX.len());
            return Err(ReadError::InvalidCommandPrefix(
                String::from_utf8_lossy(&message[..len]).to_string(),
            ));
        };
        str::from_utf8(text)?.parse()
    }
}

impl Reply {
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        let mut message = Vec::with_capacity(self.code().len() + self.body().len() + 2);
        write!(&mut message, "{}", self)?;
        message.push(TERMINATOR);
        writer.write_all(&message)
    }

    /// Reads one reply. A reply ends with a NUL byte or a newline.
    pub fn from_reader(reader: &mut impl Read, max_len: usize) -> Result<Reply, ReadError> {
        let message = read_message(reader, &[TERMINATOR, b'\n'], max_len)?;
        str::from_utf8(&message)?.parse()
    }
}

#[cfg(feature = "tokio")]
mod framed {
    use bytes::{BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::TERMINATOR;
    use crate::{Command, Reply, error::ReadError};

    /// Device side framing: decodes requests and encodes replies.
    #[derive(Debug, Clone)]
    pub struct DeviceCodec {
        max_len: usize,
    }

    impl DeviceCodec {
        pub fn new(max_len: usize) -> DeviceCodec {
            DeviceCodec { max_len }
        }
    }

    impl Decoder for DeviceCodec {
        type Item = Command;
        type Error = ReadError;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, ReadError> {
            let Some(end) = src.iter().position(|b| *b == TERMINATOR) else {
                if src.len() > self.max_len {
                    return Err(ReadError::TooManyBytes {
                        max: self.max_len,
                        got: src.len(),
                    });
                }
                return Ok(None);
            };
            let message = src.split_to(end + 1);
            let mut reader = &message[..];
            Command::from_reader(&mut reader, self.max_len).map(Some)
        }
    }

    impl Encoder<Reply> for DeviceCodec {
        type Error = ReadError;

        fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), ReadError> {
            item.write_to(&mut dst.writer())?;
            Ok(())
        }
    }

    #[test]
    fn decodes_requests_split_across_reads() {
        let mut codec = DeviceCodec::new(1000);
        let mut buf = BytesMut::from(&b"cmdXFEL EPCC R"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b" 8\0cmdXFEL JTG1\0");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Command::EpcRead { address: 8 })
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Command::StartJtagProgramming)
        );
        assert!(buf.is_empty());
    }
}

#[cfg(feature = "tokio")]
pub use framed::DeviceCodec;
