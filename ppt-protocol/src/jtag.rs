//! JTAG frames as consumed by the JTAG engines of the PPT.
//!
//! A frame shifts one instruction into every device of a daisy chain and then a
//! single data register through the whole chain:
//!
//! ```text
//! [flags] [instruction bits - 1: u16 LE] [instruction bits] [data bits - 1: u16 LE] [data bits]
//! ```
//!
//! Bits are packed eight per byte, least significant bit first. Bit `0x80` of the flags
//! byte asks the engine to record the bits shifted out of the chain, so that they can be
//! fetched as readback data after the transaction.
use std::io::{Read, Write};

use bitvec::prelude::*;

use crate::error::FrameError;

/// Bit image of a register, packed LSB first.
pub type Bits = BitVec<u8, Lsb0>;

/// Width of the instruction register of a single ASIC.
pub const INSTRUCTION_BITS: usize = 5;
/// The length fields of a frame are 16 bits wide and store the length minus one.
pub const MAX_DATA_BITS: usize = 1 << 16;
pub const MAX_INSTRUCTION_BITS: usize = 256;
pub const READBACK_FLAG: u8 = 0x80;
/// Engine words that return every TAP controller of a chain to its reset state.
pub const RESET_SEQUENCE: [u8; 16] = [0xff; 16];

/// A five bit ASIC JTAG instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Instruction(u8);

impl Instruction {
    /// Makes the device pass data through a single flip-flop.
    pub const BYPASS: Instruction = Instruction(3);
    pub const SEQUENCER_HOLD: Instruction = Instruction(4);
    pub const SELECT_X0: Instruction = Instruction(17);
    pub const SELECT_X1: Instruction = Instruction(18);
    pub const SELECT_Y: Instruction = Instruction(19);
    pub const PIXEL_0: Instruction = Instruction(30);
    pub const PIXEL_1: Instruction = Instruction(31);

    const SEQUENCER_TRACK: u8 = 8;

    pub fn new(code: u8) -> Instruction {
        Instruction(code & 0x1f)
    }

    /// Programs the dynamic bits of one sequencer track.
    pub fn track(sub_address: u8) -> Instruction {
        Instruction(Self::SEQUENCER_TRACK | (sub_address & 0x7))
    }

    pub fn code(self) -> u8 {
        self.0
    }
}

/// Position of `asic` in the physical JTAG chain.
///
/// The lower half of the chain is wired in reverse order.
pub fn chain_position(asic: usize) -> usize {
    if asic > 7 { asic } else { 7 - asic }
}

/// Packs bits into bytes, eight per byte, least significant bit first.
pub fn pack_bits(bits: &BitSlice<u8, Lsb0>) -> Vec<u8> {
    let mut packed = Bits::with_capacity(bits.len());
    packed.extend_from_bitslice(bits);
    packed.set_uninitialized(false);
    packed.into_vec()
}

/// Inverse of [pack_bits]. Returns `None` when `bytes` hold fewer than `len` bits.
pub fn unpack_bits(bytes: &[u8], len: usize) -> Option<Bits> {
    if bytes.len() * 8 < len {
        return None;
    }
    let mut bits = Bits::from_slice(bytes);
    bits.truncate(len);
    Some(bits)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JtagFrame {
    readback: bool,
    instructions: Vec<Instruction>,
    data: Bits,
}

impl JtagFrame {
    /// Creates a frame that shifts `instructions[i]` into chain position `i`.
    pub fn new(
        instructions: Vec<Instruction>,
        data: Bits,
        readback: bool,
    ) -> Result<JtagFrame, FrameError> {
        if instructions.is_empty() {
            return Err(FrameError::EmptyChain);
        }
        if instructions.len() * INSTRUCTION_BITS > MAX_INSTRUCTION_BITS {
            return Err(FrameError::ChainTooLong {
                devices: instructions.len(),
                max: MAX_INSTRUCTION_BITS / INSTRUCTION_BITS,
            });
        }
        if data.is_empty() {
            return Err(FrameError::NoData);
        }
        if data.len() > MAX_DATA_BITS {
            return Err(FrameError::TooManyBits {
                max: MAX_DATA_BITS,
                got: data.len(),
            });
        }
        Ok(JtagFrame {
            readback,
            instructions,
            data,
        })
    }

    /// Shifts the same instruction into every device of the chain.
    pub fn broadcast(
        chain_len: usize,
        instruction: Instruction,
        data: Bits,
        readback: bool,
    ) -> Result<JtagFrame, FrameError> {
        JtagFrame::new(vec![instruction; chain_len], data, readback)
    }

    /// Shifts `instruction` into the device at `position` and BYPASS into all others.
    pub fn addressed(
        chain_len: usize,
        position: usize,
        instruction: Instruction,
        data: Bits,
        readback: bool,
    ) -> Result<JtagFrame, FrameError> {
        if position >= chain_len {
            return Err(FrameError::DeviceOutOfRange {
                position,
                chain_len,
            });
        }
        let mut instructions = vec![Instruction::BYPASS; chain_len];
        instructions[position] = instruction;
        JtagFrame::new(instructions, data, readback)
    }

    pub fn readback(&self) -> bool {
        self.readback
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn data(&self) -> &BitSlice<u8, Lsb0> {
        &self.data
    }

    pub fn chain_len(&self) -> usize {
        self.instructions.len()
    }

    fn instruction_bits(&self) -> Bits {
        let mut bits = Bits::with_capacity(self.instructions.len() * INSTRUCTION_BITS);
        for instruction in &self.instructions {
            for bit in 0..INSTRUCTION_BITS {
                bits.push(instruction.code() & (1 << bit) != 0);
            }
        }
        bits
    }

    /// Number of bytes of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        5 + (self.instructions.len() * INSTRUCTION_BITS).div_ceil(8) + self.data.len().div_ceil(8)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(if self.readback { READBACK_FLAG } else { 0 });
        let instruction_bits = self.instruction_bits();
        out.extend_from_slice(&((instruction_bits.len() - 1) as u16).to_le_bytes());
        out.extend(pack_bits(&instruction_bits));
        out.extend_from_slice(&((self.data.len() - 1) as u16).to_le_bytes());
        out.extend(pack_bits(&self.data));
        out
    }

    pub fn write_to(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_all(&self.encode())
    }

    pub fn from_reader(reader: &mut impl Read) -> Result<JtagFrame, FrameError> {
        let mut header = [0u8; 3];
        reader.read_exact(&mut header)?;
        if header[0] & !READBACK_FLAG != 0 {
            return Err(FrameError::InvalidHeader(format!(
                "unknown flags {:#04x}",
                header[0]
            )));
        }
        let instruction_len = u16::from_le_bytes([header[1], header[2]]) as usize + 1;
        if instruction_len % INSTRUCTION_BITS != 0 {
            return Err(FrameError::InvalidHeader(format!(
                "{} instruction bits do not fill whole instructions",
                instruction_len
            )));
        }
        let mut instruction_bytes = vec![0u8; instruction_len.div_ceil(8)];
        reader.read_exact(&mut instruction_bytes)?;
        let instruction_bits =
            unpack_bits(&instruction_bytes, instruction_len).ok_or(FrameError::Truncated)?;
        let instructions = instruction_bits
            .chunks(INSTRUCTION_BITS)
            .map(|chunk| Instruction::new(chunk.iter_ones().fold(0u8, |acc, i| acc | 1 << i)))
            .collect();

        let mut len = [0u8; 2];
        reader.read_exact(&mut len)?;
        let data_len = u16::from_le_bytes(len) as usize + 1;
        let mut data_bytes = vec![0u8; data_len.div_ceil(8)];
        reader.read_exact(&mut data_bytes)?;
        let data = unpack_bits(&data_bytes, data_len).ok_or(FrameError::Truncated)?;
        JtagFrame::new(instructions, data, header[0] & READBACK_FLAG != 0)
    }

    /// Decodes a complete engine byte stream, skipping reset sequences in between frames.
    pub fn decode_stream(mut bytes: &[u8]) -> Result<Vec<JtagFrame>, FrameError> {
        let mut frames = Vec::new();
        loop {
            while let Some((&0xff, rest)) = bytes.split_first() {
                bytes = rest;
            }
            if bytes.is_empty() {
                return Ok(frames);
            }
            frames.push(JtagFrame::from_reader(&mut bytes)?);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_single_device_frame() {
        let data = bitvec![u8, Lsb0; 1, 0, 1, 1, 0, 0, 0, 0, 1];
        let frame = JtagFrame::broadcast(1, Instruction::PIXEL_0, data, true).unwrap();
        assert_eq!(
            frame.encode(),
            vec![0x80, 4, 0, 0b0001_1110, 8, 0, 0b0000_1101, 0b0000_0001]
        );
        assert_eq!(frame.encoded_len(), 8);
    }

    #[test]
    fn instruction_bits_of_two_devices() {
        let data = bitvec![u8, Lsb0; 0];
        let frame = JtagFrame::addressed(2, 1, Instruction::SEQUENCER_HOLD, data, false).unwrap();
        // 00011 followed by 00100
        assert_eq!(frame.encode()[..5], [0, 9, 0, 0b1000_0011, 0b0000_0000]);
    }

    #[test]
    fn decode_recovers_frame() {
        let mut data = Bits::repeat(false, 1025);
        data.set(3, true);
        data.set(1024, true);
        let frame = JtagFrame::addressed(16, 5, Instruction::PIXEL_1, data, true).unwrap();
        let encoded = frame.encode();
        let decoded = JtagFrame::from_reader(&mut &encoded[..]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn truncated_frame() {
        let frame =
            JtagFrame::broadcast(4, Instruction::BYPASS, Bits::repeat(true, 40), false).unwrap();
        let encoded = frame.encode();
        assert!(matches!(
            JtagFrame::from_reader(&mut &encoded[..encoded.len() - 1]),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn stream_with_reset_sequence() {
        let first = JtagFrame::broadcast(2, Instruction::SELECT_Y, Bits::repeat(false, 129), false)
            .unwrap();
        let second =
            JtagFrame::broadcast(2, Instruction::SELECT_X0, Bits::repeat(true, 65), true).unwrap();
        let mut stream = RESET_SEQUENCE.to_vec();
        stream.extend(first.encode());
        stream.extend(second.encode());
        assert_eq!(JtagFrame::decode_stream(&stream).unwrap(), vec![first, second]);
    }

    #[test]
    fn data_length_limits() {
        assert!(matches!(
            JtagFrame::broadcast(1, Instruction::PIXEL_0, Bits::new(), false),
            Err(FrameError::NoData)
        ));
        assert!(matches!(
            JtagFrame::broadcast(
                1,
                Instruction::PIXEL_0,
                Bits::repeat(false, MAX_DATA_BITS + 1),
                false
            ),
            Err(FrameError::TooManyBits { .. })
        ));
        JtagFrame::broadcast(1, Instruction::PIXEL_0, Bits::repeat(false, MAX_DATA_BITS), false)
            .unwrap();
    }

    #[test]
    fn device_outside_of_chain() {
        assert!(matches!(
            JtagFrame::addressed(8, 8, Instruction::PIXEL_0, Bits::repeat(false, 1), false),
            Err(FrameError::DeviceOutOfRange {
                position: 8,
                chain_len: 8
            })
        ));
    }

    #[test]
    fn addressed_frames_only_differ_at_the_target() {
        for asic in 0..16 {
            let position = chain_position(asic);
            let frame = JtagFrame::addressed(
                16,
                position,
                Instruction::track(2),
                Bits::repeat(false, 1),
                false,
            )
            .unwrap();
            for (index, instruction) in frame.instructions().iter().enumerate() {
                if index == position {
                    assert_eq!(*instruction, Instruction::track(2));
                } else {
                    assert_eq!(*instruction, Instruction::BYPASS);
                    assert_ne!(*instruction, Instruction::track(2));
                }
            }
        }
    }

    #[test]
    fn chain_position_is_a_permutation() {
        let mut positions = (0..16).map(chain_position).collect::<Vec<_>>();
        assert_eq!(positions[..8], [7, 6, 5, 4, 3, 2, 1, 0]);
        positions.sort();
        assert_eq!(positions, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn pack_and_unpack() {
        let bits = bitvec![u8, Lsb0; 1, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        let bytes = pack_bits(&bits);
        assert_eq!(bytes, vec![0x03, 0x02]);
        assert_eq!(unpack_bits(&bytes, 10).unwrap(), bits);
        assert!(unpack_bits(&bytes, 17).is_none());
        // slices that do not start at a byte boundary are packed from their first bit
        assert_eq!(pack_bits(&bits[1..]), vec![0x01, 0x01]);
    }
}
