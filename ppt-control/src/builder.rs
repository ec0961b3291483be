//! Assembly of JTAG transactions.
//!
//! A [Transaction] is an ordered list of JTAG frames and controller resets for the JTAG
//! engine of one module. It is built by a [TransactionBuilder], which knows how every
//! register family is laid out in the chain: which instruction selects it, how long
//! its data register is and which padding the hardware needs.
//!
//! Frames that request readback carry the id of a [Check]. Readback data of all frames
//! sharing a check is concatenated, with padding removed, and compared as a whole.
use bitvec::prelude::*;
use ppt_protocol::jtag::{Bits, Instruction, JtagFrame, RESET_SEQUENCE};

use crate::{
    RegisterModel, SequencerModel,
    config::Topology,
    error::Error,
    registers::{DeviceSelector, FamilyKind, Layout},
};

/// Pixels programmed by one frame.
pub const CHUNK_PIXELS: usize = 1024;
/// Data bits shifted into each device while every ASIC is in bypass.
const BYPASS_DATA_BITS: usize = 16;

/// What the readback data of one or more frames is compared against.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Check {
    /// The selected devices of a module set, one after the other.
    Content {
        family: FamilyKind,
        set: String,
        devices: DeviceSelector,
    },
    /// `copies` windows, each holding `device` of a module set.
    Replicated {
        family: FamilyKind,
        set: String,
        device: usize,
        copies: usize,
    },
    SequencerHold {
        copies: usize,
    },
    SequencerTrack {
        index: usize,
        copies: usize,
    },
}

#[derive(Clone, Debug)]
pub struct PendingFrame {
    frame: JtagFrame,
    /// Padding appended behind the payload, in insertion order.
    padding: Vec<usize>,
    check: Option<usize>,
}

impl PendingFrame {
    pub fn frame(&self) -> &JtagFrame {
        &self.frame
    }

    pub fn check(&self) -> Option<usize> {
        self.check
    }

    pub fn padding_bits(&self) -> usize {
        self.padding.iter().sum()
    }

    /// Removes the padding from the data of this frame, last insertion first.
    pub fn strip_padding(&self, bits: &BitSlice<u8, Lsb0>) -> Bits {
        let mut bits = bits.to_bitvec();
        for pad in self.padding.iter().rev() {
            let len = bits.len().saturating_sub(*pad);
            bits.truncate(len);
        }
        bits
    }
}

#[derive(Clone, Debug)]
enum Item {
    Reset,
    Frame(PendingFrame),
}

#[derive(Clone, Debug, Default)]
pub struct Transaction {
    items: Vec<Item>,
    checks: Vec<Check>,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn frames(&self) -> impl Iterator<Item = &PendingFrame> {
        self.items.iter().filter_map(|item| match item {
            Item::Frame(frame) => Some(frame),
            Item::Reset => None,
        })
    }

    /// Frames that return data, in transmission order.
    pub fn readback_frames(&self) -> impl Iterator<Item = &PendingFrame> {
        self.frames().filter(|frame| frame.frame.readback())
    }

    pub fn has_readback(&self) -> bool {
        self.readback_frames().next().is_some()
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    /// Bytes of readback data the engine records for this transaction.
    pub fn readback_bytes(&self) -> usize {
        self.readback_frames()
            .map(|frame| frame.frame.data().len().div_ceil(8))
            .sum()
    }

    /// The byte stream consumed by the JTAG engine.
    pub fn engine_words(&self) -> Vec<u8> {
        let mut words = Vec::new();
        for item in &self.items {
            match item {
                Item::Reset => words.extend_from_slice(&RESET_SEQUENCE),
                Item::Frame(frame) => words.extend(frame.frame.encode()),
            }
        }
        words
    }

    /// Contents of the command file for the engine at `engine`: the engine address, the
    /// number of words and the words themselves, one hex value per line.
    pub fn command_file(&self, engine: u32) -> String {
        let words = self.engine_words();
        let mut file = format!("{:x}\n{:x}\n", engine, words.len());
        for word in words {
            file.push_str(&format!("{:x}\n", word));
        }
        file
    }

    /// Direct write payloads, one per frame. Resets travel with the frame that follows.
    pub fn direct_payloads(&self, engine: u32) -> Vec<String> {
        let mut payloads = Vec::new();
        let mut pending = Vec::new();
        for item in &self.items {
            match item {
                Item::Reset => pending.extend_from_slice(&RESET_SEQUENCE),
                Item::Frame(frame) => {
                    pending.extend(frame.frame.encode());
                    payloads.push(direct_payload(engine, &pending));
                    pending.clear();
                }
            }
        }
        if !pending.is_empty() {
            payloads.push(direct_payload(engine, &pending));
        }
        payloads
    }
}

/// `<count>;<engine>;<n>;<w0>;...;<wn-1>$`, all in hex, where count covers everything
/// after it.
fn direct_payload(engine: u32, words: &[u8]) -> String {
    let mut payload = format!("{:x};{:x};{:x}", words.len() + 2, engine, words.len());
    for word in words {
        payload.push_str(&format!(";{:x}", word));
    }
    payload.push('$');
    payload
}

#[derive(Debug)]
pub struct TransactionBuilder {
    topology: Topology,
    transaction: Transaction,
}

impl TransactionBuilder {
    pub fn new(topology: Topology) -> TransactionBuilder {
        TransactionBuilder {
            topology,
            transaction: Transaction::default(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn finish(self) -> Transaction {
        self.transaction
    }

    /// Returns all TAP controllers of the chain to their reset state.
    pub fn jtag_reset(&mut self) -> &mut Self {
        self.transaction.items.push(Item::Reset);
        self
    }

    fn add_check(&mut self, check: Check) -> usize {
        self.transaction.checks.push(check);
        self.transaction.checks.len() - 1
    }

    fn push(&mut self, frame: JtagFrame, padding: Vec<usize>, check: Option<usize>) {
        log::trace!(
            "Frame {:?} with {} data bits{}",
            frame.instructions().first(),
            frame.data().len(),
            if frame.readback() { ", readback" } else { "" }
        );
        self.transaction.items.push(Item::Frame(PendingFrame {
            frame,
            padding,
            check,
        }));
    }

    fn broadcast(
        &mut self,
        instruction: Instruction,
        data: Bits,
        readback: bool,
        padding: Vec<usize>,
        check: Option<usize>,
    ) -> Result<(), Error> {
        let frame = JtagFrame::broadcast(self.topology.chain_len, instruction, data, readback)?;
        self.push(frame, padding, check);
        Ok(())
    }

    fn addressed(
        &mut self,
        position: usize,
        instruction: Instruction,
        data: Bits,
        readback: bool,
        padding: Vec<usize>,
        check: Option<usize>,
    ) -> Result<(), Error> {
        let frame = JtagFrame::addressed(
            self.topology.chain_len,
            position,
            instruction,
            data,
            readback,
        )?;
        self.push(frame, padding, check);
        Ok(())
    }

    fn jtag_layout(&self, model: &dyn RegisterModel, set: &str) -> Result<Layout, Error> {
        let layout = model
            .layout(set)
            .ok_or_else(|| Error::Configuration(format!("Unknown JTAG register {}", set)))?;
        if layout.device_count != self.topology.chain_len {
            return Err(Error::Configuration(format!(
                "JTAG register {} spans {} devices, but the chain holds {} ASICs",
                set, layout.device_count, self.topology.chain_len
            )));
        }
        if layout.address > 0x1f {
            return Err(Error::Configuration(format!(
                "JTAG register {} has address {}, which is not a JTAG instruction",
                set, layout.address
            )));
        }
        Ok(layout)
    }

    /// Writes one JTAG module set to every ASIC of the chain.
    pub fn register(
        &mut self,
        model: &dyn RegisterModel,
        set: &str,
        readback: bool,
    ) -> Result<&mut Self, Error> {
        let layout = self.jtag_layout(model, set)?;
        let data = model.content(set, &DeviceSelector::All);
        let check = readback.then(|| {
            self.add_check(Check::Content {
                family: FamilyKind::Jtag,
                set: set.to_string(),
                devices: DeviceSelector::All,
            })
        });
        self.broadcast(
            Instruction::new(layout.address as u8),
            data,
            readback,
            Vec::new(),
            check,
        )?;
        Ok(self)
    }

    /// Writes every JTAG module set of `model`.
    pub fn all_registers(
        &mut self,
        model: &dyn RegisterModel,
        readback: bool,
    ) -> Result<&mut Self, Error> {
        for set in model.module_sets() {
            self.register(model, &set, readback)?;
        }
        Ok(self)
    }

    /// Puts every ASIC of the chain into bypass.
    pub fn bypass_all(&mut self) -> Result<&mut Self, Error> {
        let data = bitvec![u8, Lsb0; 0; BYPASS_DATA_BITS];
        self.broadcast(Instruction::BYPASS, data, false, Vec::new(), None)?;
        Ok(self)
    }

    fn select(&mut self, x: Bits, y: Bits) -> Result<(), Error> {
        self.broadcast(Instruction::SELECT_X0, x.clone(), false, Vec::new(), None)?;
        self.broadcast(Instruction::SELECT_X1, x, false, Vec::new(), None)?;
        self.broadcast(Instruction::SELECT_Y, y, false, Vec::new(), None)
    }

    fn select_lengths(&self) -> (usize, usize) {
        (
            self.topology.x_select_bits * self.topology.chain_len,
            self.topology.y_select_bits * self.topology.chain_len,
        )
    }

    /// Selects every row and column of every ASIC, so that one pixel value reaches all
    /// pixels at once.
    pub fn select_broadcast(&mut self) -> Result<&mut Self, Error> {
        let (x_len, y_len) = self.select_lengths();
        self.select(
            bitvec![u8, Lsb0; 1; x_len + 1],
            bitvec![u8, Lsb0; 1; y_len + 1],
        )?;
        Ok(self)
    }

    /// Selects all columns and no row, so that pixel data is shifted through the chain.
    pub fn select_chain(&mut self) -> Result<&mut Self, Error> {
        let (x_len, y_len) = self.select_lengths();
        self.select(
            bitvec![u8, Lsb0; 1; x_len + 1],
            bitvec![u8, Lsb0; 0; y_len + 1],
        )?;
        Ok(self)
    }

    /// Chain selection for the single ASIC at `position`, with every other ASIC in bypass.
    fn select_chain_device(&mut self, position: usize) -> Result<(), Error> {
        let bypass = self.topology.chain_len - position - 1;
        let x = bitvec![u8, Lsb0; 1; self.topology.x_select_bits + bypass + 1];
        let y = bitvec![u8, Lsb0; 0; self.topology.y_select_bits + bypass + 1];
        self.addressed(position, Instruction::SELECT_X0, x.clone(), false, Vec::new(), None)?;
        self.addressed(position, Instruction::SELECT_X1, x, false, Vec::new(), None)?;
        self.addressed(position, Instruction::SELECT_Y, y, false, Vec::new(), None)
    }

    /// Chain position of a pixel. Pixels are counted in chain order, as in the pixel model.
    fn pixel_position(&self, pixel: usize) -> Result<usize, Error> {
        if pixel >= self.topology.pixels() {
            return Err(Error::Configuration(format!(
                "Pixel {} is outside of the {} pixels of the chain",
                pixel,
                self.topology.pixels()
            )));
        }
        Ok(pixel / self.topology.pixels_per_asic)
    }

    /// Selects exactly one pixel.
    ///
    /// Both X registers select column `x` of the ASIC at chain position `p` through bit
    /// `p * X + x`, but the second register is shifted in reverse and covers the upper
    /// half of the columns. Y registers are reversed as a whole.
    pub fn select_pixel(&mut self, pixel: usize) -> Result<&mut Self, Error> {
        let position = self.pixel_position(pixel)?;
        let topology = self.topology;
        let local = pixel % topology.pixels_per_asic;
        let column = local % topology.pixels_per_row;
        let row = local / topology.pixels_per_row;
        if column >= 2 * topology.x_select_bits || row >= topology.y_select_bits {
            return Err(Error::Configuration(format!(
                "Pixel {} lies outside of the selection registers",
                pixel
            )));
        }
        let (x_len, y_len) = self.select_lengths();

        let mut x0 = bitvec![u8, Lsb0; 0; x_len + 1];
        let mut x1 = bitvec![u8, Lsb0; 0; x_len + 1];
        if column < topology.x_select_bits {
            x0.set(position * topology.x_select_bits + column, true);
        } else {
            let bit = position * topology.x_select_bits + column - topology.x_select_bits;
            x1.set(x_len - 1 - bit, true);
        }
        let mut y = bitvec![u8, Lsb0; 0; y_len + 1];
        y.set(y_len - 1 - (position * topology.y_select_bits + row), true);

        self.broadcast(Instruction::SELECT_X0, x0, false, Vec::new(), None)?;
        self.broadcast(Instruction::SELECT_X1, x1, false, Vec::new(), None)?;
        self.broadcast(Instruction::SELECT_Y, y, false, Vec::new(), None)?;
        Ok(self)
    }

    fn pixel_layout(&self, model: &dyn RegisterModel, set: &str) -> Result<Layout, Error> {
        let layout = model
            .layout(set)
            .ok_or_else(|| Error::Configuration(format!("Unknown pixel register {}", set)))?;
        if layout.device_count != self.topology.pixels() {
            return Err(Error::Configuration(format!(
                "Pixel register {} spans {} pixels, but the chain holds {}",
                set,
                layout.device_count,
                self.topology.pixels()
            )));
        }
        Ok(layout)
    }

    /// Writes the value of pixel 0 into every pixel of the chain.
    pub fn pixels_uniform(
        &mut self,
        model: &dyn RegisterModel,
        set: &str,
        readback: bool,
    ) -> Result<&mut Self, Error> {
        self.pixel_layout(model, set)?;
        self.select_broadcast()?;

        let pixel = model.content(set, &DeviceSelector::One(0));
        let mut data = Bits::with_capacity(pixel.len() * self.topology.chain_len + 1);
        for _ in 0..self.topology.chain_len {
            data.extend_from_bitslice(&pixel);
        }
        data.push(false);

        for instruction in [Instruction::PIXEL_0, Instruction::PIXEL_1] {
            let check = readback.then(|| {
                self.add_check(Check::Replicated {
                    family: FamilyKind::Pixel,
                    set: set.to_string(),
                    device: 0,
                    copies: self.topology.chain_len,
                })
            });
            self.broadcast(instruction, data.clone(), readback, vec![1], check)?;
        }
        Ok(self)
    }

    /// Shifts the complete pixel image through the chain in chunks of [CHUNK_PIXELS].
    pub fn pixels_chain(
        &mut self,
        model: &dyn RegisterModel,
        set: &str,
        readback: bool,
    ) -> Result<&mut Self, Error> {
        let layout = self.pixel_layout(model, set)?;
        self.select_chain()?;

        let image = model.content(set, &DeviceSelector::All);
        let check = readback.then(|| {
            self.add_check(Check::Content {
                family: FamilyKind::Pixel,
                set: set.to_string(),
                devices: DeviceSelector::All,
            })
        });
        for (index, chunk) in image.chunks(CHUNK_PIXELS * layout.bits_per_device).enumerate() {
            let instruction = if index % 4 < 2 {
                Instruction::PIXEL_1
            } else {
                Instruction::PIXEL_0
            };
            let mut data = chunk.to_bitvec();
            data.push(false);
            self.broadcast(instruction, data, readback, vec![1], check)?;
        }
        Ok(self)
    }

    /// Shifts the pixels of one ASIC while all others are in bypass.
    ///
    /// Every second chunk carries one extra bit per device between the ASIC and the end
    /// of the chain.
    pub fn pixels_single(
        &mut self,
        model: &dyn RegisterModel,
        set: &str,
        asic: usize,
        readback: bool,
    ) -> Result<&mut Self, Error> {
        let layout = self.pixel_layout(model, set)?;
        let position = self.topology.chain_position(asic)?;
        let bypass = self.topology.chain_len - position - 1;

        self.bypass_all()?;
        self.select_chain_device(position)?;
        self.bypass_all()?;

        let start = position * self.topology.pixels_per_asic;
        let devices = DeviceSelector::Span(start..start + self.topology.pixels_per_asic);
        let image = model.content(set, &devices);
        let check = readback.then(|| {
            self.add_check(Check::Content {
                family: FamilyKind::Pixel,
                set: set.to_string(),
                devices,
            })
        });
        for (index, chunk) in image.chunks(CHUNK_PIXELS * layout.bits_per_device).enumerate() {
            let instruction = if index % 4 < 2 {
                Instruction::PIXEL_1
            } else {
                Instruction::PIXEL_0
            };
            let mut data = chunk.to_bitvec();
            data.push(false);
            let mut padding = vec![1];
            if index % 2 == 1 {
                data.resize(data.len() + bypass, false);
                padding.push(bypass);
            }
            self.addressed(position, instruction, data, readback, padding, check)?;
        }
        Ok(self)
    }

    /// Writes one pixel through the pixel selection registers.
    pub fn pixel_direct(
        &mut self,
        model: &dyn RegisterModel,
        set: &str,
        pixel: usize,
    ) -> Result<&mut Self, Error> {
        self.pixel_layout(model, set)?;
        self.select_pixel(pixel)?;

        let column = pixel % self.topology.pixels_per_row;
        let instruction = if column < self.topology.x_select_bits {
            Instruction::PIXEL_0
        } else {
            Instruction::PIXEL_1
        };
        let mut data = model.content(set, &DeviceSelector::One(pixel));
        data.push(false);
        self.broadcast(instruction, data, false, vec![1], None)?;
        Ok(self)
    }

    /// Writes the hold counts and every track, replicated to all ASICs.
    pub fn sequencer(
        &mut self,
        model: &dyn SequencerModel,
        readback: bool,
    ) -> Result<&mut Self, Error> {
        let copies = self.topology.chain_len;
        let hold = model.hold_bits();
        let check = readback.then(|| self.add_check(Check::SequencerHold { copies }));
        self.broadcast(
            Instruction::SEQUENCER_HOLD,
            replicate(&hold, copies),
            readback,
            Vec::new(),
            check,
        )?;

        for (index, track) in model.tracks().into_iter().enumerate() {
            let check = readback.then(|| self.add_check(Check::SequencerTrack { index, copies }));
            self.broadcast(
                Instruction::track(track.sub_address),
                replicate(&track.bits, copies),
                readback,
                Vec::new(),
                check,
            )?;
        }
        Ok(self)
    }
}

fn replicate(bits: &BitSlice<u8, Lsb0>, copies: usize) -> Bits {
    let mut data = Bits::with_capacity(bits.len() * copies);
    for _ in 0..copies {
        data.extend_from_bitslice(bits);
    }
    data
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::{MemoryModel, MemorySequencer, MemorySet};

    const BITS_PER_PIXEL: usize = 47;

    fn topology(chain_len: usize) -> Topology {
        Topology {
            chain_len,
            ..Topology::default()
        }
    }

    fn pixels(chain_len: usize) -> MemoryModel {
        MemoryModel::new().with_set(MemorySet::new(
            "Control register",
            0,
            BITS_PER_PIXEL,
            chain_len * 4096,
        ))
    }

    fn jtag(chain_len: usize) -> MemoryModel {
        MemoryModel::new()
            .with_set(
                MemorySet::new("Global Control Register", 1, 40, chain_len)
                    .signal("SC_EnChainLd", 3, 1),
            )
            .with_set(MemorySet::new("Master FSM Config Register", 6, 90, chain_len))
    }

    fn data_bits(transaction: &Transaction, instruction: Instruction) -> Vec<usize> {
        transaction
            .frames()
            .filter(|frame| frame.frame().instructions().contains(&instruction))
            .map(|frame| frame.frame().data().len())
            .collect()
    }

    #[test]
    fn chain_chunks_cover_every_pixel() {
        for chain_len in [1, 8, 16] {
            let model = pixels(chain_len);
            let mut builder = TransactionBuilder::new(topology(chain_len));
            builder.pixels_chain(&model, "Control register", true).unwrap();
            let transaction = builder.finish();

            let pixel_frames = transaction.readback_frames().collect::<Vec<_>>();
            let pixel_count = chain_len * 4096;
            assert_eq!(pixel_frames.len(), pixel_count.div_ceil(CHUNK_PIXELS));
            let total: usize = pixel_frames.iter().map(|f| f.frame().data().len()).sum();
            assert_eq!(total, pixel_count * BITS_PER_PIXEL + pixel_frames.len());
            assert_eq!(transaction.checks().len(), 1);

            let opcodes = pixel_frames
                .iter()
                .map(|f| f.frame().instructions()[0])
                .take(4)
                .collect::<Vec<_>>();
            assert_eq!(
                opcodes,
                [
                    Instruction::PIXEL_1,
                    Instruction::PIXEL_1,
                    Instruction::PIXEL_0,
                    Instruction::PIXEL_0
                ]
            );
        }
    }

    #[test]
    fn single_asic_chunks_carry_bypass_padding() {
        // a single ASIC chain holds ASIC 7
        for (chain_len, asic) in [(1, 7), (8, 0), (16, 0)] {
            let model = pixels(chain_len);
            let mut builder = TransactionBuilder::new(topology(chain_len));
            builder.pixels_single(&model, "Control register", asic, true).unwrap();
            let transaction = builder.finish();

            let position = topology(chain_len).chain_position(asic).unwrap();
            let bypass = chain_len - position - 1;
            let chunk = CHUNK_PIXELS * BITS_PER_PIXEL;
            let frames = transaction.readback_frames().collect::<Vec<_>>();
            assert_eq!(frames.len(), 4);
            let lengths = frames.iter().map(|f| f.frame().data().len()).collect::<Vec<_>>();
            assert_eq!(
                lengths,
                [chunk + 1, chunk + 1 + bypass, chunk + 1, chunk + 1 + bypass]
            );
            for frame in &frames {
                assert_eq!(frame.frame().instructions()[position].code() >> 1, 15);
                assert_eq!(frame.strip_padding(frame.frame().data()).len(), chunk);
            }
        }
    }

    #[test]
    fn single_asic_addresses_chain_position() {
        let model = pixels(16);
        let mut builder = TransactionBuilder::new(topology(16));
        builder.pixels_single(&model, "Control register", 2, false).unwrap();
        let transaction = builder.finish();
        let frames = transaction.frames().collect::<Vec<_>>();

        // bypass, X0, X1, Y, bypass, then four chunks
        assert_eq!(frames.len(), 9);
        assert!(frames[0].frame().instructions().iter().all(|i| *i == Instruction::BYPASS));
        let select = frames[1].frame().instructions();
        assert_eq!(select[5], Instruction::SELECT_X0);
        assert_eq!(select.iter().filter(|i| **i == Instruction::BYPASS).count(), 15);
        assert_eq!(frames[1].frame().data().len(), 32 + 10 + 1);
        assert_eq!(frames[3].frame().data().len(), 64 + 10 + 1);
        assert_eq!(frames[3].frame().data().count_ones(), 0);
    }

    #[test]
    fn uniform_pixels_replicate_pixel_zero() {
        let mut model = pixels(8);
        model.set_device_bits("Control register", 0, &bitvec![u8, Lsb0; 1; BITS_PER_PIXEL]);
        let mut builder = TransactionBuilder::new(topology(8));
        builder.pixels_uniform(&model, "Control register", true).unwrap();
        let transaction = builder.finish();

        assert_eq!(data_bits(&transaction, Instruction::SELECT_Y), vec![64 * 8 + 1]);
        assert_eq!(
            data_bits(&transaction, Instruction::PIXEL_0),
            vec![BITS_PER_PIXEL * 8 + 1]
        );
        let frame = transaction.readback_frames().next().unwrap();
        assert_eq!(frame.frame().data().count_ones(), BITS_PER_PIXEL * 8);
        assert!(!frame.frame().data()[BITS_PER_PIXEL * 8]);
        assert_eq!(transaction.checks().len(), 2);
    }

    #[test]
    fn pixel_selection_bits() {
        let mut builder = TransactionBuilder::new(topology(16));
        builder.select_pixel(37).unwrap();
        builder.select_pixel(4096 + 64 + 40).unwrap();
        assert!(builder.select_pixel(16 * 4096).is_err());
        let transaction = builder.finish();
        let ones = transaction
            .frames()
            .map(|f| f.frame().data().iter_ones().collect::<Vec<_>>())
            .collect::<Vec<_>>();

        let x_len = 32 * 16;
        let y_len = 64 * 16;
        assert_eq!(ones[0], Vec::<usize>::new());
        assert_eq!(ones[1], vec![x_len - 1 - 5]);
        assert_eq!(ones[2], vec![y_len - 1]);
        assert_eq!(ones[3], Vec::<usize>::new());
        assert_eq!(ones[4], vec![x_len - 1 - (32 + 8)]);
        assert_eq!(ones[5], vec![y_len - 1 - (64 + 1)]);
    }

    #[test]
    fn direct_pixel_uses_column_half() {
        let mut model = pixels(1);
        model.set_device_bits("Control register", 37, &bitvec![u8, Lsb0; 1, 0, 1]);
        let mut builder = TransactionBuilder::new(topology(1));
        builder.pixel_direct(&model, "Control register", 37).unwrap();
        builder.pixel_direct(&model, "Control register", 5).unwrap();
        let transaction = builder.finish();
        let frames = transaction.frames().collect::<Vec<_>>();
        assert_eq!(frames.len(), 8);
        assert_eq!(frames[3].frame().instructions()[0], Instruction::PIXEL_1);
        assert_eq!(frames[3].frame().data().len(), BITS_PER_PIXEL + 1);
        assert_eq!(frames[3].frame().data().iter_ones().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(frames[7].frame().instructions()[0], Instruction::PIXEL_0);
        assert!(!transaction.has_readback());
    }

    #[test]
    fn register_requires_chain_length() {
        let model = jtag(8);
        let mut builder = TransactionBuilder::new(topology(16));
        assert!(matches!(
            builder.register(&model, "Global Control Register", false),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            builder.register(&model, "Missing", false),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn register_write_and_readback_pass() {
        let model = jtag(16);
        let mut builder = TransactionBuilder::new(topology(16));
        builder.all_registers(&model, false).unwrap();
        builder.all_registers(&model, true).unwrap();
        let transaction = builder.finish();
        assert_eq!(transaction.frames().count(), 4);
        assert_eq!(transaction.readback_frames().count(), 2);
        assert_eq!(transaction.readback_bytes(), 80 + 180);
        assert_eq!(
            transaction.checks()[1],
            Check::Content {
                family: FamilyKind::Jtag,
                set: "Master FSM Config Register".to_string(),
                devices: DeviceSelector::All
            }
        );
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let model = MemoryModel::new().with_set(MemorySet::new("Huge", 2, 5000, 16));
        let mut builder = TransactionBuilder::new(topology(16));
        assert!(builder.register(&model, "Huge", false).unwrap_err().is_fatal());
    }

    #[test]
    fn sequencer_is_replicated() {
        let mut sequencer = MemorySequencer::new(20).with_track(2, vec![0..5]);
        sequencer.compile().unwrap();
        let mut builder = TransactionBuilder::new(topology(4));
        builder.sequencer(&sequencer, true).unwrap();
        let transaction = builder.finish();
        let frames = transaction.frames().collect::<Vec<_>>();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame().instructions()[0], Instruction::SEQUENCER_HOLD);
        assert_eq!(frames[0].frame().data().len(), 16 * 4);
        assert_eq!(frames[1].frame().instructions()[0], Instruction::track(2));
        assert_eq!(frames[1].frame().data().count_ones(), 5 * 4);
    }

    #[test]
    fn output_formats() {
        let mut builder = TransactionBuilder::new(topology(1));
        builder.jtag_reset();
        builder.bypass_all().unwrap();
        let transaction = builder.finish();

        let words = transaction.engine_words();
        assert_eq!(words.len(), 16 + 5 + 1 + 2);
        assert_eq!(words[16..21], [0, 4, 0, 3, 15]);

        let file = transaction.command_file(0x34);
        let lines = file.lines().collect::<Vec<_>>();
        assert_eq!(lines[..3], ["34", "18", "ff"]);
        assert_eq!(lines.len(), 2 + words.len());

        let payloads = transaction.direct_payloads(0x34);
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].starts_with("1a;34;18;ff;"));
        assert!(payloads[0].ends_with(";0;0$"));
    }

    #[test]
    fn padding_is_stripped_in_reverse() {
        let frame = PendingFrame {
            frame: JtagFrame::broadcast(1, Instruction::PIXEL_0, bitvec![u8, Lsb0; 1; 8], true)
                .unwrap(),
            padding: vec![1, 3],
            check: None,
        };
        let data = bitvec![u8, Lsb0; 1, 0, 1, 1, 0, 0, 0, 0];
        assert_eq!(frame.strip_padding(&data), bitvec![u8, Lsb0; 1, 0, 1, 1]);
        assert_eq!(frame.padding_bits(), 4);
    }
}
