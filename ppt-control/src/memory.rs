//! In-memory register models for simulation and tests.
//!
//! ```
//! use ppt_control::{RegisterModel, memory::{MemoryModel, MemorySet}, registers::DeviceSelector};
//!
//! let mut model = MemoryModel::new().with_set(
//!     MemorySet::new("ASIC_reset", 0x510, 2, 4)
//!         .signal("ASIC_reset", 0, 1)
//!         .signal("ASIC_pll_reset", 1, 1),
//! );
//! assert!(model.set_signal("ASIC_reset", &DeviceSelector::One(2), "ASIC_pll_reset", 1));
//! assert_eq!(model.signal("ASIC_reset", 2, "ASIC_pll_reset"), Some(1));
//! assert_eq!(model.signal("ASIC_reset", 1, "ASIC_pll_reset"), Some(0));
//! ```
use std::ops::Range;

use bitvec::prelude::*;
use ppt_protocol::jtag::Bits;

use crate::{
    RegisterModel, SequencerModel, Track,
    registers::{BitMismatch, DeviceSelector, Layout},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignalDef {
    pub name: String,
    pub offset: usize,
    pub width: usize,
    pub read_only: bool,
    pub active_low: bool,
}

impl SignalDef {
    fn mask(&self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1 << self.width) - 1
        }
    }

    fn contains(&self, offset: usize) -> bool {
        (self.offset..self.offset + self.width).contains(&offset)
    }
}

/// A module set with one bit image per device.
#[derive(Clone, Debug)]
pub struct MemorySet {
    name: String,
    layout: Layout,
    signals: Vec<SignalDef>,
    devices: Vec<Bits>,
}

impl MemorySet {
    pub fn new(
        name: impl Into<String>,
        address: u32,
        bits_per_device: usize,
        device_count: usize,
    ) -> MemorySet {
        MemorySet {
            name: name.into(),
            layout: Layout {
                address,
                bits_per_device,
                device_count,
                read_only: false,
            },
            signals: Vec::new(),
            devices: vec![bitvec![u8, Lsb0; 0; bits_per_device]; device_count],
        }
    }

    pub fn read_only(mut self) -> Self {
        self.layout.read_only = true;
        self
    }

    pub fn signal(self, name: &str, offset: usize, width: usize) -> Self {
        self.with_signal(name, offset, width, false, false)
    }

    /// A signal that reflects hardware status and is refreshed on every readback.
    pub fn status_signal(self, name: &str, offset: usize, width: usize) -> Self {
        self.with_signal(name, offset, width, true, false)
    }

    /// A signal stored inverted in hardware.
    pub fn active_low_signal(self, name: &str, offset: usize, width: usize) -> Self {
        self.with_signal(name, offset, width, false, true)
    }

    fn with_signal(
        mut self,
        name: &str,
        offset: usize,
        width: usize,
        read_only: bool,
        active_low: bool,
    ) -> Self {
        self.signals.push(SignalDef {
            name: name.to_string(),
            offset,
            width: width.min(32),
            read_only,
            active_low,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self, device: usize) -> Option<&Bits> {
        self.devices.get(device)
    }

    fn find_signal(&self, name: &str) -> Option<&SignalDef> {
        self.signals.iter().find(|signal| signal.name == name)
    }

    fn is_status_bit(&self, offset: usize) -> bool {
        self.layout.read_only
            || self
                .signals
                .iter()
                .any(|signal| signal.read_only && signal.contains(offset))
    }
}

/// A register family held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryModel {
    sets: Vec<MemorySet>,
}

impl MemoryModel {
    pub fn new() -> MemoryModel {
        MemoryModel::default()
    }

    pub fn with_set(mut self, set: MemorySet) -> Self {
        self.insert(set);
        self
    }

    /// Adds `set`, replacing a set of the same name.
    pub fn insert(&mut self, set: MemorySet) {
        match self.sets.iter_mut().find(|s| s.name == set.name) {
            Some(existing) => *existing = set,
            None => self.sets.push(set),
        }
    }

    pub fn set(&self, name: &str) -> Option<&MemorySet> {
        self.sets.iter().find(|s| s.name == name)
    }

    fn set_mut(&mut self, name: &str) -> Option<&mut MemorySet> {
        self.sets.iter_mut().find(|s| s.name == name)
    }

    /// Overwrites the image of one device. Returns `false` for an unknown set or device.
    pub fn set_device_bits(&mut self, set: &str, device: usize, bits: &BitSlice<u8, Lsb0>) -> bool {
        let Some(set) = self.set_mut(set) else {
            return false;
        };
        let width = set.layout.bits_per_device;
        match set.devices.get_mut(device) {
            Some(image) => {
                let len = width.min(bits.len());
                image[..len].copy_from_bitslice(&bits[..len]);
                true
            }
            None => false,
        }
    }
}

impl RegisterModel for MemoryModel {
    fn module_sets(&self) -> Vec<String> {
        self.sets.iter().map(|set| set.name.clone()).collect()
    }

    fn layout(&self, set: &str) -> Option<Layout> {
        self.set(set).map(|set| set.layout)
    }

    fn content(&self, set: &str, devices: &DeviceSelector) -> Bits {
        let mut bits = Bits::new();
        if let Some(set) = self.set(set) {
            for device in devices.devices(set.devices.len()) {
                bits.extend_from_bitslice(&set.devices[device]);
            }
        }
        bits
    }

    fn is_uniform(&self, set: &str) -> bool {
        match self.set(set) {
            Some(set) => set.devices.windows(2).all(|pair| pair[0] == pair[1]),
            None => true,
        }
    }

    fn compare(
        &mut self,
        bits: &BitSlice<u8, Lsb0>,
        set: &str,
        devices: &DeviceSelector,
        overwrite: bool,
    ) -> Vec<BitMismatch> {
        let Some(set) = self.set_mut(set) else {
            return Vec::new();
        };
        let width = set.layout.bits_per_device;
        let status = (0..width)
            .map(|offset| set.is_status_bit(offset))
            .collect::<Vec<_>>();

        let mut mismatches = Vec::new();
        for (window, device) in devices.devices(set.devices.len()).enumerate() {
            let start = window * width;
            if start >= bits.len() {
                break;
            }
            let read = &bits[start..(start + width).min(bits.len())];
            let image = &mut set.devices[device];
            for (offset, actual) in read.iter().by_vals().enumerate() {
                if status[offset] {
                    image.set(offset, actual);
                    continue;
                }
                let expected = image[offset];
                if expected != actual {
                    mismatches.push(BitMismatch {
                        device,
                        offset,
                        expected,
                        actual,
                    });
                }
                if overwrite {
                    image.set(offset, actual);
                }
            }
        }
        mismatches
    }

    fn signal(&self, set: &str, device: usize, name: &str) -> Option<u32> {
        let set = self.set(set)?;
        let signal = set.find_signal(name)?;
        let image = set.devices.get(device)?;
        let raw = (0..signal.width)
            .filter(|bit| image.get(signal.offset + bit).is_some_and(|b| *b))
            .fold(0u32, |acc, bit| acc | 1 << bit);
        Some(if signal.active_low {
            !raw & signal.mask()
        } else {
            raw
        })
    }

    fn set_signal(
        &mut self,
        set: &str,
        devices: &DeviceSelector,
        name: &str,
        value: u32,
    ) -> bool {
        let Some(set) = self.set_mut(set) else {
            return false;
        };
        let Some(signal) = set.find_signal(name).cloned() else {
            return false;
        };
        let value = if signal.active_low { !value } else { value } & signal.mask();
        for device in devices.devices(set.devices.len()) {
            let image = &mut set.devices[device];
            for bit in 0..signal.width {
                let offset = signal.offset + bit;
                if offset < image.len() {
                    image.set(offset, value & (1 << bit) != 0);
                }
            }
        }
        true
    }
}

const HOLD_FIELD_BITS: usize = 8;

/// A sequencer described by hold periods and per-track phases within one cycle.
#[derive(Clone, Debug)]
pub struct MemorySequencer {
    cycle_length: usize,
    holds: Vec<(usize, usize)>,
    phases: Vec<(u8, Vec<Range<usize>>)>,
    hold: Bits,
    tracks: Vec<Track>,
}

impl MemorySequencer {
    pub fn new(cycle_length: usize) -> MemorySequencer {
        MemorySequencer {
            cycle_length,
            holds: Vec::new(),
            phases: Vec::new(),
            hold: Bits::new(),
            tracks: Vec::new(),
        }
    }

    /// Holds the cycle for `length` clocks at `position`.
    pub fn with_hold(mut self, position: usize, length: usize) -> Self {
        self.holds.push((position, length));
        self
    }

    /// Drives track `sub_address` high during `phases`.
    pub fn with_track(mut self, sub_address: u8, phases: Vec<Range<usize>>) -> Self {
        self.phases.push((sub_address, phases));
        self
    }

    fn field(value: usize) -> Result<Bits, String> {
        if value >= 1 << HOLD_FIELD_BITS {
            return Err(format!(
                "Hold value {} does not fit into {} bits",
                value, HOLD_FIELD_BITS
            ));
        }
        Ok((0..HOLD_FIELD_BITS).map(|bit| value & (1 << bit) != 0).collect())
    }

    fn differences(expected: &BitSlice<u8, Lsb0>, actual: &BitSlice<u8, Lsb0>) -> Vec<BitMismatch> {
        expected
            .iter()
            .by_vals()
            .zip(actual.iter().by_vals())
            .enumerate()
            .filter(|(_, (expected, actual))| expected != actual)
            .map(|(offset, (expected, actual))| BitMismatch {
                device: 0,
                offset,
                expected,
                actual,
            })
            .collect()
    }
}

impl SequencerModel for MemorySequencer {
    fn compile(&mut self) -> Result<(), String> {
        if self.cycle_length == 0 {
            return Err("Sequencer cycle length must not be zero".to_string());
        }
        let mut hold = Bits::new();
        let holds = if self.holds.is_empty() {
            vec![(0, 0)]
        } else {
            self.holds.clone()
        };
        for (position, length) in holds {
            if position + length > self.cycle_length {
                return Err(format!(
                    "Hold at {} of length {} exceeds the cycle of {}",
                    position, length, self.cycle_length
                ));
            }
            hold.extend_from_bitslice(&Self::field(position)?);
            hold.extend_from_bitslice(&Self::field(length)?);
        }

        let mut tracks = Vec::with_capacity(self.phases.len());
        for (sub_address, phases) in &self.phases {
            let mut bits = bitvec![u8, Lsb0; 0; self.cycle_length];
            for phase in phases {
                if phase.end > self.cycle_length {
                    return Err(format!(
                        "Phase {:?} of track {} exceeds the cycle of {}",
                        phase, sub_address, self.cycle_length
                    ));
                }
                bits[phase.clone()].fill(true);
            }
            tracks.push(Track {
                sub_address: *sub_address,
                bits,
            });
        }
        self.hold = hold;
        self.tracks = tracks;
        Ok(())
    }

    fn hold_bits(&self) -> Bits {
        self.hold.clone()
    }

    fn tracks(&self) -> Vec<Track> {
        self.tracks.clone()
    }

    fn compare_hold(&mut self, bits: &BitSlice<u8, Lsb0>) -> Vec<BitMismatch> {
        Self::differences(&self.hold, bits)
    }

    fn compare_track(&mut self, index: usize, bits: &BitSlice<u8, Lsb0>) -> Vec<BitMismatch> {
        match self.tracks.get(index) {
            Some(track) => Self::differences(&track.bits, bits),
            None => Vec::new(),
        }
    }
}
