//! Shared access to the register families and the vocabulary of verification.
use std::{
    fmt::{Display, Formatter},
    ops::Range,
};

use bitvec::prelude::*;
use parking_lot::{Mutex, MutexGuard};
use ppt_protocol::jtag::Bits;

use crate::{RegisterModel, SequencerModel, error::Error};

/// Selects devices of a module set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceSelector {
    All,
    One(usize),
    Span(Range<usize>),
}

impl DeviceSelector {
    /// Device indices selected out of `count` devices.
    pub fn devices(&self, count: usize) -> Range<usize> {
        match self {
            DeviceSelector::All => 0..count,
            DeviceSelector::One(device) => (*device).min(count)..(*device + 1).min(count),
            DeviceSelector::Span(range) => range.start.min(count)..range.end.min(count),
        }
    }
}

impl Display for DeviceSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::All => write!(f, "all"),
            DeviceSelector::One(device) => write!(f, "{}", device),
            DeviceSelector::Span(range) => write!(f, "{}-{}", range.start, range.end),
        }
    }
}

/// Hardware layout of a module set.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Layout {
    pub address: u32,
    pub bits_per_device: usize,
    pub device_count: usize,
    /// Read-only sets hold status bits and are never written.
    pub read_only: bool,
}

impl Layout {
    pub fn total_bits(&self) -> usize {
        self.bits_per_device * self.device_count
    }
}

/// One bit that differs between the hardware and the model.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BitMismatch {
    pub device: usize,
    /// Bit offset inside the register of `device`.
    pub offset: usize,
    pub expected: bool,
    pub actual: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MismatchReport {
    pub family: FamilyKind,
    pub module_set: String,
    pub mismatches: Vec<BitMismatch>,
}

impl MismatchReport {
    pub fn new(family: FamilyKind, module_set: &str, mismatches: Vec<BitMismatch>) -> Self {
        MismatchReport {
            family,
            module_set: module_set.to_string(),
            mismatches,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Devices with at least one mismatching bit, in ascending order.
    pub fn devices(&self) -> Vec<usize> {
        let mut devices = self.mismatches.iter().map(|m| m.device).collect::<Vec<_>>();
        devices.sort_unstable();
        devices.dedup();
        devices
    }
}

impl Display for MismatchReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} register {}: {} bits differ",
            self.family,
            self.module_set,
            self.mismatches.len()
        )?;
        if !self.is_clean() {
            let devices = self.devices();
            write!(f, " in devices {:?}", devices)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FamilyKind {
    Epc,
    Iob,
    Jtag,
    Pixel,
    Sequencer,
}

impl Display for FamilyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FamilyKind::Epc => "EPC",
            FamilyKind::Iob => "IOB",
            FamilyKind::Jtag => "JTAG",
            FamilyKind::Pixel => "Pixel",
            FamilyKind::Sequencer => "Sequencer",
        };
        write!(f, "{}", name)
    }
}

/// The model of one register family, guarded against concurrent callers.
pub struct Family<M: ?Sized> {
    kind: FamilyKind,
    model: Mutex<Box<M>>,
}

impl<M: ?Sized> Family<M> {
    pub fn new(kind: FamilyKind, model: Box<M>) -> Family<M> {
        Family {
            kind,
            model: Mutex::new(model),
        }
    }

    pub fn kind(&self) -> FamilyKind {
        self.kind
    }

    /// Takes the family for exclusive use. Fails with [Error::Busy] instead of waiting.
    pub fn lock(&self) -> Result<MutexGuard<'_, Box<M>>, Error> {
        self.model.try_lock().ok_or_else(|| {
            log::warn!("{} registers are locked by another caller", self.kind);
            Error::Busy(self.kind)
        })
    }
}

/// The last known configuration of every register family.
pub struct Registers {
    pub epc: Family<dyn RegisterModel>,
    pub iob: Family<dyn RegisterModel>,
    pub jtag: Family<dyn RegisterModel>,
    pub pixel: Family<dyn RegisterModel>,
    pub sequencer: Family<dyn SequencerModel>,
}

impl Registers {
    pub fn new(
        epc: Box<dyn RegisterModel>,
        iob: Box<dyn RegisterModel>,
        jtag: Box<dyn RegisterModel>,
        pixel: Box<dyn RegisterModel>,
        sequencer: Box<dyn SequencerModel>,
    ) -> Registers {
        Registers {
            epc: Family::new(FamilyKind::Epc, epc),
            iob: Family::new(FamilyKind::Iob, iob),
            jtag: Family::new(FamilyKind::Jtag, jtag),
            pixel: Family::new(FamilyKind::Pixel, pixel),
            sequencer: Family::new(FamilyKind::Sequencer, sequencer),
        }
    }
}

/// The lowest `len` bits of `value`, LSB first.
pub fn word_bits(value: u32, len: usize) -> Bits {
    (0..len.min(32)).map(|bit| value & (1 << bit) != 0).collect()
}

/// Inverse of [word_bits]. Bits beyond the 32nd are ignored.
pub fn bits_word(bits: &BitSlice<u8, Lsb0>) -> u32 {
    bits.iter_ones()
        .take_while(|index| *index < 32)
        .fold(0, |acc, index| acc | 1 << index)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::{MemoryModel, MemorySequencer, MemorySet};

    #[test]
    fn selector_ranges_are_clamped() {
        assert_eq!(DeviceSelector::All.devices(4), 0..4);
        assert_eq!(DeviceSelector::One(2).devices(4), 2..3);
        assert_eq!(DeviceSelector::One(7).devices(4), 4..4);
        assert_eq!(DeviceSelector::Span(2..9).devices(4), 2..4);
    }

    #[test]
    fn word_conversion() {
        let bits = word_bits(0b1011, 6);
        assert_eq!(bits, bitvec![u8, Lsb0; 1, 1, 0, 1, 0, 0]);
        assert_eq!(bits_word(&bits), 0b1011);
        assert_eq!(bits_word(&word_bits(0xdead_beef, 32)), 0xdead_beef);
    }

    #[test]
    fn second_lock_is_busy() {
        let model = MemoryModel::new().with_set(MemorySet::new("A", 1, 8, 1));
        let family: Family<dyn RegisterModel> = Family::new(FamilyKind::Jtag, Box::new(model));
        let guard = family.lock().unwrap();
        assert!(matches!(family.lock(), Err(Error::Busy(FamilyKind::Jtag))));
        drop(guard);
        assert!(family.lock().is_ok());
    }

    #[test]
    fn families_lock_independently() {
        let registers = Registers::new(
            Box::new(MemoryModel::new()),
            Box::new(MemoryModel::new()),
            Box::new(MemoryModel::new()),
            Box::new(MemoryModel::new()),
            Box::new(MemorySequencer::new(8)),
        );
        let _epc = registers.epc.lock().unwrap();
        let _pixel = registers.pixel.lock().unwrap();
        assert!(registers.jtag.lock().is_ok());
        assert!(matches!(registers.epc.lock(), Err(Error::Busy(FamilyKind::Epc))));
    }

    #[test]
    fn report_lists_devices() {
        let mismatch = |device| BitMismatch {
            device,
            offset: 0,
            expected: true,
            actual: false,
        };
        let report = MismatchReport::new(
            FamilyKind::Pixel,
            "Control register",
            vec![mismatch(3), mismatch(1), mismatch(3)],
        );
        assert_eq!(report.devices(), vec![1, 3]);
        assert_eq!(
            report.to_string(),
            "Pixel register Control register: 3 bits differ in devices [1, 3]"
        );
    }
}
