//! Verification of readback data against the register models.
//!
//! The JTAG engine records the bits shifted out of the chain for every frame with the
//! readback flag. The recording is fetched as one flat buffer. [verify] walks the
//! readback frames of the transaction in transmission order, takes the bits of every
//! frame from the front of the buffer, removes the padding the builder inserted and
//! hands the joined windows of every [Check] to the model that owns them.
use std::{
    fmt::{Display, Formatter},
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use bitvec::prelude::*;
use ppt_protocol::{error::ReadError, jtag::Bits};

use crate::{
    RegisterModel, SequencerModel,
    builder::{Check, Transaction},
    error::Error,
    registers::{BitMismatch, DeviceSelector, FamilyKind, MismatchReport},
};

/// Readback data, consumed from the front.
#[derive(Clone, Debug, Default)]
pub struct ReadbackBuffer {
    data: Vec<u8>,
    position: usize,
}

impl ReadbackBuffer {
    pub fn new(data: Vec<u8>) -> ReadbackBuffer {
        ReadbackBuffer { data, position: 0 }
    }

    /// Parses a readback file holding one hex byte per line.
    pub fn parse(text: &str) -> Result<ReadbackBuffer, Error> {
        let data = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                u8::from_str_radix(line, 16).map_err(|err| {
                    log::error!("Malformed readback line {:?}: {}", line, err);
                    ppt_client::Error::Protocol(ReadError::from(err))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ReadbackBuffer::new(data))
    }

    pub fn remaining_bytes(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn remaining_bits(&self) -> usize {
        self.remaining_bytes() * 8
    }

    /// Takes the next `count` bits. Whole bytes are consumed, so the bits of a frame
    /// that does not end on a byte boundary are followed by unused bits.
    pub fn take_bits(&mut self, count: usize) -> Result<Bits, Error> {
        if count > self.remaining_bits() {
            log::error!(
                "Readback data too short: needed {} bits, {} remain",
                count,
                self.remaining_bits()
            );
            return Err(Error::InsufficientData {
                needed: count,
                available: self.remaining_bits(),
            });
        }
        let bytes = count.div_ceil(8);
        let mut bits = Bits::from_slice(&self.data[self.position..self.position + bytes]);
        bits.truncate(count);
        self.position += bytes;
        Ok(bits)
    }
}

/// Outcome of a programming operation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Verdict {
    /// Nothing was read back, either because no readback was requested or because the
    /// transport is simulated.
    #[default]
    Unchecked,
    Passed,
    Failed(Vec<MismatchReport>),
}

impl Verdict {
    /// `Passed` unless one of `reports` holds a mismatch.
    pub fn from_reports(reports: Vec<MismatchReport>) -> Verdict {
        let failed = reports
            .into_iter()
            .filter(|report| !report.is_clean())
            .collect::<Vec<_>>();
        if failed.is_empty() {
            Verdict::Passed
        } else {
            Verdict::Failed(failed)
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Failed(_))
    }

    pub fn reports(&self) -> &[MismatchReport] {
        match self {
            Verdict::Failed(reports) => reports,
            _ => &[],
        }
    }

    /// Combines the verdicts of two operations. Failures are kept from both sides.
    pub fn merge(self, other: Verdict) -> Verdict {
        match (self, other) {
            (Verdict::Failed(mut first), Verdict::Failed(second)) => {
                first.extend(second);
                Verdict::Failed(first)
            }
            (failed @ Verdict::Failed(_), _) | (_, failed @ Verdict::Failed(_)) => failed,
            (Verdict::Passed, _) | (_, Verdict::Passed) => Verdict::Passed,
            _ => Verdict::Unchecked,
        }
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Unchecked => write!(f, "not verified"),
            Verdict::Passed => write!(f, "verified"),
            Verdict::Failed(reports) => {
                write!(f, "verification failed")?;
                for report in reports {
                    write!(f, "; {}", report)?;
                }
                Ok(())
            }
        }
    }
}

/// The models a transaction is verified against.
#[derive(Default)]
pub struct Models<'a> {
    pub jtag: Option<&'a mut dyn RegisterModel>,
    pub pixel: Option<&'a mut dyn RegisterModel>,
    pub sequencer: Option<&'a mut dyn SequencerModel>,
}

impl<'a> Models<'a> {
    fn register(&mut self, family: FamilyKind) -> Result<&mut (dyn RegisterModel + 'a), Error> {
        let model = match family {
            FamilyKind::Jtag => self.jtag.as_deref_mut(),
            FamilyKind::Pixel => self.pixel.as_deref_mut(),
            _ => None,
        };
        model.ok_or_else(|| {
            Error::Configuration(format!("No {} model to verify readback against", family))
        })
    }

    fn sequencer(&mut self) -> Result<&mut (dyn SequencerModel + 'a), Error> {
        self.sequencer.as_deref_mut().ok_or_else(|| {
            Error::Configuration("No sequencer model to verify readback against".to_string())
        })
    }
}

/// Splits the buffer into one window per check of `transaction`.
fn collect_windows(
    transaction: &Transaction,
    buffer: &mut ReadbackBuffer,
) -> Result<Vec<Bits>, Error> {
    let mut windows = vec![Bits::new(); transaction.checks().len()];
    for frame in transaction.readback_frames() {
        let bits = buffer.take_bits(frame.frame().data().len())?;
        if let Some(window) = frame.check().and_then(|check| windows.get_mut(check)) {
            window.extend_from_bitslice(&frame.strip_padding(&bits));
        }
    }
    if buffer.remaining_bytes() > 0 {
        log::warn!(
            "{} bytes of readback data were not consumed",
            buffer.remaining_bytes()
        );
    }
    Ok(windows)
}

/// Compares `copies` consecutive windows of `width` bits with `compare`, reporting the
/// copy index as device.
fn compare_copies(
    window: &BitSlice<u8, Lsb0>,
    width: usize,
    copies: usize,
    mut compare: impl FnMut(&BitSlice<u8, Lsb0>) -> Vec<BitMismatch>,
) -> Vec<BitMismatch> {
    let mut mismatches = Vec::new();
    if width == 0 {
        return mismatches;
    }
    for (copy, bits) in window.chunks(width).take(copies).enumerate() {
        mismatches.extend(compare(bits).into_iter().map(|mismatch| BitMismatch {
            device: copy,
            ..mismatch
        }));
    }
    mismatches
}

/// Verifies the readback data of `transaction`. Returns one report per check.
pub fn verify(
    transaction: &Transaction,
    buffer: &mut ReadbackBuffer,
    models: &mut Models,
    overwrite: bool,
) -> Result<Vec<MismatchReport>, Error> {
    let windows = collect_windows(transaction, buffer)?;
    let mut reports = Vec::with_capacity(windows.len());
    for (check, window) in transaction.checks().iter().zip(windows) {
        let report = match check {
            Check::Content {
                family,
                set,
                devices,
            } => {
                let model = models.register(*family)?;
                let mismatches = model.compare(&window, set, devices, overwrite);
                MismatchReport::new(*family, set, mismatches)
            }
            Check::Replicated {
                family,
                set,
                device,
                copies,
            } => {
                let model = models.register(*family)?;
                let width = model
                    .layout(set)
                    .map(|layout| layout.bits_per_device)
                    .unwrap_or_default();
                let selector = DeviceSelector::One(*device);
                let mismatches = compare_copies(&window, width, *copies, |bits| {
                    model.compare(bits, set, &selector, overwrite)
                });
                MismatchReport::new(*family, set, mismatches)
            }
            Check::SequencerHold { copies } => {
                let model = models.sequencer()?;
                let width = model.hold_bits().len();
                let mismatches =
                    compare_copies(&window, width, *copies, |bits| model.compare_hold(bits));
                MismatchReport::new(FamilyKind::Sequencer, "Hold counts", mismatches)
            }
            Check::SequencerTrack { index, copies } => {
                let model = models.sequencer()?;
                let width = model
                    .tracks()
                    .get(*index)
                    .map(|track| track.bits.len())
                    .unwrap_or_default();
                let mismatches = compare_copies(&window, width, *copies, |bits| {
                    model.compare_track(*index, bits)
                });
                MismatchReport::new(FamilyKind::Sequencer, &format!("Track {}", index), mismatches)
            }
        };
        if !report.is_clean() {
            log::error!("{}", report);
        }
        reports.push(report);
    }
    Ok(reports)
}

/// Path of the dump written for a failed verification of `report`.
pub fn dump_path(dir: &Path, report: &MismatchReport) -> PathBuf {
    dir.join(format!(
        "{}_{}_RB.txt",
        report.family,
        report.module_set.replace(' ', "_")
    ))
}

/// Writes every mismatching bit of `report` as `device offset expected actual`.
pub fn write_dump(dir: &Path, report: &MismatchReport) -> Result<PathBuf, Error> {
    fs::create_dir_all(dir)?;
    let path = dump_path(dir, report);
    let mut file = fs::File::create(&path)?;
    writeln!(file, "# {}", report)?;
    writeln!(file, "# device offset expected actual")?;
    for mismatch in &report.mismatches {
        writeln!(
            file,
            "{} {} {} {}",
            mismatch.device,
            mismatch.offset,
            u8::from(mismatch.expected),
            u8::from(mismatch.actual)
        )?;
    }
    log::info!("Wrote readback dump {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        builder::TransactionBuilder,
        config::Topology,
        memory::{MemoryModel, MemorySequencer, MemorySet},
    };
    use ppt_protocol::jtag::pack_bits;

    fn topology(chain_len: usize) -> Topology {
        Topology {
            chain_len,
            ..Topology::default()
        }
    }

    /// What a chain returns when every device reads back what it was given.
    fn echo(transaction: &Transaction) -> ReadbackBuffer {
        let mut data = Vec::new();
        for frame in transaction.readback_frames() {
            data.extend(pack_bits(frame.frame().data()));
        }
        ReadbackBuffer::new(data)
    }

    #[test]
    fn take_bits_consumes_whole_bytes() {
        let mut buffer = ReadbackBuffer::parse("ff\n01\n 80 \n\n").unwrap();
        assert_eq!(buffer.remaining_bits(), 24);
        assert_eq!(buffer.take_bits(4).unwrap(), bitvec![u8, Lsb0; 1, 1, 1, 1]);
        assert_eq!(buffer.remaining_bytes(), 2);
        assert!(matches!(
            buffer.take_bits(17),
            Err(Error::InsufficientData {
                needed: 17,
                available: 16
            })
        ));
        let rest = buffer.take_bits(16).unwrap();
        assert_eq!(rest.iter_ones().collect::<Vec<_>>(), vec![0, 15]);
    }

    #[test]
    fn malformed_readback_file() {
        assert!(matches!(
            ReadbackBuffer::parse("ff\nzz\n"),
            Err(Error::Transport(ppt_client::Error::Protocol(_)))
        ));
    }

    #[test]
    fn verdict_merge() {
        let failed = Verdict::Failed(vec![MismatchReport::new(
            FamilyKind::Epc,
            "A",
            vec![BitMismatch {
                device: 0,
                offset: 1,
                expected: true,
                actual: false,
            }],
        )]);
        assert_eq!(Verdict::Unchecked.merge(Verdict::Passed), Verdict::Passed);
        assert_eq!(Verdict::Unchecked.merge(Verdict::Unchecked), Verdict::Unchecked);
        assert!(Verdict::Passed.merge(failed.clone()).is_failure());
        assert_eq!(failed.clone().merge(failed).reports().len(), 2);
        assert_eq!(
            Verdict::from_reports(vec![MismatchReport::new(FamilyKind::Jtag, "B", Vec::new())]),
            Verdict::Passed
        );
    }

    #[test]
    fn echoed_registers_pass() {
        let mut model = MemoryModel::new()
            .with_set(MemorySet::new("Global Control Register", 1, 40, 4).signal("G", 0, 8))
            .with_set(MemorySet::new("Bias", 2, 13, 4).signal("B", 3, 5));
        model.set_signal("Bias", &DeviceSelector::One(2), "B", 0x15);

        let mut builder = TransactionBuilder::new(topology(4));
        builder.all_registers(&model, true).unwrap();
        let transaction = builder.finish();
        let mut buffer = echo(&transaction);

        let mut models = Models {
            jtag: Some(&mut model),
            ..Models::default()
        };
        let reports = verify(&transaction, &mut buffer, &mut models, false).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(Verdict::from_reports(reports), Verdict::Passed);
    }

    #[test]
    fn flipped_bit_is_located() {
        let mut model =
            MemoryModel::new().with_set(MemorySet::new("Bias", 2, 13, 4).signal("B", 3, 5));
        let mut builder = TransactionBuilder::new(topology(4));
        builder.register(&model, "Bias", true).unwrap();
        let transaction = builder.finish();

        let mut data = echo(&transaction).data;
        // device 2, offset 4
        let bit = 2 * 13 + 4;
        data[bit / 8] ^= 1 << (bit % 8);
        let mut buffer = ReadbackBuffer::new(data);
        let mut models = Models {
            jtag: Some(&mut model),
            ..Models::default()
        };
        let reports = verify(&transaction, &mut buffer, &mut models, false).unwrap();
        assert_eq!(
            reports[0].mismatches,
            vec![BitMismatch {
                device: 2,
                offset: 4,
                expected: false,
                actual: true
            }]
        );
    }

    #[test]
    fn short_buffer_is_an_error() {
        let mut model = MemoryModel::new().with_set(MemorySet::new("Bias", 2, 13, 4));
        let mut builder = TransactionBuilder::new(topology(4));
        builder.register(&model, "Bias", true).unwrap();
        let transaction = builder.finish();
        let mut buffer = ReadbackBuffer::new(vec![0; 6]);
        let mut models = Models {
            jtag: Some(&mut model),
            ..Models::default()
        };
        assert!(matches!(
            verify(&transaction, &mut buffer, &mut models, false),
            Err(Error::InsufficientData {
                needed: 52,
                available: 48
            })
        ));
    }

    #[test]
    fn single_asic_padding_is_removed() {
        let chain_len = 8;
        let mut pixels = MemoryModel::new().with_set(MemorySet::new(
            "Control register",
            0,
            5,
            chain_len * 4096,
        ));
        // ASIC 3 sits at chain position 4
        pixels.set_device_bits("Control register", 4 * 4096 + 1500, &bitvec![u8, Lsb0; 1, 1]);
        let mut builder = TransactionBuilder::new(topology(chain_len));
        builder
            .pixels_single(&pixels, "Control register", 3, true)
            .unwrap();
        let transaction = builder.finish();
        let mut buffer = echo(&transaction);
        let mut models = Models {
            pixel: Some(&mut pixels),
            ..Models::default()
        };
        let reports = verify(&transaction, &mut buffer, &mut models, false).unwrap();
        assert!(reports.iter().all(MismatchReport::is_clean));
        assert_eq!(buffer.remaining_bytes(), 0);
    }

    #[test]
    fn replicated_windows_report_copy_index() {
        let chain_len = 4;
        let mut pixels = MemoryModel::new().with_set(MemorySet::new(
            "Control register",
            0,
            6,
            chain_len * 4096,
        ));
        let mut builder = TransactionBuilder::new(topology(chain_len));
        builder
            .pixels_uniform(&pixels, "Control register", true)
            .unwrap();
        let transaction = builder.finish();

        let mut data = echo(&transaction).data;
        // third copy of the first frame
        let bit = 2 * 6 + 1;
        data[bit / 8] ^= 1 << (bit % 8);
        let mut buffer = ReadbackBuffer::new(data);
        let mut models = Models {
            pixel: Some(&mut pixels),
            ..Models::default()
        };
        let reports = verify(&transaction, &mut buffer, &mut models, false).unwrap();
        let verdict = Verdict::from_reports(reports);
        assert_eq!(verdict.reports().len(), 1);
        assert_eq!(verdict.reports()[0].devices(), vec![2]);
        assert_eq!(verdict.reports()[0].mismatches[0].offset, 1);
    }

    #[test]
    fn sequencer_windows() {
        let mut sequencer = MemorySequencer::new(12)
            .with_hold(1, 2)
            .with_track(0, vec![0..3])
            .with_track(5, vec![4..12]);
        sequencer.compile().unwrap();
        let mut builder = TransactionBuilder::new(topology(3));
        builder.sequencer(&sequencer, true).unwrap();
        let transaction = builder.finish();
        let mut buffer = echo(&transaction);
        let mut models = Models {
            sequencer: Some(&mut sequencer),
            ..Models::default()
        };
        let reports = verify(&transaction, &mut buffer, &mut models, false).unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[2].module_set, "Track 1");
        assert!(reports.iter().all(MismatchReport::is_clean));
    }

    #[test]
    fn missing_model_is_a_configuration_error() {
        let model = MemoryModel::new().with_set(MemorySet::new("Bias", 2, 13, 1));
        let mut builder = TransactionBuilder::new(topology(1));
        builder.register(&model, "Bias", true).unwrap();
        let transaction = builder.finish();
        let mut buffer = echo(&transaction);
        assert!(
            verify(&transaction, &mut buffer, &mut Models::default(), false)
                .unwrap_err()
                .is_fatal()
        );
    }

    #[test]
    fn dump_lists_mismatches() {
        let dir = std::env::temp_dir().join(format!("ppt-dump-{}", std::process::id()));
        let report = MismatchReport::new(
            FamilyKind::Pixel,
            "Control register",
            vec![BitMismatch {
                device: 37,
                offset: 2,
                expected: true,
                actual: false,
            }],
        );
        let path = write_dump(&dir, &report).unwrap();
        assert!(path.ends_with("Pixel_Control_register_RB.txt"));
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.lines().any(|line| line == "37 2 1 0"));
        fs::remove_dir_all(dir).unwrap();
    }
}
