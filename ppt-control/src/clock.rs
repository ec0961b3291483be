//! The LMK clock buffers on the I/O boards.
//!
//! Every module carries four buffers. Each ASIC receives one fast and one slow clock,
//! driven by one output of one buffer. Buffers are programmed word by word through the
//! IOB registers `LMK_data` and `LMK_control`.
use ppt_client::Transport;

use crate::{
    context::DeviceContext, engine::Controller, error::Error, names, registers::DeviceSelector,
};

/// Buffer output driving the clock of each ASIC.
pub const OUTPUT_INDEX: [u8; 16] = [7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7];
/// Buffer, as a one-hot select, carrying the fast clock of each ASIC.
pub const FAST_BUFFERS: [u8; 16] = [1, 1, 1, 1, 8, 8, 8, 8, 1, 1, 1, 1, 8, 8, 8, 8];
/// Buffer, as a one-hot select, carrying the slow clock of each ASIC.
pub const SLOW_BUFFERS: [u8; 16] = [2, 2, 2, 2, 4, 4, 4, 4, 2, 2, 2, 2, 4, 4, 4, 4];

/// Register 9.
pub const GLOBAL_CONFIG: u32 = 0x0002_2a09;
/// Register 14 with the global clock enabled.
pub const GLOBAL_ENABLE: u32 = 0x6800_000e;
/// Register 14 with the global clock disabled and the buffer powered down.
pub const GLOBAL_POWER_DOWN: u32 = 0x6400_000e;

/// Writing more words than this starts with a buffer reset.
const RESET_THRESHOLD: usize = 5;

/// Settings of one buffer output.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutputSetting {
    pub output: u8,
    /// One-hot select of the buffer.
    pub buffer: u8,
    pub divider: u8,
    pub delay: u8,
    pub mux: u8,
    pub enabled: bool,
    pub reset: bool,
}

impl OutputSetting {
    fn new(output: u8, buffer: u8) -> OutputSetting {
        OutputSetting {
            output,
            buffer,
            divider: 1,
            delay: 0,
            mux: 0,
            enabled: true,
            reset: false,
        }
    }

    /// The register word of this output. Only output 0 can carry the reset bit.
    pub fn word(&self) -> u32 {
        let reset = self.reset && self.output == 0;
        u32::from(reset) << 31
            | (u32::from(self.mux) & 0x3) << 17
            | u32::from(self.enabled) << 16
            | u32::from(self.divider) << 8
            | (u32::from(self.delay) & 0xf) << 4
            | u32::from(self.output) & 0xf
    }

    pub fn set_default(&mut self) {
        *self = OutputSetting::new(self.output, self.buffer);
    }

    /// Routes the output through the delay line.
    pub fn set_delayed(&mut self, delayed: bool) {
        self.mux = if delayed { 2 } else { 0 };
    }
}

/// The fast and slow clock outputs of the ASICs of one module.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClockBank {
    pub fast: [OutputSetting; 16],
    pub slow: [OutputSetting; 16],
}

impl Default for ClockBank {
    fn default() -> Self {
        ClockBank {
            fast: std::array::from_fn(|asic| OutputSetting::new(OUTPUT_INDEX[asic], FAST_BUFFERS[asic])),
            slow: std::array::from_fn(|asic| OutputSetting::new(OUTPUT_INDEX[asic], SLOW_BUFFERS[asic])),
        }
    }
}

impl ClockBank {
    pub fn outputs(&self, fast: bool) -> &[OutputSetting; 16] {
        if fast { &self.fast } else { &self.slow }
    }

    pub fn output_mut(&mut self, asic: usize, fast: bool) -> Option<&mut OutputSetting> {
        if fast {
            self.fast.get_mut(asic)
        } else {
            self.slow.get_mut(asic)
        }
    }

    pub fn set_all_enabled(&mut self, enabled: bool) {
        for setting in self.fast.iter_mut().chain(self.slow.iter_mut()) {
            setting.enabled = enabled;
        }
    }

    pub fn set_defaults(&mut self) {
        for setting in self.fast.iter_mut().chain(self.slow.iter_mut()) {
            setting.set_default();
        }
    }
}

/// `LMK_dev_sel` for `buffer`, counted from 1. Zero selects every buffer.
pub fn buffer_select(buffer: u8) -> u32 {
    match buffer {
        0 => 0xf,
        n => 1 << (n - 1),
    }
}

impl<T: Transport> Controller<T> {
    pub fn clock_bank(&self, ctx: DeviceContext) -> &ClockBank {
        &self.clocks[ctx.iob_device()]
    }

    /// Settings of the fast or slow clock output of `asic`. Changes take effect with the
    /// next programming call.
    pub fn clock_output_mut(
        &mut self,
        ctx: DeviceContext,
        asic: usize,
        fast: bool,
    ) -> Result<&mut OutputSetting, Error> {
        self.clocks[ctx.iob_device()]
            .output_mut(asic, fast)
            .ok_or_else(|| Error::Configuration(format!("ASIC {} has no clock output", asic)))
    }

    fn set_lmk_signal(&self, ctx: DeviceContext, set: &str, name: &str, value: u32) -> Result<(), Error> {
        self.set_iob_signal(set, &DeviceSelector::One(ctx.iob_device()), name, value)
    }

    /// Hands `data` to the buffer selected by `select`. The valid bit clears itself, so
    /// nothing is read back.
    fn write_lmk_word(&mut self, ctx: DeviceContext, select: u32, data: u32) -> Result<(), Error> {
        log::trace!("LMK word {:#010x} to buffers {:#x} of {}", data, select, ctx);
        self.set_lmk_signal(ctx, names::iob::LMK_DATA, names::iob::LMK_DATA, data)?;
        self.set_lmk_signal(ctx, names::iob::LMK_CONTROL, names::iob::LMK_ENABLE, 1)?;
        self.set_lmk_signal(ctx, names::iob::LMK_CONTROL, names::iob::LMK_DEVICE_SELECT, select)?;
        self.set_lmk_signal(ctx, names::iob::LMK_CONTROL, names::iob::LMK_VALID, 1)?;
        self.write_iob_register(ctx, names::iob::LMK_DATA)?;
        self.write_iob_register(ctx, names::iob::LMK_CONTROL)
    }

    fn program_clock_output(&mut self, ctx: DeviceContext, setting: OutputSetting) -> Result<(), Error> {
        log::debug!(
            "{}: buffer {} output {} divider {} delay {} mux {} {}",
            ctx,
            setting.buffer,
            setting.output,
            setting.divider,
            setting.delay,
            setting.mux,
            if setting.enabled { "enabled" } else { "disabled" }
        );
        self.write_lmk_word(ctx, u32::from(setting.buffer), setting.word())
    }

    /// Writes `words` to `buffer`, counted from 1, or to all buffers for 0.
    pub fn program_clock_words(&mut self, ctx: DeviceContext, buffer: u8, words: &[u32]) -> Result<(), Error> {
        let select = buffer_select(buffer);
        self.set_lmk_signal(ctx, names::iob::LMK_CONTROL, names::iob::LMK_DEVICE_SELECT, select)?;
        if words.len() > RESET_THRESHOLD {
            // enable going from 0 to 1 resets the selected buffers
            self.set_lmk_signal(ctx, names::iob::LMK_CONTROL, names::iob::LMK_ENABLE, 0)?;
        }
        self.write_iob_register(ctx, names::iob::LMK_CONTROL)?;
        for word in words {
            self.write_lmk_word(ctx, select, *word)?;
        }
        Ok(())
    }

    /// Enables the outputs of every buffer of `ctx`, or powers them down.
    pub fn program_clock_global(&mut self, ctx: DeviceContext, disable: bool) -> Result<(), Error> {
        let global = if disable { GLOBAL_POWER_DOWN } else { GLOBAL_ENABLE };
        self.program_clock_words(ctx, 0, &[GLOBAL_CONFIG, global])
    }

    pub fn program_clock_bank(&mut self, ctx: DeviceContext, fast: bool) -> Result<(), Error> {
        let outputs = *self.clock_bank(ctx).outputs(fast);
        for setting in outputs {
            self.program_clock_output(ctx, setting)?;
        }
        self.program_clock_global(ctx, false)
    }

    /// Programs every fast output, then every slow output.
    pub fn program_clocks(&mut self, ctx: DeviceContext) -> Result<(), Error> {
        self.program_clock_bank(ctx, true)?;
        self.program_clock_bank(ctx, false)
    }

    pub fn enable_clocks(&mut self, ctx: DeviceContext) -> Result<(), Error> {
        self.clocks[ctx.iob_device()].set_all_enabled(true);
        self.program_clocks(ctx)
    }

    pub fn disable_clocks(&mut self, ctx: DeviceContext) -> Result<(), Error> {
        self.clocks[ctx.iob_device()].set_all_enabled(false);
        self.program_clocks(ctx)
    }

    /// Resets all buffers of `ctx` and loads the first eight outputs with the setting of
    /// the first fast output.
    pub fn program_clock_defaults(&mut self, ctx: DeviceContext) -> Result<(), Error> {
        let base = self.clock_bank(ctx).fast[0].word() & 0xffff_fff0;
        let mut words = (0..8).map(|output| base + output).collect::<Vec<_>>();
        words.extend([GLOBAL_CONFIG, GLOBAL_ENABLE]);
        self.program_clock_words(ctx, 0, &words)
    }

    /// Powers down one buffer, counted from 1.
    pub fn power_down_clock_buffer(&mut self, ctx: DeviceContext, buffer: u8) -> Result<(), Error> {
        self.program_clock_words(ctx, buffer, &[GLOBAL_POWER_DOWN])
    }

    /// Briefly disables the fast or slow clock of `asic`.
    pub fn pulse_clock_output(&mut self, ctx: DeviceContext, asic: usize, fast: bool) -> Result<(), Error> {
        log::debug!("Pulsing {} clock of {}", if fast { "fast" } else { "slow" }, ctx.with_asic(asic));
        let setting = self.clock_output_mut(ctx, asic, fast)?;
        setting.enabled = false;
        let disabled = *setting;
        self.program_clock_output(ctx, disabled)?;
        self.pause(self.config().timing.clock_toggle)?;
        let setting = self.clock_output_mut(ctx, asic, fast)?;
        setting.enabled = true;
        let enabled = *setting;
        self.program_clock_output(ctx, enabled)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use ppt_client::journal::Journal;

    use super::*;
    use crate::{
        Builder, Timing,
        memory::{MemoryModel, MemorySequencer, MemorySet},
        registers::Registers,
    };

    fn controller() -> Controller<Journal<Vec<u8>>> {
        let iob = MemoryModel::new()
            .with_set(
                MemorySet::new(names::iob::LMK_CONTROL, 0x100, 6, 4)
                    .signal(names::iob::LMK_ENABLE, 0, 1)
                    .signal(names::iob::LMK_VALID, 1, 1)
                    .signal(names::iob::LMK_DEVICE_SELECT, 2, 4),
            )
            .with_set(MemorySet::new(names::iob::LMK_DATA, 0x104, 32, 4).signal(names::iob::LMK_DATA, 0, 32));
        let registers = Registers::new(
            Box::new(MemoryModel::new()),
            Box::new(iob),
            Box::new(MemoryModel::new()),
            Box::new(MemoryModel::new()),
            Box::new(MemorySequencer::new(8)),
        );
        Builder::new()
            .timing(Timing::immediate())
            .build(Journal::new(Vec::new()), Arc::new(registers))
    }

    /// The values of all IOB writes in the journal, in order.
    fn written_values(controller: Controller<Journal<Vec<u8>>>) -> Vec<u32> {
        let text = String::from_utf8(controller.into_transport().into_inner()).unwrap();
        let words = text
            .lines()
            .map(|line| u32::from_str_radix(line, 16).unwrap())
            .collect::<Vec<_>>();
        words
            .chunks(10)
            .map(|record| {
                assert_eq!(record[1], 8);
                record[6..].iter().fold(0, |acc, byte| acc << 8 | byte)
            })
            .collect()
    }

    #[test]
    fn output_words() {
        let bank = ClockBank::default();
        assert_eq!(bank.fast[0].word(), 0x0001_0107);
        assert_eq!(bank.slow[7].word(), 0x0001_0100);
        assert_eq!(bank.fast[7].buffer, 8);
        assert_eq!(bank.slow[15].buffer, 4);

        let mut setting = bank.fast[7];
        setting.reset = true;
        setting.delay = 0x1f;
        setting.set_delayed(true);
        assert_eq!(setting.word(), 0x8005_01f0);

        let mut setting = bank.fast[0];
        setting.reset = true;
        setting.enabled = false;
        assert_eq!(setting.word(), 0x0000_0107);
        setting.set_default();
        assert_eq!(setting, bank.fast[0]);
    }

    #[test]
    fn buffer_selects() {
        assert_eq!(buffer_select(0), 0xf);
        assert_eq!(buffer_select(1), 1);
        assert_eq!(buffer_select(4), 8);
    }

    #[test]
    fn global_enable() {
        let mut controller = controller();
        let ctx = DeviceContext::new(2).unwrap();
        controller.program_clock_global(ctx, true).unwrap();
        // select all buffers, then two words of data and control
        assert_eq!(
            written_values(controller),
            [0x3c, GLOBAL_CONFIG, 0x3f, GLOBAL_POWER_DOWN, 0x3f]
        );
    }

    #[test]
    fn defaults_start_with_reset() {
        let mut controller = controller();
        let ctx = DeviceContext::new(1).unwrap();
        controller.program_clock_defaults(ctx).unwrap();
        let values = written_values(controller);
        assert_eq!(values.len(), 1 + 2 * 10);
        // enable stays low in the first control write
        assert_eq!(values[0], 0x3c);
        assert_eq!(values[1], 0x0001_0100);
        assert_eq!(values[15], 0x0001_0107);
        assert_eq!(values[19], GLOBAL_ENABLE);
    }

    #[test]
    fn pulse_restores_output() {
        let mut controller = controller();
        let ctx = DeviceContext::new(1).unwrap();
        controller.pulse_clock_output(ctx, 4, false).unwrap();
        assert!(controller.clock_bank(ctx).slow[4].enabled);
        let values = written_values(controller);
        // slow clock of ASIC 4 is output 3 of buffer 3
        assert_eq!(values, [0x0000_0103, 0x13, 0x0001_0103, 0x13]);
    }

    #[test]
    fn disabled_bank_is_remembered() {
        let mut controller = controller();
        let ctx = DeviceContext::new(3).unwrap();
        controller.disable_clocks(ctx).unwrap();
        assert!(controller.clock_bank(ctx).fast.iter().all(|setting| !setting.enabled));
        assert!(controller.clock_bank(DeviceContext::new(1).unwrap()).fast[0].enabled);
        assert!(controller.clock_output_mut(ctx, 16, true).is_err());
    }
}
