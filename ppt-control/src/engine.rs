//! The controller: register programming on top of a [Transport].
//!
//! Every register family is locked for the duration of one operation. Verification
//! results come back as a [Verdict]; an [Error] means the operation itself broke down and
//! the hardware state is unknown.
use std::{sync::Arc, thread, time::Duration};

use ppt_client::Transport;
use ppt_protocol::{Command, jtag::Bits};

use crate::{
    RegisterModel,
    bringup::BringupState,
    builder::{Transaction, TransactionBuilder},
    clock::ClockBank,
    config::{Config, OutputMode},
    context::DeviceContext,
    error::Error,
    names,
    readback::{self, Models, ReadbackBuffer, Verdict},
    registers::{DeviceSelector, Family, FamilyKind, Layout, MismatchReport, Registers, bits_word, word_bits},
    status::ErrorSink,
};

/// ASICs programmed one at a time on the chainless component.
const CHAINLESS_ASICS: [usize; 11] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 11];

/// How a pixel register reaches the chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PixelStrategy {
    /// One broadcast of the value of pixel 0. Only valid for uniform registers.
    AllAtOnce,
    /// The complete image shifted through the chain.
    InChain,
    /// The pixels of one ASIC, all other ASICs in bypass.
    SingleAsic(usize),
    /// A single pixel through the pixel selection registers, without readback.
    Direct(usize),
}

impl PixelStrategy {
    fn chain_load(self) -> bool {
        matches!(self, PixelStrategy::InChain | PixelStrategy::SingleAsic(_))
    }
}

fn layout_of(model: &dyn RegisterModel, family: FamilyKind, set: &str) -> Result<Layout, Error> {
    model
        .layout(set)
        .ok_or_else(|| Error::Configuration(format!("Unknown {} register {}", family, set)))
}

/// Brings `SC_EnChainLd` to `enable`, adding the global control register to the
/// transaction when its value changes. Models without the register are left alone.
fn update_chain_load(
    builder: &mut TransactionBuilder,
    jtag: &mut dyn RegisterModel,
    enable: bool,
) -> Result<(), Error> {
    let wanted = u32::from(enable);
    match jtag.signal(names::jtag::GLOBAL_CONTROL, 0, names::jtag::CHAIN_LOAD) {
        Some(value) if value == wanted => Ok(()),
        Some(_) => {
            log::debug!("Setting {} to {}", names::jtag::CHAIN_LOAD, wanted);
            jtag.set_signal(
                names::jtag::GLOBAL_CONTROL,
                &DeviceSelector::All,
                names::jtag::CHAIN_LOAD,
                wanted,
            );
            builder.register(jtag, names::jtag::GLOBAL_CONTROL, false)?;
            Ok(())
        }
        None => Ok(()),
    }
}

pub struct Controller<T: Transport> {
    transport: T,
    registers: Arc<Registers>,
    config: Config,
    sink: Option<ErrorSink>,
    pub(crate) state: BringupState,
    pub(crate) clocks: [ClockBank; 4],
}

impl<T: Transport> Controller<T> {
    pub fn new(transport: T, registers: Arc<Registers>, config: Config) -> Controller<T> {
        Controller {
            transport,
            registers,
            config,
            sink: None,
            state: BringupState::default(),
            clocks: Default::default(),
        }
    }

    /// Mirrors every reported failure into `sink`.
    pub fn with_sink(mut self, sink: ErrorSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registers(&self) -> &Arc<Registers> {
        &self.registers
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn state(&self) -> &BringupState {
        &self.state
    }

    pub(crate) fn is_simulated(&self) -> bool {
        self.transport.is_simulated()
    }

    /// Logs `message` as an error and appends it to the sink.
    pub(crate) fn report(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{}", message);
        if let Some(sink) = &self.sink {
            sink.push(message);
        }
    }

    pub(crate) fn reported<V>(&self, what: &str, result: Result<V, Error>) -> Result<V, Error> {
        result.inspect_err(|err| self.report(format!("{}: {}", what, err)))
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), Error> {
        if self.config.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn pause(&self, duration: Duration) -> Result<(), Error> {
        self.check_cancelled()?;
        if !duration.is_zero() {
            thread::sleep(duration);
        }
        self.check_cancelled()
    }

    /// Turns verification reports into a verdict, dumping every failed report.
    fn judge(&self, reports: Vec<MismatchReport>) -> Verdict {
        let verdict = Verdict::from_reports(reports);
        for report in verdict.reports() {
            self.report(report.to_string());
            if let Some(dir) = &self.config.dump_dir
                && let Err(err) = readback::write_dump(dir, report)
            {
                log::warn!("Could not dump {}: {}", report.module_set, err);
            }
        }
        verdict
    }

    fn update_signal(
        &self,
        family: &Family<dyn RegisterModel>,
        set: &str,
        devices: &DeviceSelector,
        name: &str,
        value: u32,
    ) -> Result<(), Error> {
        let mut model = family.lock()?;
        if !model.set_signal(set, devices, name, value) {
            return Err(Error::Configuration(format!(
                "{} register {} has no signal {}",
                family.kind(),
                set,
                name
            )));
        }
        Ok(())
    }

    pub fn set_epc_signal(&self, set: &str, name: &str, value: u32) -> Result<(), Error> {
        self.update_signal(&self.registers.epc, set, &DeviceSelector::All, name, value)
    }

    pub fn epc_signal(&self, set: &str, name: &str) -> Result<Option<u32>, Error> {
        Ok(self.registers.epc.lock()?.signal(set, 0, name))
    }

    /// Sets a signal of the IOB register `set` for the modules in `devices`.
    pub fn set_iob_signal(
        &self,
        set: &str,
        devices: &DeviceSelector,
        name: &str,
        value: u32,
    ) -> Result<(), Error> {
        self.update_signal(&self.registers.iob, set, devices, name, value)
    }

    pub fn iob_signal(&self, ctx: DeviceContext, set: &str, name: &str) -> Result<Option<u32>, Error> {
        Ok(self.registers.iob.lock()?.signal(set, ctx.iob_device(), name))
    }

    pub(crate) fn has_epc_register(&self, set: &str) -> Result<bool, Error> {
        Ok(self.registers.epc.lock()?.layout(set).is_some())
    }

    pub(crate) fn has_iob_register(&self, set: &str) -> Result<bool, Error> {
        Ok(self.registers.iob.lock()?.layout(set).is_some())
    }

    pub fn epc_read(&mut self, address: u32) -> Result<u32, Error> {
        Ok(self.transport.scalar(&Command::EpcRead { address })?)
    }

    pub fn epc_write(&mut self, address: u32, value: u32) -> Result<(), Error> {
        self.transport.exchange(&Command::EpcWrite { address, value })?;
        Ok(())
    }

    pub fn iob_read(&mut self, ctx: DeviceContext, address: u32) -> Result<u32, Error> {
        Ok(self.transport.scalar(&Command::IobRead {
            module: ctx.module(),
            address,
        })?)
    }

    pub fn iob_write(&mut self, ctx: DeviceContext, address: u32, value: u32) -> Result<(), Error> {
        self.transport.exchange(&Command::IobWrite {
            module: ctx.module(),
            address,
            value,
        })?;
        Ok(())
    }

    fn write_epc_set(&mut self, model: &dyn RegisterModel, set: &str) -> Result<(), Error> {
        let layout = layout_of(model, FamilyKind::Epc, set)?;
        if layout.read_only {
            log::debug!("EPC register {} is read only, not writing", set);
            return Ok(());
        }
        let image = model.content(set, &DeviceSelector::All);
        log::debug!("Writing EPC register {} ({} bits)", set, image.len());
        for word in image.chunks(32) {
            self.epc_write(layout.address, bits_word(word))?;
        }
        Ok(())
    }

    fn read_epc_set(
        &mut self,
        model: &mut dyn RegisterModel,
        set: &str,
        overwrite: bool,
    ) -> Result<Option<MismatchReport>, Error> {
        let layout = layout_of(model, FamilyKind::Epc, set)?;
        let words = layout.total_bits().div_ceil(32);
        let mut image = Bits::with_capacity(words * 32);
        for _ in 0..words {
            let value = self.epc_read(layout.address)?;
            image.extend_from_bitslice(&word_bits(value, 32));
        }
        if self.is_simulated() {
            return Ok(None);
        }
        image.truncate(layout.total_bits());
        let mismatches = model.compare(&image, set, &DeviceSelector::All, overwrite);
        Ok(Some(MismatchReport::new(FamilyKind::Epc, set, mismatches)))
    }

    fn epc_operation(
        &mut self,
        sets: Option<&[&str]>,
        write: bool,
        readback: bool,
        overwrite: bool,
    ) -> Result<Verdict, Error> {
        let registers = Arc::clone(&self.registers);
        let mut epc = registers.epc.lock()?;
        let sets = match sets {
            Some(sets) => sets.iter().map(|set| set.to_string()).collect(),
            None => epc.module_sets(),
        };
        let mut reports = Vec::new();
        let mut checked = false;
        for set in &sets {
            if write {
                self.write_epc_set(&**epc, set)?;
            }
            if readback && let Some(report) = self.read_epc_set(&mut **epc, set, overwrite)? {
                checked = true;
                reports.push(report);
            }
        }
        drop(epc);
        if !checked {
            return Ok(Verdict::Unchecked);
        }
        Ok(self.judge(reports))
    }

    /// Writes one EPC register, optionally reading it back.
    pub fn program_epc_register(&mut self, set: &str, readback: bool) -> Result<Verdict, Error> {
        let result = self.epc_operation(Some(&[set]), true, readback, false);
        self.reported(&format!("Programming EPC register {}", set), result)
    }

    pub fn program_all_epc(&mut self, readback: bool) -> Result<Verdict, Error> {
        let result = self.epc_operation(None, true, readback, false);
        self.reported("Programming EPC registers", result)
    }

    /// Reads one EPC register and compares it with the model.
    pub fn read_back_epc_register(&mut self, set: &str, overwrite: bool) -> Result<Verdict, Error> {
        let result = self.epc_operation(Some(&[set]), false, true, overwrite);
        self.reported(&format!("Reading EPC register {}", set), result)
    }

    pub fn read_back_all_epc(&mut self, overwrite: bool) -> Result<Verdict, Error> {
        let result = self.epc_operation(None, false, true, overwrite);
        self.reported("Reading EPC registers", result)
    }

    fn write_iob_set(
        &mut self,
        ctx: DeviceContext,
        model: &dyn RegisterModel,
        set: &str,
    ) -> Result<(), Error> {
        let layout = layout_of(model, FamilyKind::Iob, set)?;
        if layout.read_only {
            return Ok(());
        }
        let image = model.content(set, &DeviceSelector::One(ctx.iob_device()));
        log::debug!("Writing IOB register {} of {}", set, ctx);
        for word in image.chunks(32) {
            self.iob_write(ctx, layout.address, bits_word(word))?;
        }
        Ok(())
    }

    fn read_iob_set(
        &mut self,
        ctx: DeviceContext,
        model: &mut dyn RegisterModel,
        set: &str,
        overwrite: bool,
    ) -> Result<MismatchReport, Error> {
        let layout = layout_of(model, FamilyKind::Iob, set)?;
        let mut image = Bits::new();
        for _ in 0..layout.bits_per_device.div_ceil(32) {
            let value = self.iob_read(ctx, layout.address)?;
            image.extend_from_bitslice(&word_bits(value, 32));
        }
        image.truncate(layout.bits_per_device);
        let mismatches = model.compare(&image, set, &DeviceSelector::One(ctx.iob_device()), overwrite);
        Ok(MismatchReport::new(FamilyKind::Iob, set, mismatches))
    }

    fn iob_operation(
        &mut self,
        ctx: DeviceContext,
        sets: Option<&[&str]>,
        write: bool,
        overwrite: bool,
    ) -> Result<Verdict, Error> {
        let registers = Arc::clone(&self.registers);
        let mut iob = registers.iob.lock()?;
        let sets = match sets {
            Some(sets) => sets.iter().map(|set| set.to_string()).collect(),
            None => iob.module_sets(),
        };
        let simulated = self.is_simulated();
        let mut reports = Vec::new();
        for set in &sets {
            if write {
                self.write_iob_set(ctx, &**iob, set)?;
            }
            if !simulated {
                reports.push(self.read_iob_set(ctx, &mut **iob, set, overwrite)?);
            }
        }
        drop(iob);
        if simulated {
            return Ok(Verdict::Unchecked);
        }
        Ok(self.judge(reports))
    }

    /// Writes one IOB register of `ctx` and reads it back.
    pub fn program_iob_register(&mut self, ctx: DeviceContext, set: &str) -> Result<Verdict, Error> {
        let result = self.iob_operation(ctx, Some(&[set]), true, false);
        self.reported(&format!("Programming IOB register {} of {}", set, ctx), result)
    }

    pub fn program_all_iob(&mut self, ctx: DeviceContext) -> Result<Verdict, Error> {
        let result = self.iob_operation(ctx, None, true, false);
        self.reported(&format!("Programming IOB registers of {}", ctx), result)
    }

    pub fn read_back_iob_register(
        &mut self,
        ctx: DeviceContext,
        set: &str,
        overwrite: bool,
    ) -> Result<Verdict, Error> {
        let result = self.iob_operation(ctx, Some(&[set]), false, overwrite);
        self.reported(&format!("Reading IOB register {} of {}", set, ctx), result)
    }

    /// Reads an EPC register into the model without judging the writable bits. Used to
    /// poll status signals.
    pub(crate) fn refresh_epc(&mut self, set: &str) -> Result<(), Error> {
        let registers = Arc::clone(&self.registers);
        let mut epc = registers.epc.lock()?;
        self.read_epc_set(&mut **epc, set, false)?;
        Ok(())
    }

    pub(crate) fn refresh_iob(&mut self, ctx: DeviceContext, set: &str) -> Result<(), Error> {
        if self.is_simulated() {
            return Ok(());
        }
        let registers = Arc::clone(&self.registers);
        let mut iob = registers.iob.lock()?;
        self.read_iob_set(ctx, &mut **iob, set, false)?;
        Ok(())
    }

    /// Writes an IOB register without reading it back, for registers with self clearing
    /// bits.
    pub(crate) fn write_iob_register(&mut self, ctx: DeviceContext, set: &str) -> Result<(), Error> {
        let registers = Arc::clone(&self.registers);
        let iob = registers.iob.lock()?;
        self.write_iob_set(ctx, &**iob, set)
    }

    /// Sets `EnJTAG1` to `EnJTAG4` and programs the JTAG control register.
    pub fn enable_jtag_engines(&mut self, enable: bool) -> Result<(), Error> {
        log::debug!("{} JTAG engines", if enable { "Enabling" } else { "Disabling" });
        for module in 1..=4 {
            self.set_epc_signal(
                names::epc::JTAG_CONTROL,
                &names::epc::jtag_enable(module),
                u32::from(enable),
            )?;
        }
        self.program_epc_register(names::epc::JTAG_CONTROL, false)?;
        Ok(())
    }

    fn ensure_jtag_enabled(&mut self, ctx: DeviceContext) -> Result<(), Error> {
        let enabled = self.epc_signal(
            names::epc::JTAG_CONTROL,
            &names::epc::jtag_enable(ctx.module()),
        )?;
        if enabled == Some(0) {
            log::info!("JTAG engine of {} is disabled, enabling all engines", ctx);
            self.enable_jtag_engines(true)?;
            self.pause(self.config.timing.jtag_enable_settle)?;
        }
        Ok(())
    }

    /// Blocks until the JTAG engine of `ctx` has shifted out everything it was given.
    pub fn wait_jtag_idle(&mut self, ctx: DeviceContext) -> Result<(), Error> {
        self.transport.exchange(&Command::WaitJtag {
            module: ctx.module(),
        })?;
        if self.is_simulated() || !self.has_epc_register(names::epc::JTAG_READBACK)? {
            return Ok(());
        }
        self.refresh_epc(names::epc::JTAG_READBACK)?;
        let empty = self.epc_signal(
            names::epc::JTAG_READBACK,
            &names::epc::jtag_fifo_empty(ctx.module()),
        )?;
        if empty == Some(0) {
            self.report(format!("JTAG engine of {} still holds data", ctx));
            return Err(Error::Engine {
                module: ctx.module(),
            });
        }
        Ok(())
    }

    /// Returns the JTAG controllers of every ASIC of `ctx` to their reset state.
    pub fn reset_jtag_controller(&mut self, ctx: DeviceContext) -> Result<(), Error> {
        self.transport.exchange(&Command::ResetJtag {
            module: ctx.module(),
        })?;
        Ok(())
    }

    /// Hands `transaction` to the JTAG engine of `ctx` in the configured output mode.
    fn transmit(&mut self, ctx: DeviceContext, transaction: &Transaction) -> Result<(), Error> {
        if transaction.is_empty() {
            return Ok(());
        }
        self.check_cancelled()?;
        let engine = ctx.jtag_engine();
        log::debug!(
            "Sending {} JTAG frames to {}",
            transaction.frames().count(),
            ctx
        );
        match self.config.output_mode {
            OutputMode::Direct => {
                for payload in transaction.direct_payloads(engine) {
                    log::trace!("Direct write {}", payload);
                    self.transport
                        .checked(&Command::DirectWriteLength(payload.len()))?;
                    self.pause(self.config.timing.direct_write_gap)?;
                    self.transport.checked(&Command::DirectWrite(payload))?;
                }
            }
            OutputMode::File => {
                let file = transaction.command_file(engine);
                log::trace!("Command file of {} lines", file.lines().count());
                self.transport.upload(names::COMMAND_FILE, file.as_bytes())?;
                if !self.is_simulated() {
                    self.transport.checked(&Command::StartJtagProgramming)?;
                }
            }
        }
        Ok(())
    }

    /// Fetches the readback data of `transaction`. Returns `None` in simulation, where
    /// only the expected amount is journaled.
    fn load_readback(
        &mut self,
        ctx: DeviceContext,
        transaction: &Transaction,
    ) -> Result<Option<ReadbackBuffer>, Error> {
        if self.is_simulated() {
            for frame in transaction.readback_frames() {
                self.transport
                    .record_readback(ctx.jtag_engine(), frame.frame().data().len().div_ceil(8))?;
            }
            return Ok(None);
        }
        let data = self.transport.download(names::READBACK_FILE)?;
        self.transport.exchange(&Command::Exec(format!(
            "mv /tmp/{0} /tmp/{0}_read",
            names::READBACK_FILE
        )))?;
        let text = String::from_utf8_lossy(&data);
        log::trace!("Readback data: {}", text.replace('\n', " "));
        let buffer = ReadbackBuffer::parse(&text)?;
        log::debug!(
            "Fetched {} readback bytes, expected {}",
            buffer.remaining_bytes(),
            transaction.readback_bytes()
        );
        Ok(Some(buffer))
    }

    /// Sends `transaction`, then verifies its readback data or waits for the engine.
    fn execute(
        &mut self,
        ctx: DeviceContext,
        transaction: &Transaction,
        models: &mut Models,
        overwrite: bool,
    ) -> Result<Verdict, Error> {
        self.ensure_jtag_enabled(ctx)?;
        self.transmit(ctx, transaction)?;
        if !transaction.has_readback() {
            self.wait_jtag_idle(ctx)?;
            return Ok(Verdict::Unchecked);
        }
        let Some(mut buffer) = self.load_readback(ctx, transaction)? else {
            return Ok(Verdict::Unchecked);
        };
        let reports = readback::verify(transaction, &mut buffer, models, overwrite)?;
        Ok(self.judge(reports))
    }

    fn jtag_operation(
        &mut self,
        ctx: DeviceContext,
        set: Option<&str>,
        write: bool,
        readback: bool,
        overwrite: bool,
    ) -> Result<Verdict, Error> {
        let registers = Arc::clone(&self.registers);
        let mut jtag = registers.jtag.lock()?;
        let mut builder = TransactionBuilder::new(self.config.topology);
        for pass in [false, true] {
            if (pass && !readback) || (!pass && !write) {
                continue;
            }
            match set {
                Some(set) => builder.register(&**jtag, set, pass)?,
                None => builder.all_registers(&**jtag, pass)?,
            };
        }
        let transaction = builder.finish();
        let mut models = Models {
            jtag: Some(&mut **jtag),
            ..Models::default()
        };
        self.execute(ctx, &transaction, &mut models, overwrite)
    }

    /// Writes every JTAG register to every ASIC of `ctx`.
    pub fn program_jtag(&mut self, ctx: DeviceContext, readback: bool) -> Result<Verdict, Error> {
        let result = self.jtag_operation(ctx, None, true, readback, false);
        self.reported(&format!("Programming JTAG registers of {}", ctx), result)
    }

    pub fn program_jtag_register(
        &mut self,
        ctx: DeviceContext,
        set: &str,
        readback: bool,
    ) -> Result<Verdict, Error> {
        let result = self.jtag_operation(ctx, Some(set), true, readback, false);
        self.reported(&format!("Programming JTAG register {} of {}", set, ctx), result)
    }

    pub fn read_back_jtag(&mut self, ctx: DeviceContext, overwrite: bool) -> Result<Verdict, Error> {
        let result = self.jtag_operation(ctx, None, false, true, overwrite);
        self.reported(&format!("Reading JTAG registers of {}", ctx), result)
    }

    pub fn read_back_jtag_register(
        &mut self,
        ctx: DeviceContext,
        set: &str,
        overwrite: bool,
    ) -> Result<Verdict, Error> {
        let result = self.jtag_operation(ctx, Some(set), false, true, overwrite);
        self.reported(&format!("Reading JTAG register {} of {}", set, ctx), result)
    }

    /// Programs the pixel register `set` of `ctx` the way `strategy` says.
    pub fn program_pixel_register(
        &mut self,
        ctx: DeviceContext,
        set: &str,
        strategy: PixelStrategy,
        readback: bool,
    ) -> Result<Verdict, Error> {
        let result = self.pixel_operation(ctx, set, strategy, readback);
        self.reported(&format!("Programming pixel register {} of {}", set, ctx), result)
    }

    fn pixel_operation(
        &mut self,
        ctx: DeviceContext,
        set: &str,
        strategy: PixelStrategy,
        readback: bool,
    ) -> Result<Verdict, Error> {
        if readback && matches!(strategy, PixelStrategy::Direct(_)) {
            return Err(Error::Configuration(
                "Pixels written through the selection registers cannot be read back".to_string(),
            ));
        }
        let registers = Arc::clone(&self.registers);
        let mut jtag = registers.jtag.lock()?;
        let mut pixel = registers.pixel.lock()?;

        let mut builder = TransactionBuilder::new(self.config.topology);
        update_chain_load(&mut builder, &mut **jtag, strategy.chain_load())?;
        drop(jtag);
        match strategy {
            PixelStrategy::AllAtOnce => builder.pixels_uniform(&**pixel, set, readback)?,
            PixelStrategy::InChain => builder.pixels_chain(&**pixel, set, readback)?,
            PixelStrategy::SingleAsic(asic) => {
                builder.pixels_single(&**pixel, set, asic, readback)?
            }
            PixelStrategy::Direct(index) => builder.pixel_direct(&**pixel, set, index)?,
        };
        let transaction = builder.finish();
        log::debug!("Programming pixel register {} of {} {:?}", set, ctx, strategy);

        let mut models = Models {
            pixel: Some(&mut **pixel),
            ..Models::default()
        };
        let verdict = self.execute(ctx, &transaction, &mut models, false)?;
        if !transaction.has_readback()
            || matches!(strategy, PixelStrategy::AllAtOnce | PixelStrategy::Direct(_))
        {
            self.pause(self.config.timing.pixel_settle)?;
        }
        Ok(verdict)
    }

    fn pixel_sets(&self) -> Result<Vec<String>, Error> {
        Ok(self.registers.pixel.lock()?.module_sets())
    }

    fn for_pixel_sets(
        &mut self,
        ctx: DeviceContext,
        mut operation: impl FnMut(&mut Self, &str) -> Result<Verdict, Error>,
    ) -> Result<Verdict, Error> {
        let mut verdict = Verdict::Unchecked;
        for set in self.pixel_sets()? {
            log::debug!("Pixel register {} of {}", set, ctx);
            verdict = verdict.merge(operation(self, &set)?);
        }
        Ok(verdict)
    }

    /// Programs every pixel register of `ctx`, broadcasting registers that hold the same
    /// value in every pixel.
    pub fn program_pixels(&mut self, ctx: DeviceContext, readback: bool) -> Result<Verdict, Error> {
        if self.config.component_id.as_deref() == Some(names::CHAINLESS_COMPONENT) {
            return self.program_pixels_chainless(ctx);
        }
        self.for_pixel_sets(ctx, |controller, set| {
            let uniform = controller.registers.pixel.lock()?.is_uniform(set);
            let strategy = if uniform {
                PixelStrategy::AllAtOnce
            } else {
                PixelStrategy::InChain
            };
            controller.program_pixel_register(ctx, set, strategy, readback)
        })
    }

    pub fn program_pixels_all_at_once(
        &mut self,
        ctx: DeviceContext,
        readback: bool,
    ) -> Result<Verdict, Error> {
        self.for_pixel_sets(ctx, |controller, set| {
            controller.program_pixel_register(ctx, set, PixelStrategy::AllAtOnce, readback)
        })
    }

    pub fn program_pixels_in_chain(
        &mut self,
        ctx: DeviceContext,
        readback: bool,
    ) -> Result<Verdict, Error> {
        self.for_pixel_sets(ctx, |controller, set| {
            controller.program_pixel_register(ctx, set, PixelStrategy::InChain, readback)
        })
    }

    pub fn program_pixels_single_asic(
        &mut self,
        ctx: DeviceContext,
        asic: usize,
        readback: bool,
    ) -> Result<Verdict, Error> {
        self.for_pixel_sets(ctx, |controller, set| {
            controller.program_pixel_register(ctx, set, PixelStrategy::SingleAsic(asic), readback)
        })
    }

    /// Programs one pixel, counted in chain order as in the pixel model. Writes through
    /// the selection registers are never read back.
    pub fn program_pixel_directly(
        &mut self,
        ctx: DeviceContext,
        pixel: usize,
    ) -> Result<Verdict, Error> {
        self.for_pixel_sets(ctx, |controller, set| {
            controller.program_pixel_register(ctx, set, PixelStrategy::Direct(pixel), false)
        })
    }

    /// The chainless component loses its readback in chain mode, so its pixels go in
    /// chain first and then once more per ASIC.
    fn program_pixels_chainless(&mut self, ctx: DeviceContext) -> Result<Verdict, Error> {
        log::info!("Programming pixels of {} one ASIC at a time", ctx);
        self.program_pixels_in_chain(ctx, false)?;
        let asics = CHAINLESS_ASICS
            .into_iter()
            .filter(|asic| self.config.topology.chain_position(*asic).is_ok())
            .collect::<Vec<_>>();
        for asic in asics {
            self.program_pixels_single_asic(ctx, asic, false)?;
        }
        Ok(Verdict::Unchecked)
    }

    fn sequencer_operation(
        &mut self,
        ctx: DeviceContext,
        write: bool,
        readback: bool,
        master_fsm: bool,
    ) -> Result<Verdict, Error> {
        let registers = Arc::clone(&self.registers);
        let mut sequencer = registers.sequencer.lock()?;
        sequencer
            .compile()
            .map_err(|reason| Error::Configuration(format!("Sequencer: {}", reason)))?;

        let mut builder = TransactionBuilder::new(self.config.topology);
        if write {
            builder.sequencer(&**sequencer, false)?;
        }
        if readback {
            builder.sequencer(&**sequencer, true)?;
        }
        if master_fsm {
            let jtag = registers.jtag.lock()?;
            if jtag.layout(names::jtag::MASTER_FSM).is_some() {
                builder.register(&**jtag, names::jtag::MASTER_FSM, false)?;
            }
        }
        let transaction = builder.finish();
        let mut models = Models {
            sequencer: Some(&mut **sequencer),
            ..Models::default()
        };
        self.execute(ctx, &transaction, &mut models, false)
    }

    /// Recompiles the sequencer and writes it to every ASIC of `ctx`. With `master_fsm`,
    /// the master FSM register follows, so that its counters match the new cycle.
    pub fn program_sequencer(
        &mut self,
        ctx: DeviceContext,
        readback: bool,
        master_fsm: bool,
    ) -> Result<Verdict, Error> {
        let result = self.sequencer_operation(ctx, true, readback, master_fsm);
        self.reported(&format!("Programming sequencer of {}", ctx), result)
    }

    pub fn read_back_sequencer(&mut self, ctx: DeviceContext) -> Result<Verdict, Error> {
        let result = self.sequencer_operation(ctx, false, true, false);
        self.reported(&format!("Reading sequencer of {}", ctx), result)
    }

    /// JTAG registers, then pixels, then the sequencer.
    pub fn program_asic_config(
        &mut self,
        ctx: DeviceContext,
        readback: bool,
    ) -> Result<Verdict, Error> {
        let verdict = self
            .program_jtag(ctx, readback)?
            .merge(self.program_pixels(ctx, readback)?)
            .merge(self.program_sequencer(ctx, readback, true)?);
        Ok(verdict)
    }

    /// [Controller::program_asic_config] for every active module. A failing module does
    /// not stop the others; the first error is returned at the end.
    pub fn program_full_asic_config(&mut self, readback: bool) -> Result<Verdict, Error> {
        let mut verdict = Verdict::Unchecked;
        let mut first_error = None;
        for ctx in self.active_modules()? {
            match self.program_asic_config(ctx, readback) {
                Ok(result) => verdict = verdict.merge(result),
                Err(err) if err.is_fatal() || matches!(err, Error::Cancelled) => return Err(err),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(verdict),
        }
    }

    fn fast_init_transaction(&self) -> Result<Transaction, Error> {
        let registers = Arc::clone(&self.registers);
        let mut jtag = registers.jtag.lock()?;
        let pixel = registers.pixel.lock()?;
        let mut builder = TransactionBuilder::new(self.config.topology);

        builder.jtag_reset();
        jtag.set_signal(
            names::jtag::GLOBAL_CONTROL,
            &DeviceSelector::All,
            names::jtag::CHAIN_LOAD,
            0,
        );
        for set in [names::jtag::SRAM_CONTROL, names::jtag::GLOBAL_CONTROL] {
            if jtag.layout(set).is_some() {
                builder.register(&**jtag, set, false)?;
            }
        }
        if pixel.layout(names::pixel::CONTROL).is_some() {
            builder.pixels_uniform(&**pixel, names::pixel::CONTROL, false)?;
        }
        for set in [names::jtag::GLOBAL_FCSR_0, names::jtag::GLOBAL_FCSR_1] {
            if jtag.layout(set).is_some() {
                builder.register(&**jtag, set, false)?;
            }
        }
        Ok(builder.finish())
    }

    fn power_off_on_failure(&mut self, ctx: DeviceContext, failed: bool) -> Result<(), Error> {
        if !self.has_iob_register(names::iob::PRB_CONTROL)? {
            return Ok(());
        }
        let devices = DeviceSelector::One(ctx.iob_device());
        self.set_iob_signal(
            names::iob::PRB_CONTROL,
            &devices,
            names::iob::PRB_POWER_OFF,
            u32::from(failed),
        )?;
        if failed {
            self.program_iob_register(ctx, names::iob::PRB_CONTROL)?;
        } else {
            self.read_back_iob_register(ctx, names::iob::PRB_CONTROL, false)?;
        }
        Ok(())
    }

    /// Loads the chain of `ctx` through the fast init sequencer of the PPT. A failed
    /// sequence powers the module off.
    pub fn fast_init(&mut self, ctx: DeviceContext) -> Result<(), Error> {
        log::info!("Fast init of {}", ctx);
        self.enable_jtag_engines(false)?;
        let transaction = self.fast_init_transaction()?;
        let sent = self.transmit(ctx, &transaction);
        self.reported(&format!("Sending fast init data to {}", ctx), sent)?;

        let result = self.transport.checked(&Command::FastInit {
            module: ctx.module(),
            init_distance: self.config.init_distance,
        });
        match result {
            Ok(()) => self.power_off_on_failure(ctx, false),
            Err(err) => {
                self.report(format!("Fast init of {} failed, powering off: {}", ctx, err));
                self.power_off_on_failure(ctx, true)?;
                Err(err.into())
            }
        }
    }

    pub fn serial_number(&mut self) -> Result<u64, Error> {
        Ok(self.transport.wide(&Command::SerialNumber)?)
    }

    pub fn system_status(&mut self) -> Result<u8, Error> {
        Ok((self.transport.scalar(&Command::SystemStatus)? & 0xff) as u8)
    }

    /// Temperature of the PPT FPGA in the raw units of the PPT.
    pub fn temperature(&mut self) -> Result<u32, Error> {
        Ok(self.transport.scalar(&Command::Temperature)?)
    }

    /// Reads the receive register of the safety interlock board.
    pub fn sib_receive(&mut self) -> Result<Vec<u32>, Error> {
        let values = self.transport.vector(&Command::SibReceive)?;
        match values.last() {
            Some(last) if last & 0x4700_ff00 != 0x4700_ff00 => {
                self.report("Safety interlock register could not be read")
            }
            Some(last) if last & 0x0f == 0x0f => {
                self.report("Safety interlock timed out during the last burst")
            }
            _ => {}
        }
        Ok(values)
    }

    pub fn start_burst(&mut self) -> Result<(), Error> {
        self.transport.exchange(&Command::StartBurst)?;
        Ok(())
    }

    pub fn start_readout(&mut self) -> Result<(), Error> {
        self.transport.exchange(&Command::StartReadout)?;
        Ok(())
    }

    pub fn start_test_pattern(&mut self) -> Result<(), Error> {
        self.transport.exchange(&Command::TestPattern)?;
        Ok(())
    }

    pub fn start_single_cycle(&mut self) -> Result<(), Error> {
        self.transport.exchange(&Command::SingleCycle)?;
        Ok(())
    }

    /// Runs `command` in a shell on the PPT and returns its status.
    pub fn exec(&mut self, command: &str) -> Result<u32, Error> {
        Ok(self.transport.scalar(&Command::Exec(command.to_string()))?)
    }

    pub fn upload_file(&mut self, name: &str, contents: &[u8]) -> Result<(), Error> {
        let result = self.transport.upload(name, contents).map_err(Error::from);
        self.reported(&format!("Uploading {}", name), result)
    }

    pub fn download_file(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let result = self.transport.download(name).map_err(Error::from);
        self.reported(&format!("Downloading {}", name), result)
    }

    fn upload_and_run(&mut self, name: &str, contents: &[u8], command: Command) -> Result<(), Error> {
        self.upload_file(name, contents)?;
        let result = self.transport.checked(&command).map_err(Error::from);
        self.reported(&format!("{} after uploading {}", command.code(), name), result)
    }

    /// Uploads a bitfile and has the PPT program it into the IOB FPGAs.
    pub fn upload_iob_firmware(&mut self, name: &str, contents: &[u8]) -> Result<(), Error> {
        self.upload_and_run(name, contents, Command::UpdateIobFirmware)
    }

    pub fn flash_firmware(&mut self, name: &str, contents: &[u8]) -> Result<(), Error> {
        self.upload_and_run(name, contents, Command::FlashFirmware)
    }

    pub fn flash_linux(&mut self, name: &str, contents: &[u8]) -> Result<(), Error> {
        self.upload_and_run(name, contents, Command::FlashLinux)
    }

    /// Installs previously uploaded PPT programs.
    pub fn update_software(&mut self) -> Result<(), Error> {
        let result = self.transport.checked(&Command::UpdateSoftware).map_err(Error::from);
        self.reported("Updating software", result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Builder, SequencerModel, Timing, Topology,
        memory::{MemoryModel, MemorySequencer, MemorySet},
    };
    use ppt_client::journal::Journal;

    fn registers(chain_len: usize) -> Arc<Registers> {
        let epc = MemoryModel::new()
            .with_set(
                MemorySet::new(names::epc::JTAG_CONTROL, 104, 4, 1)
                    .signal("EnJTAG1", 0, 1)
                    .signal("EnJTAG2", 1, 1)
                    .signal("EnJTAG3", 2, 1)
                    .signal("EnJTAG4", 3, 1),
            )
            .with_set(MemorySet::new("Wide", 40, 70, 1));
        let iob = MemoryModel::new().with_set(
            MemorySet::new(names::iob::PRB_CONTROL, 0x600, 4, 4).signal(names::iob::PRB_POWER_OFF, 1, 1),
        );
        let jtag = MemoryModel::new()
            .with_set(MemorySet::new(names::jtag::GLOBAL_CONTROL, 1, 40, chain_len).signal(
                names::jtag::CHAIN_LOAD,
                3,
                1,
            ))
            .with_set(MemorySet::new(names::jtag::SRAM_CONTROL, 2, 10, chain_len));
        let pixel = MemoryModel::new().with_set(MemorySet::new(
            names::pixel::CONTROL,
            0,
            8,
            chain_len * 4096,
        ));
        Arc::new(Registers::new(
            Box::new(epc),
            Box::new(iob),
            Box::new(jtag),
            Box::new(pixel),
            Box::new(MemorySequencer::new(16).with_track(1, vec![0..4])),
        ))
    }

    fn controller(chain_len: usize, mode: OutputMode) -> Controller<Journal<Vec<u8>>> {
        Builder::new()
            .topology(Topology {
                chain_len,
                ..Topology::default()
            })
            .output_mode(mode)
            .timing(Timing::immediate())
            .build(Journal::new(Vec::new()), registers(chain_len))
    }

    fn journal(controller: Controller<Journal<Vec<u8>>>) -> Vec<String> {
        String::from_utf8(controller.into_transport().into_inner())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn epc_words_are_split() {
        let mut controller = controller(1, OutputMode::File);
        assert_eq!(
            controller.program_epc_register("Wide", true).unwrap(),
            Verdict::Unchecked
        );
        let lines = journal(controller);
        // three writes, then three reads
        assert_eq!(lines.len(), 3 * 3 + 3 * 2);
        assert_eq!(lines[..3], ["28", "1", "0"]);
        assert_eq!(lines[9..11], ["1000028", "1"]);
    }

    #[test]
    fn jtag_engines_are_enabled_first() {
        let mut controller = controller(1, OutputMode::Direct);
        let ctx = DeviceContext::new(1).unwrap();
        controller.program_jtag(ctx, false).unwrap();
        assert_eq!(
            controller
                .epc_signal(names::epc::JTAG_CONTROL, "EnJTAG3")
                .unwrap(),
            Some(1)
        );
        let lines = journal(controller);
        assert_eq!(lines[..3], ["68", "1", "f"]);
        // both registers in one direct write each, then the idle wait
        assert_eq!(lines[3], "34");
        assert_eq!(lines.last().unwrap(), "1");
    }

    #[test]
    fn readback_is_journaled_in_simulation() {
        let mut controller = controller(2, OutputMode::File);
        let ctx = DeviceContext::new(2).unwrap();
        controller.enable_jtag_engines(true).unwrap();
        let verdict = controller
            .program_jtag_register(ctx, names::jtag::GLOBAL_CONTROL, true)
            .unwrap();
        assert_eq!(verdict, Verdict::Unchecked);
        let lines = journal(controller);
        assert_eq!(lines[lines.len() - 2..], ["1000038", "a"]);
    }

    #[test]
    fn chain_load_follows_strategy() {
        let mut controller = controller(1, OutputMode::File);
        let ctx = DeviceContext::new(1).unwrap();
        controller.program_pixels_in_chain(ctx, false).unwrap();
        let chain_load = |controller: &Controller<_>| {
            controller
                .registers()
                .jtag
                .lock()
                .unwrap()
                .signal(names::jtag::GLOBAL_CONTROL, 0, names::jtag::CHAIN_LOAD)
        };
        assert_eq!(chain_load(&controller), Some(1));
        controller.program_pixel_directly(ctx, 37).unwrap();
        assert_eq!(chain_load(&controller), Some(0));
    }

    #[test]
    fn fast_init_sequence() {
        let mut controller = controller(1, OutputMode::File);
        let ctx = DeviceContext::new(1).unwrap();
        controller.fast_init(ctx).unwrap();
        let lines = journal(controller);
        // JTAG engines off, then the command file with the reset sequence
        assert_eq!(lines[..3], ["68", "1", "0"]);
        assert_eq!(lines[3], "34");
        assert!(lines[5..21].iter().all(|line| line == "ff"));
    }

    #[test]
    fn fast_init_sets_power_on() {
        let mut controller = controller(1, OutputMode::Direct);
        let ctx = DeviceContext::new(3).unwrap();
        controller
            .set_iob_signal(
                names::iob::PRB_CONTROL,
                &DeviceSelector::All,
                names::iob::PRB_POWER_OFF,
                1,
            )
            .unwrap();
        controller.fast_init(ctx).unwrap();
        assert_eq!(
            controller
                .iob_signal(ctx, names::iob::PRB_CONTROL, names::iob::PRB_POWER_OFF)
                .unwrap(),
            Some(0)
        );
        assert_eq!(
            controller
                .iob_signal(DeviceContext::new(1).unwrap(), names::iob::PRB_CONTROL, names::iob::PRB_POWER_OFF)
                .unwrap(),
            Some(1)
        );
    }

    #[test]
    fn sequencer_errors_are_fatal() {
        let registers = Arc::new(Registers::new(
            Box::new(MemoryModel::new()),
            Box::new(MemoryModel::new()),
            Box::new(MemoryModel::new()),
            Box::new(MemoryModel::new()),
            Box::new(MemorySequencer::new(0)),
        ));
        let sink = ErrorSink::new();
        let mut controller = Builder::new()
            .timing(Timing::immediate())
            .build(Journal::new(Vec::new()), registers)
            .with_sink(sink.clone());
        let ctx = DeviceContext::new(1).unwrap();
        assert!(controller.program_sequencer(ctx, false, true).unwrap_err().is_fatal());
        assert_eq!(sink.drain().len(), 1);
    }

    #[test]
    fn sequencer_is_compiled_before_sending() {
        let mut controller = controller(1, OutputMode::File);
        let ctx = DeviceContext::new(1).unwrap();
        controller.program_sequencer(ctx, false, false).unwrap();
        let tracks = controller.registers().sequencer.lock().unwrap().tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].bits.count_ones(), 4);
    }

    #[test]
    fn busy_family_is_reported() {
        let mut controller = controller(1, OutputMode::File);
        let ctx = DeviceContext::new(1).unwrap();
        let registers = Arc::clone(controller.registers());
        let _pixel = registers.pixel.lock().unwrap();
        assert!(matches!(
            controller.program_pixels(ctx, false),
            Err(Error::Busy(FamilyKind::Pixel))
        ));
    }

    #[test]
    fn cancelled_pause() {
        let controller = controller(1, OutputMode::File);
        controller.config().cancellation.cancel();
        assert!(matches!(
            controller.pause(Duration::ZERO),
            Err(Error::Cancelled)
        ));
    }
}
