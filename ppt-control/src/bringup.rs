//! Bring-up: resets, module discovery, link training and ASIC initialisation.
//!
//! Bring-up never stops at a failing module. Every stage reports what went wrong and the
//! outcome of all modules is collected in a [BringupReport]. Only configuration errors
//! and cancellation end it early.
use std::fmt::{Display, Formatter};

use ppt_client::Transport;
use ppt_protocol::Command;

use crate::{
    context::{DeviceContext, MODULE_COUNT},
    engine::Controller,
    error::Error,
    names,
    registers::{DeviceSelector, Family},
    RegisterModel,
};

/// IOB register holding the board type.
pub const BOARD_TYPE_ADDRESS: u32 = 16;
/// `IOB` in ASCII, followed by the board revision.
pub const BOARD_TYPE_MAGIC: u32 = 0x494f_4200;

/// ASIC sending on each data channel.
pub const CHANNEL_ASICS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 15, 14, 13, 12, 11, 10, 9, 8];

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ModuleState {
    pub discovered: bool,
    pub link_trained: bool,
    pub asic_reset_released: bool,
}

/// What bring-up knows about the modules of one PPT.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BringupState {
    active: Option<Vec<u8>>,
    modules: [ModuleState; MODULE_COUNT as usize],
}

impl BringupState {
    /// Modules found by the last discovery, if it is still valid.
    pub fn active_modules(&self) -> Option<&[u8]> {
        self.active.as_deref()
    }

    pub fn module(&self, ctx: DeviceContext) -> &ModuleState {
        &self.modules[ctx.iob_device()]
    }

    fn module_mut(&mut self, ctx: DeviceContext) -> &mut ModuleState {
        &mut self.modules[ctx.iob_device()]
    }

    /// Forgets the discovered modules and everything learned about them.
    pub fn invalidate(&mut self) {
        self.active = None;
        self.modules = Default::default();
    }
}

/// A bring-up stage that can fail for a single module.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    Discovery,
    Link,
    IobRegisters,
    FastInit,
    AsicConfig,
    Clocks,
    AsicPll,
    AsicReset,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Discovery => "not found",
            Stage::Link => "link not up",
            Stage::IobRegisters => "IOB registers not programmed",
            Stage::FastInit => "fast init failed",
            Stage::AsicConfig => "ASIC configuration failed",
            Stage::Clocks => "clocks not programmed",
            Stage::AsicPll => "ASIC PLL not locked",
            Stage::AsicReset => "not all ASICs send data",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleReport {
    pub module: u8,
    pub failures: Vec<Stage>,
}

impl ModuleReport {
    pub fn failed(&self) -> bool {
        !self.failures.is_empty()
    }
}

impl Display for ModuleReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Module {}: ", self.module)?;
        if !self.failed() {
            return write!(f, "ready");
        }
        let failures = self
            .failures
            .iter()
            .map(Stage::to_string)
            .collect::<Vec<_>>();
        write!(f, "{}", failures.join(", "))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BringupReport {
    pub pll_locked: bool,
    pub modules: Vec<ModuleReport>,
}

impl BringupReport {
    pub fn failed(&self) -> bool {
        !self.pll_locked || self.modules.iter().any(ModuleReport::failed)
    }
}

impl Display for BringupReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if !self.pll_locked {
            return write!(f, "PPT PLL not locked");
        }
        if self.modules.is_empty() {
            return write!(f, "No modules found");
        }
        for (index, module) in self.modules.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", module)?;
        }
        Ok(())
    }
}

fn fail(failures: &mut Vec<Stage>, stage: Stage) {
    if !failures.contains(&stage) {
        failures.push(stage);
    }
}

impl<T: Transport> Controller<T> {
    /// Sets a signal in the model without programming it. Signals the model lacks are
    /// skipped.
    fn shadow(
        &self,
        family: &Family<dyn RegisterModel>,
        set: &str,
        devices: &DeviceSelector,
        name: &str,
        value: bool,
    ) -> Result<(), Error> {
        if !family.lock()?.set_signal(set, devices, name, u32::from(value)) {
            log::debug!("{} register {} has no signal {}", family.kind(), set, name);
        }
        Ok(())
    }

    fn shadow_epc(&self, set: &str, name: &str, value: bool) -> Result<(), Error> {
        self.shadow(&self.registers().epc, set, &DeviceSelector::All, name, value)
    }

    fn shadow_iob(&self, set: &str, devices: &DeviceSelector, name: &str, value: bool) -> Result<(), Error> {
        self.shadow(&self.registers().iob, set, devices, name, value)
    }

    fn program_epc_if_present(&mut self, set: &str, readback: bool) -> Result<(), Error> {
        if self.has_epc_register(set)? {
            self.program_epc_register(set, readback)?;
        }
        Ok(())
    }

    fn program_iob_if_present(&mut self, ctx: DeviceContext, set: &str) -> Result<(), Error> {
        if self.has_iob_register(set)? {
            self.program_iob_register(ctx, set)?;
        }
        Ok(())
    }

    /// Turns a failed stage into `false`. Configuration errors and cancellation still
    /// end bring-up.
    fn tolerate<V>(&self, result: Result<V, Error>) -> Result<Option<V>, Error> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_fatal() || matches!(err, Error::Cancelled) => Err(err),
            Err(err) => {
                log::warn!("Continuing after: {}", err);
                Ok(None)
            }
        }
    }

    /// Asserts or releases every reset of the PPT and its modules.
    ///
    /// The PPT applies the resets itself. The model follows along, so that it keeps
    /// describing the hardware.
    pub fn reset_all(&mut self, assert: bool) -> Result<(), Error> {
        log::info!("{} all resets", if assert { "Asserting" } else { "Releasing" });
        self.transport().exchange(&Command::ResetAll(assert))?;
        if assert {
            self.state.invalidate();
        }

        for name in [names::epc::EPC_RESET, names::epc::DDR3_RESET] {
            self.shadow_epc(names::epc::MULTI_PURPOSE, name, assert)?;
        }
        for module in 1..=MODULE_COUNT {
            self.shadow_epc(names::epc::MULTI_PURPOSE, &names::epc::iob_reset(module), assert)?;
            self.shadow_epc(
                names::epc::ETHERNET_RESET,
                &names::epc::ethernet_reset(module - 1),
                assert,
            )?;
        }
        self.shadow_epc(names::epc::AURORA_RX_CONTROL, names::epc::AURORA_RX_RESET, assert)?;
        for set in [names::iob::AURORA_RESET, names::iob::ASIC_RESET] {
            self.shadow_iob(set, &DeviceSelector::All, set, assert)?;
        }

        if assert {
            self.program_epc_if_present(names::epc::JTAG_CONTROL, false)?;
        } else {
            for name in [names::epc::PLL_DRP_RESET, names::epc::PLL_RESET] {
                self.shadow_epc(names::epc::CLOCK_FANOUT_CONTROL, name, false)?;
            }
            self.program_all_epc(true)?;
            self.pulse_data_fail_latch()?;
        }
        Ok(())
    }

    /// Asserts or releases the resets of one module.
    pub fn reset_module(&mut self, ctx: DeviceContext, assert: bool) -> Result<(), Error> {
        log::debug!("{} resets of {}", if assert { "Asserting" } else { "Releasing" }, ctx);
        let device = DeviceSelector::One(ctx.iob_device());
        self.shadow_epc(
            names::epc::MULTI_PURPOSE,
            &names::epc::iob_reset(ctx.module()),
            assert,
        )?;
        self.shadow_epc(
            names::epc::ETHERNET_RESET,
            &names::epc::ethernet_reset(ctx.module() - 1),
            assert,
        )?;
        self.shadow_iob(names::iob::AURORA_RESET, &device, names::iob::AURORA_RESET, assert)?;
        self.shadow_iob(names::iob::ASIC_RESET, &device, names::iob::ASIC_RESET, assert)?;
        self.shadow_iob(names::iob::ASIC_RESET, &device, names::iob::ASIC_PLL_RESET, assert)?;

        self.program_epc_if_present(names::epc::MULTI_PURPOSE, false)?;
        self.program_epc_if_present(names::epc::ETHERNET_RESET, false)?;
        self.program_iob_if_present(ctx, names::iob::AURORA_RESET)?;
        self.program_iob_if_present(ctx, names::iob::ASIC_RESET)?;
        if !assert {
            self.pulse_data_fail_latch()?;
        }
        Ok(())
    }

    /// Resets the data path of every module: ethernet, the receivers and DDR3.
    pub fn reset_datapath(&mut self, assert: bool) -> Result<(), Error> {
        self.transport().exchange(&Command::ResetDatapath(assert))?;
        for channel in 0..MODULE_COUNT {
            self.shadow_epc(names::epc::ETHERNET_RESET, &names::epc::ethernet_reset(channel), assert)?;
        }
        self.shadow_epc(names::epc::AURORA_RX_CONTROL, names::epc::AURORA_RX_RESET, assert)?;
        self.shadow_epc(names::epc::MULTI_PURPOSE, names::epc::DDR3_RESET, assert)?;
        self.shadow_iob(
            names::iob::AURORA_RESET,
            &DeviceSelector::All,
            names::iob::AURORA_RESET,
            assert,
        )?;
        self.program_epc_if_present(names::epc::MULTI_PURPOSE, false)
    }

    /// Resets the I/O boards. Asserting forgets the discovered modules.
    pub fn reset_iobs(&mut self, assert: bool) -> Result<(), Error> {
        self.transport().exchange(&Command::ResetIobs(assert))?;
        if assert {
            self.state.invalidate();
        }
        for module in 1..=MODULE_COUNT {
            self.shadow_epc(names::epc::MULTI_PURPOSE, &names::epc::iob_reset(module), assert)?;
        }
        Ok(())
    }

    pub fn reset_epc(&mut self, assert: bool) -> Result<(), Error> {
        self.transport().exchange(&Command::ResetEpc(assert))?;
        self.shadow_epc(names::epc::MULTI_PURPOSE, names::epc::EPC_RESET, assert)
    }

    /// Clears the latched data receive failures.
    pub fn pulse_data_fail_latch(&mut self) -> Result<(), Error> {
        if !self.has_epc_register(names::epc::DATA_RECEIVE_TO_ETHERNET)? {
            return Ok(());
        }
        for value in [true, false] {
            self.shadow_epc(
                names::epc::DATA_RECEIVE_TO_ETHERNET,
                names::epc::RESET_FAIL_DATA,
                value,
            )?;
            self.program_epc_register(names::epc::DATA_RECEIVE_TO_ETHERNET, false)?;
            if value {
                self.pause(self.config().timing.fail_latch_hold)?;
            }
        }
        Ok(())
    }

    pub fn is_ppt_pll_locked(&mut self) -> Result<bool, Error> {
        self.refresh_epc(names::epc::PLL_READBACK)?;
        self.refresh_epc(names::epc::CLOCK_FANOUT_CONTROL)?;
        if self.is_simulated() {
            return Ok(true);
        }
        let pll = self.epc_signal(names::epc::PLL_READBACK, names::epc::PLL_LOCKED)?;
        let mmcm = self.epc_signal(names::epc::CLOCK_FANOUT_CONTROL, names::epc::MMCM_LOCKED)?;
        Ok(pll.is_some_and(|v| v != 0) && mmcm.is_some_and(|v| v != 0))
    }

    /// Polls the PLL of the PPT until it locks or the attempts run out.
    pub fn wait_ppt_pll_lock(&mut self) -> Result<bool, Error> {
        for attempt in 0..self.config().retries.pll_attempts {
            if self.is_ppt_pll_locked()? {
                log::info!("PPT PLL locked after {} polls", attempt);
                return Ok(true);
            }
            self.pause(self.config().timing.pll_poll)?;
        }
        self.report("PPT PLL not locked");
        Ok(false)
    }

    /// Probes the board type register of `ctx`.
    pub fn probe_module(&mut self, ctx: DeviceContext) -> Result<bool, Error> {
        let value = self.iob_read(ctx, BOARD_TYPE_ADDRESS)?;
        if self.is_simulated() {
            return Ok(true);
        }
        let present = value & 0xffff_ff00 == BOARD_TYPE_MAGIC;
        if present {
            log::info!("Found IOB revision {} in {}", value & 0xff, ctx);
        } else {
            log::warn!("No IOB in {}", ctx);
        }
        Ok(present)
    }

    /// Modules with an IOB. Discovery runs once and is cached until a reset or
    /// [Controller::rescan_modules].
    pub fn active_modules(&mut self) -> Result<Vec<DeviceContext>, Error> {
        let modules = match self.state.active_modules() {
            Some(modules) => modules.to_vec(),
            None => {
                let mut found = Vec::new();
                for ctx in DeviceContext::all() {
                    if self.probe_module(ctx)? {
                        self.state.module_mut(ctx).discovered = true;
                        found.push(ctx.module());
                    }
                }
                log::info!("Found {} modules: {:?}", found.len(), found);
                self.state.active = Some(found.clone());
                found
            }
        };
        modules.into_iter().map(DeviceContext::new).collect()
    }

    pub fn rescan_modules(&mut self) -> Result<Vec<DeviceContext>, Error> {
        self.state.invalidate();
        self.active_modules()
    }

    pub fn is_module_present(&mut self, ctx: DeviceContext) -> Result<bool, Error> {
        Ok(self.active_modules()?.contains(&ctx))
    }

    pub fn is_link_up(&mut self, ctx: DeviceContext) -> Result<bool, Error> {
        let set = if ctx.module() <= 2 {
            names::epc::AURORA_RX_READBACK_1
        } else {
            names::epc::AURORA_RX_READBACK_2
        };
        self.refresh_epc(set)?;
        if self.is_simulated() {
            return Ok(true);
        }
        Ok(self.epc_signal(set, &names::epc::channel_up(ctx.module()))? == Some(1))
    }

    /// Pulses the data path reset until the link of `ctx` is up or the attempts run out.
    pub fn train_link(&mut self, ctx: DeviceContext) -> Result<bool, Error> {
        let attempts = self.config().retries.link_attempts;
        let mut attempt = 0;
        loop {
            if self.is_link_up(ctx)? {
                log::info!("Link of {} up after {} resets", ctx, attempt);
                self.state.module_mut(ctx).link_trained = true;
                return Ok(true);
            }
            if attempt == attempts {
                self.report(format!("Link of {} could not be trained", ctx));
                return Ok(false);
            }
            attempt += 1;
            log::debug!("Link of {} down, data path reset {}", ctx, attempt);
            self.reset_datapath(true)?;
            self.pause(self.config().timing.link_reset_pulse)?;
            self.reset_datapath(false)?;
            self.pause(self.config().timing.link_settle)?;
        }
    }

    /// Channels of `ctx` whose data failed since the last latch reset. Only active
    /// channels are reported.
    pub fn channel_failures(&mut self, ctx: DeviceContext) -> Result<u16, Error> {
        let set = if ctx.module() <= 2 {
            names::epc::DATA_RECEIVE_STATUS_0
        } else {
            names::epc::DATA_RECEIVE_STATUS_1
        };
        self.refresh_epc(set)?;
        if self.is_simulated() {
            return Ok(0);
        }
        let failed = self
            .epc_signal(set, &names::epc::failed_asics(ctx.module()))?
            .unwrap_or(0);
        let failed = (failed & 0xffff) as u16 & self.config().active_channels;
        if failed != 0 {
            log::debug!("{}: failed channels {:016b}", ctx, failed);
        }
        Ok(failed)
    }

    /// Polls the data channels of `ctx` after the ASIC reset was released. Failing
    /// channels get their clocks pulsed. Ends after enough consecutive clean polls or
    /// after the attempts run out.
    pub fn verify_asic_reset(&mut self, ctx: DeviceContext) -> Result<bool, Error> {
        let retries = self.config().retries;
        let mut attempts = 0;
        let mut clean = 0;
        let mut failed = 0;
        while attempts < retries.asic_reset_attempts && clean < retries.asic_reset_clean_polls {
            self.pause(self.config().timing.asic_reset_poll)?;
            failed = self.channel_failures(ctx)?;
            if failed == 0 {
                clean += 1;
                continue;
            }
            clean = 0;
            attempts += 1;
            for channel in (0..16).filter(|channel| failed & (1 << channel) != 0) {
                let asic = CHANNEL_ASICS[channel];
                self.pulse_clock_output(ctx, asic, false)?;
                self.pulse_clock_output(ctx, asic, true)?;
            }
            self.pulse_data_fail_latch()?;
        }
        if failed == 0 {
            return Ok(true);
        }
        let asics = (0..16)
            .filter(|channel| failed & (1 << channel) != 0)
            .map(|channel| CHANNEL_ASICS[channel])
            .collect::<Vec<_>>();
        self.report(format!("{}: ASICs {:?} do not send data", ctx, asics));
        Ok(false)
    }

    pub fn set_asic_reset(&mut self, ctx: DeviceContext, assert: bool) -> Result<(), Error> {
        self.set_iob_signal(
            names::iob::ASIC_RESET,
            &DeviceSelector::One(ctx.iob_device()),
            names::iob::ASIC_RESET,
            u32::from(assert),
        )?;
        self.program_iob_register(ctx, names::iob::ASIC_RESET)?;
        if !assert {
            self.state.module_mut(ctx).asic_reset_released = true;
        }
        Ok(())
    }

    pub fn is_asic_pll_locked(&mut self, ctx: DeviceContext) -> Result<bool, Error> {
        self.refresh_iob(ctx, names::iob::ASIC_STATUS)?;
        if self.is_simulated() {
            return Ok(true);
        }
        Ok(self.iob_signal(ctx, names::iob::ASIC_STATUS, names::iob::ASIC_PLL_LOCKED)? == Some(1))
    }

    /// Pulses the ASIC PLL reset of `ctx` until the PLL locks or the attempts run out.
    pub fn wait_asic_pll_lock(&mut self, ctx: DeviceContext) -> Result<bool, Error> {
        let device = DeviceSelector::One(ctx.iob_device());
        for attempt in 0..self.config().retries.asic_pll_attempts {
            if self.is_asic_pll_locked(ctx)? {
                log::debug!("ASIC PLL of {} locked after {} resets", ctx, attempt);
                return Ok(true);
            }
            for value in [1, 0] {
                self.set_iob_signal(names::iob::ASIC_RESET, &device, names::iob::ASIC_PLL_RESET, value)?;
                self.program_iob_register(ctx, names::iob::ASIC_RESET)?;
                let pause = if value == 1 {
                    self.config().timing.asic_pll_reset_pulse
                } else {
                    self.config().timing.asic_pll_settle
                };
                self.pause(pause)?;
            }
        }
        self.report(format!("ASIC PLL of {} could not be locked", ctx));
        Ok(false)
    }

    /// Trains the link of `ctx` and programs its IOB. Returns the failed stages.
    pub fn init_module_iob(&mut self, ctx: DeviceContext) -> Result<Vec<Stage>, Error> {
        let present = self.is_module_present(ctx);
        if self.tolerate(present)? != Some(true) {
            self.report(format!("No IOB in {}", ctx));
            return Ok(vec![Stage::Discovery]);
        }
        let trained = self.train_link(ctx);
        if self.tolerate(trained)? != Some(true) {
            return Ok(vec![Stage::Link]);
        }
        let device = DeviceSelector::One(ctx.iob_device());
        let verdict = self
            .shadow_iob(names::iob::ASIC_READOUT_ENABLE, &device, names::iob::ASIC_READOUT_ENABLE, true)
            .and_then(|()| self.shadow_iob(names::iob::ASIC_RESET, &device, names::iob::ASIC_RESET, false))
            .and_then(|()| {
                self.shadow_iob(names::iob::ASIC_SEND_DUMMY_DATA, &device, names::iob::ASIC_SEND_DUMMY_DATA, false)
            })
            .and_then(|()| self.program_all_iob(ctx));
        match self.tolerate(verdict)? {
            Some(verdict) if !verdict.is_failure() => Ok(Vec::new()),
            _ => Ok(vec![Stage::IobRegisters]),
        }
    }

    /// Like [Controller::tolerate], but a failure is recorded as `stage`.
    fn stage<V>(
        &self,
        failures: &mut Vec<Stage>,
        stage: Stage,
        result: Result<V, Error>,
    ) -> Result<Option<V>, Error> {
        let value = self.tolerate(result)?;
        if value.is_none() {
            fail(failures, stage);
        }
        Ok(value)
    }

    /// Loads the ASICs of `ctx` and starts their clocks. Returns the failed stages.
    pub fn init_module_asics(&mut self, ctx: DeviceContext) -> Result<Vec<Stage>, Error> {
        let mut failures = Vec::new();
        log::info!("Initialising ASICs of {}", ctx);

        let stopped = self.program_clock_global(ctx, true);
        self.stage(&mut failures, Stage::Clocks, stopped)?;
        let fast_init = self.fast_init(ctx);
        self.stage(&mut failures, Stage::FastInit, fast_init)?;
        let held = self.set_asic_reset(ctx, true);
        self.stage(&mut failures, Stage::AsicReset, held)?;

        let config = self
            .enable_jtag_engines(true)
            .and_then(|()| self.program_asic_config(ctx, false));
        if !matches!(self.stage(&mut failures, Stage::AsicConfig, config)?, Some(verdict) if !verdict.is_failure()) {
            fail(&mut failures, Stage::AsicConfig);
        }
        let released = self.set_asic_reset(ctx, false);
        self.stage(&mut failures, Stage::AsicReset, released)?;

        let clocks = self
            .program_clock_global(ctx, false)
            .and_then(|()| self.enable_clocks(ctx));
        self.stage(&mut failures, Stage::Clocks, clocks)?;
        let locked = self.wait_asic_pll_lock(ctx);
        if self.stage(&mut failures, Stage::AsicPll, locked)? == Some(false) {
            fail(&mut failures, Stage::AsicPll);
        }
        Ok(failures)
    }

    fn init_module(&mut self, ctx: DeviceContext) -> Result<ModuleReport, Error> {
        log::info!("Bringing up {}", ctx);
        let mut report = ModuleReport {
            module: ctx.module(),
            failures: Vec::new(),
        };
        let reset = self.reset_module(ctx, true).and_then(|()| {
            self.pause(self.config().timing.reset_pulse)?;
            self.reset_module(ctx, false)
        });
        self.tolerate(reset)?;

        report.failures = self.init_module_iob(ctx)?;
        if report.failed() {
            return Ok(report);
        }
        report.failures = self.init_module_asics(ctx)?;
        let verified = self.verify_asic_reset(ctx);
        if self.tolerate(verified)? != Some(true) {
            fail(&mut report.failures, Stage::AsicReset);
        }
        Ok(report)
    }

    /// Brings the PPT and every module from reset to a state ready for data taking.
    pub fn init_system(&mut self) -> Result<BringupReport, Error> {
        self.reset_all(true)?;
        self.pause(self.config().timing.reset_pulse)?;
        self.reset_all(false)?;

        if !self.wait_ppt_pll_lock()? {
            return Ok(BringupReport {
                pll_locked: false,
                modules: Vec::new(),
            });
        }
        self.program_all_epc(true)?;

        let mut modules = Vec::new();
        for ctx in self.active_modules()? {
            let report = self.init_module(ctx)?;
            if report.failed() {
                self.report(report.to_string());
            }
            modules.push(report);
        }
        self.pulse_data_fail_latch()?;

        let report = BringupReport {
            pll_locked: true,
            modules,
        };
        log::info!("Bring-up finished: {}", report);
        Ok(report)
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

    fn epc() -> MemoryModel {
        let mut multi_purpose = MemorySet::new(names::epc::MULTI_PURPOSE, 8, 16, 1)
            .signal(names::epc::EPC_RESET, 0, 1)
            .signal(names::epc::DDR3_RESET, 1, 1);
        let mut ethernet = MemorySet::new(names::epc::ETHERNET_RESET, 108, 4, 1);
        for module in 1..=MODULE_COUNT {
            multi_purpose = multi_purpose.signal(&names::epc::iob_reset(module), 1 + usize::from(module), 1);
            ethernet = ethernet.signal(&names::epc::ethernet_reset(module - 1), usize::from(module - 1), 1);
        }
        MemoryModel::new()
            .with_set(multi_purpose)
            .with_set(ethernet)
            .with_set(
                MemorySet::new(names::epc::AURORA_RX_CONTROL, 84, 32, 1).signal(names::epc::AURORA_RX_RESET, 30, 1),
            )
            .with_set(
                MemorySet::new(names::epc::CLOCK_FANOUT_CONTROL, 64, 8, 1)
                    .signal(names::epc::PLL_RESET, 0, 1)
                    .signal(names::epc::PLL_DRP_RESET, 1, 1)
                    .status_signal(names::epc::MMCM_LOCKED, 2, 1),
            )
            .with_set(MemorySet::new(names::epc::AURORA_RX_READBACK_1, 88, 32, 1).read_only())
            .with_set(MemorySet::new(names::epc::AURORA_RX_READBACK_2, 92, 32, 1).read_only())
            .with_set(MemorySet::new(names::epc::DATA_RECEIVE_STATUS_0, 120, 32, 1).read_only())
            .with_set(MemorySet::new(names::epc::DATA_RECEIVE_STATUS_1, 124, 32, 1).read_only())
            .with_set(
                MemorySet::new(names::epc::JTAG_CONTROL, 104, 4, 1)
                    .signal("EnJTAG1", 0, 1)
                    .signal("EnJTAG2", 1, 1)
                    .signal("EnJTAG3", 2, 1)
                    .signal("EnJTAG4", 3, 1),
            )
    }

    fn iob() -> MemoryModel {
        MemoryModel::new()
            .with_set(MemorySet::new(names::iob::AURORA_RESET, 0x514, 1, 4).signal(names::iob::AURORA_RESET, 0, 1))
            .with_set(
                MemorySet::new(names::iob::ASIC_RESET, 0x510, 2, 4)
                    .signal(names::iob::ASIC_RESET, 0, 1)
                    .signal(names::iob::ASIC_PLL_RESET, 1, 1),
            )
    }

    fn controller() -> Controller<Journal<Vec<u8>>> {
        let registers = Registers::new(
            Box::new(epc()),
            Box::new(iob()),
            Box::new(MemoryModel::new()),
            Box::new(MemoryModel::new()),
            Box::new(MemorySequencer::new(8)),
        );
        Builder::new()
            .timing(Timing::immediate())
            .build(Journal::new(Vec::new()), Arc::new(registers))
    }

    fn epc_signal(controller: &Controller<Journal<Vec<u8>>>, set: &str, name: &str) -> Option<u32> {
        controller.epc_signal(set, name).unwrap()
    }

    #[test]
    fn reset_all_follows_shadow() {
        let mut controller = controller();
        controller.reset_all(true).unwrap();
        assert_eq!(epc_signal(&controller, names::epc::MULTI_PURPOSE, "IOB_RESET3"), Some(1));
        assert_eq!(epc_signal(&controller, names::epc::ETHERNET_RESET, "Ethernet Reset channel 0"), Some(1));
        assert_eq!(
            controller
                .iob_signal(DeviceContext::new(4).unwrap(), names::iob::ASIC_RESET, names::iob::ASIC_RESET)
                .unwrap(),
            Some(1)
        );
        controller.reset_all(false).unwrap();
        assert_eq!(epc_signal(&controller, names::epc::MULTI_PURPOSE, names::epc::DDR3_RESET), Some(0));
        assert_eq!(
            epc_signal(&controller, names::epc::AURORA_RX_CONTROL, names::epc::AURORA_RX_RESET),
            Some(0)
        );
    }

    #[test]
    fn reset_all_records() {
        let mut controller = controller();
        controller.reset_all(true).unwrap();
        let text = String::from_utf8(controller.into_transport().into_inner()).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        // the PPT side of RSTA, then the JTAG control register
        assert_eq!(lines[..3], ["8", "1", "800f"]);
        assert_eq!(lines[lines.len() - 3..], ["68", "1", "0"]);
    }

    #[test]
    fn shadow_state_is_repeatable() {
        let mut controller = controller();
        let snapshot = |controller: &Controller<Journal<Vec<u8>>>| {
            let epc = controller.registers().epc.lock().unwrap();
            epc.module_sets()
                .iter()
                .map(|set| epc.content(set, &DeviceSelector::All))
                .collect::<Vec<_>>()
        };
        controller.reset_all(true).unwrap();
        controller.reset_all(false).unwrap();
        let first = snapshot(&controller);
        controller.reset_all(true).unwrap();
        controller.reset_all(false).unwrap();
        assert_eq!(first, snapshot(&controller));
    }

    #[test]
    fn discovery_is_cached() {
        let mut controller = controller();
        assert_eq!(controller.active_modules().unwrap().len(), 4);
        assert_eq!(controller.state().active_modules(), Some(&[1, 2, 3, 4][..]));
        let ctx = DeviceContext::new(2).unwrap();
        assert!(controller.state().module(ctx).discovered);

        controller.reset_iobs(true).unwrap();
        assert_eq!(controller.state().active_modules(), None);
        assert!(!controller.state().module(ctx).discovered);
        assert!(controller.is_module_present(ctx).unwrap());
    }

    #[test]
    fn simulated_link_is_up() {
        let mut controller = controller();
        let ctx = DeviceContext::new(3).unwrap();
        assert!(controller.train_link(ctx).unwrap());
        assert!(controller.state().module(ctx).link_trained);
        assert!(controller.verify_asic_reset(ctx).unwrap());
    }

    #[test]
    fn module_reset_touches_one_module() {
        let mut controller = controller();
        let ctx = DeviceContext::new(2).unwrap();
        controller.reset_module(ctx, true).unwrap();
        assert_eq!(epc_signal(&controller, names::epc::MULTI_PURPOSE, "IOB_RESET2"), Some(1));
        assert_eq!(epc_signal(&controller, names::epc::MULTI_PURPOSE, "IOB_RESET1"), Some(0));
        assert_eq!(
            epc_signal(&controller, names::epc::ETHERNET_RESET, "Ethernet Reset channel 1"),
            Some(1)
        );
        assert_eq!(
            controller
                .iob_signal(ctx, names::iob::ASIC_RESET, names::iob::ASIC_PLL_RESET)
                .unwrap(),
            Some(1)
        );
        controller.reset_module(ctx, false).unwrap();
        assert_eq!(epc_signal(&controller, names::epc::MULTI_PURPOSE, "IOB_RESET2"), Some(0));
    }

    #[test]
    fn reports() {
        let report = BringupReport {
            pll_locked: true,
            modules: vec![
                ModuleReport {
                    module: 1,
                    failures: Vec::new(),
                },
                ModuleReport {
                    module: 3,
                    failures: vec![Stage::Link],
                },
            ],
        };
        assert!(report.failed());
        assert_eq!(report.to_string(), "Module 1: ready\nModule 3: link not up");
        assert!(
            !BringupReport {
                pll_locked: true,
                modules: vec![],
            }
            .failed()
        );
        assert!(
            BringupReport {
                pll_locked: false,
                modules: vec![],
            }
            .failed()
        );
    }
}
