use std::{path::PathBuf, sync::Arc, time::Duration};

use ppt_client::Transport;
use ppt_protocol::jtag;
use tokio_util::sync::CancellationToken;

use crate::{engine::Controller, error::Error, registers::Registers};

/// Shape of the ASIC chain behind every module.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Topology {
    pub chain_len: usize,
    pub pixels_per_asic: usize,
    pub pixels_per_row: usize,
    /// Column select bits per ASIC in each of the two X select registers.
    pub x_select_bits: usize,
    /// Row select bits per ASIC.
    pub y_select_bits: usize,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            chain_len: 16,
            pixels_per_asic: 4096,
            pixels_per_row: 64,
            x_select_bits: 32,
            y_select_bits: 64,
        }
    }
}

impl Topology {
    pub fn pixels(&self) -> usize {
        self.chain_len * self.pixels_per_asic
    }

    /// Position of `asic` in the chain. ASICs 0 to 7 are wired in reverse, so a chain
    /// shorter than 8 starts at ASIC 7.
    pub fn chain_position(&self, asic: usize) -> Result<usize, Error> {
        let position = jtag::chain_position(asic);
        if position >= self.chain_len {
            return Err(Error::Configuration(format!(
                "ASIC {} is outside of the chain of {} ASICs",
                asic, self.chain_len
            )));
        }
        Ok(position)
    }
}

/// How JTAG transactions reach the engine.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum OutputMode {
    /// One `DCTW`/`DCTX` pair per frame.
    Direct,
    /// A command file pushed through the transfer server, started with `JTG1`.
    #[default]
    File,
}

/// Every pause the engine makes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Timing {
    pub pll_poll: Duration,
    pub link_reset_pulse: Duration,
    pub link_settle: Duration,
    pub asic_reset_poll: Duration,
    pub asic_pll_reset_pulse: Duration,
    pub asic_pll_settle: Duration,
    pub clock_toggle: Duration,
    pub fail_latch_hold: Duration,
    pub jtag_enable_settle: Duration,
    pub pixel_settle: Duration,
    pub reset_pulse: Duration,
    /// Gap between announcing and sending a direct write.
    pub direct_write_gap: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            pll_poll: Duration::from_millis(10),
            link_reset_pulse: Duration::from_millis(1),
            link_settle: Duration::from_millis(10),
            asic_reset_poll: Duration::from_millis(150),
            asic_pll_reset_pulse: Duration::from_millis(10),
            asic_pll_settle: Duration::from_millis(100),
            clock_toggle: Duration::from_millis(20),
            fail_latch_hold: Duration::from_millis(200),
            jtag_enable_settle: Duration::from_millis(10),
            pixel_settle: Duration::from_millis(100),
            reset_pulse: Duration::from_millis(80),
            direct_write_gap: Duration::from_millis(1),
        }
    }
}

impl Timing {
    /// No pauses at all. Meant for simulation and tests.
    pub fn immediate() -> Timing {
        Timing {
            pll_poll: Duration::ZERO,
            link_reset_pulse: Duration::ZERO,
            link_settle: Duration::ZERO,
            asic_reset_poll: Duration::ZERO,
            asic_pll_reset_pulse: Duration::ZERO,
            asic_pll_settle: Duration::ZERO,
            clock_toggle: Duration::ZERO,
            fail_latch_hold: Duration::ZERO,
            jtag_enable_settle: Duration::ZERO,
            pixel_settle: Duration::ZERO,
            reset_pulse: Duration::ZERO,
            direct_write_gap: Duration::ZERO,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub pll_attempts: usize,
    pub link_attempts: usize,
    pub asic_reset_attempts: usize,
    /// Consecutive clean polls after which the ASIC reset counts as verified.
    pub asic_reset_clean_polls: usize,
    pub asic_pll_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            pll_attempts: 5,
            link_attempts: 3,
            asic_reset_attempts: 5,
            asic_reset_clean_polls: 10,
            asic_pll_attempts: 5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub topology: Topology,
    pub output_mode: OutputMode,
    pub timing: Timing,
    pub retries: RetryPolicy,
    /// Distance argument of the fast init command.
    pub init_distance: u32,
    /// Identifies hardware variants that need special handling.
    pub component_id: Option<String>,
    /// Data channels expected to carry ASIC data, one bit per channel.
    pub active_channels: u16,
    /// Where verification failures are dumped. Nothing is dumped without it.
    pub dump_dir: Option<PathBuf>,
    pub cancellation: CancellationToken,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            output_mode: OutputMode::default(),
            timing: Timing::default(),
            retries: RetryPolicy::default(),
            init_distance: 120,
            component_id: None,
            active_channels: 0xffff,
            dump_dir: None,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Builder to create a [Controller] and modify configuration options
///
/// # Example
///
/// ```ignore
/// use ppt_control::{Builder, OutputMode, Timing};
///
/// let controller = Builder::new()
///     .output_mode(OutputMode::Direct)
///     .timing(Timing::immediate())
///     .build(transport, registers);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.config.topology = topology;
        self
    }

    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.config.output_mode = mode;
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.config.timing = timing;
        self
    }

    pub fn retries(mut self, retries: RetryPolicy) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn init_distance(mut self, distance: u32) -> Self {
        self.config.init_distance = distance;
        self
    }

    pub fn component_id(mut self, id: impl Into<String>) -> Self {
        self.config.component_id = Some(id.into());
        self
    }

    pub fn active_channels(mut self, channels: u16) -> Self {
        self.config.active_channels = channels;
        self
    }

    /// Set the directory that receives expected/actual dumps of failed verifications.
    pub fn dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.dump_dir = Some(dir.into());
        self
    }

    /// Pauses fail with [crate::Error::Cancelled] once `token` is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.config.cancellation = token;
        self
    }

    pub fn config(self) -> Config {
        self.config
    }

    /// Build and return the controller
    pub fn build<T: Transport>(self, transport: T, registers: Arc<Registers>) -> Controller<T> {
        Controller::new(transport, registers, self.config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_topology() {
        let topology = Topology::default();
        assert_eq!(topology.pixels(), 65536);
        assert_eq!(topology.pixels_per_asic / topology.pixels_per_row, topology.y_select_bits);
        assert_eq!(topology.pixels_per_row, 2 * topology.x_select_bits);
    }

    #[test]
    fn ladder_positions() {
        let ladder = Topology::default();
        assert_eq!(ladder.chain_position(0).unwrap(), 7);
        assert_eq!(ladder.chain_position(7).unwrap(), 0);
        assert_eq!(ladder.chain_position(8).unwrap(), 8);
        assert!(ladder.chain_position(16).is_err());

        let half = Topology {
            chain_len: 8,
            ..Topology::default()
        };
        let positions = (0..8)
            .map(|asic| half.chain_position(asic).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(positions, [7, 6, 5, 4, 3, 2, 1, 0]);
        assert!(matches!(half.chain_position(8), Err(Error::Configuration(_))));

        let single = Topology {
            chain_len: 1,
            ..Topology::default()
        };
        assert_eq!(single.chain_position(7).unwrap(), 0);
        assert!(single.chain_position(0).is_err());
    }

    #[test]
    fn builder_overrides() {
        let config = Builder::new()
            .output_mode(OutputMode::Direct)
            .timing(Timing::immediate())
            .init_distance(80)
            .component_id("F1-Ladder")
            .config();
        assert_eq!(config.output_mode, OutputMode::Direct);
        assert!(config.timing.pixel_settle.is_zero());
        assert_eq!(config.init_distance, 80);
        assert_eq!(config.component_id.as_deref(), Some("F1-Ladder"));
        assert_eq!(config.retries.link_attempts, 3);
        assert_eq!(config.active_channels, 0xffff);
    }
}
