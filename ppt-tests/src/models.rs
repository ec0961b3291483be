//! Register models that describe a small but complete PPT with one populated slot.
use std::sync::Arc;

use ppt_control::{
    bringup::BOARD_TYPE_MAGIC,
    context::MODULE_COUNT,
    memory::{MemoryModel, MemorySequencer, MemorySet},
    names,
    registers::Registers,
};

/// Bits of every pixel register.
pub const PIXEL_BITS: usize = 8;
pub const GAIN: &str = "Gain";
/// An IOB of revision 2.
pub const BOARD_TYPE: u32 = BOARD_TYPE_MAGIC | 2;

pub mod epc {
    pub const MULTI_PURPOSE: u32 = 8;
    pub const CLOCK_FANOUT_CONTROL: u32 = 64;
    pub const PLL_READBACK: u32 = 68;
    pub const AURORA_RX_CONTROL: u32 = 84;
    pub const AURORA_RX_READBACK_1: u32 = 88;
    pub const AURORA_RX_READBACK_2: u32 = 92;
    pub const JTAG_CONTROL: u32 = 104;
    pub const ETHERNET_RESET: u32 = 108;
    pub const JTAG_READBACK: u32 = 112;
    pub const DATA_RECEIVE_STATUS_0: u32 = 120;
    pub const DATA_RECEIVE_STATUS_1: u32 = 124;
    /// Bit of `mmcm_locked` in the clock fanout control register.
    pub const MMCM_LOCKED_BIT: u32 = 1 << 2;
}

pub mod iob {
    pub const LMK_CONTROL: u32 = 0x100;
    pub const LMK_DATA: u32 = 0x104;
    pub const ASIC_RESET: u32 = 0x510;
    pub const AURORA_RESET: u32 = 0x514;
    pub const ASIC_STATUS: u32 = 0x520;
    pub const ASIC_READOUT_ENABLE: u32 = 0x530;
    pub const PRB_CONTROL: u32 = 0x600;
}

pub fn epc() -> MemoryModel {
    let mut multi_purpose = MemorySet::new(names::epc::MULTI_PURPOSE, epc::MULTI_PURPOSE, 16, 1)
        .signal(names::epc::EPC_RESET, 0, 1)
        .signal(names::epc::DDR3_RESET, 1, 1);
    let mut ethernet = MemorySet::new(names::epc::ETHERNET_RESET, epc::ETHERNET_RESET, 4, 1);
    let mut jtag_control = MemorySet::new(names::epc::JTAG_CONTROL, epc::JTAG_CONTROL, 4, 1);
    let mut jtag_readback =
        MemorySet::new(names::epc::JTAG_READBACK, epc::JTAG_READBACK, 4, 1).read_only();
    let mut aurora_1 =
        MemorySet::new(names::epc::AURORA_RX_READBACK_1, epc::AURORA_RX_READBACK_1, 32, 1)
            .read_only();
    let mut aurora_2 =
        MemorySet::new(names::epc::AURORA_RX_READBACK_2, epc::AURORA_RX_READBACK_2, 32, 1)
            .read_only();
    let mut receive_0 =
        MemorySet::new(names::epc::DATA_RECEIVE_STATUS_0, epc::DATA_RECEIVE_STATUS_0, 32, 1)
            .read_only();
    let mut receive_1 =
        MemorySet::new(names::epc::DATA_RECEIVE_STATUS_1, epc::DATA_RECEIVE_STATUS_1, 32, 1)
            .read_only();

    for module in 1..=MODULE_COUNT {
        let index = usize::from(module - 1);
        multi_purpose = multi_purpose.signal(&names::epc::iob_reset(module), 2 + index, 1);
        ethernet = ethernet.signal(&names::epc::ethernet_reset(module - 1), index, 1);
        jtag_control = jtag_control.signal(&names::epc::jtag_enable(module), index, 1);
        jtag_readback = jtag_readback.signal(&names::epc::jtag_fifo_empty(module), index, 1);
        // two modules share each readback and status register
        let half = index % 2;
        if module <= 2 {
            aurora_1 = aurora_1.signal(&names::epc::channel_up(module), 16 * half, 1);
            receive_0 = receive_0.signal(&names::epc::failed_asics(module), 16 * half, 16);
        } else {
            aurora_2 = aurora_2.signal(&names::epc::channel_up(module), 16 * half, 1);
            receive_1 = receive_1.signal(&names::epc::failed_asics(module), 16 * half, 16);
        }
    }

    MemoryModel::new()
        .with_set(multi_purpose)
        .with_set(ethernet)
        .with_set(
            MemorySet::new(names::epc::AURORA_RX_CONTROL, epc::AURORA_RX_CONTROL, 32, 1)
                .signal(names::epc::AURORA_RX_RESET, 30, 1),
        )
        .with_set(
            MemorySet::new(names::epc::CLOCK_FANOUT_CONTROL, epc::CLOCK_FANOUT_CONTROL, 8, 1)
                .signal(names::epc::PLL_RESET, 0, 1)
                .signal(names::epc::PLL_DRP_RESET, 1, 1)
                .status_signal(names::epc::MMCM_LOCKED, 2, 1),
        )
        .with_set(
            MemorySet::new(names::epc::PLL_READBACK, epc::PLL_READBACK, 8, 1)
                .read_only()
                .signal(names::epc::PLL_LOCKED, 0, 1),
        )
        .with_set(aurora_1)
        .with_set(aurora_2)
        .with_set(receive_0)
        .with_set(receive_1)
        .with_set(jtag_control)
        .with_set(jtag_readback)
}

pub fn iob() -> MemoryModel {
    let devices = usize::from(MODULE_COUNT);
    MemoryModel::new()
        .with_set(
            MemorySet::new(names::iob::AURORA_RESET, iob::AURORA_RESET, 1, devices)
                .signal(names::iob::AURORA_RESET, 0, 1),
        )
        .with_set(
            MemorySet::new(names::iob::ASIC_RESET, iob::ASIC_RESET, 2, devices)
                .signal(names::iob::ASIC_RESET, 0, 1)
                .signal(names::iob::ASIC_PLL_RESET, 1, 1),
        )
        .with_set(
            MemorySet::new(names::iob::ASIC_READOUT_ENABLE, iob::ASIC_READOUT_ENABLE, 1, devices)
                .signal(names::iob::ASIC_READOUT_ENABLE, 0, 1),
        )
        .with_set(
            MemorySet::new(names::iob::ASIC_STATUS, iob::ASIC_STATUS, 1, devices)
                .read_only()
                .signal(names::iob::ASIC_PLL_LOCKED, 0, 1),
        )
        .with_set(
            MemorySet::new(names::iob::LMK_CONTROL, iob::LMK_CONTROL, 6, devices)
                .signal(names::iob::LMK_ENABLE, 0, 1)
                .signal(names::iob::LMK_VALID, 1, 1)
                .signal(names::iob::LMK_DEVICE_SELECT, 2, 4),
        )
        .with_set(
            MemorySet::new(names::iob::LMK_DATA, iob::LMK_DATA, 32, devices)
                .signal(names::iob::LMK_DATA, 0, 32),
        )
        .with_set(
            MemorySet::new(names::iob::PRB_CONTROL, iob::PRB_CONTROL, 2, devices)
                .signal(names::iob::PRB_POWER_OFF, 1, 1),
        )
}

pub fn jtag(chain_len: usize) -> MemoryModel {
    MemoryModel::new()
        .with_set(
            MemorySet::new(names::jtag::GLOBAL_CONTROL, 1, 40, chain_len)
                .signal(names::jtag::CHAIN_LOAD, 3, 1)
                .signal("SC_Bias", 8, 6),
        )
        .with_set(MemorySet::new(names::jtag::SRAM_CONTROL, 2, 10, chain_len))
        .with_set(MemorySet::new(names::jtag::MASTER_FSM, 6, 24, chain_len))
}

pub fn pixel(chain_len: usize) -> MemoryModel {
    MemoryModel::new().with_set(
        MemorySet::new(names::pixel::CONTROL, 0, PIXEL_BITS, chain_len * 4096)
            .signal(GAIN, 0, 5)
            .signal("Enable", 5, 1),
    )
}

pub fn sequencer() -> MemorySequencer {
    MemorySequencer::new(16)
        .with_hold(2, 3)
        .with_track(1, vec![0..4, 10..12])
}

pub fn registers(chain_len: usize) -> Arc<Registers> {
    Arc::new(Registers::new(
        Box::new(epc()),
        Box::new(iob()),
        Box::new(jtag(chain_len)),
        Box::new(pixel(chain_len)),
        Box::new(sequencer()),
    ))
}
