//! Names of the module sets and signals the engine drives directly.
//!
//! Register models must use these names for the corresponding registers.

pub mod epc {
    pub const MULTI_PURPOSE: &str = "Multi_purpose_Register";
    pub const ETHERNET_RESET: &str = "Ethernet_Reset_Register";
    pub const AURORA_RX_CONTROL: &str = "AuroraRX_Control";
    pub const AURORA_RX_READBACK_1: &str = "AuroraRX_ReadbackRegister1";
    pub const AURORA_RX_READBACK_2: &str = "AuroraRX_ReadbackRegister2";
    pub const CLOCK_FANOUT_CONTROL: &str = "CLOCK_FANOUT_CONTROL";
    pub const PLL_READBACK: &str = "PLLReadbackRegister";
    pub const JTAG_CONTROL: &str = "JTAG_Control_Register";
    pub const JTAG_READBACK: &str = "JTAG_1_Readback_Register";
    pub const DATA_RECEIVE_TO_ETHERNET: &str = "DataRecv_to_Eth0_Register";
    pub const DATA_RECEIVE_STATUS_0: &str = "Data_Receive_Status_0";
    pub const DATA_RECEIVE_STATUS_1: &str = "Data_Receive_Status_1";

    pub const EPC_RESET: &str = "EPC_devices_reset";
    pub const DDR3_RESET: &str = "ddr3_reset";
    pub const AURORA_RX_RESET: &str = "rx_aurora_reset_in";
    pub const PLL_DRP_RESET: &str = "PLL_DRP_RST";
    pub const PLL_RESET: &str = "PLL_RST";
    pub const PLL_LOCKED: &str = "PLL_LD";
    pub const MMCM_LOCKED: &str = "mmcm_locked";
    pub const RESET_FAIL_DATA: &str = "reset_fail_data";

    pub fn iob_reset(module: u8) -> String {
        format!("IOB_RESET{}", module)
    }

    pub fn ethernet_reset(channel: u8) -> String {
        format!("Ethernet Reset channel {}", channel)
    }

    pub fn jtag_enable(module: u8) -> String {
        format!("EnJTAG{}", module)
    }

    pub fn jtag_fifo_empty(module: u8) -> String {
        format!("jtag{}_dev_out_fifo_empty", module - 1)
    }

    pub fn channel_up(module: u8) -> String {
        format!("aurora{} rx_channel_up", module - 1)
    }

    pub fn failed_asics(module: u8) -> String {
        format!("Failed_Asics_Module_{}", module)
    }
}

pub mod iob {
    pub const AURORA_RESET: &str = "Aurora_Reset";
    pub const ASIC_RESET: &str = "ASIC_reset";
    pub const ASIC_PLL_RESET: &str = "ASIC_pll_reset";
    pub const ASIC_READOUT_ENABLE: &str = "ASIC_readout_enable";
    pub const ASIC_SEND_DUMMY_DATA: &str = "ASIC_send_dummy_data";
    pub const ASIC_STATUS: &str = "ASIC_status";
    pub const ASIC_PLL_LOCKED: &str = "ASIC_bufpll_locked";
    pub const LMK_CONTROL: &str = "LMK_control";
    pub const LMK_DATA: &str = "LMK_data";
    pub const LMK_ENABLE: &str = "LMK_en";
    pub const LMK_VALID: &str = "LMK_valid";
    pub const LMK_DEVICE_SELECT: &str = "LMK_dev_sel";
    pub const PRB_CONTROL: &str = "PRB_control";
    pub const PRB_POWER_OFF: &str = "PRB_power_off";
}

pub mod jtag {
    pub const GLOBAL_CONTROL: &str = "Global Control Register";
    pub const CHAIN_LOAD: &str = "SC_EnChainLd";
    pub const SRAM_CONTROL: &str = "JTAG SRAM Control";
    pub const GLOBAL_FCSR_0: &str = "Global FCSR 0";
    pub const GLOBAL_FCSR_1: &str = "Global FCSR 1";
    pub const MASTER_FSM: &str = "Master FSM Config Register";
}

pub mod pixel {
    pub const CONTROL: &str = "Control register";
}

pub const COMMAND_FILE: &str = "cmdsFromSoftware";
pub const READBACK_FILE: &str = "ReadBackJtagCommands";
/// Component that cannot read back its pixel registers in chain mode.
pub const CHAINLESS_COMPONENT: &str = "DSSC-F2-MSDD-Ladder-2-2";
