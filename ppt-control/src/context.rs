use std::fmt::{Display, Formatter};

use ppt_client::journal::jtag_engine_address;

use crate::error::Error;

pub const MODULE_COUNT: u8 = 4;

/// The module, and optionally the ASIC within its chain, an operation acts on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeviceContext {
    module: u8,
    asic: Option<usize>,
}

impl DeviceContext {
    /// Selects `module`, counted from 1.
    pub fn new(module: u8) -> Result<DeviceContext, Error> {
        if !(1..=MODULE_COUNT).contains(&module) {
            return Err(Error::Configuration(format!(
                "Module {} does not exist, modules are numbered 1 to {}",
                module, MODULE_COUNT
            )));
        }
        Ok(DeviceContext { module, asic: None })
    }

    /// Every module slot of a PPT.
    pub fn all() -> impl Iterator<Item = DeviceContext> {
        (1..=MODULE_COUNT).map(|module| DeviceContext { module, asic: None })
    }

    pub fn with_asic(self, asic: usize) -> DeviceContext {
        DeviceContext {
            asic: Some(asic),
            ..self
        }
    }

    pub fn module(&self) -> u8 {
        self.module
    }

    pub fn asic(&self) -> Option<usize> {
        self.asic
    }

    /// Device index of the module in IOB module sets.
    pub fn iob_device(&self) -> usize {
        usize::from(self.module - 1)
    }

    pub fn jtag_engine(&self) -> u32 {
        jtag_engine_address(self.module)
    }
}

impl Display for DeviceContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "module {}", self.module)?;
        if let Some(asic) = self.asic {
            write!(f, " ASIC {}", asic)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn module_range() {
        assert!(DeviceContext::new(0).is_err());
        assert!(DeviceContext::new(5).is_err());
        let ctx = DeviceContext::new(3).unwrap();
        assert_eq!(ctx.iob_device(), 2);
        assert_eq!(ctx.jtag_engine(), 60);
        assert_eq!(DeviceContext::all().count(), 4);
    }

    #[test]
    fn display() {
        let ctx = DeviceContext::new(2).unwrap().with_asic(11);
        assert_eq!(ctx.to_string(), "module 2 ASIC 11");
    }
}
