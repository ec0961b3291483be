use std::{fmt::Display, str::FromStr};

use crate::error::ReadError;

/// Literal that starts every request sent to the PPT.
pub const COMMAND_PREFIX: &[u8] = b"cmdXFEL ";

/// Every four letter code the PPT understands. Replies echo one of them.
pub const COMMAND_CODES: [&str; 25] = [
    "BURS", "DCTW", "DCTX", "EPCC", "EXEC", "FINT", "FLFI", "FLLI", "IOBC", "JTG1", "JTGC", "JTGW",
    "READ", "RSTA", "RSTD", "RSTE", "RSTI", "SERN", "SIBR", "SIGL", "STAT", "TEMP", "TEST", "UPDS",
    "UPIF",
];

/// Returns whether `code` is a command code that the PPT may echo.
pub fn is_known_code(code: &str) -> bool {
    COMMAND_CODES.contains(&code)
}

/// A request sent from the host to the PPT.
///
/// The PPT answers every request with exactly one [Reply] and processes requests
/// strictly in the order received. There are no sequence numbers, so a client must
/// never have more than one request in flight.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Reads a 32 bit word from the PPT FPGA register space.
    EpcRead { address: u32 },
    EpcWrite { address: u32, value: u32 },
    /// Reads a 32 bit word of the I/O board in slot `module` (1 to 4).
    IobRead { module: u8, address: u32 },
    IobWrite { module: u8, address: u32, value: u32 },
    /// Asserts or releases every reset line of the PPT.
    ResetAll(bool),
    ResetIobs(bool),
    ResetDatapath(bool),
    ResetEpc(bool),
    /// Resets the ASIC JTAG controllers of a module.
    ResetJtag { module: u8 },
    /// Blocks until the JTAG engine of a module has drained its queue.
    WaitJtag { module: u8 },
    /// Starts programming the previously uploaded JTAG command file.
    StartJtagProgramming,
    FastInit { module: u8, init_distance: u32 },
    /// Announces the length of the next [Command::DirectWrite] payload.
    DirectWriteLength(usize),
    DirectWrite(String),
    StartBurst,
    StartReadout,
    TestPattern,
    SingleCycle,
    SystemStatus,
    SerialNumber,
    Temperature,
    SibReceive,
    FlashFirmware,
    FlashLinux,
    UpdateIobFirmware,
    UpdateSoftware,
    /// Runs a shell command on the PPT.
    Exec(String),
}

impl Command {
    /// The four letter code of this command that the reply must echo.
    pub fn code(&self) -> &'static str {
        match self {
            Command::EpcRead { .. } | Command::EpcWrite { .. } => "EPCC",
            Command::IobRead { .. } | Command::IobWrite { .. } => "IOBC",
            Command::ResetAll(_) => "RSTA",
            Command::ResetIobs(_) => "RSTI",
            Command::ResetDatapath(_) => "RSTD",
            Command::ResetEpc(_) => "RSTE",
            Command::ResetJtag { .. } => "JTGC",
            Command::WaitJtag { .. } => "JTGW",
            Command::StartJtagProgramming => "JTG1",
            Command::FastInit { .. } => "FINT",
            Command::DirectWriteLength(_) => "DCTW",
            Command::DirectWrite(_) => "DCTX",
            Command::StartBurst => "BURS",
            Command::StartReadout => "READ",
            Command::TestPattern => "TEST",
            Command::SingleCycle => "SIGL",
            Command::SystemStatus => "STAT",
            Command::SerialNumber => "SERN",
            Command::Temperature => "TEMP",
            Command::SibReceive => "SIBR",
            Command::FlashFirmware => "FLFI",
            Command::FlashLinux => "FLLI",
            Command::UpdateIobFirmware => "UPIF",
            Command::UpdateSoftware => "UPDS",
            Command::Exec(_) => "EXEC",
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code();
        match self {
            Command::EpcRead { address } => write!(f, "{} R {}", code, address),
            Command::EpcWrite { address, value } => write!(f, "{} W {} {}", code, address, value),
            Command::IobRead { module, address } => write!(f, "{} R {} {}", code, module, address),
            Command::IobWrite {
                module,
                address,
                value,
            } => write!(f, "{} W {} {} {}", code, module, address, value),
            Command::ResetAll(assert) | Command::ResetEpc(assert) => {
                write!(f, "{} {}", code, u8::from(*assert))
            }
            Command::ResetIobs(assert) | Command::ResetDatapath(assert) => {
                write!(f, "{} {}", code, if *assert { 15 } else { 0 })
            }
            Command::ResetJtag { module } => write!(f, "{} {}ff", code, module),
            Command::WaitJtag { module } => write!(f, "{} {}", code, module),
            Command::FastInit {
                module,
                init_distance,
            } => write!(f, "{} {} {}", code, module, init_distance),
            Command::DirectWriteLength(len) => write!(f, "{} {:x}", code, len),
            Command::DirectWrite(payload) => write!(f, "{} {}", code, payload),
            Command::Exec(command) => write!(f, "{} {}", code, command),
            _ => write!(f, "{}", code),
        }
    }
}

fn next_field<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
    code: &str,
) -> Result<&'a str, ReadError> {
    fields
        .next()
        .ok_or_else(|| ReadError::InvalidFormat(format!("Missing argument for {}", code)))
}

fn parse_switch(field: &str, on: u32, code: &str) -> Result<bool, ReadError> {
    match field.parse::<u32>()? {
        0 => Ok(false),
        value if value == on => Ok(true),
        value => Err(ReadError::InvalidFormat(format!(
            "{} expects 0 or {}, got {}",
            code, on, value
        ))),
    }
}

impl FromStr for Command {
    type Err = ReadError;

    fn from_str(text: &str) -> Result<Command, ReadError> {
        let text = text.trim_end();
        let (code, args) = text.split_once(' ').unwrap_or((text, ""));
        let mut fields = args.split_ascii_whitespace();
        let command = match code {
            "EPCC" => match next_field(&mut fields, code)? {
                "R" => Command::EpcRead {
                    address: next_field(&mut fields, code)?.parse()?,
                },
                "W" => Command::EpcWrite {
                    address: next_field(&mut fields, code)?.parse()?,
                    value: next_field(&mut fields, code)?.parse()?,
                },
                other => {
                    return Err(ReadError::InvalidFormat(format!(
                        "Unknown EPCC access mode {}",
                        other
                    )));
                }
            },
            "IOBC" => match next_field(&mut fields, code)? {
                "R" => Command::IobRead {
                    module: next_field(&mut fields, code)?.parse()?,
                    address: next_field(&mut fields, code)?.parse()?,
                },
                "W" => Command::IobWrite {
                    module: next_field(&mut fields, code)?.parse()?,
                    address: next_field(&mut fields, code)?.parse()?,
                    value: next_field(&mut fields, code)?.parse()?,
                },
                other => {
                    return Err(ReadError::InvalidFormat(format!(
                        "Unknown IOBC access mode {}",
                        other
                    )));
                }
            },
            "RSTA" => Command::ResetAll(parse_switch(next_field(&mut fields, code)?, 1, code)?),
            "RSTE" => Command::ResetEpc(parse_switch(next_field(&mut fields, code)?, 1, code)?),
            "RSTI" => Command::ResetIobs(parse_switch(next_field(&mut fields, code)?, 15, code)?),
            "RSTD" => {
                Command::ResetDatapath(parse_switch(next_field(&mut fields, code)?, 15, code)?)
            }
            "JTGC" => {
                let field = next_field(&mut fields, code)?;
                let module = field.strip_suffix("ff").ok_or_else(|| {
                    ReadError::InvalidFormat(format!("JTGC argument {} lacks the ff mask", field))
                })?;
                Command::ResetJtag {
                    module: module.parse()?,
                }
            }
            "JTGW" => Command::WaitJtag {
                module: next_field(&mut fields, code)?.parse()?,
            },
            "JTG1" => Command::StartJtagProgramming,
            "FINT" => Command::FastInit {
                module: next_field(&mut fields, code)?.parse()?,
                init_distance: next_field(&mut fields, code)?.parse()?,
            },
            "DCTW" => Command::DirectWriteLength(usize::from_str_radix(
                next_field(&mut fields, code)?,
                16,
            )?),
            "DCTX" => Command::DirectWrite(args.trim().to_string()),
            "EXEC" => Command::Exec(args.to_string()),
            "BURS" => Command::StartBurst,
            "READ" => Command::StartReadout,
            "TEST" => Command::TestPattern,
            "SIGL" => Command::SingleCycle,
            "STAT" => Command::SystemStatus,
            "SERN" => Command::SerialNumber,
            "TEMP" => Command::Temperature,
            "SIBR" => Command::SibReceive,
            "FLFI" => Command::FlashFirmware,
            "FLLI" => Command::FlashLinux,
            "UPIF" => Command::UpdateIobFirmware,
            "UPDS" => Command::UpdateSoftware,
            other => return Err(ReadError::InvalidCommand(other.to_string())),
        };
        Ok(command)
    }
}

/// The answer of the PPT to a single [Command].
///
/// A reply starts with the four letter code of the request it answers, followed by a
/// single space and a command specific body. Scalar replies carry one decimal value,
/// vector replies carry `<retcode>;<count>;<v0>;<v1>;...`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    code: String,
    body: String,
}

impl Reply {
    pub fn new(code: impl Into<String>, body: impl Into<String>) -> Reply {
        Reply {
            code: code.into(),
            body: body.into(),
        }
    }

    /// Creates the reply to `command` carrying `body`.
    pub fn answer(command: &Command, body: impl Display) -> Reply {
        Reply::new(command.code(), body.to_string())
    }

    /// Creates a vector reply to `command`.
    pub fn vector_answer(command: &Command, ret: i64, values: &[u32]) -> Reply {
        let mut body = format!("{};{}", ret, values.len());
        for value in values {
            body.push_str(&format!(";{}", value));
        }
        Reply::new(command.code(), body)
    }

    /// The echoed command code
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Fails unless this reply echoes the code of `command`.
    pub fn check_echo(&self, command: &Command) -> Result<(), ReadError> {
        if self.code != command.code() {
            return Err(ReadError::EchoMismatch {
                expected: command.code().to_string(),
                got: self.code.clone(),
            });
        }
        Ok(())
    }

    /// Interprets the body as a single 32 bit value.
    pub fn scalar(&self) -> Result<u32, ReadError> {
        Ok(self.body.trim().parse::<u32>()?)
    }

    /// Interprets the body as a single 64 bit value.
    pub fn wide(&self) -> Result<u64, ReadError> {
        Ok(self.body.trim().parse::<u64>()?)
    }

    /// Interprets the body as `<retcode>;<count>;<values>...`.
    ///
    /// A nonzero return code results in [ReadError::ReturnCode].
    pub fn vector(&self) -> Result<Vec<u32>, ReadError> {
        let mut fields = self.body.trim().split(';').filter(|f| !f.is_empty());
        let ret = fields
            .next()
            .ok_or_else(|| ReadError::InvalidFormat("Empty vector reply".to_string()))?
            .trim()
            .parse::<i64>()?;
        if ret != 0 {
            return Err(ReadError::ReturnCode(ret));
        }
        let count = fields
            .next()
            .ok_or_else(|| ReadError::InvalidFormat("Vector reply lacks a count".to_string()))?
            .trim()
            .parse::<usize>()?;
        let values = fields
            .map(|field| field.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()?;
        if values.len() != count {
            return Err(ReadError::InvalidFormat(format!(
                "Vector reply announces {} values, but carries {}",
                count,
                values.len()
            )));
        }
        Ok(values)
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.body)
    }
}

impl FromStr for Reply {
    type Err = ReadError;

    fn from_str(text: &str) -> Result<Reply, ReadError> {
        let text = text.trim();
        let (code, body) = text.split_once(' ').unwrap_or((text, ""));
        if !is_known_code(code) {
            return Err(ReadError::InvalidCommand(code.to_string()));
        }
        Ok(Reply::new(code, body))
    }
}
