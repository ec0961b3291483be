//! # PPT Probe
//!
//! Low-level access to a PPT from the command line: register reads and writes, resets,
//! status queries and file transfers. Every invocation issues a single request, or a
//! transfer followed by the request that consumes it.
//!
//! With `--simulate <journal>`, requests are appended to the journal file instead of
//! reaching hardware.
use std::error::Error;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use clap_num::maybe_hex;
use env_logger::Env;
use ppt_client::{Transport, client::Builder, journal::Journal};
use ppt_protocol::Command;
use tokio_util::sync::CancellationToken;

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(ValueEnum, Copy, Clone, Debug, Eq, PartialEq)]
enum ResetTarget {
    All,
    Iobs,
    Datapath,
    Epc,
}

#[derive(ValueEnum, Copy, Clone, Debug, Eq, PartialEq)]
enum FlashTarget {
    /// Program a bitfile into the IOB FPGAs
    Iob,
    /// Flash the PPT firmware
    Firmware,
    /// Flash the PPT Linux image
    Linux,
}

#[derive(Subcommand, Clone, Debug, Eq, PartialEq)]
enum Action {
    /// Read a PPT FPGA register
    EpcRead {
        #[arg(value_parser = maybe_hex::<u32>)]
        address: u32,
    },
    /// Write a PPT FPGA register
    EpcWrite {
        #[arg(value_parser = maybe_hex::<u32>)]
        address: u32,
        #[arg(value_parser = maybe_hex::<u32>)]
        value: u32,
    },
    /// Read a register of the I/O board in slot `module`
    IobRead {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=4))]
        module: u8,
        #[arg(value_parser = maybe_hex::<u32>)]
        address: u32,
    },
    /// Write a register of the I/O board in slot `module`
    IobWrite {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=4))]
        module: u8,
        #[arg(value_parser = maybe_hex::<u32>)]
        address: u32,
        #[arg(value_parser = maybe_hex::<u32>)]
        value: u32,
    },
    /// Assert a reset, or release it with --release
    Reset {
        #[arg(value_enum)]
        target: ResetTarget,
        #[arg(short, long)]
        release: bool,
    },
    /// Reset the ASIC JTAG controllers of a module
    ResetJtag {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=4))]
        module: u8,
    },
    Status,
    Serial,
    Temperature,
    /// Read the receive register of the safety interlock board
    Sib,
    Burst,
    Readout,
    TestPattern,
    SingleCycle,
    /// Run a shell command on the PPT
    Exec {
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Store a local file on the PPT
    Upload {
        file: PathBuf,
        #[arg(short, long, help = "Remote name, defaults to the local file name")]
        name: Option<String>,
    },
    /// Fetch a file from the PPT
    Download { name: String, output: PathBuf },
    /// Upload an image and flash it
    Flash {
        #[arg(value_enum)]
        target: FlashTarget,
        file: PathBuf,
    },
    /// Install previously uploaded PPT programs
    UpdateSoftware,
}

#[derive(Parser)]
#[command(about = "Low-level access to a PPT", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "192.168.0.125")]
    ip: IpAddr,

    #[arg(short, long, default_value = "2384")]
    port: u16,

    #[arg(long, default_value = "21")]
    transfer_port: u16,

    #[arg(long, help = "Seconds to wait for a reply", default_value = "10")]
    receive_timeout: u64,

    #[arg(long, help = "Append requests to this journal instead of sending them")]
    simulate: Option<PathBuf>,

    #[clap(subcommand)]
    action: Action,
}

fn open_transport(args: &Args, token: CancellationToken) -> Result<Box<dyn Transport + Send>, BoxError> {
    if let Some(path) = &args.simulate {
        log::info!("Simulating, journal at {}", path.display());
        return Ok(Box::new(Journal::open(path)?));
    }
    let addr = SocketAddr::new(args.ip, args.port);
    log::info!("Connecting to {}", addr);
    let client = Builder::new()
        .receive_timeout(Some(Duration::from_secs(args.receive_timeout)))
        .transfer_port(args.transfer_port)
        .cancellation(token)
        .connect(addr)?;
    Ok(Box::new(client))
}

fn remote_name(file: &Path, name: Option<String>) -> Result<String, BoxError> {
    match name {
        Some(name) => Ok(name),
        None => Ok(file
            .file_name()
            .ok_or("The upload needs a file name")?
            .to_string_lossy()
            .into_owned()),
    }
}

fn upload(transport: &mut dyn Transport, file: &Path, name: Option<String>) -> Result<(), BoxError> {
    let contents = fs::read(file)?;
    let name = remote_name(file, name)?;
    transport.upload(&name, &contents)?;
    log::info!("Uploaded {} bytes as {}", contents.len(), name);
    Ok(())
}

fn run(args: Args, token: CancellationToken) -> Result<(), BoxError> {
    let mut transport = open_transport(&args, token)?;
    match args.action {
        Action::EpcRead { address } => {
            let value = transport.scalar(&Command::EpcRead { address })?;
            println!("{:#010x}", value);
        }
        Action::EpcWrite { address, value } => {
            transport.exchange(&Command::EpcWrite { address, value })?;
        }
        Action::IobRead { module, address } => {
            let value = transport.scalar(&Command::IobRead { module, address })?;
            println!("{:#010x}", value);
        }
        Action::IobWrite {
            module,
            address,
            value,
        } => {
            transport.exchange(&Command::IobWrite {
                module,
                address,
                value,
            })?;
        }
        Action::Reset { target, release } => {
            let assert = !release;
            let command = match target {
                ResetTarget::All => Command::ResetAll(assert),
                ResetTarget::Iobs => Command::ResetIobs(assert),
                ResetTarget::Datapath => Command::ResetDatapath(assert),
                ResetTarget::Epc => Command::ResetEpc(assert),
            };
            transport.exchange(&command)?;
        }
        Action::ResetJtag { module } => {
            transport.exchange(&Command::ResetJtag { module })?;
        }
        Action::Status => {
            let status = transport.scalar(&Command::SystemStatus)? & 0xff;
            println!("{:#04x}", status);
        }
        Action::Serial => println!("{:#x}", transport.wide(&Command::SerialNumber)?),
        Action::Temperature => println!("{}", transport.scalar(&Command::Temperature)?),
        Action::Sib => {
            for value in transport.vector(&Command::SibReceive)? {
                println!("{:#010x}", value);
            }
        }
        Action::Burst => {
            transport.exchange(&Command::StartBurst)?;
        }
        Action::Readout => {
            transport.exchange(&Command::StartReadout)?;
        }
        Action::TestPattern => {
            transport.exchange(&Command::TestPattern)?;
        }
        Action::SingleCycle => {
            transport.exchange(&Command::SingleCycle)?;
        }
        Action::Exec { command } => {
            let status = transport.scalar(&Command::Exec(command.join(" ")))?;
            println!("{}", status);
        }
        Action::Upload { file, name } => upload(&mut transport, &file, name)?,
        Action::Download { name, output } => {
            let contents = transport.download(&name)?;
            fs::write(&output, &contents)?;
            log::info!("Downloaded {} bytes to {}", contents.len(), output.display());
        }
        Action::Flash { target, file } => {
            upload(&mut transport, &file, None)?;
            let command = match target {
                FlashTarget::Iob => Command::UpdateIobFirmware,
                FlashTarget::Firmware => Command::FlashFirmware,
                FlashTarget::Linux => Command::FlashLinux,
            };
            transport.checked(&command)?;
        }
        Action::UpdateSoftware => transport.checked(&Command::UpdateSoftware)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::debug!("Parsed arguments: {:?}", args.action);

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, cancelling");
            cancel.cancel();
        }
    });

    tokio::task::spawn_blocking(move || run(args, token)).await?
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_addresses() {
        let args = Args::parse_from(["ppt-probe", "iob-write", "2", "0x514", "1"]);
        assert_eq!(
            args.action,
            Action::IobWrite {
                module: 2,
                address: 0x514,
                value: 1
            }
        );
        assert!(Args::try_parse_from(["ppt-probe", "iob-read", "5", "16"]).is_err());
    }

    #[test]
    fn exec_joins_words() {
        let args = Args::parse_from(["ppt-probe", "exec", "ls", "-l", "/tmp"]);
        assert_eq!(
            args.action,
            Action::Exec {
                command: vec!["ls".to_string(), "-l".to_string(), "/tmp".to_string()]
            }
        );
    }

    #[test]
    fn remote_name_defaults_to_file_name() {
        assert_eq!(
            remote_name(Path::new("/home/user/IOB.bit"), None).unwrap(),
            "IOB.bit"
        );
        assert_eq!(
            remote_name(Path::new("IOB.bit"), Some("iob_firmware".to_string())).unwrap(),
            "iob_firmware"
        );
    }
}
