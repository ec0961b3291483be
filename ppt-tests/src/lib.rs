//! A fake PPT for tests that run the client and the engine against real sockets.
//!
//! [FakePpt] serves the command interface and a passive-mode transfer server on
//! loopback. JTAG engines of the fake answer every readback frame with the bits they
//! were given, so that a correctly built transaction always verifies. Faults are
//! injected through the setters of [FakePpt].
use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use bytes::BytesMut;
use parking_lot::Mutex;
use ppt_client::{PptClient, client::Builder};
use ppt_protocol::{Command, codec::DeviceCodec, error::ReadError, jtag::JtagFrame};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    runtime::Runtime,
};
use tokio_util::codec::{Decoder, Encoder};

mod device;
pub mod models;

pub use device::Device;

/// Longest request the fake accepts. Direct writes of full pixel chunks are long.
const MAX_REQUEST_LEN: usize = 1 << 20;

pub struct FakePpt {
    runtime: Runtime,
    command_addr: SocketAddr,
    transfer_addr: SocketAddr,
    device: Arc<Mutex<Device>>,
}

impl FakePpt {
    /// Starts both servers on ephemeral loopback ports.
    pub fn start() -> io::Result<FakePpt> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let (commands, transfers) = runtime.block_on(async {
            let commands = TcpListener::bind("127.0.0.1:0").await?;
            let transfers = TcpListener::bind("127.0.0.1:0").await?;
            Ok::<_, io::Error>((commands, transfers))
        })?;
        let command_addr = commands.local_addr()?;
        let transfer_addr = transfers.local_addr()?;
        let device = Arc::new(Mutex::new(Device::default()));

        runtime.spawn(accept_commands(commands, Arc::clone(&device)));
        runtime.spawn(accept_transfers(transfers, Arc::clone(&device)));
        log::debug!(
            "Fake PPT at {}, transfers at {}",
            command_addr,
            transfer_addr
        );
        Ok(FakePpt {
            runtime,
            command_addr,
            transfer_addr,
            device,
        })
    }

    pub fn command_addr(&self) -> SocketAddr {
        self.command_addr
    }

    /// A client builder pointing at the transfer server of the fake, without pacing.
    pub fn client_builder(&self) -> Builder {
        Builder::new()
            .transfer_port(self.transfer_addr.port())
            .command_pacing(Duration::ZERO)
            .receive_timeout(Some(Duration::from_secs(5)))
    }

    pub fn connect(&self) -> Result<PptClient, ppt_client::Error> {
        self.client_builder().connect(self.command_addr)
    }

    /// Runs `f` on the device state while no request is being answered.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut Device) -> R) -> R {
        f(&mut self.device.lock())
    }

    pub fn set_epc(&self, address: u32, value: u32) {
        self.device.lock().epc.insert(address, value);
    }

    /// Makes the bits in `mask` read as `value` no matter what is written.
    pub fn force_epc_bits(&self, address: u32, mask: u32, value: u32) {
        self.device.lock().epc_forced.insert(address, (mask, value));
    }

    pub fn epc(&self, address: u32) -> u32 {
        self.device.lock().epc.get(&address).copied().unwrap_or(0)
    }

    pub fn set_iob(&self, module: u8, address: u32, value: u32) {
        self.device.lock().iob.insert((module, address), value);
    }

    pub fn iob(&self, module: u8, address: u32) -> u32 {
        self.device
            .lock()
            .iob
            .get(&(module, address))
            .copied()
            .unwrap_or(0)
    }

    /// Every register written so far, EPC first, then IOB.
    pub fn register_snapshot(&self) -> (Vec<(u32, u32)>, Vec<((u8, u32), u32)>) {
        let device = self.device.lock();
        (
            device.epc.iter().map(|(a, v)| (*a, *v)).collect(),
            device.iob.iter().map(|(a, v)| (*a, *v)).collect(),
        )
    }

    /// Answers every request with `code` with `body` instead of executing it.
    pub fn reply_to(&self, code: &'static str, body: impl Into<String>) {
        self.device.lock().replies.insert(code, body.into());
    }

    /// Echoes `code` in every reply.
    pub fn echo_as(&self, code: &str) {
        self.device.lock().echo = Some(code.to_string());
    }

    /// Flips one bit of the readback file produced by the next transactions.
    pub fn flip_readback_bit(&self, bit: usize) {
        self.device.lock().flip = Some(bit);
    }

    /// JTAG engines stop recording readback data.
    pub fn drop_readback(&self) {
        self.device.lock().drop_readback = true;
    }

    /// Uploaded files lose their last byte.
    pub fn truncate_uploads(&self) {
        self.device.lock().truncate_uploads = true;
    }

    pub fn set_serial(&self, serial: u64) {
        self.device.lock().serial = serial;
    }

    pub fn set_sib(&self, values: Vec<u32>) {
        self.device.lock().sib = values;
    }

    pub fn requests(&self) -> Vec<Command> {
        self.device.lock().requests.clone()
    }

    pub fn count_requests(&self, matches: impl Fn(&Command) -> bool) -> usize {
        self.device.lock().requests.iter().filter(|c| matches(c)).count()
    }

    pub fn clear_requests(&self) {
        let mut device = self.device.lock();
        device.requests.clear();
        device.frames.clear();
    }

    /// Every JTAG frame the engines received, with the engine address.
    pub fn frames(&self) -> Vec<(u32, JtagFrame)> {
        self.device.lock().frames.clone()
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.device.lock().files.get(name).cloned()
    }

    /// Locks the PLLs and idles the JTAG engines, then installs an IOB with a working
    /// link and locked ASIC PLL in every slot of `modules`.
    pub fn install_modules(&self, modules: &[u8]) {
        self.set_epc(models::epc::PLL_READBACK, 1);
        self.force_epc_bits(
            models::epc::CLOCK_FANOUT_CONTROL,
            models::epc::MMCM_LOCKED_BIT,
            models::epc::MMCM_LOCKED_BIT,
        );
        self.set_epc(models::epc::JTAG_READBACK, 0xf);
        for &module in modules {
            let (address, bit) = match module {
                1 => (models::epc::AURORA_RX_READBACK_1, 0),
                2 => (models::epc::AURORA_RX_READBACK_1, 16),
                3 => (models::epc::AURORA_RX_READBACK_2, 0),
                _ => (models::epc::AURORA_RX_READBACK_2, 16),
            };
            let up = self.epc(address) | 1 << bit;
            self.set_epc(address, up);
            self.set_iob(module, ppt_control::bringup::BOARD_TYPE_ADDRESS, models::BOARD_TYPE);
            self.set_iob(module, models::iob::ASIC_STATUS, 1);
        }
    }

    pub fn shutdown(self) {
        self.runtime.shutdown_timeout(Duration::from_millis(100));
    }
}

async fn accept_commands(listener: TcpListener, device: Arc<Mutex<Device>>) {
    while let Ok((stream, peer)) = listener.accept().await {
        log::debug!("Command connection from {}", peer);
        let device = Arc::clone(&device);
        tokio::spawn(async move {
            if let Err(err) = serve_commands(stream, device).await {
                log::debug!("Command connection closed: {}", err);
            }
        });
    }
}

async fn serve_commands(mut stream: TcpStream, device: Arc<Mutex<Device>>) -> Result<(), ReadError> {
    let mut codec = DeviceCodec::new(MAX_REQUEST_LEN);
    let mut input = BytesMut::with_capacity(4096);
    let mut output = BytesMut::new();
    loop {
        while let Some(command) = codec.decode(&mut input)? {
            let reply = device.lock().answer(command);
            codec.encode(reply, &mut output)?;
            stream.write_all(&output).await?;
            output.clear();
        }
        if stream.read_buf(&mut input).await? == 0 {
            return Ok(());
        }
    }
}

async fn accept_transfers(listener: TcpListener, device: Arc<Mutex<Device>>) {
    while let Ok((stream, _)) = listener.accept().await {
        let device = Arc::clone(&device);
        tokio::spawn(async move {
            if let Err(err) = serve_transfers(stream, device).await {
                log::debug!("Transfer connection closed: {}", err);
            }
        });
    }
}

async fn send_line(writer: &mut (impl AsyncWrite + Unpin), line: &str) -> io::Result<()> {
    writer.write_all(format!("{}\r\n", line).as_bytes()).await
}

fn passive_reply(port: u16) -> String {
    format!(
        "227 Entering Passive Mode (127,0,0,1,{},{})",
        port >> 8,
        port & 0xff
    )
}

/// The subset of FTP the client uses.
async fn serve_transfers(stream: TcpStream, device: Arc<Mutex<Device>>) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut passive: Option<TcpListener> = None;
    send_line(&mut writer, "220 PPT transfer server ready").await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        let (verb, argument) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "USER" => send_line(&mut writer, "230 Login successful").await?,
            "TYPE" => send_line(&mut writer, "200 Type set").await?,
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                send_line(&mut writer, &passive_reply(listener.local_addr()?.port())).await?;
                passive = Some(listener);
            }
            "SIZE" => {
                let size = device.lock().files.get(argument).map(Vec::len);
                match size {
                    Some(size) => send_line(&mut writer, &format!("213 {}", size)).await?,
                    None => send_line(&mut writer, "550 No such file").await?,
                }
            }
            "STOR" => {
                let Some(listener) = passive.take() else {
                    send_line(&mut writer, "425 Use PASV first").await?;
                    continue;
                };
                send_line(&mut writer, "150 Ok to send data").await?;
                let (mut data, _) = listener.accept().await?;
                let mut contents = Vec::new();
                data.read_to_end(&mut contents).await?;
                device.lock().store(argument, contents);
                send_line(&mut writer, "226 Transfer complete").await?;
            }
            "RETR" => {
                let contents = device.lock().files.get(argument).cloned();
                let (Some(listener), Some(contents)) = (passive.take(), contents) else {
                    send_line(&mut writer, "550 Failed to open file").await?;
                    continue;
                };
                send_line(&mut writer, "150 Opening data connection").await?;
                let (mut data, _) = listener.accept().await?;
                data.write_all(&contents).await?;
                data.shutdown().await?;
                send_line(&mut writer, "226 Transfer complete").await?;
            }
            "QUIT" => {
                send_line(&mut writer, "221 Goodbye").await?;
                return Ok(());
            }
            _ => send_line(&mut writer, "502 Command not implemented").await?,
        }
    }
    Ok(())
}
