use std::{
    io::{BufReader, Write},
    net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs},
    thread,
    time::Duration,
};

use ppt_protocol::{Command, Reply};
use tokio_util::sync::CancellationToken;

use crate::{Transport, error::Error, transfer::FtpSession};

#[derive(Debug, Clone)]
pub struct Config {
    /// Timeout for connecting and for writing a request.
    pub send_timeout: Duration,
    /// Timeout for a reply. `None` waits forever.
    pub receive_timeout: Option<Duration>,
    /// Pause after each request. The command parser of the PPT needs a short gap
    /// between consecutive requests.
    pub command_pacing: Duration,
    pub transfer_port: u16,
    pub max_reply_len: usize,
    pub cancellation: CancellationToken,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            receive_timeout: Some(Duration::from_secs(10)),
            command_pacing: Duration::from_micros(500),
            transfer_port: 21,
            max_reply_len: 1000,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Builder to create a [PptClient] and modify configuration options
///
/// # Example
///
/// ```ignore
/// use ppt_client::client::Builder;
/// use std::time::Duration;
///
/// let client = Builder::new()
///     .receive_timeout(Some(Duration::from_secs(30)))
///     .transfer_port(2121)
///     .connect("192.168.0.125:2384")?;
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    pub fn receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.receive_timeout = timeout;
        self
    }

    pub fn command_pacing(mut self, pacing: Duration) -> Self {
        self.config.command_pacing = pacing;
        self
    }

    /// Set the port of the file transfer server on the PPT.
    pub fn transfer_port(mut self, port: u16) -> Self {
        self.config.transfer_port = port;
        self
    }

    pub fn max_reply_len(mut self, len: usize) -> Self {
        self.config.max_reply_len = len;
        self
    }

    /// Every round trip fails with [Error::Cancelled] once `token` is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.config.cancellation = token;
        self
    }

    /// Connect and return the client
    pub fn connect(self, addr: impl ToSocketAddrs) -> Result<PptClient, Error> {
        PptClient::with_config(addr, self.config)
    }
}

/// Client for the command interface of a PPT.
///
/// Requests are strictly synchronous: every request blocks until its reply has been read.
pub struct PptClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: SocketAddr,
    config: Config,
}

impl PptClient {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<PptClient, Error> {
        Builder::new().connect(addr)
    }

    pub fn with_config(addr: impl ToSocketAddrs, config: Config) -> Result<PptClient, Error> {
        let mut last_error = None;
        let addrs = addr.to_socket_addrs().map_err(|source| Error::Connect {
            address: "<unresolved>".to_string(),
            source,
        })?;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.send_timeout) {
                Ok(stream) => return PptClient::from_stream(stream, addr, config),
                Err(source) => {
                    log::debug!("Could not connect to {}: {}", addr, source);
                    last_error = Some(Error::Connect {
                        address: addr.to_string(),
                        source,
                    });
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Connect {
            address: "<none>".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrNotAvailable),
        }))
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr, config: Config) -> Result<PptClient, Error> {
        stream.set_write_timeout(Some(config.send_timeout))?;
        stream.set_read_timeout(config.receive_timeout)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        log::info!("Connected to PPT at {}", peer);
        Ok(PptClient {
            reader: BufReader::new(stream),
            writer,
            peer,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Address of the transfer server, which runs on the same host as the command interface.
    pub fn transfer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host(), self.config.transfer_port)
    }

    fn host(&self) -> IpAddr {
        self.peer.ip()
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.config.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Sends a request without waiting for its reply.
    pub fn send(&mut self, command: &Command) -> Result<(), Error> {
        self.check_cancelled()?;
        log::debug!("Sending {}", command);
        command.write_to(&mut self.writer)?;
        self.writer.flush()?;
        if !self.config.command_pacing.is_zero() {
            thread::sleep(self.config.command_pacing);
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Reply, Error> {
        let reply = Reply::from_reader(&mut self.reader, self.config.max_reply_len)?;
        log::debug!("Received {}", reply);
        Ok(reply)
    }

    fn transfer(&self) -> Result<FtpSession, Error> {
        self.check_cancelled()?;
        FtpSession::open(self.transfer_addr(), self.config.send_timeout.max(
            self.config.receive_timeout.unwrap_or(self.config.send_timeout),
        ))
    }
}

impl Transport for PptClient {
    fn exchange(&mut self, command: &Command) -> Result<Reply, Error> {
        self.send(command)?;
        let reply = self.receive().inspect_err(|err| {
            log::error!("No valid reply to {}: {}", command.code(), err);
        })?;
        if let Err(err) = reply.check_echo(command) {
            log::error!("{}", err);
            return Err(err.into());
        }
        Ok(reply)
    }

    fn upload(&mut self, name: &str, contents: &[u8]) -> Result<(), Error> {
        self.transfer()?.upload(name, contents)
    }

    fn download(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        self.transfer()?.download(name)
    }
}
