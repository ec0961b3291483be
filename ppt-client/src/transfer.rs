//! Passive-mode file transfer to and from the PPT.
//!
//! The PPT runs a minimal FTP server. Only anonymous login, passive data connections
//! and the `STOR`, `RETR`, `SIZE` and `TYPE` commands are used.
use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{IpAddr, Shutdown, SocketAddr, TcpStream},
    path::Path,
    time::Duration,
};

use crate::error::Error;

const PASSIVE_REPLY: &str = "227";

/// Extracts the data port from a passive mode reply such as
/// `227 PASV ok (192,168,0,1,4,1)`.
pub fn parse_passive(reply: &str) -> Option<u16> {
    if !reply.starts_with(PASSIVE_REPLY) {
        return None;
    }
    let start = reply.find('(')?;
    let end = start + reply[start..].find(')')?;
    let fields = reply[start + 1..end]
        .split(',')
        .map(|field| field.trim().parse::<u8>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    match fields[..] {
        [_, _, _, _, high, low] => Some(u16::from(high) << 8 | u16::from(low)),
        _ => None,
    }
}

/// One control connection to the transfer server of the PPT.
pub struct FtpSession {
    control: BufReader<TcpStream>,
    writer: TcpStream,
    host: IpAddr,
    timeout: Duration,
}

impl FtpSession {
    /// Connects, waits for the greeting and logs in anonymously.
    pub fn open(addr: SocketAddr, timeout: Duration) -> Result<FtpSession, Error> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|source| Error::Connect {
            address: addr.to_string(),
            source,
        })?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let writer = stream.try_clone()?;
        let mut session = FtpSession {
            control: BufReader::new(stream),
            writer,
            host: addr.ip(),
            timeout,
        };

        let greeting = session.read_reply()?;
        if !greeting.contains("220") {
            return Err(Error::Transfer(format!("Unexpected greeting {}", greeting)));
        }
        session.send_line("USER anonymous")?;
        let login = session.read_reply()?;
        if login.starts_with('4') || login.starts_with('5') {
            return Err(Error::Transfer(format!("Login refused: {}", login)));
        }
        log::debug!("Transfer session to {} opened", addr);
        Ok(session)
    }

    fn send_line(&mut self, line: &str) -> Result<(), Error> {
        log::trace!("FTP > {}", line);
        self.writer.write_all(format!("{}\r\n", line).as_bytes())?;
        Ok(())
    }

    /// Reads one reply. Multi-line replies (`123-...`) are read up to their last line.
    pub fn read_reply(&mut self) -> Result<String, Error> {
        let first = self.read_line()?;
        let mut reply = first.clone();
        if first.len() >= 4 && first.as_bytes()[3] == b'-' {
            let terminal = format!("{} ", &first[..3]);
            loop {
                let line = self.read_line()?;
                reply.push('\n');
                reply.push_str(&line);
                if line.starts_with(&terminal) {
                    break;
                }
            }
        }
        log::trace!("FTP < {}", reply);
        Ok(reply)
    }

    fn read_line(&mut self) -> Result<String, Error> {
        let mut line = String::new();
        if self.control.read_line(&mut line)? == 0 {
            return Err(Error::Transfer(
                "Transfer server closed the connection".to_string(),
            ));
        }
        Ok(line.trim_end().to_string())
    }

    /// Reads replies until the completion reply of a transfer.
    fn finish(&mut self) -> Result<String, Error> {
        loop {
            let reply = self.read_reply()?;
            match reply.as_bytes().first() {
                Some(b'1') => continue,
                Some(b'2') => return Ok(reply),
                _ => return Err(Error::Transfer(format!("Transfer failed: {}", reply))),
            }
        }
    }

    fn passive_port(&mut self) -> Result<u16, Error> {
        self.send_line("PASV")?;
        let reply = self.read_reply()?;
        parse_passive(&reply)
            .ok_or_else(|| Error::Transfer(format!("Unexpected passive mode reply {}", reply)))
    }

    fn connect_data(&self, port: u16) -> Result<TcpStream, Error> {
        let addr = SocketAddr::new(self.host, port);
        let stream =
            TcpStream::connect_timeout(&addr, self.timeout).map_err(|source| Error::Connect {
                address: addr.to_string(),
                source,
            })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }

    /// Queries the size of a file on the PPT.
    pub fn remote_size(&mut self, name: &str) -> Result<usize, Error> {
        self.send_line(&format!("SIZE {}", name))?;
        let reply = self.read_reply()?;
        reply
            .strip_prefix("213 ")
            .and_then(|size| size.trim().parse::<usize>().ok())
            .ok_or_else(|| Error::Transfer(format!("Unexpected size reply {}", reply)))
    }

    /// Stores `contents` under the file name of `name` and confirms the stored size.
    pub fn upload(&mut self, name: &str, contents: &[u8]) -> Result<(), Error> {
        let file_name = Path::new(name)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::Transfer(format!("Invalid file name {}", name)))?;
        let port = self.passive_port()?;
        self.send_line(&format!("STOR {}", file_name))?;
        {
            let mut data = self.connect_data(port)?;
            data.write_all(contents)?;
            data.shutdown(Shutdown::Write)?;
        }

        let status = self.read_reply()?;
        if !status.contains("150 Ok") {
            return Err(Error::Transfer(format!(
                "Upload of {} not accepted: {}",
                file_name, status
            )));
        }
        self.finish()?;

        let size = self.remote_size(file_name)?;
        if size != contents.len() {
            return Err(Error::Transfer(format!(
                "Remote size of {} is {} bytes, but {} bytes were sent",
                file_name,
                size,
                contents.len()
            )));
        }
        log::info!("Uploaded {} ({} bytes)", file_name, size);
        Ok(())
    }

    /// Retrieves the complete file `name` from the PPT.
    pub fn download(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let port = self.passive_port()?;
        self.send_line("TYPE A")?;
        self.read_reply()?;
        let size = self.remote_size(name)?;

        self.send_line(&format!("RETR {}", name))?;
        let mut contents = vec![0u8; size];
        {
            let mut data = self.connect_data(port)?;
            data.read_exact(&mut contents).map_err(|err| {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::Transfer(format!("{} ended before {} bytes were read", name, size))
                } else {
                    err.into()
                }
            })?;
        }
        self.finish()?;
        log::debug!("Downloaded {} ({} bytes)", name, size);
        Ok(contents)
    }
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        let _ = self.send_line("QUIT");
    }
}

#[cfg(test)]
mod test {
    use super::parse_passive;

    #[test]
    fn passive_reply() {
        assert_eq!(parse_passive("227 PASV ok (127,0,0,1,4,1)"), Some(1025));
        assert_eq!(
            parse_passive("227 Entering Passive Mode (10,0,0,2,200,10)."),
            Some(200 * 256 + 10)
        );
    }

    #[test]
    fn malformed_passive_reply() {
        assert_eq!(parse_passive("500 PASV not understood"), None);
        assert_eq!(parse_passive("227 PASV ok (127,0,0,1,4)"), None);
        assert_eq!(parse_passive("227 PASV ok (127,0,0,1,4,300)"), None);
    }
}
