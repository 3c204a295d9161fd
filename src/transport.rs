//! Stream transports to the server: Unix-domain or TCP, with connect retry.

use std::ffi::CString;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::thread::sleep;
use std::time::Duration;

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use log::debug;

use crate::config::{Endpoint, Settings};

/// A connected stream to the server.
///
/// The handle keeps one clone for writing and hands a second to the reader
/// thread; both refer to the same underlying socket.
#[derive(Debug)]
pub enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Conn {
    pub fn try_clone(&self) -> io::Result<Conn> {
        match self {
            Conn::Tcp(stream) => stream.try_clone().map(Conn::Tcp),
            Conn::Unix(stream) => stream.try_clone().map(Conn::Unix),
        }
    }

    /// Half-close the write side, leaving replies readable.
    pub fn shutdown_write(&self) -> io::Result<()> {
        match self {
            Conn::Tcp(stream) => stream.shutdown(Shutdown::Write),
            Conn::Unix(stream) => stream.shutdown(Shutdown::Write),
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(stream) => stream.read(buf),
            Conn::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(stream) => stream.write(buf),
            Conn::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Tcp(stream) => stream.flush(),
            Conn::Unix(stream) => stream.flush(),
        }
    }
}

/// Connect to the configured endpoint, repeating once per second while the
/// retry budget lasts.
pub fn connect(settings: &Settings) -> Result<Conn> {
    let mut retries = settings.retry;
    loop {
        match connect_once(&settings.endpoint) {
            Ok(conn) => return Ok(conn),
            Err(err) if retries > 0 => {
                debug!(
                    "connecting to {} failed ({err:#}), {retries} retries left",
                    settings.server
                );
                retries -= 1;
                sleep(Duration::from_secs(1));
            }
            Err(err) => {
                return Err(err).wrap_err_with(|| format!("connecting to {}", settings.server))
            }
        }
    }
}

fn connect_once(endpoint: &Endpoint) -> Result<Conn> {
    match endpoint {
        Endpoint::Unix(path) => {
            debug!("connecting to Unix socket {}", path.display());
            Ok(Conn::Unix(UnixStream::connect(path)?))
        }
        Endpoint::Tcp { host, port } => {
            debug!("connecting to TCP socket host={host} port={port}");
            let port = resolve_port(port)?;
            let mut last = None;
            for addr in (host.as_str(), port).to_socket_addrs()? {
                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        return Ok(Conn::Tcp(stream));
                    }
                    Err(err) => last = Some(err),
                }
            }
            match last {
                Some(err) => Err(err.into()),
                None => bail!("no addresses found for {host}"),
            }
        }
    }
}

// getservbyname hands back static storage, so lookups are serialized
static SERVICES: Mutex<()> = Mutex::new(());

/// A numeric port, or a service name resolved against the services database.
fn resolve_port(port: &str) -> Result<u16> {
    if let Ok(port) = port.parse() {
        return Ok(port);
    }
    let name = CString::new(port)?;
    let proto = CString::new("tcp")?;
    let _services = SERVICES.lock().unwrap();
    let servent = unsafe { nix::libc::getservbyname(name.as_ptr(), proto.as_ptr()) };
    if servent.is_null() {
        bail!("unknown port or service name '{port}'");
    }
    let s_port = unsafe { (*servent).s_port };
    Ok(u16::from_be(s_port as u16))
}
