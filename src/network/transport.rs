//! Transport selection
//!
//! The connect itself is blocking and runs on the caller thread; the socket
//! is then switched to non-blocking and wrapped for the event loop.

use std::io::{self, Read, Write};

use mio::event::Source;
use mio::{Interest, Registry, Token};
use tracing::debug;

use super::address::{BusAddress, UnixAddress};

/// A connected, non-blocking stream ready for registration with `mio`.
#[derive(Debug)]
pub enum Transport {
    #[cfg(unix)]
    Unix(mio::net::UnixStream),
    Tcp(mio::net::TcpStream),
}

impl Transport {
    /// Open `address`, picking the native stream type for its family.
    pub fn connect(address: &BusAddress, socket_buffer_size: Option<usize>) -> io::Result<Self> {
        let transport = match address {
            #[cfg(unix)]
            BusAddress::Unix(unix) => {
                let stream = connect_unix(unix)?;
                stream.set_nonblocking(true)?;
                if let Some(size) = socket_buffer_size {
                    set_socket_buffers(&stream, size);
                }
                Transport::Unix(mio::net::UnixStream::from_std(stream))
            }
            #[cfg(not(unix))]
            BusAddress::Unix(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                ))
            }
            BusAddress::Tcp { host, port } => {
                let stream = std::net::TcpStream::connect((host.as_str(), *port))?;
                // Auth lines are small; don't let Nagle hold them back.
                stream.set_nodelay(true)?;
                stream.set_nonblocking(true)?;
                #[cfg(unix)]
                if let Some(size) = socket_buffer_size {
                    set_socket_buffers(&stream, size);
                }
                Transport::Tcp(mio::net::TcpStream::from_std(stream))
            }
        };
        debug!(transport = address.transport_name(), %address, "transport connected");
        Ok(transport)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Unix(s) => s.shutdown(std::net::Shutdown::Both),
            Transport::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
        }
    }
}

#[cfg(unix)]
fn connect_unix(address: &UnixAddress) -> io::Result<std::os::unix::net::UnixStream> {
    use std::os::unix::net::UnixStream;

    match address {
        UnixAddress::Path(path) => UnixStream::connect(path),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        UnixAddress::Abstract(name) => {
            #[cfg(target_os = "android")]
            use std::os::android::net::SocketAddrExt;
            #[cfg(target_os = "linux")]
            use std::os::linux::net::SocketAddrExt;

            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
            UnixStream::connect_addr(&addr)
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        UnixAddress::Abstract(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "abstract sockets are only available on Linux",
        )),
    }
}

/// Best effort; not every platform honours the request.
#[cfg(unix)]
fn set_socket_buffers<S: std::os::unix::io::AsRawFd>(stream: &S, size: usize) {
    let fd = stream.as_raw_fd();
    let optval = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
    // SAFETY: fd is a live socket owned by `stream`; optval outlives the calls.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
            Transport::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
            Transport::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
            Transport::Tcp(s) => s.flush(),
        }
    }
}

impl Source for Transport {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Unix(s) => s.register(registry, token, interests),
            Transport::Tcp(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Unix(s) => s.reregister(registry, token, interests),
            Transport::Tcp(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Unix(s) => s.deregister(registry),
            Transport::Tcp(s) => s.deregister(registry),
        }
    }
}
