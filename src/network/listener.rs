use std::io::{self, ErrorKind};
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::AppResult;

/// Non-blocking listening socket bound with an explicit accept backlog.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub fn bind(addr: SocketAddr, backlog: u32) -> AppResult<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;

        let inner = TcpListener::from_std(socket.into());
        let local_addr = inner.local_addr()?;
        info!(%local_addr, backlog, "tcp listener bound");
        Ok(Listener { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// One accept attempt; `None` once the kernel queue is empty.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer_addr)) => {
                    stream.set_nodelay(true)?;
                    return Ok(Some((stream, peer_addr)));
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn source(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}
