use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};

use crate::framing::Port;
use crate::shutdown::ShutdownToken;

/// Filesystem path of the video datagram server socket.
pub const VIDEO_UNIX_PATH: &str = "/tmp/db_bridge_video";
/// Loopback ports the stream modules listen on.
pub const APP_PORT_STATUS: u16 = 1602;
pub const APP_PORT_COMM: u16 = 1603;
pub const APP_PORT_PROXY: u16 = 1605;

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Which local modules the bridge should attach to.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModuleConfig {
    pub video: bool,
    pub communication: bool,
    pub proxy: bool,
    pub status: bool,
}

/// The active local sockets: one datagram server for video, up to three
/// loopback stream clients for the other modules.
pub struct LocalEndpoints {
    video: Option<UnixDatagram>,
    proxy: Option<TcpStream>,
    status: Option<TcpStream>,
    communication: Option<TcpStream>,
}

impl LocalEndpoints {
    /// Opens every configured endpoint. Stream connects retry at 1 Hz until
    /// the peer module is up; returns `None` when shutdown is requested while
    /// still waiting. Datagram socket setup failures are fatal.
    pub fn open(config: &ModuleConfig, shutdown: &ShutdownToken) -> io::Result<Option<Self>> {
        let video = if config.video {
            Some(bind_video_socket()?)
        } else {
            None
        };
        let proxy = match connect_if(config.proxy, "proxy", APP_PORT_PROXY, shutdown) {
            Connect::Ready(sock) => sock,
            Connect::Cancelled => return Ok(None),
        };
        let status = match connect_if(config.status, "status", APP_PORT_STATUS, shutdown) {
            Connect::Ready(sock) => sock,
            Connect::Cancelled => return Ok(None),
        };
        let communication =
            match connect_if(config.communication, "communication", APP_PORT_COMM, shutdown) {
                Connect::Ready(sock) => sock,
                Connect::Cancelled => return Ok(None),
            };
        Ok(Some(Self {
            video,
            proxy,
            status,
            communication,
        }))
    }

    /// Active endpoints in their fixed registry order.
    pub fn active(&self) -> Vec<(Port, RawFd)> {
        let mut out = Vec::new();
        if let Some(sock) = &self.video {
            out.push((Port::Video, sock.as_raw_fd()));
        }
        if let Some(sock) = &self.proxy {
            out.push((Port::Proxy, sock.as_raw_fd()));
        }
        if let Some(sock) = &self.status {
            out.push((Port::Status, sock.as_raw_fd()));
        }
        if let Some(sock) = &self.communication {
            out.push((Port::Comm, sock.as_raw_fd()));
        }
        out
    }

    /// Reads whatever the module has ready, up to `buf.len()` bytes. A video
    /// read consumes exactly one datagram.
    pub fn read_into(&self, port: Port, buf: &mut [u8]) -> io::Result<usize> {
        match port {
            Port::Video => match &self.video {
                Some(sock) => sock.recv(buf),
                None => Ok(0),
            },
            Port::Proxy => read_stream(self.proxy.as_ref(), buf),
            Port::Status => read_stream(self.status.as_ref(), buf),
            Port::Comm => read_stream(self.communication.as_ref(), buf),
            Port::TimeoutWake => Ok(0),
        }
    }

    /// Delivers an inbound frame payload to the module owning `port`.
    pub fn route(&self, port: u8, payload: &[u8]) {
        match Port::from_byte(port) {
            Some(Port::Video) => error!("video module does not accept incoming data"),
            Some(Port::Proxy) => self.deliver("proxy", self.proxy.as_ref(), payload),
            Some(Port::Status) => self.deliver("status", self.status.as_ref(), payload),
            Some(Port::Comm) => {
                self.deliver("communication", self.communication.as_ref(), payload)
            }
            // Wake frames only exist to unblock the accessory-side reader.
            Some(Port::TimeoutWake) => {}
            None => error!("unknown destination port {port}"),
        }
    }

    fn deliver(&self, name: &str, sock: Option<&TcpStream>, payload: &[u8]) {
        let Some(sock) = sock else {
            debug!("dropping {} byte(s) for inactive {name} module", payload.len());
            return;
        };
        let mut writer = sock;
        if let Err(err) = writer.write_all(payload) {
            error!("sending to {name} module failed: {err}");
        }
    }
}

impl Drop for LocalEndpoints {
    fn drop(&mut self) {
        for sock in [&self.proxy, &self.status, &self.communication]
            .into_iter()
            .flatten()
        {
            let _ = sock.shutdown(Shutdown::Both);
        }
        if self.video.is_some() {
            let _ = fs::remove_file(VIDEO_UNIX_PATH);
        }
    }
}

enum Connect {
    Ready(Option<TcpStream>),
    Cancelled,
}

fn connect_if(enabled: bool, name: &str, port: u16, shutdown: &ShutdownToken) -> Connect {
    if !enabled {
        return Connect::Ready(None);
    }
    match connect_loopback(name, port, shutdown) {
        Some(sock) => Connect::Ready(Some(sock)),
        None => Connect::Cancelled,
    }
}

fn connect_loopback(name: &str, port: u16, shutdown: &ShutdownToken) -> Option<TcpStream> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    while !shutdown.is_triggered() {
        match TcpStream::connect(addr) {
            Ok(sock) => {
                info!("connected to {name} module on port {port}");
                return Some(sock);
            }
            Err(err) => {
                error!("connection to {name} module on port {port} failed: {err}");
                thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
    None
}

fn bind_video_socket() -> io::Result<UnixDatagram> {
    let path = Path::new(VIDEO_UNIX_PATH);
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let sock = UnixDatagram::bind(path)?;
    info!("video socket listening at {}", path.display());
    Ok(sock)
}

fn read_stream(sock: Option<&TcpStream>, buf: &mut [u8]) -> io::Result<usize> {
    match sock {
        Some(sock) => {
            let mut reader = sock;
            reader.read(buf)
        }
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn endpoints_with_proxy() -> (LocalEndpoints, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        let endpoints = LocalEndpoints {
            video: None,
            proxy: Some(client),
            status: None,
            communication: None,
        };
        (endpoints, server_side)
    }

    #[test]
    fn routes_proxy_payload_to_stream() {
        let (endpoints, mut peer) = endpoints_with_proxy();
        endpoints.route(Port::Proxy.byte(), b"hello");
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn video_and_unknown_ports_are_dropped() {
        let (endpoints, mut peer) = endpoints_with_proxy();
        endpoints.route(Port::Video.byte(), b"frame");
        endpoints.route(Port::TimeoutWake.byte(), &[0]);
        endpoints.route(0x7f, b"???");
        // Nothing may reach the stream.
        peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut buf = [0u8; 8];
        assert!(peer.read(&mut buf).is_err());
    }

    #[test]
    fn inactive_module_drops_payload() {
        let (endpoints, _peer) = endpoints_with_proxy();
        // Status is inactive in this configuration.
        endpoints.route(Port::Status.byte(), b"status line");
    }

    #[test]
    fn video_read_consumes_one_datagram() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.sock");
        let server = UnixDatagram::bind(&path).unwrap();
        let client = UnixDatagram::unbound().unwrap();
        client.send_to(b"nal-unit", &path).unwrap();

        let endpoints = LocalEndpoints {
            video: Some(server),
            proxy: None,
            status: None,
            communication: None,
        };
        let mut buf = [0u8; 64];
        let n = endpoints.read_into(Port::Video, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"nal-unit");
        // Avoid unlinking the fixed path from the drop impl in tests.
        std::mem::forget(endpoints);
    }

    #[test]
    fn registry_order_is_fixed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let comm = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let endpoints = LocalEndpoints {
            video: None,
            proxy: Some(proxy),
            status: None,
            communication: Some(comm),
        };
        let order: Vec<Port> = endpoints.active().into_iter().map(|(p, _)| p).collect();
        assert_eq!(order, vec![Port::Proxy, Port::Comm]);
    }
}
