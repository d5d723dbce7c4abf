use super::{Stream, StreamState};
use crate::error::StreamError;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_CLIENTS: usize = 16;

fn would_block(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn check_address(path: &str) -> Result<(), StreamError> {
    match path.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(StreamError::InvalidPath(format!(
            "expected host:port, got '{}'",
            path
        ))),
    }
}

/// 建立一次连接，在后台线程中调用
pub type Connector = Arc<dyn Fn(&str) -> io::Result<TcpStream> + Send + Sync>;

/// 解析地址并依次尝试每个结果
fn connect_any(address: &str) -> io::Result<TcpStream> {
    let mut last = io::Error::new(ErrorKind::NotFound, format!("{} resolved to nothing", address));
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                debug!("tcp client connect {} failed: {}", addr, e);
                last = e;
            }
        }
    }
    Err(last)
}

/// TCP 客户端。连接失败不视为打开失败，每秒最多重连一次
///
/// 地址解析和连接在后台线程中进行，read/write 只检查结果，从不等待。
pub struct TcpClientStream {
    address: String,
    socket: Option<TcpStream>,
    connector: Connector,
    pending: Option<Receiver<io::Result<TcpStream>>>,
    last_attempt: Option<Instant>,
    message: String,
}

impl TcpClientStream {
    pub fn open(path: &str) -> Result<Self, StreamError> {
        Self::with_connector(path, Arc::new(connect_any))
    }

    pub fn with_connector(path: &str, connector: Connector) -> Result<Self, StreamError> {
        check_address(path)?;
        let mut stream = Self {
            address: path.to_string(),
            socket: None,
            connector,
            pending: None,
            last_attempt: None,
            message: format!("{} waiting", path),
        };
        stream.try_connect();
        Ok(stream)
    }

    /// 收取后台连接的结果；没有进行中的连接且距上次尝试已满间隔时发起新连接
    fn try_connect(&mut self) {
        if let Some(rx) = self.pending.as_ref() {
            match rx.try_recv() {
                Ok(Ok(socket)) => {
                    self.pending = None;
                    self.attach(socket);
                }
                Ok(Err(e)) => {
                    self.pending = None;
                    debug!("tcp client {} connect failed: {}", self.address, e);
                    self.message = format!("{} waiting", self.address);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => self.pending = None,
            }
            return;
        }
        if let Some(last) = self.last_attempt {
            if last.elapsed() < RECONNECT_INTERVAL {
                return;
            }
        }
        self.last_attempt = Some(Instant::now());

        let (tx, rx) = mpsc::channel();
        let address = self.address.clone();
        let connector = Arc::clone(&self.connector);
        let spawned = thread::Builder::new()
            .name("tcp-connect".to_string())
            .spawn(move || {
                let _ = tx.send(connector(&address));
            });
        match spawned {
            Ok(_) => self.pending = Some(rx),
            Err(e) => warn!("tcp client {}: connector thread failed: {}", self.address, e),
        }
    }

    fn attach(&mut self, socket: TcpStream) {
        if let Err(e) = socket.set_nonblocking(true) {
            warn!("tcp client {}: set_nonblocking failed: {}", self.address, e);
            return;
        }
        let _ = socket.set_nodelay(true);
        info!("tcp client connected to {}", self.address);
        self.message = format!("{} connected", self.address);
        self.socket = Some(socket);
    }

    fn disconnect(&mut self, reason: &str) {
        if self.socket.take().is_some() {
            info!("tcp client {} disconnected: {}", self.address, reason);
        }
        self.message = format!("{} waiting", self.address);
    }
}

impl Stream for TcpClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.socket.is_none() {
            self.try_connect();
        }
        let Some(socket) = self.socket.as_mut() else {
            return Ok(0);
        };
        match socket.read(buf) {
            Ok(0) => {
                self.disconnect("closed by peer");
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => {
                self.disconnect(&e.to_string());
                Ok(0)
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.socket.is_none() {
            self.try_connect();
        }
        let Some(socket) = self.socket.as_mut() else {
            return Ok(0);
        };
        match socket.write(data) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => {
                self.disconnect(&e.to_string());
                Ok(0)
            }
        }
    }

    fn state(&self) -> StreamState {
        if self.socket.is_some() {
            StreamState::Connected
        } else {
            StreamState::Waiting
        }
    }

    fn describe(&self) -> String {
        self.message.clone()
    }

    fn close(&mut self) {
        self.socket = None;
        self.pending = None;
    }
}

/// TCP 服务端。在每次读写时接受新客户端，写入广播给所有客户端
pub struct TcpServerStream {
    address: String,
    listener: TcpListener,
    clients: Vec<(TcpStream, SocketAddr)>,
}

impl TcpServerStream {
    /// path 为 "host:port" 或 ":port"
    pub fn open(path: &str) -> Result<Self, StreamError> {
        check_address(path)?;
        let bind = if path.starts_with(':') {
            format!("0.0.0.0{}", path)
        } else {
            path.to_string()
        };
        let listener = TcpListener::bind(&bind)?;
        listener.set_nonblocking(true)?;
        info!("tcp server listening on {}", bind);
        Ok(Self {
            address: bind,
            listener,
            clients: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    if self.clients.len() >= MAX_CLIENTS {
                        warn!("tcp server {}: too many clients, rejecting {}", self.address, peer);
                        continue;
                    }
                    if socket.set_nonblocking(true).is_err() {
                        continue;
                    }
                    info!("tcp server {}: client {} connected", self.address, peer);
                    self.clients.push((socket, peer));
                }
                Err(e) if would_block(&e) => break,
                Err(e) => {
                    warn!("tcp server {}: accept error: {}", self.address, e);
                    break;
                }
            }
        }
    }
}

impl Stream for TcpServerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.accept_pending();
        let mut received = 0;
        self.clients.retain_mut(|(socket, peer)| {
            if received > 0 {
                return true;
            }
            match socket.read(buf) {
                Ok(0) => {
                    info!("tcp server: client {} disconnected", peer);
                    false
                }
                Ok(n) => {
                    received = n;
                    true
                }
                Err(e) if would_block(&e) => true,
                Err(e) => {
                    info!("tcp server: client {} dropped: {}", peer, e);
                    false
                }
            }
        });
        Ok(received)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.accept_pending();
        if self.clients.is_empty() {
            return Ok(0);
        }
        self.clients.retain_mut(|(socket, peer)| match socket.write_all(data) {
            Ok(()) => true,
            Err(e) if would_block(&e) => true,
            Err(e) => {
                info!("tcp server: client {} dropped: {}", peer, e);
                false
            }
        });
        Ok(data.len())
    }

    fn state(&self) -> StreamState {
        if self.clients.is_empty() {
            StreamState::Waiting
        } else {
            StreamState::Connected
        }
    }

    fn describe(&self) -> String {
        format!("{} {} client(s)", self.address, self.clients.len())
    }

    fn close(&mut self) {
        self.clients.clear();
    }
}
