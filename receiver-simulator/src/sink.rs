// 接收机模拟器 - 数据输出
//
// TCP 方式下每个连接的客户端从广播通道取数据，慢客户端丢失的部分直接跳过；
// 文件方式下追加写入。

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

pub enum Sink {
    Tcp(TcpFanout),
    File(File),
}

impl Sink {
    pub async fn tcp(addr: SocketAddr) -> Result<Self> {
        let fanout = TcpFanout::bind(addr).await?;
        info!("✓ Listening on {}", fanout.local_addr());
        Ok(Sink::Tcp(fanout))
    }

    pub async fn file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        info!("✓ Writing to {}", path.display());
        Ok(Sink::File(file))
    }

    pub async fn send(&mut self, data: Vec<u8>) -> Result<()> {
        match self {
            Sink::Tcp(fanout) => {
                if fanout.clients() == 0 {
                    debug!("no client connected, {} bytes dropped", data.len());
                }
                fanout.send(data);
                Ok(())
            }
            Sink::File(file) => {
                file.write_all(&data).await?;
                Ok(())
            }
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let Sink::File(file) = self {
            file.flush().await?;
        }
        Ok(())
    }
}

/// 接受 TCP 连接并把数据广播给所有客户端
pub struct TcpFanout {
    tx: broadcast::Sender<Arc<Vec<u8>>>,
    local_addr: SocketAddr,
}

impl TcpFanout {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        let accept_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        info!("Client connected: {}", peer);
                        tokio::spawn(serve_client(socket, peer, accept_tx.subscribe()));
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                }
            }
        });

        Ok(Self { tx, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn clients(&self) -> usize {
        self.tx.receiver_count()
    }

    /// 没有客户端时数据直接丢弃
    pub fn send(&self, data: Vec<u8>) {
        let _ = self.tx.send(Arc::new(data));
    }
}

async fn serve_client(
    mut socket: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
) {
    loop {
        match rx.recv().await {
            Ok(data) => {
                if let Err(e) = socket.write_all(&data).await {
                    info!("Client {} disconnected: {}", peer, e);
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("client {} lagged, skipped {} chunk(s)", peer, n);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn test_tcp_fanout_reaches_every_client() {
        let fanout = TcpFanout::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = fanout.local_addr();
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();

        // 等待两个连接都已订阅
        for _ in 0..100 {
            if fanout.clients() == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fanout.clients(), 2);

        fanout.send(b"frame".to_vec());
        for client in [&mut a, &mut b] {
            let mut buf = [0u8; 5];
            timeout(Duration::from_secs(5), client.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf, b"frame");
        }
    }

    #[tokio::test]
    async fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut sink = Sink::file(&path).await.unwrap();
        sink.send(b"ab".to_vec()).await.unwrap();
        sink.send(b"cd".to_vec()).await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
    }
}
