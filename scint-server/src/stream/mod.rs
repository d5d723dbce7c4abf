// 闪烁监测服务器 - 数据流端点
//
// 服务器固定管理 9 个端点：
//   0..2  输入流（主接收机、参考接收机、改正数）
//   3..4  解输出流
//   5..7  输入 0..2 的原始数据日志
//   8     监视流（可选）
//
// 每个端点有独立的锁。加锁顺序固定为 服务器锁 -> 端点锁。

pub mod file;
pub mod memory;
pub mod serial;
pub mod tcp;

use crate::clock::Clock;
use crate::command::{parse_command, CommandLine};
use crate::error::StreamError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use file::FileStream;
pub use memory::{MemoryHub, MemoryStream};
pub use serial::SerialStream;
pub use tcp::{TcpClientStream, TcpServerStream};

pub const NUM_STREAMS: usize = 9;
pub const NUM_INPUTS: usize = 3;
pub const NUM_OUTPUTS: usize = 2;
/// 第一个解输出流
pub const FIRST_OUTPUT: usize = 3;
/// 第一个原始日志流
pub const FIRST_LOG: usize = 5;
pub const MONITOR_STREAM: usize = 8;

/// 输入流对应的原始日志流
pub const fn log_stream(input: usize) -> usize {
    FIRST_LOG + input
}

/// 端点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    #[default]
    None,
    File,
    Serial,
    TcpClient,
    TcpServer,
    Memory,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::None => "none",
            StreamKind::File => "file",
            StreamKind::Serial => "serial",
            StreamKind::TcpClient => "tcpcli",
            StreamKind::TcpServer => "tcpsvr",
            StreamKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// 输入流可读，非文件输入还需可写以便下发命令；其余端点只写
    pub fn for_slot(index: usize, kind: StreamKind) -> Self {
        if index < NUM_INPUTS {
            if kind == StreamKind::File {
                AccessMode::Read
            } else {
                AccessMode::ReadWrite
            }
        } else {
            AccessMode::Write
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// 端点连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamState {
    #[default]
    Closed,
    Waiting,
    Connected,
    Error,
}

impl StreamState {
    /// 数值状态：-1 错误，0 关闭，1 等待，2 已连接
    pub fn code(self) -> i32 {
        match self {
            StreamState::Error => -1,
            StreamState::Closed => 0,
            StreamState::Waiting => 1,
            StreamState::Connected => 2,
        }
    }
}

/// 非阻塞字节流端点
///
/// read 在无数据时立即返回 0；write 尽力写出，返回实际写出的字节数。
pub trait Stream: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
    fn state(&self) -> StreamState;
    /// 状态消息，空串表示无可报告内容
    fn describe(&self) -> String;
    fn close(&mut self) {}
}

/// 端点描述
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamDescriptor {
    pub index: usize,
    pub kind: StreamKind,
    pub path: String,
    pub mode: Option<AccessMode>,
    pub state: StreamState,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub message: String,
}

/// 端点工厂
pub trait StreamFactory: Send + Sync {
    fn open(
        &self,
        index: usize,
        kind: StreamKind,
        path: &str,
        mode: AccessMode,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn Stream>, StreamError>;
}

/// 按端点类型打开真实的文件、串口、TCP 或内存端点
#[derive(Clone, Default)]
pub struct SystemStreamFactory {
    hub: MemoryHub,
}

impl SystemStreamFactory {
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl StreamFactory for SystemStreamFactory {
    fn open(
        &self,
        _index: usize,
        kind: StreamKind,
        path: &str,
        mode: AccessMode,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn Stream>, StreamError> {
        let stream: Box<dyn Stream> = match kind {
            StreamKind::None => return Err(StreamError::Unsupported(kind.to_string())),
            StreamKind::File => Box::new(FileStream::open(
                &common::utils::expand_time_keywords(path, &now),
                mode,
            )?),
            StreamKind::Serial => Box::new(SerialStream::open(path, mode)?),
            StreamKind::TcpClient => Box::new(TcpClientStream::open(path)?),
            StreamKind::TcpServer => Box::new(TcpServerStream::open(path)?),
            StreamKind::Memory => Box::new(MemoryStream::new(self.hub.clone(), path, mode)?),
        };
        Ok(stream)
    }
}

struct Slot {
    descriptor: StreamDescriptor,
    stream: Option<Box<dyn Stream>>,
}

/// 全部端点的集合
pub struct StreamSet {
    slots: Vec<Mutex<Slot>>,
    clock: Arc<dyn Clock>,
}

impl StreamSet {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let slots = (0..NUM_STREAMS)
            .map(|index| {
                Mutex::new(Slot {
                    descriptor: StreamDescriptor {
                        index,
                        ..Default::default()
                    },
                    stream: None,
                })
            })
            .collect();
        Self { slots, clock }
    }

    /// 打开端点。类型为 None 时视为成功但不建立连接；端点已打开时返回 Busy，
    /// 原有连接保持不变
    pub fn open(
        &self,
        index: usize,
        kind: StreamKind,
        path: &str,
        factory: &dyn StreamFactory,
    ) -> Result<(), StreamError> {
        let slot = self.slot(index)?;
        let mode = AccessMode::for_slot(index, kind);
        let now = self.clock.now();
        let mut slot = slot.lock();
        if slot.stream.is_some() {
            return Err(StreamError::Busy);
        }

        slot.descriptor = StreamDescriptor {
            index,
            kind,
            path: path.to_string(),
            mode: Some(mode),
            ..Default::default()
        };
        if kind == StreamKind::None {
            return Ok(());
        }

        let stream = factory.open(index, kind, path, mode, now)?;
        slot.descriptor.state = stream.state();
        slot.descriptor.message = stream.describe();
        slot.descriptor.opened_at = Some(now);
        slot.stream = Some(stream);
        debug!("Stream {} opened: {} {}", index, kind, path);
        Ok(())
    }

    pub fn close(&self, index: usize) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        let mut slot = slot.lock();
        if let Some(mut stream) = slot.stream.take() {
            stream.close();
            debug!("Stream {} closed", index);
        }
        slot.descriptor.state = StreamState::Closed;
        slot.descriptor.message.clear();
    }

    pub fn close_all(&self) {
        for index in 0..NUM_STREAMS {
            self.close(index);
        }
    }

    pub fn is_open(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .map(|slot| slot.lock().stream.is_some())
            .unwrap_or(false)
    }

    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().stream.is_some())
            .count()
    }

    /// 非阻塞读取，无数据、未打开或出错时返回 0
    pub fn read(&self, index: usize, buf: &mut [u8]) -> usize {
        let Some(slot) = self.slots.get(index) else {
            return 0;
        };
        let mut slot = slot.lock();
        let Slot { descriptor, stream } = &mut *slot;
        let Some(stream) = stream.as_mut() else {
            return 0;
        };

        match stream.read(buf) {
            Ok(n) => {
                if n > 0 {
                    descriptor.rx_bytes += n as u64;
                    descriptor.last_activity = Some(self.clock.now());
                }
                descriptor.state = stream.state();
                n
            }
            Err(e) => {
                warn!("Stream {} read error: {}", index, e);
                descriptor.state = StreamState::Error;
                descriptor.message = e.to_string();
                0
            }
        }
    }

    /// 尽力写出，返回实际写出的字节数
    pub fn write(&self, index: usize, data: &[u8]) -> usize {
        let Some(slot) = self.slots.get(index) else {
            return 0;
        };
        let mut slot = slot.lock();
        let Slot { descriptor, stream } = &mut *slot;
        let Some(stream) = stream.as_mut() else {
            return 0;
        };

        match stream.write(data) {
            Ok(n) => {
                if n > 0 {
                    descriptor.tx_bytes += n as u64;
                    descriptor.last_activity = Some(self.clock.now());
                }
                descriptor.state = stream.state();
                n
            }
            Err(e) => {
                warn!("Stream {} write error: {}", index, e);
                descriptor.state = StreamState::Error;
                descriptor.message = e.to_string();
                0
            }
        }
    }

    /// 发送命令文本，每行以 CRLF 结尾，!WAIT 行在两次写之间等待
    pub fn send_command(&self, index: usize, text: &str) {
        for line in parse_command(text) {
            match line {
                CommandLine::Wait(ms) => self.clock.sleep(Duration::from_millis(ms)),
                CommandLine::Send(cmd) => {
                    let mut bytes = cmd.into_bytes();
                    bytes.extend_from_slice(b"\r\n");
                    self.write(index, &bytes);
                }
            }
        }
    }

    pub fn descriptor(&self, index: usize) -> Option<StreamDescriptor> {
        let slot = self.slots.get(index)?;
        let slot = slot.lock();
        let mut descriptor = slot.descriptor.clone();
        if let Some(stream) = slot.stream.as_ref() {
            descriptor.state = stream.state();
            descriptor.message = stream.describe();
        }
        Some(descriptor)
    }

    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        (0..NUM_STREAMS).filter_map(|i| self.descriptor(i)).collect()
    }

    /// 汇总状态字符串："(n) 消息 "，n 为 1 起始的流序号
    pub fn summary(&self) -> String {
        self.descriptors()
            .iter()
            .filter(|d| !d.message.is_empty())
            .map(|d| format!("({}) {} ", d.index + 1, d.message))
            .collect()
    }

    fn slot(&self, index: usize) -> Result<&Mutex<Slot>, StreamError> {
        self.slots
            .get(index)
            .ok_or_else(|| StreamError::InvalidPath(format!("no stream slot {}", index)))
    }
}
