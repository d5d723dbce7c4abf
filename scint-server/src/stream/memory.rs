use super::{AccessMode, Stream, StreamState};
use crate::error::StreamError;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;

/// 进程内命名管道集合，供测试和嵌入使用
#[derive(Clone, Default)]
pub struct MemoryHub {
    pipes: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: &str, data: &[u8]) {
        self.pipes
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(data);
    }

    /// 取出最多 max 个字节
    pub fn take(&self, name: &str, max: usize) -> Vec<u8> {
        match self.pipes.get_mut(name) {
            Some(mut pipe) => {
                let n = max.min(pipe.len());
                pipe.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn take_all(&self, name: &str) -> Vec<u8> {
        self.pipes
            .get_mut(name)
            .map(|mut pipe| std::mem::take(&mut *pipe))
            .unwrap_or_default()
    }

    pub fn pending(&self, name: &str) -> usize {
        self.pipes.get(name).map(|pipe| pipe.len()).unwrap_or(0)
    }
}

/// 内存端点。可读端点的写入（命令）进入 "<name>.tx" 管道
pub struct MemoryStream {
    hub: MemoryHub,
    name: String,
    mode: AccessMode,
}

impl MemoryStream {
    pub fn new(hub: MemoryHub, name: &str, mode: AccessMode) -> Result<Self, StreamError> {
        if name.is_empty() {
            return Err(StreamError::InvalidPath("empty memory pipe name".into()));
        }
        Ok(Self {
            hub,
            name: name.to_string(),
            mode,
        })
    }

    fn tx_name(&self) -> String {
        if self.mode.readable() {
            format!("{}.tx", self.name)
        } else {
            self.name.clone()
        }
    }
}

impl Stream for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.mode.readable() {
            return Ok(0);
        }
        let data = self.hub.take(&self.name, buf.len());
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.mode.writable() {
            return Ok(0);
        }
        self.hub.push(&self.tx_name(), data);
        Ok(data.len())
    }

    fn state(&self) -> StreamState {
        StreamState::Connected
    }

    fn describe(&self) -> String {
        format!("memory {}", self.name)
    }
}
