use super::{AccessMode, Stream, StreamState};
use crate::error::StreamError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// 文件端点。只读模式按顺序回放文件内容，写模式新建（截断）文件
pub struct FileStream {
    path: PathBuf,
    file: Option<File>,
    mode: AccessMode,
}

impl FileStream {
    pub fn open(path: &str, mode: AccessMode) -> Result<Self, StreamError> {
        if path.trim().is_empty() {
            return Err(StreamError::InvalidPath("empty file path".into()));
        }
        let path = PathBuf::from(path);

        let file = if mode.writable() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .read(mode.readable())
                .open(&path)?
        } else {
            File::open(&path)?
        };

        Ok(Self {
            path,
            file: Some(file),
            mode,
        })
    }
}

impl Stream for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) if self.mode.readable() => file.read(buf),
            _ => Ok(0),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) if self.mode.writable() => {
                file.write_all(data)?;
                Ok(data.len())
            }
            _ => Ok(0),
        }
    }

    fn state(&self) -> StreamState {
        if self.file.is_some() {
            StreamState::Connected
        } else {
            StreamState::Closed
        }
    }

    fn describe(&self) -> String {
        String::new()
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}
