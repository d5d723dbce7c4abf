// 闪烁监测服务器 - 解码分派
//
// 每路输入拥有一个解码器。解码器每次处理 peek 缓冲的全部内容，
// 报告本次得到的有效帧数并缓存解出的测量记录。

use crate::error::{Result, ServerError};
use chrono::{DateTime, Utc};
use common::{scan_frames, Measurement};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, trace, warn};

const DEFAULT_MAX_RECORDS: usize = 4096;

/// 输入数据格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// 参考测量帧（0x01AA 帧头）
    #[default]
    Framed,
    /// 只转发和记录原始数据，不产生测量记录
    Passthrough,
}

/// 帧解码器
///
/// 有效帧计数和已解出的记录在多次 decode 之间累积，直到 reset。
/// peek 缓冲被清空时解码器随之复位。
pub trait FrameDecoder: Send {
    /// 解码整段缓冲，返回本次得到的有效帧数
    fn decode(&mut self, bytes: &[u8]) -> usize;
    /// 上次复位以来累积的有效帧数
    fn valid_frames(&self) -> usize;
    /// 取走已解出的测量记录
    fn take_records(&mut self) -> Vec<Measurement>;
    fn reset(&mut self);
}

pub trait DecoderFactory: Send + Sync {
    fn create(
        &self,
        index: usize,
        format: InputFormat,
        options: &str,
    ) -> Result<Box<dyn FrameDecoder>>;
}

/// 参考测量帧解码器
#[derive(Debug)]
pub struct FramedDecoder {
    valid_frames: usize,
    records: Vec<Measurement>,
    max_records: usize,
}

impl FramedDecoder {
    /// options 支持 "-MAXREC=<n>"：缓存记录数上限
    pub fn new(options: &str) -> std::result::Result<Self, String> {
        let mut max_records = DEFAULT_MAX_RECORDS;
        for opt in options.split_whitespace() {
            match opt.split_once('=') {
                Some(("-MAXREC", value)) => {
                    max_records = value
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| format!("bad -MAXREC value '{}'", value))?;
                }
                _ => debug!("ignoring receiver option {}", opt),
            }
        }
        Ok(Self {
            valid_frames: 0,
            records: Vec::new(),
            max_records,
        })
    }
}

impl FrameDecoder for FramedDecoder {
    fn decode(&mut self, bytes: &[u8]) -> usize {
        let result = scan_frames(bytes);
        let found = result.frames.len();
        self.valid_frames += found;
        if result.rejected > 0 {
            debug!("{} candidate frame(s) failed validation", result.rejected);
        }
        if found > 0 && result.consumed < bytes.len() {
            trace!("{} trailing byte(s) hold an incomplete frame", bytes.len() - result.consumed);
        }

        let room = self.max_records.saturating_sub(self.records.len());
        if result.frames.len() > room {
            warn!(
                "decoder record buffer full, dropping {} records",
                result.frames.len() - room
            );
        }
        self.records.extend(result.frames.into_iter().take(room));
        found
    }

    fn valid_frames(&self) -> usize {
        self.valid_frames
    }

    fn take_records(&mut self) -> Vec<Measurement> {
        std::mem::take(&mut self.records)
    }

    fn reset(&mut self) {
        self.valid_frames = 0;
        self.records.clear();
    }
}

/// 透传解码器：每段非空数据记作一个已消费单元
#[derive(Debug, Default)]
pub struct PassthroughDecoder {
    valid_frames: usize,
}

impl FrameDecoder for PassthroughDecoder {
    fn decode(&mut self, bytes: &[u8]) -> usize {
        let found = usize::from(!bytes.is_empty());
        self.valid_frames += found;
        found
    }

    fn valid_frames(&self) -> usize {
        self.valid_frames
    }

    fn take_records(&mut self) -> Vec<Measurement> {
        Vec::new()
    }

    fn reset(&mut self) {
        self.valid_frames = 0;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoderFactory;

impl DecoderFactory for DefaultDecoderFactory {
    fn create(
        &self,
        index: usize,
        format: InputFormat,
        options: &str,
    ) -> Result<Box<dyn FrameDecoder>> {
        match format {
            InputFormat::Framed => FramedDecoder::new(options)
                .map(|d| Box::new(d) as Box<dyn FrameDecoder>)
                .map_err(|reason| ServerError::DecoderInit { index, reason }),
            InputFormat::Passthrough => Ok(Box::new(PassthroughDecoder::default())),
        }
    }
}

/// 一次解码的结果
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    pub frames: usize,
    pub records: Vec<Measurement>,
}

/// 解码 peek 缓冲快照。缓冲为空时不调用解码器，直接返回 0 帧；
/// 否则返回解码器累积的有效帧数和全部已解出的记录
pub fn decode_peek(decoder: &mut dyn FrameDecoder, peek: &[u8]) -> DecodeOutcome {
    if peek.is_empty() {
        return DecodeOutcome::default();
    }
    if decoder.decode(peek) == 0 {
        trace!("no valid frames in {} buffered bytes", peek.len());
        return DecodeOutcome::default();
    }
    DecodeOutcome {
        frames: decoder.valid_frames(),
        records: decoder.take_records(),
    }
}

#[derive(Serialize)]
struct MeasurementLogEntry<'a> {
    stream: usize,
    received: DateTime<Utc>,
    record: &'a Measurement,
}

/// 解码记录的 JSON 行日志
pub struct MeasurementLog {
    writer: BufWriter<File>,
}

impl MeasurementLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn write(&mut self, stream: usize, received: DateTime<Utc>, records: &[Measurement]) {
        for record in records {
            let entry = MeasurementLogEntry {
                stream,
                received,
                record,
            };
            let result = serde_json::to_writer(&mut self.writer, &entry)
                .map_err(std::io::Error::from)
                .and_then(|_| self.writer.write_all(b"\n"));
            if let Err(e) = result {
                warn!("measurement log write failed: {}", e);
                return;
            }
        }
        if let Err(e) = self.writer.flush() {
            warn!("measurement log flush failed: {}", e);
        }
    }
}
