use super::{AccessMode, Stream, StreamState};
use crate::error::StreamError;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_serial::{DataBits, FlowControl, Parity, StopBits};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;
/// 读线程单次阻塞的上限，也是 close 等待读线程退出的上限
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// 串口线路参数
///
/// path 形如 "/dev/ttyUSB0:115200:8:N:1:off"，设备名之后的各项均可省略，
/// 默认 115200 波特、8 数据位、无校验、1 停止位、无流控。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl SerialSettings {
    pub fn parse(path: &str) -> Result<Self, StreamError> {
        let mut fields = path.split(':').map(str::trim);
        let device = fields.next().unwrap_or("").to_string();
        if device.is_empty() {
            return Err(StreamError::InvalidPath("empty serial device".into()));
        }
        let bad = |what: &str, value: &str| {
            StreamError::InvalidPath(format!("bad serial {} '{}' in '{}'", what, value, path))
        };

        let mut settings = Self {
            device,
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        };
        if let Some(value) = fields.next().filter(|v| !v.is_empty()) {
            settings.baud_rate = value
                .parse()
                .ok()
                .filter(|b| *b > 0)
                .ok_or_else(|| bad("baud rate", value))?;
        }
        if let Some(value) = fields.next().filter(|v| !v.is_empty()) {
            settings.data_bits = match value {
                "5" => DataBits::Five,
                "6" => DataBits::Six,
                "7" => DataBits::Seven,
                "8" => DataBits::Eight,
                _ => return Err(bad("data bits", value)),
            };
        }
        if let Some(value) = fields.next().filter(|v| !v.is_empty()) {
            settings.parity = match value.to_ascii_uppercase().as_str() {
                "N" => Parity::None,
                "E" => Parity::Even,
                "O" => Parity::Odd,
                _ => return Err(bad("parity", value)),
            };
        }
        if let Some(value) = fields.next().filter(|v| !v.is_empty()) {
            settings.stop_bits = match value {
                "1" => StopBits::One,
                "2" => StopBits::Two,
                _ => return Err(bad("stop bits", value)),
            };
        }
        if let Some(value) = fields.next().filter(|v| !v.is_empty()) {
            settings.flow_control = match value.to_ascii_lowercase().as_str() {
                "off" => FlowControl::None,
                "rts" => FlowControl::Hardware,
                "xon" => FlowControl::Software,
                _ => return Err(bad("flow control", value)),
            };
        }
        Ok(settings)
    }
}

/// 串口端点
///
/// 设备读取在独立线程中进行，每次最多阻塞 READ_TIMEOUT，数据经通道交给
/// 非阻塞的 read。close 或 drop 时通知读线程退出并等待它结束。
pub struct SerialStream {
    device: String,
    writer: Option<Box<dyn Write + Send>>,
    rx: Option<Receiver<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    pending: Vec<u8>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl SerialStream {
    pub fn open(path: &str, mode: AccessMode) -> Result<Self, StreamError> {
        let settings = SerialSettings::parse(path)?;
        let port = tokio_serial::new(&settings.device, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .flow_control(settings.flow_control)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(io::Error::from)?;
        info!(
            "serial {} opened at {} baud ({:?} {:?} {:?})",
            settings.device,
            settings.baud_rate,
            settings.data_bits,
            settings.parity,
            settings.stop_bits
        );

        let reader: Option<Box<dyn Read + Send>> = if mode.readable() {
            Some(Box::new(port.try_clone().map_err(io::Error::from)?))
        } else {
            None
        };
        let writer: Option<Box<dyn Write + Send>> = if mode.writable() {
            let mut port = port;
            port.set_timeout(WRITE_TIMEOUT).map_err(io::Error::from)?;
            Some(Box::new(port))
        } else {
            None
        };
        Self::from_parts(settings.device, reader, writer).map_err(StreamError::from)
    }

    /// 用已打开的读写端组装端点，读端交给后台线程
    fn from_parts(
        device: String,
        reader: Option<Box<dyn Read + Send>>,
        writer: Option<Box<dyn Write + Send>>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let (rx, reader) = match reader {
            Some(port) => {
                let (tx, rx) = mpsc::channel();
                let handle = thread::Builder::new()
                    .name(format!("serial-{}", device.rsplit('/').next().unwrap_or("dev")))
                    .spawn({
                        let device = device.clone();
                        let stop = stop.clone();
                        let failed = failed.clone();
                        move || pump(device, port, tx, stop, failed)
                    })?;
                (Some(rx), Some(handle))
            }
            None => (None, None),
        };
        Ok(Self {
            device,
            writer,
            rx,
            reader,
            pending: Vec::new(),
            stop,
            failed,
        })
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("serial reader {} panicked", self.device);
            }
        }
        self.rx = None;
        self.writer = None;
    }
}

/// 读线程主体：读到的数据发往通道，直到 stop 被置位、通道关闭或读出错
fn pump(
    device: String,
    mut port: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READ_CHUNK];
    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => thread::sleep(Duration::from_millis(10)),
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                warn!("serial {} read error: {}", device, e);
                failed.store(true, Ordering::Relaxed);
                break;
            }
        }
    }
    debug!("serial reader {} exiting", device);
}

impl Stream for SerialStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(rx) = self.rx.as_ref() {
            while self.pending.len() < buf.len() {
                match rx.try_recv() {
                    Ok(chunk) => self.pending.extend_from_slice(&chunk),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(0);
        };
        match writer.write(data) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn state(&self) -> StreamState {
        if self.failed.load(Ordering::Relaxed) {
            StreamState::Error
        } else {
            StreamState::Connected
        }
    }

    fn describe(&self) -> String {
        if self.failed.load(Ordering::Relaxed) {
            format!("{} read error", self.device)
        } else {
            String::new()
        }
    }

    fn close(&mut self) {
        self.shutdown();
    }
}

impl Drop for SerialStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// 模拟串口读端：先依次给出预置数据，之后每次读都超时
    struct ScriptedLine {
        chunks: VecDeque<Vec<u8>>,
        _alive: Arc<()>,
    }

    impl ScriptedLine {
        fn new(chunks: &[&[u8]], alive: &Arc<()>) -> Box<dyn Read + Send> {
            Box::new(Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
                _alive: alive.clone(),
            })
        }
    }

    impl Read for ScriptedLine {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => {
                    thread::sleep(Duration::from_millis(5));
                    Err(io::Error::new(ErrorKind::TimedOut, "operation timed out"))
                }
            }
        }
    }

    fn collect(stream: &mut SerialStream, want: usize) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 4];
        for _ in 0..400 {
            let n = stream.read(&mut buf).unwrap();
            collected.extend_from_slice(&buf[..n]);
            if collected.len() >= want {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        collected
    }

    #[test]
    fn test_parse_settings() {
        let s = SerialSettings::parse("/dev/ttyUSB0").unwrap();
        assert_eq!(s.device, "/dev/ttyUSB0");
        assert_eq!(s.baud_rate, 115_200);
        assert_eq!(s.data_bits, DataBits::Eight);
        assert_eq!(s.parity, Parity::None);

        let s = SerialSettings::parse("ttyS1:9600:7:e:2:rts").unwrap();
        assert_eq!(s.device, "ttyS1");
        assert_eq!(s.baud_rate, 9600);
        assert_eq!(s.data_bits, DataBits::Seven);
        assert_eq!(s.parity, Parity::Even);
        assert_eq!(s.stop_bits, StopBits::Two);
        assert_eq!(s.flow_control, FlowControl::Hardware);

        assert!(SerialSettings::parse(":9600").is_err());
        assert!(SerialSettings::parse("ttyS1:fast").is_err());
        assert!(SerialSettings::parse("ttyS1:9600:9").is_err());
        assert!(SerialSettings::parse("ttyS1:9600:8:X").is_err());
    }

    #[test]
    fn test_open_missing_device_fails() {
        assert!(SerialStream::open("/dev/does-not-exist-scint:115200", AccessMode::Read).is_err());
        assert!(SerialStream::open(":9600", AccessMode::Read).is_err());
    }

    #[test]
    fn test_reader_thread_pumps_chunks() {
        let alive = Arc::new(());
        let line = ScriptedLine::new(&[b"01234", b"56789"], &alive);
        let mut stream = SerialStream::from_parts("ttyT0".into(), Some(line), None).unwrap();

        assert_eq!(collect(&mut stream, 10), b"0123456789");
        assert_eq!(stream.state(), StreamState::Connected);
        assert_eq!(stream.write(b"LOG").unwrap(), 0);
        stream.close();
    }

    #[test]
    fn test_close_joins_idle_reader() {
        let alive = Arc::new(());
        let line = ScriptedLine::new(&[], &alive);
        let mut stream = SerialStream::from_parts("ttyT1".into(), Some(line), None).unwrap();
        assert_eq!(Arc::strong_count(&alive), 2);

        // 线路空闲时读线程一直处在超时重读中，close 返回时必须已经退出
        stream.close();
        assert!(stream.reader.is_none());
        assert_eq!(Arc::strong_count(&alive), 1);
    }

    #[test]
    fn test_drop_joins_reader() {
        let alive = Arc::new(());
        let line = ScriptedLine::new(&[b"abc"], &alive);
        let stream = SerialStream::from_parts("ttyT2".into(), Some(line), None).unwrap();
        drop(stream);
        assert_eq!(Arc::strong_count(&alive), 1);
    }

    #[test]
    fn test_read_error_marks_stream_failed() {
        struct BrokenLine;
        impl Read for BrokenLine {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(ErrorKind::BrokenPipe, "device unplugged"))
            }
        }

        let mut stream =
            SerialStream::from_parts("ttyT3".into(), Some(Box::new(BrokenLine)), None).unwrap();
        for _ in 0..200 {
            if stream.state() == StreamState::Error {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stream.state(), StreamState::Error);
        assert_eq!(stream.describe(), "ttyT3 read error");
        stream.close();
    }
}
