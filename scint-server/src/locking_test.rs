// 锁纪律与并发测试：端点 I/O、测量日志和闪烁计算都不占用服务器锁

use crate::clock::Clock;
use crate::config::StreamSpec;
use crate::decode::{DecoderFactory, FrameDecoder, FramedDecoder, InputFormat};
use crate::error::{Result, ScintError, ServerError, StreamError};
use crate::lifecycle_test::{manual_clock, memory_options, IdleSpawner};
use crate::scint::{CalculatorFactory, ScintCalculator, ScintOptions, ScintWindow, TriggerMode};
use crate::server::{Collaborators, Server};
use crate::stream::{
    log_stream, AccessMode, MemoryHub, Stream, StreamFactory, StreamKind, StreamState,
    SystemStreamFactory,
};
use chrono::{DateTime, TimeZone, Utc};
use common::{encode_frame, Ephemeris, Measurement, ScintRecord};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// 入口信号和放行信号
type Gate = (Sender<()>, Receiver<()>);

fn new_gate() -> (Gate, Receiver<()>, Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    ((entered_tx, release_rx), entered_rx, release_tx)
}

fn pass_gate(gate: Gate) {
    let (entered, release) = gate;
    let _ = entered.send(());
    let _ = release.recv_timeout(WAIT);
}

/// 第一次写入时停住，直到测试放行
struct GatedStream {
    inner: Box<dyn Stream>,
    gate: Option<Gate>,
}

impl Stream for GatedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if let Some(gate) = self.gate.take() {
            pass_gate(gate);
        }
        self.inner.write(data)
    }

    fn state(&self) -> StreamState {
        self.inner.state()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

struct GatedStreamFactory {
    inner: SystemStreamFactory,
    index: usize,
    gate: Mutex<Option<Gate>>,
}

impl StreamFactory for GatedStreamFactory {
    fn open(
        &self,
        index: usize,
        kind: StreamKind,
        path: &str,
        mode: AccessMode,
        now: DateTime<Utc>,
    ) -> std::result::Result<Box<dyn Stream>, StreamError> {
        let stream = self.inner.open(index, kind, path, mode, now)?;
        if index != self.index {
            return Ok(stream);
        }
        Ok(Box::new(GatedStream {
            inner: stream,
            gate: self.gate.lock().take(),
        }))
    }
}

/// 第一次计算时停住，之后的计算器从不就绪
struct GatedCalculator {
    gate: Option<Gate>,
}

impl ScintCalculator for GatedCalculator {
    fn input(&mut self, _measurement: &Measurement) -> bool {
        false
    }

    fn ready(&self) -> bool {
        self.gate.is_some()
    }

    fn process(&mut self) -> std::result::Result<Vec<ScintRecord>, ScintError> {
        if let Some(gate) = self.gate.take() {
            pass_gate(gate);
        }
        Ok(Vec::new())
    }

    fn window(&self) -> ScintWindow {
        ScintWindow::default()
    }

    fn set_window_start(&mut self, _start: DateTime<Utc>) {}
}

struct GatedCalculatorFactory {
    gate: Mutex<Option<Gate>>,
}

impl CalculatorFactory for GatedCalculatorFactory {
    fn create(
        &self,
        _options: &ScintOptions,
    ) -> std::result::Result<Box<dyn ScintCalculator>, ScintError> {
        Ok(Box::new(GatedCalculator {
            gate: self.gate.lock().take(),
        }))
    }
}

/// 统计复位次数的参考帧解码器
struct CountingDecoder {
    inner: FramedDecoder,
    resets: Arc<AtomicUsize>,
}

impl FrameDecoder for CountingDecoder {
    fn decode(&mut self, bytes: &[u8]) -> usize {
        self.inner.decode(bytes)
    }

    fn valid_frames(&self) -> usize {
        self.inner.valid_frames()
    }

    fn take_records(&mut self) -> Vec<Measurement> {
        self.inner.take_records()
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.inner.reset();
    }
}

struct CountingDecoderFactory {
    resets: Arc<AtomicUsize>,
}

impl DecoderFactory for CountingDecoderFactory {
    fn create(
        &self,
        index: usize,
        _format: InputFormat,
        options: &str,
    ) -> Result<Box<dyn FrameDecoder>> {
        let inner = FramedDecoder::new(options)
            .map_err(|reason| ServerError::DecoderInit { index, reason })?;
        Ok(Box::new(CountingDecoder {
            inner,
            resets: Arc::clone(&self.resets),
        }))
    }
}

fn collaborators(hub: &MemoryHub) -> Collaborators {
    let clock: Arc<dyn Clock> = manual_clock();
    Collaborators::default()
        .with_stream_factory(Arc::new(SystemStreamFactory::new(hub.clone())))
        .with_spawner(Arc::new(IdleSpawner))
        .with_clock(clock)
}

fn gated_server(hub: &MemoryHub, index: usize, gate: Gate) -> Server {
    let factory = GatedStreamFactory {
        inner: SystemStreamFactory::new(hub.clone()),
        index,
        gate: Mutex::new(Some(gate)),
    };
    Server::new(collaborators(hub).with_stream_factory(Arc::new(factory)))
}

fn eph_frame(sat: u16) -> Vec<u8> {
    let t = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    encode_frame(&Measurement::Ephemeris(Ephemeris {
        sat,
        iode: 3,
        toe: t,
        ttr: t,
        health: 0,
    }))
    .unwrap()
}

/// 服务器锁在给定时间内可以拿到
fn state_lock_free(server: &Server) -> bool {
    server
        .inner()
        .state
        .try_lock_for(Duration::from_secs(1))
        .is_some()
}

#[test]
fn test_raw_log_write_runs_outside_server_lock() {
    let hub = MemoryHub::new();
    let (gate, entered, release) = new_gate();
    let server = gated_server(&hub, log_stream(0), gate);
    server.start(&memory_options()).unwrap();
    hub.push("rover", b"raw bytes");

    thread::scope(|s| {
        let worker = s.spawn(|| server.run_cycle());
        entered.recv_timeout(WAIT).unwrap();
        assert!(state_lock_free(&server));
        assert_eq!(server.statistics().cycles, 0);
        release.send(()).unwrap();
        let report = worker.join().unwrap();
        assert_eq!(report.bytes[0], 9);
    });

    assert_eq!(hub.take_all("log1"), b"raw bytes");
    server.stop(&Default::default()).unwrap();
}

#[test]
fn test_stop_commands_sent_outside_server_lock() {
    let hub = MemoryHub::new();
    let (gate, entered, release) = new_gate();
    let server = gated_server(&hub, 0, gate);
    server.start(&memory_options()).unwrap();
    let commands = ["UNLOGALL".to_string(), String::new(), String::new()];

    thread::scope(|s| {
        let stopper = s.spawn(|| server.stop(&commands));
        entered.recv_timeout(WAIT).unwrap();
        assert!(state_lock_free(&server));
        let _ = server.statistics();
        release.send(()).unwrap();
        stopper.join().unwrap().unwrap();
    });

    assert_eq!(hub.take_all("rover.tx"), b"UNLOGALL\r\n");
    assert!(server.resources().is_quiescent());
}

#[test]
fn test_measurement_log_written_outside_server_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meas.jsonl");
    let hub = MemoryHub::new();
    let server = Server::new(collaborators(&hub));
    let mut options = memory_options();
    options.measurement_log = Some(path.clone());
    server.start(&options).unwrap();
    hub.push("rover", &eph_frame(11));

    let inner = server.inner();
    thread::scope(|s| {
        // 占住日志锁，工作线程写日志时会停在这里
        let log_guard = inner.measurement_log.lock();
        let worker = s.spawn(|| server.run_cycle());

        // 解码器被取出说明工作线程正在解码或写日志，此时服务器锁必须空闲
        let mut decoding = false;
        for _ in 0..500 {
            if inner.state.lock().inputs[0].decoder.is_none() {
                decoding = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(decoding);
        assert!(state_lock_free(&server));
        drop(log_guard);

        let report = worker.join().unwrap();
        assert_eq!(report.frames[0], 1);
    });

    assert!(inner.state.lock().inputs[0].decoder.is_some());
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert!(content.contains("\"sat\":11"));
    server.stop(&Default::default()).unwrap();
    assert!(inner.measurement_log.lock().is_none());
}

#[test]
fn test_scheduler_reported_while_computing() {
    let hub = MemoryHub::new();
    let (gate, entered, release) = new_gate();
    let factory = GatedCalculatorFactory {
        gate: Mutex::new(Some(gate)),
    };
    let server = Server::new(collaborators(&hub).with_calculator_factory(Arc::new(factory)));
    let mut options = memory_options();
    options.scint.trigger = TriggerMode::Flag;
    server.start(&options).unwrap();

    thread::scope(|s| {
        let worker = s.spawn(|| server.run_cycle());
        entered.recv_timeout(WAIT).unwrap();

        let status = server.scheduler_status().unwrap();
        assert!(status.computing);
        assert_eq!(status.passes, 0);
        assert!(server.resources().scheduler);
        assert!(server.is_running());

        release.send(()).unwrap();
        worker.join().unwrap();
    });

    let status = server.scheduler_status().unwrap();
    assert!(!status.computing);
    assert_eq!(status.passes, 1);
    assert_eq!(status.resets, 1);
    server.stop(&Default::default()).unwrap();
    assert!(server.scheduler_status().is_none());
}

#[test]
fn test_decoder_reset_when_peek_drained() {
    let hub = MemoryHub::new();
    let resets = Arc::new(AtomicUsize::new(0));
    let server = Server::new(collaborators(&hub).with_decoder_factory(Arc::new(
        CountingDecoderFactory {
            resets: Arc::clone(&resets),
        },
    )));
    server.start(&memory_options()).unwrap();

    let frame = eph_frame(4);
    let (head, tail) = frame.split_at(frame.len() - 5);
    hub.push("rover", head);
    assert_eq!(server.run_cycle().frames[0], 0);
    assert_eq!(resets.load(Ordering::SeqCst), 0);

    hub.push("rover", tail);
    assert_eq!(server.run_cycle().frames[0], 1);
    assert_eq!(resets.load(Ordering::SeqCst), 1);

    // 复位后计数重新开始，下一帧单独计数
    hub.push("rover", &eph_frame(5));
    assert_eq!(server.run_cycle().frames[0], 1);
    assert_eq!(resets.load(Ordering::SeqCst), 2);
    assert_eq!(server.statistics().frames[0], 2);
    server.stop(&Default::default()).unwrap();
}

#[test]
fn test_concurrent_open_stream_admits_one() {
    let hub = MemoryHub::new();
    let server = Server::new(collaborators(&hub));
    let mut options = memory_options();
    options.streams[6] = StreamSpec::default();
    server.start(&options).unwrap();

    let barrier = Barrier::new(2);
    let results: Vec<Result<()>> = thread::scope(|s| {
        let handles: Vec<_> = ["late-a", "late-b"]
            .into_iter()
            .map(|name| {
                let (server, barrier) = (&server, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    server.open_stream(6, StreamKind::Memory, name)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ServerError::StreamBusy(6)))));
    assert!(matches!(
        server.open_stream(6, StreamKind::Memory, "late-c"),
        Err(ServerError::StreamBusy(6))
    ));
    let path = server.stream_status().streams[6].path.clone();
    assert!(path == "late-a" || path == "late-b");
    server.stop(&Default::default()).unwrap();
}
