// 启动/停止生命周期与回滚测试

use crate::buffer::{LimitedBudget, MemoryBudget, UnboundedBudget};
use crate::clock::{Clock, ManualClock};
use crate::config::{SolutionFormat, StartOptions, StreamSpec};
use crate::error::{Result, ScintError, ServerError, StreamError};
use crate::nav::NavCache;
use crate::scint::{CalculatorFactory, ScintCalculator, ScintOptions};
use crate::server::{Collaborators, Server};
use crate::stream::{
    AccessMode, MemoryHub, Stream, StreamFactory, StreamKind, SystemStreamFactory, MONITOR_STREAM,
};
use crate::worker::{WorkerHandle, WorkerSpawner};
use chrono::{DateTime, TimeZone, Utc};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

pub(crate) const STREAM_NAMES: [&str; 8] =
    ["rover", "base", "corr", "sol1", "sol2", "log1", "log2", "log3"];

/// 全部端点使用内存管道的启动参数
pub(crate) fn memory_options() -> StartOptions {
    let mut options = StartOptions::default();
    for (spec, name) in options.streams.iter_mut().zip(STREAM_NAMES) {
        *spec = StreamSpec::new(StreamKind::Memory, name);
    }
    options.monitor = Some(StreamSpec::new(StreamKind::Memory, "mon"));
    options
}

pub(crate) fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
    ))
}

/// 不创建线程，由测试直接驱动 run_cycle
pub(crate) struct IdleSpawner;

struct IdleHandle;

impl WorkerHandle for IdleHandle {
    fn join(self: Box<Self>) -> thread::Result<()> {
        Ok(())
    }
}

impl WorkerSpawner for IdleSpawner {
    fn spawn(
        &self,
        _name: &str,
        _body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        Ok(Box::new(IdleHandle))
    }
}

struct FailingSpawner;

impl WorkerSpawner for FailingSpawner {
    fn spawn(
        &self,
        _name: &str,
        _body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        Err(io::Error::new(io::ErrorKind::Other, "resource temporarily unavailable"))
    }
}

/// 第 fail_at 次（1 起始）预留失败的预算
struct FailingBudget {
    fail_at: usize,
    calls: AtomicUsize,
    inner: UnboundedBudget,
}

impl FailingBudget {
    fn new(fail_at: usize) -> Self {
        Self {
            fail_at,
            calls: AtomicUsize::new(0),
            inner: UnboundedBudget::default(),
        }
    }
}

impl MemoryBudget for FailingBudget {
    fn reserve(&self, what: &str, bytes: usize) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at {
            return Err(ServerError::Allocation {
                what: what.to_string(),
                bytes,
            });
        }
        self.inner.reserve(what, bytes)
    }

    fn release(&self, bytes: usize) {
        self.inner.release(bytes)
    }

    fn in_use(&self) -> usize {
        self.inner.in_use()
    }
}

struct FailingCalculatorFactory;

impl CalculatorFactory for FailingCalculatorFactory {
    fn create(
        &self,
        _options: &ScintOptions,
    ) -> std::result::Result<Box<dyn ScintCalculator>, ScintError> {
        Err(ScintError::InvalidOptions("calculator unavailable".into()))
    }
}

/// 指定端点打开失败，其余交给内存端点
struct FailingStreamFactory {
    inner: SystemStreamFactory,
    fail_index: usize,
}

impl StreamFactory for FailingStreamFactory {
    fn open(
        &self,
        index: usize,
        kind: StreamKind,
        path: &str,
        mode: AccessMode,
        now: DateTime<Utc>,
    ) -> std::result::Result<Box<dyn Stream>, StreamError> {
        if index == self.fail_index {
            return Err(StreamError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no such device",
            )));
        }
        self.inner.open(index, kind, path, mode, now)
    }
}

fn collaborators(hub: &MemoryHub) -> Collaborators {
    let clock: Arc<dyn Clock> = manual_clock();
    Collaborators::default()
        .with_stream_factory(Arc::new(SystemStreamFactory::new(hub.clone())))
        .with_spawner(Arc::new(IdleSpawner))
        .with_clock(clock)
}

fn assert_rolled_back(server: &Server, budget: &dyn MemoryBudget, err: &ServerError) {
    assert!(!err.to_string().is_empty());
    assert!(!server.is_running());
    let report = server.resources();
    assert!(report.is_quiescent(), "resources left after rollback: {:?}", report);
    assert_eq!(budget.in_use(), 0);
}

#[test]
fn test_rollback_when_second_allocation_fails() {
    let hub = MemoryHub::new();
    let budget = Arc::new(FailingBudget::new(2));
    let server = Server::new(collaborators(&hub).with_budget(budget.clone()));

    let err = server.start(&memory_options()).unwrap_err();
    assert!(matches!(err, ServerError::Allocation { .. }));
    assert!(err.to_string().contains("input 1 peek buffer"));
    assert_rolled_back(&server, budget.as_ref(), &err);

    // 回滚后可以再次启动
    server.start(&memory_options()).unwrap();
    assert!(server.is_running());
    server.stop(&Default::default()).unwrap();
    assert_eq!(budget.in_use(), 0);
}

#[test]
fn test_rollback_when_calculator_init_fails() {
    let hub = MemoryHub::new();
    let budget = Arc::new(UnboundedBudget::default());
    let server = Server::new(
        collaborators(&hub)
            .with_budget(budget.clone())
            .with_calculator_factory(Arc::new(FailingCalculatorFactory)),
    );

    let err = server.start(&memory_options()).unwrap_err();
    assert!(matches!(err, ServerError::CalculatorInit(_)));
    assert_rolled_back(&server, budget.as_ref(), &err);
}

#[test]
fn test_rollback_when_fifth_stream_fails_to_open() {
    let hub = MemoryHub::new();
    let budget = Arc::new(UnboundedBudget::default());
    let factory = FailingStreamFactory {
        inner: SystemStreamFactory::new(hub.clone()),
        fail_index: 4,
    };
    let server = Server::new(
        collaborators(&hub)
            .with_budget(budget.clone())
            .with_stream_factory(Arc::new(factory)),
    );

    let err = server.start(&memory_options()).unwrap_err();
    assert!(err.to_string().starts_with("str5 open error path=sol2"));
    assert_rolled_back(&server, budget.as_ref(), &err);
}

#[test]
fn test_rollback_when_thread_create_fails() {
    let hub = MemoryHub::new();
    let budget = Arc::new(UnboundedBudget::default());
    let server = Server::new(
        collaborators(&hub)
            .with_budget(budget.clone())
            .with_spawner(Arc::new(FailingSpawner)),
    );

    let err = server.start(&memory_options()).unwrap_err();
    assert!(matches!(err, ServerError::ThreadCreate(_)));
    assert!(err.to_string().starts_with("thread create error"));
    assert_rolled_back(&server, budget.as_ref(), &err);
}

#[test]
fn test_start_twice_then_stop() {
    let hub = MemoryHub::new();
    let budget = Arc::new(UnboundedBudget::default());
    let server = Server::new(collaborators(&hub).with_budget(budget.clone()));
    server.init().unwrap();
    let init_bytes = budget.in_use();

    server.start(&memory_options()).unwrap();
    let report = server.resources();
    assert_eq!(report.buffers, 8);
    assert_eq!(report.decoders, 3);
    assert!(report.scheduler);
    assert_eq!(report.open_streams, 9);
    assert!(report.worker);

    assert!(matches!(
        server.start(&memory_options()),
        Err(ServerError::AlreadyRunning)
    ));
    assert!(matches!(server.init(), Err(ServerError::StillRunning)));

    server.stop(&Default::default()).unwrap();
    assert!(server.resources().is_quiescent());
    assert_eq!(budget.in_use(), init_bytes);
    assert!(matches!(
        server.stop(&Default::default()),
        Err(ServerError::NotRunning)
    ));

    server.free().unwrap();
    assert_eq!(budget.in_use(), 0);
}

#[test]
fn test_init_failure_keeps_nothing() {
    let hub = MemoryHub::new();
    let budget = Arc::new(LimitedBudget::new(NavCache::footprint() + 1));
    let server = Server::new(collaborators(&hub).with_budget(budget.clone()));

    let err = server.init().unwrap_err();
    assert!(err.to_string().contains("observation buffers"));
    assert_eq!(budget.in_use(), 0);
    assert_eq!(server.ephemeris_count(), 0);
}

#[test]
fn test_start_sends_commands_and_headers() {
    let hub = MemoryHub::new();
    let server = Server::new(collaborators(&hub));
    let mut options = memory_options();
    options.start_commands[0] = "LOG RANGEB ONCHANGED\n!WAIT 10\nLOG BESTPOSB".into();
    options.solution_outputs[1].format = SolutionFormat::Nmea;

    server.start(&options).unwrap();
    assert_eq!(
        hub.take_all("rover.tx"),
        b"LOG RANGEB ONCHANGED\r\nLOG BESTPOSB\r\n"
    );
    assert!(String::from_utf8(hub.take_all("sol1"))
        .unwrap()
        .starts_with("% UTC"));
    assert!(hub.take_all("sol2").is_empty());

    let stop = ["UNLOGALL".to_string(), String::new(), String::new()];
    server.stop(&stop).unwrap();
    assert_eq!(hub.take_all("rover.tx"), b"UNLOGALL\r\n");
}

#[test]
fn test_mark_writes_outputs_saves_and_monitor() {
    let hub = MemoryHub::new();
    let server = Server::new(collaborators(&hub));
    assert!(matches!(
        server.mark("PT1", "start"),
        Err(ServerError::NotRunning)
    ));

    let mut options = memory_options();
    options.solution_outputs[0].format = SolutionFormat::Stat;
    options.solution_outputs[1].format = SolutionFormat::Nmea;
    server.start(&options).unwrap();

    server.mark("PT1", "start").unwrap();
    let sol1 = String::from_utf8(hub.take_all("sol1")).unwrap();
    let sol2 = String::from_utf8(hub.take_all("sol2")).unwrap();
    let mon = String::from_utf8(hub.take_all("mon")).unwrap();
    assert!(sol1.starts_with("$MARK,"));
    assert!(sol1.ends_with(",PT1,start\r\n"));
    assert!(sol2.starts_with("$GPTXT,01,01,02,MARK:PT1,"));
    assert!(mon.starts_with("% MARK: PT1,"));
    assert_eq!(server.saved_output(0), sol1.as_bytes());
    assert_eq!(server.take_saved_output(1), sol2.as_bytes());
    assert!(server.saved_output(1).is_empty());

    server.stop(&Default::default()).unwrap();
}

#[test]
fn test_runtime_open_close_rules() {
    let hub = MemoryHub::new();
    let server = Server::new(collaborators(&hub));
    assert!(matches!(
        server.open_stream(3, StreamKind::Memory, "x"),
        Err(ServerError::NotRunning)
    ));
    assert!(matches!(
        server.open_stream(2, StreamKind::Memory, "x"),
        Err(ServerError::InvalidStreamIndex(2))
    ));
    assert!(matches!(
        server.close_stream(MONITOR_STREAM),
        Err(ServerError::InvalidStreamIndex(MONITOR_STREAM))
    ));

    server.start(&memory_options()).unwrap();
    hub.take_all("sol1");
    assert!(matches!(
        server.open_stream(3, StreamKind::Memory, "sol1b"),
        Err(ServerError::StreamBusy(3))
    ));

    server.close_stream(3).unwrap();
    server.open_stream(3, StreamKind::Memory, "sol1b").unwrap();
    assert!(String::from_utf8(hub.take_all("sol1b"))
        .unwrap()
        .starts_with("% UTC"));

    server.close_stream(6).unwrap();
    server.open_stream(6, StreamKind::Memory, "log2b").unwrap();
    assert!(hub.take_all("log2b").is_empty());

    let status = server.stream_status();
    assert!(status.summary.contains("(4) memory sol1b "));
    assert_eq!(status.codes().len(), 9);
    server.stop(&Default::default()).unwrap();
}

#[test]
fn test_worker_thread_runs_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("scint.txt");
    let hub = MemoryHub::new();
    let server = Server::new(
        Collaborators::default()
            .with_stream_factory(Arc::new(SystemStreamFactory::new(hub.clone()))),
    );
    let mut options = memory_options();
    options.cycle_ms = 5;
    options.scint.log_path = Some(log_path.clone());

    server.start(&options).unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while server.statistics().cycles < 3 && std::time::Instant::now() < deadline {
        thread::sleep(std::time::Duration::from_millis(5));
    }
    assert!(server.statistics().cycles >= 3);

    server.stop(&Default::default()).unwrap();
    assert!(server.resources().is_quiescent());
    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.ends_with("# monitoring end\n"));
}
