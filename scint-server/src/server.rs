// 闪烁监测服务器 - 生命周期管理
//
// init/free 管理导航缓存和观测缓冲；start/stop 管理输入与输出缓冲、解码器、
// 闪烁调度器、数据流和工作线程。start 中途任何一步失败时，已获得的资源按
// 相反顺序全部释放，服务器要么完全运行，要么完全空闲。

use crate::buffer::{ByteBuffer, MemoryBudget, SolutionRing, UnboundedBudget};
use crate::clock::{Clock, SystemClock};
use crate::command::{parse_periodic, PeriodicCommand};
use crate::config::StartOptions;
use crate::decode::{DecoderFactory, DefaultDecoderFactory, FrameDecoder, MeasurementLog};
use crate::error::{Result, ServerError, StreamError};
use crate::nav::{NavCache, ObservationStore};
use crate::scint::{CalculatorFactory, DefaultCalculatorFactory, PeriodicScheduler};
use crate::solution::{solution_header, PositionState};
use crate::status::SchedulerStatus;
use crate::stream::{
    StreamFactory, StreamKind, StreamSet, SystemStreamFactory, FIRST_LOG, FIRST_OUTPUT,
    MONITOR_STREAM, NUM_INPUTS, NUM_OUTPUTS,
};
use crate::worker::{self, CycleReport, CycleStatistics, ThreadSpawner, WorkerHandle, WorkerSpawner};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WORKER_THREAD_NAME: &str = "scint-worker";

/// 服务器依赖的外部组件，测试中可逐个替换以注入故障
#[derive(Clone)]
pub struct Collaborators {
    pub stream_factory: Arc<dyn StreamFactory>,
    pub decoder_factory: Arc<dyn DecoderFactory>,
    pub calculator_factory: Arc<dyn CalculatorFactory>,
    pub budget: Arc<dyn MemoryBudget>,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            stream_factory: Arc::new(SystemStreamFactory::default()),
            decoder_factory: Arc::new(DefaultDecoderFactory),
            calculator_factory: Arc::new(DefaultCalculatorFactory),
            budget: Arc::new(UnboundedBudget::default()),
            spawner: Arc::new(ThreadSpawner),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl Collaborators {
    pub fn with_stream_factory(mut self, factory: Arc<dyn StreamFactory>) -> Self {
        self.stream_factory = factory;
        self
    }

    pub fn with_decoder_factory(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
        self.decoder_factory = factory;
        self
    }

    pub fn with_calculator_factory(mut self, factory: Arc<dyn CalculatorFactory>) -> Self {
        self.calculator_factory = factory;
        self
    }

    pub fn with_budget(mut self, budget: Arc<dyn MemoryBudget>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// 单路输入的缓冲与解码器
#[derive(Default)]
pub(crate) struct InputSlot {
    pub raw: Option<ByteBuffer>,
    pub peek: Option<ByteBuffer>,
    pub decoder: Option<Box<dyn FrameDecoder>>,
    pub periodic: Vec<PeriodicCommand>,
}

/// 服务器锁保护的全部共享状态
#[derive(Default)]
pub(crate) struct ServerState {
    pub options: StartOptions,
    pub inputs: [InputSlot; NUM_INPUTS],
    pub saves: [Option<ByteBuffer>; NUM_OUTPUTS],
    pub solutions: SolutionRing,
    pub nav: Option<NavCache>,
    pub observations: Option<ObservationStore>,
    pub init_bytes: usize,
    pub position: PositionState,
    pub scheduler: Option<PeriodicScheduler>,
    /// 调度器被工作线程取出计算时的状态快照
    pub computing: Option<SchedulerStatus>,
    pub stats: CycleStatistics,
    pub run_id: Option<Uuid>,
    pub last_nmea_tick: u64,
    pub last_reset_tick: Option<u64>,
}

impl ServerState {
    /// 归还 start 分配的缓冲并丢弃解码器，可重复调用
    pub fn release_buffers(&mut self, budget: &dyn MemoryBudget) {
        for slot in &mut self.inputs {
            if let Some(raw) = slot.raw.take() {
                raw.release(budget);
            }
            if let Some(peek) = slot.peek.take() {
                peek.release(budget);
            }
            slot.decoder = None;
            slot.periodic.clear();
        }
        for save in &mut self.saves {
            if let Some(buffer) = save.take() {
                buffer.release(budget);
            }
        }
    }
}

/// 已分配资源的统计，用于检查回滚是否完整
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceReport {
    pub buffers: usize,
    pub decoders: usize,
    pub scheduler: bool,
    pub open_streams: usize,
    pub worker: bool,
}

impl ResourceReport {
    pub fn is_quiescent(&self) -> bool {
        self.buffers == 0
            && self.decoders == 0
            && !self.scheduler
            && self.open_streams == 0
            && !self.worker
    }
}

pub(crate) struct ServerInner {
    pub running: AtomicBool,
    pub state: Mutex<ServerState>,
    /// 测量日志有独立的锁，写盘时不持有服务器锁
    pub measurement_log: Mutex<Option<MeasurementLog>>,
    pub streams: StreamSet,
    pub collab: Collaborators,
}

impl ServerInner {
    pub fn clock(&self) -> &dyn Clock {
        self.collab.clock.as_ref()
    }

    pub fn budget(&self) -> &dyn MemoryBudget {
        self.collab.budget.as_ref()
    }

    /// 工作线程退出时的清理：关闭所有流和测量日志，释放缓冲与解码器
    pub fn teardown(&self) {
        self.streams.close_all();
        self.measurement_log.lock().take();
        let mut state = self.state.lock();
        state.release_buffers(self.budget());
    }
}

/// start 过程中获得的资源
enum Acquired {
    Raw(usize, ByteBuffer),
    Peek(usize, ByteBuffer),
    Save(usize, ByteBuffer),
    Decoder(usize, Box<dyn FrameDecoder>),
    Scheduler(PeriodicScheduler),
    MeasurementLog(MeasurementLog),
    Stream(usize),
}

impl Acquired {
    fn describe(&self) -> String {
        match self {
            Acquired::Raw(i, _) => format!("input {} raw buffer", i + 1),
            Acquired::Peek(i, _) => format!("input {} peek buffer", i + 1),
            Acquired::Save(i, _) => format!("output {} save buffer", i + 1),
            Acquired::Decoder(i, _) => format!("input {} decoder", i + 1),
            Acquired::Scheduler(_) => "scintillation scheduler".to_string(),
            Acquired::MeasurementLog(_) => "measurement log".to_string(),
            Acquired::Stream(i) => format!("stream {}", i + 1),
        }
    }
}

/// start 的资源守卫：未提交就被丢弃时按获得的相反顺序释放全部资源
struct StartGuard<'a> {
    inner: &'a ServerInner,
    acquired: Vec<Acquired>,
}

impl<'a> StartGuard<'a> {
    fn new(inner: &'a ServerInner) -> Self {
        Self {
            inner,
            acquired: Vec::new(),
        }
    }

    fn push(&mut self, resource: Acquired) {
        debug!("acquired {}", resource.describe());
        self.acquired.push(resource);
    }

    fn allocate(&mut self, what: &str, capacity: usize) -> Result<ByteBuffer> {
        ByteBuffer::allocate(self.inner.budget(), what, capacity).map_err(|e| {
            error!("{}", e);
            e
        })
    }

    /// 把全部资源移入共享状态，守卫随之失效
    fn commit(mut self, state: &mut ServerState) {
        for resource in self.acquired.drain(..) {
            match resource {
                Acquired::Raw(i, buffer) => state.inputs[i].raw = Some(buffer),
                Acquired::Peek(i, buffer) => state.inputs[i].peek = Some(buffer),
                Acquired::Save(i, buffer) => state.saves[i] = Some(buffer),
                Acquired::Decoder(i, decoder) => state.inputs[i].decoder = Some(decoder),
                Acquired::Scheduler(scheduler) => state.scheduler = Some(scheduler),
                Acquired::MeasurementLog(log) => *self.inner.measurement_log.lock() = Some(log),
                Acquired::Stream(_) => {}
            }
        }
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        while let Some(resource) = self.acquired.pop() {
            debug!("rollback: releasing {}", resource.describe());
            match resource {
                Acquired::Raw(_, buffer) | Acquired::Peek(_, buffer) | Acquired::Save(_, buffer) => {
                    buffer.release(self.inner.budget())
                }
                Acquired::Stream(index) => self.inner.streams.close(index),
                Acquired::Decoder(..) | Acquired::Scheduler(_) | Acquired::MeasurementLog(_) => {}
            }
        }
    }
}

/// 实时闪烁监测服务器
pub struct Server {
    inner: Arc<ServerInner>,
    worker: Mutex<Option<Box<dyn WorkerHandle>>>,
}

impl Server {
    pub fn new(collab: Collaborators) -> Self {
        let streams = StreamSet::new(Arc::clone(&collab.clock));
        Self {
            inner: Arc::new(ServerInner {
                running: AtomicBool::new(false),
                state: Mutex::new(ServerState::default()),
                measurement_log: Mutex::new(None),
                streams,
                collab,
            }),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn inner(&self) -> &ServerInner {
        &self.inner
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// 复位状态并分配导航缓存与观测缓冲，失败时不保留任何分配
    pub fn init(&self) -> Result<()> {
        if self.is_running() {
            return Err(ServerError::StillRunning);
        }
        let budget = self.inner.budget();
        let mut state = self.inner.state.lock();
        if state.init_bytes > 0 {
            budget.release(state.init_bytes);
        }
        *state = ServerState::default();

        let nav_bytes = NavCache::footprint();
        let obs_bytes = ObservationStore::footprint();
        budget.reserve("navigation cache", nav_bytes)?;
        if let Err(e) = budget.reserve("observation buffers", obs_bytes) {
            budget.release(nav_bytes);
            error!("server init failed: {}", e);
            return Err(e);
        }
        state.nav = Some(NavCache::new());
        state.observations = Some(ObservationStore::new());
        state.init_bytes = nav_bytes + obs_bytes;
        info!("server initialized ({} bytes reserved)", state.init_bytes);
        Ok(())
    }

    /// 释放 init 分配的导航缓存与观测缓冲
    pub fn free(&self) -> Result<()> {
        if self.is_running() {
            return Err(ServerError::StillRunning);
        }
        let mut state = self.inner.state.lock();
        state.nav = None;
        state.observations = None;
        if state.init_bytes > 0 {
            self.inner.budget().release(state.init_bytes);
            state.init_bytes = 0;
        }
        debug!("server freed");
        Ok(())
    }

    /// 启动服务器
    ///
    /// 顺序：修正参数，重建定位结果对象，分配输入与保存缓冲，创建解码器和
    /// 闪烁调度器，按 0..7 再监视流的顺序打开数据流，发送启动命令，写出解
    /// 文件头，最后创建工作线程。失败时返回的错误即描述信息。
    pub fn start(&self, options: &StartOptions) -> Result<()> {
        let mut worker_slot = self.worker.lock();
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }
        let options = options.normalized();
        let run_id = Uuid::new_v4();
        let inner = self.inner.as_ref();
        let start_tick = inner.clock().tick_ms();
        info!(
            "Starting scint server run {} (cycle={}ms buffer={} bytes)",
            run_id, options.cycle_ms, options.buffer_size
        );

        {
            let mut state = inner.state.lock();
            state.position = PositionState::new(options.processing.clone());
            if let Some(nav) = state.nav.as_mut() {
                nav.reset_receive_times();
            }
        }

        let mut guard = StartGuard::new(inner);

        for i in 0..NUM_INPUTS {
            let raw = guard.allocate(&format!("input {} raw buffer", i + 1), options.buffer_size)?;
            guard.push(Acquired::Raw(i, raw));
            let peek = guard.allocate(&format!("input {} peek buffer", i + 1), options.buffer_size)?;
            guard.push(Acquired::Peek(i, peek));
        }
        for k in 0..NUM_OUTPUTS {
            let save = guard.allocate(&format!("output {} save buffer", k + 1), options.buffer_size)?;
            guard.push(Acquired::Save(k, save));
        }

        for i in 0..NUM_INPUTS {
            let decoder = inner
                .collab
                .decoder_factory
                .create(i, options.input_formats[i], &options.receiver_options[i])
                .map_err(|e| {
                    error!("{}", e);
                    e
                })?;
            guard.push(Acquired::Decoder(i, decoder));
        }

        let scheduler = PeriodicScheduler::new(
            options.scint.clone(),
            Arc::clone(&inner.collab.calculator_factory),
            start_tick,
        )
        .map_err(|e| {
            error!("scintillation calculator init failed: {}", e);
            ServerError::CalculatorInit(e)
        })?;
        guard.push(Acquired::Scheduler(scheduler));

        if let Some(path) = options.measurement_log.as_deref() {
            let log = MeasurementLog::open(path).map_err(|e| {
                error!("measurement log open failed: {}", e);
                ServerError::InvalidConfig(format!("measurement log {}: {}", path.display(), e))
            })?;
            guard.push(Acquired::MeasurementLog(log));
        }

        for index in 0..=MONITOR_STREAM {
            let spec = options.stream(index);
            if spec.kind == StreamKind::None {
                continue;
            }
            inner
                .streams
                .open(index, spec.kind, &spec.path, inner.collab.stream_factory.as_ref())
                .map_err(|e| {
                    let err = ServerError::StreamOpen {
                        index,
                        path: spec.path.clone(),
                        reason: e.to_string(),
                    };
                    error!("{}", err);
                    err
                })?;
            guard.push(Acquired::Stream(index));
        }

        for (i, cmd) in options.start_commands.iter().enumerate() {
            if !cmd.trim().is_empty() {
                inner.streams.send_command(i, cmd);
            }
        }
        for (k, output) in options.solution_outputs.iter().enumerate() {
            if let Some(header) = solution_header(output) {
                inner.streams.write(FIRST_OUTPUT + k, header.as_bytes());
            }
        }

        let mut state = inner.state.lock();
        guard.commit(&mut state);
        for (slot, text) in state.inputs.iter_mut().zip(&options.periodic_commands) {
            slot.periodic = parse_periodic(text);
        }
        state.solutions.clear();
        state.stats = CycleStatistics::default();
        state.run_id = Some(run_id);
        state.last_nmea_tick = start_tick;
        state.last_reset_tick = None;
        state.options = options;
        inner.running.store(true, Ordering::SeqCst);

        let worker_inner = Arc::clone(&self.inner);
        let body = Box::new(move || worker::run(worker_inner));
        match inner.collab.spawner.spawn(WORKER_THREAD_NAME, body) {
            Ok(handle) => {
                *worker_slot = Some(handle);
                drop(state);
                info!("Scint server run {} started", run_id);
                Ok(())
            }
            Err(e) => {
                inner.running.store(false, Ordering::SeqCst);
                state.release_buffers(inner.budget());
                state.scheduler = None;
                state.run_id = None;
                drop(state);
                inner.measurement_log.lock().take();
                inner.streams.close_all();
                let err = ServerError::ThreadCreate(e.to_string());
                error!("{}", err);
                Err(err)
            }
        }
    }

    /// 停止服务器：向输入流发送停止命令，清除运行标志并等待工作线程退出，
    /// 然后关闭结果日志并释放调度器
    ///
    /// 停止命令只经过端点锁发送，其中的 !WAIT 不会阻塞状态查询。
    pub fn stop(&self, commands: &[String; NUM_INPUTS]) -> Result<()> {
        let mut worker_slot = self.worker.lock();
        if !self.is_running() {
            return Err(ServerError::NotRunning);
        }
        let inner = self.inner.as_ref();
        for (i, cmd) in commands.iter().enumerate() {
            if !cmd.trim().is_empty() {
                inner.streams.send_command(i, cmd);
            }
        }
        inner.running.store(false, Ordering::SeqCst);

        if let Some(handle) = worker_slot.take() {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }

        inner.teardown();
        let (scheduler, run_id) = {
            let mut state = inner.state.lock();
            (state.scheduler.take(), state.run_id.take())
        };
        if let Some(scheduler) = scheduler {
            scheduler.finish();
        }
        info!(
            "Scint server run {} stopped",
            run_id.map(|id| id.to_string()).unwrap_or_default()
        );
        Ok(())
    }

    /// 运行中打开一路输出或日志流（3..7），解输出流会写出文件头
    ///
    /// 端点已打开时返回 StreamBusy，检查与打开在同一把端点锁内完成。
    pub fn open_stream(&self, index: usize, kind: StreamKind, path: &str) -> Result<()> {
        check_runtime_index(index)?;
        if !self.is_running() {
            return Err(ServerError::NotRunning);
        }
        let inner = self.inner.as_ref();
        let state = inner.state.lock();
        inner
            .streams
            .open(index, kind, path, inner.collab.stream_factory.as_ref())
            .map_err(|e| match e {
                StreamError::Busy => ServerError::StreamBusy(index),
                e => ServerError::StreamOpen {
                    index,
                    path: path.to_string(),
                    reason: e.to_string(),
                },
            })?;
        if index < FIRST_LOG {
            if let Some(header) = state.options.solution_output(index).and_then(solution_header) {
                inner.streams.write(index, header.as_bytes());
            }
        }
        info!("Stream {} opened at runtime: {} {}", index + 1, kind, path);
        Ok(())
    }

    /// 运行中关闭一路输出或日志流（3..7）
    pub fn close_stream(&self, index: usize) -> Result<()> {
        check_runtime_index(index)?;
        if !self.is_running() {
            return Err(ServerError::NotRunning);
        }
        let _state = self.inner.state.lock();
        self.inner.streams.close(index);
        info!("Stream {} closed at runtime", index + 1);
        Ok(())
    }

    /// 在调用线程上执行一个处理周期（不休眠）
    pub fn run_cycle(&self) -> CycleReport {
        self.inner.run_cycle()
    }

    /// 已分配资源统计
    pub fn resources(&self) -> ResourceReport {
        let worker = self.worker.lock().is_some();
        let state = self.inner.state.lock();
        let buffers = state
            .inputs
            .iter()
            .map(|s| usize::from(s.raw.is_some()) + usize::from(s.peek.is_some()))
            .sum::<usize>()
            + state.saves.iter().filter(|s| s.is_some()).count();
        let decoders = state.inputs.iter().filter(|s| s.decoder.is_some()).count();
        ResourceReport {
            buffers,
            decoders,
            scheduler: state.scheduler.is_some() || state.computing.is_some(),
            open_streams: self.inner.streams.open_count(),
            worker,
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(Collaborators::default())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("server dropped while running, stopping");
            let _ = self.stop(&Default::default());
        }
    }
}

fn check_runtime_index(index: usize) -> Result<()> {
    if (FIRST_OUTPUT..MONITOR_STREAM).contains(&index) {
        Ok(())
    } else {
        Err(ServerError::InvalidStreamIndex(index))
    }
}
