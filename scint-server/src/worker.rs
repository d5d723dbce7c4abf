// 闪烁监测服务器 - 工作线程
//
// 每个周期依次：读取三路输入，解码三路 peek 缓冲，判断并执行闪烁计算，
// 写出新解，发送周期命令和 NMEA 请求，统计本周期耗时，休眠到周期结束。
// 服务器锁只在复制缓冲和读写快照时持有，解码与计算在锁外进行。

use crate::command::due_commands;
use crate::config::{NmeaRequestMode, SolutionFormat};
use crate::decode::decode_peek;
use crate::scint::PassOutcome;
use crate::server::{ServerInner, ServerState};
use crate::solution::{format_gga, format_solution};
use crate::status::SchedulerStatus;
use crate::stream::{log_stream, FIRST_OUTPUT, MONITOR_STREAM, NUM_INPUTS, NUM_OUTPUTS};
use chrono::{DateTime, Utc};
use common::{Measurement, ReceiverRole};
use serde::Serialize;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 无解时发送复位命令的最小间隔
const RESET_INTERVAL_MS: u64 = 30_000;

/// 可等待结束的工作线程
pub trait WorkerHandle: Send {
    fn join(self: Box<Self>) -> thread::Result<()>;
}

impl WorkerHandle for JoinHandle<()> {
    fn join(self: Box<Self>) -> thread::Result<()> {
        JoinHandle::join(*self)
    }
}

/// 创建工作线程
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<Box<dyn WorkerHandle>>;
}

/// 使用具名系统线程
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl WorkerSpawner for ThreadSpawner {
    fn spawn(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        let handle = thread::Builder::new().name(name.to_string()).spawn(body)?;
        Ok(Box::new(handle))
    }
}

/// 累计的周期统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleStatistics {
    pub cycles: u64,
    pub last_cputime_ms: u64,
    pub overruns: u64,
    pub bytes: [u64; NUM_INPUTS],
    pub frames: [u64; NUM_INPUTS],
    pub passes: u64,
    pub pass_failures: u64,
    pub solutions: u64,
    /// 解记录环已满而未保存的解
    pub solutions_dropped: u64,
}

/// 单个周期的结果
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub tick: u64,
    pub bytes: [usize; NUM_INPUTS],
    pub frames: [usize; NUM_INPUTS],
    pub pass: PassOutcome,
    pub cputime_ms: u64,
    pub overrun: bool,
}

/// 工作线程主体，运行标志被清除后关闭流并释放缓冲
pub(crate) fn run(inner: Arc<ServerInner>) {
    info!("worker thread started");
    let cycle_ms = inner.state.lock().options.cycle_ms;
    while inner.running.load(Ordering::SeqCst) {
        let report = inner.run_cycle();
        let remaining = cycle_ms.saturating_sub(report.cputime_ms);
        if remaining > 0 {
            inner.clock().sleep(Duration::from_millis(remaining));
        }
    }
    inner.teardown();
    info!("worker thread exited");
}

/// 发给参考接收机的 NMEA 请求
enum NmeaAction {
    Gga(String),
    Reset(String),
}

impl ServerInner {
    pub(crate) fn run_cycle(&self) -> CycleReport {
        let tick = self.clock().tick_ms();

        let mut bytes = [0usize; NUM_INPUTS];
        for (i, n) in bytes.iter_mut().enumerate() {
            *n = self.ingest(i);
        }
        let mut frames = [0usize; NUM_INPUTS];
        for (i, n) in frames.iter_mut().enumerate() {
            *n = self.decode(i);
        }

        let pass = self.compute(tick);
        let published = self.write_solution();
        let cycle = self.send_periodic_commands();
        self.send_nmea_request(tick);

        let cputime_ms = self.clock().tick_ms().saturating_sub(tick);
        let mut state = self.state.lock();
        let cycle_ms = state.options.cycle_ms;
        let overrun = cputime_ms > cycle_ms;
        let stats = &mut state.stats;
        stats.cycles += 1;
        stats.last_cputime_ms = cputime_ms;
        for i in 0..NUM_INPUTS {
            stats.bytes[i] += bytes[i] as u64;
            stats.frames[i] += frames[i] as u64;
        }
        match pass {
            PassOutcome::Published { .. } => stats.passes += 1,
            PassOutcome::Failed => stats.pass_failures += 1,
            PassOutcome::Skipped => {}
        }
        if published {
            stats.solutions += 1;
        }
        if overrun {
            stats.overruns += 1;
            warn!(
                "processing cycle {} overrun: cputime={}ms cycle={}ms",
                cycle, cputime_ms, cycle_ms
            );
        }

        CycleReport {
            tick,
            bytes,
            frames,
            pass,
            cputime_ms,
            overrun,
        }
    }

    /// 读取一路输入：读入原始缓冲，在锁外写原始日志，再在锁内截断复制到
    /// peek 缓冲并清空原始缓冲。peek 缓冲已满时新数据直接丢弃
    fn ingest(&self, index: usize) -> usize {
        let Some(mut raw) = self.state.lock().inputs[index].raw.take() else {
            return 0;
        };
        if raw.prepare_fill() {
            debug!("input {} raw buffer wrapped", index + 1);
        }
        let start = raw.len();
        let n = self.streams.read(index, raw.spare_mut());
        raw.commit(n);
        if n > 0 {
            self.streams.write(log_stream(index), &raw.as_slice()[start..]);
        }

        let mut state = self.state.lock();
        if n > 0 {
            let chunk = &raw.as_slice()[start..];
            if let Some(peek) = state.inputs[index].peek.as_mut() {
                let copied = peek.append_truncated(chunk);
                if copied < chunk.len() {
                    trace!(
                        "input {} peek buffer full, dropped {} bytes",
                        index + 1,
                        chunk.len() - copied
                    );
                }
            }
            raw.clear();
        }
        state.inputs[index].raw = Some(raw);
        n
    }

    /// 解码一路 peek 缓冲的快照。得到有效帧时复位解码器，在锁外写测量日志，
    /// 然后清空 peek 缓冲并分派解出的记录
    fn decode(&self, index: usize) -> usize {
        let (snapshot, mut decoder) = {
            let mut state = self.state.lock();
            let slot = &mut state.inputs[index];
            let Some(peek) = slot.peek.as_ref().filter(|p| !p.is_empty()) else {
                return 0;
            };
            let snapshot = peek.as_slice().to_vec();
            let Some(decoder) = slot.decoder.take() else {
                return 0;
            };
            (snapshot, decoder)
        };

        let outcome = decode_peek(decoder.as_mut(), &snapshot);
        let received = self.clock().now();
        if outcome.frames > 0 {
            decoder.reset();
            if !outcome.records.is_empty() {
                if let Some(log) = self.measurement_log.lock().as_mut() {
                    log.write(index, received, &outcome.records);
                }
            }
        }

        let mut state = self.state.lock();
        state.inputs[index].decoder = Some(decoder);
        if outcome.frames == 0 {
            return 0;
        }
        if let Some(peek) = state.inputs[index].peek.as_mut() {
            peek.clear();
        }
        trace!(
            "input {} decoded {} frame(s), {} record(s)",
            index + 1,
            outcome.frames,
            outcome.records.len()
        );
        route_records(&mut state, index, outcome.records);
        outcome.frames
    }

    /// 判断是否触发闪烁计算；计算在锁外进行，结果写入两路解输出和保存缓冲
    fn compute(&self, tick: u64) -> PassOutcome {
        let scheduler = {
            let mut state = self.state.lock();
            let due = state
                .scheduler
                .as_ref()
                .map_or(false, |s| s.should_trigger(tick));
            if !due {
                return PassOutcome::Skipped;
            }
            // 计算期间状态查询使用取出时的快照
            let scheduler = state.scheduler.take();
            state.computing = scheduler.as_ref().map(|s| SchedulerStatus::snapshot(s, true));
            scheduler
        };
        let Some(mut scheduler) = scheduler else {
            return PassOutcome::Skipped;
        };

        let mut published = Vec::new();
        let outcome = {
            let streams = &self.streams;
            let mut sink = |line: &[u8]| {
                for k in 0..NUM_OUTPUTS {
                    streams.write(FIRST_OUTPUT + k, line);
                }
                published.extend_from_slice(line);
            };
            scheduler.run_pass(tick, &mut sink)
        };

        let mut state = self.state.lock();
        state.scheduler = Some(scheduler);
        state.computing = None;
        if !published.is_empty() {
            for save in state.saves.iter_mut().flatten() {
                save.append_truncated(&published);
            }
        }
        outcome
    }

    /// 写出新解：两路解输出、保存缓冲、监视流和解记录环
    fn write_solution(&self) -> bool {
        let (solution, formats) = {
            let mut state = self.state.lock();
            let Some(solution) = state.position.take_pending() else {
                return false;
            };
            let formats = [
                state.options.solution_outputs[0].format,
                state.options.solution_outputs[1].format,
            ];
            (solution, formats)
        };

        let lines = formats.map(|format| format_solution(&solution, format));
        for (k, line) in lines.iter().enumerate() {
            self.streams.write(FIRST_OUTPUT + k, line.as_bytes());
        }
        self.streams.write(
            MONITOR_STREAM,
            format_solution(&solution, SolutionFormat::Llh).as_bytes(),
        );

        let mut state = self.state.lock();
        for (save, line) in state.saves.iter_mut().zip(&lines) {
            if let Some(save) = save {
                save.append_truncated(line.as_bytes());
            }
        }
        if !state.solutions.push(solution) {
            state.stats.solutions_dropped += 1;
            trace!("solution ring full, record dropped");
        }
        true
    }

    /// 发送到期的周期命令，返回本周期序号
    fn send_periodic_commands(&self) -> u64 {
        let (cycle, due) = {
            let state = self.state.lock();
            let cycle = state.stats.cycles;
            let elapsed = cycle.saturating_mul(state.options.cycle_ms);
            let due: Vec<(usize, String)> = state
                .inputs
                .iter()
                .enumerate()
                .flat_map(|(i, slot)| {
                    due_commands(&slot.periodic, elapsed)
                        .into_iter()
                        .map(move |cmd| (i, cmd.text.clone()))
                })
                .collect();
            (cycle, due)
        };
        for (index, text) in due {
            trace!("periodic command to input {}: {}", index + 1, text);
            self.streams.send_command(index, &text);
        }
        cycle
    }

    /// 按 NMEA 请求方式向参考接收机发送 GGA 或复位命令
    fn send_nmea_request(&self, tick: u64) {
        let action = {
            let mut state = self.state.lock();
            let nmea = state.options.nmea.clone();
            if nmea.mode == NmeaRequestMode::Off
                || tick.saturating_sub(state.last_nmea_tick) < nmea.cycle_ms
            {
                return;
            }
            state.last_nmea_tick = tick;
            match nmea.mode {
                NmeaRequestMode::Off => None,
                NmeaRequestMode::Fixed => {
                    let now: DateTime<Utc> = self.clock().now();
                    Some(NmeaAction::Gga(format_gga(&now, &nmea.position, 1, 0)))
                }
                NmeaRequestMode::Latest | NmeaRequestMode::ResetAndLatest => {
                    if state.position.has_solution() {
                        let latest = state.position.latest();
                        Some(NmeaAction::Gga(format_solution(&latest, SolutionFormat::Nmea)))
                    } else if nmea.mode == NmeaRequestMode::ResetAndLatest
                        && !nmea.reset_command.trim().is_empty()
                        && state
                            .last_reset_tick
                            .map_or(true, |last| tick.saturating_sub(last) >= RESET_INTERVAL_MS)
                    {
                        state.last_reset_tick = Some(tick);
                        Some(NmeaAction::Reset(nmea.reset_command))
                    } else {
                        None
                    }
                }
            }
        };

        let reference = ReceiverRole::Reference.index();
        match action {
            Some(NmeaAction::Gga(sentence)) => {
                self.streams.write(reference, sentence.as_bytes());
            }
            Some(NmeaAction::Reset(command)) => {
                info!("no solution, sending reset command to reference receiver");
                self.streams.send_command(reference, &command);
            }
            None => {}
        }
    }
}

/// 把解码记录分派到闪烁调度器、导航缓存、观测存储和定位结果
fn route_records(state: &mut ServerState, index: usize, records: Vec<Measurement>) {
    if records.is_empty() {
        return;
    }
    let Some(role) = ReceiverRole::from_index(index) else {
        return;
    };
    if let Some(scheduler) = state.scheduler.as_mut() {
        scheduler.feed(&records);
    }

    let nav_select = state.options.nav_select;
    for record in records {
        match record {
            Measurement::Ephemeris(eph) => {
                if nav_select.accepts(role) {
                    if let Some(nav) = state.nav.as_mut() {
                        nav.update(eph);
                    }
                }
            }
            Measurement::GnssObs(epoch) => {
                if let Some(store) = state.observations.as_mut() {
                    store.push(role, epoch);
                }
            }
            Measurement::GnssPos(set) | Measurement::LeoPos(set) => {
                if let Some(store) = state.observations.as_mut() {
                    store.update_geometry(&set);
                }
            }
            Measurement::Solution(solution) => {
                state.position.update(role, solution);
            }
            Measurement::Correlation(_) | Measurement::Phase(_) => {}
        }
    }
}
