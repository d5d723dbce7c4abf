// 闪烁监测服务器 - 状态查询与标记
//
// 所有查询都在服务器锁内取快照后返回，与工作线程的写入互斥。

use crate::config::SolutionFormat;
use crate::error::{Result, ServerError};
use crate::nav::ObservationStatus;
use crate::scint::{PeriodicScheduler, ScintWindow};
use crate::server::Server;
use crate::solution::format_mark;
use crate::stream::{StreamDescriptor, FIRST_OUTPUT, MONITOR_STREAM, NUM_OUTPUTS};
use crate::worker::CycleStatistics;
use chrono::{DateTime, Utc};
use common::{ReceiverRole, Solution};
use serde::Serialize;
use tracing::info;

/// 数据流状态：每个端点的描述加汇总消息
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub streams: Vec<StreamDescriptor>,
    pub summary: String,
}

impl StreamStatus {
    /// 各端点的数值状态码，按流序号排列
    pub fn codes(&self) -> Vec<i32> {
        self.streams.iter().map(|d| d.state.code()).collect()
    }
}

/// 闪烁调度器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub passes: u64,
    pub resets: u64,
    pub failures: u64,
    pub last_output: Option<DateTime<Utc>>,
    pub window: Option<ScintWindow>,
    /// 工作线程正在锁外执行一次计算
    pub computing: bool,
}

impl SchedulerStatus {
    pub(crate) fn snapshot(scheduler: &PeriodicScheduler, computing: bool) -> Self {
        Self {
            passes: scheduler.passes(),
            resets: scheduler.resets(),
            failures: scheduler.failures(),
            last_output: scheduler.last_output(),
            window: scheduler.window(),
            computing,
        }
    }
}

impl Server {
    /// 某接收机最新历元的卫星状态，未运行时为空
    pub fn observation_status(&self, role: ReceiverRole) -> ObservationStatus {
        if !self.is_running() {
            return ObservationStatus::default();
        }
        let state = self.inner().state.lock();
        let mask = state.position.options().elevation_mask_deg;
        state
            .observations
            .as_ref()
            .map(|store| store.status(role, mask))
            .unwrap_or_default()
    }

    pub fn stream_status(&self) -> StreamStatus {
        let inner = self.inner();
        let _state = inner.state.lock();
        StreamStatus {
            streams: inner.streams.descriptors(),
            summary: inner.streams.summary(),
        }
    }

    /// 写入一条标记到两路解输出、保存缓冲和监视流
    pub fn mark(&self, name: &str, comment: &str) -> Result<()> {
        if !self.is_running() {
            return Err(ServerError::NotRunning);
        }
        let inner = self.inner();
        let mut state = inner.state.lock();
        let solution = state.position.latest();
        for k in 0..NUM_OUTPUTS {
            let format = state.options.solution_outputs[k].format;
            let line = format_mark(format, &solution, name, comment);
            inner.streams.write(FIRST_OUTPUT + k, line.as_bytes());
            if let Some(save) = state.saves[k].as_mut() {
                save.append_truncated(line.as_bytes());
            }
        }
        let line = format_mark(SolutionFormat::Llh, &solution, name, comment);
        inner.streams.write(MONITOR_STREAM, line.as_bytes());
        info!("mark {} written", name);
        Ok(())
    }

    pub fn statistics(&self) -> CycleStatistics {
        self.inner().state.lock().stats.clone()
    }

    /// 保存缓冲内容的快照
    pub fn saved_output(&self, output: usize) -> Vec<u8> {
        let state = self.inner().state.lock();
        state
            .saves
            .get(output)
            .and_then(|s| s.as_ref())
            .map(|s| s.as_slice().to_vec())
            .unwrap_or_default()
    }

    /// 取出并清空保存缓冲
    pub fn take_saved_output(&self, output: usize) -> Vec<u8> {
        let mut state = self.inner().state.lock();
        state
            .saves
            .get_mut(output)
            .and_then(|s| s.as_mut())
            .map(|s| s.drain())
            .unwrap_or_default()
    }

    /// 解记录环中的全部解
    pub fn solutions(&self) -> Vec<Solution> {
        self.inner().state.lock().solutions.as_slice().to_vec()
    }

    pub fn latest_solution(&self) -> Solution {
        self.inner().state.lock().position.latest()
    }

    pub fn ephemeris_count(&self) -> usize {
        self.inner()
            .state
            .lock()
            .nav
            .as_ref()
            .map_or(0, |nav| nav.len())
    }

    /// 调度器状态，未运行时为 None。计算进行中返回计算开始时的快照
    pub fn scheduler_status(&self) -> Option<SchedulerStatus> {
        let state = self.inner().state.lock();
        state
            .scheduler
            .as_ref()
            .map(|s| SchedulerStatus::snapshot(s, false))
            .or(state.computing)
    }
}
