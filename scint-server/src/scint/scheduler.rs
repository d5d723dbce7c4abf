use super::{format_record, CalculatorFactory, ScintCalculator, ScintOptions, ScintWindow, TriggerMode};
use crate::error::ScintError;
use chrono::{DateTime, Utc};
use common::Measurement;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 接收计算结果的输出端
pub trait ResultSink {
    fn publish(&mut self, line: &[u8]);
}

impl<F: FnMut(&[u8])> ResultSink for F {
    fn publish(&mut self, line: &[u8]) {
        self(line)
    }
}

/// 一次计算的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// 没有可用的计算器
    Skipped,
    Published { pass: u64, records: usize },
    /// 计算失败，累积数据保留，下次触发时重试
    Failed,
}

/// 追加写入的结果日志
struct ResultLog {
    writer: BufWriter<File>,
}

impl ResultLog {
    fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = self.writer.write_all(line.as_bytes()) {
            warn!("scintillation log write failed: {}", e);
        }
    }

    fn finish(mut self) {
        let result = self
            .writer
            .write_all(b"# monitoring end\n")
            .and_then(|_| self.writer.flush());
        if let Err(e) = result {
            warn!("scintillation log close failed: {}", e);
        }
    }
}

/// 周期计算调度器
///
/// 拥有当前计算器实例。每次成功计算后丢弃旧实例并用同样的选项新建一个，
/// 只把上一窗口最后的数据时刻带入新窗口作为起点。
pub struct PeriodicScheduler {
    options: ScintOptions,
    factory: Arc<dyn CalculatorFactory>,
    calculator: Option<Box<dyn ScintCalculator>>,
    last_trigger_tick: u64,
    passes: u64,
    resets: u64,
    failures: u64,
    last_output: Option<DateTime<Utc>>,
    log: Option<ResultLog>,
}

impl PeriodicScheduler {
    pub fn new(
        options: ScintOptions,
        factory: Arc<dyn CalculatorFactory>,
        start_tick: u64,
    ) -> Result<Self, ScintError> {
        let calculator = factory.create(&options)?;
        let log = match options.log_path.as_deref() {
            Some(path) if options.enabled => {
                info!("scintillation log: {}", path.display());
                Some(ResultLog::open(path)?)
            }
            _ => None,
        };
        Ok(Self {
            options,
            factory,
            calculator: Some(calculator),
            last_trigger_tick: start_tick,
            passes: 0,
            resets: 0,
            failures: 0,
            last_output: None,
            log,
        })
    }

    pub fn options(&self) -> &ScintOptions {
        &self.options
    }

    /// 送入解码记录，返回被计算器采用的条数
    pub fn feed(&mut self, records: &[Measurement]) -> usize {
        if !self.options.enabled {
            return 0;
        }
        self.ensure_calculator();
        let Some(calculator) = self.calculator.as_mut() else {
            return 0;
        };
        records
            .iter()
            .filter(|r| r.has_samples() && calculator.input(r))
            .count()
    }

    pub fn should_trigger(&self, tick: u64) -> bool {
        if !self.options.enabled {
            return false;
        }
        let Some(calculator) = self.calculator.as_ref() else {
            return false;
        };
        match self.options.trigger {
            TriggerMode::Flag => calculator.ready(),
            TriggerMode::WallClock => {
                tick.saturating_sub(self.last_trigger_tick) >= self.options.window_ms()
            }
        }
    }

    /// 执行一次计算并发布结果，成功后硬重置计算器
    pub fn run_pass(&mut self, tick: u64, sink: &mut dyn ResultSink) -> PassOutcome {
        let Some(calculator) = self.calculator.as_mut() else {
            return PassOutcome::Skipped;
        };

        let records = match calculator.process() {
            Ok(records) => records,
            Err(e) => {
                self.failures += 1;
                warn!("scintillation pass {} failed: {}", self.passes + 1, e);
                return PassOutcome::Failed;
            }
        };
        let window = calculator.window();

        for record in &records {
            let line = format_record(record, self.options.result_format);
            sink.publish(line.as_bytes());
            if let Some(log) = self.log.as_mut() {
                log.write_line(&line);
            }
        }
        self.passes += 1;
        info!(
            "scintillation pass {} finished: {} satellite(s), window {:?} - {:?}",
            self.passes,
            records.len(),
            window.start,
            window.end
        );

        self.last_output = window.end.or(window.start);
        self.calculator = None;
        self.recreate();
        if self.options.trigger == TriggerMode::WallClock {
            self.last_trigger_tick = tick;
        }

        PassOutcome::Published {
            pass: self.passes,
            records: records.len(),
        }
    }

    fn recreate(&mut self) {
        match self.factory.create(&self.options) {
            Ok(mut calculator) => {
                if let Some(start) = self.last_output {
                    calculator.set_window_start(start);
                }
                self.calculator = Some(calculator);
                self.resets += 1;
                debug!("scintillation calculator reset for next window");
            }
            Err(e) => error!("failed to reinitialize scintillation calculator: {}", e),
        }
    }

    fn ensure_calculator(&mut self) {
        if self.calculator.is_none() {
            self.recreate();
        }
    }

    pub fn window(&self) -> Option<ScintWindow> {
        self.calculator.as_ref().map(|c| c.window())
    }

    pub fn has_calculator(&self) -> bool {
        self.calculator.is_some()
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn last_output(&self) -> Option<DateTime<Utc>> {
        self.last_output
    }

    /// 停止时调用：写入结束标记并关闭日志
    pub fn finish(mut self) {
        if let Some(log) = self.log.take() {
            log.finish();
        }
        self.calculator = None;
    }
}
