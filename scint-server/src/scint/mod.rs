// 闪烁监测服务器 - 电离层闪烁计算
//
// 计算器按窗口累积测量数据，窗口满足条件后一次性计算各卫星的 S4 与
// sigma-phi。调度器决定何时计算，并在每次成功计算后重建计算器。

pub mod calculator;
pub mod scheduler;

use crate::error::ScintError;
use chrono::{DateTime, Utc};
use common::utils::{satellite_id, time_to_string};
use common::{Measurement, ScintRecord};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use calculator::S4Calculator;
pub use scheduler::{PassOutcome, PeriodicScheduler, ResultSink};

/// 计算触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// 计算器自己判断数据已覆盖整个窗口
    Flag,
    /// 距上次计算的系统时间达到窗口长度
    #[default]
    WallClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScintOptions {
    pub enabled: bool,
    pub trigger: TriggerMode,
    pub window_secs: f64,
    /// 每个频点参与计算的最少样本数
    pub min_samples: usize,
    pub elevation_mask_deg: f32,
    pub snr_mask_dbhz: f32,
    pub log_path: Option<PathBuf>,
    pub result_format: ResultFormat,
}

impl Default for ScintOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger: TriggerMode::WallClock,
            window_secs: 60.0,
            min_samples: 10,
            elevation_mask_deg: 10.0,
            snr_mask_dbhz: 20.0,
            log_path: None,
            result_format: ResultFormat::Text,
        }
    }
}

impl ScintOptions {
    pub fn window_ms(&self) -> u64 {
        (self.window_secs * 1000.0).max(0.0) as u64
    }
}

/// 当前累积窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScintWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ScintWindow {
    pub fn span_ms(&self) -> i64 {
        match (self.start, self.end) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        }
    }
}

/// 闪烁计算器
pub trait ScintCalculator: Send {
    /// 输入一条测量记录，返回是否被采用
    fn input(&mut self, measurement: &Measurement) -> bool;
    /// 数据是否已满足一个计算窗口
    fn ready(&self) -> bool;
    /// 计算当前窗口，失败时不改变累积状态
    fn process(&mut self) -> Result<Vec<ScintRecord>, ScintError>;
    fn window(&self) -> ScintWindow;
    fn set_window_start(&mut self, start: DateTime<Utc>);
}

pub trait CalculatorFactory: Send + Sync {
    fn create(&self, options: &ScintOptions) -> Result<Box<dyn ScintCalculator>, ScintError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCalculatorFactory;

impl CalculatorFactory for DefaultCalculatorFactory {
    fn create(&self, options: &ScintOptions) -> Result<Box<dyn ScintCalculator>, ScintError> {
        Ok(Box::new(S4Calculator::new(options.clone())?))
    }
}

fn field(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_default()
}

/// 单颗卫星结果的输出行
pub fn format_record(record: &ScintRecord, format: ResultFormat) -> String {
    match format {
        ResultFormat::Text => {
            let mut line = format!(
                "$SCINT,{},{},{},{},{}",
                time_to_string(&record.start),
                time_to_string(&record.end),
                satellite_id(record.sat),
                field(record.azimuth.map(f64::from), 1),
                field(record.elevation.map(f64::from), 1),
            );
            for s4 in record.s4 {
                line.push(',');
                line.push_str(&field(s4, 4));
            }
            for sigma in record.sigma_phi {
                line.push(',');
                line.push_str(&field(sigma, 4));
            }
            for snr in record.mean_snr {
                line.push(',');
                line.push_str(&field(snr, 1));
            }
            line.push_str(&format!(",{}\r\n", record.samples));
            line
        }
        ResultFormat::Json => {
            let mut line = serde_json::to_string(record).unwrap_or_default();
            line.push('\n');
            line
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> ScintRecord {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        ScintRecord {
            sat: 12,
            start,
            end: start + chrono::Duration::seconds(60),
            s4: [Some(0.12346), None, Some(0.5)],
            sigma_phi: [Some(0.05), None, None],
            mean_snr: [Some(44.26), None, Some(40.0)],
            samples: 600,
            azimuth: Some(123.4),
            elevation: None,
        }
    }

    #[test]
    fn test_format_text_record() {
        let line = format_record(&record(), ResultFormat::Text);
        assert_eq!(
            line,
            "$SCINT,2025/01/01 00:00:00.000,2025/01/01 00:01:00.000,G12,123.4,,\
             0.1235,,0.5000,0.0500,,,44.3,,40.0,600\r\n"
        );
    }

    #[test]
    fn test_format_json_record() {
        let line = format_record(&record(), ResultFormat::Json);
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["sat"], 12);
        assert_eq!(value["samples"], 600);
    }

    #[test]
    fn test_window_span() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let window = ScintWindow {
            start: Some(start),
            end: Some(start + chrono::Duration::milliseconds(1500)),
        };
        assert_eq!(window.span_ms(), 1500);
        assert_eq!(ScintWindow::default().span_ms(), 0);
    }
}
