// 闪烁监测服务器 - 配置
//
// StartOptions 对应 start 的全部参数，ServerConfig 是可执行程序读取的配置文件，
// 支持 TOML 与 JSON 两种格式（按扩展名区分）。

use crate::decode::InputFormat;
use crate::scint::ScintOptions;
use crate::stream::{StreamKind, FIRST_OUTPUT, MONITOR_STREAM, NUM_INPUTS, NUM_OUTPUTS};
use anyhow::{Context, Result};
use common::ReceiverRole;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MIN_CYCLE_MS: u64 = 1;
pub const MIN_BUFFER_SIZE: usize = 4096;
pub const MIN_NMEA_CYCLE_MS: u64 = 1000;

/// 端点类型与路径
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSpec {
    pub kind: StreamKind,
    pub path: String,
}

impl StreamSpec {
    pub fn new(kind: StreamKind, path: &str) -> Self {
        Self {
            kind,
            path: path.to_string(),
        }
    }
}

/// 导航数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavSelect {
    Primary,
    Reference,
    Correction,
    #[default]
    All,
}

impl NavSelect {
    pub fn accepts(self, role: ReceiverRole) -> bool {
        match self {
            NavSelect::All => true,
            NavSelect::Primary => role == ReceiverRole::Primary,
            NavSelect::Reference => role == ReceiverRole::Reference,
            NavSelect::Correction => role == ReceiverRole::Correction,
        }
    }
}

/// 向参考接收机发送 GGA 的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NmeaRequestMode {
    #[default]
    Off,
    /// 固定位置
    Fixed,
    /// 最新解
    Latest,
    /// 最新解，无解时发送复位命令
    ResetAndLatest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmeaRequest {
    pub mode: NmeaRequestMode,
    pub cycle_ms: u64,
    /// 固定位置：纬度（度）、经度（度）、椭球高（米）
    pub position: [f64; 3],
    pub reset_command: String,
}

impl Default for NmeaRequest {
    fn default() -> Self {
        Self {
            mode: NmeaRequestMode::Off,
            cycle_ms: 5000,
            position: [0.0; 3],
            reset_command: String::new(),
        }
    }
}

/// 解输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolutionFormat {
    #[default]
    Llh,
    Xyz,
    Nmea,
    Stat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolutionOutputOptions {
    pub format: SolutionFormat,
    /// 文本格式是否输出 % 注释头
    pub header: bool,
}

impl Default for SolutionOutputOptions {
    fn default() -> Self {
        Self {
            format: SolutionFormat::Llh,
            header: true,
        }
    }
}

/// 定位结果对象的选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    /// 哪一路输入解码出的接收机解作为当前定位结果
    pub solution_source: ReceiverRole,
    /// 观测状态中判定卫星有效的高度角门限（度）
    pub elevation_mask_deg: f64,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            solution_source: ReceiverRole::Primary,
            elevation_mask_deg: 15.0,
        }
    }
}

/// start 的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartOptions {
    pub cycle_ms: u64,
    pub buffer_size: usize,
    /// 0..2 输入，3..4 解输出，5..7 原始日志
    pub streams: [StreamSpec; 8],
    pub input_formats: [InputFormat; NUM_INPUTS],
    pub nav_select: NavSelect,
    pub start_commands: [String; NUM_INPUTS],
    pub periodic_commands: [String; NUM_INPUTS],
    pub receiver_options: [String; NUM_INPUTS],
    pub nmea: NmeaRequest,
    pub processing: ProcessingOptions,
    pub solution_outputs: [SolutionOutputOptions; NUM_OUTPUTS],
    pub monitor: Option<StreamSpec>,
    pub scint: ScintOptions,
    /// 解码记录的 JSON 行日志
    pub measurement_log: Option<PathBuf>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            cycle_ms: 10,
            buffer_size: 32768,
            streams: Default::default(),
            input_formats: Default::default(),
            nav_select: NavSelect::All,
            start_commands: Default::default(),
            periodic_commands: Default::default(),
            receiver_options: Default::default(),
            nmea: NmeaRequest::default(),
            processing: ProcessingOptions::default(),
            solution_outputs: Default::default(),
            monitor: None,
            scint: ScintOptions::default(),
            measurement_log: None,
        }
    }
}

impl StartOptions {
    /// 按下限修正周期、缓冲大小和 NMEA 请求周期
    pub fn normalized(&self) -> Self {
        let mut options = self.clone();
        options.cycle_ms = options.cycle_ms.max(MIN_CYCLE_MS);
        options.buffer_size = options.buffer_size.max(MIN_BUFFER_SIZE);
        options.nmea.cycle_ms = options.nmea.cycle_ms.max(MIN_NMEA_CYCLE_MS);
        options
    }

    /// 0..=8 号端点的配置，8 为监视流
    pub fn stream(&self, index: usize) -> StreamSpec {
        if index == MONITOR_STREAM {
            return self.monitor.clone().unwrap_or_default();
        }
        self.streams.get(index).cloned().unwrap_or_default()
    }

    pub fn solution_output(&self, stream_index: usize) -> Option<&SolutionOutputOptions> {
        stream_index
            .checked_sub(FIRST_OUTPUT)
            .and_then(|i| self.solution_outputs.get(i))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 可执行程序的配置文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub start: StartOptions,
    pub logging: LoggingConfig,
    pub status_interval_secs: u64,
    pub stop_commands: [String; NUM_INPUTS],
    pub memory_limit_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            start: StartOptions::default(),
            logging: LoggingConfig::default(),
            status_interval_secs: 10,
            stop_commands: Default::default(),
            memory_limit_bytes: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config = if is_json {
            serde_json::from_str(content)
                .with_context(|| format!("invalid JSON config {}", path.display()))?
        } else {
            toml::from_str(content)
                .with_context(|| format!("invalid TOML config {}", path.display()))?
        };
        Ok(config)
    }
}
