use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 最大卫星编号（GPS+GLONASS+Galileo+BDS+QZSS+SBAS 合计）
pub const MAX_SAT: usize = 221;

/// 每颗卫星的频点数
pub const NFREQ: usize = 3;

/// 单个历元的最大观测数
pub const MAX_OBS: usize = 96;

/// 每路输入保留的观测缓冲数
pub const MAX_OBS_BUF: usize = 4;

/// 接收机角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverRole {
    Primary,
    Reference,
    Correction,
}

impl ReceiverRole {
    pub const ALL: [ReceiverRole; 3] = [
        ReceiverRole::Primary,
        ReceiverRole::Reference,
        ReceiverRole::Correction,
    ];

    pub fn index(self) -> usize {
        match self {
            ReceiverRole::Primary => 0,
            ReceiverRole::Reference => 1,
            ReceiverRole::Correction => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// 单颗卫星的观测值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatObservation {
    /// 卫星编号（1..=MAX_SAT）
    pub sat: u16,
    /// 载噪比（dB-Hz），0 表示无效
    pub snr: [f32; NFREQ],
    /// 载波相位（周），0 表示无效
    pub phase: [f64; NFREQ],
    /// 方位角（度），接收机未给出时为 None
    pub azimuth: Option<f32>,
    /// 高度角（度）
    pub elevation: Option<f32>,
}

/// 一个观测历元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsEpoch {
    pub time: DateTime<Utc>,
    pub sats: Vec<SatObservation>,
}

impl ObsEpoch {
    pub fn nsat(&self) -> usize {
        self.sats.len()
    }
}

/// 卫星方位/高度角
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SatPosition {
    pub sat: u16,
    pub azimuth: f32,
    pub elevation: f32,
}

/// 一组卫星位置（GNSS 或 LEO）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSet {
    pub time: DateTime<Utc>,
    pub sats: Vec<SatPosition>,
}

/// 高速 I/Q 相关值块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationBlock {
    pub time: DateTime<Utc>,
    pub sat: u16,
    pub freq: u8,
    pub iq: Vec<(f32, f32)>,
}

impl CorrelationBlock {
    pub fn valid_count(&self) -> usize {
        self.iq.iter().filter(|(i, q)| *i != 0.0 || *q != 0.0).count()
    }
}

/// 高速载波相位块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseBlock {
    pub time: DateTime<Utc>,
    pub sat: u16,
    pub freq: u8,
    pub phase: Vec<f64>,
}

impl PhaseBlock {
    pub fn valid_count(&self) -> usize {
        self.phase.iter().filter(|p| p.is_finite() && **p != 0.0).count()
    }
}

/// 广播星历（导航缓存只关心身份与时效）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ephemeris {
    pub sat: u16,
    pub iode: i32,
    /// 星历参考时刻
    pub toe: DateTime<Utc>,
    /// 接收时刻
    pub ttr: DateTime<Utc>,
    pub health: u8,
}

/// 解状态，数值与输出文本中的 Q 字段一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolutionStatus {
    #[default]
    None,
    Fix,
    Float,
    Sbas,
    Dgps,
    Single,
    Ppp,
}

impl SolutionStatus {
    pub fn code(self) -> u8 {
        match self {
            SolutionStatus::None => 0,
            SolutionStatus::Fix => 1,
            SolutionStatus::Float => 2,
            SolutionStatus::Sbas => 3,
            SolutionStatus::Dgps => 4,
            SolutionStatus::Single => 5,
            SolutionStatus::Ppp => 6,
        }
    }

    /// NMEA GGA 定位质量
    pub fn gga_quality(self) -> u8 {
        match self {
            SolutionStatus::None => 0,
            SolutionStatus::Single => 1,
            SolutionStatus::Dgps | SolutionStatus::Sbas => 2,
            SolutionStatus::Ppp => 3,
            SolutionStatus::Fix => 4,
            SolutionStatus::Float => 5,
        }
    }
}

/// 定位解
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Solution {
    pub time: DateTime<Utc>,
    pub status: SolutionStatus,
    /// 接收机 ECEF 位置（米）
    pub ecef: [f64; 3],
    pub nsat: u8,
}

/// 解码得到的测量记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    GnssObs(ObsEpoch),
    GnssPos(PositionSet),
    LeoPos(PositionSet),
    Correlation(CorrelationBlock),
    Phase(PhaseBlock),
    Ephemeris(Ephemeris),
    Solution(Solution),
}

impl Measurement {
    /// 帧头中的消息 ID
    pub fn message_id(&self) -> u8 {
        match self {
            Measurement::GnssObs(_) => 0x01,
            Measurement::GnssPos(_) => 0x02,
            Measurement::LeoPos(_) => 0x03,
            Measurement::Correlation(_) => 0x04,
            Measurement::Phase(_) => 0x05,
            Measurement::Ephemeris(_) => 0x06,
            Measurement::Solution(_) => 0x07,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Measurement::GnssObs(e) => e.time,
            Measurement::GnssPos(p) | Measurement::LeoPos(p) => p.time,
            Measurement::Correlation(c) => c.time,
            Measurement::Phase(p) => p.time,
            Measurement::Ephemeris(e) => e.ttr,
            Measurement::Solution(s) => s.time,
        }
    }

    /// 是否含有可供闪烁计算使用的数据
    pub fn has_samples(&self) -> bool {
        match self {
            Measurement::GnssObs(e) => e.nsat() > 0,
            Measurement::GnssPos(p) | Measurement::LeoPos(p) => !p.sats.is_empty(),
            Measurement::Correlation(c) => c.valid_count() > 0,
            Measurement::Phase(p) => p.valid_count() > 0,
            Measurement::Ephemeris(_) | Measurement::Solution(_) => false,
        }
    }
}

/// 单颗卫星一个计算窗口的闪烁参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScintRecord {
    pub sat: u16,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// 幅度闪烁指数 S4，无数据的频点为 None
    pub s4: [Option<f64>; NFREQ],
    /// 相位闪烁指数 sigma-phi（弧度）
    pub sigma_phi: [Option<f64>; NFREQ],
    pub mean_snr: [Option<f64>; NFREQ],
    pub samples: u32,
    pub azimuth: Option<f32>,
    pub elevation: Option<f32>,
}
