// 闪烁监测服务器 - 定位结果与解输出格式
//
// 输入流解码出的接收机解作为当前定位结果。每周期若有新解，按两路解输出
// 各自的格式写出，并复制一行 LLH 到监视流。

use crate::config::{ProcessingOptions, SolutionFormat, SolutionOutputOptions};
use chrono::{DateTime, Timelike, Utc};
use common::utils::{ecef_to_geodetic, nmea_checksum, time_to_string, utc_to_gps_week_tow};
use common::{ReceiverRole, Solution, SolutionStatus};

/// 定位结果对象，每次 start 时重建
#[derive(Debug, Clone)]
pub struct PositionState {
    options: ProcessingOptions,
    latest: Option<Solution>,
    pending: bool,
    count: u64,
}

impl PositionState {
    pub fn new(options: ProcessingOptions) -> Self {
        Self {
            options,
            latest: None,
            pending: false,
            count: 0,
        }
    }

    pub fn options(&self) -> &ProcessingOptions {
        &self.options
    }

    /// 只采用指定来源接收机的解
    pub fn update(&mut self, role: ReceiverRole, solution: Solution) -> bool {
        if role != self.options.solution_source {
            return false;
        }
        self.latest = Some(solution);
        self.pending = true;
        self.count += 1;
        true
    }

    /// 取出尚未发布的新解
    pub fn take_pending(&mut self) -> Option<Solution> {
        if !self.pending {
            return None;
        }
        self.pending = false;
        self.latest.clone()
    }

    /// 最新解，无解时返回状态为 None 的空解
    pub fn latest(&self) -> Solution {
        self.latest.clone().unwrap_or_default()
    }

    pub fn has_solution(&self) -> bool {
        self.latest
            .as_ref()
            .map_or(false, |s| s.status != SolutionStatus::None)
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Default for PositionState {
    fn default() -> Self {
        Self::new(ProcessingOptions::default())
    }
}

fn llh_degrees(solution: &Solution) -> [f64; 3] {
    let pos = ecef_to_geodetic(&solution.ecef);
    [pos[0].to_degrees(), pos[1].to_degrees(), pos[2]]
}

/// 文本格式的 % 注释头，NMEA 与状态格式没有头
pub fn solution_header(options: &SolutionOutputOptions) -> Option<String> {
    if !options.header {
        return None;
    }
    match options.format {
        SolutionFormat::Llh => Some(format!(
            "% {:<23} {:>14} {:>14} {:>10} {:>3} {:>3}\r\n",
            "UTC", "latitude(deg)", "longitude(deg)", "height(m)", "Q", "ns"
        )),
        SolutionFormat::Xyz => Some(format!(
            "% {:<23} {:>14} {:>14} {:>14} {:>3} {:>3}\r\n",
            "UTC", "x-ecef(m)", "y-ecef(m)", "z-ecef(m)", "Q", "ns"
        )),
        SolutionFormat::Nmea | SolutionFormat::Stat => None,
    }
}

/// 按输出格式格式化一条解
pub fn format_solution(solution: &Solution, format: SolutionFormat) -> String {
    let time = time_to_string(&solution.time);
    let q = solution.status.code();
    match format {
        SolutionFormat::Llh => {
            let pos = llh_degrees(solution);
            format!(
                "{} {:14.9} {:14.9} {:10.4} {:3} {:3}\r\n",
                time, pos[0], pos[1], pos[2], q, solution.nsat
            )
        }
        SolutionFormat::Xyz => format!(
            "{} {:14.4} {:14.4} {:14.4} {:3} {:3}\r\n",
            time, solution.ecef[0], solution.ecef[1], solution.ecef[2], q, solution.nsat
        ),
        SolutionFormat::Nmea => {
            let pos = llh_degrees(solution);
            format_gga(
                &solution.time,
                &pos,
                solution.status.gga_quality(),
                solution.nsat,
            )
        }
        SolutionFormat::Stat => {
            let (week, tow) = utc_to_gps_week_tow(&solution.time);
            format!(
                "$POS,{},{:.3},{},{:.4},{:.4},{:.4},0.0000,0.0000,0.0000\r\n",
                week, tow, q, solution.ecef[0], solution.ecef[1], solution.ecef[2]
            )
        }
    }
}

fn nmea_sentence(body: &str) -> String {
    format!("${}*{:02X}\r\n", body, nmea_checksum(body))
}

fn nmea_coordinate(value: f64, degree_width: usize) -> (String, bool) {
    let abs = value.abs();
    let mut degrees = abs.floor();
    let mut minutes = (abs - degrees) * 60.0;
    if minutes >= 59.999_999_95 {
        degrees += 1.0;
        minutes = 0.0;
    }
    (
        format!(
            "{:0width$}{:010.7}",
            degrees as u32,
            minutes,
            width = degree_width
        ),
        value >= 0.0,
    )
}

/// GGA 语句。pos 为纬度（度）、经度（度）、椭球高（米）；quality 为 0 时输出空语句
pub fn format_gga(time: &DateTime<Utc>, pos: &[f64; 3], quality: u8, nsat: u8) -> String {
    if quality == 0 {
        return nmea_sentence("GPGGA,,,,,,,,,,,,,,");
    }
    let seconds = f64::from(time.second()) + f64::from(time.nanosecond()) / 1e9;
    let (lat, north) = nmea_coordinate(pos[0], 2);
    let (lon, east) = nmea_coordinate(pos[1], 3);
    let body = format!(
        "GPGGA,{:02}{:02}{:05.2},{},{},{},{},{},{:02},1.0,{:.3},M,0.000,M,,",
        time.hour(),
        time.minute(),
        seconds,
        lat,
        if north { 'N' } else { 'S' },
        lon,
        if east { 'E' } else { 'W' },
        quality,
        nsat,
        pos[2]
    );
    nmea_sentence(&body)
}

/// 标记行。Stat 格式为 $MARK，NMEA 格式为带校验和的 $GPTXT，其余为 % 注释行
pub fn format_mark(format: SolutionFormat, solution: &Solution, name: &str, comment: &str) -> String {
    let stat = solution.status.code();
    match format {
        SolutionFormat::Stat => {
            let (week, tow) = utc_to_gps_week_tow(&solution.time);
            format!(
                "$MARK,{},{:.3},{},{:.4},{:.4},{:.4},{},{}\r\n",
                week,
                tow,
                stat,
                solution.ecef[0],
                solution.ecef[1],
                solution.ecef[2],
                name,
                comment
            )
        }
        SolutionFormat::Nmea => {
            let pos = llh_degrees(solution);
            let body = format!(
                "GPTXT,01,01,02,MARK:{},{},{:.9},{:.9},{:.4},{},{}",
                name,
                time_to_string(&solution.time),
                pos[0],
                pos[1],
                pos[2],
                stat,
                comment
            );
            nmea_sentence(&body)
        }
        SolutionFormat::Llh | SolutionFormat::Xyz => {
            let pos = llh_degrees(solution);
            format!(
                "% MARK: {},{},{:.9},{:.9},{:.4},{},{}\r\n",
                name,
                time_to_string(&solution.time),
                pos[0],
                pos[1],
                pos[2],
                stat,
                comment
            )
        }
    }
}
