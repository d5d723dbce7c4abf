// 接收机模拟器 - 合成测量数据
//
// 每颗卫星沿一条缓慢变化的轨迹运动，相关块幅度和载波相位叠加与
// 闪烁强度成比例的随机扰动。每个历元输出观测、相关块、相位块和定位解，
// 卫星位置和星历按较长的间隔输出。

use chrono::{DateTime, Duration, Utc};
use common::utils::geodetic_to_ecef;
use common::{
    encode_frame, CorrelationBlock, Ephemeris, FrameError, Measurement, ObsEpoch, PhaseBlock,
    PositionSet, SatObservation, SatPosition, Solution, SolutionStatus, NFREQ,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

/// 卫星位置的输出间隔（历元数）
const POSITION_EVERY: u64 = 10;
/// 星历的输出间隔（历元数）
const EPHEMERIS_EVERY: u64 = 300;
/// 载波相位的名义变化率（周/秒）
const DOPPLER_HZ: f64 = 1200.0;

/// 模拟接收机的天线位置：纬度、经度（弧度），椭球高（米）
const STATION: [f64; 3] = [0.523_598_8, 2.094_395_1, 50.0];

#[derive(Debug, Clone)]
struct SimSat {
    sat: u16,
    /// 轨迹相位（弧度）
    track: f64,
    azimuth0: f64,
    phase: [f64; NFREQ],
    iode: i32,
}

impl SimSat {
    fn elevation(&self, t: f64) -> f64 {
        15.0 + 70.0 * (self.track + t * 1e-4).sin().abs()
    }

    fn azimuth(&self, t: f64) -> f64 {
        (self.azimuth0 + t * 5e-3).rem_euclid(360.0)
    }

    /// 高度角越高信噪比越高
    fn snr(&self, elevation: f64) -> f64 {
        35.0 + 15.0 * (elevation / 90.0)
    }
}

/// 合成测量生成器
pub struct SkyGenerator {
    sats: Vec<SimSat>,
    scintillation: f64,
    samples: usize,
    interval_ms: u64,
    epoch: u64,
    rng: StdRng,
}

impl SkyGenerator {
    pub fn new(nsat: u16, scintillation: f64, samples: usize, interval_ms: u64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let sats = (1..=nsat)
            .map(|sat| SimSat {
                sat,
                track: rng.gen_range(0.0..PI),
                azimuth0: rng.gen_range(0.0..360.0),
                phase: [0.0; NFREQ],
                iode: rng.gen_range(0..256),
            })
            .collect();
        Self {
            sats,
            scintillation,
            samples,
            interval_ms,
            epoch: 0,
            rng,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 标准正态随机数
    fn gaussian(&mut self) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    /// 生成一个历元的全部测量记录
    pub fn next_epoch(&mut self, time: DateTime<Utc>) -> Vec<Measurement> {
        let t = self.epoch as f64 * self.interval_ms as f64 / 1000.0;
        let dt = self.interval_ms as f64 / 1000.0;
        let mut records = Vec::new();

        if self.epoch % EPHEMERIS_EVERY == 0 {
            for sat in self.sats.iter_mut() {
                sat.iode = (sat.iode + 1) % 256;
                records.push(Measurement::Ephemeris(Ephemeris {
                    sat: sat.sat,
                    iode: sat.iode,
                    toe: time,
                    ttr: time,
                    health: 0,
                }));
            }
        }

        if self.epoch % POSITION_EVERY == 0 {
            records.push(Measurement::GnssPos(PositionSet {
                time,
                sats: self
                    .sats
                    .iter()
                    .map(|s| SatPosition {
                        sat: s.sat,
                        azimuth: s.azimuth(t) as f32,
                        elevation: s.elevation(t) as f32,
                    })
                    .collect(),
            }));
        }

        let mut observations = Vec::with_capacity(self.sats.len());
        for i in 0..self.sats.len() {
            let elevation = self.sats[i].elevation(t);
            let azimuth = self.sats[i].azimuth(t);
            let snr = self.sats[i].snr(elevation);

            // 幅度扰动
            let mut iq = Vec::with_capacity(self.samples);
            for _ in 0..self.samples {
                let amplitude = (1.0 + self.scintillation * self.gaussian()).max(0.01);
                let angle = self.rng.gen_range(-0.05..0.05);
                iq.push(((amplitude * f64::cos(angle)) as f32, (amplitude * f64::sin(angle)) as f32));
            }
            records.push(Measurement::Correlation(CorrelationBlock {
                time,
                sat: self.sats[i].sat,
                freq: 0,
                iq,
            }));

            // 相位扰动叠加在线性变化上，单位为周
            let step = DOPPLER_HZ * dt / self.samples as f64;
            let mut phase = Vec::with_capacity(self.samples);
            let mut value = self.sats[i].phase[0];
            for _ in 0..self.samples {
                value += step;
                phase.push(value + self.scintillation * 0.1 * self.gaussian());
            }
            self.sats[i].phase[0] = value;
            records.push(Measurement::Phase(PhaseBlock {
                time,
                sat: self.sats[i].sat,
                freq: 0,
                phase,
            }));

            let sat = &mut self.sats[i];
            sat.phase[1] += DOPPLER_HZ * 0.779 * dt;
            observations.push(SatObservation {
                sat: sat.sat,
                snr: [snr as f32, (snr - 3.0) as f32, 0.0],
                phase: [sat.phase[0], sat.phase[1], 0.0],
                azimuth: Some(azimuth as f32),
                elevation: Some(elevation as f32),
            });
        }
        records.push(Measurement::GnssObs(ObsEpoch {
            time,
            sats: observations,
        }));

        let offset = [
            self.rng.gen_range(-1e-7..1e-7),
            self.rng.gen_range(-1e-7..1e-7),
            self.rng.gen_range(-2.0..2.0),
        ];
        let position = [
            STATION[0] + offset[0],
            STATION[1] + offset[1],
            STATION[2] + offset[2],
        ];
        records.push(Measurement::Solution(Solution {
            time,
            status: SolutionStatus::Single,
            ecef: geodetic_to_ecef(&position),
            nsat: self.sats.len().min(u8::MAX as usize) as u8,
        }));

        self.epoch += 1;
        records
    }

    /// 生成一个历元并编码为连续的帧
    pub fn next_frames(&mut self, time: DateTime<Utc>) -> Result<Vec<u8>, FrameError> {
        let mut bytes = Vec::new();
        for record in self.next_epoch(time) {
            bytes.extend(encode_frame(&record)?);
        }
        Ok(bytes)
    }

    /// 第 n 个历元的时刻
    pub fn epoch_time(&self, origin: DateTime<Utc>, n: u64) -> DateTime<Utc> {
        origin + Duration::milliseconds((n * self.interval_ms) as i64)
    }
}
