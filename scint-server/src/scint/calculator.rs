use super::{ScintCalculator, ScintOptions, ScintWindow, TriggerMode};
use crate::error::ScintError;
use chrono::{DateTime, Utc};
use common::{Measurement, ScintRecord, NFREQ};
use std::collections::BTreeMap;
use std::f64::consts::PI;

#[derive(Debug, Default)]
struct Channel {
    /// 信号强度（线性）
    intensity: Vec<f64>,
    /// 载波相位（弧度）
    phase: Vec<f64>,
    snr_sum: f64,
    snr_count: u32,
}

#[derive(Debug, Default)]
struct SatTrack {
    channels: [Channel; NFREQ],
    azimuth: Option<f32>,
    elevation: Option<f32>,
}

impl SatTrack {
    fn update_geometry(&mut self, azimuth: Option<f32>, elevation: Option<f32>) {
        if azimuth.is_some() {
            self.azimuth = azimuth;
        }
        if elevation.is_some() {
            self.elevation = elevation;
        }
    }
}

/// 幅度闪烁指数 S4 = sqrt((<I²> - <I>²) / <I>²)
pub fn s4_index(intensity: &[f64]) -> Option<f64> {
    if intensity.is_empty() {
        return None;
    }
    let n = intensity.len() as f64;
    let mean = intensity.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return None;
    }
    let mean_sq = intensity.iter().map(|i| i * i).sum::<f64>() / n;
    Some(((mean_sq - mean * mean).max(0.0)).sqrt() / mean)
}

/// 相位闪烁指数：去除线性趋势后的相位标准差（弧度）
pub fn sigma_phi(phase: &[f64]) -> Option<f64> {
    if phase.len() < 2 {
        return None;
    }
    let n = phase.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = phase.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, y) in phase.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let var = phase
        .iter()
        .enumerate()
        .map(|(i, y)| {
            let r = y - (mean_y + slope * (i as f64 - mean_x));
            r * r
        })
        .sum::<f64>()
        / n;
    Some(var.sqrt())
}

/// 默认计算器：按卫星、频点累积强度和相位样本
pub struct S4Calculator {
    options: ScintOptions,
    sats: BTreeMap<u16, SatTrack>,
    window: ScintWindow,
}

impl S4Calculator {
    pub fn new(options: ScintOptions) -> Result<Self, ScintError> {
        if !options.window_secs.is_finite() || options.window_secs <= 0.0 {
            return Err(ScintError::InvalidOptions(format!(
                "window must be positive, got {}",
                options.window_secs
            )));
        }
        if options.min_samples < 2 {
            return Err(ScintError::InvalidOptions(format!(
                "min_samples must be at least 2, got {}",
                options.min_samples
            )));
        }
        Ok(Self {
            options,
            sats: BTreeMap::new(),
            window: ScintWindow::default(),
        })
    }

    fn below_mask(&self, elevation: Option<f32>) -> bool {
        matches!(elevation, Some(el) if el < self.options.elevation_mask_deg)
    }

    fn extend_window(&mut self, time: DateTime<Utc>) {
        if self.window.start.is_none() {
            self.window.start = Some(time);
        }
        if self.window.end.map_or(true, |end| time > end) {
            self.window.end = Some(time);
        }
    }

    fn track(&mut self, sat: u16) -> &mut SatTrack {
        self.sats.entry(sat).or_default()
    }
}

impl ScintCalculator for S4Calculator {
    fn input(&mut self, measurement: &Measurement) -> bool {
        match measurement {
            Measurement::GnssObs(epoch) => {
                let snr_mask = self.options.snr_mask_dbhz;
                let mut any = false;
                for obs in &epoch.sats {
                    if self.below_mask(obs.elevation) {
                        continue;
                    }
                    let track = self.track(obs.sat);
                    track.update_geometry(obs.azimuth, obs.elevation);
                    for (f, channel) in track.channels.iter_mut().enumerate() {
                        let snr = obs.snr[f];
                        if snr > 0.0 && snr >= snr_mask {
                            channel.intensity.push(10f64.powf(f64::from(snr) / 10.0));
                            channel.snr_sum += f64::from(snr);
                            channel.snr_count += 1;
                            any = true;
                        }
                        let phase = obs.phase[f];
                        if phase != 0.0 && phase.is_finite() {
                            channel.phase.push(phase * 2.0 * PI);
                            any = true;
                        }
                    }
                }
                if any {
                    self.extend_window(epoch.time);
                }
                any
            }
            Measurement::GnssPos(set) | Measurement::LeoPos(set) => {
                for pos in &set.sats {
                    self.track(pos.sat)
                        .update_geometry(Some(pos.azimuth), Some(pos.elevation));
                }
                !set.sats.is_empty()
            }
            Measurement::Correlation(block) => {
                let f = block.freq as usize;
                let elevation = self.sats.get(&block.sat).and_then(|t| t.elevation);
                if f >= NFREQ || self.below_mask(elevation) || block.valid_count() == 0 {
                    false
                } else {
                    let channel = &mut self.track(block.sat).channels[f];
                    channel.intensity.extend(
                        block
                            .iq
                            .iter()
                            .filter(|(i, q)| *i != 0.0 || *q != 0.0)
                            .map(|(i, q)| f64::from(*i).powi(2) + f64::from(*q).powi(2)),
                    );
                    self.extend_window(block.time);
                    true
                }
            }
            Measurement::Phase(block) => {
                let f = block.freq as usize;
                let elevation = self.sats.get(&block.sat).and_then(|t| t.elevation);
                if f >= NFREQ || self.below_mask(elevation) || block.valid_count() == 0 {
                    false
                } else {
                    let channel = &mut self.track(block.sat).channels[f];
                    channel.phase.extend(
                        block
                            .phase
                            .iter()
                            .filter(|p| p.is_finite() && **p != 0.0)
                            .map(|p| p * 2.0 * PI),
                    );
                    self.extend_window(block.time);
                    true
                }
            }
            Measurement::Ephemeris(_) | Measurement::Solution(_) => false,
        }
    }

    fn ready(&self) -> bool {
        self.options.trigger == TriggerMode::Flag
            && self.window.span_ms() as f64 >= self.options.window_secs * 1000.0
    }

    fn process(&mut self) -> Result<Vec<ScintRecord>, ScintError> {
        let (Some(start), Some(end)) = (self.window.start, self.window.end) else {
            return Err(ScintError::InsufficientData("no data in window".into()));
        };
        let min = self.options.min_samples;

        let mut records = Vec::new();
        for (&sat, track) in &self.sats {
            let mut record = ScintRecord {
                sat,
                start,
                end,
                s4: [None; NFREQ],
                sigma_phi: [None; NFREQ],
                mean_snr: [None; NFREQ],
                samples: 0,
                azimuth: track.azimuth,
                elevation: track.elevation,
            };
            let mut has_value = false;
            for (f, channel) in track.channels.iter().enumerate() {
                if channel.intensity.len() >= min {
                    record.s4[f] = s4_index(&channel.intensity);
                    has_value |= record.s4[f].is_some();
                }
                if channel.phase.len() >= min {
                    record.sigma_phi[f] = sigma_phi(&channel.phase);
                    has_value |= record.sigma_phi[f].is_some();
                }
                if channel.snr_count > 0 {
                    record.mean_snr[f] = Some(channel.snr_sum / f64::from(channel.snr_count));
                }
                let samples = channel.intensity.len().max(channel.phase.len()) as u32;
                record.samples = record.samples.max(samples);
            }
            if has_value {
                records.push(record);
            }
        }

        if records.is_empty() {
            return Err(ScintError::InsufficientData(format!(
                "no satellite reached {} samples",
                min
            )));
        }
        Ok(records)
    }

    fn window(&self) -> ScintWindow {
        self.window
    }

    fn set_window_start(&mut self, start: DateTime<Utc>) {
        self.window.start = Some(start);
    }
}
