// 闪烁监测服务器 - 导航数据缓存与观测状态
//
// 导航缓存按卫星保存当前和上一组星历。观测存储保存各接收机最近的观测历元
// 以及每颗卫星最新的方位/高度角，用于状态查询。

use chrono::{DateTime, Utc};
use common::{Ephemeris, ObsEpoch, PositionSet, ReceiverRole, SatObservation, MAX_OBS, MAX_OBS_BUF, MAX_SAT, NFREQ};
use serde::Serialize;
use std::collections::VecDeque;
use std::mem::size_of;
use tracing::trace;

/// 星历缓存
#[derive(Debug)]
pub struct NavCache {
    current: Vec<Option<Ephemeris>>,
    previous: Vec<Option<Ephemeris>>,
    updates: u64,
}

impl NavCache {
    /// init 时需要预留的字节数
    pub fn footprint() -> usize {
        2 * MAX_SAT * size_of::<Option<Ephemeris>>()
    }

    pub fn new() -> Self {
        Self {
            current: vec![None; MAX_SAT],
            previous: vec![None; MAX_SAT],
            updates: 0,
        }
    }

    /// 更新星历，重复的星历（同 IODE 同 TOE 且接收时刻未被复位）被忽略
    pub fn update(&mut self, eph: Ephemeris) -> bool {
        let Some(idx) = (eph.sat as usize).checked_sub(1).filter(|i| *i < MAX_SAT) else {
            return false;
        };
        if let Some(current) = &self.current[idx] {
            let reset = current.ttr == DateTime::<Utc>::default();
            if !reset && current.iode == eph.iode && current.toe == eph.toe {
                return false;
            }
        }
        trace!("ephemeris update sat={} iode={}", eph.sat, eph.iode);
        self.previous[idx] = self.current[idx].take();
        self.current[idx] = Some(eph);
        self.updates += 1;
        true
    }

    /// 启动时复位所有星历的接收时刻，使重新收到的星历都会被采用
    pub fn reset_receive_times(&mut self) {
        for eph in self.current.iter_mut().chain(self.previous.iter_mut()).flatten() {
            eph.ttr = DateTime::<Utc>::default();
        }
    }

    pub fn get(&self, sat: u16) -> Option<&Ephemeris> {
        let idx = (sat as usize).checked_sub(1)?;
        self.current.get(idx)?.as_ref()
    }

    pub fn previous(&self, sat: u16) -> Option<&Ephemeris> {
        let idx = (sat as usize).checked_sub(1)?;
        self.previous.get(idx)?.as_ref()
    }

    pub fn len(&self) -> usize {
        self.current.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl Default for NavCache {
    fn default() -> Self {
        Self::new()
    }
}

/// 单颗卫星的观测状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SatStatus {
    pub sat: u16,
    pub azimuth: Option<f32>,
    pub elevation: Option<f32>,
    pub snr: [f32; NFREQ],
    pub valid: bool,
}

/// 观测状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObservationStatus {
    pub time: Option<DateTime<Utc>>,
    pub sats: Vec<SatStatus>,
}

/// 各接收机最近的观测
#[derive(Debug)]
pub struct ObservationStore {
    epochs: [VecDeque<ObsEpoch>; 3],
    geometry: Vec<Option<(f32, f32)>>,
}

impl ObservationStore {
    pub fn footprint() -> usize {
        3 * MAX_OBS_BUF * MAX_OBS * size_of::<SatObservation>()
            + MAX_SAT * size_of::<Option<(f32, f32)>>()
    }

    pub fn new() -> Self {
        Self {
            epochs: std::array::from_fn(|_| VecDeque::with_capacity(MAX_OBS_BUF)),
            geometry: vec![None; MAX_SAT],
        }
    }

    pub fn push(&mut self, role: ReceiverRole, mut epoch: ObsEpoch) {
        epoch.sats.truncate(MAX_OBS);
        for obs in &epoch.sats {
            if let (Some(az), Some(el)) = (obs.azimuth, obs.elevation) {
                self.set_geometry(obs.sat, az, el);
            }
        }
        let buffer = &mut self.epochs[role.index()];
        buffer.push_front(epoch);
        buffer.truncate(MAX_OBS_BUF);
    }

    pub fn update_geometry(&mut self, set: &PositionSet) {
        for pos in &set.sats {
            self.set_geometry(pos.sat, pos.azimuth, pos.elevation);
        }
    }

    fn set_geometry(&mut self, sat: u16, azimuth: f32, elevation: f32) {
        if let Some(slot) = (sat as usize)
            .checked_sub(1)
            .and_then(|i| self.geometry.get_mut(i))
        {
            *slot = Some((azimuth, elevation));
        }
    }

    fn geometry(&self, sat: u16) -> Option<(f32, f32)> {
        let idx = (sat as usize).checked_sub(1)?;
        self.geometry.get(idx).copied().flatten()
    }

    pub fn latest(&self, role: ReceiverRole) -> Option<&ObsEpoch> {
        self.epochs[role.index()].front()
    }

    /// 某接收机最新历元的卫星状态
    pub fn status(&self, role: ReceiverRole, elevation_mask_deg: f64) -> ObservationStatus {
        let Some(epoch) = self.latest(role) else {
            return ObservationStatus::default();
        };
        let sats = epoch
            .sats
            .iter()
            .map(|obs| {
                let (azimuth, elevation) = match (obs.azimuth, obs.elevation) {
                    (Some(az), Some(el)) => (Some(az), Some(el)),
                    _ => match self.geometry(obs.sat) {
                        Some((az, el)) => (Some(az), Some(el)),
                        None => (obs.azimuth, obs.elevation),
                    },
                };
                let valid = obs.snr[0] > 0.0
                    && elevation.map_or(false, |el| f64::from(el) >= elevation_mask_deg);
                SatStatus {
                    sat: obs.sat,
                    azimuth,
                    elevation,
                    snr: obs.snr,
                    valid,
                }
            })
            .collect();
        ObservationStatus {
            time: Some(epoch.time),
            sats,
        }
    }

    pub fn clear(&mut self) {
        for buffer in &mut self.epochs {
            buffer.clear();
        }
        self.geometry.iter_mut().for_each(|g| *g = None);
    }
}

impl Default for ObservationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::SatPosition;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()
    }

    fn eph(sat: u16, iode: i32) -> Ephemeris {
        Ephemeris {
            sat,
            iode,
            toe: t0(),
            ttr: t0() + Duration::seconds(iode as i64),
            health: 0,
        }
    }

    #[test]
    fn test_nav_cache_keeps_previous_set() {
        let mut nav = NavCache::new();
        assert!(nav.update(eph(10, 1)));
        assert!(!nav.update(eph(10, 1)));
        assert!(nav.update(eph(10, 2)));
        assert_eq!(nav.get(10).unwrap().iode, 2);
        assert_eq!(nav.previous(10).unwrap().iode, 1);
        assert_eq!(nav.len(), 1);
        assert!(!nav.update(eph(0, 1)));
        assert!(!nav.update(eph(MAX_SAT as u16 + 1, 1)));
    }

    #[test]
    fn test_reset_receive_times_accepts_resend() {
        let mut nav = NavCache::new();
        nav.update(eph(4, 3));
        nav.reset_receive_times();
        assert!(nav.update(eph(4, 3)));
        assert_eq!(nav.updates(), 2);
    }

    #[test]
    fn test_observation_status_uses_geometry_and_mask() {
        let mut store = ObservationStore::new();
        store.update_geometry(&PositionSet {
            time: t0(),
            sats: vec![SatPosition {
                sat: 2,
                azimuth: 200.0,
                elevation: 8.0,
            }],
        });
        store.push(
            ReceiverRole::Reference,
            ObsEpoch {
                time: t0(),
                sats: vec![
                    SatObservation {
                        sat: 1,
                        snr: [42.0, 0.0, 0.0],
                        phase: [0.0; 3],
                        azimuth: Some(30.0),
                        elevation: Some(60.0),
                    },
                    SatObservation {
                        sat: 2,
                        snr: [35.0, 0.0, 0.0],
                        phase: [0.0; 3],
                        azimuth: None,
                        elevation: None,
                    },
                ],
            },
        );

        let status = store.status(ReceiverRole::Reference, 15.0);
        assert_eq!(status.time, Some(t0()));
        assert_eq!(status.sats.len(), 2);
        assert!(status.sats[0].valid);
        assert_eq!(status.sats[1].azimuth, Some(200.0));
        assert!(!status.sats[1].valid);
        assert!(store.status(ReceiverRole::Primary, 15.0).sats.is_empty());
    }

    #[test]
    fn test_observation_buffer_is_bounded() {
        let mut store = ObservationStore::new();
        for k in 0..10 {
            store.push(
                ReceiverRole::Primary,
                ObsEpoch {
                    time: t0() + Duration::seconds(k),
                    sats: Vec::new(),
                },
            );
        }
        assert_eq!(store.epochs[0].len(), MAX_OBS_BUF);
        assert_eq!(
            store.latest(ReceiverRole::Primary).unwrap().time,
            t0() + Duration::seconds(9)
        );
    }
}
