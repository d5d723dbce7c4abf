use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 工作循环使用的时间源
///
/// tick 为单调毫秒计数，用于周期控制和闪烁窗口触发；now 为 UTC 时刻，
/// 用于流时间戳和文件名展开。
pub trait Clock: Send + Sync {
    fn tick_ms(&self) -> u64;
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

/// 系统时钟
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn tick_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// 手动推进的时钟，sleep 直接推进时间而不阻塞
pub struct ManualClock {
    ticks: AtomicU64,
    origin: DateTime<Utc>,
}

impl ManualClock {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            origin,
        }
    }

    pub fn advance(&self, ms: u64) {
        self.ticks.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.ticks.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn tick_ms(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn now(&self) -> DateTime<Utc> {
        self.origin + ChronoDuration::milliseconds(self.tick_ms() as i64)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration.as_millis() as u64);
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_sleep_advances() {
        let origin = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(origin);
        clock.sleep(Duration::from_millis(250));
        clock.advance(50);
        assert_eq!(clock.tick_ms(), 300);
        assert_eq!(clock.now(), origin + ChronoDuration::milliseconds(300));
    }
}
