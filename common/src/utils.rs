use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

/// WGS84 长半轴（米）
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 扁率
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;

const SECONDS_PER_WEEK: i64 = 7 * 86_400;

/// GPS-UTC 闰秒表：(生效日期, 累计闰秒)
const LEAP_SECONDS: [(i32, u32, u32, i64); 18] = [
    (1981, 7, 1, 1),
    (1982, 7, 1, 2),
    (1983, 7, 1, 3),
    (1985, 7, 1, 4),
    (1988, 1, 1, 5),
    (1990, 1, 1, 6),
    (1991, 1, 1, 7),
    (1992, 7, 1, 8),
    (1993, 7, 1, 9),
    (1994, 7, 1, 10),
    (1996, 1, 1, 11),
    (1997, 7, 1, 12),
    (1999, 1, 1, 13),
    (2006, 1, 1, 14),
    (2009, 1, 1, 15),
    (2012, 7, 1, 16),
    (2015, 7, 1, 17),
    (2017, 1, 1, 18),
];

/// CRC-16/XMODEM（多项式 0x1021，初值 0）
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// NMEA 校验和：`$` 与 `*` 之间所有字符的异或
pub fn nmea_checksum(sentence: &str) -> u8 {
    sentence
        .trim_start_matches('$')
        .split('*')
        .next()
        .unwrap_or("")
        .bytes()
        .fold(0u8, |sum, b| sum ^ b)
}

/// 给定 UTC 时刻的 GPS-UTC 闰秒数
pub fn leap_seconds(time: &DateTime<Utc>) -> i64 {
    let date = time.date_naive();
    let mut leap = 0;
    for &(y, m, d, n) in LEAP_SECONDS.iter() {
        match NaiveDate::from_ymd_opt(y, m, d) {
            Some(effective) if date >= effective => leap = n,
            _ => break,
        }
    }
    leap
}

fn gps_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 6, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// UTC 转 GPS 周与周内秒
pub fn utc_to_gps_week_tow(time: &DateTime<Utc>) -> (u32, f64) {
    let gps = *time + Duration::seconds(leap_seconds(time));
    let elapsed = gps.signed_duration_since(gps_epoch());
    let millis = elapsed.num_milliseconds().max(0);
    let week = millis / (SECONDS_PER_WEEK * 1000);
    let tow = (millis - week * SECONDS_PER_WEEK * 1000) as f64 / 1000.0;
    (week as u32, tow)
}

/// ECEF（米）转大地坐标（纬度弧度, 经度弧度, 椭球高米）
pub fn ecef_to_geodetic(r: &[f64; 3]) -> [f64; 3] {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let r2 = r[0] * r[0] + r[1] * r[1];
    let mut z = r[2];
    let mut zk = 0.0;
    let mut v = WGS84_A;
    while (z - zk).abs() >= 1e-4 {
        zk = z;
        let sinp = z / (r2 + z * z).sqrt();
        v = WGS84_A / (1.0 - e2 * sinp * sinp).sqrt();
        z = r[2] + v * e2 * sinp;
    }
    let lat = if r2 > 1e-12 {
        (z / r2.sqrt()).atan()
    } else if r[2] > 0.0 {
        std::f64::consts::FRAC_PI_2
    } else {
        -std::f64::consts::FRAC_PI_2
    };
    let lon = if r2 > 1e-12 { r[1].atan2(r[0]) } else { 0.0 };
    [lat, lon, (r2 + z * z).sqrt() - v]
}

/// 大地坐标（纬度弧度, 经度弧度, 椭球高米）转 ECEF
pub fn geodetic_to_ecef(pos: &[f64; 3]) -> [f64; 3] {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let (sinp, cosp) = pos[0].sin_cos();
    let (sinl, cosl) = pos[1].sin_cos();
    let v = WGS84_A / (1.0 - e2 * sinp * sinp).sqrt();
    [
        (v + pos[2]) * cosp * cosl,
        (v + pos[2]) * cosp * sinl,
        (v * (1.0 - e2) + pos[2]) * sinp,
    ]
}

/// 卫星编号转字符串：G01..G32 R01..R27 E01..E36 C01..C63 J01..J10 S120..S158 L01..L14
pub fn satellite_id(sat: u16) -> String {
    match sat {
        1..=32 => format!("G{:02}", sat),
        33..=59 => format!("R{:02}", sat - 32),
        60..=95 => format!("E{:02}", sat - 59),
        96..=158 => format!("C{:02}", sat - 95),
        159..=168 => format!("J{:02}", sat - 158),
        169..=207 => format!("S{:03}", sat - 169 + 120),
        208..=221 => format!("L{:02}", sat - 207),
        _ => format!("?{}", sat),
    }
}

/// 时刻的文本形式，精确到毫秒：2025/01/01 00:00:00.000
pub fn time_to_string(time: &DateTime<Utc>) -> String {
    time.format("%Y/%m/%d %H:%M:%S%.3f").to_string()
}

/// 替换路径中的时间关键字：%Y %m %d %h %M %S
pub fn expand_time_keywords(template: &str, time: &DateTime<Utc>) -> String {
    template
        .replace("%Y", &format!("{:04}", time.year()))
        .replace("%m", &format!("{:02}", time.month()))
        .replace("%d", &format!("{:02}", time.day()))
        .replace("%h", &format!("{:02}", time.hour()))
        .replace("%M", &format!("{:02}", time.minute()))
        .replace("%S", &format!("{:02}", time.second()))
}
