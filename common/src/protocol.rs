// 参考测量帧格式
//
// | 字段   | 长度 | 说明                              |
// |--------|------|-----------------------------------|
// | magic  | 2    | 0x01AA，大端                      |
// | msg_id | 1    | 测量类型，见 Measurement::message_id |
// | length | 2    | 整帧长度（含头尾），大端           |
// | body   | N    | bincode 编码的 Measurement         |
// | crc    | 2    | CRC-16/XMODEM，覆盖 msg_id..body   |
// | tail   | 2    | 0x00FF                            |

use crate::error::{FrameError, Result};
use crate::types::Measurement;
use crate::utils::crc16;
use bytes::{BufMut, BytesMut};

pub const FRAME_MAGIC: u16 = 0x01AA;
pub const FRAME_TAIL: u16 = 0x00FF;
pub const FRAME_HEADER_LEN: usize = 5;
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + 4;
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// 编码一帧
pub fn encode_frame(measurement: &Measurement) -> Result<Vec<u8>> {
    let body = bincode::serialize(measurement)?;
    let length = FRAME_OVERHEAD + body.len();
    if length > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut frame = BytesMut::with_capacity(length);
    frame.put_u16(FRAME_MAGIC);
    frame.put_u8(measurement.message_id());
    frame.put_u16(length as u16);
    frame.put_slice(&body);
    let crc = crc16(&frame[2..]);
    frame.put_u16(crc);
    frame.put_u16(FRAME_TAIL);
    Ok(frame.to_vec())
}

/// 解码一个完整帧（buf 必须恰好是一帧）
pub fn decode_frame(buf: &[u8]) -> Result<Measurement> {
    if buf.len() < FRAME_OVERHEAD {
        return Err(FrameError::Truncated(buf.len()));
    }
    let magic = u16::from_be_bytes([buf[0], buf[1]]);
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let length = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if length < FRAME_OVERHEAD || length > buf.len() {
        return Err(FrameError::LengthMismatch {
            header: length,
            minimum: FRAME_OVERHEAD,
        });
    }
    let tail = u16::from_be_bytes([buf[length - 2], buf[length - 1]]);
    if tail != FRAME_TAIL {
        return Err(FrameError::BadTail(tail));
    }
    let expected = u16::from_be_bytes([buf[length - 4], buf[length - 3]]);
    let actual = crc16(&buf[2..length - 4]);
    if expected != actual {
        return Err(FrameError::CrcMismatch { expected, actual });
    }

    let measurement: Measurement = bincode::deserialize(&buf[FRAME_HEADER_LEN..length - 4])?;
    if measurement.message_id() != buf[2] {
        return Err(FrameError::MessageIdMismatch {
            header: buf[2],
            body: measurement.message_id(),
        });
    }
    Ok(measurement)
}

/// 一次扫描的结果
#[derive(Debug, Default)]
pub struct ScanResult {
    pub frames: Vec<Measurement>,
    /// 已处理（解出或判定为垃圾）的字节数；其后为不完整帧
    pub consumed: usize,
    /// 校验失败的候选帧数
    pub rejected: usize,
}

/// 在任意字节流中查找并解码所有完整帧，跳过无法同步的字节
pub fn scan_frames(buf: &[u8]) -> ScanResult {
    let mut result = ScanResult::default();
    let mut i = 0;

    while i + 2 <= buf.len() {
        if u16::from_be_bytes([buf[i], buf[i + 1]]) != FRAME_MAGIC {
            i += 1;
            continue;
        }
        if i + FRAME_HEADER_LEN > buf.len() {
            break;
        }
        let length = u16::from_be_bytes([buf[i + 3], buf[i + 4]]) as usize;
        if length < FRAME_OVERHEAD {
            result.rejected += 1;
            i += 1;
            continue;
        }
        if i + length > buf.len() {
            break;
        }
        match decode_frame(&buf[i..i + length]) {
            Ok(measurement) => {
                result.frames.push(measurement);
                i += length;
            }
            Err(_) => {
                result.rejected += 1;
                i += 1;
            }
        }
    }

    // 末尾仅剩一个字节时，只有它可能是帧头首字节才保留
    result.consumed = if i + 2 > buf.len() && buf.get(i) != Some(&FRAME_MAGIC.to_be_bytes()[0]) {
        buf.len()
    } else {
        i
    };
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObsEpoch, SatObservation, Solution, SolutionStatus};
    use chrono::{TimeZone, Utc};

    fn sample_epoch() -> Measurement {
        Measurement::GnssObs(ObsEpoch {
            time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            sats: vec![SatObservation {
                sat: 5,
                snr: [45.0, 40.0, 0.0],
                phase: [1.0e6, 7.8e5, 0.0],
                azimuth: Some(120.0),
                elevation: Some(45.0),
            }],
        })
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&sample_epoch()).unwrap();
        assert_eq!(&frame[..2], &[0x01, 0xAA]);
        assert_eq!(frame[2], 0x01);
        let length = u16::from_be_bytes([frame[3], frame[4]]) as usize;
        assert_eq!(length, frame.len());
        assert_eq!(&frame[frame.len() - 2..], &[0x00, 0xFF]);
    }

    #[test]
    fn test_decode_rejects_corrupted_crc() {
        let mut frame = encode_frame(&sample_epoch()).unwrap();
        frame[FRAME_HEADER_LEN] ^= 0xFF;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_scan_skips_garbage_and_keeps_partial_tail() {
        let solution = Measurement::Solution(Solution {
            time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap(),
            status: SolutionStatus::Single,
            ecef: [-3_957_000.0, 3_310_000.0, 3_737_000.0],
            nsat: 9,
        });
        let first = encode_frame(&sample_epoch()).unwrap();
        let second = encode_frame(&solution).unwrap();

        let mut stream = vec![0x00, 0x13, 0x37];
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&[0xDE, 0xAD]);
        stream.extend_from_slice(&second[..10]);

        let result = scan_frames(&stream);
        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.frames[0], sample_epoch());
        // 第二帧不完整，停在其帧头
        assert_eq!(result.consumed, 3 + first.len() + 2);

        stream.extend_from_slice(&second[10..]);
        let result = scan_frames(&stream);
        assert_eq!(result.frames, vec![sample_epoch(), solution]);
        assert_eq!(result.consumed, stream.len());
    }

    #[test]
    fn test_scan_empty_and_noise() {
        assert!(scan_frames(&[]).frames.is_empty());
        let result = scan_frames(&[0x55; 64]);
        assert!(result.frames.is_empty());
        assert_eq!(result.consumed, 64);
    }
}
