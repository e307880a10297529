//! Plantower PMS5003/PMS7003 frame decoding.

use crate::{error::SensorError, sensor::ParticulateReading};

pub const FRAME_LEN: usize = 32;
const START_1: u8 = 0x42;
const START_2: u8 = 0x4D;
const PAYLOAD_LEN: u16 = 28;

/// Byte-at-a-time decoder. Resynchronises on the start marker after any
/// malformed frame.
#[derive(Debug, Clone)]
pub struct PmsFrameDecoder {
    buf: [u8; FRAME_LEN],
    len: usize,
}

impl Default for PmsFrameDecoder {
    fn default() -> Self {
        Self {
            buf: [0; FRAME_LEN],
            len: 0,
        }
    }
}

impl PmsFrameDecoder {
    pub fn reset(&mut self) {
        self.len = 0;
    }

    pub fn push(&mut self, byte: u8) -> Option<Result<ParticulateReading, SensorError>> {
        match self.len {
            0 if byte != START_1 => return None,
            1 if byte != START_2 => {
                self.len = usize::from(byte == START_1);
                return None;
            }
            _ => {}
        }

        self.buf[self.len] = byte;
        self.len += 1;

        if self.len == 4 {
            let declared = u16::from_be_bytes([self.buf[2], self.buf[3]]);
            if declared != PAYLOAD_LEN {
                self.reset();
                return Some(Err(SensorError::Framing("unexpected frame length")));
            }
        }

        if self.len < FRAME_LEN {
            return None;
        }

        self.reset();
        Some(self.finish())
    }

    /// Feed `bytes` until the first complete frame (or framing error).
    pub fn decode(&mut self, bytes: &[u8]) -> Option<Result<ParticulateReading, SensorError>> {
        bytes.iter().find_map(|&byte| self.push(byte))
    }

    fn finish(&self) -> Result<ParticulateReading, SensorError> {
        let expected = u16::from_be_bytes([self.buf[30], self.buf[31]]);
        let actual = self.buf[..30]
            .iter()
            .fold(0_u16, |sum, &byte| sum.wrapping_add(u16::from(byte)));
        if expected != actual {
            return Err(SensorError::Checksum { expected, actual });
        }

        let word = |index: usize| {
            let at = 4 + index * 2;
            u16::from_be_bytes([self.buf[at], self.buf[at + 1]])
        };
        Ok(ParticulateReading {
            pm1_0: word(3),
            pm2_5: word(4),
            pm10: word(5),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn frame(atmospheric: [u16; 3]) -> [u8; FRAME_LEN] {
        let mut words = [0_u16; 13];
        // CF=1 values differ from the atmospheric ones to catch index mixups.
        words[0] = 99;
        words[1] = 98;
        words[2] = 97;
        words[3..6].copy_from_slice(&atmospheric);

        let mut out = [0_u8; FRAME_LEN];
        out[0] = START_1;
        out[1] = START_2;
        out[2..4].copy_from_slice(&PAYLOAD_LEN.to_be_bytes());
        for (i, w) in words.iter().enumerate() {
            out[4 + i * 2..6 + i * 2].copy_from_slice(&w.to_be_bytes());
        }
        let sum = out[..30].iter().fold(0_u16, |s, &b| s.wrapping_add(u16::from(b)));
        out[30..].copy_from_slice(&sum.to_be_bytes());
        out
    }

    #[test]
    fn decodes_atmospheric_values() {
        let mut decoder = PmsFrameDecoder::default();
        let result = decoder.decode(&frame([5, 9, 12]));

        assert_eq!(
            result,
            Some(Ok(ParticulateReading {
                pm1_0: 5,
                pm2_5: 9,
                pm10: 12,
            }))
        );
    }

    #[test]
    fn skips_leading_noise() {
        let mut bytes = vec![0x00, 0x42, 0x13, 0xFF];
        bytes.extend_from_slice(&frame([1, 2, 3]));

        let mut decoder = PmsFrameDecoder::default();
        let reading = decoder.decode(&bytes).unwrap().unwrap();
        assert_eq!(reading.pm2_5, 2);
    }

    #[test]
    fn repeated_start_byte_resyncs() {
        let mut bytes = vec![0x42];
        bytes.extend_from_slice(&frame([7, 8, 9]));

        let mut decoder = PmsFrameDecoder::default();
        assert_eq!(decoder.decode(&bytes).unwrap().unwrap().pm10, 9);
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut bytes = frame([5, 9, 12]);
        bytes[14] ^= 0x01;

        let mut decoder = PmsFrameDecoder::default();
        assert!(matches!(
            decoder.decode(&bytes),
            Some(Err(SensorError::Checksum { .. }))
        ));
    }

    #[test]
    fn rejects_bad_length_and_recovers() {
        let mut bytes = vec![0x42, 0x4D, 0x00, 0x14];
        bytes.extend_from_slice(&frame([4, 5, 6]));

        let mut decoder = PmsFrameDecoder::default();
        assert_eq!(
            decoder.decode(&bytes[..4]),
            Some(Err(SensorError::Framing("unexpected frame length")))
        );
        assert_eq!(decoder.decode(&bytes[4..]).unwrap().unwrap().pm1_0, 4);
    }

    #[test]
    fn partial_frame_yields_nothing() {
        let mut decoder = PmsFrameDecoder::default();
        assert_eq!(decoder.decode(&frame([1, 1, 1])[..20]), None);
    }
}
