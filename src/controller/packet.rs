//! Side channel report decoding
//!
//! Reports are little-endian and at least 14 bytes long. Only two offsets are
//! known to carry meaning: the key identifier at byte 7 and the press state at
//! byte 12 (nonzero means pressed). Everything else is left alone.

use super::error::PacketError;

pub const MIN_REPORT_LEN: usize = 14;
pub const KEY_ID_OFFSET: usize = 7;
pub const KEY_STATE_OFFSET: usize = 12;

/// One key transition carried by a side channel report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyReport {
    pub key_id: u8,
    pub is_down: bool,
}

pub fn parse_report(buf: &[u8]) -> Result<KeyReport, PacketError> {
    if buf.len() < MIN_REPORT_LEN {
        return Err(PacketError::ReadTooSmall(buf.len()));
    }

    Ok(KeyReport {
        key_id: buf[KEY_ID_OFFSET],
        is_down: buf[KEY_STATE_OFFSET] != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_key_id_and_state() {
        let mut buf = [0u8; 64];
        buf[7] = 22;
        buf[12] = 1;

        assert_eq!(
            parse_report(&buf),
            Ok(KeyReport {
                key_id: 22,
                is_down: true
            })
        );
    }

    #[test]
    fn any_nonzero_state_byte_is_pressed() {
        let mut buf = [0u8; 14];
        buf[7] = 23;
        buf[12] = 0x80;
        assert!(parse_report(&buf).unwrap().is_down);

        buf[12] = 0;
        assert!(!parse_report(&buf).unwrap().is_down);
    }

    #[test]
    fn reserved_bytes_are_ignored() {
        let buf = [0xFFu8; 14];
        let report = parse_report(&buf).unwrap();
        assert_eq!(report.key_id, 0xFF);
        assert!(report.is_down);
    }

    #[test]
    fn short_reports_are_rejected() {
        for len in 0..MIN_REPORT_LEN {
            let buf = vec![1u8; len];
            assert_eq!(parse_report(&buf), Err(PacketError::ReadTooSmall(len)));
        }
    }
}
