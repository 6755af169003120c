use {
    bytes::{BufMut, BytesMut},
};

pub mod packet_type {
    pub const SENDER_REPORT: u8 = 200;
    pub const RECEIVER_REPORT: u8 = 201;
    pub const RTPFB: u8 = 205;
    pub const PSFB: u8 = 206;
}

/// Parsed sender report, for wall-clock/RTP mapping.
#[derive(Debug, Clone, Copy)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_seconds: u32,
    pub ntp_fraction: u32,
    pub rtp_timestamp: u32,
}

pub fn parse_sender_report(data: &[u8]) -> Option<SenderReport> {
    if data.len() < 20 || data[1] != packet_type::SENDER_REPORT {
        return None;
    }
    Some(SenderReport {
        ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ntp_seconds: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        ntp_fraction: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        rtp_timestamp: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
    })
}

/// Minimal receiver report (no reception blocks): keeps the sender's RTCP
/// timers happy on long pulls.
#[must_use]
pub fn receiver_report(ssrc: u32) -> BytesMut {
    let mut out = BytesMut::with_capacity(8);
    out.put_u8(0x80); // v2, no report blocks
    out.put_u8(packet_type::RECEIVER_REPORT);
    out.put_u16(1); // length in words - 1
    out.put_u32(ssrc);
    out
}

/// Generic NACK (RFC 4585 §6.2.1): one FCI per 17-packet run.
#[must_use]
pub fn nack(sender_ssrc: u32, media_ssrc: u32, missing: &[u16]) -> BytesMut {
    let mut fci: Vec<(u16, u16)> = Vec::new();
    for &seq in missing {
        match fci.last_mut() {
            Some((pid, blp)) => {
                let distance = seq.wrapping_sub(*pid);
                if distance >= 1 && distance <= 16 {
                    *blp |= 1 << (distance - 1);
                    continue;
                }
                fci.push((seq, 0));
            }
            None => fci.push((seq, 0)),
        }
    }

    let mut out = BytesMut::with_capacity(12 + fci.len() * 4);
    out.put_u8(0x80 | 0x01); // FMT 1 = generic NACK
    out.put_u8(packet_type::RTPFB);
    out.put_u16(2 + fci.len() as u16);
    out.put_u32(sender_ssrc);
    out.put_u32(media_ssrc);
    for (pid, blp) in fci {
        out.put_u16(pid);
        out.put_u16(blp);
    }
    out
}

/// Picture Loss Indication (RFC 4585 §6.3.1).
#[must_use]
pub fn pli(sender_ssrc: u32, media_ssrc: u32) -> BytesMut {
    let mut out = BytesMut::with_capacity(12);
    out.put_u8(0x80 | 0x01); // FMT 1 = PLI
    out.put_u8(packet_type::PSFB);
    out.put_u16(2);
    out.put_u32(sender_ssrc);
    out.put_u32(media_ssrc);
    out
}

/// Full Intra Request (RFC 5104 §4.3.1).
#[must_use]
pub fn fir(sender_ssrc: u32, media_ssrc: u32, sequence: u8) -> BytesMut {
    let mut out = BytesMut::with_capacity(20);
    out.put_u8(0x80 | 0x04); // FMT 4 = FIR
    out.put_u8(packet_type::PSFB);
    out.put_u16(4);
    out.put_u32(sender_ssrc);
    out.put_u32(0); // media ssrc unused in FIR, carried per-FCI
    out.put_u32(media_ssrc);
    out.put_u8(sequence);
    out.put_slice(&[0, 0, 0]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nack_packs_bitmask() {
        let out = nack(1, 2, &[100, 101, 103, 120]);
        // header(4) + ssrcs(8) + 2 FCI entries: 100 covers 101/103, 120 alone.
        assert_eq!(out.len(), 12 + 8);
        let pid = u16::from_be_bytes([out[12], out[13]]);
        let blp = u16::from_be_bytes([out[14], out[15]]);
        assert_eq!(pid, 100);
        assert_eq!(blp, 0b0000_0000_0000_0101); // +1 and +3
        let pid2 = u16::from_be_bytes([out[16], out[17]]);
        assert_eq!(pid2, 120);
    }

    #[test]
    fn test_pli_shape() {
        let out = pli(0xAAAA_AAAA, 0xBBBB_BBBB);
        assert_eq!(out.len(), 12);
        assert_eq!(out[0] & 0x1F, 1);
        assert_eq!(out[1], packet_type::PSFB);
    }

    #[test]
    fn test_sender_report_round_trip() {
        let mut sr = BytesMut::new();
        sr.put_u8(0x80);
        sr.put_u8(packet_type::SENDER_REPORT);
        sr.put_u16(6);
        sr.put_u32(42);
        sr.put_u32(3_900_000_000);
        sr.put_u32(0x8000_0000);
        sr.put_u32(90_000);
        sr.put_u32(0); // packet count
        sr.put_u32(0); // octet count
        let parsed = parse_sender_report(&sr).unwrap();
        assert_eq!(parsed.ssrc, 42);
        assert_eq!(parsed.rtp_timestamp, 90_000);
    }

    #[test]
    fn test_fir_length() {
        let out = fir(1, 2, 7);
        assert_eq!(out.len(), 20);
        assert_eq!(out[0] & 0x1F, 4);
    }
}
