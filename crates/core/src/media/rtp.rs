use rand::RngExt;

/// Size of the RTP fixed header without CSRCs.
pub const RTP_HEADER_LEN: usize = 12;

/// Outgoing RTP header state for one track (RFC 3550 §5.1).
///
/// ```text
/// byte 0     1     2-3        4-7         8-11
///      V=2   M|PT  sequence   timestamp   SSRC
/// ```
///
/// One instance lives inside each packetizer. The sequence number advances
/// per packet and wraps at 2^16; the timestamp is set once per access unit
/// and only its low 32 bits are written.
#[derive(Debug)]
pub struct RtpHeader {
    pub pt: u8,
    pub ssrc: u32,
    clock_rate: u32,
    sequence: u16,
    timestamp: u64,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, clock_rate: u32) -> Self {
        tracing::debug!(pt, clock_rate, ssrc = format_args!("{ssrc:#010x}"), "RTP track");
        Self {
            pt,
            ssrc,
            clock_rate,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// New header state with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8, clock_rate: u32) -> Self {
        Self::new(pt, rand::rng().random::<u32>(), clock_rate)
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp of the current access unit, in clock units.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Emit the header for the next packet. `marker` flags the final
    /// packet of an access unit.
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 0x80;
        header[1] = (u8::from(marker) << 7) | (self.pt & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&(self.timestamp as u32).to_be_bytes());
        header[8..].copy_from_slice(&self.ssrc.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    pub fn set_presentation_time(&mut self, pts_us: u64) {
        self.timestamp = pts_to_clock(pts_us, self.clock_rate);
    }
}

/// Scale a microsecond presentation time to a media clock.
pub fn pts_to_clock(pts_us: u64, clock_rate: u32) -> u64 {
    ((pts_us as u128 * clock_rate as u128) / 1_000_000) as u64
}

/// Read-only view over a received RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parse the fixed header; CSRC entries are skipped, extensions are not.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < RTP_HEADER_LEN {
            return None;
        }
        let csrc_count = data[0] & 0x0f;
        let payload_start = RTP_HEADER_LEN + csrc_count as usize * 4;
        if data.len() < payload_start {
            return None;
        }
        Some(Self {
            version: data[0] >> 6,
            padding: data[0] & 0x20 != 0,
            extension: data[0] & 0x10 != 0,
            csrc_count,
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload: &data[payload_start..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut h = RtpHeader::new(96, 0xAABBCCDD, 90000);
        h.set_presentation_time(1_000_000);
        let plain = h.write(false);
        let marked = h.write(true);

        assert_eq!(plain[0], 0x80);
        assert_eq!(plain[1], 96);
        assert_eq!(marked[1], 0x80 | 96);
        assert_eq!(&plain[2..4], &[0, 0]);
        assert_eq!(&marked[2..4], &[0, 1]);
        assert_eq!(u32::from_be_bytes(plain[4..8].try_into().unwrap()), 90000);
        assert_eq!(&plain[8..], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn sequence_wraps_at_16_bits() {
        let mut h = RtpHeader::new(96, 1, 90000);
        h.sequence = u16::MAX;
        let buf = h.write(false);
        assert_eq!(&buf[2..4], &[0xff, 0xff]);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn presentation_time_scales_to_clock() {
        let mut h = RtpHeader::new(96, 1, 90000);
        h.set_presentation_time(33_333);
        assert_eq!(h.timestamp(), 2999);
        assert_eq!(pts_to_clock(500_000, 44100), 22050);

        // Wire timestamp keeps the low 32 bits.
        h.set_presentation_time(50_000 * 1_000_000);
        let buf = h.write(false);
        let expected = (50_000u64 * 90_000) as u32;
        assert_eq!(u32::from_be_bytes(buf[4..8].try_into().unwrap()), expected);
    }

    #[test]
    fn parse_reads_written_packet() {
        let mut h = RtpHeader::new(97, 0x01020304, 44100);
        h.set_presentation_time(2_000_000);
        let mut packet = h.write(true).to_vec();
        packet.extend_from_slice(&[1, 2, 3]);

        let parsed = RtpPacket::parse(&packet).unwrap();
        assert_eq!(parsed.version, 2);
        assert!(parsed.marker);
        assert_eq!(parsed.payload_type, 97);
        assert_eq!(parsed.timestamp, 88200);
        assert_eq!(parsed.ssrc, 0x01020304);
        assert_eq!(parsed.payload, &[1, 2, 3]);
    }

    #[test]
    fn parse_skips_csrcs_and_rejects_truncation() {
        let mut packet = vec![0x81, 96, 0, 7, 0, 0, 0, 0, 0, 0, 0, 1];
        packet.extend_from_slice(&[9, 9, 9, 9, 0xee]);
        let parsed = RtpPacket::parse(&packet).unwrap();
        assert_eq!(parsed.csrc_count, 1);
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.payload, &[0xee]);

        assert!(RtpPacket::parse(&packet[..14]).is_none());
        assert!(RtpPacket::parse(&[0x80, 96, 0]).is_none());
    }
}
