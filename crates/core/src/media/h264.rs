use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::rtp::{RTP_HEADER_LEN, RtpHeader};
use super::{AccessUnit, Packetizer};
use crate::error::{Result, StreamError};
use crate::protocol::sdp::Attribute;

/// Largest RTP payload emitted per packet.
pub const DEFAULT_MTU: usize = 1400;

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;
const NAL_FU_A: u8 = 28;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit type (low 5 bits of the header byte). Empty input reads as 0.
pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map_or(0, |b| b & 0x1f)
}

/// Split an Annex B stream into NAL units, start codes removed.
///
/// Both `00 00 01` and `00 00 00 01` delimiters are recognised; a zero
/// byte directly before a 3-byte code is treated as part of a 4-byte code.
/// Truncated or empty input yields no units.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    // (first byte of the start code, first byte of the NAL)
    let mut codes = Vec::new();
    let mut i = 0usize;
    while i + 3 <= data.len() {
        if data[i..i + 3] == [0, 0, 1] {
            let begin = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            codes.push((begin, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    codes
        .iter()
        .enumerate()
        .filter_map(|(n, &(_, start))| {
            let end = codes.get(n + 1).map_or(data.len(), |&(next, _)| next);
            (start < end).then(|| &data[start..end])
        })
        .collect()
}

/// Whether an Annex B buffer contains an IDR slice.
pub fn contains_idr(data: &[u8]) -> bool {
    extract_nal_units(data)
        .iter()
        .any(|nal| nal_type(nal) == NAL_IDR)
}

/// Convert Annex B to 4-byte length-prefixed NAL units (the AVCC sample
/// layout used by FLV and MP4). Parameter sets and AUDs are dropped since
/// both containers carry them out of band.
pub fn annex_b_to_avcc(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    for nal in extract_nal_units(data) {
        if matches!(nal_type(nal), NAL_SPS | NAL_PPS | NAL_AUD) {
            continue;
        }
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// Build an `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 §5.2.4.1)
/// from one SPS and one PPS.
pub fn avc_decoder_configuration_record(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let profile = sps.get(1).copied().unwrap_or(0x42);
    let compat = sps.get(2).copied().unwrap_or(0);
    let level = sps.get(3).copied().unwrap_or(0x1e);

    let mut record = Vec::with_capacity(11 + sps.len() + pps.len());
    record.push(1);
    record.push(profile);
    record.push(compat);
    record.push(level);
    record.push(0xff); // 6 bits reserved + lengthSizeMinusOne = 3
    record.push(0xe1); // 3 bits reserved + numOfSequenceParameterSets = 1
    record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    record.extend_from_slice(sps);
    record.push(1);
    record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    record.extend_from_slice(pps);
    record
}

/// Cached SPS/PPS pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
}

impl ParameterSets {
    /// Scan a codec-config buffer and keep the SPS and PPS it carries.
    pub fn from_config(config: &[u8]) -> Self {
        let mut sets = Self::default();
        for nal in extract_nal_units(config) {
            sets.absorb(nal);
        }
        sets
    }

    /// Cache `nal` if it is an SPS or PPS. Returns whether it was one.
    pub fn absorb(&mut self, nal: &[u8]) -> bool {
        match nal_type(nal) {
            NAL_SPS => {
                tracing::debug!(len = nal.len(), "H.264 SPS cached");
                self.sps = Some(nal.to_vec());
                true
            }
            NAL_PPS => {
                tracing::debug!(len = nal.len(), "H.264 PPS cached");
                self.pps = Some(nal.to_vec());
                true
            }
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// `00 00 00 01 SPS 00 00 00 01 PPS`, or `None` until both are known.
    pub fn annex_b(&self) -> Option<Vec<u8>> {
        let (sps, pps) = (self.sps.as_deref()?, self.pps.as_deref()?);
        let mut out = Vec::with_capacity(8 + sps.len() + pps.len());
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(sps);
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(pps);
        Some(out)
    }
}

/// H.264 over RTP (RFC 6184, packetization-mode 1).
///
/// NALs up to the MTU travel one per packet; larger ones are split into
/// FU-A fragments:
///
/// ```text
/// [F|NRI|28] [S|E|R|type] fragment...
/// ```
///
/// Codec-config buffers only refresh the SPS/PPS cache. Key frames are
/// preceded by the cached sets, stamped with the frame's timestamp, so a
/// receiver can join at any key frame. The marker bit closes each access
/// unit.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
    sets: ParameterSets,
}

impl H264Packetizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self::with_header(RtpHeader::new(pt, ssrc, 90000))
    }

    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::with_header(RtpHeader::with_random_ssrc(pt, 90000))
    }

    fn with_header(header: RtpHeader) -> Self {
        Self {
            header,
            mtu: DEFAULT_MTU,
            sets: ParameterSets::default(),
        }
    }

    /// Limit the RTP payload size. Values below 3 cannot carry a FU-A fragment.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(3);
        self
    }

    /// Install parameter sets reported through a format-changed event.
    pub fn set_parameter_sets(&mut self, sps: &[u8], pps: &[u8]) {
        self.sets.sps = Some(sps.to_vec());
        self.sets.pps = Some(pps.to_vec());
    }

    pub fn parameter_sets(&self) -> &ParameterSets {
        &self.sets
    }

    /// `profile-level-id` (RFC 6184 §8.1): SPS bytes 1..4 as hex.
    fn profile_level_id(&self) -> Option<String> {
        let bytes = self.sets.sps.as_deref()?.get(1..4)?;
        Some(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let (sps, pps) = (self.sets.sps.as_deref()?, self.sets.pps.as_deref()?);
        Some([sps, pps].map(|set| BASE64_STANDARD.encode(set)).join(","))
    }

    /// One NAL as a single-NAL packet when it fits the MTU (RFC 6184 §5.6),
    /// otherwise as FU-A fragments (§5.8). `last` marks the access unit end.
    fn packetize_nal(&mut self, nal: &[u8], last: bool, out: &mut Vec<Vec<u8>>) {
        let Some((&nal_header, body)) = nal.split_first() else {
            return;
        };

        if nal.len() <= self.mtu {
            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + nal.len());
            packet.extend_from_slice(&self.header.write(last));
            packet.extend_from_slice(nal);
            out.push(packet);
            return;
        }

        let indicator = (nal_header & 0x60) | NAL_FU_A;
        let kind = nal_header & 0x1f;
        let fragments = body.chunks(self.mtu - 2);
        let count = fragments.len();
        for (i, fragment) in fragments.enumerate() {
            let end = i + 1 == count;
            let mut fu_header = kind;
            if i == 0 {
                fu_header |= 0x80;
            }
            if end {
                fu_header |= 0x40;
            }

            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + 2 + fragment.len());
            packet.extend_from_slice(&self.header.write(last && end));
            packet.extend_from_slice(&[indicator, fu_header]);
            packet.extend_from_slice(fragment);
            out.push(packet);
        }
        tracing::trace!(nal_type = kind, size = nal.len(), fragments = count, "FU-A");
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, unit: &AccessUnit<'_>) -> Result<Vec<Vec<u8>>> {
        if unit.data.is_empty() {
            return Ok(Vec::new());
        }

        if unit.is_codec_config() {
            for nal in extract_nal_units(unit.data) {
                self.sets.absorb(nal);
            }
            return Ok(Vec::new());
        }

        let mut nal_units = extract_nal_units(unit.data);
        if nal_units.is_empty() {
            // No start code: the encoder handed over one bare NAL.
            nal_units.push(unit.data);
        }

        // Inline parameter sets refresh the cache. On key frames they are
        // re-emitted from the cache below, so drop the inline copies.
        let key_frame = unit.is_key_frame();
        nal_units.retain(|nal| {
            let is_set = matches!(nal_type(nal), NAL_SPS | NAL_PPS);
            if is_set {
                self.sets.absorb(nal);
            }
            !(key_frame && is_set)
        });

        let cached = if key_frame {
            match (&self.sets.sps, &self.sets.pps) {
                (Some(sps), Some(pps)) => Some((sps.clone(), pps.clone())),
                _ => return Err(StreamError::MissingParameterSets),
            }
        } else {
            None
        };

        let mut frame_nals: Vec<&[u8]> = Vec::with_capacity(nal_units.len() + 2);
        if let Some((sps, pps)) = &cached {
            frame_nals.push(sps);
            frame_nals.push(pps);
        }
        frame_nals.extend(nal_units);

        self.header.set_presentation_time(unit.pts_us);

        let mut packets = Vec::new();
        let count = frame_nals.len();
        for (i, nal) in frame_nals.into_iter().enumerate() {
            self.packetize_nal(nal, i + 1 == count, &mut packets);
        }

        tracing::trace!(
            nals = count,
            packets = packets.len(),
            key_frame,
            timestamp = self.header.timestamp(),
            "H.264 access unit"
        );

        Ok(packets)
    }

    fn media_type(&self) -> &'static str {
        "video"
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn clock_rate(&self) -> u32 {
        90000
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    /// `rtpmap`, then the `fmtp` that refers to it (RFC 6184 §8.2.1).
    fn sdp_attributes(&self) -> Vec<Attribute> {
        let mut fmtp = format!("{} packetization-mode=1", self.header.pt);
        if let Some(level) = self.profile_level_id() {
            fmtp += &format!(";profile-level-id={level}");
        }
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp += &format!(";sprop-parameter-sets={sprop}");
        }
        vec![
            Attribute::value("rtpmap", format!("{} H264/90000", self.header.pt)),
            Attribute::value("fmtp", fmtp),
        ]
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::BufferFlags;
    use crate::media::rtp::RtpPacket;

    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1e];
    const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

    fn make_packetizer() -> H264Packetizer {
        H264Packetizer::new(96, 0xAABBCCDD)
    }

    fn config_buffer() -> Vec<u8> {
        [&START_CODE[..], &SPS, &START_CODE, &PPS].concat()
    }

    fn feed_config(p: &mut H264Packetizer) {
        let config = config_buffer();
        let unit = AccessUnit::new(&config, 0).with_flags(BufferFlags::CODEC_CONFIG);
        assert!(p.packetize(&unit).unwrap().is_empty());
    }

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_single_nal_3byte_sc() {
        let data = [0, 0, 1, 0x67, 0x42, 0x00];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x67, 0x42, 0x00][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x67, 0x42][..], &[0x68, 0xCE][..]]);
    }

    #[test]
    fn extract_truncated_input_does_not_panic() {
        assert!(extract_nal_units(&[]).is_empty());
        assert!(extract_nal_units(&[0]).is_empty());
        assert!(extract_nal_units(&[0, 0, 0]).is_empty());
        assert!(extract_nal_units(&[0, 0, 0, 1]).is_empty());
    }

    #[test]
    fn config_buffer_caches_sps_and_pps() {
        let mut p = make_packetizer();
        feed_config(&mut p);
        assert_eq!(p.parameter_sets().sps.as_deref(), Some(&SPS[..]));
        assert_eq!(p.parameter_sets().pps.as_deref(), Some(&PPS[..]));
    }

    #[test]
    fn zero_length_config_is_ignored() {
        let mut p = make_packetizer();
        let unit = AccessUnit::new(&[], 0).with_flags(BufferFlags::CODEC_CONFIG);
        assert!(p.packetize(&unit).unwrap().is_empty());
        assert!(!p.parameter_sets().is_complete());
    }

    #[test]
    fn annex_b_parameter_sets() {
        let sets = ParameterSets::from_config(&config_buffer());
        assert_eq!(sets.annex_b().unwrap(), config_buffer());
    }

    #[test]
    fn key_frame_starts_with_sps_then_pps() {
        let mut p = make_packetizer();
        feed_config(&mut p);

        let frame = [0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00];
        let unit = AccessUnit::new(&frame, 40_000).with_flags(BufferFlags::KEY_FRAME);
        let packets = p.packetize(&unit).unwrap();
        assert_eq!(packets.len(), 3);

        let parsed: Vec<_> = packets.iter().map(|pk| RtpPacket::parse(pk).unwrap()).collect();
        assert_eq!(parsed[0].payload, &SPS);
        assert_eq!(parsed[1].payload, &PPS);
        assert_eq!(nal_type(parsed[2].payload), NAL_IDR);

        // All three carry the frame's timestamp; only the last has the marker.
        assert!(parsed.iter().all(|pk| pk.timestamp == 3600));
        assert!(!parsed[0].marker && !parsed[1].marker && parsed[2].marker);
    }

    #[test]
    fn key_frame_inline_sets_not_duplicated() {
        let mut p = make_packetizer();
        let frame = [config_buffer(), vec![0, 0, 0, 1, 0x65, 0x88]].concat();
        let unit = AccessUnit::new(&frame, 0).with_flags(BufferFlags::KEY_FRAME);
        let packets = p.packetize(&unit).unwrap();
        assert_eq!(packets.len(), 3);
    }

    #[test]
    fn key_frame_without_sets_is_an_error() {
        let mut p = make_packetizer();
        let frame = [0, 0, 0, 1, 0x65, 0x88];
        let unit = AccessUnit::new(&frame, 0).with_flags(BufferFlags::KEY_FRAME);
        assert!(matches!(
            p.packetize(&unit),
            Err(StreamError::MissingParameterSets)
        ));
    }

    #[test]
    fn delta_frame_has_no_parameter_sets() {
        let mut p = make_packetizer();
        feed_config(&mut p);
        let frame = [0, 0, 0, 1, 0x41, 0x9a, 0x00];
        let packets = p.packetize(&AccessUnit::new(&frame, 0)).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][RTP_HEADER_LEN], 0x41);
    }

    fn nal_packets(p: &mut H264Packetizer, nal: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        p.packetize_nal(nal, true, &mut out);
        out
    }

    #[test]
    fn nal_within_mtu_is_one_packet() {
        let mut p = make_packetizer();
        let packets = nal_packets(&mut p, &[0x65, 0xAA, 0xBB, 0xCC]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), RTP_HEADER_LEN + 4);
        assert_eq!(packets[0][1] & 0x80, 0x80);
        assert!(nal_packets(&mut p, &[]).is_empty());
    }

    #[test]
    fn oversized_nal_becomes_fu_a() {
        let mut p = H264Packetizer::new(96, 0x11223344).with_mtu(500);
        let mut nal = vec![0x65];
        nal.extend(std::iter::repeat_n(0xAA, 1200));
        let packets = nal_packets(&mut p, &nal);
        // 1200 body bytes in 498-byte fragments.
        assert_eq!(packets.len(), 3);

        let fu: Vec<(u8, u8, bool)> = packets
            .iter()
            .map(|pk| (pk[12], pk[13], pk[1] & 0x80 != 0))
            .collect();
        assert_eq!(fu[0], (0x60 | 28, 0x80 | NAL_IDR, false));
        assert_eq!(fu[1], (0x60 | 28, NAL_IDR, false));
        assert_eq!(fu[2], (0x60 | 28, 0x40 | NAL_IDR, true));
        assert!(packets.iter().all(|pk| pk.len() <= RTP_HEADER_LEN + 500));

        let body: Vec<u8> = packets.iter().flat_map(|pk| pk[14..].to_vec()).collect();
        assert_eq!(body, nal[1..]);
    }

    #[test]
    fn sequence_numbers_are_contiguous_across_units() {
        let mut p = make_packetizer().with_mtu(100);
        feed_config(&mut p);

        let big: Vec<u8> = [&START_CODE[..], &[0x65], &[0x11; 450]].concat();
        let small = [0, 0, 0, 1, 0x41, 0x22];
        let units = [
            AccessUnit::new(&big, 0).with_flags(BufferFlags::KEY_FRAME),
            AccessUnit::new(&small, 33_333),
            AccessUnit::new(&big, 66_666),
            AccessUnit::new(&small, 99_999),
        ];

        let mut sequences = Vec::new();
        for unit in &units {
            for pk in p.packetize(unit).unwrap() {
                sequences.push(RtpPacket::parse(&pk).unwrap().sequence);
            }
        }
        assert!(sequences.len() > units.len());
        for pair in sequences.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
    }

    #[test]
    fn sdp_attributes_include_packetization_mode() {
        let p = make_packetizer();
        let attrs = p.sdp_attributes();
        assert_eq!(attrs[0].name, "rtpmap");
        assert_eq!(attrs[0].value.as_deref(), Some("96 H264/90000"));
        assert!(
            attrs[1]
                .value
                .as_deref()
                .is_some_and(|v| v.contains("packetization-mode=1"))
        );
    }

    #[test]
    fn sdp_attributes_carry_sprop_after_config() {
        let mut p = make_packetizer();
        feed_config(&mut p);
        let fmtp = p.sdp_attributes()[1].value.clone().unwrap();
        assert!(fmtp.contains("profile-level-id=42001e"));
        assert!(fmtp.contains("sprop-parameter-sets=Z0IAHg==,aM44gA=="));
    }

    #[test]
    fn codec_metadata() {
        let p = make_packetizer();
        assert_eq!(p.codec_name(), "H264");
        assert_eq!(p.clock_rate(), 90000);
        assert_eq!(p.payload_type(), 96);
        assert_eq!(p.media_type(), "video");
    }

    // --- Container helpers ---

    #[test]
    fn avcc_conversion_drops_parameter_sets() {
        let frame = [config_buffer(), vec![0, 0, 0, 1, 0x65, 0x88, 0x84]].concat();
        assert_eq!(annex_b_to_avcc(&frame), vec![0, 0, 0, 3, 0x65, 0x88, 0x84]);
    }

    #[test]
    fn decoder_configuration_record_layout() {
        let record = avc_decoder_configuration_record(&SPS, &PPS);
        assert_eq!(&record[..6], &[1, 0x42, 0x00, 0x1e, 0xff, 0xe1]);
        assert_eq!(&record[6..8], &[0, 4]);
        assert_eq!(&record[8..12], &SPS);
        assert_eq!(record[12], 1);
        assert_eq!(&record[15..], &PPS);
    }
}
