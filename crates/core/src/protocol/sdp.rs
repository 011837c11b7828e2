//! SDP (Session Description Protocol) model, parser and generator
//! (RFC 4566 / RFC 8866).
//!
//! A description is a sequence of `<type>=<value>` lines in a fixed order:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! i= u= e= p=                                   ← optional info, URI, emails, phones
//! c=IN IP4 <addr>                               ← connection address
//! b=<type>:<kbps>                               ← bandwidth
//! t=<start> <stop>                              ← timing (0 0 for live)
//! r=<repeat>                                    ← repeat times for the preceding t=
//! z= k=                                         ← time zones, encryption key
//! a=tool:srt-streaming                          ← session attributes
//! m=video 5006 RTP/AVP 96                       ← media description
//! i= c= b= k=                                   ← media-level overrides
//! a=rtpmap:96 H264/90000                        ← media attributes
//! ```
//!
//! [`SessionDescription`] round-trips field-for-field through
//! [`SessionDescription::parse`] and its `Display` impl. Output always uses
//! CRLF; input may use bare LF. Unknown line types are skipped.

use std::fmt;

use crate::error::{Result, SdpErrorKind, StreamError};
use crate::media::Packetizer;

/// `o=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl Origin {
    pub fn ip4(username: &str, session_id: u64, session_version: u64, address: &str) -> Self {
        Self {
            username: username.to_string(),
            session_id: session_id.to_string(),
            session_version: session_version.to_string(),
            net_type: "IN".to_string(),
            addr_type: "IP4".to_string(),
            address: address.to_string(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.username,
            self.session_id,
            self.session_version,
            self.net_type,
            self.addr_type,
            self.address
        )
    }
}

/// `c=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl Connection {
    pub fn ip4(address: &str) -> Self {
        Self {
            net_type: "IN".to_string(),
            addr_type: "IP4".to_string(),
            address: address.to_string(),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.net_type, self.addr_type, self.address)
    }
}

/// `b=<bwtype>:<bandwidth>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bandwidth {
    pub kind: String,
    pub value: u64,
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// `t=` line plus the `r=` lines that follow it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timing {
    pub start: u64,
    pub stop: u64,
    pub repeats: Vec<String>,
}

/// `a=<name>` or `a=<name>:<value>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl Attribute {
    /// Property attribute without a value (`a=sendonly`).
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((name, value)) => Self::value(name, value),
            None => Self::flag(raw),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}:{}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One `m=` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media: String,
    pub port: u16,
    pub port_count: Option<u16>,
    pub protocol: String,
    pub formats: Vec<String>,
    pub information: Option<String>,
    pub connection: Option<Connection>,
    pub bandwidths: Vec<Bandwidth>,
    pub key: Option<String>,
    pub attributes: Vec<Attribute>,
}

impl MediaDescription {
    pub fn new(media: &str, port: u16, protocol: &str, formats: Vec<String>) -> Self {
        Self {
            media: media.to_string(),
            port,
            port_count: None,
            protocol: protocol.to_string(),
            formats,
            information: None,
            connection: None,
            bandwidths: Vec::new(),
            key: None,
            attributes: Vec::new(),
        }
    }

    /// First format as an RTP payload type.
    pub fn payload_type(&self) -> Option<u8> {
        self.formats.first()?.parse().ok()
    }

    /// Value of the first attribute called `name`.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub version: u32,
    pub origin: Origin,
    pub session_name: String,
    pub information: Option<String>,
    pub uri: Option<String>,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub connection: Option<Connection>,
    pub bandwidths: Vec<Bandwidth>,
    pub timings: Vec<Timing>,
    pub time_zones: Option<String>,
    pub key: Option<String>,
    pub attributes: Vec<Attribute>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn new(origin: Origin, session_name: &str) -> Self {
        Self {
            version: 0,
            origin,
            session_name: session_name.to_string(),
            information: None,
            uri: None,
            emails: Vec::new(),
            phones: Vec::new(),
            connection: None,
            bandwidths: Vec::new(),
            timings: Vec::new(),
            time_zones: None,
            key: None,
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }

    /// Parse SDP text. Requires `v=`, `o=` and `s=`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut version = None;
        let mut origin = None;
        let mut session_name = None;
        let mut sdp = Self::new(Origin::ip4("-", 0, 0, "0.0.0.0"), "");
        let mut seen_any = false;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            seen_any = true;

            let err = |kind| StreamError::Sdp {
                line: line_no,
                kind,
            };
            let bytes = line.as_bytes();
            if bytes.len() < 2 || bytes[1] != b'=' || !bytes[0].is_ascii_alphabetic() {
                return Err(err(SdpErrorKind::InvalidLine));
            }
            let kind = bytes[0] as char;
            let value = &line[2..];
            let invalid = || err(SdpErrorKind::InvalidValue(kind));

            // Media-level lines once an m= block has opened.
            if let Some(m) = sdp.media.last_mut() {
                match kind {
                    'i' => {
                        m.information = Some(value.to_string());
                        continue;
                    }
                    'c' => {
                        m.connection = Some(parse_connection(value).ok_or_else(invalid)?);
                        continue;
                    }
                    'b' => {
                        m.bandwidths.push(parse_bandwidth(value).ok_or_else(invalid)?);
                        continue;
                    }
                    'k' => {
                        m.key = Some(value.to_string());
                        continue;
                    }
                    'a' => {
                        m.attributes.push(Attribute::parse(value));
                        continue;
                    }
                    _ => {}
                }
            }

            match kind {
                'v' => version = Some(value.trim().parse::<u32>().map_err(|_| invalid())?),
                'o' => origin = Some(parse_origin(value).ok_or_else(invalid)?),
                's' => session_name = Some(value.to_string()),
                'i' => sdp.information = Some(value.to_string()),
                'u' => sdp.uri = Some(value.to_string()),
                'e' => sdp.emails.push(value.to_string()),
                'p' => sdp.phones.push(value.to_string()),
                'c' => sdp.connection = Some(parse_connection(value).ok_or_else(invalid)?),
                'b' => sdp.bandwidths.push(parse_bandwidth(value).ok_or_else(invalid)?),
                't' => sdp.timings.push(parse_timing(value).ok_or_else(invalid)?),
                'r' => sdp
                    .timings
                    .last_mut()
                    .ok_or_else(invalid)?
                    .repeats
                    .push(value.to_string()),
                'z' => sdp.time_zones = Some(value.to_string()),
                'k' => sdp.key = Some(value.to_string()),
                'a' => sdp.attributes.push(Attribute::parse(value)),
                'm' => sdp.media.push(parse_media(value).ok_or_else(invalid)?),
                other => {
                    tracing::debug!(line = line_no, kind = %other, "skipping unknown SDP line");
                }
            }
        }

        if !seen_any {
            return Err(StreamError::Sdp {
                line: 0,
                kind: SdpErrorKind::Empty,
            });
        }
        let missing = |c| StreamError::Sdp {
            line: 0,
            kind: SdpErrorKind::MissingField(c),
        };
        sdp.version = version.ok_or_else(|| missing('v'))?;
        sdp.origin = origin.ok_or_else(|| missing('o'))?;
        sdp.session_name = session_name.ok_or_else(|| missing('s'))?;
        Ok(sdp)
    }
}

fn parse_origin(value: &str) -> Option<Origin> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    let [username, session_id, session_version, net_type, addr_type, address] = parts[..] else {
        return None;
    };
    Some(Origin {
        username: username.to_string(),
        session_id: session_id.to_string(),
        session_version: session_version.to_string(),
        net_type: net_type.to_string(),
        addr_type: addr_type.to_string(),
        address: address.to_string(),
    })
}

fn parse_connection(value: &str) -> Option<Connection> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    let [net_type, addr_type, address] = parts[..] else {
        return None;
    };
    Some(Connection {
        net_type: net_type.to_string(),
        addr_type: addr_type.to_string(),
        address: address.to_string(),
    })
}

fn parse_bandwidth(value: &str) -> Option<Bandwidth> {
    let (kind, amount) = value.split_once(':')?;
    Some(Bandwidth {
        kind: kind.to_string(),
        value: amount.trim().parse().ok()?,
    })
}

fn parse_timing(value: &str) -> Option<Timing> {
    let mut parts = value.split_whitespace();
    let start = parts.next()?.parse().ok()?;
    let stop = parts.next()?.parse().ok()?;
    Some(Timing {
        start,
        stop,
        repeats: Vec::new(),
    })
}

fn parse_media(value: &str) -> Option<MediaDescription> {
    let mut parts = value.split_whitespace();
    let media = parts.next()?;
    let port_field = parts.next()?;
    let (port, port_count) = match port_field.split_once('/') {
        Some((port, count)) => (port.parse().ok()?, Some(count.parse().ok()?)),
        None => (port_field.parse().ok()?, None),
    };
    let protocol = parts.next()?;
    let mut m = MediaDescription::new(media, port, protocol, parts.map(str::to_string).collect());
    m.port_count = port_count;
    Some(m)
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {}", self.media, self.port)?;
        if let Some(count) = self.port_count {
            write!(f, "/{count}")?;
        }
        write!(f, " {}", self.protocol)?;
        for format in &self.formats {
            write!(f, " {format}")?;
        }
        f.write_str("\r\n")?;

        if let Some(i) = &self.information {
            write!(f, "i={i}\r\n")?;
        }
        if let Some(c) = &self.connection {
            write!(f, "c={c}\r\n")?;
        }
        for b in &self.bandwidths {
            write!(f, "b={b}\r\n")?;
        }
        if let Some(k) = &self.key {
            write!(f, "k={k}\r\n")?;
        }
        for a in &self.attributes {
            write!(f, "a={a}\r\n")?;
        }
        Ok(())
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(f, "o={}\r\n", self.origin)?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(i) = &self.information {
            write!(f, "i={i}\r\n")?;
        }
        if let Some(u) = &self.uri {
            write!(f, "u={u}\r\n")?;
        }
        for e in &self.emails {
            write!(f, "e={e}\r\n")?;
        }
        for p in &self.phones {
            write!(f, "p={p}\r\n")?;
        }
        if let Some(c) = &self.connection {
            write!(f, "c={c}\r\n")?;
        }
        for b in &self.bandwidths {
            write!(f, "b={b}\r\n")?;
        }
        for t in &self.timings {
            write!(f, "t={} {}\r\n", t.start, t.stop)?;
            for r in &t.repeats {
                write!(f, "r={r}\r\n")?;
            }
        }
        if let Some(z) = &self.time_zones {
            write!(f, "z={z}\r\n")?;
        }
        if let Some(k) = &self.key {
            write!(f, "k={k}\r\n")?;
        }
        for a in &self.attributes {
            write!(f, "a={a}\r\n")?;
        }
        for m in &self.media {
            write!(f, "{m}")?;
        }
        Ok(())
    }
}

/// Build the description for a set of RTP tracks, each with the port its
/// packets are sent to.
///
/// Session and origin fields come from the caller so nothing is hardcoded.
/// Tracks get `a=control:trackN` in order, starting at 1.
pub fn describe(
    ip: &str,
    session_id: u64,
    session_name: &str,
    tracks: &[(&dyn Packetizer, u16)],
) -> SessionDescription {
    let mut sdp = SessionDescription::new(Origin::ip4("-", session_id, 1, ip), session_name);
    sdp.connection = Some(Connection::ip4(ip));
    sdp.timings.push(Timing::default());
    sdp.attributes.push(Attribute::value("tool", "srt-streaming"));
    sdp.attributes.push(Attribute::flag("sendonly"));

    for (index, (packetizer, port)) in tracks.iter().enumerate() {
        let mut m = MediaDescription::new(
            packetizer.media_type(),
            *port,
            "RTP/AVP",
            vec![packetizer.payload_type().to_string()],
        );
        m.attributes = packetizer.sdp_attributes();
        m.attributes
            .push(Attribute::value("control", format!("track{}", index + 1)));
        sdp.media.push(m);
    }

    tracing::debug!(sdp = %sdp, "SDP generated");
    sdp
}
