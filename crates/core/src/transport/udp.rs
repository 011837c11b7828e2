use std::net::{IpAddr, SocketAddr, UdpSocket};

use parking_lot::Mutex;

use crate::error::{Result, StreamError};

#[derive(Debug)]
struct Sockets {
    rtp: UdpSocket,
    rtcp: UdpSocket,
}

/// RTP/RTCP socket pair for one media track.
///
/// RTP goes out on an even local port and RTCP on the next one when a
/// fixed base port is requested (RFC 3550 §11); with port 0 both are
/// ephemeral. Packets are sent to the destination fixed at
/// [`bind`](Self::bind) time.
///
/// This layer is address-only: it does not know about packetizers or
/// sessions.
#[derive(Debug)]
pub struct UdpPair {
    sockets: Mutex<Option<Sockets>>,
    destination: SocketAddr,
    local_rtp_port: u16,
    local_rtcp_port: u16,
}

impl UdpPair {
    /// Bind both sockets on `local_ip`. Fails if either cannot bind; the
    /// first is released in that case.
    pub fn bind(local_ip: IpAddr, base_port: u16, destination: SocketAddr) -> Result<Self> {
        let rtp = UdpSocket::bind((local_ip, base_port))?;
        let rtcp_port = if base_port == 0 { 0 } else { base_port.wrapping_add(1) };
        let rtcp = UdpSocket::bind((local_ip, rtcp_port))?;

        let local_rtp_port = rtp.local_addr()?.port();
        let local_rtcp_port = rtcp.local_addr()?.port();
        tracing::debug!(
            rtp = local_rtp_port,
            rtcp = local_rtcp_port,
            %destination,
            "UDP pair bound"
        );

        Ok(Self {
            sockets: Mutex::new(Some(Sockets { rtp, rtcp })),
            destination,
            local_rtp_port,
            local_rtcp_port,
        })
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn local_ports(&self) -> (u16, u16) {
        (self.local_rtp_port, self.local_rtcp_port)
    }

    /// RTCP destination: the port after the RTP destination.
    pub fn rtcp_destination(&self) -> SocketAddr {
        let mut addr = self.destination;
        addr.set_port(addr.port().wrapping_add(1));
        addr
    }

    pub fn send_rtp(&self, packet: &[u8]) -> Result<usize> {
        let sockets = self.sockets.lock();
        let s = sockets.as_ref().ok_or(StreamError::NotStarted)?;
        Ok(s.rtp.send_to(packet, self.destination)?)
    }

    pub fn send_rtcp(&self, packet: &[u8]) -> Result<usize> {
        let dest = self.rtcp_destination();
        let sockets = self.sockets.lock();
        let s = sockets.as_ref().ok_or(StreamError::NotStarted)?;
        Ok(s.rtcp.send_to(packet, dest)?)
    }

    /// Release both sockets. Idempotent.
    pub fn close(&self) {
        if self.sockets.lock().take().is_some() {
            tracing::debug!(rtp = self.local_rtp_port, "UDP pair closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sockets.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn sends_rtp_and_rtcp_to_adjacent_ports() {
        // Find an even port pair for the receiver.
        let (rx_rtp, rx_rtcp) = loop {
            let a = UdpSocket::bind((LOCALHOST, 0)).unwrap();
            let port = a.local_addr().unwrap().port();
            if port % 2 == 0 {
                if let Ok(b) = UdpSocket::bind((LOCALHOST, port + 1)) {
                    break (a, b);
                }
            }
        };
        rx_rtp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        rx_rtcp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let pair = UdpPair::bind(LOCALHOST, 0, rx_rtp.local_addr().unwrap()).unwrap();
        pair.send_rtp(b"rtp").unwrap();
        pair.send_rtcp(b"rtcp").unwrap();

        let mut buf = [0u8; 16];
        let n = rx_rtp.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"rtp");
        let n = rx_rtcp.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"rtcp");
    }

    #[test]
    fn bind_fails_when_port_taken() {
        let taken = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let dest = SocketAddr::new(LOCALHOST, 9);
        assert!(UdpPair::bind(LOCALHOST, port, dest).is_err());
    }

    #[test]
    fn send_after_close_fails() {
        let dest = SocketAddr::new(LOCALHOST, 9);
        let pair = UdpPair::bind(LOCALHOST, 0, dest).unwrap();
        pair.close();
        pair.close();
        assert!(pair.is_closed());
        assert!(matches!(pair.send_rtp(b"x"), Err(StreamError::NotStarted)));
    }
}
