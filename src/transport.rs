use std::fmt::Debug;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use url::Url;

use crate::{Error, ErrorKind, Result};

/// Default port of the Kerberos KDC service.
pub const KDC_PORT: u16 = 88;

const MAX_UDP_DATAGRAM_LEN: usize = 0xbb80;
/// Upper bound of a KDC reply received over TCP.
const MAX_TCP_REPLY_LEN: u32 = 0x10_0000;

/// Kind of a Kerberos PDU, identified by its ASN.1 application tag (RFC 4120 section 5.10).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PduKind {
    AsReq,
    AsRep,
    TgsReq,
    TgsRep,
    ApReq,
    ApRep,
    KrbError,
}

impl PduKind {
    pub fn application_tag(self) -> u8 {
        match self {
            PduKind::AsReq => 10,
            PduKind::AsRep => 11,
            PduKind::TgsReq => 12,
            PduKind::TgsRep => 13,
            PduKind::ApReq => 14,
            PduKind::ApRep => 15,
            PduKind::KrbError => 30,
        }
    }

    /// Determines the kind of an encoded PDU from its outermost tag.
    pub fn from_pdu(pdu: &[u8]) -> Option<Self> {
        // constructed application class, low-tag-number form
        let tag = pdu.first()?;
        if tag & 0xe0 != 0x60 {
            return None;
        }

        match tag & 0x1f {
            10 => Some(PduKind::AsReq),
            11 => Some(PduKind::AsRep),
            12 => Some(PduKind::TgsReq),
            13 => Some(PduKind::TgsRep),
            14 => Some(PduKind::ApReq),
            15 => Some(PduKind::ApRep),
            30 => Some(PduKind::KrbError),
            _ => None,
        }
    }
}

/// Carries Kerberos PDUs to a KDC and back.
///
/// `send` and `expect` form one round trip: every `send` is followed by an `expect` for its reply.
/// The returned PDU may be a KRB-ERROR, the caller inspects its kind.
pub trait KdcTransport: Debug + Send {
    fn send(&mut self, pdu: &[u8]) -> Result<()>;

    /// Waits at most `timeout` for the reply. Fails with [ErrorKind::TimeoutError] when nothing arrives.
    fn expect(&mut self, timeout: Duration, expected: PduKind) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    Tcp,
    Udp,
}

impl NetworkProtocol {
    pub(crate) fn from_url_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

/// [KdcTransport] talking to a KDC over TCP (RFC 4120 section 7.2.2 framing) or UDP.
#[derive(Debug)]
pub struct NetworkTransport {
    url: Url,
    protocol: NetworkProtocol,
    pending: Option<Vec<u8>>,
}

impl NetworkTransport {
    pub fn new(url: Url) -> Result<Self> {
        let protocol = NetworkProtocol::from_url_scheme(url.scheme()).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidParameter,
                format!("unsupported KDC url scheme: {}", url.scheme()),
            )
        })?;

        Ok(Self {
            url,
            protocol,
            pending: None,
        })
    }

    fn address(&self) -> Result<String> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| Error::new(ErrorKind::InvalidParameter, "KDC url has no host"))?;

        Ok(format!("{}:{}", host, self.url.port().unwrap_or(KDC_PORT)))
    }

    fn exchange_tcp(&self, data: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let addr = self
            .address()?
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::NoAuthenticatingAuthority, "KDC host does not resolve"))?;

        let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut request = Vec::with_capacity(data.len() + 4);
        request.write_u32::<BigEndian>(u32::try_from(data.len()).map_err(|_| {
            Error::new(ErrorKind::InvalidParameter, "Kerberos message is too long")
        })?)?;
        request.extend_from_slice(data);
        stream.write_all(&request)?;

        let len = stream.read_u32::<BigEndian>()?;
        // the high bit is reserved (RFC 4120 7.2.2)
        if len > MAX_TCP_REPLY_LEN {
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                format!("KDC reply length {:#x} exceeds the limit of {:#x} bytes", len, MAX_TCP_REPLY_LEN),
            ));
        }
        let mut reply = vec![0; len as usize];
        stream.read_exact(&mut reply)?;

        Ok(reply)
    }

    fn exchange_udp(&self, data: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let udp_socket = UdpSocket::bind(("0.0.0.0", 0))?;
        udp_socket.set_read_timeout(Some(timeout))?;
        udp_socket.send_to(data, self.address()?)?;

        let mut buf = vec![0; MAX_UDP_DATAGRAM_LEN];
        let n = udp_socket.recv(&mut buf)?;
        buf.truncate(n);

        Ok(buf)
    }
}

impl KdcTransport for NetworkTransport {
    fn send(&mut self, pdu: &[u8]) -> Result<()> {
        self.pending = Some(pdu.to_vec());

        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(url = %self.url))]
    fn expect(&mut self, timeout: Duration, expected: PduKind) -> Result<Vec<u8>> {
        let request = self
            .pending
            .take()
            .ok_or_else(|| Error::new(ErrorKind::OutOfSequence, "no request was sent to the KDC"))?;

        let reply = match self.protocol {
            NetworkProtocol::Tcp => self.exchange_tcp(&request, timeout)?,
            NetworkProtocol::Udp => self.exchange_udp(&request, timeout)?,
        };

        trace!(kind = ?PduKind::from_pdu(&reply), reply_len = reply.len(), "KDC reply");

        Ok(reply)
    }
}
