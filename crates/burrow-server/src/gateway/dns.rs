//! Minimal DNS wire codec for the resolver chain.
//!
//! Implements just enough of RFC 1035 to:
//! - build a recursive A or AAAA query
//! - parse the answer section of a response, following name compression

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use burrow_core::error::{TunnelError, TunnelResult};

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;
const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

/// DNS message header (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    fn parse(buf: &[u8]) -> TunnelResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(TunnelError::Resolution("DNS header too short".into()));
        }
        let word = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
        Ok(Self {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        for word in [
            self.id,
            self.flags,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
    }

    fn rcode(&self) -> u16 {
        self.flags & 0x000F
    }
}

/// Build a recursive query for `name` with record type `qtype`.
pub fn build_query(id: u16, name: &str, qtype: u16) -> TunnelResult<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    DnsHeader {
        id,
        flags: FLAG_RD,
        qdcount: 1,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    }
    .write(&mut out);
    write_name(name, &mut out)?;
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(out)
}

/// Parse a response to the query with transaction id `id`.
///
/// Returns `Ok(None)` when the id does not match, so the caller can keep
/// waiting. A non-zero RCODE is an error. Only A and AAAA answers are
/// collected.
pub fn parse_response(buf: &[u8], id: u16) -> TunnelResult<Option<Vec<IpAddr>>> {
    let header = DnsHeader::parse(buf)?;
    if header.id != id {
        return Ok(None);
    }
    if header.flags & FLAG_QR == 0 {
        return Err(TunnelError::Resolution("DNS message is not a response".into()));
    }
    if header.rcode() != 0 {
        return Err(TunnelError::Resolution(format!(
            "DNS server returned {}",
            rcode_name(header.rcode())
        )));
    }

    let mut pos = HEADER_LEN;
    for _ in 0..header.qdcount {
        pos = skip_name(buf, pos)?;
        pos = advance(buf, pos, 4)?;
    }

    let mut addrs = Vec::new();
    for _ in 0..header.ancount {
        pos = skip_name(buf, pos)?;
        let fixed = slice(buf, pos, 10)?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rclass = u16::from_be_bytes([fixed[2], fixed[3]]);
        let rdlen = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        pos += 10;
        let rdata = slice(buf, pos, rdlen)?;
        pos += rdlen;

        if rclass != QCLASS_IN {
            continue;
        }
        match (rtype, rdlen) {
            (QTYPE_A, 4) => {
                let octets: [u8; 4] = [rdata[0], rdata[1], rdata[2], rdata[3]];
                addrs.push(IpAddr::V4(Ipv4Addr::from(octets)));
            }
            (QTYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addrs.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
    }
    Ok(Some(addrs))
}

fn write_name(name: &str, out: &mut Vec<u8>) -> TunnelResult<()> {
    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() || trimmed.len() > MAX_NAME_LEN {
        return Err(TunnelError::Resolution(format!("invalid DNS name: {name:?}")));
    }
    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(TunnelError::Resolution(format!("invalid DNS label in {name:?}")));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Skip an encoded name starting at `pos`, returning the offset after it.
fn skip_name(buf: &[u8], mut pos: usize) -> TunnelResult<usize> {
    loop {
        let len = *buf
            .get(pos)
            .ok_or_else(|| TunnelError::Resolution("truncated DNS name".into()))?;
        match len & 0xC0 {
            0xC0 => {
                // a pointer ends the name in place
                slice(buf, pos, 2)?;
                return Ok(pos + 2);
            }
            0x00 if len == 0 => return Ok(pos + 1),
            0x00 => pos = advance(buf, pos, 1 + len as usize)?,
            _ => return Err(TunnelError::Resolution("invalid DNS label type".into())),
        }
    }
}

fn slice(buf: &[u8], pos: usize, len: usize) -> TunnelResult<&[u8]> {
    buf.get(pos..pos + len)
        .ok_or_else(|| TunnelError::Resolution("truncated DNS message".into()))
}

fn advance(buf: &[u8], pos: usize, len: usize) -> TunnelResult<usize> {
    slice(buf, pos, len)?;
    Ok(pos + len)
}

fn rcode_name(rcode: u16) -> String {
    match rcode {
        1 => "FORMERR".into(),
        2 => "SERVFAIL".into(),
        3 => "NXDOMAIN".into(),
        4 => "NOTIMP".into(),
        5 => "REFUSED".into(),
        other => format!("rcode {other}"),
    }
}

/// Build a response to `query` answering with `addrs` (test fixtures only).
#[cfg(test)]
pub(crate) fn build_response(query: &[u8], rcode: u16, addrs: &[IpAddr]) -> Vec<u8> {
    let header = DnsHeader::parse(query).unwrap();
    let question = &query[HEADER_LEN..];
    let mut out = Vec::new();
    DnsHeader {
        id: header.id,
        flags: FLAG_QR | FLAG_RD | 0x0080 | rcode,
        qdcount: 1,
        ancount: addrs.len() as u16,
        nscount: 0,
        arcount: 0,
    }
    .write(&mut out);
    out.extend_from_slice(question);
    for addr in addrs {
        // compressed pointer back to the question name
        out.extend_from_slice(&[0xC0, HEADER_LEN as u8]);
        let (rtype, rdata) = match addr {
            IpAddr::V4(v4) => (QTYPE_A, v4.octets().to_vec()),
            IpAddr::V6(v6) => (QTYPE_AAAA, v6.octets().to_vec()),
        };
        out.extend_from_slice(&rtype.to_be_bytes());
        out.extend_from_slice(&QCLASS_IN.to_be_bytes());
        out.extend_from_slice(&300u32.to_be_bytes());
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_layout() {
        let q = build_query(0xBEEF, "db.internal", QTYPE_A).unwrap();
        assert_eq!(&q[..2], &[0xBE, 0xEF]);
        assert_eq!(&q[2..4], &[0x01, 0x00]);
        assert_eq!(&q[4..6], &[0x00, 0x01]);
        assert_eq!(&q[12..], b"\x02db\x08internal\x00\x00\x01\x00\x01");
    }

    #[test]
    fn trailing_dot_is_accepted() {
        assert_eq!(
            build_query(1, "example.com.", QTYPE_A).unwrap(),
            build_query(1, "example.com", QTYPE_A).unwrap()
        );
    }

    #[test]
    fn bad_names_rejected() {
        assert!(build_query(1, "", QTYPE_A).is_err());
        assert!(build_query(1, "a..b", QTYPE_A).is_err());
        assert!(build_query(1, &format!("{}.com", "x".repeat(64)), QTYPE_A).is_err());
    }

    #[test]
    fn parses_compressed_answers() {
        let q = build_query(7, "example.com", QTYPE_A).unwrap();
        let addrs: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "::1".parse().unwrap()];
        let resp = build_response(&q, 0, &addrs);
        assert_eq!(parse_response(&resp, 7).unwrap(), Some(addrs));
    }

    #[test]
    fn mismatched_id_is_ignored() {
        let q = build_query(7, "example.com", QTYPE_A).unwrap();
        let resp = build_response(&q, 0, &["10.0.0.1".parse().unwrap()]);
        assert_eq!(parse_response(&resp, 8).unwrap(), None);
    }

    #[test]
    fn nxdomain_is_error() {
        let q = build_query(7, "missing.example", QTYPE_A).unwrap();
        let resp = build_response(&q, 3, &[]);
        let err = parse_response(&resp, 7).unwrap_err();
        assert!(err.to_string().contains("NXDOMAIN"));
    }

    #[test]
    fn truncated_response_is_error() {
        let q = build_query(7, "example.com", QTYPE_A).unwrap();
        let resp = build_response(&q, 0, &["10.0.0.1".parse().unwrap()]);
        assert!(parse_response(&resp[..resp.len() - 2], 7).is_err());
        assert!(parse_response(&resp[..5], 7).is_err());
    }

    #[test]
    fn queries_are_not_responses() {
        let q = build_query(7, "example.com", QTYPE_A).unwrap();
        assert!(parse_response(&q, 7).is_err());
    }

    #[test]
    fn pointers_are_skipped_without_following() {
        let q = build_query(7, "example.com", QTYPE_A).unwrap();
        let mut resp = build_response(&q, 0, &["10.0.0.1".parse().unwrap()]);
        // point the answer name at itself
        let at = q.len();
        resp[at] = 0xC0 | (at >> 8) as u8;
        resp[at + 1] = at as u8;
        assert_eq!(
            parse_response(&resp, 7).unwrap(),
            Some(vec!["10.0.0.1".parse().unwrap()])
        );
    }
}
