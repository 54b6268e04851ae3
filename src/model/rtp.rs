//! RTP packet decoding (RFC 3550 section 5.1)
//!
//! The transcoders emit plain RTP over UDP. Only the fixed header fields and the
//! payload are kept; CSRCs and the header extension are validated and skipped.

use bytes::{Buf, Bytes};

use crate::error::MalformedPacket;

const FIXED_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Decode one datagram.
    pub fn parse(data: &[u8]) -> Result<RtpPacket, MalformedPacket> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(MalformedPacket::TooShort(data.len()));
        }

        let mut buf = Bytes::copy_from_slice(data);

        let b0 = buf.get_u8();
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(MalformedPacket::Version(version));
        }
        let has_padding = b0 & 0x20 != 0;
        let has_extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0f) as usize;

        let b1 = buf.get_u8();
        let marker = b1 & 0x80 != 0;
        let payload_type = b1 & 0x7f;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let csrc_len = csrc_count * 4;
        if buf.remaining() < csrc_len {
            return Err(MalformedPacket::Truncated("csrc list"));
        }
        buf.advance(csrc_len);

        if has_extension {
            if buf.remaining() < 4 {
                return Err(MalformedPacket::Truncated("extension header"));
            }
            let _profile = buf.get_u16();
            let ext_len = buf.get_u16() as usize * 4;
            if buf.remaining() < ext_len {
                return Err(MalformedPacket::Truncated("extension body"));
            }
            buf.advance(ext_len);
        }

        if has_padding {
            let pad = match buf.last() {
                Some(&n) => n as usize,
                None => return Err(MalformedPacket::Truncated("padding")),
            };
            if pad == 0 || pad > buf.remaining() {
                return Err(MalformedPacket::Padding(pad));
            }
            buf.truncate(buf.remaining() - pad);
        }

        Ok(RtpPacket {
            header: RtpHeader {
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
            },
            payload: buf,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a minimal RTP datagram without CSRCs or extensions.
    pub(crate) fn datagram(pt: u8, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0x80, pt & 0x7f];
        v.extend_from_slice(&seq.to_be_bytes());
        v.extend_from_slice(&90_000u32.to_be_bytes());
        v.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn parses_fixed_header() {
        let mut data = datagram(111, 42, b"vp8");
        data[1] |= 0x80;

        let p = RtpPacket::parse(&data).unwrap();
        assert!(p.header.marker);
        assert_eq!(p.header.payload_type, 111);
        assert_eq!(p.header.sequence_number, 42);
        assert_eq!(p.header.timestamp, 90_000);
        assert_eq!(p.header.ssrc, 0x1234_5678);
        assert_eq!(&p.payload[..], b"vp8");
    }

    #[test]
    fn skips_csrcs_and_extension() {
        let mut data = datagram(96, 1, &[]);
        data[0] |= 0x10 | 0x01;
        // one csrc
        data.extend_from_slice(&[0, 0, 0, 9]);
        // one-byte extension profile, one word long
        data.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01, 0x10, 0xff, 0x00, 0x00]);
        data.extend_from_slice(b"frame");

        let p = RtpPacket::parse(&data).unwrap();
        assert_eq!(&p.payload[..], b"frame");
    }

    #[test]
    fn strips_padding() {
        let mut data = datagram(96, 1, b"ab");
        data[0] |= 0x20;
        data.extend_from_slice(&[0, 0, 3]);

        let p = RtpPacket::parse(&data).unwrap();
        assert_eq!(&p.payload[..], b"ab");
    }

    #[test]
    fn rejects_truncated_datagrams() {
        let data = datagram(96, 1, b"payload");

        assert_eq!(RtpPacket::parse(&data[..5]), Err(MalformedPacket::TooShort(5)));
        assert_eq!(RtpPacket::parse(&[]), Err(MalformedPacket::TooShort(0)));

        let mut csrc = datagram(96, 1, &[]);
        csrc[0] |= 0x02;
        assert_eq!(
            RtpPacket::parse(&csrc),
            Err(MalformedPacket::Truncated("csrc list"))
        );
    }

    #[test]
    fn rejects_wrong_version_and_bad_padding() {
        let mut data = datagram(96, 1, b"x");
        data[0] = 0x40;
        assert_eq!(RtpPacket::parse(&data), Err(MalformedPacket::Version(1)));

        let mut data = datagram(96, 1, b"x");
        data[0] |= 0x20;
        data.push(9);
        assert_eq!(RtpPacket::parse(&data), Err(MalformedPacket::Padding(9)));
    }
}
