//! Frame header dissection for transmit hashing.
//!
//! Frames are raw Ethernet II frames as handed to the bond by the host stack.
//! Only the headers needed to pick a slave are decoded:
//! - Ethernet (14 bytes), optionally followed by one 802.1Q tag (4 bytes)
//! - IPv4 (IHL-sized header) or IPv6 (40-byte fixed header, no extension walk)
//! - The first four bytes of the L4 header (source and destination port)
//!
//! All multi-byte fields are network byte order (big-endian).

use crate::device::MacAddr;

/// Ethernet II header length
pub const ETH_HEADER_LEN: usize = 14;

/// Offset of the EtherType field, i.e. the bytes covered by both addresses
pub const ETH_ADDRS_LEN: usize = 12;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_IPV6: u16 = 0x86DD;

pub const IPPROTO_IGMP: u8 = 2;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_DCCP: u8 = 33;
pub const IPPROTO_SCTP: u8 = 132;
pub const IPPROTO_UDPLITE: u8 = 136;

const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// IPv4 "more fragments" flag plus the 13-bit fragment offset
const IPV4_FRAG_MASK: u16 = 0x3FFF;

/// Frame dissection errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Not an IP frame (ethertype 0x{0:04X})")]
    NotIp(u16),

    #[error("Invalid IPv4 header length: {0}")]
    InvalidIhl(u8),

    #[error("IP version {found} does not match ethertype 0x{ether_type:04X}")]
    VersionMismatch { ether_type: u16, found: u8 },
}

fn need(buf: &[u8], len: usize) -> Result<(), FrameError> {
    if buf.len() < len {
        return Err(FrameError::Truncated {
            expected: len,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Decoded Ethernet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// EtherType after any 802.1Q tag
    pub ether_type: u16,
    /// Offset of the network header
    pub payload_offset: usize,
}

impl EthernetHeader {
    /// Decode the Ethernet header, skipping one VLAN tag if present
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        need(buf, ETH_HEADER_LEN)?;
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&buf[0..6]);
        src.copy_from_slice(&buf[6..12]);

        let mut ether_type = be16(buf, 12);
        let mut payload_offset = ETH_HEADER_LEN;
        if ether_type == ETH_P_8021Q {
            need(buf, ETH_HEADER_LEN + VLAN_TAG_LEN)?;
            ether_type = be16(buf, ETH_HEADER_LEN + 2);
            payload_offset += VLAN_TAG_LEN;
        }

        Ok(Self {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ether_type,
            payload_offset,
        })
    }
}

/// Hash inputs extracted from the network and transport headers.
///
/// IPv6 addresses are folded to 32 bits by XOR-ing their four words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowKeys {
    pub src: u32,
    pub dst: u32,
    /// Source and destination port as one big-endian word, 0 when absent
    pub ports: u32,
    pub ip_proto: u8,
}

fn fold_ipv6(buf: &[u8], at: usize) -> u32 {
    be32(buf, at) ^ be32(buf, at + 4) ^ be32(buf, at + 8) ^ be32(buf, at + 12)
}

fn has_ports(ip_proto: u8) -> bool {
    matches!(
        ip_proto,
        IPPROTO_TCP | IPPROTO_UDP | IPPROTO_DCCP | IPPROTO_SCTP | IPPROTO_UDPLITE
    )
}

fn read_ports(buf: &[u8], at: usize, ip_proto: u8) -> u32 {
    if !has_ports(ip_proto) || buf.len() < at + 4 {
        return 0;
    }
    be32(buf, at)
}

/// An outgoing frame plus the metadata the host attached to it
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    data: &'a [u8],
    queue_mapping: u16,
}

impl<'a> Frame<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            queue_mapping: 0,
        }
    }

    /// Attach the upper layer's queue hint (0 = none)
    pub fn with_queue_mapping(mut self, queue_mapping: u16) -> Self {
        self.queue_mapping = queue_mapping;
        self
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn queue_mapping(&self) -> u16 {
        self.queue_mapping
    }

    pub fn ethernet(&self) -> Result<EthernetHeader, FrameError> {
        EthernetHeader::decode(self.data)
    }

    /// Last octet of destination XOR last octet of source, 0 if the
    /// addresses are not all there
    pub fn l2_hash(&self) -> u32 {
        if self.data.len() < ETH_ADDRS_LEN {
            return 0;
        }
        u32::from(self.data[5] ^ self.data[11])
    }

    /// Extract L3 addresses and, when `with_ports` is set, L4 ports.
    ///
    /// Fragments never yield ports.
    pub fn flow_keys(&self, with_ports: bool) -> Result<FlowKeys, FrameError> {
        let eth = self.ethernet()?;
        let buf = self.data;
        let off = eth.payload_offset;
        match eth.ether_type {
            ETH_P_IP => {
                need(buf, off + IPV4_MIN_HEADER_LEN)?;
                let version = buf[off] >> 4;
                if version != 4 {
                    return Err(FrameError::VersionMismatch {
                        ether_type: eth.ether_type,
                        found: version,
                    });
                }
                let ihl = buf[off] & 0x0F;
                let header_len = usize::from(ihl) * 4;
                if header_len < IPV4_MIN_HEADER_LEN {
                    return Err(FrameError::InvalidIhl(ihl));
                }
                need(buf, off + header_len)?;
                let ip_proto = buf[off + 9];
                let fragment = be16(buf, off + 6) & IPV4_FRAG_MASK != 0;
                let ports = if with_ports && !fragment {
                    read_ports(buf, off + header_len, ip_proto)
                } else {
                    0
                };
                Ok(FlowKeys {
                    src: be32(buf, off + 12),
                    dst: be32(buf, off + 16),
                    ports,
                    ip_proto,
                })
            }
            ETH_P_IPV6 => {
                need(buf, off + IPV6_HEADER_LEN)?;
                let version = buf[off] >> 4;
                if version != 6 {
                    return Err(FrameError::VersionMismatch {
                        ether_type: eth.ether_type,
                        found: version,
                    });
                }
                let ip_proto = buf[off + 6];
                let ports = if with_ports {
                    read_ports(buf, off + IPV6_HEADER_LEN, ip_proto)
                } else {
                    0
                };
                Ok(FlowKeys {
                    src: fold_ipv6(buf, off + 8),
                    dst: fold_ipv6(buf, off + 24),
                    ports,
                    ip_proto,
                })
            }
            other => Err(FrameError::NotIp(other)),
        }
    }

    /// IPv4 IGMP, which round-robin pins to the active slave
    pub fn is_igmp(&self) -> bool {
        let Ok(eth) = self.ethernet() else {
            return false;
        };
        let off = eth.payload_offset;
        eth.ether_type == ETH_P_IP
            && self.data.len() >= off + IPV4_MIN_HEADER_LEN
            && self.data[off + 9] == IPPROTO_IGMP
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Frame builders shared by unit tests.

    use super::*;

    pub fn ethernet(dst: [u8; 6], src: [u8; 6], ether_type: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&dst);
        buf.extend_from_slice(&src);
        buf.extend_from_slice(&ether_type.to_be_bytes());
        buf
    }

    pub fn ipv4(src: [u8; 4], dst: [u8; 4], proto: u8, ports: Option<(u16, u16)>) -> Vec<u8> {
        let mut buf = ethernet([0, 0, 0, 0, 0, 0x02], [0, 0, 0, 0, 0, 0x01], ETH_P_IP);
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = proto;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        buf.extend_from_slice(&ip);
        if let Some((sport, dport)) = ports {
            buf.extend_from_slice(&sport.to_be_bytes());
            buf.extend_from_slice(&dport.to_be_bytes());
            buf.extend_from_slice(&[0u8; 16]);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_ethernet_decode() {
        let buf = ethernet([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12], ETH_P_ARP);
        let eth = EthernetHeader::decode(&buf).unwrap();
        assert_eq!(eth.dst, MacAddr::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(eth.src, MacAddr::new([7, 8, 9, 10, 11, 12]));
        assert_eq!(eth.ether_type, ETH_P_ARP);
        assert_eq!(eth.payload_offset, ETH_HEADER_LEN);
    }

    #[test]
    fn test_ethernet_vlan_tag_skipped() {
        let mut buf = ethernet([0; 6], [0; 6], ETH_P_8021Q);
        buf.extend_from_slice(&[0x00, 0x0A]);
        buf.extend_from_slice(&ETH_P_IPV6.to_be_bytes());
        let eth = EthernetHeader::decode(&buf).unwrap();
        assert_eq!(eth.ether_type, ETH_P_IPV6);
        assert_eq!(eth.payload_offset, ETH_HEADER_LEN + 4);
    }

    #[test]
    fn test_truncated_frame() {
        let buf = [0u8; 10];
        assert!(matches!(
            EthernetHeader::decode(&buf),
            Err(FrameError::Truncated { expected: 14, actual: 10 })
        ));
        assert_eq!(Frame::new(&buf).l2_hash(), 0);
    }

    #[test]
    fn test_l2_hash() {
        let buf = ethernet([0, 0, 0, 0, 0, 0x0F], [0, 0, 0, 0, 0, 0x03], ETH_P_IP);
        assert_eq!(Frame::new(&buf).l2_hash(), 0x0C);
    }

    #[test]
    fn test_ipv4_flow_keys() {
        let buf = ipv4([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_TCP, Some((1234, 80)));
        let keys = Frame::new(&buf).flow_keys(true).unwrap();
        assert_eq!(keys.src, 0x0A00_0001);
        assert_eq!(keys.dst, 0x0A00_0002);
        assert_eq!(keys.ports, (1234u32 << 16) | 80);
        assert_eq!(keys.ip_proto, IPPROTO_TCP);

        let no_ports = Frame::new(&buf).flow_keys(false).unwrap();
        assert_eq!(no_ports.ports, 0);
    }

    #[test]
    fn test_ipv4_fragment_has_no_ports() {
        let mut buf = ipv4([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_UDP, Some((53, 53)));
        // more-fragments flag
        buf[ETH_HEADER_LEN + 6] = 0x20;
        let keys = Frame::new(&buf).flow_keys(true).unwrap();
        assert_eq!(keys.ports, 0);
    }

    #[test]
    fn test_ipv4_bad_ihl() {
        let mut buf = ipv4([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_TCP, None);
        buf[ETH_HEADER_LEN] = 0x44;
        assert_eq!(
            Frame::new(&buf).flow_keys(false),
            Err(FrameError::InvalidIhl(4))
        );
    }

    #[test]
    fn test_ipv6_addresses_fold() {
        let mut buf = ethernet([0; 6], [0; 6], ETH_P_IPV6);
        let mut ip = [0u8; 40];
        ip[0] = 0x60;
        ip[6] = IPPROTO_UDP;
        ip[8..12].copy_from_slice(&[0, 0, 0, 1]);
        ip[20..24].copy_from_slice(&[0, 0, 0, 2]);
        ip[24..28].copy_from_slice(&[0, 0, 0, 4]);
        buf.extend_from_slice(&ip);
        buf.extend_from_slice(&[0x00, 0x35, 0x00, 0x35]);
        let keys = Frame::new(&buf).flow_keys(true).unwrap();
        assert_eq!(keys.src, 3);
        assert_eq!(keys.dst, 4);
        assert_eq!(keys.ports, 0x0035_0035);
    }

    #[test]
    fn test_non_ip_rejected() {
        let buf = ethernet([0; 6], [0; 6], ETH_P_ARP);
        assert_eq!(
            Frame::new(&buf).flow_keys(true),
            Err(FrameError::NotIp(ETH_P_ARP))
        );
    }

    #[test]
    fn test_igmp_detection() {
        let igmp = ipv4([10, 0, 0, 1], [224, 0, 0, 1], IPPROTO_IGMP, None);
        let tcp = ipv4([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_TCP, None);
        assert!(Frame::new(&igmp).is_igmp());
        assert!(!Frame::new(&tcp).is_igmp());
    }
}
