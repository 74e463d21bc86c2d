
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::*;

pub(crate) const RECEIVE_MTU: usize = 8192;
pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// Indicates that the candidate is used for RTP.
pub const COMPONENT_RTP: u16 = 1;
/// Indicates that the candidate is used for RTCP.
pub const COMPONENT_RTCP: u16 = 2;

/// The type of an ICE candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateType {
    Unspecified,
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Unspecified => "Unknown candidate type",
        };
        write!(f, "{s}")
    }
}

impl Default for CandidateType {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl CandidateType {
    /// Returns the preference weight of a candidate type.
    ///
    /// RFC 5245 4.1.2.2: the RECOMMENDED values are 126 for host candidates,
    /// 110 for peer-reflexive, 100 for server-reflexive, and 0 for relayed.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay | CandidateType::Unspecified => 0,
        }
    }

    pub fn from_str_tag(raw: &str) -> Result<Self> {
        match raw {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            _ => Err(Error::ErrUnknownCandidateType),
        }
    }
}

/// Transport protocol of a candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolType {
    Udp,
    Tcp,
    Ssltcp,
}

impl Default for ProtocolType {
    fn default() -> Self {
        Self::Udp
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ProtocolType::Udp => "udp",
            ProtocolType::Tcp => "tcp",
            ProtocolType::Ssltcp => "ssltcp",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ProtocolType {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            "ssltcp" => Ok(Self::Ssltcp),
            _ => Err(Error::ErrUnknownProtocolType),
        }
    }
}

/// Computes the RFC 5245 candidate priority:
/// `(type_pref << 24) | (local_pref << 8) | (256 - component)`.
pub fn compute_priority(type_pref: u16, local_pref: u16, component: u16) -> u32 {
    (1 << 24) * u32::from(type_pref) + (1 << 8) * u32::from(local_pref)
        + (256 - u32::from(component))
}

/// Computes the foundation: an arbitrary string that is the same for two
/// candidates with the same type, base IP address and protocol. Candidate
/// pairs with the same foundations are likely to behave similarly, which the
/// freezing algorithm exploits.
pub fn compute_foundation(typ: CandidateType, base_ip: &IpAddr, proto: ProtocolType) -> String {
    let mut buf = vec![];
    buf.extend_from_slice(typ.to_string().as_bytes());
    buf.extend_from_slice(base_ip.to_string().as_bytes());
    buf.extend_from_slice(proto.to_string().as_bytes());

    let checksum = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&buf);
    format!("{checksum}")
}

/// Candidate is one potential transport address of one peer: an immutable
/// value object once published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Opaque identifier, unique per candidate. Not part of equivalence.
    pub id: String,
    pub component: u16,
    pub protocol: ProtocolType,
    pub address: SocketAddr,
    pub priority: u32,
    /// Short-term credential: the username fragment peers must present.
    pub username: String,
    pub password: String,
    pub typ: CandidateType,
    pub foundation: String,
    pub generation: u32,
    pub related_address: Option<SocketAddr>,
    /// Name of the local network interface; diagnostic only.
    pub network_name: String,
}

impl Default for Candidate {
    fn default() -> Self {
        Candidate {
            id: String::new(),
            component: 0,
            protocol: ProtocolType::default(),
            address: SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0),
            priority: 0,
            username: String::new(),
            password: String::new(),
            typ: CandidateType::default(),
            foundation: String::new(),
            generation: 0,
            related_address: None,
            network_name: String::new(),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(related) = &self.related_address {
            write!(
                f,
                "{} {} {} related {}",
                self.protocol, self.typ, self.address, related
            )
        } else {
            write!(f, "{} {} {}", self.protocol, self.typ, self.address)
        }
    }
}

impl Candidate {
    /// Equivalence for dedup purposes ignores the id and the network name.
    pub fn equivalent(&self, other: &Candidate) -> bool {
        self.protocol == other.protocol
            && self.address == other.address
            && self.typ == other.typ
            && self.component == other.component
            && self.generation == other.generation
    }

    /// Serializes into the attribute-line form:
    /// `candidate:<foundation> <component> <transport> <priority> <ip>
    /// <port> typ <type> [raddr <addr> rport <port>] generation <g>`.
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.typ
        );

        if let Some(related) = &self.related_address {
            val += format!(" raddr {} rport {}", related.ip(), related.port()).as_str();
        }

        val += format!(" generation {}", self.generation).as_str();

        val
    }
}

/// Creates a Candidate from its attribute-line representation. The eight
/// leading fields are mandatory; unrecognized trailing extensions are
/// skipped.
pub fn unmarshal_candidate(raw: &str) -> Result<Candidate> {
    let raw = raw.strip_prefix("candidate:").unwrap_or(raw);
    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::Other(format!(
            "{:?} ({})",
            Error::ErrAttributeTooShortIceCandidate,
            split.len()
        )));
    }

    // Foundation
    let foundation = split[0].to_owned();

    // Component
    let component: u16 = split[1].parse()?;

    // Protocol
    let protocol: ProtocolType = split[2].parse()?;

    // Priority
    let priority: u32 = split[3].parse()?;

    // Address
    let ip: IpAddr = split[4].parse()?;

    // Port
    let port: u16 = split[5].parse()?;

    if split[6] != "typ" {
        return Err(Error::ErrParseType);
    }
    let typ = CandidateType::from_str_tag(split[7])?;

    let mut related_address = None;
    let mut generation = 0u32;

    let mut rest = &split[8..];
    while !rest.is_empty() {
        match rest[0] {
            "raddr" => {
                if rest.len() < 4 || rest[2] != "rport" {
                    return Err(Error::Other(format!(
                        "{:?}: incorrect length",
                        Error::ErrParseRelatedAddr
                    )));
                }
                let rel_ip: IpAddr = rest[1].parse()?;
                let rel_port: u16 = rest[3].parse()?;
                related_address = Some(SocketAddr::new(rel_ip, rel_port));
                rest = &rest[4..];
            }
            "generation" => {
                if rest.len() < 2 {
                    return Err(Error::ErrAttributeTooShortIceCandidate);
                }
                generation = rest[1].parse()?;
                rest = &rest[2..];
            }
            _ => {
                // Unknown extension: skip the name/value pair.
                rest = if rest.len() >= 2 { &rest[2..] } else { &[] };
            }
        }
    }

    Ok(Candidate {
        id: String::new(),
        component,
        protocol,
        address: SocketAddr::new(ip, port),
        priority,
        username: String::new(),
        password: String::new(),
        typ,
        foundation,
        generation,
        related_address,
        network_name: String::new(),
    })
}

/// RFC 5245 5.7.2: pair priority from the controlling (G) and controlled (D)
/// candidate priorities: `2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)`.
pub fn pair_priority(controlling_priority: u32, controlled_priority: u32) -> u64 {
    let (g, d) = (controlling_priority, controlled_priority);

    // 1<<32 overflows u32; and if both g and d are u32::MAX the plain
    // formula would overflow u64.
    ((1 << 32_u64) - 1) * u64::from(std::cmp::min(g, d))
        + 2 * u64::from(std::cmp::max(g, d))
        + u64::from(g > d)
}
