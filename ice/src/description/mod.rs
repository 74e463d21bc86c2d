#[cfg(test)]
mod description_test;

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::candidate::*;
use crate::control::IceMode;
use crate::error::*;

/// Namespace of the legacy Google P2P transport.
pub const NS_GINGLE_P2P: &str = "http://www.google.com/transport/p2p";
/// Namespace of the standards-track ICE-UDP transport.
pub const NS_JINGLE_ICE_UDP: &str = "urn:xmpp:jingle:transports:ice-udp:1";

// RFC 5245 section 15.4.
pub const ICE_UFRAG_MIN_LENGTH: usize = 4;
pub const ICE_PWD_MIN_LENGTH: usize = 22;

/// The per-media-section triple the higher layer exchanges: a namespace
/// that selects the dialect, and the short-term credentials.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDescription {
    pub transport_type: String,
    pub ice_ufrag: String,
    pub ice_pwd: String,
}

impl TransportDescription {
    pub fn new(mode: IceMode, ice_ufrag: String, ice_pwd: String) -> Self {
        let transport_type = match mode {
            IceMode::Google => NS_GINGLE_P2P,
            IceMode::Rfc5245 => NS_JINGLE_ICE_UDP,
        };
        TransportDescription {
            transport_type: transport_type.to_owned(),
            ice_ufrag,
            ice_pwd,
        }
    }

    /// The dialect this description selects.
    pub fn mode(&self) -> Result<IceMode> {
        match self.transport_type.as_str() {
            NS_GINGLE_P2P => Ok(IceMode::Google),
            NS_JINGLE_ICE_UDP => Ok(IceMode::Rfc5245),
            _ => Err(Error::ErrUnknownTransportType),
        }
    }

    /// Credential length rules apply in standards-track mode.
    pub fn validate(&self) -> Result<()> {
        if self.mode()? == IceMode::Rfc5245 {
            if self.ice_ufrag.len() < ICE_UFRAG_MIN_LENGTH {
                return Err(Error::ErrUfragTooShort);
            }
            if self.ice_pwd.len() < ICE_PWD_MIN_LENGTH {
                return Err(Error::ErrPwdTooShort);
            }
        }
        Ok(())
    }
}

/// The structured candidate form used by legacy signalling: every candidate
/// field as a named attribute on a `candidate` element, with the namespace
/// selecting the semantics. Serialized as JSON here; the enclosing
/// signalling layer owns the envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateDescription {
    /// Which channel of the transport this candidate belongs to.
    pub name: String,
    pub xmlns: String,
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default)]
    pub generation: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_port: Option<u16>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
}

impl CandidateDescription {
    pub fn from_candidate(name: &str, mode: IceMode, c: &Candidate) -> Self {
        let xmlns = match mode {
            IceMode::Google => NS_GINGLE_P2P,
            IceMode::Rfc5245 => NS_JINGLE_ICE_UDP,
        };
        CandidateDescription {
            name: name.to_owned(),
            xmlns: xmlns.to_owned(),
            foundation: c.foundation.clone(),
            component: c.component,
            protocol: c.protocol.to_string(),
            priority: c.priority,
            address: c.address.ip().to_string(),
            port: c.address.port(),
            typ: c.typ.to_string(),
            username: c.username.clone(),
            password: c.password.clone(),
            generation: c.generation,
            rel_addr: c.related_address.map(|a| a.ip().to_string()),
            rel_port: c.related_address.map(|a| a.port()),
            network: c.network_name.clone(),
        }
    }

    pub fn to_candidate(&self) -> Result<Candidate> {
        let ip: IpAddr = self.address.parse()?;
        let related_address = match (&self.rel_addr, self.rel_port) {
            (Some(addr), Some(port)) => {
                let rel_ip: IpAddr = addr.parse()?;
                Some(SocketAddr::new(rel_ip, port))
            }
            _ => None,
        };

        Ok(Candidate {
            id: String::new(),
            component: self.component,
            protocol: self.protocol.parse()?,
            address: SocketAddr::new(ip, self.port),
            priority: self.priority,
            username: self.username.clone(),
            password: self.password.clone(),
            typ: CandidateType::from_str_tag(&self.typ)?,
            foundation: self.foundation.clone(),
            generation: self.generation,
            related_address,
            network_name: self.network.clone(),
        })
    }

    pub fn marshal(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn unmarshal(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
