//! Query and answer types exchanged with the host.
//!
//! Wire encoding belongs to the host; these types carry only what the
//! module reads from a query and what it writes back.

use std::{fmt, net::Ipv4Addr};

use crate::utils::fqdn;

/// DNS record types the module distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ptr,
    Txt,
    Aaaa,
    Any,
    Other(u16),
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            12 => RecordType::Ptr,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            255 => RecordType::Any,
            other => RecordType::Other(other),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::Ptr => 12,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Any => 255,
            RecordType::Other(other) => other,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => f.write_str("A"),
            RecordType::Ptr => f.write_str("PTR"),
            RecordType::Txt => f.write_str("TXT"),
            RecordType::Aaaa => f.write_str("AAAA"),
            RecordType::Any => f.write_str("ANY"),
            RecordType::Other(code) => write!(f, "TYPE{}", code),
        }
    }
}

/// The question of a query: name, type and class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryInfo {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

/// Class IN.
pub const CLASS_IN: u16 = 1;

impl QueryInfo {
    pub fn new(name: impl Into<String>, qtype: RecordType) -> Self {
        Self {
            name: name.into(),
            qtype,
            qclass: CLASS_IN,
        }
    }

    /// Host cache identity of this query.
    pub fn key(&self) -> QueryKey {
        QueryKey {
            name: fqdn(&self.name.to_ascii_lowercase()),
            qtype: self.qtype,
            qclass: self.qclass,
        }
    }
}

/// Identity of a cached answer.
///
/// Names are lowercased and fully qualified so that differently spelled
/// queries for the same name share an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    name: String,
    qtype: RecordType,
    qclass: u16,
}

impl QueryKey {
    pub fn new(name: &str, qtype: RecordType) -> Self {
        QueryInfo::new(name, qtype).key()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qtype(&self) -> RecordType {
        self.qtype
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.qtype)
    }
}

/// Response codes the module sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    ServFail,
    NxDomain,
}

/// Record data of an answer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Ptr(String),
}

impl RecordData {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::Ptr(_) => RecordType::Ptr,
        }
    }
}

/// One answer record.
///
/// Displays in zone-file presentation form, e.g.
/// `host1.example.com. 300 IN A 10.0.0.5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub ttl: u32,
    pub data: RecordData,
}

impl fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} IN {} ", self.name, self.ttl, self.data.record_type())?;
        match &self.data {
            RecordData::A(addr) => write!(f, "{}", addr),
            RecordData::Ptr(target) => write!(f, "{}", fqdn(target)),
        }
    }
}

/// An answer handed back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub rcode: Rcode,
    pub authoritative: bool,
    pub records: Vec<ResourceRecord>,
}

impl Answer {
    pub fn new(rcode: Rcode, authoritative: bool) -> Self {
        Self {
            rcode,
            authoritative,
            records: Vec::new(),
        }
    }
}
