//! Agent configuration data model (spec.md §3, §6).
//!
//! The configuration *grammar* and its defaulting rules are a collaborator
//! out of scope for this crate (spec.md §1); what lives here is the data
//! model the collaborator hands the supervisor, plus the wire codec for the
//! persistent configuration stream (spec.md §6) that carries it between the
//! `readconfig` subcommand and the supervisor.

use std::convert::TryFrom;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, ServiceTag};

/// `block_max_milliseconds` is capped at 12 hours (spec.md §3).
pub const BLOCK_MAX_MILLISECONDS_LIMIT: i64 = 43_200_000;
/// `block_max_transactions` is capped at 100,000 (spec.md §3).
pub const BLOCK_MAX_TRANSACTIONS_LIMIT: i64 = 100_000;

/// CRUD bit flags on a materialized-view field spec (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrudFlags(pub u8);

impl CrudFlags {
    pub const CREATE: u8 = 0b0001;
    pub const UPDATE: u8 = 0b0010;
    pub const APPEND: u8 = 0b0100;
    pub const DELETE: u8 = 0b1000;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub flags: CrudFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSpec {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,
    pub transactions: Vec<TransactionSpec>,
}

/// A materialized view as parsed from config. SPEC_FULL.md's Open Question
/// resolution marks this a pass-through configuration artifact: it is
/// retained verbatim but not otherwise consumed by the CORE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedView {
    pub name: String,
    pub artifacts: Vec<ArtifactSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenAddress {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Agent configuration (spec.md §3, "Agent configuration"). Built once per
/// process start and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub log_dir: String,
    pub log_level: u8,
    pub block_max_milliseconds: i64,
    pub block_max_transactions: i64,
    pub secret_path: String,
    pub root_block_path: String,
    pub datastore_path: String,
    pub listen_addresses: Vec<ListenAddress>,
    pub chroot_dir: String,
    pub user: String,
    pub group: String,
    #[serde(default)]
    pub materialized_views: Vec<MaterializedView>,
}

impl AgentConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.log_level > 9 {
            return Err(CoreError::status(ServiceTag::Config, 0x0001));
        }
        if self.block_max_milliseconds <= 0 || self.block_max_milliseconds > BLOCK_MAX_MILLISECONDS_LIMIT {
            return Err(CoreError::status(ServiceTag::Config, 0x0002));
        }
        if self.block_max_transactions <= 0
            || self.block_max_transactions > BLOCK_MAX_TRANSACTIONS_LIMIT
        {
            return Err(CoreError::status(ServiceTag::Config, 0x0003));
        }
        if self.listen_addresses.is_empty() {
            return Err(CoreError::status(ServiceTag::Config, 0x0004));
        }
        Ok(())
    }

    /// Pass-through accessor noted in SPEC_FULL.md; the CORE itself does
    /// not interpret these entries.
    pub fn materialized_views(&self) -> &[MaterializedView] {
        &self.materialized_views
    }
}

/// Record type tags for the persistent configuration stream (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamRecordType {
    Bom = 0x00,
    LogDir = 0x01,
    LogLevel = 0x02,
    Secret = 0x03,
    RootBlock = 0x04,
    Datastore = 0x05,
    ListenAddr = 0x06,
    Chroot = 0x07,
    UserGroup = 0x08,
    BlockMaxMilliseconds = 0x09,
    BlockMaxTransactions = 0x0A,
    Eom = 0x80,
    Error = 0xFF,
}

impl TryFrom<u8> for StreamRecordType {
    type Error = CoreError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0x00 => Self::Bom,
            0x01 => Self::LogDir,
            0x02 => Self::LogLevel,
            0x03 => Self::Secret,
            0x04 => Self::RootBlock,
            0x05 => Self::Datastore,
            0x06 => Self::ListenAddr,
            0x07 => Self::Chroot,
            0x08 => Self::UserGroup,
            0x09 => Self::BlockMaxMilliseconds,
            0x0A => Self::BlockMaxTransactions,
            0x80 => Self::Eom,
            0xFF => Self::Error,
            _ => return Err(CoreError::status(ServiceTag::Config, 0x00FF)),
        })
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.write_u32::<BigEndian>(s.len() as u32).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn read_string(buf: &[u8], pos: &mut usize) -> CoreResult<String> {
    let mut cursor = &buf[*pos..];
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| CoreError::status(ServiceTag::Config, 0x00FE))? as usize;
    *pos += 4;
    if buf.len() < *pos + len {
        return Err(CoreError::status(ServiceTag::Config, 0x00FE));
    }
    let s = String::from_utf8(buf[*pos..*pos + len].to_vec())
        .map_err(|_| CoreError::status(ServiceTag::Config, 0x00FE))?;
    *pos += len;
    Ok(s)
}

/// Encode an [`AgentConfig`] as the bracketed `BOM .. EOM` record stream
/// described in spec.md §6.
pub fn encode_stream(config: &AgentConfig) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(StreamRecordType::Bom as u8);

    out.push(StreamRecordType::LogDir as u8);
    write_string(&mut out, &config.log_dir);

    out.push(StreamRecordType::LogLevel as u8);
    out.write_i64::<BigEndian>(i64::from(config.log_level)).unwrap();

    out.push(StreamRecordType::Secret as u8);
    write_string(&mut out, &config.secret_path);

    out.push(StreamRecordType::RootBlock as u8);
    write_string(&mut out, &config.root_block_path);

    out.push(StreamRecordType::Datastore as u8);
    write_string(&mut out, &config.datastore_path);

    for listen in &config.listen_addresses {
        out.push(StreamRecordType::ListenAddr as u8);
        write_string(&mut out, &listen.addr.to_string());
        out.write_u64::<BigEndian>(u64::from(listen.port)).unwrap();
    }

    out.push(StreamRecordType::Chroot as u8);
    write_string(&mut out, &config.chroot_dir);

    out.push(StreamRecordType::UserGroup as u8);
    write_string(&mut out, &config.user);
    write_string(&mut out, &config.group);

    out.push(StreamRecordType::BlockMaxMilliseconds as u8);
    out.write_i64::<BigEndian>(config.block_max_milliseconds).unwrap();

    out.push(StreamRecordType::BlockMaxTransactions as u8);
    out.write_i64::<BigEndian>(config.block_max_transactions).unwrap();

    out.push(StreamRecordType::Eom as u8);
    out
}

/// Decode a record stream produced by [`encode_stream`] back into an
/// [`AgentConfig`]. Fields not yet seen when `EOM` arrives are left at
/// their defaults as provided by `defaults`.
pub fn decode_stream(buf: &[u8], mut config: AgentConfig) -> CoreResult<AgentConfig> {
    let mut pos = 0usize;
    if buf.is_empty() || buf[0] != StreamRecordType::Bom as u8 {
        return Err(CoreError::status(ServiceTag::Config, 0x00FD));
    }
    pos += 1;

    loop {
        if pos >= buf.len() {
            return Err(CoreError::status(ServiceTag::Config, 0x00FD));
        }
        let tag = StreamRecordType::try_from(buf[pos])?;
        pos += 1;
        match tag {
            StreamRecordType::Eom => break,
            StreamRecordType::Error => return Err(CoreError::status(ServiceTag::Config, 0x00FC)),
            StreamRecordType::LogDir => config.log_dir = read_string(buf, &mut pos)?,
            StreamRecordType::Secret => config.secret_path = read_string(buf, &mut pos)?,
            StreamRecordType::RootBlock => config.root_block_path = read_string(buf, &mut pos)?,
            StreamRecordType::Datastore => config.datastore_path = read_string(buf, &mut pos)?,
            StreamRecordType::Chroot => config.chroot_dir = read_string(buf, &mut pos)?,
            StreamRecordType::UserGroup => {
                config.user = read_string(buf, &mut pos)?;
                config.group = read_string(buf, &mut pos)?;
            }
            StreamRecordType::ListenAddr => {
                let addr_str = read_string(buf, &mut pos)?;
                let mut cursor = &buf[pos..];
                let port = cursor
                    .read_u64::<BigEndian>()
                    .map_err(|_| CoreError::status(ServiceTag::Config, 0x00FE))?;
                pos += 8;
                let addr: Ipv4Addr = addr_str
                    .parse()
                    .map_err(|_| CoreError::status(ServiceTag::Config, 0x00FE))?;
                config.listen_addresses.push(ListenAddress {
                    addr,
                    port: port as u16,
                });
            }
            StreamRecordType::LogLevel => {
                let mut cursor = &buf[pos..];
                let v = cursor
                    .read_i64::<BigEndian>()
                    .map_err(|_| CoreError::status(ServiceTag::Config, 0x00FE))?;
                pos += 8;
                config.log_level = u8::try_from(v).map_err(|_| CoreError::status(ServiceTag::Config, 0x0001))?;
            }
            StreamRecordType::BlockMaxMilliseconds => {
                let mut cursor = &buf[pos..];
                config.block_max_milliseconds = cursor
                    .read_i64::<BigEndian>()
                    .map_err(|_| CoreError::status(ServiceTag::Config, 0x00FE))?;
                pos += 8;
            }
            StreamRecordType::BlockMaxTransactions => {
                let mut cursor = &buf[pos..];
                config.block_max_transactions = cursor
                    .read_i64::<BigEndian>()
                    .map_err(|_| CoreError::status(ServiceTag::Config, 0x00FE))?;
                pos += 8;
            }
            StreamRecordType::Bom => return Err(CoreError::status(ServiceTag::Config, 0x00FD)),
        }
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentConfig {
        AgentConfig {
            log_dir: "/var/log/agentd".into(),
            log_level: 3,
            block_max_milliseconds: 10_000,
            block_max_transactions: 500,
            secret_path: "/etc/agentd/secret".into(),
            root_block_path: "/etc/agentd/root.block".into(),
            datastore_path: "/var/lib/agentd".into(),
            listen_addresses: vec![ListenAddress {
                addr: Ipv4Addr::new(127, 0, 0, 1),
                port: 4931,
            }],
            chroot_dir: "/var/lib/agentd/chroot".into(),
            user: "agentd".into(),
            group: "agentd".into(),
            materialized_views: vec![],
        }
    }

    fn empty_like(config: &AgentConfig) -> AgentConfig {
        AgentConfig {
            log_dir: String::new(),
            log_level: 0,
            block_max_milliseconds: 0,
            block_max_transactions: 0,
            secret_path: String::new(),
            root_block_path: String::new(),
            datastore_path: String::new(),
            listen_addresses: vec![],
            chroot_dir: String::new(),
            user: String::new(),
            group: String::new(),
            materialized_views: config.materialized_views.clone(),
        }
    }

    #[test]
    fn stream_round_trips() {
        let config = sample();
        let bytes = encode_stream(&config);
        let decoded = decode_stream(&bytes, empty_like(&config)).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn validate_rejects_block_period_over_limit() {
        let mut config = sample();
        config.block_max_milliseconds = BLOCK_MAX_MILLISECONDS_LIMIT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_transaction_cap_over_limit() {
        let mut config = sample();
        config.block_max_transactions = BLOCK_MAX_TRANSACTIONS_LIMIT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn stream_missing_bom_is_rejected() {
        let err = decode_stream(&[0x01, 0x00], sample());
        assert!(err.is_err());
    }
}
