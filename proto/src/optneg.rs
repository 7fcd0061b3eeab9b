//! Option negotiation: protocol version, action flags, step flags and macro
//! requests

use std::ops::{Index, IndexMut};

use bytes::{BufMut, BytesMut};
use itertools::Itertools;
use num_enum::IntoPrimitive;
use thiserror::Error;

use crate::buf::BufExt;
use crate::commands::Command;
use crate::wire::{Parsable, Writable};
use crate::{ProtocolError, Truncated};

bitflags::bitflags! {
    /// The modifications a filter may ask for ("actions" in sendmail docs)
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct Capability: u32 {
        /// Append headers
        #[doc(alias = "SMFIF_ADDHDRS")]
        const ADD_HEADERS = 0x0000_0001;
        /// Replace the message body
        #[doc(alias = "SMFIF_CHGBODY")]
        const CHANGE_BODY = 0x0000_0002;
        /// Add envelope recipients
        #[doc(alias = "SMFIF_ADDRCPT")]
        const ADD_RECIPIENT = 0x0000_0004;
        /// Remove envelope recipients
        #[doc(alias = "SMFIF_DELRCPT")]
        const DELETE_RECIPIENT = 0x0000_0008;
        /// Change or delete headers
        #[doc(alias = "SMFIF_CHGHDRS")]
        const CHANGE_HEADERS = 0x0000_0010;
        /// Quarantine the message
        #[doc(alias = "SMFIF_QUARANTINE")]
        const QUARANTINE = 0x0000_0020;
        /// Replace the envelope sender
        #[doc(alias = "SMFIF_CHGFROM")]
        const CHANGE_FROM = 0x0000_0040;
        /// Add recipients with ESMTP arguments
        #[doc(alias = "SMFIF_ADDRCPT_PAR")]
        const ADD_RECIPIENT_PAR = 0x0000_0080;
    }
}

impl Default for Capability {
    /// All capabilities on; narrowing happens during negotiation
    fn default() -> Self {
        Capability::all()
    }
}

bitflags::bitflags! {
    /// Step flags shaping which commands flow and which get replies
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct Protocol: u32 {
        /// Do not send connect info
        #[doc(alias = "SMFIP_NOCONNECT")]
        const NO_CONNECT = 0x0000_0001;
        /// Do not send HELO
        #[doc(alias = "SMFIP_NOHELO")]
        const NO_HELO = 0x0000_0002;
        /// Do not send MAIL
        #[doc(alias = "SMFIP_NOMAIL")]
        const NO_MAIL = 0x0000_0004;
        /// Do not send RCPT
        #[doc(alias = "SMFIP_NORCPT")]
        const NO_RECIPIENT = 0x0000_0008;
        /// Do not send the body
        #[doc(alias = "SMFIP_NOBODY")]
        const NO_BODY = 0x0000_0010;
        /// Do not send headers
        #[doc(alias = "SMFIP_NOHDRS")]
        const NO_HEADER = 0x0000_0020;
        /// Do not send end-of-header
        #[doc(alias = "SMFIP_NOEOH")]
        const NO_END_OF_HEADER = 0x0000_0040;
        /// No reply wanted for headers
        #[doc(alias = "SMFIP_NR_HDR")]
        const NR_HEADER = 0x0000_0080;
        /// Do not send unknown commands
        #[doc(alias = "SMFIP_NOUNKNOWN")]
        const NO_UNKNOWN = 0x0000_0100;
        /// Do not send DATA
        #[doc(alias = "SMFIP_NODATA")]
        const NO_DATA = 0x0000_0200;
        /// The peer understands SKIP replies
        #[doc(alias = "SMFIP_SKIP")]
        const SKIP = 0x0000_0400;
        /// Send rejected recipients too
        #[doc(alias = "SMFIP_RCPT_REJ")]
        const RCPT_REJ = 0x0000_0800;
        /// No reply wanted for connect
        #[doc(alias = "SMFIP_NR_CONN")]
        const NR_CONNECT = 0x0000_1000;
        /// No reply wanted for HELO
        #[doc(alias = "SMFIP_NR_HELO")]
        const NR_HELO = 0x0000_2000;
        /// No reply wanted for MAIL
        #[doc(alias = "SMFIP_NR_MAIL")]
        const NR_MAIL = 0x0000_4000;
        /// No reply wanted for RCPT
        #[doc(alias = "SMFIP_NR_RCPT")]
        const NR_RECIPIENT = 0x0000_8000;
        /// No reply wanted for DATA
        #[doc(alias = "SMFIP_NR_DATA")]
        const NR_DATA = 0x0001_0000;
        /// No reply wanted for unknown commands
        #[doc(alias = "SMFIP_NR_UNKN")]
        const NR_UNKNOWN = 0x0002_0000;
        /// No reply wanted for end-of-header
        #[doc(alias = "SMFIP_NR_EOH")]
        const NR_END_OF_HEADER = 0x0004_0000;
        /// No reply wanted for body chunks
        #[doc(alias = "SMFIP_NR_BODY")]
        const NR_BODY = 0x0008_0000;
        /// Keep the leading space of header values
        #[doc(alias = "SMFIP_HDR_LEADSPC")]
        const HEADER_LEADING_SPACE = 0x0010_0000;
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::empty()
    }
}

impl Protocol {
    /// Whether these flags say `command` should not be sent at all
    #[must_use]
    pub fn suppresses_send(&self, command: &Command) -> bool {
        match command {
            Command::Connect(_) => self.contains(Protocol::NO_CONNECT),
            Command::Helo(_) => self.contains(Protocol::NO_HELO),
            Command::Mail(_) => self.contains(Protocol::NO_MAIL),
            Command::Recipient(_) => self.contains(Protocol::NO_RECIPIENT),
            Command::Data(_) => self.contains(Protocol::NO_DATA),
            Command::Header(_) => self.contains(Protocol::NO_HEADER),
            Command::EndOfHeader(_) => self.contains(Protocol::NO_END_OF_HEADER),
            Command::Body(_) => self.contains(Protocol::NO_BODY),
            Command::Unknown(_) => self.contains(Protocol::NO_UNKNOWN),
            Command::EndOfMessage(_) | Command::Macro(_) => false,
        }
    }

    /// Whether these flags say `command` gets no reply
    #[must_use]
    pub fn suppresses_reply(&self, command: &Command) -> bool {
        match command {
            Command::Connect(_) => self.contains(Protocol::NR_CONNECT),
            Command::Helo(_) => self.contains(Protocol::NR_HELO),
            Command::Mail(_) => self.contains(Protocol::NR_MAIL),
            Command::Recipient(_) => self.contains(Protocol::NR_RECIPIENT),
            Command::Data(_) => self.contains(Protocol::NR_DATA),
            Command::Header(_) => self.contains(Protocol::NR_HEADER),
            Command::EndOfHeader(_) => self.contains(Protocol::NR_END_OF_HEADER),
            Command::Body(_) => self.contains(Protocol::NR_BODY),
            Command::Unknown(_) => self.contains(Protocol::NR_UNKNOWN),
            Command::EndOfMessage(_) => false,
            // Macros never get a reply
            Command::Macro(_) => true,
        }
    }
}

/// The peer wants a protocol version we cannot provide
#[derive(Debug, Error)]
#[error("peer speaks milter version {peer}, we support up to {supported}")]
pub struct VersionMismatch {
    /// The version the peer announced
    pub peer: u32,
    /// The newest version this implementation speaks
    pub supported: u32,
}

/// `SMFIC_OPTNEG`: the first frame in both directions
#[derive(Clone, PartialEq, Debug)]
pub struct OptNeg {
    /// The milter protocol version
    pub version: u32,
    /// Action flags: what the filter may modify
    pub capabilities: Capability,
    /// Step flags: which stages flow and which reply
    pub protocol: Protocol,
    /// Macros the filter asks the MTA to provide
    pub macro_stages: MacroStages,
}

impl Default for OptNeg {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            capabilities: Capability::default(),
            protocol: Protocol::default(),
            macro_stages: MacroStages::default(),
        }
    }
}

impl OptNeg {
    /// The protocol version this implementation speaks.
    ///
    /// Postfix 2.6+ and sendmail 8.14+ talk version 6; older peers announce
    /// lower versions and are accepted down to version 2.
    pub const VERSION: u32 = 6;

    const FIXED_SIZE: usize = 4 + 4 + 4;
    const CODE: u8 = b'O';

    /// Narrow `self` to what `other` can handle (MTA-to-filter merge).
    ///
    /// Flags only survive if both sides set them.
    ///
    /// # Errors
    /// [`VersionMismatch`] if the peer speaks a newer version than we do.
    pub fn merge_compatible(mut self, other: &Self) -> Result<Self, VersionMismatch> {
        if self.version < other.version {
            return Err(VersionMismatch {
                peer: other.version,
                supported: self.version,
            });
        }

        self.protocol = self.protocol.intersection(other.protocol);
        self.capabilities = self.capabilities.intersection(other.capabilities);

        Ok(self)
    }

    /// Fold another filter's negotiation result into `self`
    /// (filter-to-filter merge, used when fronting several filters at once).
    ///
    /// Action flags union: a modification stays available if any filter may
    /// want it. Step flags intersect: a stage is only omitted if every
    /// filter agreed to omit it. Macro requests union per stage.
    #[must_use]
    pub fn merge_filters(mut self, other: &Self) -> Self {
        self.version = self.version.min(other.version);
        self.capabilities = self.capabilities.union(other.capabilities);
        self.protocol = self.protocol.intersection(other.protocol);
        self.macro_stages.merge(&other.macro_stages);
        self
    }
}

impl Parsable for OptNeg {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(version) = buffer.take_u32() else {
            return Err(Truncated::new("optneg version", 4, buffer.len()).into());
        };
        let Some(capabilities) = buffer.take_u32() else {
            return Err(Truncated::new("optneg action flags", 4, buffer.len()).into());
        };
        let Some(protocol) = buffer.take_u32() else {
            return Err(Truncated::new("optneg step flags", 4, buffer.len()).into());
        };

        Ok(Self {
            version,
            capabilities: Capability::from_bits_retain(capabilities),
            protocol: Protocol::from_bits_retain(protocol),
            macro_stages: MacroStages::parse(buffer)?,
        })
    }
}

impl Writable for OptNeg {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.put_u32(self.version);
        buffer.put_u32(self.capabilities.bits());
        buffer.put_u32(self.protocol.bits());
        self.macro_stages.write(buffer);
    }

    fn len(&self) -> usize {
        Self::FIXED_SIZE + self.macro_stages.len()
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        false
    }
}

const MACRO_STAGE_MAX_ID: usize = 9;

/// The protocol stages a filter may request macros for
#[derive(Debug, Copy, Clone, IntoPrimitive, PartialEq, Eq)]
#[repr(u32)]
pub enum MacroStage {
    /// `SMFIM_CONNECT`
    Connect = 0,
    /// `SMFIM_HELO`
    Helo = 1,
    /// `SMFIM_ENVFROM`
    MailFrom = 2,
    /// `SMFIM_ENVRCPT`
    RcptTo = 3,
    /// `SMFIM_DATA`
    Data = 4,
    /// `SMFIM_EOM`
    EndOfMessage = 5,
    /// `SMFIM_EOH`
    EndOfHeader = 6,
    /// Per-header macros
    Header = 7,
    /// Per-body-chunk macros
    Body = 8,
    /// Anything with a stage id past the known range
    Unknown = MACRO_STAGE_MAX_ID as u32,
}

impl From<u32> for MacroStage {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Connect,
            1 => Self::Helo,
            2 => Self::MailFrom,
            3 => Self::RcptTo,
            4 => Self::Data,
            5 => Self::EndOfMessage,
            6 => Self::EndOfHeader,
            7 => Self::Header,
            8 => Self::Body,
            _ => Self::Unknown,
        }
    }
}

impl MacroStage {
    const ID_SIZE: usize = 4;

    fn as_usize(self) -> usize {
        u32::from(self) as usize
    }
}

/// Requested macro symbols, grouped by [`MacroStage`].
///
/// On the wire each non-empty stage contributes
/// `uint32 stage id | space separated symbols | NUL`.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct MacroStages {
    stages: [Vec<String>; MACRO_STAGE_MAX_ID],
}

impl Index<MacroStage> for MacroStages {
    type Output = Vec<String>;

    fn index(&self, stage: MacroStage) -> &Self::Output {
        &self.stages[stage.as_usize()]
    }
}

impl IndexMut<MacroStage> for MacroStages {
    fn index_mut(&mut self, stage: MacroStage) -> &mut Self::Output {
        &mut self.stages[stage.as_usize()]
    }
}

impl MacroStages {
    /// Request `symbols` for `stage`
    pub fn request<S: ToString>(&mut self, stage: MacroStage, symbols: &[S]) {
        let requested = &mut self[stage];
        for symbol in symbols {
            requested.push(symbol.to_string());
        }
    }

    /// Union `other`'s requests into `self`, skipping duplicates
    pub fn merge(&mut self, other: &Self) {
        for (ours, theirs) in self.stages.iter_mut().zip(&other.stages) {
            for symbol in theirs {
                if !ours.contains(symbol) {
                    ours.push(symbol.clone());
                }
            }
        }
    }

    /// Whether no stage requests any macro
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(Vec::is_empty)
    }

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let mut stages = Self::default();

        while !buffer.is_empty() {
            let Some(stage_id) = buffer.take_u32() else {
                return Err(Truncated::new("macro stage id", 4, buffer.len()).into());
            };
            let Some(symbols) = buffer.take_until(0) else {
                return Err(Truncated::new("macro symbol list", 1, buffer.len()).into());
            };

            let stage = MacroStage::from(stage_id);
            if stage == MacroStage::Unknown {
                // An id we do not know; drop the group, keep the rest
                continue;
            }

            let symbols = String::from_utf8_lossy(&symbols);
            stages.request(stage, &symbols.split(' ').filter(|s| !s.is_empty()).collect_vec());
        }

        Ok(stages)
    }

    fn write(&self, buffer: &mut BytesMut) {
        for (index, symbols) in self.stages.iter().enumerate() {
            // Empty stages are not sent; the MTA would ignore them anyway
            if symbols.is_empty() {
                continue;
            }

            buffer.put_u32(index as u32);
            buffer.extend_from_slice(symbols.iter().join(" ").as_bytes());
            buffer.put_u8(0);
        }
    }

    fn len(&self) -> usize {
        let mut total = 0;
        for symbols in &self.stages {
            if symbols.is_empty() {
                continue;
            }

            // id + symbols + a separator per symbol, the last one standing
            // in for the trailing nul
            total += MacroStage::ID_SIZE;
            total += symbols.iter().map(|s| s.len() + 1).sum::<usize>();
        }
        total
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn raw_optneg(version: u32, capabilities: u32, protocol: u32) -> BytesMut {
        let mut buffer = BytesMut::new();
        buffer.put_u32(version);
        buffer.put_u32(capabilities);
        buffer.put_u32(protocol);
        buffer
    }

    #[test]
    fn parse_bare_optneg() {
        let parsed = OptNeg::parse(raw_optneg(6, 0x7f, 0)).expect("bare optneg parses");

        assert_eq!(parsed.version, 6);
        assert_eq!(parsed.capabilities.bits(), 0x7f);
        assert!(parsed.macro_stages.is_empty());
    }

    #[test]
    fn parse_optneg_with_macro_requests() {
        let mut buffer = raw_optneg(6, 0xff, 0);
        buffer.put_u32(0);
        buffer.extend_from_slice(b"j {daemon_name}\0");
        buffer.put_u32(3);
        buffer.extend_from_slice(b"{rcpt_addr}\0");

        let parsed = OptNeg::parse(buffer).expect("optneg with macros parses");

        assert_eq!(
            parsed.macro_stages[MacroStage::Connect],
            vec!["j".to_string(), "{daemon_name}".to_string()]
        );
        assert_eq!(
            parsed.macro_stages[MacroStage::RcptTo],
            vec!["{rcpt_addr}".to_string()]
        );
    }

    #[test]
    fn parse_optneg_too_short() {
        let err = OptNeg::parse(raw_optneg(6, 0, 0).split_to(8)).expect_err("8 bytes are too few");
        assert_matches!(err, ProtocolError::Truncated(_));
    }

    #[test]
    fn write_matches_len() {
        let mut optneg = OptNeg::default();
        optneg
            .macro_stages
            .request(MacroStage::Helo, &["{tls_version}"]);

        let mut buffer = BytesMut::new();
        optneg.write(&mut buffer);

        assert_eq!(optneg.len(), buffer.len());
        assert_eq!(optneg.code(), b'O');
    }

    #[test]
    fn optneg_roundtrip() {
        let mut original = OptNeg::default();
        original.macro_stages.request(MacroStage::Connect, &["j"]);

        let mut buffer = BytesMut::new();
        original.write(&mut buffer);

        let parsed = OptNeg::parse(buffer).expect("own bytes parse");
        assert_eq!(parsed, original);
    }

    #[test]
    fn filter_merge_unions_actions_intersects_steps() {
        let a = OptNeg {
            capabilities: Capability::ADD_HEADERS,
            protocol: Protocol::NO_HELO | Protocol::NO_BODY,
            ..OptNeg::default()
        };
        let b = OptNeg {
            capabilities: Capability::CHANGE_BODY,
            protocol: Protocol::NO_HELO | Protocol::NO_UNKNOWN,
            ..OptNeg::default()
        };

        let merged = a.merge_filters(&b);

        assert_eq!(
            merged.capabilities,
            Capability::ADD_HEADERS | Capability::CHANGE_BODY
        );
        assert_eq!(merged.protocol, Protocol::NO_HELO);
    }

    #[test]
    fn compatible_merge_rejects_newer_peer() {
        let ours = OptNeg::default();
        let theirs = OptNeg {
            version: OptNeg::VERSION + 1,
            ..OptNeg::default()
        };

        ours.merge_compatible(&theirs)
            .expect_err("newer peer version must not pass");
    }

    #[test]
    fn macro_stage_merge_deduplicates() {
        let mut ours = MacroStages::default();
        ours.request(MacroStage::Connect, &["j"]);

        let mut theirs = MacroStages::default();
        theirs.request(MacroStage::Connect, &["j", "{client_addr}"]);

        ours.merge(&theirs);

        assert_eq!(
            ours[MacroStage::Connect],
            vec!["j".to_string(), "{client_addr}".to_string()]
        );
    }
}
