//! PDO configuration: mapping entries and the TPDO/RPDO communication
//! parameters that describe them.

use snafu::Snafu;

use super::bits;
use crate::frame::CobId;

/// Maximum total mapped bits across one PDO's mapping list.
pub const MAX_MAPPING_BITS: u16 = 64;

/// One entry in a PDO's mapping list: object dictionary address plus the
/// number of bits it occupies in the PDO payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PdoMapping {
    /// Object dictionary index.
    pub index: u16,
    /// Object dictionary sub-index.
    pub sub: u8,
    /// Bit length, 1-64.
    pub bit_length: u8,
}

impl PdoMapping {
    /// Build a mapping entry, validating the bit length is in `[1, 64]`.
    pub fn new(index: u16, sub: u8, bit_length: u8) -> Result<Self, PdoConfigError> {
        if bit_length == 0 || bit_length as u16 > MAX_MAPPING_BITS {
            return Err(PdoConfigError::InvalidBitLength { bit_length });
        }
        Ok(Self {
            index,
            sub,
            bit_length,
        })
    }

    /// Decode the packed 32-bit mapping value written to an object
    /// dictionary mapping sub-object: `(index << 16) | (sub << 8) | bit_length`.
    pub fn from_u32(raw: u32) -> Self {
        Self {
            index: (raw >> 16) as u16,
            sub: (raw >> 8) as u8,
            bit_length: raw as u8,
        }
    }

    /// Encode to the packed 32-bit mapping value.
    pub fn to_u32(self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8) | self.bit_length as u32
    }
}

/// Which of the four standard TPDO/RPDO slots a configuration occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PdoNumber {
    /// PDO 1.
    First = 1,
    /// PDO 2.
    Second = 2,
    /// PDO 3.
    Third = 3,
    /// PDO 4.
    Fourth = 4,
}

impl PdoNumber {
    /// Base COB-ID for this TPDO slot (add the node id).
    pub fn tpdo_base(self) -> u16 {
        match self {
            PdoNumber::First => 0x180,
            PdoNumber::Second => 0x280,
            PdoNumber::Third => 0x380,
            PdoNumber::Fourth => 0x480,
        }
    }

    /// Base COB-ID for this RPDO slot (add the node id).
    pub fn rpdo_base(self) -> u16 {
        match self {
            PdoNumber::First => 0x200,
            PdoNumber::Second => 0x300,
            PdoNumber::Third => 0x400,
            PdoNumber::Fourth => 0x500,
        }
    }

    /// The standard TPDO COB-ID for this slot and node id.
    pub fn tpdo_cob_id(self, node_id: u8) -> CobId {
        CobId::new(self.tpdo_base() + node_id as u16)
    }

    /// The standard RPDO COB-ID for this slot and node id.
    pub fn rpdo_cob_id(self, node_id: u8) -> CobId {
        CobId::new(self.rpdo_base() + node_id as u16)
    }
}

/// A validated PDO configuration: COB-ID, transmission type, and its
/// mapping list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PdoConfig {
    /// Which of the 4 standard slots this is.
    pub pdo_number: PdoNumber,
    /// The COB-ID frames are sent/received on.
    pub cob_id: CobId,
    /// DS-301 transmission type byte (0 = acyclic/sync, 1-240 = cyclic sync
    /// count, 254/255 = event-driven).
    pub transmission_type: u8,
    /// Minimum time between transmissions, in 100us units (TPDO only; 0 disables).
    pub inhibit_time: u16,
    /// Event timer period in ms (TPDO only; 0 disables).
    pub event_timer: u16,
    mappings: Vec<PdoMapping>,
}

/// Errors validating or mutating a [`PdoConfig`].
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum PdoConfigError {
    /// A mapping's bit length was zero or exceeded 64.
    #[snafu(display("invalid PDO mapping bit length: {bit_length}"))]
    InvalidBitLength {
        /// The rejected length.
        bit_length: u8,
    },
    /// Adding this mapping would push the cumulative bit total past 64.
    #[snafu(display("adding mapping would exceed 64 mapped bits: {total} + {added} > 64"))]
    MappingOverflow {
        /// Bits already mapped.
        total: u16,
        /// Bits the new mapping would add.
        added: u8,
    },
    /// A COB-ID value outside the 11-bit range was used.
    #[snafu(display("cob id {cob_id:#x} exceeds the 11-bit range"))]
    CobIdOutOfRange {
        /// The rejected raw value.
        cob_id: u32,
    },
}

impl PdoConfig {
    /// Build an empty configuration for the given slot and node.
    pub fn new(pdo_number: PdoNumber, cob_id: CobId, transmission_type: u8) -> Self {
        Self {
            pdo_number,
            cob_id,
            transmission_type,
            inhibit_time: 0,
            event_timer: 0,
            mappings: Vec::new(),
        }
    }

    /// Currently mapped entries, in mapping order.
    pub fn mappings(&self) -> &[PdoMapping] {
        &self.mappings
    }

    /// Total bits currently mapped.
    pub fn total_bits(&self) -> u16 {
        self.mappings.iter().map(|m| m.bit_length as u16).sum()
    }

    /// Append a mapping entry, rejecting it if the cumulative bit total
    /// would exceed 64.
    pub fn add_mapping(&mut self, mapping: PdoMapping) -> Result<(), PdoConfigError> {
        let total = self.total_bits();
        if total + mapping.bit_length as u16 > MAX_MAPPING_BITS {
            return Err(PdoConfigError::MappingOverflow {
                total,
                added: mapping.bit_length,
            });
        }
        self.mappings.push(mapping);
        Ok(())
    }

    /// Remove all mappings.
    pub fn clear_mappings(&mut self) {
        self.mappings.clear();
    }

    /// Bit offset of the `n`th mapping, computed from the cumulative bit
    /// length of the mappings before it (never from its sub-index — see
    /// the design notes on why sub-index-derived offsets are unreliable).
    pub fn bit_offset_of(&self, mapping_index: usize) -> Option<u16> {
        if mapping_index >= self.mappings.len() {
            return None;
        }
        Some(
            self.mappings[..mapping_index]
                .iter()
                .map(|m| m.bit_length as u16)
                .sum(),
        )
    }

    /// Extract the raw value of the `mapping_index`th mapping from a
    /// received payload, deriving its bit offset from the cumulative
    /// bit-length of the preceding mappings rather than from its sub-index.
    /// `None` if `mapping_index` is out of range.
    pub fn extract_mapping(&self, payload: &[u8], mapping_index: usize) -> Option<u64> {
        let offset = self.bit_offset_of(mapping_index)?;
        let mapping = self.mappings[mapping_index];
        Some(bits::extract_u64(payload, offset, mapping.bit_length))
    }

    /// True if at least one mapping is configured and the total bit budget
    /// is respected. Returns the list of human-readable problems found;
    /// empty means valid. This is a precondition check, not an enforcement
    /// mechanism — callers may still hold an invalid config in memory.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.cob_id.raw() > 0x7FF {
            issues.push(format!("cob id {:#x} exceeds 11 bits", self.cob_id.raw()));
        }
        if self.mappings.is_empty() {
            issues.push("no mappings configured".to_string());
        }
        let total = self.total_bits();
        if total > MAX_MAPPING_BITS {
            issues.push(format!("total mapped bits {total} exceeds 64"));
        }
        for m in &self.mappings {
            if m.bit_length == 0 {
                issues.push(format!("mapping 0x{:x}sub{} has zero bit length", m.index, m.sub));
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_value_packs_index_sub_length() {
        let m = PdoMapping::new(0x6041, 0, 16).unwrap();
        assert_eq!(m.to_u32(), 0x6041_0010);
        assert_eq!(PdoMapping::from_u32(0x6041_0010), m);
    }

    #[test]
    fn rejects_zero_and_oversized_bit_length() {
        assert!(PdoMapping::new(0x6041, 0, 0).is_err());
        assert!(PdoMapping::new(0x6041, 0, 200).is_err());
    }

    #[test]
    fn add_mapping_caps_total_at_64_bits() {
        let mut cfg = PdoConfig::new(PdoNumber::First, CobId::new(0x181), 255);
        cfg.add_mapping(PdoMapping::new(0x6040, 0, 32).unwrap()).unwrap();
        cfg.add_mapping(PdoMapping::new(0x6041, 0, 32).unwrap()).unwrap();
        let err = cfg
            .add_mapping(PdoMapping::new(0x6042, 0, 1).unwrap())
            .unwrap_err();
        assert_eq!(
            err,
            PdoConfigError::MappingOverflow { total: 64, added: 1 }
        );
        assert_eq!(cfg.total_bits(), 64);
    }

    #[test]
    fn bit_offset_accumulates_preceding_lengths() {
        let mut cfg = PdoConfig::new(PdoNumber::First, CobId::new(0x181), 255);
        cfg.add_mapping(PdoMapping::new(0x6040, 0, 16).unwrap()).unwrap();
        cfg.add_mapping(PdoMapping::new(0x6041, 0, 8).unwrap()).unwrap();
        assert_eq!(cfg.bit_offset_of(0), Some(0));
        assert_eq!(cfg.bit_offset_of(1), Some(16));
        assert_eq!(cfg.bit_offset_of(2), None);
    }

    #[test]
    fn standard_cob_ids_match_formula() {
        assert_eq!(PdoNumber::First.tpdo_cob_id(5).raw(), 0x185);
        assert_eq!(PdoNumber::Second.rpdo_cob_id(5).raw(), 0x305);
    }

    #[test]
    fn extract_mapping_uses_cumulative_offset_not_subindex() {
        let mut cfg = PdoConfig::new(PdoNumber::First, CobId::new(0x181), 255);
        // Sub-indices deliberately out of offset order to prove extraction
        // never derives position from them.
        cfg.add_mapping(PdoMapping::new(0x6041, 9, 16).unwrap()).unwrap();
        cfg.add_mapping(PdoMapping::new(0x6040, 0, 8).unwrap()).unwrap();

        let payload = [0x34, 0x12, 0xAB];
        assert_eq!(cfg.extract_mapping(&payload, 0), Some(0x1234));
        assert_eq!(cfg.extract_mapping(&payload, 1), Some(0xAB));
        assert_eq!(cfg.extract_mapping(&payload, 2), None);
    }

    #[test]
    fn validate_flags_empty_mapping_list() {
        let cfg = PdoConfig::new(PdoNumber::First, CobId::new(0x181), 255);
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.contains("no mappings")));
    }
}
