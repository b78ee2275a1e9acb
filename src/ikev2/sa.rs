use std::fmt;

use log::debug;

use super::message::FormatError;

const PROPOSAL_HEADER_LENGTH: usize = 8;
const TRANSFORM_HEADER_LENGTH: usize = 8;

const LAST_SUBSTRUCT: u8 = 0;
const MORE_PROPOSALS: u8 = 2;
const MORE_TRANSFORMS: u8 = 3;

const ATTRIBUTE_FORMAT_TV: u16 = 1 << 15;
const ATTRIBUTE_TYPE_KEY_LENGTH: u16 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolId(u8);

impl ProtocolId {
    pub const IKE: ProtocolId = ProtocolId(1);
    pub const AH: ProtocolId = ProtocolId(2);
    pub const ESP: ProtocolId = ProtocolId(3);

    pub fn from_u8(value: u8) -> Result<ProtocolId, FormatError> {
        if value >= Self::IKE.0 && value <= Self::ESP.0 {
            Ok(ProtocolId(value))
        } else {
            debug!("Unsupported protocol ID {}", value);
            Err("Unsupported protocol ID".into())
        }
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IKE => write!(f, "IKE"),
            Self::AH => write!(f, "AH"),
            Self::ESP => write!(f, "ESP"),
            _ => write!(f, "Unknown protocol ID {}", self.0),
        }
    }
}

/// Transform attribute, RFC 7296, Section 3.3.5.
///
/// Key Length is the only attribute defined for IKEv2; everything else is
/// retained as opaque bytes with the format bit preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    KeyLength(u16),
    Unrecognized { attribute_type: u16, value: Vec<u8> },
}

impl Attribute {
    // Attribute type with the TV/TLV format bit masked off.
    fn attribute_type(&self) -> u16 {
        match *self {
            Self::KeyLength(_) => ATTRIBUTE_TYPE_KEY_LENGTH,
            Self::Unrecognized { attribute_type, .. } => attribute_type & !ATTRIBUTE_FORMAT_TV,
        }
    }

    fn read_from(data: &[u8]) -> Result<(Attribute, usize), FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in transform attribute");
            return Err("Not enough data in transform attribute".into());
        }
        let mut attribute_type = [0u8; 2];
        attribute_type.copy_from_slice(&data[0..2]);
        let attribute_type = u16::from_be_bytes(attribute_type);
        if attribute_type & ATTRIBUTE_FORMAT_TV != 0 {
            let mut value = [0u8; 2];
            value.copy_from_slice(&data[2..4]);
            let attribute = if attribute_type & !ATTRIBUTE_FORMAT_TV == ATTRIBUTE_TYPE_KEY_LENGTH
            {
                Attribute::KeyLength(u16::from_be_bytes(value))
            } else {
                Attribute::Unrecognized {
                    attribute_type,
                    value: value.to_vec(),
                }
            };
            Ok((attribute, 4))
        } else {
            let mut attribute_length = [0u8; 2];
            attribute_length.copy_from_slice(&data[2..4]);
            let attribute_length = u16::from_be_bytes(attribute_length) as usize;
            if attribute_length < 4 || data.len() < attribute_length {
                debug!("Transform attribute length overflow");
                return Err("Transform attribute length overflow".into());
            }
            Ok((
                Attribute::Unrecognized {
                    attribute_type,
                    value: data[4..attribute_length].to_vec(),
                },
                attribute_length,
            ))
        }
    }

    fn write_to(&self, dest: &mut Vec<u8>) {
        match *self {
            Self::KeyLength(key_length) => {
                dest.extend_from_slice(
                    &(ATTRIBUTE_FORMAT_TV | ATTRIBUTE_TYPE_KEY_LENGTH).to_be_bytes(),
                );
                dest.extend_from_slice(&key_length.to_be_bytes());
            }
            Self::Unrecognized {
                attribute_type,
                ref value,
            } => {
                dest.extend_from_slice(&attribute_type.to_be_bytes());
                if attribute_type & ATTRIBUTE_FORMAT_TV == 0 {
                    dest.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
                }
                dest.extend_from_slice(value);
            }
        }
    }

    fn encoded_length(&self) -> usize {
        match *self {
            Self::KeyLength(_) => 4,
            Self::Unrecognized {
                attribute_type,
                ref value,
            } => {
                if attribute_type & ATTRIBUTE_FORMAT_TV != 0 {
                    2 + value.len()
                } else {
                    4 + value.len()
                }
            }
        }
    }
}

/// Combined transform type and transform ID, RFC 7296, Section 3.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformType(u8, u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Encryption,
    PseudorandomFunction,
    Integrity,
    DiffieHellman,
    ExtendedSequenceNumbers,
    Unrecognized,
}

impl TransformType {
    pub const ENCR_3DES: TransformType = TransformType(1, 3);
    pub const ENCR_AES_CBC: TransformType = TransformType(1, 12);
    pub const ENCR_AES_CTR: TransformType = TransformType(1, 13);
    pub const ENCR_AES_GCM_8: TransformType = TransformType(1, 18);
    pub const ENCR_AES_GCM_12: TransformType = TransformType(1, 19);
    pub const ENCR_AES_GCM_16: TransformType = TransformType(1, 20);

    pub const PRF_HMAC_SHA1: TransformType = TransformType(2, 2);
    pub const PRF_AES128_XCBC: TransformType = TransformType(2, 4);
    pub const PRF_HMAC_SHA2_256: TransformType = TransformType(2, 5);
    pub const PRF_HMAC_SHA2_384: TransformType = TransformType(2, 6);
    pub const PRF_HMAC_SHA2_512: TransformType = TransformType(2, 7);

    pub const AUTH_NONE: TransformType = TransformType(3, 0);
    pub const AUTH_HMAC_SHA1_96: TransformType = TransformType(3, 2);
    pub const AUTH_AES_XCBC_96: TransformType = TransformType(3, 5);
    pub const AUTH_HMAC_SHA2_256_128: TransformType = TransformType(3, 12);
    pub const AUTH_HMAC_SHA2_384_192: TransformType = TransformType(3, 13);
    pub const AUTH_HMAC_SHA2_512_256: TransformType = TransformType(3, 14);

    pub const DH_NONE: TransformType = TransformType(4, 0);
    pub const DH_1024_MODP: TransformType = TransformType(4, 2);
    pub const DH_1536_MODP: TransformType = TransformType(4, 5);
    pub const DH_2048_MODP: TransformType = TransformType(4, 14);
    pub const DH_3072_MODP: TransformType = TransformType(4, 15);
    pub const DH_4096_MODP: TransformType = TransformType(4, 16);
    pub const DH_6144_MODP: TransformType = TransformType(4, 17);
    pub const DH_8192_MODP: TransformType = TransformType(4, 18);
    pub const DH_256_ECP: TransformType = TransformType(4, 19);

    pub const NO_ESN: TransformType = TransformType(5, 0);
    pub const ESN: TransformType = TransformType(5, 1);

    pub fn from_raw(transform_type: u8, transform_id: u16) -> TransformType {
        TransformType(transform_type, transform_id)
    }

    pub fn type_id(&self) -> (u8, u16) {
        (self.0, self.1)
    }

    pub fn transform_kind(&self) -> TransformKind {
        match self.0 {
            1 => TransformKind::Encryption,
            2 => TransformKind::PseudorandomFunction,
            3 => TransformKind::Integrity,
            4 => TransformKind::DiffieHellman,
            5 => TransformKind::ExtendedSequenceNumbers,
            _ => TransformKind::Unrecognized,
        }
    }

    pub fn is_recognized_id(&self) -> bool {
        match self.transform_kind() {
            TransformKind::Encryption => matches!(self.1, 3 | 12 | 13 | 18 | 19 | 20),
            TransformKind::PseudorandomFunction => matches!(self.1, 2 | 4 | 5 | 6 | 7),
            TransformKind::Integrity => matches!(self.1, 0 | 2 | 5 | 12 | 13 | 14),
            TransformKind::DiffieHellman => matches!(self.1, 0 | 2 | 5 | 14 | 15 | 16 | 17 | 18 | 19),
            TransformKind::ExtendedSequenceNumbers => matches!(self.1, 0 | 1),
            TransformKind::Unrecognized => false,
        }
    }

    /// Combined-mode ciphers authenticate internally and take no separate
    /// integrity algorithm.
    pub fn is_aead(&self) -> bool {
        matches!(
            *self,
            Self::ENCR_AES_GCM_8 | Self::ENCR_AES_GCM_12 | Self::ENCR_AES_GCM_16
        )
    }

    // Permitted key lengths for variable-key ciphers; None means the key
    // size is fixed and a Key Length attribute must not appear.
    pub fn valid_key_lengths(&self) -> Option<&'static [u16]> {
        match *self {
            Self::ENCR_AES_CBC | Self::ENCR_AES_CTR => Some(&[128, 192, 256]),
            Self::ENCR_AES_GCM_8 | Self::ENCR_AES_GCM_12 | Self::ENCR_AES_GCM_16 => {
                Some(&[128, 192, 256])
            }
            _ => None,
        }
    }
}

impl fmt::Display for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ENCR_3DES => write!(f, "ENCR_3DES"),
            Self::ENCR_AES_CBC => write!(f, "ENCR_AES_CBC"),
            Self::ENCR_AES_CTR => write!(f, "ENCR_AES_CTR"),
            Self::ENCR_AES_GCM_8 => write!(f, "ENCR_AES_GCM_8"),
            Self::ENCR_AES_GCM_12 => write!(f, "ENCR_AES_GCM_12"),
            Self::ENCR_AES_GCM_16 => write!(f, "ENCR_AES_GCM_16"),
            Self::PRF_HMAC_SHA1 => write!(f, "PRF_HMAC_SHA1"),
            Self::PRF_AES128_XCBC => write!(f, "PRF_AES128_XCBC"),
            Self::PRF_HMAC_SHA2_256 => write!(f, "PRF_HMAC_SHA2_256"),
            Self::PRF_HMAC_SHA2_384 => write!(f, "PRF_HMAC_SHA2_384"),
            Self::PRF_HMAC_SHA2_512 => write!(f, "PRF_HMAC_SHA2_512"),
            Self::AUTH_NONE => write!(f, "AUTH_NONE"),
            Self::AUTH_HMAC_SHA1_96 => write!(f, "AUTH_HMAC_SHA1_96"),
            Self::AUTH_AES_XCBC_96 => write!(f, "AUTH_AES_XCBC_96"),
            Self::AUTH_HMAC_SHA2_256_128 => write!(f, "AUTH_HMAC_SHA2_256_128"),
            Self::AUTH_HMAC_SHA2_384_192 => write!(f, "AUTH_HMAC_SHA2_384_192"),
            Self::AUTH_HMAC_SHA2_512_256 => write!(f, "AUTH_HMAC_SHA2_512_256"),
            Self::DH_NONE => write!(f, "DH_NONE"),
            Self::DH_1024_MODP => write!(f, "DH_1024_MODP"),
            Self::DH_1536_MODP => write!(f, "DH_1536_MODP"),
            Self::DH_2048_MODP => write!(f, "DH_2048_MODP"),
            Self::DH_3072_MODP => write!(f, "DH_3072_MODP"),
            Self::DH_4096_MODP => write!(f, "DH_4096_MODP"),
            Self::DH_6144_MODP => write!(f, "DH_6144_MODP"),
            Self::DH_8192_MODP => write!(f, "DH_8192_MODP"),
            Self::DH_256_ECP => write!(f, "DH_256_ECP"),
            Self::NO_ESN => write!(f, "NO_ESN"),
            Self::ESN => write!(f, "ESN"),
            _ => write!(f, "Unknown transform type {} id {}", self.0, self.1),
        }
    }
}

/// Transform substructure, RFC 7296, Section 3.3.2.
///
/// Unrecognized transforms decode successfully but are marked unsupported,
/// so negotiation can skip them without losing the peer's offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    transform_type: TransformType,
    attributes: Vec<Attribute>,
    supported: bool,
}

impl Transform {
    pub fn new(transform_type: TransformType, attributes: Vec<Attribute>) -> Transform {
        let supported = compute_supported(transform_type, &attributes);
        Transform {
            transform_type,
            attributes,
            supported,
        }
    }

    pub fn transform_type(&self) -> TransformType {
        self.transform_type
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn is_supported(&self) -> bool {
        self.supported
    }

    pub fn key_length(&self) -> Option<u16> {
        self.attributes.iter().find_map(|attribute| {
            if let Attribute::KeyLength(key_length) = attribute {
                Some(*key_length)
            } else {
                None
            }
        })
    }

    fn read_from(data: &[u8]) -> Result<(Transform, bool, usize), FormatError> {
        if data.len() < TRANSFORM_HEADER_LENGTH {
            debug!("Not enough data in transform");
            return Err("Not enough data in transform".into());
        }
        let last_substruct = data[0];
        if last_substruct != LAST_SUBSTRUCT && last_substruct != MORE_TRANSFORMS {
            debug!("Unsupported transform last substruc {}", last_substruct);
            return Err("Unsupported transform last substruc".into());
        }
        let mut transform_length = [0u8; 2];
        transform_length.copy_from_slice(&data[2..4]);
        let transform_length = u16::from_be_bytes(transform_length) as usize;
        if transform_length < TRANSFORM_HEADER_LENGTH || data.len() < transform_length {
            debug!("Transform length overflow");
            return Err("Transform length overflow".into());
        }
        let mut transform_id = [0u8; 2];
        transform_id.copy_from_slice(&data[6..8]);
        let transform_type = TransformType::from_raw(data[4], u16::from_be_bytes(transform_id));
        let mut attributes = Vec::new();
        let mut seen_types = Vec::new();
        let mut remaining = &data[TRANSFORM_HEADER_LENGTH..transform_length];
        while !remaining.is_empty() {
            let (attribute, consumed) = Attribute::read_from(remaining)?;
            if seen_types.contains(&attribute.attribute_type()) {
                debug!(
                    "Duplicate attribute type {} in transform {}",
                    attribute.attribute_type(),
                    transform_type
                );
                return Err("Duplicate transform attribute".into());
            }
            seen_types.push(attribute.attribute_type());
            attributes.push(attribute);
            remaining = &remaining[consumed..];
        }
        Ok((
            Transform::new(transform_type, attributes),
            last_substruct == LAST_SUBSTRUCT,
            transform_length,
        ))
    }

    fn write_to(&self, is_last: bool, dest: &mut Vec<u8>) {
        dest.push(if is_last { LAST_SUBSTRUCT } else { MORE_TRANSFORMS });
        dest.push(0);
        dest.extend_from_slice(&(self.encoded_length() as u16).to_be_bytes());
        dest.push(self.transform_type.0);
        dest.push(0);
        dest.extend_from_slice(&self.transform_type.1.to_be_bytes());
        for attribute in &self.attributes {
            attribute.write_to(dest);
        }
    }

    fn encoded_length(&self) -> usize {
        TRANSFORM_HEADER_LENGTH
            + self
                .attributes
                .iter()
                .map(|attribute| attribute.encoded_length())
                .sum::<usize>()
    }
}

fn compute_supported(transform_type: TransformType, attributes: &[Attribute]) -> bool {
    if !transform_type.is_recognized_id() {
        return false;
    }
    match transform_type.transform_kind() {
        TransformKind::Encryption => match transform_type.valid_key_lengths() {
            // Variable-key ciphers must carry exactly one valid Key Length.
            Some(valid_lengths) => match attributes {
                [Attribute::KeyLength(key_length)] => valid_lengths.contains(key_length),
                _ => false,
            },
            // Fixed-key ciphers must not carry attributes at all.
            None => attributes.is_empty(),
        },
        // No attributes are defined for the remaining transform types.
        _ => attributes.is_empty(),
    }
}

/// Proposal substructure, RFC 7296, Section 3.3.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    number: u8,
    protocol_id: ProtocolId,
    spi: Vec<u8>,
    transforms: Vec<Transform>,
}

impl Proposal {
    pub fn new(
        number: u8,
        protocol_id: ProtocolId,
        spi: Vec<u8>,
        transforms: Vec<Transform>,
    ) -> Proposal {
        Proposal {
            number,
            protocol_id,
            spi,
            transforms,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn spi(&self) -> &[u8] {
        &self.spi
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    fn read_from(data: &[u8]) -> Result<(Proposal, bool, usize), FormatError> {
        if data.len() < PROPOSAL_HEADER_LENGTH {
            debug!("Not enough data in proposal");
            return Err("Not enough data in proposal".into());
        }
        let last_substruct = data[0];
        if last_substruct != LAST_SUBSTRUCT && last_substruct != MORE_PROPOSALS {
            debug!("Unsupported proposal last substruc {}", last_substruct);
            return Err("Unsupported proposal last substruc".into());
        }
        let mut proposal_length = [0u8; 2];
        proposal_length.copy_from_slice(&data[2..4]);
        let proposal_length = u16::from_be_bytes(proposal_length) as usize;
        if proposal_length < PROPOSAL_HEADER_LENGTH || data.len() < proposal_length {
            debug!("Proposal length overflow");
            return Err("Proposal length overflow".into());
        }
        let number = data[4];
        let protocol_id = ProtocolId::from_u8(data[5])?;
        let spi_size = data[6] as usize;
        let num_transforms = data[7] as usize;
        if num_transforms == 0 {
            debug!("Proposal {} has no transforms", number);
            return Err("Proposal has no transforms".into());
        }
        if PROPOSAL_HEADER_LENGTH + spi_size > proposal_length {
            debug!("Proposal SPI overflow");
            return Err("Proposal SPI overflow".into());
        }
        let spi = data[PROPOSAL_HEADER_LENGTH..PROPOSAL_HEADER_LENGTH + spi_size].to_vec();
        let mut remaining = &data[PROPOSAL_HEADER_LENGTH + spi_size..proposal_length];
        let mut transforms = Vec::with_capacity(num_transforms);
        for i in 0..num_transforms {
            let (transform, is_last, consumed) = Transform::read_from(remaining)?;
            if is_last != (i == num_transforms - 1) {
                debug!("Transform count mismatch in proposal {}", number);
                return Err("Transform count mismatch".into());
            }
            transforms.push(transform);
            remaining = &remaining[consumed..];
        }
        if !remaining.is_empty() {
            debug!("Proposal {} has unaccounted data", number);
            return Err("Proposal has unaccounted data".into());
        }
        Ok((
            Proposal {
                number,
                protocol_id,
                spi,
                transforms,
            },
            last_substruct == MORE_PROPOSALS,
            proposal_length,
        ))
    }

    fn write_to(&self, is_last: bool, dest: &mut Vec<u8>) {
        dest.push(if is_last { LAST_SUBSTRUCT } else { MORE_PROPOSALS });
        dest.push(0);
        dest.extend_from_slice(&(self.encoded_length() as u16).to_be_bytes());
        dest.push(self.number);
        dest.push(self.protocol_id.to_u8());
        dest.push(self.spi.len() as u8);
        dest.push(self.transforms.len() as u8);
        dest.extend_from_slice(&self.spi);
        for (i, transform) in self.transforms.iter().enumerate() {
            transform.write_to(i + 1 == self.transforms.len(), dest);
        }
    }

    fn encoded_length(&self) -> usize {
        PROPOSAL_HEADER_LENGTH
            + self.spi.len()
            + self
                .transforms
                .iter()
                .map(|transform| transform.encoded_length())
                .sum::<usize>()
    }
}

/// Decodes a Security Association payload body into its proposal chain.
pub fn decode_proposals(is_response: bool, data: &[u8]) -> Result<Vec<Proposal>, FormatError> {
    let mut proposals = Vec::new();
    let mut remaining = data;
    loop {
        let (proposal, more_proposals, consumed) = Proposal::read_from(remaining)?;
        remaining = &remaining[consumed..];
        proposals.push(proposal);
        if more_proposals {
            if remaining.is_empty() {
                debug!("Last proposal has more proposals flag set");
                return Err("Last proposal has more proposals flag set".into());
            }
        } else {
            if !remaining.is_empty() {
                debug!("Security Association payload has unaccounted data");
                return Err("Security Association payload has unaccounted data".into());
            }
            break;
        }
    }
    if is_response && proposals.len() != 1 {
        debug!(
            "Response Security Association payload contains {} proposals",
            proposals.len()
        );
    }
    Ok(proposals)
}

pub fn encode_proposals(proposals: &[Proposal], dest: &mut Vec<u8>) {
    for (i, proposal) in proposals.iter().enumerate() {
        proposal.write_to(i + 1 == proposals.len(), dest);
    }
}

pub fn encoded_proposals_length(proposals: &[Proposal]) -> usize {
    proposals
        .iter()
        .map(|proposal| proposal.encoded_length())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_hex(hex: &str) -> Vec<u8> {
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect()
    }

    // IKE proposal offering AES-CBC-128, HMAC-SHA1-96, 1024-bit MODP and
    // HMAC-SHA1, as sent by a real initiator.
    const IKE_PROPOSAL_HEX: &str = "0000002c010100040300000c0100000c800e0080030000080300000203\
        000008040000020000000802000002";

    fn ike_proposal_packet() -> Vec<u8> {
        from_hex(IKE_PROPOSAL_HEX)
    }

    #[test]
    fn decode_ike_proposal() {
        let proposals = decode_proposals(false, &ike_proposal_packet()).unwrap();
        assert_eq!(proposals.len(), 1);
        let proposal = &proposals[0];
        assert_eq!(proposal.number(), 1);
        assert_eq!(proposal.protocol_id(), ProtocolId::IKE);
        assert!(proposal.spi().is_empty());
        let transforms = proposal.transforms();
        assert_eq!(transforms.len(), 4);
        assert_eq!(transforms[0].transform_type(), TransformType::ENCR_AES_CBC);
        assert_eq!(transforms[0].key_length(), Some(128));
        assert_eq!(
            transforms[1].transform_type(),
            TransformType::AUTH_HMAC_SHA1_96
        );
        assert_eq!(transforms[2].transform_type(), TransformType::DH_1024_MODP);
        assert_eq!(transforms[3].transform_type(), TransformType::PRF_HMAC_SHA1);
        assert!(transforms.iter().all(Transform::is_supported));
    }

    #[test]
    fn proposal_roundtrip() {
        let packet = ike_proposal_packet();
        let proposals = decode_proposals(false, &packet).unwrap();
        let mut encoded = Vec::new();
        encode_proposals(&proposals, &mut encoded);
        assert_eq!(encoded, packet);
        assert_eq!(encoded_proposals_length(&proposals), packet.len());
    }

    #[test]
    fn decode_two_proposals() {
        let esp_spi = vec![0x01, 0x02, 0x03, 0x04];
        let proposals = vec![
            Proposal::new(
                1,
                ProtocolId::ESP,
                esp_spi.clone(),
                vec![
                    Transform::new(
                        TransformType::ENCR_AES_GCM_16,
                        vec![Attribute::KeyLength(256)],
                    ),
                    Transform::new(TransformType::NO_ESN, vec![]),
                ],
            ),
            Proposal::new(
                2,
                ProtocolId::ESP,
                esp_spi.clone(),
                vec![
                    Transform::new(
                        TransformType::ENCR_AES_CBC,
                        vec![Attribute::KeyLength(128)],
                    ),
                    Transform::new(TransformType::AUTH_HMAC_SHA1_96, vec![]),
                    Transform::new(TransformType::NO_ESN, vec![]),
                ],
            ),
        ];
        let mut encoded = Vec::new();
        encode_proposals(&proposals, &mut encoded);
        let decoded = decode_proposals(false, &encoded).unwrap();
        assert_eq!(decoded, proposals);
        assert_eq!(decoded[0].spi(), esp_spi.as_slice());
    }

    #[test]
    fn more_proposals_flag_without_data() {
        let mut packet = ike_proposal_packet();
        packet[0] = MORE_PROPOSALS;
        assert!(matches!(
            decode_proposals(false, &packet),
            Err(FormatError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn invalid_last_substruct() {
        let mut packet = ike_proposal_packet();
        packet[0] = 1;
        assert!(matches!(
            decode_proposals(false, &packet),
            Err(FormatError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn truncated_proposal() {
        let packet = ike_proposal_packet();
        assert!(matches!(
            decode_proposals(false, &packet[..packet.len() - 4]),
            Err(FormatError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn decode_key_length_attribute() {
        let (attribute, consumed) = Attribute::read_from(&from_hex("800e0080")).unwrap();
        assert_eq!(attribute, Attribute::KeyLength(128));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn unrecognized_tlv_attribute_roundtrip() {
        let data = from_hex("001c0008aabbccdd");
        let (attribute, consumed) = Attribute::read_from(&data).unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(
            attribute,
            Attribute::Unrecognized {
                attribute_type: 0x001c,
                value: vec![0xaa, 0xbb, 0xcc, 0xdd],
            }
        );
        let mut encoded = Vec::new();
        attribute.write_to(&mut encoded);
        assert_eq!(encoded, data);
    }

    #[test]
    fn decode_encryption_transform() {
        let (transform, is_last, consumed) =
            Transform::read_from(&from_hex("0300000c0100000c800e0080")).unwrap();
        assert_eq!(transform.transform_type(), TransformType::ENCR_AES_CBC);
        assert_eq!(transform.key_length(), Some(128));
        assert!(transform.is_supported());
        assert!(!is_last);
        assert_eq!(consumed, 12);
    }

    #[test]
    fn decode_prf_transform() {
        let (transform, is_last, _) =
            Transform::read_from(&from_hex("0000000802000002")).unwrap();
        assert_eq!(transform.transform_type(), TransformType::PRF_HMAC_SHA1);
        assert!(transform.is_supported());
        assert!(is_last);
    }

    #[test]
    fn decode_esn_transform() {
        let (transform, _, _) = Transform::read_from(&from_hex("0000000805000000")).unwrap();
        assert_eq!(transform.transform_type(), TransformType::NO_ESN);
        assert!(transform.is_supported());
    }

    #[test]
    fn duplicate_attribute_is_fatal() {
        let data = from_hex("030000100100000c800e0080800e0080");
        assert!(matches!(
            Transform::read_from(&data),
            Err(FormatError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn unrecognized_transform_id_is_retained() {
        let (transform, _, _) = Transform::read_from(&from_hex("00000008010003e7")).unwrap();
        assert_eq!(transform.transform_type(), TransformType::from_raw(1, 0x3e7));
        assert!(!transform.is_supported());
    }

    #[test]
    fn unrecognized_attribute_makes_transform_unsupported() {
        let data = from_hex("030000140100000c800e008000010008aabbccdd");
        let (transform, _, _) = Transform::read_from(&data).unwrap();
        assert_eq!(transform.transform_type(), TransformType::ENCR_AES_CBC);
        assert!(!transform.is_supported());
        assert_eq!(transform.attributes().len(), 2);
    }

    #[test]
    fn key_length_on_fixed_key_cipher_is_unsupported() {
        let (transform, _, _) =
            Transform::read_from(&from_hex("0300000c01000003800e00c0")).unwrap();
        assert_eq!(transform.transform_type(), TransformType::ENCR_3DES);
        assert!(!transform.is_supported());
    }

    #[test]
    fn missing_key_length_on_variable_key_cipher_is_unsupported() {
        let (transform, _, _) = Transform::read_from(&from_hex("030000080100000c")).unwrap();
        assert_eq!(transform.transform_type(), TransformType::ENCR_AES_CBC);
        assert!(!transform.is_supported());
    }

    #[test]
    fn invalid_key_length_is_unsupported() {
        let (transform, _, _) =
            Transform::read_from(&from_hex("0300000c0100000c800e0090")).unwrap();
        assert_eq!(transform.key_length(), Some(144));
        assert!(!transform.is_supported());
    }

    #[test]
    fn transform_count_mismatch() {
        let mut packet = ike_proposal_packet();
        // Claim 3 transforms while 4 are encoded.
        packet[7] = 3;
        assert!(matches!(
            decode_proposals(false, &packet),
            Err(FormatError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn proposal_without_transforms() {
        let packet = from_hex("0000000801010000");
        assert!(matches!(
            decode_proposals(false, &packet),
            Err(FormatError::InvalidSyntax(_))
        ));
    }
}
