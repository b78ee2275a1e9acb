use std::{error, fmt};

use log::debug;

use super::sa::{Attribute, Proposal, ProtocolId, Transform, TransformKind, TransformType};

/// An ordered set of acceptable algorithms for one SA, most preferred first.
///
/// Policies are immutable once built; construction goes through
/// [`SaPolicy::builder`], which enforces the combination rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPolicy {
    protocol_id: ProtocolId,
    encryption: Vec<(TransformType, Option<u16>)>,
    prf: Vec<TransformType>,
    integrity: Vec<TransformType>,
    dh: Vec<TransformType>,
    uses_aead: bool,
}

impl SaPolicy {
    pub fn builder(protocol_id: ProtocolId) -> SaPolicyBuilder {
        SaPolicyBuilder {
            protocol_id,
            encryption: Vec::new(),
            prf: Vec::new(),
            integrity: Vec::new(),
            dh: Vec::new(),
        }
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    /// Whether this policy negotiates a combined-mode cipher.
    pub fn uses_aead(&self) -> bool {
        self.uses_aead
    }

    /// Encodes this policy as an outbound proposal offering every
    /// configured algorithm, in preference order.
    pub fn to_proposal(&self, number: u8, spi: Vec<u8>) -> Proposal {
        let mut transforms = Vec::new();
        for (transform_type, key_length) in &self.encryption {
            let attributes = key_length
                .map(|key_length| vec![Attribute::KeyLength(key_length)])
                .unwrap_or_default();
            transforms.push(Transform::new(*transform_type, attributes));
        }
        for transform_type in &self.prf {
            transforms.push(Transform::new(*transform_type, vec![]));
        }
        for transform_type in &self.integrity {
            transforms.push(Transform::new(*transform_type, vec![]));
        }
        for transform_type in &self.dh {
            transforms.push(Transform::new(*transform_type, vec![]));
        }
        Proposal::new(number, self.protocol_id, spi, transforms)
    }

    // Checks a peer proposal against this policy; on a match, returns the
    // single-choice proposal a responder would send back.
    fn match_proposal(&self, proposal: &Proposal) -> Option<Proposal> {
        if proposal.protocol_id() != self.protocol_id {
            return None;
        }
        let offered = |kind: TransformKind| {
            proposal
                .transforms()
                .iter()
                .filter(move |transform| {
                    transform.is_supported() && transform.transform_type().transform_kind() == kind
                })
        };
        let encryption = self.encryption.iter().find(|(transform_type, key_length)| {
            offered(TransformKind::Encryption).any(|transform| {
                transform.transform_type() == *transform_type
                    && transform.key_length() == *key_length
            })
        })?;
        let prf = select_transform(&self.prf, offered(TransformKind::PseudorandomFunction))?;
        let integrity = select_transform(&self.integrity, offered(TransformKind::Integrity))?;
        let dh = select_transform(&self.dh, offered(TransformKind::DiffieHellman))?;
        let mut transforms = Vec::new();
        let attributes = encryption
            .1
            .map(|key_length| vec![Attribute::KeyLength(key_length)])
            .unwrap_or_default();
        transforms.push(Transform::new(encryption.0, attributes));
        if let Some(prf) = prf {
            transforms.push(Transform::new(prf, vec![]));
        }
        if let Some(integrity) = integrity {
            transforms.push(Transform::new(integrity, vec![]));
        }
        if let Some(dh) = dh {
            transforms.push(Transform::new(dh, vec![]));
        }
        Some(Proposal::new(
            proposal.number(),
            proposal.protocol_id(),
            proposal.spi().to_vec(),
            transforms,
        ))
    }
}

// Matches one algorithm category: both sides empty is a valid non-choice,
// exactly one side empty is a mismatch, otherwise the local preference
// order picks among the peer's offers.
fn select_transform<'a>(
    local: &[TransformType],
    offered: impl Iterator<Item = &'a Transform>,
) -> Option<Option<TransformType>> {
    let offered = offered
        .map(|transform| transform.transform_type())
        .collect::<Vec<_>>();
    if local.is_empty() && offered.is_empty() {
        return Some(None);
    }
    local
        .iter()
        .find(|transform_type| offered.contains(transform_type))
        .map(|transform_type| Some(*transform_type))
}

/// Outcome of a successful negotiation: the responder's single-choice
/// proposal and the index of the local policy that accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedProposal {
    proposal: Proposal,
    policy_index: usize,
}

impl NegotiatedProposal {
    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    pub fn policy_index(&self) -> usize {
        self.policy_index
    }
}

/// Selects the first peer proposal acceptable to any local policy.
///
/// Peer proposals are scanned in their wire order; for each one, local
/// policies are tried in configuration order, and within a matching policy
/// the locally most preferred algorithm of each category wins.
pub fn negotiate(
    peer_proposals: &[Proposal],
    policies: &[SaPolicy],
) -> Result<NegotiatedProposal, NegotiationError> {
    for peer_proposal in peer_proposals {
        for (policy_index, policy) in policies.iter().enumerate() {
            if let Some(proposal) = policy.match_proposal(peer_proposal) {
                return Ok(NegotiatedProposal {
                    proposal,
                    policy_index,
                });
            }
        }
        debug!(
            "No local policy accepts peer proposal {}",
            peer_proposal.number()
        );
    }
    Err(NegotiationError::NoProposalChosen)
}

pub struct SaPolicyBuilder {
    protocol_id: ProtocolId,
    encryption: Vec<(TransformType, Option<u16>)>,
    prf: Vec<TransformType>,
    integrity: Vec<TransformType>,
    dh: Vec<TransformType>,
}

impl SaPolicyBuilder {
    pub fn add_encryption(
        mut self,
        transform_type: TransformType,
        key_length: Option<u16>,
    ) -> SaPolicyBuilder {
        if !self.encryption.contains(&(transform_type, key_length)) {
            self.encryption.push((transform_type, key_length));
        }
        self
    }

    pub fn add_prf(mut self, transform_type: TransformType) -> SaPolicyBuilder {
        if !self.prf.contains(&transform_type) {
            self.prf.push(transform_type);
        }
        self
    }

    pub fn add_integrity(mut self, transform_type: TransformType) -> SaPolicyBuilder {
        if !self.integrity.contains(&transform_type) {
            self.integrity.push(transform_type);
        }
        self
    }

    pub fn add_dh_group(mut self, transform_type: TransformType) -> SaPolicyBuilder {
        if !self.dh.contains(&transform_type) {
            self.dh.push(transform_type);
        }
        self
    }

    pub fn build(self) -> Result<SaPolicy, PolicyError> {
        if self.encryption.is_empty() {
            return Err("Policy has no encryption algorithms".into());
        }
        for (transform_type, key_length) in &self.encryption {
            if transform_type.transform_kind() != TransformKind::Encryption
                || !transform_type.is_recognized_id()
            {
                return Err("Policy contains an unsupported encryption algorithm".into());
            }
            match (transform_type.valid_key_lengths(), key_length) {
                (Some(valid_lengths), Some(key_length)) => {
                    if !valid_lengths.contains(key_length) {
                        return Err("Invalid key length for encryption algorithm".into());
                    }
                }
                (Some(_), None) => {
                    return Err("Encryption algorithm requires a key length".into());
                }
                (None, Some(_)) => {
                    return Err("Encryption algorithm does not accept a key length".into());
                }
                (None, None) => {}
            }
        }
        let uses_aead = self.encryption[0].0.is_aead();
        if self
            .encryption
            .iter()
            .any(|(transform_type, _)| transform_type.is_aead() != uses_aead)
        {
            return Err("Policy mixes combined-mode and normal-mode ciphers".into());
        }
        check_category(&self.prf, TransformKind::PseudorandomFunction)?;
        check_category(&self.integrity, TransformKind::Integrity)?;
        check_category(&self.dh, TransformKind::DiffieHellman)?;
        if uses_aead {
            if self
                .integrity
                .iter()
                .any(|transform_type| *transform_type != TransformType::AUTH_NONE)
            {
                return Err("Combined-mode ciphers do not take an integrity algorithm".into());
            }
        } else {
            if self.integrity.is_empty() {
                return Err("Normal-mode ciphers require an integrity algorithm".into());
            }
            if self.integrity.contains(&TransformType::AUTH_NONE) {
                return Err("NONE is not a valid integrity algorithm for normal-mode ciphers".into());
            }
        }
        if self.protocol_id == ProtocolId::IKE {
            if self.prf.is_empty() {
                return Err("IKE policy requires a pseudorandom function".into());
            }
            if self.dh.is_empty() {
                return Err("IKE policy requires a Diffie-Hellman group".into());
            }
            if self.dh.contains(&TransformType::DH_NONE) {
                return Err("NONE is not a valid Diffie-Hellman group for an IKE policy".into());
            }
        } else if !self.prf.is_empty() {
            return Err("Pseudorandom functions apply only to IKE policies".into());
        }
        Ok(SaPolicy {
            protocol_id: self.protocol_id,
            encryption: self.encryption,
            prf: self.prf,
            integrity: self.integrity,
            dh: self.dh,
            uses_aead,
        })
    }
}

fn check_category(transforms: &[TransformType], kind: TransformKind) -> Result<(), PolicyError> {
    for transform_type in transforms {
        if transform_type.transform_kind() != kind || !transform_type.is_recognized_id() {
            debug!("Policy contains unsupported transform {}", transform_type);
            return Err("Policy contains an unsupported algorithm".into());
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub struct PolicyError {
    msg: &'static str,
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.msg)
    }
}

impl error::Error for PolicyError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

impl From<&'static str> for PolicyError {
    fn from(msg: &'static str) -> PolicyError {
        PolicyError { msg }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum NegotiationError {
    NoProposalChosen,
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::NoProposalChosen => f.write_str("No proposal chosen"),
        }
    }
}

impl error::Error for NegotiationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ike_policy() -> SaPolicy {
        SaPolicy::builder(ProtocolId::IKE)
            .add_encryption(TransformType::ENCR_AES_CBC, Some(256))
            .add_encryption(TransformType::ENCR_AES_CBC, Some(128))
            .add_prf(TransformType::PRF_HMAC_SHA2_256)
            .add_prf(TransformType::PRF_HMAC_SHA1)
            .add_integrity(TransformType::AUTH_HMAC_SHA2_256_128)
            .add_integrity(TransformType::AUTH_HMAC_SHA1_96)
            .add_dh_group(TransformType::DH_2048_MODP)
            .add_dh_group(TransformType::DH_1024_MODP)
            .build()
            .unwrap()
    }

    fn aead_esp_policy() -> SaPolicy {
        SaPolicy::builder(ProtocolId::ESP)
            .add_encryption(TransformType::ENCR_AES_GCM_16, Some(256))
            .build()
            .unwrap()
    }

    fn ike_peer_proposal() -> Proposal {
        Proposal::new(
            1,
            ProtocolId::IKE,
            vec![],
            vec![
                Transform::new(TransformType::ENCR_AES_CBC, vec![Attribute::KeyLength(128)]),
                Transform::new(TransformType::PRF_HMAC_SHA1, vec![]),
                Transform::new(TransformType::AUTH_HMAC_SHA1_96, vec![]),
                Transform::new(TransformType::DH_1024_MODP, vec![]),
            ],
        )
    }

    #[test]
    fn negotiate_selects_matching_policy() {
        let policies = vec![ike_policy()];
        let negotiated = negotiate(&[ike_peer_proposal()], &policies).unwrap();
        assert_eq!(negotiated.policy_index(), 0);
        let proposal = negotiated.proposal();
        assert_eq!(proposal.number(), 1);
        assert_eq!(proposal.protocol_id(), ProtocolId::IKE);
        let selected = proposal
            .transforms()
            .iter()
            .map(Transform::transform_type)
            .collect::<Vec<_>>();
        assert_eq!(
            selected,
            vec![
                TransformType::ENCR_AES_CBC,
                TransformType::PRF_HMAC_SHA1,
                TransformType::AUTH_HMAC_SHA1_96,
                TransformType::DH_1024_MODP,
            ]
        );
        assert_eq!(proposal.transforms()[0].key_length(), Some(128));
    }

    #[test]
    fn negotiate_prefers_local_order() {
        let mut transforms = ike_peer_proposal().transforms().to_vec();
        transforms.push(Transform::new(
            TransformType::ENCR_AES_CBC,
            vec![Attribute::KeyLength(256)],
        ));
        transforms.push(Transform::new(TransformType::DH_2048_MODP, vec![]));
        let proposal = Proposal::new(1, ProtocolId::IKE, vec![], transforms);
        let negotiated = negotiate(&[proposal], &[ike_policy()]).unwrap();
        // 256-bit AES and the 2048-bit group rank higher locally even though
        // the peer listed them last.
        assert_eq!(negotiated.proposal().transforms()[0].key_length(), Some(256));
        assert!(negotiated
            .proposal()
            .transforms()
            .iter()
            .any(|transform| transform.transform_type() == TransformType::DH_2048_MODP));
    }

    #[test]
    fn negotiate_scans_proposals_in_peer_order() {
        let aes_gcm_proposal = Proposal::new(
            1,
            ProtocolId::ESP,
            vec![0x01, 0x02, 0x03, 0x04],
            vec![Transform::new(
                TransformType::ENCR_AES_GCM_16,
                vec![Attribute::KeyLength(256)],
            )],
        );
        let aes_cbc_proposal = Proposal::new(
            2,
            ProtocolId::ESP,
            vec![0x01, 0x02, 0x03, 0x04],
            vec![
                Transform::new(TransformType::ENCR_AES_CBC, vec![Attribute::KeyLength(128)]),
                Transform::new(TransformType::AUTH_HMAC_SHA1_96, vec![]),
            ],
        );
        let cbc_policy = SaPolicy::builder(ProtocolId::ESP)
            .add_encryption(TransformType::ENCR_AES_CBC, Some(128))
            .add_integrity(TransformType::AUTH_HMAC_SHA1_96)
            .build()
            .unwrap();
        // Both proposals are acceptable to some policy; the peer's first
        // proposal wins regardless of local policy order.
        let negotiated = negotiate(
            &[aes_gcm_proposal, aes_cbc_proposal],
            &[cbc_policy, aead_esp_policy()],
        )
        .unwrap();
        assert_eq!(negotiated.policy_index(), 1);
        assert_eq!(negotiated.proposal().number(), 1);
        assert_eq!(
            negotiated.proposal().transforms()[0].transform_type(),
            TransformType::ENCR_AES_GCM_16
        );
    }

    #[test]
    fn negotiate_rejects_key_length_mismatch() {
        let proposal = Proposal::new(
            1,
            ProtocolId::ESP,
            vec![0x01, 0x02, 0x03, 0x04],
            vec![Transform::new(
                TransformType::ENCR_AES_GCM_16,
                vec![Attribute::KeyLength(128)],
            )],
        );
        assert_eq!(
            negotiate(&[proposal], &[aead_esp_policy()]),
            Err(NegotiationError::NoProposalChosen)
        );
    }

    #[test]
    fn negotiate_rejects_category_mismatch() {
        // Peer offers no DH group at all while the local policy requires one.
        let proposal = Proposal::new(
            1,
            ProtocolId::IKE,
            vec![],
            vec![
                Transform::new(TransformType::ENCR_AES_CBC, vec![Attribute::KeyLength(128)]),
                Transform::new(TransformType::PRF_HMAC_SHA1, vec![]),
                Transform::new(TransformType::AUTH_HMAC_SHA1_96, vec![]),
            ],
        );
        assert_eq!(
            negotiate(&[proposal], &[ike_policy()]),
            Err(NegotiationError::NoProposalChosen)
        );
    }

    #[test]
    fn negotiate_rejects_protocol_mismatch() {
        assert_eq!(
            negotiate(&[ike_peer_proposal()], &[aead_esp_policy()]),
            Err(NegotiationError::NoProposalChosen)
        );
    }

    #[test]
    fn negotiate_skips_unsupported_transforms() {
        // The only encryption offer carries an invalid key length, so it is
        // decoded as unsupported and cannot be selected.
        let proposal = Proposal::new(
            1,
            ProtocolId::ESP,
            vec![0x01, 0x02, 0x03, 0x04],
            vec![Transform::new(
                TransformType::ENCR_AES_GCM_16,
                vec![Attribute::KeyLength(144)],
            )],
        );
        assert!(!proposal.transforms()[0].is_supported());
        assert_eq!(
            negotiate(&[proposal], &[aead_esp_policy()]),
            Err(NegotiationError::NoProposalChosen)
        );
    }

    #[test]
    fn negotiate_empty_proposals() {
        assert_eq!(
            negotiate(&[], &[ike_policy()]),
            Err(NegotiationError::NoProposalChosen)
        );
    }

    #[test]
    fn policy_to_proposal_roundtrip() {
        let proposal = ike_policy().to_proposal(1, vec![]);
        assert_eq!(proposal.transforms().len(), 8);
        assert!(proposal.transforms().iter().all(Transform::is_supported));
        // The policy's own offer must negotiate against itself.
        let negotiated = negotiate(&[proposal], &[ike_policy()]).unwrap();
        assert_eq!(negotiated.proposal().transforms().len(), 4);
    }

    #[test]
    fn builder_requires_encryption() {
        let result = SaPolicy::builder(ProtocolId::IKE)
            .add_prf(TransformType::PRF_HMAC_SHA1)
            .add_integrity(TransformType::AUTH_HMAC_SHA1_96)
            .add_dh_group(TransformType::DH_1024_MODP)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_rejects_mixed_cipher_modes() {
        let result = SaPolicy::builder(ProtocolId::ESP)
            .add_encryption(TransformType::ENCR_AES_GCM_16, Some(256))
            .add_encryption(TransformType::ENCR_AES_CBC, Some(128))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_rejects_integrity_with_aead() {
        let result = SaPolicy::builder(ProtocolId::ESP)
            .add_encryption(TransformType::ENCR_AES_GCM_16, Some(256))
            .add_integrity(TransformType::AUTH_HMAC_SHA1_96)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_accepts_integrity_none_with_aead() {
        let policy = SaPolicy::builder(ProtocolId::ESP)
            .add_encryption(TransformType::ENCR_AES_GCM_16, Some(256))
            .add_integrity(TransformType::AUTH_NONE)
            .build()
            .unwrap();
        assert!(policy.uses_aead());
    }

    #[test]
    fn builder_rejects_integrity_none_with_normal_mode() {
        let result = SaPolicy::builder(ProtocolId::ESP)
            .add_encryption(TransformType::ENCR_AES_CBC, Some(128))
            .add_integrity(TransformType::AUTH_NONE)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_requires_integrity_for_normal_mode() {
        let result = SaPolicy::builder(ProtocolId::ESP)
            .add_encryption(TransformType::ENCR_AES_CBC, Some(128))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_requires_prf_and_dh_for_ike() {
        let missing_dh = SaPolicy::builder(ProtocolId::IKE)
            .add_encryption(TransformType::ENCR_AES_CBC, Some(128))
            .add_prf(TransformType::PRF_HMAC_SHA1)
            .add_integrity(TransformType::AUTH_HMAC_SHA1_96)
            .build();
        assert!(missing_dh.is_err());
        let dh_none = SaPolicy::builder(ProtocolId::IKE)
            .add_encryption(TransformType::ENCR_AES_CBC, Some(128))
            .add_prf(TransformType::PRF_HMAC_SHA1)
            .add_integrity(TransformType::AUTH_HMAC_SHA1_96)
            .add_dh_group(TransformType::DH_NONE)
            .build();
        assert!(dh_none.is_err());
    }

    #[test]
    fn builder_rejects_prf_for_esp() {
        let result = SaPolicy::builder(ProtocolId::ESP)
            .add_encryption(TransformType::ENCR_AES_CBC, Some(128))
            .add_integrity(TransformType::AUTH_HMAC_SHA1_96)
            .add_prf(TransformType::PRF_HMAC_SHA1)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_validates_key_lengths() {
        assert!(SaPolicy::builder(ProtocolId::IKE)
            .add_encryption(TransformType::ENCR_AES_CBC, None)
            .build()
            .is_err());
        assert!(SaPolicy::builder(ProtocolId::IKE)
            .add_encryption(TransformType::ENCR_AES_CBC, Some(144))
            .build()
            .is_err());
        assert!(SaPolicy::builder(ProtocolId::ESP)
            .add_encryption(TransformType::ENCR_3DES, Some(192))
            .build()
            .is_err());
    }
}
