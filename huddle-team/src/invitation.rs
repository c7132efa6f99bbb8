// SPDX-License-Identifier: MIT OR Apache-2.0

//! Invitations: a shared low-entropy seed is stretched into a single-use
//! signing keypair. The inviter posts the public half with a sealed payload;
//! the invitee later proves knowledge of the seed by signing their own
//! public info with the derived secret.
use huddle_core::cbor::{decode_cbor, encode_cbor, DecodeError, EncodeError};
use huddle_core::{Keyset, PublicDevice};
use huddle_crypto::aead::{aead_decrypt, aead_encrypt, AeadError};
use huddle_crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use huddle_crypto::kdf::{stretch, KdfError};
use huddle_crypto::{domain_hash, Hash, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::member::{InvitationType, Member, PostedInvitation};

const INVITATION_ID_DOMAIN: &str = "invitation_id";
const INVITATION_SIGNING_DOMAIN: &str = "huddle/invitation/signing";

/// Normalize a human-entered seed: lowercase, alphanumeric only.
pub fn normalize(seed: &str) -> String {
    seed.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Derive the single-use signing keypair from a seed. Both the inviter and
/// the invitee run this, so it must be fully deterministic.
pub fn derive_signing_key(seed: &str) -> Result<SigningKey, InvitationError> {
    let material = stretch(normalize(seed).as_bytes())?;
    let signing_seed: [u8; 32] = domain_hash(INVITATION_SIGNING_DOMAIN, material).into();
    Ok(SigningKey::from_bytes(signing_seed))
}

/// The invitation id is derived from the public signing key, so the invitee
/// can recompute it from the seed alone.
pub fn invitation_id(key: &VerifyingKey) -> Hash {
    domain_hash(INVITATION_ID_DOMAIN, key.as_bytes())
}

/// The sealed body of a posted invitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationPayload {
    pub invitation_type: InvitationType,
    /// The invited user name, or the device id for device invitations.
    pub name: String,
    pub signing_key: VerifyingKey,
    pub roles: Vec<String>,
    pub expiration: u64,
    pub max_uses: u32,
}

/// Parameters for creating an invitation.
#[derive(Debug, Clone)]
pub struct InvitationParams {
    pub invitation_type: InvitationType,
    pub name: String,
    pub seed: String,
    pub roles: Vec<String>,
    /// Milliseconds since the Unix epoch; `0` means no expiry.
    pub expiration: u64,
    /// `0` means unlimited uses.
    pub max_uses: u32,
}

/// Build a postable invitation: derive the keypair from the seed and seal
/// the payload under the team key.
pub fn create(
    team_keys: &Keyset,
    params: InvitationParams,
    rng: &Rng,
) -> Result<PostedInvitation, InvitationError> {
    let signing = derive_signing_key(&params.seed)?;
    let signing_key = signing.verifying_key();

    let payload = InvitationPayload {
        invitation_type: params.invitation_type,
        name: params.name,
        signing_key,
        roles: params.roles,
        expiration: params.expiration,
        max_uses: params.max_uses,
    };
    let ciphertext = aead_encrypt(&team_keys.aead_key(), &encode_cbor(&payload)?, None, rng)?;

    Ok(PostedInvitation {
        id: invitation_id(&signing_key),
        ciphertext,
        signing_key,
        invitation_type: params.invitation_type,
        max_uses: params.max_uses,
        expiration: params.expiration,
        revoked: false,
        uses: 0,
    })
}

/// The principal an invitee presents for admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ProofPayload {
    Member(Member),
    Device(PublicDevice),
}

impl ProofPayload {
    /// The user name or device id the proof binds.
    pub fn name(&self) -> &str {
        match self {
            ProofPayload::Member(member) => &member.user_name,
            ProofPayload::Device(device) => &device.device_id,
        }
    }

    pub fn invitation_type(&self) -> InvitationType {
        match self {
            ProofPayload::Member(_) => InvitationType::Member,
            ProofPayload::Device(_) => InvitationType::Device,
        }
    }
}

/// Proof of knowledge of an invitation seed, binding the invitee's public
/// info under the derived signing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofOfInvitation {
    pub id: Hash,
    pub payload: ProofPayload,
    pub signature: Signature,
}

impl ProofOfInvitation {
    /// Verify the signature against a derived public signing key.
    pub fn verify(&self, signing_key: &VerifyingKey) -> Result<(), InvitationError> {
        let bytes = encode_cbor(&self.payload)?;
        signing_key
            .verify(&bytes, &self.signature)
            .map_err(|_| InvitationError::BadSignature(self.id))
    }
}

/// Generate a proof from the seed and the invitee's public info.
pub fn accept(seed: &str, payload: ProofPayload) -> Result<ProofOfInvitation, InvitationError> {
    let signing = derive_signing_key(seed)?;
    let id = invitation_id(&signing.verifying_key());
    let signature = signing.sign(&encode_cbor(&payload)?);

    Ok(ProofOfInvitation {
        id,
        payload,
        signature,
    })
}

/// Validate a proof against a posted invitation.
///
/// With the team keys at hand the sealed payload is opened and the invited
/// name compared against the proof; without them (the pure reducer path)
/// the check stops at revocation, use count, expiry and the signature.
pub fn validate_proof(
    proof: &ProofOfInvitation,
    posted: &PostedInvitation,
    team_keys: Option<&Keyset>,
    now: u64,
) -> Result<(), InvitationError> {
    if proof.id != posted.id {
        return Err(InvitationError::NotFound(proof.id));
    }
    if posted.revoked {
        return Err(InvitationError::Revoked(posted.id));
    }
    if posted.max_uses > 0 && posted.uses >= posted.max_uses {
        return Err(InvitationError::Used(posted.id));
    }
    if posted.expiration > 0 && now > posted.expiration {
        return Err(InvitationError::Expired(posted.id));
    }

    proof.verify(&posted.signing_key)?;

    if let Some(team_keys) = team_keys {
        let payload_bytes = aead_decrypt(&team_keys.aead_key(), &posted.ciphertext, None)
            .map_err(|_| InvitationError::DecryptionFailed(posted.id))?;
        let payload: InvitationPayload = decode_cbor(&payload_bytes)?;
        if payload.name != proof.payload.name() {
            return Err(InvitationError::NameMismatch {
                id: posted.id,
                expected: payload.name,
                actual: proof.payload.name().to_string(),
            });
        }
    }

    Ok(())
}

/// Open the sealed payload of a posted invitation.
pub fn open_payload(
    posted: &PostedInvitation,
    team_keys: &Keyset,
) -> Result<InvitationPayload, InvitationError> {
    let bytes = aead_decrypt(&team_keys.aead_key(), &posted.ciphertext, None)
        .map_err(|_| InvitationError::DecryptionFailed(posted.id))?;
    Ok(decode_cbor(&bytes)?)
}

#[derive(Debug, Error)]
pub enum InvitationError {
    #[error(transparent)]
    Kdf(#[from] KdfError),

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("no invitation posted under id {0}")]
    NotFound(Hash),

    #[error("invitation {0} has been revoked")]
    Revoked(Hash),

    #[error("invitation {0} has already been used")]
    Used(Hash),

    #[error("invitation {0} has expired")]
    Expired(Hash),

    #[error("proof signature for invitation {0} does not verify")]
    BadSignature(Hash),

    #[error("invitation {id} was issued for {expected}, proof names {actual}")]
    NameMismatch {
        id: Hash,
        expected: String,
        actual: String,
    },

    #[error("invitation {0} payload could not be decrypted with the team keys")]
    DecryptionFailed(Hash),
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use huddle_core::{KeyScope, Keyset};
    use huddle_crypto::Rng;

    use crate::member::{InvitationType, Member};

    use super::{
        accept, create, normalize, validate_proof, InvitationError, InvitationParams, ProofPayload,
    };

    fn member(rng: &Rng, user_name: &str) -> Member {
        Member {
            user_name: user_name.to_string(),
            keys: Keyset::generate(KeyScope::Member, user_name, rng)
                .unwrap()
                .public(),
            roles: BTreeSet::new(),
            devices: BTreeMap::new(),
        }
    }

    fn params(name: &str, seed: &str) -> InvitationParams {
        InvitationParams {
            invitation_type: InvitationType::Member,
            name: name.to_string(),
            seed: seed.to_string(),
            roles: vec![],
            expiration: 0,
            max_uses: 1,
        }
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize("AbCd-EfGh 12!34"), "abcdefgh1234");
    }

    #[test]
    fn accept_with_matching_seed_validates() {
        let rng = Rng::from_seed([1; 32]);
        let team_keys = Keyset::generate(KeyScope::Team, "t", &rng).unwrap();

        let posted = create(&team_keys, params("bob", "abcd-efgh-ijkl-mnop"), &rng).unwrap();
        let proof = accept(
            "ABCD EFGH IJKL MNOP",
            ProofPayload::Member(member(&rng, "bob")),
        )
        .unwrap();

        // Seed normalization makes the differently-formatted seeds equal.
        assert_eq!(proof.id, posted.id);
        assert!(validate_proof(&proof, &posted, Some(&team_keys), 0).is_ok());
    }

    #[test]
    fn wrong_seed_fails_signature_check() {
        let rng = Rng::from_seed([1; 32]);
        let team_keys = Keyset::generate(KeyScope::Team, "t", &rng).unwrap();

        let posted = create(&team_keys, params("bob", "abcd-efgh"), &rng).unwrap();
        let mut proof = accept("wrong-seed", ProofPayload::Member(member(&rng, "bob"))).unwrap();
        proof.id = posted.id;

        assert!(matches!(
            validate_proof(&proof, &posted, Some(&team_keys), 0),
            Err(InvitationError::BadSignature(_))
        ));
    }

    #[test]
    fn name_swap_is_caught() {
        let rng = Rng::from_seed([1; 32]);
        let team_keys = Keyset::generate(KeyScope::Team, "t", &rng).unwrap();

        // Invitation is for Bob, but Eve learned the seed and presents
        // herself.
        let posted = create(&team_keys, params("bob", "abcd-efgh"), &rng).unwrap();
        let proof = accept("abcd-efgh", ProofPayload::Member(member(&rng, "eve"))).unwrap();

        assert!(matches!(
            validate_proof(&proof, &posted, Some(&team_keys), 0),
            Err(InvitationError::NameMismatch { .. })
        ));
    }

    #[test]
    fn revoked_used_and_expired() {
        let rng = Rng::from_seed([1; 32]);
        let team_keys = Keyset::generate(KeyScope::Team, "t", &rng).unwrap();
        let proof = accept("abcd-efgh", ProofPayload::Member(member(&rng, "bob"))).unwrap();

        let posted = create(&team_keys, params("bob", "abcd-efgh"), &rng).unwrap();

        let mut revoked = posted.clone();
        revoked.revoked = true;
        assert!(matches!(
            validate_proof(&proof, &revoked, None, 0),
            Err(InvitationError::Revoked(_))
        ));

        let mut used = posted.clone();
        used.uses = 1;
        assert!(matches!(
            validate_proof(&proof, &used, None, 0),
            Err(InvitationError::Used(_))
        ));

        let mut expiring = posted.clone();
        expiring.expiration = 100;
        assert!(validate_proof(&proof, &expiring, None, 99).is_ok());
        assert!(matches!(
            validate_proof(&proof, &expiring, None, 101),
            Err(InvitationError::Expired(_))
        ));
    }
}
