//! Local development engine standing in for the external FHE gateway and key management.
//!
//! SECURITY NOTE (prototype): this is an additively masked value with Poseidon MACs, keyed by a
//! single secret shared by the gateway, the verifier and the ledger. It exercises the same
//! protocol shape as a real FHE deployment (handles, input proofs, decryption proofs) but it is
//! not homomorphic and not a threshold scheme. Never point it at real funds.

use crate::constants::{
    poseidon_config, DOMAIN_DECRYPT, DOMAIN_HANDLE, DOMAIN_INPUT, DOMAIN_KEY, DOMAIN_MASK,
};
use crate::error::EngineError;
use crate::types::{Ciphertext, CiphertextHandle, ContractAddress, EncryptedInput, MemberAddress};
use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::{PoseidonConfig, PoseidonSponge};
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_ff::{BigInteger, PrimeField};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Byte length of one compressed field element.
const FR_BYTES: usize = 32;

pub struct LocalFheEngine {
    key: Fr,
    poseidon: PoseidonConfig<Fr>,
}

impl LocalFheEngine {
    /// Derive the engine key from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let mut rng = ChaCha20Rng::from_seed(seed);
        let mut key_bytes = [0u8; 64];
        rng.fill_bytes(&mut key_bytes);

        let poseidon = poseidon_config();
        let raw = Fr::from_le_bytes_mod_order(&key_bytes);
        let key = hash_with(&poseidon, DOMAIN_KEY, &[raw]);
        Self { key, poseidon }
    }

    /// Encrypt `amount` for `owner` under `contract`, drawing the nonce from `rng`.
    pub fn encrypt(
        &self,
        rng: &mut impl RngCore,
        contract: &ContractAddress,
        owner: &MemberAddress,
        amount: u64,
    ) -> Result<EncryptedInput, EngineError> {
        let mut nonce_bytes = [0u8; 64];
        rng.fill_bytes(&mut nonce_bytes);
        let nonce = Fr::from_le_bytes_mod_order(&nonce_bytes);

        let masked = Fr::from(amount) + self.mask(nonce);
        let handle = self.handle_fr(masked, nonce, contract, owner);
        let proof = self.input_mac(handle, masked, nonce, contract, owner);

        let mut bytes = Vec::with_capacity(2 * FR_BYTES);
        bytes.extend(fr_to_bytes(&masked)?);
        bytes.extend(fr_to_bytes(&nonce)?);

        Ok(EncryptedInput {
            ciphertext: Ciphertext {
                handle: CiphertextHandle::new(hex::encode(fr_to_bytes(&handle)?)),
                bytes,
            },
            proof: fr_to_bytes(&proof)?,
        })
    }

    /// Check that `input` was produced for exactly this (contract, owner) pair.
    pub fn verify_input(&self, contract: &ContractAddress, owner: &MemberAddress, input: &EncryptedInput) -> bool {
        let Ok((masked, nonce)) = split_ciphertext(&input.ciphertext.bytes) else {
            return false;
        };
        let Ok(claimed_handle) = handle_to_fr(&input.ciphertext.handle) else {
            return false;
        };
        let Ok(claimed_proof) = fr_from_bytes(&input.proof) else {
            return false;
        };

        let handle = self.handle_fr(masked, nonce, contract, owner);
        handle == claimed_handle && self.input_mac(handle, masked, nonce, contract, owner) == claimed_proof
    }

    /// Recover the clear amount of a ciphertext.
    pub fn decrypt(&self, ciphertext_bytes: &[u8]) -> Result<u64, EngineError> {
        let (masked, nonce) = split_ciphertext(ciphertext_bytes)?;
        fr_to_u64(masked - self.mask(nonce))
    }

    /// Prove that `clear_values[i]` is the plaintext of `handles[i]` under `contract`.
    pub fn prove_decryption(
        &self,
        contract: &ContractAddress,
        handles: &[CiphertextHandle],
        clear_values: &[u64],
    ) -> Result<Vec<u8>, EngineError> {
        let tag = self.decryption_tag(contract, handles, clear_values)?;
        fr_to_bytes(&tag)
    }

    pub fn verify_decryption(
        &self,
        contract: &ContractAddress,
        handles: &[CiphertextHandle],
        clear_values: &[u64],
        proof: &[u8],
    ) -> bool {
        if handles.len() != clear_values.len() {
            return false;
        }
        let Ok(claimed) = fr_from_bytes(proof) else {
            return false;
        };
        matches!(self.decryption_tag(contract, handles, clear_values), Ok(tag) if tag == claimed)
    }

    fn mask(&self, nonce: Fr) -> Fr {
        self.hash(DOMAIN_MASK, &[self.key, nonce])
    }

    fn handle_fr(&self, masked: Fr, nonce: Fr, contract: &ContractAddress, owner: &MemberAddress) -> Fr {
        self.hash(
            DOMAIN_HANDLE,
            &[masked, nonce, str_to_fr(contract.as_str()), str_to_fr(owner.as_str())],
        )
    }

    fn input_mac(&self, handle: Fr, masked: Fr, nonce: Fr, contract: &ContractAddress, owner: &MemberAddress) -> Fr {
        self.hash(
            DOMAIN_INPUT,
            &[
                self.key,
                handle,
                masked,
                nonce,
                str_to_fr(contract.as_str()),
                str_to_fr(owner.as_str()),
            ],
        )
    }

    fn decryption_tag(
        &self,
        contract: &ContractAddress,
        handles: &[CiphertextHandle],
        clear_values: &[u64],
    ) -> Result<Fr, EngineError> {
        let mut inputs = Vec::with_capacity(2 + handles.len() + clear_values.len());
        inputs.push(self.key);
        inputs.push(str_to_fr(contract.as_str()));
        for h in handles {
            inputs.push(handle_to_fr(h)?);
        }
        inputs.extend(clear_values.iter().map(|v| Fr::from(*v)));
        Ok(self.hash(DOMAIN_DECRYPT, &inputs))
    }

    fn hash(&self, domain: u64, inputs: &[Fr]) -> Fr {
        hash_with(&self.poseidon, domain, inputs)
    }
}

fn hash_with(cfg: &PoseidonConfig<Fr>, domain: u64, inputs: &[Fr]) -> Fr {
    let mut sponge = PoseidonSponge::<Fr>::new(cfg);
    sponge.absorb(&Fr::from(domain));
    sponge.absorb(&inputs.to_vec());
    sponge.squeeze_field_elements::<Fr>(1)[0]
}

fn str_to_fr(s: &str) -> Fr {
    Fr::from_le_bytes_mod_order(s.to_ascii_lowercase().as_bytes())
}

fn fr_to_bytes(x: &Fr) -> Result<Vec<u8>, EngineError> {
    let mut out = Vec::with_capacity(FR_BYTES);
    x.serialize_compressed(&mut out)
        .map_err(|e| EngineError::Serialization(format!("{e}")))?;
    Ok(out)
}

fn fr_from_bytes(bytes: &[u8]) -> Result<Fr, EngineError> {
    if bytes.len() != FR_BYTES {
        return Err(EngineError::Serialization(format!("expected {FR_BYTES} bytes, got {}", bytes.len())));
    }
    Fr::deserialize_compressed(bytes).map_err(|e| EngineError::Serialization(format!("{e}")))
}

fn handle_to_fr(handle: &CiphertextHandle) -> Result<Fr, EngineError> {
    let bytes = hex::decode(handle.as_str()).map_err(|e| EngineError::Serialization(format!("invalid handle hex: {e}")))?;
    fr_from_bytes(&bytes)
}

fn split_ciphertext(bytes: &[u8]) -> Result<(Fr, Fr), EngineError> {
    if bytes.len() != 2 * FR_BYTES {
        return Err(EngineError::MalformedCiphertext(format!(
            "expected {} bytes, got {}",
            2 * FR_BYTES,
            bytes.len()
        )));
    }
    let (masked, nonce) = bytes.split_at(FR_BYTES);
    let masked = fr_from_bytes(masked).map_err(|e| EngineError::MalformedCiphertext(e.to_string()))?;
    let nonce = fr_from_bytes(nonce).map_err(|e| EngineError::MalformedCiphertext(e.to_string()))?;
    Ok((masked, nonce))
}

fn fr_to_u64(x: Fr) -> Result<u64, EngineError> {
    let bytes = x.into_bigint().to_bytes_le();
    if bytes[8..].iter().any(|b| *b != 0) {
        return Err(EngineError::ValueOutOfRange);
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&bytes[..8]);
    Ok(u64::from_le_bytes(low))
}
