// Key Derivation and Address Management
//
// Outputs are locked to the double-SHA-256 of a SEC1-compressed P-256
// public key. The human-readable form is BM1<base32><checksum>.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};

use super::hash::{Hash, sha256d};

pub const ADDRESS_BYTES: usize = 32;
pub const COMPRESSED_PUBKEY_BYTES: usize = 33;

/// Derives an output lock script (address) from a P-256 public key.
/// Rule: address = sha256d(SEC1 compressed public key)
pub fn derive_address(pk: &VerifyingKey) -> [u8; ADDRESS_BYTES] {
    let point = pk.to_encoded_point(true);
    sha256d(point.as_bytes()).0
}

/// Generate a fresh ECDSA/P-256 keypair.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let sk = SigningKey::random(&mut rand::rngs::OsRng);
    let vk = VerifyingKey::from(&sk);
    (sk, vk)
}

/// Sign a 32-byte digest. The resulting signature is DER-encoded for the
/// unlock script.
pub fn sign_digest(sk: &SigningKey, digest: &Hash) -> Vec<u8> {
    let sig: Signature = sk.sign(digest.as_bytes());
    sig.to_der().as_bytes().to_vec()
}

/// Verify a DER signature over a 32-byte digest against a SEC1 public key.
pub fn verify_digest(pubkey_sec1: &[u8], digest: &Hash, der_sig: &[u8]) -> bool {
    let Ok(vk) = VerifyingKey::from_sec1_bytes(pubkey_sec1) else {
        return false;
    };
    let Ok(sig) = Signature::from_der(der_sig) else {
        return false;
    };
    vk.verify(digest.as_bytes(), &sig).is_ok()
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("invalid address prefix: must start with BM1")]
    InvalidPrefix,
    #[error("invalid address encoding")]
    InvalidEncoding,
    #[error("invalid address length")]
    InvalidLength,
    #[error("invalid address checksum")]
    InvalidChecksum,
}

/// Encodes an address into the human-readable Base32 string
/// Format: BM1<base32_address><4-byte_checksum>
pub fn encode_address_string(addr: &[u8; ADDRESS_BYTES]) -> String {
    let b32 = data_encoding::BASE32_NOPAD.encode(addr);

    // Checksum: sha256d("BM1" + address_bytes)[0..4]
    let prefix = b"BM1";
    let mut payload = Vec::with_capacity(prefix.len() + addr.len());
    payload.extend_from_slice(prefix);
    payload.extend_from_slice(addr);

    let digest = sha256d(&payload);
    let checksum = data_encoding::BASE32_NOPAD.encode(&digest.0[0..4]);

    format!("BM1{}{}", b32, checksum)
}

/// Decodes a human-readable BM1 address back to raw bytes.
pub fn decode_address_string(s: &str) -> Result<[u8; ADDRESS_BYTES], AddressError> {
    if !s.starts_with("BM1") {
        return Err(AddressError::InvalidPrefix);
    }

    let body = &s[3..];
    // 32 bytes -> 52 base32 chars; 4 checksum bytes -> 7 chars
    if body.len() != 59 {
        return Err(AddressError::InvalidLength);
    }
    let (addr_part, check_part) = body.split_at(52);

    let raw = data_encoding::BASE32_NOPAD
        .decode(addr_part.as_bytes())
        .map_err(|_| AddressError::InvalidEncoding)?;
    let addr: [u8; ADDRESS_BYTES] = raw
        .try_into()
        .map_err(|_| AddressError::InvalidLength)?;

    let expect = encode_address_string(&addr);
    if &expect[3 + 52..] != check_part {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_address_is_stable() {
        let (_, vk) = generate_keypair();
        assert_eq!(derive_address(&vk), derive_address(&vk));
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let (sk, vk) = generate_keypair();
        let digest = sha256d(b"spend one antion");
        let sig = sign_digest(&sk, &digest);
        let pk_bytes = vk.to_encoded_point(true);
        assert!(verify_digest(pk_bytes.as_bytes(), &digest, &sig));

        let other = sha256d(b"spend two antion");
        assert!(!verify_digest(pk_bytes.as_bytes(), &other, &sig));
    }

    #[test]
    fn test_verify_rejects_garbage_key() {
        let digest = sha256d(b"x");
        assert!(!verify_digest(&[0u8; 33], &digest, &[0u8; 70]));
    }

    #[test]
    fn test_address_string_roundtrip() {
        let (_, vk) = generate_keypair();
        let addr = derive_address(&vk);
        let s = encode_address_string(&addr);
        assert!(s.starts_with("BM1"));
        assert_eq!(decode_address_string(&s).unwrap(), addr);
    }

    #[test]
    fn test_address_string_bad_checksum() {
        let (_, vk) = generate_keypair();
        let addr = derive_address(&vk);
        let mut s = encode_address_string(&addr);
        // Corrupt the final checksum character
        let last = s.pop().unwrap();
        s.push(if last == 'A' { 'B' } else { 'A' });
        assert!(matches!(
            decode_address_string(&s),
            Err(AddressError::InvalidChecksum)
        ));
    }

    #[test]
    fn test_address_string_bad_prefix() {
        assert!(matches!(
            decode_address_string("XX1AAAA"),
            Err(AddressError::InvalidPrefix)
        ));
    }
}
