use std::error::Error;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::RsaPublicKey;

use crate::cryptography::verify_digest;
use crate::keys::load_public_key;

/// Checks a base64 chunk digest against its base64 signature.
///
/// The digest is the SHA-512 of `iv || cipher` exactly as the sender logged
/// it; nothing is re-hashed from file content here.
pub fn check_signature(public_key: &RsaPublicKey, hash_b64: &str, signature_b64: &str) -> crate::Result<bool> {
    let hash = STANDARD.decode(hash_b64.trim())?;
    let signature = STANDARD.decode(signature_b64.trim())?;
    Ok(verify_digest(&hash, &signature, public_key))
}

pub async fn run(public_key_path: &Path, hash_b64: &str, signature_b64: &str) -> Result<(), Box<dyn Error>> {
    let public_key = load_public_key(public_key_path)?;

    if check_signature(&public_key, hash_b64, signature_b64)? {
        println!("Signature is valid.");
        println!("The digest was signed with the private key matching {}.", public_key_path.display());
        Ok(())
    } else {
        println!("Signature is NOT valid.");
        Err("hash, signature or public key do not match".into())
    }
}
