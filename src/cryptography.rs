//! Thin adapter over the RustCrypto primitives used by the protocol.
//!
//! - RSA PKCS#1 v1.5 for wrapping the session key and IV
//! - Triple-DES (EDE3) in CBC mode with PKCS#7 padding for chunk data
//! - SHA-512 digests, signed with RSA PKCS#1 v1.5

use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use des::TdesEde3;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha512};

use crate::error::{Error, Result};

type TdesCbcEnc = cbc::Encryptor<TdesEde3>;
type TdesCbcDec = cbc::Decryptor<TdesEde3>;

/// Fills a fixed-size buffer from the operating system's CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn rsa_encrypt(data: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>> {
    public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
        .map_err(Error::crypto)
}

pub fn rsa_decrypt(encrypted: &[u8], private_key: &RsaPrivateKey) -> Result<Vec<u8>> {
    private_key
        .decrypt(Pkcs1v15Encrypt, encrypted)
        .map_err(Error::crypto)
}

/// Encrypts `data` under the session key with an explicit IV.
///
/// The output is ciphertext only; the IV travels separately on the wire.
pub fn encrypt_chunk(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = TdesCbcEnc::new_from_slices(key, iv).map_err(Error::crypto)?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
}

pub fn decrypt_chunk(key: &[u8], iv: &[u8], encrypted: &[u8]) -> Result<Vec<u8>> {
    let cipher = TdesCbcDec::new_from_slices(key, iv).map_err(Error::crypto)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(encrypted)
        .map_err(|_| Error::crypto("invalid padding after decryption"))
}

/// SHA-512 of `data`.
pub fn digest(data: &[u8]) -> Vec<u8> {
    Sha512::digest(data).to_vec()
}

/// SHA-512 of `iv || cipher`, the value every chunk is signed over.
pub fn chunk_digest(iv: &[u8], cipher: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(iv);
    hasher.update(cipher);
    hasher.finalize().to_vec()
}

/// Signs a digest produced by [`digest`].
///
/// The digest is itself hashed once more with SHA-512 inside the
/// PKCS#1 v1.5 signature, so verifiers must go through [`verify_digest`].
pub fn sign_digest(data_digest: &[u8], private_key: &RsaPrivateKey) -> Result<Vec<u8>> {
    let hashed = Sha512::digest(data_digest);
    private_key
        .sign(Pkcs1v15Sign::new::<Sha512>(), &hashed)
        .map_err(Error::crypto)
}

pub fn verify_digest(data_digest: &[u8], signature: &[u8], public_key: &RsaPublicKey) -> bool {
    let hashed = Sha512::digest(data_digest);
    public_key
        .verify(Pkcs1v15Sign::new::<Sha512>(), &hashed, signature)
        .is_ok()
}
