//! RSA key material: PEM loading, generation and the per-role key sets.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::{Error, Result};

/// Keys held by the sending side.
#[derive(Clone)]
pub struct SenderKeys {
    /// Signs metadata and chunk digests.
    pub private_key: RsaPrivateKey,
    /// Wraps the session key and IV.
    pub receiver_public: RsaPublicKey,
}

/// Keys held by the receiving side.
#[derive(Clone)]
pub struct ReceiverKeys {
    /// Unwraps the session key and IV.
    pub private_key: RsaPrivateKey,
    /// Verifies every signature the sender produces.
    pub sender_public: RsaPublicKey,
}

impl SenderKeys {
    pub fn load(private_key_path: &Path, receiver_public_path: &Path) -> Result<Self> {
        Ok(SenderKeys {
            private_key: load_private_key(private_key_path)?,
            receiver_public: load_public_key(receiver_public_path)?,
        })
    }
}

impl ReceiverKeys {
    pub fn load(private_key_path: &Path, sender_public_path: &Path) -> Result<Self> {
        Ok(ReceiverKeys {
            private_key: load_private_key(private_key_path)?,
            sender_public: load_public_key(sender_public_path)?,
        })
    }
}

/// Reads a private key in PKCS#8 or PKCS#1 PEM form.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = fs::read_to_string(path)?;
    let key = RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| Error::key(format!("{}: {}", path.display(), e)))?;
    debug!("Loaded private key from {}", path.display());
    Ok(key)
}

/// Reads a public key in SPKI or PKCS#1 PEM form.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = fs::read_to_string(path)?;
    let key = RsaPublicKey::from_public_key_pem(&pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
        .map_err(|e| Error::key(format!("{}: {}", path.display(), e)))?;
    debug!("Loaded public key from {}", path.display());
    Ok(key)
}

pub fn generate_private_key(bits: usize) -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, bits).map_err(Error::key)
}

/// Generates a key pair and writes `<role>_private_key.pem` and
/// `<role>_public_key.pem` into `out_dir`.
///
/// Returns the paths of the private and public key files.
pub fn generate_key_files(out_dir: &Path, role: &str, bits: usize) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(out_dir)?;
    let private_key = generate_private_key(bits)?;

    let private_path = out_dir.join(format!("{}_private_key.pem", role));
    let public_path = out_dir.join(format!("{}_public_key.pem", role));

    let private_pem = private_key.to_pkcs8_pem(LineEnding::LF).map_err(Error::key)?;
    fs::write(&private_path, private_pem.as_bytes())?;

    let public_pem = private_key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(Error::key)?;
    fs::write(&public_path, public_pem.as_bytes())?;

    info!("Generated {}-bit key pair in {}", bits, out_dir.display());
    Ok((private_path, public_path))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_load_key_files() {
        let temp_dir = std::env::temp_dir().join(format!("test_sigtrans_keys_{}", std::process::id()));

        let (private_path, public_path) =
            generate_key_files(&temp_dir, "receiver", 1024).expect("Should write key files");
        assert!(private_path.ends_with("receiver_private_key.pem"));
        assert!(public_path.ends_with("receiver_public_key.pem"));

        let private_key = load_private_key(&private_path).expect("Should load private key");
        let public_key = load_public_key(&public_path).expect("Should load public key");
        assert_eq!(private_key.to_public_key(), public_key);

        // Cleanup
        let _ = fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_load_pkcs1_private_key() {
        use rsa::pkcs1::EncodeRsaPrivateKey;

        let temp_file = std::env::temp_dir().join(format!("test_sigtrans_pkcs1_{}.pem", std::process::id()));
        let key = test_support::key_pair();
        let pem = key.to_pkcs1_pem(LineEnding::LF).unwrap();
        fs::write(&temp_file, pem.as_bytes()).unwrap();

        let loaded = load_private_key(&temp_file).expect("Should accept PKCS#1 PEM");
        assert_eq!(&loaded, key);

        // Cleanup
        let _ = fs::remove_file(&temp_file);
    }

    #[test]
    fn test_load_garbage_fails() {
        let temp_file = std::env::temp_dir().join(format!("test_sigtrans_garbage_{}.pem", std::process::id()));
        fs::write(&temp_file, "not a key").unwrap();

        assert!(matches!(load_public_key(&temp_file), Err(Error::Key { .. })));
        assert!(matches!(load_private_key(&temp_file), Err(Error::Key { .. })));

        let _ = fs::remove_file(&temp_file);
    }
}
