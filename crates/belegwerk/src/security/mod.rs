//! Field-level encryption service.
//!
//! A 32-byte master key lives in a 0600 file next to an encrypted backup
//! (PBKDF2-SHA256, 100k iterations, AES-256-CBC, per-file random salt and
//! IV). Fields are sealed with AES-256-GCM into the `{e, i, a}` hex envelope;
//! that envelope format is stable and must stay bit-compatible.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use zeroize::Zeroizing;

use crate::config::SecurityConfig;
use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_LEN: usize = 32;
const GCM_NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const CBC_IV_LEN: usize = 16;
const SALT_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Field envelope: ciphertext, IV/nonce, auth tag — all hex.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldCiphertext {
    pub e: String,
    pub i: String,
    pub a: String,
}

pub struct EncryptionService {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl EncryptionService {
    /// Load the master key from the key file, or generate one and persist it
    /// together with its passphrase-encrypted backup.
    pub fn load_or_create(config: &SecurityConfig, backup_passphrase: &str) -> Result<Self> {
        if config.key_file.exists() {
            let bytes = std::fs::read(&config.key_file)
                .map_err(|e| Error::Permanent(format!("key file read: {e}")))?;
            if bytes.len() != KEY_LEN {
                return Err(Error::Permanent(format!(
                    "key file has {} bytes, expected {KEY_LEN}",
                    bytes.len()
                )));
            }
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&bytes);
            return Ok(Self {
                key: Zeroizing::new(key),
            });
        }

        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);

        write_key_file(&config.key_file, &key)?;
        write_backup(&config.key_backup_file, &key, backup_passphrase)?;
        tracing::info!(path = %config.key_file.display(), "generated new master key");

        Ok(Self {
            key: Zeroizing::new(key),
        })
    }

    /// Recover the master key from the encrypted backup.
    pub fn restore_from_backup(backup_path: &Path, passphrase: &str) -> Result<Self> {
        let blob = std::fs::read(backup_path)
            .map_err(|e| Error::Permanent(format!("backup read: {e}")))?;
        if blob.len() < SALT_LEN + CBC_IV_LEN + 1 {
            return Err(Error::Permanent("backup file too short".into()));
        }

        let (salt, rest) = blob.split_at(SALT_LEN);
        let (iv, ciphertext) = rest.split_at(CBC_IV_LEN);

        let derived = derive_backup_key(passphrase, salt);
        let decryptor = Aes256CbcDec::new_from_slices(derived.as_slice(), iv)
            .map_err(|e| Error::Permanent(format!("backup cipher: {e}")))?;
        let plaintext = decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::Permanent("backup decryption failed (wrong passphrase?)".into()))?;

        if plaintext.len() != KEY_LEN {
            return Err(Error::Permanent("backup holds an invalid key".into()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&plaintext);
        Ok(Self {
            key: Zeroizing::new(key),
        })
    }

    /// Seal a field value into the `{e, i, a}` envelope.
    pub fn encrypt_field(&self, plaintext: &str) -> Result<FieldCiphertext> {
        let cipher = Aes256Gcm::new_from_slice(self.key.as_slice())
            .map_err(|e| Error::Permanent(format!("gcm key: {e}")))?;

        let mut nonce_bytes = [0u8; GCM_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &[],
                },
            )
            .map_err(|_| Error::Permanent("field encryption failed".into()))?;

        // aes-gcm appends the tag; the envelope stores it separately.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - GCM_TAG_LEN);
        Ok(FieldCiphertext {
            e: hex::encode(ciphertext),
            i: hex::encode(nonce_bytes),
            a: hex::encode(tag),
        })
    }

    /// Open an `{e, i, a}` envelope.
    pub fn decrypt_field(&self, envelope: &FieldCiphertext) -> Result<String> {
        let ciphertext =
            hex::decode(&envelope.e).map_err(|e| Error::Permanent(format!("envelope e: {e}")))?;
        let nonce_bytes =
            hex::decode(&envelope.i).map_err(|e| Error::Permanent(format!("envelope i: {e}")))?;
        let tag =
            hex::decode(&envelope.a).map_err(|e| Error::Permanent(format!("envelope a: {e}")))?;

        if nonce_bytes.len() != GCM_NONCE_LEN {
            return Err(Error::Permanent("envelope nonce length invalid".into()));
        }
        if tag.len() != GCM_TAG_LEN {
            return Err(Error::Permanent("envelope tag length invalid".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(self.key.as_slice())
            .map_err(|e| Error::Permanent(format!("gcm key: {e}")))?;

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &sealed,
                    aad: &[],
                },
            )
            .map_err(|_| Error::Permanent("field decryption failed".into()))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Permanent(format!("decrypted field is not UTF-8: {e}")))
    }

    /// Rotate the master key: decrypt the supplied envelopes under the old
    /// key, generate and persist a new key, and return the re-encrypted
    /// envelopes. Callers are responsible for writing them back.
    pub fn rotate(
        &mut self,
        config: &SecurityConfig,
        backup_passphrase: &str,
        envelopes: &[FieldCiphertext],
    ) -> Result<Vec<FieldCiphertext>> {
        let plaintexts: Vec<String> = envelopes
            .iter()
            .map(|envelope| self.decrypt_field(envelope))
            .collect::<Result<_>>()?;

        let mut new_key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut new_key);
        write_key_file(&config.key_file, &new_key)?;
        write_backup(&config.key_backup_file, &new_key, backup_passphrase)?;
        self.key = Zeroizing::new(new_key);

        plaintexts
            .iter()
            .map(|plaintext| self.encrypt_field(plaintext))
            .collect()
    }
}

fn derive_backup_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut derived = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        salt,
        PBKDF2_ITERATIONS,
        derived.as_mut(),
    );
    derived
}

fn write_key_file(path: &Path, key: &[u8; KEY_LEN]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::write(path, key).map_err(|e| Error::Permanent(format!("key file write: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Permanent(format!("key file permissions: {e}")))?;
    }
    Ok(())
}

/// Backup layout: `salt(16) || iv(16) || AES-256-CBC(key)`.
fn write_backup(path: &Path, key: &[u8; KEY_LEN], passphrase: &str) -> Result<()> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; CBC_IV_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);

    let derived = derive_backup_key(passphrase, &salt);
    let encryptor = Aes256CbcEnc::new_from_slices(derived.as_slice(), &iv)
        .map_err(|e| Error::Permanent(format!("backup cipher: {e}")))?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(key);

    let mut blob = Vec::with_capacity(SALT_LEN + CBC_IV_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::write(path, blob).map_err(|e| Error::Permanent(format!("backup write: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Permanent(format!("backup permissions: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> SecurityConfig {
        SecurityConfig {
            key_file: dir.path().join("master.key"),
            key_backup_file: dir.path().join("master.key.enc"),
        }
    }

    #[test]
    fn field_round_trip() {
        let dir = TempDir::new().unwrap();
        let service = EncryptionService::load_or_create(&config(&dir), "passphrase").unwrap();

        for value in ["", "kurz", "Ein längerer Text mit Umlauten: äöüß", "{\"json\":1}"] {
            let envelope = service.encrypt_field(value).unwrap();
            assert_eq!(service.decrypt_field(&envelope).unwrap(), value);
        }
    }

    #[test]
    fn envelope_fields_are_hex_with_expected_lengths() {
        let dir = TempDir::new().unwrap();
        let service = EncryptionService::load_or_create(&config(&dir), "passphrase").unwrap();

        let envelope = service.encrypt_field("inhalt").unwrap();
        assert_eq!(envelope.i.len(), GCM_NONCE_LEN * 2);
        assert_eq!(envelope.a.len(), GCM_TAG_LEN * 2);
        assert!(hex::decode(&envelope.e).is_ok());
    }

    #[test]
    fn key_persists_across_loads() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);

        let first = EncryptionService::load_or_create(&cfg, "passphrase").unwrap();
        let envelope = first.encrypt_field("bleibt lesbar").unwrap();

        let second = EncryptionService::load_or_create(&cfg, "passphrase").unwrap();
        assert_eq!(second.decrypt_field(&envelope).unwrap(), "bleibt lesbar");
    }

    #[test]
    fn backup_restores_the_same_key() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);

        let service = EncryptionService::load_or_create(&cfg, "geheim").unwrap();
        let envelope = service.encrypt_field("wiederherstellbar").unwrap();

        let restored =
            EncryptionService::restore_from_backup(&cfg.key_backup_file, "geheim").unwrap();
        assert_eq!(
            restored.decrypt_field(&envelope).unwrap(),
            "wiederherstellbar"
        );

        assert!(
            EncryptionService::restore_from_backup(&cfg.key_backup_file, "falsch").is_err()
        );
    }

    #[test]
    fn rotation_reencrypts_envelopes() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);

        let mut service = EncryptionService::load_or_create(&cfg, "passphrase").unwrap();
        let old = service.encrypt_field("rotierter Inhalt").unwrap();

        let rotated = service.rotate(&cfg, "passphrase", &[old.clone()]).unwrap();
        assert_eq!(rotated.len(), 1);
        assert_eq!(service.decrypt_field(&rotated[0]).unwrap(), "rotierter Inhalt");
        // The old envelope no longer opens under the new key.
        assert!(service.decrypt_field(&old).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        EncryptionService::load_or_create(&cfg, "passphrase").unwrap();

        let mode = std::fs::metadata(&cfg.key_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
