//! 凭证保险库 - webhook URL 等敏感配置的静态加密
//!
//! AES-256-GCM 对称加密，密钥文件仅属主可读写 (0600)。
//! 密文格式: `enc1:` + base64(nonce || ciphertext)，前缀用于识别已加密值，
//! 便于迁移期间混用明文与密文。

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// 密文前缀（版本标记）
pub const CIPHERTEXT_PREFIX: &str = "enc1:";

/// 解密失败 - 错误信息保持笼统，绝不泄漏明文或密钥内容
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Decryption failed: invalid ciphertext or wrong key")]
    Decryption,
    #[error("Failed to access key file: {0}")]
    KeyFile(String),
}

/// 凭证保险库
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// 加载已有密钥文件，不存在则生成新密钥（0600 权限）
    pub fn get_or_create(key_path: impl AsRef<Path>) -> Result<Self> {
        let key_path = key_path.as_ref();

        if key_path.exists() {
            validate_key_permissions(key_path);
            let encoded = fs::read_to_string(key_path)
                .with_context(|| format!("Failed to read key file: {}", key_path.display()))?;
            let key_bytes = BASE64
                .decode(encoded.trim())
                .context("Key file is not valid base64")?;
            return Self::from_key_bytes(&key_bytes);
        }

        let key_bytes = generate_key_bytes();
        write_key_file(key_path, &key_bytes)?;
        Self::from_key_bytes(&key_bytes)
    }

    /// 从原始密钥字节构造（必须 32 字节）
    pub fn from_key_bytes(key_bytes: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key_bytes)
            .map_err(|_| anyhow::anyhow!("Key must be {} bytes", KEY_SIZE))?;
        Ok(Self { cipher })
    }

    /// 默认密钥路径: ~/.claude/state/encryption.key
    pub fn default_key_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
            .join("state")
            .join("encryption.key")
    }

    /// 加密字符串。每次调用使用新 nonce，相同明文产生不同密文。
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("Encryption failed"))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", CIPHERTEXT_PREFIX, BASE64.encode(combined)))
    }

    /// 解密。密钥不对、数据损坏、格式错误都返回同样的笼统错误。
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let encoded = ciphertext
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or(VaultError::Decryption)?;

        let combined = BASE64.decode(encoded).map_err(|_| VaultError::Decryption)?;
        if combined.len() < NONCE_SIZE {
            return Err(VaultError::Decryption);
        }

        let (nonce_bytes, payload) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, payload)
            .map_err(|_| VaultError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::Decryption)
    }
}

/// 值是否已加密（前缀启发式，迁移期间区分明文/密文）
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(CIPHERTEXT_PREFIX)
}

/// 密钥轮换：在 new_key_path 生成新密钥，旧密钥文件保持不动。
/// 调用方必须用 [`reencrypt`] 重加密所有密文并验证后，才能删除旧密钥。
pub fn rotate_key(new_key_path: impl AsRef<Path>) -> Result<Vault> {
    let key_bytes = generate_key_bytes();
    write_key_file(new_key_path.as_ref(), &key_bytes)?;
    Vault::from_key_bytes(&key_bytes)
}

/// 用新密钥重加密一个密文（密钥轮换的第二步）
pub fn reencrypt(old_vault: &Vault, new_vault: &Vault, ciphertext: &str) -> Result<String> {
    let plaintext = old_vault.decrypt(ciphertext)?;
    new_vault.encrypt(&plaintext)
}

fn generate_key_bytes() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn write_key_file(key_path: &Path, key_bytes: &[u8; KEY_SIZE]) -> Result<()> {
    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create key dir: {}", parent.display()))?;
    }

    fs::write(key_path, BASE64.encode(key_bytes))
        .with_context(|| format!("Failed to write key file: {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// 检查密钥文件权限，不安全时告警但不阻断
fn validate_key_permissions(key_path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(key_path) {
            let mode = metadata.permissions().mode() & 0o777;
            if mode != 0o600 {
                warn!(
                    path = %key_path.display(),
                    mode = format!("{:o}", mode),
                    "Encryption key file has insecure permissions, expected 600"
                );
            }
        }
    }
    #[cfg(not(unix))]
    let _ = key_path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_vault() -> (TempDir, Vault) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::get_or_create(dir.path().join("test.key")).unwrap();
        (dir, vault)
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let (_dir, vault) = temp_vault();

        for plaintext in ["https://hooks.slack.com/services/T/B/X", "", "密钥 🔑 ünïcode"] {
            let ciphertext = vault.encrypt(plaintext).unwrap();
            assert_eq!(vault.decrypt(&ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let (_dir, vault) = temp_vault();

        let c1 = vault.encrypt("same-plaintext").unwrap();
        let c2 = vault.encrypt("same-plaintext").unwrap();
        assert_ne!(c1, c2);
        assert_eq!(vault.decrypt(&c1).unwrap(), vault.decrypt(&c2).unwrap());
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let (_dir, vault) = temp_vault();
        let (_dir2, other) = temp_vault();

        let ciphertext = vault.encrypt("secret").unwrap();
        assert!(matches!(other.decrypt(&ciphertext), Err(VaultError::Decryption)));
    }

    #[test]
    fn test_decrypt_corrupted_or_malformed() {
        let (_dir, vault) = temp_vault();

        assert!(vault.decrypt("not-a-ciphertext").is_err());
        assert!(vault.decrypt("enc1:!!!invalid-base64!!!").is_err());
        assert!(vault.decrypt("enc1:AAAA").is_err());

        // 翻转密文一个字节
        let ciphertext = vault.encrypt("secret").unwrap();
        let mut bytes = BASE64
            .decode(ciphertext.strip_prefix(CIPHERTEXT_PREFIX).unwrap())
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let corrupted = format!("{}{}", CIPHERTEXT_PREFIX, BASE64.encode(bytes));
        assert!(vault.decrypt(&corrupted).is_err());
    }

    #[test]
    fn test_is_encrypted_heuristic() {
        let (_dir, vault) = temp_vault();

        assert!(is_encrypted(&vault.encrypt("x").unwrap()));
        assert!(!is_encrypted("https://hooks.slack.com/services/T/B/X"));
        assert!(!is_encrypted(""));
    }

    #[test]
    fn test_key_persists_across_loads() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("test.key");

        let v1 = Vault::get_or_create(&key_path).unwrap();
        let ciphertext = v1.encrypt("secret").unwrap();

        let v2 = Vault::get_or_create(&key_path).unwrap();
        assert_eq!(v2.decrypt(&ciphertext).unwrap(), "secret");
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("test.key");
        Vault::get_or_create(&key_path).unwrap();

        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_key_rotation_reencrypt() {
        let dir = TempDir::new().unwrap();
        let old_vault = Vault::get_or_create(dir.path().join("old.key")).unwrap();
        let ciphertext = old_vault.encrypt("secret").unwrap();

        let new_vault = rotate_key(dir.path().join("new.key")).unwrap();
        let new_ciphertext = reencrypt(&old_vault, &new_vault, &ciphertext).unwrap();

        assert_eq!(new_vault.decrypt(&new_ciphertext).unwrap(), "secret");
        // 旧密钥仍然可用（轮换不自动删除）
        assert_eq!(old_vault.decrypt(&ciphertext).unwrap(), "secret");
        // 新密钥解不开旧密文
        assert!(new_vault.decrypt(&ciphertext).is_err());
    }
}
