//! 配置存储 - key/value 条目，敏感值经保险库加密

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::{now_ts, Store};
use crate::vault::{self, Vault};

impl Store {
    /// 写入明文配置
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.set_config_raw(key, value, false)
    }

    /// 写入加密配置（先加密再落库，is_encrypted=1）
    pub fn set_config_encrypted(&self, key: &str, value: &str, vault: &Vault) -> Result<()> {
        let ciphertext = vault.encrypt(value)?;
        self.set_config_raw(key, &ciphertext, true)
    }

    fn set_config_raw(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO config (key, value, is_encrypted, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, value, encrypted as i64, now_ts()],
        )?;
        Ok(())
    }

    /// 读取配置原始值（加密值返回密文）
    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// 读取并解密配置。兼容迁移期的遗留明文值（未加密则原样返回）。
    pub fn get_config_decrypted(&self, key: &str, vault: &Vault) -> Result<Option<String>> {
        match self.get_config(key)? {
            Some(value) if vault::is_encrypted(&value) => Ok(Some(vault.decrypt(&value)?)),
            other => Ok(other),
        }
    }

    /// 读取布尔配置（"true"/"false"，缺省返回 default）
    pub fn get_config_bool(&self, key: &str, default: bool) -> Result<bool> {
        Ok(match self.get_config(key)?.as_deref() {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        })
    }

    /// 删除配置
    pub fn delete_config(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM config WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// 密钥轮换：用新保险库重加密所有加密配置，返回处理条数。
    /// 任何一条解密失败立即报错，调用方此时不应删除旧密钥。
    pub fn reencrypt_all_config(&self, old_vault: &Vault, new_vault: &Vault) -> Result<usize> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config WHERE is_encrypted = 1")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut count = 0;
        for (key, ciphertext) in rows {
            let new_ciphertext = vault::reencrypt(old_vault, new_vault, &ciphertext)?;
            conn.execute(
                "UPDATE config SET value = ?1, updated_at = ?2 WHERE key = ?3",
                params![new_ciphertext, now_ts(), key],
            )?;
            count += 1;
        }
        Ok(count)
    }
}
