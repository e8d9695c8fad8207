//! Secret storage operations. Only ciphertext crosses this boundary: the
//! embedding layer encrypts before calling in and decrypts on the runner
//! side. Nothing here logs or returns plaintext, ever.

use std::sync::Arc;

use chrono::Utc;

use crate::errors::{ForgeError, Result};
use crate::store::dao::ActionsDao;
use crate::store::records::{RepoId, SecretRecord, UserId};
use crate::validate::bounded_ident;

/// Secret names follow the environment-variable grammar.
fn validate_secret_name(name: &str) -> Result<()> {
    bounded_ident(name)?;
    let bytes = name.as_bytes();
    let valid = !bytes.is_empty()
        && (bytes[0].is_ascii_alphabetic() || bytes[0] == b'_')
        && bytes
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'_');
    if !valid {
        return Err(ForgeError::InvalidInput(format!(
            "secret name must match [A-Za-z_][A-Za-z0-9_]*: {name}"
        )));
    }
    Ok(())
}

/// Secret operations over the DAO.
pub struct SecretsVault {
    dao: Arc<dyn ActionsDao>,
}

impl SecretsVault {
    pub fn new(dao: Arc<dyn ActionsDao>) -> Self {
        Self { dao }
    }

    /// Create or replace the secret at `(owner, repository, name)`.
    /// `repository_id == 0` stores an org-scoped secret.
    pub async fn create(
        &self,
        owner_id: UserId,
        repository_id: RepoId,
        name: &str,
        ciphertext: Vec<u8>,
    ) -> Result<()> {
        validate_secret_name(name)?;
        if ciphertext.is_empty() {
            return Err(ForgeError::InvalidInput("empty secret ciphertext".into()));
        }
        let now = Utc::now();
        self.dao
            .upsert_secret(SecretRecord {
                owner_id,
                repository_id,
                name: name.to_string(),
                ciphertext,
                created_at: now,
                updated_at: now,
            })
            .await
    }

    /// Fetch ciphertext for runner injection, preferring the repo-scoped
    /// entry over the org-scoped one.
    pub async fn get(
        &self,
        owner_id: UserId,
        repository_id: RepoId,
        name: &str,
    ) -> Result<Option<SecretRecord>> {
        validate_secret_name(name)?;
        if repository_id != 0
            && let Some(found) = self.dao.secret(owner_id, repository_id, name).await?
        {
            return Ok(Some(found));
        }
        self.dao.secret(owner_id, 0, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    /// Repo-scoped entries shadow org-scoped ones of the same name.
    #[tokio::test]
    async fn repo_scope_shadows_org_scope() {
        let dao = Arc::new(MemoryStore::new());
        let vault = SecretsVault::new(dao);

        vault.create(1, 0, "TOKEN", b"org-cipher".to_vec()).await.unwrap();
        vault.create(1, 9, "TOKEN", b"repo-cipher".to_vec()).await.unwrap();

        let got = vault.get(1, 9, "TOKEN").await.unwrap().unwrap();
        assert_eq!(got.ciphertext, b"repo-cipher");

        // A repo without its own entry falls back to the org scope.
        let got = vault.get(1, 4, "TOKEN").await.unwrap().unwrap();
        assert_eq!(got.ciphertext, b"org-cipher");

        assert!(vault.get(1, 4, "MISSING").await.unwrap().is_none());
    }

    /// Upserting replaces the ciphertext in place.
    #[tokio::test]
    async fn upsert_replaces() {
        let dao = Arc::new(MemoryStore::new());
        let vault = SecretsVault::new(dao);
        vault.create(1, 2, "KEY", b"one".to_vec()).await.unwrap();
        vault.create(1, 2, "KEY", b"two".to_vec()).await.unwrap();
        let got = vault.get(1, 2, "KEY").await.unwrap().unwrap();
        assert_eq!(got.ciphertext, b"two");
    }

    /// Names outside the environment grammar are rejected.
    #[tokio::test]
    async fn name_validation() {
        let dao = Arc::new(MemoryStore::new());
        let vault = SecretsVault::new(dao);
        for bad in ["1BAD", "has-dash", "has space", ""] {
            assert!(vault.create(1, 2, bad, b"x".to_vec()).await.is_err());
        }
        assert!(vault.create(1, 2, "_OK_2", b"x".to_vec()).await.is_ok());
    }
}
