//! # registry — account store
//!
//! Durable account storage lives outside this service; [`AccountRegistry`] is
//! the seam.  [`InMemoryAccountRegistry`] backs dev runs and tests and can be
//! seeded from a JSON file (`ACCOUNTS_FILE`).

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::{Account, AccountId};

#[async_trait]
pub trait AccountRegistry: Send + Sync {
    async fn get_account_by_id(&self, id: AccountId) -> AppResult<Account>;
    async fn get_all_accounts(&self) -> AppResult<Vec<Account>>;
}

/// Result of [`InMemoryAccountRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated { credentials_changed: bool },
}

#[derive(Default)]
pub struct InMemoryAccountRegistry {
    accounts: RwLock<HashMap<AccountId, Account>>,
}

impl InMemoryAccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let map = accounts.into_iter().map(|a| (a.id, a)).collect();
        Self {
            accounts: RwLock::new(map),
        }
    }

    /// Load a JSON array of accounts.
    pub async fn from_file(path: &str) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read accounts file {path}"))?;
        let accounts: Vec<Account> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse accounts file {path}"))?;
        info!(path, count = accounts.len(), "📒 Accounts loaded");
        Ok(Self::with_accounts(accounts))
    }

    pub async fn upsert(&self, account: Account) -> UpsertOutcome {
        let mut accounts = self.accounts.write().await;
        match accounts.insert(account.id, account.clone()) {
            None => UpsertOutcome::Created,
            Some(previous) => UpsertOutcome::Updated {
                credentials_changed: previous.credentials != account.credentials
                    || previous.exchange != account.exchange,
            },
        }
    }

    pub async fn remove(&self, id: AccountId) -> Option<Account> {
        self.accounts.write().await.remove(&id)
    }
}

#[async_trait]
impl AccountRegistry for InMemoryAccountRegistry {
    async fn get_account_by_id(&self, id: AccountId) -> AppResult<Account> {
        self.accounts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AppError::AccountNotFound(id))
    }

    async fn get_all_accounts(&self) -> AppResult<Vec<Account>> {
        let mut all: Vec<Account> = self.accounts.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}
