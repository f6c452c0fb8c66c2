use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::models::Account;

const ACCOUNTS_DIR: &str = "accounts";

// One JSON file per account under <data_dir>/accounts/. Writes are atomic
// (temp file + rename); transient rate-limit state is only honoured on load
// while its reset time is still in the future.
pub struct AccountStore {
    accounts_dir: PathBuf,
}

impl AccountStore {
    pub fn new(data_dir: &Path) -> AppResult<Self> {
        let accounts_dir = data_dir.join(ACCOUNTS_DIR);
        fs::create_dir_all(&accounts_dir)?;
        Ok(Self { accounts_dir })
    }

    fn file_name(email: &str) -> String {
        let sanitized: String = email
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}.json", sanitized)
    }

    fn account_path(&self, email: &str) -> PathBuf {
        self.accounts_dir.join(Self::file_name(email))
    }

    // Load all persisted accounts, ordered by addition time so pool insertion
    // order (and therefore round-robin) is stable across restarts.
    pub fn load_all(&self) -> AppResult<Vec<Account>> {
        let mut accounts = Vec::new();
        let now_ms = chrono::Utc::now().timestamp_millis();

        for entry in fs::read_dir(&self.accounts_dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("[W-ACCOUNT-READ] skipping_unreadable_account_file {:?}: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_str::<Account>(&content) {
                Ok(mut account) => {
                    let dropped = account.prune_expired_limits(now_ms);
                    if dropped > 0 {
                        debug!(
                            "Dropped {} expired rate-limit entries for {} on load",
                            dropped, account.email
                        );
                    }
                    accounts.push(account);
                }
                Err(e) => {
                    warn!("[W-ACCOUNT-PARSE] skipping_malformed_account_file {:?}: {}", path, e);
                }
            }
        }

        accounts.sort_by(|a, b| a.added_at.cmp(&b.added_at).then(a.email.cmp(&b.email)));
        Ok(accounts)
    }

    pub fn save(&self, account: &Account) -> AppResult<()> {
        let path = self.account_path(&account.email);
        let tmp_path = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(account)
            .map_err(|e| AppError::Account(format!("failed_to_serialize_account: {}", e)))?;

        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn delete(&self, email: &str) -> AppResult<()> {
        let path = self.account_path(email);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}
