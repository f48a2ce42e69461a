//! Persistent player accounts: registration, credential checks, and the
//! `pseudo;hash` account file.

use argon2::Argon2;
use log::{error, info, warn};
use std::path::{Path, PathBuf};

/// Accounts the store will hold before refusing registrations
pub const MAX_ACCOUNTS: usize = 100;

/// Longest accepted pseudo, in bytes
pub const MAX_PSEUDO_LEN: usize = 31;

/// A registered player account
#[derive(Debug, Clone)]
pub struct Account {
    /// Unique, case-sensitive display name
    pub pseudo: String,
    /// Argon2 digest of the password, as 64 hex chars
    pub password_hash: String,
}

/// Outcome of a registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Ok,
    /// The pseudo is already taken (case-sensitive comparison)
    Conflict,
    /// The store is at capacity
    Full,
}

/// In-memory account list backed by a newline-separated `pseudo;hash` file.
///
/// The file is rewritten in full on every successful registration. Accounts
/// are never deleted.
pub struct AccountStore {
    accounts: Vec<Account>,
    path: PathBuf,
}

impl AccountStore {
    /// Loads the account file, starting fresh when it does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut accounts = Vec::new();

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match line.split_once(';') {
                        Some((pseudo, hash)) if !pseudo.is_empty() && !hash.is_empty() => {
                            accounts.push(Account {
                                pseudo: pseudo.to_string(),
                                password_hash: hash.to_string(),
                            });
                        }
                        _ => warn!("Skipping malformed account record: '{}'", line),
                    }
                    if accounts.len() >= MAX_ACCOUNTS {
                        break;
                    }
                }
                info!("Loaded {} account(s) from {}", accounts.len(), path.display());
            }
            Err(_) => {
                info!("No account file at {}, starting fresh", path.display());
            }
        }

        Self { accounts, path }
    }

    /// Registers a new account and persists the store.
    ///
    /// The pseudo must be nonempty and at most [`MAX_PSEUDO_LEN`] bytes;
    /// callers validate that before getting here.
    pub fn register(&mut self, pseudo: &str, password: &str) -> RegisterOutcome {
        if self.find(pseudo).is_some() {
            return RegisterOutcome::Conflict;
        }
        if self.accounts.len() >= MAX_ACCOUNTS {
            return RegisterOutcome::Full;
        }

        self.accounts.push(Account {
            pseudo: pseudo.to_string(),
            password_hash: hash_password(pseudo, password),
        });
        info!("Registered account '{}' ({} total)", pseudo, self.accounts.len());

        self.persist();
        RegisterOutcome::Ok
    }

    /// Checks a pseudo/password pair against the stored hash.
    pub fn login(&self, pseudo: &str, password: &str) -> bool {
        match self.find(pseudo) {
            Some(account) => account.password_hash == hash_password(pseudo, password),
            None => false,
        }
    }

    pub fn find(&self, pseudo: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.pseudo == pseudo)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Rewrites the whole account file. Failures are logged and swallowed;
    /// the in-memory store stays authoritative for the running process.
    fn persist(&self) {
        let mut contents = String::new();
        for account in &self.accounts {
            contents.push_str(&account.pseudo);
            contents.push(';');
            contents.push_str(&account.password_hash);
            contents.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        if let Err(e) = std::fs::write(&self.path, contents) {
            error!("Failed to save accounts to {}: {}", self.path.display(), e);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Memory-hard password digest: 32 bytes of Argon2id keyed by a salt
/// derived from the pseudo, hex-encoded.
///
/// The per-account salt keeps the digest deterministic and the on-disk
/// record a fixed-length hex string.
pub fn hash_password(pseudo: &str, password: &str) -> String {
    // The prefix keeps the salt above Argon2's minimum length for short pseudos
    let salt = format!("quiznet:{}", pseudo);
    let mut output = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut output)
        .expect("fixed output and salt lengths are valid Argon2 parameters");
    hex::encode(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> AccountStore {
        AccountStore::load(dir.path().join("accounts.dat"))
    }

    #[test]
    fn register_then_login_succeeds() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);

        assert_eq!(store.register("alice", "p1"), RegisterOutcome::Ok);
        assert!(store.login("alice", "p1"));
        assert!(!store.login("alice", "wrong"));
        assert!(!store.login("nobody", "p1"));
    }

    #[test]
    fn duplicate_pseudo_conflicts_case_sensitively() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);

        assert_eq!(store.register("alice", "p1"), RegisterOutcome::Ok);
        assert_eq!(store.register("alice", "other"), RegisterOutcome::Conflict);
        // Pseudos are case-sensitive keys
        assert_eq!(store.register("Alice", "p1"), RegisterOutcome::Ok);
    }

    #[test]
    fn store_round_trips_through_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounts.dat");

        {
            let mut store = AccountStore::load(&path);
            store.register("alice", "p1");
            store.register("bob", "p2");
        }

        let reloaded = AccountStore::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.login("alice", "p1"));
        assert!(reloaded.login("bob", "p2"));
        assert!(!reloaded.login("bob", "p1"));
    }

    #[test]
    fn file_format_is_pseudo_semicolon_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounts.dat");

        let mut store = AccountStore::load(&path);
        store.register("alice", "p1");

        let contents = std::fs::read_to_string(&path).unwrap();
        let line = contents.lines().next().unwrap();
        let (pseudo, hash) = line.split_once(';').unwrap();
        assert_eq!(pseudo, "alice");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_is_deterministic_and_salted_by_pseudo() {
        assert_eq!(hash_password("alice", "p1"), hash_password("alice", "p1"));
        // Same password, different pseudo: different digest
        assert_ne!(hash_password("alice", "p1"), hash_password("bob", "p1"));
    }

    #[test]
    fn capacity_is_enforced() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);

        for i in 0..MAX_ACCOUNTS {
            assert_eq!(store.register(&format!("player{}", i), "pw"), RegisterOutcome::Ok);
        }
        assert_eq!(store.register("one_too_many", "pw"), RegisterOutcome::Full);
    }
}
