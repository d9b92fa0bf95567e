//! Side effects that only run once an action has been dual-approved.

use crate::*;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extension of the wrapped-key file written next to each backup
pub const BACKUP_KEY_EXTENSION: &str = "dek";

/// Contents of `export_{id}.json`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub action_id: ActionId,

    /// `None` exports counts across all elections
    pub election_id: Option<String>,
    pub ballots_count: u64,
    pub executed_at: DateTime<Utc>,
    pub approvers: Vec<String>,
}

/// Writes an export manifest for an approved export action
pub struct ExportWriter<S> {
    dir: PathBuf,
    store: S,
}

impl<S: BallotStore> ExportWriter<S> {
    pub fn new<P: Into<PathBuf>>(dir: P, store: S) -> Self {
        ExportWriter {
            dir: dir.into(),
            store,
        }
    }

    pub fn path_for(&self, action_id: ActionId) -> PathBuf {
        self.dir.join(format!("export_{}.json", action_id))
    }

    pub fn write(&self, action: &Action, approvers: &[String]) -> Result<PathBuf> {
        let counts = self.store.ballot_counts()?;
        let ballots_count = match &action.subject {
            Some(election_id) => counts.get(election_id).copied().unwrap_or(0),
            None => counts.values().sum(),
        };

        let record = ExportRecord {
            action_id: action.id,
            election_id: action.subject.clone(),
            ballots_count,
            executed_at: action.executed_at.unwrap_or_else(Utc::now),
            approvers: approvers.to_vec(),
        };

        let path = self.path_for(action.id);
        write_secret_file(&path, &serde_json::to_vec_pretty(&record)?)?;
        info!("wrote export for action {} to {}", action.id, path.display());
        Ok(path)
    }
}

/// Point-in-time copy of the ballot tables
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub taken_at: DateTime<Utc>,
    pub ballots: Vec<BallotRecord>,
    pub chain: Vec<ChainLink>,
}

impl StoreSnapshot {
    pub fn take<S: BallotStore>(store: &S) -> Result<Self> {
        Ok(StoreSnapshot {
            taken_at: Utc::now(),
            ballots: store.ballots()?,
            chain: store.chain()?,
        })
    }
}

/// Encrypted backups of the ballot store.
///
/// Each backup is sealed under its own fresh data key with AES-256-GCM and written as
/// `nonce || ciphertext`. The data key is written alongside, wrapped under the KEK, so
/// a backup can only be restored by a holder of the KEK.
pub struct EncryptedBackup<S> {
    dir: PathBuf,
    store: S,
    keys: Arc<KeyManager>,
}

impl<S: BallotStore> EncryptedBackup<S> {
    pub fn new<P: Into<PathBuf>>(dir: P, store: S, keys: Arc<KeyManager>) -> Self {
        EncryptedBackup {
            dir: dir.into(),
            store,
            keys,
        }
    }

    /// Write a backup and return the path of the encrypted file
    pub fn write(&self, label: &str) -> Result<PathBuf> {
        let snapshot = StoreSnapshot::take(&self.store)?;
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(&snapshot)?);

        let (dek, wrapped) = self.keys.generate_data_key()?;
        let sealed = BallotCipher::new(dek).encrypt(&plaintext)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.ciphertext.len());
        blob.extend_from_slice(&sealed.nonce);
        blob.extend(sealed.ciphertext);

        let name = format!(
            "backup_{}_{}.enc",
            label,
            snapshot.taken_at.format("%Y%m%dT%H%M%S%.6fZ")
        );
        let path = self.dir.join(name);
        write_secret_file(&path, &blob)?;
        write_secret_file(&path.with_extension(BACKUP_KEY_EXTENSION), wrapped.as_bytes())?;

        info!(
            "wrote encrypted backup of {} ballots to {}",
            snapshot.ballots.len(),
            path.display()
        );
        Ok(path)
    }
}

/// Decrypt a backup written by `EncryptedBackup`
pub fn restore_backup(keys: &KeyManager, path: &Path) -> Result<StoreSnapshot> {
    let blob = fs::read(path)?;
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::Corrupt(format!("{} is too short", path.display())));
    }
    let wrapped = fs::read(path.with_extension(BACKUP_KEY_EXTENSION))?;

    let dek = keys.unwrap_key(&wrapped)?;
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let plaintext = zeroize::Zeroizing::new(BallotCipher::new(dek).decrypt(ciphertext, nonce)?);

    Ok(serde_json::from_slice(&plaintext)?)
}

/// Dispatches an approved action to its side effect
pub struct ActionGate<S> {
    export: ExportWriter<S>,
    backup: EncryptedBackup<S>,
}

impl<S: BallotStore + Clone> ActionGate<S> {
    pub fn new(config: &Config, store: S, keys: Arc<KeyManager>) -> Self {
        ActionGate {
            export: ExportWriter::new(config.export_dir.clone(), store.clone()),
            backup: EncryptedBackup::new(config.backup_dir.clone(), store, keys),
        }
    }
}

impl<S: BallotStore> ActionGate<S> {
    pub fn from_parts(export: ExportWriter<S>, backup: EncryptedBackup<S>) -> Self {
        ActionGate { export, backup }
    }
}

impl<S: BallotStore> GatedAction for ActionGate<S> {
    fn execute(&self, action: &Action, approvers: &[String]) -> Result<()> {
        match action.kind {
            ActionKind::Export => self.export.write(action, approvers).map(|_| ()),
            ActionKind::Backup => self
                .backup
                .write(&format!("action{}", action.id))
                .map(|_| ()),
        }
    }
}
