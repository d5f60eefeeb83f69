use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_types::{AuditEntry, AuditRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{AuditError, AuditSink};

/// One line of the audit file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggedRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: AuditRecord,
    pub prev_hash: Option<String>,
    pub chain_hash: String,
}

impl From<LoggedRecord> for AuditEntry {
    fn from(logged: LoggedRecord) -> Self {
        AuditEntry {
            created_at: logged.created_at,
            record: logged.record,
        }
    }
}

/// Append-only JSON-lines audit file. Each line commits to its predecessor through
/// `prev_hash`, so truncation or edits in the middle are caught by [`verify_log`].
pub struct JsonlAuditLog {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl JsonlAuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let last_hash = read_last_hash(&path)?;
        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut last = self
            .last_hash
            .lock()
            .map_err(|_| AuditError::Io("audit log lock poisoned".into()))?;
        let mut logged = LoggedRecord {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            record: record.clone(),
            prev_hash: last.clone(),
            chain_hash: String::new(),
        };
        logged.chain_hash = hash_record(&logged);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::Io(e.to_string()))?;
        let line = serde_json::to_string(&logged).map_err(|e| AuditError::Parse(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| AuditError::Io(e.to_string()))?;
        *last = Some(logged.chain_hash);
        Ok(())
    }

    fn read_recent(&self, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let all = read_all(&self.path)?;
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].iter().rev().cloned().map(AuditEntry::from).collect())
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.append(record)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        self.read_recent(limit)
    }
}

/// Walk the whole file and check every link of the hash chain. Returns the number of records.
pub fn verify_log(path: impl AsRef<Path>) -> Result<usize, AuditError> {
    let mut prev: Option<String> = None;
    let records = read_all(path.as_ref())?;
    for (idx, logged) in records.iter().enumerate() {
        let line = idx + 1;
        if logged.prev_hash != prev {
            return Err(AuditError::Chain {
                line,
                reason: "previous hash mismatch".into(),
            });
        }
        if logged.chain_hash != hash_record(logged) {
            return Err(AuditError::Chain {
                line,
                reason: "record hash invalid".into(),
            });
        }
        prev = Some(logged.chain_hash.clone());
    }
    Ok(records.len())
}

fn hash_record(logged: &LoggedRecord) -> String {
    let r = &logged.record;
    let mut h = Sha256::new();
    h.update(logged.id.as_bytes());
    h.update(logged.created_at.to_rfc3339());
    h.update(&r.user_question);
    field(&mut h, r.generated_sql.as_deref());
    h.update([r.validation_passed as u8]);
    // Two decimals is the stored precision; formatting keeps the digest stable across
    // float parsing.
    field(&mut h, r.execution_time_ms.map(|ms| format!("{ms:.2}")).as_deref());
    field(&mut h, r.row_count.map(|n| n.to_string()).as_deref());
    field(&mut h, r.error_message.as_deref());
    if let Some(prev) = &logged.prev_hash {
        h.update(prev);
    }
    hex::encode(h.finalize())
}

fn field(h: &mut Sha256, value: Option<&str>) {
    match value {
        Some(v) => {
            h.update([1u8]);
            h.update((v.len() as u64).to_le_bytes());
            h.update(v);
        }
        None => h.update([0u8]),
    }
}

fn read_all(path: &Path) -> Result<Vec<LoggedRecord>, AuditError> {
    let file = File::open(path).map_err(|e| AuditError::Io(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| AuditError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let logged: LoggedRecord = serde_json::from_str(&line).map_err(|e| AuditError::Parse(e.to_string()))?;
        out.push(logged);
    }
    Ok(out)
}

fn read_last_hash(path: &Path) -> Result<Option<String>, AuditError> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(read_all(path)?.pop().map(|r| r.chain_hash))
}
