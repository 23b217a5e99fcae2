use crate::types::ValidationRecord;
use hierarch_core::{HierarchError, HierarchResult};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

/// File name of the JSONL sink inside the ledger directory.
pub const LEDGER_FILE: &str = "validations.jsonl";

enum SinkCommand {
    Write(Box<ValidationRecord>),
    Flush(oneshot::Sender<()>),
}

/// Append-only, hash-chained store of every [`ValidationRecord`].
///
/// Each record carries the hash of its predecessor and a SHA-256 over that
/// hash plus its own body, so editing any stored record breaks [`verify`].
///
/// [`verify`]: ValidationLedger::verify
pub struct ValidationLedger {
    records: RwLock<Vec<ValidationRecord>>,
    sink: Option<mpsc::UnboundedSender<SinkCommand>>,
}

impl ValidationLedger {
    /// Ledger kept in memory only.
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            sink: None,
        }
    }

    /// Ledger that also appends every record to `<log_dir>/validations.jsonl`.
    ///
    /// Records already in the file are loaded first, so new records extend the
    /// existing chain. Spawns a background writer task, so it must be called
    /// inside a tokio runtime.
    pub async fn with_jsonl_sink(log_dir: PathBuf) -> HierarchResult<Self> {
        tokio::fs::create_dir_all(&log_dir).await?;
        let path = log_dir.join(LEDGER_FILE);

        let existing = match Self::read_jsonl(&path).await {
            Ok(records) => records,
            Err(HierarchError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        if !existing.is_empty() {
            match first_broken_link(&existing) {
                None => info!(path = %path.display(), records = existing.len(), "Ledger resumed"),
                Some(index) => warn!(
                    path = %path.display(),
                    records = existing.len(),
                    broken_at = index,
                    "Ledger resumed from a broken chain"
                ),
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<SinkCommand>();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    SinkCommand::Write(record) => match serde_json::to_string(&record) {
                        Ok(line) => {
                            let line = format!("{line}\n");
                            if let Err(e) = file.write_all(line.as_bytes()).await {
                                error!(record_id = %record.id, error = %e, "Ledger write failed");
                            }
                        }
                        Err(e) => error!(record_id = %record.id, error = %e, "Ledger encode failed"),
                    },
                    SinkCommand::Flush(done) => {
                        let _ = file.flush().await;
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(Self {
            records: RwLock::new(existing),
            sink: Some(tx),
        })
    }

    /// Seal a record into the chain and store it. Returns the stored copy.
    pub fn append(&self, mut record: ValidationRecord) -> HierarchResult<ValidationRecord> {
        let sealed = {
            let mut records = self.records.write();
            record.prev_hash = records.last().map(|r| r.hash.clone()).unwrap_or_default();
            record.hash = record_hash(&record)?;
            records.push(record.clone());
            record
        };

        info!(
            record_id = %sealed.id,
            consensus = sealed.consensus_reached,
            combined_score = sealed.combined_score,
            "Validation recorded"
        );
        if let Some(tx) = &self.sink {
            let _ = tx.send(SinkCommand::Write(Box::new(sealed.clone())));
        }
        Ok(sealed)
    }

    /// Wait until the background writer has flushed everything sent so far.
    pub async fn flush(&self) {
        if let Some(tx) = &self.sink {
            let (done, wait) = oneshot::channel();
            if tx.send(SinkCommand::Flush(done)).is_ok() {
                let _ = wait.await;
            }
        }
    }

    /// Whether the stored chain is intact.
    pub fn verify(&self) -> bool {
        first_broken_link(&self.records.read()).is_none()
    }

    /// Every record, oldest first.
    pub fn records(&self) -> Vec<ValidationRecord> {
        self.records.read().clone()
    }

    /// Look up a record by ID.
    pub fn get(&self, id: Uuid) -> Option<ValidationRecord> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// No record stored yet.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Read back a JSONL ledger file written by the sink.
    pub async fn read_jsonl(path: impl AsRef<Path>) -> HierarchResult<Vec<ValidationRecord>> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(HierarchError::from))
            .collect()
    }
}

/// SHA-256 over `prev_hash` and the record body (with `hash` blanked), hex encoded.
pub fn record_hash(record: &ValidationRecord) -> HierarchResult<String> {
    let mut body = record.clone();
    body.hash = String::new();
    let bytes = serde_json::to_vec(&body)?;

    let mut hasher = Sha256::new();
    hasher.update(record.prev_hash.as_bytes());
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Index of the first record whose link or hash does not check out.
pub fn first_broken_link(records: &[ValidationRecord]) -> Option<usize> {
    let mut prev = String::new();
    for (i, record) in records.iter().enumerate() {
        let intact = record.prev_hash == prev
            && record_hash(record).is_ok_and(|hash| hash == record.hash);
        if !intact {
            return Some(i);
        }
        prev = record.hash.clone();
    }
    None
}
