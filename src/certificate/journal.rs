//! Append-only JSONL log of issuance stages.
//!
//! Each stage is appended before the remote call it guards, so a crash or a failed record
//! insert leaves a trail pointing at the uploaded-but-unrecorded document.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStage {
    UploadPending,
    Uploaded,
    Recorded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub certificate_id: Uuid,
    pub stage: IntentStage,
    pub identity_id: String,
    pub filename: String,
    /// Set once the upload has succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl Intent {
    pub fn new(certificate_id: Uuid, stage: IntentStage, identity_id: &str, filename: &str) -> Self {
        Self {
            certificate_id,
            stage,
            identity_id: identity_id.to_string(),
            filename: filename.to_string(),
            document_url: None,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.document_url = Some(url.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// An upload may have landed without a matching certificate row.
    fn needs_reconciliation(&self) -> bool {
        match self.stage {
            IntentStage::UploadPending | IntentStage::Uploaded => true,
            IntentStage::Failed => self.document_url.is_some(),
            IntentStage::Recorded => false,
        }
    }
}

#[derive(Debug)]
pub struct IntentJournal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl IntentJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into(), lock: Mutex::new(()) } }

    pub fn path(&self) -> &Path { &self.path }

    pub fn append(&self, intent: &Intent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(intent).map_err(std::io::Error::other)?;
        line.push(b'\n');
        let _guard = self.lock.lock();
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        f.write_all(&line)?;
        f.sync_data()
    }

    /// Append, logging instead of failing; a journal problem never blocks issuance.
    pub fn note(&self, intent: Intent) {
        if let Err(e) = self.append(&intent) {
            warn!(target: "issuer", "journal write failed for {} ({:?}): {}", intent.certificate_id, intent.stage, e);
        }
    }

    /// Every readable intent in file order. Unparseable lines are skipped.
    pub fn read_all(&self) -> std::io::Result<Vec<Intent>> {
        let _guard = self.lock.lock();
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> std::io::Result<Vec<Intent>> {
        let f = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut out = Vec::new();
        for (n, line) in BufReader::new(f).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Intent>(&line) {
                Ok(intent) => out.push(intent),
                Err(e) => warn!(target: "issuer", "skipping journal line {}: {}", n + 1, e),
            }
        }
        Ok(out)
    }

    /// Latest intent per certificate whose document may be uploaded but unrecorded.
    pub fn unreconciled(&self) -> std::io::Result<Vec<Intent>> {
        Ok(outstanding(self.read_all()?))
    }

    /// Rewrite the journal keeping only the history of outstanding certificates.
    /// Returns the number of lines dropped.
    pub fn compact(&self) -> std::io::Result<usize> {
        let _guard = self.lock.lock();
        let all = self.read_unlocked()?;
        if all.is_empty() {
            return Ok(0);
        }
        let keep: HashSet<Uuid> = outstanding(all.clone()).into_iter().map(|i| i.certificate_id).collect();
        let kept: Vec<&Intent> = all.iter().filter(|i| keep.contains(&i.certificate_id)).collect();
        let dropped = all.len() - kept.len();
        if dropped == 0 {
            return Ok(0);
        }
        let mut body = Vec::new();
        for intent in kept {
            serde_json::to_writer(&mut body, intent).map_err(std::io::Error::other)?;
            body.push(b'\n');
        }
        let name = self.path.file_name().and_then(|n| n.to_str()).unwrap_or("journal");
        let tmp = self.path.with_file_name(format!(".{}.tmp", name));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(target: "issuer", "compacted journal {}: dropped {} line(s)", self.path.display(), dropped);
        Ok(dropped)
    }
}

fn outstanding(intents: Vec<Intent>) -> Vec<Intent> {
    let mut latest: HashMap<Uuid, Intent> = HashMap::new();
    let mut order = Vec::new();
    for intent in intents {
        if !latest.contains_key(&intent.certificate_id) {
            order.push(intent.certificate_id);
        }
        let id = intent.certificate_id;
        // Keep the upload URL from an earlier stage if the later one lacks it.
        let url = latest.get(&id).and_then(|prev| prev.document_url.clone());
        let mut intent = intent;
        if intent.document_url.is_none() {
            intent.document_url = url;
        }
        latest.insert(id, intent);
    }
    order.into_iter().filter_map(|id| latest.remove(&id)).filter(Intent::needs_reconciliation).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal() -> (tempfile::TempDir, IntentJournal) {
        let tmp = tempfile::tempdir().unwrap();
        let j = IntentJournal::new(tmp.path().join("journal.jsonl"));
        (tmp, j)
    }

    #[test]
    fn empty_or_missing_journal_has_nothing_outstanding() {
        let (_tmp, j) = journal();
        assert!(j.read_all().unwrap().is_empty());
        assert!(j.unreconciled().unwrap().is_empty());
    }

    #[test]
    fn finished_issuance_is_reconciled() {
        let (_tmp, j) = journal();
        let id = Uuid::new_v4();
        j.note(Intent::new(id, IntentStage::UploadPending, "u-1", "a.pdf"));
        j.note(Intent::new(id, IntentStage::Uploaded, "u-1", "a.pdf").with_url("https://x/a.pdf"));
        j.note(Intent::new(id, IntentStage::Recorded, "u-1", "a.pdf"));
        assert_eq!(j.read_all().unwrap().len(), 3);
        assert!(j.unreconciled().unwrap().is_empty());
    }

    #[test]
    fn record_failure_after_upload_is_outstanding() {
        let (_tmp, j) = journal();
        let done = Uuid::new_v4();
        let orphan = Uuid::new_v4();
        let never_uploaded = Uuid::new_v4();

        j.note(Intent::new(done, IntentStage::UploadPending, "u-1", "d.pdf"));
        j.note(Intent::new(orphan, IntentStage::UploadPending, "u-1", "o.pdf"));
        j.note(Intent::new(orphan, IntentStage::Uploaded, "u-1", "o.pdf").with_url("https://x/o.pdf"));
        j.note(Intent::new(orphan, IntentStage::Failed, "u-1", "o.pdf").with_detail("HTTP 409"));
        j.note(Intent::new(done, IntentStage::Recorded, "u-1", "d.pdf"));
        j.note(Intent::new(never_uploaded, IntentStage::UploadPending, "u-2", "n.pdf"));
        j.note(Intent::new(never_uploaded, IntentStage::Failed, "u-2", "n.pdf").with_detail("HTTP 503"));

        let open = j.unreconciled().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].certificate_id, orphan);
        assert_eq!(open[0].stage, IntentStage::Failed);
        assert_eq!(open[0].document_url.as_deref(), Some("https://x/o.pdf"));
    }

    #[test]
    fn interrupted_upload_is_outstanding_and_bad_lines_are_skipped() {
        let (_tmp, j) = journal();
        let id = Uuid::new_v4();
        j.note(Intent::new(id, IntentStage::UploadPending, "u-1", "a.pdf"));
        let mut f = OpenOptions::new().append(true).open(j.path()).unwrap();
        f.write_all(b"{not json\n").unwrap();
        let open = j.unreconciled().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].stage, IntentStage::UploadPending);
    }

    #[test]
    fn compaction_keeps_only_outstanding_history() {
        let (_tmp, j) = journal();
        let done = Uuid::new_v4();
        let orphan = Uuid::new_v4();
        j.note(Intent::new(done, IntentStage::UploadPending, "u-1", "d.pdf"));
        j.note(Intent::new(orphan, IntentStage::UploadPending, "u-1", "o.pdf"));
        j.note(Intent::new(orphan, IntentStage::Uploaded, "u-1", "o.pdf").with_url("https://x/o.pdf"));
        j.note(Intent::new(done, IntentStage::Recorded, "u-1", "d.pdf"));

        assert_eq!(j.compact().unwrap(), 2);
        let left = j.read_all().unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|i| i.certificate_id == orphan));
        assert_eq!(j.unreconciled().unwrap()[0].document_url.as_deref(), Some("https://x/o.pdf"));

        assert_eq!(j.compact().unwrap(), 0);
        j.note(Intent::new(orphan, IntentStage::Recorded, "u-1", "o.pdf"));
        assert_eq!(j.compact().unwrap(), 3);
        assert!(j.read_all().unwrap().is_empty());
    }
}
