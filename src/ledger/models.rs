use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    BulkImport,
    WebhookApply,
    PeriodicResync,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::BulkImport => "bulk_import",
            OperationKind::WebhookApply => "webhook_apply",
            OperationKind::PeriodicResync => "periodic_resync",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bulk_import" => Some(OperationKind::BulkImport),
            "webhook_apply" => Some(OperationKind::WebhookApply),
            "periodic_resync" => Some(OperationKind::PeriodicResync),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Completed, // terminal
    Failed,    // terminal
    Cancelled, // terminal
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OperationStatus::Pending),
            "completed" => Some(OperationStatus::Completed),
            "failed" => Some(OperationStatus::Failed),
            "cancelled" => Some(OperationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending)
    }
}

/// One entry of an operation's error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,
    /// Listing or line item the error is about, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    pub message: String,
}

/// What one chunk (or one webhook event) contributed to its operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: Vec<SyncError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOperation {
    pub account_id: String,
    pub operation_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub chunks_total: u64,
    pub chunks_done: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    /// Total errors seen; `errors` keeps only the first ones.
    pub error_count: u64,
    pub errors: Vec<SyncError>,
    pub metadata: Value,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl SyncOperation {
    pub fn progress(&self) -> Progress {
        Progress {
            operation_id: self.operation_id.clone(),
            status: self.status,
            // Chunk count of a fetched export is unknown until it arrives.
            percent: match (self.status, self.chunks_total) {
                (OperationStatus::Pending, 0) => 0,
                _ => percent(self.chunks_done, self.chunks_total),
            },
            chunks_total: self.chunks_total,
            chunks_done: self.chunks_done,
            created: self.created,
            updated: self.updated,
            skipped: self.skipped,
            error_count: self.error_count,
            errors: self.errors.clone(),
        }
    }
}

/// Snapshot served to status and monitoring collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub operation_id: String,
    pub status: OperationStatus,
    pub percent: u8,
    pub chunks_total: u64,
    pub chunks_done: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub error_count: u64,
    pub errors: Vec<SyncError>,
}

/// `done / total` floored to a whole percent. An operation with no chunks
/// is complete.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

/// Result of registering an operation id.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// New operation, now pending and owned by the caller.
    Started(SyncOperation),
    /// The id already finished; the caller must not redo the work.
    Replay(SyncOperation),
    /// The id is pending under another owner.
    InProgress(SyncOperation),
}
