//! Progress reporting for transfers.
//!
//! The callback runs synchronously on the transfer's driver task and in
//! chunk-index order, even when chunks complete out of order on the wire.
//! A long-running callback therefore stalls the transfer. Returning
//! `false` cancels it.

/// Progress snapshot passed to the callback after each chunk transition.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Total bytes in the transfer.
    pub total_bytes: u64,
    /// Bytes finished so far, monotonic.
    pub transferred_bytes: u64,
    /// Chunks in the plan.
    pub total_chunks: usize,
    /// Chunks finished so far, monotonic.
    pub completed_chunks: usize,
    /// Name of the file being transferred.
    pub filename: String,
}

impl TransferProgress {
    /// Progress as a percentage (0.0 to 100.0).
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0
    }

    /// Whether every byte has been transferred.
    pub fn is_complete(&self) -> bool {
        self.transferred_bytes >= self.total_bytes
    }
}

/// Callback invoked after each chunk; return `false` to cancel.
pub type ProgressCallback = Box<dyn FnMut(&TransferProgress) -> bool + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_and_completion() {
        let p = TransferProgress {
            total_bytes: 200,
            transferred_bytes: 50,
            total_chunks: 4,
            completed_chunks: 1,
            filename: "x.bin".to_string(),
        };
        assert_eq!(p.percent(), 25.0);
        assert!(!p.is_complete());

        let done = TransferProgress {
            transferred_bytes: 200,
            completed_chunks: 4,
            ..p
        };
        assert!(done.is_complete());

        let empty = TransferProgress {
            total_bytes: 0,
            transferred_bytes: 0,
            total_chunks: 0,
            completed_chunks: 0,
            filename: String::new(),
        };
        assert_eq!(empty.percent(), 0.0);
    }
}
