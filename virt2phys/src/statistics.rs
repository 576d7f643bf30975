use crate::dump::ScanOutcome;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanStatistics {
    pub intervals: u64,
    pub pages_read: u64,
    pub pages_emitted: u64,
    /// Intervals cut short by a clean end of table.
    pub truncated_intervals: u64,
    /// Intervals abandoned after a read error.
    pub aborted_intervals: u64,
}

impl ScanStatistics {
    pub fn record_interval(&mut self, outcome: ScanOutcome) {
        self.intervals += 1;
        match outcome {
            ScanOutcome::Completed => {}
            ScanOutcome::EndOfTable => self.truncated_intervals += 1,
            ScanOutcome::Aborted => self.aborted_intervals += 1,
        }
    }

    pub fn log_summary(&self) {
        info!("Intervals scanned: {}", self.intervals);
        info!("Pages read: {}", self.pages_read);
        info!("Pages emitted: {}", self.pages_emitted);
        if self.truncated_intervals > 0 {
            info!("Intervals ending past the table: {}", self.truncated_intervals);
        }
        if self.aborted_intervals > 0 {
            warn!("Intervals abandoned on read errors: {}", self.aborted_intervals);
        }
    }
}
