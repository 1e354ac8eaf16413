//! Region-of-interest aggregation over histogram snapshots.
//!
//! Three fixed ROI slots exist for the lifetime of the process. A slot is
//! undefined until its first `set`; an undefined slot never produces a report.
//! Counts are recomputed from whatever histogram is current every time a report
//! is requested, never cached.
//!
//! Ranges are inclusive and are clamped to the histogram at aggregation time.
//! The stored bounds are echoed back unchanged; a range that does not overlap
//! the histogram reports zero counts and an empty series.

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::HistogramBuffer;
use serde::Serialize;

/// Number of ROI slots.
pub const ROI_SLOTS: usize = 3;

/// `counts` value of a slot that was never set.
pub const UNDEFINED_COUNTS: i64 = -1;

/// One ROI slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiSlot {
    /// First bin, inclusive.
    pub start: i64,
    /// Last bin, inclusive.
    pub end: i64,
    /// Last computed count, or [`UNDEFINED_COUNTS`].
    pub counts: i64,
}

impl Default for RoiSlot {
    fn default() -> Self {
        Self {
            start: 0,
            end: 0,
            counts: UNDEFINED_COUNTS,
        }
    }
}

impl RoiSlot {
    /// Whether this slot has been set.
    pub fn is_defined(&self) -> bool {
        self.counts != UNDEFINED_COUNTS
    }
}

/// Aggregated data for one ROI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoiReport {
    /// Slot index, 1-based.
    pub roi: usize,
    /// Display label, `ROI #n`.
    pub label: String,
    /// Requested first bin.
    pub start: i64,
    /// Requested last bin.
    pub end: i64,
    /// Sum of bin counts over the range.
    pub counts: i64,
    /// `[bin, count]` pairs over the range.
    pub data: Vec<[i64; 2]>,
}

/// The three ROI slots.
#[derive(Debug, Clone, Default)]
pub struct RoiTable {
    slots: [RoiSlot; ROI_SLOTS],
}

impl RoiTable {
    /// All slots undefined.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_index(index: i64) -> BridgeResult<usize> {
        if (1..=ROI_SLOTS as i64).contains(&index) {
            Ok((index - 1) as usize)
        } else {
            Err(BridgeError::InvalidRoiIndex(index))
        }
    }

    /// Define slot `index` (1-based) as `[start, end]`.
    ///
    /// Leaves the table untouched when `index` is outside `1..=3`.
    pub fn set(&mut self, index: i64, start: i64, end: i64) -> BridgeResult<()> {
        let i = Self::slot_index(index)?;
        self.slots[i] = RoiSlot {
            start,
            end,
            counts: 0,
        };
        Ok(())
    }

    /// Slot `index` (1-based).
    pub fn get(&self, index: i64) -> BridgeResult<RoiSlot> {
        Ok(self.slots[Self::slot_index(index)?])
    }

    /// Recompute slot `index` against `histogram`.
    ///
    /// `Ok(None)` means there is nothing to report: no histogram yet, or the slot
    /// was never defined. That is distinct from a report with zero counts.
    pub fn report(
        &mut self,
        index: i64,
        histogram: Option<&HistogramBuffer>,
    ) -> BridgeResult<Option<RoiReport>> {
        let i = Self::slot_index(index)?;
        let slot = &mut self.slots[i];
        let Some(histogram) = histogram else {
            return Ok(None);
        };
        if !slot.is_defined() {
            return Ok(None);
        }

        let (counts, data) = aggregate(histogram, slot.start, slot.end);
        slot.counts = counts;

        Ok(Some(RoiReport {
            roi: i + 1,
            label: format!("ROI #{}", i + 1),
            start: slot.start,
            end: slot.end,
            counts,
            data,
        }))
    }

    /// Reports for every defined slot, in slot order.
    pub fn report_all(&mut self, histogram: Option<&HistogramBuffer>) -> Vec<RoiReport> {
        (1..=ROI_SLOTS as i64)
            .filter_map(|index| self.report(index, histogram).ok().flatten())
            .collect()
    }
}

/// Sum `histogram` over `[start, end]` clamped to its bounds.
pub fn aggregate(histogram: &HistogramBuffer, start: i64, end: i64) -> (i64, Vec<[i64; 2]>) {
    let bins = histogram.bins();
    if bins.is_empty() {
        return (0, Vec::new());
    }
    let last = bins.len() as i64 - 1;
    let lo = start.max(0);
    let hi = end.min(last);
    if lo > hi {
        return (0, Vec::new());
    }

    let data: Vec<[i64; 2]> = (lo..=hi)
        .map(|bin| [bin, i64::from(bins[bin as usize])])
        .collect();
    let counts = data.iter().map(|[_, count]| count).sum();
    (counts, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HISTOGRAM_BINS;

    fn ones_between(start: usize, end: usize) -> HistogramBuffer {
        let mut bins = vec![0u32; HISTOGRAM_BINS];
        for bin in &mut bins[start..=end] {
            *bin = 1;
        }
        HistogramBuffer::new(bins)
    }

    #[test]
    fn sums_inclusive_range() {
        let hist = ones_between(10, 20);
        let mut table = RoiTable::new();
        table.set(1, 10, 20).unwrap();

        let report = table.report(1, Some(&hist)).unwrap().unwrap();
        assert_eq!(report.counts, 11);
        assert_eq!(report.data.len(), 11);
        assert_eq!(report.data[0], [10, 1]);
        assert_eq!(report.label, "ROI #1");
        assert_eq!(table.get(1).unwrap().counts, 11);
    }

    #[test]
    fn undefined_slot_has_no_report() {
        let hist = ones_between(0, 5);
        let mut table = RoiTable::new();
        assert_eq!(table.get(2).unwrap().counts, UNDEFINED_COUNTS);
        assert!(table.report(2, Some(&hist)).unwrap().is_none());
    }

    #[test]
    fn no_histogram_has_no_report() {
        let mut table = RoiTable::new();
        table.set(3, 0, 100).unwrap();
        assert!(table.report(3, None).unwrap().is_none());
    }

    #[test]
    fn out_of_range_index_leaves_table_untouched() {
        let mut table = RoiTable::new();
        table.set(1, 5, 6).unwrap();

        assert!(matches!(table.set(0, 1, 2), Err(BridgeError::InvalidRoiIndex(0))));
        assert!(matches!(table.set(4, 1, 2), Err(BridgeError::InvalidRoiIndex(4))));
        assert_eq!(table.get(1).unwrap().start, 5);
        assert!(!table.get(2).unwrap().is_defined());
        assert!(!table.get(3).unwrap().is_defined());
    }

    #[test]
    fn counts_follow_the_current_histogram() {
        let mut table = RoiTable::new();
        table.set(1, 0, 3).unwrap();

        let first = table.report(1, Some(&ones_between(0, 1))).unwrap().unwrap();
        assert_eq!(first.counts, 2);

        let second = table.report(1, Some(&ones_between(0, 3))).unwrap().unwrap();
        assert_eq!(second.counts, 4);
    }

    #[test]
    fn range_is_clamped_to_histogram() {
        let hist = ones_between(HISTOGRAM_BINS - 4, HISTOGRAM_BINS - 1);
        let (counts, data) = aggregate(&hist, HISTOGRAM_BINS as i64 - 2, HISTOGRAM_BINS as i64 + 50);
        assert_eq!(counts, 2);
        assert_eq!(data.len(), 2);

        let (counts, data) = aggregate(&ones_between(0, 3), -10, 1);
        assert_eq!(counts, 2);
        assert_eq!(data[0], [0, 1]);
    }

    #[test]
    fn disjoint_or_inverted_range_reports_zero() {
        let hist = ones_between(0, 10);
        assert_eq!(aggregate(&hist, 30_000, 40_000), (0, Vec::new()));
        assert_eq!(aggregate(&hist, 8, 2), (0, Vec::new()));

        let mut table = RoiTable::new();
        table.set(2, 8, 2).unwrap();
        let report = table.report(2, Some(&hist)).unwrap().unwrap();
        assert_eq!(report.counts, 0);
        assert_eq!((report.start, report.end), (8, 2));
    }

    #[test]
    fn report_all_skips_undefined_slots() {
        let hist = ones_between(0, 9);
        let mut table = RoiTable::new();
        table.set(1, 0, 4).unwrap();
        table.set(3, 5, 9).unwrap();

        let reports = table.report_all(Some(&hist));
        assert_eq!(reports.iter().map(|r| r.roi).collect::<Vec<_>>(), vec![1, 3]);
        assert!(reports.iter().all(|r| r.counts == 5));
    }
}
