use std::{collections::VecDeque, sync::Arc};

use crate::segment::SegmentReference;

/// Start/end times closer than this are considered the same instant when merging.
const TIME_EPSILON: f64 = 1e-3;

/// Ordered references of one stream.
///
/// Positions are stable across eviction: the position of a reference is the number of
/// references evicted so far plus its offset in the backing store.
#[derive(Debug, Default)]
pub struct SegmentIndex {
    references: VecDeque<Arc<SegmentReference>>,
    num_evicted: u64,
}

impl SegmentIndex {
    pub fn new(references: Vec<Arc<SegmentReference>>) -> Self {
        let mut references: VecDeque<_> = valid_references(references).collect();
        renumber(references.make_contiguous());

        Self {
            references,
            num_evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn num_evicted(&self) -> u64 {
        self.num_evicted
    }

    pub fn first_position(&self) -> Option<u64> {
        (!self.references.is_empty()).then_some(self.num_evicted)
    }

    pub fn last_position(&self) -> Option<u64> {
        (!self.references.is_empty()).then(|| self.num_evicted + self.references.len() as u64 - 1)
    }

    pub fn first(&self) -> Option<&Arc<SegmentReference>> {
        self.references.front()
    }

    pub fn last(&self) -> Option<&Arc<SegmentReference>> {
        self.references.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SegmentReference>> {
        self.references.iter()
    }

    /// Position of the reference containing `time`.
    ///
    /// Times before the first reference clamp to it. Times at or after the end of the last
    /// reference, or inside a gap, have no reference.
    pub fn find(&self, time: f64) -> Option<u64> {
        if time.is_nan() || self.references.is_empty() {
            return None;
        }

        let after = self.references.partition_point(|r| r.start_time() <= time);
        if after == 0 {
            return Some(self.num_evicted);
        }

        let index = after - 1;
        if time < self.references[index].end_time() {
            Some(self.num_evicted + index as u64)
        } else {
            None
        }
    }

    pub fn get(&self, position: u64) -> Option<&Arc<SegmentReference>> {
        let index = position.checked_sub(self.num_evicted)?;
        self.references.get(usize::try_from(index).ok()?)
    }

    pub fn seek(&self, time: f64) -> Option<&Arc<SegmentReference>> {
        self.find(time).and_then(|position| self.get(position))
    }

    /// Trims the index to a period spanning `[period_start, period_end)`.
    pub fn fit(&mut self, period_start: f64, period_end: f64) {
        while self
            .references
            .back()
            .is_some_and(|r| r.start_time() >= period_end)
        {
            self.references.pop_back();
        }

        let before = self.references.len();
        while self
            .references
            .front()
            .is_some_and(|r| r.end_time() <= period_start)
        {
            self.references.pop_front();
        }
        self.num_evicted += (before - self.references.len()) as u64;

        let Some(last) = self.references.back_mut() else {
            return;
        };
        if last.end_time() > period_end {
            tracing::trace!(
                start = last.start_time(),
                end = last.end_time(),
                period_end,
                "Clamping last reference to period end"
            );
            *last = Arc::new(last.with_end_time(period_end));
        }
        if last.end_time() <= period_start || last.end_time() <= last.start_time() {
            self.references.pop_back();
        }
    }

    /// Merges a refreshed, ordered reference list into the index.
    ///
    /// References are matched by start time. A matched reference whose end time changed is
    /// replaced by the incoming one and keeps the stored position. Stored references overlapped
    /// by an incoming reference are dropped. Incoming positions that would run backwards (a
    /// period restarting its numbering) are renumbered to follow the previous reference.
    /// Once references have been evicted, incoming ones ending before the first stored
    /// reference are ignored.
    pub fn merge(&mut self, references: Vec<Arc<SegmentReference>>) {
        let mut incoming: Vec<_> = valid_references(references).collect();

        // Re-adding references which were evicted would shift every stored position.
        if self.num_evicted > 0 {
            if let Some(first_start) = self.references.front().map(|r| r.start_time()) {
                let before = incoming.len();
                incoming.retain(|r| r.end_time() > first_start + TIME_EPSILON);
                if incoming.len() != before {
                    tracing::trace!(
                        skipped = before - incoming.len(),
                        "Skipping references evicted before merge"
                    );
                }
            }
        }
        if incoming.is_empty() {
            return;
        }

        if self.references.is_empty() {
            self.references = incoming.into();
            renumber(self.references.make_contiguous());
            return;
        }

        let old = std::mem::take(&mut self.references);
        // (reference, confirmed by the incoming list)
        let mut merged: Vec<(Arc<SegmentReference>, bool)> =
            Vec::with_capacity(old.len() + incoming.len());

        let (mut i, mut j) = (0, 0);
        while i < old.len() && j < incoming.len() {
            let stored = &old[i];
            let fresh = &incoming[j];

            if stored.start_time() < fresh.start_time() - TIME_EPSILON {
                merged.push((stored.clone(), false));
                i += 1;
            } else if stored.start_time() > fresh.start_time() + TIME_EPSILON {
                merged.push((fresh.clone(), true));
                j += 1;
            } else {
                if (stored.end_time() - fresh.end_time()).abs() > TIME_EPSILON {
                    tracing::debug!(
                        start = stored.start_time(),
                        old_end = stored.end_time(),
                        new_end = fresh.end_time(),
                        "Replacing reference with updated end time"
                    );
                    merged.push((inherit_position(stored, fresh), true));
                } else {
                    merged.push((stored.clone(), true));
                }
                i += 1;
                j += 1;
            }
        }
        merged.extend(old.iter().skip(i).map(|r| (r.clone(), false)));
        merged.extend(incoming.iter().skip(j).map(|r| (r.clone(), true)));

        let fresh_ranges: Vec<(f64, f64)> = merged
            .iter()
            .filter(|(_, fresh)| *fresh)
            .map(|(r, _)| (r.start_time(), r.end_time()))
            .collect();
        let before = merged.len();
        merged.retain(|(r, fresh)| *fresh || !overlaps_any(&fresh_ranges, r));
        if merged.len() != before {
            tracing::debug!(
                dropped = before - merged.len(),
                "Dropped stored references superseded by incoming ones"
            );
        }

        self.references = merged.into_iter().map(|(r, _)| r).collect();
        renumber(self.references.make_contiguous());
    }

    /// Merges then evicts everything ending at or before `window_start`.
    pub fn merge_and_evict(&mut self, references: Vec<Arc<SegmentReference>>, window_start: f64) {
        self.merge(references);
        self.evict(window_start);
    }

    /// Removes references ending at or before `time`.
    pub fn evict(&mut self, time: f64) {
        let before = self.references.len();
        while self
            .references
            .front()
            .is_some_and(|r| r.end_time() <= time)
        {
            self.references.pop_front();
        }

        let evicted = before - self.references.len();
        if evicted > 0 {
            self.num_evicted += evicted as u64;
            tracing::trace!(evicted, time, "Evicted segment references");
        }
    }
}

fn valid_references(
    references: Vec<Arc<SegmentReference>>,
) -> impl Iterator<Item = Arc<SegmentReference>> {
    references.into_iter().filter(|r| {
        let valid = r.end_time() > r.start_time();
        if !valid {
            tracing::debug!(
                start = r.start_time(),
                end = r.end_time(),
                "Dropping reference with non-positive duration"
            );
        }
        valid
    })
}

fn inherit_position(
    stored: &Arc<SegmentReference>,
    fresh: &Arc<SegmentReference>,
) -> Arc<SegmentReference> {
    match (stored.position(), fresh.position()) {
        (Some(position), Some(fresh_position)) if position != fresh_position => {
            let mut reference = SegmentReference::clone(fresh);
            reference.set_position(position);
            Arc::new(reference)
        }
        _ => fresh.clone(),
    }
}

/// `ranges` is sorted and non-overlapping, so their ends are sorted too.
fn overlaps_any(ranges: &[(f64, f64)], reference: &SegmentReference) -> bool {
    let index = ranges.partition_point(|(_, end)| *end <= reference.start_time() + TIME_EPSILON);
    ranges
        .get(index)
        .is_some_and(|(start, _)| *start < reference.end_time() - TIME_EPSILON)
}

/// Keeps declared positions strictly increasing.
fn renumber(references: &mut [Arc<SegmentReference>]) {
    let mut previous: Option<u64> = None;
    for reference in references.iter_mut() {
        let Some(position) = reference.position() else {
            continue;
        };
        match previous {
            Some(prev) if position <= prev => {
                tracing::debug!(
                    start = reference.start_time(),
                    declared = position,
                    renumbered = prev + 1,
                    "Renumbering reference to keep positions monotonic"
                );
                let mut renumbered = SegmentReference::clone(reference);
                renumbered.set_position(prev + 1);
                *reference = Arc::new(renumbered);
                previous = Some(prev + 1);
            }
            _ => previous = Some(position),
        }
    }
}
