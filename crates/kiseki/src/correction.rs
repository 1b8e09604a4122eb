use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::KisekiResult,
    mp4::{self, Mp4Error},
    segment::{ContentType, SegmentReference},
};

/// Offsets closer than this are treated as the same original offset.
const OFFSET_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimestampCorrectionConfig {
    pub correct_timestamp_offset: bool,
    /// Seconds of drift tolerated before an offset is rewritten.
    pub max_timestamp_discrepancy: f64,
}

impl Default for TimestampCorrectionConfig {
    fn default() -> Self {
        Self {
            correct_timestamp_offset: false,
            max_timestamp_discrepancy: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestampCorrectedEvent {
    pub content_type: ContentType,
    /// Start time the media actually decodes at, before correction.
    pub segment_start_time: f64,
    pub reference_start_time: f64,
    pub timestamp_discrepancy: f64,
}

pub type CorrectionHandler = Arc<dyn Fn(&TimestampCorrectedEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct OffsetCorrection {
    original: f64,
    corrected: f64,
}

/// Reconciles declared timestamp offsets with the decode times found in fMP4 segments.
#[derive(Default)]
pub struct TimestampOffsetCorrector {
    config: TimestampCorrectionConfig,
    /// content type -> track id -> timescale
    timescales: HashMap<ContentType, HashMap<u32, u32>>,
    corrections: HashMap<ContentType, Vec<OffsetCorrection>>,
    corrected: HashMap<ContentType, Vec<Weak<SegmentReference>>>,
    on_correction: Option<CorrectionHandler>,
}

impl TimestampOffsetCorrector {
    pub fn new(config: TimestampCorrectionConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn configure(&mut self, config: TimestampCorrectionConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &TimestampCorrectionConfig {
        &self.config
    }

    pub fn set_event_handler(&mut self, handler: CorrectionHandler) {
        self.on_correction = Some(handler);
    }

    /// Forgets cached timescales and corrections, e.g. when a new presentation loads.
    pub fn reset(&mut self) {
        self.timescales.clear();
        self.corrections.clear();
        self.corrected.clear();
    }

    pub fn parse_timescales_from_init_segment(
        &mut self,
        content_type: ContentType,
        init_segment: &[u8],
    ) -> KisekiResult<()> {
        let timescales = mp4::parse_timescales(init_segment)?;
        tracing::debug!(%content_type, ?timescales, "Cached timescales from init segment");
        self.timescales.insert(content_type, timescales);
        Ok(())
    }

    pub fn timescale(&self, content_type: ContentType, track_id: u32) -> Option<u32> {
        let timescales = self.timescales.get(&content_type)?;
        timescales.get(&track_id).copied().or_else(|| {
            // A single-track init segment applies whatever track id the fragments carry.
            (timescales.len() == 1)
                .then(|| timescales.values().next().copied())
                .flatten()
        })
    }

    /// Rewrites `reference`'s timestamp offset if the media decodes more than the configured
    /// tolerance away from the declared start time. Returns whether a correction was applied.
    pub fn check_timestamp_offset(
        &mut self,
        content_type: ContentType,
        reference: &Arc<SegmentReference>,
        media_segment: &[u8],
    ) -> bool {
        if !self.config.correct_timestamp_offset || self.is_corrected(content_type, reference) {
            return false;
        }

        let decode_time = match self.decode_time_seconds(content_type, media_segment) {
            Ok(time) => time,
            Err(e) => {
                tracing::debug!(%content_type, error = %e, "Skipping timestamp offset check");
                return false;
            }
        };

        let original = reference.timestamp_offset();
        let segment_start_time = decode_time + original;
        let discrepancy = segment_start_time - reference.start_time();
        if discrepancy.abs() <= self.config.max_timestamp_discrepancy {
            return false;
        }

        let corrected = original - discrepancy;
        reference.set_timestamp_offset(corrected);
        self.remember(content_type, original, corrected);
        self.mark_corrected(content_type, reference);

        tracing::info!(
            %content_type,
            segment_start_time,
            reference_start_time = reference.start_time(),
            discrepancy,
            "Corrected timestamp offset"
        );
        if let Some(handler) = &self.on_correction {
            handler(&TimestampCorrectedEvent {
                content_type,
                segment_start_time,
                reference_start_time: reference.start_time(),
                timestamp_discrepancy: discrepancy,
            });
        }
        true
    }

    /// Applies an earlier correction to another reference sharing the same original offset.
    pub fn correct_timestamp_offset(
        &mut self,
        content_type: ContentType,
        reference: &Arc<SegmentReference>,
    ) -> bool {
        if !self.config.correct_timestamp_offset || self.is_corrected(content_type, reference) {
            return false;
        }

        let offset = reference.timestamp_offset();
        let Some(correction) = self
            .corrections
            .get(&content_type)
            .and_then(|c| c.iter().find(|c| (c.original - offset).abs() < OFFSET_EPSILON))
            .copied()
        else {
            return false;
        };

        reference.set_timestamp_offset(correction.corrected);
        self.mark_corrected(content_type, reference);
        tracing::debug!(
            %content_type,
            start = reference.start_time(),
            from = correction.original,
            to = correction.corrected,
            "Propagated timestamp offset correction"
        );
        true
    }

    fn decode_time_seconds(
        &self,
        content_type: ContentType,
        media_segment: &[u8],
    ) -> Result<f64, Mp4Error> {
        let times = mp4::parse_base_decode_times(media_segment)?;
        let first = times
            .first()
            .copied()
            .ok_or(Mp4Error::MissingBox(mp4::BoxType::TRAF))?;
        let timescale = self
            .timescale(content_type, first.track_id)
            .ok_or(Mp4Error::MissingTimescale(first.track_id))?;
        Ok(first.base_media_decode_time as f64 / timescale as f64)
    }

    fn remember(&mut self, content_type: ContentType, original: f64, corrected: f64) {
        let corrections = self.corrections.entry(content_type).or_default();
        corrections.retain(|c| (c.original - original).abs() >= OFFSET_EPSILON);
        corrections.push(OffsetCorrection {
            original,
            corrected,
        });
    }

    fn is_corrected(&self, content_type: ContentType, reference: &Arc<SegmentReference>) -> bool {
        self.corrected.get(&content_type).is_some_and(|refs| {
            refs.iter()
                .any(|r| std::ptr::eq(r.as_ptr(), Arc::as_ptr(reference)))
        })
    }

    fn mark_corrected(&mut self, content_type: ContentType, reference: &Arc<SegmentReference>) {
        let refs = self.corrected.entry(content_type).or_default();
        refs.retain(|r| r.strong_count() > 0);
        refs.push(Arc::downgrade(reference));
    }
}
