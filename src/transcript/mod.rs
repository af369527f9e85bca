//! Transcript document: segment assembly and edit arbitration
//!
//! `TranscriptDocument` is the single arbitration point for the one piece of
//! shared mutable state in a session. Two writers race on it: the server
//! event stream and local user edits. The resolution rule is one invariant
//! checked at the point of event application: an edited segment is never
//! overwritten by server output, and a finalized segment only by further
//! finals. Both writers go through the document's `&mut self` methods, so
//! wrapping it in a mutex serializes them.

use crate::protocol::{SegmentPayload, WordInfo};
use serde::Serialize;

/// One utterance-level unit of the transcript
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptSegment {
    /// Strictly increasing ordering key, assigned by the backend
    pub index: u64,
    /// Optional speaker label from diarization
    pub speaker: Option<String>,
    /// Segment start in seconds
    pub start: f64,
    /// Segment end in seconds
    pub end: f64,
    /// Current text, server-produced or user-edited
    pub text: String,
    /// Optional per-word confidences for highlighting
    pub words: Option<Vec<WordInfo>>,
    /// Once true, the segment is pinned against server overwrite
    pub edited: bool,
    /// A final event has been applied; only further finals may replace it
    #[serde(skip)]
    finalized: bool,
}

impl TranscriptSegment {
    fn from_payload(payload: &SegmentPayload, is_final: bool) -> Self {
        Self {
            index: payload.index,
            speaker: payload.speaker.clone(),
            start: payload.start.unwrap_or(0.0),
            end: payload.end.unwrap_or(0.0),
            text: payload.text.clone(),
            words: payload.words.clone(),
            edited: false,
            finalized: is_final,
        }
    }

    fn replace_from(&mut self, payload: &SegmentPayload) {
        if let Some(speaker) = &payload.speaker {
            self.speaker = Some(speaker.clone());
        }
        if let Some(start) = payload.start {
            self.start = start;
        }
        if let Some(end) = payload.end {
            self.end = end;
        }
        self.text = payload.text.clone();
        self.words = payload.words.clone();
    }
}

/// The ordered, de-duplicated segment sequence for one session
#[derive(Debug, Default)]
pub struct TranscriptDocument {
    segments: Vec<TranscriptSegment>,
}

impl TranscriptDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a server segment event at its index
    ///
    /// Partial events replace text/words in place and may be overwritten
    /// repeatedly. Final events do the same but pin the segment against
    /// later non-final events; duplicate finals are idempotent with the
    /// last one winning. Events for an edited segment are dropped.
    pub(crate) fn apply_event(&mut self, payload: &SegmentPayload, is_final: bool) {
        match self
            .segments
            .binary_search_by_key(&payload.index, |s| s.index)
        {
            Ok(pos) => {
                let segment = &mut self.segments[pos];
                if segment.edited {
                    // User edits are authoritative; late server output loses.
                    return;
                }
                if segment.finalized && !is_final {
                    return;
                }
                segment.replace_from(payload);
                if is_final {
                    segment.finalized = true;
                }
            }
            Err(pos) => {
                self.segments
                    .insert(pos, TranscriptSegment::from_payload(payload, is_final));
            }
        }
    }

    /// Apply a user edit to the segment at `index`
    ///
    /// Empty or unchanged text is a no-op. Otherwise the text is replaced
    /// and the segment is pinned against any further server overwrite.
    /// Returns whether the document changed.
    pub fn edit_text(&mut self, index: u64, new_text: &str) -> bool {
        if new_text.is_empty() {
            return false;
        }
        let Ok(pos) = self.segments.binary_search_by_key(&index, |s| s.index) else {
            return false;
        };
        let segment = &mut self.segments[pos];
        if segment.text == new_text {
            return false;
        }
        segment.text = new_text.to_string();
        segment.words = None;
        segment.edited = true;
        true
    }

    /// Empty the segment sequence
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// The segment sequence, always sorted by index with no duplicates
    pub fn segments(&self) -> &[TranscriptSegment] {
        &self.segments
    }

    /// Snapshot of the sequence for autosave/finalize
    pub fn snapshot(&self) -> Vec<TranscriptSegment> {
        self.segments.clone()
    }

    /// Derived concatenation of all segment texts
    pub fn full_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Derived whitespace-separated word count
    pub fn word_count(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.text.split_whitespace().count())
            .sum()
    }
}
