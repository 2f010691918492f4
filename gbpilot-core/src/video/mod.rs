//! # Video Analyzer
//!
//! Turns a sealed [`VideoSegment`] into something the decision oracle can
//! consume cheaply:
//!
//! ```text
//! VideoSegment ──► analyze() ──► SegmentAnalysis { stats, motion, changes, ranked frames }
//!              └─► payload() ──► FramePayload::{Single, Pair, Animated}
//! ```
//!
//! The analyzer never touches the live recording buffer; it only reads the
//! segment it was handed.

pub mod delta;
pub mod gif;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capture::types::{CaptureFrame, VideoSegment};

pub use delta::{
    differs_significantly, frame_difference, select_key_frames, MotionDetector, DEFAULT_DIFF_SIZE,
    DEFAULT_DIFF_THRESHOLD,
};
pub use gif::{build_gif, GifClip, GifConfig};

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Score above which two frames differ significantly.
    pub diff_threshold: f64,
    /// Thumbnail edge used for comparisons.
    pub diff_size: u32,
    /// Cap on key frames per segment.
    pub max_key_frames: usize,
    /// Cap on ranked recommendations.
    pub max_recommended: usize,
    pub gif: GifConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            diff_threshold: DEFAULT_DIFF_THRESHOLD,
            diff_size: DEFAULT_DIFF_SIZE,
            max_key_frames: 8,
            max_recommended: 4,
            gif: GifConfig::default(),
        }
    }
}

// ── Analysis result ──────────────────────────────────────────────

/// A frame worth showing to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedFrame {
    pub index: usize,
    /// Offset from the start of the segment.
    pub offset: Duration,
    /// Higher is more informative.
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentAnalysis {
    pub duration: Duration,
    pub frame_count: usize,
    pub fps: f64,
    /// Mean consecutive-frame difference.
    pub motion_score: f64,
    /// Largest consecutive-frame difference.
    pub peak_motion: f64,
    /// Offsets of frames that differ significantly from their predecessor.
    pub content_changes: Vec<Duration>,
    pub key_frames: Vec<usize>,
    /// Key frames ordered by score, best first.
    pub recommended: Vec<RankedFrame>,
}

impl SegmentAnalysis {
    pub fn is_static(&self) -> bool {
        self.content_changes.is_empty()
    }

    /// One-line description for the oracle context.
    pub fn summary(&self) -> String {
        format!(
            "{} frames over {:.2}s ({:.1} fps), motion {:.3}, {} content change(s)",
            self.frame_count,
            self.duration.as_secs_f64(),
            self.fps,
            self.motion_score,
            self.content_changes.len()
        )
    }
}

// ── Payload ──────────────────────────────────────────────────────

/// The image material sent to the oracle for one decision.
#[derive(Debug, Clone)]
pub enum FramePayload {
    Single(CaptureFrame),
    /// Before/after pair.
    Pair {
        before: CaptureFrame,
        after: CaptureFrame,
    },
    /// One animated clip plus its endpoints for the static retry.
    Animated {
        clip: GifClip,
        first: CaptureFrame,
        last: CaptureFrame,
    },
}

impl FramePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            FramePayload::Single(_) => "single",
            FramePayload::Pair { .. } => "pair",
            FramePayload::Animated { .. } => "animated",
        }
    }

    pub fn is_animated(&self) -> bool {
        matches!(self, FramePayload::Animated { .. })
    }

    /// First and last frames as static images, for retrying after the
    /// oracle rejected an animation. `None` for payloads that are already
    /// static.
    pub fn static_fallback(&self) -> Option<FramePayload> {
        match self {
            FramePayload::Animated { first, last, .. } => Some(FramePayload::Pair {
                before: first.clone(),
                after: last.clone(),
            }),
            _ => None,
        }
    }

    /// The most recent frame in the payload.
    pub fn latest(&self) -> &CaptureFrame {
        match self {
            FramePayload::Single(frame) => frame,
            FramePayload::Pair { after, .. } => after,
            FramePayload::Animated { last, .. } => last,
        }
    }
}

// ── VideoAnalyzer ────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct VideoAnalyzer {
    config: AnalyzerConfig,
}

impl VideoAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Statistics, motion and ranked key frames for `segment`.
    pub fn analyze(&self, segment: &VideoSegment) -> SegmentAnalysis {
        let frames = segment.frames();
        let mut detector = MotionDetector::new(self.config.diff_size);
        let mut scores = Vec::with_capacity(frames.len());
        let mut content_changes = Vec::new();

        for frame in frames {
            let score = detector.observe(frame);
            if score > self.config.diff_threshold {
                content_changes.push(segment.offset_of(frame));
            }
            scores.push(score);
        }

        let transitions = scores.len().saturating_sub(1);
        let motion_score = if transitions == 0 {
            0.0
        } else {
            scores.iter().skip(1).sum::<f64>() / transitions as f64
        };
        let peak_motion = scores.iter().copied().fold(0.0, f64::max);

        let key_frames = select_key_frames(
            frames,
            self.config.diff_threshold,
            self.config.diff_size,
            self.config.max_key_frames,
        );
        let recommended = self.rank(segment, &key_frames);

        let analysis = SegmentAnalysis {
            duration: segment.duration(),
            frame_count: frames.len(),
            fps: segment.fps(),
            motion_score,
            peak_motion,
            content_changes,
            key_frames,
            recommended,
        };
        debug!(summary = %analysis.summary(), "segment analyzed");
        analysis
    }

    /// Score each key frame by how far it moved from the previous key
    /// frame. The last frame shows the outcome of the actions and always
    /// ranks first; the first frame is the baseline and ranks last.
    fn rank(&self, segment: &VideoSegment, key_frames: &[usize]) -> Vec<RankedFrame> {
        let frames = segment.frames();
        let last = frames.len().saturating_sub(1);
        let mut ranked: Vec<RankedFrame> = key_frames
            .iter()
            .enumerate()
            .map(|(pos, &index)| {
                let score = if index == last && pos > 0 {
                    f64::INFINITY
                } else if pos == 0 {
                    0.0
                } else {
                    frame_difference(&frames[key_frames[pos - 1]], &frames[index], self.config.diff_size)
                };
                RankedFrame {
                    index,
                    offset: segment.offset_of(&frames[index]),
                    score,
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
        ranked.truncate(self.config.max_recommended.max(1));
        for r in &mut ranked {
            if r.score.is_infinite() {
                r.score = 1.0;
            }
        }
        ranked
    }

    /// Build the oracle payload for a segment: an animated clip when there
    /// is more than one frame, a single image otherwise. GIF encoding
    /// failure degrades to the first/last pair.
    pub fn payload(&self, segment: &VideoSegment) -> Option<FramePayload> {
        let first = segment.first()?.clone();
        let last = match segment.last() {
            Some(last) if segment.len() > 1 => last.clone(),
            _ => return Some(FramePayload::Single(first)),
        };
        match build_gif(segment, &self.config.gif) {
            Ok(clip) => Some(FramePayload::Animated { clip, first, last }),
            Err(e) => {
                warn!("gif assembly failed ({e}); sending first and last frames");
                Some(FramePayload::Pair {
                    before: first,
                    after: last,
                })
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
