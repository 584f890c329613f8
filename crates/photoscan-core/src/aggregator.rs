//! Per-photo aggregation of raw face hits into confirmed and possible matches.

use crate::index::Hit;
use crate::types::FaceBox;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One matched face inside a photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceHit {
    pub face_id: u64,
    pub face: FaceBox,
    pub score: f32,
}

/// One photo's aggregated match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub photo_id: String,
    /// Best face similarity in the photo.
    pub score: f32,
    /// Distinct faces that matched.
    pub face_count: usize,
    /// Recovered by the smart-expand pass rather than the primary search.
    pub expanded: bool,
    pub faces: Vec<FaceHit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchClass {
    Confirmed,
    Possible,
    Rejected,
}

/// Closed at the threshold: a score equal to it is confirmed.
pub fn classify(score: f32, threshold: f32, floor: f32) -> MatchClass {
    if score >= threshold {
        MatchClass::Confirmed
    } else if score >= floor {
        MatchClass::Possible
    } else {
        MatchClass::Rejected
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub confirmed: Vec<MatchResult>,
    pub possible: Vec<MatchResult>,
}

impl SearchOutcome {
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.possible.is_empty()
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.possible.len()
    }
}

/// When and how far to lower the threshold for the secondary pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpandPolicy {
    pub enabled: bool,
    /// Expand only while the primary pass confirmed fewer photos than this.
    pub max_primary_photos: usize,
    /// Floor sits this far below the primary threshold...
    pub margin: f32,
    /// ...but never below this.
    pub min_threshold: f32,
    /// Floor used when the primary pass confirmed nothing.
    pub fallback_threshold: f32,
}

impl Default for ExpandPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_primary_photos: 8,
            margin: 0.10,
            min_threshold: 0.42,
            fallback_threshold: 0.30,
        }
    }
}

impl ExpandPolicy {
    /// Floor for the secondary pass, or `None` when no secondary pass should run.
    pub fn secondary_floor(&self, threshold: f32, confirmed_photos: usize) -> Option<f32> {
        if !self.enabled || confirmed_photos >= self.max_primary_photos {
            return None;
        }
        let floor = if confirmed_photos == 0 {
            self.fallback_threshold
        } else {
            (threshold - self.margin).max(self.min_threshold)
        };
        (floor < threshold).then_some(floor)
    }
}

/// Distinct photos with at least one hit at or above `threshold`.
pub fn count_confirmed(hits: &[Hit], threshold: f32) -> usize {
    hits.iter()
        .filter(|h| h.score >= threshold)
        .map(|h| h.photo_id.as_str())
        .collect::<HashSet<_>>()
        .len()
}

struct Group {
    first_seen: usize,
    result: MatchResult,
    seen_faces: HashSet<u64>,
}

/// Collapse ranked face hits into per-photo results.
///
/// Primary hits count when they reach `floor`. Secondary hits only backfill
/// photos the primary pass did not confirm; a photo is `expanded` only when the
/// primary pass never saw it. Photos
/// are ordered by score, ties keeping the order the index returned them in.
/// At most `cap` results are returned, confirmed first.
pub fn aggregate(
    primary: &[Hit],
    secondary: Option<&[Hit]>,
    threshold: f32,
    floor: f32,
    cap: usize,
) -> SearchOutcome {
    let floor = floor.min(threshold);
    let mut groups: Vec<Group> = Vec::new();
    let mut by_photo: HashMap<String, usize> = HashMap::new();

    let mut add = |hit: &Hit, expanded: bool, groups: &mut Vec<Group>| {
        let next = groups.len();
        let slot = *by_photo.entry(hit.photo_id.clone()).or_insert(next);
        if slot == next {
            groups.push(Group {
                first_seen: next,
                result: MatchResult {
                    photo_id: hit.photo_id.clone(),
                    score: f32::NEG_INFINITY,
                    face_count: 0,
                    expanded,
                    faces: Vec::new(),
                },
                seen_faces: HashSet::new(),
            });
        }
        let group = &mut groups[slot];
        if !group.seen_faces.insert(hit.id) {
            return;
        }
        group.result.score = group.result.score.max(hit.score);
        group.result.face_count += 1;
        group.result.faces.push(FaceHit {
            face_id: hit.id,
            face: hit.face,
            score: hit.score,
        });
    };

    for hit in primary.iter().filter(|h| h.score >= floor) {
        add(hit, false, &mut groups);
    }

    if let Some(secondary) = secondary {
        let confirmed: HashSet<String> = groups
            .iter()
            .filter(|g| g.result.score >= threshold)
            .map(|g| g.result.photo_id.clone())
            .collect();
        for hit in secondary
            .iter()
            .filter(|h| h.score >= floor && !confirmed.contains(&h.photo_id))
        {
            add(hit, true, &mut groups);
        }
    }

    // Stable: equal scores keep first-seen order.
    groups.sort_by(|a, b| {
        b.result
            .score
            .partial_cmp(&a.result.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.first_seen.cmp(&b.first_seen))
    });

    let mut outcome = SearchOutcome::default();
    for group in groups {
        let mut result = group.result;
        result
            .faces
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        match classify(result.score, threshold, floor) {
            MatchClass::Confirmed => outcome.confirmed.push(result),
            MatchClass::Possible => outcome.possible.push(result),
            MatchClass::Rejected => {}
        }
    }

    outcome.confirmed.truncate(cap);
    outcome.possible.truncate(cap - outcome.confirmed.len());
    outcome
}
