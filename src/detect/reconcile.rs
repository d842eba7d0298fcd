//! Duplicate-label reconciliation.
//!
//! Object detectors regularly emit both the compliant and the non-compliant
//! label for the same worker (a `hardhat` box and a `no-hardhat` box on the
//! same head), or a small box nested inside a larger one for the same
//! physical object. `DetectionReconciler` removes those artifacts from a
//! single frame's `DetectionSet`.
//!
//! The passes run in a fixed order: overlap, containment, overlap again.
//! Reordering the passes changes results: a positive box nested in a heavily
//! overlapping negative box survives only because the overlap pass runs first.

use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::result::{Category, Detection, DetectionSet};

/// Default intersection-over-union above which the negative label is dropped.
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.8;

/// A (compliant, non-compliant) label pair subject to deduplication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPairing {
    pub positive: u8,
    pub negative: u8,
}

impl CategoryPairing {
    pub const HARDHAT: CategoryPairing = CategoryPairing {
        positive: 0,
        negative: 2,
    };
    pub const VEST: CategoryPairing = CategoryPairing {
        positive: 7,
        negative: 4,
    };

    pub fn new(positive: Category, negative: Category) -> Self {
        Self {
            positive: positive.id(),
            negative: negative.id(),
        }
    }

    /// Indices of the positive and negative members of this pairing.
    fn partition(&self, detections: &[Detection]) -> (Vec<usize>, Vec<usize>) {
        let mut positives = Vec::new();
        let mut negatives = Vec::new();
        for (index, detection) in detections.iter().enumerate() {
            if detection.category_id == self.positive {
                positives.push(index);
            } else if detection.category_id == self.negative {
                negatives.push(index);
            }
        }
        (positives, negatives)
    }
}

/// Removes overlapping and nested label artifacts from a detection set.
#[derive(Clone, Debug)]
pub struct DetectionReconciler {
    pairings: Vec<CategoryPairing>,
    overlap_threshold: f64,
}

impl Default for DetectionReconciler {
    fn default() -> Self {
        Self {
            pairings: vec![CategoryPairing::HARDHAT, CategoryPairing::VEST],
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
        }
    }
}

impl DetectionReconciler {
    /// Build a reconciler from a configured pairing table.
    ///
    /// Fails on ids outside the label table, on a pairing whose two sides are
    /// the same label, and on a threshold outside `[0, 1]`.
    pub fn new(pairings: Vec<CategoryPairing>, overlap_threshold: f64) -> Result<Self> {
        for pairing in &pairings {
            for id in [pairing.positive, pairing.negative] {
                if Category::from_id(id).is_none() {
                    return Err(anyhow!("category pairing references unknown category id {}", id));
                }
            }
            if pairing.positive == pairing.negative {
                return Err(anyhow!(
                    "category pairing pairs category {} with itself",
                    pairing.positive
                ));
            }
        }
        if !(0.0..=1.0).contains(&overlap_threshold) {
            return Err(anyhow!(
                "overlap threshold must be within [0, 1], got {}",
                overlap_threshold
            ));
        }
        Ok(Self {
            pairings,
            overlap_threshold,
        })
    }

    pub fn pairings(&self) -> &[CategoryPairing] {
        &self.pairings
    }

    /// Full reconciliation: overlap pass, containment pass, overlap pass.
    pub fn process(&self, detections: DetectionSet) -> DetectionSet {
        let before = detections.len();
        let detections = self.remove_overlapping(detections);
        let detections = self.remove_contained(detections);
        let detections = self.remove_overlapping(detections);
        if detections.len() != before {
            log::debug!(
                "reconciler removed {} of {} detections",
                before - detections.len(),
                before
            );
        }
        detections
    }

    /// Drop every negative-label box whose overlap with a positive-label box of
    /// the same pairing exceeds the threshold.
    pub fn remove_overlapping(&self, detections: DetectionSet) -> DetectionSet {
        let mut to_remove = BTreeSet::new();
        for pairing in &self.pairings {
            let (positives, negatives) = pairing.partition(&detections);
            for &positive in &positives {
                for &negative in &negatives {
                    let ratio = detections[positive]
                        .bbox
                        .overlap_ratio(&detections[negative].bbox);
                    if ratio > self.overlap_threshold {
                        to_remove.insert(negative);
                    }
                }
            }
        }
        remove_indices(detections, &to_remove)
    }

    /// Drop every box nested inside the other member of a pairing.
    ///
    /// The negative box is checked as the inner one first, so with identical
    /// boxes the negative label goes.
    pub fn remove_contained(&self, detections: DetectionSet) -> DetectionSet {
        let mut to_remove = BTreeSet::new();
        for pairing in &self.pairings {
            let (positives, negatives) = pairing.partition(&detections);
            for &positive in &positives {
                for &negative in &negatives {
                    let outer = &detections[positive].bbox;
                    let inner = &detections[negative].bbox;
                    if inner.is_contained_in(outer) {
                        to_remove.insert(negative);
                    } else if outer.is_contained_in(inner) {
                        to_remove.insert(positive);
                    }
                }
            }
        }
        remove_indices(detections, &to_remove)
    }
}

/// Stable removal by exclusion set; surviving detections keep their order.
fn remove_indices(detections: DetectionSet, to_remove: &BTreeSet<usize>) -> DetectionSet {
    if to_remove.is_empty() {
        return detections;
    }
    detections
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !to_remove.contains(index))
        .map(|(_, detection)| detection)
        .collect()
}
