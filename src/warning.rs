//! Safety warnings and the notification throttle.
//!
//! `detect_danger` turns one frame's reconciled detections into a set of
//! warnings. `WarningAggregator::evaluate` adds dispatch gating: warnings are
//! always computed, but a notification burst is only allowed when the
//! cooldown since the last burst has elapsed (and, when configured, the frame
//! falls inside the active hours). The throttle state is owned by the caller
//! and threaded through each call, one state per monitored stream.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{Local, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

use crate::detect::{BoundingBox, Category, Detection};

pub const DEFAULT_COOLDOWN_SECS: f64 = 300.0;

/// Overlap above which a missing-PPE box is attributed to a visible person.
pub const PPE_PERSON_OVERLAP: f64 = 0.5;
const VEHICLE_AREA_RATIO: f64 = 0.1;
const MACHINERY_AREA_RATIO: f64 = 0.05;
const HORIZONTAL_DANGER_FACTOR: f64 = 5.0;
const VERTICAL_DANGER_FACTOR: f64 = 1.5;
const MIN_CONES_FOR_AREA: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningKind {
    ControlledAreaIntrusion,
    MissingHardhat,
    MissingVest,
    MachineryProximity,
    VehicleProximity,
}

/// One warning for one evaluation cycle.
///
/// Value type: two warnings with the same kind and context are the same
/// warning, so a `WarningSet` never repeats itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Warning {
    ControlledAreaIntrusion { count: usize },
    MissingHardhat,
    MissingVest,
    MachineryProximity,
    VehicleProximity,
}

impl Warning {
    pub fn kind(&self) -> WarningKind {
        match self {
            Warning::ControlledAreaIntrusion { .. } => WarningKind::ControlledAreaIntrusion,
            Warning::MissingHardhat => WarningKind::MissingHardhat,
            Warning::MissingVest => WarningKind::MissingVest,
            Warning::MachineryProximity => WarningKind::MachineryProximity,
            Warning::VehicleProximity => WarningKind::VehicleProximity,
        }
    }

    /// Label of the nearby entity for proximity warnings.
    pub fn nearby_label(&self) -> Option<&'static str> {
        match self {
            Warning::MachineryProximity => Some("machinery"),
            Warning::VehicleProximity => Some("vehicle"),
            _ => None,
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::ControlledAreaIntrusion { count } => write!(
                f,
                "Warning: {} people have entered the controlled area!",
                count
            ),
            Warning::MissingHardhat => f.write_str("Warning: Someone is not wearing a hardhat!"),
            Warning::MissingVest => f.write_str("Warning: Someone is not wearing a safety vest!"),
            Warning::MachineryProximity | Warning::VehicleProximity => write!(
                f,
                "Warning: Someone is too close to {}!",
                self.nearby_label().unwrap_or_default()
            ),
        }
    }
}

pub type WarningSet = BTreeSet<Warning>;

// ----------------------------------------------------------------------------
// Danger rules
// ----------------------------------------------------------------------------

/// Derive the warnings raised by one frame's reconciled detections.
pub fn detect_danger(detections: &[Detection]) -> WarningSet {
    let mut warnings = WarningSet::new();

    let people_in_area = controlled_area(detections)
        .map(|area| people_in_controlled_area(detections, &area))
        .unwrap_or(0);
    if people_in_area > 0 {
        warnings.insert(Warning::ControlledAreaIntrusion {
            count: people_in_area,
        });
    }

    let machinery_vehicles: Vec<&Detection> = detections
        .iter()
        .filter(|d| d.is(Category::Machinery) || d.is(Category::Vehicle))
        .collect();
    let persons: Vec<&Detection> = detections
        .iter()
        .filter(|d| d.is(Category::Person))
        .filter(|p| !machinery_vehicles.iter().any(|mv| is_driver(&p.bbox, &mv.bbox)))
        .collect();

    for violation in detections
        .iter()
        .filter(|d| d.is(Category::NoHardhat) || d.is(Category::NoVest))
    {
        let worn_by_visible_person = persons
            .iter()
            .any(|p| overlap_percentage(&violation.bbox, &p.bbox) > PPE_PERSON_OVERLAP);
        if !worn_by_visible_person {
            warnings.insert(if violation.is(Category::NoHardhat) {
                Warning::MissingHardhat
            } else {
                Warning::MissingVest
            });
        }
    }

    for person in &persons {
        let nearby = machinery_vehicles
            .iter()
            .find(|mv| is_dangerously_close(&person.bbox, &mv.bbox, mv.is(Category::Vehicle)));
        if let Some(mv) = nearby {
            warnings.insert(if mv.is(Category::Vehicle) {
                Warning::VehicleProximity
            } else {
                Warning::MachineryProximity
            });
        }
    }

    warnings
}

/// Controlled area spanned by the safety cones: the convex hull of the cone
/// centres. Needs at least three cones that are not all collinear.
pub fn controlled_area(detections: &[Detection]) -> Option<ConvexPolygon> {
    let cones: Vec<(f64, f64)> = detections
        .iter()
        .filter(|d| d.is(Category::SafetyCone))
        .map(|d| d.bbox.center())
        .collect();
    if cones.len() < MIN_CONES_FOR_AREA {
        return None;
    }
    ConvexPolygon::hull(&cones)
}

/// Persons whose box centre lies strictly inside `area`.
pub fn people_in_controlled_area(detections: &[Detection], area: &ConvexPolygon) -> usize {
    detections
        .iter()
        .filter(|d| d.is(Category::Person))
        .filter(|d| area.contains(d.bbox.center()))
        .count()
}

/// Whether a person box sits in the cab of a vehicle box.
pub fn is_driver(person: &BoundingBox, vehicle: &BoundingBox) -> bool {
    let person_width = person.span_width();
    let person_height = person.span_height();
    let (p_left, p_top, p_right, p_bottom) = (
        person.x1 as f64,
        person.y1 as f64,
        person.x2 as f64,
        person.y2 as f64,
    );
    let (v_left, v_top, v_right, v_bottom) = (
        vehicle.x1 as f64,
        vehicle.y1 as f64,
        vehicle.x2 as f64,
        vehicle.y2 as f64,
    );

    // Feet well above the vehicle's bottom edge.
    if !(p_bottom < v_bottom && v_bottom - p_bottom >= person_height / 2.0) {
        return false;
    }
    if !(p_left >= v_left - person_width / 2.0 && p_right <= v_right + person_width / 2.0) {
        return false;
    }
    if p_top <= v_top {
        return false;
    }
    person_height <= vehicle.span_height() / 2.0
}

/// Intersection over union with edge-to-edge areas. Zero when the union is empty.
pub fn overlap_percentage(a: &BoundingBox, b: &BoundingBox) -> f64 {
    let w = (a.x2.min(b.x2) as f64 - a.x1.max(b.x1) as f64).max(0.0);
    let h = (a.y2.min(b.y2) as f64 - a.y1.max(b.y1) as f64).max(0.0);
    let overlap = w * h;
    let union = a.span_area() + b.span_area() - overlap;
    if union <= 0.0 {
        return 0.0;
    }
    overlap / union
}

/// Whether a person is within danger distance of a machine or vehicle.
///
/// Persons that look large relative to the object (closer to the camera than
/// the object) are never flagged.
pub fn is_dangerously_close(person: &BoundingBox, object: &BoundingBox, is_vehicle: bool) -> bool {
    let person_width = person.span_width();
    let person_height = person.span_height();
    let object_area = object.span_area();
    if object_area <= 0.0 {
        return false;
    }
    let acceptable_ratio = if is_vehicle {
        VEHICLE_AREA_RATIO
    } else {
        MACHINERY_AREA_RATIO
    };
    if person.span_area() / object_area > acceptable_ratio {
        return false;
    }

    let horizontal = (person.x2 as f64 - object.x1 as f64)
        .abs()
        .min((person.x1 as f64 - object.x2 as f64).abs());
    let vertical = (person.y2 as f64 - object.y1 as f64)
        .abs()
        .min((person.y1 as f64 - object.y2 as f64).abs());

    horizontal <= HORIZONTAL_DANGER_FACTOR * person_width
        && vertical <= VERTICAL_DANGER_FACTOR * person_height
}

/// Convex polygon with vertices in counter-clockwise order.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvexPolygon {
    vertices: Vec<(f64, f64)>,
}

impl ConvexPolygon {
    /// Convex hull (monotone chain). `None` when the points span no area.
    pub fn hull(points: &[(f64, f64)]) -> Option<Self> {
        let mut sorted: Vec<(f64, f64)> = points.to_vec();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
        sorted.dedup();
        if sorted.len() < 3 {
            return None;
        }

        let mut lower: Vec<(f64, f64)> = Vec::with_capacity(sorted.len());
        for &p in &sorted {
            while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
                lower.pop();
            }
            lower.push(p);
        }
        let mut upper: Vec<(f64, f64)> = Vec::with_capacity(sorted.len());
        for &p in sorted.iter().rev() {
            while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
                upper.pop();
            }
            upper.push(p);
        }
        lower.pop();
        upper.pop();
        lower.extend(upper);

        if lower.len() < 3 {
            return None;
        }
        Some(Self { vertices: lower })
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }

    /// Strict containment: points on the boundary are outside.
    pub fn contains(&self, point: (f64, f64)) -> bool {
        let n = self.vertices.len();
        (0..n).all(|i| cross(self.vertices[i], self.vertices[(i + 1) % n], point) > 0.0)
    }
}

fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

// ----------------------------------------------------------------------------
// Throttle
// ----------------------------------------------------------------------------

/// Local-time window `[start, end)` in which notifications may go out.
///
/// `start > end` wraps past midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHours {
    pub start: u32,
    pub end: u32,
}

impl ActiveHours {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains_hour(&self, hour: u32) -> bool {
        if self.start <= self.end {
            self.start <= hour && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }

    /// Whether the local hour of a Unix timestamp falls in the window.
    pub fn contains_timestamp(&self, timestamp: f64) -> bool {
        local_hour(timestamp).map_or(false, |hour| self.contains_hour(hour))
    }
}

impl Default for ActiveHours {
    fn default() -> Self {
        Self::new(7, 18)
    }
}

fn local_hour(timestamp: f64) -> Option<u32> {
    let secs = timestamp.floor() as i64;
    Local.timestamp_opt(secs, 0).single().map(|t| t.hour())
}

/// Per-stream throttle ledger. Starts empty at process start.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ThrottleState {
    pub last_notification_time: Option<f64>,
}

/// Global cooldown gate for notification bursts.
#[derive(Clone, Debug, PartialEq)]
pub struct NotificationThrottle {
    cooldown_secs: f64,
    active_hours: Option<ActiveHours>,
}

impl Default for NotificationThrottle {
    fn default() -> Self {
        Self {
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            active_hours: None,
        }
    }
}

impl NotificationThrottle {
    pub fn new(cooldown_secs: f64, active_hours: Option<ActiveHours>) -> Self {
        Self {
            cooldown_secs,
            active_hours,
        }
    }

    pub fn cooldown_secs(&self) -> f64 {
        self.cooldown_secs
    }

    /// True when a burst may be dispatched at `timestamp`.
    pub fn is_open(&self, state: &ThrottleState, timestamp: f64) -> bool {
        let cooled_down = state
            .last_notification_time
            .map_or(true, |last| timestamp - last > self.cooldown_secs);
        let in_hours = self
            .active_hours
            .map_or(true, |hours| hours.contains_timestamp(timestamp));
        cooled_down && in_hours
    }
}

/// Result of one evaluation cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub warnings: WarningSet,
    /// True when `warnings` should be dispatched now.
    pub dispatch: bool,
}

/// Maps reconciled detections to warnings and decides on dispatch.
#[derive(Clone, Debug, Default)]
pub struct WarningAggregator {
    throttle: NotificationThrottle,
}

impl WarningAggregator {
    pub fn new(throttle: NotificationThrottle) -> Self {
        Self { throttle }
    }

    pub fn throttle(&self) -> &NotificationThrottle {
        &self.throttle
    }

    /// Compute this cycle's warnings and the next throttle state.
    ///
    /// The cooldown starts at the dispatch decision, so a failed delivery
    /// does not reopen the gate.
    pub fn evaluate(
        &self,
        detections: &[Detection],
        timestamp: f64,
        state: ThrottleState,
    ) -> (Evaluation, ThrottleState) {
        let warnings = detect_danger(detections);
        let dispatch = !warnings.is_empty() && self.throttle.is_open(&state, timestamp);
        let next = if dispatch {
            ThrottleState {
                last_notification_time: Some(timestamp),
            }
        } else {
            state
        };
        (Evaluation { warnings, dispatch }, next)
    }
}
