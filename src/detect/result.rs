use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::geometry::BoundingBox;

/// Label table of the reference deployment.
///
/// The numeric ids are fixed by the detection model; they must not be reordered.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Hardhat,
    Mask,
    NoHardhat,
    NoMask,
    NoVest,
    Person,
    SafetyCone,
    Vest,
    Machinery,
    Vehicle,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::Hardhat,
        Category::Mask,
        Category::NoHardhat,
        Category::NoMask,
        Category::NoVest,
        Category::Person,
        Category::SafetyCone,
        Category::Vest,
        Category::Machinery,
        Category::Vehicle,
    ];

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn id(self) -> u8 {
        match self {
            Category::Hardhat => 0,
            Category::Mask => 1,
            Category::NoHardhat => 2,
            Category::NoMask => 3,
            Category::NoVest => 4,
            Category::Person => 5,
            Category::SafetyCone => 6,
            Category::Vest => 7,
            Category::Machinery => 8,
            Category::Vehicle => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Category::Hardhat => "hardhat",
            Category::Mask => "mask",
            Category::NoHardhat => "no-hardhat",
            Category::NoMask => "no-mask",
            Category::NoVest => "no-vest",
            Category::Person => "person",
            Category::SafetyCone => "safety-cone",
            Category::Vest => "vest",
            Category::Machinery => "machinery",
            Category::Vehicle => "vehicle",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One detector output box.
///
/// On the wire a detection is the array `[x1, y1, x2, y2, confidence, category_id]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub category_id: u8,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, category_id: u8) -> Self {
        Self {
            bbox,
            confidence,
            category_id,
        }
    }

    /// Known label for this detection, `None` for ids outside the table.
    pub fn category(&self) -> Option<Category> {
        Category::from_id(self.category_id)
    }

    pub fn is(&self, category: Category) -> bool {
        self.category_id == category.id()
    }
}

/// Detections for one frame, in detector order.
pub type DetectionSet = Vec<Detection>;

impl Serialize for Detection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            self.bbox.x1,
            self.bbox.y1,
            self.bbox.x2,
            self.bbox.y2,
            self.confidence,
            self.category_id,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Detection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Coordinates may arrive as floats; they are truncated like the detector does.
        let (x1, y1, x2, y2, confidence, category): (f64, f64, f64, f64, f64, f64) =
            Deserialize::deserialize(deserializer)?;
        if !(0.0..=255.0).contains(&category) || category.fract() != 0.0 {
            return Err(D::Error::custom(format!(
                "category id {} is not a small non-negative integer",
                category
            )));
        }
        Ok(Detection {
            bbox: BoundingBox::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32),
            confidence: confidence as f32,
            category_id: category as u8,
        })
    }
}
