use std::fmt;

use serde::{Deserialize, Serialize};

use crate::geometry::Rect;

/// One sweep of the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Pass {
    /// Broad-scale sweep that estimates the global render scale.
    Coarse,
    /// Targeted rescan around the locked scale.
    Refine,
    /// Full rescan of whatever passes 1 and 2 left unresolved.
    Rescan,
}

impl Pass {
    pub fn number(self) -> u8 {
        match self {
            Pass::Coarse => 1,
            Pass::Refine => 2,
            Pass::Rescan => 3,
        }
    }

    /// NMS ordering: lower wins. Pass 2 is scale-refined and outranks pass 1.
    pub fn priority(self) -> u8 {
        match self {
            Pass::Refine => 1,
            Pass::Coarse => 2,
            Pass::Rescan => 3,
        }
    }
}

impl From<Pass> for u8 {
    fn from(pass: Pass) -> Self {
        pass.number()
    }
}

impl TryFrom<u8> for Pass {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Pass::Coarse),
            2 => Ok(Pass::Refine),
            3 => Ok(Pass::Rescan),
            other => Err(format!("unknown pass {other}")),
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropType {
    Cropped,
    Uncropped,
}

impl fmt::Display for CropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CropType::Cropped => f.write_str("cropped"),
            CropType::Uncropped => f.write_str("uncropped"),
        }
    }
}

/// Template rotation, serialized as degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum Rotation {
    Upright,
    Clockwise90,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Upright => 0,
            Rotation::Clockwise90 => 90,
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::Upright),
            90 => Ok(Rotation::Clockwise90),
            other => Err(format!("unsupported rotation {other}")),
        }
    }
}

/// Identity and display fields of a catalog item, carried on every candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRef {
    pub id: String,
    pub name: String,
    pub short_name: Option<String>,
    pub wiki_link: Option<String>,
}

/// One proposed location of a catalog item in the screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub item: ItemRef,
    pub confidence: f32,
    /// Match location and scaled template size.
    pub rect: Rect,
    pub rotation: Rotation,
    pub scale: f32,
    pub pass: Pass,
    pub crop_type: CropType,
}

impl Candidate {
    pub fn item_id(&self) -> &str {
        &self.item.id
    }
}
