//! Static town zones and the free-text zone extractor.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Zone every agent starts in and returns to on reset.
pub const DEFAULT_ZONE: &str = "PLAZA";

/// A named coarse location with a fixed anchor coordinate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub x: f64,
    pub y: f64,
}

const ZONE_TABLE: &[(&str, f64, f64)] = &[
    ("PLAZA", 320.0, 300.0),
    ("STAGE", 400.0, 120.0),
    ("CAFE", 150.0, 300.0),
    ("PARK", 620.0, 340.0),
    ("LIBRARY", 120.0, 90.0),
    ("MARKET", 520.0, 480.0),
];

/// Read-only zone table plus a compiled matcher over its names
pub struct ZoneMap {
    zones: Vec<Zone>,
    matcher: Regex,
}

impl ZoneMap {
    /// Build the map from the built-in town layout
    pub fn town() -> Self {
        let zones: Vec<Zone> = ZONE_TABLE
            .iter()
            .map(|(name, x, y)| Zone {
                name: name.to_string(),
                x: *x,
                y: *y,
            })
            .collect();
        let matcher = build_matcher(&zones).expect("built-in zone names form a valid pattern");
        Self { zones, matcher }
    }

    /// Look up a zone by name, ignoring case
    pub fn get(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn default_zone(&self) -> &Zone {
        self.get(DEFAULT_ZONE).unwrap_or(&self.zones[0])
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Find the zone mentioned earliest in `text` as a whole word.
    ///
    /// Matching is case-insensitive and position-ordered: "park then stage"
    /// yields PARK regardless of table order. Returns `None` for empty text
    /// or when no zone name appears.
    pub fn extract_zone(&self, text: &str) -> Option<&Zone> {
        let found = self.matcher.find(text)?;
        self.get(found.as_str())
    }
}

fn build_matcher(zones: &[Zone]) -> Result<Regex, regex::Error> {
    let alternation = zones
        .iter()
        .map(|z| regex::escape(&z.name))
        .collect::<Vec<_>>()
        .join("|");
    RegexBuilder::new(&format!(r"\b(?:{})\b", alternation))
        .case_insensitive(true)
        .build()
}

impl Default for ZoneMap {
    fn default() -> Self {
        Self::town()
    }
}
