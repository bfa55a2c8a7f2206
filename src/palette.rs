//! Category tints.
//!
//! Every colored reading goes through one table: a [`Reading`] names its
//! category, and the category selects a ladder of rungs checked from the top.
//! Numeric categories climb by threshold; weather matches description keywords.

use serde::Serialize;

/// Linear RGB in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Rgb {
    pub fn from_u32(hex: u32) -> Self {
        Self {
            r: ((hex >> 16) & 0xff) as f32 / 255.0,
            g: ((hex >> 8) & 0xff) as f32 / 255.0,
            b: (hex & 0xff) as f32 / 255.0,
        }
    }

    pub fn lerp(self, other: Rgb, t: f32) -> Rgb {
        Rgb {
            r: self.r + (other.r - self.r) * t,
            g: self.g + (other.g - self.g) * t,
            b: self.b + (other.b - self.b) * t,
        }
    }

    pub fn to_hex(self) -> String {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Baseline,
    Moderate,
    Elevated,
    Critical,
}

/// Outcome of classifying a reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tint {
    pub severity: Severity,
    pub color: Rgb,
}

struct Rung {
    above: f32,
    severity: Severity,
    color: u32,
}

struct Ladder {
    rungs: &'static [Rung],
    floor: (Severity, u32),
}

impl Ladder {
    fn classify(&self, value: f32) -> Tint {
        let (severity, color) = self
            .rungs
            .iter()
            .find(|rung| value > rung.above)
            .map(|rung| (rung.severity, rung.color))
            .unwrap_or(self.floor);
        Tint {
            severity,
            color: Rgb::from_u32(color),
        }
    }
}

const CONGESTION: Ladder = Ladder {
    rungs: &[
        Rung {
            above: 0.7,
            severity: Severity::Critical,
            color: 0xff2222,
        },
        Rung {
            above: 0.4,
            severity: Severity::Elevated,
            color: 0xff9933,
        },
        Rung {
            above: 0.15,
            severity: Severity::Moderate,
            color: 0xffee55,
        },
    ],
    floor: (Severity::Baseline, 0xaaccff),
};

// Higher energy scores mean a cleaner grid.
const ENERGY: Ladder = Ladder {
    rungs: &[Rung {
        above: 60.0,
        severity: Severity::Baseline,
        color: 0x00ff88,
    }],
    floor: (Severity::Elevated, 0xff4444),
};

/// Checked in order; the first keyword contained in the description wins.
const WEATHER: &[(&str, Severity, u32)] = &[
    ("clear sky", Severity::Baseline, 0x37c6fa),
    ("mainly clear", Severity::Baseline, 0x37c6fa),
    ("partly", Severity::Baseline, 0xecc67a),
    ("overcast", Severity::Moderate, 0x4a595b),
    ("fog", Severity::Moderate, 0x7e7d7d),
    ("rain", Severity::Elevated, 0x6c7ca4),
    ("drizzle", Severity::Moderate, 0x6c7ca4),
    ("snow", Severity::Elevated, 0xffffff),
    ("thunder", Severity::Critical, 0x6633cc),
];

const WEATHER_FALLBACK: (Severity, u32) = (Severity::Baseline, 0x734d4d);

/// A value tagged with the category that decides how it is colored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading<'a> {
    /// Congestion density in [0, 1].
    Congestion(f32),
    /// Grid cleanliness score in [0, 100].
    Energy(f64),
    /// Free-text weather description.
    Weather(&'a str),
}

impl Reading<'_> {
    pub fn tint(&self) -> Tint {
        match *self {
            Reading::Congestion(density) => CONGESTION.classify(density),
            Reading::Energy(score) => ENERGY.classify(score as f32),
            Reading::Weather(description) => {
                let description = description.to_lowercase();
                let (severity, color) = WEATHER
                    .iter()
                    .find(|(keyword, _, _)| description.contains(keyword))
                    .map(|&(_, severity, color)| (severity, color))
                    .unwrap_or(WEATHER_FALLBACK);
                Tint {
                    severity,
                    color: Rgb::from_u32(color),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn congestion_thresholds_are_exclusive() {
        assert_eq!(Reading::Congestion(0.71).tint().severity, Severity::Critical);
        assert_eq!(Reading::Congestion(0.7).tint().severity, Severity::Elevated);
        assert_eq!(Reading::Congestion(0.41).tint().severity, Severity::Elevated);
        assert_eq!(Reading::Congestion(0.2).tint().severity, Severity::Moderate);
        assert_eq!(Reading::Congestion(0.15).tint().severity, Severity::Baseline);
        assert_eq!(Reading::Congestion(0.0).tint().color.to_hex(), "#aaccff");
    }

    #[test]
    fn energy_is_green_only_above_sixty() {
        assert_eq!(Reading::Energy(75.0).tint().color.to_hex(), "#00ff88");
        assert_eq!(Reading::Energy(60.0).tint().color.to_hex(), "#ff4444");
    }

    #[test]
    fn weather_matches_keywords_case_insensitively() {
        assert_eq!(Reading::Weather("Clear sky").tint().color.to_hex(), "#37c6fa");
        assert_eq!(Reading::Weather("Heavy rain").tint().severity, Severity::Elevated);
        assert_eq!(Reading::Weather("Thunderstorm").tint().severity, Severity::Critical);
        assert_eq!(Reading::Weather("Light drizzle").tint().severity, Severity::Moderate);
        assert_eq!(Reading::Weather("Volcanic ash").tint().color.to_hex(), "#734d4d");
    }

    #[test]
    fn colors_interpolate() {
        let a = Rgb::from_u32(0x000000);
        let b = Rgb::from_u32(0xffffff);
        assert_eq!(a.lerp(b, 0.5).to_hex(), "#808080");
        assert_eq!(a.lerp(b, 1.0), b);
    }
}
