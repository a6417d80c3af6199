//! Heuristic content analysis: brightness, palette, category and quality.
//!
//! Everything here is pure and works on sparse pixel grids, so large frames
//! cost roughly the same as small ones. Degenerate frames (0×0) produce
//! neutral values instead of errors.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::types::Label;

/// Brightness reported when no pixel could be sampled.
const NEUTRAL_BRIGHTNESS: f64 = 0.5;
const MAX_DOMINANT_COLORS: usize = 3;
const REPORT_MAX_LABELS: usize = 7;

const QUALITY_BASE: f64 = 0.5;
const QUALITY_HIGH_RES_PIXELS: u64 = 1_000_000;
const QUALITY_HIGH_RES_BONUS: f64 = 0.2;
const QUALITY_MID_RES_PIXELS: u64 = 500_000;
const QUALITY_MID_RES_BONUS: f64 = 0.1;
const QUALITY_CONFIDENCE_WEIGHT: f64 = 0.3;

/// Keyword sets checked in order; the first set containing any label wins.
const CATEGORY_KEYWORDS: &[(Category, &[&str])] = &[
    (Category::PersonPeople, &["person", "face", "people", "human"]),
    (Category::Animal, &["animal", "dog", "cat", "bird"]),
    (Category::Nature, &["plant", "flower", "tree", "leaf"]),
    (Category::Architecture, &["building", "architecture", "house"]),
    (Category::Food, &["food", "meal", "dish"]),
    (Category::Vehicle, &["vehicle", "car", "bike", "transport"]),
    (Category::Document, &["document", "text", "paper"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerConfig {
    /// Row/column stride of the brightness sampling grid.
    pub brightness_stride: u32,
    /// Row/column stride of the palette sampling grid.
    pub color_stride: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            brightness_stride: 10,
            color_stride: 20,
        }
    }
}

/// Coarse palette bucket for a single pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorBucket {
    White,
    Black,
    Red,
    Green,
    Blue,
    Yellow,
    Light,
    Dark,
}

impl ColorBucket {
    pub fn classify([r, g, b]: [u8; 3]) -> Self {
        if r > 200 && g > 200 && b > 200 {
            ColorBucket::White
        } else if r < 50 && g < 50 && b < 50 {
            ColorBucket::Black
        } else if r > g && r > b {
            ColorBucket::Red
        } else if g > r && g > b {
            ColorBucket::Green
        } else if b > r && b > g {
            ColorBucket::Blue
        } else if r > 150 && g > 150 && b < 100 {
            ColorBucket::Yellow
        } else if (r as u32 + g as u32 + b as u32) / 3 > 128 {
            ColorBucket::Light
        } else {
            ColorBucket::Dark
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ColorBucket::White => "White",
            ColorBucket::Black => "Black",
            ColorBucket::Red => "Red",
            ColorBucket::Green => "Green",
            ColorBucket::Blue => "Blue",
            ColorBucket::Yellow => "Yellow",
            ColorBucket::Light => "Light",
            ColorBucket::Dark => "Dark",
        }
    }
}

impl fmt::Display for ColorBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Image category derived from classifier labels.
///
/// Serialized as its display string, so a free-form label category
/// round-trips as plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Category {
    PersonPeople,
    Animal,
    Nature,
    Architecture,
    Food,
    Vehicle,
    Document,
    /// No keyword matched; the most confident label's text.
    Label(String),
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::PersonPeople => "Person/People",
            Category::Animal => "Animal",
            Category::Nature => "Nature",
            Category::Architecture => "Architecture",
            Category::Food => "Food",
            Category::Vehicle => "Vehicle",
            Category::Document => "Document",
            Category::Label(text) => text,
            Category::Unknown => "Unknown",
        }
    }

    /// Categorize a label set. See [`CATEGORY_KEYWORDS`] for the ordering.
    pub fn from_labels(labels: &[Label]) -> Self {
        if labels.is_empty() {
            return Category::Unknown;
        }

        let lowered: Vec<String> = labels.iter().map(|l| l.text.to_lowercase()).collect();
        for (category, keywords) in CATEGORY_KEYWORDS {
            if lowered.iter().any(|text| keywords.contains(&text.as_str())) {
                return category.clone();
            }
        }

        // Fall back to the most confident label; the first one wins ties.
        let mut top = &labels[0];
        for label in &labels[1..] {
            if label.confidence > top.confidence {
                top = label;
            }
        }
        Category::Label(top.text.clone())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        category.as_str().to_string()
    }
}

impl From<String> for Category {
    fn from(text: String) -> Self {
        match text.as_str() {
            "Person/People" => Category::PersonPeople,
            "Animal" => Category::Animal,
            "Nature" => Category::Nature,
            "Architecture" => Category::Architecture,
            "Food" => Category::Food,
            "Vehicle" => Category::Vehicle,
            "Document" => Category::Document,
            "Unknown" => Category::Unknown,
            _ => Category::Label(text),
        }
    }
}

/// Descriptive statistics for one analyzed image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Label text to confidence; a repeated label keeps its last confidence.
    pub labels: HashMap<String, f32>,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    /// Mean sampled intensity in [0, 1].
    pub brightness: f64,
    /// Most frequent palette buckets, most frequent first (at most 3).
    pub dominant_colors: Vec<ColorBucket>,
    pub category: Category,
    /// Composite score in [0, 1].
    pub quality_score: f64,
}

impl AnalysisResult {
    /// Multi-line human-readable report.
    pub fn report(&self) -> String {
        let mut out = String::from("Analysis report\n\n");
        out.push_str("Image properties:\n");
        out.push_str(&format!("  Resolution:    {}x{}\n", self.width, self.height));
        out.push_str(&format!("  Aspect ratio:  {:.2}\n", self.aspect_ratio));
        out.push_str(&format!("  Brightness:    {:.0}%\n", self.brightness * 100.0));
        out.push_str(&format!("  Quality score: {:.0}%\n\n", self.quality_score * 100.0));

        out.push_str("Dominant colors:\n");
        for color in &self.dominant_colors {
            out.push_str(&format!("  {color}\n"));
        }
        out.push_str(&format!("\nCategory: {}\n\n", self.category));

        out.push_str("Detected labels:\n");
        let mut labels: Vec<(&String, &f32)> = self.labels.iter().collect();
        labels.sort_by(|a, b| b.1.total_cmp(a.1).then_with(|| a.0.cmp(b.0)));
        if labels.is_empty() {
            out.push_str("  (none)\n");
        }
        for (text, confidence) in labels.into_iter().take(REPORT_MAX_LABELS) {
            out.push_str(&format!("  {text} ({:.0}%)\n", confidence * 100.0));
        }
        out
    }
}

/// Stateless analyzer; safe to share across threads.
#[derive(Debug, Clone, Default)]
pub struct ContentAnalyzer {
    config: AnalyzerConfig,
}

impl ContentAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, frame: &Frame, labels: &[Label]) -> AnalysisResult {
        let aspect_ratio = if frame.height() == 0 {
            0.0
        } else {
            frame.width() as f64 / frame.height() as f64
        };

        let result = AnalysisResult {
            labels: labels.iter().map(|l| (l.text.clone(), l.confidence)).collect(),
            width: frame.width(),
            height: frame.height(),
            aspect_ratio,
            brightness: self.brightness(frame),
            dominant_colors: self.dominant_colors(frame),
            category: Category::from_labels(labels),
            quality_score: quality_score(frame.pixel_count(), labels),
        };

        tracing::debug!(
            width = result.width,
            height = result.height,
            brightness = result.brightness,
            category = %result.category,
            quality = result.quality_score,
            "image analyzed"
        );
        result
    }

    /// Mean of per-pixel integer `(r + g + b) / 3` over the grid, scaled to [0, 1].
    pub fn brightness(&self, frame: &Frame) -> f64 {
        let mut total: u64 = 0;
        let mut samples: u64 = 0;
        for [r, g, b] in frame.sample_grid(self.config.brightness_stride) {
            total += (r as u64 + g as u64 + b as u64) / 3;
            samples += 1;
        }
        if samples == 0 {
            return NEUTRAL_BRIGHTNESS;
        }
        total as f64 / samples as f64 / 255.0
    }

    /// Top palette buckets by count; ties keep first-encountered order.
    pub fn dominant_colors(&self, frame: &Frame) -> Vec<ColorBucket> {
        // (bucket, count) in first-seen order
        let mut counts: Vec<(ColorBucket, usize)> = Vec::new();
        for pixel in frame.sample_grid(self.config.color_stride) {
            let bucket = ColorBucket::classify(pixel);
            match counts.iter_mut().find(|(b, _)| *b == bucket) {
                Some((_, n)) => *n += 1,
                None => counts.push((bucket, 1)),
            }
        }
        // stable sort keeps discovery order among equal counts
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        counts
            .into_iter()
            .take(MAX_DOMINANT_COLORS)
            .map(|(bucket, _)| bucket)
            .collect()
    }
}

fn quality_score(pixel_count: u64, labels: &[Label]) -> f64 {
    let mut score = QUALITY_BASE;
    if pixel_count > QUALITY_HIGH_RES_PIXELS {
        score += QUALITY_HIGH_RES_BONUS;
    } else if pixel_count > QUALITY_MID_RES_PIXELS {
        score += QUALITY_MID_RES_BONUS;
    }
    if !labels.is_empty() {
        let avg = labels.iter().map(|l| l.confidence as f64).sum::<f64>() / labels.len() as f64;
        score += avg * QUALITY_CONFIDENCE_WEIGHT;
    }
    score.min(1.0)
}
