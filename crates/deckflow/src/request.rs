//! Generation request model and submission-time validation

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Problems found in a submitted [`GenerationRequest`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("slide count {count} is outside the allowed range {min}..={max}")]
    SlideCountOutOfRange { count: u32, min: u32, max: u32 },

    #[error("unknown content style: {0}")]
    UnknownStyle(String),

    #[error("unknown visual template: {0}")]
    UnknownTemplate(String),

    #[error("unknown quality mode: {0}")]
    UnknownQualityMode(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Writing style requested for the generated content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentStyle {
    #[default]
    Professional,
    Creative,
    Academic,
    Startup,
    Teaching,
}

/// Per-style bounds used when generating and when reviewing content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyleGuidelines {
    pub tone: &'static str,
    pub structure: &'static str,
    pub min_bullets: usize,
    pub max_bullets: usize,
    pub max_bullet_chars: usize,
}

impl ContentStyle {
    pub const ALL: [ContentStyle; 5] = [
        ContentStyle::Professional,
        ContentStyle::Creative,
        ContentStyle::Academic,
        ContentStyle::Startup,
        ContentStyle::Teaching,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStyle::Professional => "professional",
            ContentStyle::Creative => "creative",
            ContentStyle::Academic => "academic",
            ContentStyle::Startup => "startup",
            ContentStyle::Teaching => "teaching",
        }
    }

    pub fn guidelines(&self) -> StyleGuidelines {
        match self {
            ContentStyle::Professional => StyleGuidelines {
                tone: "precise, objective, data driven",
                structure: "clear logic with layered points",
                min_bullets: 3,
                max_bullets: 5,
                max_bullet_chars: 120,
            },
            ContentStyle::Creative => StyleGuidelines {
                tone: "vivid, playful, story driven",
                structure: "unconventional flow with strong visuals",
                min_bullets: 2,
                max_bullets: 5,
                max_bullet_chars: 140,
            },
            ContentStyle::Academic => StyleGuidelines {
                tone: "rigorous, theoretical, well referenced",
                structure: "argument followed by evidence",
                min_bullets: 3,
                max_bullets: 7,
                max_bullet_chars: 200,
            },
            ContentStyle::Startup => StyleGuidelines {
                tone: "energetic, visionary, impact focused",
                structure: "problem, solution, market, team",
                min_bullets: 2,
                max_bullets: 4,
                max_bullet_chars: 100,
            },
            ContentStyle::Teaching => StyleGuidelines {
                tone: "plain, stepwise, example rich",
                structure: "concept, example, exercise, recap",
                min_bullets: 3,
                max_bullets: 6,
                max_bullet_chars: 150,
            },
        }
    }
}

impl fmt::Display for ContentStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentStyle {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentStyle::ALL
            .into_iter()
            .find(|style| style.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| ValidationError::UnknownStyle(s.to_string()))
    }
}

/// Visual template handed to the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VisualTemplate {
    #[default]
    Business,
    Creative,
    Academic,
    Minimal,
}

impl VisualTemplate {
    pub const ALL: [VisualTemplate; 4] = [
        VisualTemplate::Business,
        VisualTemplate::Creative,
        VisualTemplate::Academic,
        VisualTemplate::Minimal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VisualTemplate::Business => "business",
            VisualTemplate::Creative => "creative",
            VisualTemplate::Academic => "academic",
            VisualTemplate::Minimal => "minimal",
        }
    }
}

impl fmt::Display for VisualTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisualTemplate {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VisualTemplate::ALL
            .into_iter()
            .find(|template| template.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| ValidationError::UnknownTemplate(s.to_string()))
    }
}

/// Preset controlling the review threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    Fast,
    #[default]
    Balanced,
    High,
}

impl QualityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityMode::Fast => "fast",
            QualityMode::Balanced => "balanced",
            QualityMode::High => "high",
        }
    }
}

impl fmt::Display for QualityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(QualityMode::Fast),
            "balanced" => Ok(QualityMode::Balanced),
            "high" => Ok(QualityMode::High),
            _ => Err(ValidationError::UnknownQualityMode(s.to_string())),
        }
    }
}

/// Immutable input of one generation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic: String,
    pub slide_count: u32,
    #[serde(default)]
    pub style: ContentStyle,
    #[serde(default)]
    pub template: VisualTemplate,
    #[serde(default)]
    pub add_images: bool,
    #[serde(default)]
    pub enable_review: bool,
    #[serde(default)]
    pub auto_approve_outline: bool,
    #[serde(default)]
    pub quality_mode: QualityMode,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>, slide_count: u32) -> Self {
        Self {
            topic: topic.into(),
            slide_count,
            style: ContentStyle::default(),
            template: VisualTemplate::default(),
            add_images: false,
            enable_review: false,
            auto_approve_outline: true,
            quality_mode: QualityMode::default(),
        }
    }

    pub fn with_style(mut self, style: ContentStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_template(mut self, template: VisualTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_images(mut self, add_images: bool) -> Self {
        self.add_images = add_images;
        self
    }

    pub fn with_review(mut self, enable_review: bool) -> Self {
        self.enable_review = enable_review;
        self
    }

    pub fn with_auto_approve(mut self, auto_approve_outline: bool) -> Self {
        self.auto_approve_outline = auto_approve_outline;
        self
    }

    pub fn with_quality(mut self, quality_mode: QualityMode) -> Self {
        self.quality_mode = quality_mode;
        self
    }

    /// Parse a request from JSON; unknown enum values surface as validation errors
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let raw: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ValidationError::Malformed(e.to_string()))?;

        let field = |name: &str| raw.get(name).and_then(|v| v.as_str());
        if let Some(style) = field("style") {
            style.parse::<ContentStyle>()?;
        }
        if let Some(template) = field("template") {
            template.parse::<VisualTemplate>()?;
        }
        if let Some(mode) = field("quality_mode") {
            mode.parse::<QualityMode>()?;
        }

        serde_json::from_value(raw).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Reject the request before any run state exists
    pub fn validate(&self, min_slides: u32, max_slides: u32) -> Result<(), ValidationError> {
        if self.topic.trim().is_empty() {
            return Err(ValidationError::EmptyTopic);
        }
        if self.slide_count < min_slides || self.slide_count > max_slides {
            return Err(ValidationError::SlideCountOutOfRange {
                count: self.slide_count,
                min: min_slides,
                max: max_slides,
            });
        }
        Ok(())
    }
}
