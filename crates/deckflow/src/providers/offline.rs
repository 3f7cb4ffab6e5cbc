//! Deterministic built-in collaborators for running without a model or image API

use async_trait::async_trait;

use crate::{
    request::ContentStyle,
    workflow::{SlideContent, SlideSpec, SlideType},
};

use super::{ContentSource, ImageProvider, ImageRef, SourceError, StyleContext};

const ASPECTS: [&str; 8] = [
    "context",
    "key drivers",
    "current impact",
    "open risks",
    "near-term outlook",
    "real examples",
    "success metrics",
    "next actions",
];

/// Cover first, table of contents second (decks of 4+), closing last, content in between
pub fn conventional_outline(topic: &str, slide_count: u32) -> Vec<SlideSpec> {
    let count = slide_count.max(2);
    let has_toc = count >= 4;
    let mut outline = Vec::with_capacity(count as usize);
    let mut section = 0;

    for index in 0..count {
        let spec = if index == 0 {
            SlideSpec::new(index, topic, SlideType::Cover)
                .with_description(format!("An overview of {topic}"))
        } else if index == count - 1 {
            SlideSpec::new(index, "Summary and next steps", SlideType::Closing)
        } else if index == 1 && has_toc {
            SlideSpec::new(index, "Agenda", SlideType::Toc)
        } else {
            section += 1;
            SlideSpec::new(index, format!("{topic}: part {section}"), SlideType::Content)
        };
        outline.push(spec);
    }

    outline
}

/// Content source that writes template text instead of calling a model
#[derive(Debug, Clone, Default)]
pub struct OfflineContentSource;

impl OfflineContentSource {
    pub fn new() -> Self {
        Self
    }

    fn bullets_for(spec: &SlideSpec, context: &StyleContext) -> Vec<String> {
        let guidelines = context.style.guidelines();
        let count = (guidelines.min_bullets + 1).min(guidelines.max_bullets);
        let lead = match context.style {
            ContentStyle::Professional => "Key finding",
            ContentStyle::Creative => "Picture this",
            ContentStyle::Academic => "Evidence",
            ContentStyle::Startup => "Opportunity",
            ContentStyle::Teaching => "Step",
        };

        // Consecutive slides start `count` aspects apart so their wording does not overlap
        let offset = spec.index as usize * count;
        (0..count)
            .map(|n| {
                let aspect = ASPECTS[(offset + n) % ASPECTS.len()];
                format!("{lead}: {aspect} of {}", spec.title)
            })
            .collect()
    }
}

#[async_trait]
impl ContentSource for OfflineContentSource {
    async fn generate_outline(
        &self,
        topic: &str,
        slide_count: u32,
        _style: ContentStyle,
    ) -> Result<Vec<SlideSpec>, SourceError> {
        if topic.trim().is_empty() {
            return Err(SourceError::invalid_request("topic is empty"));
        }
        Ok(conventional_outline(topic.trim(), slide_count))
    }

    async fn generate_slide_content(
        &self,
        spec: &SlideSpec,
        context: &StyleContext,
    ) -> Result<SlideContent, SourceError> {
        let content = match spec.slide_type {
            SlideType::Cover => SlideContent::new(
                spec.title.clone(),
                vec![spec
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("A closer look at {}", context.topic))],
            ),
            SlideType::Toc => SlideContent::new(
                spec.title.clone(),
                (1..=context.total_slides.saturating_sub(3).max(1))
                    .map(|n| format!("{}: part {n}", context.topic))
                    .collect(),
            ),
            SlideType::Closing => SlideContent::new(
                spec.title.clone(),
                vec![
                    format!("Recap of {}", context.topic),
                    "Questions and discussion".to_string(),
                ],
            ),
            SlideType::Content => SlideContent::new(spec.title.clone(), Self::bullets_for(spec, context)),
        };

        let notes = match &context.guidance {
            Some(guidance) => format!("Revised after review: {guidance}"),
            None => format!("Tone: {}", context.style.guidelines().tone),
        };

        Ok(content.with_notes(notes))
    }
}

/// Image provider that derives a stable placeholder URL from the query
#[derive(Debug, Clone)]
pub struct PlaceholderImageProvider {
    base_url: String,
}

impl Default for PlaceholderImageProvider {
    fn default() -> Self {
        Self {
            base_url: "https://picsum.photos/seed".to_string(),
        }
    }
}

impl PlaceholderImageProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ImageProvider for PlaceholderImageProvider {
    async fn search(&self, query: &str) -> Result<ImageRef, SourceError> {
        let slug = seed_slug(query);
        if slug.is_empty() {
            return Err(SourceError::new(super::ErrorKind::NotFound, "empty image query"));
        }
        let url = format!("{}/{}/1280/720", self.base_url, slug);

        Ok(ImageRef {
            url,
            query: query.to_string(),
            attribution: Some("placeholder".to_string()),
        })
    }
}

/// Lowercase alphanumeric words joined by dashes
fn seed_slug(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}
