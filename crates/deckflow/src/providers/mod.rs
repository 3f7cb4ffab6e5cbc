//! Collaborator traits consumed by the workflow
//!
//! - [`ContentSource`]: produces the outline and per-slide content (normally a generative model)
//! - [`ImageProvider`]: looks up an image for a query
//! - [`Renderer`]: turns the finished outline and slides into a deck file

pub mod markdown;
pub mod offline;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    request::{ContentStyle, GenerationRequest, VisualTemplate},
    workflow::{SlideContent, SlideSpec},
};

pub use markdown::MarkdownRenderer;
pub use offline::{OfflineContentSource, PlaceholderImageProvider};

/// Classification of a collaborator failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RateLimited,
    Network,
    ProviderError,
    MalformedResponse,
    InvalidRequest,
    QuotaExhausted,
    NotFound,
    WriteError,
    UnsupportedTemplate,
}

impl ErrorKind {
    /// Transient kinds are retried under the stage policy
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::Network
                | ErrorKind::ProviderError
                | ErrorKind::MalformedResponse
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::NotFound => "not_found",
            ErrorKind::WriteError => "write_error",
            ErrorKind::UnsupportedTemplate => "unsupported_template",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by any collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SourceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedResponse, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Reference to an image found for a slide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
}

impl ImageRef {
    pub fn new(url: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: query.into(),
            attribution: None,
        }
    }
}

/// Context handed to the content source for every slide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleContext {
    pub topic: String,
    pub style: ContentStyle,
    pub total_slides: u32,
    /// Reviewer feedback when a slide is being regenerated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

impl StyleContext {
    pub fn for_request(request: &GenerationRequest) -> Self {
        Self {
            topic: request.topic.clone(),
            style: request.style,
            total_slides: request.slide_count,
            guidance: None,
        }
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = Some(guidance.into());
        self
    }
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn generate_outline(
        &self,
        topic: &str,
        slide_count: u32,
        style: ContentStyle,
    ) -> Result<Vec<SlideSpec>, SourceError>;

    async fn generate_slide_content(
        &self,
        spec: &SlideSpec,
        context: &StyleContext,
    ) -> Result<SlideContent, SourceError>;
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<ImageRef, SourceError>;
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn assemble(
        &self,
        outline: &[SlideSpec],
        slides: &BTreeMap<String, SlideContent>,
        template: VisualTemplate,
    ) -> Result<PathBuf, SourceError>;
}

/// Build an image query from the slide title, the topic and the lead words of the first bullets
pub fn image_query(spec: &SlideSpec, content: &SlideContent, topic: &str) -> String {
    let mut keywords: Vec<&str> = Vec::new();
    if !spec.title.trim().is_empty() {
        keywords.push(spec.title.trim());
    }
    if !topic.trim().is_empty() {
        keywords.push(topic.trim());
    }
    for bullet in content.bullets.iter().take(2) {
        if let Some(word) = bullet.split_whitespace().next() {
            keywords.push(word);
        }
    }
    keywords.truncate(3);
    keywords.join(" ")
}
