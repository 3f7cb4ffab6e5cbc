//! Markdown deck renderer

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    request::VisualTemplate,
    workflow::{SlideContent, SlideSpec, SlideType},
};

use super::{ErrorKind, Renderer, SourceError};

const MAX_FILE_STEM: usize = 50;

/// Writes one Markdown file per deck into an output directory
#[derive(Debug, Clone)]
pub struct MarkdownRenderer {
    output_dir: PathBuf,
}

impl MarkdownRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.output_dir
    }

    /// Render the deck to a Markdown string
    pub fn render(
        outline: &[SlideSpec],
        slides: &BTreeMap<String, SlideContent>,
        template: VisualTemplate,
    ) -> String {
        let mut out = String::new();
        let deck_title = outline.first().map(|s| s.title.as_str()).unwrap_or("Presentation");

        let _ = writeln!(out, "---");
        let _ = writeln!(out, "title: {deck_title}");
        let _ = writeln!(out, "theme: {template}");
        let _ = writeln!(out, "slides: {}", outline.len());
        let _ = writeln!(out, "---");

        for spec in outline {
            let Some(content) = slides.get(&spec.id) else {
                continue;
            };
            out.push('\n');
            match spec.slide_type {
                SlideType::Cover => {
                    let _ = writeln!(out, "# {}", content.title);
                    for line in &content.bullets {
                        let _ = writeln!(out, "\n_{line}_");
                    }
                }
                _ => {
                    let _ = writeln!(out, "## {}", content.title);
                    out.push('\n');
                    for (n, line) in content.bullets.iter().enumerate() {
                        if spec.slide_type == SlideType::Toc {
                            let _ = writeln!(out, "{}. {line}", n + 1);
                        } else {
                            let _ = writeln!(out, "- {line}");
                        }
                    }
                }
            }
            if let Some(image) = &content.image {
                let _ = writeln!(out, "\n![{}]({})", image.query, image.url);
            }
            if let Some(notes) = &content.notes {
                let _ = writeln!(out, "\n<!-- notes: {notes} -->");
            }
            out.push_str("\n---\n");
        }

        out
    }
}

/// Keep alphanumerics, dashes and underscores; collapse the rest to underscores
pub fn sanitize_file_stem(name: &str) -> String {
    let mut stem: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    while stem.contains("__") {
        stem = stem.replace("__", "_");
    }
    let stem: String = stem.trim_matches('_').chars().take(MAX_FILE_STEM).collect();
    if stem.is_empty() {
        "presentation".to_string()
    } else {
        stem
    }
}

#[async_trait]
impl Renderer for MarkdownRenderer {
    async fn assemble(
        &self,
        outline: &[SlideSpec],
        slides: &BTreeMap<String, SlideContent>,
        template: VisualTemplate,
    ) -> Result<PathBuf, SourceError> {
        if outline.is_empty() {
            return Err(SourceError::invalid_request("cannot render an empty outline"));
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| SourceError::new(ErrorKind::WriteError, e.to_string()))?;

        let stem = sanitize_file_stem(&outline[0].title);
        let file_name = format!("{}_{}.md", stem, Utc::now().format("%Y%m%d_%H%M%S%3f"));
        let path = self.output_dir.join(file_name);

        let body = Self::render(outline, slides, template);
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| SourceError::new(ErrorKind::WriteError, e.to_string()))?;

        tracing::info!("[RENDERER] Wrote {} slides to {}", outline.len(), path.display());
        Ok(path)
    }
}
