//! Chart descriptions from a vision-capable model
//!
//! Every figure an execution captures is described in text so the agent can
//! reason about plots it produced. Analysis never fails: an unconfigured or
//! failing model yields an explanatory sentence instead of a description.

use std::sync::Arc;

use tracing::warn;

use super::client::ChatModel;

/// Sentence returned when no vision model is configured
pub const VISION_NOT_CONFIGURED: &str =
    "Vision model not configured; the image cannot be analysed. Configure a vision model and retry.";

/// Prompt sent with every captured figure
pub const CHART_PROMPT: &str = "This is a data visualisation chart. Describe in detail what it shows, \
including the chart type, axis labels, data trends and any other key information.";

/// Describes captured images with an optional vision model
#[derive(Clone, Default)]
pub struct ImageAnalyzer {
    model: Option<Arc<dyn ChatModel>>,
}

impl ImageAnalyzer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model: Some(model) }
    }

    /// Analyzer that answers every request with [`VISION_NOT_CONFIGURED`]
    pub fn unconfigured() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.model.is_some()
    }

    /// Describe base64 `data` in `format` (e.g. `png`)
    pub async fn describe(&self, data: &str, format: &str) -> String {
        let Some(model) = &self.model else {
            return VISION_NOT_CONFIGURED.to_string();
        };
        let url = data_url(data, format);
        match model.describe_image(&url, CHART_PROMPT).await {
            Ok(description) => description,
            Err(e) => {
                warn!(model = model.model_name(), error = %e, "image analysis failed");
                format!("Vision model call failed: {e}. Check the vision model configuration.")
            }
        }
    }
}

impl std::fmt::Debug for ImageAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAnalyzer")
            .field("model", &self.model.as_ref().map(|m| m.model_name()))
            .finish()
    }
}

pub fn data_url(data: &str, format: &str) -> String {
    format!("data:image/{format};base64,{data}")
}
