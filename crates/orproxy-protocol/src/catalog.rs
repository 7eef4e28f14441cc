//! Upstream `/models` catalog shapes.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogResponse {
    #[serde(default)]
    pub data: Vec<CatalogModel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogModel {
    pub id: String,
    #[serde(default)]
    pub context_length: i64,
    #[serde(default)]
    pub supported_parameters: Vec<String>,
    #[serde(default)]
    pub top_provider: TopProvider,
    #[serde(default)]
    pub pricing: Pricing,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopProvider {
    #[serde(default)]
    pub context_length: i64,
}

/// Prices arrive as decimal strings; a free model has both components
/// literally `"0"`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub completion: String,
}

impl CatalogModel {
    pub fn is_free(&self) -> bool {
        self.pricing.prompt == "0" && self.pricing.completion == "0"
    }

    /// Per-provider limit when reported, top-level limit otherwise.
    pub fn effective_context_length(&self) -> i64 {
        if self.top_provider.context_length != 0 {
            self.top_provider.context_length
        } else {
            self.context_length
        }
    }

    pub fn supports_tool_use(&self) -> bool {
        self.supported_parameters
            .iter()
            .any(|p| p == "tools" || p == "tool_choice")
    }
}
