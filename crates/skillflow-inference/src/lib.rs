pub mod cleaner;
pub mod http;

use std::sync::Arc;

use skillflow_core::config::InferenceConfig;
use skillflow_core::error::Result;
use skillflow_core::traits::InferenceClient;

pub use http::HttpInferenceClient;

/// Build the inference client described by config.
pub fn create_client(config: &InferenceConfig) -> Result<Arc<dyn InferenceClient>> {
    Ok(Arc::new(HttpInferenceClient::new(config)?))
}
