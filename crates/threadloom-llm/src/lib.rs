pub mod openai;
pub mod retry;
pub mod streaming;

use std::sync::Arc;

use threadloom_core::config::ProviderConfig;
use threadloom_core::error::Result;
use threadloom_core::traits::ChatBackend;

pub use openai::OpenAiClient;
pub use retry::RetryingBackend;

/// Build the chat backend described by the provider config.
pub fn create_backend(config: &ProviderConfig) -> Result<Arc<dyn ChatBackend>> {
    let client = OpenAiClient::new(config)?;
    Ok(Arc::new(RetryingBackend::new(Box::new(client), config.retry.clone())))
}
