mod sink;
mod webhook;

pub use sink::{broadcast, EventSink, RunEvent, TracingSink};
pub use webhook::WebhookSink;

use crate::config::NotifyConfig;
use crate::error::Result;
use std::sync::Arc;

pub fn create_sinks(config: &NotifyConfig) -> Result<Vec<Arc<dyn EventSink>>> {
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];

    if let Some(webhook) = &config.webhook {
        sinks.push(Arc::new(WebhookSink::new(webhook)?));
    }

    Ok(sinks)
}
