//! JSON lines consumer

use async_trait::async_trait;

use crate::config::Config;
use crate::core::FlowEvent;

use super::{EventConsumer, LineWriter};

pub struct JsonLinesConsumer {
    out: LineWriter,
}

impl JsonLinesConsumer {
    pub fn stdout() -> Self {
        Self { out: LineWriter::stdout() }
    }

    pub fn with_writer(out: Box<dyn std::io::Write + Send>) -> Self {
        Self { out: LineWriter::new(out) }
    }
}

#[async_trait]
impl EventConsumer for JsonLinesConsumer {
    fn name(&self) -> &str {
        "json"
    }

    async fn handle(&self, event: &FlowEvent, config: Option<&Config>) -> anyhow::Result<()> {
        let line = match config {
            Some(config) => serde_json::to_string(&serde_json::json!({
                "event": event,
                "config": config,
            }))?,
            None => serde_json::to_string(event)?,
        };
        self.out.write_line(&line)?;
        Ok(())
    }
}
