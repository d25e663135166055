//! Fallback sink: one debug line per event

use async_trait::async_trait;

use crate::config::Config;
use crate::core::FlowEvent;

use super::{EventConsumer, LineWriter};

pub struct TextSink {
    out: LineWriter,
}

impl TextSink {
    pub fn stdout() -> Self {
        Self { out: LineWriter::stdout() }
    }

    pub fn with_writer(out: Box<dyn std::io::Write + Send>) -> Self {
        Self { out: LineWriter::new(out) }
    }
}

#[async_trait]
impl EventConsumer for TextSink {
    fn name(&self) -> &str {
        "text"
    }

    async fn handle(&self, event: &FlowEvent, _config: Option<&Config>) -> anyhow::Result<()> {
        self.out.write_line(&format!("{:?}", event))?;
        Ok(())
    }
}
