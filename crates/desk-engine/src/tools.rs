use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use desk_core::SharedContext;

use crate::error::ToolError;

/// A callable the scripted agents can invoke mid-turn.
/// Tools may read and write the session's shared context.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: &Value, context: &mut SharedContext) -> Result<String, ToolError>;
}

/// Tools by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in tool.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CheckTranscriptTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute(
        &self,
        name: &str,
        args: &Value,
        context: &mut SharedContext,
    ) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.execute(args, context).await
    }
}

pub const TRANSCRIPT_FOUND: &str = "Transcript exists. Audio likely reached Kiran.";
pub const TRANSCRIPT_MISSING: &str = "Transcript not found. Kiran likely did not hear the user.";

/// Checks whether an interview produced a transcript.
///
/// There is no transcript backend behind this; interview ids ending in `5`
/// are treated as the ones whose audio never arrived. Records `interview_id`
/// and `transcript_found` in the shared context.
pub struct CheckTranscriptTool;

#[async_trait]
impl Tool for CheckTranscriptTool {
    fn name(&self) -> &str {
        "check_transcript_exists"
    }

    fn description(&self) -> &str {
        "Check whether user audio transcript was generated during the interview"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "interview_id": { "type": "string" } },
            "required": ["interview_id"]
        })
    }

    async fn execute(&self, args: &Value, context: &mut SharedContext) -> Result<String, ToolError> {
        let interview_id = args
            .get("interview_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("missing interview_id".into()))?;

        let found = !interview_id.ends_with('5');
        context.insert("interview_id".into(), json!(interview_id));
        context.insert("transcript_found".into(), json!(found));

        Ok(if found { TRANSCRIPT_FOUND } else { TRANSCRIPT_MISSING }.to_string())
    }
}
