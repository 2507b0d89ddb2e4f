//! Deterministic keyword-driven responder.
//!
//! Routes like a small support desk: triage sends audio trouble to the
//! technical agent and everything else to marketing; the technical agent
//! checks interview transcripts; marketing answers pricing and demo
//! questions. Useful for running the server without a model backend.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::debug;

use desk_core::{
    AgentId, OutputItem, Responder, ResponderError, ResponderOutput, ResponderRequest,
};

use crate::tools::ToolRegistry;

const TRANSCRIPT_TOOL: &str = "check_transcript_exists";
const DEFAULT_INTERVIEW_ID: &str = "12345";
const AUDIO_KEYWORDS: [&str; 4] = ["mic", "audio", "not responding", "hear"];
const PRICING_KEYWORDS: [&str; 3] = ["price", "cost", "pricing"];

pub const TECHNICAL_GREETING: &str =
    "Hello, I'm the Technical Support Agent. How can I help with your audio issue?";
pub const MARKETING_GREETING: &str =
    "Hello, I'm the Marketing Agent. How can I help with your inquiry?";
pub const ASK_FOR_INTERVIEW_ID: &str = "Was the microphone icon moving when you spoke? If yes, \
     could you please provide your interview ID so I can check if your audio was received?";
pub const AUDIO_RECEIVED: &str = "Good news! I checked your interview and found that your audio \
     was successfully received. If you're still experiencing issues, it might be related to the \
     AI processing rather than your microphone.";
pub const AUDIO_MISSING: &str = "I checked your interview and it seems the transcript wasn't \
     generated. This suggests Kiran didn't receive your audio. Please try rejoining the interview \
     and ensure your microphone permissions are enabled.";
pub const PRICING_ANSWER: &str = "Recruit41 follows a usage-based pricing model starting at ₹249 \
     per interview. Pricing may vary depending on the type and volume of interviews.";
pub const DEMO_ANSWER: &str =
    "You can access our demo at https://demo.recruit41.com to see how our platform works.";
pub const PRODUCT_ANSWER: &str = "Recruit41 is an AI-powered recruitment platform that automates \
     resume screening, case studies, and coding assessments. How can I help you with more \
     specific information?";

static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("static pattern"));

pub struct ScriptedResponder {
    tools: ToolRegistry,
}

impl Default for ScriptedResponder {
    fn default() -> Self {
        Self::new(ToolRegistry::with_defaults())
    }
}

impl ScriptedResponder {
    pub fn new(tools: ToolRegistry) -> Self {
        Self { tools }
    }

    fn triage(text: &str) -> (Vec<OutputItem>, AgentId) {
        let (target, greeting) = if contains_any(text, &AUDIO_KEYWORDS) {
            (AgentId::Technical, TECHNICAL_GREETING)
        } else {
            (AgentId::Marketing, MARKETING_GREETING)
        };
        (
            vec![
                OutputItem::Handoff { from: AgentId::Triage, to: target },
                OutputItem::Message { agent: target, content: greeting.to_string() },
            ],
            target,
        )
    }

    async fn technical(
        &self,
        text: &str,
        request: &mut ResponderRequest,
    ) -> Result<Vec<OutputItem>, ResponderError> {
        let agent = AgentId::Technical;
        if !text.contains("interview id") && !text.chars().any(|c| c.is_ascii_digit()) {
            return Ok(vec![OutputItem::Message { agent, content: ASK_FOR_INTERVIEW_ID.into() }]);
        }

        let digits: String = DIGITS.find_iter(text).map(|m| m.as_str()).collect();
        let interview_id = if digits.is_empty() { DEFAULT_INTERVIEW_ID.to_string() } else { digits };
        let args = json!({ "interview_id": interview_id });

        let output = self
            .tools
            .execute(TRANSCRIPT_TOOL, &args, &mut request.context)
            .await
            .map_err(|e| e.into_responder_error(TRANSCRIPT_TOOL))?;

        let found = request
            .context
            .get("transcript_found")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        debug!(session_id = %request.session_id, interview_id = %interview_id, found, "transcript checked");

        Ok(vec![
            OutputItem::ToolCall { agent, name: TRANSCRIPT_TOOL.into(), args },
            OutputItem::ToolResult { agent, output },
            OutputItem::Message {
                agent,
                content: if found { AUDIO_RECEIVED } else { AUDIO_MISSING }.to_string(),
            },
        ])
    }

    fn marketing(text: &str) -> Vec<OutputItem> {
        let content = if contains_any(text, &PRICING_KEYWORDS) {
            PRICING_ANSWER
        } else if text.contains("demo") {
            DEMO_ANSWER
        } else {
            PRODUCT_ANSWER
        };
        vec![OutputItem::Message { agent: AgentId::Marketing, content: content.into() }]
    }
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| text.contains(kw))
}

#[async_trait]
impl Responder for ScriptedResponder {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn respond(&self, mut request: ResponderRequest) -> Result<ResponderOutput, ResponderError> {
        let text = request.latest_user_message().unwrap_or_default().to_lowercase();

        let (items, next_agent) = match request.active_agent {
            AgentId::Triage => Self::triage(&text),
            AgentId::Technical => (self.technical(&text, &mut request).await?, AgentId::Technical),
            AgentId::Marketing => (Self::marketing(&text), AgentId::Marketing),
        };

        Ok(ResponderOutput {
            items,
            next_agent,
            context: request.context,
            resolved: false,
        })
    }
}
