pub mod error;
pub mod mock;
pub mod scripted;
pub mod tools;

pub use error::ToolError;
pub use mock::{MockReply, MockResponder};
pub use scripted::ScriptedResponder;
pub use tools::{CheckTranscriptTool, Tool, ToolRegistry};
