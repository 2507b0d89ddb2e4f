pub mod agents;
pub mod errors;
pub mod events;
pub mod frames;
pub mod ids;
pub mod responder;

pub use agents::{AgentId, AgentProfile, HUMAN_SUPPORT};
pub use errors::{FrameError, ResponderError};
pub use events::{ConversationEvent, EventBody, EventFlags, Handoff, Role, ToolCall};
pub use frames::{InboundMessage, OperatorFrame, UserFrame};
pub use ids::{ConnectionId, SessionId};
pub use responder::{OutputItem, Responder, ResponderOutput, ResponderRequest, SharedContext};
