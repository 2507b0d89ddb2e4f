use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Agent name attached to operator-authored messages.
pub const HUMAN_SUPPORT: &str = "HumanSupport";

/// The automated agents a session can be routed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentId {
    #[default]
    #[serde(rename = "TriageAgent")]
    Triage,
    #[serde(rename = "TechnicalSupportAgent")]
    Technical,
    #[serde(rename = "MarketingAgent")]
    Marketing,
}

/// Static descriptor for one agent.
#[derive(Debug)]
pub struct AgentProfile {
    pub id: AgentId,
    pub display_name: &'static str,
    pub handoff_description: &'static str,
    pub handoffs: &'static [AgentId],
    pub tools: &'static [&'static str],
}

static PROFILES: [AgentProfile; 3] = [
    AgentProfile {
        id: AgentId::Triage,
        display_name: "TriageAgent",
        handoff_description: "Routes the user to the right specialist",
        handoffs: &[AgentId::Technical, AgentId::Marketing],
        tools: &[],
    },
    AgentProfile {
        id: AgentId::Technical,
        display_name: "TechnicalSupportAgent",
        handoff_description: "Handles audio and interview troubleshooting",
        handoffs: &[AgentId::Triage],
        tools: &["check_transcript_exists"],
    },
    AgentProfile {
        id: AgentId::Marketing,
        display_name: "MarketingAgent",
        handoff_description: "Answers pricing, demo and product questions",
        handoffs: &[AgentId::Triage],
        tools: &[],
    },
];

impl AgentId {
    pub const ALL: [AgentId; 3] = [AgentId::Triage, AgentId::Technical, AgentId::Marketing];

    pub fn profile(self) -> &'static AgentProfile {
        match self {
            Self::Triage => &PROFILES[0],
            Self::Technical => &PROFILES[1],
            Self::Marketing => &PROFILES[2],
        }
    }

    pub fn display_name(self) -> &'static str {
        self.profile().display_name
    }

    pub fn can_hand_off_to(self, target: AgentId) -> bool {
        self.profile().handoffs.contains(&target)
    }

    pub fn has_tool(self, name: &str) -> bool {
        self.profile().tools.contains(&name)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for AgentId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TriageAgent" | "triage" => Ok(Self::Triage),
            "TechnicalSupportAgent" | "technical" => Ok(Self::Technical),
            "MarketingAgent" | "marketing" => Ok(Self::Marketing),
            other => Err(format!("unknown agent: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_line_up_with_ids() {
        for id in AgentId::ALL {
            assert_eq!(id.profile().id, id);
        }
    }

    #[test]
    fn default_is_triage() {
        assert_eq!(AgentId::default(), AgentId::Triage);
    }

    #[test]
    fn display_names_round_trip() {
        for id in AgentId::ALL {
            let parsed: AgentId = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
        }
        assert!("HumanSupport".parse::<AgentId>().is_err());
    }

    #[test]
    fn serde_uses_display_names() {
        let json = serde_json::to_string(&AgentId::Technical).unwrap();
        assert_eq!(json, "\"TechnicalSupportAgent\"");
    }

    #[test]
    fn handoff_table() {
        assert!(AgentId::Triage.can_hand_off_to(AgentId::Technical));
        assert!(AgentId::Triage.can_hand_off_to(AgentId::Marketing));
        assert!(AgentId::Technical.can_hand_off_to(AgentId::Triage));
        assert!(!AgentId::Technical.can_hand_off_to(AgentId::Marketing));
        assert!(!AgentId::Marketing.can_hand_off_to(AgentId::Marketing));
    }

    #[test]
    fn only_technical_owns_the_transcript_tool() {
        assert!(AgentId::Technical.has_tool("check_transcript_exists"));
        assert!(!AgentId::Triage.has_tool("check_transcript_exists"));
    }
}
