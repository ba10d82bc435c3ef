//! Shield rule: attack-pattern protection evaluated by the decision service.

use async_trait::async_trait;
use serde_json::json;
use crate::core::context::Context;
use crate::core::rules::{Rule, PRIORITY_SHIELD};
use crate::models::{Mode, Reason, Request, RuleResult, ShieldReason};

#[derive(Debug, Clone)]
pub struct Shield {
    mode: Mode,
}

pub fn shield(mode: Mode) -> Shield {
    Shield { mode }
}

#[async_trait]
impl Rule for Shield {
    fn rule_type(&self) -> &'static str {
        "SHIELD"
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn priority(&self) -> u32 {
        PRIORITY_SHIELD
    }

    fn options(&self) -> serde_json::Value {
        json!({})
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn protect(&self, _context: &Context, _request: &Request) -> anyhow::Result<RuleResult> {
        Ok(RuleResult::not_run(Reason::Shield(ShieldReason::default())))
    }
}
