use agent_chat_protocol::{ResultMessage, Usage};
use serde::{Deserialize, Serialize};

use crate::config::AgentModel;

/// Token counters as last reported to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUpdate {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub current_input_tokens: u64,
    pub current_output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalsUpdate {
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub turn_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_turns: Option<u64>,
}

/// The subset of the session persisted with a conversation and used to
/// re-seed the session when that conversation is loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub session_id: Option<String>,
    pub total_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub model: AgentModel,
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub turn_count: u64,
    pub subscription_type: Option<String>,
    pub processing: bool,
    pub compacting: bool,
}

/// Resumption id and running totals for the active chat.
///
/// Totals only move forward from agent messages; `clear` and a compaction
/// boundary are the only ways they go back to zero.
#[derive(Debug, Default)]
pub struct SessionState {
    session_id: Option<String>,
    model: AgentModel,
    total_cost: f64,
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_tokens: u64,
    cache_read_tokens: u64,
    turn_count: u64,
    subscription_type: Option<String>,
    processing: bool,
    compacting: bool,
}

impl SessionState {
    pub fn new(model: AgentModel) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn model(&self) -> AgentModel {
        self.model
    }

    pub fn set_model(&mut self, model: AgentModel) {
        self.model = model;
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    pub fn set_compacting(&mut self, compacting: bool) {
        self.compacting = compacting;
    }

    pub fn set_subscription_type(&mut self, subscription_type: String) {
        self.subscription_type = Some(subscription_type);
    }

    /// Returns `true` when the id changed.
    pub fn set_session_id(&mut self, session_id: Option<String>) -> bool {
        match session_id {
            Some(id) if self.session_id.as_deref() != Some(id.as_str()) => {
                tracing::info!(session_id = %id, "agent session id assigned");
                self.session_id = Some(id);
                true
            }
            _ => false,
        }
    }

    pub fn apply_usage(&mut self, usage: &Usage) -> TokenUpdate {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_creation_tokens += usage.cache_creation_input_tokens;
        self.cache_read_tokens += usage.cache_read_input_tokens;
        TokenUpdate {
            total_input_tokens: self.input_tokens,
            total_output_tokens: self.output_tokens,
            current_input_tokens: usage.input_tokens,
            current_output_tokens: usage.output_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
        }
    }

    /// The agent summarised its context; counting restarts from zero.
    pub fn compact_reset(&mut self) -> TokenUpdate {
        self.input_tokens = 0;
        self.output_tokens = 0;
        self.cache_creation_tokens = 0;
        self.cache_read_tokens = 0;
        self.compacting = false;
        TokenUpdate::default()
    }

    pub fn apply_result(&mut self, result: &ResultMessage) -> TotalsUpdate {
        if let Some(cost) = result.total_cost_usd {
            self.total_cost += cost;
        }
        if result.subtype == "success" && !result.is_error {
            self.turn_count += 1;
        }
        TotalsUpdate {
            total_cost: self.total_cost,
            total_input_tokens: self.input_tokens,
            total_output_tokens: self.output_tokens,
            turn_count: self.turn_count,
            current_cost: result.total_cost_usd,
            current_duration_ms: result.duration_ms,
            current_turns: result.num_turns,
        }
    }

    pub fn totals(&self) -> TotalsUpdate {
        TotalsUpdate {
            total_cost: self.total_cost,
            total_input_tokens: self.input_tokens,
            total_output_tokens: self.output_tokens,
            turn_count: self.turn_count,
            ..TotalsUpdate::default()
        }
    }

    pub fn clear(&mut self) {
        *self = Self {
            model: self.model,
            subscription_type: self.subscription_type.take(),
            ..Self::default()
        };
    }

    pub fn reseed(&mut self, summary: &SessionSummary) {
        self.clear();
        self.session_id = summary.session_id.clone();
        self.total_cost = summary.total_cost;
        self.input_tokens = summary.input_tokens;
        self.output_tokens = summary.output_tokens;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            total_cost: self.total_cost,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            model: self.model,
            total_cost: self.total_cost,
            total_input_tokens: self.input_tokens,
            total_output_tokens: self.output_tokens,
            turn_count: self.turn_count,
            subscription_type: self.subscription_type.clone(),
            processing: self.processing,
            compacting: self.compacting,
        }
    }
}
