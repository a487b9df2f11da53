/// Execution message: the queue payload that starts one workflow run

use crate::queue::QueueError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// What caused the execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Webhook,
    Schedule,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Webhook => "webhook",
            TriggerType::Schedule => "schedule",
            TriggerType::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued execution
///
/// `approximate_receive_count` belongs to the transport: it is filled in on
/// receipt and never written by the publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub execution_id: String,
    pub workflow_id: String,
    pub tenant_id: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_data: Value,
    #[serde(default, skip_serializing)]
    pub approximate_receive_count: u32,
}

impl ExecutionMessage {
    /// New message with a fresh execution ID
    pub fn new(
        workflow_id: impl Into<String>,
        tenant_id: impl Into<String>,
        trigger_type: TriggerType,
        trigger_data: Value,
    ) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            tenant_id: tenant_id.into(),
            trigger_type,
            trigger_data,
            approximate_receive_count: 0,
        }
    }

    /// Check the required identifiers are present.
    pub fn validate(&self) -> Result<(), QueueError> {
        let required = [
            ("execution_id", &self.execution_id),
            ("workflow_id", &self.workflow_id),
            ("tenant_id", &self.tenant_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(QueueError::InvalidMessage(format!("{} is required", field)));
            }
        }
        Ok(())
    }

    /// Transport attributes attached to the message on publish
    pub fn attributes(&self) -> Vec<(String, String)> {
        vec![
            ("execution_id".to_string(), self.execution_id.clone()),
            ("workflow_id".to_string(), self.workflow_id.clone()),
            ("tenant_id".to_string(), self.tenant_id.clone()),
            ("trigger_type".to_string(), self.trigger_type.to_string()),
        ]
    }
}
