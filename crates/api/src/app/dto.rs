use serde::{Deserialize, Serialize};

use forgeflow_core::{CorrelationId, ExecutionId, WorkflowContext};
use forgeflow_workflow::{DefinitionId, ExecutionStatus};

/// Body of `POST /executions`. The firm comes from the header, never the body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateExecutionRequest {
    pub definition_id: DefinitionId,
    /// Latest registered version when omitted.
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub context: WorkflowContext,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionCreated {
    pub execution_id: ExecutionId,
    pub definition_id: DefinitionId,
    pub definition_version: u32,
    pub status: ExecutionStatus,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub execution_id: ExecutionId,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReprocessResponse {
    pub execution_id: ExecutionId,
    pub parent_execution_id: Option<ExecutionId>,
    pub status: ExecutionStatus,
}
