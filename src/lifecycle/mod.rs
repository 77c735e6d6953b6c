//! State machine over node lifecycle and deployment stage.
//!
//! Every caller (pool maintainer, assignment coordinator, sweeper, REST
//! handlers) drives a node through this module rather than writing state
//! columns directly — mirrors how the teacher centralizes session status
//! transitions in `Storage::claim_session_for_run` /
//! `update_session_status` instead of scattering raw SQL across callers.

use std::sync::Arc;

use thiserror::Error;

use crate::storage::NodeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Creating,
    Provisioning,
    Active,
    Error,
    Deactivated,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Creating => "creating",
            NodeState::Provisioning => "provisioning",
            NodeState::Active => "active",
            NodeState::Error => "error",
            NodeState::Deactivated => "deactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "creating" => NodeState::Creating,
            "provisioning" => NodeState::Provisioning,
            "active" => NodeState::Active,
            "error" => NodeState::Error,
            "deactivated" => NodeState::Deactivated,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStage {
    None,
    PoolAssigned,
    ConfiguringKeys,
    DeployingRuntime,
    InstallingAgents,
    ConfiguringSearch,
    Ready,
}

impl DeploymentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStage::None => "none",
            DeploymentStage::PoolAssigned => "pool_assigned",
            DeploymentStage::ConfiguringKeys => "configuring_keys",
            DeploymentStage::DeployingRuntime => "deploying_runtime",
            DeploymentStage::InstallingAgents => "installing_agents",
            DeploymentStage::ConfiguringSearch => "configuring_search",
            DeploymentStage::Ready => "ready",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "none" => DeploymentStage::None,
            "pool_assigned" => DeploymentStage::PoolAssigned,
            "configuring_keys" => DeploymentStage::ConfiguringKeys,
            "deploying_runtime" => DeploymentStage::DeployingRuntime,
            "installing_agents" => DeploymentStage::InstallingAgents,
            "configuring_search" => DeploymentStage::ConfiguringSearch,
            "ready" => DeploymentStage::Ready,
            _ => return None,
        })
    }

    fn next(&self) -> Option<DeploymentStage> {
        match self {
            DeploymentStage::None => Some(DeploymentStage::PoolAssigned),
            DeploymentStage::PoolAssigned => Some(DeploymentStage::ConfiguringKeys),
            DeploymentStage::ConfiguringKeys => Some(DeploymentStage::DeployingRuntime),
            DeploymentStage::DeployingRuntime => Some(DeploymentStage::InstallingAgents),
            DeploymentStage::InstallingAgents => Some(DeploymentStage::ConfiguringSearch),
            DeploymentStage::ConfiguringSearch => Some(DeploymentStage::Ready),
            DeploymentStage::Ready => None,
        }
    }
}

/// The result of a Convergence Engine run. `mark_ready` requires a fresh
/// `Verified` value — never a cached/carried-forward flag. This is the
/// structural fix for the `deployment_stage = ready` bug: the old behavior
/// derived `ready` from a pre-bind `runtime_running` snapshot, which could
/// go stale; this type makes that impossible to express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceOutcome {
    Verified,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BeginProvisioning,
    MarkActive,
    MarkError,
    Bind,
    AdvanceStage,
    MarkReady(ConvergenceOutcome),
    Deactivate,
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("node not found")]
    NotFound,
    #[error("illegal transition {transition:?} from state={state} stage={stage}")]
    Illegal {
        transition: Transition,
        state: String,
        stage: String,
    },
}

pub struct LifecycleController {
    store: Arc<NodeStore>,
}

impl LifecycleController {
    pub fn new(store: Arc<NodeStore>) -> Self {
        Self { store }
    }

    pub async fn apply(&self, node_id: &str, transition: Transition) -> Result<(), TransitionError> {
        let node = self
            .store
            .get_node(node_id)
            .await
            .map_err(|_| TransitionError::NotFound)?
            .ok_or(TransitionError::NotFound)?;

        let state = NodeState::parse(&node.state).unwrap_or(NodeState::Error);
        let stage = DeploymentStage::parse(&node.deployment_stage).unwrap_or(DeploymentStage::None);

        let illegal = || TransitionError::Illegal {
            transition,
            state: node.state.clone(),
            stage: node.deployment_stage.clone(),
        };

        match transition {
            Transition::BeginProvisioning => {
                if state != NodeState::Creating {
                    return Err(illegal());
                }
                self.set_state(node_id, NodeState::Provisioning).await
            }
            Transition::MarkActive => {
                if state != NodeState::Provisioning {
                    return Err(illegal());
                }
                self.set_state(node_id, NodeState::Active).await
            }
            Transition::MarkError => {
                // Reachable from any non-terminal state.
                if state == NodeState::Deactivated {
                    return Err(illegal());
                }
                self.set_state(node_id, NodeState::Error).await
            }
            Transition::Bind => {
                if state != NodeState::Active || stage != DeploymentStage::None {
                    return Err(illegal());
                }
                self.set_stage(node_id, DeploymentStage::PoolAssigned).await
            }
            Transition::AdvanceStage => {
                let next = stage.next().ok_or_else(illegal)?;
                if next == DeploymentStage::Ready {
                    // Ready must come from MarkReady with a fresh verify
                    // outcome, never from a plain stage advance.
                    return Err(illegal());
                }
                self.set_stage(node_id, next).await
            }
            Transition::MarkReady(outcome) => {
                if stage != DeploymentStage::ConfiguringSearch {
                    return Err(illegal());
                }
                match outcome {
                    ConvergenceOutcome::Verified => {
                        self.set_stage(node_id, DeploymentStage::Ready).await
                    }
                    ConvergenceOutcome::Failed => self.set_state(node_id, NodeState::Error).await,
                }
            }
            Transition::Deactivate => {
                if state != NodeState::Active {
                    return Err(illegal());
                }
                self.set_state(node_id, NodeState::Deactivated).await
            }
        }
    }

    async fn set_state(&self, node_id: &str, state: NodeState) -> Result<(), TransitionError> {
        self.store
            .set_node_state(node_id, state.as_str())
            .await
            .map_err(|_| TransitionError::NotFound)
    }

    async fn set_stage(&self, node_id: &str, stage: DeploymentStage) -> Result<(), TransitionError> {
        self.store
            .set_deployment_stage(node_id, stage.as_str())
            .await
            .map_err(|_| TransitionError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn controller() -> (LifecycleController, Arc<NodeStore>, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(NodeStore::new(dir.path()).await.unwrap());
        let node = store.create_node().await.unwrap();
        let controller = LifecycleController::new(store.clone());
        (controller, store, node.id)
    }

    #[tokio::test]
    async fn happy_path_to_ready() {
        let (ctrl, store, id) = controller().await;
        ctrl.apply(&id, Transition::BeginProvisioning).await.unwrap();
        ctrl.apply(&id, Transition::MarkActive).await.unwrap();
        ctrl.apply(&id, Transition::Bind).await.unwrap();
        ctrl.apply(&id, Transition::AdvanceStage).await.unwrap(); // configuring_keys
        ctrl.apply(&id, Transition::AdvanceStage).await.unwrap(); // deploying_runtime
        ctrl.apply(&id, Transition::AdvanceStage).await.unwrap(); // installing_agents
        ctrl.apply(&id, Transition::AdvanceStage).await.unwrap(); // configuring_search
        ctrl.apply(&id, Transition::MarkReady(ConvergenceOutcome::Verified))
            .await
            .unwrap();

        let node = store.get_node(&id).await.unwrap().unwrap();
        assert_eq!(node.deployment_stage, "ready");
    }

    #[tokio::test]
    async fn cannot_skip_straight_to_ready_via_advance_stage() {
        let (ctrl, _store, id) = controller().await;
        ctrl.apply(&id, Transition::BeginProvisioning).await.unwrap();
        ctrl.apply(&id, Transition::MarkActive).await.unwrap();
        ctrl.apply(&id, Transition::Bind).await.unwrap();
        for _ in 0..3 {
            ctrl.apply(&id, Transition::AdvanceStage).await.unwrap();
        }
        // Now at configuring_search; advancing again must not silently
        // become ready — only MarkReady(Verified) may do that.
        let result = ctrl.apply(&id, Transition::AdvanceStage).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_verification_marks_error_not_ready() {
        let (ctrl, store, id) = controller().await;
        ctrl.apply(&id, Transition::BeginProvisioning).await.unwrap();
        ctrl.apply(&id, Transition::MarkActive).await.unwrap();
        ctrl.apply(&id, Transition::Bind).await.unwrap();
        for _ in 0..4 {
            ctrl.apply(&id, Transition::AdvanceStage).await.unwrap();
        }
        ctrl.apply(&id, Transition::MarkReady(ConvergenceOutcome::Failed))
            .await
            .unwrap();
        let node = store.get_node(&id).await.unwrap().unwrap();
        assert_eq!(node.state, "error");
        assert_ne!(node.deployment_stage, "ready");
    }

    #[tokio::test]
    async fn bind_requires_active_unbound_node() {
        let (ctrl, _store, id) = controller().await;
        // Still "creating" — bind must fail.
        let result = ctrl.apply(&id, Transition::Bind).await;
        assert!(result.is_err());
    }
}
