//! Authorization adapter boundary
//!
//! Authorization decisioning is an external collaborator; the engine only
//! consults it before every mutating operation.

use async_trait::async_trait;
use uuid::Uuid;

/// Decides whether an actor may perform an operation.
///
/// `action` is the operation's external label (e.g. `"workflow.pause"`)
/// and `resource` identifies the target (execution id, task id, playbook
/// code).
#[async_trait]
pub trait AuthorizationAdapter: Send + Sync + 'static {
    async fn can_perform(
        &self,
        actor: &str,
        organization_id: Uuid,
        action: &str,
        resource: &str,
    ) -> bool;
}

/// Permits everything. For tests and single-tenant deployments that do
/// authorization upstream.
pub struct AllowAll;

#[async_trait]
impl AuthorizationAdapter for AllowAll {
    async fn can_perform(
        &self,
        _actor: &str,
        _organization_id: Uuid,
        _action: &str,
        _resource: &str,
    ) -> bool {
        true
    }
}
