use forgeflow_core::TenantId;

use crate::LifecycleEvent;

/// Messages that belong to exactly one firm.
///
/// Consumers pinned to a firm use this to drop anything that is not theirs.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;

    fn belongs_to(&self, tenant_id: TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}

impl TenantScoped for LifecycleEvent {
    fn tenant_id(&self) -> TenantId {
        LifecycleEvent::tenant_id(self)
    }
}
