//! Inbound selection for a single provisioning unit.
//!
//! [`decide`] is a pure function over snapshots: it performs no I/O and the
//! caller is responsible for loading fresh state and for serializing the
//! decision against concurrent allocations.

use crate::db::entities::{server, server_inbound, server_plan};
use crate::db::enums::{InboundStatus, PlanMode, ServerHealthStatus, ServerStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub id: i32,
    pub auto_provisioning_enabled: bool,
    pub health_status: ServerHealthStatus,
    pub status: ServerStatus,
}

impl From<&server::Model> for ServerSnapshot {
    fn from(server: &server::Model) -> Self {
        Self {
            id: server.id,
            auto_provisioning_enabled: server.auto_provisioning_enabled,
            health_status: server.health_status,
            status: server.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSnapshot {
    pub server_id: i32,
    pub mode: PlanMode,
    pub preferred_inbound_id: i32,
}

impl From<&server_plan::Model> for PlanSnapshot {
    fn from(plan: &server_plan::Model) -> Self {
        Self {
            server_id: plan.server_id,
            mode: plan.mode,
            preferred_inbound_id: plan.preferred_inbound_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSnapshot {
    pub id: i32,
    pub server_id: i32,
    pub capacity: Option<i32>,
    pub provisioning_enabled: bool,
    pub status: InboundStatus,
    pub is_dedicated: bool,
    pub client_count: u64,
}

impl InboundSnapshot {
    pub fn from_model(inbound: &server_inbound::Model, client_count: u64) -> Self {
        Self {
            id: inbound.id,
            server_id: inbound.server_id,
            capacity: inbound.capacity,
            provisioning_enabled: inbound.provisioning_enabled,
            status: inbound.status,
            is_dedicated: inbound.is_dedicated,
            client_count,
        }
    }

    pub fn has_spare_capacity(&self) -> bool {
        match self.capacity {
            None => true,
            Some(capacity) => self.client_count < capacity.max(0) as u64,
        }
    }

    pub fn accepts_new_client(&self) -> bool {
        self.provisioning_enabled && self.status == InboundStatus::Active && self.has_spare_capacity()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationDecision {
    ReuseInbound(i32),
    /// Clone the template inbound into a new one owned by the unit.
    CreateDedicatedInbound(i32),
    NoCapacity(String),
}

fn server_refusal(server: &ServerSnapshot) -> Option<String> {
    if server.status != ServerStatus::Up {
        return Some(format!("server {} is {}", server.id, server.status));
    }
    if server.health_status != ServerHealthStatus::Healthy {
        return Some(format!("server {} is {}", server.id, server.health_status));
    }
    if !server.auto_provisioning_enabled {
        return Some(format!(
            "automatic provisioning is disabled on server {}",
            server.id
        ));
    }
    None
}

pub fn decide(
    plan: &PlanSnapshot,
    server: &ServerSnapshot,
    inbounds: &[InboundSnapshot],
) -> AllocationDecision {
    if let Some(reason) = server_refusal(server) {
        return AllocationDecision::NoCapacity(reason);
    }

    match plan.mode {
        PlanMode::Dedicated => AllocationDecision::CreateDedicatedInbound(plan.preferred_inbound_id),
        PlanMode::Shared => {
            let on_server = |i: &&InboundSnapshot| i.server_id == plan.server_id;

            if let Some(preferred) = inbounds
                .iter()
                .filter(on_server)
                .find(|i| i.id == plan.preferred_inbound_id)
            {
                if preferred.accepts_new_client() {
                    return AllocationDecision::ReuseInbound(preferred.id);
                }
            }

            // Dedicated inbounds belong to a single unit and are never shared.
            let mut fallbacks: Vec<&InboundSnapshot> = inbounds
                .iter()
                .filter(on_server)
                .filter(|i| i.id != plan.preferred_inbound_id && !i.is_dedicated)
                .filter(|i| i.provisioning_enabled)
                .collect();
            fallbacks.sort_by_key(|i| i.id);

            match fallbacks.into_iter().find(|i| i.accepts_new_client()) {
                Some(fallback) => AllocationDecision::ReuseInbound(fallback.id),
                None => AllocationDecision::NoCapacity(format!(
                    "inbound {} is full or disabled and server {} has no other inbound with free capacity",
                    plan.preferred_inbound_id, server.id
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_server() -> ServerSnapshot {
        ServerSnapshot {
            id: 1,
            auto_provisioning_enabled: true,
            health_status: ServerHealthStatus::Healthy,
            status: ServerStatus::Up,
        }
    }

    fn shared_plan(preferred: i32) -> PlanSnapshot {
        PlanSnapshot {
            server_id: 1,
            mode: PlanMode::Shared,
            preferred_inbound_id: preferred,
        }
    }

    fn inbound(id: i32, capacity: Option<i32>, used: u64) -> InboundSnapshot {
        InboundSnapshot {
            id,
            server_id: 1,
            capacity,
            provisioning_enabled: true,
            status: InboundStatus::Active,
            is_dedicated: false,
            client_count: used,
        }
    }

    #[test]
    fn reuses_preferred_inbound_with_spare_capacity() {
        let decision = decide(&shared_plan(10), &healthy_server(), &[inbound(10, Some(1), 0)]);
        assert_eq!(decision, AllocationDecision::ReuseInbound(10));
    }

    #[test]
    fn unlimited_capacity_always_has_room() {
        let decision = decide(&shared_plan(10), &healthy_server(), &[inbound(10, None, 10_000)]);
        assert_eq!(decision, AllocationDecision::ReuseInbound(10));
    }

    #[test]
    fn full_preferred_without_fallback_has_no_capacity() {
        let decision = decide(&shared_plan(10), &healthy_server(), &[inbound(10, Some(1), 1)]);
        assert!(matches!(decision, AllocationDecision::NoCapacity(_)));
    }

    #[test]
    fn falls_back_to_lowest_eligible_id() {
        let mut disabled = inbound(3, None, 0);
        disabled.provisioning_enabled = false;
        let mut inactive = inbound(4, None, 0);
        inactive.status = InboundStatus::Disabled;
        let inbounds = [
            inbound(10, Some(2), 2),
            inbound(9, Some(5), 1),
            disabled,
            inactive,
            inbound(5, Some(1), 1),
            inbound(7, Some(3), 0),
        ];

        let decision = decide(&shared_plan(10), &healthy_server(), &inbounds);
        assert_eq!(decision, AllocationDecision::ReuseInbound(7));
    }

    #[test]
    fn disabled_preferred_falls_back() {
        let mut preferred = inbound(10, None, 0);
        preferred.status = InboundStatus::Disabled;
        let decision = decide(&shared_plan(10), &healthy_server(), &[preferred, inbound(11, None, 0)]);
        assert_eq!(decision, AllocationDecision::ReuseInbound(11));
    }

    #[test]
    fn never_falls_back_to_dedicated_or_foreign_inbounds() {
        let mut dedicated = inbound(2, None, 0);
        dedicated.is_dedicated = true;
        let mut foreign = inbound(3, None, 0);
        foreign.server_id = 2;

        let decision = decide(
            &shared_plan(10),
            &healthy_server(),
            &[inbound(10, Some(1), 1), dedicated, foreign],
        );
        assert!(matches!(decision, AllocationDecision::NoCapacity(_)));
    }

    #[test]
    fn dedicated_mode_clones_template() {
        let plan = PlanSnapshot {
            server_id: 1,
            mode: PlanMode::Dedicated,
            preferred_inbound_id: 10,
        };
        let decision = decide(&plan, &healthy_server(), &[inbound(10, Some(1), 1)]);
        assert_eq!(decision, AllocationDecision::CreateDedicatedInbound(10));
    }

    #[test]
    fn unhealthy_or_down_servers_have_no_capacity() {
        let inbounds = [inbound(10, None, 0)];

        let mut down = healthy_server();
        down.status = ServerStatus::Maintenance;
        assert!(matches!(
            decide(&shared_plan(10), &down, &inbounds),
            AllocationDecision::NoCapacity(_)
        ));

        let mut unreachable = healthy_server();
        unreachable.health_status = ServerHealthStatus::Unreachable;
        assert!(matches!(
            decide(&shared_plan(10), &unreachable, &inbounds),
            AllocationDecision::NoCapacity(_)
        ));

        let mut manual = healthy_server();
        manual.auto_provisioning_enabled = false;
        let dedicated = PlanSnapshot {
            mode: PlanMode::Dedicated,
            ..shared_plan(10)
        };
        assert!(matches!(
            decide(&dedicated, &manual, &inbounds),
            AllocationDecision::NoCapacity(_)
        ));
    }

    #[test]
    fn degraded_servers_have_no_capacity() {
        let mut degraded = healthy_server();
        degraded.health_status = ServerHealthStatus::Degraded;
        let decision = decide(&shared_plan(10), &degraded, &[inbound(10, None, 0)]);
        assert_eq!(
            decision,
            AllocationDecision::NoCapacity("server 1 is degraded".to_string())
        );
    }
}
