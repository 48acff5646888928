use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Process-wide async locks keyed by order and by inbound.
///
/// Order locks serialize duplicate deliveries of the same order. Inbound
/// locks make "check capacity, add client, persist client" atomic per
/// shared inbound.
#[derive(Debug, Default)]
pub struct LockRegistry {
    orders: DashMap<i32, Arc<Mutex<()>>>,
    inbounds: DashMap<i32, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(map: &DashMap<i32, Arc<Mutex<()>>>, key: i32) -> Arc<Mutex<()>> {
        map.entry(key).or_default().clone()
    }

    pub async fn lock_order(&self, order_id: i32) -> OwnedMutexGuard<()> {
        Self::entry(&self.orders, order_id).lock_owned().await
    }

    pub async fn lock_inbound(&self, inbound_id: i32) -> OwnedMutexGuard<()> {
        Self::entry(&self.inbounds, inbound_id).lock_owned().await
    }

    /// Drops locks nobody holds or waits on.
    pub fn prune(&self) {
        self.orders.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.inbounds.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.orders.len() + self.inbounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn inbound_lock_serializes_holders() {
        let registry = Arc::new(LockRegistry::new());
        let guard = registry.lock_inbound(5).await;

        let contender = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.lock_inbound(5).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let registry = LockRegistry::new();
        let _a = registry.lock_inbound(1).await;
        let _b = registry.lock_inbound(2).await;
        let _c = registry.lock_order(1).await;
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let registry = LockRegistry::new();
        let held = registry.lock_order(1).await;
        drop(registry.lock_order(2).await);

        registry.prune();
        assert_eq!(registry.len(), 1);

        drop(held);
        registry.prune();
        assert!(registry.is_empty());
    }
}
