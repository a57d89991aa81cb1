//! Relay route table

use std::collections::HashMap;

use nexa_core::RelayRoute;

/// Routes keyed by id
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, RelayRoute>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a route
    pub fn insert(&mut self, route: RelayRoute) {
        self.routes.insert(route.id.clone(), route);
    }

    pub fn remove(&mut self, id: &str) -> Option<RelayRoute> {
        self.routes.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&RelayRoute> {
        self.routes.get(id)
    }

    /// All routes, highest priority (lowest number) first, then oldest first
    pub fn list(&self) -> Vec<RelayRoute> {
        let mut routes: Vec<_> = self.routes.values().cloned().collect();
        routes.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        routes
    }

    /// Routes with `device_id` as source, target or intermediate
    pub fn involving(&self, device_id: &str) -> Vec<RelayRoute> {
        self.routes
            .values()
            .filter(|r| r.involves(device_id))
            .cloned()
            .collect()
    }

    /// Active route from `source_id` to `target_id`, if any
    pub fn active_between(&self, source_id: &str, target_id: &str) -> Option<&RelayRoute> {
        self.routes
            .values()
            .find(|r| r.active && r.source_id == source_id && r.target_id == target_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, priority: i32) -> RelayRoute {
        RelayRoute::new(id, "src", "dst", "mid", priority)
    }

    #[test]
    fn test_insert_get_remove() {
        let mut table = RouteTable::new();
        table.insert(route("r1", 1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("r1").unwrap().priority, 1);
        assert!(table.remove("r1").is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_list_orders_by_priority() {
        let mut table = RouteTable::new();
        table.insert(route("low", 5));
        table.insert(route("high", 1));
        table.insert(route("mid", 3));
        let ids: Vec<_> = table.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_involving_and_active_between() {
        let mut table = RouteTable::new();
        let mut active = route("r1", 1);
        active.active = true;
        table.insert(active);
        table.insert(RelayRoute::new("r2", "other", "dst", "gw", 1));

        assert_eq!(table.involving("mid").len(), 1);
        assert_eq!(table.involving("dst").len(), 2);
        assert_eq!(table.active_between("src", "dst").unwrap().id, "r1");
        assert!(table.active_between("other", "dst").is_none());
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_remove_missing() {
        let mut table = RouteTable::new();
        assert!(table.remove("nope").is_none());
        assert!(table.get("nope").is_none());
    }
}
