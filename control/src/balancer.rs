use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{get_json, keys, put_json, CacheStore};
use crate::config::BalancerConfig;
use crate::types::{BalanceMethod, Node, User};

/// Source of the weighted-random draw, uniform over `[1, total]`.
pub trait WeightDraw: Send + Sync {
    fn draw(&self, total: u64) -> u64;
}

pub struct RandomDraw;

impl WeightDraw for RandomDraw {
    fn draw(&self, total: u64) -> u64 {
        if total == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(1..=total)
    }
}

/// Picks the node that serves a user
pub struct LoadBalancer {
    cache: Arc<dyn CacheStore>,
    cursor_ttl: Duration,
    draw: Arc<dyn WeightDraw>,
}

impl LoadBalancer {
    pub fn new(cache: Arc<dyn CacheStore>, cfg: &BalancerConfig) -> Self {
        Self::with_draw(cache, cfg, Arc::new(RandomDraw))
    }

    pub fn with_draw(cache: Arc<dyn CacheStore>, cfg: &BalancerConfig, draw: Arc<dyn WeightDraw>) -> Self {
        Self {
            cache,
            cursor_ttl: Duration::from_secs(cfg.cursor_ttl_secs),
            draw,
        }
    }

    /// The first candidate's load-balance settings decide the policy for the
    /// whole set.
    pub async fn select_node<'a>(&self, candidates: &'a [Node], user: &User) -> Option<&'a Node> {
        let first = candidates.first()?;
        if candidates.len() == 1 {
            return Some(first);
        }

        let settings = &first.protocol_settings.load_balance;
        if !settings.enabled {
            return Some(first);
        }

        debug!(
            "Selecting node for user_id={} among {} candidates using {}",
            user.id,
            candidates.len(),
            settings.method.as_str()
        );

        match &settings.method {
            BalanceMethod::RoundRobin => Some(self.round_robin(candidates).await),
            BalanceMethod::LeastConnection => Some(self.least_connection(candidates).await),
            BalanceMethod::WeightedRandom => Some(self.weighted_random(candidates)),
            BalanceMethod::Other(_) => Some(first),
        }
    }

    // Read-modify-write without a lock; concurrent callers may repeat or skip a slot.
    async fn round_robin<'a>(&self, candidates: &'a [Node]) -> &'a Node {
        let n = candidates.len() as u64;
        let current = get_json::<u64>(self.cache.as_ref(), keys::ROUND_ROBIN_CURSOR)
            .await
            .unwrap_or(0)
            % n;
        let next = (current + 1) % n;
        put_json(self.cache.as_ref(), keys::ROUND_ROBIN_CURSOR, &next, self.cursor_ttl).await;

        &candidates[current as usize]
    }

    async fn least_connection<'a>(&self, candidates: &'a [Node]) -> &'a Node {
        let counter_keys: Vec<String> = candidates.iter().map(|n| keys::node_online_users(n.id)).collect();
        let counts: Vec<u64> = match self.cache.mget(&counter_keys).await {
            Ok(values) => values
                .into_iter()
                .map(|v| v.and_then(|v| v.as_u64()).unwrap_or(0))
                .collect(),
            Err(e) => {
                warn!("Failed to read online-user counters: {}", e);
                vec![0; candidates.len()]
            }
        };

        // min_by_key keeps the first of equal elements
        let (idx, _) = counts
            .iter()
            .enumerate()
            .min_by_key(|(_, count)| **count)
            .unwrap_or((0, &0));
        &candidates[idx]
    }

    fn weighted_random<'a>(&self, candidates: &'a [Node]) -> &'a Node {
        let weights: Vec<u64> = candidates
            .iter()
            .map(|n| u64::from(n.protocol_settings.load_balance.weight.max(1)))
            .collect();
        let total: u64 = weights.iter().sum();
        let draw = self.draw.draw(total);

        let mut cumulative = 0;
        for (node, weight) in candidates.iter().zip(&weights) {
            cumulative += weight;
            if draw >= 1 && cumulative >= draw {
                return node;
            }
        }
        &candidates[0]
    }

    /// Cached health only; never contacts the node. Absent health counts as unavailable.
    pub async fn is_available(&self, node: &Node) -> bool {
        if !node.protocol_settings.health_check.enabled {
            return true;
        }
        get_json::<bool>(self.cache.as_ref(), &keys::node_health(node.id))
            .await
            .unwrap_or(false)
    }

    pub async fn get_available_nodes(&self, nodes: &[Node]) -> Vec<Node> {
        let mut available = Vec::with_capacity(nodes.len());
        for node in nodes {
            if self.is_available(node).await {
                available.push(node.clone());
            }
        }
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::types::fixtures::{node, user};
    use parking_lot::Mutex;
    use serde_json::json;

    struct ScriptedDraw(Mutex<Vec<u64>>);

    impl WeightDraw for ScriptedDraw {
        fn draw(&self, _total: u64) -> u64 {
            self.0.lock().remove(0)
        }
    }

    fn balanced(method: BalanceMethod, ids: &[u64]) -> Vec<Node> {
        ids.iter()
            .map(|&id| {
                let mut n = node(id);
                n.protocol_settings.load_balance.enabled = true;
                n.protocol_settings.load_balance.method = method.clone();
                n
            })
            .collect()
    }

    fn balancer(cache: Arc<MemoryStore>) -> LoadBalancer {
        LoadBalancer::new(cache, &BalancerConfig::default())
    }

    #[tokio::test]
    async fn test_empty_and_single() {
        let lb = balancer(Arc::new(MemoryStore::new()));
        assert!(lb.select_node(&[], &user(1)).await.is_none());

        let one = balanced(BalanceMethod::WeightedRandom, &[4]);
        assert_eq!(lb.select_node(&one, &user(1)).await.unwrap().id, 4);
    }

    #[tokio::test]
    async fn test_disabled_balancing_returns_first() {
        let lb = balancer(Arc::new(MemoryStore::new()));
        let mut nodes = balanced(BalanceMethod::RoundRobin, &[1, 2, 3]);
        nodes[0].protocol_settings.load_balance.enabled = false;
        for _ in 0..3 {
            assert_eq!(lb.select_node(&nodes, &user(1)).await.unwrap().id, 1);
        }
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let lb = balancer(Arc::new(MemoryStore::new()));
        let nodes = balanced(BalanceMethod::RoundRobin, &[1, 2, 3]);

        let mut picked = Vec::new();
        for _ in 0..4 {
            picked.push(lb.select_node(&nodes, &user(1)).await.unwrap().id);
        }
        assert_eq!(picked, vec![1, 2, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_cursor_expires_and_stale_cursor_wraps() {
        let cache = Arc::new(MemoryStore::new());
        let lb = balancer(cache.clone());
        let nodes = balanced(BalanceMethod::RoundRobin, &[1, 2, 3]);

        assert_eq!(lb.select_node(&nodes, &user(1)).await.unwrap().id, 1);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(lb.select_node(&nodes, &user(1)).await.unwrap().id, 1);

        cache
            .set(keys::ROUND_ROBIN_CURSOR, json!(7), Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(lb.select_node(&nodes, &user(1)).await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_weighted_random_walks_cumulative_weights() {
        let mut nodes = balanced(BalanceMethod::WeightedRandom, &[1, 2, 3]);
        nodes[1].protocol_settings.load_balance.weight = 0;
        nodes[2].protocol_settings.load_balance.weight = 1;

        let draw = Arc::new(ScriptedDraw(Mutex::new(vec![1, 2, 3, 0])));
        let lb = LoadBalancer::with_draw(
            Arc::new(MemoryStore::new()),
            &BalancerConfig::default(),
            draw,
        );

        let mut picked = Vec::new();
        for _ in 0..4 {
            picked.push(lb.select_node(&nodes, &user(1)).await.unwrap().id);
        }
        assert_eq!(picked, vec![1, 2, 3, 1]);
    }

    #[tokio::test]
    async fn test_least_connection_prefers_fewest_online_users() {
        let cache = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(300);
        cache.set(&keys::node_online_users(1), json!(5), ttl).await.unwrap();
        cache.set(&keys::node_online_users(2), json!(2), ttl).await.unwrap();
        cache.set(&keys::node_online_users(3), json!(9), ttl).await.unwrap();

        let lb = balancer(cache);
        let nodes = balanced(BalanceMethod::LeastConnection, &[1, 2, 3]);
        assert_eq!(lb.select_node(&nodes, &user(1)).await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_least_connection_ties_keep_order() {
        let lb = balancer(Arc::new(MemoryStore::new()));
        let nodes = balanced(BalanceMethod::LeastConnection, &[4, 5]);
        assert_eq!(lb.select_node(&nodes, &user(1)).await.unwrap().id, 4);
    }

    #[tokio::test]
    async fn test_unknown_method_returns_first() {
        let lb = balancer(Arc::new(MemoryStore::new()));
        let nodes = balanced(BalanceMethod::Other("fastest".to_string()), &[8, 9]);
        assert_eq!(lb.select_node(&nodes, &user(1)).await.unwrap().id, 8);
    }

    #[tokio::test]
    async fn test_available_nodes_filter_by_cached_health() {
        let cache = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(60);
        cache.set(&keys::node_health(2), json!(true), ttl).await.unwrap();
        cache.set(&keys::node_health(3), json!(false), ttl).await.unwrap();

        let mut nodes: Vec<Node> = (1..=4).map(node).collect();
        for n in nodes.iter_mut().take(3) {
            n.protocol_settings.health_check.enabled = true;
        }

        let lb = balancer(cache);
        let ids: Vec<u64> = lb
            .get_available_nodes(&nodes)
            .await
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![2, 4]);
    }
}
