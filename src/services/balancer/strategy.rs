use std::hash::{DefaultHasher, Hash, Hasher};

use crate::services::registry::ServiceInstance;

/// 轮询：cursor 由调用方按服务维护
pub(crate) fn round_robin<'a>(
    eligible: &[&'a ServiceInstance],
    cursor: usize,
) -> &'a ServiceInstance {
    eligible[cursor % eligible.len()]
}

/// 按 metadata.weight 加权随机，全部权重为 0 时退化为均匀随机
pub(crate) fn weighted_random<'a>(eligible: &[&'a ServiceInstance]) -> &'a ServiceInstance {
    let total: u64 = eligible
        .iter()
        .map(|instance| u64::from(instance.metadata.weight))
        .sum();
    if total == 0 {
        return eligible[rand::random_range(0..eligible.len())];
    }

    let mut point = rand::random_range(0..total);
    for &instance in eligible {
        let weight = u64::from(instance.metadata.weight);
        if point < weight {
            return instance;
        }
        point -= weight;
    }
    eligible[eligible.len() - 1]
}

/// 在途调用数最少者胜出，并列时从 start 开始轮转，避免总是压在第一个实例上
pub(crate) fn least_outstanding<'a, F>(
    eligible: &[&'a ServiceInstance],
    start: usize,
    outstanding: F,
) -> &'a ServiceInstance
where
    F: Fn(&str) -> usize,
{
    let len = eligible.len();
    let mut best = eligible[start % len];
    let mut best_load = outstanding(&best.id);
    for offset in 1..len {
        let candidate = eligible[(start + offset) % len];
        let load = outstanding(&candidate.id);
        if load < best_load {
            best = candidate;
            best_load = load;
        }
    }
    best
}

/// 最高随机权重（rendezvous）一致性哈希：实例增减只影响落在该实例上的 key
pub(crate) fn rendezvous_owner<'a>(
    key: &str,
    instances: &'a [ServiceInstance],
) -> Option<&'a ServiceInstance> {
    instances.iter().max_by_key(|instance| {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        instance.id.hash(&mut hasher);
        hasher.finish()
    })
}
