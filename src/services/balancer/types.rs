use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 负载均衡策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerStrategy {
    #[default]
    RoundRobin,
    WeightedRandom,
    LeastOutstanding,
}

impl fmt::Display for LoadBalancerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancerStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalancerStrategy::WeightedRandom => write!(f, "weighted_random"),
            LoadBalancerStrategy::LeastOutstanding => write!(f, "least_outstanding"),
        }
    }
}

/// 负载均衡配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// 默认策略
    pub strategy: LoadBalancerStrategy,
    /// 按服务覆盖的策略
    pub service_strategies: HashMap<String, LoadBalancerStrategy>,
}

/// 单个实例的负载统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLoadStats {
    pub instance_id: String,
    pub outstanding: usize,
    pub total_selections: u64,
}
