use std::time::Duration;

/// 单次 invoke 的选项
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// 单次尝试的超时，未指定时使用 ClientConfig::default_timeout
    pub timeout: Option<Duration>,
    /// 只有幂等调用才会重试
    pub idempotent: bool,
    /// 覆盖 ClientConfig::max_retries
    pub max_retries: Option<u32>,
    /// 一致性哈希粘滞键
    pub sticky_key: Option<String>,
}

impl InvokeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_sticky_key(mut self, key: impl Into<String>) -> Self {
        self.sticky_key = Some(key.into());
        self
    }
}
