use std::fmt;

/// 一次真实调用（或探测）的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    Timeout,
}

impl CallOutcome {
    pub fn is_success(self) -> bool {
        self == CallOutcome::Success
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Success => write!(f, "success"),
            CallOutcome::Failure => write!(f, "failure"),
            CallOutcome::Timeout => write!(f, "timeout"),
        }
    }
}
