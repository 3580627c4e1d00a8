//! 协作式取消

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::{EngineError, Result};

/// 同一操作的各参与者共享的任务上下文；克隆共享同一个取消标志
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 已取消时返回 `Cancelled`
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let ctx = TaskContext::new();
        let other = ctx.clone();
        assert!(ctx.check().is_ok());
        other.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(EngineError::Cancelled)));
    }
}
