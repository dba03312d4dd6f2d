//! Ctrl-C 处理。
//!
//! 第一次：置位取消标志，调度器进入收尾（不再派发新任务）；第二次：立即退出（130）。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Drain,
    ForceExit,
}

/// 处理一次中断信号，返回应执行的动作。
pub fn on_signal(cancel: &AtomicBool) -> SignalAction {
    if cancel.swap(true, Ordering::SeqCst) {
        SignalAction::ForceExit
    } else {
        SignalAction::Drain
    }
}

/// 安装处理器并返回共享的取消标志。`before_exit` 在强制退出前调用（刷新日志等）。
pub fn install<F>(before_exit: F) -> Result<Arc<AtomicBool>, ctrlc::Error>
where
    F: Fn() + Send + 'static,
{
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || match on_signal(&flag) {
        SignalAction::Drain => {
            warn!(target: "interrupt", "收到中断信号，正在收尾（再按一次 Ctrl-C 强制退出）");
        }
        SignalAction::ForceExit => {
            eprintln!("强制退出");
            before_exit();
            std::process::exit(EXIT_INTERRUPTED);
        }
    })?;
    Ok(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_signal_forces_exit() {
        let cancel = AtomicBool::new(false);
        assert_eq!(on_signal(&cancel), SignalAction::Drain);
        assert!(cancel.load(Ordering::SeqCst));
        assert_eq!(on_signal(&cancel), SignalAction::ForceExit);
    }
}
