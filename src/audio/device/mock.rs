//! 测试用设备：记录提交的块，由测试决定何时、在哪个线程发出完成通知

use std::sync::{Arc, Mutex, MutexGuard};

use super::{check_block_len, DeviceError, OutputDevice};
use crate::audio::format::BlockLayout;
use crate::audio::tracker::CompletionNotifier;

#[derive(Default)]
pub(crate) struct MockState {
    pub opens: usize,
    pub closes: usize,
    pub resets: usize,
    pub layout: Option<BlockLayout>,
    pub device_id: Option<u32>,
    /// (槽位下标, 块内容)
    pub blocks: Vec<(usize, Vec<u8>)>,
    /// 尚未通知完成的块数
    pub pending: usize,
    /// reset 时为排队的块逐个通知
    pub notify_on_reset: bool,
    pub fail_open: bool,
    /// 接下来拒绝的 write_block 次数
    pub reject_writes: usize,
    notifier: Option<CompletionNotifier>,
    /// 最近一次会话的通知句柄，close 之后仍保留，用来模拟迟到的通知
    last_notifier: Option<CompletionNotifier>,
}

/// 测试侧句柄，与设备共享状态
#[derive(Clone, Default)]
pub(crate) struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    /// 完成最早的 `n` 个块，返回实际完成的块数
    pub fn complete(&self, n: usize) -> usize {
        let (notifier, count) = {
            let mut state = self.state();
            let count = n.min(state.pending);
            state.pending -= count;
            (state.notifier.clone(), count)
        };
        let Some(notifier) = notifier else {
            return 0;
        };
        for _ in 0..count {
            notifier.notify();
        }
        count
    }

    /// 当前会话的通知句柄
    pub fn notifier(&self) -> Option<CompletionNotifier> {
        self.state().notifier.clone()
    }

    /// 用上一次会话的句柄发出一次通知，不管设备是否还打开
    pub fn notify_stale(&self) {
        let notifier = self.state().last_notifier.clone();
        if let Some(notifier) = notifier {
            notifier.notify();
        }
    }

    pub fn submitted(&self) -> usize {
        self.state().blocks.len()
    }
}

pub(crate) struct MockDevice {
    handle: MockHandle,
}

impl MockDevice {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl OutputDevice for MockDevice {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(
        &mut self,
        layout: &BlockLayout,
        device_id: Option<u32>,
        notifier: CompletionNotifier,
    ) -> Result<(), DeviceError> {
        let mut state = self.handle.state();
        if state.fail_open {
            return Err(DeviceError::Platform {
                op: "mock open",
                status: -50,
            });
        }
        state.opens += 1;
        state.layout = Some(*layout);
        state.device_id = device_id;
        state.pending = 0;
        state.last_notifier = Some(notifier.clone());
        state.notifier = Some(notifier);
        Ok(())
    }

    fn write_block(&mut self, index: usize, block: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.handle.state();
        let layout = state.layout.ok_or(DeviceError::NotOpen)?;
        if state.notifier.is_none() {
            return Err(DeviceError::NotOpen);
        }
        check_block_len(&layout, block)?;
        if state.reject_writes > 0 {
            state.reject_writes -= 1;
            return Err(DeviceError::Rejected("mock rejection".into()));
        }
        state.blocks.push((index, block.to_vec()));
        state.pending += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        let (notifier, count) = {
            let mut state = self.handle.state();
            state.resets += 1;
            let count = std::mem::take(&mut state.pending);
            let notifier = if state.notify_on_reset {
                state.notifier.clone()
            } else {
                None
            };
            (notifier, count)
        };
        if let Some(notifier) = notifier {
            for _ in 0..count {
                notifier.notify();
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let mut state = self.handle.state();
        if state.notifier.take().is_some() {
            state.closes += 1;
        }
        state.pending = 0;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.state().notifier.is_some()
    }
}
