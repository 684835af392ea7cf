//! 固定块缓冲池
//!
//! 设计：
//! - arena + index：N 个固定容量的槽位，按轮转顺序复用，只用下标寻址
//! - 显式标记：每个槽位是 Free 或 InFlight，InFlight 的槽位不会被写入
//! - 零分配：所有槽位在 open 时一次性分配，播放期间不再分配
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 只被生产者线程访问，不需要锁。设备按提交顺序完成块（FIFO），
//! 所以已完成的槽位总是 in_flight 队列最前面的那些。

use std::collections::VecDeque;

/// 槽位状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// 可写入（可能已部分填充）
    Free,
    /// 已交给设备，尚未播放完成
    InFlight,
}

/// 单个块缓冲
pub struct BufferSlot {
    data: Box<[u8]>,
    filled: usize,
    state: SlotState,
}

impl BufferSlot {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            state: SlotState::Free,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn filled(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.filled
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// 已填充部分
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// 追加数据，返回实际写入字节数
    fn fill(&mut self, bytes: &[u8]) -> usize {
        debug_assert_eq!(self.state, SlotState::Free, "writing into an in-flight slot");
        let n = bytes.len().min(self.remaining());
        self.data[self.filled..self.filled + n].copy_from_slice(&bytes[..n]);
        self.filled += n;
        n
    }

    /// 用静音（s16 的 0）填满剩余空间，返回填充字节数
    fn pad_silence(&mut self) -> usize {
        let n = self.remaining();
        self.data[self.filled..].fill(0);
        self.filled = self.data.len();
        n
    }

    fn clear(&mut self) {
        self.filled = 0;
        self.state = SlotState::Free;
    }
}

/// 轮转块缓冲池
pub struct BufferPool {
    slots: Box<[BufferSlot]>,
    /// 正在填充的槽位下标
    current: usize,
    /// 已提交槽位的下标，按提交顺序排列
    in_flight: VecDeque<usize>,
    memory_locked: bool,
}

impl BufferPool {
    /// 分配 `block_count` 个 `block_bytes` 字节的槽位
    ///
    /// 两者都必须大于 0（由 BlockLayout::derive 保证）
    pub fn new(block_count: usize, block_bytes: usize) -> Self {
        assert!(block_count > 0, "pool needs at least one block");
        assert!(block_bytes > 0, "block capacity must be non-zero");

        let slots: Vec<BufferSlot> = (0..block_count)
            .map(|_| BufferSlot::new(block_bytes))
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            current: 0,
            in_flight: VecDeque::with_capacity(block_count),
            memory_locked: false,
        }
    }

    /// 每块字节数
    #[inline]
    pub fn capacity_bytes(&self) -> usize {
        self.slots[0].capacity()
    }

    #[inline]
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// 正在填充的槽位
    #[inline]
    pub fn current_slot(&self) -> &BufferSlot {
        &self.slots[self.current]
    }

    pub fn slot(&self, index: usize) -> &BufferSlot {
        &self.slots[index]
    }

    /// 当前槽位是否可写
    #[inline]
    pub fn current_is_free(&self) -> bool {
        self.slots[self.current].state == SlotState::Free
    }

    /// 向当前槽位写入，返回写入字节数
    ///
    /// 当前槽位 InFlight 时不写入，返回 0
    pub fn write_current(&mut self, bytes: &[u8]) -> usize {
        if !self.current_is_free() {
            return 0;
        }
        self.slots[self.current].fill(bytes)
    }

    /// 用静音补满当前槽位，返回补齐的字节数
    pub fn pad_current(&mut self) -> usize {
        if !self.current_is_free() {
            return 0;
        }
        self.slots[self.current].pad_silence()
    }

    /// 当前槽位已交给设备：标记 InFlight 并前进到下一个槽位
    ///
    /// 返回被标记的槽位下标
    pub fn mark_current_in_flight(&mut self) -> usize {
        let index = self.current;
        let slot = &mut self.slots[index];
        debug_assert_eq!(slot.state, SlotState::Free);
        debug_assert!(slot.is_full(), "only full blocks are submitted");

        slot.state = SlotState::InFlight;
        self.in_flight.push_back(index);
        self.current = (index + 1) % self.slots.len();
        index
    }

    /// 丢弃当前槽位已填充的数据（设备拒绝该块时使用），不前进
    pub fn discard_current(&mut self) {
        if self.current_is_free() {
            self.slots[self.current].filled = 0;
        }
    }

    /// 池中标记为 InFlight 的槽位数
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// 回收已完成的槽位
    ///
    /// `pending` 是设备仍持有的块数（来自完成计数器的快照）。
    /// 设备按提交顺序完成，所以最早提交的 `in_flight - pending` 个槽位已经播放完毕。
    /// 返回回收的槽位数。
    pub fn reclaim(&mut self, pending: usize) -> usize {
        let mut freed = 0;
        while self.in_flight.len() > pending {
            if let Some(index) = self.in_flight.pop_front() {
                self.slots[index].clear();
                freed += 1;
            }
        }
        freed
    }

    /// 当前槽位中尚未提交的字节数
    pub fn buffered_bytes(&self) -> usize {
        let slot = &self.slots[self.current];
        match slot.state {
            SlotState::Free => slot.filled,
            SlotState::InFlight => 0,
        }
    }

    /// 所有槽位回到 Free、清空填充，游标回到 0
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.clear();
        }
        self.in_flight.clear();
        self.current = 0;
    }

    /// 锁定槽位内存，防止被换页
    ///
    /// 逐个槽位 mlock，任一失败即解锁已锁定的部分并返回 false
    pub fn lock_memory(&mut self) -> bool {
        if self.memory_locked {
            return true;
        }

        let mut locked_bytes = 0usize;
        for (i, slot) in self.slots.iter().enumerate() {
            if !sys::mlock(&slot.data) {
                log::warn!(
                    "Failed to lock buffer pool memory ({}), continuing unlocked",
                    std::io::Error::last_os_error()
                );
                for locked in &self.slots[..i] {
                    sys::munlock(&locked.data);
                }
                return false;
            }
            locked_bytes += slot.data.len();
        }

        self.memory_locked = true;
        log::debug!("Buffer pool memory locked: {} bytes", locked_bytes);
        true
    }

    /// 检查内存是否已锁定
    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked
    }

    fn unlock_memory(&mut self) {
        if !self.memory_locked {
            return;
        }

        for slot in self.slots.iter() {
            sys::munlock(&slot.data);
        }

        self.memory_locked = false;
        log::debug!("Buffer pool memory unlocked");
    }
}

#[cfg(unix)]
mod sys {
    pub(super) fn mlock(bytes: &[u8]) -> bool {
        unsafe { libc::mlock(bytes.as_ptr() as *const libc::c_void, bytes.len()) == 0 }
    }

    pub(super) fn munlock(bytes: &[u8]) {
        unsafe {
            libc::munlock(bytes.as_ptr() as *const libc::c_void, bytes.len());
        }
    }
}

#[cfg(not(unix))]
mod sys {
    pub(super) fn mlock(_bytes: &[u8]) -> bool {
        false
    }

    pub(super) fn munlock(_bytes: &[u8]) {}
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
