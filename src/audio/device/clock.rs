//! 软件时钟设备
//!
//! 不依赖声卡：后台线程按实时速度"播放"提交的块，
//! 可选把块写到任意 `io::Write`（文件、管道），播放完成后发出通知。
//! 用于没有 AudioQueue 的平台、管道输出以及测试。
//!
//! 时序：块 k 在 max(now, 块 k-1 结束时刻) 开始，持续 block_duration，结束时通知。
//! reset 会打断当前块并立即"完成"所有排队中的块。

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{check_block_len, DeviceError, OutputDevice};
use crate::audio::format::BlockLayout;
use crate::audio::tracker::CompletionNotifier;

type Sink = Box<dyn Write + Send>;

/// 排队中的块
struct QueuedBlock {
    seq: u64,
    data: Vec<u8>,
}

/// 生产者与播放线程共享的控制状态
struct ClockShared {
    /// seq 小于该值的块直接丢弃
    discard_below: AtomicU64,
    stop: AtomicBool,
    /// 播放线程写 sink 失败时留下的错误，下一次 write_block 取走
    sink_error: Mutex<Option<io::Error>>,
}

struct ClockSession {
    layout: BlockLayout,
    tx: Sender<QueuedBlock>,
    /// 播放完的块缓冲回收到这里，避免每块重新分配
    recycled: Receiver<Vec<u8>>,
    shared: Arc<ClockShared>,
    worker: JoinHandle<Option<Sink>>,
    /// 已发送的块数
    sent: u64,
}

/// 软件时钟输出设备
pub struct ClockDevice {
    sink: Option<Sink>,
    session: Option<ClockSession>,
}

impl ClockDevice {
    /// 只计时、不输出
    pub fn new() -> Self {
        Self {
            sink: None,
            session: None,
        }
    }

    /// 把播放的块按原样写入 `sink`（s16le 交织）
    pub fn with_sink(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Some(Box::new(sink)),
            session: None,
        }
    }
}

impl Default for ClockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDevice for ClockDevice {
    fn name(&self) -> &str {
        "clock"
    }

    fn open(
        &mut self,
        layout: &BlockLayout,
        device_id: Option<u32>,
        notifier: CompletionNotifier,
    ) -> Result<(), DeviceError> {
        if self.session.is_some() {
            return Err(DeviceError::Rejected("clock device already open".into()));
        }
        // 只有一个虚拟设备，编号 0
        if let Some(id) = device_id.filter(|&id| id != 0) {
            return Err(DeviceError::NotFound(id));
        }

        let (tx, rx) = mpsc::channel::<QueuedBlock>();
        let (recycle_tx, recycled) = mpsc::channel::<Vec<u8>>();
        let shared = Arc::new(ClockShared {
            discard_below: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            sink_error: Mutex::new(None),
        });

        let block_duration = layout.block_duration();
        let sink = self.sink.take();
        let worker_shared = Arc::clone(&shared);

        let worker = thread::Builder::new()
            .name("pcmout-clock".into())
            .spawn(move || {
                run_clock(rx, recycle_tx, worker_shared, notifier, block_duration, sink)
            })?;

        log::debug!("Clock device opened: {}", layout);

        self.session = Some(ClockSession {
            layout: *layout,
            tx,
            recycled,
            shared,
            worker,
            sent: 0,
        });
        Ok(())
    }

    fn write_block(&mut self, _index: usize, block: &[u8]) -> Result<(), DeviceError> {
        let session = self.session.as_mut().ok_or(DeviceError::NotOpen)?;
        check_block_len(&session.layout, block)?;

        if let Some(err) = session
            .shared
            .sink_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(DeviceError::Io(err));
        }

        let mut data = session.recycled.try_recv().unwrap_or_default();
        data.clear();
        data.extend_from_slice(block);

        session
            .tx
            .send(QueuedBlock {
                seq: session.sent,
                data,
            })
            .map_err(|_| DeviceError::Disconnected)?;
        session.sent += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        let session = self.session.as_ref().ok_or(DeviceError::NotOpen)?;
        session
            .shared
            .discard_below
            .store(session.sent, Ordering::Release);
        session.worker.thread().unpark();
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        session.shared.stop.store(true, Ordering::Release);
        session.worker.thread().unpark();
        drop(session.tx);

        match session.worker.join() {
            Ok(sink) => {
                self.sink = sink;
                log::debug!("Clock device closed after {} blocks", session.sent);
                Ok(())
            }
            Err(_) => Err(DeviceError::Disconnected),
        }
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for ClockDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// 播放线程主循环，退出时交还 sink
fn run_clock(
    rx: Receiver<QueuedBlock>,
    recycle: Sender<Vec<u8>>,
    shared: Arc<ClockShared>,
    notifier: CompletionNotifier,
    block_duration: Duration,
    mut sink: Option<Sink>,
) -> Option<Sink> {
    let mut next_start: Option<Instant> = None;

    while let Ok(block) = rx.recv() {
        let discarded = || {
            shared.stop.load(Ordering::Acquire)
                || block.seq < shared.discard_below.load(Ordering::Acquire)
                || notifier.is_flushing()
        };

        let mut played = false;
        if !discarded() {
            let now = Instant::now();
            let start = match next_start {
                Some(t) if t > now => t,
                _ => now,
            };
            sleep_until(start, &shared, block.seq);
            // 等待开始时可能被 reset 打断
            if !discarded() {
                play_block(&block, &shared, &mut sink);
                let end = start + block_duration;
                sleep_until(end, &shared, block.seq);
                next_start = Some(end);
                played = true;
            }
        }
        if !played {
            next_start = None;
        }

        notifier.notify();
        let _ = recycle.send(block.data);
    }

    if let Some(out) = sink.as_mut() {
        let _ = out.flush();
    }
    sink
}

/// 把块写到 sink，失败时留下错误并停止后续写入
fn play_block(block: &QueuedBlock, shared: &ClockShared, sink: &mut Option<Sink>) {
    if let Some(out) = sink.as_mut() {
        if let Err(e) = out.write_all(&block.data) {
            *shared
                .sink_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(e);
            *sink = None;
        }
    }
}

/// 睡到 `deadline`，被 reset / close 打断时提前返回
fn sleep_until(deadline: Instant, shared: &ClockShared, seq: u64) {
    loop {
        if shared.stop.load(Ordering::Acquire)
            || seq < shared.discard_below.load(Ordering::Acquire)
        {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::park_timeout(deadline - now);
    }
}
