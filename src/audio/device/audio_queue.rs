//! macOS AudioQueue 输出设备
//!
//! AudioQueue 本身就是"固定缓冲 + 完成回调"模型：
//! - open 时分配 N 个与槽位对应的 AudioQueueBuffer
//! - write_block 把块拷进对应缓冲并入队，第一次入队时启动队列
//! - 缓冲播放完毕后，AudioQueue 在内部线程上调用 output_callback
//!
//! run loop 传 null，回调在 AudioQueue 自己的线程上执行，回调里只调用 notify()。

use std::ffi::c_void;
use std::ptr;

use super::{check_block_len, DeviceError, OutputDevice};
use crate::audio::format::BlockLayout;
use crate::audio::tracker::CompletionNotifier;

type OSStatus = i32;
type AudioObjectID = u32;
type AudioQueueRef = *mut c_void;
type AudioQueueBufferRef = *mut AudioQueueBuffer;

type AudioQueueOutputCallback =
    extern "C" fn(user_data: *mut c_void, queue: AudioQueueRef, buffer: AudioQueueBufferRef);

const NO_ERR: OSStatus = 0;

const K_AUDIO_FORMAT_LINEAR_PCM: u32 = 0x6C70636D; // 'lpcm'
const K_AUDIO_FORMAT_FLAG_IS_SIGNED_INTEGER: u32 = 1 << 2;
const K_AUDIO_FORMAT_FLAG_IS_PACKED: u32 = 1 << 3;

const K_AUDIO_QUEUE_PROPERTY_CURRENT_DEVICE: u32 = 0x61716364; // 'aqcd'
const K_AUDIO_DEVICE_PROPERTY_DEVICE_UID: u32 = 0x75696420; // 'uid '
const K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL: u32 = 0x676C6F62; // 'glob'
const K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN: u32 = 0;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct AudioStreamBasicDescription {
    sample_rate: f64,
    format_id: u32,
    format_flags: u32,
    bytes_per_packet: u32,
    frames_per_packet: u32,
    bytes_per_frame: u32,
    channels_per_frame: u32,
    bits_per_channel: u32,
    reserved: u32,
}

#[repr(C)]
struct AudioQueueBuffer {
    audio_data_bytes_capacity: u32,
    audio_data: *mut c_void,
    audio_data_byte_size: u32,
    user_data: *mut c_void,
    packet_description_capacity: u32,
    packet_descriptions: *mut c_void,
    packet_description_count: u32,
}

#[repr(C)]
struct AudioObjectPropertyAddress {
    selector: u32,
    scope: u32,
    element: u32,
}

#[link(name = "AudioToolbox", kind = "framework")]
extern "C" {
    fn AudioQueueNewOutput(
        format: *const AudioStreamBasicDescription,
        callback: AudioQueueOutputCallback,
        user_data: *mut c_void,
        run_loop: *const c_void,
        run_loop_mode: *const c_void,
        flags: u32,
        out_queue: *mut AudioQueueRef,
    ) -> OSStatus;

    fn AudioQueueAllocateBuffer(
        queue: AudioQueueRef,
        capacity: u32,
        out_buffer: *mut AudioQueueBufferRef,
    ) -> OSStatus;

    fn AudioQueueEnqueueBuffer(
        queue: AudioQueueRef,
        buffer: AudioQueueBufferRef,
        num_packet_descs: u32,
        packet_descs: *const c_void,
    ) -> OSStatus;

    fn AudioQueueStart(queue: AudioQueueRef, start_time: *const c_void) -> OSStatus;
    fn AudioQueueStop(queue: AudioQueueRef, immediate: u8) -> OSStatus;
    fn AudioQueueDispose(queue: AudioQueueRef, immediate: u8) -> OSStatus;

    fn AudioQueueSetProperty(
        queue: AudioQueueRef,
        property: u32,
        data: *const c_void,
        size: u32,
    ) -> OSStatus;
}

#[link(name = "CoreAudio", kind = "framework")]
extern "C" {
    fn AudioObjectGetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        data_size: *mut u32,
        data: *mut c_void,
    ) -> OSStatus;
}

/// 缓冲播放完成回调
///
/// 运行在 AudioQueue 内部线程，只做计数递减
extern "C" fn output_callback(
    user_data: *mut c_void,
    _queue: AudioQueueRef,
    _buffer: AudioQueueBufferRef,
) {
    if user_data.is_null() {
        return;
    }
    let notifier = unsafe { &*(user_data as *const CompletionNotifier) };
    notifier.notify();
}

fn check(op: &'static str, status: OSStatus) -> Result<(), DeviceError> {
    if status == NO_ERR {
        Ok(())
    } else {
        Err(DeviceError::Platform { op, status })
    }
}

/// 队列未运行时尝试启动，失败只记警告，下一次 write_block 重试
fn start_if_stopped(running: &mut bool, start: impl FnOnce() -> OSStatus) {
    if *running {
        return;
    }
    match check("AudioQueueStart", start()) {
        Ok(()) => {
            *running = true;
            log::debug!("AudioQueue started");
        }
        Err(e) => log::warn!("{}, will retry on next block", e),
    }
}

/// 查询设备 UID，AudioQueue 用 UID 而不是 AudioDeviceID 选择设备
fn device_uid(device_id: AudioObjectID) -> Option<core_foundation::string::CFString> {
    use core_foundation::base::TCFType;
    use core_foundation::string::CFString;

    let address = AudioObjectPropertyAddress {
        selector: K_AUDIO_DEVICE_PROPERTY_DEVICE_UID,
        scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
        element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
    };

    let mut size = std::mem::size_of::<*const c_void>() as u32;
    let mut cf_string_ref: *const c_void = ptr::null();

    let status = unsafe {
        AudioObjectGetPropertyData(
            device_id,
            &address,
            0,
            ptr::null(),
            &mut size,
            &mut cf_string_ref as *mut _ as *mut c_void,
        )
    };

    if status != NO_ERR || cf_string_ref.is_null() {
        return None;
    }

    // 属性按 create rule 返回，由 CFString 负责 release
    Some(unsafe { CFString::wrap_under_create_rule(cf_string_ref as *const _) })
}

struct QueueSession {
    layout: BlockLayout,
    queue: AudioQueueRef,
    buffers: Vec<AudioQueueBufferRef>,
    /// 回调的 user_data，必须活到 AudioQueueDispose 之后
    notifier: Box<CompletionNotifier>,
    running: bool,
}

/// AudioQueue 输出设备
pub struct AudioQueueDevice {
    session: Option<QueueSession>,
}

// AudioQueueRef / 缓冲指针只在持有 &mut self 时使用，回调线程只访问 notifier
unsafe impl Send for AudioQueueDevice {}

impl AudioQueueDevice {
    pub fn new() -> Self {
        Self { session: None }
    }

    fn dispose(session: QueueSession) {
        unsafe {
            AudioQueueStop(session.queue, 1);
            // immediate dispose 同步返回，之后不会再有回调
            AudioQueueDispose(session.queue, 1);
        }
        drop(session.notifier);
    }
}

impl Default for AudioQueueDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDevice for AudioQueueDevice {
    fn name(&self) -> &str {
        "audio-queue"
    }

    fn open(
        &mut self,
        layout: &BlockLayout,
        device_id: Option<u32>,
        notifier: CompletionNotifier,
    ) -> Result<(), DeviceError> {
        if self.session.is_some() {
            return Err(DeviceError::Rejected("audio queue already open".into()));
        }

        let uid = match device_id {
            Some(id) => Some(device_uid(id).ok_or(DeviceError::NotFound(id))?),
            None => None,
        };

        let format = layout.format;
        let bytes_per_frame = format.bytes_per_frame() as u32;
        let asbd = AudioStreamBasicDescription {
            sample_rate: format.sample_rate as f64,
            format_id: K_AUDIO_FORMAT_LINEAR_PCM,
            format_flags: K_AUDIO_FORMAT_FLAG_IS_SIGNED_INTEGER | K_AUDIO_FORMAT_FLAG_IS_PACKED,
            bytes_per_packet: bytes_per_frame,
            frames_per_packet: 1,
            bytes_per_frame,
            channels_per_frame: format.channels as u32,
            bits_per_channel: 16,
            reserved: 0,
        };

        let block_bytes = u32::try_from(layout.block_bytes)
            .map_err(|_| DeviceError::Unsupported(format!("block of {} bytes", layout.block_bytes)))?;

        let notifier = Box::new(notifier);
        let user_data = &*notifier as *const CompletionNotifier as *mut c_void;

        let mut queue: AudioQueueRef = ptr::null_mut();
        check("AudioQueueNewOutput", unsafe {
            AudioQueueNewOutput(
                &asbd,
                output_callback,
                user_data,
                ptr::null(),
                ptr::null(),
                0,
                &mut queue,
            )
        })?;

        let mut session = QueueSession {
            layout: *layout,
            queue,
            buffers: Vec::with_capacity(layout.block_count),
            notifier,
            running: false,
        };

        if let Some(uid) = uid {
            use core_foundation::base::TCFType;

            let uid_ref = uid.as_concrete_TypeRef();
            let status = unsafe {
                AudioQueueSetProperty(
                    queue,
                    K_AUDIO_QUEUE_PROPERTY_CURRENT_DEVICE,
                    &uid_ref as *const _ as *const c_void,
                    std::mem::size_of_val(&uid_ref) as u32,
                )
            };
            if let Err(e) = check("AudioQueueSetProperty(CurrentDevice)", status) {
                Self::dispose(session);
                return Err(e);
            }
            log::debug!("AudioQueue routed to device UID {}", uid);
        }

        for _ in 0..layout.block_count {
            let mut buffer: AudioQueueBufferRef = ptr::null_mut();
            let status = unsafe { AudioQueueAllocateBuffer(queue, block_bytes, &mut buffer) };
            if let Err(e) = check("AudioQueueAllocateBuffer", status) {
                // 已分配的缓冲随 dispose 一起释放
                Self::dispose(session);
                return Err(e);
            }
            session.buffers.push(buffer);
        }

        log::info!("AudioQueue opened: {}", layout);
        self.session = Some(session);
        Ok(())
    }

    fn write_block(&mut self, index: usize, block: &[u8]) -> Result<(), DeviceError> {
        let session = self.session.as_mut().ok_or(DeviceError::NotOpen)?;
        check_block_len(&session.layout, block)?;
        let buffer = *session
            .buffers
            .get(index)
            .ok_or_else(|| DeviceError::Rejected(format!("no queue buffer {}", index)))?;

        unsafe {
            let buf = &mut *buffer;
            ptr::copy_nonoverlapping(block.as_ptr(), buf.audio_data as *mut u8, block.len());
            buf.audio_data_byte_size = block.len() as u32;
        }

        check("AudioQueueEnqueueBuffer", unsafe {
            AudioQueueEnqueueBuffer(session.queue, buffer, 0, ptr::null())
        })?;

        // 入队成功后缓冲已归队列所有，启动失败也不能把块当作被拒绝
        let queue = session.queue;
        start_if_stopped(&mut session.running, || unsafe {
            AudioQueueStart(queue, ptr::null())
        });
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        let session = self.session.as_mut().ok_or(DeviceError::NotOpen)?;
        // immediate stop 丢弃所有排队的缓冲
        check("AudioQueueStop", unsafe { AudioQueueStop(session.queue, 1) })?;
        session.running = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(session) = self.session.take() {
            Self::dispose(session);
            log::debug!("AudioQueue disposed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for AudioQueueDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
