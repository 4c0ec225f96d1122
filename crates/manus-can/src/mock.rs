//! Mock CAN 适配器
//!
//! 无硬件依赖的内存适配器，用于单元测试和 `--mock` 仿真模式。
//! 适配器本体交给 IO 循环独占，测试/仿真侧持有 [`MockCanHandle`]
//! 向接收队列注入帧、读取已发送的帧。

use crate::{BusFrame, CanAdapter, CanError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockCanState {
    receive_queue: VecDeque<BusFrame>,
    sent_frames: Vec<BusFrame>,
    rx_errors: VecDeque<CanError>,
}

/// Mock CAN 适配器
///
/// 接收队列为空时，`receive` 会模拟真实 socket 的阻塞超时语义：
/// 睡眠一个读超时周期后返回 `Timeout`，避免 IO 循环空转。
pub struct MockCanAdapter {
    state: Arc<Mutex<MockCanState>>,
    read_timeout: Duration,
}

impl Default for MockCanAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCanAdapter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockCanState::default())),
            read_timeout: Duration::from_millis(1),
        }
    }

    /// 获取对端句柄，用于注入接收帧和观察发送帧
    pub fn handle(&self) -> MockCanHandle {
        MockCanHandle {
            state: self.state.clone(),
        }
    }
}

/// Mock 适配器的测试侧句柄
#[derive(Clone)]
pub struct MockCanHandle {
    state: Arc<Mutex<MockCanState>>,
}

impl MockCanHandle {
    /// 注入一帧到接收队列
    pub fn push_frame(&self, frame: BusFrame) {
        self.state.lock().unwrap().receive_queue.push_back(frame);
    }

    /// 按顺序注入多帧
    pub fn push_frames(&self, frames: impl IntoIterator<Item = BusFrame>) {
        let mut state = self.state.lock().unwrap();
        state.receive_queue.extend(frames);
    }

    /// 注入一个接收错误（在队列中的帧之前弹出）
    pub fn inject_rx_error(&self, error: CanError) {
        self.state.lock().unwrap().rx_errors.push_back(error);
    }

    /// 取走全部已发送的帧
    pub fn take_sent_frames(&self) -> Vec<BusFrame> {
        std::mem::take(&mut self.state.lock().unwrap().sent_frames)
    }

    /// 已发送帧数量
    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent_frames.len()
    }

    /// 接收队列中尚未被消费的帧数量
    pub fn pending_rx(&self) -> usize {
        self.state.lock().unwrap().receive_queue.len()
    }
}

impl CanAdapter for MockCanAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        self.state.lock().unwrap().sent_frames.push(frame);
        Ok(())
    }

    fn receive(&mut self) -> Result<BusFrame, CanError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(error) = state.rx_errors.pop_front() {
                return Err(error);
            }
            if let Some(frame) = state.receive_queue.pop_front() {
                return Ok(frame);
            }
        }

        // 队列空：模拟阻塞读超时，睡眠期间不持锁
        if !self.read_timeout.is_zero() {
            std::thread::sleep(self.read_timeout);
            if let Some(frame) = self.state.lock().unwrap().receive_queue.pop_front() {
                return Ok(frame);
            }
        }
        Err(CanError::Timeout)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }
}
