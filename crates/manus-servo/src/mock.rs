//! 测试与仿真用的舵机端口
//!
//! 位置按 ID 脚本化；可以把单个 ID 设为不应答来模拟掉线，或注入
//! 一次性的事务错误。所有写事务按批次记录，供断言检查。端口本体
//! 交给总线独占后，测试/仿真侧仍可通过 [`MockServoHandle`] 继续
//! 操纵脚本和读取记录。

use crate::ServoError;
use crate::bus::{ServoPort, TargetCommand};
use manus_protocol::BUS_CAPACITY;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockServoState {
    positions: HashMap<u8, u16>,
    unresponsive: HashSet<u8>,
    write_log: Vec<Vec<TargetCommand>>,
    next_write_error: Option<ServoError>,
    next_read_error: Option<ServoError>,
}

impl MockServoState {
    fn sync_read_replies(&self, ids: &[u8]) -> SmallVec<[(u8, u16); BUS_CAPACITY]> {
        let mut replies = SmallVec::new();
        for &id in ids {
            if self.unresponsive.contains(&id) {
                continue;
            }
            if let Some(&raw) = self.positions.get(&id) {
                replies.push((id, raw));
            }
        }
        replies
    }
}

#[derive(Default)]
pub struct MockServoPort {
    state: Arc<Mutex<MockServoState>>,
}

impl MockServoPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取对端句柄，端口移交总线后仍可操纵脚本
    pub fn handle(&self) -> MockServoHandle {
        MockServoHandle {
            state: self.state.clone(),
        }
    }

    /// 设定某个 ID 的当前原始位置
    pub fn set_position(&mut self, id: u8, raw: u16) {
        self.state.lock().unwrap().positions.insert(id, raw);
    }

    /// 把某个 ID 设为不应答（或恢复应答）
    pub fn set_unresponsive(&mut self, id: u8, dead: bool) {
        let mut state = self.state.lock().unwrap();
        if dead {
            state.unresponsive.insert(id);
        } else {
            state.unresponsive.remove(&id);
        }
    }

    /// 注入一次性的写事务错误（下一次 `sync_write` 返回它）
    pub fn inject_write_error(&mut self, error: ServoError) {
        self.state.lock().unwrap().next_write_error = Some(error);
    }

    /// 注入一次性的读事务错误（下一次 `sync_read` 返回它）
    pub fn inject_read_error(&mut self, error: ServoError) {
        self.state.lock().unwrap().next_read_error = Some(error);
    }

    /// 全部已记录的写事务，每个元素是一个完整批次
    pub fn transactions(&self) -> Vec<Vec<TargetCommand>> {
        self.state.lock().unwrap().write_log.clone()
    }

    pub fn take_transactions(&mut self) -> Vec<Vec<TargetCommand>> {
        std::mem::take(&mut self.state.lock().unwrap().write_log)
    }
}

impl ServoPort for MockServoPort {
    fn sync_write(&mut self, batch: &[TargetCommand]) -> Result<(), ServoError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.next_write_error.take() {
            return Err(error);
        }
        state.write_log.push(batch.to_vec());
        Ok(())
    }

    fn sync_read(
        &mut self,
        ids: &[u8],
        _timeout: Duration,
    ) -> Result<SmallVec<[(u8, u16); BUS_CAPACITY]>, ServoError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.next_read_error.take() {
            return Err(error);
        }
        Ok(state.sync_read_replies(ids))
    }
}

/// Mock 端口的测试侧句柄
#[derive(Clone)]
pub struct MockServoHandle {
    state: Arc<Mutex<MockServoState>>,
}

impl MockServoHandle {
    /// 设定某个 ID 的当前原始位置
    pub fn set_position(&self, id: u8, raw: u16) {
        self.state.lock().unwrap().positions.insert(id, raw);
    }

    /// 把某个 ID 设为不应答（或恢复应答）
    pub fn set_unresponsive(&self, id: u8, dead: bool) {
        let mut state = self.state.lock().unwrap();
        if dead {
            state.unresponsive.insert(id);
        } else {
            state.unresponsive.remove(&id);
        }
    }

    pub fn inject_write_error(&self, error: ServoError) {
        self.state.lock().unwrap().next_write_error = Some(error);
    }

    pub fn inject_read_error(&self, error: ServoError) {
        self.state.lock().unwrap().next_read_error = Some(error);
    }

    /// 全部已记录的写事务
    pub fn transactions(&self) -> Vec<Vec<TargetCommand>> {
        self.state.lock().unwrap().write_log.clone()
    }

    pub fn take_transactions(&self) -> Vec<Vec<TargetCommand>> {
        std::mem::take(&mut self.state.lock().unwrap().write_log)
    }

    /// 最近一次下发给某个 ID 的命令
    pub fn last_command(&self, id: u8) -> Option<TargetCommand> {
        self.state
            .lock()
            .unwrap()
            .write_log
            .iter()
            .rev()
            .flat_map(|batch| batch.iter().rev())
            .find(|cmd| cmd.id == id)
            .copied()
    }
}
