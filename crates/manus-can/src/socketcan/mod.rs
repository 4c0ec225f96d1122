//! SocketCAN CAN 适配器实现
//!
//! 支持 Linux 平台下的 SocketCAN，使用内核级的 CAN 通讯接口。
//!
//! ## 特性
//!
//! - 基于 Linux SocketCAN 子系统，性能优异
//! - 支持标准帧和扩展帧
//! - 自动过滤错误帧（Bus Off 和缓冲区溢出除外，它们作为错误上报）
//! - 打开时禁用 loopback，避免自发帧回流到接收端
//!
//! ## 限制
//!
//! - **仅限 Linux 平台**：SocketCAN 是 Linux 内核特性
//! - **接口配置**：波特率等配置由系统工具（`ip link`）完成，不在应用层设置
//! - **权限要求**：可能需要 `dialout` 组权限或 `sudo`

use crate::{BusFrame, CanAdapter, CanDeviceError, CanDeviceErrorKind, CanError};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use socketcan::{
    CanError as SocketCanError, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket,
    StandardId,
};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;
use tracing::{trace, warn};

/// 默认读超时（与传感器 IO 循环的接收节拍一致，保证退出信号能被及时看到）
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// 检查 CAN 接口是否存在且处于 UP 状态
///
/// 通过读取 `/sys/class/net/<iface>/flags` 判断，不触碰接口配置。
fn interface_is_up(interface: &str) -> Result<bool, CanError> {
    if interface.is_empty() || interface.contains('/') {
        return Err(CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::NotFound,
            format!("Invalid CAN interface name: '{}'", interface),
        )));
    }

    let path = format!("/sys/class/net/{}/flags", interface);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NotFound,
                format!(
                    "CAN interface '{}' not found. For bench testing create a virtual interface:\n  sudo ip link add dev {} type vcan\n  sudo ip link set up {}",
                    interface, interface, interface
                ),
            )));
        },
        Err(e) => return Err(CanError::Io(e)),
    };

    let flags = parse_interface_flags(&raw).ok_or_else(|| {
        CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::Unknown,
            format!("Unreadable flags for CAN interface '{}': {:?}", interface, raw),
        ))
    })?;

    Ok(flags & (libc::IFF_UP as u32) != 0)
}

/// 解析 `/sys/class/net/<iface>/flags` 的十六进制内容（如 `0x1003`）
fn parse_interface_flags(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    let hex = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    u32::from_str_radix(hex, 16).ok()
}

/// 将 socket 系统调用错误映射为结构化的设备错误
///
/// 设备消失（如 USB-CAN 拔出）和权限问题属于致命错误，上层 IO 循环据此停机。
fn map_socket_io_error(interface: &str, e: std::io::Error) -> CanError {
    match e.raw_os_error() {
        Some(code) if code == libc::ENODEV || code == libc::ENXIO => {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NoDevice,
                format!("CAN interface '{}' disappeared: {}", interface, e),
            ))
        },
        Some(code) if code == libc::EACCES || code == libc::EPERM => {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::AccessDenied,
                format!("Access denied on CAN interface '{}': {}", interface, e),
            ))
        },
        _ => CanError::Io(e),
    }
}

/// SocketCAN 适配器
///
/// 实现 [`CanAdapter`] trait，提供 Linux 平台下的 SocketCAN 支持。
///
/// # 示例
///
/// ```no_run
/// use manus_can::{CanAdapter, SocketCanAdapter};
/// use manus_protocol::BusFrame;
///
/// let mut adapter = SocketCanAdapter::new("can0").unwrap();
///
/// adapter.send(BusFrame::new_standard(0x200, &[0xCA])).unwrap();
/// let rx_frame = adapter.receive().unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    /// SocketCAN socket
    socket: CanSocket,
    /// 接口名称（如 "can0"）
    interface: String,
    /// 是否已启动（SocketCAN 打开即启动）
    started: bool,
    /// 读超时时间（用于 receive 方法）
    read_timeout: Duration,
}

impl SocketCanAdapter {
    /// 创建新的 SocketCAN 适配器
    ///
    /// 在打开 socket 之前，会检查接口是否存在且已启动（UP 状态）。
    /// 如果接口不存在或未启动，会返回清晰的错误信息，指导用户如何修复。
    ///
    /// # 参数
    /// - `interface`: CAN 接口名称（如 "can0" 或 "vcan0"）
    ///
    /// # 错误
    /// - `CanError::Device`: 接口缺失、接口 DOWN 或打开失败（错误信息含修复命令）
    /// - `CanError::Io`: 系统调用失败（如权限不足）
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();

        // 先确认接口处于 UP 状态，只检查不配置
        if !interface_is_up(&interface)? {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NotFound,
                format!(
                    "CAN interface '{}' is DOWN, bring it up with:\n  sudo ip link set up {}",
                    interface, interface
                ),
            )));
        }
        trace!("CAN interface '{}' is UP", interface);

        let socket = CanSocket::open(&interface)
            .map_err(|e| map_socket_io_error(&interface, e))
            .map_err(|e| match e {
                CanError::Io(io) => CanError::Device(
                    format!("Failed to open CAN interface '{}': {}", interface, io).into(),
                ),
                other => other,
            })?;

        // 禁用 loopback，防止自己发出的校准命令回流到接收端被当作总线广播解析
        let loopback_enabled: libc::c_int = 0;
        let loopback_result = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_LOOPBACK,
                &loopback_enabled as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if loopback_result < 0 {
            // 某些内核不支持此选项，不阻塞初始化
            warn!(
                "Could not disable CAN_RAW_LOOPBACK on '{}': {}",
                interface,
                std::io::Error::last_os_error()
            );
        } else {
            trace!("Loopback disabled on '{}'", interface);
        }

        socket
            .set_read_timeout(DEFAULT_READ_TIMEOUT)
            .map_err(CanError::Io)?;

        trace!("SocketCAN interface '{}' opened", interface);

        Ok(Self {
            socket,
            interface,
            // SocketCAN 打开后立即可收发
            started: true,
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    /// 获取接口名称
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// 获取读超时时间
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// 设置读超时
    ///
    /// # 参数
    /// - `timeout`: 读超时时间
    ///
    /// # 错误
    /// - `CanError::Io`: 设置超时失败
    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        self.socket.set_read_timeout(timeout).map_err(CanError::Io)?;
        self.read_timeout = timeout;
        Ok(())
    }

    /// 带超时接收一帧
    ///
    /// 使用 `poll` 实现超时，之后从 socket 读取。错误帧在这里分类：
    /// - Bus Off 和缓冲区溢出作为错误返回（上层据此停机或告警）
    /// - 其他错误帧与远程帧仅记录日志并跳过
    fn receive_inner(&mut self) -> Result<BusFrame, CanError> {
        if !self.started {
            return Err(CanError::NotStarted);
        }

        let fd = self.socket.as_raw_fd();

        loop {
            // 注意：nix 0.30 的 PollFd::new 需要 BorrowedFd，PollTimeout 需要毫秒数
            let pollfd = PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN);
            let timeout_ms = self.read_timeout.as_millis().min(65535) as u16;
            match poll(&mut [pollfd], PollTimeout::from(timeout_ms)) {
                Ok(0) => return Err(CanError::Timeout),
                Ok(_) => {},
                Err(e) => {
                    return Err(CanError::Io(std::io::Error::other(format!(
                        "poll failed: {}",
                        e
                    ))));
                },
            }

            let frame = match self.socket.read_frame() {
                Ok(frame) => frame,
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    // poll 已检查过可读，这里仅作兜底
                    return Err(CanError::Timeout);
                },
                Err(e) => return Err(map_socket_io_error(&self.interface, e)),
            };

            match frame {
                CanFrame::Data(data_frame) => {
                    let id = match data_frame.id() {
                        Id::Standard(sid) => sid.as_raw() as u32,
                        Id::Extended(eid) => eid.as_raw(),
                    };
                    let payload = data_frame.data();
                    let mut data = [0u8; 8];
                    let len = payload.len().min(8);
                    data[..len].copy_from_slice(&payload[..len]);
                    return Ok(BusFrame {
                        id,
                        data,
                        len: len as u8,
                    });
                },
                CanFrame::Remote(_) => {
                    trace!("RTR frame received on '{}', ignoring", self.interface);
                },
                CanFrame::Error(error_frame) => {
                    let socketcan_error = SocketCanError::from(error_frame);
                    match &socketcan_error {
                        SocketCanError::BusOff => {
                            warn!("CAN Bus Off detected on '{}'", self.interface);
                            return Err(CanError::BusOff);
                        },
                        SocketCanError::ControllerProblem(problem) => {
                            let problem_str = format!("{}", problem);
                            if problem_str.contains("overflow") || problem_str.contains("Overflow")
                            {
                                warn!("CAN buffer overflow on '{}': {}", self.interface, problem);
                                return Err(CanError::BufferOverflow);
                            }
                            warn!("CAN controller problem: {}, ignoring", problem);
                        },
                        _ => {
                            warn!("CAN error frame received: {}, ignoring", socketcan_error);
                        },
                    }
                },
            }
        }
    }
}

impl CanAdapter for SocketCanAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        if !self.started {
            return Err(CanError::NotStarted);
        }

        let can_frame = if frame.id <= StandardId::MAX.as_raw() as u32 {
            let id = StandardId::new(frame.id as u16).ok_or_else(|| {
                CanError::Device(CanDeviceError::new(
                    CanDeviceErrorKind::InvalidFrame,
                    format!("Invalid standard ID: 0x{:X}", frame.id),
                ))
            })?;
            CanFrame::new(id, frame.data_slice())
        } else {
            let id = ExtendedId::new(frame.id).ok_or_else(|| {
                CanError::Device(CanDeviceError::new(
                    CanDeviceErrorKind::InvalidFrame,
                    format!("Invalid extended ID: 0x{:X}", frame.id),
                ))
            })?;
            CanFrame::new(id, frame.data_slice())
        };

        let can_frame = can_frame.ok_or_else(|| {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::InvalidFrame,
                format!("Failed to build CAN frame with ID 0x{:X}", frame.id),
            ))
        })?;

        self.socket
            .write_frame(&can_frame)
            .map_err(|e| map_socket_io_error(&self.interface, e))
    }

    fn receive(&mut self) -> Result<BusFrame, CanError> {
        self.receive_inner()
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.set_read_timeout(timeout) {
            warn!(
                "Failed to set read timeout on '{}': {}",
                self.interface, e
            );
        }
    }
}

impl Drop for SocketCanAdapter {
    fn drop(&mut self) {
        // socket 随所有权释放自动关闭
        trace!("SocketCAN interface '{}' dropped", self.interface);
    }
}
