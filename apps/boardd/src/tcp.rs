//! 主机链路的 TCP 端口
//!
//! 监听一个地址，同一时刻只服务一个上位机连接。读端带短超时，
//! 没有数据时立刻返回 0，不拖慢链路任务的节拍；对端断开映射为
//! 一次读错误（让链路任务丢弃在途半包），之后回到等待新连接。

use manus_driver::HostPort;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 单次读的阻塞上限
const READ_TIMEOUT: Duration = Duration::from_millis(1);

pub struct TcpHostPort {
    listener: TcpListener,
    client: Option<TcpStream>,
}

impl TcpHostPort {
    /// 绑定监听地址；接受连接是惰性的，发生在链路任务的读路径上
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            client: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    fn poll_accept(&mut self) {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                // 已有连接时后到者顶替：上位机重连比残留的死连接重要
                if let Err(e) = Self::configure(&stream) {
                    warn!("Rejecting host client {}: {}", peer, e);
                    return;
                }
                if self.client.is_some() {
                    info!("Host client replaced by {}", peer);
                } else {
                    info!("Host client connected from {}", peer);
                }
                self.client = Some(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!("Host accept error: {}", e),
        }
    }

    fn configure(stream: &TcpStream) -> io::Result<()> {
        // accept 自非阻塞 listener，显式回到带超时的阻塞读
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(())
    }
}

impl HostPort for TcpHostPort {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.poll_accept();
        let Some(stream) = self.client.as_mut() else {
            return Ok(0);
        };

        match stream.read(buf) {
            // EOF：对端关闭，报一次错让链路任务复位解析器
            Ok(0) => {
                info!("Host client disconnected");
                self.client = None;
                Err(io::ErrorKind::ConnectionAborted.into())
            }
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => {
                self.client = None;
                Err(e)
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let Some(stream) = self.client.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no host client connected",
            ));
        };

        match stream.write_all(buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.client = None;
                Err(e)
            }
        }
    }
}
