// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! JSON over UDP
//!
//! 检测进程每帧发送一个 JSON 报文 (以换行结尾), 匹配器在本地端口接收.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// 单个报文最大字节数
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// 接收结果
#[derive(Debug)]
pub enum Received<T> {
    Data(T, SocketAddr),
    /// 超时 / 无数据
    Empty,
    /// 报文无法解析, 已记录日志
    Malformed,
}

/// 绑定 UDP socket
///
/// `timeout = None` blocks forever on receive; otherwise every receive waits
/// at most `timeout`. Zero durations are bumped to one millisecond since the
/// platform rejects a zero read timeout.
pub fn create_udp_socket(address: &str, port: u16, timeout: Option<Duration>) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((address, port))
        .with_context(|| format!("failed to bind UDP socket on {address}:{port}"))?;
    let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
    socket
        .set_read_timeout(timeout)
        .context("failed to set UDP read timeout")?;
    Ok(socket)
}

/// 接收并解析一个 JSON 报文
pub fn recv_json<T: DeserializeOwned>(socket: &UdpSocket) -> std::io::Result<Received<T>> {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let (len, address) = match socket.recv_from(&mut buf) {
        Ok(r) => r,
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            return Ok(Received::Empty)
        }
        Err(e) => return Err(e),
    };

    match serde_json::from_slice::<T>(&buf[..len]) {
        Ok(data) => Ok(Received::Data(data, address)),
        Err(e) => {
            warn!(
                from = %address,
                payload = %String::from_utf8_lossy(&buf[..len]),
                "could not decode datagram: {e}"
            );
            Ok(Received::Malformed)
        }
    }
}

/// 发送一个 JSON 报文 (以换行结尾)
pub fn send_json<T: Serialize + ?Sized>(
    socket: &UdpSocket,
    address: impl ToSocketAddrs,
    data: &T,
) -> Result<usize> {
    let mut msg = serde_json::to_vec(data).context("failed to encode datagram")?;
    msg.push(b'\n');
    if msg.len() > MAX_DATAGRAM_SIZE {
        warn!(
            bytes = msg.len(),
            "datagram exceeds {MAX_DATAGRAM_SIZE} bytes and will be truncated by the receiver"
        );
    }
    socket
        .send_to(&msg, address)
        .context("failed to send datagram")
}
