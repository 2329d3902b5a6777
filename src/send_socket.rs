use crate::config::JuiceNetConfig;
use crate::error::{JuiceNetError, JuiceNetResult};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace};

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Creates the endpoint's UDP socket with the options from the config. This must be called from
///  inside a tokio runtime.
pub fn bind_udp_socket(config: &JuiceNetConfig) -> JuiceNetResult<UdpSocket> {
    let addr = config.bind_addr;
    do_bind(config)
        .map_err(|source| JuiceNetError::BindFailure { addr, source })
}

fn do_bind(config: &JuiceNetConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(config.bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if config.broadcast {
        socket.set_broadcast(true)?;
    }
    if let Some(buffer_size) = config.socket_buffer_size {
        debug!("setting socket buffer sizes to {}", buffer_size);
        socket.set_send_buffer_size(buffer_size)?;
        socket.set_recv_buffer_size(buffer_size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&config.bind_addr.into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    info!("bound UDP socket to {:?}", socket.local_addr()?);
    Ok(socket)
}
