/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use trellis_mesh::{ConnectionId, Frame, InnerProtocol, Mesh, PeerId, SystemInterface, FRAME_CAPACITY, SEQNO_SIZE};

use crate::device::VirtualDevice;
use crate::settings::Settings;

/// Host environment handed to the datapath: bound sockets, the device, and
/// a monotonic clock. Sends are synchronous and non-blocking so that
/// EMSGSIZE surfaces inline where path MTU discovery can see it.
pub struct ServiceHost<D: VirtualDevice> {
    sockets: Vec<Arc<UdpSocket>>,
    device: D,
    started: Instant,
}

impl<D: VirtualDevice> SystemInterface for ServiceHost<D> {
    fn send_udp(&self, socket: usize, destination: &SocketAddr, datagram: &[u8]) -> std::io::Result<()> {
        match self.sockets.get(socket) {
            Some(s) => s.try_send_to(datagram, *destination).map(|_| ()),
            None => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such socket")),
        }
    }

    #[cfg(unix)]
    fn set_tos(&self, socket: usize, tos: u8) {
        use std::os::unix::io::AsRawFd;
        if let Some(s) = self.sockets.get(socket) {
            let tos = tos as libc::c_int;
            unsafe {
                libc::setsockopt(
                    s.as_raw_fd(),
                    libc::IPPROTO_IP,
                    libc::IP_TOS,
                    (&tos as *const libc::c_int).cast(),
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn set_tos(&self, _socket: usize, _tos: u8) {}

    fn send_tcp(&self, _connection: ConnectionId, _frame: &[u8]) -> bool {
        // The standalone service runs without meta-connections; a real
        // deployment wires the control channel collaborator in here.
        debug!("no control channel transport available");
        false
    }

    fn terminate_connection(&self, connection: ConnectionId) {
        debug!("control connection {:?} terminated", connection);
    }

    fn write_frame(&self, frame: &[u8]) {
        self.device.write_frame(frame);
    }

    fn request_key(&self, peer: PeerId) {
        debug!("key requested for peer {:?} (static keying, nothing to do)", peer);
    }

    fn regenerate_key(&self) {
        debug!("key regeneration requested (static keying, nothing to do)");
    }

    fn time_ticks(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }
}

impl<D: VirtualDevice> InnerProtocol for ServiceHost<D> {
    fn route(&self, _source: PeerId, frame: &mut Frame) {
        // No routing layer in the standalone service: deliver everything to
        // the local device.
        self.device.write_frame(frame.payload());
    }
}

/// Build the mesh from settings, bind sockets, and run the reactor until
/// ctrl-c. Must run inside a current-thread runtime's `LocalSet`; the whole
/// datapath is one cooperative task plus one reader task per socket.
pub async fn run<D: VirtualDevice>(
    settings: Settings,
    device: D,
    mut device_rx: mpsc::Receiver<Vec<u8>>,
) -> Result<(), Box<dyn Error>> {
    let mut mesh = Mesh::new(settings.mesh_config());

    let mut sockets = Vec::with_capacity(settings.listen.len());
    for addr in &settings.listen {
        let socket = Arc::new(UdpSocket::bind(*addr).await?);
        info!("listening on {}", socket.local_addr()?);
        mesh.add_listen_socket(addr.is_ipv6());
        sockets.push(socket);
    }

    for ps in &settings.peers {
        let id = mesh.add_peer(&ps.name, &ps.hostname, ps.options());
        if let Some(addr) = ps.address {
            mesh.set_peer_address(id, addr);
        }
        mesh.set_nexthop(id, Some(id));
        mesh.set_via(id, Some(id));
        mesh.set_session_in(id, ps.session()?);
        mesh.set_session_out(id, ps.session()?);
        mesh.set_reachable(id, true);
    }

    let (tx, mut rx) = mpsc::channel::<(usize, SocketAddr, Vec<u8>)>(1024);
    for (index, socket) in sockets.iter().cloned().enumerate() {
        let tx = tx.clone();
        tokio::task::spawn_local(async move {
            let mut buf = vec![0_u8; SEQNO_SIZE + FRAME_CAPACITY];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        if tx.send((index, from, buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("socket receive error: {}", e),
                }
            }
        });
    }

    let host = ServiceHost { sockets, device, started: Instant::now() };
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            Some((_, from, data)) = rx.recv() => {
                mesh.receive_udp_datagram(&host, &host, from, &data);
            }
            Some(data) = device_rx.recv() => {
                // Without an L2/L3 routing layer every device frame floods
                // the spanning tree.
                match Frame::from_payload(&data) {
                    Ok(mut frame) => {
                        let local = mesh.local();
                        mesh.broadcast_packet(&host, local, &mut frame);
                    }
                    Err(e) => debug!("dropping oversize device frame: {}", e),
                }
            }
            _ = tick.tick() => {
                mesh.service(&host);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("terminate signal received, shutting down");
                break;
            }
        }
    }
    Ok(())
}
