//! Network module: discovery, master election and the per-tick pipeline
//!
//! Every board runs the same agent. It beacons its identity over UDP, elects
//! the best upstream endpoint it hears (USB links first, then the smallest
//! hop distance), opens a single TCP link to that master and obtains a board
//! id through the assignment handshake. Downstream, it accepts child boards
//! on its own listener, mints temporary ids for children still waiting on the
//! studio, and forwards their traffic upstream with its own id stamped on the
//! footprint stack.
//!
//! All steady-state I/O is non-blocking; one frame batch leaves for the
//! master per tick, assembled in the segmented [`NetworkBuffer`] in a fixed
//! order: descendant assign requests, direct-child assign requests,
//! descendant events, then this board's own input events.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::buffer::NetworkBuffer;
use crate::config::ConfigTable;
use crate::error::{Error, Result};
use crate::gpio::PIN_MAP;
use crate::protocol::packet::{FrameScanner, ReadablePacket, WritablePacket, HEADER_SIZE};
use crate::protocol::{
    BoardId, ConnectionCommand, ConnectionType, DiscoveryPacket, EventCommand, InputEvent,
    NodeDistance, ProtocolType, DISCOVERY_PACKET_SIZE, DISCOVERY_PORT,
};
use crate::scheduler::{SchedulerCache, State};

/// Cadence of beacon emission and endpoint election.
pub const NETWORK_DISCOVERY_RATE: Duration = Duration::from_secs(1);

/// Upper bound on one master ingest per tick.
const MASTER_READ_SIZE: usize = 1024;

/// Bounded wait for the id assignment reply.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded wait for the TCP connect to an elected endpoint.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const KEEPALIVE_IDLE: Duration = Duration::from_secs(3);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
const KEEPALIVE_RETRIES: u32 = 1;

const LISTEN_BACKLOG: i32 = 5;

/// Scratch capacity for one forwarded assignment frame.
const FORWARD_CAPACITY: usize = 256;

/// Upstream candidate learnt from a beacon. Lives for one discovery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub connection_type: ConnectionType,
    pub distance: NodeDistance,
}

/// A downstream board connected to this one.
struct Client {
    stream: TcpStream,
    addr: SocketAddr,
    /// `0` while the child is in assign mode, its temporary id while the
    /// studio decides, the studio-assigned id afterwards.
    id: BoardId,
}

/// Board module responsible for network communication.
pub struct NetworkModule {
    board_id: BoardId,
    connection_type: ConnectionType,
    node_distance: NodeDistance,

    broadcast_addr: Ipv4Addr,
    discovery_port: u16,
    data_port: u16,

    /// Beacon emitter, bound to the broadcast address. `None` until the bind
    /// succeeds; retried on every discovery cycle.
    udp_broadcast: Option<UdpSocket>,
    /// Beacon receiver on the wildcard address.
    udp_local: UdpSocket,
    /// Downstream accept socket.
    listener: TcpListener,
    /// The single upstream link.
    master: Option<TcpStream>,

    clients: Vec<Client>,
    self_assign_index: u8,
    buffer: NetworkBuffer,
}

impl NetworkModule {
    /// Open the permanent sockets. Socket or listener creation failure is
    /// fatal, as is a broadcast bind refused with a permission error or an
    /// address conflict; any other broadcast bind failure is retried on the
    /// next discovery cycle.
    pub fn new(config: &ConfigTable) -> Result<Self> {
        let broadcast_addr: Ipv4Addr = config
            .get("BroadcastAddress")
            .unwrap_or("127.0.0.1")
            .parse()?;
        let discovery_port = config.get_as::<u16>("DiscoveryPort").unwrap_or(DISCOVERY_PORT);
        let data_port = discovery_port
            .checked_add(1)
            .ok_or_else(|| Error::Config("DiscoveryPort out of range".into()))?;

        let udp_broadcast = Self::try_bind_broadcast(broadcast_addr, discovery_port)?;

        let local = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        local.set_reuse_address(true)?;
        local.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, discovery_port)).into())?;
        local.set_nonblocking(true)?;
        let udp_local: UdpSocket = local.into();

        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        listener.set_reuse_address(true)?;
        listener.set_reuse_port(true)?;
        listener.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, data_port)).into())?;
        listener.listen(LISTEN_BACKLOG)?;
        listener.set_nonblocking(true)?;
        let listener: TcpListener = listener.into();

        log::info!(
            "network module up: beacons on {}:{}, children on port {}",
            broadcast_addr,
            discovery_port,
            data_port
        );

        Ok(NetworkModule {
            board_id: 0,
            connection_type: ConnectionType::None,
            node_distance: 0,
            broadcast_addr,
            discovery_port,
            data_port,
            udp_broadcast,
            udp_local,
            listener,
            master: None,
            clients: Vec::new(),
            self_assign_index: 0,
            buffer: NetworkBuffer::new(),
        })
    }

    pub fn discovery_rate(&self) -> Duration {
        NETWORK_DISCOVERY_RATE
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn node_distance(&self) -> NodeDistance {
        self.node_distance
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn try_bind_broadcast(addr: Ipv4Addr, port: u16) -> Result<Option<UdpSocket>> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        socket.set_reuse_address(true)?;
        match socket.bind(&SocketAddr::from((addr, port)).into()) {
            Ok(()) => {
                socket.set_nonblocking(true)?;
                Ok(Some(socket.into()))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::PermissionDenied | io::ErrorKind::AddrInUse
                ) =>
            {
                Err(Error::Io(e))
            }
            Err(e) => {
                log::warn!("broadcast bind to {}:{} failed: {}", addr, port, e);
                Ok(None)
            }
        }
    }

    /// Discovery cycle: emit a beacon, then scan and elect.
    pub fn discover(&mut self, cache: &mut SchedulerCache) {
        if self.udp_broadcast.is_none() {
            match Self::try_bind_broadcast(self.broadcast_addr, self.discovery_port) {
                Ok(Some(socket)) => {
                    log::info!("broadcast address {} became available", self.broadcast_addr);
                    self.udp_broadcast = Some(socket);
                }
                Ok(None) => return,
                Err(e) => {
                    log::warn!("broadcast bind retry failed: {}", e);
                    return;
                }
            }
        }
        self.discovery_emit();
        self.discovery_scan(cache);
    }

    fn discovery_emit(&self) {
        let Some(socket) = &self.udp_broadcast else {
            return;
        };
        let packet = DiscoveryPacket {
            board_id: self.board_id,
            connection_type: self.connection_type,
            distance: self.node_distance,
        };
        let destination = SocketAddr::from((self.broadcast_addr, self.discovery_port));
        if let Err(e) = socket.send_to(&packet.encode(), destination) {
            log::debug!("beacon emit failed: {}", e);
        }
    }

    /// Drain pending beacons and run election over what was heard.
    fn discovery_scan(&mut self, cache: &mut SchedulerCache) {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        // Beacons addressed straight to the bound broadcast address land on
        // the emit socket (loopback deployments), the rest on the wildcard
        // receiver. Drain both.
        if let Some(socket) = &self.udp_broadcast {
            Self::drain_beacons(socket, self.board_id, &mut endpoints);
        }
        Self::drain_beacons(&self.udp_local, self.board_id, &mut endpoints);
        if !endpoints.is_empty() {
            self.analyze_endpoints(&endpoints, cache);
        }
    }

    fn drain_beacons(socket: &UdpSocket, self_id: BoardId, endpoints: &mut Vec<Endpoint>) {
        let mut buf = [0u8; DISCOVERY_PACKET_SIZE * 4];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((size, SocketAddr::V4(sender))) => {
                    let Some(packet) = DiscoveryPacket::decode(&buf[..size]) else {
                        log::debug!("ignoring malformed beacon from {}", sender);
                        continue;
                    };
                    if packet.board_id == self_id {
                        continue;
                    }
                    log::debug!(
                        "beacon from {}: board {} over {:?} at distance {}",
                        sender,
                        packet.board_id,
                        packet.connection_type,
                        packet.distance
                    );
                    endpoints.push(Endpoint {
                        addr: *sender.ip(),
                        connection_type: packet.connection_type,
                        distance: packet.distance,
                    });
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("beacon receive failed: {}", e);
                    return;
                }
            }
        }
    }

    fn analyze_endpoints(&mut self, endpoints: &[Endpoint], cache: &mut SchedulerCache) {
        let best = select_best_endpoint(endpoints);
        if should_reconnect(self.connection_type, self.node_distance, best) {
            log::info!(
                "electing master {} ({:?}, distance {})",
                best.addr,
                best.connection_type,
                best.distance
            );
            self.init_master_connection(*best, cache);
        }
    }

    /// Open the upstream link to a freshly elected endpoint and run the id
    /// handshake. The previous master socket, if any, is closed first.
    fn init_master_connection(&mut self, endpoint: Endpoint, cache: &mut SchedulerCache) {
        if let Some(old) = self.master.take() {
            let _ = old.shutdown(Shutdown::Both);
        }
        match self.connect_and_handshake(&endpoint) {
            Ok(stream) => {
                self.master = Some(stream);
                cache.set_state(State::Connected);
                log::info!(
                    "connected to master {} as board {} (distance {})",
                    endpoint.addr,
                    self.board_id,
                    self.node_distance
                );
            }
            Err(e) => {
                log::warn!("master connection to {} failed: {}", endpoint.addr, e);
                self.drop_master_state(cache);
            }
        }
    }

    fn connect_and_handshake(&mut self, endpoint: &Endpoint) -> Result<TcpStream> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_IDLE)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_RETRIES);
        socket.set_tcp_keepalive(&keepalive)?;
        let address = SocketAddr::from((endpoint.addr, self.data_port));
        socket.connect_timeout(&address.into(), CONNECT_TIMEOUT)?;
        let mut stream: TcpStream = socket.into();

        // Id request carrying the unassigned id.
        let mut request = [0u8; HEADER_SIZE + 1];
        let mut packet = WritablePacket::prepare(
            &mut request,
            ProtocolType::Connection,
            ConnectionCommand::IdAssignment as u16,
        )?;
        packet.push::<u8>(0)?;
        stream.write_all(packet.as_bytes())?;

        // Bounded wait for the reply; a silent master aborts the handshake.
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let mut reply = [0u8; 64];
        let size = stream.read(&mut reply)?;
        if size == 0 {
            return Err(Error::Handshake("master closed during id assignment".into()));
        }
        let mut response = ReadablePacket::parse(&reply[..size])
            .map_err(|e| Error::Handshake(format!("invalid id assignment reply: {}", e)))?;
        if response.protocol() != Some(ProtocolType::Connection)
            || response.command() != ConnectionCommand::IdAssignment as u16
        {
            return Err(Error::Handshake("unexpected reply to id request".into()));
        }
        let id = response
            .extract::<u8>()
            .ok_or_else(|| Error::Handshake("id assignment reply carries no id".into()))?;

        self.board_id = id;
        self.connection_type = endpoint.connection_type;
        self.node_distance = endpoint.distance.saturating_add(1);

        // Enter the non-blocking regime, then advertise the control surface.
        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;
        Self::write_hardware_specs(&mut stream, id)?;
        Ok(stream)
    }

    fn write_hardware_specs(stream: &mut TcpStream, id: BoardId) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE + 5];
        let mut packet = WritablePacket::prepare(
            &mut buf,
            ProtocolType::Connection,
            ConnectionCommand::HardwareSpecs as u16,
        )?;
        packet.push::<u8>(id)?;
        packet.push::<u16>(PIN_MAP.len() as u16)?;
        packet.push::<u16>(1)?;
        stream.write_all(packet.as_bytes())?;
        Ok(())
    }

    /// Tear down the upstream link and everything that depended on it.
    fn drop_master_state(&mut self, cache: &mut SchedulerCache) {
        if let Some(stream) = self.master.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.board_id = 0;
        self.connection_type = ConnectionType::None;
        self.node_distance = 0;
        self.notify_disconnection_to_clients();
        cache.set_state(State::Disconnected);
    }

    /// Close every child socket and clear the list; children rediscover the
    /// tree on their own.
    fn notify_disconnection_to_clients(&mut self) {
        if self.clients.is_empty() {
            return;
        }
        log::info!(
            "dropping {} downstream boards after master loss",
            self.clients.len()
        );
        for client in self.clients.drain(..) {
            let _ = client.stream.shutdown(Shutdown::Both);
        }
    }

    /// One tick of the connected pipeline.
    pub fn tick(&mut self, cache: &mut SchedulerCache, events: &[InputEvent]) {
        if cache.state() != State::Connected {
            return;
        }
        self.process_master(cache);
        if cache.state() != State::Connected {
            return;
        }
        self.accept_clients();
        self.read_clients();
        self.process_clients_data(events);
        self.transfer_to_master();
        self.buffer.reset();
    }

    /// Ingest master traffic; a closed or reset link tears the state down.
    fn process_master(&mut self, cache: &mut SchedulerCache) {
        let mut buf = [0u8; MASTER_READ_SIZE];
        let size = {
            let Some(stream) = self.master.as_mut() else {
                return;
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    log::info!("master closed the connection");
                    self.drop_master_state(cache);
                    return;
                }
                Ok(size) => size,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::TimedOut
                    ) =>
                {
                    log::warn!("master connection lost: {}", e);
                    self.drop_master_state(cache);
                    return;
                }
                Err(e) => {
                    log::warn!("master read failed: {}", e);
                    return;
                }
            }
        };
        let mut scanner = FrameScanner::new(&buf[..size]);
        while let Some(frame) = scanner.next_frame() {
            self.dispatch_master_frame(&frame);
        }
    }

    fn dispatch_master_frame(&mut self, frame: &ReadablePacket<'_>) {
        match (frame.protocol(), frame.command()) {
            (Some(ProtocolType::Connection), command)
                if command == ConnectionCommand::IdAssignment as u16 =>
            {
                self.route_assignment(frame);
            }
            (Some(ProtocolType::Connection), command)
                if command == ConnectionCommand::HardwareSpecs as u16 =>
            {
                self.send_hardware_specs();
            }
            (protocol, command) => {
                log::debug!(
                    "unhandled master frame: protocol {:?} command {}",
                    protocol,
                    command
                );
            }
        }
    }

    /// Route an id assignment down the tree. The front footprint names the
    /// direct child on the path; a single-entry stack means that child is the
    /// requester and the payload carries its assigned id.
    fn route_assignment(&mut self, frame: &ReadablePacket<'_>) {
        let footprint_count = frame.footprint_count();
        let Some(front) = frame.footprint(0) else {
            log::debug!("id assignment without footprints, ignoring");
            return;
        };
        let Some(position) = self.clients.iter().position(|c| c.id == front) else {
            log::warn!("id assignment for unknown downstream board {}", front);
            return;
        };
        let mut forward = [0u8; FORWARD_CAPACITY];
        if frame.total_size() > forward.len() {
            log::warn!("oversized id assignment frame dropped");
            return;
        }
        let Ok(mut packet) = WritablePacket::copy_from(&mut forward, frame) else {
            return;
        };
        packet.pop_front_footprint();
        let client = &mut self.clients[position];
        if let Err(e) = client.stream.write_all(packet.as_bytes()) {
            log::warn!("forwarding id assignment to {} failed: {}", client.addr, e);
            let client = self.clients.remove(position);
            let _ = client.stream.shutdown(Shutdown::Both);
            return;
        }
        if footprint_count == 1 {
            let mut reader = *frame;
            match reader.extract::<u8>() {
                Some(id) if id != 0 => {
                    log::info!("downstream board {} assigned id {}", front, id);
                    self.clients[position].id = id;
                }
                _ => log::warn!("id assignment reply without a usable id"),
            }
        }
    }

    fn send_hardware_specs(&mut self) {
        let Some(stream) = self.master.as_mut() else {
            return;
        };
        if let Err(e) = Self::write_hardware_specs(stream, self.board_id) {
            log::debug!("hardware specs reply failed: {}", e);
        }
    }

    /// Accept every pending downstream connection.
    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("rejecting downstream board {}: {}", addr, e);
                        continue;
                    }
                    log::info!("downstream board connected from {}", addr);
                    self.clients.push(Client { stream, addr, id: 0 });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Drain child sockets into the reception regions. A read of zero or a
    /// hard error removes the child.
    fn read_clients(&mut self) {
        let NetworkModule {
            buffer,
            clients,
            board_id,
            self_assign_index,
            ..
        } = self;
        let mut index = 0;
        while index < clients.len() {
            let client = &mut clients[index];
            let keep = if client.id == 0 {
                Self::read_assign_client(buffer, client, *board_id, self_assign_index)
            } else {
                Self::read_data_client(buffer, client)
            };
            if keep {
                index += 1;
            } else {
                let client = clients.remove(index);
                let _ = client.stream.shutdown(Shutdown::Both);
                log::info!("downstream board {} disconnected", client.addr);
            }
        }
    }

    /// Assign mode: read one id request, stamp the forwarding path and mint
    /// the child's temporary id. Returns `false` when the child is gone.
    fn read_assign_client(
        buffer: &mut NetworkBuffer,
        client: &mut Client,
        board_id: BoardId,
        assign_index: &mut u8,
    ) -> bool {
        let spare = buffer.assign_spare();
        if spare.len() < HEADER_SIZE + 3 {
            log::warn!("self-assign region full, deferring request from {}", client.addr);
            return true;
        }
        let size = match client.stream.read(spare) {
            Ok(0) => return false,
            Ok(size) => size,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) => {
                log::warn!("read from {} failed: {}", client.addr, e);
                return false;
            }
        };
        let frame = match ReadablePacket::parse(&spare[..size]) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("invalid assign request from {}: {}", client.addr, e);
                return true;
            }
        };
        if frame.protocol() != Some(ProtocolType::Connection)
            || frame.command() != ConnectionCommand::IdAssignment as u16
        {
            log::warn!("unexpected frame from assigning board {}", client.addr);
            return true;
        }
        let total = frame.total_size();

        // Stamp the forwarding path: this board first, then the minted
        // temporary id in front of it.
        let temp_id = next_temp_id(assign_index);
        let Ok(mut packet) = WritablePacket::from_frame(spare) else {
            return true;
        };
        if packet.push_footprint(board_id).is_err() || packet.push_footprint(temp_id).is_err() {
            log::warn!("assign request from {} does not fit, dropped", client.addr);
            return true;
        }
        client.id = temp_id;
        log::debug!(
            "downstream board {} requesting an id as temporary {}",
            client.addr,
            temp_id
        );
        buffer.advance_assign(total + 2);
        true
    }

    /// Data mode: append whatever the child sent to the slave-data region.
    fn read_data_client(buffer: &mut NetworkBuffer, client: &mut Client) -> bool {
        let spare = buffer.slave_data_spare();
        if spare.is_empty() {
            log::warn!("slave-data region full, deferring reads from {}", client.addr);
            return true;
        }
        match client.stream.read(spare) {
            Ok(0) => false,
            Ok(size) => {
                buffer.advance_slave_data(size);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                log::warn!("read from {} failed: {}", client.addr, e);
                false
            }
        }
    }

    /// Assemble this tick's outbound frame batch. The ordering is a protocol
    /// contract: descendant assigns, direct-child assigns, descendant
    /// events, own events.
    fn process_clients_data(&mut self, events: &[InputEvent]) {
        self.promote_slave_assigns();
        self.promote_self_assigns();
        self.forward_slave_events();
        self.emit_self_events(events);
    }

    /// Copy descendant assign requests from slave-data into the transfer
    /// region, stamping this board onto the footprint stack.
    fn promote_slave_assigns(&mut self) {
        let board_id = self.board_id;
        let mut position = 0;
        loop {
            let (spare, slave) = self.buffer.transfer_spare_and_slave_data();
            let mut scanner = FrameScanner::new(&slave[position..]);
            let Some(frame) = scanner.next_frame() else {
                break;
            };
            position += scanner.position();
            if frame.protocol() != Some(ProtocolType::Connection)
                || frame.command() != ConnectionCommand::IdAssignment as u16
            {
                continue;
            }
            let advance = {
                let Ok(mut packet) = WritablePacket::copy_from(spare, &frame) else {
                    log::warn!("transfer region full, descendant assign request dropped");
                    continue;
                };
                if packet.push_footprint(board_id).is_err() {
                    log::warn!("transfer region full, descendant assign request dropped");
                    continue;
                }
                packet.total_size()
            };
            self.buffer.advance_transfer(advance);
        }
    }

    /// Copy direct-child assign requests into the transfer region. Their
    /// footprints were already stamped when they were read.
    fn promote_self_assigns(&mut self) {
        let mut position = 0;
        loop {
            let (spare, assign) = self.buffer.transfer_spare_and_assign();
            let mut scanner = FrameScanner::new(&assign[position..]);
            let Some(frame) = scanner.next_frame() else {
                break;
            };
            position += scanner.position();
            if frame.protocol() != Some(ProtocolType::Connection)
                || frame.command() != ConnectionCommand::IdAssignment as u16
            {
                continue;
            }
            let advance = {
                let Ok(packet) = WritablePacket::copy_from(spare, &frame) else {
                    log::warn!("transfer region full, assign request dropped");
                    continue;
                };
                packet.total_size()
            };
            self.buffer.advance_transfer(advance);
        }
    }

    /// Copy the remaining descendant frames verbatim into the transfer
    /// region.
    fn forward_slave_events(&mut self) {
        let mut position = 0;
        loop {
            let (spare, slave) = self.buffer.transfer_spare_and_slave_data();
            let mut scanner = FrameScanner::new(&slave[position..]);
            let Some(frame) = scanner.next_frame() else {
                break;
            };
            position += scanner.position();
            if frame.protocol() == Some(ProtocolType::Connection)
                && frame.command() == ConnectionCommand::IdAssignment as u16
            {
                continue;
            }
            let advance = {
                let Ok(packet) = WritablePacket::copy_from(spare, &frame) else {
                    log::warn!("transfer region full, descendant frame dropped");
                    continue;
                };
                packet.total_size()
            };
            self.buffer.advance_transfer(advance);
        }
    }

    /// Encode this board's input events as one `ControlsChanged` frame.
    fn emit_self_events(&mut self, events: &[InputEvent]) {
        if events.is_empty() {
            return;
        }
        let board_id = self.board_id;
        let needed = HEADER_SIZE + 1 + events.len() * 2;
        let spare = self.buffer.transfer_spare();
        if spare.len() < needed {
            log::warn!("transfer region full, {} input events dropped", events.len());
            return;
        }
        let advance = {
            let Ok(mut packet) = WritablePacket::prepare(
                spare,
                ProtocolType::Event,
                EventCommand::ControlsChanged as u16,
            ) else {
                return;
            };
            if packet.push::<u8>(board_id).is_err() {
                return;
            }
            for event in events {
                if packet.push::<u8>(event.index).is_err() || packet.push::<u8>(event.value).is_err()
                {
                    return;
                }
            }
            packet.total_size()
        };
        self.buffer.advance_transfer(advance);
    }

    /// Single send of the assembled batch. A full send buffer costs this
    /// tick's work; the next tick starts fresh.
    fn transfer_to_master(&mut self) {
        let length = self.buffer.transfer_len();
        if length == 0 {
            return;
        }
        let Some(stream) = self.master.as_mut() else {
            return;
        };
        match stream.write(self.buffer.transfer()) {
            Ok(written) if written < length => {
                log::warn!("partial transfer to master: {}/{} bytes", written, length);
            }
            Ok(_) => log::trace!("transferred {} bytes to master", length),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("master send buffer full, tick transfer dropped");
            }
            Err(e) => log::warn!("transfer to master failed: {}", e),
        }
    }
}

/// Best upstream candidate: USB endpoints beat the rest, then the smallest
/// distance wins.
fn select_best_endpoint(endpoints: &[Endpoint]) -> &Endpoint {
    let mut best = &endpoints[0];
    for endpoint in &endpoints[1..] {
        let best_usb = best.connection_type == ConnectionType::Usb;
        let usb = endpoint.connection_type == ConnectionType::Usb;
        if (usb && !best_usb) || (usb == best_usb && endpoint.distance < best.distance) {
            best = endpoint;
        }
    }
    best
}

/// Whether `best` is worth (re)connecting to from the current link.
fn should_reconnect(current: ConnectionType, distance: NodeDistance, best: &Endpoint) -> bool {
    (current != ConnectionType::Usb && best.connection_type == ConnectionType::Usb)
        || u16::from(best.distance) + 1 < u16::from(distance)
}

/// Mint the next temporary child id from the rolling counter. `0` is
/// reserved for unassigned boards and never handed out.
fn next_temp_id(counter: &mut u8) -> u8 {
    *counter = counter.wrapping_add(1);
    if *counter == 0 {
        *counter = 1;
    }
    *counter
}
