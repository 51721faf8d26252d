//! Board agent integration tests
//!
//! Plays the studio side against a real scheduler on loopback: beacon the
//! board, accept its upstream link, run the id assignment handshake, then
//! walk a child board through the forwarded assignment chain.
//!
//! The studio master listens on the specific loopback address while the
//! board's own child listener stays on the wildcard address of the same
//! port; a child dials a second loopback address to reach the board. Each
//! test uses its own discovery port so the binary's tests can run in
//! parallel.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use taal_io::protocol::packet::{ReadablePacket, WritablePacket, HEADER_SIZE};
use taal_io::protocol::{
    ConnectionCommand, ConnectionType, DiscoveryPacket, EventCommand, ProtocolType,
};
use taal_io::scheduler::Scheduler;

const TEST_DEADLINE: Duration = Duration::from_secs(10);

fn write_test_config(name: &str, discovery_port: u16) -> PathBuf {
    let path = std::env::temp_dir().join(format!("taal-io-{}-{}.conf", name, std::process::id()));
    fs::write(
        &path,
        format!("BroadcastAddress=127.0.0.1\nDiscoveryPort={}\n", discovery_port),
    )
    .expect("write test config");
    path
}

/// Studio-side listener: specific loopback address, sharing the data port
/// with the board's wildcard child listener.
fn studio_listener(addr: [u8; 4], port: u16) -> TcpListener {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    socket.set_reuse_address(true).unwrap();
    socket.set_reuse_port(true).unwrap();
    socket
        .bind(&SocketAddr::from((addr, port)).into())
        .unwrap();
    socket.listen(5).unwrap();
    socket.set_nonblocking(true).unwrap();
    socket.into()
}

/// Beacon the studio's identity until the board dials in.
fn accept_with_beacons(
    listener: &TcpListener,
    beacons: &UdpSocket,
    port: u16,
    board_id: u8,
    distance: u8,
) -> TcpStream {
    let beacon = DiscoveryPacket {
        board_id,
        connection_type: ConnectionType::Usb,
        distance,
    };
    let deadline = Instant::now() + TEST_DEADLINE;
    let mut last_beacon: Option<Instant> = None;
    loop {
        if last_beacon.map_or(true, |at| at.elapsed() >= Duration::from_millis(200)) {
            beacons
                .send_to(&beacon.encode(), ("127.0.0.1", port))
                .expect("emit studio beacon");
            last_beacon = Some(Instant::now());
        }
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                return stream;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "board never dialed the studio");
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("studio accept failed: {}", e),
        }
    }
}

fn write_frame(
    stream: &mut TcpStream,
    protocol: ProtocolType,
    command: u16,
    payload: &[u8],
    footprints: &[u8],
) {
    let mut buf = vec![0u8; HEADER_SIZE + payload.len() + footprints.len()];
    let mut packet = WritablePacket::prepare(&mut buf, protocol, command).unwrap();
    for &byte in payload {
        packet.push::<u8>(byte).unwrap();
    }
    for &footprint in footprints.iter().rev() {
        packet.push_footprint(footprint).unwrap();
    }
    stream.write_all(packet.as_bytes()).unwrap();
}

/// Read exactly one frame off the stream, length taken from the header.
fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let payload_len = u16::from_le_bytes([header[7], header[8]]) as usize;
    let footprint_count = header[9] as usize;
    let mut frame = vec![0u8; HEADER_SIZE + payload_len + footprint_count];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    stream.read_exact(&mut frame[HEADER_SIZE..])?;
    Ok(frame)
}

/// Read frames until one matches `protocol`/`command`, skipping the rest.
fn read_frame_of(stream: &mut TcpStream, protocol: ProtocolType, command: u16) -> Vec<u8> {
    let deadline = Instant::now() + TEST_DEADLINE;
    loop {
        assert!(Instant::now() < deadline, "expected frame never arrived");
        let frame = read_frame(stream).expect("read studio frame");
        let packet = ReadablePacket::parse(&frame).expect("parse studio frame");
        if packet.protocol() == Some(protocol) && packet.command() == command {
            return frame;
        }
    }
}

#[test]
fn board_connects_and_forwards_assignment_chain() {
    let discovery_port = 14642;
    let data_port = discovery_port + 1;
    let config_path = write_test_config("chain", discovery_port);

    let listener = studio_listener([127, 0, 0, 1], data_port);
    let beacons = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut scheduler = Scheduler::new(vec![
        "--config-path".to_string(),
        config_path.to_string_lossy().into_owned(),
    ])
    .expect("scheduler construction");
    let running = scheduler.run_flag();
    let board = thread::spawn(move || scheduler.run());

    // Cold election: one USB beacon at distance 0 makes the board dial us.
    let mut board_stream = accept_with_beacons(&listener, &beacons, discovery_port, 7, 0);

    // Id request: Connection/IdAssignment carrying the unassigned id.
    let request = read_frame(&mut board_stream).expect("id request");
    let mut packet = ReadablePacket::parse(&request).unwrap();
    assert_eq!(packet.protocol(), Some(ProtocolType::Connection));
    assert_eq!(packet.command(), ConnectionCommand::IdAssignment as u16);
    assert_eq!(packet.extract::<u8>(), Some(0));
    assert_eq!(packet.footprint_count(), 0);

    // Grant id 42.
    write_frame(
        &mut board_stream,
        ProtocolType::Connection,
        ConnectionCommand::IdAssignment as u16,
        &[42],
        &[],
    );

    // The board follows up with its control surface dimensions.
    let specs = read_frame(&mut board_stream).expect("hardware specs");
    let mut packet = ReadablePacket::parse(&specs).unwrap();
    assert_eq!(packet.protocol(), Some(ProtocolType::Connection));
    assert_eq!(packet.command(), ConnectionCommand::HardwareSpecs as u16);
    assert_eq!(packet.extract::<u8>(), Some(42));
    let width = packet.extract::<u16>().unwrap();
    assert_eq!(width as usize, taal_io::gpio::PIN_MAP.len());
    assert_eq!(packet.extract::<u16>(), Some(1));

    // The null GPIO backend reads every pulled-up pin as pressed, so the
    // first connected tick reports one press per control.
    let events = read_frame_of(
        &mut board_stream,
        ProtocolType::Event,
        EventCommand::ControlsChanged as u16,
    );
    let mut packet = ReadablePacket::parse(&events).unwrap();
    assert_eq!(packet.extract::<u8>(), Some(42));
    for index in 0..taal_io::gpio::PIN_MAP.len() {
        assert_eq!(packet.extract::<u8>(), Some(index as u8));
        assert_eq!(packet.extract::<u8>(), Some(1));
    }
    assert_eq!(packet.extract::<u8>(), None);

    // A child dials the board's wildcard listener through a second loopback
    // address and asks for an id.
    let mut child = TcpStream::connect(("127.0.0.2", data_port)).expect("child dial");
    child
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write_frame(
        &mut child,
        ProtocolType::Connection,
        ConnectionCommand::IdAssignment as u16,
        &[0],
        &[],
    );

    // The board forwards the request with the footprint stack
    // [temporary id, board id], temporary id in front.
    let forwarded = read_frame_of(
        &mut board_stream,
        ProtocolType::Connection,
        ConnectionCommand::IdAssignment as u16,
    );
    let packet = ReadablePacket::parse(&forwarded).unwrap();
    assert_eq!(packet.payload(), &[0]);
    assert_eq!(packet.footprints(), &[1, 42]);

    // Studio answers with the child's final id, routed by the footprint.
    write_frame(
        &mut board_stream,
        ProtocolType::Connection,
        ConnectionCommand::IdAssignment as u16,
        &[77],
        &[1],
    );

    // The child receives the grant with the footprint stack popped empty.
    let grant = read_frame(&mut child).expect("child grant");
    let mut packet = ReadablePacket::parse(&grant).unwrap();
    assert_eq!(packet.protocol(), Some(ProtocolType::Connection));
    assert_eq!(packet.command(), ConnectionCommand::IdAssignment as u16);
    assert_eq!(packet.extract::<u8>(), Some(77));
    assert_eq!(packet.footprint_count(), 0);

    // A specs request behind two junk bytes: the board resynchronises on
    // the magic key and still answers with its dimensions.
    let mut request = vec![0xFF, 0xFF];
    {
        let mut frame = [0u8; HEADER_SIZE];
        WritablePacket::prepare(
            &mut frame,
            ProtocolType::Connection,
            ConnectionCommand::HardwareSpecs as u16,
        )
        .unwrap();
        request.extend_from_slice(&frame);
    }
    board_stream.write_all(&request).unwrap();
    let specs = read_frame_of(
        &mut board_stream,
        ProtocolType::Connection,
        ConnectionCommand::HardwareSpecs as u16,
    );
    let mut packet = ReadablePacket::parse(&specs).unwrap();
    assert_eq!(packet.extract::<u8>(), Some(42));

    // The child is in data mode now; its event frames pass upstream
    // verbatim.
    write_frame(
        &mut child,
        ProtocolType::Event,
        EventCommand::ControlsChanged as u16,
        &[77, 0, 1],
        &[],
    );
    let relayed = read_frame_of(
        &mut board_stream,
        ProtocolType::Event,
        EventCommand::ControlsChanged as u16,
    );
    let packet = ReadablePacket::parse(&relayed).unwrap();
    assert_eq!(packet.payload(), &[77, 0, 1]);
    assert_eq!(packet.footprint_count(), 0);

    // Master vanish: closing the studio link must drop the child too.
    drop(board_stream);
    let deadline = Instant::now() + TEST_DEADLINE;
    let mut scratch = [0u8; 64];
    loop {
        match child.read(&mut scratch) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => break,
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                assert!(Instant::now() < deadline, "child never saw the teardown");
            }
            Err(e) => panic!("child read failed: {}", e),
        }
    }

    running.store(false, Ordering::Relaxed);
    board.join().expect("board thread join");
    let _ = fs::remove_file(config_path);
}

/// Studio side of the id handshake: read the request, grant an id, read the
/// hardware specs that follow.
fn run_handshake(stream: &mut TcpStream, grant: u8) {
    let request = read_frame(stream).expect("id request");
    let mut packet = ReadablePacket::parse(&request).unwrap();
    assert_eq!(packet.protocol(), Some(ProtocolType::Connection));
    assert_eq!(packet.command(), ConnectionCommand::IdAssignment as u16);
    assert_eq!(packet.extract::<u8>(), Some(0));

    write_frame(
        stream,
        ProtocolType::Connection,
        ConnectionCommand::IdAssignment as u16,
        &[grant],
        &[],
    );

    let specs = read_frame(stream).expect("hardware specs");
    let mut packet = ReadablePacket::parse(&specs).unwrap();
    assert_eq!(packet.protocol(), Some(ProtocolType::Connection));
    assert_eq!(packet.command(), ConnectionCommand::HardwareSpecs as u16);
    assert_eq!(packet.extract::<u8>(), Some(grant));
}

#[test]
fn closer_master_preempts_current_one() {
    let discovery_port = 16642;
    let data_port = discovery_port + 1;
    let config_path = write_test_config("preempt", discovery_port);

    let far_listener = studio_listener([127, 0, 0, 1], data_port);
    let near_listener = studio_listener([127, 0, 0, 3], data_port);

    let mut scheduler = Scheduler::new(vec![
        "--config-path".to_string(),
        config_path.to_string_lossy().into_owned(),
    ])
    .expect("scheduler construction");
    let running = scheduler.run_flag();
    let board = thread::spawn(move || scheduler.run());

    // A distant studio (two hops out) gets the board first.
    let far_beacons = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut far = accept_with_beacons(&far_listener, &far_beacons, discovery_port, 7, 2);
    run_handshake(&mut far, 42);

    // A one-hop endpoint appears on another loopback address; distance
    // 0 + 1 beats the board's current distance 3, so it re-elects.
    let near_beacons = UdpSocket::bind("127.0.0.3:0").unwrap();
    let mut near = accept_with_beacons(&near_listener, &near_beacons, discovery_port, 9, 0);
    run_handshake(&mut near, 55);

    // The superseded upstream link was closed before the new one opened.
    let deadline = Instant::now() + TEST_DEADLINE;
    let mut scratch = [0u8; 256];
    loop {
        match far.read(&mut scratch) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => break,
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                assert!(Instant::now() < deadline, "old master never saw the teardown");
            }
            Err(e) => panic!("old master read failed: {}", e),
        }
    }
    drop(near);

    running.store(false, Ordering::Relaxed);
    board.join().expect("board thread join");
    let _ = fs::remove_file(config_path);
}

#[test]
fn scheduler_stops_on_run_flag() {
    let config_path = write_test_config("stop", 15642);
    let mut scheduler = Scheduler::new(vec![
        "--config-path".to_string(),
        config_path.to_string_lossy().into_owned(),
    ])
    .expect("scheduler construction");
    assert_eq!(scheduler.state(), taal_io::scheduler::State::Disconnected);

    let running = scheduler.run_flag();
    let board = thread::spawn(move || scheduler.run());
    thread::sleep(Duration::from_millis(100));

    running.store(false, Ordering::Relaxed);
    board.join().expect("board thread join");
    let _ = fs::remove_file(config_path);
}
