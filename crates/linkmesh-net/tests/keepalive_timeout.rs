mod support;

use std::{net::TcpStream, sync::Mutex, time::Duration};

use linkmesh_net::{Connection, ConnectionId, FrameworkMessage, Listener, NetworkMessage, ServerBuilder};

use support::{TestSerialization, read_client_frame};

#[derive(Default)]
struct RecordingListener {
    disconnected: Mutex<Vec<ConnectionId>>,
    idle: Mutex<Vec<ConnectionId>>,
}

impl Listener<support::TestMsg> for RecordingListener {
    fn disconnected(&self, connection: &Connection<support::TestMsg>) {
        self.disconnected.lock().unwrap().push(connection.id());
    }

    fn idle(&self, connection: &Connection<support::TestMsg>) {
        self.idle.lock().unwrap().push(connection.id());
    }
}

#[test]
fn idle_connection_receives_unsolicited_keep_alives() {
    let server = ServerBuilder::new(TestSerialization)
        .tcp_bind_addr("127.0.0.1:0".parse().unwrap())
        .keep_alive_millis(50)
        .timeout_millis(10_000)
        .spawn()
        .expect("server should bind");

    let mut client = TcpStream::connect(server.tcp_local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut codec = TestSerialization;

    // Welcome frame first.
    let _welcome = read_client_frame(&mut client).unwrap();

    // The client never writes again; after keep_alive_millis of silence the
    // server should push an unsolicited KeepAlive on its own.
    let frame = read_client_frame(&mut client).unwrap();
    match support_decode(&mut codec, &frame) {
        NetworkMessage::Framework(FrameworkMessage::KeepAlive(_)) => {}
        other => panic!("expected KeepAlive, got {other:?}"),
    }
}

#[test]
fn silent_connection_is_closed_after_timeout() {
    let server = ServerBuilder::new(TestSerialization)
        .tcp_bind_addr("127.0.0.1:0".parse().unwrap())
        .keep_alive_millis(10_000)
        .timeout_millis(100)
        .spawn()
        .expect("server should bind");
    let listener = std::sync::Arc::new(RecordingListener::default());
    server.add_listener(listener.clone() as std::sync::Arc<dyn Listener<support::TestMsg>>);

    let mut client = TcpStream::connect(server.tcp_local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let _welcome = read_client_frame(&mut client).unwrap();

    // Silence past timeout_millis: the server closes the connection.
    use std::io::Read;
    let mut byte = [0u8; 1];
    let n = client.read(&mut byte).unwrap_or(0);
    assert_eq!(n, 0, "server should have closed the idle connection");

    assert!(support::wait_until(Duration::from_secs(1), || !listener.disconnected.lock().unwrap().is_empty()));
}

#[test]
fn quiet_connection_fires_idle_while_write_buffer_stays_below_threshold() {
    let server = ServerBuilder::new(TestSerialization)
        .tcp_bind_addr("127.0.0.1:0".parse().unwrap())
        .keep_alive_millis(10_000)
        .timeout_millis(10_000)
        .spawn()
        .expect("server should bind");
    let listener = std::sync::Arc::new(RecordingListener::default());
    server.add_listener(listener.clone() as std::sync::Arc<dyn Listener<support::TestMsg>>);

    let mut client = TcpStream::connect(server.tcp_local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let _welcome = read_client_frame(&mut client).unwrap();

    // Nothing is ever queued for write on this connection, so its write
    // buffer stays empty (well below idle_threshold) and the sweep should
    // keep firing idle() on it every cycle.
    assert!(support::wait_until(Duration::from_secs(2), || listener.idle.lock().unwrap().len() >= 2));
}

fn support_decode(codec: &mut TestSerialization, bytes: &[u8]) -> NetworkMessage<support::TestMsg> {
    use linkmesh_net::Serialization;
    codec.decode(bytes).unwrap()
}
