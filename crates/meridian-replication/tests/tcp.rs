//! A real client over loopback TCP: login, forced player creation, and a
//! clean stop.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::time::{Duration, Instant};

use meridian_config::Config;
use meridian_net::codec;
use meridian_net::{ClientMessage, FrameConfig, FrameDecoder, ServerMessage};
use meridian_replication::{PrefabRegistry, Server};

struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl Client {
    fn connect(server: &Server) -> Self {
        let addr = server.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        Self {
            stream,
            decoder: FrameDecoder::new(FrameConfig::server_stream()),
        }
    }

    fn send(&mut self, message: &ClientMessage) {
        self.stream.set_nonblocking(false).unwrap();
        self.stream.write_all(&message.encode()).unwrap();
        self.stream.set_nonblocking(true).unwrap();
    }

    /// Tick the server until a received message matches, collecting
    /// everything seen on the way.
    fn pump_until(
        &mut self,
        server: &mut Server,
        done: impl Fn(&ServerMessage) -> bool,
    ) -> Vec<ServerMessage> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            server.update().unwrap();
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.decoder.feed(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                Err(e) => panic!("read failed: {e}"),
            }
            while let Some(frame) = self.decoder.next_frame().unwrap() {
                let message = ServerMessage::decode(&frame).unwrap();
                let finished = done(&message);
                seen.push(message);
                if finished {
                    return seen;
                }
            }
        }
        panic!("no matching message within the deadline; saw {seen:?}");
    }
}

#[test]
fn test_login_and_stop_over_loopback() {
    let saves = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.network.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.network.port = 0;
    config.world.saves_dir = saves.path().to_path_buf();

    let mut registry = PrefabRegistry::new();
    registry.register("player", 10.0, true);
    let mut server = Server::start(&config, registry).unwrap();
    assert!(server.info().starts_with("Server listening on 127.0.0.1:"));

    let mut client = Client::connect(&server);
    client.send(&ClientMessage::Login {
        username: "ana".to_string(),
        credentials: Vec::new(),
    });
    let seen = client.pump_until(&mut server, |m| matches!(m, ServerMessage::ForceCreate { .. }));
    let Some(ServerMessage::ForceCreate {
        network_id, prefab, ..
    }) = seen.last()
    else {
        unreachable!()
    };
    assert_eq!(prefab, "player");
    let network_id = *network_id;

    let mut serialization = codec::concat([
        &codec::encode_int(network_id)[..],
        &codec::encode_int(0)[..],
        &codec::encode_string("player")[..],
    ]);
    for axis in [1.0f32, 2.0, 3.0] {
        serialization.extend_from_slice(&codec::encode_int(4));
        serialization.extend_from_slice(&codec::encode_float(axis));
    }
    client.send(&ClientMessage::Create { serialization });
    client.pump_until(&mut server, |m| {
        *m == ServerMessage::CreationSuccess {
            local_id: network_id,
            network_id,
        }
    });
    assert_eq!(server.client_count(), 1);
    assert_eq!(server.world().player("ana").unwrap().position().z, 3.0);

    client.send(&ClientMessage::Heartbeat { active: true, key: 7 });
    client.pump_until(&mut server, |m| matches!(m, ServerMessage::Heartbeat { key: 7, .. }));

    assert_eq!(server.stop().unwrap(), 1);
    client.pump_until(&mut server, |m| {
        *m == ServerMessage::Disconnect {
            reason: "Server stopped.".to_string(),
        }
    });
    assert!(server.save_exists("world"));
}
