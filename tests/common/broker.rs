//! Minimal in-process MQTT 3.1.1 broker for session tests.
//!
//! Serves one client connection at a time, acknowledges CONNECT, SUBSCRIBE, QoS 1 PUBLISH and
//! PINGREQ, and records what it receives. Tests can push QoS 0 messages to the current client
//! or drop its socket to simulate a network failure.

use std::{
    io,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
    sync::Mutex,
    task::JoinHandle,
};

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

/// What the broker saw, tagged with the 1-based index of the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connect {
        conn: usize,
        client_id: String,
    },
    Subscribe {
        conn: usize,
        topic: String,
    },
    Publish {
        conn: usize,
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    },
    Disconnect {
        conn: usize,
    },
}

struct Client {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
}

pub struct FakeBroker {
    port: u16,
    events: Arc<StdMutex<Vec<BrokerEvent>>>,
    current: Arc<Mutex<Option<Client>>>,
    acceptor: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let current = Arc::new(Mutex::new(None::<Client>));

        let acceptor = tokio::spawn({
            let events = Arc::clone(&events);
            let current = Arc::clone(&current);
            async move {
                let mut conn = 0;
                while let Ok((stream, _)) = listener.accept().await {
                    conn += 1;
                    let (reader, writer) = stream.into_split();
                    let writer = Arc::new(Mutex::new(writer));
                    let reader = tokio::spawn(serve(
                        conn,
                        reader,
                        Arc::clone(&writer),
                        Arc::clone(&events),
                    ));
                    if let Some(old) = current.lock().await.replace(Client { writer, reader }) {
                        old.reader.abort();
                    }
                }
            }
        });

        Self {
            port,
            events,
            current,
            acceptor,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until the recorded events satisfy `condition`, panicking after five seconds.
    pub async fn wait_for(&self, condition: impl Fn(&[BrokerEvent]) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition(&self.events()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if waited.is_err() {
            panic!("broker never saw the expected events: {:#?}", self.events());
        }
    }

    /// Send a QoS 0 PUBLISH to the connected client.
    pub async fn send(&self, topic: &str, payload: &[u8]) {
        let current = self.current.lock().await;
        let client = current.as_ref().expect("a client is connected");

        let mut body = encode_str(topic);
        body.extend_from_slice(payload);
        client
            .writer
            .lock()
            .await
            .write_all(&encode(PUBLISH << 4, &body))
            .await
            .unwrap();
    }

    /// Close the client's socket without a DISCONNECT, as a network failure would.
    pub async fn drop_connection(&self) {
        let Some(client) = self.current.lock().await.take() else {
            return;
        };
        client.reader.abort();
        let _ = client.reader.await;
        let _ = client.writer.lock().await.shutdown().await;
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn serve(
    conn: usize,
    mut reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    events: Arc<StdMutex<Vec<BrokerEvent>>>,
) {
    let record = |event: BrokerEvent| events.lock().unwrap().push(event);

    while let Ok((header, body)) = read_packet(&mut reader).await {
        let flags = header & 0x0f;
        match header >> 4 {
            CONNECT => {
                // Protocol name, level, flags and keep alive precede the client id.
                let (client_id, _) = decode_str(&body, 10);
                reply(&writer, &[0x20, 0x02, 0x00, 0x00]).await;
                record(BrokerEvent::Connect { conn, client_id });
            }
            PUBLISH => {
                let qos = (flags >> 1) & 0x03;
                let (topic, mut at) = decode_str(&body, 0);
                if qos > 0 {
                    reply(&writer, &[0x40, 0x02, body[at], body[at + 1]]).await;
                    at += 2;
                }
                record(BrokerEvent::Publish {
                    conn,
                    topic,
                    payload: body[at..].to_vec(),
                    qos,
                    retain: flags & 0x01 == 1,
                });
            }
            SUBSCRIBE => {
                let mut ack = vec![body[0], body[1]];
                let mut topics = Vec::new();
                let mut at = 2;
                while at < body.len() {
                    let (topic, next) = decode_str(&body, at);
                    topics.push(topic);
                    ack.push(0x01);
                    // Skip the requested QoS byte.
                    at = next + 1;
                }
                reply(&writer, &encode(0x90, &ack)).await;
                for topic in topics {
                    record(BrokerEvent::Subscribe { conn, topic });
                }
            }
            PINGREQ => reply(&writer, &[0xd0, 0x00]).await,
            DISCONNECT => {
                record(BrokerEvent::Disconnect { conn });
                break;
            }
            _ => {}
        }
    }
}

async fn reply(writer: &Mutex<OwnedWriteHalf>, bytes: &[u8]) {
    let _ = writer.lock().await.write_all(bytes).await;
}

async fn read_packet(reader: &mut OwnedReadHalf) -> io::Result<(u8, Vec<u8>)> {
    let header = reader.read_u8().await?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "remaining length too long",
            ));
        }
    }
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

fn encode(header: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![header];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if len == 0 {
            break;
        }
    }
    packet.extend_from_slice(body);
    packet
}

fn encode_str(value: &str) -> Vec<u8> {
    let mut bytes = (value.len() as u16).to_be_bytes().to_vec();
    bytes.extend_from_slice(value.as_bytes());
    bytes
}

/// Length-prefixed UTF-8 string at `at`; returns it with the offset just past it.
fn decode_str(body: &[u8], at: usize) -> (String, usize) {
    let len = usize::from(u16::from_be_bytes([body[at], body[at + 1]]));
    let start = at + 2;
    let value = String::from_utf8_lossy(&body[start..start + len]).into_owned();
    (value, start + len)
}
