//! In-process mock node speaking the HiveKV wire protocol over real TCP.
//!
//! Supports single-record reads and writes, batch digest-array reads, scans
//! and integer range queries against an in-memory store, plus fault knobs
//! (response delay, connection drops, keep-alive frames) used by the engine
//! tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use hivekv_common::error::Result;
use hivekv_common::protocol::{
    field_type, op_type, parse_proto_header, proto_header, MessageHeader, MessageReader,
    MessageWriter, ResultCode, DIGEST_SIZE, INFO1_NOBINDATA, INFO2_DELETE, INFO2_GENERATION,
    INFO2_GENERATION_GT, INFO2_WRITE, INFO2_WRITE_UNIQUE, INFO3_LAST, MSG_TYPE_MESSAGE,
    PROTO_HEADER_SIZE,
};
use hivekv_common::value::Value;

const STREAM_CHUNK: usize = 100;

#[derive(Clone)]
struct StoredRecord {
    set_name: String,
    bins: HashMap<String, Value>,
    generation: u32,
    expiration: u32,
}

type Store = Arc<Mutex<HashMap<(String, [u8; DIGEST_SIZE]), StoredRecord>>>;

/// Fault-injection knobs, all zero/off by default.
#[derive(Clone, Default)]
pub struct MockConfig {
    /// Sleep this long after reading each request before answering.
    pub response_delay: Option<Duration>,
    /// Drop the connection instead of answering the first n requests.
    pub fail_first_requests: usize,
    /// Precede every response with a zero-length keep-alive frame.
    pub send_keepalive: bool,
}

pub struct MockNode {
    pub addr: String,
    store: Store,
    requests: Arc<AtomicUsize>,
}

impl MockNode {
    pub async fn start() -> MockNode {
        MockNode::start_with(MockConfig::default()).await
    }

    pub async fn start_with(config: MockConfig) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        let requests = Arc::new(AtomicUsize::new(0));

        let accept_store = Arc::clone(&store);
        let accept_requests = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    break;
                };
                let store = Arc::clone(&accept_store);
                let requests = Arc::clone(&accept_requests);
                let config = config.clone();
                tokio::spawn(async move {
                    let _ = serve(sock, store, requests, config).await;
                });
            }
        });

        MockNode {
            addr,
            store,
            requests,
        }
    }

    /// Total requests read, including dropped ones.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Number of records currently stored.
    pub fn record_count(&self) -> usize {
        self.store.lock().len()
    }
}

async fn serve(
    mut sock: TcpStream,
    store: Store,
    requests: Arc<AtomicUsize>,
    config: MockConfig,
) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; PROTO_HEADER_SIZE];
        if sock.read_exact(&mut header).await.is_err() {
            return Ok(()); // client went away
        }
        let (_, msg_type, body_len) = match parse_proto_header(&header) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(()),
        };
        assert_eq!(msg_type, MSG_TYPE_MESSAGE, "mock only speaks message frames");
        let mut body = vec![0u8; body_len as usize];
        sock.read_exact(&mut body).await?;

        let seen = requests.fetch_add(1, Ordering::SeqCst);
        if seen < config.fail_first_requests {
            return Ok(()); // connection drop; the client should retry
        }
        if let Some(delay) = config.response_delay {
            tokio::time::sleep(delay).await;
        }

        let request = match Request::parse(&body) {
            Ok(request) => request,
            Err(_) => {
                sock.write_all(&single_response(ResultCode::ParameterError, 0, 0, &[]))
                    .await?;
                continue;
            }
        };

        if config.send_keepalive {
            sock.write_all(&proto_header(MSG_TYPE_MESSAGE, 0)).await?;
        }

        let response = dispatch(&store, request);
        sock.write_all(&response).await?;
    }
}

struct Request {
    header: MessageHeader,
    namespace: String,
    set_name: String,
    digest: Option<[u8; DIGEST_SIZE]>,
    digest_array: Vec<[u8; DIGEST_SIZE]>,
    scan: bool,
    range: Option<(String, i64, i64)>,
    ops: Vec<(u8, String, Value)>,
}

impl Request {
    fn parse(body: &[u8]) -> Result<Request> {
        let mut reader = MessageReader::new(body);
        let header = MessageHeader::parse(&mut reader)?;

        let mut request = Request {
            header,
            namespace: String::new(),
            set_name: String::new(),
            digest: None,
            digest_array: Vec::new(),
            scan: false,
            range: None,
            ops: Vec::new(),
        };

        for _ in 0..header.field_count {
            let len = reader.read_u32()? as usize;
            let ftype = reader.read_u8()?;
            let payload = reader.read_bytes(len - 1)?;
            match ftype {
                field_type::NAMESPACE => {
                    request.namespace = String::from_utf8(payload.to_vec()).unwrap()
                }
                field_type::TABLE => {
                    request.set_name = String::from_utf8(payload.to_vec()).unwrap()
                }
                field_type::DIGEST_RIPE => {
                    request.digest = Some(payload.try_into().unwrap());
                }
                field_type::DIGEST_RIPE_ARRAY => {
                    for chunk in payload.chunks_exact(DIGEST_SIZE) {
                        request.digest_array.push(chunk.try_into().unwrap());
                    }
                }
                field_type::SCAN_OPTIONS => request.scan = true,
                field_type::INDEX_RANGE => {
                    let name_len = payload[0] as usize;
                    let name =
                        String::from_utf8(payload[1..1 + name_len].to_vec()).unwrap();
                    let mut at = 1 + name_len + 1; // skip particle type
                    let begin_len =
                        u32::from_be_bytes(payload[at..at + 4].try_into().unwrap()) as usize;
                    at += 4;
                    let begin =
                        i64::from_be_bytes(payload[at..at + begin_len].try_into().unwrap());
                    at += begin_len;
                    let end_len =
                        u32::from_be_bytes(payload[at..at + 4].try_into().unwrap()) as usize;
                    at += 4;
                    let end = i64::from_be_bytes(payload[at..at + end_len].try_into().unwrap());
                    request.range = Some((name, begin, end));
                }
                _ => {}
            }
        }

        for _ in 0..header.op_count {
            let op_size = reader.read_u32()? as usize;
            let otype = reader.read_u8()?;
            let particle = reader.read_u8()?;
            let _version = reader.read_u8()?;
            let name_len = reader.read_u8()? as usize;
            let name = reader.read_str(name_len)?.to_string();
            let value_len = op_size - 4 - name_len;
            let value = Value::read_from(particle, reader.read_bytes(value_len)?)?;
            request.ops.push((otype, name, value));
        }

        Ok(request)
    }
}

fn dispatch(store: &Store, request: Request) -> Vec<u8> {
    if !request.digest_array.is_empty() {
        return handle_batch(store, request);
    }
    // Scans and queries address a whole (namespace, set), not a digest.
    if request.scan || request.range.is_some() || request.digest.is_none() {
        return handle_stream(store, request);
    }
    if request.header.info2 & INFO2_DELETE != 0 {
        return handle_delete(store, request);
    }
    if request.header.info2 & INFO2_WRITE != 0 {
        return handle_write(store, request);
    }
    handle_read(store, request)
}

fn handle_write(store: &Store, request: Request) -> Vec<u8> {
    let digest = request.digest.expect("write without digest");
    let mut store = store.lock();
    let slot = store.entry((request.namespace.clone(), digest));

    use std::collections::hash_map::Entry;
    let existing_generation = match &slot {
        Entry::Occupied(entry) => Some(entry.get().generation),
        Entry::Vacant(_) => None,
    };

    // Generation gates.
    let info2 = request.header.info2;
    if info2 & INFO2_WRITE_UNIQUE != 0 && existing_generation.is_some() {
        return single_response(ResultCode::KeyExists, 0, 0, &[]);
    }
    if info2 & INFO2_GENERATION != 0 {
        if existing_generation != Some(request.header.generation) {
            return single_response(ResultCode::GenerationError, 0, 0, &[]);
        }
    }
    if info2 & INFO2_GENERATION_GT != 0 {
        if let Some(generation) = existing_generation {
            if request.header.generation <= generation {
                return single_response(ResultCode::GenerationError, 0, 0, &[]);
            }
        }
    }

    let record = match slot {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(StoredRecord {
            set_name: request.set_name.clone(),
            bins: HashMap::new(),
            generation: 0,
            expiration: 0,
        }),
    };

    let mut read_backs = Vec::new();
    for (otype, name, value) in request.ops {
        match otype {
            op_type::READ => read_backs.push(name),
            op_type::WRITE => {
                record.bins.insert(name, value);
            }
            op_type::APPEND | op_type::PREPEND => {
                let fresh = match value {
                    Value::Str(s) => s,
                    other => panic!("mock append supports strings, got {}", other),
                };
                let current = match record.bins.remove(&name) {
                    Some(Value::Str(s)) => s,
                    _ => String::new(),
                };
                let merged = if otype == op_type::APPEND {
                    current + &fresh
                } else {
                    fresh + &current
                };
                record.bins.insert(name, Value::Str(merged));
            }
            op_type::ADD => {
                let delta = match value {
                    Value::Int(v) => v,
                    other => panic!("mock add supports integers, got {}", other),
                };
                let current = match record.bins.get(&name) {
                    Some(Value::Int(v)) => *v,
                    _ => 0,
                };
                record.bins.insert(name, Value::Int(current + delta));
            }
            op_type::TOUCH => {}
            other => panic!("unsupported write op {}", other),
        }
    }
    record.generation += 1;
    record.expiration = request.header.expiration;

    let bins: Vec<(String, Value)> = read_backs
        .into_iter()
        .filter_map(|name| record.bins.get(&name).map(|v| (name.clone(), v.clone())))
        .collect();
    single_response(ResultCode::Ok, record.generation, record.expiration, &bins)
}

fn handle_delete(store: &Store, request: Request) -> Vec<u8> {
    let digest = request.digest.expect("delete without digest");
    let removed = store.lock().remove(&(request.namespace, digest));
    match removed {
        Some(_) => single_response(ResultCode::Ok, 0, 0, &[]),
        None => single_response(ResultCode::KeyNotFound, 0, 0, &[]),
    }
}

fn handle_read(store: &Store, request: Request) -> Vec<u8> {
    let digest = request.digest.expect("read without digest");
    let store = store.lock();
    let Some(record) = store.get(&(request.namespace.clone(), digest)) else {
        return single_response(ResultCode::KeyNotFound, 0, 0, &[]);
    };

    if request.header.info1 & INFO1_NOBINDATA != 0 {
        return single_response(ResultCode::Ok, record.generation, record.expiration, &[]);
    }

    let bins: Vec<(String, Value)> = if request.ops.is_empty() {
        record
            .bins
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        request
            .ops
            .iter()
            .filter_map(|(_, name, _)| {
                record.bins.get(name).map(|v| (name.clone(), v.clone()))
            })
            .collect()
    };
    single_response(ResultCode::Ok, record.generation, record.expiration, &bins)
}

fn handle_batch(store: &Store, request: Request) -> Vec<u8> {
    let store = store.lock();
    let mut bodies = Vec::new();
    for digest in &request.digest_array {
        match store.get(&(request.namespace.clone(), *digest)) {
            Some(record) => {
                let bins: Vec<(String, Value)> =
                    if request.header.info1 & INFO1_NOBINDATA != 0 {
                        Vec::new()
                    } else {
                        record
                            .bins
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect()
                    };
                bodies.push(record_body(
                    ResultCode::Ok,
                    &request.namespace,
                    &record.set_name,
                    *digest,
                    record.generation,
                    &bins,
                ));
            }
            None => bodies.push(record_body(
                ResultCode::KeyNotFound,
                &request.namespace,
                &request.set_name,
                *digest,
                0,
                &[],
            )),
        }
    }
    stream_frames(bodies)
}

fn handle_stream(store: &Store, request: Request) -> Vec<u8> {
    let store = store.lock();
    let mut bodies = Vec::new();
    for ((namespace, digest), record) in store.iter() {
        if *namespace != request.namespace || record.set_name != request.set_name {
            continue;
        }
        if let Some((bin, begin, end)) = &request.range {
            match record.bins.get(bin) {
                Some(Value::Int(v)) if *begin <= *v && *v <= *end => {}
                _ => continue,
            }
        }
        let bins: Vec<(String, Value)> = if request.header.info1 & INFO1_NOBINDATA != 0 {
            Vec::new()
        } else {
            record
                .bins
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        bodies.push(record_body(
            ResultCode::Ok,
            namespace,
            &record.set_name,
            *digest,
            record.generation,
            &bins,
        ));
    }
    stream_frames(bodies)
}

/// One 22-byte-headed record body (no proto header).
fn record_body(
    code: ResultCode,
    namespace: &str,
    set_name: &str,
    digest: [u8; DIGEST_SIZE],
    generation: u32,
    bins: &[(String, Value)],
) -> Vec<u8> {
    let mut buf = vec![0u8; 4096 + bins.iter().map(|(n, v)| n.len() + v.encoded_size() + 16).sum::<usize>()];
    let mut w = MessageWriter::new(&mut buf);
    w.begin_message().unwrap();
    w.write_field_str(field_type::NAMESPACE, namespace).unwrap();
    w.write_field_str(field_type::TABLE, set_name).unwrap();
    w.write_field_bytes(field_type::DIGEST_RIPE, &digest).unwrap();
    for (name, value) in bins {
        w.write_op(op_type::READ, name, value).unwrap();
    }
    w.message_header(0, 0, 0, generation, 0, 3, bins.len() as u16);
    let total = w.finish(MSG_TYPE_MESSAGE);
    buf[PROTO_HEADER_SIZE + 5] = code.as_u8();
    buf[PROTO_HEADER_SIZE..total].to_vec()
}

fn last_body() -> Vec<u8> {
    let mut buf = vec![0u8; 64];
    let mut w = MessageWriter::new(&mut buf);
    w.begin_message().unwrap();
    w.message_header(0, 0, INFO3_LAST, 0, 0, 0, 0);
    let total = w.finish(MSG_TYPE_MESSAGE);
    buf[PROTO_HEADER_SIZE..total].to_vec()
}

/// Packs record bodies into proto frames of at most [`STREAM_CHUNK`] records,
/// closing the stream with the final-message marker.
fn stream_frames(bodies: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in bodies.chunks(STREAM_CHUNK.max(1)) {
        let len: usize = chunk.iter().map(Vec::len).sum();
        out.extend_from_slice(&proto_header(MSG_TYPE_MESSAGE, len as u64));
        for body in chunk {
            out.extend_from_slice(body);
        }
    }
    let last = last_body();
    out.extend_from_slice(&proto_header(MSG_TYPE_MESSAGE, last.len() as u64));
    out.extend_from_slice(&last);
    out
}

/// A complete single-record response frame.
fn single_response(
    code: ResultCode,
    generation: u32,
    expiration: u32,
    bins: &[(String, Value)],
) -> Vec<u8> {
    let mut buf =
        vec![0u8; 1024 + bins.iter().map(|(n, v)| n.len() + v.encoded_size() + 16).sum::<usize>()];
    let mut w = MessageWriter::new(&mut buf);
    w.begin_message().unwrap();
    for (name, value) in bins {
        w.write_op(op_type::READ, name, value).unwrap();
    }
    w.message_header(0, 0, 0, generation, expiration, 0, bins.len() as u16);
    let total = w.finish(MSG_TYPE_MESSAGE);
    buf[PROTO_HEADER_SIZE + 5] = code.as_u8();
    buf[..total].to_vec()
}
