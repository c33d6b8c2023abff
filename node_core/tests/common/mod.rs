//! A minimal stand-in master server for integration tests. It speaks the same HTTP/XML-RPC
//! framing the node itself uses (`node_core::xmlrpc::{http, codec}`) on a background thread, so
//! these tests exercise the real wire format rather than mocking the node's internals.

use node_core::xmlrpc::{codec, http, Value};
use node_core::NodeConfig;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A loopback-only config pointed at `master`, with a fresh ephemeral port for every listener.
pub fn test_config(node_name: &str, master: &FakeMaster) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node_name = node_name.to_string();
    config.bind_host = "127.0.0.1".parse().unwrap();
    config.advertised_host = "127.0.0.1".to_string();
    config.master_uri = master.addr();
    config
}

pub struct FakeMaster {
    pub port: u16,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FakeMaster {
    /// Spawns a background thread that accepts one connection at a time and answers each
    /// decoded `(method_name, params)` call with whatever `handler` returns.
    pub fn start<F>(handler: F) -> FakeMaster
    where
        F: FnMut(&str, &[Value]) -> Vec<Value> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake master");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let port = listener.local_addr().unwrap().port();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let handler = Mutex::new(handler);

        let handle = thread::spawn(move || {
            while !stop_thread.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((stream, _)) => serve_one(stream, &handler),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        FakeMaster { port, stop, handle: Some(handle) }
    }

    pub fn addr(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for FakeMaster {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_one<F>(mut stream: TcpStream, handler: &Mutex<F>)
where
    F: FnMut(&str, &[Value]) -> Vec<Value> + Send,
{
    stream.set_read_timeout(Some(Duration::from_secs(2))).ok();

    let (method, params) = match read_request(&mut stream) {
        Some(parsed) => parsed,
        None => return,
    };

    let result = (handler.lock().unwrap())(&method, &params);
    let body = codec::encode_method_response(&result);
    let response = http::build_ok_response(&body);
    let _ = stream.write_all(&response);
}

fn read_request(stream: &mut TcpStream) -> Option<(String, Vec<Value>)> {
    let mut parser = http::HttpMessageParser::new();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        if let Ok(Some((_, body))) = parser.try_parse(&buf) {
            return codec::decode_method_call(&body).ok();
        }
        match stream.read(&mut chunk) {
            Ok(0) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return None,
        }
    }
}

/// A master double that tracks registered publisher URIs per topic, so a subsequent
/// `registerSubscriber` can answer with the list a real master would return.
pub fn pubsub_master() -> FakeMaster {
    let published: Arc<Mutex<std::collections::HashMap<String, Vec<String>>>> = Arc::new(Mutex::new(std::collections::HashMap::new()));

    FakeMaster::start(move |method, params| match method {
        "registerPublisher" => {
            let topic = params.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
            let uri = params.get(3).and_then(Value::as_str).unwrap_or_default().to_string();
            published.lock().unwrap().entry(topic).or_insert_with(Vec::new).push(uri);
            vec![Value::Int(1), Value::Str("ok".into()), Value::Int(0)]
        }
        "unregisterPublisher" => vec![Value::Int(1), Value::Str("ok".into()), Value::Int(1)],
        "registerSubscriber" => {
            let topic = params.get(1).and_then(Value::as_str).unwrap_or_default();
            let uris = published.lock().unwrap().get(topic).cloned().unwrap_or_default();
            let uri_values = uris.into_iter().map(Value::Str).collect();
            vec![Value::Int(1), Value::Str("ok".into()), Value::Array(uri_values)]
        }
        "unregisterSubscriber" => vec![Value::Int(1), Value::Str("ok".into()), Value::Int(1)],
        "registerService" => vec![Value::Int(1), Value::Str("ok".into()), Value::Int(0)],
        "unregisterService" => vec![Value::Int(1), Value::Str("ok".into()), Value::Int(1)],
        other => vec![Value::Int(0), Value::Str(format!("unhandled method {}", other)), Value::Int(0)],
    })
}
