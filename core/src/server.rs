//! Subscriber transport.
//!
//! A TCP listener accepts long-lived subscriber connections. Each frame in
//! either direction is one JSON envelope per line. Per connection two threads
//! run: a writer draining the subscriber's bounded send queue (coalesced
//! bursts, overflow policy in [`crate::wire`]) and a reader dispatching
//! inbound commands to the engine. A dead subscriber is unregistered when its
//! reader exits; its writer follows once the queue disconnects.

use crate::runtime::Engine;
use crate::wire::{
    self, Command, Envelope, Subscriber, EVENT_FLOW_UPDATE, EVENT_INTERFACES, EVENT_STREAM,
};

use std::io::{BufRead, BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Binds the listener and serves subscribers until the process exits.
pub fn run(engine: Arc<Engine>, bind: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind)?;
    log::info!("subscriber listener on {}", bind);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let engine = engine.clone();
                std::thread::Builder::new()
                    .name("subscriber".into())
                    .spawn(move || handle_connection(engine, stream))?;
            }
            Err(e) => log::warn!("accept failed: {}", e),
        }
    }
    Ok(())
}

/// Runs the listener on its own thread.
pub fn spawn(engine: Arc<Engine>, bind: String) -> JoinHandle<std::io::Result<()>> {
    std::thread::Builder::new()
        .name("subscriber-accept".into())
        .spawn(move || run(engine, &bind))
        .expect("spawn subscriber listener")
}

fn handle_connection(engine: Arc<Engine>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let write_half = match stream.try_clone() {
        Ok(half) => half,
        Err(e) => {
            log::warn!("subscriber {}: clone failed: {}", peer, e);
            return;
        }
    };

    let id = engine.broadcaster().next_subscriber_id();
    let (subscriber, queue) =
        Subscriber::new(id, peer.clone(), engine.config().subscriber.send_queue);
    let subscriber = Arc::new(subscriber);
    engine.broadcaster().register(subscriber.clone());

    let writer_peer = peer.clone();
    let writer = std::thread::Builder::new()
        .name("subscriber-write".into())
        .spawn(move || {
            let mut writer = BufWriter::new(write_half);
            if let Err(e) = wire::write_loop(&queue, &mut writer) {
                log::debug!("subscriber {} writer closed: {}", writer_peer, e);
            }
        })
        .expect("spawn subscriber writer");

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                dispatch(&engine, &subscriber, trimmed);
            }
            Err(e) => {
                log::debug!("subscriber {} read failed: {}", peer, e);
                break;
            }
        }
    }

    engine.broadcaster().unregister(subscriber.id());
    drop(subscriber);
    let _ = writer.join();
    log::debug!("subscriber {} disconnected", peer);
}

/// Decodes one inbound frame and executes it. Command failures become
/// `error` events on this subscriber; the connection stays open.
fn dispatch(engine: &Arc<Engine>, subscriber: &Arc<Subscriber>, line: &str) {
    let command = match wire::parse_command(line) {
        Ok(command) => command,
        Err(e) => {
            subscriber.send_message(Envelope::error(e.to_string()));
            return;
        }
    };

    match command {
        Command::GetInterfaces => match engine.devices() {
            Ok(devices) => subscriber.send_message(Envelope::event(EVENT_INTERFACES, devices)),
            Err(e) => subscriber.send_message(Envelope::error(e.to_string())),
        },
        Command::StartCapture(request) => {
            if let Err(e) = engine.start_capture(&request) {
                subscriber.send_message(Envelope::error(e.to_string()));
            }
        }
        Command::StopCapture => engine.stop_capture(),
        Command::GetFlows => {
            subscriber.send_message(Envelope::event(EVENT_FLOW_UPDATE, engine.get_flows()));
        }
        Command::GetStreamData(request) => {
            let (client, server) = engine.get_stream_data(request.stream_id);
            let summary = engine.stream_summary(request.stream_id);
            let mut data = client;
            data.extend_from_slice(&server);
            let payload = serde_json::json!({
                "eventType": "stream_data",
                "streamId": request.stream_id,
                "srcAddr": summary.as_ref().map(|s| format!("{}:{}", s.src_addr, s.src_port)),
                "dstAddr": summary.as_ref().map(|s| format!("{}:{}", s.dst_addr, s.dst_port)),
                "data": base64::encode(&data),
            });
            subscriber.send_message(Envelope::event(EVENT_STREAM, payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use std::io::Write;

    fn connect(bind: &str) -> TcpStream {
        for _ in 0..50 {
            if let Ok(stream) = TcpStream::connect(bind) {
                return stream;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        panic!("server did not come up on {}", bind);
    }

    fn read_event(reader: &mut BufReader<TcpStream>) -> Envelope {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    #[test]
    fn malformed_commands_get_error_events() {
        let bind = "127.0.0.1:39771";
        let engine = Engine::new(default_config());
        spawn(engine, bind.to_string());

        let mut stream = connect(bind);
        let mut reader = BufReader::new(stream.try_clone().unwrap());

        stream.write_all(b"this is not json\n").unwrap();
        let envelope = read_event(&mut reader);
        assert_eq!(envelope.kind, "error");
        assert!(envelope.payload["message"].as_str().unwrap().contains("malformed"));

        // connection survives; a valid command still answers
        stream.write_all(b"{\"type\":\"get_flows\"}\n").unwrap();
        let envelope = read_event(&mut reader);
        assert_eq!(envelope.kind, EVENT_FLOW_UPDATE);
    }

    #[test]
    fn unknown_stream_data_is_empty() {
        let bind = "127.0.0.1:39772";
        let engine = Engine::new(default_config());
        spawn(engine, bind.to_string());

        let mut stream = connect(bind);
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        stream
            .write_all(b"{\"type\":\"get_stream_data\",\"payload\":{\"streamId\":999}}\n")
            .unwrap();
        let envelope = read_event(&mut reader);
        assert_eq!(envelope.kind, EVENT_STREAM);
        assert_eq!(envelope.payload["data"], "");
        assert_eq!(envelope.payload["streamId"], 999);
    }

    #[test]
    fn subscriber_unregisters_on_disconnect() {
        let bind = "127.0.0.1:39773";
        let engine = Engine::new(default_config());
        spawn(engine.clone(), bind.to_string());

        let stream = connect(bind);
        for _ in 0..50 {
            if engine.broadcaster().subscriber_count() == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(engine.broadcaster().subscriber_count(), 1);

        drop(stream);
        for _ in 0..50 {
            if engine.broadcaster().subscriber_count() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(engine.broadcaster().subscriber_count(), 0);
    }
}
