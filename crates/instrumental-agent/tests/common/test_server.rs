// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process line-protocol collector for testing the agent

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::task::AbortHandle;

#[derive(Default)]
struct Received {
    lines: Vec<String>,
    connections: usize,
    open: Vec<AbortHandle>,
}

/// Answers `hello` and `authenticate` with a fixed reply and records every line.
///
/// Runs on its own runtime so tests can drive the blocking agent API from the
/// test thread.
pub struct TestServer {
    pub addr: SocketAddr,
    received: Arc<Mutex<Received>>,
    runtime: Option<Runtime>,
}

impl TestServer {
    /// Start a collector that acknowledges the handshake
    pub fn start() -> Self {
        Self::start_with_reply("ok")
    }

    pub fn start_with_reply(reply: &'static str) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("Failed to build test server runtime");
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .expect("Failed to bind test server");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let received = Arc::new(Mutex::new(Received::default()));
        let accepted = Arc::clone(&received);
        runtime.spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let lines = Arc::clone(&accepted);
                let task = tokio::spawn(async move {
                    let mut socket = BufReader::new(socket);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match socket.read_line(&mut line).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                        let line = line.trim_end().to_string();
                        let needs_reply =
                            line.starts_with("hello ") || line.starts_with("authenticate ");
                        lines.lock().unwrap().lines.push(line);
                        if needs_reply {
                            let reply = format!("{reply}\n");
                            if socket.get_mut().write_all(reply.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    }
                });
                let mut received = accepted.lock().unwrap();
                received.connections += 1;
                received.open.push(task.abort_handle());
            }
        });

        TestServer {
            addr,
            received,
            runtime: Some(runtime),
        }
    }

    /// Collector setting pointing at this server
    pub fn collector(&self) -> String {
        self.addr.to_string()
    }

    /// Every line received, handshakes included
    pub fn lines(&self) -> Vec<String> {
        self.received.lock().unwrap().lines.clone()
    }

    /// Lines other than `hello` and `authenticate`
    pub fn metric_lines(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| !line.starts_with("hello ") && !line.starts_with("authenticate "))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.received.lock().unwrap().connections
    }

    /// Hang up on every connected client
    pub fn disconnect_all(&self) {
        for handle in self.received.lock().unwrap().open.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
