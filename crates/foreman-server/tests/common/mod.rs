//! Common test infrastructure for broker integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use foreman_config::AppConfig;
use foreman_jobs::JobManager;
use foreman_protocol::{Frame, Packet, PacketBody, PacketCodec, Priority};
use foreman_server::AppBuilder;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A broker running on an ephemeral port.
pub struct TestBroker {
    pub addr: SocketAddr,
    pub manager: Arc<JobManager>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let mut config = AppConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        configure(&mut config);

        let shutdown = CancellationToken::new();
        let app = AppBuilder::new()
            .with_config(config)
            .with_shutdown(shutdown.clone())
            .build()
            .await
            .expect("Failed to build broker");
        let addr = app.server.local_addr().expect("No local address");
        let manager = app.manager.clone();
        let handle = tokio::spawn(async move {
            app.run().await.expect("Broker failed");
        });

        Self {
            addr,
            manager,
            shutdown,
            handle,
        }
    }

    pub async fn connect(&self) -> TestPeer {
        let stream = TcpStream::connect(self.addr)
            .await
            .expect("Failed to connect to broker");
        TestPeer {
            framed: Framed::new(stream, PacketCodec::default()),
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(RECV_TIMEOUT, self.handle)
            .await
            .expect("Broker did not stop")
            .expect("Broker task panicked");
    }
}

/// One client, worker or admin connection.
pub struct TestPeer {
    framed: Framed<TcpStream, PacketCodec>,
}

impl TestPeer {
    pub async fn send(&mut self, body: PacketBody) {
        self.framed
            .send(Packet::request(body))
            .await
            .expect("Failed to send packet");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed
            .send(Frame::Text(String::from_utf8_lossy(bytes).into_owned()))
            .await
            .expect("Failed to send raw bytes");
    }

    pub async fn recv_frame(&mut self) -> Frame {
        tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("Timed out waiting for the broker")
            .expect("Connection closed")
            .expect("Failed to decode frame")
    }

    pub async fn recv(&mut self) -> PacketBody {
        match self.recv_frame().await {
            Frame::Packet(packet) => packet.body,
            Frame::Text(text) => panic!("expected a packet, got text {:?}", text),
        }
    }

    /// Sends an admin command and collects the reply lines.
    pub async fn admin(&mut self, command: &str) -> Vec<String> {
        self.send_raw(format!("{}\n", command).as_bytes()).await;
        let mut lines = Vec::new();
        loop {
            let line = match self.recv_frame().await {
                Frame::Text(line) => line,
                Frame::Packet(packet) => panic!("expected text, got {:?}", packet),
            };
            let done = line == "." || !matches!(command.split_whitespace().next(), Some("status" | "priority-status" | "workers"));
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    /// Round-trips an echo so every earlier packet has been processed.
    pub async fn sync(&mut self) {
        self.send(PacketBody::EchoReq {
            data: Bytes::from_static(b"sync"),
        })
        .await;
        match self.recv().await {
            PacketBody::EchoRes { .. } => {}
            other => panic!("expected ECHO_RES, got {:?}", other),
        }
    }

    pub async fn can_do(&mut self, function: &str) {
        self.send(PacketBody::CanDo {
            function: function.to_string(),
        })
        .await;
        self.sync().await;
    }

    /// Submits a foreground NORMAL job and returns its handle.
    pub async fn submit(&mut self, function: &str, unique_id: &str, data: &'static [u8]) -> String {
        self.submit_with(Priority::Normal, false, function, unique_id, data)
            .await
    }

    pub async fn submit_with(
        &mut self,
        priority: Priority,
        background: bool,
        function: &str,
        unique_id: &str,
        data: &'static [u8],
    ) -> String {
        self.send(PacketBody::SubmitJob {
            priority,
            background,
            function: function.to_string(),
            unique_id: unique_id.to_string(),
            data: Bytes::from_static(data),
        })
        .await;
        match self.recv().await {
            PacketBody::JobCreated { handle } => handle,
            other => panic!("expected JOB_CREATED, got {:?}", other),
        }
    }

    pub async fn grab(&mut self) -> PacketBody {
        self.send(PacketBody::GrabJob).await;
        self.recv().await
    }

    pub async fn close(self) {
        drop(self.framed);
    }
}
