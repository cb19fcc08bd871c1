use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::Value;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};
use tempfile::TempDir;
use tokio::process::{Child, Command};

use super::LogLines;

pub const QUEUE: &str = "report_queue";

/// A free loopback port. The temporary listener is dropped before returning.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// The compiled `report-relay` binary with a clean environment, running in
/// its own empty working directory.
pub struct RelayProcess {
    child: Child,
    pub logs: LogLines,
    pub port: u16,
    _workdir: TempDir,
}

impl RelayProcess {
    pub fn spawn(env: &[(&str, &str)]) -> Self {
        Self::spawn_in(tempfile::tempdir().expect("failed to create workdir"), env)
    }

    /// Like `spawn`, with a `.env` file holding `contents` in the working directory.
    pub fn spawn_with_dotenv(contents: &str, env: &[(&str, &str)]) -> Self {
        let workdir = tempfile::tempdir().expect("failed to create workdir");
        std::fs::write(workdir.path().join(".env"), contents).expect("failed to write .env");
        Self::spawn_in(workdir, env)
    }

    fn spawn_in(workdir: TempDir, env: &[(&str, &str)]) -> Self {
        let port = free_port();
        let mut child = Command::new(env!("CARGO_BIN_EXE_report-relay"))
            .current_dir(workdir.path())
            .env_clear()
            .env("REPORT_RELAY_LOG_LEVEL", "debug")
            .env("REPORT_RELAY_BIND_ADDRESS", "127.0.0.1")
            .env("REPORT_RELAY_LISTENER_PORT", port.to_string())
            .envs(env.iter().copied())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn report-relay binary");

        let stderr = child.stderr.take().expect("stderr is piped");
        Self {
            child,
            logs: LogLines::spawn(stderr),
            port,
            _workdir: workdir,
        }
    }

    /// Wait for the process to exit on its own, returning its status and
    /// everything it logged.
    pub async fn wait_for_exit(mut self, timeout: Duration) -> (ExitStatus, String) {
        let status = tokio::time::timeout(timeout, self.child.wait())
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "report-relay did not exit within {timeout:?}.\nLogs:\n{}",
                    self.logs.seen()
                )
            })
            .expect("failed to wait for report-relay");
        let logs = self.logs.collect_rest().await.to_owned();
        (status, logs)
    }

    #[cfg(unix)]
    pub fn terminate(&self) {
        let pid = self.child.id().expect("process still running");
        let status = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .expect("failed to run kill");
        assert!(status.success(), "kill -TERM {pid} failed");
    }

    pub fn drain_url(&self) -> String {
        format!("http://127.0.0.1:{}/reports", self.port)
    }
}

/// A throwaway RabbitMQ broker, a publisher connection to it, and a relay
/// consuming from it.
pub struct Harness {
    pub relay: RelayProcess,
    publisher: Channel,
    _connection: Connection,
    _broker: ContainerAsync<GenericImage>,
    http: reqwest::Client,
}

impl Harness {
    pub async fn start() -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let broker = GenericImage::new("rabbitmq", "3.13-alpine")
            .with_exposed_port(5672.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Server startup complete"))
            .start()
            .await
            .expect("failed to start RabbitMQ container");
        let host = broker.get_host().await.expect("broker host");
        let port = broker
            .get_host_port_ipv4(5672.tcp())
            .await
            .expect("broker port");
        let amqp_url = format!("amqp://guest:guest@{host}:{port}/%2f");

        let connection = Connection::connect(&amqp_url, ConnectionProperties::default())
            .await
            .expect("publisher failed to connect");
        let publisher = connection
            .create_channel()
            .await
            .expect("publisher failed to open channel");
        publisher
            .queue_declare(
                QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .expect("publisher failed to declare queue");

        let mut relay = RelayProcess::spawn(&[("REPORT_RELAY_AMQP_URL", &amqp_url)]);
        relay.logs.wait_for("consuming from queue").await;
        relay.logs.wait_for("drain listener ready").await;

        Self {
            relay,
            publisher,
            _connection: connection,
            _broker: broker,
            http: reqwest::Client::new(),
        }
    }

    pub async fn publish(&self, payload: &[u8]) {
        self.publisher
            .basic_publish(
                "",
                QUEUE,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .expect("publish failed")
            .await
            .expect("publish not confirmed");
    }

    /// One drain request. Asserts the response shape and returns the reports.
    pub async fn drain(&self) -> Vec<Value> {
        let resp = self
            .http
            .get(self.relay.drain_url())
            .send()
            .await
            .expect("drain request failed");
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["content-type"], "application/json");
        let body = resp.bytes().await.expect("failed to read drain body");
        serde_json::from_slice(&body).expect("drain body is not JSON")
    }

    /// Drain repeatedly until `count` reports have come back, then return
    /// them in the order they were received.
    pub async fn drain_until(&self, count: usize) -> Vec<Value> {
        let mut collected = Vec::new();
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            while collected.len() < count {
                collected.extend(self.drain().await);
                if collected.len() < count {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "expected {count} reports, got {}: {collected:?}",
            collected.len()
        );
        collected
    }
}
