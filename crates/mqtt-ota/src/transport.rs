/// Publish/subscribe transport.
///
/// ```text
/// [control thread]                 [receive loop thread]
/// publish / subscribe --> Client   Connection::iter()
///                                    Publish --> InboundHandler::on_message
/// ```
///
/// QoS 0 throughout. Ordering is whatever the broker gives a single
/// publisher/subscriber pair; nothing is guaranteed across reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Default MQTT broker port.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Default bound on waiting for the broker's CONNACK.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Keep-alive interval sent in CONNECT.
pub const KEEP_ALIVE_SECS: u64 = 30;

/// Largest packet accepted or produced.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Fixed header of a PUBLISH: type byte plus up to four remaining-length bytes.
const PUBLISH_FIXED_HEADER: usize = 5;

/// Capacity of the client's outgoing request queue.
const REQUEST_CAPACITY: usize = 16;

/// Pause before polling again after a connection error once connected.
const RECONNECT_DELAY_MS: u64 = 1000;

/// Receives every inbound publish, on the receive loop's thread.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Publish/subscribe primitives used by the upload session.
pub trait Transport {
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Largest payload a single publish to `topic` can carry.
    fn max_payload(&self, _topic: &str) -> usize {
        usize::MAX
    }

    /// Stop the receive loop. Further calls are no-ops.
    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Largest QoS 0 payload that fits in a `MAX_PACKET_SIZE` packet on `topic`.
pub fn max_publish_payload(topic: &str) -> usize {
    // QoS 0 carries no packet id; the topic is length-prefixed.
    MAX_PACKET_SIZE.saturating_sub(PUBLISH_FIXED_HEADER + 2 + topic.len())
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub connect_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("mqtt-ota-{}", std::process::id()),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// MQTT transport backed by a `rumqttc` synchronous client.
pub struct MqttTransport {
    client: Option<Client>,
    closing: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl MqttTransport {
    /// Connect and start the receive loop. Blocks until CONNACK or `connect_timeout`.
    pub fn connect<H: InboundHandler>(
        config: &BrokerConfig,
        handler: H,
    ) -> Result<Self, TransportError> {
        let addr = config.addr();

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);

        let closing = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);

        let closing_loop = closing.clone();
        let receiver = thread::Builder::new()
            .name("mqtt-receive".into())
            .spawn(move || {
                let mut connected = false;
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            handler.on_message(&publish.topic, &publish.payload);
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            if !connected {
                                connected = true;
                                let _ = ready_tx.try_send(Ok(()));
                            } else {
                                info!("Reconnected to broker");
                            }
                        }
                        Ok(event) => {
                            debug!("mqtt event: {:?}", event);
                        }
                        Err(e) => {
                            if closing_loop.load(Ordering::Relaxed) {
                                break;
                            }
                            if !connected {
                                let _ = ready_tx.try_send(Err(e.to_string()));
                                break;
                            }
                            warn!("Broker connection error: {}", e);
                            thread::sleep(Duration::from_millis(RECONNECT_DELAY_MS));
                        }
                    }
                }
                debug!("Receive loop stopped");
            })
            .map_err(|e| TransportError::Connect {
                addr: addr.clone(),
                message: format!("cannot spawn receive loop: {}", e),
            })?;

        let mut transport = Self {
            client: Some(client),
            closing,
            receiver: Some(receiver),
        };

        match ready_rx.recv_timeout(config.connect_timeout) {
            Ok(Ok(())) => {
                info!("Connected to broker {}", addr);
                Ok(transport)
            }
            Ok(Err(message)) => {
                let _ = transport.close();
                Err(TransportError::Connect { addr, message })
            }
            Err(RecvTimeoutError::Timeout) => {
                transport.abandon();
                Err(TransportError::ConnectTimeout {
                    addr,
                    timeout: config.connect_timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = transport.close();
                Err(TransportError::Connect {
                    addr,
                    message: "receive loop exited before CONNACK".into(),
                })
            }
        }
    }

    /// Stop without waiting for the receive loop, which may still be blocked
    /// on a broker that never answers. It exits on its own once the
    /// connection attempt fails.
    fn abandon(&mut self) {
        self.closing.store(true, Ordering::Relaxed);
        if let Some(client) = self.client.take() {
            let _ = client.disconnect();
        }
        self.receiver.take();
    }

    fn client(&mut self) -> Result<&mut Client, TransportError> {
        self.client.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for MqttTransport {
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?.subscribe(topic, QoS::AtMostOnce)?;
        debug!("Subscribed to {}", topic);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())?;
        Ok(())
    }

    fn max_payload(&self, topic: &str) -> usize {
        max_publish_payload(topic)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::Relaxed);

        // Dropping the client ends the connection iterator once the disconnect is flushed.
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect() {
                debug!("Disconnect request failed: {}", e);
            }
        }

        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                warn!("Receive loop panicked");
            }
        }
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    struct Ignore;

    impl InboundHandler for Ignore {
        fn on_message(&self, _topic: &str, _payload: &[u8]) {}
    }

    fn local_config(port: u16, timeout_ms: u64) -> BrokerConfig {
        let mut config = BrokerConfig::new("127.0.0.1", port);
        config.connect_timeout = Duration::from_millis(timeout_ms);
        config
    }

    #[test]
    fn refused_connection_is_fatal() {
        let start = Instant::now();
        let err = MqttTransport::connect(&local_config(1, 3000), Ignore)
            .err()
            .expect("connect to a closed port must fail");

        assert!(
            matches!(err, TransportError::Connect { ref addr, .. } if addr == "127.0.0.1:1"),
            "unexpected error: {:?}",
            err
        );
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn silent_broker_times_out() {
        // Accepted by the kernel backlog but never answered with CONNACK.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let start = Instant::now();
        let err = MqttTransport::connect(&local_config(port, 200), Ignore)
            .err()
            .expect("connect without CONNACK must fail");

        match err {
            TransportError::ConnectTimeout { addr, timeout } => {
                assert_eq!(addr, format!("127.0.0.1:{}", port));
                assert_eq!(timeout, Duration::from_millis(200));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(2));
        drop(listener);
    }

    #[test]
    fn payload_limit_leaves_room_for_topic() {
        let topic = "cmnd/demo/fileupload201";
        let limit = max_publish_payload(topic);
        assert_eq!(limit, MAX_PACKET_SIZE - 7 - topic.len());
        assert!(limit < MAX_PACKET_SIZE);
    }
}
