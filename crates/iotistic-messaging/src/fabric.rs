//! Process-singleton pub/sub client.
//!
//! One transport connection per process, shared by every publisher and
//! subscriber. A single dispatcher task owns the event loop: it flips the
//! connection flag, re-subscribes registered patterns after a reconnect,
//! drains the offline queue, and fans incoming publishes out to every
//! handler whose pattern matches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::FabricError;
use crate::topic::topic_matches;

static FABRIC: OnceLock<Arc<Fabric>> = OnceLock::new();

pub type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Cap for the reconnect backoff.
    pub max_backoff: Duration,
    /// Bounded offline publish queue.
    pub offline_queue_cap: usize,
    /// Trace every incoming packet (MQTT_DEBUG).
    pub debug_packets: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".into(),
            broker_port: 1883,
            client_id: "iotistic-supervisor".into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            offline_queue_cap: 512,
            debug_packets: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublishOpts {
    pub qos: QoS,
    pub retain: bool,
    /// Queue instead of failing when disconnected.
    pub queue_if_offline: bool,
}

impl Default for PublishOpts {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
            queue_if_offline: true,
        }
    }
}

struct Subscription {
    pattern: String,
    qos: QoS,
    handler: Handler,
}

struct QueuedPublish {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

pub struct Fabric {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    subs: Arc<RwLock<Vec<Subscription>>>,
    queue: Arc<Mutex<VecDeque<QueuedPublish>>>,
    queue_cap: usize,
    shutdown: watch::Sender<bool>,
}

impl Fabric {
    /// Initialize the singleton and spawn the dispatcher. Idempotent: a
    /// second call returns the existing handle unchanged.
    pub fn init(cfg: FabricConfig) -> Arc<Fabric> {
        FABRIC
            .get_or_init(|| {
                let mut options =
                    MqttOptions::new(cfg.client_id.clone(), cfg.broker_host.clone(), cfg.broker_port);
                options.set_keep_alive(cfg.keep_alive);
                if let (Some(user), Some(pass)) = (cfg.username.clone(), cfg.password.clone()) {
                    options.set_credentials(user, pass);
                }

                let (client, eventloop) = AsyncClient::new(options, 64);
                let connected = Arc::new(AtomicBool::new(false));
                let subs: Arc<RwLock<Vec<Subscription>>> = Arc::new(RwLock::new(Vec::new()));
                let queue = Arc::new(Mutex::new(VecDeque::new()));
                let (shutdown_tx, shutdown_rx) = watch::channel(false);

                let fabric = Arc::new(Fabric {
                    client: client.clone(),
                    connected: connected.clone(),
                    subs: subs.clone(),
                    queue: queue.clone(),
                    queue_cap: cfg.offline_queue_cap,
                    shutdown: shutdown_tx,
                });

                tokio::spawn(dispatcher(
                    eventloop,
                    client,
                    connected,
                    subs,
                    queue,
                    cfg.max_backoff,
                    cfg.debug_packets,
                    shutdown_rx,
                ));

                fabric
            })
            .clone()
    }

    /// The initialized singleton, if any. Dependents receive the handle from
    /// bootstrap; this accessor exists for handlers registered later.
    pub fn global() -> Option<Arc<Fabric>> {
        FABRIC.get().cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        opts: PublishOpts,
    ) -> Result<(), FabricError> {
        if !self.is_connected() {
            if !opts.queue_if_offline {
                return Err(FabricError::NotConnected);
            }
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.queue_cap {
                return Err(FabricError::QueueFull(self.queue_cap));
            }
            queue.push_back(QueuedPublish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos: opts.qos,
                retain: opts.retain,
            });
            return Ok(());
        }
        self.client
            .publish(topic, opts.qos, opts.retain, payload)
            .await?;
        Ok(())
    }

    /// Register `handler` for `pattern` and subscribe on the transport.
    pub async fn subscribe(
        &self,
        pattern: &str,
        qos: QoS,
        handler: Handler,
    ) -> Result<(), FabricError> {
        {
            let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());
            subs.push(Subscription {
                pattern: pattern.to_string(),
                qos,
                handler,
            });
        }
        if self.is_connected() {
            self.client.subscribe(pattern, qos).await?;
        }
        // Otherwise the dispatcher subscribes after the next ConnAck.
        Ok(())
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), FabricError> {
        {
            let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());
            subs.retain(|s| s.pattern != pattern);
        }
        if self.is_connected() {
            self.client.unsubscribe(pattern).await?;
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), FabricError> {
        let _ = self.shutdown.send(true);
        self.connected.store(false, Ordering::SeqCst);
        self.client.disconnect().await?;
        Ok(())
    }
}

/// Fan a message out to every registered handler whose pattern matches.
/// Handlers must not block; they copy into their own channels if needed.
fn dispatch(subs: &RwLock<Vec<Subscription>>, topic: &str, payload: &[u8]) {
    let guard = subs.read().unwrap_or_else(|e| e.into_inner());
    for sub in guard.iter() {
        if topic_matches(&sub.pattern, topic) {
            (sub.handler)(topic, payload);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatcher(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    subs: Arc<RwLock<Vec<Subscription>>>,
    queue: Arc<Mutex<VecDeque<QueuedPublish>>>,
    max_backoff: Duration,
    debug_packets: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_secs(1);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("messaging dispatcher shutting down");
                    return;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("broker connection established");
                    connected.store(true, Ordering::SeqCst);
                    backoff = Duration::from_secs(1);

                    // Re-subscribe every registered pattern
                    let patterns: Vec<(String, QoS)> = {
                        let guard = subs.read().unwrap_or_else(|e| e.into_inner());
                        guard.iter().map(|s| (s.pattern.clone(), s.qos)).collect()
                    };
                    for (pattern, qos) in patterns {
                        if let Err(e) = client.subscribe(&pattern, qos).await {
                            warn!(pattern = %pattern, error = %e, "re-subscribe failed");
                        }
                    }

                    // Drain publishes queued while offline
                    loop {
                        let next = {
                            let mut q = queue.lock().unwrap_or_else(|e| e.into_inner());
                            q.pop_front()
                        };
                        let Some(p) = next else { break };
                        if let Err(e) = client.publish(&p.topic, p.qos, p.retain, p.payload).await {
                            warn!(topic = %p.topic, error = %e, "queued publish failed");
                            break;
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if debug_packets {
                        debug!(topic = %publish.topic, bytes = publish.payload.len(), "incoming publish");
                    }
                    dispatch(&subs, &publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("broker sent disconnect");
                    connected.store(false, Ordering::SeqCst);
                }
                Ok(event) => {
                    if debug_packets {
                        debug!(?event, "transport event");
                    }
                }
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    debug!(error = %e, delay = ?backoff, "transport error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sub(pattern: &str, counter: Arc<AtomicUsize>) -> Subscription {
        Subscription {
            pattern: pattern.to_string(),
            qos: QoS::AtMostOnce,
            handler: Arc::new(move |_t, _p| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    #[test]
    fn dispatch_reaches_every_matching_handler() {
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));
        let hits_c = Arc::new(AtomicUsize::new(0));
        let subs = RwLock::new(vec![
            sub("logs/#", hits_a.clone()),
            sub("logs/+/web/info", hits_b.clone()),
            sub("shadow/#", hits_c.clone()),
        ]);

        dispatch(&subs, "logs/1/web/info", b"{}");

        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
        assert_eq!(hits_c.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispatch_passes_topic_and_payload() {
        let seen: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let subs = RwLock::new(vec![Subscription {
            pattern: "a/+".into(),
            qos: QoS::AtMostOnce,
            handler: Arc::new(move |t, p| {
                seen2.lock().unwrap().push((t.to_string(), p.to_vec()));
            }),
        }]);

        dispatch(&subs, "a/b", b"payload");
        let got = seen.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "a/b");
        assert_eq!(got[0].1, b"payload");
    }

    #[test]
    fn handler_registered_after_publish_misses_it() {
        // Order dependence: a publish dispatched before the subscription
        // exists is not delivered to it.
        let hits = Arc::new(AtomicUsize::new(0));
        let subs = RwLock::new(Vec::new());

        dispatch(&subs, "logs/1/web/info", b"early");
        subs.write().unwrap().push(sub("logs/#", hits.clone()));
        dispatch(&subs, "logs/1/web/info", b"late");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
