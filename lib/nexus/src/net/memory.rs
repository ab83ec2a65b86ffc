//! In-process reference adapter: port pairs with deferred in-order delivery
//! and a hub endpoint implementing listen/connect. This is both the adapter
//! for same-process workers and the substrate the test suite runs on.

use crate::error::{NexusError, NexusResult};
use crate::identity::{descriptor_matches, Descriptor, PlatformInfo};
use crate::net::packet::Packet;
use crate::net::port::{
    AcceptCallback, EndpointCapabilities, PlatformEndpoint, PortCallbacks, RawPort, TransferList,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};

enum Event {
    Packet(Packet),
    Closed,
}

/// One end of an in-process channel. Delivery is in order but never
/// synchronous with the post: packets pass through a pump task, mirroring a
/// platform channel where post returns before the peer runs.
pub struct MemoryPort {
    peer_tx: mpsc::UnboundedSender<Event>,
    own_tx: mpsc::UnboundedSender<Event>,
    bind_tx: Mutex<Option<oneshot::Sender<PortCallbacks>>>,
    closed: AtomicBool,
}

/// Builds a connected pair of ports. Each side owns a pump task that drains
/// inbound events into the callbacks bound on that side.
pub fn port_pair() -> (Arc<MemoryPort>, Arc<MemoryPort>) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();

    let left = Arc::new(MemoryPort::new(right_tx.clone(), left_tx.clone()));
    let right = Arc::new(MemoryPort::new(left_tx, right_tx));

    left.spawn_pump(left_rx);
    right.spawn_pump(right_rx);

    (left, right)
}

impl MemoryPort {
    fn new(peer_tx: mpsc::UnboundedSender<Event>, own_tx: mpsc::UnboundedSender<Event>) -> MemoryPort {
        MemoryPort {
            peer_tx,
            own_tx,
            bind_tx: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn spawn_pump(&self, mut rx: mpsc::UnboundedReceiver<Event>) {
        let (bind_tx, bind_rx) = oneshot::channel::<PortCallbacks>();
        *self.bind_tx.lock().expect("Bind slot poisoned") = Some(bind_tx);

        tokio::spawn(async move {
            let callbacks = match bind_rx.await {
                Ok(callbacks) => callbacks,
                // The port was dropped without ever being bound.
                Err(_) => return,
            };

            while let Some(event) = rx.recv().await {
                match event {
                    Event::Packet(packet) => (callbacks.on_message)(packet),
                    Event::Closed => {
                        (callbacks.on_disconnect)();
                        return;
                    }
                }
            }
        });
    }
}

impl RawPort for MemoryPort {
    // The packet already moves across the channel whole, so the transfer
    // list carries no extra meaning in process.
    fn post_message(&self, packet: Packet, _transfer: Option<TransferList>) -> NexusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NexusError::disconnected(None));
        }

        self.peer_tx
            .send(Event::Packet(packet))
            .map_err(|_| NexusError::disconnected(None))
    }

    fn bind(&self, callbacks: PortCallbacks) {
        let sender = self
            .bind_tx
            .lock()
            .expect("Bind slot poisoned")
            .take()
            .expect("Port callbacks already bound");

        // The pump may already be gone if the port closed before binding.
        drop(sender.send(callbacks));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        drop(self.peer_tx.send(Event::Closed));
        drop(self.own_tx.send(Event::Closed));
    }
}

struct Registration {
    advertised: PlatformInfo,
    endpoint: Weak<MemoryEndpoint>,
}

/// Connects memory endpoints by descriptor: `connect` finds a listening
/// endpoint whose advertised record matches the descriptor subset.
pub struct MemoryHub {
    listeners: Mutex<Vec<Registration>>,
}

impl MemoryHub {
    pub fn new() -> Arc<MemoryHub> {
        Arc::new(MemoryHub {
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Creates an endpoint attached to this hub. `advertised` is the record
    /// descriptors are matched against, and doubles as the platform
    /// metadata peers observe.
    pub fn endpoint(self: &Arc<MemoryHub>, advertised: PlatformInfo) -> Arc<MemoryEndpoint> {
        self.endpoint_with(advertised, false)
    }

    pub fn endpoint_with(
        self: &Arc<MemoryHub>,
        advertised: PlatformInfo,
        supports_transferables: bool,
    ) -> Arc<MemoryEndpoint> {
        Arc::new(MemoryEndpoint {
            hub: Arc::downgrade(self),
            advertised,
            supports_transferables,
            accept: Mutex::new(None),
        })
    }

    fn register(&self, registration: Registration) {
        self.listeners.lock().expect("Hub poisoned").push(registration);
    }

    fn dial(&self, descriptor: &Descriptor, caller: &PlatformInfo) -> NexusResult<(Arc<dyn RawPort>, PlatformInfo)> {
        let (accept, advertised) = {
            let mut listeners = self.listeners.lock().expect("Hub poisoned");
            listeners.retain(|registration| registration.endpoint.upgrade().is_some());

            let found = listeners.iter().find_map(|registration| {
                let endpoint = registration.endpoint.upgrade()?;
                if !descriptor_matches(descriptor, &registration.advertised) {
                    return None;
                }

                let accept = endpoint.accept.lock().expect("Accept slot poisoned").clone()?;
                Some((accept, registration.advertised.clone()))
            });

            match found {
                Some(found) => found,
                None => {
                    return Err(NexusError::configuration(format!(
                        "no listening endpoint matches descriptor {}",
                        serde_json::Value::Object(descriptor.clone())
                    )))
                }
            }
        };

        let (outbound, inbound) = port_pair();
        let inbound: Arc<dyn RawPort> = inbound;
        let outbound: Arc<dyn RawPort> = outbound;
        accept(inbound, caller.clone());

        Ok((outbound, advertised))
    }
}

pub struct MemoryEndpoint {
    hub: Weak<MemoryHub>,
    advertised: PlatformInfo,
    supports_transferables: bool,
    accept: Mutex<Option<Arc<AcceptCallback>>>,
}

impl PlatformEndpoint for MemoryEndpoint {
    fn capabilities(&self) -> EndpointCapabilities {
        EndpointCapabilities {
            supports_transferables: self.supports_transferables,
        }
    }

    fn listen(self: Arc<Self>, on_accept: AcceptCallback) -> bool {
        *self.accept.lock().expect("Accept slot poisoned") = Some(Arc::new(on_accept));

        if let Some(hub) = self.hub.upgrade() {
            hub.register(Registration {
                advertised: self.advertised.clone(),
                endpoint: Arc::downgrade(&self),
            });
            true
        } else {
            false
        }
    }

    fn connect(&self, descriptor: &Descriptor) -> NexusResult<(Arc<dyn RawPort>, PlatformInfo)> {
        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| NexusError::configuration("memory hub is gone"))?;

        hub.dial(descriptor, &self.advertised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::identity_from;
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;

    fn collecting_callbacks(
        packet_tx: std_mpsc::Sender<Packet>,
        close_tx: std_mpsc::Sender<()>,
    ) -> PortCallbacks {
        PortCallbacks {
            on_message: Box::new(move |packet| {
                packet_tx.send(packet).unwrap();
            }),
            on_disconnect: Box::new(move || {
                drop(close_tx.send(()));
            }),
        }
    }

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (left, right) = port_pair();
        let (packet_tx, packet_rx) = std_mpsc::channel();
        let (close_tx, _close_rx) = std_mpsc::channel();

        right.bind(collecting_callbacks(packet_tx, close_tx));
        left.bind(PortCallbacks {
            on_message: Box::new(|_| ()),
            on_disconnect: Box::new(|| ()),
        });

        for index in 0..10 {
            left.post_message(Packet::Text(format!("m{}", index)), None).unwrap();
        }

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        for index in 0..10 {
            assert_eq!(packet_rx.try_recv().unwrap(), Packet::Text(format!("m{}", index)));
        }
    }

    #[tokio::test]
    async fn test_close_notifies_both_sides() {
        let (left, right) = port_pair();
        let (packet_tx, _packet_rx) = std_mpsc::channel();
        let (left_close_tx, left_close_rx) = std_mpsc::channel();
        let (right_close_tx, right_close_rx) = std_mpsc::channel();

        left.bind(collecting_callbacks(packet_tx.clone(), left_close_tx));
        right.bind(collecting_callbacks(packet_tx, right_close_tx));

        left.close();

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert!(left_close_rx.try_recv().is_ok());
        assert!(right_close_rx.try_recv().is_ok());
        assert!(left.post_message(Packet::Text("late".to_string()), None).is_err());
    }

    #[tokio::test]
    async fn test_hub_connects_by_descriptor() {
        let hub = MemoryHub::new();
        let host = hub.endpoint(identity_from(vec![("context", json!("host"))]));
        let client = hub.endpoint(identity_from(vec![("context", json!("client"))]));

        let (accept_tx, accept_rx) = std_mpsc::channel();
        assert!(host.clone().listen(Box::new(move |port, platform| {
            accept_tx.send((port, platform)).unwrap();
        })));

        let descriptor = identity_from(vec![("context", json!("host"))]);
        let (port, platform) = client.connect(&descriptor).unwrap();

        assert_eq!(platform.get("context"), Some(&json!("host")));

        let (accepted_port, accepted_platform) = accept_rx.try_recv().unwrap();
        assert_eq!(accepted_platform.get("context"), Some(&json!("client")));

        let (packet_tx, packet_rx) = std_mpsc::channel();
        let (close_tx, _close_rx) = std_mpsc::channel();
        accepted_port.bind(collecting_callbacks(packet_tx, close_tx));
        port.bind(PortCallbacks {
            on_message: Box::new(|_| ()),
            on_disconnect: Box::new(|| ()),
        });

        port.post_message(Packet::Text("hello".to_string()), None).unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(packet_rx.try_recv().unwrap(), Packet::Text("hello".to_string()));
    }

    #[tokio::test]
    async fn test_hub_connect_without_listener_fails() {
        let hub = MemoryHub::new();
        let client = hub.endpoint(identity_from(vec![("context", json!("client"))]));

        let descriptor = identity_from(vec![("context", json!("host"))]);
        assert!(client.connect(&descriptor).is_err());
    }
}
