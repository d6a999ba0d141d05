// In-memory peripheral for session tests.

use crate::firmware::{CharacteristicRole, ServiceRole};
use crate::transport::{
    GattCharacteristic, GattPeripheral, GattService, NotificationStream, TransportError,
};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify, Semaphore};
use uuid::Uuid;

/// Parks transport calls once engaged, so a test can act while a call is
/// in flight.
pub struct Hold {
    engaged: AtomicBool,
    parked: Notify,
    released: Semaphore,
}

impl Hold {
    fn new() -> Self {
        Self {
            engaged: AtomicBool::new(false),
            parked: Notify::new(),
            released: Semaphore::new(0),
        }
    }

    pub fn engage(&self) {
        self.engaged.store(true, Ordering::SeqCst);
    }

    /// Resolves once a call is parked.
    pub async fn parked(&self) {
        self.parked.notified().await;
    }

    /// Let the parked call through. Later calls are not held.
    pub fn release(&self) {
        self.engaged.store(false, Ordering::SeqCst);
        self.released.add_permits(1);
    }

    async fn pass(&self) {
        if self.engaged.load(Ordering::SeqCst) {
            self.parked.notify_one();
            if let Ok(permit) = self.released.acquire().await {
                permit.forget();
            }
        }
    }
}

pub struct MockCharacteristic {
    uuid: Uuid,
    value: Mutex<Vec<u8>>,
    writes: Mutex<Vec<Vec<u8>>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    panic_writes: AtomicBool,
    echo_writes: AtomicBool,
    /// Reads and writes.
    pub calls: Hold,
}

impl MockCharacteristic {
    pub fn new(role: CharacteristicRole, value: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            uuid: role.uuid(),
            value: Mutex::new(value.to_vec()),
            writes: Mutex::new(Vec::new()),
            subscriber: Mutex::new(None),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            panic_writes: AtomicBool::new(false),
            echo_writes: AtomicBool::new(true),
            calls: Hold::new(),
        })
    }

    pub fn set_value(&self, value: &[u8]) {
        *self.value.lock().unwrap() = value.to_vec();
    }

    /// Successful writes, oldest first.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make writes panic, like a buggy platform stack would.
    pub fn panic_writes(&self, panic: bool) {
        self.panic_writes.store(panic, Ordering::SeqCst);
    }

    /// Whether a successful write also becomes the value returned by reads.
    pub fn echo_writes(&self, echo: bool) {
        self.echo_writes.store(echo, Ordering::SeqCst);
    }

    /// Push a notification. Returns false if nobody is subscribed.
    pub fn notify(&self, value: &[u8]) -> bool {
        match self.subscriber.lock().unwrap().as_ref() {
            Some(tx) => tx.unbounded_send(value.to_vec()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl GattCharacteristic for MockCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        self.calls.pass().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TransportError::new("read rejected"));
        }
        Ok(self.value.lock().unwrap().clone())
    }

    async fn write(&self, value: &[u8]) -> Result<(), TransportError> {
        self.calls.pass().await;
        if self.panic_writes.load(Ordering::SeqCst) {
            panic!("write to {} blew up", self.uuid);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::new("write rejected"));
        }
        self.writes.lock().unwrap().push(value.to_vec());
        if self.echo_writes.load(Ordering::SeqCst) {
            self.set_value(value);
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = mpsc::unbounded();
        *self.subscriber.lock().unwrap() = Some(tx);
        Ok(rx.boxed())
    }
}

pub struct MockService {
    uuid: Uuid,
    characteristics: Vec<Arc<MockCharacteristic>>,
}

impl MockService {
    pub fn new(role: ServiceRole, characteristics: Vec<Arc<MockCharacteristic>>) -> Arc<Self> {
        Arc::new(Self {
            uuid: role.uuid(),
            characteristics,
        })
    }
}

#[async_trait]
impl GattService for MockService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>, TransportError> {
        Ok(self
            .characteristics
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn GattCharacteristic>)
            .collect())
    }
}

pub struct MockPeripheral {
    services: Option<Vec<Arc<MockService>>>,
    link_lost: watch::Sender<bool>,
    /// Service listing.
    pub listing: Hold,
}

impl MockPeripheral {
    pub fn new(services: Vec<Arc<MockService>>) -> Arc<Self> {
        Arc::new(Self {
            services: Some(services),
            link_lost: watch::channel(false).0,
            listing: Hold::new(),
        })
    }

    /// A peripheral whose service listing is rejected.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            services: None,
            link_lost: watch::channel(false).0,
            listing: Hold::new(),
        })
    }

    pub fn disconnect(&self) {
        self.link_lost.send_replace(true);
    }
}

#[async_trait]
impl GattPeripheral for MockPeripheral {
    async fn services(&self) -> Result<Vec<Arc<dyn GattService>>, TransportError> {
        self.listing.pass().await;
        let services = self
            .services
            .as_ref()
            .ok_or_else(|| TransportError::new("service discovery rejected"))?;
        Ok(services
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn GattService>)
            .collect())
    }

    async fn disconnected(&self) {
        let mut link_lost = self.link_lost.subscribe();
        let _ = link_lost.wait_for(|lost| *lost).await;
    }
}
