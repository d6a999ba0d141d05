use crate::prelude::App;
use crate::transport::{
    GattCharacteristic, GattPeripheral, GattService, NotificationStream, TransportError,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use std::error::Error;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A D-LAB device seen during a scan.
#[derive(Clone)]
pub struct Device {
    pub name: String,
    pub address: String,
    peripheral: Peripheral,
    adapter: Adapter,
}

impl Device {
    /// Connect and discover services. The returned handle is what a
    /// [`crate::session::Session`] attaches to.
    pub async fn connect(&self) -> Result<Arc<BlePeripheral>, TransportError> {
        // Subscribe first so a disconnect during discovery is still seen.
        let events = self.adapter.events().await?;
        if !self.peripheral.is_connected().await? {
            info!("Connecting to {} ({})", self.name, self.address);
            self.peripheral.connect().await?;
        }
        self.peripheral.discover_services().await?;
        Ok(Arc::new(BlePeripheral {
            peripheral: self.peripheral.clone(),
            events: Mutex::new(Some(events)),
        }))
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

type AdapterEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

pub struct BlePeripheral {
    peripheral: Peripheral,
    // Taken by the first disconnect watcher.
    events: Mutex<Option<AdapterEvents>>,
}

#[async_trait]
impl GattPeripheral for BlePeripheral {
    async fn services(&self) -> Result<Vec<Arc<dyn GattService>>, TransportError> {
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| {
                Arc::new(BleService {
                    peripheral: self.peripheral.clone(),
                    service,
                }) as Arc<dyn GattService>
            })
            .collect())
    }

    async fn disconnected(&self) {
        let id = self.peripheral.id();
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut events) = events else {
            debug!("Disconnection of {id:?} is already watched");
            futures::future::pending::<()>().await;
            return;
        };
        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(gone) = event {
                if gone == id {
                    return;
                }
            }
        }
        warn!("Adapter event stream ended, assuming {id:?} is gone");
    }
}

struct BleService {
    peripheral: Peripheral,
    service: Service,
}

#[async_trait]
impl GattService for BleService {
    fn uuid(&self) -> Uuid {
        self.service.uuid
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>, TransportError> {
        Ok(self
            .service
            .characteristics
            .iter()
            .map(|characteristic| {
                Arc::new(BleCharacteristic {
                    peripheral: self.peripheral.clone(),
                    characteristic: characteristic.clone(),
                }) as Arc<dyn GattCharacteristic>
            })
            .collect())
    }
}

struct BleCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

#[async_trait]
impl GattCharacteristic for BleCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        Ok(self.peripheral.read(&self.characteristic).await?)
    }

    async fn write(&self, value: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.characteristic, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<NotificationStream, TransportError> {
        self.peripheral.subscribe(&self.characteristic).await?;
        // The peripheral has a single notification stream for all
        // characteristics.
        let uuid = self.characteristic.uuid;
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter_map(move |n| futures::future::ready((n.uuid == uuid).then_some(n.value)))
            .boxed())
    }
}

fn scan_duration(app: &App) -> Duration {
    Duration::try_from_secs_f32(app.scantime).unwrap_or_else(|_| {
        warn!("Invalid scan time {}, not waiting", app.scantime);
        Duration::ZERO
    })
}

async fn adapters() -> Result<Vec<Adapter>, Box<dyn Error>> {
    let manager = Manager::new().await?;
    let adapter_list = manager.adapters().await?;
    if adapter_list.is_empty() {
        return Err("No Bluetooth adapters found".into());
    }
    Ok(adapter_list)
}

async fn matching_peripherals(app: &App, adapter: &Adapter) -> Result<Vec<Device>, Box<dyn Error>> {
    let mut found = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let properties = peripheral.properties().await?;
        if app.verbose > 1 {
            debug!("{properties:?}");
        }
        if let Some(PeripheralProperties {
            address,
            local_name: Some(name),
            ..
        }) = &properties
        {
            if name.starts_with(&app.name_prefix) {
                info!("Found {name} with address {address}");
                found.push(Device {
                    name: name.to_string(),
                    address: address.to_string(),
                    peripheral: peripheral.clone(),
                    adapter: adapter.clone(),
                });
            }
        }
    }
    Ok(found)
}

/// Scan every adapter for `app.scantime` seconds and list the devices found.
pub async fn scan(app: &App) -> Result<Vec<Device>, Box<dyn Error>> {
    info!("Scanning...");
    let mut devices = Vec::new();
    for adapter in adapters().await?.iter() {
        info!("Trying bluetooth adapter {}...", adapter.adapter_info().await?);
        adapter.start_scan(ScanFilter::default()).await?;
        time::sleep(scan_duration(app)).await;
        devices.extend(matching_peripherals(app, adapter).await?);
        let _ = adapter.stop_scan().await;
    }
    Ok(devices)
}

/// Return the first matching device, giving up after `app.scantime` seconds.
pub async fn find_peripheral(app: &App) -> Result<Device, Box<dyn Error>> {
    info!("Scanning...");
    let adapter_list = adapters().await?;
    for adapter in adapter_list.iter() {
        if let Err(err) = adapter.start_scan(ScanFilter::default()).await {
            warn!("Can't scan bluetooth adapter: {err}");
        }
    }

    let deadline = time::Instant::now() + scan_duration(app);
    loop {
        for adapter in adapter_list.iter() {
            if let Some(device) = matching_peripherals(app, adapter).await?.into_iter().next() {
                for adapter in adapter_list.iter() {
                    let _ = adapter.stop_scan().await;
                }
                return Ok(device);
            }
        }
        if time::Instant::now() >= deadline {
            return Err(format!("No {} device found", app.name_prefix).into());
        }
        time::sleep(Duration::from_secs_f32(0.1)).await;
    }
}

#[test]
fn test_scan_duration() {
    let app = |scantime| App {
        scantime,
        ..App::default()
    };
    assert_eq!(scan_duration(&app(2.5)), Duration::from_millis(2500));
    assert_eq!(scan_duration(&app(-1.0)), Duration::ZERO);
    assert_eq!(scan_duration(&app(f32::NAN)), Duration::ZERO);
}
