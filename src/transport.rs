// The BLE operations a session needs from the platform stack.
//
// Anything that can list services and characteristics and read, write and
// subscribe to a characteristic can host a session. The bluetooth module
// implements these traits on top of btleplug.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Raw characteristic values in arrival order.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// A read, write, subscribe or listing call rejected by the BLE stack.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(#[source] Box<dyn StdError + Send + Sync>);

impl TransportError {
    pub fn new<E>(cause: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self(cause.into())
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        Self::new(err)
    }
}

#[async_trait]
pub trait GattCharacteristic: Send + Sync {
    fn uuid(&self) -> Uuid;
    async fn read(&self) -> Result<Vec<u8>, TransportError>;
    async fn write(&self, value: &[u8]) -> Result<(), TransportError>;
    async fn subscribe(&self) -> Result<NotificationStream, TransportError>;
}

#[async_trait]
pub trait GattService: Send + Sync {
    fn uuid(&self) -> Uuid;
    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>, TransportError>;
}

#[async_trait]
pub trait GattPeripheral: Send + Sync {
    async fn services(&self) -> Result<Vec<Arc<dyn GattService>>, TransportError>;

    /// Resolves once the link to the peripheral is gone.
    async fn disconnected(&self);
}
