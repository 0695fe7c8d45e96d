//! Bluetooth Low Energy transport using `bluest`.
//!
//! The BMS exposes one service with a notify characteristic for responses and a write
//! characteristic for requests. Requests are written without response.

use crate::session::Transport;
use crate::{Error, Result};
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device, Uuid};
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tokio::time::timeout;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ff00_0000_1000_8000_00805f9b34fb);
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);

/// A connected BMS.
pub struct BleTransport {
    adapter: Adapter,
    device: Device,
    name: String,
    write: Characteristic,
    notify: Characteristic,
}

impl BleTransport {
    /// Scans for a device advertising the BMS service and connects to it.
    ///
    /// With `name` set, only a device with exactly that name is accepted. Fails with
    /// [`Error::Connection`] when no matching device shows up within `scan_timeout`.
    pub async fn connect(name: Option<&str>, scan_timeout: Duration) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| Error::Connection("Default adapter not found".into()))?;
        adapter.wait_available().await?;

        let device = timeout(scan_timeout, Self::discover_device(&adapter, name))
            .await
            .map_err(|_| Error::Connection("Device not found".into()))??;

        let name = device
            .device
            .name_async()
            .await
            .unwrap_or_else(|_| String::from("BMS"));
        log::info!("Connecting to {name}...");
        adapter.connect_device(&device.device).await?;

        log::info!("Getting service...");
        let service = device
            .device
            .discover_services_with_uuid(SERVICE_UUID)
            .await?
            .first()
            .ok_or_else(|| Error::Connection(format!("{name} has no BMS service")))?
            .clone();

        log::info!("Getting characteristics...");
        let write = Self::characteristic(&service, WRITE_CHARACTERISTIC_UUID, &name).await?;
        let notify = Self::characteristic(&service, NOTIFY_CHARACTERISTIC_UUID, &name).await?;

        Ok(Self {
            adapter,
            device: device.device,
            name,
            write,
            notify,
        })
    }

    async fn discover_device(adapter: &Adapter, name: Option<&str>) -> Result<AdvertisingDevice> {
        let mut advertisements = adapter.scan(&[SERVICE_UUID]).await?;
        while let Some(device) = advertisements.next().await {
            let device_name = device.device.name_async().await.unwrap_or_default();
            log::debug!("Found {device_name:?} rssi={:?}", device.rssi);
            match name {
                Some(wanted) if wanted != device_name => continue,
                _ => return Ok(device),
            }
        }
        Err(Error::Connection("Scan ended without a matching device".into()))
    }

    async fn characteristic(
        service: &bluest::Service,
        uuid: Uuid,
        name: &str,
    ) -> Result<Characteristic> {
        service
            .discover_characteristics_with_uuid(uuid)
            .await?
            .first()
            .cloned()
            .ok_or_else(|| Error::Connection(format!("{name} has no characteristic {uuid}")))
    }

    /// Starts notifications on the response characteristic.
    pub async fn notifications(
        &self,
    ) -> Result<impl Stream<Item = std::result::Result<Vec<u8>, bluest::Error>> + '_> {
        log::info!("Starting notifications...");
        Ok(self.notify.notify().await?)
    }

    pub async fn disconnect(self) -> Result<()> {
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }
}

impl Transport for BleTransport {
    fn device_name(&self) -> &str {
        &self.name
    }

    async fn write(&self, request: &[u8]) -> Result<()> {
        self.write
            .write_without_response(request)
            .await
            .map_err(|err| Error::Write(err.to_string()))
    }
}
