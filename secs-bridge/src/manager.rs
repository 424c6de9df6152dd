//! Multi-device manager
//!
//! A [`DeviceManager`] owns any number of [`EquipmentBridge`]s keyed by
//! device id. Each device runs independently; the manager adds, removes,
//! starts and stops them and fans their notifications into one aggregate
//! stream.

use crate::bridge::{DEFAULT_NOTIFICATION_CAPACITY, DeviceHealth, EquipmentBridge};
use crate::catalog::IdentifierCatalog;
use crate::config::{DeviceConfig, ManagerConfig};
use crate::error::{SecsError, SecsResult};
use crate::repository::{InMemoryMappingRepository, MappingRepository};
use crate::source::PhysicalSource;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use secs_core::{Alid, Ceid, DeviceId, Rptid};
use secs_gem::{Notification, ReportValues};
use secs_transport::{Connector, TcpConnector};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Device entry, combining the bridge and its notification forwarder
struct DeviceEntry {
    bridge: EquipmentBridge,
    forwarder: JoinHandle<()>,
}

pub struct DeviceManager {
    devices: DashMap<DeviceId, DeviceEntry>,
    aggregate: broadcast::Sender<Notification>,
    notification_capacity: usize,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFICATION_CAPACITY)
    }

    /// Create a manager whose notification channels hold `capacity` items
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (aggregate, _) = broadcast::channel(capacity);
        Self {
            devices: DashMap::new(),
            aggregate,
            notification_capacity: capacity,
        }
    }

    /// Create a manager and add every configured device
    ///
    /// `source_for` supplies the PLC access of each device. Devices are
    /// added but not started.
    pub async fn from_config<F>(config: &ManagerConfig, source_for: F) -> SecsResult<Self>
    where
        F: Fn(&DeviceConfig) -> Arc<dyn PhysicalSource>,
    {
        let manager = Self::with_capacity(config.notification_capacity);
        manager.load_config(config, source_for).await?;
        Ok(manager)
    }

    /// Add every configured device to this manager
    ///
    /// Configuration, identifier tables and ids already registered here are
    /// checked before any device is added.
    pub async fn load_config<F>(&self, config: &ManagerConfig, source_for: F) -> SecsResult<Vec<DeviceId>>
    where
        F: Fn(&DeviceConfig) -> Arc<dyn PhysicalSource>,
    {
        config.validate()?;
        if let Some(device) = config
            .devices
            .iter()
            .find(|d| self.devices.contains_key(&d.device_id))
        {
            return Err(SecsError::DuplicateDeviceId(device.device_id));
        }
        for device in &config.devices {
            IdentifierCatalog::build(device.identifiers.definitions())?;
        }
        let mut added = Vec::with_capacity(config.devices.len());
        for device in &config.devices {
            self.add_device(device.clone(), source_for(device)).await?;
            added.push(device.device_id);
        }
        Ok(added)
    }

    /// Add a device served over TCP with the identifier tables of its
    /// configuration
    pub async fn add_device(
        &self,
        config: DeviceConfig,
        source: Arc<dyn PhysicalSource>,
    ) -> SecsResult<EquipmentBridge> {
        config.validate()?;
        let connector = Arc::new(TcpConnector::new(config.tcp_settings()?));
        let repository = Arc::new(InMemoryMappingRepository::from_tables(&config.identifiers));
        self.add_device_with(config, connector, source, repository).await
    }

    /// Add a device with explicit transport and mapping repository
    ///
    /// # Errors
    ///
    /// `DuplicateDeviceId` if the id is taken; configuration and catalog
    /// errors of the new bridge
    pub async fn add_device_with(
        &self,
        config: DeviceConfig,
        connector: Arc<dyn Connector>,
        source: Arc<dyn PhysicalSource>,
        repository: Arc<dyn MappingRepository>,
    ) -> SecsResult<EquipmentBridge> {
        let device_id = config.device_id;
        if self.devices.contains_key(&device_id) {
            return Err(SecsError::DuplicateDeviceId(device_id));
        }
        let bridge = EquipmentBridge::new(
            config,
            connector,
            source,
            repository,
            self.notification_capacity,
        )
        .await?;

        match self.devices.entry(device_id) {
            Entry::Occupied(_) => Err(SecsError::DuplicateDeviceId(device_id)),
            Entry::Vacant(slot) => {
                let forwarder = tokio::spawn(forward(
                    device_id,
                    bridge.subscribe(),
                    self.aggregate.clone(),
                ));
                slot.insert(DeviceEntry {
                    bridge: bridge.clone(),
                    forwarder,
                });
                log::info!("dev{} added", device_id);
                Ok(bridge)
            }
        }
    }

    /// Stop and remove a device
    pub async fn remove_device(&self, device_id: DeviceId) -> SecsResult<()> {
        let (_, entry) = self
            .devices
            .remove(&device_id)
            .ok_or(SecsError::UnknownDevice(device_id))?;
        entry.bridge.stop().await;
        entry.forwarder.abort();
        log::info!("dev{} removed", device_id);
        Ok(())
    }

    /// Handle to a device's bridge
    pub fn bridge(&self, device_id: DeviceId) -> SecsResult<EquipmentBridge> {
        self.devices
            .get(&device_id)
            .map(|entry| entry.bridge.clone())
            .ok_or(SecsError::UnknownDevice(device_id))
    }

    /// Registered device ids, ascending
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub async fn start_device(&self, device_id: DeviceId) -> SecsResult<()> {
        self.bridge(device_id)?.start().await
    }

    /// Stop a device; stopping a stopped device does nothing
    pub async fn stop_device(&self, device_id: DeviceId) -> SecsResult<()> {
        self.bridge(device_id)?.stop().await;
        Ok(())
    }

    fn bridges(&self) -> Vec<EquipmentBridge> {
        let mut bridges: Vec<EquipmentBridge> =
            self.devices.iter().map(|entry| entry.bridge.clone()).collect();
        bridges.sort_by_key(EquipmentBridge::device_id);
        bridges
    }

    /// Start every device concurrently, returning each outcome
    pub async fn start_all(&self) -> Vec<(DeviceId, SecsResult<()>)> {
        join_all(self.bridges().into_iter().map(|bridge| async move {
            let result = bridge.start().await;
            if let Err(e) = &result {
                log::error!("dev{} failed to start: {}", bridge.device_id(), e);
            }
            (bridge.device_id(), result)
        }))
        .await
    }

    /// Stop every device concurrently
    pub async fn stop_all(&self) {
        join_all(self.bridges().into_iter().map(|bridge| async move {
            bridge.stop().await;
        }))
        .await;
    }

    pub fn get_health(&self, device_id: DeviceId) -> SecsResult<DeviceHealth> {
        Ok(self.bridge(device_id)?.health())
    }

    /// Health of every device, by ascending id
    pub fn get_all_health(&self) -> Vec<DeviceHealth> {
        self.bridges().iter().map(EquipmentBridge::health).collect()
    }

    /// Notifications of one device
    pub fn subscribe(&self, device_id: DeviceId) -> SecsResult<broadcast::Receiver<Notification>> {
        Ok(self.bridge(device_id)?.subscribe())
    }

    /// Notifications of every device
    ///
    /// Notifications of one device keep their order; there is no order
    /// across devices.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.aggregate.subscribe()
    }

    pub async fn trigger_event(&self, device_id: DeviceId, ceid: Ceid) -> SecsResult<()> {
        self.bridge(device_id)?.trigger_event(ceid).await
    }

    /// Resend the S6F11 event report of `ceid` with its linked reports
    pub async fn resend_report(&self, device_id: DeviceId, ceid: Ceid) -> SecsResult<()> {
        self.bridge(device_id)?.resend_report(ceid).await
    }

    pub async fn read_report(
        &self,
        device_id: DeviceId,
        rptid: Rptid,
    ) -> SecsResult<ReportValues> {
        self.bridge(device_id)?.read_report(rptid).await
    }

    pub fn clear_alarm(&self, device_id: DeviceId, alid: Alid) -> SecsResult<()> {
        self.bridge(device_id)?.clear_alarm(alid)
    }

    pub fn monitored_alarms(&self, device_id: DeviceId) -> SecsResult<Vec<Alid>> {
        Ok(self.bridge(device_id)?.monitored_alarms())
    }

    pub fn set_alarm_monitored(
        &self,
        device_id: DeviceId,
        alid: Alid,
        monitored: bool,
    ) -> SecsResult<()> {
        self.bridge(device_id)?.set_alarm_monitored(alid, monitored)
    }

    pub async fn reload_definitions(&self, device_id: DeviceId) -> SecsResult<()> {
        self.bridge(device_id)?.reload_definitions().await
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        for entry in self.devices.iter() {
            entry.forwarder.abort();
        }
    }
}

/// Copy one device's notifications into the aggregate stream
async fn forward(
    device_id: DeviceId,
    mut notifications: broadcast::Receiver<Notification>,
    aggregate: broadcast::Sender<Notification>,
) {
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                let _ = aggregate.send(notification);
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("dev{} aggregate stream skipped {} notification(s)", device_id, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
