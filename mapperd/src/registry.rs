//! The device registry and the panel that orchestrates it.
//!
//! The registry is a flat, lock-guarded list of running devices.
//! Critical sections stay short: devices are never stopped or
//! dropped while the lock is held. `detach` hands the device to the
//! caller, which then owns the stop-and-drop.

use crate::data::SinkSet;
use crate::device::Device;
use crate::grpc::client::Reporter;
use mapper_api::{
    types::device::{canonical_id, DeviceInstance, DeviceModel},
    Error, Result,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tracing::{error, info, warn};

pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<Device>>>,
    stopped: AtomicBool,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry {
            devices: Mutex::new(vec![]),
            stopped: AtomicBool::new(false),
        }
    }

    /// Appends a device. Callers detach any previous holder of the
    /// identity first; `add` itself doesn't check.
    pub fn add(&self, dev: Arc<Device>) {
        self.devices.lock().unwrap().push(dev);
    }

    /// Looks a device up by canonical id or short name. On a miss,
    /// the lookup retries with the suffix after the last `.` (or,
    /// failing that, `/`), so the admin API's dotted ids resolve
    /// too.
    pub fn get(&self, key: &str) -> Option<Arc<Device>> {
        let devices = self.devices.lock().unwrap();

        if let Some(dev) = devices.iter().find(|d| d.matches(key)) {
            return Some(Arc::clone(dev));
        }

        let suffix = key
            .rsplit_once('.')
            .or_else(|| key.rsplit_once('/'))
            .map(|(_, s)| s)
            .filter(|s| !s.is_empty())?;

        devices.iter().find(|d| d.matches(suffix)).map(Arc::clone)
    }

    /// Removes a device by exact id or name and returns it without
    /// stopping it.
    pub fn detach(&self, key: &str) -> Option<Arc<Device>> {
        let mut devices = self.devices.lock().unwrap();

        devices
            .iter()
            .position(|d| d.matches(key))
            .map(|idx| devices.remove(idx))
    }

    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn start_all(&self) {
        let devices = self.snapshot();
        let mut started = 0;

        for dev in &devices {
            if dev.start().await.is_ok() {
                started += 1;
            }
        }
        info!("started {}/{} devices", started, devices.len());
    }

    /// Stops every device. Idempotent: the second and later calls
    /// return immediately.
    pub async fn stop_all(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        for dev in self.snapshot() {
            dev.stop().await;
        }
        info!("stopped all devices");
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        DeviceRegistry::new()
    }
}

/// Orchestrates the registry, the model store, and the sink wiring.
/// Both RPC servers operate on the panel, never on devices directly.
pub struct DevicePanel {
    pub registry: DeviceRegistry,
    models: Mutex<Vec<DeviceModel>>,
    sinks: Arc<SinkSet>,
    reporter: Reporter,
}

impl DevicePanel {
    pub fn new(sinks: Arc<SinkSet>, reporter: Reporter) -> Arc<DevicePanel> {
        Arc::new(DevicePanel {
            registry: DeviceRegistry::new(),
            models: Mutex::new(vec![]),
            sinks,
            reporter,
        })
    }

    /// Upserts a model, unique per (namespace, name).
    pub fn update_model(&self, model: DeviceModel) {
        let mut models = self.models.lock().unwrap();

        match models
            .iter()
            .position(|m| m.name == model.name && m.namespace == model.namespace)
        {
            Some(idx) => models[idx] = model,
            None => models.push(model),
        }
    }

    /// Finds a model by name within a namespace, falling back to a
    /// name-only match the way initial registration does.
    pub fn get_model(&self, ns: &str, name: &str) -> Option<DeviceModel> {
        let models = self.models.lock().unwrap();
        let ns = mapper_api::types::device::effective_namespace(ns);

        models
            .iter()
            .find(|m| m.name == name && m.namespace == ns)
            .or_else(|| models.iter().find(|m| m.name == name))
            .cloned()
    }

    pub fn has_model(&self, ns: &str, name: &str) -> bool {
        let models = self.models.lock().unwrap();
        let ns = mapper_api::types::device::effective_namespace(ns);

        models.iter().any(|m| m.name == name && m.namespace == ns)
    }

    /// Removes a model by `<ns>/<name>` or bare name.
    pub fn remove_model(&self, key: &str) -> Result<()> {
        let mut models = self.models.lock().unwrap();

        match models
            .iter()
            .position(|m| m.canonical_id() == key || m.name == key)
        {
            Some(idx) => {
                models.remove(idx);
                info!("removed model {}", key);
                Ok(())
            }
            None => {
                warn!("model {} not found", key);
                Err(Error::NotFound)
            }
        }
    }

    /// Replaces the runtime for an instance's identity: any existing
    /// device under the canonical id (or short name) is detached,
    /// stopped, and dropped before the new one is built, registered,
    /// and started. A start failure leaves the entry registered for
    /// introspection.
    pub async fn update_device(
        &self,
        model: DeviceModel,
        instance: DeviceInstance,
    ) -> Result<()> {
        let id = instance.canonical_id();
        let old = self
            .registry
            .detach(&id)
            .or_else(|| self.registry.detach(&instance.name));

        if let Some(old) = old {
            info!("stopping old runtime for {}", &id);
            old.stop().await;
        }

        let dev = Device::build(
            instance,
            model,
            Arc::clone(&self.sinks),
            self.reporter.clone(),
            None,
        );

        self.registry.add(Arc::clone(&dev));
        dev.start().await
    }

    /// Detaches, marks, stops, and drops a device.
    pub async fn remove_device(&self, ns: &str, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvArgument(String::from("empty device name")));
        }

        let dev = self
            .registry
            .detach(name)
            .or_else(|| self.registry.detach(&canonical_id(ns, name)))
            .ok_or(Error::NotFound)?;

        info!("removing device {}", dev.id());
        dev.set_removing();
        dev.stop().await;
        Ok(())
    }

    pub fn get_device(&self, key: &str) -> Option<Arc<Device>> {
        self.registry.get(key)
    }

    /// Builds (but does not start) the devices delivered by the
    /// registration response. Instances whose model can't be found
    /// even by name are skipped.
    pub fn init_devices(
        &self,
        instances: Vec<DeviceInstance>,
        models: Vec<DeviceModel>,
    ) {
        for model in models {
            self.update_model(model);
        }

        for instance in instances {
            let model = self.get_model(&instance.namespace, &instance.model);

            let model = match model {
                Some(model) => model,
                None => {
                    warn!(
                        "no model found for device {} (model={}), skipped",
                        &instance.name, &instance.model
                    );
                    continue;
                }
            };

            let name = instance.name.clone();
            let dev = Device::build(
                instance,
                model,
                Arc::clone(&self.sinks),
                self.reporter.clone(),
                None,
            );

            self.registry.add(dev);
            info!("device {} initialized", &name);
        }

        if self.registry.is_empty() {
            warn!("no devices initialized - running with an empty registry");
        } else {
            info!(
                "device initialization finished ({} devices)",
                self.registry.len()
            );
        }
    }

    /// The admin write path, addressed by any id form the registry
    /// resolves.
    pub async fn write_device(
        &self,
        device_id: &str,
        property_name: &str,
        value: &str,
    ) -> Result<()> {
        let dev = self.get_device(device_id).ok_or(Error::NotFound)?;

        dev.set_property(property_name, value).await.map(|_| ()).map_err(
            |e| {
                error!(
                    "failed to set {} on {} -- {}",
                    property_name, device_id, &e
                );
                e
            },
        )
    }

    /// The admin read path: a twin's last reported value.
    pub async fn read_twin(
        &self,
        device_id: &str,
        property_name: &str,
    ) -> Result<(String, String)> {
        let dev = self.get_device(device_id).ok_or(Error::NotFound)?;

        dev.twin_value(property_name).await.ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{test_device, test_instance, MockClient};

    fn registered_device() -> (DeviceRegistry, Arc<MockClient>) {
        let registry = DeviceRegistry::new();
        let client = MockClient::new(&["1"], "ok");

        registry.add(test_device(test_instance(&["temp"]), client.clone()));
        (registry, client)
    }

    // Every id form must resolve to the same device.

    #[test]
    fn test_lookup_forms() {
        let (registry, _) = registered_device();

        let by_id = registry.get("ns1/d1").unwrap();
        let by_name = registry.get("d1").unwrap();
        let by_dotted = registry.get("ns1.d1").unwrap();

        assert!(Arc::ptr_eq(&by_id, &by_name));
        assert!(Arc::ptr_eq(&by_id, &by_dotted));
        assert!(registry.get("ns1/other").is_none());
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn test_detach_removes_without_stopping() {
        let (registry, client) = registered_device();

        let dev = registry.detach("ns1/d1").unwrap();

        assert_eq!(registry.len(), 0);
        assert!(registry.get("d1").is_none());

        // Detach alone must not have touched the driver.

        assert!(client.log().is_empty());
        drop(dev);
    }

    #[tokio::test]
    async fn test_stop_all_is_idempotent() {
        let (registry, client) = registered_device();

        registry.snapshot()[0].start().await.unwrap();
        registry.stop_all().await;

        let stops =
            client.log().iter().filter(|op| *op == "stop").count();

        assert_eq!(stops, 1);

        registry.stop_all().await;
        assert_eq!(
            client.log().iter().filter(|op| *op == "stop").count(),
            stops
        );
    }

    fn panel() -> Arc<DevicePanel> {
        DevicePanel::new(Arc::new(SinkSet::new()), Reporter::disabled())
    }

    // Re-registering an identity must replace the runtime, not
    // duplicate it.

    #[tokio::test]
    async fn test_update_device_replaces_runtime() {
        let panel = panel();
        let model = DeviceModel {
            name: String::from("m1"),
            namespace: String::from("ns1"),
            ..DeviceModel::default()
        };
        let instance = test_instance(&["temp"]);

        panel
            .update_device(model.clone(), instance.clone())
            .await
            .unwrap();

        let first = panel.get_device("ns1/d1").unwrap();

        panel.update_device(model, instance).await.unwrap();

        let second = panel.get_device("ns1/d1").unwrap();

        assert_eq!(panel.registry.len(), 1);
        assert!(!Arc::ptr_eq(&first, &second));

        // The replaced runtime was stopped on the way out.

        assert_eq!(first.status().await, "offline");

        second.stop().await;
    }

    #[test]
    fn test_model_store() {
        let panel = panel();
        let model = DeviceModel {
            name: String::from("m1"),
            namespace: String::from("ns1"),
            ..DeviceModel::default()
        };

        panel.update_model(model.clone());
        panel.update_model(model.clone());
        assert_eq!(panel.models.lock().unwrap().len(), 1);

        assert!(panel.get_model("ns1", "m1").is_some());

        // Name-only fallback when the namespace doesn't match.

        assert!(panel.get_model("other-ns", "m1").is_some());
        assert!(!panel.has_model("other-ns", "m1"));

        assert!(panel.remove_model("ns1/m1").is_ok());
        assert_eq!(panel.remove_model("ns1/m1"), Err(Error::NotFound));
    }
}
