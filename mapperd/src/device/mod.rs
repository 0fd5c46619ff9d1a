//! The per-device runtime: one driver client plus one reconciliation
//! task per managed device.
//!
//! The loop ticks once a second. Each tick probes the device status,
//! gates on it, then walks the twins: read the current value, fan it
//! out to the configured sinks, report it to the control plane, and
//! reconcile against the desired value. The device state lock is
//! held for the whole tick, so control-plane writes serialize
//! against the loop.

use crate::data::{DataModel, SinkSet};
use crate::grpc::client::Reporter;
use chrono::Utc;
use mapper_api::{
    driver::{DeviceClient, ProtocolConfig, Visitor},
    types::device::{
        effective_namespace, normalize_status, DeviceInstance, DeviceModel,
        STATUS_OFFLINE, STATUS_OK, STATUS_UNKNOWN,
    },
    Result,
};
use mapper_drv_modbus::ModbusClient;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{sleep, timeout, Duration},
};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub mod twin;

// How long `stop` waits for the loop to notice the latch before the
// task is cancelled outright.

const STOP_GRACE: Duration = Duration::from_millis(500);

const TICK: Duration = Duration::from_secs(1);

/// Builds the driver client for an instance's protocol. Every
/// protocol currently maps onto the simulated modbus client; this is
/// the seam where real drivers plug in.
pub fn new_driver_client(protocol: &ProtocolConfig) -> Arc<dyn DeviceClient> {
    Arc::new(ModbusClient::new(protocol))
}

/// The mutable half of a device, guarded by one lock.
pub struct DeviceState {
    pub instance: DeviceInstance,
    pub status: String,
}

/// One managed device: its specification, its driver client, and
/// its reconciliation task.
pub struct Device {
    id: String,
    name: String,
    namespace: String,
    model: DeviceModel,
    pub(crate) state: Mutex<DeviceState>,
    client: Arc<dyn DeviceClient>,
    sinks: Arc<SinkSet>,
    reporter: Reporter,
    stop_tx: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
    removing: AtomicBool,
}

impl Device {
    /// Builds a device from its instance and model. Namespaces are
    /// defaulted, missing twins and methods are synthesized, and the
    /// canonical id is stamped onto the instance. `client` overrides
    /// the driver; tests use it, production passes `None`.
    pub fn build(
        mut instance: DeviceInstance,
        mut model: DeviceModel,
        sinks: Arc<SinkSet>,
        reporter: Reporter,
        client: Option<Arc<dyn DeviceClient>>,
    ) -> Arc<Device> {
        instance.namespace = effective_namespace(&instance.namespace);
        model.namespace = effective_namespace(&model.namespace);
        instance.id = instance.canonical_id();
        instance.synthesize_runtime_state();

        let client =
            client.unwrap_or_else(|| new_driver_client(&instance.protocol));
        let (stop_tx, _) = watch::channel(false);
        let id = instance.id.clone();
        let name = instance.name.clone();
        let namespace = instance.namespace.clone();

        Arc::new(Device {
            id,
            name,
            namespace,
            model,
            state: Mutex::new(DeviceState {
                instance,
                status: STATUS_UNKNOWN.to_string(),
            }),
            client,
            sinks,
            reporter,
            stop_tx,
            task: StdMutex::new(None),
            removing: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    pub(crate) fn client(&self) -> &Arc<dyn DeviceClient> {
        &self.client
    }

    /// True when `key` is this device's canonical id or short name.
    pub fn matches(&self, key: &str) -> bool {
        key == self.id || key == self.name
    }

    pub fn set_removing(&self) {
        self.removing.store(true, Ordering::SeqCst);
    }

    pub async fn status(&self) -> String {
        self.state.lock().await.status.clone()
    }

    /// A copy of the instance for read-only callers (admin API,
    /// GetDevice).
    pub async fn instance_snapshot(&self) -> DeviceInstance {
        self.state.lock().await.instance.clone()
    }

    /// The last reported value of a property's twin, with its value
    /// type.
    pub async fn twin_value(
        &self,
        property_name: &str,
    ) -> Option<(String, String)> {
        let st = self.state.lock().await;

        st.instance.find_twin(property_name).map(|t| {
            let value = if t.reported.value.is_empty() {
                String::from("null")
            } else {
                t.reported.value.clone()
            };

            (value, String::from("string"))
        })
    }

    /// The admin write path; see [`twin::set`].
    pub async fn set_property(
        &self,
        property_name: &str,
        value: &str,
    ) -> Result<String> {
        twin::set(self, property_name, value).await
    }

    pub(crate) fn build_visitor(
        instance: &DeviceInstance,
        property_name: &str,
    ) -> Visitor {
        let config_data = instance
            .find_property(property_name)
            .map(|p| p.visitors.clone())
            .unwrap_or_default();

        Visitor {
            property_name: property_name.to_string(),
            protocol_name: instance.protocol.protocol_name.clone(),
            config_data,
            offset: instance.resolve_offset(property_name),
        }
    }

    // Asks the driver for its state, normalizes it, and updates the
    // stored status. Returns whether a report is due and the
    // normalized value.

    async fn probe_status(&self, st: &mut DeviceState) -> (bool, String) {
        let raw = self.client.state().await.unwrap_or_default();
        let norm = normalize_status(&raw);
        let changed = st.status != norm;

        if changed {
            info!(
                "device {} status {} -> {}",
                &self.name, &st.status, &norm
            );
            st.status = norm.clone();
        }
        (changed, norm)
    }

    async fn report_status(&self, status: &str) {
        self.reporter
            .report_device_states(&self.namespace, &self.name, status)
            .await;
        self.reporter
            .report_twin_kv(&self.namespace, &self.name, "status", status, "string")
            .await;
    }

    /// Starts the runtime: synthesizes any missing runtime state,
    /// initializes the driver, forces an initial status report, and
    /// launches the reconciliation loop. A driver init failure
    /// reports the device offline and aborts the start; the registry
    /// keeps the entry for introspection.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut st = self.state.lock().await;

            st.instance.synthesize_runtime_state();

            if self.task.lock().unwrap().is_some() {
                return Ok(());
            }

            if let Err(e) = self.client.init().await {
                error!(
                    "driver init failed for device {} -- {}",
                    &self.name, &e
                );
                st.status = STATUS_OFFLINE.to_string();
                drop(st);
                self.report_status(STATUS_OFFLINE).await;
                return Err(e);
            }

            // Initial report is forced, whatever the state is.

            let (_, status) = self.probe_status(&mut st).await;

            drop(st);
            self.report_status(&status).await;
        }

        let _ = self.stop_tx.send(false);

        let rx = self.stop_tx.subscribe();
        let dev = Arc::clone(self);
        let span = info_span!("device", name = self.name.as_str());
        let handle = tokio::spawn(
            async move { dev.run_loop(rx).await }.instrument(span),
        );

        *self.task.lock().unwrap() = Some(handle);
        info!("device {} started", &self.name);
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        loop {
            if *stop_rx.borrow() {
                break;
            }

            self.tick().await;

            // Sleep the inter-tick second, but wake immediately when
            // the stop latch flips.

            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = sleep(TICK) => (),
            }
        }
        debug!("device {} loop exited", &self.name);
    }

    // One reconciliation pass. Takes the device lock for the whole
    // iteration.

    async fn tick(&self) {
        let mut st = self.state.lock().await;
        let (changed, status) = self.probe_status(&mut st).await;

        // The status report always precedes property reports within
        // a tick.

        if changed {
            self.report_status(&status).await;
        }

        if st.status != STATUS_OK {
            return;
        }

        for idx in 0..st.instance.twins.len() {
            let property_name = st.instance.twins[idx].property_name.clone();
            let visitor =
                Device::build_visitor(&st.instance, &property_name);

            match self.client.read(&visitor).await {
                Ok(bytes) => {
                    let value =
                        String::from_utf8_lossy(&bytes).to_string();
                    let ts = Utc::now().timestamp_millis();

                    {
                        let twin = &mut st.instance.twins[idx];

                        twin.reported.value = value.clone();
                        twin.reported.metadata.timestamp = ts.to_string();
                        twin.reported.metadata.value_type =
                            String::from("string");
                    }
                    info!(
                        "device={} prop={} reported='{}'",
                        &self.name, &property_name, &value
                    );

                    // Fan out: recorder, then publisher, then the
                    // twin KV report. Sink failures stay here.

                    let prop = st.instance.twins[idx]
                        .property_idx
                        .map(|i| st.instance.properties[i].clone());

                    if let Some(prop) = prop {
                        let dm = DataModel::new(
                            &self.namespace,
                            &self.name,
                            &property_name,
                            &value,
                            ts,
                        );

                        if let Err(e) = self.sinks.record(&prop, &dm).await
                        {
                            debug!(
                                "record failed -- prop: {}, {}",
                                &property_name, &e
                            );
                        }
                        if let Err(e) = self.sinks.publish(&prop, &dm).await
                        {
                            debug!(
                                "publish failed -- prop: {}, {}",
                                &property_name, &e
                            );
                        }
                    }

                    self.reporter
                        .report_twin_kv(
                            &self.namespace,
                            &self.name,
                            &property_name,
                            &value,
                            "string",
                        )
                        .await;
                }
                Err(e) => {
                    warn!(
                        "read failed -- device: {}, prop: {}, {}",
                        &self.name, &property_name, &e
                    );
                }
            }

            if let Err(e) = twin::deal_twin(self, &mut st, idx).await {
                warn!(
                    "reconcile failed -- device: {}, prop: {}, {}",
                    &self.name, &property_name, &e
                );
            }
        }
    }

    /// Stops the runtime: latches the stop flag, stops the driver,
    /// reports the device offline, and waits up to 500 ms for the
    /// loop to exit before cancelling it.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let _ = self.client.stop().await;

        {
            let mut st = self.state.lock().await;

            st.status = STATUS_OFFLINE.to_string();
        }
        self.report_status(STATUS_OFFLINE).await;

        let handle = self.task.lock().unwrap().take();

        if let Some(mut handle) = handle {
            if timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!(
                    "device {} loop missed the stop latch, cancelling",
                    &self.name
                );
                handle.abort();
                let _ = handle.await;
            }
        }
        info!("device {} stopped", &self.name);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use mapper_api::types::device::{DeviceProperty, Twin, TwinValue};
    use mapper_api::Error;
    use std::collections::VecDeque;

    /// A scripted driver for runtime tests. Reads pop from a queue
    /// (the last value repeats); every call lands in the op log.
    pub struct MockClient {
        pub ops: StdMutex<Vec<String>>,
        reads: StdMutex<VecDeque<String>>,
        state: StdMutex<String>,
        fail_init: bool,
    }

    impl MockClient {
        pub fn new(reads: &[&str], state: &str) -> Arc<MockClient> {
            Arc::new(MockClient {
                ops: StdMutex::new(vec![]),
                reads: StdMutex::new(
                    reads.iter().map(|s| s.to_string()).collect(),
                ),
                state: StdMutex::new(state.to_string()),
                fail_init: false,
            })
        }

        pub fn failing_init() -> Arc<MockClient> {
            Arc::new(MockClient {
                ops: StdMutex::new(vec![]),
                reads: StdMutex::new(VecDeque::new()),
                state: StdMutex::new(String::from("ok")),
                fail_init: true,
            })
        }

        pub fn set_state(&self, state: &str) {
            *self.state.lock().unwrap() = state.to_string();
        }

        pub fn log(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn record(&self, op: String) {
            self.ops.lock().unwrap().push(op);
        }
    }

    #[async_trait]
    impl DeviceClient for MockClient {
        async fn init(&self) -> Result<()> {
            self.record(String::from("init"));
            if self.fail_init {
                Err(Error::OperationError(String::from("init refused")))
            } else {
                Ok(())
            }
        }

        async fn read(&self, visitor: &Visitor) -> Result<Vec<u8>> {
            self.record(format!("read:{}", &visitor.property_name));

            let mut reads = self.reads.lock().unwrap();
            let value = if reads.len() > 1 {
                reads.pop_front().unwrap()
            } else {
                reads.front().cloned().unwrap_or_default()
            };

            Ok(value.into_bytes())
        }

        async fn write(&self, value: &str, visitor: &Visitor) -> Result<()> {
            self.record(format!(
                "write:{}={}",
                &visitor.property_name, value
            ));

            let mut reads = self.reads.lock().unwrap();

            reads.clear();
            reads.push_back(value.to_string());
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.record(String::from("stop"));
            Ok(())
        }

        async fn state(&self) -> Result<String> {
            Ok(self.state.lock().unwrap().clone())
        }
    }

    pub fn test_instance(props: &[&str]) -> DeviceInstance {
        DeviceInstance {
            name: String::from("d1"),
            namespace: String::from("ns1"),
            model: String::from("m1"),
            protocol: ProtocolConfig {
                protocol_name: String::from("modbus-tcp"),
                config_data: String::from("{}"),
            },
            properties: props
                .iter()
                .map(|p| DeviceProperty {
                    name: p.to_string(),
                    ..DeviceProperty::default()
                })
                .collect(),
            ..DeviceInstance::default()
        }
    }

    pub fn test_device(
        instance: DeviceInstance,
        client: Arc<MockClient>,
    ) -> Arc<Device> {
        Device::build(
            instance,
            DeviceModel {
                name: String::from("m1"),
                namespace: String::from("ns1"),
                ..DeviceModel::default()
            },
            Arc::new(SinkSet::new()),
            Reporter::disabled(),
            Some(client),
        )
    }

    #[tokio::test]
    async fn test_tick_updates_reported_values() {
        let client = MockClient::new(&["42"], "ok");
        let dev = test_device(test_instance(&["temp"]), client.clone());

        dev.tick().await;
        dev.tick().await;

        let (value, vtype) = dev.twin_value("temp").await.unwrap();

        assert_eq!(value, "42");
        assert_eq!(vtype, "string");
        assert_eq!(dev.status().await, "ok");
        assert!(client.log().iter().any(|op| op == "read:temp"));
    }

    // A non-ok status must gate property polling entirely.

    #[tokio::test]
    async fn test_offline_status_gates_reads() {
        let client = MockClient::new(&["42"], "offline");
        let dev = test_device(test_instance(&["temp"]), client.clone());

        dev.tick().await;

        assert_eq!(dev.status().await, "offline");
        assert!(!client.log().iter().any(|op| op.starts_with("read:")));

        // Flipping the driver state back to ok resumes polling on
        // the next tick.

        client.set_state("ok");
        dev.tick().await;

        assert_eq!(dev.status().await, "ok");
        assert!(client.log().iter().any(|op| op == "read:temp"));
    }

    #[tokio::test]
    async fn test_desired_value_triggers_write() {
        let client = MockClient::new(&["42"], "ok");
        let mut instance = test_instance(&["temp"]);

        instance.twins = vec![Twin {
            property_name: String::from("temp"),
            observed_desired: TwinValue {
                value: String::from("50"),
                ..TwinValue::default()
            },
            ..Twin::default()
        }];

        let dev = test_device(instance, client.clone());

        dev.tick().await;

        assert!(client.log().iter().any(|op| op == "write:temp=50"));

        // The follow-up read observed the new value.

        let (value, _) = dev.twin_value("temp").await.unwrap();

        assert_eq!(value, "50");

        // Once desired == reported the next tick must not write
        // again.

        let writes_before =
            client.log().iter().filter(|op| op.starts_with("write:")).count();

        dev.tick().await;

        let writes_after =
            client.log().iter().filter(|op| op.starts_with("write:")).count();

        assert_eq!(writes_before, writes_after);
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let client = MockClient::new(&["7"], "ok");
        let dev = test_device(test_instance(&["temp"]), client.clone());

        dev.start().await.unwrap();

        // Starting twice must not spawn a second loop.

        dev.start().await.unwrap();
        assert_eq!(
            client.log().iter().filter(|op| *op == "init").count(),
            1
        );

        dev.stop().await;
        assert_eq!(
            client.log().iter().filter(|op| *op == "stop").count(),
            1
        );
        assert_eq!(dev.status().await, "offline");

        // No driver traffic after stop returned.

        let ops_after_stop = client.log().len();

        sleep(Duration::from_millis(1200)).await;
        assert_eq!(client.log().len(), ops_after_stop);
    }

    #[tokio::test]
    async fn test_failed_init_reports_offline_and_aborts() {
        let client = MockClient::failing_init();
        let dev = test_device(test_instance(&["temp"]), client.clone());

        assert!(dev.start().await.is_err());
        assert_eq!(dev.status().await, "offline");

        // The loop never launched.

        assert!(dev.task.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_admin_set_property() {
        let client = MockClient::new(&["42"], "ok");
        let dev = test_device(test_instance(&["temp"]), client.clone());

        let observed = dev.set_property("temp", "55").await.unwrap();

        assert_eq!(observed, "55");
        assert!(client.log().iter().any(|op| op == "write:temp=55"));

        // Empty values are rejected without touching the driver.

        assert!(dev.set_property("temp", "").await.is_err());
        assert!(dev.set_property("missing", "1").await.is_err());
    }
}
