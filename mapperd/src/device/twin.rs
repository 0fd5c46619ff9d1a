//! The twin machine: desired/reported reconciliation and the admin
//! write path.

use super::{Device, DeviceState};
use chrono::Utc;
use mapper_api::{
    types::device::{Twin, TwinValue},
    Error, Result,
};
use tracing::{debug, warn};

/// Checks a value before it goes to a device. Only emptiness is a
/// hard failure; range and type limits from the model are advisory.
pub fn validate(_twin: &Twin, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvArgument(String::from(
            "property value must not be empty",
        )));
    }
    Ok(())
}

fn stamp(value: &str) -> TwinValue {
    TwinValue {
        value: value.to_string(),
        metadata: mapper_api::types::device::TwinMetadata {
            timestamp: Utc::now().timestamp_millis().to_string(),
            value_type: String::from("string"),
        },
    }
}

/// Reconciles one twin. Nothing happens while the desired value is
/// empty or already matches the reported one. Otherwise the desired
/// value is written through the driver; a write failure is left for
/// the next tick to retry, since desired and reported still differ.
/// After a successful write the reported side is refreshed by a
/// follow-up read, optimistically assuming the desired value when
/// the read fails.
pub(crate) async fn deal_twin(
    dev: &Device,
    st: &mut DeviceState,
    idx: usize,
) -> Result<()> {
    let (property_name, desired) = {
        let twin = &st.instance.twins[idx];

        (
            twin.property_name.clone(),
            twin.observed_desired.value.clone(),
        )
    };

    if desired.is_empty() {
        debug!("twin {} has no desired value, skipping", &property_name);
        return Ok(());
    }
    if st.instance.twins[idx].reported.value == desired {
        debug!(
            "twin {} desired == reported ({}), skipping",
            &property_name, &desired
        );
        return Ok(());
    }

    let visitor = Device::build_visitor(&st.instance, &property_name);

    if let Err(e) = dev.client().write(&desired, &visitor).await {
        warn!(
            "write failed -- prop: {}, value: {}, {}",
            &property_name, &desired, &e
        );
        return Err(e);
    }

    let observed = match dev.client().read(&visitor).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(_) => desired.clone(),
    };

    st.instance.twins[idx].reported = stamp(&observed);
    Ok(())
}

/// The admin write path: records the new desired value, validates,
/// writes through the driver, reads back, updates the twin, and
/// returns the observed (or echoed) value. Validation failures leave
/// the twin untouched.
pub(crate) async fn set(
    dev: &Device,
    property_name: &str,
    value: &str,
) -> Result<String> {
    let mut st = dev.state.lock().await;

    {
        let twin = st
            .instance
            .find_twin(property_name)
            .ok_or(Error::NotFound)?;

        validate(twin, value)?;
    }

    let visitor = Device::build_visitor(&st.instance, property_name);

    dev.client().write(value, &visitor).await?;

    let observed = match dev.client().read(&visitor).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(_) => value.to_string(),
    };

    let twin = st
        .instance
        .find_twin_mut(property_name)
        .ok_or(Error::NotFound)?;

    twin.observed_desired = stamp(value);
    twin.reported = stamp(&observed);

    debug!(
        "set twin {} -- desired: {}, observed: {}",
        property_name, value, &observed
    );
    Ok(observed)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_device, test_instance, MockClient};
    use super::*;
    use mapper_api::types::device::Twin;

    #[test]
    fn test_validate_rejects_empty() {
        let twin = Twin::default();

        assert!(validate(&twin, "").is_err());
        assert!(validate(&twin, "42").is_ok());
    }

    #[tokio::test]
    async fn test_deal_twin_skips_when_converged() {
        let client = MockClient::new(&["42"], "ok");
        let mut instance = test_instance(&["temp"]);

        instance.synthesize_runtime_state();
        instance.twins[0].observed_desired.value = String::from("42");
        instance.twins[0].reported.value = String::from("42");

        let dev = test_device(instance, client.clone());
        let mut st = dev.state.lock().await;

        deal_twin(&dev, &mut st, 0).await.unwrap();
        assert!(client.log().is_empty());
    }

    #[tokio::test]
    async fn test_deal_twin_writes_and_reads_back() {
        let client = MockClient::new(&["42"], "ok");
        let mut instance = test_instance(&["temp"]);

        instance.synthesize_runtime_state();
        instance.twins[0].observed_desired.value = String::from("50");
        instance.twins[0].reported.value = String::from("42");

        let dev = test_device(instance, client.clone());

        {
            let mut st = dev.state.lock().await;

            deal_twin(&dev, &mut st, 0).await.unwrap();
            assert_eq!(st.instance.twins[0].reported.value, "50");
        }

        let log = client.log();

        assert_eq!(log[0], "write:temp=50");
        assert_eq!(log[1], "read:temp");
    }
}
