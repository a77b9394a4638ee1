use std::collections::HashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::{API_PREFIX, COLLECTOR_SERVICE_TYPE, TXT_API, TXT_AUX};
use crate::config::AdvertiseConfig;

fn txt_records(auxiliary_memory: bool) -> HashMap<String, String> {
    HashMap::from([
        (TXT_API.to_string(), API_PREFIX.to_string()),
        (TXT_AUX.to_string(), u8::from(auxiliary_memory).to_string()),
    ])
}

pub fn register_collector(
    daemon: &ServiceDaemon,
    config: &AdvertiseConfig,
    auxiliary_memory: bool,
    api_port: u16,
) -> Result<ServiceInfo> {
    let hostname = hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string();

    let instance_name = format!("{}-{}", config.instance, hostname);
    let host_name = format!("{}.local.", hostname);

    let service_info = ServiceInfo::new(
        COLLECTOR_SERVICE_TYPE,
        &instance_name,
        &host_name,
        config.address.as_str(),
        api_port,
        txt_records(auxiliary_memory),
    )
    .context("Failed to create ServiceInfo")?;

    daemon
        .register(service_info.clone())
        .context("Failed to register mDNS service")?;

    tracing::info!(
        "Registered {} as {} on port {}",
        COLLECTOR_SERVICE_TYPE,
        instance_name,
        api_port
    );

    Ok(service_info)
}

pub fn unregister_collector(daemon: &ServiceDaemon, service_info: &ServiceInfo) -> Result<()> {
    daemon
        .unregister(service_info.get_fullname())
        .context("Failed to unregister mDNS service")?;

    tracing::info!("Unregistered {}", service_info.get_fullname());
    Ok(())
}
