//! `charging-station` subcommand
//!
//! Boots against the central system, then sends heartbeats at the
//! interval it returns. Reset, ClearCache and ChangeAvailability are
//! accepted and logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use ocppj::application::HandlerResult;
use ocppj::catalog::{v16, v201};
use ocppj::config::AppConfig;
use ocppj::{ChargingStation, EndpointError, OcppVersion, ShutdownSignal};

const VENDOR: &str = "ocppj";
const MODEL: &str = "ocppj-sim";

/// Retry delay when the central system answers a boot with Pending or
/// Rejected and no usable interval.
const BOOT_RETRY: Duration = Duration::from_secs(30);

pub async fn run(config: &AppConfig, shutdown: ShutdownSignal) -> Result<(), Box<dyn std::error::Error>> {
    let version = config.client.ocpp_version;
    let registry = match version {
        OcppVersion::V16 => v16::registry(),
        OcppVersion::V201 => v201::registry(),
    };

    let station = ChargingStation::builder(config.client.station_id.clone(), registry)
        .from_config(&config.client, &config.dispatcher)?
        .build();

    match version {
        OcppVersion::V16 => station.register(v16::core::charge_point(Arc::new(V16Handler))),
        OcppVersion::V201 => {
            let handler = Arc::new(V201Handler);
            station.register(v201::provisioning::station(Arc::clone(&handler)));
            station.register(v201::authorization::station(Arc::clone(&handler)));
            station.register(v201::availability::station(handler));
        }
    }

    station.set_disconnected_handler(|error| match error {
        Some(e) => warn!("Link lost: {}", e),
        None => info!("Link closed"),
    });
    station.set_reconnected_handler(|| info!("🔄 Link restored"));

    if let Some(mut errors) = station.errors() {
        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                warn!("⚠️ {}", e);
            }
        });
    }

    station.start(&config.client.url).await?;

    let stopped = shutdown.wait();
    tokio::pin!(stopped);

    // ── Boot ───────────────────────────────────────────────────
    let interval = loop {
        match boot(&station, version).await {
            Ok(Some(interval)) => break interval,
            Ok(None) => info!("Boot not accepted yet, retrying in {:?}", BOOT_RETRY),
            Err(e) => warn!("Boot notification failed: {}", e),
        }
        tokio::select! {
            _ = &mut stopped => {
                station.stop().await;
                return Ok(());
            }
            _ = tokio::time::sleep(BOOT_RETRY) => {}
        }
    };
    info!("✅ Boot accepted, heartbeat every {:?}", interval);

    // ── Heartbeat loop ─────────────────────────────────────────
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                if let Err(e) = heartbeat(&station, version).await {
                    warn!("Heartbeat failed: {}", e);
                }
            }
        }
    }

    station.stop().await;
    Ok(())
}

/// Returns the heartbeat interval once the boot is accepted.
async fn boot(station: &ChargingStation, version: OcppVersion) -> Result<Option<Duration>, EndpointError> {
    let (accepted, interval) = match version {
        OcppVersion::V16 => {
            let resp = station
                .send_request(v16::core::BootNotificationRequest::new(VENDOR, MODEL))
                .await?;
            (resp.status == v16::types::RegistrationStatus::Accepted, resp.interval)
        }
        OcppVersion::V201 => {
            let resp = station
                .send_request(v201::provisioning::BootNotificationRequest::new(
                    VENDOR,
                    MODEL,
                    v201::provisioning::BootReason::PowerUp,
                ))
                .await?;
            (resp.status == v201::types::RegistrationStatus::Accepted, resp.interval)
        }
    };
    if !accepted {
        return Ok(None);
    }
    Ok(Some(Duration::from_secs(interval.max(1) as u64)))
}

async fn heartbeat(station: &ChargingStation, version: OcppVersion) -> Result<(), EndpointError> {
    let current_time = match version {
        OcppVersion::V16 => station.send_request(v16::core::HeartbeatRequest {}).await?.current_time,
        OcppVersion::V201 => {
            station
                .send_request(v201::provisioning::HeartbeatRequest {})
                .await?
                .current_time
        }
    };
    debug!(%current_time, "💓 Heartbeat acknowledged");
    Ok(())
}

// ── OCPP 1.6 ───────────────────────────────────────────────────

struct V16Handler;

#[async_trait]
impl v16::core::ChargePointHandler for V16Handler {
    async fn on_change_availability(
        &self,
        req: v16::core::ChangeAvailabilityRequest,
    ) -> HandlerResult<v16::core::ChangeAvailabilityResponse> {
        info!(connector_id = req.connector_id, kind = ?req.kind, "Change availability");
        Ok(v16::core::ChangeAvailabilityResponse {
            status: v16::types::AvailabilityStatus::Accepted,
        })
    }

    async fn on_clear_cache(
        &self,
        _req: v16::core::ClearCacheRequest,
    ) -> HandlerResult<v16::core::ClearCacheResponse> {
        info!("🧹 Clear cache");
        Ok(v16::core::ClearCacheResponse {
            status: v16::types::ClearCacheStatus::Accepted,
        })
    }

    async fn on_reset(&self, req: v16::core::ResetRequest) -> HandlerResult<v16::core::ResetResponse> {
        info!(kind = ?req.kind, "🔁 Reset requested");
        Ok(v16::core::ResetResponse {
            status: v16::types::ResetStatus::Accepted,
        })
    }
}

// ── OCPP 2.0.1 ─────────────────────────────────────────────────

struct V201Handler;

#[async_trait]
impl v201::provisioning::StationHandler for V201Handler {
    async fn on_reset(
        &self,
        req: v201::provisioning::ResetRequest,
    ) -> HandlerResult<v201::provisioning::ResetResponse> {
        info!(kind = ?req.kind, evse_id = ?req.evse_id, "🔁 Reset requested");
        Ok(v201::provisioning::ResetResponse {
            status: v201::provisioning::ResetStatus::Accepted,
            status_info: None,
        })
    }
}

#[async_trait]
impl v201::authorization::StationHandler for V201Handler {
    async fn on_clear_cache(
        &self,
        _req: v201::authorization::ClearCacheRequest,
    ) -> HandlerResult<v201::authorization::ClearCacheResponse> {
        info!("🧹 Clear cache");
        Ok(v201::authorization::ClearCacheResponse {
            status: v201::types::GenericStatus::Accepted,
            status_info: None,
        })
    }
}

#[async_trait]
impl v201::availability::StationHandler for V201Handler {
    async fn on_change_availability(
        &self,
        req: v201::availability::ChangeAvailabilityRequest,
    ) -> HandlerResult<v201::availability::ChangeAvailabilityResponse> {
        info!(status = ?req.operational_status, evse = ?req.evse, "Change availability");
        Ok(v201::availability::ChangeAvailabilityResponse {
            status: v201::availability::ChangeAvailabilityStatus::Accepted,
            status_info: None,
        })
    }
}
