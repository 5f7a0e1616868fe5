//! `central-system` subcommand
//!
//! Accepts every station, logs what it reports and answers boots with
//! `Accepted`.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use ocppj::application::HandlerResult;
use ocppj::catalog::{v16, v201};
use ocppj::config::AppConfig;
use ocppj::support::shutdown::shutdown_with_cleanup;
use ocppj::{CentralSystem, OcppVersion, ShutdownSignal};

/// Heartbeat interval handed to booting stations.
const HEARTBEAT_INTERVAL_SECS: i32 = 300;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(config: &AppConfig, shutdown: ShutdownSignal) -> Result<(), Box<dyn std::error::Error>> {
    let version = config.server.ocpp_version;
    let registry = match version {
        OcppVersion::V16 => v16::registry(),
        OcppVersion::V201 => v201::registry(),
    };

    let csms = CentralSystem::builder(registry)
        .from_config(&config.server, &config.dispatcher)?
        .build();

    match version {
        OcppVersion::V16 => {
            csms.register(v16::core::central_system(Arc::new(V16Handler::default())));
        }
        OcppVersion::V201 => {
            let handler = Arc::new(V201Handler);
            csms.register(v201::provisioning::csms(Arc::clone(&handler)));
            csms.register(v201::authorization::csms(Arc::clone(&handler)));
            csms.register(v201::availability::csms(Arc::clone(&handler)));
            csms.register(v201::data::csms(handler));
        }
    }

    if let Some(auth) = &config.server.basic_auth {
        let (username, password) = (auth.username.clone(), auth.password.clone());
        csms.set_basic_auth_handler(move |user, pass| user == username && pass == password);
        info!("🔐 Basic auth enabled");
    }

    csms.set_new_client_handler(|station| {
        info!(
            charge_point_id = %station.id,
            subprotocol = ?station.subprotocol,
            remote = ?station.remote_addr,
            "🔌 Station connected"
        );
    });
    csms.set_disconnected_client_handler(|station, error| match error {
        Some(e) => warn!(charge_point_id = %station.id, "Station disconnected: {}", e),
        None => info!(charge_point_id = %station.id, "Station disconnected"),
    });

    if let Some(mut errors) = csms.errors() {
        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                warn!("⚠️ {}", e);
            }
        });
    }

    csms.start(&config.server.address()).await?;
    info!("🚀 Press Ctrl+C to shutdown gracefully.");

    shutdown_with_cleanup(&shutdown, SHUTDOWN_TIMEOUT, || csms.stop()).await;
    Ok(())
}

// ── OCPP 1.6 ───────────────────────────────────────────────────

#[derive(Default)]
struct V16Handler {
    next_transaction: AtomicI32,
}

#[async_trait]
impl v16::core::CentralSystemHandler for V16Handler {
    async fn on_authorize(
        &self,
        station_id: &str,
        req: v16::core::AuthorizeRequest,
    ) -> HandlerResult<v16::core::AuthorizeResponse> {
        info!(charge_point_id = station_id, id_tag = %req.id_tag, "🔑 Authorize");
        Ok(v16::core::AuthorizeResponse {
            id_tag_info: v16::types::IdTagInfo::accepted(),
        })
    }

    async fn on_boot_notification(
        &self,
        station_id: &str,
        req: v16::core::BootNotificationRequest,
    ) -> HandlerResult<v16::core::BootNotificationResponse> {
        info!(
            charge_point_id = station_id,
            vendor = %req.charge_point_vendor,
            model = %req.charge_point_model,
            "🥾 Boot notification"
        );
        Ok(v16::core::BootNotificationResponse {
            current_time: Utc::now(),
            interval: HEARTBEAT_INTERVAL_SECS,
            status: v16::types::RegistrationStatus::Accepted,
        })
    }

    async fn on_heartbeat(
        &self,
        station_id: &str,
        _req: v16::core::HeartbeatRequest,
    ) -> HandlerResult<v16::core::HeartbeatResponse> {
        info!(charge_point_id = station_id, "💓 Heartbeat");
        Ok(v16::core::HeartbeatResponse {
            current_time: Utc::now(),
        })
    }

    async fn on_status_notification(
        &self,
        station_id: &str,
        req: v16::core::StatusNotificationRequest,
    ) -> HandlerResult<v16::core::StatusNotificationResponse> {
        info!(
            charge_point_id = station_id,
            connector_id = req.connector_id,
            status = ?req.status,
            error_code = ?req.error_code,
            "Status notification"
        );
        Ok(v16::core::StatusNotificationResponse {})
    }

    async fn on_meter_values(
        &self,
        station_id: &str,
        req: v16::core::MeterValuesRequest,
    ) -> HandlerResult<v16::core::MeterValuesResponse> {
        info!(
            charge_point_id = station_id,
            connector_id = req.connector_id,
            samples = req.meter_value.len(),
            "📊 Meter values"
        );
        Ok(v16::core::MeterValuesResponse {})
    }

    async fn on_start_transaction(
        &self,
        station_id: &str,
        req: v16::core::StartTransactionRequest,
    ) -> HandlerResult<v16::core::StartTransactionResponse> {
        let transaction_id = self.next_transaction.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            charge_point_id = station_id,
            connector_id = req.connector_id,
            transaction_id,
            meter_start = req.meter_start,
            "⚡ Transaction started"
        );
        Ok(v16::core::StartTransactionResponse {
            id_tag_info: v16::types::IdTagInfo::accepted(),
            transaction_id,
        })
    }

    async fn on_stop_transaction(
        &self,
        station_id: &str,
        req: v16::core::StopTransactionRequest,
    ) -> HandlerResult<v16::core::StopTransactionResponse> {
        info!(
            charge_point_id = station_id,
            transaction_id = req.transaction_id,
            meter_stop = req.meter_stop,
            reason = ?req.reason,
            "🏁 Transaction stopped"
        );
        Ok(v16::core::StopTransactionResponse { id_tag_info: None })
    }
}

// ── OCPP 2.0.1 ─────────────────────────────────────────────────

struct V201Handler;

#[async_trait]
impl v201::provisioning::CsmsHandler for V201Handler {
    async fn on_boot_notification(
        &self,
        station_id: &str,
        req: v201::provisioning::BootNotificationRequest,
    ) -> HandlerResult<v201::provisioning::BootNotificationResponse> {
        info!(
            charge_point_id = station_id,
            vendor = %req.charging_station.vendor_name,
            model = %req.charging_station.model,
            reason = ?req.reason,
            "🥾 Boot notification"
        );
        Ok(v201::provisioning::BootNotificationResponse {
            current_time: Utc::now(),
            interval: HEARTBEAT_INTERVAL_SECS,
            status: v201::types::RegistrationStatus::Accepted,
            status_info: None,
        })
    }

    async fn on_heartbeat(
        &self,
        station_id: &str,
        _req: v201::provisioning::HeartbeatRequest,
    ) -> HandlerResult<v201::provisioning::HeartbeatResponse> {
        info!(charge_point_id = station_id, "💓 Heartbeat");
        Ok(v201::provisioning::HeartbeatResponse {
            current_time: Utc::now(),
        })
    }
}

#[async_trait]
impl v201::authorization::CsmsHandler for V201Handler {
    async fn on_authorize(
        &self,
        station_id: &str,
        req: v201::authorization::AuthorizeRequest,
    ) -> HandlerResult<v201::authorization::AuthorizeResponse> {
        info!(charge_point_id = station_id, id_token = %req.id_token.id_token, "🔑 Authorize");
        Ok(v201::authorization::AuthorizeResponse {
            id_token_info: v201::authorization::IdTokenInfo {
                status: v201::types::AuthorizationStatus::Accepted,
                cache_expiry_date_time: None,
                charging_priority: None,
            },
        })
    }
}

#[async_trait]
impl v201::availability::CsmsHandler for V201Handler {
    async fn on_status_notification(
        &self,
        station_id: &str,
        req: v201::availability::StatusNotificationRequest,
    ) -> HandlerResult<v201::availability::StatusNotificationResponse> {
        info!(
            charge_point_id = station_id,
            evse_id = req.evse_id,
            connector_id = req.connector_id,
            status = ?req.connector_status,
            "Status notification"
        );
        Ok(v201::availability::StatusNotificationResponse {})
    }
}

#[async_trait]
impl v201::data::CsmsHandler for V201Handler {
    async fn on_data_transfer(
        &self,
        station_id: &str,
        req: v201::data::DataTransferRequest,
    ) -> HandlerResult<v201::data::DataTransferResponse> {
        info!(charge_point_id = station_id, vendor_id = %req.vendor_id, "Data transfer");
        Ok(v201::data::DataTransferResponse {
            status: v201::data::DataTransferStatus::UnknownVendorId,
            data: None,
            status_info: None,
        })
    }
}
