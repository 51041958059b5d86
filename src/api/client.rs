//! Authenticated Proxmox API client
//!
//! The client picks the first configured endpoint that answers a probe,
//! authenticates once (API token preferred, ticket login otherwise), and
//! exposes the typed operations the rest of the tool needs. Read operations
//! retry transport failures per the configured policy; migration dispatch is
//! never retried, a duplicate migration being worse than a missed one.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::endpoint::{self, Endpoint};
use super::types::{
    ApiGuest, ApiNode, ApiResponse, GuestConfig, HaStatusEntry, MigrateOptions, PoolInfo,
    RrdSample, TaskRef, TaskStatusInfo, Upid, VersionInfo,
};
use crate::config::ProxmoxApiSettings;
use crate::inventory::model::GuestKind;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("unexpected payload: {0}")]
    Decode(String),

    #[error("no reachable API endpoint")]
    NoEndpoint,
}

/// A guest as listed on a node, together with its kind.
#[derive(Debug, Clone)]
pub struct GuestListing {
    pub kind: GuestKind,
    pub info: ApiGuest,
}

/// The operations the balancer needs from the hypervisor API.
///
/// Implemented by [`ProxmoxClient`] for production and by in-memory mocks in
/// tests.
#[async_trait]
pub trait ProxmoxApi: Send + Sync {
    async fn version(&self) -> Result<VersionInfo, ApiError>;

    async fn list_nodes(&self) -> Result<Vec<ApiNode>, ApiError>;

    /// All guests on a node, VMs and CTs alike.
    async fn list_guests(&self, node: &str) -> Result<Vec<GuestListing>, ApiError>;

    async fn guest_config(
        &self,
        kind: GuestKind,
        node: &str,
        vmid: u32,
    ) -> Result<GuestConfig, ApiError>;

    /// Hour-window RRD samples for a guest.
    async fn guest_rrd(
        &self,
        kind: GuestKind,
        node: &str,
        vmid: u32,
    ) -> Result<Vec<RrdSample>, ApiError>;

    async fn ha_status(&self) -> Result<Vec<HaStatusEntry>, ApiError>;

    /// Member vmids of a resource pool.
    async fn pool_members(&self, pool: &str) -> Result<Vec<u32>, ApiError>;

    /// Dispatch a migration and return its task id (UPID).
    async fn migrate(
        &self,
        kind: GuestKind,
        node: &str,
        vmid: u32,
        target: &str,
        options: &MigrateOptions,
    ) -> Result<String, ApiError>;

    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatusInfo, ApiError>;

    /// Migration worker tasks spawned on behalf of `upid` (HA wrapping).
    async fn task_children(&self, node: &str, upid: &str) -> Result<Vec<TaskRef>, ApiError>;
}

#[derive(Debug)]
enum AuthHeaders {
    /// `Authorization: PVEAPIToken=user@realm!name=secret`
    Token(String),
    /// Ticket cookie plus CSRF token for mutating requests.
    Ticket { cookie: String, csrf: String },
}

/// Production client speaking to one selected endpoint.
#[derive(Debug)]
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    auth: AuthHeaders,
    retries: u32,
    wait_time: Duration,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

impl ProxmoxClient {
    /// Probe the configured endpoints, authenticate, and return a ready
    /// client. The first endpoint that answers within the timeout is used
    /// for the whole cycle.
    pub async fn connect(settings: &ProxmoxApiSettings) -> Result<Self, ApiError> {
        if !settings.ssl_verification {
            warn!("SSL certificate verification is disabled");
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout))
            .danger_accept_invalid_certs(!settings.ssl_verification)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let endpoint = select_endpoint(&http, settings).await?;
        let base_url = endpoint.base_url();
        debug!("Using API endpoint {endpoint}");

        let auth = login(&http, &base_url, settings).await?;

        Ok(Self {
            http,
            base_url,
            auth,
            retries: settings.retries,
            wait_time: Duration::from_secs(settings.wait_time),
        })
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder, mutating: bool) -> reqwest::RequestBuilder {
        match &self.auth {
            AuthHeaders::Token(header) => request.header("Authorization", header.clone()),
            AuthHeaders::Ticket { cookie, csrf } => {
                let request = request.header("Cookie", format!("PVEAuthCookie={cookie}"));
                if mutating {
                    request.header("CSRFPreventionToken", csrf.clone())
                } else {
                    request
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = ApiError::NoEndpoint;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                sleep(self.wait_time).await;
                debug!("Retrying GET {path} (attempt {})", attempt + 1);
            }
            let request = self.apply_auth(self.http.get(&url), false);
            match request.send().await {
                Ok(response) => return decode_response(response).await,
                Err(e) => last_error = ApiError::Transport(e.to_string()),
            }
        }
        Err(last_error)
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let request = self.apply_auth(self.http.post(&url), true).form(form);
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        decode_response(response).await
    }

    fn kind_path(kind: GuestKind) -> &'static str {
        match kind {
            GuestKind::Vm => "qemu",
            GuestKind::Ct => "lxc",
        }
    }
}

/// Probe endpoints in configured order, retrying the whole list per policy.
/// Any HTTP response counts as reachable, an auth challenge included; only
/// transport failures disqualify an endpoint.
async fn select_endpoint(
    http: &reqwest::Client,
    settings: &ProxmoxApiSettings,
) -> Result<Endpoint, ApiError> {
    for attempt in 0..=settings.retries {
        if attempt > 0 {
            sleep(Duration::from_secs(settings.wait_time)).await;
            debug!("Retrying endpoint probe (attempt {})", attempt + 1);
        }
        for spec in &settings.hosts {
            let endpoint = match endpoint::parse(spec) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!("Skipping endpoint '{spec}': {e}");
                    continue;
                }
            };
            let url = format!("{}/version", endpoint.base_url());
            match http.get(&url).send().await {
                Ok(_) => return Ok(endpoint),
                Err(e) => debug!("Endpoint {endpoint} did not answer: {e}"),
            }
        }
    }
    Err(ApiError::NoEndpoint)
}

/// Build the authentication state. A configured token wins over a password;
/// password login obtains a ticket and CSRF token from the API.
async fn login(
    http: &reqwest::Client,
    base_url: &str,
    settings: &ProxmoxApiSettings,
) -> Result<AuthHeaders, ApiError> {
    if let (Some(token_id), Some(secret)) = (&settings.token_id, &settings.token_secret) {
        if settings.pass.is_some() {
            warn!("Token and password both configured; using the token");
        }
        let header = format!("PVEAPIToken={}!{}={}", settings.user, token_id, secret);
        return Ok(AuthHeaders::Token(header));
    }

    let pass = settings
        .pass
        .as_ref()
        .ok_or_else(|| ApiError::Auth("no credentials configured".to_string()))?;

    let url = format!("{base_url}/access/ticket");
    let response = http
        .post(&url)
        .form(&[("username", settings.user.as_str()), ("password", pass.as_str())])
        .send()
        .await
        .map_err(|e| ApiError::Transport(e.to_string()))?;
    let ticket: TicketData = decode_response(response).await?;

    Ok(AuthHeaders::Ticket { cookie: ticket.ticket, csrf: ticket.csrf_token })
}

async fn decode_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::Auth(format!("HTTP {status}: {message}")));
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::Api { status: status.as_u16(), message });
    }
    let body: ApiResponse<T> = response
        .json()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))?;
    Ok(body.data)
}

#[async_trait]
impl ProxmoxApi for ProxmoxClient {
    async fn version(&self) -> Result<VersionInfo, ApiError> {
        self.get_json("/version").await
    }

    async fn list_nodes(&self) -> Result<Vec<ApiNode>, ApiError> {
        self.get_json("/nodes").await
    }

    async fn list_guests(&self, node: &str) -> Result<Vec<GuestListing>, ApiError> {
        let vms: Vec<ApiGuest> = self.get_json(&format!("/nodes/{node}/qemu")).await?;
        let cts: Vec<ApiGuest> = self.get_json(&format!("/nodes/{node}/lxc")).await?;

        let mut listings: Vec<GuestListing> = vms
            .into_iter()
            .map(|info| GuestListing { kind: GuestKind::Vm, info })
            .collect();
        listings.extend(
            cts.into_iter()
                .map(|info| GuestListing { kind: GuestKind::Ct, info }),
        );
        Ok(listings)
    }

    async fn guest_config(
        &self,
        kind: GuestKind,
        node: &str,
        vmid: u32,
    ) -> Result<GuestConfig, ApiError> {
        let path = format!("/nodes/{node}/{}/{vmid}/config", Self::kind_path(kind));
        self.get_json(&path).await
    }

    async fn guest_rrd(
        &self,
        kind: GuestKind,
        node: &str,
        vmid: u32,
    ) -> Result<Vec<RrdSample>, ApiError> {
        let path = format!(
            "/nodes/{node}/{}/{vmid}/rrddata?timeframe=hour&cf=AVERAGE",
            Self::kind_path(kind)
        );
        self.get_json(&path).await
    }

    async fn ha_status(&self) -> Result<Vec<HaStatusEntry>, ApiError> {
        self.get_json("/cluster/ha/status/current").await
    }

    async fn pool_members(&self, pool: &str) -> Result<Vec<u32>, ApiError> {
        let info: PoolInfo = self.get_json(&format!("/pools/{pool}")).await?;
        Ok(info.members.into_iter().filter_map(|m| m.vmid).collect())
    }

    async fn migrate(
        &self,
        kind: GuestKind,
        node: &str,
        vmid: u32,
        target: &str,
        options: &MigrateOptions,
    ) -> Result<String, ApiError> {
        let path = format!("/nodes/{node}/{}/{vmid}/migrate", Self::kind_path(kind));
        let mut form: Vec<(&str, String)> = vec![("target", target.to_string())];

        match kind {
            GuestKind::Vm => {
                form.push(("online", bool_flag(options.online)));
                if options.with_local_disks {
                    form.push(("with-local-disks", bool_flag(true)));
                }
                if options.with_conntrack_state {
                    form.push(("with-conntrack-state", bool_flag(true)));
                }
            }
            GuestKind::Ct => {
                if options.restart {
                    form.push(("restart", bool_flag(true)));
                }
            }
        }

        self.post_form(&path, &form).await
    }

    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatusInfo, ApiError> {
        self.get_json(&format!("/nodes/{node}/tasks/{upid}/status")).await
    }

    async fn task_children(&self, node: &str, upid: &str) -> Result<Vec<TaskRef>, ApiError> {
        let parent = Upid::parse(upid)
            .ok_or_else(|| ApiError::Decode(format!("unparseable task id '{upid}'")))?;
        let tasks: Vec<TaskRef> = self.get_json(&format!("/nodes/{node}/tasks?limit=100")).await?;

        Ok(tasks
            .into_iter()
            .filter(|t| {
                t.upid != upid
                    && t.id.as_deref() == Some(parent.id.as_str())
                    && t.task_type.ends_with("migrate")
            })
            .collect())
    }
}

fn bool_flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}
