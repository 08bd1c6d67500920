use crate::{CirrusError, Result, config::EnvConfig, log_debug};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::Value;
use sha1::Sha1;

/// Async-job terminal states as reported by queryAsyncJobResult.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Succeeded(Value),
    Failed { code: i64, text: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "instancename")]
    pub instance_name: String,
    /// Name of the compute host the VM is placed on (absent when stopped).
    #[serde(rename = "hostname", default)]
    pub host_name: Option<String>,
    #[serde(rename = "zoneid")]
    pub zone_id: String,
    #[serde(rename = "domainid")]
    pub domain_id: String,
    #[serde(default)]
    pub account: String,
    #[serde(rename = "serviceofferingid")]
    pub service_offering_id: String,
    #[serde(rename = "serviceofferingname", default)]
    pub service_offering_name: String,
    #[serde(rename = "templatename", default)]
    pub template_name: String,
    #[serde(default)]
    pub nic: Vec<NicRecord>,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NicRecord {
    #[serde(rename = "ipaddress", default)]
    pub ip_address: Option<String>,
    #[serde(rename = "networkid")]
    pub network_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "ipaddress")]
    pub ip_address: String,
    /// Hypervisor-agent version; drives the expected disk image format.
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedRecord {
    pub id: String,
    pub name: String,
}

/// Deploy request, validated at construction instead of at the control
/// plane. The two branches are mutually exclusive: either the migrated VM
/// keeps the source identity wholesale, or every placement field is
/// resolved from scratch for the new name.
#[derive(Debug, Clone, PartialEq)]
pub enum DeploySpec {
    SameIdentity {
        name: String,
        account: String,
        template_id: String,
        host_id: String,
        ip_address: String,
        domain_id: String,
        network_id: String,
        zone_id: String,
        service_offering_id: String,
    },
    NewIdentity {
        name: String,
        account: String,
        template_id: String,
        host_id: String,
        domain_id: String,
        network_id: String,
        zone_id: String,
        service_offering_id: String,
    },
}

impl DeploySpec {
    pub fn params(&self) -> Vec<(String, String)> {
        match self {
            DeploySpec::SameIdentity {
                name,
                account,
                template_id,
                host_id,
                ip_address,
                domain_id,
                network_id,
                zone_id,
                service_offering_id,
            } => vec![
                ("name".into(), name.clone()),
                ("account".into(), account.clone()),
                ("templateid".into(), template_id.clone()),
                ("hostid".into(), host_id.clone()),
                ("ipaddress".into(), ip_address.clone()),
                ("domainid".into(), domain_id.clone()),
                ("networkids".into(), network_id.clone()),
                ("zoneid".into(), zone_id.clone()),
                ("serviceofferingid".into(), service_offering_id.clone()),
            ],
            DeploySpec::NewIdentity {
                name,
                account,
                template_id,
                host_id,
                domain_id,
                network_id,
                zone_id,
                service_offering_id,
            } => vec![
                ("name".into(), name.clone()),
                ("account".into(), account.clone()),
                ("templateid".into(), template_id.clone()),
                ("hostid".into(), host_id.clone()),
                ("domainid".into(), domain_id.clone()),
                ("networkids".into(), network_id.clone()),
                ("zoneid".into(), zone_id.clone()),
                ("serviceofferingid".into(), service_offering_id.clone()),
            ],
        }
    }
}

/// The slice of the control-plane API the migration workflow consumes.
/// Lifecycle calls are not idempotent: retrying a deploy creates a second
/// VM, so callers must never re-issue a call whose job already started.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Exact-name VM listing within the client's configured zone/domain.
    async fn list_vms(&self, name: &str) -> Result<Vec<VmRecord>>;
    async fn list_hosts(&self, name: &str, zone_id: &str) -> Result<Vec<HostRecord>>;
    async fn fetch_zone(&self, name: &str) -> Result<Option<NamedRecord>>;
    async fn fetch_domain(&self, name: &str) -> Result<Option<NamedRecord>>;
    async fn fetch_network(&self, domain_id: &str, name: &str) -> Result<Option<NamedRecord>>;
    async fn fetch_template(&self, name: &str) -> Result<Option<NamedRecord>>;
    async fn fetch_service_offering(&self, name: &str) -> Result<Option<NamedRecord>>;
    async fn stop_vm(&self, id: &str) -> Result<String>;
    async fn start_vm(&self, id: &str) -> Result<String>;
    async fn destroy_vm(&self, id: &str) -> Result<String>;
    async fn deploy_vm(&self, spec: &DeploySpec) -> Result<String>;
    /// Single non-blocking status check; the wait loop lives in the caller.
    async fn query_job(&self, job_id: &str) -> Result<JobStatus>;
}

// Everything except unreserved characters gets percent-encoded in the
// signature base string, matching the server's own canonicalization.
const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

type HmacSha1 = Hmac<Sha1>;

/// Thin typed facade over the CloudStack HTTP API. Requests are signed
/// GETs: sorted lowercased query string, HMAC-SHA1 over it with the
/// account secret, base64-encoded signature parameter.
pub struct CloudStackClient {
    api_url: String,
    api_key: String,
    secret: String,
    pub zone: String,
    pub account: String,
    pub domain: String,
    http: reqwest::Client,
}

impl CloudStackClient {
    pub fn new(env: &EnvConfig) -> Self {
        Self {
            api_url: env.api_url.clone(),
            api_key: env.api_key.clone(),
            secret: env.secret.clone(),
            zone: env.zone.clone(),
            account: env.account.clone(),
            domain: env.domain.clone(),
            http: reqwest::Client::new(),
        }
    }

    fn signature_base(params: &[(String, String)]) -> String {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));
        sorted
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    k.to_lowercase(),
                    utf8_percent_encode(v, QUERY_ENCODE).to_string().to_lowercase()
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    fn sign(&self, params: &[(String, String)]) -> Result<String> {
        let base = Self::signature_base(params);
        let mut mac = HmacSha1::new_from_slice(self.secret.as_bytes())
            .map_err(|e| CirrusError::ApiError(format!("signing key rejected: {}", e)))?;
        mac.update(base.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn api_call(&self, command: &str, args: Vec<(String, String)>) -> Result<Value> {
        let mut params = args;
        params.push(("command".into(), command.to_string()));
        params.push(("apiKey".into(), self.api_key.clone()));
        params.push(("response".into(), "json".to_string()));
        let signature = self.sign(&params)?;
        params.push(("signature".into(), signature));

        log_debug!("API call: {}", command);
        let response = self.http.get(&self.api_url).query(&params).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;

        // The envelope key varies per command ("listhostsresponse" etc.);
        // unwrap the single top-level object.
        let inner = body
            .as_object()
            .and_then(|o| o.values().next())
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(text) = inner.get("errortext").and_then(Value::as_str) {
            return Err(CirrusError::ApiError(format!("{}: {}", command, text)));
        }
        if !status.is_success() {
            return Err(CirrusError::ApiError(format!(
                "{} returned HTTP {}",
                command, status
            )));
        }
        Ok(inner)
    }

    fn records<T: serde::de::DeserializeOwned>(inner: &Value, key: &str) -> Result<Vec<T>> {
        match inner.get(key) {
            Some(list) => Ok(serde_json::from_value(list.clone())?),
            None => Ok(Vec::new()),
        }
    }

    fn job_id(inner: &Value, command: &str) -> Result<String> {
        inner
            .get("jobid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CirrusError::ApiError(format!("{} returned no job id", command)))
    }

    async fn named_lookup(
        &self,
        command: &str,
        key: &str,
        args: Vec<(String, String)>,
        matches: impl Fn(&NamedRecord) -> bool,
    ) -> Result<Option<NamedRecord>> {
        let inner = self.api_call(command, args).await?;
        let records: Vec<NamedRecord> = Self::records(&inner, key)?;
        Ok(records.into_iter().find(matches))
    }
}

#[async_trait]
impl ControlPlane for CloudStackClient {
    async fn list_vms(&self, name: &str) -> Result<Vec<VmRecord>> {
        let zone = self.fetch_zone(self.zone.as_str()).await?.ok_or_else(|| {
            CirrusError::ConfigError(format!("configured zone '{}' not found", self.zone))
        })?;
        let domain = self
            .fetch_domain(self.domain.as_str())
            .await?
            .ok_or_else(|| {
                CirrusError::ConfigError(format!("configured domain '{}' not found", self.domain))
            })?;
        let inner = self
            .api_call(
                "listVirtualMachines",
                vec![
                    ("listall".into(), "true".into()),
                    ("zoneid".into(), zone.id),
                    ("domainid".into(), domain.id),
                ],
            )
            .await?;
        let vms: Vec<VmRecord> = Self::records(&inner, "virtualmachine")?;
        Ok(vms.into_iter().filter(|vm| vm.name == name).collect())
    }

    async fn list_hosts(&self, name: &str, zone_id: &str) -> Result<Vec<HostRecord>> {
        let inner = self
            .api_call(
                "listHosts",
                vec![
                    ("listall".into(), "true".into()),
                    ("zoneid".into(), zone_id.to_string()),
                ],
            )
            .await?;
        let hosts: Vec<HostRecord> = Self::records(&inner, "host")?;
        let short = name.split('.').next().unwrap_or(name);
        Ok(hosts
            .into_iter()
            .filter(|h| h.name == name || h.name == short)
            .collect())
    }

    async fn fetch_zone(&self, name: &str) -> Result<Option<NamedRecord>> {
        let name = name.to_string();
        self.named_lookup(
            "listZones",
            "zone",
            vec![("listall".into(), "true".into())],
            move |z| z.name.contains(&name),
        )
        .await
    }

    async fn fetch_domain(&self, name: &str) -> Result<Option<NamedRecord>> {
        let name = name.to_string();
        self.named_lookup(
            "listDomains",
            "domain",
            vec![("listall".into(), "true".into())],
            move |d| d.name.contains(&name),
        )
        .await
    }

    async fn fetch_network(&self, domain_id: &str, name: &str) -> Result<Option<NamedRecord>> {
        let name = name.to_string();
        self.named_lookup(
            "listNetworks",
            "network",
            vec![("domainid".into(), domain_id.to_string())],
            move |n| n.name.contains(&name),
        )
        .await
    }

    async fn fetch_template(&self, name: &str) -> Result<Option<NamedRecord>> {
        for filter in ["featured", "self", "self-executable", "executable", "community"] {
            let found = self
                .named_lookup(
                    "listTemplates",
                    "template",
                    vec![
                        ("listall".into(), "true".into()),
                        ("templatefilter".into(), filter.to_string()),
                    ],
                    |t| t.name == name,
                )
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    async fn fetch_service_offering(&self, name: &str) -> Result<Option<NamedRecord>> {
        let name = name.to_string();
        self.named_lookup(
            "listServiceOfferings",
            "serviceoffering",
            vec![("listall".into(), "true".into())],
            move |s| s.name == name,
        )
        .await
    }

    async fn stop_vm(&self, id: &str) -> Result<String> {
        let inner = self
            .api_call("stopVirtualMachine", vec![("id".into(), id.to_string())])
            .await?;
        Self::job_id(&inner, "stopVirtualMachine")
    }

    async fn start_vm(&self, id: &str) -> Result<String> {
        let inner = self
            .api_call("startVirtualMachine", vec![("id".into(), id.to_string())])
            .await?;
        Self::job_id(&inner, "startVirtualMachine")
    }

    async fn destroy_vm(&self, id: &str) -> Result<String> {
        let inner = self
            .api_call("destroyVirtualMachine", vec![("id".into(), id.to_string())])
            .await?;
        Self::job_id(&inner, "destroyVirtualMachine")
    }

    async fn deploy_vm(&self, spec: &DeploySpec) -> Result<String> {
        let inner = self.api_call("deployVirtualMachine", spec.params()).await?;
        Self::job_id(&inner, "deployVirtualMachine")
    }

    async fn query_job(&self, job_id: &str) -> Result<JobStatus> {
        let inner = self
            .api_call(
                "queryAsyncJobResult",
                vec![("jobid".into(), job_id.to_string())],
            )
            .await?;
        let status = inner.get("jobstatus").and_then(Value::as_i64).unwrap_or(0);
        match status {
            0 => Ok(JobStatus::Pending),
            1 => Ok(JobStatus::Succeeded(
                inner.get("jobresult").cloned().unwrap_or(Value::Null),
            )),
            _ => {
                let result = inner.get("jobresult").cloned().unwrap_or(Value::Null);
                let code = result.get("errorcode").and_then(Value::as_i64).unwrap_or(-1);
                let text = result
                    .get("errortext")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown control-plane error")
                    .to_string();
                Ok(JobStatus::Failed { code, text })
            }
        }
    }
}
