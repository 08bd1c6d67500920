use crate::{
    CirrusError, Result,
    cloudstack::{ControlPlane, DeploySpec, HostRecord, JobStatus, VmRecord},
    config::{EnvConfig, WaitConfig},
    hostname::HostName,
    image,
    log_debug, log_info, log_warn,
    session::{RemoteSession, SessionFactory, run_checked},
    transfer::{self, ArchiveHandle},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, Instant, sleep};
use uuid::Uuid;

/// One migration invocation. Immutable once built.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    /// FQDN of the VM to relocate.
    pub vm_fqdn: String,
    /// Destination compute-node name.
    pub destination_host: String,
    /// Redeploy under this FQDN instead of the source identity.
    pub new_hostname: Option<String>,
    /// Compress the archive during transfer.
    pub compress: bool,
    /// Restart the source VM instead of destroying it.
    pub keep_source: bool,
    pub debug: bool,
}

impl MigrationRequest {
    /// A running source and a running destination cannot share one
    /// control-plane identity, so keeping the source requires a new one.
    pub fn validate(&self) -> Result<()> {
        if self.keep_source && self.new_hostname.is_none() {
            return Err(CirrusError::InvalidRequest(
                "cannot keep the source VM without a new hostname & IP".to_string(),
            ));
        }
        Ok(())
    }
}

/// Workflow states, strictly linear. `ConvertFormat`, `AdoptNetworkIdentity`
/// and `PostBoot` are skipped when not applicable; everything else always
/// runs. A failure terminates the run tagged with the current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationStage {
    Discover,
    StopSource,
    ResolveImage,
    DetectFormat,
    ConvertFormat,
    ArchiveSource,
    Transfer,
    RetireSource,
    DeployDestination,
    ExtractImage,
    AdoptNetworkIdentity,
    InstallVolume,
    StartDestination,
    AwaitReachable,
    PostBoot,
    Cleanup,
    Completed,
}

impl MigrationStage {
    /// The single allowed successor of each state.
    pub fn successor(self) -> Option<MigrationStage> {
        use MigrationStage::*;
        match self {
            Discover => Some(StopSource),
            StopSource => Some(ResolveImage),
            ResolveImage => Some(DetectFormat),
            DetectFormat => Some(ConvertFormat),
            ConvertFormat => Some(ArchiveSource),
            ArchiveSource => Some(Transfer),
            Transfer => Some(RetireSource),
            RetireSource => Some(DeployDestination),
            DeployDestination => Some(ExtractImage),
            ExtractImage => Some(AdoptNetworkIdentity),
            AdoptNetworkIdentity => Some(InstallVolume),
            InstallVolume => Some(StartDestination),
            StartDestination => Some(AwaitReachable),
            AwaitReachable => Some(PostBoot),
            PostBoot => Some(Cleanup),
            Cleanup => Some(Completed),
            Completed => None,
        }
    }
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceDisposition {
    Destroyed,
    Restarted,
}

/// Terminal record of a completed migration.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub run_id: Uuid,
    /// Stages actually entered, in order.
    pub stages: Vec<MigrationStage>,
    pub source: SourceDisposition,
    pub destination_running: bool,
    /// Address the migrated guest answered on.
    pub address: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Poll intervals and deadlines. The reference tooling waited forever;
/// the deadlines here surface a wedged control plane as DeadlineExceeded.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub job_poll: Duration,
    pub job_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub expunge_grace: Duration,
}

impl From<&WaitConfig> for WaitPolicy {
    fn from(config: &WaitConfig) -> Self {
        Self {
            job_poll: Duration::from_secs(config.job_poll_secs),
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            probe_interval: Duration::from_secs(config.probe_interval_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            expunge_grace: Duration::from_secs(config.expunge_grace_secs),
        }
    }
}

/// Network-layer reachability check, injectable for tests.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self, address: &str, port: u16) -> bool;
}

pub struct TcpProbe;

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self, address: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                Duration::from_secs(1),
                tokio::net::TcpStream::connect((address, port)),
            )
            .await,
            Ok(Ok(_))
        )
    }
}

/// Identity material of one control-plane environment, resolved from
/// configuration. The deploy branch uses these names for its lookups.
#[derive(Debug, Clone)]
pub struct EnvIdentity {
    pub zone: String,
    pub account: String,
    pub domain: String,
    pub network: String,
}

impl From<&EnvConfig> for EnvIdentity {
    fn from(env: &EnvConfig) -> Self {
        Self {
            zone: env.zone.clone(),
            account: env.account.clone(),
            domain: env.domain.clone(),
            network: env.network.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub source_env: EnvIdentity,
    /// Environment for the new identity; required when the request carries
    /// a new hostname.
    pub target_env: Option<EnvIdentity>,
    /// Agent version -> image format name.
    pub formats: HashMap<String, String>,
    pub image_dir: String,
    pub transfer_key: String,
    pub waits: WaitPolicy,
    pub post_boot: Option<String>,
}

/// Sequences a whole migration: stop, convert, archive, transfer, retire,
/// redeploy, install the moved volume, start, verify reachability. One
/// migration per orchestrator; no automatic rollback — any fatal condition
/// halts the run with a stage-tagged error and remote state is left as of
/// the last completed stage for operator inspection.
pub struct MigrationOrchestrator {
    request: MigrationRequest,
    cloud: Arc<dyn ControlPlane>,
    target_cloud: Option<Arc<dyn ControlPlane>>,
    sessions: Arc<dyn SessionFactory>,
    probe: Arc<dyn ReachabilityProbe>,
    settings: MigrationSettings,
    cancel: Arc<AtomicBool>,
    stage: MigrationStage,
    trace: Vec<MigrationStage>,
}

impl MigrationOrchestrator {
    pub fn new(
        request: MigrationRequest,
        cloud: Arc<dyn ControlPlane>,
        target_cloud: Option<Arc<dyn ControlPlane>>,
        sessions: Arc<dyn SessionFactory>,
        probe: Arc<dyn ReachabilityProbe>,
        settings: MigrationSettings,
    ) -> Result<Self> {
        request.validate()?;
        if request.new_hostname.is_some()
            && (target_cloud.is_none() || settings.target_env.is_none())
        {
            return Err(CirrusError::InvalidRequest(
                "a new hostname requires a target environment client".to_string(),
            ));
        }
        Ok(Self {
            request,
            cloud,
            target_cloud,
            sessions,
            probe,
            settings,
            cancel: Arc::new(AtomicBool::new(false)),
            stage: MigrationStage::Discover,
            trace: Vec::new(),
        })
    }

    /// Shared flag checked at every stage boundary. Setting it aborts the
    /// workflow before the next stage starts; the current stage is never
    /// interrupted mid-flight.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> Result<MigrationOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        log_info!(
            "migration {}: '{}' -> '{}'",
            run_id,
            self.request.vm_fqdn,
            self.request.destination_host
        );
        match self.execute().await {
            Ok((source, address)) => Ok(MigrationOutcome {
                run_id,
                stages: self.trace,
                source,
                destination_running: true,
                address,
                started_at,
                completed_at: Utc::now(),
            }),
            Err(e) => {
                let wrapped = match e {
                    wrapped @ CirrusError::StageFailed { .. } => wrapped,
                    other => CirrusError::StageFailed {
                        stage: self.stage.to_string(),
                        source: Box::new(other),
                    },
                };
                log_warn!("migration {} halted: {}", run_id, wrapped);
                Err(wrapped)
            }
        }
    }

    fn enter(&mut self, stage: MigrationStage) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(CirrusError::Cancelled(stage.to_string()));
        }
        self.stage = stage;
        self.trace.push(stage);
        log_info!("stage: {}", stage);
        Ok(())
    }

    async fn execute(&mut self) -> Result<(SourceDisposition, Option<String>)> {
        let source_name = HostName::new(&self.request.vm_fqdn);
        let new_identity = self.request.new_hostname.clone().map(|h| HostName::new(&h));
        let (deploy_cloud, deploy_env) = match (
            &new_identity,
            &self.target_cloud,
            &self.settings.target_env,
        ) {
            (Some(_), Some(cloud), Some(env)) => (cloud.clone(), env.clone()),
            _ => (self.cloud.clone(), self.settings.source_env.clone()),
        };

        // -- Discover ----------------------------------------------------
        self.enter(MigrationStage::Discover)?;
        let source_vm = self.single_vm(&self.cloud.clone(), source_name.short_name()).await?;
        log_info!(
            "found VM {} (id {}) on host {:?}",
            source_vm.name,
            source_vm.id,
            source_vm.host_name
        );

        let dest_zone_id = if new_identity.is_some() {
            self.require_named(
                deploy_cloud.fetch_zone(&deploy_env.zone).await?,
                &deploy_env.zone,
            )?
            .id
        } else {
            source_vm.zone_id.clone()
        };
        let dest_host = self
            .single_host(&deploy_cloud, &self.request.destination_host.clone(), &dest_zone_id)
            .await?;

        let source_host_name = source_vm.host_name.clone().ok_or_else(|| {
            CirrusError::Precondition(
                "source VM is not placed on any host; make sure it is running".to_string(),
            )
        })?;
        let source_host = self
            .single_host(&self.cloud.clone(), &source_host_name, &source_vm.zone_id)
            .await?;

        // Policy precondition, checked before anything destructive.
        let expected = image::expected_format(&self.settings.formats, &dest_host.version)?;

        let mut source_session = self.sessions.connect(&source_host.ip_address).await?;

        // Disk-count validation belongs to ResolveImage but must precede
        // the stop call: a multi-disk VM is rejected before any mutation.
        self.stage = MigrationStage::ResolveImage;
        let image_path =
            image::resolve_primary_disk(source_session.as_mut(), &source_vm.instance_name).await?;
        self.stage = MigrationStage::Discover;

        // -- StopSource --------------------------------------------------
        self.enter(MigrationStage::StopSource)?;
        let job = self.cloud.stop_vm(&source_vm.id).await?;
        self.await_job(&self.cloud.clone(), &job, "stopping the source VM")
            .await?;

        // -- ResolveImage ------------------------------------------------
        self.enter(MigrationStage::ResolveImage)?;
        log_info!("primary disk: {}", image_path);

        // -- DetectFormat ------------------------------------------------
        self.enter(MigrationStage::DetectFormat)?;
        let mut artifact = image::inspect(source_session.as_mut(), &image_path).await?;
        log_info!("image format: {}", artifact.format);
        if let Some(backing) = &artifact.backing_file {
            log_info!("backing file: {}", backing);
        }

        // -- ConvertFormat (only on mismatch) ----------------------------
        let mut converted = false;
        if artifact.format != expected {
            self.enter(MigrationStage::ConvertFormat)?;
            artifact = image::convert(
                source_session.as_mut(),
                &self.settings.image_dir,
                &artifact,
                expected,
                self.request.keep_source,
            )
            .await?;
            converted = true;
        }

        // -- ArchiveSource -----------------------------------------------
        self.enter(MigrationStage::ArchiveSource)?;
        let handle = ArchiveHandle::new(source_vm.name.as_str(), &self.settings.image_dir);
        transfer::archive(source_session.as_mut(), &handle, artifact.file_name()).await?;

        // -- Transfer ----------------------------------------------------
        self.enter(MigrationStage::Transfer)?;
        transfer::transfer(
            source_session.as_mut(),
            &handle,
            &dest_host.ip_address,
            &self.settings.transfer_key,
            self.request.compress,
        )
        .await?;
        // Source-side archive is gone as soon as the transfer landed.
        transfer::cleanup(source_session.as_mut(), &handle).await;

        // -- RetireSource ------------------------------------------------
        self.enter(MigrationStage::RetireSource)?;
        let disposition = if self.request.keep_source {
            log_info!("restarting the source VM");
            let job = self.cloud.start_vm(&source_vm.id).await?;
            self.await_job(&self.cloud.clone(), &job, "restarting the source VM")
                .await?;
            SourceDisposition::Restarted
        } else {
            if converted {
                let aside = format!("{}.ori", artifact.file_name());
                transfer::remove_file(source_session.as_mut(), &self.settings.image_dir, &aside)
                    .await;
            }
            log_info!("destroying the source VM");
            let job = self.cloud.destroy_vm(&source_vm.id).await?;
            self.await_job(&self.cloud.clone(), &job, "destroying the source VM")
                .await?;
            self.expunge_countdown().await;
            SourceDisposition::Destroyed
        };
        if let Err(e) = source_session.close().await {
            log_warn!("closing source session: {}", e);
        }

        // -- DeployDestination -------------------------------------------
        self.enter(MigrationStage::DeployDestination)?;
        let deploy_name = new_identity.clone().unwrap_or_else(|| source_name.clone());
        let template = self.require_named(
            deploy_cloud.fetch_template(&source_vm.template_name).await?,
            &source_vm.template_name,
        )?;
        let spec = if new_identity.is_some() {
            let domain = self.require_named(
                deploy_cloud.fetch_domain(&deploy_env.domain).await?,
                &deploy_env.domain,
            )?;
            let network = self.require_named(
                deploy_cloud
                    .fetch_network(&domain.id, &deploy_env.network)
                    .await?,
                &deploy_env.network,
            )?;
            let zone = self.require_named(
                deploy_cloud.fetch_zone(&deploy_env.zone).await?,
                &deploy_env.zone,
            )?;
            let offering = self.require_named(
                deploy_cloud
                    .fetch_service_offering(&source_vm.service_offering_name)
                    .await?,
                &source_vm.service_offering_name,
            )?;
            DeploySpec::NewIdentity {
                name: deploy_name.short_name().to_string(),
                account: deploy_env.account.clone(),
                template_id: template.id,
                host_id: dest_host.id.clone(),
                domain_id: domain.id,
                network_id: network.id,
                zone_id: zone.id,
                service_offering_id: offering.id,
            }
        } else {
            let nic = source_vm.nic.first().ok_or_else(|| {
                CirrusError::Precondition("source VM has no network interface".to_string())
            })?;
            let ip_address = nic.ip_address.clone().ok_or_else(|| {
                CirrusError::Precondition("source VM interface has no IP address".to_string())
            })?;
            DeploySpec::SameIdentity {
                name: deploy_name.short_name().to_string(),
                account: source_vm.account.clone(),
                template_id: template.id,
                host_id: dest_host.id.clone(),
                ip_address,
                domain_id: source_vm.domain_id.clone(),
                network_id: nic.network_id.clone(),
                zone_id: source_vm.zone_id.clone(),
                service_offering_id: source_vm.service_offering_id.clone(),
            }
        };
        if self.request.debug {
            log_debug!("deploy spec: {:?}", spec);
        }
        let job = deploy_cloud.deploy_vm(&spec).await?;
        let result = self
            .await_job(&deploy_cloud, &job, "deploying the destination VM")
            .await?;
        let mut address = job_result_address(&result);
        log_info!(
            "'{}' has been rebuilt on '{}'",
            deploy_name.short_name(),
            dest_host.name
        );
        let new_vm = self
            .single_vm(&deploy_cloud, deploy_name.short_name())
            .await?;

        // -- ExtractImage ------------------------------------------------
        self.enter(MigrationStage::ExtractImage)?;
        let mut dest_session = self.sessions.connect(&dest_host.ip_address).await?;
        // The fresh deploy boots once to materialize its own disk; find it,
        // quiesce the VM, then unpack the migrated image next to it.
        let fresh_disk =
            image::resolve_primary_disk(dest_session.as_mut(), &new_vm.instance_name).await?;
        let job = deploy_cloud.stop_vm(&new_vm.id).await?;
        self.await_job(&deploy_cloud, &job, "stopping the destination VM")
            .await?;
        transfer::extract(dest_session.as_mut(), &handle).await?;
        let migrated_disk = format!(
            "{}/{}",
            self.settings.image_dir,
            artifact.file_name()
        );

        // -- AdoptNetworkIdentity (new identity only) --------------------
        if new_identity.is_some() {
            self.enter(MigrationStage::AdoptNetworkIdentity)?;
            adopt_guest_file(
                dest_session.as_mut(),
                &fresh_disk,
                &migrated_disk,
                "/var/lib/dhcp/dhclient.eth0.leases",
                "/var/lib/dhcp",
            )
            .await?;
            adopt_guest_file(
                dest_session.as_mut(),
                &fresh_disk,
                &migrated_disk,
                "/etc/hostname",
                "/etc",
            )
            .await?;
        }

        // -- InstallVolume -----------------------------------------------
        self.enter(MigrationStage::InstallVolume)?;
        run_checked(
            dest_session.as_mut(),
            &format!("mv -f {} {}", migrated_disk, fresh_disk),
        )
        .await?;

        // -- StartDestination --------------------------------------------
        self.enter(MigrationStage::StartDestination)?;
        let job = deploy_cloud.start_vm(&new_vm.id).await?;
        let result = self
            .await_job(&deploy_cloud, &job, "starting the destination VM")
            .await?;
        if let Some(started_address) = job_result_address(&result) {
            address = Some(started_address);
        }

        // -- AwaitReachable ----------------------------------------------
        self.enter(MigrationStage::AwaitReachable)?;
        let address = address.ok_or_else(|| {
            CirrusError::Precondition(
                "control plane reported no address for the migrated VM".to_string(),
            )
        })?;
        self.await_reachable(&address).await?;

        // -- PostBoot (when configured) ----------------------------------
        if let Some(command) = self.settings.post_boot.clone() {
            self.enter(MigrationStage::PostBoot)?;
            let mut guest = self.sessions.connect(&address).await?;
            run_checked(guest.as_mut(), &command).await?;
            if let Err(e) = guest.close().await {
                log_warn!("closing guest session: {}", e);
            }
        }

        // -- Cleanup -----------------------------------------------------
        self.enter(MigrationStage::Cleanup)?;
        transfer::cleanup(dest_session.as_mut(), &handle).await;
        if let Err(e) = dest_session.close().await {
            log_warn!("closing destination session: {}", e);
        }

        self.enter(MigrationStage::Completed)?;
        Ok((disposition, Some(address)))
    }

    async fn single_vm(&self, cloud: &Arc<dyn ControlPlane>, name: &str) -> Result<VmRecord> {
        let mut vms = cloud.list_vms(name).await?;
        if vms.len() != 1 {
            return Err(CirrusError::LookupAmbiguity {
                name: name.to_string(),
                count: vms.len(),
            });
        }
        vms.pop().ok_or_else(|| CirrusError::LookupAmbiguity {
            name: name.to_string(),
            count: 0,
        })
    }

    async fn single_host(
        &self,
        cloud: &Arc<dyn ControlPlane>,
        name: &str,
        zone_id: &str,
    ) -> Result<HostRecord> {
        let mut hosts = cloud.list_hosts(name, zone_id).await?;
        if hosts.len() != 1 {
            return Err(CirrusError::LookupAmbiguity {
                name: name.to_string(),
                count: hosts.len(),
            });
        }
        hosts.pop().ok_or_else(|| CirrusError::LookupAmbiguity {
            name: name.to_string(),
            count: 0,
        })
    }

    fn require_named(
        &self,
        record: Option<crate::cloudstack::NamedRecord>,
        name: &str,
    ) -> Result<crate::cloudstack::NamedRecord> {
        record.ok_or_else(|| CirrusError::LookupAmbiguity {
            name: name.to_string(),
            count: 0,
        })
    }

    /// Poll a job to its terminal state. Failed jobs surface the control
    /// plane's error text verbatim and are never retried.
    async fn await_job(
        &self,
        cloud: &Arc<dyn ControlPlane>,
        job_id: &str,
        what: &str,
    ) -> Result<Value> {
        let deadline = Instant::now() + self.settings.waits.job_timeout;
        loop {
            match cloud.query_job(job_id).await? {
                JobStatus::Pending => {
                    if Instant::now() >= deadline {
                        return Err(CirrusError::DeadlineExceeded(what.to_string()));
                    }
                    print!(".");
                    let _ = io::stdout().flush();
                    sleep(self.settings.waits.job_poll).await;
                }
                JobStatus::Succeeded(result) => {
                    println!();
                    return Ok(result);
                }
                JobStatus::Failed { code, text } => {
                    return Err(CirrusError::JobFailed {
                        job_id: job_id.to_string(),
                        code,
                        text,
                    });
                }
            }
        }
    }

    /// Grace period for the control plane to expunge the destroyed source
    /// before its network identity is reused.
    async fn expunge_countdown(&self) {
        let mut remaining = self.settings.waits.expunge_grace.as_secs() as i64;
        while remaining >= 0 {
            print!("\rWait for expunge ({} seconds) ", remaining);
            let _ = io::stdout().flush();
            sleep(Duration::from_secs(1)).await;
            remaining -= 1;
        }
        println!();
    }

    async fn await_reachable(&self, address: &str) -> Result<()> {
        log_info!("waiting for {} to answer on port 22", address);
        let deadline = Instant::now() + self.settings.waits.probe_timeout;
        while !self.probe.probe(address, 22).await {
            if Instant::now() >= deadline {
                return Err(CirrusError::DeadlineExceeded(format!(
                    "waiting for {} to become reachable",
                    address
                )));
            }
            print!(".");
            let _ = io::stdout().flush();
            sleep(self.settings.waits.probe_interval).await;
        }
        println!();
        Ok(())
    }
}

/// IP address assigned to the first interface in a job result payload.
fn job_result_address(result: &Value) -> Option<String> {
    result
        .get("virtualmachine")?
        .get("nic")?
        .get(0)?
        .get("ipaddress")?
        .as_str()
        .map(str::to_string)
}

/// Copy one file from the freshly-deployed disk into the migrated disk,
/// staging through /tmp on the compute host.
async fn adopt_guest_file(
    session: &mut dyn RemoteSession,
    fresh_disk: &str,
    migrated_disk: &str,
    guest_path: &str,
    guest_dir: &str,
) -> Result<()> {
    let file = guest_path.rsplit('/').next().unwrap_or(guest_path);
    run_checked(
        session,
        &format!("virt-copy-out -a {} {} /tmp", fresh_disk, guest_path),
    )
    .await?;
    run_checked(
        session,
        &format!("virt-copy-in -a {} /tmp/{} {}", migrated_disk, file, guest_dir),
    )
    .await?;
    Ok(())
}
