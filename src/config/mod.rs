//! Configuration Model
//!
//! One record holds every startup parameter of the combined sidecars, grouped
//! by concern. Flags are declared with clap against the fields directly, legacy
//! names are attached from the [`AliasMap`], and [`Configuration::finalize`]
//! validates the result before it is frozen behind an [`Arc`] and handed to
//! the controllers.

pub mod alias;
pub mod feature_gates;

pub use alias::{narrow_f32, Alias, AliasMap, Coercion, FlagValue, LEGACY_ALIASES};
pub use feature_gates::{FeatureGates, KNOWN_FEATURE_GATES};

use crate::controlplane::controllers::sidecar::CsiEndpoint;
use crate::error::{Error, Result};
use alias::FlagValue as V;
use clap::{ArgAction, Args, CommandFactory, FromArgMatches, Parser};
use serde::{Serialize, Serializer};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// Jitter factor client-go applies to the leader election retry period
const LEADER_ELECTION_JITTER_FACTOR: f64 = 1.2;

// =============================================================================
// Value Parsers
// =============================================================================

/// Parse a duration such as `10m`, `1m30s` or `500ms`. A bare `0` is accepted.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Parse a boolean the way Go's `strconv.ParseBool` does.
///
/// Accepts `1`, `t`, `T`, `TRUE`, `true`, `True` and their false
/// counterparts.
pub fn parse_go_bool(s: &str) -> std::result::Result<bool, String> {
    match s.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        other => Err(format!("invalid boolean {:?}", other)),
    }
}

/// Parse a log level name (`trace` .. `error`), case-insensitive
pub fn parse_log_level(s: &str) -> std::result::Result<Level, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("unknown log level {:?} (expected trace, debug, info, warn or error)", s))
}

/// Turn a Go-style listen address such as `:8080` into a socket address
pub fn parse_listen_address(addr: &str) -> Result<SocketAddr> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid diagnostics address {:?}: {}", addr, e)))
}

fn serialize_level<S>(level: &Level, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.collect_str(level)
}

pub(crate) fn serialize_duration<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.collect_str(&humantime::format_duration(*d))
}

// =============================================================================
// Shared Client Configuration
// =============================================================================

/// Parameters shared by every controller talking to the API server and the
/// CSI driver
#[derive(Args, Debug, Clone, Serialize)]
pub struct ClientConfig {
    /// Master URL to build a client config from. Either this or kubeconfig needs to be set if the provisioner is being run out of cluster.
    #[arg(long, default_value = "")]
    pub master: String,

    /// Absolute path to the kubeconfig file. Required only when running out of cluster.
    #[arg(long, default_value = "")]
    pub kubeconfig: String,

    /// The gRPC endpoint for Target CSI Volume.
    #[arg(long, default_value = "/run/csi/socket")]
    pub csi_address: String,

    /// Resync interval of the controller.
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub resync: Duration,

    /// Initial retry interval of failed create volume or deletion. It doubles with each failure, up to retry-interval-max.
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub retry_interval_start: Duration,

    /// Maximum retry interval of failed create volume or deletion.
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub retry_interval_max: Duration,

    /// QPS to use while communicating with the kubernetes apiserver.
    #[arg(long, default_value_t = 5.0)]
    pub kube_api_qps: f64,

    /// Burst to use while communicating with the kubernetes apiserver.
    #[arg(long, default_value_t = 10)]
    pub kube_api_burst: i32,
}

impl ClientConfig {
    /// `--kube-api-qps` as read by controllers that keep it as a 32-bit float
    pub fn kube_api_qps_f32(&self) -> f32 {
        narrow_f32(self.kube_api_qps)
    }
}

// =============================================================================
// Leader Election
// =============================================================================

/// Leader election tuning
#[derive(Args, Debug, Clone, Serialize)]
pub struct LeaderElectionConfig {
    /// Enable leader election.
    #[arg(
        long = "leader-election",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub enabled: bool,

    /// Namespace where the leader election resource lives. Defaults to the pod namespace if not set.
    #[arg(long = "leader-election-namespace", default_value = "")]
    pub namespace: String,

    /// Duration that non-leader candidates will wait to force acquire leadership.
    #[arg(long = "leader-election-lease-duration", default_value = "15s", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub lease_duration: Duration,

    /// Duration that the acting leader will retry refreshing leadership before giving up.
    #[arg(long = "leader-election-renew-deadline", default_value = "10s", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub renew_deadline: Duration,

    /// Duration the LeaderElector clients should wait between tries of actions.
    #[arg(long = "leader-election-retry-period", default_value = "5s", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.retry_period.is_zero() {
            return Err(Error::Configuration(
                "--leader-election-retry-period must be greater than zero".into(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::Configuration(format!(
                "--leader-election-lease-duration ({}) must be greater than --leader-election-renew-deadline ({})",
                humantime::format_duration(self.lease_duration),
                humantime::format_duration(self.renew_deadline),
            )));
        }
        if self.renew_deadline.as_secs_f64()
            <= LEADER_ELECTION_JITTER_FACTOR * self.retry_period.as_secs_f64()
        {
            return Err(Error::Configuration(format!(
                "--leader-election-renew-deadline ({}) must be greater than {} x --leader-election-retry-period ({})",
                humantime::format_duration(self.renew_deadline),
                LEADER_ELECTION_JITTER_FACTOR,
                humantime::format_duration(self.retry_period),
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Diagnostics HTTP endpoint parameters
#[derive(Args, Debug, Clone, Serialize)]
pub struct DiagnosticsConfig {
    /// The TCP network address where the HTTP server for diagnostics, including metrics and leader election health check, will listen (example: `:8080`). Empty disables the server. Only one of `--metrics-address` and `--http-endpoint` can be set.
    #[arg(long, default_value = "")]
    pub http_endpoint: String,

    /// (deprecated) The TCP network address where the prometheus metrics endpoint will listen (example: `:8080`). Only one of `--metrics-address` and `--http-endpoint` can be set.
    #[arg(long, default_value = "")]
    pub metrics_address: String,

    /// The HTTP path where prometheus metrics will be exposed.
    #[arg(long, default_value = "/metrics")]
    pub metrics_path: String,
}

impl DiagnosticsConfig {
    /// Address the diagnostics server should listen on, if enabled
    pub fn listen_address(&self) -> Option<&str> {
        [self.http_endpoint.as_str(), self.metrics_address.as_str()]
            .into_iter()
            .find(|addr| !addr.is_empty())
    }

    fn validate(&self) -> Result<()> {
        if !self.http_endpoint.is_empty() && !self.metrics_address.is_empty() {
            return Err(Error::Configuration(
                "only one of --metrics-address and --http-endpoint can be set".into(),
            ));
        }
        if !self.metrics_path.starts_with('/') {
            return Err(Error::Configuration(format!(
                "--metrics-path must start with '/', got {:?}",
                self.metrics_path
            )));
        }
        if let Some(addr) = self.listen_address() {
            parse_listen_address(addr)?;
        }
        if self.metrics_path == "/healthz" || self.metrics_path.starts_with("/healthz/") {
            return Err(Error::Configuration(
                "--metrics-path must not shadow the /healthz endpoint".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log output settings
#[derive(Args, Debug, Clone, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", value_parser = parse_log_level)]
    #[serde(serialize_with = "serialize_level")]
    pub log_level: Level,

    /// Number for the log level verbosity, as accepted by klog. Raises --log-level when more verbose.
    #[arg(short = 'v', long = "v", default_value_t = 0)]
    pub verbosity: u32,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl LoggingConfig {
    /// Most verbose of `--log-level` and `--v`
    pub fn max_level(&self) -> Level {
        let from_verbosity = match self.verbosity {
            0..=2 => Level::INFO,
            3..=4 => Level::DEBUG,
            _ => Level::TRACE,
        };
        self.log_level.max(from_verbosity)
    }
}

// =============================================================================
// Attacher
// =============================================================================

/// Flags of the attach/detach controller
#[derive(Args, Debug, Clone, Serialize)]
#[command(next_help_heading = "Attacher")]
pub struct AttacherConfig {
    /// The default filesystem type of the volume to use.
    #[arg(long = "attacher-default-fstype", default_value = "")]
    pub default_fstype: String,

    /// Number of attacher worker threads.
    #[arg(long = "attacher-worker-threads", default_value_t = 10)]
    pub worker_threads: usize,

    /// Timeout for waiting for attaching or detaching the volume.
    #[arg(long = "attacher-timeout", default_value = "15s", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub timeout: Duration,

    /// Max entries per each page in volume lister call, 0 means no limit.
    #[arg(long = "attacher-max-entries", default_value_t = 0, allow_negative_numbers = true)]
    pub max_entries: i32,

    /// Resync interval of the VolumeAttachment reconciler.
    #[arg(long = "attacher-reconcile-sync", default_value = "1m", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub reconcile_sync: Duration,

    /// The maximum amount of characters logged for every grpc responses. Defaults to no limit.
    #[arg(long = "attacher-max-grpc-log-length", default_value_t = -1, allow_negative_numbers = true)]
    pub max_grpc_log_length: i32,
}

impl AttacherConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::Configuration(
                "--attacher-worker-threads must be at least 1".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::Configuration(
                "--attacher-timeout must be greater than zero".into(),
            ));
        }
        if self.reconcile_sync.is_zero() {
            return Err(Error::Configuration(
                "--attacher-reconcile-sync must be greater than zero".into(),
            ));
        }
        if self.max_entries < 0 {
            return Err(Error::Configuration(format!(
                "--attacher-max-entries must not be negative, got {}",
                self.max_entries
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Provisioner
// =============================================================================

/// Flags of the dynamic provisioning controller
#[derive(Args, Debug, Clone, Serialize)]
#[command(next_help_heading = "Provisioner")]
pub struct ProvisionerConfig {
    /// QPS to use for storage capacity updates while communicating with the kubernetes apiserver.
    #[arg(long = "provisioner-kube-api-capacity-qps", default_value_t = 1.0)]
    pub kube_api_capacity_qps: f64,

    /// Burst to use for storage capacity updates while communicating with the kubernetes apiserver.
    #[arg(long = "provisioner-kube-api-capacity-burst", default_value_t = 5)]
    pub kube_api_capacity_burst: i32,

    /// Prefix to apply to the name of a created volume.
    #[arg(long = "provisioner-volume-name-prefix", default_value = "pvc")]
    pub volume_name_prefix: String,

    /// Truncates generated UUID of a created volume to this length. Defaults behavior is to NOT truncate.
    #[arg(long = "provisioner-volume-name-uuid-length", default_value_t = -1, allow_negative_numbers = true)]
    pub volume_name_uuid_length: i32,

    /// Number of simultaneously running threads, handling cloning finalizer removal
    #[arg(long = "provisioner-cloning-protection-threads", default_value_t = 1)]
    pub cloning_protection_threads: u32,

    /// Number of simultaneously running threads, handling CSIStorageCapacity objects
    #[arg(long = "provisioner-capacity-threads", default_value_t = 1)]
    pub capacity_threads: u32,

    /// Late binding: pass only selected node topology to CreateVolume Request.
    #[arg(
        long = "provisioner-strict-topology",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub strict_topology: bool,

    /// Immediate binding: pass aggregated cluster topologies for all nodes where the CSI driver is available.
    #[arg(
        long = "provisioner-immediate-topology",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true"
    )]
    pub immediate_topology: bool,

    /// If set, add pv/pvc metadata to plugin create requests as parameters.
    #[arg(
        long = "provisioner-extra-create-metadata",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub extra_create_metadata: bool,

    /// Enable pprof profiling on the TCP network address specified by --http-endpoint.
    #[arg(
        long = "provisioner-enable-pprof",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub enable_pprof: bool,

    /// Produce CSIStorageCapacity objects with capacity information from the driver's GetCapacity call.
    #[arg(
        long = "provisioner-enable-capacity",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub enable_capacity: bool,

    /// Produce capacity information for storage classes with immediate binding.
    #[arg(
        long = "provisioner-capacity-for-immediate-binding",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub capacity_for_immediate_binding: bool,

    /// How long the provisioner waits before checking for storage capacity changes.
    #[arg(long = "provisioner-capacity-poll-interval", default_value = "1m", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub capacity_poll_interval: Duration,

    /// Number of owner objects to traverse from the pod to reach the owner of CSIStorageCapacity objects: -1 for no owner, 0 for the pod itself.
    #[arg(long = "provisioner-capacity-ownerref-level", default_value_t = 1, allow_negative_numbers = true)]
    pub capacity_ownerref_level: i32,

    /// Deploy the provisioner together with a CSI driver on nodes to manage node-local volumes.
    #[arg(
        long = "provisioner-node-deployment",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub node_deployment: bool,

    /// Whether immediate binding is supported when deployed on each node.
    #[arg(
        long = "provisioner-node-deployment-immediate-binding",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true"
    )]
    pub node_deployment_immediate_binding: bool,

    /// How long the provisioner sleeps initially before trying to own a PVC with immediate binding.
    #[arg(long = "provisioner-node-deployment-base-delay", default_value = "20s", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub node_deployment_base_delay: Duration,

    /// How long the provisioner sleeps at most before trying to own a PVC with immediate binding.
    #[arg(long = "provisioner-node-deployment-max-delay", default_value = "60s", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub node_deployment_max_delay: Duration,

    /// Mark PVs as readonly at controller publish volume call if the PVC access mode is ROX.
    #[arg(
        long = "provisioner-controller-publish-readonly",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub controller_publish_readonly: bool,

    /// Prevent an unauthorised user from modifying the volume mode when creating a PVC from an existing VolumeSnapshot.
    #[arg(
        long = "provisioner-prevent-volume-mode-conversion",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true"
    )]
    pub prevent_volume_mode_conversion: bool,
}

impl ProvisionerConfig {
    /// `--provisioner-kube-api-capacity-qps` as a 32-bit float
    pub fn kube_api_capacity_qps_f32(&self) -> f32 {
        narrow_f32(self.kube_api_capacity_qps)
    }

    fn validate(&self, diagnostics: &DiagnosticsConfig) -> Result<()> {
        validate_qps("--provisioner-kube-api-capacity-qps", self.kube_api_capacity_qps)?;
        if self.volume_name_prefix.is_empty() {
            return Err(Error::Configuration(
                "--provisioner-volume-name-prefix must not be empty".into(),
            ));
        }
        if self.volume_name_uuid_length == 0 || self.volume_name_uuid_length < -1 {
            return Err(Error::Configuration(format!(
                "--provisioner-volume-name-uuid-length must be -1 or positive, got {}",
                self.volume_name_uuid_length
            )));
        }
        if self.cloning_protection_threads == 0 || self.capacity_threads == 0 {
            return Err(Error::Configuration(
                "--provisioner-cloning-protection-threads and --provisioner-capacity-threads must be at least 1".into(),
            ));
        }
        if self.capacity_ownerref_level < -1 {
            return Err(Error::Configuration(format!(
                "--provisioner-capacity-ownerref-level must be -1 or greater, got {}",
                self.capacity_ownerref_level
            )));
        }
        if self.node_deployment_base_delay > self.node_deployment_max_delay {
            return Err(Error::Configuration(
                "--provisioner-node-deployment-base-delay must not exceed --provisioner-node-deployment-max-delay".into(),
            ));
        }
        if self.enable_pprof && diagnostics.http_endpoint.is_empty() {
            return Err(Error::Configuration(
                "--provisioner-enable-pprof requires --http-endpoint".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Resizer
// =============================================================================

/// Flags of the volume resize controller
#[derive(Args, Debug, Clone, Serialize)]
#[command(next_help_heading = "Resizer")]
pub struct ResizerConfig {
    /// Handle volume in use errors in the resizer controller.
    #[arg(
        long = "resizer-handle-volume-inuse-error",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true"
    )]
    pub handle_volume_inuse_error: bool,

    /// If set, add pv/pvc metadata to plugin modify requests as parameters.
    #[arg(
        long = "resizer-extra-modify-metadata",
        action = ArgAction::Set,
        value_parser = parse_go_bool,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub extra_modify_metadata: bool,
}

// =============================================================================
// Configuration
// =============================================================================

/// Every startup parameter of the combined sidecars
#[derive(Parser, Debug, Clone, Serialize)]
#[command(
    name = "csi-sidecars",
    author,
    version,
    about = "Runs the CSI attacher, provisioner and resizer controllers in one process",
    long_about = None,
    args_override_self = true
)]
pub struct Configuration {
    #[command(flatten)]
    pub client: ClientConfig,

    #[command(flatten)]
    pub leader_election: LeaderElectionConfig,

    #[command(flatten)]
    pub diagnostics: DiagnosticsConfig,

    #[command(flatten)]
    pub logging: LoggingConfig,

    /// A comma-separated list of controllers to enable. The possible values are: [resizer,attacher,provisioner]
    #[arg(long, default_value = "")]
    pub controllers: String,

    /// A set of key=value pairs that describe feature gates for alpha/experimental features.
    #[arg(long, default_value = "", value_parser = feature_gates::parse_feature_gates)]
    pub feature_gates: FeatureGates,

    /// How long to wait for controllers to stop after one of them stopped. 0 waits forever.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    #[serde(serialize_with = "serialize_duration")]
    pub shutdown_grace_period: Duration,

    #[command(flatten)]
    pub attacher: AttacherConfig,

    #[command(flatten)]
    pub provisioner: ProvisionerConfig,

    #[command(flatten)]
    pub resizer: ResizerConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        <Self as Parser>::parse_from(["csi-sidecars"])
    }
}

impl Configuration {
    /// Flag declarations with every legacy alias attached
    pub fn flags() -> clap::Command {
        AliasMap::legacy().apply(<Self as CommandFactory>::command())
    }

    /// Parse a command line, including legacy aliases.
    ///
    /// The result is not validated; call [`Configuration::finalize`].
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::flags().try_get_matches_from(args)?;
        Ok(<Self as FromArgMatches>::from_arg_matches(&matches)?)
    }

    /// Parse and validate a command line
    pub fn load<I, T>(args: I) -> Result<Arc<Self>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::from_args(args)?.finalize()
    }

    /// Cross-field validation. The returned model is shared read-only.
    pub fn finalize(self) -> Result<Arc<Self>> {
        if self.client.resync.is_zero() {
            return Err(Error::Configuration("--resync must be greater than zero".into()));
        }
        if self.client.retry_interval_start.is_zero() {
            return Err(Error::Configuration(
                "--retry-interval-start must be greater than zero".into(),
            ));
        }
        if self.client.retry_interval_start > self.client.retry_interval_max {
            return Err(Error::Configuration(format!(
                "--retry-interval-start ({}) must not exceed --retry-interval-max ({})",
                humantime::format_duration(self.client.retry_interval_start),
                humantime::format_duration(self.client.retry_interval_max),
            )));
        }
        CsiEndpoint::parse(&self.client.csi_address)?;
        validate_qps("--kube-api-qps", self.client.kube_api_qps)?;
        if self.client.kube_api_burst < 0 {
            return Err(Error::Configuration(format!(
                "--kube-api-burst must not be negative, got {}",
                self.client.kube_api_burst
            )));
        }

        self.leader_election.validate()?;
        self.diagnostics.validate()?;
        self.feature_gates.validate()?;
        self.attacher.validate()?;
        self.provisioner.validate(&self.diagnostics)?;

        Ok(Arc::new(self))
    }

    /// Grace period after cancellation, `None` when waiting forever
    pub fn grace_period(&self) -> Option<Duration> {
        (!self.shutdown_grace_period.is_zero()).then_some(self.shutdown_grace_period)
    }

    /// Effective value of a flag by name, the way a legacy reader sees it.
    ///
    /// Accepts canonical names and aliases, with or without leading dashes.
    pub fn lookup(&self, name: &str) -> Option<FlagValue> {
        let (canonical, coercion) = AliasMap::legacy().resolve(name);
        self.canonical_value(canonical)
            .map(|value| value.coerce(coercion))
    }

    fn canonical_value(&self, canonical: &str) -> Option<FlagValue> {
        let c = &self.client;
        let le = &self.leader_election;
        let d = &self.diagnostics;
        let a = &self.attacher;
        let p = &self.provisioner;
        let r = &self.resizer;

        let value = match canonical {
            "master" => V::String(c.master.clone()),
            "kubeconfig" => V::String(c.kubeconfig.clone()),
            "csi-address" => V::String(c.csi_address.clone()),
            "resync" => V::Duration(c.resync),
            "retry-interval-start" => V::Duration(c.retry_interval_start),
            "retry-interval-max" => V::Duration(c.retry_interval_max),
            "kube-api-qps" => V::F64(c.kube_api_qps),
            "kube-api-burst" => V::Int(c.kube_api_burst.into()),

            "leader-election" => V::Bool(le.enabled),
            "leader-election-namespace" => V::String(le.namespace.clone()),
            "leader-election-lease-duration" => V::Duration(le.lease_duration),
            "leader-election-renew-deadline" => V::Duration(le.renew_deadline),
            "leader-election-retry-period" => V::Duration(le.retry_period),

            "http-endpoint" => V::String(d.http_endpoint.clone()),
            "metrics-address" => V::String(d.metrics_address.clone()),
            "metrics-path" => V::String(d.metrics_path.clone()),

            "controllers" => V::String(self.controllers.clone()),
            "shutdown-grace-period" => V::Duration(self.shutdown_grace_period),

            "attacher-default-fstype" => V::String(a.default_fstype.clone()),
            "attacher-worker-threads" => V::Uint(a.worker_threads as u64),
            "attacher-timeout" => V::Duration(a.timeout),
            "attacher-max-entries" => V::Int(a.max_entries.into()),
            "attacher-reconcile-sync" => V::Duration(a.reconcile_sync),
            "attacher-max-grpc-log-length" => V::Int(a.max_grpc_log_length.into()),

            "provisioner-kube-api-capacity-qps" => V::F64(p.kube_api_capacity_qps),
            "provisioner-kube-api-capacity-burst" => V::Int(p.kube_api_capacity_burst.into()),
            "provisioner-volume-name-prefix" => V::String(p.volume_name_prefix.clone()),
            "provisioner-volume-name-uuid-length" => V::Int(p.volume_name_uuid_length.into()),
            "provisioner-cloning-protection-threads" => V::Uint(p.cloning_protection_threads.into()),
            "provisioner-capacity-threads" => V::Uint(p.capacity_threads.into()),
            "provisioner-strict-topology" => V::Bool(p.strict_topology),
            "provisioner-immediate-topology" => V::Bool(p.immediate_topology),
            "provisioner-extra-create-metadata" => V::Bool(p.extra_create_metadata),
            "provisioner-enable-pprof" => V::Bool(p.enable_pprof),
            "provisioner-enable-capacity" => V::Bool(p.enable_capacity),
            "provisioner-capacity-for-immediate-binding" => V::Bool(p.capacity_for_immediate_binding),
            "provisioner-capacity-poll-interval" => V::Duration(p.capacity_poll_interval),
            "provisioner-capacity-ownerref-level" => V::Int(p.capacity_ownerref_level.into()),
            "provisioner-node-deployment" => V::Bool(p.node_deployment),
            "provisioner-node-deployment-immediate-binding" => {
                V::Bool(p.node_deployment_immediate_binding)
            }
            "provisioner-node-deployment-base-delay" => V::Duration(p.node_deployment_base_delay),
            "provisioner-node-deployment-max-delay" => V::Duration(p.node_deployment_max_delay),
            "provisioner-controller-publish-readonly" => V::Bool(p.controller_publish_readonly),
            "provisioner-prevent-volume-mode-conversion" => {
                V::Bool(p.prevent_volume_mode_conversion)
            }

            "resizer-handle-volume-inuse-error" => V::Bool(r.handle_volume_inuse_error),
            "resizer-extra-modify-metadata" => V::Bool(r.extra_modify_metadata),

            _ => return None,
        };
        Some(value)
    }
}

fn validate_qps(flag: &str, qps: f64) -> Result<()> {
    if qps.is_nan() || qps < 0.0 {
        return Err(Error::Configuration(format!(
            "{} must be a non-negative number, got {}",
            flag, qps
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse(args: &[&str]) -> Result<Configuration> {
        Configuration::from_args(std::iter::once("csi-sidecars").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();

        assert_eq!(config.client.csi_address, "/run/csi/socket");
        assert_eq!(config.client.resync, Duration::from_secs(600));
        assert_eq!(config.client.retry_interval_start, Duration::from_secs(1));
        assert_eq!(config.client.retry_interval_max, Duration::from_secs(300));
        assert_eq!(config.client.kube_api_qps, 5.0);
        assert_eq!(config.client.kube_api_burst, 10);
        assert!(!config.leader_election.enabled);
        assert_eq!(config.leader_election.lease_duration, Duration::from_secs(15));
        assert_eq!(config.leader_election.renew_deadline, Duration::from_secs(10));
        assert_eq!(config.leader_election.retry_period, Duration::from_secs(5));
        assert_eq!(config.diagnostics.metrics_path, "/metrics");
        assert_eq!(config.controllers, "");
        assert_eq!(config.attacher.worker_threads, 10);
        assert_eq!(config.attacher.max_grpc_log_length, -1);
        assert_eq!(config.provisioner.volume_name_prefix, "pvc");
        assert!(config.provisioner.immediate_topology);
        assert!(config.resizer.handle_volume_inuse_error);
        assert_eq!(config.grace_period(), Some(Duration::from_secs(30)));

        assert!(config.finalize().is_ok());
    }

    #[test]
    fn test_every_alias_matches_canonical_flag() {
        let samples: &[(&str, &str)] = &[
            ("csi-address", "/var/lib/csi/sockets/pluginproxy/csi.sock"),
            ("resync", "2m"),
            ("attacher-worker-threads", "42"),
            ("attacher-timeout", "90s"),
            ("attacher-default-fstype", "ext4"),
            ("attacher-max-entries", "100"),
            ("attacher-reconcile-sync", "5m"),
            ("attacher-max-grpc-log-length", "512"),
        ];
        let aliases = AliasMap::legacy();

        for alias in aliases.renames() {
            let (_, value) = samples
                .iter()
                .find(|(canonical, _)| *canonical == alias.canonical)
                .unwrap_or_else(|| panic!("no sample value for {}", alias.canonical));

            let via_alias = parse(&[format!("--{}={}", alias.name, value).as_str()]).unwrap();
            let via_canonical =
                parse(&[format!("--{}={}", alias.canonical, value).as_str()]).unwrap();

            assert_eq!(
                via_alias.lookup(alias.canonical),
                via_canonical.lookup(alias.canonical),
                "alias --{} disagrees with --{}",
                alias.name,
                alias.canonical
            );
            assert_eq!(via_alias.lookup(alias.name), via_canonical.lookup(alias.canonical));
            assert_ne!(
                via_alias.lookup(alias.canonical),
                parse(&[]).unwrap().lookup(alias.canonical),
                "sample for --{} equals its default",
                alias.canonical
            );
        }
    }

    #[test]
    fn test_last_alias_wins() {
        let config = parse(&["--workers=3", "--attacher-worker-threads=7"]).unwrap();
        assert_eq!(config.attacher.worker_threads, 7);

        let config = parse(&["--attacher-worker-threads=7", "--workers=3"]).unwrap();
        assert_eq!(config.attacher.worker_threads, 3);

        let config = parse(&["--csi-address=/a", "--csi-endpoint=/b"]).unwrap();
        assert_eq!(config.client.csi_address, "/b");
    }

    #[test]
    fn test_qps_is_narrowed_for_legacy_readers() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.lookup("kube-api-qps"), Some(FlagValue::F32(5.0)));
        assert_eq!(config.client.kube_api_qps_f32(), 5.0);
        assert_eq!(
            config.lookup("provisioner-kube-api-capacity-qps"),
            Some(FlagValue::F32(1.0))
        );

        let config = parse(&["--kube-api-qps=1e308"]).unwrap();
        assert_eq!(config.client.kube_api_qps, 1e308);
        assert_matches!(config.lookup("kube-api-qps"), Some(FlagValue::F32(v)) if v.is_finite());
    }

    #[test]
    fn test_lookup_unknown_flag() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.lookup("no-such-flag"), None);
        assert_eq!(
            config.lookup("--operation-timeout"),
            Some(FlagValue::Duration(Duration::from_secs(15)))
        );
    }

    #[test]
    fn test_go_style_bool_flags() {
        let config = parse(&[
            "--leader-election",
            "--provisioner-immediate-topology=false",
            "--resizer-extra-modify-metadata=true",
        ])
        .unwrap();

        assert!(config.leader_election.enabled);
        assert!(!config.provisioner.immediate_topology);
        assert!(config.resizer.extra_modify_metadata);
    }

    #[test]
    fn test_go_bool_spellings() {
        for (value, expected) in [
            ("1", true),
            ("t", true),
            ("T", true),
            ("TRUE", true),
            ("True", true),
            ("0", false),
            ("f", false),
            ("F", false),
            ("FALSE", false),
            ("False", false),
        ] {
            let config = parse(&[
                format!("--leader-election={}", value).as_str(),
                format!("--resizer-handle-volume-inuse-error={}", value).as_str(),
            ])
            .unwrap();
            assert_eq!(config.leader_election.enabled, expected, "{}", value);
            assert_eq!(config.resizer.handle_volume_inuse_error, expected, "{}", value);
        }

        assert_matches!(parse(&["--leader-election=yes"]), Err(Error::Flags(_)));
        assert_eq!(parse_go_bool("tRuE"), Err("invalid boolean \"tRuE\"".to_string()));
    }

    #[test]
    fn test_klog_verbosity() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.logging.verbosity, 0);
        assert_eq!(config.logging.max_level(), Level::INFO);

        for (args, expected) in [
            (&["--v=2"][..], Level::INFO),
            (&["--v=4"][..], Level::DEBUG),
            (&["--v=5"][..], Level::TRACE),
            (&["-v", "3"][..], Level::DEBUG),
            (&["--v=2", "--log-level=warn"][..], Level::INFO),
            (&["--v=0", "--log-level=debug"][..], Level::DEBUG),
        ] {
            let config = parse(args).unwrap();
            assert_eq!(config.logging.max_level(), expected, "{:?}", args);
        }
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let err = parse(&["--log-level=loud"]).unwrap_err();
        assert_matches!(err, Error::Flags(_));
        assert_eq!(err.exit_code(), crate::error::exit_code::CONFIGURATION);

        let config = parse(&["--log-level=WARN"]).unwrap();
        assert_eq!(config.logging.log_level, Level::WARN);
    }

    #[test]
    fn test_parse_listen_address() {
        assert_eq!(parse_listen_address(":8080").unwrap().port(), 8080);
        assert_eq!(
            parse_listen_address("127.0.0.1:9808").unwrap(),
            "127.0.0.1:9808".parse::<SocketAddr>().unwrap()
        );
        assert_matches!(parse_listen_address("localhost"), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_finalize_errors_are_startup_errors() {
        let config = parse(&["--csi-address=tcp://10.0.0.1:1", "--controllers=attacher"]).unwrap();
        let err = config.finalize().unwrap_err();
        assert!(err.is_startup_error());
        assert_eq!(err.exit_code(), crate::error::exit_code::CONFIGURATION);

        let config = parse(&["--csi-address=unix:///csi/csi.sock"]).unwrap();
        assert!(config.finalize().is_ok());
    }

    #[test]
    fn test_negative_numbers() {
        let config = parse(&[
            "--attacher-max-grpc-log-length",
            "-1",
            "--provisioner-capacity-ownerref-level",
            "-1",
        ])
        .unwrap();
        assert_eq!(config.attacher.max_grpc_log_length, -1);
        assert_eq!(config.provisioner.capacity_ownerref_level, -1);
    }

    #[test]
    fn test_malformed_duration_names_flag() {
        let err = parse(&["--resync=soon"]).unwrap_err();
        assert_matches!(err, Error::Flags(_));
        assert!(err.to_string().contains("--resync"));

        let err = parse(&["--kube-api-burst=lots"]).unwrap_err();
        assert!(err.to_string().contains("--kube-api-burst"));
    }

    #[test]
    fn test_http_endpoint_and_metrics_address_are_exclusive() {
        let config = parse(&["--http-endpoint=:8080", "--metrics-address=:8081"]).unwrap();
        assert_matches!(config.finalize(), Err(Error::Configuration(msg)) if msg.contains("--metrics-address"));

        let config = parse(&["--metrics-address=:8081"]).unwrap();
        assert_eq!(config.diagnostics.listen_address(), Some(":8081"));
        assert!(config.finalize().is_ok());
    }

    #[test]
    fn test_finalize_rejects_contradictions() {
        let cases: &[&[&str]] = &[
            &["--retry-interval-start=10m", "--retry-interval-max=1m"],
            &["--kube-api-qps=-1"],
            &["--kube-api-qps=NaN"],
            &["--metrics-path=metrics"],
            &["--attacher-worker-threads=0"],
            &[
                "--leader-election",
                "--leader-election-lease-duration=5s",
                "--leader-election-renew-deadline=10s",
            ],
            &[
                "--leader-election",
                "--leader-election-renew-deadline=10s",
                "--leader-election-retry-period=9s",
            ],
            &[
                "--provisioner-node-deployment-base-delay=2m",
                "--provisioner-node-deployment-max-delay=1m",
            ],
            &["--provisioner-enable-pprof"],
            &["--provisioner-volume-name-uuid-length=0"],
            &["--csi-address=tcp://10.0.0.1:1234"],
            &["--csi-address="],
            &["--attacher-reconcile-sync=0"],
            &["--http-endpoint=localhost:8080"],
            &["--metrics-address=not-an-address"],
        ];

        for args in cases {
            let config = parse(args).unwrap();
            assert_matches!(config.finalize(), Err(Error::Configuration(_)), "{:?}", args);
        }
    }

    #[test]
    fn test_finalize_rejects_unknown_feature_gate() {
        let config = parse(&["--feature-gates=Bogus=true"]).unwrap();
        assert_matches!(config.finalize(), Err(Error::FeatureGate { .. }));

        let config = parse(&["--feature-gates=VolumeAttributesClass=true"]).unwrap();
        let config = config.finalize().unwrap();
        assert!(config.feature_gates.enabled("VolumeAttributesClass"));
    }

    #[test]
    fn test_zero_grace_period_waits_forever() {
        let config = parse(&["--shutdown-grace-period=0"]).unwrap();
        assert_eq!(config.grace_period(), None);
    }

    #[test]
    fn test_serializes_durations_as_text() {
        let config = parse(&[]).unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["client"]["resync"], "10m");
        assert_eq!(json["attacher"]["timeout"], "15s");
        assert_eq!(json["logging"]["log_level"], "INFO");
    }
}
