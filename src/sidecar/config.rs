//! Database configuration assembly.
//!
//! Renders the configuration files and entrypoint script of one member from
//! its identity, the discovered seeds and the container limits. Generation is
//! pure: [`read_inputs`] collects the image's stock files, a [`Database`]
//! turns them into [`ConfigFile`]s and [`write_config`] puts them on disk.

use std::collections::BTreeMap;
use std::io;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crd::ClusterMode;
use crate::resources::statefulset::{JOLOKIA_PORT, SHARED_DIR};
use crate::sidecar::env::ResourceLimits;

pub const CASSANDRA_YAML_PATH: &str = "/etc/cassandra/cassandra.yaml";
pub const CASSANDRA_ENV_PATH: &str = "/etc/cassandra/cassandra-env.sh";
pub const CASSANDRA_RACKDC_PATH: &str = "/etc/cassandra/cassandra-rackdc.properties";
pub const SCYLLA_YAML_PATH: &str = "/etc/scylla/scylla.yaml";
pub const SCYLLA_RACKDC_PATH: &str = "/etc/scylla/cassandra-rackdc.properties";
pub const SCYLLA_JMX_PATH: &str = "/usr/lib/scylla/jmx/scylla-jmx";
pub const ENTRYPOINT_PATH: &str = "/entrypoint.sh";

const SIMPLE_SEED_PROVIDER: &str = "org.apache.cassandra.locator.SimpleSeedProvider";
const ENDPOINT_SNITCH: &str = "GossipingPropertyFileSnitch";
const SCYLLA_RESERVED_MEMORY_MIB: i64 = 700;

/// Keys of the database YAML a user ConfigMap may set.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "cluster_name",
    "listen_address",
    "num_tokens",
    "rpc_address",
    "broadcast_address",
    "broadcast_rpc_address",
    "endpoint_snitch",
    "disk_failure_policy",
    "commit_failure_policy",
    "seed_provider",
];

/// Used when the image does not ship `cassandra.yaml`.
const DEFAULT_CASSANDRA_YAML: &str = r#"cluster_name: Test Cluster
num_tokens: 256
hinted_handoff_enabled: true
max_hint_window_in_ms: 10800000
authenticator: AllowAllAuthenticator
authorizer: AllowAllAuthorizer
partitioner: org.apache.cassandra.dht.Murmur3Partitioner
disk_failure_policy: stop
commit_failure_policy: stop
commitlog_sync: periodic
commitlog_sync_period_in_ms: 10000
commitlog_segment_size_in_mb: 32
seed_provider:
  - class_name: org.apache.cassandra.locator.SimpleSeedProvider
    parameters:
      - seeds: "127.0.0.1"
concurrent_reads: 32
concurrent_writes: 32
storage_port: 7000
ssl_storage_port: 7001
listen_address: localhost
start_native_transport: true
native_transport_port: 9042
start_rpc: false
rpc_address: localhost
rpc_port: 9160
endpoint_snitch: SimpleSnitch
"#;

/// Used when the image does not ship `scylla.yaml`.
const DEFAULT_SCYLLA_YAML: &str = r#"cluster_name: Test Cluster
num_tokens: 256
commitlog_sync: periodic
commitlog_sync_period_in_ms: 10000
commitlog_segment_size_in_mb: 32
seed_provider:
  - class_name: org.apache.cassandra.locator.SimpleSeedProvider
    parameters:
      - seeds: "127.0.0.1"
listen_address: localhost
native_transport_port: 9042
read_request_timeout_in_ms: 5000
write_request_timeout_in_ms: 2000
endpoint_snitch: SimpleSnitch
rpc_address: localhost
rpc_port: 9160
api_port: 10000
api_address: 127.0.0.1
"#;

static TEMPLATE_ACTION: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*\.(\w+)\s*\}\}"));

/// Errors raised while assembling the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),

    #[error("{0} env variable not found")]
    MissingLimit(&'static str),

    #[error("invalid value {value:?} for {name}")]
    InvalidLimit { name: &'static str, value: String },

    #[error("invalid YAML in {context}: {source}")]
    Yaml {
        context: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("template error: {0}")]
    Template(String),

    #[error("required file {0} is missing")]
    MissingFile(&'static str),

    #[error("{0} has no line continuation to inject the agent after")]
    NoLineContinuation(&'static str),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: &'static str,
        #[source]
        source: io::Error,
    },
}

/// One generated file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigFile {
    pub path: &'static str,
    pub contents: String,
    pub executable: bool,
}

impl ConfigFile {
    fn new(path: &'static str, contents: String) -> Self {
        Self {
            path,
            contents,
            executable: false,
        }
    }

    fn executable(path: &'static str, contents: String) -> Self {
        Self {
            path,
            contents,
            executable: true,
        }
    }
}

/// Current contents of the files a [`Database`] rewrites, keyed by path.
pub type ExistingFiles = BTreeMap<&'static str, String>;

/// Everything that goes into a member's configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigContext {
    pub cluster_name: String,
    pub datacenter: String,
    pub rack: String,
    pub member_name: String,
    pub namespace: String,
    /// ClusterIP of the member service, used as broadcast address.
    pub member_service_ip: String,
    /// Pod IP, used as listen address.
    pub local_ip: String,
    /// Comma-joined seed addresses.
    pub seeds: String,
    pub limits: ResourceLimits,
    pub developer_mode: bool,
    /// YAML template from the rack's user ConfigMap.
    pub user_config: Option<String>,
}

impl ConfigContext {
    fn template_variable(&self, name: &str) -> Option<&str> {
        let value = match name {
            "ClusterName" => &self.cluster_name,
            "Datacenter" => &self.datacenter,
            "Rack" => &self.rack,
            "MemberName" => &self.member_name,
            "Namespace" => &self.namespace,
            "MemberServiceIP" => &self.member_service_ip,
            "LocalIP" => &self.local_ip,
            _ => return None,
        };
        Some(value)
    }
}

/// Entry of the `seed_provider` list.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SeedProvider {
    pub class_name: String,
    #[serde(default)]
    pub parameters: Vec<SeedProviderParameter>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SeedProviderParameter {
    pub seeds: String,
}

/// JVM heap sizes in MiB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapSizes {
    pub max_heap_mib: i64,
    pub heap_new_mib: i64,
}

impl HeapSizes {
    /// Heap sizing of the stock `cassandra-env.sh`, applied to the container limits.
    pub fn for_limits(limits: ResourceLimits) -> Self {
        let mem = limits.memory_mib;
        let max_heap_mib = (mem / 2).min(1024).max((mem / 4).min(8192));
        let heap_new_mib = (max_heap_mib / 4).min(100 * limits.cpus);
        Self {
            max_heap_mib,
            heap_new_mib,
        }
    }

    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("MAX_HEAP_SIZE", format!("{}M", self.max_heap_mib)),
            ("HEAP_NEWSIZE", format!("{}M", self.heap_new_mib)),
        ]
    }
}

/// `-javaagent` option loading Jolokia from the shared volume.
pub fn jolokia_agent() -> String {
    format!(
        "-javaagent:{}/plugins/jolokia.jar=host=localhost,port={},executor=fixed,threadNr=2",
        SHARED_DIR, JOLOKIA_PORT
    )
}

/// A database flavor the sidecar can configure.
pub trait Database: Send + Sync {
    fn mode(&self) -> ClusterMode;

    /// Paths whose current contents [`Database::generate_config`] reads.
    fn inputs(&self) -> &'static [&'static str];

    fn generate_config(
        &self,
        ctx: &ConfigContext,
        existing: &ExistingFiles,
    ) -> Result<Vec<ConfigFile>, ConfigError>;

    /// Contents of the entrypoint script.
    fn entrypoint(&self, ctx: &ConfigContext) -> String;

    /// Extra environment of the database process.
    fn child_env(&self, ctx: &ConfigContext) -> Vec<(&'static str, String)>;
}

pub struct Cassandra;

impl Database for Cassandra {
    fn mode(&self) -> ClusterMode {
        ClusterMode::Cassandra
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[CASSANDRA_YAML_PATH, CASSANDRA_ENV_PATH]
    }

    fn generate_config(
        &self,
        ctx: &ConfigContext,
        existing: &ExistingFiles,
    ) -> Result<Vec<ConfigFile>, ConfigError> {
        let base = existing
            .get(CASSANDRA_YAML_PATH)
            .map(String::as_str)
            .unwrap_or(DEFAULT_CASSANDRA_YAML);

        let env_sh = existing
            .get(CASSANDRA_ENV_PATH)
            .ok_or(ConfigError::MissingFile(CASSANDRA_ENV_PATH))?;
        let mut env_sh = env_sh.clone();
        if !env_sh.is_empty() && !env_sh.ends_with('\n') {
            env_sh.push('\n');
        }
        env_sh.push_str(&format!("JVM_OPTS=\"$JVM_OPTS {}\"\n", jolokia_agent()));

        Ok(vec![
            ConfigFile::new(CASSANDRA_YAML_PATH, override_config(base, ctx)?),
            ConfigFile::new(CASSANDRA_RACKDC_PATH, rackdc_properties(ctx)),
            ConfigFile::new(CASSANDRA_ENV_PATH, env_sh),
            ConfigFile::executable(ENTRYPOINT_PATH, self.entrypoint(ctx)),
        ])
    }

    fn entrypoint(&self, _ctx: &ConfigContext) -> String {
        "#!/bin/sh\nexec cassandra -f -R".to_string()
    }

    fn child_env(&self, ctx: &ConfigContext) -> Vec<(&'static str, String)> {
        HeapSizes::for_limits(ctx.limits).env()
    }
}

pub struct Scylla;

impl Database for Scylla {
    fn mode(&self) -> ClusterMode {
        ClusterMode::Scylla
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[SCYLLA_YAML_PATH, SCYLLA_JMX_PATH]
    }

    fn generate_config(
        &self,
        ctx: &ConfigContext,
        existing: &ExistingFiles,
    ) -> Result<Vec<ConfigFile>, ConfigError> {
        let base = existing
            .get(SCYLLA_YAML_PATH)
            .map(String::as_str)
            .unwrap_or(DEFAULT_SCYLLA_YAML);
        let jmx = existing
            .get(SCYLLA_JMX_PATH)
            .ok_or(ConfigError::MissingFile(SCYLLA_JMX_PATH))?;

        Ok(vec![
            ConfigFile::new(SCYLLA_YAML_PATH, override_config(base, ctx)?),
            ConfigFile::new(SCYLLA_RACKDC_PATH, rackdc_properties(ctx)),
            ConfigFile::executable(SCYLLA_JMX_PATH, inject_jmx_agent(jmx)?),
            ConfigFile::executable(ENTRYPOINT_PATH, self.entrypoint(ctx)),
        ])
    }

    fn entrypoint(&self, ctx: &ConfigContext) -> String {
        let memory = (ctx.limits.memory_mib - SCYLLA_RESERVED_MEMORY_MIB).max(0);
        let developer_mode = if ctx.developer_mode { "1" } else { "0" };
        let opts = [
            ("listen-address", ctx.local_ip.clone()),
            ("broadcast-address", ctx.member_service_ip.clone()),
            ("broadcast-rpc-address", ctx.member_service_ip.clone()),
            ("seeds", ctx.seeds.clone()),
            ("developer-mode", developer_mode.to_string()),
            ("smp", ctx.limits.cpus.to_string()),
            ("memory", format!("{}M", memory)),
        ];

        let mut script = "#!/bin/sh\nexec /docker-entrypoint.py".to_string();
        for (flag, value) in opts {
            script.push_str(&format!(" --{} {}", flag, value));
        }
        script
    }

    fn child_env(&self, _ctx: &ConfigContext) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// The [`Database`] of a cluster mode.
pub fn database_for(mode: ClusterMode) -> Box<dyn Database> {
    match mode {
        ClusterMode::Cassandra => Box::new(Cassandra),
        ClusterMode::Scylla => Box::new(Scylla),
    }
}

pub fn rackdc_properties(ctx: &ConfigContext) -> String {
    format!("dc={}\nrack={}\nprefer_local=false\n", ctx.datacenter, ctx.rack)
}

fn yaml_error(context: &str) -> impl FnOnce(serde_yaml::Error) -> ConfigError + '_ {
    move |source| ConfigError::Yaml {
        context: context.to_string(),
        source,
    }
}

fn parse_mapping(text: &str, context: &str) -> Result<Mapping, ConfigError> {
    match serde_yaml::from_str::<Value>(text).map_err(yaml_error(context))? {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(ConfigError::Template(format!(
            "{} is not a YAML mapping",
            context
        ))),
    }
}

fn seed_provider_value(seeds: &str) -> Result<Value, ConfigError> {
    let providers = vec![SeedProvider {
        class_name: SIMPLE_SEED_PROVIDER.to_string(),
        parameters: vec![SeedProviderParameter {
            seeds: seeds.to_string(),
        }],
    }];
    serde_yaml::to_value(providers).map_err(yaml_error("seed_provider"))
}

/// Apply the member overrides, then the user's recognized keys, to a
/// database YAML document.
pub fn override_config(base: &str, ctx: &ConfigContext) -> Result<String, ConfigError> {
    let mut config = parse_mapping(base, "default configuration")?;

    let overrides = [
        ("cluster_name", Value::from(ctx.cluster_name.as_str())),
        ("listen_address", Value::from(ctx.local_ip.as_str())),
        ("broadcast_address", Value::from(ctx.member_service_ip.as_str())),
        ("rpc_address", Value::from("0.0.0.0")),
        ("broadcast_rpc_address", Value::from(ctx.member_service_ip.as_str())),
        ("endpoint_snitch", Value::from(ENDPOINT_SNITCH)),
        ("seed_provider", seed_provider_value(&ctx.seeds)?),
    ];
    for (key, value) in overrides {
        config.insert(Value::from(key), value);
    }

    if let Some(template) = &ctx.user_config {
        apply_user_config(&mut config, template, ctx)?;
    }

    serde_yaml::to_string(&config).map_err(yaml_error("generated configuration"))
}

fn apply_user_config(
    config: &mut Mapping,
    template: &str,
    ctx: &ConfigContext,
) -> Result<(), ConfigError> {
    let rendered = render_template(template, ctx)?;
    let user = parse_mapping(&rendered, "user configuration")?;

    for (key, value) in user {
        let Some(name) = key.as_str() else {
            continue;
        };
        if !RECOGNIZED_KEYS.contains(&name) {
            warn!(key = %name, "Ignoring unsupported configuration key");
            continue;
        }
        let value = if name == "seed_provider" {
            let providers: Vec<SeedProvider> =
                serde_yaml::from_value(value).map_err(yaml_error("seed_provider"))?;
            serde_yaml::to_value(providers).map_err(yaml_error("seed_provider"))?
        } else {
            value
        };
        debug!(key = %name, "Applying user configuration");
        config.insert(key, value);
    }
    Ok(())
}

/// Substitute `{{ .Variable }}` actions with member values.
pub fn render_template(template: &str, ctx: &ConfigContext) -> Result<String, ConfigError> {
    let action = TEMPLATE_ACTION
        .as_ref()
        .map_err(|e| ConfigError::Template(e.to_string()))?;

    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for captures in action.captures_iter(template) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = ctx.template_variable(name.as_str()).ok_or_else(|| {
            ConfigError::Template(format!("unknown variable {}", name.as_str()))
        })?;
        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(value);
        last = whole.end();
    }
    rendered.push_str(&template[last..]);

    if rendered.contains("{{") {
        return Err(ConfigError::Template(
            "unsupported or unterminated action".to_string(),
        ));
    }
    Ok(rendered)
}

/// Insert the Jolokia agent after the first line continuation of the
/// `scylla-jmx` launcher.
pub fn inject_jmx_agent(launcher: &str) -> Result<String, ConfigError> {
    let split = launcher
        .find('\\')
        .map(|i| i + 1)
        .ok_or(ConfigError::NoLineContinuation(SCYLLA_JMX_PATH))?;
    Ok(format!(
        "{}\n    {} \\{}",
        &launcher[..split],
        jolokia_agent(),
        &launcher[split..]
    ))
}

/// Read the current contents of a database's input files. Absent files are
/// left out.
pub async fn read_inputs(database: &dyn Database) -> Result<ExistingFiles, ConfigError> {
    let mut existing = ExistingFiles::new();
    for &path in database.inputs() {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                existing.insert(path, contents);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path, "Input file not present");
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        }
    }
    Ok(existing)
}

/// Write generated files, marking scripts executable.
pub async fn write_config(files: &[ConfigFile]) -> Result<(), ConfigError> {
    for file in files {
        info!(path = %file.path, "Writing configuration file");
        if let Some(parent) = std::path::Path::new(file.path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io {
                    path: file.path,
                    source,
                })?;
        }
        tokio::fs::write(file.path, &file.contents)
            .await
            .map_err(|source| ConfigError::Io {
                path: file.path,
                source,
            })?;

        #[cfg(unix)]
        if file.executable {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(file.path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|source| ConfigError::Io {
                    path: file.path,
                    source,
                })?;
        }
    }
    Ok(())
}
