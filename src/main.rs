//! Backup sidecar operator - injects backup sidecars into selected workloads

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::{Api, Client, CustomResourceExt, Resource};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use backup_sidecar_operator::api::{kind_of, KubeApi, ObjectKey};
use backup_sidecar_operator::cache::{run_informer, run_namespace_informer, run_resync, CachedQueue, ObjectCache, Requeue};
use backup_sidecar_operator::config::{
    ControllerConfig, DEFAULT_MAX_NUM_REQUEUES, DEFAULT_SIDECAR_CLUSTER_ROLE, DEFAULT_SIDECAR_IMAGE,
};
use backup_sidecar_operator::controller::{Apis, Controller, Injector, LogReporter};
use backup_sidecar_operator::crd::Backup;
use backup_sidecar_operator::queue::WorkQueue;
use backup_sidecar_operator::telemetry::{self, LogFormat};
use backup_sidecar_operator::workload::Workload;

/// Backup sidecar operator
#[derive(Parser, Debug)]
#[command(name = "backup-sidecar-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Manage a RoleBinding for every injected workload
    #[arg(long, env = "ENABLE_RBAC")]
    enable_rbac: bool,

    /// Sidecar image repository
    #[arg(long, env = "SIDECAR_IMAGE", default_value = DEFAULT_SIDECAR_IMAGE)]
    sidecar_image: String,

    /// Sidecar image tag
    #[arg(long, env = "SIDECAR_IMAGE_TAG", default_value = env!("CARGO_PKG_VERSION"))]
    sidecar_image_tag: String,

    /// ClusterRole bound to sidecar service accounts
    #[arg(long, default_value = DEFAULT_SIDECAR_CLUSTER_ROLE)]
    sidecar_cluster_role: String,

    /// Reconcile retries before a key is dropped
    #[arg(long, default_value_t = DEFAULT_MAX_NUM_REQUEUES)]
    max_num_requeues: u32,

    /// Seconds between full resyncs of every cached workload
    #[arg(long, default_value_t = 300)]
    resync_period_secs: u64,

    /// Seconds between retries of a failed workload patch
    #[arg(long, default_value_t = 2)]
    retry_interval_secs: u64,

    /// Seconds before a workload patch gives up
    #[arg(long, default_value_t = 180)]
    retry_timeout_secs: u64,

    /// Seconds between rollout and pod checks
    #[arg(long, default_value_t = 2)]
    readiness_interval_secs: u64,

    /// Seconds before a rollout or pod wait gives up
    #[arg(long, default_value_t = 300)]
    readiness_timeout_secs: u64,

    /// Concurrent workers per workload kind
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Only watch this namespace
    #[arg(long = "namespace", env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            enable_rbac: self.enable_rbac,
            sidecar_image: self.sidecar_image.clone(),
            sidecar_image_tag: self.sidecar_image_tag.clone(),
            sidecar_cluster_role: self.sidecar_cluster_role.clone(),
            max_num_requeues: self.max_num_requeues,
            resync_period: Duration::from_secs(self.resync_period_secs),
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            retry_timeout: Duration::from_secs(self.retry_timeout_secs),
            readiness_interval: Duration::from_secs(self.readiness_interval_secs),
            readiness_timeout: Duration::from_secs(self.readiness_timeout_secs),
            workers: self.workers,
            watch_namespace: self.watch_namespace.clone().filter(|ns| !ns.is_empty()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!(
            "{}",
            serde_yaml::to_string(&Backup::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize Backup CRD: {}", e))?
        );
        return Ok(());
    }

    telemetry::init(cli.log_format)?;

    let config = cli.controller_config();
    config.validate()?;
    let config = Arc::new(config);

    info!(
        sidecar = %config.sidecar_image_ref(),
        rbac = config.enable_rbac,
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        "Backup sidecar operator starting"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    run(client, config).await
}

// =============================================================================
// Wiring
// =============================================================================

/// Background tasks and queues owned by the running operator
#[derive(Default)]
struct Tasks {
    queues: Vec<WorkQueue<ObjectKey>>,
    informers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// Store, writer and queue for one workload kind, before anything is spawned
struct WorkloadKind<W: Workload> {
    store: Store<W>,
    writer: Writer<W>,
    queue: WorkQueue<ObjectKey>,
}

impl<W: Workload> WorkloadKind<W> {
    fn new() -> Self {
        let (store, writer) = reflector::store();
        Self {
            store,
            writer,
            queue: WorkQueue::new(kind_of::<W>().to_lowercase()),
        }
    }

    fn requeue(&self) -> Arc<dyn Requeue> {
        Arc::new(CachedQueue::new(
            Arc::new(self.store.clone()) as Arc<dyn ObjectCache<W>>,
            self.queue.clone(),
        ))
    }

    /// Start the informer and, once its cache is synced, the workers
    fn spawn(
        self,
        client: &Client,
        config: &Arc<ControllerConfig>,
        backups: Arc<dyn ObjectCache<Backup>>,
        tasks: &mut Tasks,
    ) {
        let api = watch_api::<W>(client, config.watch_namespace.as_deref());
        tasks
            .informers
            .push(tokio::spawn(run_informer(api, self.writer, self.queue.clone())));

        let apis = Apis {
            workloads: Arc::new(KubeApi::<W>::new(client.clone())),
            pods: Arc::new(KubeApi::new(client.clone())),
            secrets: Arc::new(KubeApi::new(client.clone())),
            role_bindings: Arc::new(KubeApi::new(client.clone())),
        };
        let injector = Injector::new(config.clone(), apis, backups);
        let controller = Arc::new(Controller::new(
            self.queue.clone(),
            Arc::new(self.store.clone()),
            Arc::new(injector),
            Arc::new(LogReporter),
            config.max_num_requeues,
        ));

        let store = self.store;
        let workers = config.workers;
        tasks.workers.push(tokio::spawn(async move {
            if store.wait_until_ready().await.is_err() {
                warn!(kind = %kind_of::<W>(), "informer stopped before cache synced");
                return;
            }
            info!(kind = %kind_of::<W>(), "cache synced");
            controller.run(workers).await;
        }));
        tasks.queues.push(self.queue);
    }
}

fn watch_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn run(client: Client, config: Arc<ControllerConfig>) -> anyhow::Result<()> {
    let deployments = WorkloadKind::<Deployment>::new();
    let replica_sets = WorkloadKind::<ReplicaSet>::new();
    let stateful_sets = WorkloadKind::<StatefulSet>::new();
    let daemon_sets = WorkloadKind::<DaemonSet>::new();

    let targets: Arc<Vec<Arc<dyn Requeue>>> = Arc::new(vec![
        deployments.requeue(),
        replica_sets.requeue(),
        stateful_sets.requeue(),
        daemon_sets.requeue(),
    ]);

    let mut tasks = Tasks::default();

    // A Backup change re-enqueues every workload in its namespace
    let (backup_store, backup_writer) = reflector::store::<Backup>();
    let fanout = targets.clone();
    tasks.informers.push(tokio::spawn(run_namespace_informer(
        watch_api::<Backup>(&client, config.watch_namespace.as_deref()),
        backup_writer,
        move |namespace| {
            for target in fanout.iter() {
                target.requeue_namespace(namespace);
            }
        },
    )));
    backup_store
        .wait_until_ready()
        .await
        .map_err(|e| anyhow::anyhow!("Backup informer stopped before cache synced: {}", e))?;
    info!(kind = "Backup", "cache synced");

    let backups: Arc<dyn ObjectCache<Backup>> = Arc::new(backup_store);
    deployments.spawn(&client, &config, backups.clone(), &mut tasks);
    replica_sets.spawn(&client, &config, backups.clone(), &mut tasks);
    stateful_sets.spawn(&client, &config, backups.clone(), &mut tasks);
    daemon_sets.spawn(&client, &config, backups, &mut tasks);

    let resync = tokio::spawn(run_resync(targets.to_vec(), config.resync_period));

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, draining workers"),
        _ = sigint.recv() => info!("Received SIGINT, draining workers"),
    }

    for queue in &tasks.queues {
        queue.shut_down();
    }
    resync.abort();
    for informer in &tasks.informers {
        informer.abort();
    }
    for worker in tasks.workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "worker task failed");
        }
    }

    info!("Backup sidecar operator stopped");
    Ok(())
}
