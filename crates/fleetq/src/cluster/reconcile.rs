use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;

use crate::cloud::{Cloud, CloudResult, QueueAttributeMap, RedrivePolicy, resource_name};
use crate::cluster::ResourceSet;
use crate::cluster::taskdef::TaskDefinition;
use crate::common::config::{AppConfig, MAX_RECEIVE_COUNT};
use crate::common::credentials::{TaskIdentity, resolve_task_identity, resolve_task_identity_in};
use crate::common::error::FleetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The resource was found and left untouched.
    Existing,
    Created,
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileOutcome::Existing => f.write_str("already exists"),
            ReconcileOutcome::Created => f.write_str("created"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled<T> {
    pub id: T,
    pub outcome: ReconcileOutcome,
}

impl<T> Reconciled<T> {
    pub fn is_created(&self) -> bool {
        self.outcome == ReconcileOutcome::Created
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reconciled<U> {
        Reconciled {
            id: f(self.id),
            outcome: self.outcome,
        }
    }
}

/// Looks a resource up with `describe` and creates it with `create` only if it was not found.
///
/// A failed lookup is an error, it is never interpreted as a missing resource.
pub async fn reconcile<T, D, C>(
    kind: &str,
    name: &str,
    describe: D,
    create: C,
) -> crate::Result<Reconciled<T>>
where
    D: AsyncFnOnce() -> CloudResult<Option<T>>,
    C: AsyncFnOnce() -> CloudResult<T>,
{
    if let Some(id) = describe().await? {
        log::info!("{kind} `{name}` already exists");
        return Ok(Reconciled {
            id,
            outcome: ReconcileOutcome::Existing,
        });
    }
    log::info!("Creating {kind} `{name}`");
    let id = create().await?;
    log::info!("{kind} `{name}` created");
    Ok(Reconciled {
        id,
        outcome: ReconcileOutcome::Created,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub url: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSet {
    pub queue: Reconciled<QueueHandle>,
    pub dead_letter: Reconciled<QueueHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinitionRef {
    pub arn: String,
    /// Identity embedded into a new registration, `None` if the definition already existed.
    pub identity: Option<TaskIdentity>,
}

/// One line of the setup summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOutcome {
    pub kind: &'static str,
    pub name: String,
    pub outcome: ReconcileOutcome,
}

#[derive(Debug, Clone)]
pub struct SetupReport {
    pub resources: ResourceSet,
    pub outcomes: Vec<ResourceOutcome>,
    /// The task definition was registered without any identity.
    pub anonymous_tasks: bool,
}

impl SetupReport {
    pub fn created(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == ReconcileOutcome::Created)
    }
}

/// Converges the queues, cluster, task definition, service and bucket of an application.
pub struct ResourceReconciler<'a> {
    cloud: &'a Cloud,
    config: &'a AppConfig,
    settle_time: Duration,
    aws_dir: Option<PathBuf>,
}

impl<'a> ResourceReconciler<'a> {
    pub fn new(cloud: &'a Cloud, config: &'a AppConfig) -> Self {
        Self {
            cloud,
            config,
            settle_time: config.timing.settle_time,
            aws_dir: None,
        }
    }

    /// Reads profiles from this directory instead of `~/.aws`.
    pub fn with_aws_directory(mut self, aws_dir: PathBuf) -> Self {
        self.aws_dir = Some(aws_dir);
        self
    }

    /// Newly created resources need some time before other services can see them.
    async fn settle<T>(&self, reconciled: &Reconciled<T>) {
        if reconciled.is_created() && !self.settle_time.is_zero() {
            log::debug!(
                "Waiting {} for the new resource to settle",
                humantime::format_duration(self.settle_time)
            );
            tokio::time::sleep(self.settle_time).await;
        }
    }

    async fn queue_handle(&self, url: String) -> crate::Result<QueueHandle> {
        let attributes = self.cloud.queues.get_queue_attributes(&url).await?;
        let arn = attributes
            .arn
            .ok_or_else(|| anyhow!("Queue {url} does not report its ARN"))?;
        Ok(QueueHandle { url, arn })
    }

    pub async fn ensure_dead_letter_queue(&self) -> crate::Result<Reconciled<QueueHandle>> {
        let name = self.config.dead_letter_queue();
        let queues = &self.cloud.queues;
        let reconciled = reconcile(
            "dead letter queue",
            &name,
            async || queues.get_queue_url(&name).await,
            async || queues.create_queue(&name, &QueueAttributeMap::new()).await,
        )
        .await?;
        self.settle(&reconciled).await;

        let handle = self.queue_handle(reconciled.id.clone()).await?;
        Ok(reconciled.map(|_| handle))
    }

    fn queue_attributes(&self, policy: &RedrivePolicy) -> crate::Result<QueueAttributeMap> {
        Ok(QueueAttributeMap::from([
            ("DelaySeconds".to_string(), "0".to_string()),
            ("MaximumMessageSize".to_string(), "262144".to_string()),
            ("MessageRetentionPeriod".to_string(), "1209600".to_string()),
            ("ReceiveMessageWaitTimeSeconds".to_string(), "0".to_string()),
            ("RedrivePolicy".to_string(), serde_json::to_string(policy)?),
            (
                "VisibilityTimeout".to_string(),
                self.config.message_visibility.as_secs().to_string(),
            ),
        ]))
    }

    /// Attaches the redrive policy to a queue that was created without one.
    ///
    /// A different policy that is already present is kept.
    async fn converge_redrive(&self, queue_url: &str, policy: &RedrivePolicy) -> crate::Result<()> {
        let attributes = self.cloud.queues.get_queue_attributes(queue_url).await?;
        match attributes.redrive_policy {
            Some(existing) if existing == *policy => {}
            Some(existing) => {
                log::warn!(
                    "Queue {queue_url} sends failed messages to {} (after {} receives), keeping it",
                    existing.dead_letter_target_arn,
                    existing.max_receive_count
                );
            }
            None => {
                log::info!("Attaching dead letter queue to existing queue {queue_url}");
                let attributes = QueueAttributeMap::from([(
                    "RedrivePolicy".to_string(),
                    serde_json::to_string(policy)?,
                )]);
                self.cloud
                    .queues
                    .set_queue_attributes(queue_url, &attributes)
                    .await?;
            }
        }
        Ok(())
    }

    /// Ensures the primary queue with its dead letter queue.
    ///
    /// The dead letter queue is reconciled first; if that fails, the primary queue is not
    /// touched at all.
    pub async fn ensure_queue(&self) -> crate::Result<QueueSet> {
        let dead_letter = self.ensure_dead_letter_queue().await?;
        let policy = RedrivePolicy {
            dead_letter_target_arn: dead_letter.id.arn.clone(),
            max_receive_count: MAX_RECEIVE_COUNT,
        };
        let attributes = self.queue_attributes(&policy)?;

        let name = self.config.queue_name();
        let queues = &self.cloud.queues;
        let reconciled = reconcile(
            "queue",
            &name,
            async || queues.get_queue_url(&name).await,
            async || queues.create_queue(&name, &attributes).await,
        )
        .await?;
        if reconciled.is_created() {
            self.settle(&reconciled).await;
        } else {
            self.converge_redrive(&reconciled.id, &policy).await?;
        }

        let handle = self.queue_handle(reconciled.id.clone()).await?;
        Ok(QueueSet {
            queue: reconciled.map(|_| handle),
            dead_letter,
        })
    }

    async fn find_cluster(&self) -> CloudResult<Option<String>> {
        let name = &self.config.cluster;
        Ok(self
            .cloud
            .containers
            .list_clusters()
            .await?
            .into_iter()
            .find(|arn| resource_name(arn) == name))
    }

    pub async fn ensure_cluster(&self) -> crate::Result<Reconciled<String>> {
        let name = &self.config.cluster;
        let reconciled = reconcile(
            "cluster",
            name,
            async || self.find_cluster().await,
            async || self.cloud.containers.create_cluster(name).await,
        )
        .await?;
        self.settle(&reconciled).await;
        Ok(reconciled)
    }

    /// Returns the newest active revision of the application task family.
    async fn find_task_definition(&self, family: &str) -> CloudResult<Option<String>> {
        let arns = self.cloud.containers.list_task_definitions(family).await?;
        Ok(arns
            .into_iter()
            .filter_map(|arn| {
                let (arn_family, revision) = arn.rsplit('/').next()?.rsplit_once(':')?;
                let revision = revision.parse::<u32>().ok()?;
                let matches = arn_family == family;
                matches.then_some((revision, arn))
            })
            .max_by_key(|(revision, _)| *revision)
            .map(|(_, arn)| arn))
    }

    fn resolve_identity(&self, profile: &str) -> TaskIdentity {
        match &self.aws_dir {
            Some(directory) => resolve_task_identity_in(directory, profile),
            None => resolve_task_identity(profile),
        }
    }

    /// Registers the worker task definition unless the family already has an active revision.
    ///
    /// The identity of the containers is taken from `profile`. A profile without role or keys
    /// still produces a definition, which is reported through [`TaskDefinitionRef::identity`].
    pub async fn ensure_task_definition(
        &self,
        profile: &str,
    ) -> crate::Result<Reconciled<TaskDefinitionRef>> {
        let family = self.config.task_name();
        let queue_name = self.config.queue_name();
        let queue_url = self
            .cloud
            .queues
            .get_queue_url(&queue_name)
            .await?
            .ok_or(FleetError::QueueUnavailable(queue_name))?;
        let reconciled = reconcile(
            "task definition",
            &family,
            async || {
                Ok(self
                    .find_task_definition(&family)
                    .await?
                    .map(|arn| TaskDefinitionRef {
                        arn,
                        identity: None,
                    }))
            },
            async || {
                let identity = self.resolve_identity(profile);
                if identity == TaskIdentity::Anonymous {
                    log::warn!(
                        "Task definition `{family}` is registered without a role or access keys"
                    );
                }
                let definition = TaskDefinition::for_app(self.config, &queue_url, &identity);
                let arn = self
                    .cloud
                    .containers
                    .register_task_definition(&definition)
                    .await?;
                Ok(TaskDefinitionRef {
                    arn,
                    identity: Some(identity),
                })
            },
        )
        .await?;
        Ok(reconciled)
    }

    async fn find_service(&self, service_name: &str) -> CloudResult<Option<String>> {
        let cluster = &self.config.cluster;
        Ok(self
            .cloud
            .containers
            .list_services(cluster)
            .await?
            .into_iter()
            .find(|arn| resource_name(arn) == service_name))
    }

    /// Ensures the worker service. A new service starts with no tasks; it is scaled when the
    /// fleet is launched.
    pub async fn ensure_service(
        &self,
        task_name: &str,
        service_name: &str,
    ) -> crate::Result<Reconciled<String>> {
        let cluster = &self.config.cluster;
        reconcile(
            "service",
            service_name,
            async || self.find_service(service_name).await,
            async || {
                self.cloud
                    .containers
                    .create_service(cluster, service_name, task_name, 0)
                    .await
            },
        )
        .await
    }

    pub async fn ensure_bucket(&self) -> crate::Result<Reconciled<String>> {
        let name = &self.config.bucket;
        let storage = &self.cloud.storage;
        reconcile(
            "bucket",
            name,
            async || {
                Ok(storage
                    .list_buckets()
                    .await?
                    .into_iter()
                    .find(|bucket| bucket == name))
            },
            async || {
                storage.create_bucket(name, &self.config.region).await?;
                Ok(name.clone())
            },
        )
        .await
    }

    /// Reconciles every resource of the application.
    pub async fn setup(&self) -> crate::Result<SetupReport> {
        let mut resources = ResourceSet::default();
        let mut outcomes = Vec::new();
        let mut record = |kind: &'static str, name: String, outcome: ReconcileOutcome| {
            outcomes.push(ResourceOutcome {
                kind,
                name,
                outcome,
            });
        };

        let queues = self.ensure_queue().await?;
        record(
            "dead letter queue",
            self.config.dead_letter_queue(),
            queues.dead_letter.outcome,
        );
        record("queue", self.config.queue_name(), queues.queue.outcome);
        resources.dead_letter_queue_url = Some(queues.dead_letter.id.url);
        resources.dead_letter_queue_arn = Some(queues.dead_letter.id.arn);
        resources.queue_url = Some(queues.queue.id.url);

        let cluster = self.ensure_cluster().await?;
        record("cluster", self.config.cluster.clone(), cluster.outcome);
        resources.cluster_arn = Some(cluster.id);

        let bucket = self.ensure_bucket().await?;
        record("bucket", self.config.bucket.clone(), bucket.outcome);
        resources.bucket = Some(bucket.id);

        let task_name = self.config.task_name();
        let task_definition = self.ensure_task_definition(&self.config.profile).await?;
        record("task definition", task_name.clone(), task_definition.outcome);
        let anonymous_tasks = task_definition.id.identity == Some(TaskIdentity::Anonymous);
        resources.task_definition_arn = Some(task_definition.id.arn);

        let service_name = self.config.service_name();
        let service = self.ensure_service(&task_name, &service_name).await?;
        record("service", service_name, service.outcome);
        resources.service_arn = Some(service.id);

        Ok(SetupReport {
            resources,
            outcomes,
            anonymous_tasks,
        })
    }

    /// Looks up the resources of the application without creating anything.
    pub async fn resolve(&self) -> crate::Result<ResourceSet> {
        let queues = &self.cloud.queues;
        let mut resources = ResourceSet {
            queue_url: queues.get_queue_url(&self.config.queue_name()).await?,
            dead_letter_queue_url: queues
                .get_queue_url(&self.config.dead_letter_queue())
                .await?,
            cluster_arn: self.find_cluster().await?,
            ..Default::default()
        };
        if let Some(url) = &resources.dead_letter_queue_url {
            resources.dead_letter_queue_arn = queues.get_queue_attributes(url).await?.arn;
        }
        if resources.cluster_arn.is_some() {
            resources.task_definition_arn =
                self.find_task_definition(&self.config.task_name()).await?;
            resources.service_arn = self.find_service(&self.config.service_name()).await?;
        }
        let buckets = self.cloud.storage.list_buckets().await?;
        resources.bucket = buckets.into_iter().find(|b| *b == self.config.bucket);
        Ok(resources)
    }
}
