use std::path::Path;

use serde_json::{Map, Value};

use crate::cloud::QueueService;
use crate::common::error::FleetError;

/// Keys starting with this prefix are comments of the job file.
const COMMENT_PREFIX: char = '_';
const GROUPS_KEY: &str = "groups";
const GROUP_KEY: &str = "group";

/// Work to be done: fields shared by all work units and one payload per unit.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescription {
    template: Map<String, Value>,
    groups: Vec<Value>,
}

impl JobDescription {
    pub fn parse(data: &str) -> crate::Result<Self> {
        let value: Value = serde_json::from_str(data)
            .map_err(|error| FleetError::InvalidJobFile(error.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(FleetError::InvalidJobFile(
                "the job file must contain a JSON object".into(),
            ));
        };
        let groups = match fields.remove(GROUPS_KEY) {
            Some(Value::Array(groups)) => groups,
            Some(_) => {
                return Err(FleetError::InvalidJobFile(format!(
                    "`{GROUPS_KEY}` must be an array"
                )));
            }
            None => {
                return Err(FleetError::InvalidJobFile(format!(
                    "`{GROUPS_KEY}` is missing"
                )));
            }
        };
        let template = fields
            .into_iter()
            .filter(|(key, _)| !key.starts_with(COMMENT_PREFIX))
            .collect();
        Ok(Self { template, groups })
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|error| {
            FleetError::InvalidJobFile(format!("cannot read {}: {error}", path.display()))
        })?;
        Self::parse(&data)
    }

    pub fn template(&self) -> &Map<String, Value> {
        &self.template
    }

    pub fn groups(&self) -> &[Value] {
        &self.groups
    }

    /// One message per group, in group order.
    pub fn messages(&self) -> impl Iterator<Item = Map<String, Value>> + '_ {
        self.groups.iter().map(|group| {
            let mut message = self.template.clone();
            message.insert(GROUP_KEY.to_string(), group.clone());
            message
        })
    }
}

/// The work queue of a reconciled application.
pub struct JobQueue<'a> {
    queues: &'a dyn QueueService,
    name: String,
    url: String,
}

impl<'a> JobQueue<'a> {
    pub async fn open(queues: &'a dyn QueueService, name: &str) -> crate::Result<Self> {
        let url = queues
            .get_queue_url(name)
            .await?
            .ok_or_else(|| FleetError::QueueUnavailable(name.to_string()))?;
        Ok(Self {
            queues,
            name: name.to_string(),
            url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Enqueues one message per group of `job` and returns the message IDs.
    ///
    /// The first failing send is returned as is; messages sent before it stay in the queue.
    pub async fn submit(&self, job: &JobDescription) -> crate::Result<Vec<String>> {
        let mut ids = Vec::with_capacity(job.groups().len());
        for message in job.messages() {
            let body = serde_json::to_string(&message)?;
            let id = self.queues.send_message(&self.url, &body).await?;
            log::debug!("Message {id} sent to {}", self.name);
            ids.push(id);
        }
        log::info!("{} job(s) submitted to queue {}", ids.len(), self.name);
        Ok(ids)
    }

    /// Number of messages waiting or being processed.
    pub async fn depth(&self) -> crate::Result<u64> {
        Ok(self.queues.get_queue_attributes(&self.url).await?.depth())
    }
}
