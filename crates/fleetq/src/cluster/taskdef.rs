use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::config::AppConfig;
use crate::common::credentials::TaskIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfiguration {
    pub log_driver: String,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub cpu: u32,
    pub memory: u32,
    pub essential: bool,
    pub privileged: bool,
    pub environment: Vec<EnvironmentVariable>,
    pub log_configuration: LogConfiguration,
}

/// Template of the worker container registered in the container service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub family: String,
    pub container_definitions: Vec<ContainerDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_role_arn: Option<String>,
}

impl TaskDefinition {
    pub fn for_app(config: &AppConfig, queue_url: &str, identity: &TaskIdentity) -> Self {
        let mut environment = vec![
            variable("APP_NAME", &config.app_name),
            variable("SQS_QUEUE_URL", queue_url),
            variable("AWS_BUCKET", &config.bucket),
            variable("DOCKER_CORES", &config.docker_cores.to_string()),
            variable("LOG_GROUP_NAME", &config.log_group_name),
            variable("ECS_CLUSTER", &config.cluster),
        ];
        environment.extend(
            config
                .environment
                .iter()
                .map(|(name, value)| variable(name, value)),
        );
        if let TaskIdentity::AccessKeys {
            access_key_id,
            secret_access_key,
        } = identity
        {
            environment.push(variable("AWS_ACCESS_KEY_ID", access_key_id));
            environment.push(variable("AWS_SECRET_ACCESS_KEY", secret_access_key));
        }

        let options = BTreeMap::from([
            (
                "awslogs-group".to_string(),
                config.per_instance_log_group(),
            ),
            ("awslogs-region".to_string(), config.region.clone()),
            ("awslogs-stream-prefix".to_string(), config.app_name.clone()),
        ]);

        TaskDefinition {
            family: config.task_name(),
            container_definitions: vec![ContainerDefinition {
                name: config.app_name.clone(),
                image: config.docker_image.clone(),
                cpu: config.cpu_shares(),
                memory: config.memory,
                essential: true,
                privileged: true,
                environment,
                log_configuration: LogConfiguration {
                    log_driver: "awslogs".to_string(),
                    options,
                },
            }],
            task_role_arn: identity.role_arn().map(|arn| arn.to_string()),
        }
    }

    pub fn environment(&self) -> impl Iterator<Item = (&str, &str)> {
        self.container_definitions
            .iter()
            .flat_map(|c| c.environment.iter())
            .map(|v| (v.name.as_str(), v.value.as_str()))
    }
}

fn variable(name: &str, value: &str) -> EnvironmentVariable {
    EnvironmentVariable {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::TaskDefinition;
    use crate::common::credentials::TaskIdentity;
    use crate::tests::utils::test_config;
    use std::collections::BTreeMap;

    #[test]
    fn role_identity() {
        let config = test_config();
        let definition = TaskDefinition::for_app(
            &config,
            "https://queue/ExampleQueue",
            &TaskIdentity::Role("arn:aws:iam::1:role/worker".into()),
        );
        assert_eq!(definition.family, "ExampleTask");
        assert_eq!(
            definition.task_role_arn.as_deref(),
            Some("arn:aws:iam::1:role/worker")
        );
        let env: BTreeMap<_, _> = definition.environment().collect();
        assert_eq!(env["SQS_QUEUE_URL"], "https://queue/ExampleQueue");
        assert_eq!(env["ECS_CLUSTER"], "default");
        assert!(!env.contains_key("AWS_ACCESS_KEY_ID"));

        let json = serde_json::to_value(&definition).unwrap();
        assert_eq!(json["taskRoleArn"], "arn:aws:iam::1:role/worker");
        let container = &json["containerDefinitions"][0];
        assert_eq!(container["cpu"], 4096);
        assert_eq!(container["logConfiguration"]["logDriver"], "awslogs");
        assert_eq!(
            container["logConfiguration"]["options"]["awslogs-group"],
            "ExampleLogs_perInstance"
        );
    }

    #[test]
    fn access_key_identity() {
        let config = test_config();
        let definition = TaskDefinition::for_app(
            &config,
            "url",
            &TaskIdentity::AccessKeys {
                access_key_id: "AKID".into(),
                secret_access_key: "SECRET".into(),
            },
        );
        assert!(definition.task_role_arn.is_none());
        let env: BTreeMap<_, _> = definition.environment().collect();
        assert_eq!(env["AWS_ACCESS_KEY_ID"], "AKID");
        assert_eq!(env["AWS_SECRET_ACCESS_KEY"], "SECRET");

        let json = serde_json::to_value(&definition).unwrap();
        assert!(json.get("taskRoleArn").is_none());
    }
}
