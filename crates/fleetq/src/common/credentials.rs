//! Resolution of the identity that worker containers use to reach the cloud services.
//!
//! The identity comes from the local AWS CLI profile files. A `role_arn` is preferred and becomes
//! the task role; otherwise static access keys are forwarded to the containers.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

type Section = BTreeMap<String, String>;
type ProfileFile = BTreeMap<String, Section>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskIdentity {
    /// Containers assume this role.
    Role(String),
    /// Static keys are injected into the container environment.
    AccessKeys {
        access_key_id: String,
        secret_access_key: String,
    },
    /// Nothing usable was found, containers run without explicit credentials.
    Anonymous,
}

impl TaskIdentity {
    pub fn role_arn(&self) -> Option<&str> {
        match self {
            TaskIdentity::Role(arn) => Some(arn),
            _ => None,
        }
    }
}

fn aws_directory() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".aws"))
}

/// Resolves the identity of `profile` from `~/.aws/config` and `~/.aws/credentials`.
pub fn resolve_task_identity(profile: &str) -> TaskIdentity {
    match aws_directory() {
        Some(directory) => resolve_task_identity_in(&directory, profile),
        None => {
            log::warn!("Cannot determine home directory, AWS profile `{profile}` is not used");
            TaskIdentity::Anonymous
        }
    }
}

pub fn resolve_task_identity_in(aws_dir: &Path, profile: &str) -> TaskIdentity {
    let config = read_profile_file(&aws_dir.join("config"));
    let credentials = read_profile_file(&aws_dir.join("credentials"));

    let section = config
        .get(profile)
        .or_else(|| config.get(&format!("profile {profile}")));

    if let Some(section) = section {
        if let Some(role) = section.get("role_arn") {
            log::info!("Using role {role} for task credentials");
            return TaskIdentity::Role(role.clone());
        }
        if let Some(source) = section.get("source_profile") {
            if let Some(identity) = credentials.get(source).and_then(access_keys) {
                return identity;
            }
        }
        if let Some(identity) = access_keys(section) {
            return identity;
        }
    }
    if let Some(identity) = credentials.get(profile).and_then(access_keys) {
        return identity;
    }
    log::warn!("No credentials found for AWS profile `{profile}`");
    TaskIdentity::Anonymous
}

fn access_keys(section: &Section) -> Option<TaskIdentity> {
    let access_key_id = section.get("aws_access_key_id")?;
    let secret_access_key = section.get("aws_secret_access_key")?;
    Some(TaskIdentity::AccessKeys {
        access_key_id: access_key_id.clone(),
        secret_access_key: secret_access_key.clone(),
    })
}

fn read_profile_file(path: &Path) -> ProfileFile {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_profile_file(&content),
        Err(error) => {
            log::debug!("Cannot read {}: {error}", path.display());
            ProfileFile::default()
        }
    }
}

/// Parses the INI dialect used by the AWS CLI profile files.
fn parse_profile_file(content: &str) -> ProfileFile {
    let mut file = ProfileFile::default();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            file.entry(name.clone()).or_default();
            current = Some(name);
        } else if let (Some(section), Some((key, value))) = (&current, line.split_once('=')) {
            if let Some(section) = file.get_mut(section) {
                section.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    file
}

#[cfg(test)]
mod tests {
    use super::{TaskIdentity, parse_profile_file, resolve_task_identity_in};
    use tempfile::TempDir;

    fn aws_dir(config: &str, credentials: &str) -> TempDir {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        std::fs::write(dir.path().join("config"), config).unwrap();
        std::fs::write(dir.path().join("credentials"), credentials).unwrap();
        dir
    }

    #[test]
    fn parse_sections() {
        let file = parse_profile_file(
            "
# comment
[default]
region = us-east-1

[profile work]
role_arn = arn:aws:iam::123456789012:role/Work
",
        );
        assert_eq!(file["default"]["region"], "us-east-1");
        assert_eq!(
            file["profile work"]["role_arn"],
            "arn:aws:iam::123456789012:role/Work"
        );
    }

    #[test]
    fn role_is_preferred() {
        let dir = aws_dir(
            "[profile work]\nrole_arn = arn:aws:iam::1:role/R\naws_access_key_id = a\naws_secret_access_key = b\n",
            "",
        );
        assert_eq!(
            resolve_task_identity_in(dir.path(), "work"),
            TaskIdentity::Role("arn:aws:iam::1:role/R".to_string())
        );
    }

    #[test]
    fn keys_from_config_section() {
        let dir = aws_dir(
            "[work]\naws_access_key_id = testing\naws_secret_access_key = secret\n",
            "",
        );
        assert_eq!(
            resolve_task_identity_in(dir.path(), "work"),
            TaskIdentity::AccessKeys {
                access_key_id: "testing".to_string(),
                secret_access_key: "secret".to_string()
            }
        );
    }

    #[test]
    fn keys_from_source_profile() {
        let dir = aws_dir(
            "[profile work]\nsource_profile = base\n",
            "[base]\naws_access_key_id = k\naws_secret_access_key = s\n",
        );
        let identity = resolve_task_identity_in(dir.path(), "work");
        assert!(matches!(identity, TaskIdentity::AccessKeys { .. }));
        assert!(identity.role_arn().is_none());
    }

    #[test]
    fn missing_profile_is_anonymous() {
        let dir = aws_dir("[default]\nregion = eu-west-1\n", "");
        assert_eq!(
            resolve_task_identity_in(dir.path(), "missing"),
            TaskIdentity::Anonymous
        );
    }
}
