use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which producer materializes a target's artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    RemoteFetch,
    Mysql,
    Postgresql,
    Mongodb,
    Sqlite,
    CustomCommand,
}

impl TargetKind {
    pub const ALL: [TargetKind; 6] = [
        TargetKind::RemoteFetch,
        TargetKind::Mysql,
        TargetKind::Postgresql,
        TargetKind::Mongodb,
        TargetKind::Sqlite,
        TargetKind::CustomCommand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::RemoteFetch => "remote-fetch",
            TargetKind::Mysql => "mysql",
            TargetKind::Postgresql => "postgresql",
            TargetKind::Mongodb => "mongodb",
            TargetKind::Sqlite => "sqlite",
            TargetKind::CustomCommand => "custom-command",
        }
    }

    pub fn is_database(&self) -> bool {
        !matches!(self, TargetKind::RemoteFetch)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl FromStr for TargetKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Repository flavour on the content hub.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    Dataset,
    Model,
    Space,
}

impl RepoType {
    /// Probe order when no hint is configured.
    pub const PROBE_ORDER: [RepoType; 3] = [RepoType::Dataset, RepoType::Model, RepoType::Space];

    pub fn as_str(&self) -> &'static str {
        match self {
            RepoType::Dataset => "dataset",
            RepoType::Model => "model",
            RepoType::Space => "space",
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters handed to a dump utility.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DbConnection {
    pub db_name: String,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Only consulted by the postgresql producer.
    pub ssl_mode: Option<String>,
}

/// Producer-specific locator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    RemoteFetch {
        repo_id: String,
        #[serde(skip_serializing)]
        token: Option<String>,
        type_hint: Option<RepoType>,
    },
    Database(DbConnection),
    File {
        path: PathBuf,
    },
    Command {
        template: String,
        connection: DbConnection,
        extension: String,
    },
}

/// One configured backup job. Read-only once loaded.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Target {
    pub identity: String,
    pub kind: TargetKind,
    pub source: Source,
    pub destination_path: String,
    pub retention_count: NonZeroU32,
    pub expected_name_prefix: Option<String>,
    pub format_suffix: Option<String>,
}

impl Target {
    /// Account part of an `owner/name` identity.
    pub fn owner(&self) -> Option<&str> {
        self.identity.split_once('/').map(|(owner, _)| owner)
    }

    /// Last path segment of the identity, the default naming prefix.
    pub fn short_name(&self) -> &str {
        self.identity
            .rsplit('/')
            .next()
            .unwrap_or(self.identity.as_str())
    }

    pub fn retention(&self) -> usize {
        self.retention_count.get() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(identity: &str) -> Target {
        Target {
            identity: identity.to_string(),
            kind: TargetKind::RemoteFetch,
            source: Source::RemoteFetch {
                repo_id: identity.to_string(),
                token: None,
                type_hint: None,
            },
            destination_path: "/backups/".to_string(),
            retention_count: NonZeroU32::new(2).unwrap(),
            expected_name_prefix: None,
            format_suffix: None,
        }
    }

    #[test]
    fn owner_and_short_name_split_identity() {
        let t = target("alice/data1");
        assert_eq!(t.owner(), Some("alice"));
        assert_eq!(t.short_name(), "data1");
    }

    #[test]
    fn plain_alias_has_no_owner() {
        let t = target("shop_db");
        assert_eq!(t.owner(), None);
        assert_eq!(t.short_name(), "shop_db");
    }

    #[test]
    fn kind_parses_its_own_label() {
        for kind in TargetKind::ALL {
            assert_eq!(kind.as_str().parse::<TargetKind>(), Ok(kind));
        }
        assert!("oracle".parse::<TargetKind>().is_err());
    }

    #[test]
    fn secrets_are_not_serialized() {
        let mut t = target("alice/data1");
        t.source = Source::RemoteFetch {
            repo_id: "alice/data1".into(),
            token: Some("hf_secret".into()),
            type_hint: Some(RepoType::Space),
        };
        let json = serde_json::to_string(&t).unwrap();
        assert!(!json.contains("hf_secret"));
        assert!(json.contains("\"remote-fetch\""));
    }
}
