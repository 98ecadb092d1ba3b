use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::model::{BranchId, TopicId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    pub supported_topic_ids: Vec<TopicId>,
}

impl Branch {
    pub fn supports(&self, topic: &TopicId) -> bool {
        self.supported_topic_ids.contains(topic)
    }
}

/// Read-only topic/branch reference data. The engine never mutates it.
pub trait Catalog: Send + Sync {
    fn topics(&self) -> &[Topic];
    fn branches(&self) -> &[Branch];

    fn topic(&self, id: &TopicId) -> Option<&Topic> {
        self.topics().iter().find(|t| &t.id == id)
    }

    fn branch(&self, id: &BranchId) -> Option<&Branch> {
        self.branches().iter().find(|b| &b.id == id)
    }

    fn topic_exists(&self, id: &TopicId) -> bool {
        self.topic(id).is_some()
    }

    fn branch_supports_topic(&self, branch: &BranchId, topic: &TopicId) -> bool {
        self.branch(branch).is_some_and(|b| b.supports(topic))
    }

    fn branches_for_topic(&self, topic: &TopicId) -> Vec<&Branch> {
        self.branches().iter().filter(|b| b.supports(topic)).collect()
    }
}

/// Catalog held entirely in memory, loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticCatalog {
    #[serde(default)]
    topics: Vec<Topic>,
    #[serde(default)]
    branches: Vec<Branch>,
}

impl StaticCatalog {
    pub fn new(topics: Vec<Topic>, branches: Vec<Branch>) -> Result<Self, ConfigError> {
        let catalog = Self { topics, branches };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let catalog: StaticCatalog =
            toml::from_str(src).map_err(|e| ConfigError::Catalog(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Catalog(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&src)
    }

    /// Built-in reference data used when no catalog file is configured.
    pub fn seed() -> Self {
        let topic = |id: &str, name: &str, description: &str| Topic {
            id: id.into(),
            name: name.into(),
            description: description.into(),
        };
        let branch = |id: &str, name: &str, address: &str, phone: &str, topics: &[&str]| Branch {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            phone: phone.into(),
            supported_topic_ids: topics.iter().map(|t| TopicId::from(*t)).collect(),
        };
        Self {
            topics: vec![
                topic("1", "Personal Loans", "Apply for personal loans, discuss rates and terms"),
                topic("2", "Credit Cards", "Apply for credit cards or discuss existing accounts"),
                topic("3", "Business Banking", "Open business accounts, loans, and merchant services"),
                topic("4", "Mortgage Services", "Home loans, refinancing, and mortgage consultations"),
                topic("5", "Investment Advisory", "Financial planning and investment consultation"),
            ],
            branches: vec![
                branch(
                    "1",
                    "Downtown Main Branch",
                    "123 Main Street, Suite 100, Downtown, CA 90001",
                    "(555) 123-4567",
                    &["1", "2", "3", "4", "5"],
                ),
                branch(
                    "2",
                    "Westside Branch",
                    "456 West Avenue, Westside, CA 90002",
                    "(555) 234-5678",
                    &["1", "2", "4"],
                ),
                branch(
                    "3",
                    "Business District Branch",
                    "789 Commerce Blvd, Business District, CA 90003",
                    "(555) 345-6789",
                    &["2", "3", "5"],
                ),
                branch(
                    "4",
                    "Suburban Plaza Branch",
                    "321 Plaza Drive, Suburban, CA 90004",
                    "(555) 456-7890",
                    &["1", "2", "4"],
                ),
            ],
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut topic_ids = HashSet::new();
        for t in &self.topics {
            if !topic_ids.insert(&t.id) {
                return Err(ConfigError::Catalog(format!("duplicate topic id {}", t.id)));
            }
        }
        let mut branch_ids = HashSet::new();
        for b in &self.branches {
            if !branch_ids.insert(&b.id) {
                return Err(ConfigError::Catalog(format!("duplicate branch id {}", b.id)));
            }
            if let Some(unknown) = b.supported_topic_ids.iter().find(|t| !topic_ids.contains(t)) {
                return Err(ConfigError::Catalog(format!(
                    "branch {} supports unknown topic {unknown}",
                    b.id
                )));
            }
        }
        Ok(())
    }
}

impl Catalog for StaticCatalog {
    fn topics(&self) -> &[Topic] {
        &self.topics
    }

    fn branches(&self) -> &[Branch] {
        &self.branches
    }
}
