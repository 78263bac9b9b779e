//! Selective sync rules
//!
//! Per-user partial replication scopes. A rule says "for this user, only
//! records of this collection whose `filter_field` equals `filter_value`
//! take part in sync". Rules narrow replication; they are not an access
//! control mechanism.
//!
//! Scope evaluation for one user and collection:
//! - no enabled rules: every record is in scope
//! - otherwise: a record is in scope if any enabled rule matches it

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreResult;
use crate::query::{matches_filter, Filter};
use crate::record::Record;
use crate::storage::atomic_write;

/// One selective sync rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectiveSyncRule {
    pub user_id: String,
    pub collection: String,
    pub filter_field: String,
    pub filter_value: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SelectiveSyncRule {
    pub fn new(
        user_id: impl Into<String>,
        collection: impl Into<String>,
        filter_field: impl Into<String>,
        filter_value: impl Into<Value>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            collection: collection.into(),
            filter_field: filter_field.into(),
            filter_value: filter_value.into(),
            enabled: true,
        }
    }

    /// Check if a record satisfies this rule
    pub fn matches(&self, record: &Record) -> bool {
        matches_filter(
            record,
            &Filter::eq(self.filter_field.clone(), self.filter_value.clone()),
        )
    }
}

/// Persistent rule set
#[derive(Debug, Default)]
pub struct SyncRules {
    rules: Vec<SelectiveSyncRule>,
    path: Option<PathBuf>,
}

impl SyncRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a rule set that persists to disk
    pub fn with_path(path: PathBuf) -> StoreResult<Self> {
        let mut rules = Self {
            rules: Vec::new(),
            path: Some(path.clone()),
        };
        if path.exists() {
            let json = fs::read_to_string(&path)?;
            rules.rules = serde_json::from_str(&json)?;
        }
        Ok(rules)
    }

    pub fn rules(&self) -> &[SelectiveSyncRule] {
        &self.rules
    }

    /// Add a rule
    pub fn add(&mut self, rule: SelectiveSyncRule) -> StoreResult<()> {
        self.rules.push(rule);
        self.save()
    }

    /// Enable or disable every rule for a user and collection
    pub fn set_enabled(&mut self, user_id: &str, collection: &str, enabled: bool) -> StoreResult<usize> {
        let mut count = 0;
        for rule in self
            .rules
            .iter_mut()
            .filter(|r| r.user_id == user_id && r.collection == collection)
        {
            rule.enabled = enabled;
            count += 1;
        }
        self.save()?;
        Ok(count)
    }

    /// Remove every rule for a user and collection
    pub fn remove(&mut self, user_id: &str, collection: &str) -> StoreResult<usize> {
        let before = self.rules.len();
        self.rules
            .retain(|r| !(r.user_id == user_id && r.collection == collection));
        let removed = before - self.rules.len();
        self.save()?;
        Ok(removed)
    }

    /// Enabled rules for a user and collection
    pub fn active_rules<'a>(
        &'a self,
        user_id: &'a str,
        collection: &'a str,
    ) -> impl Iterator<Item = &'a SelectiveSyncRule> + 'a {
        self.rules
            .iter()
            .filter(move |r| r.enabled && r.user_id == user_id && r.collection == collection)
    }

    /// Check if a record is in the user's sync scope
    ///
    /// Without an active user everything is in scope.
    pub fn in_scope(&self, user_id: Option<&str>, collection: &str, record: &Record) -> bool {
        let Some(user_id) = user_id else {
            return true;
        };
        let mut rules = self.active_rules(user_id, collection).peekable();
        if rules.peek().is_none() {
            return true;
        }
        rules.any(|rule| rule.matches(record))
    }

    /// Save rules to disk
    pub fn save(&self) -> StoreResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.rules)?;
        atomic_write(path, json.as_bytes())
    }
}
