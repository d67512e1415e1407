//! Storage for user profiles and owned resources.
//!
//! Records are kept as JSON values so one repository serves every resource
//! kind; handlers decode them into their typed form with
//! [`Stored::from_record`](crate::models::Stored::from_record).

use crate::models::{ResourceKind, UserProfile};
use adapt_admission::{ResourceError, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// One stored resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: u64,
    pub owner_id: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered account: its profile and password hash.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub profile: UserProfile,
    pub password_hash: String,
}

/// Owner-scoped resource and profile storage.
///
/// Every resource operation takes the owner: a record owned by someone else
/// reads as not found.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn list(&self, kind: ResourceKind, owner: &str) -> Result<Vec<Record>, ResourceError>;

    async fn get(&self, kind: ResourceKind, owner: &str, id: u64)
        -> Result<Record, ResourceError>;

    async fn create(
        &self,
        kind: ResourceKind,
        owner: &str,
        data: Value,
    ) -> Result<Record, ResourceError>;

    async fn update(
        &self,
        kind: ResourceKind,
        owner: &str,
        id: u64,
        data: Value,
    ) -> Result<Record, ResourceError>;

    async fn delete(&self, kind: ResourceKind, owner: &str, id: u64) -> Result<(), ResourceError>;

    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>, ResourceError>;

    async fn upsert_user(&self, profile: UserProfile) -> Result<UserProfile, ResourceError>;

    async fn list_users(&self) -> Result<Vec<UserProfile>, ResourceError>;

    /// Register a new account. Usernames are unique ignoring ASCII case.
    async fn create_account(
        &self,
        username: &str,
        password_hash: String,
    ) -> Result<UserProfile, ResourceError>;

    async fn find_account(&self, username: &str) -> Result<Option<Account>, ResourceError>;
}

#[derive(Default)]
struct Tables {
    records: HashMap<ResourceKind, BTreeMap<u64, Record>>,
    users: BTreeMap<String, UserProfile>,
    password_hashes: HashMap<String, String>,
}

impl Tables {
    fn username_taken(&self, username: &str, except: Option<&str>) -> bool {
        self.users
            .values()
            .any(|u| Some(u.id.as_str()) != except && u.username.eq_ignore_ascii_case(username))
    }
}

/// In-process repository.
#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn not_found(kind: ResourceKind) -> ResourceError {
    ResourceError::NotFound(format!("{} not found", kind.label()))
}

/// Reject `data` if another record of the same owner already uses its
/// unique field value.
fn check_unique(
    kind: ResourceKind,
    table: Option<&BTreeMap<u64, Record>>,
    owner: &str,
    data: &Value,
    except: Option<u64>,
) -> Result<(), ResourceError> {
    let (Some(field), Some(table)) = (kind.unique_field(), table) else {
        return Ok(());
    };
    let Some(wanted) = data.get(field) else {
        return Ok(());
    };

    let taken = table.values().any(|r| {
        r.owner_id == owner && Some(r.id) != except && r.data.get(field) == Some(wanted)
    });
    if taken {
        return Err(ResourceError::Conflict(format!(
            "{} with this {} already exists",
            kind.label(),
            field
        )));
    }
    Ok(())
}

#[async_trait]
impl ResourceRepository for MemoryRepository {
    async fn list(&self, kind: ResourceKind, owner: &str) -> Result<Vec<Record>, ResourceError> {
        let tables = self.tables.read();
        Ok(tables
            .records
            .get(&kind)
            .map(|t| t.values().filter(|r| r.owner_id == owner).cloned().collect())
            .unwrap_or_default())
    }

    async fn get(
        &self,
        kind: ResourceKind,
        owner: &str,
        id: u64,
    ) -> Result<Record, ResourceError> {
        let tables = self.tables.read();
        tables
            .records
            .get(&kind)
            .and_then(|t| t.get(&id))
            .filter(|r| r.owner_id == owner)
            .cloned()
            .ok_or_else(|| not_found(kind))
    }

    async fn create(
        &self,
        kind: ResourceKind,
        owner: &str,
        data: Value,
    ) -> Result<Record, ResourceError> {
        let mut tables = self.tables.write();
        check_unique(kind, tables.records.get(&kind), owner, &data, None)?;

        let now = Utc::now();
        let record = Record {
            id: self.allocate_id(),
            owner_id: owner.to_string(),
            data,
            created_at: now,
            updated_at: now,
        };
        tables
            .records
            .entry(kind)
            .or_default()
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        kind: ResourceKind,
        owner: &str,
        id: u64,
        data: Value,
    ) -> Result<Record, ResourceError> {
        let mut tables = self.tables.write();
        let table = tables
            .records
            .get_mut(&kind)
            .filter(|t| t.get(&id).is_some_and(|r| r.owner_id == owner))
            .ok_or_else(|| not_found(kind))?;
        check_unique(kind, Some(&*table), owner, &data, Some(id))?;

        let record = table.get_mut(&id).ok_or_else(|| not_found(kind))?;
        record.data = data;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, kind: ResourceKind, owner: &str, id: u64) -> Result<(), ResourceError> {
        let mut tables = self.tables.write();
        let table = tables.records.get_mut(&kind).ok_or_else(|| not_found(kind))?;
        if !table.get(&id).is_some_and(|r| r.owner_id == owner) {
            return Err(not_found(kind));
        }
        table.remove(&id);
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>, ResourceError> {
        Ok(self.tables.read().users.get(id).cloned())
    }

    async fn upsert_user(&self, profile: UserProfile) -> Result<UserProfile, ResourceError> {
        let mut tables = self.tables.write();
        if tables.username_taken(&profile.username, Some(&profile.id)) {
            return Err(ResourceError::Conflict(
                "Username is already taken".to_string(),
            ));
        }
        tables.users.insert(profile.id.clone(), profile.clone());
        Ok(profile)
    }

    async fn list_users(&self) -> Result<Vec<UserProfile>, ResourceError> {
        Ok(self.tables.read().users.values().cloned().collect())
    }

    async fn create_account(
        &self,
        username: &str,
        password_hash: String,
    ) -> Result<UserProfile, ResourceError> {
        let mut tables = self.tables.write();
        if tables.username_taken(username, None) {
            return Err(ResourceError::Conflict("User already exists".to_string()));
        }

        let profile = UserProfile {
            id: format!("user-{}", self.allocate_id()),
            username: username.to_string(),
            bio: None,
            role: Role::User,
            verified: true,
            updated_at: Utc::now(),
        };
        tables.users.insert(profile.id.clone(), profile.clone());
        tables
            .password_hashes
            .insert(profile.id.clone(), password_hash);
        Ok(profile)
    }

    async fn find_account(&self, username: &str) -> Result<Option<Account>, ResourceError> {
        let tables = self.tables.read();
        Ok(tables
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .and_then(|profile| {
                let password_hash = tables.password_hashes.get(&profile.id)?;
                Some(Account {
                    profile: profile.clone(),
                    password_hash: password_hash.clone(),
                })
            }))
    }
}
