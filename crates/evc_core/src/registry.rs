//! Onboarding and authentication gate for charging points.
//!
//! The registry decides which stations are allowed to exist. It is kept apart
//! from the coordinator's live view: the coordinator polls it and treats its
//! answers as advisory.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{RecordStore, get_typed, list_typed, put_typed};
use crate::{CoreError, Location, StationId, validate_station};

const PREFIX: &str = "registry/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub station_id: StationId,
    pub username: String,
    pub location: Location,
    pub price_per_kwh: f64,
    pub registered_at: DateTime<Utc>,
}

/// Issued once at registration; only the password hash is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub station_id: StationId,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRegistration {
    #[serde(flatten)]
    entry: RegistryEntry,
    password_hash: String,
}

pub struct Registry {
    store: Arc<dyn RecordStore>,
    // register/unregister are check-then-write sequences
    write_lock: Mutex<()>,
}

impl Registry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Registry {
            store,
            write_lock: Mutex::new(()),
        }
    }

    fn key(station_id: &str) -> String {
        format!("{PREFIX}{station_id}")
    }

    pub fn register(
        &self,
        station_id: &str,
        location: Location,
        price_per_kwh: f64,
    ) -> Result<Credentials, CoreError> {
        validate_station(station_id, &location, price_per_kwh)?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let key = Self::key(station_id);
        if self.store.get(&key)?.is_some() {
            return Err(CoreError::Conflict(format!(
                "station {station_id} is already registered"
            )));
        }

        let (username, password) = generate_credentials();
        let stored = StoredRegistration {
            entry: RegistryEntry {
                station_id: station_id.to_string(),
                username: username.clone(),
                location,
                price_per_kwh,
                registered_at: Utc::now(),
            },
            password_hash: hash_password(&password),
        };
        put_typed(self.store.as_ref(), &key, &stored)?;

        tracing::info!(station_id, username = %username, "station onboarded");

        Ok(Credentials {
            station_id: station_id.to_string(),
            username,
            password,
        })
    }

    /// Removing an id that is not registered is a `NotFound` error.
    pub fn unregister(&self, station_id: &str) -> Result<RegistryEntry, CoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let key = Self::key(station_id);
        let Some(stored) = get_typed::<StoredRegistration>(self.store.as_ref(), &key)? else {
            return Err(CoreError::station_not_found(station_id));
        };
        self.store.remove(&key)?;

        tracing::info!(station_id, "station unregistered");
        Ok(stored.entry)
    }

    pub fn get(&self, station_id: &str) -> Result<Option<RegistryEntry>, CoreError> {
        let stored: Option<StoredRegistration> =
            get_typed(self.store.as_ref(), &Self::key(station_id))?;
        Ok(stored.map(|stored| stored.entry))
    }

    pub fn list(&self) -> Result<Vec<RegistryEntry>, CoreError> {
        let stored: Vec<StoredRegistration> = list_typed(self.store.as_ref(), PREFIX)?;
        Ok(stored.into_iter().map(|stored| stored.entry).collect())
    }

    pub fn verify(
        &self,
        station_id: &str,
        username: &str,
        password: &str,
    ) -> Result<bool, CoreError> {
        let stored: Option<StoredRegistration> =
            get_typed(self.store.as_ref(), &Self::key(station_id))?;
        let Some(stored) = stored else {
            return Ok(false);
        };
        Ok(stored.entry.username == username && stored.password_hash == hash_password(password))
    }
}

fn generate_credentials() -> (String, String) {
    let tag = uuid::Uuid::new_v4().simple().to_string();
    let username = format!("cp_user_{}", &tag[..8]);
    let password = uuid::Uuid::new_v4().simple().to_string();
    (username, password)
}

fn hash_password(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn registers_and_lists_stations() {
        let registry = registry();
        let credentials = registry
            .register("CP-001", Location::new(40.5, -3.1), 0.30)
            .expect("registration should succeed");

        assert_eq!(credentials.station_id, "CP-001");
        assert!(credentials.username.starts_with("cp_user_"));
        assert_eq!(credentials.username.len(), "cp_user_".len() + 8);
        assert_eq!(credentials.password.len(), 32);

        let entries = registry.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].username, credentials.username);
        assert_eq!(entries[0].price_per_kwh, 0.30);
    }

    #[test]
    fn duplicate_registration_is_a_conflict() {
        let registry = registry();
        registry
            .register("CP-001", Location::new(40.5, -3.1), 0.30)
            .unwrap();
        let result = registry.register("CP-001", Location::new(1.0, 1.0), 0.50);
        assert!(matches!(result, Err(CoreError::Conflict(_))));
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn unregister_then_register_again() {
        let registry = registry();
        registry
            .register("CP-001", Location::new(40.5, -3.1), 0.30)
            .unwrap();
        let removed = registry.unregister("CP-001").unwrap();
        assert_eq!(removed.station_id, "CP-001");

        let second = registry.unregister("CP-001");
        assert_eq!(second, Err(CoreError::station_not_found("CP-001")));

        assert!(registry
            .register("CP-001", Location::new(40.5, -3.1), 0.35)
            .is_ok());
    }

    #[test]
    fn verifies_issued_credentials_only() {
        let registry = registry();
        let credentials = registry
            .register("CP-001", Location::new(40.5, -3.1), 0.30)
            .unwrap();

        assert!(registry
            .verify("CP-001", &credentials.username, &credentials.password)
            .unwrap());
        assert!(!registry
            .verify("CP-001", &credentials.username, "wrong")
            .unwrap());
        assert!(!registry
            .verify("CP-001", "cp_user_00000000", &credentials.password)
            .unwrap());
        assert!(!registry
            .verify("CP-002", &credentials.username, &credentials.password)
            .unwrap());
    }

    #[test]
    fn never_stores_the_plain_password() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(store.clone());
        let credentials = registry
            .register("CP-001", Location::new(40.5, -3.1), 0.30)
            .unwrap();

        let raw = store.get("registry/CP-001").unwrap().unwrap();
        assert!(!raw.to_string().contains(&credentials.password));
        assert_eq!(raw["passwordHash"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn rejects_invalid_onboarding_data() {
        let registry = registry();
        assert!(matches!(
            registry.register("", Location::new(0.0, 0.0), 0.30),
            Err(CoreError::Validation(_))
        ));
    }
}
