//! Persistent cron job store: `cron/<agentId>.json`, `{version: 1, jobs: […]}`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use oc_domain::error::Result;
use oc_store::JsonStore;

use crate::job::CronJob;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronFile {
    pub version: u32,
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

impl Default for CronFile {
    fn default() -> Self {
        Self {
            version: 1,
            jobs: Vec::new(),
        }
    }
}

pub struct CronStore {
    store: JsonStore<CronFile>,
}

impl CronStore {
    pub fn open(state_dir: &Path, agent_id: &str) -> Result<Self> {
        let path = state_dir.join("cron").join(format!("{agent_id}.json"));
        Ok(Self {
            store: JsonStore::load(path)?,
        })
    }

    pub fn jobs(&self) -> Vec<CronJob> {
        self.store.read(|f| f.jobs.clone())
    }

    pub fn get(&self, id: &Uuid) -> Option<CronJob> {
        self.store.read(|f| f.jobs.iter().find(|j| j.id == *id).cloned())
    }

    /// Apply `f` to the job list and persist. Returns `f`'s output.
    pub async fn mutate<R: Send>(
        &self,
        f: impl FnOnce(&mut Vec<CronJob>) -> R + Send,
    ) -> Result<R> {
        self.store.mutate(|file| f(&mut file.jobs)).await
    }
}
