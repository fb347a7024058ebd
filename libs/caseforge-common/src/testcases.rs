use crate::redis::testcases_key;
use crate::store::{SharedStore, StoreError};
use crate::types::TestCase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whole test set of one problem, stored as a single record so that
/// regeneration supersedes the previous set in one write instead of
/// merging with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestCaseSet {
    platform: String,
    problem_id: String,
    cases: Vec<TestCase>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TestCaseRepository {
    store: SharedStore,
}

impl TestCaseRepository {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Cases ordered by `testcase_id`; empty if none were generated yet
    pub async fn list(&self, platform: &str, problem_id: &str) -> Result<Vec<TestCase>, StoreError> {
        let key = testcases_key(platform, problem_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(Vec::new());
        };
        let set: TestCaseSet =
            serde_json::from_str(&raw).map_err(|source| StoreError::Codec { key, source })?;
        let mut cases = set.cases;
        cases.sort_by_key(|c| c.testcase_id);
        Ok(cases)
    }

    /// Replace the problem's entire set. All-or-nothing: either every case
    /// in `cases` is visible afterwards or the previous set is.
    pub async fn replace_all(
        &self,
        platform: &str,
        problem_id: &str,
        cases: &[TestCase],
    ) -> Result<(), StoreError> {
        let key = testcases_key(platform, problem_id);
        let set = TestCaseSet {
            platform: platform.to_string(),
            problem_id: problem_id.to_string(),
            cases: cases.to_vec(),
            updated_at: Utc::now(),
        };
        let raw = serde_json::to_string(&set).map_err(|source| StoreError::Codec {
            key: key.clone(),
            source,
        })?;
        self.store.put(&key, &raw).await
    }

    pub async fn clear(&self, platform: &str, problem_id: &str) -> Result<(), StoreError> {
        self.store.delete(&testcases_key(platform, problem_id)).await
    }
}
