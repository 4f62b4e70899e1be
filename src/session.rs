use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// A stored session together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<S> {
    pub revision: u64,
    pub session: S,
}

/// Storage interface for issuance and verification sessions.
///
/// Every state transition is a read followed by [SessionStore::compare_and_swap] with the
/// revision that was read; a transition based on a stale read fails with
/// [Error::Conflict] instead of overwriting the concurrent one.
#[async_trait]
pub trait SessionStore<S>: Debug + Send + Sync {
    /// Store a new session at revision 0.
    async fn insert(&self, id: &str, session: S) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Versioned<S>>;

    /// Replace the session if it is still at `expected_revision`, returning the new revision.
    async fn compare_and_swap(&self, id: &str, expected_revision: u64, session: S)
        -> Result<u64>;

    /// All sessions matching `predicate`, ordered by id.
    async fn find(
        &self,
        predicate: &(dyn for<'a> Fn(&'a S) -> bool + Send + Sync),
    ) -> Result<Vec<(String, Versioned<S>)>>;
}

/// A local in-memory store. Not for production use!
///
/// # Warning
/// This in-memory store should only be used for test purposes, it will not work for a distributed
/// deployment.
#[derive(Debug, Clone)]
pub struct MemoryStore<S> {
    store: Arc<Mutex<BTreeMap<String, Versioned<S>>>>,
}

impl<S> Default for MemoryStore<S> {
    fn default() -> Self {
        Self {
            store: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

impl<S> MemoryStore<S> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<S: Clone + Debug + Send + Sync + 'static> SessionStore<S> for MemoryStore<S> {
    async fn insert(&self, id: &str, session: S) -> Result<()> {
        let mut store = self.store.lock().await;
        if store.contains_key(id) {
            return Err(Error::Conflict(id.to_string()));
        }
        store.insert(
            id.to_string(),
            Versioned {
                revision: 0,
                session,
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Versioned<S>> {
        self.store
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session '{id}'")))
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected_revision: u64,
        session: S,
    ) -> Result<u64> {
        let mut store = self.store.lock().await;
        let current = store
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("session '{id}'")))?;
        if current.revision != expected_revision {
            return Err(Error::Conflict(id.to_string()));
        }
        current.revision += 1;
        current.session = session;
        Ok(current.revision)
    }

    async fn find(
        &self,
        predicate: &(dyn for<'a> Fn(&'a S) -> bool + Send + Sync),
    ) -> Result<Vec<(String, Versioned<S>)>> {
        Ok(self
            .store
            .lock()
            .await
            .iter()
            .filter(|(_, v)| predicate(&v.session))
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect())
    }
}

/// Helper for stores keyed by a session field: the single session matching `predicate`.
pub(crate) async fn find_one<S>(
    store: &dyn SessionStore<S>,
    predicate: &(dyn Fn(&S) -> bool + Send + Sync),
) -> Result<Option<(String, Versioned<S>)>> {
    Ok(store.find(predicate).await?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_revision_is_rejected() {
        let store = MemoryStore::<String>::new();
        store.insert("a", "created".into()).await.unwrap();
        assert!(matches!(
            store.insert("a", "again".into()).await,
            Err(Error::Conflict(_))
        ));

        let read = store.get("a").await.unwrap();
        let revision = store
            .compare_and_swap("a", read.revision, "first".into())
            .await
            .unwrap();
        assert_eq!(revision, 1);

        // A second writer that read revision 0 loses.
        let err = store
            .compare_and_swap("a", read.revision, "second".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.get("a").await.unwrap().session, "first");
    }

    #[tokio::test]
    async fn find_by_predicate() {
        let store = MemoryStore::<String>::new();
        store.insert("a", "x".into()).await.unwrap();
        store.insert("b", "y".into()).await.unwrap();
        let found = find_one(&store, &|s: &String| s == "y").await.unwrap().unwrap();
        assert_eq!(found.0, "b");
        assert!(matches!(
            store.get("c").await,
            Err(Error::NotFound(_))
        ));
    }
}
