use std::time::Duration;

use redb::ReadableTable;
use tokio::time;
use tracing::{debug, info, warn};

use super::db::{decode_record, Store, SECRETS};
use super::error::SecretError;

impl Store {
    /// Remove all expired (or undecodable) records. Returns how many were
    /// actually deleted; ids consumed concurrently are not counted.
    pub fn sweep_expired(&self) -> Result<usize, SecretError> {
        self.sweep_expired_at(Self::now())
    }

    pub(crate) fn sweep_expired_at(&self, now: i64) -> Result<usize, SecretError> {
        let candidates = self.expired_candidates(now)?;
        self.remove_expired(&candidates, now)
    }

    /// Ids of records expired at `now` or undecodable. Runs in a read
    /// transaction and never waits on the write gate.
    pub(crate) fn expired_candidates(&self, now: i64) -> Result<Vec<String>, SecretError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let mut ids = Vec::new();
        for item in table.iter()? {
            let (k, v) = item?;
            let reclaim = match decode_record(v.value()) {
                Ok((record, _mode)) => record.is_expired(now),
                Err(e) => {
                    warn!(id = %k.value(), error = %e, "sweeping undecodable secret");
                    true
                }
            };
            if reclaim {
                ids.push(k.value().to_owned());
            }
        }
        Ok(ids)
    }

    /// Delete `ids` in one write transaction. Each record is re-read first
    /// and only removed if it is still expired (or undecodable).
    pub(crate) fn remove_expired(&self, ids: &[String], now: i64) -> Result<usize, SecretError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        let mut removed = 0usize;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            for id in ids {
                let reclaim = match table.get(id.as_str())? {
                    None => false,
                    Some(guard) => match decode_record(guard.value()) {
                        Ok((record, _mode)) => record.is_expired(now),
                        Err(_) => true,
                    },
                };
                if reclaim && table.remove(id.as_str())?.is_some() {
                    removed += 1;
                }
            }
        }
        write_txn.commit()?;

        if removed > 0 {
            info!(removed, "swept expired secrets");
        }
        Ok(removed)
    }

    /// One sweep pass for async callers. The scan runs on the blocking pool
    /// without the write gate; only the delete transaction waits for it,
    /// bounded by `timeout`.
    pub async fn sweep(&self, timeout: Duration) -> Result<usize, SecretError> {
        self.sweep_at(timeout, Self::now()).await
    }

    pub(crate) async fn sweep_at(&self, timeout: Duration, now: i64) -> Result<usize, SecretError> {
        let store = self.clone();
        let candidates = tokio::task::spawn_blocking(move || store.expired_candidates(now))
            .await
            .map_err(|e| SecretError::StorageUnavailable(format!("sweep scan failed: {e}")))??;

        if candidates.is_empty() {
            return Ok(0);
        }
        self.with_writer(timeout, move |store| store.remove_expired(&candidates, now))
            .await
    }

    /// Spawn a background Tokio task that runs [`Store::sweep`] every `interval`.
    pub fn spawn_sweep(self, interval: Duration, timeout: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                match self.sweep(timeout).await {
                    Ok(0) => debug!("sweep found nothing to reclaim"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "background sweep error"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::store::codec::Payload;
    use crate::store::db::tests::{bulk_insert, make_store};
    use crate::store::db::Store;
    use crate::store::error::SecretError;

    #[test]
    fn sweep_removes_only_expired() {
        let (s, _dir) = make_store();
        let short = s.create_at(&Payload::text("short"), 1, 0).unwrap();
        let long = s.create_at(&Payload::text("long"), 3600, 0).unwrap();

        assert_eq!(s.sweep_expired_at(500).unwrap(), 0);
        assert_eq!(s.sweep_expired_at(5_000).unwrap(), 1);
        assert_eq!(s.len().unwrap(), 1);

        assert!(matches!(
            s.consume_at(&short.token(), 5_000),
            Err(SecretError::NotFound)
        ));
        let payload = s.consume_at(&long.token(), 5_000).unwrap();
        assert_eq!(payload.message.as_deref(), Some("long"));
    }

    #[test]
    fn sweep_is_idempotent() {
        let (s, _dir) = make_store();
        s.create_at(&Payload::text("a"), 1, 0).unwrap();
        s.create_at(&Payload::text("b"), 1, 0).unwrap();
        assert_eq!(s.sweep_expired_at(10_000).unwrap(), 2);
        assert_eq!(s.sweep_expired_at(10_000).unwrap(), 0);
    }

    #[test]
    fn consume_of_expired_still_refused_before_sweep() {
        let (s, _dir) = make_store();
        let created = s.create_at(&Payload::text("late"), 1, 0).unwrap();
        // No sweep has run; consume enforces expiry on its own.
        assert!(matches!(
            s.consume_at(&created.token(), 1_001),
            Err(SecretError::NotFound)
        ));
        assert_eq!(s.sweep_expired_at(1_001).unwrap(), 0);
    }

    #[test]
    fn sweep_racing_consume_deletes_once() {
        let (s, _dir) = make_store();
        let tokens: Vec<String> = (0..32)
            .map(|i| {
                s.create_at(&Payload::text(format!("s{i}")), 1, 0)
                    .unwrap()
                    .token()
            })
            .collect();

        let sweeper = {
            let s = s.clone();
            std::thread::spawn(move || s.sweep_expired_at(2_000).unwrap())
        };
        let consumer = {
            let s = s.clone();
            std::thread::spawn(move || {
                tokens
                    .iter()
                    .filter(|t| s.consume_at(t, 2_000).is_ok())
                    .count()
            })
        };

        let swept = sweeper.join().unwrap();
        let served = consumer.join().unwrap();
        assert_eq!(served, 0, "expired secrets must never be served");
        assert!(swept <= 32);
        assert_eq!(s.len().unwrap(), 0);
    }

    #[test]
    fn removal_rechecks_each_record() {
        let (s, _dir) = make_store();
        let old = s.create_at(&Payload::text("old"), 1, 0).unwrap();
        let live = s.create_at(&Payload::text("live"), 3600, 0).unwrap();

        // A stale candidate list must not take a live record with it.
        let ids = vec![old.id.clone(), live.id.clone(), "gone".to_owned()];
        assert_eq!(s.remove_expired(&ids, 5_000).unwrap(), 1);
        assert_eq!(s.len().unwrap(), 1);
        assert!(s.consume_at(&live.token(), 5_000).is_ok());
    }

    #[tokio::test]
    async fn scan_runs_without_the_write_gate() {
        let (s, _dir) = make_store();
        bulk_insert(&s, 100, 0, 3600);
        let held = s.write_gate.clone().lock_owned().await;

        // Nothing expired: the pass completes although the gate is held.
        assert_eq!(
            s.sweep_at(Duration::from_millis(50), 1_000).await.unwrap(),
            0
        );

        // Something expired: the delete step has to wait for the gate.
        let err = s
            .sweep_at(Duration::from_millis(50), 4_000_000)
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::StorageUnavailable(_)));
        assert_eq!(s.len().unwrap(), 100);

        drop(held);
        assert_eq!(
            s.sweep_at(Duration::from_secs(1), 4_000_000).await.unwrap(),
            100
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn consume_is_not_starved_by_large_sweep() {
        let (s, _dir) = make_store();
        bulk_insert(&s, 20_000, Store::now(), 3600);
        let token = s.create(&Payload::text("live"), 3600).unwrap().token();

        let sweeper = {
            let s = s.clone();
            tokio::spawn(async move { s.sweep(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let payload = s
            .with_writer(Duration::from_millis(20), move |st| st.consume(&token))
            .await
            .unwrap();
        assert_eq!(payload.message.as_deref(), Some("live"));

        assert_eq!(sweeper.await.unwrap().unwrap(), 0);
        assert_eq!(s.len().unwrap(), 20_000);
    }

    #[tokio::test]
    async fn background_sweep_reclaims() {
        let (s, _dir) = make_store();
        s.create_at(&Payload::text("old"), 1, 0).unwrap();
        let handle = s
            .clone()
            .spawn_sweep(Duration::from_millis(20), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();
        assert_eq!(s.len().unwrap(), 0);
    }
}
