use std::thread;

use anyhow::Result;
use chrono::Utc;
use shared::types::{DeviceSetDelta, PresenceRecord};
use tokio::sync::{mpsc, oneshot, watch};

use crate::store::{db::StoreDb, hash};

/// Commands sent to the store thread.
pub enum StoreCommand {
    /// Commit one fully successful polling cycle: vanished devices lose
    /// their `present` flag, current records are upserted, and the retained
    /// delta is replaced. Nothing is deleted.
    CommitCycle {
        records: Vec<PresenceRecord>,
        delta: DeviceSetDelta,
        reply: oneshot::Sender<Result<()>>,
    },
    GetAll(oneshot::Sender<Result<Vec<PresenceRecord>>>),
    GetOne(String, oneshot::Sender<Result<Option<PresenceRecord>>>),
    /// The explicit downstream removal act.
    Remove(String, oneshot::Sender<Result<bool>>),
    Delta(oneshot::Sender<DeviceSetDelta>),
    Shutdown,
}

/// Handle to the device presence store.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn the store thread owning the database.
    pub fn spawn(db: StoreDb, hash_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        let recompute_hash = |db: &StoreDb, hash_tx: &watch::Sender<String>| {
            if let Ok(records) = db.get_all() {
                let new_hash = hash::compute_hash(&records);
                let _ = hash_tx.send(new_hash);
            }
        };

        thread::spawn(move || {
            let mut last_delta = DeviceSetDelta::default();

            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::CommitCycle {
                        records,
                        delta,
                        reply,
                    } => {
                        let result = (|| {
                            db.mark_absent(&delta.removed, Utc::now())?;
                            for record in &records {
                                db.upsert_record(record)?;
                            }
                            Ok(())
                        })();
                        if result.is_ok() {
                            last_delta = delta;
                            recompute_hash(&db, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::GetAll(reply) => {
                        let _ = reply.send(db.get_all());
                    }
                    StoreCommand::GetOne(mac, reply) => {
                        let _ = reply.send(db.get(&mac));
                    }
                    StoreCommand::Remove(mac, reply) => {
                        let result = db.remove(&mac);
                        if matches!(&result, Ok(true)) {
                            recompute_hash(&db, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::Delta(reply) => {
                        let _ = reply.send(last_delta.clone());
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Commit a completed cycle's records and membership delta.
    pub async fn commit_cycle(
        &self,
        records: Vec<PresenceRecord>,
        delta: DeviceSetDelta,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::CommitCycle {
                records,
                delta,
                reply,
            })
            .await?;
        rx.await?
    }

    /// All known device records, present and vanished.
    pub async fn get_all(&self) -> Result<Vec<PresenceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetAll(reply)).await?;
        rx.await?
    }

    /// One device by normalized MAC.
    pub async fn get_one(&self, mac: String) -> Result<Option<PresenceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetOne(mac, reply)).await?;
        rx.await?
    }

    /// Delete a device record. Returns true if the row existed.
    pub async fn remove(&self, mac: String) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Remove(mac, reply)).await?;
        rx.await?
    }

    /// The membership delta from the most recent completed cycle.
    pub async fn delta(&self) -> Result<DeviceSetDelta> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Delta(reply)).await?;
        Ok(rx.await?)
    }

    /// Shutdown the store thread.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}
