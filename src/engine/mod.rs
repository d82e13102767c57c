mod cart;
mod catalog;
mod checkout;
mod compaction;
mod error;
mod locking;
mod queries;
mod settlement;
mod store;
mod sweep;

pub use error::EngineError;
pub(crate) use locking::now_ms;
pub use store::{ReservationIndex, ReservationOwner};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::audit::{AuditSink, CartAuditEntry, TracingAuditSink};
use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use store::{apply_to_cart, apply_to_product, ReplayState};

pub type SharedProductState = Arc<RwLock<ProductState>>;
pub type SharedCartState = Arc<RwLock<CartState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Flush what we have before compaction sees the file.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// One tenant's stock, reservations and carts.
///
/// Lock order: the commit gate (shared), then a cart lock, then product locks
/// in ascending id order. Every state change is appended to the WAL before it
/// is applied, while the locks it touches are held.
pub struct Engine {
    pub(super) products: DashMap<Ulid, SharedProductState>,
    pub(super) carts: DashMap<Ulid, SharedCartState>,
    pub(super) index: ReservationIndex,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) audit: Arc<dyn AuditSink>,
    pub(super) config: EngineConfig,
    /// Held shared by every mutation, exclusively by WAL compaction.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        Self::with_audit(wal_path, notify, config, Arc::new(TracingAuditSink))
    }

    /// Replays the log at `wal_path` and spawns its writer task. Must run
    /// inside a tokio runtime.
    pub fn with_audit(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
        audit: Arc<dyn AuditSink>,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let index = ReservationIndex::new();
        let mut state = ReplayState::default();
        for event in &replay.events {
            state.apply(event, &index);
        }
        if !replay.events.is_empty() {
            info!(
                "replayed {} events from {}: {} products, {} reservations, {} carts",
                replay.events.len(),
                wal_path.display(),
                state.products.len(),
                index.len(),
                state.carts.len()
            );
        }

        let products = state
            .products
            .into_iter()
            .map(|(id, ps)| (id, Arc::new(RwLock::new(ps))))
            .collect();
        let carts = state
            .carts
            .into_iter()
            .filter(|(_, cart)| !cart.is_empty())
            .map(|(id, cart)| (id, Arc::new(RwLock::new(cart))))
            .collect();

        Ok(Self {
            products,
            carts,
            index,
            wal_tx,
            notify,
            audit,
            config,
            commit_gate: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_product_state(&self, id: &Ulid) -> Option<SharedProductState> {
        self.products.get(id).map(|e| e.value().clone())
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    /// WAL-append + apply + notify for an event touching one product.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProductState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_product(ps, event, &self.index);
        self.notify.publish(event);
        Ok(())
    }

    /// Same for an event spanning several locked products.
    pub(super) async fn persist_and_apply_all<'a>(
        &self,
        guards: impl IntoIterator<Item = &'a mut locking::ProductGuard>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for guard in guards {
            apply_to_product(guard, event, &self.index);
        }
        self.notify.publish(event);
        Ok(())
    }

    pub(super) async fn persist_cart(
        &self,
        cart: &mut CartState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_cart(cart, event);
        Ok(())
    }

    pub(super) async fn record_audit(&self, entry: CartAuditEntry) {
        self.audit.record(entry).await;
    }
}
