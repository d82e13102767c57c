use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::AuthSource;
use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::model::Event;
use crate::observability::{self, op_label};
use crate::protocol::{self, ProtocolError, Request};
use crate::tenant::TenantManager;

const OUTBOX_CAPACITY: usize = 1024;

fn codec_err(e: LinesCodecError) -> ProtocolError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => ProtocolError::LineTooLong,
        LinesCodecError::Io(e) => ProtocolError::Io(e),
    }
}

/// Per-connection state. The tenant engine is bound by the hello handshake.
struct Session {
    tenant: Option<String>,
    engine: Option<Arc<Engine>>,
    listens: HashMap<Ulid, JoinHandle<()>>,
    outbox: mpsc::Sender<String>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, task) in self.listens.drain() {
            task.abort();
        }
    }
}

/// Serve one client until it disconnects. Requests are answered strictly in
/// order; notifications for listened products are written between replies.
pub async fn process_connection<S>(
    socket: S,
    tenants: Arc<TenantManager>,
    auth: Arc<dyn AuthSource>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_LEN));
    let (outbox, mut inbox) = mpsc::channel(OUTBOX_CAPACITY);
    let mut session = Session {
        tenant: None,
        engine: None,
        listens: HashMap::new(),
        outbox,
    };

    loop {
        // Only the reads race; a request is always handled to completion.
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        let e = codec_err(e);
                        if matches!(e, ProtocolError::LineTooLong) {
                            framed.send(protocol::protocol_error(&e)).await.map_err(codec_err)?;
                        }
                        return Err(e);
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let (reply, fatal) = session.handle_line(&line, &tenants, auth.as_ref()).await;
                framed.send(reply).await.map_err(codec_err)?;
                if let Some(e) = fatal {
                    return Err(e);
                }
            }
            Some(note) = inbox.recv() => {
                framed.send(note).await.map_err(codec_err)?;
            }
        }
    }

    if let Some(tenant) = &session.tenant {
        debug!("client of tenant {tenant} disconnected");
    }
    Ok(())
}

impl Session {
    async fn handle_line(
        &mut self,
        line: &str,
        tenants: &TenantManager,
        auth: &dyn AuthSource,
    ) -> (String, Option<ProtocolError>) {
        let req = match protocol::parse_request(line) {
            Ok(req) => req,
            Err(e) => {
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => "invalid", "status" => "error")
                    .increment(1);
                return (protocol::protocol_error(&e), None);
            }
        };
        let op = op_label(&req);
        let start = Instant::now();

        let (reply, status, fatal) = match req {
            Request::Hello { tenant, password } => {
                match self.hello(tenant, &password, tenants, auth).await {
                    Ok(data) => (protocol::ok(data), "ok", None),
                    Err(e) => {
                        let reply = protocol::protocol_error(&e);
                        (reply, "error", e.is_fatal().then_some(e))
                    }
                }
            }
            req => match self.engine.clone() {
                None => (
                    protocol::protocol_error(&ProtocolError::NotAuthenticated),
                    "error",
                    None,
                ),
                Some(engine) => match self.execute(&engine, req).await {
                    Ok(data) => (protocol::ok(data), "ok", None),
                    Err(e) => (protocol::engine_error(&e), "error", None),
                },
            },
        };

        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());
        (reply, fatal)
    }

    async fn hello(
        &mut self,
        tenant: String,
        password: &str,
        tenants: &TenantManager,
        auth: &dyn AuthSource,
    ) -> Result<Value, ProtocolError> {
        if self.engine.is_some() {
            return Err(ProtocolError::AlreadyAuthenticated);
        }
        if !auth.authenticate(&tenant, password).await {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            warn!("authentication failed for tenant {tenant}");
            return Err(ProtocolError::AuthFailed);
        }
        let engine = tenants
            .get_or_create(&tenant)
            .map_err(|e| ProtocolError::Tenant(e.to_string()))?;
        self.engine = Some(engine);
        let data = json!({ "tenant": tenant });
        self.tenant = Some(tenant);
        Ok(data)
    }

    async fn execute(&mut self, engine: &Engine, req: Request) -> Result<Value, EngineError> {
        fn data(v: impl serde::Serialize) -> Value {
            serde_json::to_value(v).unwrap_or(Value::Null)
        }

        match req {
            Request::Hello { .. } => unreachable!("hello handled before dispatch"),
            Request::CreateProduct {
                id,
                name,
                unit_price,
                stock_total,
            } => {
                let id = id.unwrap_or_else(Ulid::new);
                engine
                    .create_product(id, name, unit_price, stock_total)
                    .await
                    .map(data)
            }
            Request::AdjustStock { id, stock_total } => {
                engine.adjust_stock(id, stock_total).await.map(data)
            }
            Request::DeleteProduct { id } => {
                engine.delete_product(id).await?;
                Ok(json!({ "deleted": id }))
            }
            Request::GetProduct { id } => engine.get_product(id).await.map(data),
            Request::ListProducts => engine.list_products().await.map(data),
            Request::AddToCart {
                user_id,
                product_id,
                quantity,
            } => engine.add_to_cart(user_id, product_id, quantity).await.map(data),
            Request::UpdateCartItem {
                user_id,
                product_id,
                quantity,
            } => engine
                .update_cart_item(user_id, product_id, quantity)
                .await
                .map(data),
            Request::RemoveCartItem {
                user_id,
                product_id,
            } => engine.remove_cart_item(user_id, product_id).await.map(data),
            Request::ClearCart { user_id } => engine.clear_cart(user_id).await.map(data),
            Request::BulkUpdateCart { user_id, items } => {
                let updates = items
                    .into_iter()
                    .map(|item| (item.product_id, item.quantity))
                    .collect();
                engine.bulk_update_cart(user_id, updates).await.map(data)
            }
            Request::GetCart { user_id } => engine.get_cart(user_id).await.map(data),
            Request::Checkout { user_id } => engine.checkout(user_id).await.map(data),
            Request::Confirm {
                user_id,
                reservation_ids,
            } => engine.confirm(user_id, &reservation_ids).await.map(data),
            Request::Cancel {
                user_id,
                reservation_ids,
            } => engine.cancel(user_id, &reservation_ids).await.map(data),
            Request::Sweep => Ok(data(engine.sweep().await)),
            Request::UserReservations { user_id } => {
                engine.reservations_for_user(user_id).await.map(data)
            }
            Request::ProductReservations { product_id } => {
                engine.reservations_for_product(product_id).await.map(data)
            }
            Request::Listen { product_id } => {
                if !self.listens.contains_key(&product_id) {
                    if self.listens.len() >= MAX_LISTENS_PER_CONNECTION {
                        return Err(EngineError::LimitExceeded("too many listens"));
                    }
                    let rx = engine.notify.subscribe(product_id);
                    let task = tokio::spawn(forward(product_id, rx, self.outbox.clone()));
                    self.listens.insert(product_id, task);
                }
                Ok(json!({ "listening": product_id }))
            }
            Request::Unlisten { product_id } => {
                let was_listening = match self.listens.remove(&product_id) {
                    Some(task) => {
                        task.abort();
                        true
                    }
                    None => false,
                };
                Ok(json!({ "product_id": product_id, "was_listening": was_listening }))
            }
            Request::UnlistenAll => {
                let count = self.listens.len();
                for (_, task) in self.listens.drain() {
                    task.abort();
                }
                Ok(json!({ "unlistened": count }))
            }
        }
    }
}

/// Relay one product's events into the connection's outbox.
async fn forward(
    product_id: Ulid,
    mut rx: broadcast::Receiver<Event>,
    outbox: mpsc::Sender<String>,
) {
    loop {
        let line = match rx.recv().await {
            Ok(event) => protocol::notification(product_id, &event),
            Err(RecvError::Lagged(missed)) => {
                warn!("listener on {product_id} lagged, {missed} notifications dropped");
                protocol::lagged(product_id, missed)
            }
            Err(RecvError::Closed) => break,
        };
        if outbox.send(line).await.is_err() {
            break;
        }
    }
}
